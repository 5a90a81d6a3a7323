#![cfg_attr(not(test), no_std)]

pub mod wiring;

#[cfg(feature = "spi-rt2880")]
pub mod arbiter;
#[cfg(feature = "spi-rt2880")]
pub mod attach;
#[cfg(feature = "spi-rt2880")]
pub mod rt2880_spi;

#[cfg(feature = "fb-ili9488")]
pub mod display;
#[cfg(feature = "fb-ili9488")]
pub mod ili9488;
