//! Shared chip-select arbiter of the two RT2880 SPI blocks.
//!
//! The arbiter is a single register reachable from both bus windows (bus 1's
//! window starts 0x40 after bus 0's, so the same word sits at 0xF0 from bus 0
//! and at 0xB0 from bus 1). Each bus owns one polarity bit; bus 1 also needs
//! the global enable bit. The register is owned here and every
//! read-modify-write runs inside a critical section.

use core::cell::RefCell;
use critical_section::Mutex;

use crate::wiring::RegisterIo;

pub const ARBITER_OFFSET: usize = 0xF0;
pub const DEV_OFFSET: usize = 0x40;

pub const ARB_EN: u32 = 1 << 31;
pub const CSCTL1: u32 = 1 << 16;
pub const SPI1_POR: u32 = 1 << 1;
pub const SPI0_POR: u32 = 1 << 0;

/// Physical bus instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusId {
    Spi0,
    Spi1,
}

impl BusId {
    /// Polarity bit owned by this bus.
    #[inline]
    pub const fn por_bit(self) -> u32 {
        match self {
            BusId::Spi0 => SPI0_POR,
            BusId::Spi1 => SPI1_POR,
        }
    }

    /// Arbiter offset as seen from this bus's own register window.
    #[inline]
    pub const fn arbiter_offset(self) -> usize {
        match self {
            BusId::Spi0 => ARBITER_OFFSET,
            BusId::Spi1 => ARBITER_OFFSET - DEV_OFFSET,
        }
    }
}

impl core::fmt::Display for BusId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BusId::Spi0 => f.write_str("spi0"),
            BusId::Spi1 => f.write_str("spi1"),
        }
    }
}

pub struct SpiArbiter<A> {
    regs: Mutex<RefCell<A>>,
    offset: usize,
}

impl<A: RegisterIo> SpiArbiter<A> {
    /// `regs` is the register window of bus `via`; the arbiter word is found
    /// at that bus's alias.
    pub const fn new(regs: A, via: BusId) -> Self {
        Self {
            regs: Mutex::new(RefCell::new(regs)),
            offset: via.arbiter_offset(),
        }
    }

    /// Current register value.
    pub fn read(&self) -> u32 {
        critical_section::with(|cs| self.regs.borrow_ref_mut(cs).read32(self.offset))
    }

    /// Set or clear the chip-select polarity bit of `bus`. The other bus's
    /// bits are left untouched.
    pub fn set_polarity(&self, bus: BusId, cs_high: bool) {
        self.update(|reg| {
            if cs_high {
                reg | bus.por_bit()
            } else {
                reg & !bus.por_bit()
            }
        });
    }

    /// Set the global enable bit. Needed once bus 1 is in use.
    pub fn enable(&self) {
        self.update(|reg| reg | ARB_EN);
    }

    // Writes only when the value changes.
    fn update(&self, f: impl FnOnce(u32) -> u32) {
        critical_section::with(|cs| {
            let mut regs = self.regs.borrow_ref_mut(cs);
            let old = regs.read32(self.offset);
            let new = f(old);
            if new != old {
                regs.write32(self.offset, new);
            }
        });
    }

    pub fn into_inner(self) -> A {
        self.regs.into_inner().into_inner()
    }
}
