// Ralink RT288x/RT305x SPI controller driver (polled, half duplex).
//
// Register window (per bus):
//   0x00 STAT  bit0 = busy
//   0x10 CFG   clock polarity/edges, bit order, 3-bit prescaler
//   0x14 CTL   start write/read strobes, chip-select enable
//   0x20 DATA  one byte, shared by both directions
//   0xF0 ARB   chip-select polarity of both buses (see `arbiter`)
//
// Every byte is moved by hand: write DATA, strobe CTL, spin on STAT.
// The spin is bounded by a loop budget derived from the bus clock.

use core::convert::Infallible;
use core::fmt;

use bitflags::bitflags;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{self, OutputPin, PinState};
use embedded_hal::spi::{
    self, ErrorKind, ErrorType, Mode, Operation, Phase, Polarity, SpiDevice, MODE_0, MODE_3,
};
use embedded_hal_bus::spi::NoDelay;
use log::{debug, error, log_enabled, warn, Level};

use crate::arbiter::{BusId, SpiArbiter};
use crate::attach::AttachRegistry;
use crate::wiring::{ClockSource, RegisterIo, ResetControl};

pub const SPI_STAT: usize = 0x00;
pub const SPI_CFG: usize = 0x10;
pub const SPI_CTL: usize = 0x14;
pub const SPI_DATA: usize = 0x20;
pub const SPI_ADDR: usize = 0x24;
pub const SPI_BS: usize = 0x28;
pub const SPI_USER: usize = 0x2C;
pub const SPI_TXFIFO: usize = 0x30;
pub const SPI_RXFIFO: usize = 0x34;
pub const SPI_FIFO_STAT: usize = 0x38;
pub const SPI_MODE: usize = 0x3C;
pub const SPI_DMA: usize = 0x80;
pub const SPI_DMASTAT: usize = 0x84;

/// Busy-loop iterations per second assumed when none is configured.
pub const DEFAULT_LOOPS_PER_SEC: u32 = 128_000_000;

/// Only 8-bit words are wired up in the controller.
pub const BITS_PER_WORD_MASK: u32 = 1 << (8 - 1);

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Stat: u32 {
        const BUSY = 1 << 0;
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Cfg: u32 {
        const ADDRMODE          = 1 << 12;
        const RXENVDIS          = 1 << 11;
        const RXCAP             = 1 << 10;
        const SPIENMODE         = 1 << 9;
        const MSBFIRST          = 1 << 8;
        const SPICLKPOL         = 1 << 6;
        const RXCLKEDGE_FALLING = 1 << 5;
        const TXCLKEDGE_FALLING = 1 << 4;
        const HIZSPI            = 1 << 3;
        const PRESCALE          = 0x7;
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Ctl: u32 {
        const START   = 1 << 4;
        const HIZSDO  = 1 << 3;
        const STARTWR = 1 << 2;
        const STARTRD = 1 << 1;
        const SPIENA  = 1 << 0;
    }
}

/// Clock prescaler field of CFG. The value 7 (clock off) is never programmed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Prescaler {
    Div2 = 0,
    Div4 = 1,
    Div8 = 2,
    Div16 = 3,
    Div32 = 4,
    Div64 = 5,
    Div128 = 6,
}

impl Prescaler {
    const ALL: [Prescaler; 7] = [
        Prescaler::Div2,
        Prescaler::Div4,
        Prescaler::Div8,
        Prescaler::Div16,
        Prescaler::Div32,
        Prescaler::Div64,
        Prescaler::Div128,
    ];

    /// Fastest divisor whose output does not exceed `speed_hz`.
    ///
    /// Requests above `ref_hz / 2` get /2, requests below `ref_hz / 128`
    /// get /128.
    pub fn for_speed(ref_hz: u32, speed_hz: u32) -> Self {
        let rate = ref_hz
            .div_ceil(speed_hz.max(1))
            .min(128)
            .next_power_of_two()
            .max(2);
        Self::ALL[(rate.trailing_zeros() - 1) as usize]
    }

    #[inline]
    pub const fn divisor(self) -> u32 {
        2 << (self as u32)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self as u32
    }
}

/// Busy-wait budget for one byte at `achieved_hz`, doubled plus slack.
pub fn wait_loops_for(loops_per_sec: u32, achieved_hz: u32) -> u32 {
    let loops = 8 * loops_per_sec as u64 / achieved_hz.max(1) as u64;
    loops.saturating_mul(2).saturating_add(100).min(u32::MAX as u64) as u32
}

/// CFG clock bits for each SPI mode.
pub fn mode_bits(mode: Mode) -> Cfg {
    match (mode.polarity, mode.phase) {
        (Polarity::IdleLow, Phase::CaptureOnFirstTransition) => Cfg::TXCLKEDGE_FALLING,
        (Polarity::IdleLow, Phase::CaptureOnSecondTransition) => Cfg::RXCLKEDGE_FALLING,
        (Polarity::IdleHigh, Phase::CaptureOnFirstTransition) => {
            Cfg::SPICLKPOL | Cfg::RXCLKEDGE_FALLING
        }
        (Polarity::IdleHigh, Phase::CaptureOnSecondTransition) => {
            Cfg::SPICLKPOL | Cfg::TXCLKEDGE_FALLING
        }
    }
}

#[inline]
fn word_size_supported(bits_per_word: u8) -> bool {
    (1..=32).contains(&bits_per_word) && BITS_PER_WORD_MASK & (1 << (bits_per_word - 1)) != 0
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpiError {
    /// Speed outside what the prescaler can reach.
    InvalidSpeed(u32),
    InvalidWordSize(u8),
    /// Reference clock too slow to divide.
    InvalidClock(u32),
    LengthMismatch { tx: usize, rx: usize },
    /// Transfer attempted before any device was set up.
    NotConfigured,
    /// Simultaneous read/write requested; the controller cannot do it.
    HalfDuplex,
    /// Busy flag did not clear within the loop budget.
    Timeout,
    /// GPIO chip-select line refused the level.
    ChipSelect,
    /// `DelayNs` operation on a device without a delay provider.
    NoDelay,
}

impl SpiError {
    /// Rejected up front, before any register was touched.
    pub fn is_config(&self) -> bool {
        !matches!(self, SpiError::Timeout | SpiError::ChipSelect)
    }
}

impl fmt::Display for SpiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpiError::InvalidSpeed(hz) => write!(f, "invalid requested speed {} Hz", hz),
            SpiError::InvalidWordSize(bits) => write!(f, "invalid bits_per_word {}", bits),
            SpiError::InvalidClock(hz) => write!(f, "unusable reference clock {} Hz", hz),
            SpiError::LengthMismatch { tx, rx } => {
                write!(f, "tx length {} differs from rx length {}", tx, rx)
            }
            SpiError::NotConfigured => f.write_str("no device set up"),
            SpiError::HalfDuplex => f.write_str("full duplex transfer on half duplex bus"),
            SpiError::Timeout => f.write_str("timed out waiting for bus"),
            SpiError::ChipSelect => f.write_str("chip select line error"),
            SpiError::NoDelay => f.write_str("delay operation without delay provider"),
        }
    }
}

impl spi::Error for SpiError {
    fn kind(&self) -> ErrorKind {
        match self {
            SpiError::ChipSelect => ErrorKind::ChipSelectFault,
            SpiError::InvalidWordSize(_) => ErrorKind::FrameFormat,
            _ => ErrorKind::Other,
        }
    }
}

/// Per-device settings, checked by [`Rt2880Spi::setup`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    pub max_speed_hz: u32,
    pub bits_per_word: u8,
    pub mode: Mode,
    /// Chip select is active high.
    pub cs_high: bool,
    pub lsb_first: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            max_speed_hz: 10_000_000,
            bits_per_word: 8,
            mode: MODE_3,
            cs_high: false,
            lsb_first: false,
        }
    }
}

/// Controller instance settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    pub bus: BusId,
    /// Calibrated busy-loop iterations per second, used to size poll budgets.
    pub loops_per_sec: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self { bus: BusId::Spi0, loops_per_sec: DEFAULT_LOOPS_PER_SEC }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusState {
    Uninitialized,
    Configured,
    Idle,
    Transferring,
}

// Mode flags last written to CFG.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ModeFlags {
    mode: Mode,
    cs_high: bool,
    lsb_first: bool,
}

impl From<&DeviceConfig> for ModeFlags {
    fn from(dev: &DeviceConfig) -> Self {
        Self { mode: dev.mode, cs_high: dev.cs_high, lsb_first: dev.lsb_first }
    }
}

/// One half-duplex transfer. With both buffers present the write phase
/// completes before the read phase starts.
pub struct Transfer<'t> {
    pub tx: Option<&'t [u8]>,
    pub rx: Option<&'t mut [u8]>,
    /// Bus speed for this transfer; `None` keeps the current one.
    pub speed_hz: Option<u32>,
}

impl<'t> Transfer<'t> {
    pub fn write(tx: &'t [u8]) -> Self {
        Self { tx: Some(tx), rx: None, speed_hz: None }
    }

    pub fn read(rx: &'t mut [u8]) -> Self {
        Self { tx: None, rx: Some(rx), speed_hz: None }
    }

    pub fn write_read(tx: &'t [u8], rx: &'t mut [u8]) -> Self {
        Self { tx: Some(tx), rx: Some(rx), speed_hz: None }
    }

    pub fn with_speed(mut self, hz: u32) -> Self {
        self.speed_hz = Some(hz);
        self
    }
}

/// Chip-select placeholder for devices driven by the controller's own line.
pub struct NoCs;

impl digital::ErrorType for NoCs {
    type Error = Infallible;
}

impl OutputPin for NoCs {
    fn set_low(&mut self) -> Result<(), Infallible> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

pub struct Rt2880Spi<'a, R, C, A> {
    regs: R,
    clk: C,
    arbiter: &'a SpiArbiter<A>,
    registry: &'a AttachRegistry,
    bus: BusId,
    ref_hz: u32,
    loops_per_sec: u32,
    speed_hz: Option<u32>,
    flags: Option<ModeFlags>,
    wait_loops: u32,
    state: BusState,
}

impl<'a, R, C, A> Rt2880Spi<'a, R, C, A>
where
    R: RegisterIo,
    C: ClockSource,
    A: RegisterIo,
{
    /// Bring up one controller instance.
    ///
    /// Enables the clock and, if this is the first instance in `registry`,
    /// pulses `reset`. A clock slower than 2 Hz cannot feed the prescaler and
    /// is rejected with the clock switched back off.
    pub fn attach(
        regs: R,
        mut clk: C,
        arbiter: &'a SpiArbiter<A>,
        registry: &'a AttachRegistry,
        reset: &mut impl ResetControl,
        config: Config,
    ) -> Result<Self, SpiError> {
        clk.enable();
        let ref_hz = clk.rate_hz();
        if ref_hz < 2 {
            error!("{}: unable to use SYS clock ({} Hz)", config.bus, ref_hz);
            clk.disable();
            return Err(SpiError::InvalidClock(ref_hz));
        }

        if registry.attach() {
            debug!("{}: first controller, resetting block", config.bus);
            reset.pulse();
        }

        debug!(
            "{}: attached, clock {} Hz, speed range {}..={} Hz",
            config.bus,
            ref_hz,
            ref_hz / 128,
            ref_hz / 2
        );

        Ok(Self {
            regs,
            clk,
            arbiter,
            registry,
            bus: config.bus,
            ref_hz,
            loops_per_sec: config.loops_per_sec,
            speed_hz: None,
            flags: None,
            wait_loops: 0,
            state: BusState::Uninitialized,
        })
    }

    /// Tear down: clock off, instance released. Returns the register window
    /// and clock.
    pub fn detach(mut self) -> (R, C) {
        self.clk.disable();
        self.registry.detach();
        debug!("{}: detached", self.bus);
        (self.regs, self.clk)
    }

    #[inline]
    pub fn bus(&self) -> BusId {
        self.bus
    }

    #[inline]
    pub fn state(&self) -> BusState {
        self.state
    }

    #[inline]
    pub fn ref_hz(&self) -> u32 {
        self.ref_hz
    }

    #[inline]
    pub fn min_speed_hz(&self) -> u32 {
        self.ref_hz / 128
    }

    #[inline]
    pub fn max_speed_hz(&self) -> u32 {
        self.ref_hz / 2
    }

    /// Speed the prescaler was last computed for.
    #[inline]
    pub fn speed_hz(&self) -> Option<u32> {
        self.speed_hz
    }

    #[inline]
    pub fn wait_loops(&self) -> u32 {
        self.wait_loops
    }

    // Pick the prescaler for `speed_hz` and resize the poll budget.
    fn baudrate(&mut self, speed_hz: u32) -> Prescaler {
        let prescale = Prescaler::for_speed(self.ref_hz, speed_hz);
        let achieved = self.ref_hz / prescale.divisor();
        self.wait_loops = wait_loops_for(self.loops_per_sec, achieved);
        self.speed_hz = Some(speed_hz);

        debug!(
            "{}: speed: {}/{}, rate: {}, prescale: {}, loops: {}",
            self.bus,
            achieved,
            speed_hz,
            prescale.divisor(),
            prescale.bits(),
            self.wait_loops
        );

        prescale
    }

    /// Validate a device, program its chip-select polarity and load its mode
    /// and clock into CFG.
    ///
    /// Mode 0 is rewritten to mode 3 in `dev`: the controller does not work
    /// with an idle-low clock sampling on the first edge.
    pub fn setup<P: OutputPin>(
        &mut self,
        dev: &mut DeviceConfig,
        cs: Option<&mut P>,
    ) -> Result<(), SpiError> {
        if dev.max_speed_hz > self.max_speed_hz() || dev.max_speed_hz < self.min_speed_hz() {
            error!("{}: invalid requested speed {} Hz", self.bus, dev.max_speed_hz);
            return Err(SpiError::InvalidSpeed(dev.max_speed_hz));
        }

        if !word_size_supported(dev.bits_per_word) {
            error!("{}: invalid bits_per_word {}", self.bus, dev.bits_per_word);
            return Err(SpiError::InvalidWordSize(dev.bits_per_word));
        }

        if dev.mode == MODE_0 {
            warn!("{}: force spi mode3", self.bus);
            dev.mode = MODE_3;
        }

        self.arbiter.set_polarity(self.bus, dev.cs_high);
        if self.bus == BusId::Spi1 {
            self.arbiter.enable();
        }
        self.prepare_message(dev);
        self.state = BusState::Configured;

        self.set_cs(dev, cs, false)?;
        self.state = BusState::Idle;

        self.dump_regs();
        Ok(())
    }

    /// Write mode, bit order and clock for `dev` into CFG, unless they are
    /// already there.
    pub fn prepare_message(&mut self, dev: &DeviceConfig) {
        let flags = ModeFlags::from(dev);
        if self.flags == Some(flags) && self.speed_hz == Some(dev.max_speed_hz) {
            return;
        }

        let mut cfg = Cfg::from_bits_retain(self.regs.read32(SPI_CFG));
        cfg.remove(
            Cfg::MSBFIRST
                | Cfg::SPICLKPOL
                | Cfg::RXCLKEDGE_FALLING
                | Cfg::TXCLKEDGE_FALLING
                | Cfg::PRESCALE,
        );

        if !dev.lsb_first {
            cfg.insert(Cfg::MSBFIRST);
        }
        cfg.insert(mode_bits(dev.mode));
        self.flags = Some(flags);

        let prescale = self.baudrate(dev.max_speed_hz);
        self.regs.write32(SPI_CFG, cfg.bits() | prescale.bits());
    }

    /// Drive chip select. A GPIO line wins over the controller's own enable.
    pub fn set_cs<P: OutputPin>(
        &mut self,
        dev: &DeviceConfig,
        gpio: Option<&mut P>,
        select: bool,
    ) -> Result<(), SpiError> {
        match gpio {
            Some(pin) => pin
                .set_state(PinState::from(select == dev.cs_high))
                .map_err(|_| SpiError::ChipSelect),
            None if select => {
                self.regs.set_bits(SPI_CTL, Ctl::SPIENA.bits());
                Ok(())
            }
            None => {
                self.regs.clear_bits(SPI_CTL, Ctl::SPIENA.bits());
                Ok(())
            }
        }
    }

    /// Move one transfer over the bus.
    ///
    /// The whole transfer shares a budget of `wait_loops * len` status polls.
    /// Running out aborts the remaining bytes with [`SpiError::Timeout`].
    pub fn transfer_one(&mut self, xfer: Transfer<'_>) -> Result<(), SpiError> {
        if self.state == BusState::Uninitialized {
            return Err(SpiError::NotConfigured);
        }

        let len = match (&xfer.tx, &xfer.rx) {
            (Some(tx), Some(rx)) if tx.len() != rx.len() => {
                return Err(SpiError::LengthMismatch { tx: tx.len(), rx: rx.len() });
            }
            (Some(tx), _) => tx.len(),
            (None, Some(rx)) => rx.len(),
            (None, None) => 0,
        };
        if len == 0 {
            return Ok(());
        }

        if let Some(hz) = xfer.speed_hz {
            if hz == 0 || hz < self.min_speed_hz() {
                error!("{}: invalid transfer speed {} Hz", self.bus, hz);
                return Err(SpiError::InvalidSpeed(hz));
            }
            if self.speed_hz != Some(hz) {
                let prescale = self.baudrate(hz);
                let cfg = self.regs.read32(SPI_CFG) & !Cfg::PRESCALE.bits();
                self.regs.write32(SPI_CFG, cfg | prescale.bits());
            }
        }

        self.state = BusState::Transferring;
        let mut budget = self.wait_loops as u64 * len as u64;
        let result = self.move_bytes(xfer.tx, xfer.rx, &mut budget);
        self.state = BusState::Idle;
        result
    }

    fn move_bytes(
        &mut self,
        tx: Option<&[u8]>,
        rx: Option<&mut [u8]>,
        budget: &mut u64,
    ) -> Result<(), SpiError> {
        if let Some(tx) = tx {
            for &byte in tx {
                self.regs.write32(SPI_DATA, byte as u32);
                self.regs.set_bits(SPI_CTL, Ctl::STARTWR.bits());
                if let Err(e) = self.wait_ready(budget) {
                    error!("{}: TX failed, err={}", self.bus, e);
                    return Err(e);
                }
            }
        }

        if let Some(rx) = rx {
            for slot in rx.iter_mut() {
                self.regs.set_bits(SPI_CTL, Ctl::STARTRD.bits());
                if let Err(e) = self.wait_ready(budget) {
                    error!("{}: RX failed, err={}", self.bus, e);
                    return Err(e);
                }
                *slot = self.regs.read32(SPI_DATA) as u8;
            }
        }

        Ok(())
    }

    // One status read per iteration until busy clears or the budget is gone.
    fn wait_ready(&mut self, budget: &mut u64) -> Result<(), SpiError> {
        while *budget > 0 {
            *budget -= 1;
            if !Stat::from_bits_retain(self.regs.read32(SPI_STAT)).contains(Stat::BUSY) {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(SpiError::Timeout)
    }

    fn dump_regs(&mut self) {
        if !log_enabled!(Level::Debug) {
            return;
        }
        debug!(
            "{}: stat: {:08x}, cfg: {:08x}, ctl: {:08x}, data: {:08x}, arb: {:08x}",
            self.bus,
            self.regs.read32(SPI_STAT),
            self.regs.read32(SPI_CFG),
            self.regs.read32(SPI_CTL),
            self.regs.read32(SPI_DATA),
            self.arbiter.read()
        );
    }

    /// Set up `config` and hand out an `embedded-hal` device bound to it.
    pub fn device<CS: OutputPin>(
        &mut self,
        mut config: DeviceConfig,
        mut cs: Option<CS>,
    ) -> Result<Rt2880Device<'_, 'a, R, C, A, CS>, SpiError> {
        self.setup(&mut config, cs.as_mut())?;
        Ok(Rt2880Device { bus: self, config, cs, delay: None })
    }
}

/// A device on an [`Rt2880Spi`] bus.
///
/// Implements [`SpiDevice`]; `Transfer` and `TransferInPlace` operations are
/// refused since reads and writes cannot overlap on this controller.
/// `DelayNs` operations need a provider from [`Rt2880Device::with_delay`],
/// otherwise the transaction fails with [`SpiError::NoDelay`].
pub struct Rt2880Device<'e, 'a, R, C, A, CS = NoCs, D = NoDelay> {
    bus: &'e mut Rt2880Spi<'a, R, C, A>,
    config: DeviceConfig,
    cs: Option<CS>,
    delay: Option<D>,
}

impl<'e, 'a, R, C, A, CS, D> Rt2880Device<'e, 'a, R, C, A, CS, D> {
    /// Use `delay` for `Operation::DelayNs`.
    pub fn with_delay<D2: DelayNs>(self, delay: D2) -> Rt2880Device<'e, 'a, R, C, A, CS, D2> {
        Rt2880Device { bus: self.bus, config: self.config, cs: self.cs, delay: Some(delay) }
    }

    /// Settings after setup (mode 0 already rewritten).
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn release(self) -> Option<CS> {
        self.cs
    }
}

impl<R, C, A, CS, D> ErrorType for Rt2880Device<'_, '_, R, C, A, CS, D> {
    type Error = SpiError;
}

impl<R, C, A, CS, D> SpiDevice<u8> for Rt2880Device<'_, '_, R, C, A, CS, D>
where
    R: RegisterIo,
    C: ClockSource,
    A: RegisterIo,
    CS: OutputPin,
    D: DelayNs,
{
    fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), SpiError> {
        if self.delay.is_none() && operations.iter().any(|op| matches!(op, Operation::DelayNs(_))) {
            return Err(SpiError::NoDelay);
        }

        self.bus.prepare_message(&self.config);
        self.bus.set_cs(&self.config, self.cs.as_mut(), true)?;

        let speed_hz = Some(self.config.max_speed_hz);
        let result = operations.iter_mut().try_for_each(|op| match op {
            Operation::Write(buf) => {
                self.bus.transfer_one(Transfer { tx: Some(*buf), rx: None, speed_hz })
            }
            Operation::Read(buf) => {
                self.bus.transfer_one(Transfer { tx: None, rx: Some(&mut **buf), speed_hz })
            }
            Operation::DelayNs(ns) => match self.delay.as_mut() {
                Some(delay) => {
                    delay.delay_ns(*ns);
                    Ok(())
                }
                None => Err(SpiError::NoDelay),
            },
            Operation::Transfer(..) | Operation::TransferInPlace(..) => Err(SpiError::HalfDuplex),
        });

        let deselect = self.bus.set_cs(&self.config, self.cs.as_mut(), false);
        result.and(deselect)
    }
}
