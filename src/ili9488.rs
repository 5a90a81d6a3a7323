// ILI9488 panel driver, fbtft style (24bpp, 8-bit bus).
//
// Protocol:
//   Register writes send the command byte with D/C low, then the parameters
//   with D/C high. Buses without a D/C line prefix each transfer with a
//   start byte instead: `start_byte` before a command, `start_byte | 0x02`
//   before data.
//   Pixels go out after 0x2A/0x2B (column/row window) and 0x2C (memory write).
// Geometry: 320 x 480 native, 3 bytes per pixel in memory order [b, g, r].

use core::fmt;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{self, OutputPin};
use embedded_hal::spi::SpiDevice;
use heapless::Vec;
use log::{debug, warn};

pub const ILI9488_WIDTH: u16 = 320;
pub const ILI9488_HEIGHT: u16 = 480;
pub const BYTES_PER_PIXEL: usize = 3;

/// Default staging buffer size (four 4 KiB pages).
pub const TXBUF_LEN: usize = 4 * 4096;
/// Smallest staging buffer: one 4-pixel copy group.
pub const MIN_TXBUF_LEN: usize = 4 * BYTES_PER_PIXEL;
/// Parameters per register write.
pub const MAX_PARAMS: usize = 64;

pub const CMD_SLPOUT: u8 = 0x11;
pub const CMD_DISPON: u8 = 0x29;
pub const CMD_CASET: u8 = 0x2A;
pub const CMD_PASET: u8 = 0x2B;
pub const CMD_RAMWR: u8 = 0x2C;
pub const CMD_MADCTL: u8 = 0x36;
pub const CMD_COLMOD: u8 = 0x3A;
pub const CMD_IFMODE: u8 = 0xB0;
pub const CMD_PWCTRL3: u8 = 0xC2;
pub const CMD_VMCTRL: u8 = 0xC5;

// MADCTL bits
pub const MADCTL_MY: u8 = 1 << 7;
pub const MADCTL_MX: u8 = 1 << 6;
pub const MADCTL_MV: u8 = 1 << 5;
pub const MADCTL_ML: u8 = 1 << 4;
pub const MADCTL_BGR: u8 = 1 << 3;
pub const MADCTL_MH: u8 = 1 << 2;

/// Marker OR'd into the start byte ahead of data transfers.
pub const START_BYTE_DATA: u8 = 0x02;

/// Position of one colour channel inside a 24-bit pixel value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bitfield {
    pub offset: u32,
    pub length: u32,
}

pub const RED: Bitfield = Bitfield { offset: 16, length: 8 };
pub const GREEN: Bitfield = Bitfield { offset: 8, length: 8 };
pub const BLUE: Bitfield = Bitfield { offset: 0, length: 8 };

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitStep {
    Cmd(u8, &'static [u8]),
    DelayMs(u32),
}

/// Vendor bring-up sequence.
pub const INIT_SEQUENCE: &[InitStep] = &[
    // Interface Mode Control
    InitStep::Cmd(CMD_IFMODE, &[0x00]),
    InitStep::Cmd(CMD_SLPOUT, &[]),
    InitStep::DelayMs(250),
    // Interface Pixel Format, 18 bits
    InitStep::Cmd(CMD_COLMOD, &[0x66]),
    // Power Control 3
    InitStep::Cmd(CMD_PWCTRL3, &[0x44]),
    // VCOM Control 1
    InitStep::Cmd(CMD_VMCTRL, &[0x00, 0x00, 0x00, 0x00]),
    InitStep::Cmd(CMD_SLPOUT, &[]),
    InitStep::Cmd(CMD_DISPON, &[]),
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub const fn degrees(self) -> u16 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// 90 and 270 exchange rows and columns.
    pub const fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }
}

impl TryFrom<u16> for Rotation {
    type Error = u16;

    fn try_from(degrees: u16) -> Result<Self, u16> {
        match degrees {
            0 => Ok(Rotation::Deg0),
            90 => Ok(Rotation::Deg90),
            180 => Ok(Rotation::Deg180),
            270 => Ok(Rotation::Deg270),
            other => Err(other),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColorOrder {
    #[default]
    Rgb,
    Bgr,
}

/// Memory access control value for a rotation and colour order.
pub const fn madctl(rotation: Rotation, order: ColorOrder) -> u8 {
    let bits = match rotation {
        Rotation::Deg0 => MADCTL_MX,
        Rotation::Deg90 => MADCTL_MY | MADCTL_MX | MADCTL_MV,
        Rotation::Deg180 => MADCTL_MY,
        Rotation::Deg270 => MADCTL_MV | MADCTL_ML,
    };
    match order {
        ColorOrder::Rgb => bits,
        ColorOrder::Bgr => bits | MADCTL_BGR,
    }
}

/// Pixel capacity of a staging buffer of `len` bytes.
pub const fn staging_capacity(len: usize, start_byte: bool) -> usize {
    let pixels = len / BYTES_PER_PIXEL / 4 * 4;
    if start_byte {
        pixels.saturating_sub(1)
    } else {
        pixels
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PanelConfig {
    /// Native width in pixels (before rotation).
    pub width: u16,
    /// Native height in pixels (before rotation).
    pub height: u16,
    pub rotation: Rotation,
    pub color_order: ColorOrder,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            width: ILI9488_WIDTH,
            height: ILI9488_HEIGHT,
            rotation: Rotation::Deg0,
            color_order: ColorOrder::Rgb,
        }
    }
}

/// Byte transport to the panel controller.
pub trait PanelBus {
    type Error;

    /// Command byte in command mode, then `params` in data mode.
    fn write_reg(&mut self, cmd: u8, params: &[u8]) -> Result<(), Self::Error>;

    /// Switch the bus to data mode.
    fn begin_data(&mut self) -> Result<(), Self::Error>;

    /// Raw bytes, sent as they are.
    fn write(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Framing byte reserved ahead of every transfer, if the bus uses one.
    fn start_byte(&self) -> Option<u8>;
}

impl<T: PanelBus + ?Sized> PanelBus for &mut T {
    type Error = T::Error;

    fn write_reg(&mut self, cmd: u8, params: &[u8]) -> Result<(), T::Error> {
        (**self).write_reg(cmd, params)
    }

    fn begin_data(&mut self) -> Result<(), T::Error> {
        (**self).begin_data()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), T::Error> {
        (**self).write(bytes)
    }

    fn start_byte(&self) -> Option<u8> {
        (**self).start_byte()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PanelBusError<SpiE, PinE> {
    Spi(SpiE),
    Dc(PinE),
    TooManyParams,
}

impl<SpiE: fmt::Debug, PinE: fmt::Debug> fmt::Display for PanelBusError<SpiE, PinE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PanelBusError::Spi(e) => write!(f, "spi write failed: {:?}", e),
            PanelBusError::Dc(e) => write!(f, "d/c line failed: {:?}", e),
            PanelBusError::TooManyParams => write!(f, "more than {} parameters", MAX_PARAMS),
        }
    }
}

/// No D/C line or no reset line.
pub struct NoPin;

impl digital::ErrorType for NoPin {
    type Error = core::convert::Infallible;
}

impl OutputPin for NoPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// [`PanelBus`] over an `embedded-hal` SPI device and an optional D/C pin.
pub struct SpiPanelBus<SPI, DC> {
    spi: SPI,
    dc: Option<DC>,
    start_byte: Option<u8>,
}

impl<SPI, DC> SpiPanelBus<SPI, DC>
where
    SPI: SpiDevice<u8>,
    DC: OutputPin,
{
    pub fn new(spi: SPI, dc: Option<DC>, start_byte: Option<u8>) -> Self {
        Self { spi, dc, start_byte }
    }

    pub fn release(self) -> (SPI, Option<DC>) {
        (self.spi, self.dc)
    }

    fn set_dc(&mut self, data: bool) -> Result<(), PanelBusError<SPI::Error, DC::Error>> {
        match self.dc.as_mut() {
            Some(dc) if data => dc.set_high().map_err(PanelBusError::Dc),
            Some(dc) => dc.set_low().map_err(PanelBusError::Dc),
            None => Ok(()),
        }
    }
}

impl<SPI, DC> PanelBus for SpiPanelBus<SPI, DC>
where
    SPI: SpiDevice<u8>,
    DC: OutputPin,
{
    type Error = PanelBusError<SPI::Error, DC::Error>;

    fn write_reg(&mut self, cmd: u8, params: &[u8]) -> Result<(), Self::Error> {
        if params.len() > MAX_PARAMS {
            return Err(PanelBusError::TooManyParams);
        }

        let mut frame: Vec<u8, { MAX_PARAMS + 1 }> = Vec::new();
        if let Some(sb) = self.start_byte {
            frame.push(sb).map_err(|_| PanelBusError::TooManyParams)?;
        }
        frame.push(cmd).map_err(|_| PanelBusError::TooManyParams)?;

        self.set_dc(false)?;
        self.spi.write(&frame).map_err(PanelBusError::Spi)?;

        if params.is_empty() {
            return Ok(());
        }

        frame.clear();
        if let Some(sb) = self.start_byte {
            frame.push(sb | START_BYTE_DATA).map_err(|_| PanelBusError::TooManyParams)?;
        }
        frame.extend_from_slice(params).map_err(|_| PanelBusError::TooManyParams)?;

        self.set_dc(true)?;
        self.spi.write(&frame).map_err(PanelBusError::Spi)
    }

    fn begin_data(&mut self) -> Result<(), Self::Error> {
        self.set_dc(true)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        self.spi.write(bytes).map_err(PanelBusError::Spi)
    }

    fn start_byte(&self) -> Option<u8> {
        self.start_byte
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PanelError<BusE, PinE> {
    Bus(BusE),
    Reset(PinE),
    InvalidRotation(u16),
    /// Pixel data length not a multiple of 3 bytes.
    Misaligned(usize),
    StagingTooSmall(usize),
    OutOfBounds,
}

impl<BusE: fmt::Debug, PinE: fmt::Debug> fmt::Display for PanelError<BusE, PinE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PanelError::Bus(e) => write!(f, "bus error: {:?}", e),
            PanelError::Reset(e) => write!(f, "reset line error: {:?}", e),
            PanelError::InvalidRotation(deg) => write!(f, "unsupported rotation {}", deg),
            PanelError::Misaligned(len) => write!(f, "{} bytes is not whole pixels", len),
            PanelError::StagingTooSmall(len) => {
                write!(f, "staging buffer of {} bytes, need {}", len, MIN_TXBUF_LEN)
            }
            PanelError::OutOfBounds => f.write_str("range outside framebuffer"),
        }
    }
}

/// ILI9488 panel with an optional staging buffer for pixel writes.
pub struct Ili9488<'buf, BUS, RST> {
    bus: BUS,
    rst: Option<RST>,
    config: PanelConfig,
    txbuf: Option<&'buf mut [u8]>,
}

impl<'buf, BUS, RST> Ili9488<'buf, BUS, RST>
where
    BUS: PanelBus,
    RST: OutputPin,
{
    /// Wrap a bus. Does not talk to the panel; call [`Ili9488::init`].
    ///
    /// Without `txbuf` pixel data is handed to the bus in one write.
    pub fn new(
        bus: BUS,
        rst: Option<RST>,
        config: PanelConfig,
        txbuf: Option<&'buf mut [u8]>,
    ) -> Result<Self, PanelError<BUS::Error, RST::Error>> {
        if let Some(buf) = txbuf.as_deref() {
            if buf.len() < MIN_TXBUF_LEN {
                return Err(PanelError::StagingTooSmall(buf.len()));
            }
        }
        Ok(Self { bus, rst, config, txbuf })
    }

    pub fn release(self) -> (BUS, Option<RST>) {
        (self.bus, self.rst)
    }

    #[inline]
    pub fn config(&self) -> &PanelConfig {
        &self.config
    }

    pub fn bus_mut(&mut self) -> &mut BUS {
        &mut self.bus
    }

    /// Visible width after rotation.
    pub fn xres(&self) -> u16 {
        if self.config.rotation.swaps_axes() {
            self.config.height
        } else {
            self.config.width
        }
    }

    /// Visible height after rotation.
    pub fn yres(&self) -> u16 {
        if self.config.rotation.swaps_axes() {
            self.config.width
        } else {
            self.config.height
        }
    }

    /// Bytes per visible line.
    pub fn line_length(&self) -> usize {
        self.xres() as usize * BYTES_PER_PIXEL
    }

    /// Hardware reset (if wired), vendor sequence, then orientation.
    pub fn init(
        &mut self,
        delay: &mut impl DelayNs,
    ) -> Result<(), PanelError<BUS::Error, RST::Error>> {
        if let Some(rst) = self.rst.as_mut() {
            rst.set_low().map_err(PanelError::Reset)?;
            delay.delay_us(20);
            rst.set_high().map_err(PanelError::Reset)?;
            delay.delay_ms(120);
        }

        for step in INIT_SEQUENCE {
            match *step {
                InitStep::Cmd(cmd, params) => {
                    self.bus.write_reg(cmd, params).map_err(PanelError::Bus)?
                }
                InitStep::DelayMs(ms) => delay.delay_ms(ms),
            }
        }

        self.set_var()
    }

    /// Program the drawing window and open a memory write.
    pub fn set_addr_win(
        &mut self,
        xs: u16,
        ys: u16,
        xe: u16,
        ye: u16,
    ) -> Result<(), PanelError<BUS::Error, RST::Error>> {
        debug!("set_addr_win(xs={}, ys={}, xe={}, ye={})", xs, ys, xe, ye);

        let [xs_hi, xs_lo] = xs.to_be_bytes();
        let [xe_hi, xe_lo] = xe.to_be_bytes();
        let [ys_hi, ys_lo] = ys.to_be_bytes();
        let [ye_hi, ye_lo] = ye.to_be_bytes();

        self.bus
            .write_reg(CMD_CASET, &[xs_hi, xs_lo, xe_hi, xe_lo])
            .map_err(PanelError::Bus)?;
        self.bus
            .write_reg(CMD_PASET, &[ys_hi, ys_lo, ye_hi, ye_lo])
            .map_err(PanelError::Bus)?;
        self.bus.write_reg(CMD_RAMWR, &[]).map_err(PanelError::Bus)
    }

    /// Write MADCTL for the configured rotation and colour order.
    pub fn set_var(&mut self) -> Result<(), PanelError<BUS::Error, RST::Error>> {
        let value = madctl(self.config.rotation, self.config.color_order);
        debug!("set_var: rotate {}, madctl {:#04x}", self.config.rotation.degrees(), value);
        self.bus.write_reg(CMD_MADCTL, &[value]).map_err(PanelError::Bus)
    }

    pub fn set_rotation(
        &mut self,
        rotation: Rotation,
    ) -> Result<(), PanelError<BUS::Error, RST::Error>> {
        self.config.rotation = rotation;
        self.set_var()
    }

    /// Like [`Ili9488::set_rotation`], from a value in degrees.
    pub fn set_rotation_degrees(
        &mut self,
        degrees: u16,
    ) -> Result<(), PanelError<BUS::Error, RST::Error>> {
        let rotation = Rotation::try_from(degrees).map_err(PanelError::InvalidRotation)?;
        self.set_rotation(rotation)
    }

    /// Send `len` bytes of `fb` starting at `offset` as pixel data.
    ///
    /// On a transport error the remaining chunks are dropped; what already
    /// reached the panel stays there.
    pub fn write_vmem(
        &mut self,
        fb: &[u8],
        offset: usize,
        len: usize,
    ) -> Result<(), PanelError<BUS::Error, RST::Error>> {
        if len % BYTES_PER_PIXEL != 0 {
            return Err(PanelError::Misaligned(len));
        }
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= fb.len())
            .ok_or(PanelError::OutOfBounds)?;
        let src = &fb[offset..end];

        self.bus.begin_data().map_err(PanelError::Bus)?;

        let sent = match self.txbuf.as_deref_mut() {
            None => self.bus.write(src),
            Some(buf) => {
                let start_byte = self.bus.start_byte();
                write_staged(&mut self.bus, buf, start_byte, src)
            }
        };
        sent.map_err(PanelError::Bus)
    }

    /// Push lines `start_line..=end_line` of `fb` to the panel.
    ///
    /// Inverted or out-of-range lines refresh the whole screen.
    pub fn update_display(
        &mut self,
        fb: &[u8],
        start_line: u16,
        end_line: u16,
    ) -> Result<(), PanelError<BUS::Error, RST::Error>> {
        let last = self.yres().saturating_sub(1);
        let (start, end) = if start_line > end_line {
            warn!(
                "start_line={} is larger than end_line={}, using full screen",
                start_line, end_line
            );
            (0, last)
        } else if start_line > last || end_line > last {
            warn!(
                "start_line={} or end_line={} is larger than max={}, using full screen",
                start_line, end_line, last
            );
            (0, last)
        } else {
            (start_line, end_line)
        };

        let xe = self.xres().saturating_sub(1);
        self.set_addr_win(0, start, xe, end)?;

        let line_length = self.line_length();
        let offset = start as usize * line_length;
        let len = (end - start + 1) as usize * line_length;
        self.write_vmem(fb, offset, len)
    }
}

// Copy `src` through `buf` in whole pixels. Groups of four pixels are copied
// as one block, leftovers one pixel at a time.
fn write_staged<B: PanelBus>(
    bus: &mut B,
    buf: &mut [u8],
    start_byte: Option<u8>,
    src: &[u8],
) -> Result<(), B::Error> {
    let prefix = start_byte.is_some() as usize;
    let capacity = staging_capacity(buf.len(), start_byte.is_some());

    let mut remain = src.len() / BYTES_PER_PIXEL;
    let mut pos = 0;
    while remain > 0 {
        let to_copy = remain.min(capacity);
        let bytes = to_copy * BYTES_PER_PIXEL;

        if let Some(sb) = start_byte {
            buf[0] = sb | START_BYTE_DATA;
        }

        let dst = &mut buf[prefix..prefix + bytes];
        let chunk = &src[pos..pos + bytes];
        let grouped = to_copy / 4 * 4 * BYTES_PER_PIXEL;

        for (d, s) in dst[..grouped].chunks_exact_mut(12).zip(chunk[..grouped].chunks_exact(12)) {
            d.copy_from_slice(s);
        }
        for (d, s) in dst[grouped..]
            .chunks_exact_mut(BYTES_PER_PIXEL)
            .zip(chunk[grouped..].chunks_exact(BYTES_PER_PIXEL))
        {
            d.copy_from_slice(s);
        }

        bus.write(&buf[..prefix + bytes])?;

        pos += bytes;
        remain -= to_copy;
    }
    Ok(())
}
