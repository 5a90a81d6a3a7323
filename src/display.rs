//! Linear 24bpp framebuffer with dirty-line tracking.
//
// - Pixels are stored `[b, g, r]`, the byte order the ILI9488 pipeline streams.
// - Drawing only touches memory; `flush` pushes the dirty lines to a panel.

use core::convert::Infallible;
use core::fmt;

use embedded_graphics::pixelcolor::Rgb888;
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::Rectangle;
use embedded_hal::digital::OutputPin;

use crate::ili9488::{Ili9488, PanelBus, PanelError, BLUE, BYTES_PER_PIXEL, GREEN, RED};

/// Memory bytes of one pixel.
#[inline]
pub fn pixel_bytes(color: Rgb888) -> [u8; 3] {
    let value = (color.r() as u32) << RED.offset
        | (color.g() as u32) << GREEN.offset
        | (color.b() as u32) << BLUE.offset;
    let [b0, b1, b2, _] = value.to_le_bytes();
    [b0, b1, b2]
}

#[inline]
fn color_from_bytes(bytes: &[u8]) -> Rgb888 {
    let value = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]);
    let channel = |field: crate::ili9488::Bitfield| (value >> field.offset) as u8;
    Rgb888::new(channel(RED), channel(GREEN), channel(BLUE))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeMismatch {
    pub expected: usize,
    pub actual: usize,
}

impl fmt::Display for SizeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "framebuffer is {} bytes, expected {}", self.actual, self.expected)
    }
}

pub struct Framebuffer24<'fb> {
    buf: &'fb mut [u8],
    width: u16,
    height: u16,
    // inclusive line range waiting for flush
    dirty: Option<(u16, u16)>,
}

impl<'fb> Framebuffer24<'fb> {
    /// `buf` must hold exactly `width * height` pixels.
    pub fn new(buf: &'fb mut [u8], width: u16, height: u16) -> Result<Self, SizeMismatch> {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if buf.len() != expected {
            return Err(SizeMismatch { expected, actual: buf.len() });
        }
        Ok(Self { buf, width, height, dirty: None })
    }

    /// Framebuffer matching the visible resolution of `panel`.
    pub fn for_panel<BUS, RST>(
        buf: &'fb mut [u8],
        panel: &Ili9488<'_, BUS, RST>,
    ) -> Result<Self, SizeMismatch>
    where
        BUS: PanelBus,
        RST: OutputPin,
    {
        Self::new(buf, panel.xres(), panel.yres())
    }

    #[inline]
    pub fn width(&self) -> u16 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn as_bytes(&self) -> &[u8] {
        &*self.buf
    }

    /// Lines changed since the last flush.
    pub fn dirty_lines(&self) -> Option<(u16, u16)> {
        self.dirty
    }

    pub fn mark_dirty(&mut self, first: u16, last: u16) {
        let last = last.min(self.height.saturating_sub(1));
        if first > last {
            return;
        }
        self.dirty = Some(match self.dirty {
            Some((lo, hi)) => (lo.min(first), hi.max(last)),
            None => (first, last),
        });
    }

    #[inline]
    fn index(&self, x: u16, y: u16) -> usize {
        (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL
    }

    pub fn pixel(&self, x: u16, y: u16) -> Option<Rgb888> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = self.index(x, y);
        Some(color_from_bytes(&self.buf[i..i + BYTES_PER_PIXEL]))
    }

    /// Returns `false` when (x, y) is off screen.
    pub fn set_pixel(&mut self, x: u16, y: u16, color: Rgb888) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        let i = self.index(x, y);
        self.buf[i..i + BYTES_PER_PIXEL].copy_from_slice(&pixel_bytes(color));
        self.mark_dirty(y, y);
        true
    }

    /// Send dirty lines to `panel`. The dirty range is kept if the write fails.
    pub fn flush<BUS, RST>(
        &mut self,
        panel: &mut Ili9488<'_, BUS, RST>,
    ) -> Result<(), PanelError<BUS::Error, RST::Error>>
    where
        BUS: PanelBus,
        RST: OutputPin,
    {
        let Some((first, last)) = self.dirty else {
            return Ok(());
        };
        panel.update_display(&*self.buf, first, last)?;
        self.dirty = None;
        Ok(())
    }
}

impl OriginDimensions for Framebuffer24<'_> {
    fn size(&self) -> Size {
        Size::new(self.width as u32, self.height as u32)
    }
}

impl DrawTarget for Framebuffer24<'_> {
    type Color = Rgb888;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Rgb888>>,
    {
        for Pixel(p, c) in pixels {
            if p.x < 0 || p.y < 0 || p.x >= self.width as i32 || p.y >= self.height as i32 {
                continue;
            }
            self.set_pixel(p.x as u16, p.y as u16, c);
        }
        Ok(())
    }

    fn fill_solid(&mut self, area: &Rectangle, color: Rgb888) -> Result<(), Self::Error> {
        let area = area.intersection(&self.bounding_box());
        let Some(bottom_right) = area.bottom_right() else {
            return Ok(());
        };

        let (x0, y0) = (area.top_left.x as u16, area.top_left.y as u16);
        let (x1, y1) = (bottom_right.x as u16, bottom_right.y as u16);
        let bytes = pixel_bytes(color);

        for y in y0..=y1 {
            let start = self.index(x0, y);
            let end = self.index(x1, y) + BYTES_PER_PIXEL;
            for px in self.buf[start..end].chunks_exact_mut(BYTES_PER_PIXEL) {
                px.copy_from_slice(&bytes);
            }
        }
        self.mark_dirty(y0, y1);
        Ok(())
    }

    fn clear(&mut self, color: Rgb888) -> Result<(), Self::Error> {
        let bytes = pixel_bytes(color);
        for px in self.buf.chunks_exact_mut(BYTES_PER_PIXEL) {
            px.copy_from_slice(&bytes);
        }
        self.mark_dirty(0, self.height.saturating_sub(1));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ili9488::{NoPin, PanelConfig, Rotation, CMD_PASET};
    use embedded_graphics::primitives::PrimitiveStyle;
    use std::vec::Vec;

    #[derive(Default)]
    struct Capture {
        regs: Vec<(u8, Vec<u8>)>,
        data: Vec<u8>,
        broken: bool,
    }

    impl PanelBus for Capture {
        type Error = ();

        fn write_reg(&mut self, cmd: u8, params: &[u8]) -> Result<(), ()> {
            self.regs.push((cmd, params.to_vec()));
            Ok(())
        }

        fn begin_data(&mut self) -> Result<(), ()> {
            Ok(())
        }

        fn write(&mut self, bytes: &[u8]) -> Result<(), ()> {
            if self.broken {
                return Err(());
            }
            self.data.extend_from_slice(bytes);
            Ok(())
        }

        fn start_byte(&self) -> Option<u8> {
            None
        }
    }

    fn small_panel(bus: Capture) -> Ili9488<'static, Capture, NoPin> {
        let config = PanelConfig { width: 4, height: 3, ..PanelConfig::default() };
        Ili9488::new(bus, None, config, None).unwrap()
    }

    #[test]
    fn test_pixel_memory_order() {
        assert_eq!(pixel_bytes(Rgb888::new(0x11, 0x22, 0x33)), [0x33, 0x22, 0x11]);

        let mut buf = [0u8; 4 * 3 * 3];
        let mut fb = Framebuffer24::new(&mut buf, 4, 3).unwrap();
        assert!(fb.set_pixel(1, 2, Rgb888::new(0xAA, 0xBB, 0xCC)));
        assert_eq!(fb.pixel(1, 2), Some(Rgb888::new(0xAA, 0xBB, 0xCC)));
        let i = (2 * 4 + 1) * 3;
        assert_eq!(&fb.as_bytes()[i..i + 3], &[0xCC, 0xBB, 0xAA]);
    }

    #[test]
    fn test_size_mismatch() {
        let mut buf = [0u8; 10];
        let err = Framebuffer24::new(&mut buf, 2, 2).err();
        assert_eq!(err, Some(SizeMismatch { expected: 12, actual: 10 }));
    }

    #[test]
    fn test_off_screen_pixels_are_ignored() {
        let mut buf = [0u8; 4 * 3 * 3];
        let mut fb = Framebuffer24::new(&mut buf, 4, 3).unwrap();
        let pixels = [
            Pixel(Point::new(-1, 0), Rgb888::WHITE),
            Pixel(Point::new(4, 0), Rgb888::WHITE),
            Pixel(Point::new(0, 70_000), Rgb888::WHITE),
        ];
        fb.draw_iter(pixels).unwrap();
        assert_eq!(fb.dirty_lines(), None);
        assert!(fb.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_dirty_lines_grow() {
        let mut buf = [0u8; 4 * 3 * 3];
        let mut fb = Framebuffer24::new(&mut buf, 4, 3).unwrap();
        fb.set_pixel(0, 1, Rgb888::RED);
        assert_eq!(fb.dirty_lines(), Some((1, 1)));
        fb.set_pixel(3, 2, Rgb888::RED);
        fb.set_pixel(3, 1, Rgb888::RED);
        assert_eq!(fb.dirty_lines(), Some((1, 2)));
    }

    #[test]
    fn test_fill_solid_is_clipped() {
        let mut buf = [0u8; 4 * 3 * 3];
        let mut fb = Framebuffer24::new(&mut buf, 4, 3).unwrap();
        Rectangle::new(Point::new(2, -5), Size::new(10, 6))
            .into_styled(PrimitiveStyle::with_fill(Rgb888::BLUE))
            .draw(&mut fb)
            .unwrap();

        assert_eq!(fb.dirty_lines(), Some((0, 0)));
        assert_eq!(fb.pixel(1, 0), Some(Rgb888::BLACK));
        assert_eq!(fb.pixel(2, 0), Some(Rgb888::BLUE));
        assert_eq!(fb.pixel(3, 0), Some(Rgb888::BLUE));
        assert_eq!(fb.pixel(2, 1), Some(Rgb888::BLACK));
    }

    #[test]
    fn test_flush_sends_dirty_lines_only() {
        let mut buf = [0u8; 4 * 3 * 3];
        let mut fb = Framebuffer24::new(&mut buf, 4, 3).unwrap();
        let mut panel = small_panel(Capture::default());

        fb.flush(&mut panel).unwrap();
        assert!(panel.bus_mut().regs.is_empty());

        fb.set_pixel(0, 1, Rgb888::GREEN);
        fb.flush(&mut panel).unwrap();
        assert_eq!(fb.dirty_lines(), None);

        let bus = panel.release().0;
        assert_eq!(bus.regs[1], (CMD_PASET, std::vec![0, 1, 0, 1]));
        assert_eq!(bus.data.len(), 4 * 3);
        assert_eq!(&bus.data[..3], &[0x00, 0xFF, 0x00]);
    }

    #[test]
    fn test_failed_flush_keeps_dirty_range() {
        let mut buf = [0u8; 4 * 3 * 3];
        let mut fb = Framebuffer24::new(&mut buf, 4, 3).unwrap();
        let mut panel = small_panel(Capture { broken: true, ..Capture::default() });

        fb.clear(Rgb888::WHITE).unwrap();
        assert_eq!(fb.flush(&mut panel), Err(PanelError::Bus(())));
        assert_eq!(fb.dirty_lines(), Some((0, 2)));
    }

    #[test]
    fn test_for_panel_uses_rotated_size() {
        let config = PanelConfig { width: 4, height: 3, rotation: Rotation::Deg90, ..PanelConfig::default() };
        let panel: Ili9488<Capture, NoPin> = Ili9488::new(Capture::default(), None, config, None).unwrap();
        let mut buf = [0u8; 4 * 3 * 3];
        let fb = Framebuffer24::for_panel(&mut buf, &panel).unwrap();
        assert_eq!((fb.width(), fb.height()), (3, 4));
    }
}
