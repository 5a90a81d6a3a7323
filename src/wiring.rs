// Board-level collaborators the drivers are wired to.
//
// - `RegisterIo` is a 32-bit register window (MMIO on hardware, a plain
//   array in tests).
// - `ClockSource` is the controller's reference clock.
// - `ResetControl` is the block reset line pulsed on first attach.
// Chip-select GPIOs, D/C pins and SPI transports come from `embedded-hal`.

/// Ordered, uncached 32-bit access to a register window.
pub trait RegisterIo {
    fn read32(&mut self, offset: usize) -> u32;
    fn write32(&mut self, offset: usize, value: u32);

    // Read-modify-write helpers
    #[inline]
    fn set_bits(&mut self, offset: usize, mask: u32) {
        let v = self.read32(offset);
        self.write32(offset, v | mask);
    }

    #[inline]
    fn clear_bits(&mut self, offset: usize, mask: u32) {
        let v = self.read32(offset);
        self.write32(offset, v & !mask);
    }
}

impl<T: RegisterIo + ?Sized> RegisterIo for &mut T {
    #[inline]
    fn read32(&mut self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    #[inline]
    fn write32(&mut self, offset: usize, value: u32) {
        (**self).write32(offset, value)
    }
}

/// Reference clock feeding a controller.
pub trait ClockSource {
    /// Current rate in Hz.
    fn rate_hz(&self) -> u32;
    fn enable(&mut self);
    fn disable(&mut self);
}

/// Hardware reset line for a controller block.
pub trait ResetControl {
    fn pulse(&mut self);
}

impl<F: FnMut()> ResetControl for F {
    #[inline]
    fn pulse(&mut self) {
        self()
    }
}

/// Memory-mapped register window.
pub struct Mmio {
    base: *mut u32,
}

// The window is only touched through volatile accesses; moving the handle
// to another context does not change what it points at.
unsafe impl Send for Mmio {}

impl Mmio {
    /// # Safety
    /// `base` must point at a mapped, 4-byte aligned register block that stays
    /// mapped for the lifetime of the handle, and nothing else may alias the
    /// registers accessed through it without synchronization.
    pub const unsafe fn new(base: *mut u32) -> Self {
        Self { base }
    }

    /// Handle to a sub-window starting `offset` bytes into this one.
    ///
    /// # Safety
    /// Same contract as [`Mmio::new`] for the resulting pointer.
    pub unsafe fn offset(&self, offset: usize) -> Self {
        Self { base: unsafe { self.base.byte_add(offset) } }
    }
}

impl RegisterIo for Mmio {
    #[inline]
    fn read32(&mut self, offset: usize) -> u32 {
        debug_assert!(offset % 4 == 0);
        unsafe { core::ptr::read_volatile(self.base.byte_add(offset)) }
    }

    #[inline]
    fn write32(&mut self, offset: usize, value: u32) {
        debug_assert!(offset % 4 == 0);
        unsafe { core::ptr::write_volatile(self.base.byte_add(offset), value) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mmio_reads_and_writes_backing_words() {
        let mut words = [0u32; 4];
        let mut mmio = unsafe { Mmio::new(words.as_mut_ptr()) };
        mmio.write32(0x8, 0xDEAD_BEEF);
        mmio.set_bits(0x4, 0b101);
        mmio.clear_bits(0x4, 0b001);
        assert_eq!(mmio.read32(0x8), 0xDEAD_BEEF);
        assert_eq!(mmio.read32(0x4), 0b100);
        drop(mmio);
        assert_eq!(words, [0, 0b100, 0xDEAD_BEEF, 0]);
    }

    #[test]
    fn test_mmio_sub_window() {
        let mut words = [0u32; 8];
        let root = unsafe { Mmio::new(words.as_mut_ptr()) };
        let mut sub = unsafe { root.offset(0x10) };
        sub.write32(0x0, 7);
        drop(sub);
        drop(root);
        assert_eq!(words[4], 7);
    }

    #[test]
    fn test_closure_is_reset_control() {
        let mut count = 0;
        {
            let mut reset = || count += 1;
            reset.pulse();
            reset.pulse();
        }
        assert_eq!(count, 2);
    }
}
