//! Attach bookkeeping for controller instances sharing one reset line.
//!
//! Both SPI blocks on the SoC sit behind the same reset. Only the first
//! instance to attach may pulse it; later ones would wipe a bus that is
//! already in use. The registry counts live instances so the decision is
//! made exactly once, even when instances attach from different contexts.
//!
//! Place one registry in a `static` for process-wide behaviour:
//!
//! ```
//! use ralink_fbtft::attach::AttachRegistry;
//! static SPI_INSTANCES: AttachRegistry = AttachRegistry::new();
//! assert!(SPI_INSTANCES.attach());
//! assert!(!SPI_INSTANCES.attach());
//! ```

use core::sync::atomic::{AtomicUsize, Ordering};

pub struct AttachRegistry {
    live: AtomicUsize,
}

impl AttachRegistry {
    pub const fn new() -> Self {
        Self { live: AtomicUsize::new(0) }
    }

    /// Register an instance. Returns `true` for the first one.
    pub fn attach(&self) -> bool {
        self.live.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// Drop an instance. Unbalanced calls are ignored.
    pub fn detach(&self) {
        let _ = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    #[inline]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

impl Default for AttachRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as Counter;

    #[test]
    fn test_only_first_attach_is_first() {
        let reg = AttachRegistry::new();
        assert!(reg.attach());
        assert!(!reg.attach());
        assert_eq!(reg.live(), 2);
    }

    #[test]
    fn test_detach_rearms_first_attach() {
        let reg = AttachRegistry::new();
        assert!(reg.attach());
        reg.detach();
        assert_eq!(reg.live(), 0);
        assert!(reg.attach());
    }

    #[test]
    fn test_unbalanced_detach_saturates() {
        let reg = AttachRegistry::default();
        reg.detach();
        assert_eq!(reg.live(), 0);
        assert!(reg.attach());
    }

    #[test]
    fn test_concurrent_attach_has_single_first() {
        let reg = AttachRegistry::new();
        let firsts = Counter::new(0);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    if reg.attach() {
                        firsts.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });
        assert_eq!(firsts.load(Ordering::Relaxed), 1);
        assert_eq!(reg.live(), 8);
    }
}
