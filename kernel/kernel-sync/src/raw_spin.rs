use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

/// A bare test-and-test-and-set spin flag, for cases where the protected
/// state lives elsewhere (e.g. a CPU descriptor whose fields are written
/// under the flag by remote cores).
///
/// Prefer [`SpinLock`](crate::SpinLock) when the lock can own its data.
pub struct RawSpin {
    held: AtomicBool,
}

impl RawSpin {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// Spin until the flag is acquired.
    #[inline]
    pub fn lock(&self) {
        while self.held.swap(true, Ordering::Acquire) {
            // Spin on a plain load; only retry the swap once it looks free.
            while self.held.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    /// Try once; `true` on acquisition.
    #[inline]
    pub fn try_lock(&self) -> bool {
        !self.held.swap(true, Ordering::Acquire)
    }

    /// Release the flag.
    ///
    /// # Safety
    /// The caller must currently hold the flag.
    #[inline]
    pub unsafe fn unlock(&self) {
        self.held.store(false, Ordering::Release);
    }
}

impl Default for RawSpin {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_lock_reflects_state() {
        let flag = RawSpin::new();
        assert!(flag.try_lock());
        assert!(!flag.try_lock());
        unsafe { flag.unlock() };
        assert!(flag.try_lock());
    }
}
