use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

/// Write-once cell for boot-time singletons.
///
/// Exactly one caller wins the initialization race; everyone else spins
/// until the value is published, then observes the same reference forever.
pub struct SyncOnceCell<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

// Safety: after READY the value is immutable and shared; initialization is
// single-writer by the state machine.
unsafe impl<T: Sync> Sync for SyncOnceCell<T> {}
unsafe impl<T: Send> Send for SyncOnceCell<T> {}

impl<T> SyncOnceCell<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// `Some(&T)` once initialized, `None` before.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            // SAFETY: READY is only stored after the value is written.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    /// Initialize at most once; all callers get the same reference.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        if let Some(v) = self.get() {
            return v;
        }

        if self
            .state
            .compare_exchange(UNINIT, INITIALIZING, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            let value = init();
            // SAFETY: we won the INITIALIZING transition; no other writer.
            unsafe { (*self.value.get()).write(value) };
            self.state.store(READY, Ordering::Release);
        } else {
            while self.state.load(Ordering::Acquire) != READY {
                spin_loop();
            }
        }

        // SAFETY: READY was observed (or just stored by us).
        unsafe { (*self.value.get()).assume_init_ref() }
    }
}

impl<T> Default for SyncOnceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initializes_exactly_once() {
        let cell = SyncOnceCell::new();
        assert!(cell.get().is_none());
        assert_eq!(*cell.get_or_init(|| 7), 7);
        assert_eq!(*cell.get_or_init(|| 8), 7);
        assert_eq!(cell.get(), Some(&7));
    }
}
