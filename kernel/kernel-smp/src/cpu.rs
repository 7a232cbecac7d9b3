//! Per-core descriptors and the boot-time registry.

use crate::{CpuId, SmpError, MAX_CPUS};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use kernel_addresses::VirtualAddress;
use kernel_sync::RawSpin;

/// Everything other cores may need to know about one core.
///
/// The shootdown slot (`va` + pending flag) is written by remote cores
/// under `lock` and consumed by the owning core's signal handler; the
/// cleared pending flag doubles as the acknowledgment the broadcaster
/// polls. The current-thread id is a lock-free mirror for diagnostics
/// and the scheduler's bookkeeping.
pub struct CpuDescriptor {
    id: CpuId,
    online: AtomicBool,
    pub(crate) lock: RawSpin,
    pub(crate) shootdown_va: AtomicU64,
    pub(crate) shootdown_pending: AtomicBool,
    current_tid: AtomicU32,
}

impl CpuDescriptor {
    const fn new(id: CpuId) -> Self {
        Self {
            id,
            online: AtomicBool::new(false),
            lock: RawSpin::new(),
            shootdown_va: AtomicU64::new(0),
            shootdown_pending: AtomicBool::new(false),
            current_tid: AtomicU32::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> CpuId {
        self.id
    }

    #[inline]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Thread id currently executing on this core (0 = none/idle).
    #[inline]
    pub fn current_tid(&self) -> u32 {
        self.current_tid.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_current_tid(&self, tid: u32) {
        self.current_tid.store(tid, Ordering::Relaxed);
    }

    /// Post a pending shootdown for `va` under the descriptor lock.
    ///
    /// # Errors
    /// [`SmpError::Busy`] while a previous shootdown is still
    /// unacknowledged; the caller retries after backing off.
    pub(crate) fn post_shootdown(&self, va: VirtualAddress) -> Result<(), SmpError> {
        self.lock.lock();
        let result = if self.shootdown_pending.load(Ordering::Acquire) {
            Err(SmpError::Busy)
        } else {
            self.shootdown_va.store(va.as_u64(), Ordering::Relaxed);
            self.shootdown_pending.store(true, Ordering::Release);
            Ok(())
        };
        // SAFETY: taken a few lines up.
        unsafe { self.lock.unlock() };
        result
    }
}

/// The fixed set of core descriptors, built once at boot.
pub struct CpuRegistry {
    cpus: [CpuDescriptor; MAX_CPUS],
}

impl CpuRegistry {
    #[must_use]
    pub const fn new() -> Self {
        let mut cpus = [const { CpuDescriptor::new(0) }; MAX_CPUS];
        let mut id = 0;
        while id < MAX_CPUS {
            cpus[id] = CpuDescriptor::new(id);
            id += 1;
        }
        Self { cpus }
    }

    /// Mark a discovered core online. Called by platform startup as each
    /// core finishes its bring-up.
    ///
    /// # Errors
    /// [`SmpError::Busy`] if the core was already brought online.
    ///
    /// # Panics
    /// On an out-of-range id; the platform enumerated more cores than
    /// [`MAX_CPUS`], which is a configuration error.
    pub fn bring_online(&self, id: CpuId) -> Result<(), SmpError> {
        assert!(id < MAX_CPUS, "cpu id {id} out of range");
        if self.cpus[id].online.swap(true, Ordering::AcqRel) {
            Err(SmpError::Busy)
        } else {
            log::info!("cpu {id} online");
            Ok(())
        }
    }

    #[inline]
    #[must_use]
    pub fn descriptor(&self, id: CpuId) -> &CpuDescriptor {
        &self.cpus[id]
    }

    /// Number of cores currently online.
    pub fn online_count(&self) -> usize {
        self.cpus.iter().filter(|c| c.is_online()).count()
    }

    /// Online descriptors other than `me`.
    pub(crate) fn others(&self, me: CpuId) -> impl Iterator<Item = &CpuDescriptor> {
        self.cpus
            .iter()
            .filter(move |c| c.id != me && c.is_online())
    }
}

impl Default for CpuRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bring_online_is_once_per_core() {
        let registry = CpuRegistry::new();
        assert_eq!(registry.online_count(), 0);
        registry.bring_online(0).unwrap();
        registry.bring_online(3).unwrap();
        assert_eq!(registry.bring_online(0), Err(SmpError::Busy));
        assert_eq!(registry.online_count(), 2);
        assert!(registry.descriptor(3).is_online());
        assert!(!registry.descriptor(1).is_online());
    }

    #[test]
    fn current_tid_mirror() {
        let registry = CpuRegistry::new();
        registry.descriptor(2).set_current_tid(17);
        assert_eq!(registry.descriptor(2).current_tid(), 17);
        registry.descriptor(2).set_current_tid(0);
        assert_eq!(registry.descriptor(2).current_tid(), 0);
    }
}
