//! Shootdown and halt protocols over the signal transport.

use crate::{CpuRegistry, IpiKind, IpiLink, ShootdownError, SmpError};
use core::hint::spin_loop;
use core::sync::atomic::Ordering;
use kernel_addresses::VirtualAddress;
use kernel_vas::{TlbInvalidate, TlbMaintenance};

/// Bound on the acknowledgment polling loops. Generous for any healthy
/// interconnect; a core that stays silent this long is wedged and gets a
/// warning instead of hanging the broadcaster forever.
const ACK_SPIN_LIMIT: u32 = 1_000_000;

impl CpuRegistry {
    /// Invalidate `va` on every other online core and wait for each to
    /// acknowledge.
    ///
    /// Per target: take its descriptor lock, record the address and the
    /// pending flag, release, signal. The handler on the target clears
    /// the flag once the translation is gone; that cleared flag is the
    /// acknowledgment polled here. The caller has already invalidated its
    /// own translation.
    ///
    /// # Errors
    /// [`ShootdownError::Timeout`] if a target never acknowledged within
    /// the spin bound. The address may still be cached on that core.
    pub fn broadcast_shootdown<L: IpiLink>(
        &self,
        link: &L,
        va: VirtualAddress,
    ) -> Result<(), ShootdownError> {
        let Some(me) = link.current_cpu() else {
            // No per-core identity yet: nobody else can be running against
            // this space either.
            return Ok(());
        };

        let mut targeted = 0usize;
        for cpu in self.others(me) {
            // A still-pending slot belongs to an in-flight broadcast from
            // another core; wait it out before posting ours.
            let mut spins = 0u32;
            loop {
                match cpu.post_shootdown(va) {
                    Ok(()) => break,
                    Err(SmpError::Busy) => {
                        spins += 1;
                        if spins > ACK_SPIN_LIMIT {
                            log::warn!("cpu {} shootdown slot wedged, skipping", cpu.id());
                            break;
                        }
                        spin_loop();
                    }
                }
            }
            if spins <= ACK_SPIN_LIMIT {
                link.send(cpu.id(), IpiKind::TlbShootdown);
                targeted += 1;
            }
        }
        if targeted == 0 {
            return Ok(());
        }

        // Block until every targeted core has consumed its slot.
        let mut spins = 0u32;
        loop {
            let outstanding = self
                .others(me)
                .filter(|c| c.shootdown_pending.load(Ordering::Acquire))
                .count();
            if outstanding == 0 {
                return Ok(());
            }
            spins += 1;
            if spins > ACK_SPIN_LIMIT {
                log::warn!(
                    "tlb shootdown for {va}: {outstanding} core(s) never acknowledged"
                );
                return Err(ShootdownError::Timeout);
            }
            spin_loop();
        }
    }

    /// The receiving core's shootdown handler, run from its signal
    /// interrupt: consume the pending slot, drop the one translation,
    /// acknowledge by clearing the flag. A spurious signal is a no-op.
    pub fn handle_shootdown<T: TlbInvalidate>(&self, cpu: crate::CpuId, tlb: &T) {
        let descriptor = self.descriptor(cpu);
        descriptor.lock.lock();
        if descriptor.shootdown_pending.load(Ordering::Acquire) {
            let va = VirtualAddress::new(descriptor.shootdown_va.load(Ordering::Relaxed));
            tlb.invalidate_page(va);
            descriptor.shootdown_va.store(0, Ordering::Relaxed);
            descriptor.shootdown_pending.store(false, Ordering::Release);
        }
        // SAFETY: taken a few lines up.
        unsafe { descriptor.lock.unlock() };
    }

    /// Signal every other online core to park permanently. Without a
    /// per-core identity there is nobody we can address; the caller
    /// falls back to parking itself only.
    pub fn halt_others<L: IpiLink>(&self, link: &L) {
        let Some(me) = link.current_cpu() else {
            return;
        };
        for cpu in self.others(me) {
            link.send(cpu.id(), IpiKind::Halt);
        }
    }

    /// Emergency stop: halt every other core, then this one.
    pub fn halt_all<L: IpiLink>(&self, link: &L) -> ! {
        self.halt_others(link);
        link.park()
    }
}

/// The [`TlbMaintenance`] the address-space backend mutates through:
/// local invalidation plus the broadcast, which collapses to a no-op
/// while fewer than two cores are online.
pub struct SmpTlb<'a, L: IpiLink, T: TlbInvalidate> {
    registry: &'a CpuRegistry,
    link: L,
    local: T,
}

impl<'a, L: IpiLink, T: TlbInvalidate> SmpTlb<'a, L, T> {
    pub const fn new(registry: &'a CpuRegistry, link: L, local: T) -> Self {
        Self {
            registry,
            link,
            local,
        }
    }
}

impl<L: IpiLink, T: TlbInvalidate> TlbInvalidate for SmpTlb<'_, L, T> {
    fn invalidate_page(&self, va: VirtualAddress) {
        self.local.invalidate_page(va);
    }
}

impl<L: IpiLink, T: TlbInvalidate> TlbMaintenance for SmpTlb<'_, L, T> {
    fn shootdown(&self, va: VirtualAddress) {
        if self.registry.online_count() > 1 {
            // Timeout already warned; a wedged remote core must not take
            // the mapping path down with it.
            let _ = self.registry.broadcast_shootdown(&self.link, va);
        }
    }
}
