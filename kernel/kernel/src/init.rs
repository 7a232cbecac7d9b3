//! Boot-time singletons and interrupt entry glue.

use crate::hhdm::HhdmMapper;
use crate::{ArchPaging, ArchSwitch, ArchTlb};
use kernel_pmm::{FrameAllocator, MemoryRegion};
use kernel_sched::{PreemptionTimer, Scheduler, TrapFrame};
use kernel_smp::{handle_halt, CpuId, CpuRegistry, IpiKind, IpiLink, SmpTlb};
use kernel_sync::SyncOnceCell;
use kernel_vas::{AddressSpace, SpaceSwitch};

static HHDM: HhdmMapper = HhdmMapper;
static CPUS: CpuRegistry = CpuRegistry::new();
static FRAMES: SyncOnceCell<FrameAllocator<'static, HhdmMapper>> = SyncOnceCell::new();
static IPI_LINK: SyncOnceCell<&'static (dyn IpiLink + Sync)> = SyncOnceCell::new();
static PREEMPT_TIMER: SyncOnceCell<&'static (dyn PreemptionTimer + Sync)> = SyncOnceCell::new();
static SCHED: SyncOnceCell<Scheduler<ArchSwitch, TimerHook>> = SyncOnceCell::new();

/// Stand-in transport until platform startup registers the real one:
/// there is no per-core identity yet, so protocols collapse to their
/// single-core fallbacks.
struct BootstrapLink;

impl IpiLink for BootstrapLink {
    fn send(&self, _target: CpuId, _kind: IpiKind) {}

    fn current_cpu(&self) -> Option<CpuId> {
        None
    }

    fn park(&self) -> ! {
        park_self()
    }
}

static BOOTSTRAP_LINK: BootstrapLink = BootstrapLink;

/// Timer seam the scheduler is built with; forwards to the registered
/// platform timer once there is one.
pub struct TimerHook;

impl PreemptionTimer for TimerHook {
    fn rearm(&self, cpu: CpuId) {
        if let Some(timer) = PREEMPT_TIMER.get() {
            timer.rearm(cpu);
        }
    }
}

/// Build the frame allocator from the platform memory map. First call
/// wins; later calls return the existing instance.
pub fn init_memory(regions: &[MemoryRegion]) -> &'static FrameAllocator<'static, HhdmMapper> {
    FRAMES.get_or_init(|| FrameAllocator::new(&HHDM, regions))
}

/// The frame-allocator singleton.
///
/// # Panics
/// Before [`init_memory`].
pub fn frame_allocator() -> &'static FrameAllocator<'static, HhdmMapper> {
    FRAMES.get().expect("init_memory not called")
}

/// The per-core descriptor table.
pub fn cpu_registry() -> &'static CpuRegistry {
    &CPUS
}

/// Register the platform's cross-core signal transport. First call wins.
pub fn register_ipi_link(link: &'static (dyn IpiLink + Sync)) {
    let registered = *IPI_LINK.get_or_init(|| link);
    if !core::ptr::eq(registered, link) {
        log::warn!("ipi link already registered, ignoring replacement");
    }
}

/// Register the platform's per-core oneshot timer. First call wins.
pub fn register_preemption_timer(timer: &'static (dyn PreemptionTimer + Sync)) {
    let registered = *PREEMPT_TIMER.get_or_init(|| timer);
    if !core::ptr::eq(registered, timer) {
        log::warn!("preemption timer already registered, ignoring replacement");
    }
}

fn active_link() -> &'static (dyn IpiLink + Sync) {
    IPI_LINK.get().copied().unwrap_or(&BOOTSTRAP_LINK)
}

/// The scheduler singleton.
pub fn scheduler() -> &'static Scheduler<ArchSwitch, TimerHook> {
    SCHED.get_or_init(|| Scheduler::new(ArchSwitch::default(), TimerHook))
}

/// TLB maintenance handle for mapping operations: local invalidation
/// plus the cross-core shootdown when more than one core is online.
pub fn tlb() -> SmpTlb<'static, &'static (dyn IpiLink + Sync), ArchTlb> {
    SmpTlb::new(&CPUS, active_link(), ArchTlb::default())
}

/// The currently active address space, viewed through the direct map.
pub fn boot_space() -> AddressSpace<'static, ArchPaging, HhdmMapper> {
    AddressSpace::from_root(&HHDM, ArchSwitch::default().read_current())
}

/// Timer-interrupt epilogue: one scheduling pass. Returns `false` when
/// the core has nothing to run and should pause-loop until the next
/// interrupt.
pub fn on_timer_interrupt(cpu: CpuId, trap: &mut TrapFrame) -> bool {
    scheduler().on_timer(&CPUS, cpu, trap)
}

/// Voluntary yield from kernel context (drivers' interrupt epilogues,
/// idle maintenance).
pub fn yield_now(cpu: CpuId, trap: &mut TrapFrame) -> bool {
    scheduler().yield_now(&CPUS, cpu, trap)
}

/// Shootdown-signal epilogue for the receiving core.
pub fn shootdown_epilogue(cpu: CpuId) {
    CPUS.handle_shootdown(cpu, &ArchTlb::default());
}

/// Halt-signal epilogue: parks this core permanently.
pub fn halt_epilogue() -> ! {
    handle_halt(&active_link())
}

/// Panic path: stop every other core, then this one. Works even before
/// the transport exists — the bootstrap fallback parks only ourselves.
pub fn emergency_halt() -> ! {
    CPUS.halt_all(&active_link())
}

#[cfg(target_arch = "x86_64")]
fn park_self() -> ! {
    loop {
        // SAFETY: interrupts off, wait forever.
        unsafe { core::arch::asm!("cli", "hlt", options(nomem, nostack)) };
    }
}

#[cfg(target_arch = "aarch64")]
fn park_self() -> ! {
    loop {
        // SAFETY: interrupts masked, wait forever.
        unsafe { core::arch::asm!("msr daifset, #0b1111", "wfe", options(nomem, nostack)) };
    }
}
