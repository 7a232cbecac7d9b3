//! The scheduling pass shared by timer preemption and voluntary yield.

use crate::ready_queue::ReadyQueues;
use crate::thread::{Thread, ThreadState, Tid, TrapFrame};
use crate::PRIORITY_LEVELS;
use alloc::boxed::Box;
use alloc::vec::Vec;
use kernel_smp::{CpuId, CpuRegistry, MAX_CPUS};
use kernel_sync::SpinLock;
use kernel_vas::SpaceSwitch;

/// Re-arming of the per-core oneshot preemption timer; implemented by
/// platform code over the local timer (LAPIC oneshot, CNTP_TVAL).
pub trait PreemptionTimer {
    fn rearm(&self, cpu: CpuId);
}

/// The multi-level feedback scheduler.
///
/// Construction wires in the two hardware seams: the address-space
/// switch and the preemption timer.
pub struct Scheduler<S: SpaceSwitch, T: PreemptionTimer> {
    queues: ReadyQueues<S::Root>,
    running: [SpinLock<Option<Box<Thread<S::Root>>>>; MAX_CPUS],
    /// Mid-exec blocks waiting for the exec path to reclaim them.
    parked: SpinLock<Vec<Box<Thread<S::Root>>>>,
    /// Dead blocks awaiting reap.
    zombies: SpinLock<Vec<Box<Thread<S::Root>>>>,
    switch: S,
    timer: T,
}

impl<S: SpaceSwitch, T: PreemptionTimer> Scheduler<S, T> {
    #[must_use]
    pub const fn new(switch: S, timer: T) -> Self {
        Self {
            queues: ReadyQueues::new(),
            running: [const { SpinLock::new(None) }; MAX_CPUS],
            parked: SpinLock::new(Vec::new()),
            zombies: SpinLock::new(Vec::new()),
            switch,
            timer,
        }
    }

    /// Make a thread runnable: spawn, wake after blocking, exec done.
    pub fn enqueue(&self, thread: Box<Thread<S::Root>>) {
        self.queues.enqueue(thread);
    }

    /// Timer-interrupt entry: one preemptive scheduling pass. Returns
    /// `true` if a thread is now running on `cpu`, `false` if the core
    /// should idle (pause-loop) until the next interrupt.
    pub fn on_timer(&self, registry: &CpuRegistry, cpu: CpuId, trap: &mut TrapFrame) -> bool {
        self.reschedule(registry, cpu, trap, false)
    }

    /// Voluntary yield: mark the current thread rested, then run one
    /// scheduling pass synchronously — the same path the timer takes.
    pub fn yield_now(&self, registry: &CpuRegistry, cpu: CpuId, trap: &mut TrapFrame) -> bool {
        self.reschedule(registry, cpu, trap, true)
    }

    fn reschedule(
        &self,
        registry: &CpuRegistry,
        cpu: CpuId,
        trap: &mut TrapFrame,
        voluntary: bool,
    ) -> bool {
        // Retire the outgoing thread: save its live trap state, age its
        // priority, and put the block where its state says it belongs.
        // The running slot's lock is released before any queue lock is
        // taken.
        let outgoing = self.running[cpu].lock().take();
        if let Some(mut outgoing) = outgoing {
            outgoing.trap = *trap;
            if voluntary {
                outgoing.rested = true;
            }
            Self::age(&mut outgoing);

            if outgoing.in_exec {
                self.parked.lock().push(outgoing);
            } else if outgoing.state == ThreadState::Exiting {
                outgoing.state = ThreadState::Zombie;
                self.zombies.lock().push(outgoing);
            } else {
                self.queues.enqueue(outgoing);
            }
        }

        // Pick the next candidate; exiting blocks swept up along the way
        // go straight to the zombie list.
        let mut retired = Vec::new();
        let next = self.queues.pick(&mut retired);
        if !retired.is_empty() {
            let mut zombies = self.zombies.lock();
            for mut dead in retired {
                dead.state = ThreadState::Zombie;
                zombies.push(dead);
            }
        }

        let dispatched = if let Some(mut next) = next {
            next.state = ThreadState::Running;
            *trap = next.trap;
            if self.switch.read_current() != next.space() {
                // SAFETY: the root came from a live thread whose space is
                // valid for as long as the thread exists.
                unsafe { self.switch.switch(next.space()) };
            }
            registry.descriptor(cpu).set_current_tid(next.tid());
            *self.running[cpu].lock() = Some(next);
            true
        } else {
            // Nothing anywhere: not a fatal condition. The core parks in
            // a pause loop until the next interrupt.
            registry.descriptor(cpu).set_current_tid(0);
            false
        };

        self.timer.rearm(cpu);
        dispatched
    }

    /// One aging step: rested threads rise toward level 0, full-quantum
    /// threads sink toward the bottom. Consumes the rested flag.
    fn age(thread: &mut Thread<S::Root>) {
        if thread.rested {
            thread.priority = thread.priority.saturating_sub(1);
        } else {
            thread.priority = (thread.priority + 1).min((PRIORITY_LEVELS - 1) as u8);
        }
        thread.rested = false;
    }

    /// Remove the current thread from the core for blocking; the caller
    /// (a wait structure) owns the block until it re-enqueues it. The
    /// core keeps running the old context until its next scheduling pass.
    pub fn take_current(&self, registry: &CpuRegistry, cpu: CpuId) -> Option<Box<Thread<S::Root>>> {
        let mut thread = self.running[cpu].lock().take()?;
        thread.state = ThreadState::Blocked;
        registry.descriptor(cpu).set_current_tid(0);
        Some(thread)
    }

    /// Flag the current thread of `cpu` as exiting; the next scheduling
    /// pass retires it to the zombie list.
    pub fn exit_current(&self, cpu: CpuId) {
        if let Some(thread) = self.running[cpu].lock().as_mut() {
            thread.state = ThreadState::Exiting;
        }
    }

    /// Flag a thread anywhere in the system as exiting. Running threads
    /// are flagged in place and retired when their core next schedules.
    pub fn mark_exiting(&self, tid: Tid) -> bool {
        for slot in &self.running {
            let mut slot = slot.lock();
            if let Some(thread) = slot.as_mut() {
                if thread.tid() == tid {
                    thread.state = ThreadState::Exiting;
                    return true;
                }
            }
        }
        self.queues.mark_exiting(tid)
    }

    /// Reclaim a mid-exec block previously parked by a scheduling pass.
    pub fn take_parked(&self, tid: Tid) -> Option<Box<Thread<S::Root>>> {
        let mut parked = self.parked.lock();
        let index = parked.iter().position(|t| t.tid() == tid)?;
        Some(parked.swap_remove(index))
    }

    /// Drain the zombie list; the process-exit path frees the blocks.
    pub fn reap_zombies(&self) -> Vec<Box<Thread<S::Root>>> {
        core::mem::take(&mut *self.zombies.lock())
    }

    /// Priority of a live thread (running or queued), for diagnostics.
    pub fn thread_priority(&self, tid: Tid) -> Option<u8> {
        for slot in &self.running {
            let slot = slot.lock();
            if let Some(thread) = slot.as_ref() {
                if thread.tid() == tid {
                    return Some(thread.priority);
                }
            }
        }
        self.queues.priority_of(tid)
    }

    /// Queued (ready) thread count.
    pub fn ready_len(&self) -> usize {
        self.queues.len()
    }
}
