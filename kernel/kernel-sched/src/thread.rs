//! Thread control blocks and saved trap state.

use alloc::string::String;

/// Thread identifier. 0 is reserved for "no thread" in the per-CPU
/// mirrors.
pub type Tid = u32;

/// Saved register state of an interrupted thread, filled by the
/// architecture's interrupt entry and consumed by dispatch.
#[cfg(target_arch = "x86_64")]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TrapFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,
}

/// Saved register state of an interrupted thread, filled by the
/// architecture's exception entry and consumed by dispatch.
#[cfg(target_arch = "aarch64")]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TrapFrame {
    pub x: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

impl TrapFrame {
    #[must_use]
    pub fn zeroed() -> Self {
        Self::default()
    }

    /// Program counter, the architecture-neutral field tests care about.
    #[must_use]
    pub const fn pc(&self) -> u64 {
        #[cfg(target_arch = "x86_64")]
        {
            self.rip
        }
        #[cfg(target_arch = "aarch64")]
        {
            self.pc
        }
    }

    pub const fn set_pc(&mut self, pc: u64) {
        #[cfg(target_arch = "x86_64")]
        {
            self.rip = pc;
        }
        #[cfg(target_arch = "aarch64")]
        {
            self.pc = pc;
        }
    }
}

/// Scheduling state. A thread is in exactly one of these, and its
/// location (queue, running slot, parked/zombie list, wait structure)
/// matches the state.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ThreadState {
    /// In a priority queue, waiting for a core.
    Ready,
    /// Referenced by exactly one CPU descriptor.
    Running,
    /// Held by a wait structure; excluded from dispatch.
    Blocked,
    /// Flagged for termination; excluded from dispatch, retired to the
    /// zombie list on the next scheduling pass that sees it.
    Exiting,
    /// Dead, awaiting reap by the parent.
    Zombie,
}

/// One thread's control block. `R` is the address-space root installed on
/// dispatch.
pub struct Thread<R> {
    tid: Tid,
    name: String,
    /// Current priority level; level 0 is most favorable.
    pub priority: u8,
    /// Set by a voluntary yield, consumed (and reset) by the next aging
    /// pass.
    pub rested: bool,
    pub state: ThreadState,
    /// Saved register state while not running.
    pub trap: TrapFrame,
    /// Mid-exec: excluded from dispatch and not requeued; the exec path
    /// reclaims the block from the parked list.
    pub in_exec: bool,
    space: R,
}

impl<R: Copy> Thread<R> {
    /// Fresh thread, ready at `priority`.
    pub fn new(tid: Tid, name: impl Into<String>, priority: u8, space: R) -> Self {
        debug_assert!(tid != 0, "tid 0 is the none sentinel");
        Self {
            tid,
            name: name.into(),
            priority,
            rested: false,
            state: ThreadState::Ready,
            trap: TrapFrame::zeroed(),
            in_exec: false,
            space,
        }
    }

    #[inline]
    #[must_use]
    pub const fn tid(&self) -> Tid {
        self.tid
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The address-space root dispatch installs.
    #[inline]
    pub const fn space(&self) -> R {
        self.space
    }
}
