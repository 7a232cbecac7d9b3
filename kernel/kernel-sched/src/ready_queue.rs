//! Per-priority FIFO queues with an occupancy bitmap.

use crate::thread::{Thread, ThreadState, Tid};
use crate::PRIORITY_LEVELS;
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_sync::SpinLock;

/// The ready set: one FIFO per priority level, each behind its own lock,
/// plus an atomic bitmap of non-empty levels so the highest one is a
/// `trailing_zeros` away.
///
/// The bitmap is maintained under the corresponding level's lock and may
/// be momentarily stale to outside readers; `pick` re-checks under the
/// lock before trusting it.
pub struct ReadyQueues<R> {
    levels: [SpinLock<VecDeque<Box<Thread<R>>>>; PRIORITY_LEVELS],
    /// Bit `p` set ⟺ `levels[p]` is non-empty.
    occupied: AtomicU32,
}

impl<R: Copy> ReadyQueues<R> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            levels: [const { SpinLock::new(VecDeque::new()) }; PRIORITY_LEVELS],
            occupied: AtomicU32::new(0),
        }
    }

    /// Queue a thread at the tail of its priority level, marking it
    /// Ready. Out-of-range priorities are clamped with a warning.
    pub fn enqueue(&self, mut thread: Box<Thread<R>>) {
        if thread.priority as usize >= PRIORITY_LEVELS {
            log::warn!(
                "thread {} priority {} clamped to {}",
                thread.tid(),
                thread.priority,
                PRIORITY_LEVELS - 1
            );
            thread.priority = (PRIORITY_LEVELS - 1) as u8;
        }
        thread.state = ThreadState::Ready;
        let level = thread.priority as usize;

        let mut queue = self.levels[level].lock();
        debug_assert!(
            !queue.iter().any(|t| t.tid() == thread.tid()),
            "thread {} inserted twice into ready level {level}",
            thread.tid()
        );
        queue.push_back(thread);
        self.occupied.fetch_or(1 << level, Ordering::Release);
    }

    /// Dequeue the first eligible thread of the highest non-empty level:
    /// not exiting, not mid-exec. Exiting entries encountered on the way
    /// are removed into `retired`; mid-exec entries stay in place.
    pub fn pick(&self, retired: &mut Vec<Box<Thread<R>>>) -> Option<Box<Thread<R>>> {
        for level in 0..PRIORITY_LEVELS {
            if self.occupied.load(Ordering::Acquire) & (1 << level) == 0 {
                continue;
            }
            let mut queue = self.levels[level].lock();
            let mut index = 0;
            let mut found = None;
            while index < queue.len() {
                match queue[index].state {
                    ThreadState::Exiting => {
                        let Some(dead) = queue.remove(index) else { break };
                        retired.push(dead);
                    }
                    _ if queue[index].in_exec => index += 1,
                    _ => {
                        found = queue.remove(index);
                        break;
                    }
                }
            }
            if queue.is_empty() {
                self.occupied.fetch_and(!(1 << level), Ordering::Release);
            }
            if found.is_some() {
                return found;
            }
        }
        None
    }

    /// Flag a queued thread for termination. Returns whether it was
    /// found. The block itself is retired by the next `pick` that scans
    /// past it.
    pub fn mark_exiting(&self, tid: Tid) -> bool {
        for level in &self.levels {
            let mut queue = level.lock();
            if let Some(thread) = queue.iter_mut().find(|t| t.tid() == tid) {
                thread.state = ThreadState::Exiting;
                return true;
            }
        }
        false
    }

    /// Priority of a queued thread, if present.
    pub fn priority_of(&self, tid: Tid) -> Option<u8> {
        for level in &self.levels {
            let queue = level.lock();
            if let Some(thread) = queue.iter().find(|t| t.tid() == tid) {
                return Some(thread.priority);
            }
        }
        None
    }

    /// Queued threads across all levels.
    pub fn len(&self) -> usize {
        self.levels.iter().map(|l| l.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied.load(Ordering::Acquire) == 0
    }
}

impl<R: Copy> Default for ReadyQueues<R> {
    fn default() -> Self {
        Self::new()
    }
}
