//! The bitmap core: one bit per frame, 1 = in use.

use kernel_addresses::{PhysicalAddress, PhysicalFrame, FRAME_SIZE};

/// Upper bound on tracked physical memory: 1 GiB of 4 KiB frames.
pub const MAX_TRACKED_FRAMES: usize = (1024 * 1024 * 1024) / FRAME_SIZE as usize;

const WORDS: usize = MAX_TRACKED_FRAMES / 64;

/// Free/used state of every physical frame, plus the allocation cursor
/// and the counters reporting tools read.
///
/// A plain value: construct once at boot, share behind a lock. Everything
/// here is deterministic and host-testable.
pub struct FrameBitmap {
    /// Bit `f % 64` of `words[f / 64]` is set iff frame `f` is in use.
    words: [u64; WORDS],
    /// Next frame index the search starts from. Persists across calls so
    /// exhausted low memory is not rescanned on every allocation.
    cursor: usize,
    /// Frames tracked (high-water mark of the registered regions).
    total: usize,
    /// Frames currently free. `used + free == total` always.
    free: usize,
}

impl FrameBitmap {
    /// Everything reserved; regions are opened up by
    /// [`add_region`](Self::add_region).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            words: [u64::MAX; WORDS],
            cursor: 0,
            total: 0,
            free: 0,
        }
    }

    #[inline]
    fn is_used(&self, frame: usize) -> bool {
        self.words[frame / 64] & (1 << (frame % 64)) != 0
    }

    #[inline]
    fn set_used(&mut self, frame: usize) {
        self.words[frame / 64] |= 1 << (frame % 64);
    }

    #[inline]
    fn set_free(&mut self, frame: usize) {
        self.words[frame / 64] &= !(1 << (frame % 64));
    }

    /// Mark the frames fully covered by `[base, base + len)` as free.
    ///
    /// Partial frames at the edges stay reserved. Memory beyond the
    /// tracked maximum is ignored.
    pub fn add_region(&mut self, base: PhysicalAddress, len: u64) {
        let first = kernel_addresses::align_up(base.as_u64(), FRAME_SIZE) / FRAME_SIZE;
        let end = kernel_addresses::align_down(base.as_u64() + len, FRAME_SIZE) / FRAME_SIZE;
        let end = (end as usize).min(MAX_TRACKED_FRAMES);
        if end as u64 <= first {
            return;
        }
        for frame in first as usize..end {
            if self.is_used(frame) {
                self.set_free(frame);
                self.free += 1;
            }
        }
        self.total = self.total.max(end);
    }

    /// Re-reserve the frames touching `[base, base + len)` (kernel image,
    /// boot structures). Rounds outward to whole frames.
    pub fn reserve_region(&mut self, base: PhysicalAddress, len: u64) {
        let first = (base.as_u64() / FRAME_SIZE) as usize;
        let end = kernel_addresses::align_up(base.as_u64() + len, FRAME_SIZE) / FRAME_SIZE;
        for frame in first..(end as usize).min(MAX_TRACKED_FRAMES) {
            if !self.is_used(frame) {
                self.set_used(frame);
                self.free -= 1;
            }
        }
    }

    /// Allocate `count` contiguous frames.
    ///
    /// First-fit from the persistent cursor; if that fails, the cursor
    /// resets to zero and the scan runs exactly once more.
    ///
    /// # Panics
    /// When no run of `count` free frames exists — exhaustion is fatal,
    /// nothing above the allocator can continue without memory.
    pub fn alloc(&mut self, count: usize) -> PhysicalFrame {
        self.try_alloc(count).unwrap_or_else(|| {
            panic!(
                "out of physical memory: no run of {count} contiguous frames ({} free of {})",
                self.free, self.total
            )
        })
    }

    /// Fallible variant of [`alloc`](Self::alloc); same search policy.
    pub fn try_alloc(&mut self, count: usize) -> Option<PhysicalFrame> {
        if count == 0 || count > self.total {
            return None;
        }
        let first = match self.scan(self.cursor, count) {
            Some(first) => first,
            None => {
                // One wraparound retry from the start of the region.
                self.cursor = 0;
                self.scan(0, count)?
            }
        };
        for frame in first..first + count {
            self.set_used(frame);
        }
        self.free -= count;
        self.cursor = first + count;
        Some(PhysicalFrame::from_index(first as u64))
    }

    fn scan(&self, from: usize, count: usize) -> Option<usize> {
        let mut run_start = from;
        let mut run_len = 0usize;
        for frame in from..self.total {
            if self.is_used(frame) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = frame;
                }
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            }
        }
        None
    }

    /// Return `count` frames starting at `first`.
    ///
    /// The caller must own every frame in the range; freeing an
    /// unallocated frame is a contract violation (checked in debug
    /// builds, fatal in tests).
    pub fn free(&mut self, first: PhysicalFrame, count: usize) {
        let start = first.index() as usize;
        for frame in start..start + count {
            debug_assert!(
                self.is_used(frame),
                "double free of physical frame {frame}"
            );
            if self.is_used(frame) {
                self.set_free(frame);
                self.free += 1;
            }
        }
    }

    #[inline]
    #[must_use]
    pub const fn total_frames(&self) -> usize {
        self.total
    }

    #[inline]
    #[must_use]
    pub const fn free_frames(&self) -> usize {
        self.free
    }

    #[inline]
    #[must_use]
    pub const fn used_frames(&self) -> usize {
        self.total - self.free
    }
}

impl Default for FrameBitmap {
    fn default() -> Self {
        Self::new()
    }
}
