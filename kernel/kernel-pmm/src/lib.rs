//! # Physical frame allocator
//!
//! A bitmap over 4 KiB frames, populated from the platform memory map at
//! boot. [`FrameBitmap`] is the pure, lock-free core (one bit per frame,
//! 1 = in use); [`FrameAllocator`] wraps it in a spin lock, zeroes frames
//! on the way out, and speaks the address-space backend's
//! [`FrameAlloc`](kernel_vas::FrameAlloc) trait for page-table storage.
//!
//! Exhaustion through [`FrameBitmap::alloc`] is fatal: the kernel has no
//! reclaim path, so nothing above the allocator can safely continue
//! without memory. Callers that *can* degrade (the table walker) use
//! [`FrameBitmap::try_alloc`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod bitmap;

pub use bitmap::{FrameBitmap, MAX_TRACKED_FRAMES};

use kernel_addresses::{PhysicalAddress, PhysicalFrame, FRAME_SIZE};
use kernel_sync::SpinLock;
use kernel_vas::{FrameAlloc, PhysMapper};

/// One entry of the platform memory map handed to [`FrameAllocator::new`].
#[derive(Copy, Clone, Debug)]
pub struct MemoryRegion {
    pub base: PhysicalAddress,
    pub len: u64,
    /// Conventional RAM, free for allocation.
    pub usable: bool,
}

/// The kernel-facing allocator: locked bitmap plus frame zeroing.
pub struct FrameAllocator<'m, M: PhysMapper> {
    inner: SpinLock<FrameBitmap>,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> FrameAllocator<'m, M> {
    /// Build the allocator from the platform memory map. Usable regions
    /// become free; everything else stays reserved.
    pub fn new(mapper: &'m M, regions: &[MemoryRegion]) -> Self {
        let mut bitmap = FrameBitmap::new();
        for region in regions {
            if region.usable {
                bitmap.add_region(region.base, region.len);
            }
        }
        log::info!(
            "physical memory: {} frames total, {} free ({} MiB)",
            bitmap.total_frames(),
            bitmap.free_frames(),
            bitmap.free_frames() as u64 * FRAME_SIZE / (1024 * 1024),
        );
        Self {
            inner: SpinLock::new(bitmap),
            mapper,
        }
    }

    /// Carve a reserved range (kernel image, boot structures) out of the
    /// usable pool. Boot-time only.
    pub fn reserve(&self, base: PhysicalAddress, len: u64) {
        self.inner.lock().reserve_region(base, len);
    }

    /// Allocate `count` contiguous frames, zeroed.
    ///
    /// # Panics
    /// On exhaustion, like [`FrameBitmap::alloc`].
    pub fn alloc_zeroed(&self, count: usize) -> PhysicalFrame {
        let first = self.inner.lock().alloc(count);
        self.zero_frames(first, count);
        first
    }

    /// Fallible variant of [`alloc_zeroed`](Self::alloc_zeroed).
    pub fn try_alloc_zeroed(&self, count: usize) -> Option<PhysicalFrame> {
        let first = self.inner.lock().try_alloc(count)?;
        self.zero_frames(first, count);
        Some(first)
    }

    /// Return `count` frames starting at `first` to the pool.
    ///
    /// The caller must own every frame in the range.
    pub fn free(&self, first: PhysicalFrame, count: usize) {
        self.inner.lock().free(first, count);
    }

    pub fn total_frames(&self) -> usize {
        self.inner.lock().total_frames()
    }

    pub fn free_frames(&self) -> usize {
        self.inner.lock().free_frames()
    }

    pub fn used_frames(&self) -> usize {
        self.inner.lock().used_frames()
    }

    fn zero_frames(&self, first: PhysicalFrame, count: usize) {
        for i in 0..count {
            let frame = first.step(i as u64);
            // SAFETY: the frame was just allocated and is covered by the
            // direct map; nobody else references it yet.
            let bytes = unsafe { self.mapper.phys_to_mut::<[u8; FRAME_SIZE as usize]>(frame.base()) };
            bytes.fill(0);
        }
    }
}

/// Page-table storage for the address-space backend. Shared references
/// suffice; the internal lock serializes.
impl<M: PhysMapper> FrameAlloc for &FrameAllocator<'_, M> {
    fn alloc_4k(&mut self) -> Option<PhysicalFrame> {
        self.try_alloc_zeroed(1)
    }

    fn free_4k(&mut self, frame: PhysicalFrame) {
        self.free(frame, 1);
    }
}
