//! # Address-space backend
//!
//! One generic page-table walker, one portable protection model, and one
//! architecture policy trait with a variant per supported architecture.
//!
//! The hardware differences between x86-64 PML4 paging and AArch64
//! VMSAv8-A paging are confined to [`PageTableSpec`]: how a virtual address
//! is split into table indices, which root table translates it, and how a
//! `(frame, protection, cache policy)` triple is encoded into a 64-bit
//! entry. Everything else — lazy intermediate allocation, leaf rewrites,
//! read-only queries, the destroy walk — is written once in
//! [`AddressSpace`](space::AddressSpace).
//!
//! ## Walk policy
//!
//! Each level index is a fixed shift/mask of the virtual address. On a
//! miss, a read-only walk fails without side effects; a mapping walk
//! installs a fresh zeroed frame with permissive intermediate flags —
//! actual restriction happens only at the leaf.
//!
//! ## Concurrency contract
//!
//! An address space is **single-writer**: concurrent `map`/`unmap` calls
//! against overlapping ranges of the same space must be serialized by the
//! caller. The backend takes no internal page-table locks.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod arch;
mod space;

use core::fmt;
use core::ops::Range;

use kernel_addresses::{PhysicalAddress, PhysicalFrame, VirtualAddress};
use thiserror::Error;

pub use space::AddressSpace;

/// Entries per table at every level, on both supported architectures
/// (4 KiB granule, 9 bits per level).
pub const TABLE_ENTRIES: usize = 512;

bitflags::bitflags! {
    /// Portable page protection set.
    ///
    /// Translated into architecture bits by [`PageTableSpec::leaf`]; this
    /// is the only protection vocabulary the rest of the kernel speaks.
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct Protection: u8 {
        /// Mapping may be read.
        const READ  = 1 << 0;
        /// Mapping may be written.
        const WRITE = 1 << 1;
        /// Mapping may be executed.
        const EXEC  = 1 << 2;
        /// Mapping is reachable from user mode.
        const USER  = 1 << 3;
    }
}

/// Cacheability of a single mapping.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum CachePolicy {
    /// Normal write-back cached memory.
    #[default]
    WriteBack,
    /// Write-through: writes propagate to memory immediately.
    WriteThrough,
    /// Caching disabled.
    Uncached,
}

impl CachePolicy {
    /// Decode a policy arriving over the syscall boundary.
    ///
    /// # Errors
    /// [`VasError::InvalidArgument`] for values no policy corresponds to.
    pub const fn from_raw(raw: u8) -> Result<Self, VasError> {
        match raw {
            0 => Ok(Self::WriteBack),
            1 => Ok(Self::WriteThrough),
            2 => Ok(Self::Uncached),
            _ => Err(VasError::InvalidArgument),
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> u8 {
        match self {
            Self::WriteBack => 0,
            Self::WriteThrough => 1,
            Self::Uncached => 2,
        }
    }
}

/// Errors of the mapping operations.
///
/// The backend reports; it never panics. Out-of-memory here means the
/// frame allocator could not supply an intermediate table frame.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum VasError {
    #[error("no frame available for an intermediate page table")]
    OutOfMemory,
    #[error("invalid protection, cache policy or alignment")]
    InvalidArgument,
    #[error("no mapping exists for the address")]
    NotFound,
}

/// Kind of access a simulated (or faulting) memory reference performs.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

/// An MMU refusal. Not a kernel error — the fault path decides what it
/// means for the offending thread.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Fault {
    /// No leaf translation exists.
    NotMapped,
    /// A leaf exists but its protection forbids the access.
    Protection,
}

/// Converts physical addresses to usable pointers in the current virtual
/// address space (identity map, HHDM, or simulated RAM in tests).
pub trait PhysMapper {
    /// # Safety
    /// - `pa` must be mapped and writable in the current address space for
    ///   the whole of `'a`.
    /// - `T` must match the bytes at `pa`.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// Supplier of 4 KiB frames for page-table storage.
///
/// `alloc_4k` is fallible so `map` can surface [`VasError::OutOfMemory`];
/// `free_4k` receives table frames back from the destroy walk.
pub trait FrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalFrame>;
    fn free_4k(&mut self, frame: PhysicalFrame);
}

/// Local translation-cache invalidation for the executing core.
pub trait TlbInvalidate {
    fn invalidate_page(&self, va: VirtualAddress);
}

/// Local invalidation plus the cross-core shootdown broadcast.
///
/// Implemented by the SMP layer; on a single online core `shootdown` is a
/// no-op.
pub trait TlbMaintenance: TlbInvalidate {
    fn shootdown(&self, va: VirtualAddress);
}

/// Read/install the active root table reference (CR3, TTBR0/TTBR1).
pub trait SpaceSwitch {
    type Root: Copy + Eq + fmt::Debug;

    fn read_current(&self) -> Self::Root;

    /// Install `root` as the active address space.
    ///
    /// # Safety
    /// `root` must name a live, fully-formed table tree whose kernel half
    /// covers the currently executing code and stack.
    unsafe fn switch(&self, root: Self::Root);
}

/// The per-architecture paging policy.
///
/// Implementations are pure bit manipulation plus the root bookkeeping;
/// they contain no walking logic and no hardware access. One impl per
/// architecture: [`arch::x86_64::X64`] and [`arch::aarch64::Arm64`].
pub trait PageTableSpec {
    /// The opaque address-space root value (one or two root frames plus
    /// control flags).
    type Root: Copy + Eq + fmt::Debug;

    /// Raw 64-bit table entry / descriptor.
    type Entry: Copy;

    /// Table levels from root to leaf.
    const LEVELS: usize;

    fn entry_from_raw(raw: u64) -> Self::Entry;
    fn entry_raw(entry: Self::Entry) -> u64;

    /// Index into the table at `depth` (0 = root) for `va`.
    fn index(depth: usize, va: VirtualAddress) -> usize;

    /// The root table frame that translates `va` under `root`.
    fn root_frame(root: Self::Root, va: VirtualAddress) -> PhysicalFrame;

    /// Build a fresh space from the boot space: private half zeroed,
    /// shared kernel half carried over.
    ///
    /// # Errors
    /// [`VasError::OutOfMemory`] if no root frame is available.
    fn new_space<M: PhysMapper, A: FrameAlloc>(
        mapper: &M,
        alloc: &mut A,
        boot: Self::Root,
    ) -> Result<Self::Root, VasError>;

    /// The tree a destroy walk owns exclusively: its root frame and the
    /// root-level slot range to recurse into. Shared kernel tables are
    /// outside this range and are never freed.
    fn private_tree(root: Self::Root) -> (PhysicalFrame, Range<usize>);

    fn is_present(entry: Self::Entry) -> bool;

    /// Entry at `depth` references a next-level table.
    fn is_table(depth: usize, entry: Self::Entry) -> bool;

    fn entry_frame(entry: Self::Entry) -> PhysicalFrame;

    /// Non-leaf entry pointing at `next`. Permissive by design; the leaf
    /// carries the effective restriction.
    fn intermediate(next: PhysicalFrame) -> Self::Entry;

    /// Leaf entry for `frame` with the given protection and cache policy.
    fn leaf(frame: PhysicalFrame, prot: Protection, policy: CachePolicy) -> Self::Entry;

    fn protection(entry: Self::Entry) -> Protection;
    fn cache_policy(entry: Self::Entry) -> CachePolicy;

    /// Rewrite permission bits, keeping frame and cache policy.
    fn with_protection(entry: Self::Entry, prot: Protection) -> Self::Entry;

    /// Rewrite cache-control bits, keeping frame and permissions.
    fn with_cache_policy(entry: Self::Entry, policy: CachePolicy) -> Self::Entry;

    fn is_dirty(entry: Self::Entry) -> bool;
    fn clear_dirty(entry: Self::Entry) -> Self::Entry;

    /// What the hardware walker does on a permitted write.
    fn mark_dirty(entry: Self::Entry) -> Self::Entry;

    /// What the hardware walker does on any permitted access.
    fn mark_accessed(entry: Self::Entry) -> Self::Entry;
}

/// One 4 KiB page table: 512 raw 64-bit entries.
#[repr(C, align(4096))]
pub struct PageTable([u64; TABLE_ENTRIES]);

impl PageTable {
    #[inline]
    pub fn zero(&mut self) {
        self.0 = [0; TABLE_ENTRIES];
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> u64 {
        self.0[index]
    }

    #[inline]
    pub const fn set(&mut self, index: usize, raw: u64) {
        self.0[index] = raw;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_policy_raw_round_trip() {
        for policy in [
            CachePolicy::WriteBack,
            CachePolicy::WriteThrough,
            CachePolicy::Uncached,
        ] {
            assert_eq!(CachePolicy::from_raw(policy.as_raw()), Ok(policy));
        }
        assert_eq!(CachePolicy::from_raw(3), Err(VasError::InvalidArgument));
        assert_eq!(CachePolicy::from_raw(0xFF), Err(VasError::InvalidArgument));
    }

    #[test]
    fn page_table_is_frame_sized() {
        assert_eq!(core::mem::size_of::<PageTable>(), 4096);
        assert_eq!(core::mem::align_of::<PageTable>(), 4096);
    }
}
