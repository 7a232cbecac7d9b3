//! x86-64 4-level (PML4) paging policy.
//!
//! One entry format serves all four levels; the layout is the common
//! superset of PML4E/PDPTE/PDE/PTE as specified by the AMD64 and Intel
//! manuals. Large pages (PS) are not produced by this kernel; an entry
//! with PS set is treated as a walk miss.

use crate::{CachePolicy, FrameAlloc, PageTableSpec, PhysMapper, Protection, VasError};
use bitfield_struct::bitfield;
use core::ops::Range;
use kernel_addresses::{PhysicalFrame, VirtualAddress};

/// Root-level slots of the private (user) half; the upper half is the
/// kernel region shared by every space.
const USER_ROOT_SLOTS: Range<usize> = 0..256;

/// The CR3 image naming an address space: the PML4 root frame.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Cr3(PhysicalFrame);

impl Cr3 {
    #[inline]
    #[must_use]
    pub const fn new(root: PhysicalFrame) -> Self {
        Self(root)
    }

    /// Root value as read from the control register (flag bits masked).
    #[inline]
    #[must_use]
    pub fn from_value(value: u64) -> Self {
        Self(kernel_addresses::PhysicalAddress::new(value & !0xFFF).frame())
    }

    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalFrame {
        self.0
    }

    /// Value to load into CR3.
    #[inline]
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0.base().as_u64()
    }
}

/// Raw x86-64 page-table entry.
#[bitfield(u64)]
pub struct X86Entry {
    /// P: entry is valid.
    pub present: bool,
    /// RW: writes allowed.
    pub writable: bool,
    /// US: user-mode access allowed.
    pub user_access: bool,
    /// PWT: write-through caching.
    pub write_through: bool,
    /// PCD: caching disabled.
    pub cache_disabled: bool,
    /// A: set by the CPU on any access.
    pub accessed: bool,
    /// D: set by the CPU on the first write (leaf only).
    pub dirty: bool,
    /// PS: large-page leaf at PDPT/PD level. Never set by this kernel.
    pub large_page: bool,
    /// G: survives CR3 reloads (leaf only).
    pub global: bool,
    #[bits(3)]
    pub os_low: u8,
    /// Physical frame index (address bits 51:12).
    #[bits(40)]
    frame_index: u64,
    #[bits(7)]
    pub os_high: u8,
    #[bits(4)]
    pub protection_key: u8,
    /// NX: instruction fetches fault.
    pub no_execute: bool,
}

/// The x86-64 paging policy. See [`PageTableSpec`].
pub struct X64;

impl PageTableSpec for X64 {
    type Root = Cr3;
    type Entry = X86Entry;

    const LEVELS: usize = 4;

    #[inline]
    fn entry_from_raw(raw: u64) -> X86Entry {
        X86Entry::from_bits(raw)
    }

    #[inline]
    fn entry_raw(entry: X86Entry) -> u64 {
        entry.into_bits()
    }

    #[inline]
    fn index(depth: usize, va: VirtualAddress) -> usize {
        ((va.as_u64() >> (39 - 9 * depth)) & 0x1FF) as usize
    }

    #[inline]
    fn root_frame(root: Cr3, _va: VirtualAddress) -> PhysicalFrame {
        root.frame()
    }

    fn new_space<M: PhysMapper, A: FrameAlloc>(
        mapper: &M,
        alloc: &mut A,
        boot: Cr3,
    ) -> Result<Cr3, VasError> {
        let root = alloc.alloc_4k().ok_or(VasError::OutOfMemory)?;
        // SAFETY: both frames are live page-table frames under the mapper.
        let table = unsafe { mapper.phys_to_mut::<crate::PageTable>(root.base()) };
        let boot_table = unsafe { mapper.phys_to_mut::<crate::PageTable>(boot.frame().base()) };
        table.zero();
        for slot in USER_ROOT_SLOTS.end..crate::TABLE_ENTRIES {
            table.set(slot, boot_table.get(slot));
        }
        Ok(Cr3::new(root))
    }

    #[inline]
    fn private_tree(root: Cr3) -> (PhysicalFrame, Range<usize>) {
        (root.frame(), USER_ROOT_SLOTS)
    }

    #[inline]
    fn is_present(entry: X86Entry) -> bool {
        entry.present()
    }

    #[inline]
    fn is_table(_depth: usize, entry: X86Entry) -> bool {
        entry.present() && !entry.large_page()
    }

    #[inline]
    fn entry_frame(entry: X86Entry) -> PhysicalFrame {
        PhysicalFrame::from_index(entry.frame_index())
    }

    #[inline]
    fn intermediate(next: PhysicalFrame) -> X86Entry {
        X86Entry::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(true)
            .with_frame_index(next.index())
    }

    fn leaf(frame: PhysicalFrame, prot: Protection, policy: CachePolicy) -> X86Entry {
        let entry = X86Entry::new()
            .with_present(true)
            .with_frame_index(frame.index());
        Self::with_cache_policy(Self::with_protection(entry, prot), policy)
    }

    fn protection(entry: X86Entry) -> Protection {
        let mut prot = Protection::READ;
        if entry.writable() {
            prot |= Protection::WRITE;
        }
        if entry.user_access() {
            prot |= Protection::USER;
        }
        if !entry.no_execute() {
            prot |= Protection::EXEC;
        }
        prot
    }

    fn cache_policy(entry: X86Entry) -> CachePolicy {
        if entry.cache_disabled() {
            CachePolicy::Uncached
        } else if entry.write_through() {
            CachePolicy::WriteThrough
        } else {
            CachePolicy::WriteBack
        }
    }

    fn with_protection(entry: X86Entry, prot: Protection) -> X86Entry {
        entry
            .with_writable(prot.contains(Protection::WRITE))
            .with_user_access(prot.contains(Protection::USER))
            .with_no_execute(!prot.contains(Protection::EXEC))
    }

    fn with_cache_policy(entry: X86Entry, policy: CachePolicy) -> X86Entry {
        entry
            .with_write_through(matches!(policy, CachePolicy::WriteThrough))
            .with_cache_disabled(matches!(policy, CachePolicy::Uncached))
    }

    #[inline]
    fn is_dirty(entry: X86Entry) -> bool {
        entry.dirty()
    }

    #[inline]
    fn clear_dirty(entry: X86Entry) -> X86Entry {
        entry.with_dirty(false)
    }

    #[inline]
    fn mark_dirty(entry: X86Entry) -> X86Entry {
        entry.with_dirty(true)
    }

    #[inline]
    fn mark_accessed(entry: X86Entry) -> X86Entry {
        entry.with_accessed(true)
    }
}

/// CR3 and TLB instruction access for the running CPU.
#[cfg(target_arch = "x86_64")]
pub mod hw {
    use super::Cr3;
    use crate::{SpaceSwitch, TlbInvalidate};
    use kernel_addresses::VirtualAddress;

    /// The active-space register pair of this core.
    #[derive(Default)]
    pub struct HwSpace;

    impl SpaceSwitch for HwSpace {
        type Root = Cr3;

        fn read_current(&self) -> Cr3 {
            let value: u64;
            // SAFETY: reading CR3 at CPL0 has no side effects.
            unsafe {
                core::arch::asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
            }
            Cr3::from_value(value)
        }

        unsafe fn switch(&self, root: Cr3) {
            // SAFETY: per the trait contract the root names a live tree
            // covering the executing code; loading CR3 also flushes
            // non-global TLB entries.
            unsafe {
                core::arch::asm!("mov cr3, {}", in(reg) root.value(), options(nostack, preserves_flags));
            }
        }
    }

    /// Local translation-cache maintenance via `invlpg`.
    #[derive(Default)]
    pub struct LocalTlb;

    impl LocalTlb {
        /// Drop every non-global translation by reloading CR3.
        pub fn invalidate_all(&self) {
            let value: u64;
            // SAFETY: a CR3 round-trip is the architectural full flush.
            unsafe {
                core::arch::asm!("mov {0}, cr3", "mov cr3, {0}", out(reg) value, options(nostack));
            }
            let _ = value;
        }
    }

    impl TlbInvalidate for LocalTlb {
        fn invalidate_page(&self, va: VirtualAddress) {
            // SAFETY: invlpg on any address is harmless.
            unsafe {
                core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_extraction_matches_manual_split() {
        let va = VirtualAddress::new(0xFFFF_8888_0123_4567);
        assert_eq!(X64::index(0, va), ((0xFFFF_8888_0123_4567u64 >> 39) & 0x1FF) as usize);
        assert_eq!(X64::index(3, va), ((0xFFFF_8888_0123_4567u64 >> 12) & 0x1FF) as usize);
        for depth in 0..4 {
            assert!(X64::index(depth, va) < 512);
        }
    }

    #[test]
    fn leaf_encodes_and_decodes_protection() {
        let frame = PhysicalFrame::from_index(0x1234);
        let entry = X64::leaf(
            frame,
            Protection::READ | Protection::WRITE | Protection::USER,
            CachePolicy::Uncached,
        );
        assert!(entry.present());
        assert!(entry.writable());
        assert!(entry.user_access());
        assert!(entry.no_execute());
        assert!(entry.cache_disabled());
        assert_eq!(X64::entry_frame(entry).index(), 0x1234);
        assert_eq!(
            X64::protection(entry),
            Protection::READ | Protection::WRITE | Protection::USER
        );
        assert_eq!(X64::cache_policy(entry), CachePolicy::Uncached);
    }

    #[test]
    fn cr3_value_masks_flags() {
        let cr3 = Cr3::from_value(0x0000_0000_0030_0FFF);
        assert_eq!(cr3.value(), 0x0000_0000_0030_0000);
    }

    #[test]
    fn large_page_entries_stop_the_walk() {
        let entry = X86Entry::new().with_present(true).with_large_page(true);
        assert!(!X64::is_table(1, entry));
    }
}
