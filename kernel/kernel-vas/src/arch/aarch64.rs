//! AArch64 VMSAv8-A paging policy (4 KiB granule, 48-bit addresses).
//!
//! A space is named by a TTBR0/TTBR1 pair: TTBR0 roots the private user
//! half, TTBR1 the kernel tree shared by every space. Cacheability is
//! indirect through MAIR attribute indices; dirty tracking uses the
//! hardware DBM scheme, where a writable-clean page sits with AP[2] set
//! until the first write clears it.

use crate::{CachePolicy, FrameAlloc, PageTableSpec, PhysMapper, Protection, VasError};
use bitfield_struct::bitfield;
use core::ops::Range;
use kernel_addresses::{PhysicalFrame, VirtualAddress};

/// MAIR_EL1 attribute indices referenced by descriptors.
pub const MAIR_IDX_DEVICE: u8 = 0;
pub const MAIR_IDX_NORMAL_NC: u8 = 1;
pub const MAIR_IDX_NORMAL_WB: u8 = 2;
pub const MAIR_IDX_NORMAL_WT: u8 = 3;

/// MAIR_EL1 image matching the indices above.
///
/// - Attr0 `0x00`: Device-nGnRnE (strongly-ordered MMIO)
/// - Attr1 `0x44`: Normal Non-Cacheable
/// - Attr2 `0xFF`: Normal Write-Back, RW-allocate
/// - Attr3 `0xBB`: Normal Write-Through, RW-allocate
pub const MAIR_VALUE: u64 = 0x00 | (0x44 << 8) | (0xFF << 16) | (0xBB << 24);

/// The translation-base pair naming an address space.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct TtbrPair {
    ttbr0: PhysicalFrame,
    ttbr1: PhysicalFrame,
}

impl TtbrPair {
    #[inline]
    #[must_use]
    pub const fn new(ttbr0: PhysicalFrame, ttbr1: PhysicalFrame) -> Self {
        Self { ttbr0, ttbr1 }
    }

    /// Root of the private user tree.
    #[inline]
    #[must_use]
    pub const fn ttbr0(self) -> PhysicalFrame {
        self.ttbr0
    }

    /// Root of the shared kernel tree.
    #[inline]
    #[must_use]
    pub const fn ttbr1(self) -> PhysicalFrame {
        self.ttbr1
    }
}

/// Raw VMSAv8-A translation descriptor (table at L0-L2, page at L3).
#[bitfield(u64)]
pub struct Arm64Descriptor {
    /// Descriptor is valid.
    pub valid: bool,
    /// Next-level table (L0-L2) or page (L3); clear means block/invalid.
    pub table_or_page: bool,
    /// MAIR attribute index (leaf only).
    #[bits(3)]
    pub attr_index: u8,
    /// NS: non-secure output address.
    pub non_secure: bool,
    /// AP[1]: EL0 access allowed.
    pub el0_access: bool,
    /// AP[2]: write-protected. With DBM set, cleared by hardware on the
    /// first write — the dirty signal.
    pub read_only: bool,
    /// SH[1:0]: shareability domain.
    #[bits(2)]
    pub shareability: u8,
    /// AF: access flag; a reference with AF clear faults.
    pub access_flag: bool,
    /// nG: translation is per-ASID.
    pub not_global: bool,
    /// Output frame index (address bits 47:12).
    #[bits(36)]
    frame_index: u64,
    #[bits(3)]
    pub res0: u8,
    /// DBM: hardware dirty-state management enabled.
    pub dirty_bit_modifier: bool,
    /// Part of a contiguous run hint.
    pub contiguous: bool,
    /// PXN: no execution at EL1.
    pub privileged_no_exec: bool,
    /// UXN: no execution at EL0.
    pub user_no_exec: bool,
    #[bits(9)]
    pub software: u16,
}

/// Inner Shareable, the domain all normal memory lives in.
const SH_INNER: u8 = 0b11;

/// The AArch64 paging policy. See [`PageTableSpec`].
pub struct Arm64;

impl Arm64 {
    fn attr_for(policy: CachePolicy) -> u8 {
        match policy {
            CachePolicy::WriteBack => MAIR_IDX_NORMAL_WB,
            CachePolicy::WriteThrough => MAIR_IDX_NORMAL_WT,
            CachePolicy::Uncached => MAIR_IDX_NORMAL_NC,
        }
    }
}

impl PageTableSpec for Arm64 {
    type Root = TtbrPair;
    type Entry = Arm64Descriptor;

    const LEVELS: usize = 4;

    #[inline]
    fn entry_from_raw(raw: u64) -> Arm64Descriptor {
        Arm64Descriptor::from_bits(raw)
    }

    #[inline]
    fn entry_raw(entry: Arm64Descriptor) -> u64 {
        entry.into_bits()
    }

    #[inline]
    fn index(depth: usize, va: VirtualAddress) -> usize {
        ((va.as_u64() >> (39 - 9 * depth)) & 0x1FF) as usize
    }

    #[inline]
    fn root_frame(root: TtbrPair, va: VirtualAddress) -> PhysicalFrame {
        // Kernel half (VA[63:48] all ones) translates through TTBR1.
        if va.as_u64() >> 48 == 0xFFFF {
            root.ttbr1
        } else {
            root.ttbr0
        }
    }

    fn new_space<M: PhysMapper, A: FrameAlloc>(
        mapper: &M,
        alloc: &mut A,
        boot: TtbrPair,
    ) -> Result<TtbrPair, VasError> {
        let ttbr0 = alloc.alloc_4k().ok_or(VasError::OutOfMemory)?;
        // SAFETY: a freshly allocated table frame under the mapper.
        unsafe { mapper.phys_to_mut::<crate::PageTable>(ttbr0.base()) }.zero();
        // The kernel tree is shared by reference, never copied.
        Ok(TtbrPair::new(ttbr0, boot.ttbr1))
    }

    #[inline]
    fn private_tree(root: TtbrPair) -> (PhysicalFrame, Range<usize>) {
        (root.ttbr0, 0..crate::TABLE_ENTRIES)
    }

    #[inline]
    fn is_present(entry: Arm64Descriptor) -> bool {
        entry.valid() && entry.table_or_page()
    }

    #[inline]
    fn is_table(_depth: usize, entry: Arm64Descriptor) -> bool {
        // A block descriptor (bit 1 clear) ends the walk; this kernel
        // never writes blocks, so it reads as a miss.
        entry.valid() && entry.table_or_page()
    }

    #[inline]
    fn entry_frame(entry: Arm64Descriptor) -> PhysicalFrame {
        PhysicalFrame::from_index(entry.frame_index())
    }

    #[inline]
    fn intermediate(next: PhysicalFrame) -> Arm64Descriptor {
        Arm64Descriptor::new()
            .with_valid(true)
            .with_table_or_page(true)
            .with_frame_index(next.index())
    }

    fn leaf(frame: PhysicalFrame, prot: Protection, policy: CachePolicy) -> Arm64Descriptor {
        let entry = Arm64Descriptor::new()
            .with_valid(true)
            .with_table_or_page(true)
            .with_attr_index(Self::attr_for(policy))
            .with_shareability(SH_INNER)
            .with_access_flag(true)
            .with_frame_index(frame.index());
        Self::with_protection(entry, prot)
    }

    fn protection(entry: Arm64Descriptor) -> Protection {
        let mut prot = Protection::READ;
        // Logical writability is DBM: writable-clean pages still carry
        // AP[2] until the first write.
        if entry.dirty_bit_modifier() {
            prot |= Protection::WRITE;
        }
        if entry.el0_access() {
            prot |= Protection::USER;
            if !entry.user_no_exec() {
                prot |= Protection::EXEC;
            }
        } else if !entry.privileged_no_exec() {
            prot |= Protection::EXEC;
        }
        prot
    }

    fn cache_policy(entry: Arm64Descriptor) -> CachePolicy {
        match entry.attr_index() {
            MAIR_IDX_NORMAL_WB => CachePolicy::WriteBack,
            MAIR_IDX_NORMAL_WT => CachePolicy::WriteThrough,
            _ => CachePolicy::Uncached,
        }
    }

    fn with_protection(entry: Arm64Descriptor, prot: Protection) -> Arm64Descriptor {
        let user = prot.contains(Protection::USER);
        let exec = prot.contains(Protection::EXEC);
        let write = prot.contains(Protection::WRITE);
        entry
            .with_el0_access(user)
            .with_not_global(user)
            // Writable pages start clean: AP[2] set, DBM armed.
            .with_read_only(true)
            .with_dirty_bit_modifier(write)
            .with_user_no_exec(!(exec && user))
            .with_privileged_no_exec(!(exec && !user))
    }

    fn with_cache_policy(entry: Arm64Descriptor, policy: CachePolicy) -> Arm64Descriptor {
        entry.with_attr_index(Self::attr_for(policy))
    }

    #[inline]
    fn is_dirty(entry: Arm64Descriptor) -> bool {
        entry.dirty_bit_modifier() && !entry.read_only()
    }

    #[inline]
    fn clear_dirty(entry: Arm64Descriptor) -> Arm64Descriptor {
        // Re-arm: write-protect until hardware clears AP[2] again.
        entry.with_read_only(true)
    }

    #[inline]
    fn mark_dirty(entry: Arm64Descriptor) -> Arm64Descriptor {
        if entry.dirty_bit_modifier() {
            entry.with_read_only(false)
        } else {
            entry
        }
    }

    #[inline]
    fn mark_accessed(entry: Arm64Descriptor) -> Arm64Descriptor {
        entry.with_access_flag(true)
    }
}

/// TTBR and TLB instruction access for the running core.
#[cfg(target_arch = "aarch64")]
pub mod hw {
    use super::TtbrPair;
    use crate::{SpaceSwitch, TlbInvalidate};
    use kernel_addresses::{PhysicalAddress, VirtualAddress};

    /// The translation-base registers of this core.
    #[derive(Default)]
    pub struct HwSpace;

    impl SpaceSwitch for HwSpace {
        type Root = TtbrPair;

        fn read_current(&self) -> TtbrPair {
            let (ttbr0, ttbr1): (u64, u64);
            // SAFETY: reading translation-base registers at EL1.
            unsafe {
                core::arch::asm!(
                    "mrs {}, ttbr0_el1",
                    "mrs {}, ttbr1_el1",
                    out(reg) ttbr0,
                    out(reg) ttbr1,
                    options(nomem, nostack),
                );
            }
            TtbrPair::new(
                PhysicalAddress::new(ttbr0 & !0xFFF).frame(),
                PhysicalAddress::new(ttbr1 & !0xFFF).frame(),
            )
        }

        unsafe fn switch(&self, root: TtbrPair) {
            // Only the private tree changes hands; TTBR1 is the shared
            // kernel tree and stays put.
            // SAFETY: per the trait contract the root names a live tree.
            unsafe {
                core::arch::asm!(
                    "msr ttbr0_el1, {}",
                    "isb",
                    in(reg) root.ttbr0().base().as_u64(),
                    options(nostack),
                );
            }
        }
    }

    /// Local translation-cache maintenance via `tlbi`.
    #[derive(Default)]
    pub struct LocalTlb;

    impl LocalTlb {
        /// Invalidate every translation of this core (all ASIDs).
        pub fn invalidate_all(&self) {
            // SAFETY: TLB maintenance has no memory side effects.
            unsafe {
                core::arch::asm!("tlbi vmalle1is", "dsb ish", "isb", options(nostack));
            }
        }
    }

    impl TlbInvalidate for LocalTlb {
        fn invalidate_page(&self, va: VirtualAddress) {
            // SAFETY: TLB maintenance has no memory side effects.
            unsafe {
                core::arch::asm!(
                    "tlbi vale1is, {}",
                    "dsb ish",
                    "isb",
                    in(reg) va.as_u64() >> 12,
                    options(nostack),
                );
            }
        }
    }
}
