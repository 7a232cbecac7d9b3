//! Generic table walker over a [`PageTableSpec`].

use crate::{
    AccessKind, CachePolicy, Fault, FrameAlloc, PageTable, PageTableSpec, PhysMapper, Protection,
    TlbMaintenance, VasError,
};
use core::marker::PhantomData;
use kernel_addresses::{PhysicalAddress, PhysicalFrame, VirtualAddress};

/// Handle to a single, concrete address space.
///
/// Holds the root value and the [`PhysMapper`] used to reach table frames;
/// the frame allocator and TLB maintenance are threaded per call, since
/// not every operation needs them.
pub struct AddressSpace<'m, S: PageTableSpec, M: PhysMapper> {
    root: S::Root,
    mapper: &'m M,
    _spec: PhantomData<S>,
}

impl<'m, S: PageTableSpec, M: PhysMapper> AddressSpace<'m, S, M> {
    /// Wrap an existing root (e.g. the boot space, or a value read back
    /// from the translation-base register).
    #[inline]
    pub const fn from_root(mapper: &'m M, root: S::Root) -> Self {
        Self {
            root,
            mapper,
            _spec: PhantomData,
        }
    }

    /// Create a fresh space: shared kernel half carried over from `boot`,
    /// private half empty.
    ///
    /// # Errors
    /// [`VasError::OutOfMemory`] if the allocator cannot supply the root.
    pub fn create<A: FrameAlloc>(
        mapper: &'m M,
        alloc: &mut A,
        boot: S::Root,
    ) -> Result<Self, VasError> {
        let root = S::new_space(mapper, alloc, boot)?;
        Ok(Self::from_root(mapper, root))
    }

    /// The opaque root value (what `switch` installs).
    #[inline]
    pub const fn root(&self) -> S::Root {
        self.root
    }

    fn table(&self, frame: PhysicalFrame) -> &mut PageTable {
        // SAFETY: every frame reachable from the root is a live page-table
        // frame, and the mapper covers all physical memory we manage.
        unsafe { self.mapper.phys_to_mut::<PageTable>(frame.base()) }
    }

    /// Walk to the leaf table without allocating. `None` on any miss, with
    /// no side effects.
    fn leaf_slot(&self, va: VirtualAddress) -> Option<(PhysicalFrame, usize)> {
        let mut frame = S::root_frame(self.root, va);
        for depth in 0..S::LEVELS - 1 {
            let entry = S::entry_from_raw(self.table(frame).get(S::index(depth, va)));
            if !S::is_table(depth, entry) {
                return None;
            }
            frame = S::entry_frame(entry);
        }
        Some((frame, S::index(S::LEVELS - 1, va)))
    }

    /// Walk to the leaf table, installing zeroed intermediate tables on
    /// the way down where absent.
    fn leaf_slot_alloc<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
    ) -> Result<(PhysicalFrame, usize), VasError> {
        let mut frame = S::root_frame(self.root, va);
        for depth in 0..S::LEVELS - 1 {
            let index = S::index(depth, va);
            let table = self.table(frame);
            let entry = S::entry_from_raw(table.get(index));
            frame = if S::is_table(depth, entry) {
                S::entry_frame(entry)
            } else {
                let next = alloc.alloc_4k().ok_or(VasError::OutOfMemory)?;
                self.table(next).zero();
                table.set(index, S::entry_raw(S::intermediate(next)));
                next
            };
        }
        Ok((frame, S::index(S::LEVELS - 1, va)))
    }

    /// Read the leaf entry for `va`, or `NotFound`.
    fn leaf_entry(&self, va: VirtualAddress) -> Result<(PhysicalFrame, usize, S::Entry), VasError> {
        let (frame, index) = self.leaf_slot(va).ok_or(VasError::NotFound)?;
        let entry = S::entry_from_raw(self.table(frame).get(index));
        if S::is_present(entry) {
            Ok((frame, index, entry))
        } else {
            Err(VasError::NotFound)
        }
    }

    /// Map the 4 KiB page at `va` to `frame`.
    ///
    /// An existing leaf is overwritten. The stale local translation is
    /// invalidated before returning; remapping visible to other cores is
    /// the caller's `unmap`-then-`map` sequence.
    ///
    /// # Errors
    /// - [`VasError::InvalidArgument`] if `va` is not page-aligned.
    /// - [`VasError::OutOfMemory`] if an intermediate table cannot be
    ///   allocated.
    pub fn map<A: FrameAlloc, T: TlbMaintenance>(
        &self,
        alloc: &mut A,
        tlb: &T,
        va: VirtualAddress,
        frame: PhysicalFrame,
        prot: Protection,
        policy: CachePolicy,
    ) -> Result<(), VasError> {
        if !va.is_page_aligned() {
            return Err(VasError::InvalidArgument);
        }
        let (leaf_table, index) = self.leaf_slot_alloc(alloc, va)?;
        self.table(leaf_table)
            .set(index, S::entry_raw(S::leaf(frame, prot, policy)));
        tlb.invalidate_page(va);
        Ok(())
    }

    /// Remove the mapping at `va`.
    ///
    /// # Errors
    /// [`VasError::NotFound`] if no leaf exists; the walk has no side
    /// effects in that case.
    pub fn unmap<T: TlbMaintenance>(&self, tlb: &T, va: VirtualAddress) -> Result<(), VasError> {
        let (leaf_table, index, _) = self.leaf_entry(va)?;
        self.table(leaf_table).set(index, 0);
        tlb.invalidate_page(va);
        tlb.shootdown(va);
        Ok(())
    }

    /// Rewrite the permission bits of an existing leaf.
    ///
    /// # Errors
    /// [`VasError::NotFound`] if no leaf exists.
    pub fn protect<T: TlbMaintenance>(
        &self,
        tlb: &T,
        va: VirtualAddress,
        prot: Protection,
    ) -> Result<(), VasError> {
        let (leaf_table, index, entry) = self.leaf_entry(va)?;
        self.table(leaf_table)
            .set(index, S::entry_raw(S::with_protection(entry, prot)));
        tlb.invalidate_page(va);
        tlb.shootdown(va);
        Ok(())
    }

    /// Rewrite the cache-control bits of an existing leaf, leaving the
    /// frame and permissions untouched.
    ///
    /// # Errors
    /// [`VasError::NotFound`] if the leaf does not yet exist.
    pub fn set_cache_policy<T: TlbMaintenance>(
        &self,
        tlb: &T,
        va: VirtualAddress,
        policy: CachePolicy,
    ) -> Result<(), VasError> {
        let (leaf_table, index, entry) = self.leaf_entry(va)?;
        self.table(leaf_table)
            .set(index, S::entry_raw(S::with_cache_policy(entry, policy)));
        tlb.invalidate_page(va);
        tlb.shootdown(va);
        Ok(())
    }

    /// Translate `va` if mapped. Read-only; never allocates.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<(PhysicalAddress, Protection, CachePolicy)> {
        let (_, _, entry) = self.leaf_entry(va).ok()?;
        let pa = S::entry_frame(entry).base() + va.page_offset();
        Some((pa, S::protection(entry), S::cache_policy(entry)))
    }

    /// Check an access the way the hardware walker would, updating the
    /// accessed/dirty bits on success.
    ///
    /// # Errors
    /// [`Fault::NotMapped`] without a leaf; [`Fault::Protection`] when the
    /// leaf forbids the access (write to read-only, execute of
    /// no-execute, user reference to a supervisor page).
    pub fn access(
        &self,
        va: VirtualAddress,
        kind: AccessKind,
        user: bool,
    ) -> Result<PhysicalAddress, Fault> {
        let (leaf_table, index, entry) = self.leaf_entry(va).map_err(|_| Fault::NotMapped)?;
        let prot = S::protection(entry);

        let needed = match kind {
            AccessKind::Read => Protection::READ,
            AccessKind::Write => Protection::WRITE,
            AccessKind::Execute => Protection::EXEC,
        };
        if !prot.contains(needed) || (user && !prot.contains(Protection::USER)) {
            return Err(Fault::Protection);
        }

        let mut entry = S::mark_accessed(entry);
        if kind == AccessKind::Write {
            entry = S::mark_dirty(entry);
        }
        self.table(leaf_table).set(index, S::entry_raw(entry));

        Ok(S::entry_frame(entry).base() + va.page_offset())
    }

    /// Whether the hardware has recorded a write through the mapping.
    ///
    /// # Errors
    /// [`VasError::NotFound`] if no leaf exists.
    pub fn is_dirty(&self, va: VirtualAddress) -> Result<bool, VasError> {
        let (_, _, entry) = self.leaf_entry(va)?;
        Ok(S::is_dirty(entry))
    }

    /// Reset the dirty state. The mapping may be cached on another core,
    /// so this shoots the translation down everywhere.
    ///
    /// # Errors
    /// [`VasError::NotFound`] if no leaf exists.
    pub fn clear_dirty<T: TlbMaintenance>(
        &self,
        tlb: &T,
        va: VirtualAddress,
    ) -> Result<(), VasError> {
        let (leaf_table, index, entry) = self.leaf_entry(va)?;
        self.table(leaf_table)
            .set(index, S::entry_raw(S::clear_dirty(entry)));
        tlb.invalidate_page(va);
        tlb.shootdown(va);
        Ok(())
    }

    /// Tear the space down: every interior table of the private tree and
    /// the private root are returned to the allocator exactly once. Leaf
    /// target frames stay with their owners.
    pub fn destroy<A: FrameAlloc>(self, alloc: &mut A) {
        let (root_frame, slots) = S::private_tree(self.root);
        let freed = self.free_subtree(alloc, root_frame, slots, 0);
        log::trace!("address space destroyed, {freed} table frame(s) freed");
    }

    fn free_subtree<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        frame: PhysicalFrame,
        slots: core::ops::Range<usize>,
        depth: usize,
    ) -> usize {
        let mut freed = 0;
        if depth < S::LEVELS - 1 {
            for index in slots {
                let entry = S::entry_from_raw(self.table(frame).get(index));
                if S::is_table(depth, entry) {
                    freed += self.free_subtree(
                        alloc,
                        S::entry_frame(entry),
                        0..crate::TABLE_ENTRIES,
                        depth + 1,
                    );
                }
            }
        }
        alloc.free_4k(frame);
        freed + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::aarch64::Arm64;
    use crate::arch::x86_64::X64;
    use crate::TlbInvalidate;
    use std::cell::RefCell;
    use std::collections::HashSet;

    /// Simulated physical memory: 4 KiB-aligned frames addressed from 0.
    struct TestPhys {
        frames: Vec<Box<Frame4K>>,
    }

    #[repr(align(4096))]
    struct Frame4K([u8; 4096]);

    impl TestPhys {
        fn with_frames(count: usize) -> Self {
            Self {
                frames: (0..count).map(|_| Box::new(Frame4K([0; 4096]))).collect(),
            }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let frame = (pa.as_u64() >> 12) as usize;
            let offset = (pa.as_u64() & 0xFFF) as usize;
            let base = self.frames[frame].0.as_ptr() as *mut u8;
            // SAFETY: test frames are 4 KiB aligned and live for the test.
            unsafe { &mut *base.add(offset).cast::<T>() }
        }
    }

    /// Hands out the next frame; remembers frees for the destroy tests.
    struct BumpAlloc {
        next: u64,
        end: u64,
        freed: Vec<PhysicalFrame>,
    }

    impl BumpAlloc {
        fn new(frames: u64) -> Self {
            Self {
                next: 0,
                end: frames,
                freed: Vec::new(),
            }
        }

        fn allocated(&self) -> u64 {
            self.next
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn alloc_4k(&mut self) -> Option<PhysicalFrame> {
            if self.next == self.end {
                return None;
            }
            let frame = PhysicalFrame::from_index(self.next);
            self.next += 1;
            Some(frame)
        }

        fn free_4k(&mut self, frame: PhysicalFrame) {
            self.freed.push(frame);
        }
    }

    /// Records invalidations and shootdown broadcasts.
    #[derive(Default)]
    struct SpyTlb {
        invalidated: RefCell<Vec<u64>>,
        shootdowns: RefCell<Vec<u64>>,
    }

    impl TlbInvalidate for SpyTlb {
        fn invalidate_page(&self, va: VirtualAddress) {
            self.invalidated.borrow_mut().push(va.as_u64());
        }
    }

    impl TlbMaintenance for SpyTlb {
        fn shootdown(&self, va: VirtualAddress) {
            self.shootdowns.borrow_mut().push(va.as_u64());
        }
    }

    fn boot_root_x86(phys: &TestPhys, alloc: &mut BumpAlloc) -> <X64 as PageTableSpec>::Root {
        let frame = alloc.alloc_4k().unwrap();
        unsafe { phys.phys_to_mut::<PageTable>(frame.base()) }.zero();
        crate::arch::x86_64::Cr3::new(frame)
    }

    fn boot_root_aarch64(
        phys: &TestPhys,
        alloc: &mut BumpAlloc,
    ) -> <Arm64 as PageTableSpec>::Root {
        let ttbr0 = alloc.alloc_4k().unwrap();
        let ttbr1 = alloc.alloc_4k().unwrap();
        unsafe { phys.phys_to_mut::<PageTable>(ttbr0.base()) }.zero();
        unsafe { phys.phys_to_mut::<PageTable>(ttbr1.base()) }.zero();
        crate::arch::aarch64::TtbrPair::new(ttbr0, ttbr1)
    }

    const USER_VA: u64 = 0x0000_4000_1234_5000;
    const TARGET_PA: u64 = 0x0000_0000_0030_0000;

    fn map_roundtrip_on<S: PageTableSpec>(boot: S::Root, phys: &TestPhys, alloc: &mut BumpAlloc) {
        let tlb = SpyTlb::default();
        let space = AddressSpace::<S, _>::create(phys, alloc, boot).expect("create");

        let va = VirtualAddress::new(USER_VA);
        let frame = PhysicalAddress::new(TARGET_PA).frame();
        space
            .map(
                alloc,
                &tlb,
                va,
                frame,
                Protection::READ | Protection::WRITE | Protection::USER,
                CachePolicy::WriteBack,
            )
            .expect("map");

        let (pa, prot, policy) = space.query(va).expect("mapped");
        assert_eq!(pa.as_u64(), TARGET_PA);
        assert!(prot.contains(Protection::READ | Protection::WRITE | Protection::USER));
        assert!(!prot.contains(Protection::EXEC));
        assert_eq!(policy, CachePolicy::WriteBack);

        // Offsets within the page translate too.
        let (pa, _, _) = space.query(VirtualAddress::new(USER_VA + 0x123)).unwrap();
        assert_eq!(pa.as_u64(), TARGET_PA + 0x123);

        // The local translation was dropped when the leaf was written.
        assert!(tlb.invalidated.borrow().contains(&USER_VA));

        space.unmap(&tlb, va).expect("unmap");
        assert!(space.query(va).is_none());
        assert_eq!(space.unmap(&tlb, va), Err(VasError::NotFound));
        // Unmapping broadcast the shootdown.
        assert!(tlb.shootdowns.borrow().contains(&USER_VA));
    }

    #[test]
    fn map_roundtrip_x86_64() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(64);
        let boot = boot_root_x86(&phys, &mut alloc);
        map_roundtrip_on::<X64>(boot, &phys, &mut alloc);
    }

    #[test]
    fn map_roundtrip_aarch64() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(64);
        let boot = boot_root_aarch64(&phys, &mut alloc);
        map_roundtrip_on::<Arm64>(boot, &phys, &mut alloc);
    }

    fn protection_faults_on<S: PageTableSpec>(
        boot: S::Root,
        phys: &TestPhys,
        alloc: &mut BumpAlloc,
    ) {
        let tlb = SpyTlb::default();
        let space = AddressSpace::<S, _>::create(phys, alloc, boot).unwrap();
        let va = VirtualAddress::new(USER_VA);
        let frame = PhysicalAddress::new(TARGET_PA).frame();

        // Read-only user data: writes and instruction fetches must fault.
        space
            .map(
                alloc,
                &tlb,
                va,
                frame,
                Protection::READ | Protection::USER,
                CachePolicy::WriteBack,
            )
            .unwrap();
        assert!(space.access(va, AccessKind::Read, true).is_ok());
        assert_eq!(
            space.access(va, AccessKind::Write, true),
            Err(Fault::Protection)
        );
        assert_eq!(
            space.access(va, AccessKind::Execute, true),
            Err(Fault::Protection)
        );

        // Writable: the write goes through now.
        space
            .protect(&tlb, va, Protection::READ | Protection::WRITE | Protection::USER)
            .unwrap();
        assert!(space.access(va, AccessKind::Write, true).is_ok());

        // Supervisor-only page: user references fault, kernel ones don't.
        space.protect(&tlb, va, Protection::READ).unwrap();
        assert_eq!(
            space.access(va, AccessKind::Read, true),
            Err(Fault::Protection)
        );
        assert!(space.access(va, AccessKind::Read, false).is_ok());

        // Executable user code.
        space
            .protect(&tlb, va, Protection::READ | Protection::EXEC | Protection::USER)
            .unwrap();
        assert!(space.access(va, AccessKind::Execute, true).is_ok());

        // No mapping at all.
        assert_eq!(
            space.access(VirtualAddress::new(0x9000), AccessKind::Read, false),
            Err(Fault::NotMapped)
        );
    }

    #[test]
    fn protection_faults_x86_64() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(64);
        let boot = boot_root_x86(&phys, &mut alloc);
        protection_faults_on::<X64>(boot, &phys, &mut alloc);
    }

    #[test]
    fn protection_faults_aarch64() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(64);
        let boot = boot_root_aarch64(&phys, &mut alloc);
        protection_faults_on::<Arm64>(boot, &phys, &mut alloc);
    }

    fn dirty_tracking_on<S: PageTableSpec>(boot: S::Root, phys: &TestPhys, alloc: &mut BumpAlloc) {
        let tlb = SpyTlb::default();
        let space = AddressSpace::<S, _>::create(phys, alloc, boot).unwrap();
        let va = VirtualAddress::new(USER_VA);
        let frame = PhysicalAddress::new(TARGET_PA).frame();

        space
            .map(
                alloc,
                &tlb,
                va,
                frame,
                Protection::READ | Protection::WRITE | Protection::USER,
                CachePolicy::WriteBack,
            )
            .unwrap();

        assert_eq!(space.is_dirty(va), Ok(false));

        // Reads don't dirty the page; a write does.
        space.access(va, AccessKind::Read, true).unwrap();
        assert_eq!(space.is_dirty(va), Ok(false));
        space.access(va, AccessKind::Write, true).unwrap();
        assert_eq!(space.is_dirty(va), Ok(true));

        // Clearing resets the state and broadcasts a shootdown.
        let before = tlb.shootdowns.borrow().len();
        space.clear_dirty(&tlb, va).unwrap();
        assert_eq!(space.is_dirty(va), Ok(false));
        assert_eq!(tlb.shootdowns.borrow().len(), before + 1);

        // The next write dirties it again.
        space.access(va, AccessKind::Write, true).unwrap();
        assert_eq!(space.is_dirty(va), Ok(true));

        assert_eq!(
            space.is_dirty(VirtualAddress::new(0x9000)),
            Err(VasError::NotFound)
        );
    }

    #[test]
    fn dirty_tracking_x86_64() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(64);
        let boot = boot_root_x86(&phys, &mut alloc);
        dirty_tracking_on::<X64>(boot, &phys, &mut alloc);
    }

    #[test]
    fn dirty_tracking_aarch64() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(64);
        let boot = boot_root_aarch64(&phys, &mut alloc);
        dirty_tracking_on::<Arm64>(boot, &phys, &mut alloc);
    }

    fn cache_policy_rewrite_on<S: PageTableSpec>(
        boot: S::Root,
        phys: &TestPhys,
        alloc: &mut BumpAlloc,
    ) {
        let tlb = SpyTlb::default();
        let space = AddressSpace::<S, _>::create(phys, alloc, boot).unwrap();
        let va = VirtualAddress::new(USER_VA);
        let frame = PhysicalAddress::new(TARGET_PA).frame();

        // Missing leaf first.
        assert_eq!(
            space.set_cache_policy(&tlb, va, CachePolicy::Uncached),
            Err(VasError::NotFound)
        );

        space
            .map(
                alloc,
                &tlb,
                va,
                frame,
                Protection::READ | Protection::WRITE,
                CachePolicy::WriteBack,
            )
            .unwrap();

        for policy in [
            CachePolicy::Uncached,
            CachePolicy::WriteThrough,
            CachePolicy::WriteBack,
        ] {
            space.set_cache_policy(&tlb, va, policy).unwrap();
            let (pa, prot, got) = space.query(va).unwrap();
            // The frame and permissions survive the rewrite.
            assert_eq!(pa.as_u64(), TARGET_PA);
            assert!(prot.contains(Protection::READ | Protection::WRITE));
            assert_eq!(got, policy);
        }
    }

    #[test]
    fn cache_policy_rewrite_x86_64() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(64);
        let boot = boot_root_x86(&phys, &mut alloc);
        cache_policy_rewrite_on::<X64>(boot, &phys, &mut alloc);
    }

    #[test]
    fn cache_policy_rewrite_aarch64() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(64);
        let boot = boot_root_aarch64(&phys, &mut alloc);
        cache_policy_rewrite_on::<Arm64>(boot, &phys, &mut alloc);
    }

    fn oom_and_alignment_on<S: PageTableSpec>(
        boot: S::Root,
        phys: &TestPhys,
        alloc: &mut BumpAlloc,
    ) {
        let tlb = SpyTlb::default();
        let space = AddressSpace::<S, _>::create(phys, alloc, boot).unwrap();
        let frame = PhysicalAddress::new(TARGET_PA).frame();

        assert_eq!(
            space.map(
                alloc,
                &tlb,
                VirtualAddress::new(USER_VA | 0x123),
                frame,
                Protection::READ,
                CachePolicy::WriteBack,
            ),
            Err(VasError::InvalidArgument)
        );

        // Exhaust the allocator: the walk reports out-of-memory instead of
        // panicking, and read-only queries still see nothing mapped.
        alloc.end = alloc.next;
        assert_eq!(
            space.map(
                alloc,
                &tlb,
                VirtualAddress::new(USER_VA),
                frame,
                Protection::READ,
                CachePolicy::WriteBack,
            ),
            Err(VasError::OutOfMemory)
        );
        assert!(space.query(VirtualAddress::new(USER_VA)).is_none());
    }

    #[test]
    fn oom_and_alignment_x86_64() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(64);
        let boot = boot_root_x86(&phys, &mut alloc);
        oom_and_alignment_on::<X64>(boot, &phys, &mut alloc);
    }

    #[test]
    fn oom_and_alignment_aarch64() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(64);
        let boot = boot_root_aarch64(&phys, &mut alloc);
        oom_and_alignment_on::<Arm64>(boot, &phys, &mut alloc);
    }

    fn destroy_frees_every_table_once_on<S: PageTableSpec>(
        boot: S::Root,
        phys: &TestPhys,
        alloc: &mut BumpAlloc,
    ) {
        let tlb = SpyTlb::default();
        let before_create = alloc.allocated();
        let space = AddressSpace::<S, _>::create(phys, alloc, boot).unwrap();
        let frame = PhysicalAddress::new(TARGET_PA).frame();

        // Two mappings far apart so several intermediate tables exist.
        for va in [0x0000_4000_0000_0000u64, 0x0000_5fff_ffff_f000u64] {
            space
                .map(
                    alloc,
                    &tlb,
                    VirtualAddress::new(va),
                    frame,
                    Protection::READ | Protection::WRITE,
                    CachePolicy::WriteBack,
                )
                .unwrap();
        }

        let table_frames = alloc.allocated() - before_create;
        space.destroy(alloc);

        // Every table allocated for this space came back, exactly once.
        assert_eq!(alloc.freed.len() as u64, table_frames);
        let unique: HashSet<u64> = alloc.freed.iter().map(|f| f.index()).collect();
        assert_eq!(unique.len() as u64, table_frames);
        for f in &alloc.freed {
            assert!(f.index() >= before_create);
        }
    }

    #[test]
    fn destroy_frees_every_table_once_x86_64() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(64);
        let boot = boot_root_x86(&phys, &mut alloc);
        destroy_frees_every_table_once_on::<X64>(boot, &phys, &mut alloc);
    }

    #[test]
    fn destroy_frees_every_table_once_aarch64() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(64);
        let boot = boot_root_aarch64(&phys, &mut alloc);
        destroy_frees_every_table_once_on::<Arm64>(boot, &phys, &mut alloc);
    }

    /// The x86-64 kernel half is carried over by reference: entries 256..512
    /// of a fresh root equal the boot root's.
    #[test]
    fn x86_64_new_space_shares_kernel_half() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(64);
        let tlb = SpyTlb::default();

        let boot = boot_root_x86(&phys, &mut alloc);
        let boot_space = AddressSpace::<X64, _>::from_root(&phys, boot);

        // Put a kernel mapping into the boot space first.
        let kernel_va = VirtualAddress::new(0xFFFF_8000_0000_0000);
        boot_space
            .map(
                &mut alloc,
                &tlb,
                kernel_va,
                PhysicalAddress::new(TARGET_PA).frame(),
                Protection::READ | Protection::WRITE,
                CachePolicy::WriteBack,
            )
            .unwrap();

        let space = AddressSpace::<X64, _>::create(&phys, &mut alloc, boot).unwrap();
        // Kernel mapping visible through the new space, private half empty.
        assert!(space.query(kernel_va).is_some());
        assert!(space.query(VirtualAddress::new(USER_VA)).is_none());
    }

    /// The AArch64 kernel tree is the shared TTBR1; creation reuses it.
    #[test]
    fn aarch64_new_space_shares_ttbr1() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(64);
        let tlb = SpyTlb::default();

        let boot = boot_root_aarch64(&phys, &mut alloc);
        let boot_space = AddressSpace::<Arm64, _>::from_root(&phys, boot);

        let kernel_va = VirtualAddress::new(0xFFFF_0000_8000_0000);
        boot_space
            .map(
                &mut alloc,
                &tlb,
                kernel_va,
                PhysicalAddress::new(TARGET_PA).frame(),
                Protection::READ | Protection::WRITE,
                CachePolicy::WriteBack,
            )
            .unwrap();

        let space = AddressSpace::<Arm64, _>::create(&phys, &mut alloc, boot).unwrap();
        assert_eq!(space.root().ttbr1(), boot.ttbr1());
        assert_ne!(space.root().ttbr0(), boot.ttbr0());
        assert!(space.query(kernel_va).is_some());
        assert!(space.query(VirtualAddress::new(USER_VA)).is_none());
    }
}
