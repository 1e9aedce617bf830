use crate::{AllocList, VspaceError};
use kernel_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualRange, align_up,
};
use kernel_paging::{AddressSpace, FrameSource, Mmu, OutOfFrames, PhysMapper};
use log::debug;

/// Magic value marking a valid allocation header.
const HEADER_MAGIC: u64 = u64::from_le_bytes(*b"VSPALLOC");

/// One page of bookkeeping mapped directly below every allocation's buffer.
///
/// Freeing needs only the user's pointer: round down to the page below and
/// the header names the entire mapped range, slack included.
#[repr(C)]
struct AllocationHeader {
    magic: u64,
    range_start: u64,
    range_length: u64,
}

/// One virtual address space: a page-table tree plus the free list that
/// governs its span.
///
/// ```text
///  allocation layout:  | header page | buffer ................ | slack |
///                                      ^ returned pointer
/// ```
pub struct VSpace<'m, M: PhysMapper> {
    mapper: &'m M,
    aspace: AddressSpace<'m, M>,
    ranges: AllocList<'m, M>,
}

impl<'m, M: PhysMapper> VSpace<'m, M> {
    /// Create a space governing `span`, with a fresh page-table root.
    ///
    /// # Errors
    /// [`VspaceError::OutOfFrames`] if the root or the free list's first pool
    /// frame cannot be allocated.
    ///
    /// # Panics
    /// Panics if `span` is not page-aligned.
    pub fn create<A: FrameSource>(
        mapper: &'m M,
        alloc: &mut A,
        span: VirtualRange,
    ) -> Result<Self, VspaceError> {
        assert!(span.start().is_aligned_to(Size4K::SIZE));
        assert!(span.length() % Size4K::SIZE == 0);

        let aspace = AddressSpace::create(mapper, alloc)?;
        let mut ranges = AllocList::new(mapper);
        ranges.return_range(alloc, span)?;
        debug!("vspace created: root {:?}, span {span:?}", aspace.root());
        Ok(Self {
            mapper,
            aspace,
            ranges,
        })
    }

    /// Wrap an existing page-table root in a space governing `span`.
    ///
    /// Used for the kernel's own space, whose root already carries the
    /// physical map by the time the allocator comes up. `span` must be
    /// entirely unmapped in those tables; the free list starts out owning
    /// all of it.
    ///
    /// # Errors
    /// [`VspaceError::OutOfFrames`] if the free list's first pool frame
    /// cannot be allocated.
    ///
    /// # Panics
    /// Panics if `span` is not page-aligned.
    pub fn adopt_root<A: FrameSource>(
        mapper: &'m M,
        alloc: &mut A,
        root: PhysicalPage<Size4K>,
        span: VirtualRange,
    ) -> Result<Self, VspaceError> {
        assert!(span.start().is_aligned_to(Size4K::SIZE));
        assert!(span.length() % Size4K::SIZE == 0);

        let aspace = AddressSpace::from_root(mapper, root);
        let mut ranges = AllocList::new(mapper);
        ranges.return_range(alloc, span)?;
        debug!("vspace adopted root {root:?}, span {span:?}");
        Ok(Self {
            mapper,
            aspace,
            ranges,
        })
    }

    /// The PML4 root identifying this space (the future CR3 value).
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.aspace.root()
    }

    /// Bytes of the span still allocatable.
    #[inline]
    #[must_use]
    pub const fn free_space(&self) -> u64 {
        self.ranges.free_space()
    }

    /// Translate an address through this space's tables.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.aspace.query(va)
    }

    /// Pages needed to satisfy `size` bytes at `alignment`, worst case,
    /// excluding the header page.
    #[inline]
    #[must_use]
    pub const fn worst_case_size(size: u64, alignment: u64) -> u64 {
        align_up(size + alignment - 1, Size4K::SIZE)
    }

    /// Allocate `size` bytes at `alignment`, backed by fresh zeroed frames.
    /// Returns the buffer start; the page below it holds the header.
    ///
    /// # Errors
    /// [`VspaceError`] if virtual space or physical frames run out.
    ///
    /// # Panics
    /// Panics if `size` is zero or `alignment` is not a power of two within
    /// a page. (Page-aligned buffers make larger alignments unnecessary for
    /// every in-kernel caller; the arithmetic here relies on that.)
    pub fn allocate_size<A: FrameSource, U: Mmu>(
        &mut self,
        alloc: &mut A,
        mmu: &U,
        size: u64,
        alignment: u64,
    ) -> Result<VirtualAddress, VspaceError> {
        assert!(size > 0);
        assert!(alignment.is_power_of_two() && alignment <= Size4K::SIZE);

        let total = Self::worst_case_size(size, alignment) + Size4K::SIZE;
        let range = self.ranges.take_range(alloc, total, Size4K::SIZE)?;
        self.aspace.map_range(alloc, range)?;
        mmu.tables_changed(self.root());

        self.write_header(range);
        // Buffer starts on the page after the header, which satisfies any
        // alignment up to a page.
        Ok(range.start() + Size4K::SIZE)
    }

    /// Free an allocation made by [`Self::allocate_size`], given the pointer
    /// it returned. Frames go back to `alloc`, the range to the free list.
    ///
    /// # Errors
    /// [`OutOfFrames`] if the free list's node pool cannot refill.
    ///
    /// # Panics
    /// Panics if `ptr` does not sit above a valid allocation header.
    pub fn free_size<A: FrameSource, U: Mmu>(
        &mut self,
        alloc: &mut A,
        mmu: &U,
        ptr: VirtualAddress,
    ) -> Result<(), OutOfFrames> {
        let range = self.read_header(ptr);
        self.aspace.unmap_range(alloc, range);
        mmu.tables_changed(self.root());
        self.ranges.return_range(alloc, range)
    }

    /// Map caller-owned `frames` into this space behind a header page.
    /// The header page itself is freshly allocated; the buffer frames stay
    /// owned by the caller (this is the mapping primitive for memory
    /// objects shared between spaces).
    ///
    /// # Errors
    /// [`VspaceError`] if virtual space or physical frames run out.
    pub fn allocate_pages<A: FrameSource, U: Mmu>(
        &mut self,
        alloc: &mut A,
        mmu: &U,
        frames: &[PhysicalPage<Size4K>],
    ) -> Result<VirtualAddress, VspaceError> {
        assert!(!frames.is_empty());
        let total = (frames.len() as u64 + 1) * Size4K::SIZE;
        let range = self.ranges.take_range(alloc, total, Size4K::SIZE)?;

        let header = VirtualRange::new(range.start(), Size4K::SIZE);
        let buffer = range.subtract_prefix(header);
        self.aspace.map_range(alloc, header)?;
        self.aspace.map_range_to(alloc, buffer, frames)?;
        mmu.tables_changed(self.root());

        self.write_header(range);
        Ok(buffer.start())
    }

    /// Undo [`Self::allocate_pages`]: unmap the buffer without freeing the
    /// caller's frames, free the header page, return the range.
    ///
    /// # Errors
    /// [`OutOfFrames`] if the free list's node pool cannot refill.
    ///
    /// # Panics
    /// Panics on a bad header or if the mapped leaves do not match `frames`.
    pub fn free_pages<A: FrameSource, U: Mmu>(
        &mut self,
        alloc: &mut A,
        mmu: &U,
        ptr: VirtualAddress,
        frames: &[PhysicalPage<Size4K>],
    ) -> Result<(), OutOfFrames> {
        let range = self.read_header(ptr);
        assert_eq!(range.length(), (frames.len() as u64 + 1) * Size4K::SIZE);

        let header = VirtualRange::new(range.start(), Size4K::SIZE);
        let buffer = range.subtract_prefix(header);
        self.aspace.unmap_range(alloc, header);
        self.aspace.unmap_range_from(alloc, buffer, frames);
        mmu.tables_changed(self.root());
        self.ranges.return_range(alloc, range)
    }

    /// Alias the whole kernel space into this one by copying the kernel's
    /// PML4 slot 0.
    pub fn share_kernelspace<U: Mmu>(&mut self, mmu: &U, kernel_root: PhysicalPage<Size4K>) {
        self.aspace.share_kernel_slot(kernel_root);
        mmu.tables_changed(self.root());
    }

    /// Remove the kernel alias again; required before teardown so the shared
    /// tables are not freed twice.
    pub fn unshare_kernelspace<U: Mmu>(&mut self, mmu: &U, kernel_root: PhysicalPage<Size4K>) {
        self.aspace.unshare_kernel_slot(kernel_root);
        mmu.tables_changed(self.root());
    }

    /// Free the free-list pool and the entire page-table tree, leaves
    /// included. Every shared mapping (kernel slot, memory objects) must be
    /// gone already.
    pub fn teardown<A: FrameSource>(mut self, alloc: &mut A) {
        debug!("vspace teardown: root {:?}", self.root());
        self.ranges.teardown(alloc);
        self.aspace.free_page_tables(alloc);
    }

    fn write_header(&mut self, range: VirtualRange) {
        let pa = self
            .aspace
            .query(range.start())
            .expect("header page was just mapped");
        // Safety: the header page is exclusively ours until the matching
        // free, and `AllocationHeader` fits any fresh page.
        let h: &mut AllocationHeader = unsafe { self.mapper.phys_to_mut(pa) };
        h.magic = HEADER_MAGIC;
        h.range_start = range.start().as_u64();
        h.range_length = range.length();
    }

    fn read_header(&mut self, ptr: VirtualAddress) -> VirtualRange {
        let header_va = VirtualAddress::new(ptr.page::<Size4K>().base().as_u64() - Size4K::SIZE);
        let pa = self
            .aspace
            .query(header_va)
            .expect("no allocation header below pointer (bad or double free)");
        let h: &mut AllocationHeader = unsafe { self.mapper.phys_to_mut(pa) };
        assert_eq!(h.magic, HEADER_MAGIC, "allocation header corrupt");
        let range = VirtualRange::new(VirtualAddress::new(h.range_start), h.range_length);
        assert_eq!(header_va, range.start());
        assert!(range.contains(ptr));
        // Invalidate so a stale pointer cannot resurrect the allocation.
        h.magic = 0;
        range
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_layout::kernel_vspace_range;
    use kernel_paging::sim::{SimFrames, SimMmu, SimRam};

    fn fixture(frames: usize) -> (SimRam, SimFrames) {
        let ram = SimRam::with_frames(frames);
        let pool = SimFrames::new(&ram, frames as u64);
        (ram, pool)
    }

    #[test]
    fn allocate_maps_and_free_returns_everything() {
        let (ram, mut pool) = fixture(64);
        let mut vspace = VSpace::create(&ram, &mut pool, kernel_vspace_range()).unwrap();
        let mmu = SimMmu::new(vspace.root());
        let baseline_frames = pool.allocated();
        let baseline_space = vspace.free_space();

        let ptr = vspace.allocate_size(&mut pool, &mmu, 2 * 4096, 8).unwrap();
        assert!(ptr.is_aligned_to(4096));
        // Header + worst_case(8192, 8) pages are mapped and writable.
        assert!(vspace.query(ptr).is_some());
        assert!(vspace.query(ptr + 4096).is_some());
        assert_eq!(
            vspace.free_space(),
            baseline_space - VSpace::<SimRam>::worst_case_size(2 * 4096, 8) - 4096
        );

        vspace.free_size(&mut pool, &mmu, ptr).unwrap();
        assert_eq!(vspace.free_space(), baseline_space);
        // Leaves and interior tables all came back.
        assert_eq!(pool.allocated(), baseline_frames);
        assert!(vspace.query(ptr).is_none());
    }

    #[test]
    fn pointers_satisfy_alignment_and_headers_cover_the_request() {
        let (ram, mut pool) = fixture(64);
        let mut vspace = VSpace::create(&ram, &mut pool, kernel_vspace_range()).unwrap();
        let mmu = SimMmu::new(vspace.root());

        for (size, align) in [(100u64, 64u64), (4097, 256), (3 * 4096, 1)] {
            let ptr = vspace.allocate_size(&mut pool, &mmu, size, align).unwrap();
            assert_eq!(ptr.as_u64() % align, 0);
            // The mapped range recovered on free covers the whole request:
            // every byte of it is translatable.
            assert!(vspace.query(ptr).is_some());
            assert!(vspace.query(ptr + (size - 1)).is_some());
            vspace.free_size(&mut pool, &mmu, ptr).unwrap();
        }
    }

    #[test]
    fn structural_changes_flush_the_active_root() {
        let (ram, mut pool) = fixture(64);
        let mut vspace = VSpace::create(&ram, &mut pool, kernel_vspace_range()).unwrap();
        let mmu = SimMmu::new(vspace.root());

        let before = mmu.invalidations();
        let ptr = vspace.allocate_size(&mut pool, &mmu, 4096, 1).unwrap();
        assert!(mmu.invalidations() > before);

        let before = mmu.invalidations();
        vspace.free_size(&mut pool, &mmu, ptr).unwrap();
        assert!(mmu.invalidations() > before);
    }

    #[test]
    #[should_panic(expected = "alignment.is_power_of_two() && alignment <= Size4K::SIZE")]
    fn alignments_beyond_a_page_are_rejected() {
        let (ram, mut pool) = fixture(64);
        let mut vspace = VSpace::create(&ram, &mut pool, kernel_vspace_range()).unwrap();
        let mmu = SimMmu::new(vspace.root());
        let _ = vspace.allocate_size(&mut pool, &mmu, 100, 8192);
    }

    #[test]
    #[should_panic(expected = "bad or double free")]
    fn double_free_is_fatal() {
        let (ram, mut pool) = fixture(64);
        let mut vspace = VSpace::create(&ram, &mut pool, kernel_vspace_range()).unwrap();
        let mmu = SimMmu::new(vspace.root());

        let ptr = vspace.allocate_size(&mut pool, &mmu, 4096, 1).unwrap();
        vspace.free_size(&mut pool, &mmu, ptr).unwrap();
        let _ = vspace.free_size(&mut pool, &mmu, ptr);
    }

    #[test]
    fn supplied_frames_survive_their_mapping() {
        let (ram, mut pool) = fixture(64);
        let mut vspace = VSpace::create(&ram, &mut pool, kernel_vspace_range()).unwrap();
        let mmu = SimMmu::new(vspace.root());

        let frames = [pool.alloc_4k().unwrap(), pool.alloc_4k().unwrap()];
        let ptr = vspace.allocate_pages(&mut pool, &mmu, &frames).unwrap();
        assert_eq!(vspace.query(ptr), Some(frames[0].base()));
        assert_eq!(vspace.query(ptr + 4096), Some(frames[1].base()));

        let held = pool.allocated();
        vspace.free_pages(&mut pool, &mmu, ptr, &frames).unwrap();
        assert!(vspace.query(ptr).is_none());
        // Header page, PT, PD, PDPT freed; the two buffer frames are still
        // out because the caller owns them.
        assert_eq!(pool.allocated(), held - 4);
        pool.free_4k(frames[0]);
        pool.free_4k(frames[1]);
    }

    #[test]
    fn kernel_slot_sharing_exposes_kernel_mappings() {
        let (ram, mut pool) = fixture(64);
        let mut kernel = VSpace::create(&ram, &mut pool, kernel_vspace_range()).unwrap();
        let mmu = SimMmu::new(kernel.root());
        let kptr = kernel.allocate_size(&mut pool, &mmu, 4096, 1).unwrap();

        let mut user = VSpace::create(
            &ram,
            &mut pool,
            kernel_layout::user_vspace_range(),
        )
        .unwrap();
        user.share_kernelspace(&mmu, kernel.root());
        assert_eq!(user.query(kptr), kernel.query(kptr));

        user.unshare_kernelspace(&mmu, kernel.root());
        assert!(user.query(kptr).is_none());
        assert!(kernel.query(kptr).is_some());

        let baseline = pool.allocated();
        user.teardown(&mut pool);
        // User space held only its root plus one free-list pool frame.
        assert_eq!(pool.allocated(), baseline - 2);
    }

    #[test]
    fn teardown_reclaims_a_space_with_live_allocations() {
        let (ram, mut pool) = fixture(64);
        let before = pool.allocated();
        let mut vspace = VSpace::create(&ram, &mut pool, kernel_vspace_range()).unwrap();
        let mmu = SimMmu::new(vspace.root());
        let _a = vspace.allocate_size(&mut pool, &mmu, 3 * 4096, 1).unwrap();
        let _b = vspace.allocate_size(&mut pool, &mmu, 4096, 1).unwrap();

        vspace.teardown(&mut pool);
        assert_eq!(pool.allocated(), before);
    }
}
