use crate::{FrameSource, OutOfFrames, PageFlags, PageTableEntry, PhysMapper, get_table};
use kernel_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualRange};
use log::{debug, trace};

/// Where the leaf frames of a mapping operation come from.
enum LeafFrames<'p> {
    /// Allocate a fresh zero-filled frame per page.
    Fresh,
    /// Consume caller-supplied frames, in order.
    Supplied(&'p [PhysicalPage<Size4K>]),
}

/// What to do with leaf frames during unmap.
enum LeafDisposal<'p> {
    /// Return each leaf frame to the allocator.
    Free,
    /// Leaf frames stay owned by the caller; each present leaf must match the
    /// supplied frame at the same position, in order.
    Retain(&'p [PhysicalPage<Size4K>]),
}

/// One 4-level page-table tree, addressed by its PML4 root.
///
/// All table access goes through the injected [`PhysMapper`], so the same
/// code drives real hardware tables and the simulated RAM used in tests.
///
/// Structural invariants enforced here:
/// - mapping over an already-present leaf is a fatal error (a double map
///   means the virtual-range allocator above is corrupted);
/// - unmapping asserts every level is present;
/// - interior tables that become empty during unmap are freed **bottom-up in
///   the same iteration step**, never batched, so sibling mappings elsewhere
///   in a table are never exposed to a stale parent entry.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalPage<Size4K>,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Wrap an existing PML4 root.
    pub const fn from_root(mapper: &'m M, root: PhysicalPage<Size4K>) -> Self {
        Self { root, mapper }
    }

    /// Allocate and zero a fresh PML4, returning the space rooted at it.
    ///
    /// # Errors
    /// [`OutOfFrames`] if no frame is available for the root.
    pub fn create<A: FrameSource>(mapper: &'m M, alloc: &mut A) -> Result<Self, OutOfFrames> {
        let root = alloc.alloc_4k()?;
        Ok(Self { root, mapper })
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    /// Map every 4 KiB page of `range` to a freshly allocated physical frame,
    /// present and writable, creating interior tables as needed.
    ///
    /// # Errors
    /// [`OutOfFrames`] if a leaf or interior table cannot be allocated.
    ///
    /// # Panics
    /// Panics if any leaf entry in `range` is already present.
    pub fn map_range<A: FrameSource>(
        &mut self,
        alloc: &mut A,
        range: VirtualRange,
    ) -> Result<(), OutOfFrames> {
        debug!("map_range {range:?} (fresh frames)");
        self.map_range_impl(alloc, range, &LeafFrames::Fresh)
    }

    /// Map every 4 KiB page of `range` to the caller-supplied `frames`, in
    /// order. Interior tables are still allocated from `alloc`. Ownership of
    /// the leaf frames stays with the caller; this is how one set of frames
    /// (a `VObject`) appears in a second address space.
    ///
    /// # Errors
    /// [`OutOfFrames`] if an interior table cannot be allocated.
    ///
    /// # Panics
    /// Panics if a leaf is already present or if `frames.len()` does not
    /// equal the page count of `range`.
    pub fn map_range_to<A: FrameSource>(
        &mut self,
        alloc: &mut A,
        range: VirtualRange,
        frames: &[PhysicalPage<Size4K>],
    ) -> Result<(), OutOfFrames> {
        debug!("map_range {range:?} ({} supplied frames)", frames.len());
        assert_eq!(frames.len() as u64, range.page_count());
        self.map_range_impl(alloc, range, &LeafFrames::Supplied(frames))
    }

    fn map_range_impl<A: FrameSource>(
        &mut self,
        alloc: &mut A,
        range: VirtualRange,
        leaves: &LeafFrames<'_>,
    ) -> Result<(), OutOfFrames> {
        assert!(range.start().is_aligned_to(4096));
        assert!(range.one_past_end().is_aligned_to(4096));

        for (i, page) in range.pages().enumerate() {
            let va = page.base();
            trace!("  map {va}");

            let pml4 = unsafe { get_table(self.mapper, self.root) };
            let pdpt_frame = descend_or_create(pml4, va.pml4_index(), alloc)?;

            let pdpt = unsafe { get_table(self.mapper, pdpt_frame) };
            let pd_frame = descend_or_create(pdpt, va.pdpt_index(), alloc)?;

            let pd = unsafe { get_table(self.mapper, pd_frame) };
            let pt_frame = descend_or_create(pd, va.pd_index(), alloc)?;

            let pt = unsafe { get_table(self.mapper, pt_frame) };
            let pte = pt.entry(va.pt_index());
            // A present leaf here means the same page was handed out twice;
            // the virtual-range allocator above is corrupted.
            assert!(!pte.present(), "double mapping at {va}");

            let frame = match leaves {
                LeafFrames::Fresh => alloc.alloc_4k()?,
                LeafFrames::Supplied(frames) => frames[i],
            };
            pt.set_entry(va.pt_index(), PageTableEntry::leaf_4k(frame, PageFlags::WRITABLE));
        }
        Ok(())
    }

    /// Unmap every 4 KiB page of `range`, returning the leaf frames to
    /// `alloc` and reclaiming interior tables that become empty.
    ///
    /// # Panics
    /// Panics if any level on the path is not present.
    pub fn unmap_range<A: FrameSource>(&mut self, alloc: &mut A, range: VirtualRange) {
        debug!("unmap_range {range:?} (freeing frames)");
        self.unmap_range_impl(alloc, range, &LeafDisposal::Free);
    }

    /// Unmap every 4 KiB page of `range` without freeing the leaf frames,
    /// asserting that each leaf maps the supplied frame at the same position.
    /// Interior tables that become empty are still reclaimed.
    ///
    /// # Panics
    /// Panics on a missing level, a leaf/frame mismatch, or a length
    /// mismatch.
    pub fn unmap_range_from<A: FrameSource>(
        &mut self,
        alloc: &mut A,
        range: VirtualRange,
        frames: &[PhysicalPage<Size4K>],
    ) {
        debug!("unmap_range {range:?} ({} retained frames)", frames.len());
        assert_eq!(frames.len() as u64, range.page_count());
        self.unmap_range_impl(alloc, range, &LeafDisposal::Retain(frames));
    }

    fn unmap_range_impl<A: FrameSource>(
        &mut self,
        alloc: &mut A,
        range: VirtualRange,
        disposal: &LeafDisposal<'_>,
    ) {
        assert!(range.start().is_aligned_to(4096));
        assert!(range.one_past_end().is_aligned_to(4096));

        for (i, page) in range.pages().enumerate() {
            let va = page.base();
            trace!("  unmap {va}");

            let pml4 = unsafe { get_table(self.mapper, self.root) };
            let pml4e = pml4.entry(va.pml4_index());
            assert!(pml4e.present(), "unmap through absent PML4E at {va}");
            let pdpt_frame = pml4e.next_table();

            let pdpt = unsafe { get_table(self.mapper, pdpt_frame) };
            let pdpte = pdpt.entry(va.pdpt_index());
            assert!(pdpte.present(), "unmap through absent PDPTE at {va}");
            let pd_frame = pdpte.next_table();

            let pd = unsafe { get_table(self.mapper, pd_frame) };
            let pde = pd.entry(va.pd_index());
            assert!(pde.present(), "unmap through absent PDE at {va}");
            let pt_frame = pde.next_table();

            let pt = unsafe { get_table(self.mapper, pt_frame) };
            let pte = pt.entry(va.pt_index());
            assert!(pte.present(), "unmap of absent page at {va}");

            match disposal {
                LeafDisposal::Free => {
                    alloc.free_4k(PhysicalPage::from_base(pte.addr_4k()));
                }
                LeafDisposal::Retain(frames) => {
                    assert_eq!(
                        pte.addr_4k(),
                        frames[i].base(),
                        "leaf at {va} does not map the expected frame"
                    );
                }
            }
            pt.clear_entry(va.pt_index());

            // Reclaim emptied tables strictly bottom-up before moving to the
            // next page; a parent entry must never outlive its freed child.
            if pt.is_empty() {
                alloc.free_4k(pt_frame);
                pd.clear_entry(va.pd_index());
            }
            if pd.is_empty() {
                alloc.free_4k(pd_frame);
                pdpt.clear_entry(va.pdpt_index());
            }
            if pdpt.is_empty() {
                alloc.free_4k(pdpt_frame);
                pml4.clear_entry(va.pml4_index());
            }
        }
    }

    /// Full recursive teardown: free every present leaf frame, every interior
    /// table, and the root itself. Consumes the space.
    ///
    /// Frames are not reference counted; the caller must guarantee nothing in
    /// this tree is shared with another live address space (unshare the
    /// kernel slot and unmap shared objects first).
    pub fn free_page_tables<A: FrameSource>(self, alloc: &mut A) {
        debug!("free_page_tables root={:?}", self.root);
        let pml4 = unsafe { get_table(self.mapper, self.root) };
        for pml4_i in 0..crate::PageTable::ENTRY_COUNT {
            let pml4e = pml4.entry(pml4_i);
            if !pml4e.present() {
                continue;
            }
            let pdpt_frame = pml4e.next_table();
            let pdpt = unsafe { get_table(self.mapper, pdpt_frame) };
            for pdpt_i in 0..crate::PageTable::ENTRY_COUNT {
                let pdpte = pdpt.entry(pdpt_i);
                if !pdpte.present() {
                    continue;
                }
                let pd_frame = pdpte.next_table();
                let pd = unsafe { get_table(self.mapper, pd_frame) };
                for pd_i in 0..crate::PageTable::ENTRY_COUNT {
                    let pde = pd.entry(pd_i);
                    if !pde.present() {
                        continue;
                    }
                    debug_assert!(!pde.ps(), "teardown does not handle 2 MiB leaves");
                    let pt_frame = pde.next_table();
                    let pt = unsafe { get_table(self.mapper, pt_frame) };
                    for pt_i in 0..crate::PageTable::ENTRY_COUNT {
                        let pte = pt.entry(pt_i);
                        if !pte.present() {
                            continue;
                        }
                        alloc.free_4k(PhysicalPage::from_base(pte.addr_4k()));
                    }
                    alloc.free_4k(pt_frame);
                }
                alloc.free_4k(pd_frame);
            }
            alloc.free_4k(pdpt_frame);
        }
        alloc.free_4k(self.root);
    }

    /// Translate `va` if mapped. Handles 2 MiB (pmap) and 4 KiB leaves.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let pml4 = unsafe { get_table(self.mapper, self.root) };
        let pml4e = pml4.entry(va.pml4_index());
        if !pml4e.present() {
            return None;
        }
        let pdpt = unsafe { get_table(self.mapper, pml4e.next_table()) };
        let pdpte = pdpt.entry(va.pdpt_index());
        if !pdpte.present() {
            return None;
        }
        let pd = unsafe { get_table(self.mapper, pdpte.next_table()) };
        let pde = pd.entry(va.pd_index());
        if !pde.present() {
            return None;
        }
        if pde.ps() {
            return Some(pde.addr_2m() + va.page_offset::<kernel_addresses::Size2M>());
        }
        let pt = unsafe { get_table(self.mapper, pde.next_table()) };
        let pte = pt.entry(va.pt_index());
        if !pte.present() {
            return None;
        }
        Some(pte.addr_4k() + va.page_offset::<Size4K>())
    }

    /// Copy the kernel's PML4 slot 0 into this root, so this space
    /// transparently sees all kernel mappings (pmap, kernel heap) without
    /// duplicating tables.
    ///
    /// # Panics
    /// Panics if the kernel root has no slot-0 mapping or if this root
    /// already has one.
    pub fn share_kernel_slot(&mut self, kernel_root: PhysicalPage<Size4K>) {
        let kernel_pml4 = unsafe { get_table(self.mapper, kernel_root) };
        let kernel_e0 = kernel_pml4.entry(0);
        assert!(kernel_e0.present());

        let pml4 = unsafe { get_table(self.mapper, self.root) };
        assert!(!pml4.entry(0).present());
        pml4.set_entry(0, PageTableEntry::table(kernel_e0.next_table()));
    }

    /// Clear the shared kernel slot again, so a following teardown of this
    /// tree cannot free kernel tables.
    ///
    /// # Panics
    /// Panics if slot 0 is absent or does not point at the kernel's PDPT.
    pub fn unshare_kernel_slot(&mut self, kernel_root: PhysicalPage<Size4K>) {
        let kernel_pml4 = unsafe { get_table(self.mapper, kernel_root) };
        let kernel_e0 = kernel_pml4.entry(0);

        let pml4 = unsafe { get_table(self.mapper, self.root) };
        let e0 = pml4.entry(0);
        assert!(e0.present());
        assert_eq!(e0.addr_4k(), kernel_e0.addr_4k());
        pml4.clear_entry(0);
    }

}

/// Follow `table[index]` to the next level, allocating and linking a fresh
/// table if the entry is absent.
pub(crate) fn descend_or_create<A: FrameSource>(
    table: &mut crate::PageTable,
    index: usize,
    alloc: &mut A,
) -> Result<PhysicalPage<Size4K>, OutOfFrames> {
    let e = table.entry(index);
    if e.present() {
        Ok(e.next_table())
    } else {
        // Fresh frames are zero-filled, so the new table starts empty.
        let frame = alloc.alloc_4k()?;
        table.set_entry(index, PageTableEntry::table(frame));
        Ok(frame)
    }
}
