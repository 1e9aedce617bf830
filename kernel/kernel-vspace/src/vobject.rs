use crate::{VSpace, VspaceError};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use kernel_addresses::{PageSize, PhysicalPage, Size4K, VirtualAddress, align_up};
use kernel_paging::{FrameSource, Mmu, OutOfFrames, PhysMapper};
use log::debug;

/// A memory object: an eagerly allocated, fixed set of physical frames that
/// can be mapped into any number of address spaces at once.
///
/// Process images, stacks and shared buffers are all objects. The frames are
/// owned by the object, not by any space that maps it; spaces map and unmap
/// the frames without ever freeing them. Mappings are tracked per space
/// (keyed by PML4 root), and the object refuses to die while any mapping is
/// live — frames must not be returned to the allocator while a page table
/// still points at them.
pub struct VObject {
    frames: Vec<PhysicalPage<Size4K>>,
    size: u64,
    /// Space root → buffer address the object is mapped at there.
    mappings: BTreeMap<PhysicalPage<Size4K>, VirtualAddress>,
}

impl VObject {
    /// Allocate enough zeroed frames to back `size` bytes.
    ///
    /// # Errors
    /// [`OutOfFrames`] if the frames cannot all be allocated; anything
    /// already taken is returned before reporting.
    ///
    /// # Panics
    /// Panics if `size` is zero.
    pub fn create<A: FrameSource>(alloc: &mut A, size: u64) -> Result<Self, OutOfFrames> {
        assert!(size > 0);
        let count = align_up(size, Size4K::SIZE) / Size4K::SIZE;
        let mut frames = Vec::with_capacity(usize::try_from(count).unwrap());
        for _ in 0..count {
            match alloc.alloc_4k() {
                Ok(f) => frames.push(f),
                Err(e) => {
                    for f in frames.drain(..) {
                        alloc.free_4k(f);
                    }
                    return Err(e);
                }
            }
        }
        debug!("vobject created: {size} bytes in {count} frames");
        Ok(Self {
            frames,
            size,
            mappings: BTreeMap::new(),
        })
    }

    /// Requested size in bytes (the backing is rounded up to whole pages).
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// The backing frames, in buffer order.
    #[inline]
    #[must_use]
    pub fn frames(&self) -> &[PhysicalPage<Size4K>] {
        &self.frames
    }

    /// Where this object is mapped in the space rooted at `root`, if at all.
    #[must_use]
    pub fn mapped_at(&self, root: PhysicalPage<Size4K>) -> Option<VirtualAddress> {
        self.mappings.get(&root).copied()
    }

    /// Map the object into `vspace`, returning the buffer address there.
    ///
    /// # Errors
    /// [`VspaceError`] if the target space cannot fit the mapping.
    ///
    /// # Panics
    /// Panics if the object is already mapped in that space.
    pub fn map_into<M: PhysMapper, A: FrameSource, U: Mmu>(
        &mut self,
        vspace: &mut VSpace<'_, M>,
        alloc: &mut A,
        mmu: &U,
    ) -> Result<VirtualAddress, VspaceError> {
        let root = vspace.root();
        assert!(
            !self.mappings.contains_key(&root),
            "object already mapped in this space"
        );
        let va = vspace.allocate_pages(alloc, mmu, &self.frames)?;
        self.mappings.insert(root, va);
        Ok(va)
    }

    /// Remove this object's mapping from `vspace`. The frames stay alive.
    ///
    /// # Errors
    /// [`OutOfFrames`] if the space's free-list pool cannot refill.
    ///
    /// # Panics
    /// Panics if the object is not mapped in that space.
    pub fn unmap_from<M: PhysMapper, A: FrameSource, U: Mmu>(
        &mut self,
        vspace: &mut VSpace<'_, M>,
        alloc: &mut A,
        mmu: &U,
    ) -> Result<(), OutOfFrames> {
        let va = self
            .mappings
            .remove(&vspace.root())
            .expect("object is not mapped in this space");
        vspace.free_pages(alloc, mmu, va, &self.frames)
    }

    /// Return the backing frames to the allocator.
    ///
    /// Objects have no `Drop`; merely dropping one leaks its frames. Every
    /// owner must call this, after unmapping from every space — destroying
    /// while mapped would leave page tables pointing at recycled frames.
    ///
    /// # Panics
    /// Panics if any mapping is still live.
    pub fn destroy<A: FrameSource>(mut self, alloc: &mut A) {
        assert!(
            self.mappings.is_empty(),
            "destroying an object that is still mapped somewhere"
        );
        for f in self.frames.drain(..) {
            alloc.free_4k(f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_layout::{kernel_vspace_range, user_vspace_range};
    use kernel_paging::sim::{SimFrames, SimMmu, SimRam};

    #[test]
    fn lifecycle_across_two_spaces() {
        let ram = SimRam::with_frames(96);
        let mut pool = SimFrames::new(&ram, 96);
        let mut kernel = VSpace::create(&ram, &mut pool, kernel_vspace_range()).unwrap();
        let mut user = VSpace::create(&ram, &mut pool, user_vspace_range()).unwrap();
        let mmu = SimMmu::new(kernel.root());

        let mut obj = VObject::create(&mut pool, 3 * 4096 + 17).unwrap();
        assert_eq!(obj.frame_count(), 4);
        assert_eq!(obj.size(), 3 * 4096 + 17);

        let kva = obj.map_into(&mut kernel, &mut pool, &mmu).unwrap();
        let uva = obj.map_into(&mut user, &mut pool, &mmu).unwrap();
        assert_eq!(obj.mapped_at(kernel.root()), Some(kva));
        assert_eq!(obj.mapped_at(user.root()), Some(uva));
        // Both spaces resolve to the same physical frames.
        assert_eq!(kernel.query(kva), user.query(uva));
        assert_eq!(kernel.query(kva), Some(obj.frames()[0].base()));

        obj.unmap_from(&mut user, &mut pool, &mmu).unwrap();
        assert_eq!(obj.mapped_at(user.root()), None);
        // The kernel mapping is untouched.
        assert_eq!(kernel.query(kva), Some(obj.frames()[0].base()));

        obj.unmap_from(&mut kernel, &mut pool, &mmu).unwrap();
        let held = pool.allocated();
        obj.destroy(&mut pool);
        assert_eq!(pool.allocated(), held - 4);
    }

    #[test]
    #[should_panic(expected = "already mapped in this space")]
    fn double_map_into_one_space_is_fatal() {
        let ram = SimRam::with_frames(64);
        let mut pool = SimFrames::new(&ram, 64);
        let mut kernel = VSpace::create(&ram, &mut pool, kernel_vspace_range()).unwrap();
        let mmu = SimMmu::new(kernel.root());

        let mut obj = VObject::create(&mut pool, 4096).unwrap();
        let _ = obj.map_into(&mut kernel, &mut pool, &mmu).unwrap();
        let result = obj.map_into(&mut kernel, &mut pool, &mmu);
        drop(result);
    }

    #[test]
    #[should_panic(expected = "still mapped somewhere")]
    fn destroy_with_live_mapping_is_fatal() {
        let ram = SimRam::with_frames(64);
        let mut pool = SimFrames::new(&ram, 64);
        let mut kernel = VSpace::create(&ram, &mut pool, kernel_vspace_range()).unwrap();
        let mmu = SimMmu::new(kernel.root());

        let mut obj = VObject::create(&mut pool, 4096).unwrap();
        let _ = obj.map_into(&mut kernel, &mut pool, &mmu).unwrap();
        obj.destroy(&mut pool);
    }

    #[test]
    fn partial_allocation_rolls_back() {
        let ram = SimRam::with_frames(4);
        let mut pool = SimFrames::new(&ram, 4);
        // Room for 4 frames; asking for 6 must fail cleanly.
        let result = VObject::create(&mut pool, 6 * 4096);
        assert!(result.is_err());
        assert_eq!(pool.allocated(), 0);
    }
}
