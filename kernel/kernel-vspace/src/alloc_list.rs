//! Free list of virtual ranges, with its nodes parked in physical frames.
//!
//! The list tracks which parts of a space's span are *free*, ordered by
//! address. Allocation is first-fit over a worst-case size (requested size
//! plus alignment slack); the unused head and tail of the chosen range go
//! straight back into the list. Freeing inserts in address order and merges
//! with exactly-adjacent neighbours, so a fully freed span always collapses
//! back to one node.
//!
//! Nodes cannot live in the heap — this structure is what heaps are built
//! on — so they are carved from whole physical frames handed over by the
//! frame allocator and reached through the pmap. A small pool recycles node
//! slots and refills itself one frame at a time.

use crate::VspaceError;
use kernel_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress,
    VirtualRange, align_up};
use kernel_paging::{FrameSource, OutOfFrames, PhysMapper};
use log::trace;

/// Null node/slot address.
const NIL: u64 = 0;

/// One free range, stored inside a pool frame.
#[repr(C)]
struct FreeNode {
    start: u64,
    length: u64,
    /// Physical address of the next node, [`NIL`] at the tail.
    next: u64,
}

const NODE_SIZE: u64 = size_of::<FreeNode>() as u64;
/// First 8 bytes of each pool frame link to the next pool frame.
const FRAME_LINK_SIZE: u64 = 8;
const SLOTS_PER_FRAME: u64 = (Size4K::SIZE - FRAME_LINK_SIZE) / NODE_SIZE;

/// Recycler of node slots, refilled one physical frame at a time.
struct HeaderPool {
    /// Free slot list, threaded through the slots' first 8 bytes.
    slot_head: u64,
    /// All frames ever taken, for teardown.
    frame_head: u64,
    frames: u64,
}

impl HeaderPool {
    const fn new() -> Self {
        Self {
            slot_head: NIL,
            frame_head: NIL,
            frames: 0,
        }
    }

    fn take_slot<M: PhysMapper, A: FrameSource>(
        &mut self,
        mapper: &M,
        alloc: &mut A,
    ) -> Result<u64, OutOfFrames> {
        if self.slot_head == NIL {
            self.refill(mapper, alloc)?;
        }
        let slot = self.slot_head;
        self.slot_head = *word(mapper, slot);
        Ok(slot)
    }

    fn release_slot<M: PhysMapper>(&mut self, mapper: &M, slot: u64) {
        *word(mapper, slot) = self.slot_head;
        self.slot_head = slot;
    }

    fn refill<M: PhysMapper, A: FrameSource>(
        &mut self,
        mapper: &M,
        alloc: &mut A,
    ) -> Result<(), OutOfFrames> {
        let frame = alloc.alloc_4k()?;
        let base = frame.base().as_u64();
        *word(mapper, base) = self.frame_head;
        self.frame_head = base;
        self.frames += 1;

        for i in 0..SLOTS_PER_FRAME {
            let slot = base + FRAME_LINK_SIZE + i * NODE_SIZE;
            *word(mapper, slot) = self.slot_head;
            self.slot_head = slot;
        }
        trace!("header pool refilled, {} frames total", self.frames);
        Ok(())
    }

    fn teardown<M: PhysMapper, A: FrameSource>(&mut self, mapper: &M, alloc: &mut A) {
        let mut frame = self.frame_head;
        while frame != NIL {
            let next = *word(mapper, frame);
            alloc.free_4k(PhysicalPage::from_base(PhysicalAddress::new(frame)));
            frame = next;
        }
        self.frame_head = NIL;
        self.slot_head = NIL;
        self.frames = 0;
    }
}

/// Reference 8 bytes of physical memory through the mapper.
fn word<'a, M: PhysMapper>(mapper: &M, pa: u64) -> &'a mut u64 {
    debug_assert!(pa != NIL);
    // Safety: callers only pass addresses inside pool frames this structure
    // owns; slots are 8-byte aligned by construction.
    unsafe { mapper.phys_to_mut::<u64>(PhysicalAddress::new(pa)) }
}

/// Address-ordered free list over one virtual span.
pub struct AllocList<'m, M: PhysMapper> {
    mapper: &'m M,
    /// First free-range node, lowest address first.
    head: u64,
    pool: HeaderPool,
    free_space: u64,
}

impl<'m, M: PhysMapper> AllocList<'m, M> {
    /// An empty list; seed it with [`Self::return_range`].
    #[must_use]
    pub const fn new(mapper: &'m M) -> Self {
        Self {
            mapper,
            head: NIL,
            pool: HeaderPool::new(),
            free_space: 0,
        }
    }

    /// Total bytes currently free.
    #[inline]
    #[must_use]
    pub const fn free_space(&self) -> u64 {
        self.free_space
    }

    /// Number of distinct free ranges (coalescing quality indicator).
    #[must_use]
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.head;
        while cur != NIL {
            count += 1;
            cur = self.node(cur).next;
        }
        count
    }

    /// Physical frames held by the node pool.
    #[must_use]
    pub const fn pool_frames(&self) -> u64 {
        self.pool.frames
    }

    /// Carve an `alignment`-aligned range of `size` bytes out of the first
    /// free range that can hold it, worst case. Unused head/tail slack goes
    /// back to the list.
    ///
    /// # Errors
    /// [`VspaceError::OutOfVirtualSpace`] if no single free range is large
    /// enough; [`VspaceError::OutOfFrames`] if the node pool cannot refill.
    ///
    /// # Panics
    /// Panics if `size` is zero or `alignment` is not a power of two.
    pub fn take_range<A: FrameSource>(
        &mut self,
        alloc: &mut A,
        size: u64,
        alignment: u64,
    ) -> Result<VirtualRange, VspaceError> {
        assert!(size > 0);
        assert!(alignment.is_power_of_two());
        let worst_case = size + alignment - 1;

        // First fit.
        let mut prev = NIL;
        let mut cur = self.head;
        loop {
            if cur == NIL {
                return Err(VspaceError::OutOfVirtualSpace {
                    requested: worst_case,
                });
            }
            if self.node(cur).length >= worst_case {
                break;
            }
            prev = cur;
            cur = self.node(cur).next;
        }

        // Unlink the whole node, then hand back what the allocation does not
        // cover.
        let (start, length) = {
            let n = self.node(cur);
            (n.start, n.length)
        };
        let next = self.node(cur).next;
        if prev == NIL {
            self.head = next;
        } else {
            self.node(prev).next = next;
        }
        self.pool.release_slot(self.mapper, cur);
        self.free_space -= length;

        let aligned = align_up(start, alignment);
        let taken = VirtualRange::new(VirtualAddress::new(aligned), size);
        if aligned > start {
            self.return_range(alloc, VirtualRange::new(VirtualAddress::new(start), aligned - start))?;
        }
        let tail_start = aligned + size;
        let end = start + length;
        if end > tail_start {
            self.return_range(
                alloc,
                VirtualRange::new(VirtualAddress::new(tail_start), end - tail_start),
            )?;
        }
        trace!("take {taken:?} (align {alignment})");
        Ok(taken)
    }

    /// Give a range back, inserting in address order and coalescing with
    /// exactly-adjacent neighbours.
    ///
    /// # Errors
    /// [`OutOfFrames`] if a new node is needed and the pool cannot refill.
    ///
    /// # Panics
    /// Panics if `range` is empty or overlaps a range that is already free
    /// (a double free of virtual space).
    pub fn return_range<A: FrameSource>(
        &mut self,
        alloc: &mut A,
        range: VirtualRange,
    ) -> Result<(), OutOfFrames> {
        assert!(range.length() > 0);
        let rs = range.start().as_u64();
        let re = rs + range.length();

        let mut prev = NIL;
        let mut cur = self.head;
        while cur != NIL && self.node(cur).start < rs {
            prev = cur;
            cur = self.node(cur).next;
        }
        if cur != NIL {
            assert!(
                re <= self.node(cur).start,
                "returned range overlaps free range (double free of virtual space)"
            );
        }
        if prev != NIL {
            let p = self.node(prev);
            assert!(
                p.start + p.length <= rs,
                "returned range overlaps free range (double free of virtual space)"
            );
        }

        let merges_prev = prev != NIL && {
            let p = self.node(prev);
            p.start + p.length == rs
        };
        let merges_next = cur != NIL && re == self.node(cur).start;

        match (merges_prev, merges_next) {
            (true, true) => {
                let next_next = self.node(cur).next;
                let next_length = self.node(cur).length;
                let p = self.node(prev);
                p.length += range.length() + next_length;
                p.next = next_next;
                self.pool.release_slot(self.mapper, cur);
            }
            (true, false) => {
                self.node(prev).length += range.length();
            }
            (false, true) => {
                let n = self.node(cur);
                n.start = rs;
                n.length += range.length();
            }
            (false, false) => {
                let slot = self.pool.take_slot(self.mapper, alloc)?;
                let n = self.node(slot);
                n.start = rs;
                n.length = range.length();
                n.next = cur;
                if prev == NIL {
                    self.head = slot;
                } else {
                    self.node(prev).next = slot;
                }
            }
        }
        self.free_space += range.length();
        trace!("return {range:?}");
        Ok(())
    }

    /// Free every pool frame. The list is unusable afterwards.
    pub(crate) fn teardown<A: FrameSource>(&mut self, alloc: &mut A) {
        self.head = NIL;
        self.free_space = 0;
        self.pool.teardown(self.mapper, alloc);
    }

    fn node<'a>(&self, pa: u64) -> &'a mut FreeNode {
        debug_assert!(pa != NIL);
        // Safety: node addresses only ever come from the pool's own frames.
        unsafe { self.mapper.phys_to_mut::<FreeNode>(PhysicalAddress::new(pa)) }
    }
}
