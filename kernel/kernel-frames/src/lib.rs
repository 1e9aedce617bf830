//! # Physical Frame Allocator
//!
//! Hands out 4 KiB physical frames from one contiguous region of RAM, with
//! O(1) allocate and free.
//!
//! The allocator keeps no heap state of its own. At init it carves a metadata
//! array out of the *front* of the managed region — one `u32` slot per frame —
//! and threads a free list through those slots by frame index. A slot holds
//! either the index of the next free frame, [`FREE_END`], or [`ALLOCATED`];
//! that last state is what lets `free` catch double frees and stray addresses
//! as fatal errors instead of silent corruption.
//!
//! ```text
//! region:  | metadata pages | frame 0 | frame 1 | ... | frame N-1 |
//!            u32 × N slots     ^ frames_base
//! ```
//!
//! Frames are zero-filled on allocation. Page tables require this (a fresh
//! table must decode as empty) and user-visible pages must not leak prior
//! contents, so it is part of the [`FrameSource`] contract rather than a
//! courtesy.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

use kernel_addresses::{PageSize, PhysicalAddress, PhysicalPage, PhysicalRange, Size4K};
use kernel_paging::{FrameSource, OutOfFrames, PhysMapper};
use log::{debug, info};

/// Free-list terminator.
const FREE_END: u32 = u32::MAX;
/// Slot marker for a frame that is currently handed out.
const ALLOCATED: u32 = u32::MAX - 1;

const META_ENTRY_SIZE: u64 = size_of::<u32>() as u64;

/// Allocator over one contiguous physical region.
///
/// All metadata access goes through the injected [`PhysMapper`]; on the real
/// kernel that is the pmap identity map, in tests a host-memory fake.
pub struct FrameAllocator<'m, M: PhysMapper> {
    mapper: &'m M,
    /// Start of the metadata array (== start of the managed region).
    meta: PhysicalAddress,
    /// First allocatable frame, just past the metadata pages.
    frames_base: PhysicalAddress,
    frame_count: u64,
    free_head: u32,
    free_frames: u64,
}

impl<'m, M: PhysMapper> FrameAllocator<'m, M> {
    /// Take ownership of `region` and build the free list.
    ///
    /// The metadata carve deliberately sizes its array for the frame count
    /// *before* subtracting the metadata pages themselves; the few wasted
    /// slots keep the math trivial.
    ///
    /// # Panics
    /// Panics if `region` is not page-aligned or too small to hold metadata
    /// plus at least one frame.
    #[must_use]
    pub fn init(mapper: &'m M, region: PhysicalRange) -> Self {
        assert!(region.start().is_aligned_to(Size4K::SIZE));
        assert!(region.length() % Size4K::SIZE == 0);

        let num_frames = region.length() / Size4K::SIZE;
        let meta_pages = (num_frames * META_ENTRY_SIZE).div_ceil(Size4K::SIZE);
        assert!(num_frames > meta_pages, "region too small");
        let frame_count = num_frames - meta_pages;
        assert!(frame_count < u64::from(ALLOCATED));

        let mut this = Self {
            mapper,
            meta: region.start(),
            frames_base: region.start() + meta_pages * Size4K::SIZE,
            frame_count,
            free_head: 0,
            free_frames: frame_count,
        };

        #[allow(clippy::cast_possible_truncation)]
        let count = frame_count as u32;
        for i in 0..count {
            let next = if i + 1 == count { FREE_END } else { i + 1 };
            *this.slot(i) = next;
        }

        info!(
            "frame allocator: {} frames at {} ({} metadata pages)",
            frame_count,
            this.frames_base,
            meta_pages
        );
        this
    }

    /// Number of frames currently free.
    #[inline]
    #[must_use]
    pub const fn free_frames(&self) -> u64 {
        self.free_frames
    }

    /// Total allocatable frames (free or not).
    #[inline]
    #[must_use]
    pub const fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Whether `pa` falls inside the allocatable part of the region.
    #[must_use]
    pub fn manages(&self, pa: PhysicalAddress) -> bool {
        pa >= self.frames_base
            && pa.as_u64() < self.frames_base.as_u64() + self.frame_count * Size4K::SIZE
    }

    fn frame_at(&self, index: u32) -> PhysicalPage<Size4K> {
        PhysicalPage::from_base(self.frames_base + u64::from(index) * Size4K::SIZE)
    }

    fn index_of(&self, frame: PhysicalPage<Size4K>) -> u32 {
        assert!(self.manages(frame.base()), "frame {frame:?} is not managed here");
        #[allow(clippy::cast_possible_truncation)]
        let index = ((frame.base().as_u64() - self.frames_base.as_u64()) / Size4K::SIZE) as u32;
        index
    }

    fn slot(&mut self, index: u32) -> &mut u32 {
        let pa = self.meta + u64::from(index) * META_ENTRY_SIZE;
        // Safety: the metadata array was carved from our own region at init
        // and `index < frame_count`.
        unsafe { self.mapper.phys_to_mut::<u32>(pa) }
    }
}

impl<M: PhysMapper> FrameSource for FrameAllocator<'_, M> {
    fn alloc_4k(&mut self) -> Result<PhysicalPage<Size4K>, OutOfFrames> {
        if self.free_head == FREE_END {
            return Err(OutOfFrames);
        }
        let index = self.free_head;
        self.free_head = *self.slot(index);
        *self.slot(index) = ALLOCATED;
        self.free_frames -= 1;

        let frame = self.frame_at(index);
        // Safety: the frame is ours and not handed out to anyone else yet.
        unsafe {
            let bytes = self.mapper.phys_to_mut::<[u8; 4096]>(frame.base());
            bytes.fill(0);
        }
        debug!("alloc frame {index} -> {frame:?} ({} left)", self.free_frames);
        Ok(frame)
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        let index = self.index_of(frame);
        let head = self.free_head;
        let slot = self.slot(index);
        assert!(*slot == ALLOCATED, "freeing frame {frame:?} that is not allocated");
        *slot = head;
        self.free_head = index;
        self.free_frames += 1;
        debug!("free frame {index} ({} free)", self.free_frames);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_paging::sim::{HostIdentity, SimRegion};
    use kernel_paging::AddressSpace;
    use kernel_addresses::{VirtualAddress, VirtualRange};

    #[test]
    fn metadata_carve_sizing() {
        // 256 pages -> 1 KiB of metadata -> 1 page carved.
        let region = SimRegion::with_pages(256);
        let alloc = FrameAllocator::init(&HostIdentity, region.range());
        assert_eq!(alloc.frame_count(), 255);
        assert_eq!(alloc.free_frames(), 255);

        // 1025 pages of metadata demand: 1025*4 = 4100 bytes -> 2 pages.
        let region = SimRegion::with_pages(1025);
        let alloc = FrameAllocator::init(&HostIdentity, region.range());
        assert_eq!(alloc.frame_count(), 1023);
    }

    #[test]
    fn exhaust_free_all_exhaust_again() {
        let region = SimRegion::with_pages(16);
        let mut alloc = FrameAllocator::init(&HostIdentity, region.range());
        let total = alloc.frame_count();

        let mut frames = Vec::new();
        while let Ok(f) = alloc.alloc_4k() {
            frames.push(f);
        }
        assert_eq!(frames.len() as u64, total);
        assert_eq!(alloc.free_frames(), 0);
        assert_eq!(alloc.alloc_4k(), Err(OutOfFrames));

        for f in frames.drain(..) {
            alloc.free_4k(f);
        }
        assert_eq!(alloc.free_frames(), total);

        // The list is intact: the full count is allocatable again.
        for _ in 0..total {
            frames.push(alloc.alloc_4k().unwrap());
        }
        assert_eq!(alloc.alloc_4k(), Err(OutOfFrames));
    }

    #[test]
    fn frames_are_distinct_and_in_region() {
        let region = SimRegion::with_pages(16);
        let mut alloc = FrameAllocator::init(&HostIdentity, region.range());

        let mut seen = Vec::new();
        while let Ok(f) = alloc.alloc_4k() {
            assert!(alloc.manages(f.base()));
            assert!(region.range().contains(f.base()));
            assert!(!seen.contains(&f), "frame handed out twice");
            seen.push(f);
        }
    }

    #[test]
    fn allocation_zero_fills() {
        let region = SimRegion::with_pages(8);
        let mut alloc = FrameAllocator::init(&HostIdentity, region.range());

        let f = alloc.alloc_4k().unwrap();
        unsafe {
            let bytes = HostIdentity.phys_to_mut::<[u8; 4096]>(f.base());
            bytes.fill(0xCD);
        }
        alloc.free_4k(f);

        // LIFO free list: the dirtied frame comes back first, clean.
        let again = alloc.alloc_4k().unwrap();
        assert_eq!(again, f);
        let bytes = unsafe { HostIdentity.phys_to_mut::<[u8; 4096]>(again.base()) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn double_free_is_fatal() {
        let region = SimRegion::with_pages(8);
        let mut alloc = FrameAllocator::init(&HostIdentity, region.range());
        let f = alloc.alloc_4k().unwrap();
        alloc.free_4k(f);
        alloc.free_4k(f);
    }

    #[test]
    #[should_panic(expected = "not managed here")]
    fn foreign_frame_free_is_fatal() {
        let region = SimRegion::with_pages(8);
        let mut alloc = FrameAllocator::init(&HostIdentity, region.range());
        let outside = PhysicalPage::from_base(region.range().start());
        // The region start is metadata, not an allocatable frame.
        alloc.free_4k(outside);
    }

    /// The allocator drives real page-table construction end to end.
    #[test]
    fn backs_page_table_mapping() {
        let region = SimRegion::with_pages(64);
        let mut alloc = FrameAllocator::init(&HostIdentity, region.range());
        let before = alloc.free_frames();

        let mut aspace = AddressSpace::create(&HostIdentity, &mut alloc).unwrap();
        let range = VirtualRange::new(VirtualAddress::new(32 << 30), 4 * 4096);
        aspace.map_range(&mut alloc, range).unwrap();
        // Root + PDPT + PD + PT + 4 leaves.
        assert_eq!(alloc.free_frames(), before - 8);

        aspace.unmap_range(&mut alloc, range);
        aspace.free_page_tables(&mut alloc);
        assert_eq!(alloc.free_frames(), before);
    }
}
