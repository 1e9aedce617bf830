//! Simulated physical memory for host-side tests.
//!
//! [`SimRam`] owns a pool of 4 KiB-aligned heap allocations whose *host
//! addresses* double as the "physical" addresses of the simulation, so
//! [`PhysMapper`] translation is the identity and arbitrary byte offsets work
//! for free. [`SimFrames`] hands those frames out with the same contract as
//! the real frame allocator (zero-fill on alloc, fatal double free), and
//! [`SimMmu`] records root switches and invalidations so tests can assert
//! when a TLB flush would have happened.

use crate::{FrameSource, Mmu, OutOfFrames, PhysMapper};
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::{Cell, UnsafeCell};
use kernel_addresses::{PhysicalAddress, PhysicalPage, PhysicalRange, Size4K, align_up};

/// One simulated physical frame, aligned like the real thing.
#[repr(C, align(4096))]
struct Frame4K(UnsafeCell<[u8; 4096]>);

/// A fixed pool of simulated physical frames.
///
/// Frames live on the heap behind `Box`, so their addresses are stable for
/// the lifetime of the pool even if `SimRam` itself moves.
pub struct SimRam {
    frames: Vec<Box<Frame4K>>,
}

impl SimRam {
    /// Allocate `count` simulated frames.
    #[must_use]
    pub fn with_frames(count: usize) -> Self {
        let frames = (0..count)
            .map(|_| Box::new(Frame4K(UnsafeCell::new([0u8; 4096]))))
            .collect();
        Self { frames }
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// The "physical" address of frame `i` (its host address).
    #[must_use]
    pub fn frame(&self, i: usize) -> PhysicalPage<Size4K> {
        let addr = self.frames[i].0.get() as u64;
        PhysicalPage::from_base(PhysicalAddress::new(addr))
    }
}

impl PhysMapper for SimRam {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        // Simulated physical addresses are host addresses.
        unsafe { &mut *(pa.as_u64() as *mut T) }
    }
}

/// Identity [`PhysMapper`] for simulations whose "physical" addresses are
/// host addresses ([`SimRam`] frames, [`SimRegion`] pages).
pub struct HostIdentity;

impl PhysMapper for HostIdentity {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *(pa.as_u64() as *mut T) }
    }
}

/// A *contiguous*, page-aligned block of simulated physical memory, for code
/// that manages a whole region rather than individual frames (the physical
/// frame allocator carving its metadata, for instance).
pub struct SimRegion {
    // Held for ownership; all access goes through the aligned range.
    _buf: Vec<u8>,
    range: PhysicalRange,
}

impl SimRegion {
    /// Allocate a zeroed region of `pages` contiguous 4 KiB pages.
    #[must_use]
    pub fn with_pages(pages: usize) -> Self {
        let buf = vec![0u8; (pages + 1) * 4096];
        let start = align_up(buf.as_ptr() as u64, 4096);
        Self {
            _buf: buf,
            range: PhysicalRange::new(PhysicalAddress::new(start), pages as u64 * 4096),
        }
    }

    /// The simulated physical range this region covers.
    #[must_use]
    pub const fn range(&self) -> PhysicalRange {
        self.range
    }
}

/// A [`FrameSource`] over the frames of a [`SimRam`].
///
/// Tracks which frames are out so tests can account for every allocation and
/// so a double free fails loudly, like the real allocator.
pub struct SimFrames {
    free: Vec<PhysicalPage<Size4K>>,
    taken: Vec<PhysicalPage<Size4K>>,
}

impl SimFrames {
    /// Build a pool over the first `count` frames of `ram`.
    ///
    /// # Panics
    /// Panics if `ram` has fewer than `count` frames.
    #[must_use]
    pub fn new(ram: &SimRam, count: u64) -> Self {
        let count = usize::try_from(count).unwrap();
        assert!(count <= ram.frame_count());
        Self {
            free: (0..count).map(|i| ram.frame(i)).collect(),
            taken: Vec::new(),
        }
    }

    /// Number of frames currently handed out.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.taken.len()
    }

    /// Number of frames still available.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

impl FrameSource for SimFrames {
    fn alloc_4k(&mut self) -> Result<PhysicalPage<Size4K>, OutOfFrames> {
        let frame = self.free.pop().ok_or(OutOfFrames)?;
        // Same contract as the real allocator: frames come back zeroed.
        unsafe { core::ptr::write_bytes(frame.base().as_u64() as *mut u8, 0, 4096) };
        self.taken.push(frame);
        Ok(frame)
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        let pos = self
            .taken
            .iter()
            .position(|f| *f == frame)
            .unwrap_or_else(|| panic!("double free of {frame:?}"));
        self.taken.swap_remove(pos);
        self.free.push(frame);
    }
}

/// A fake [`Mmu`] that records activity instead of touching CR3.
pub struct SimMmu {
    kernel_root: PhysicalPage<Size4K>,
    active: Cell<PhysicalPage<Size4K>>,
    invalidations: Cell<u64>,
}

impl SimMmu {
    /// Start with the kernel root active, as after boot.
    #[must_use]
    pub const fn new(kernel_root: PhysicalPage<Size4K>) -> Self {
        Self {
            kernel_root,
            active: Cell::new(kernel_root),
            invalidations: Cell::new(0),
        }
    }

    /// How many times cached translations were invalidated (root switches
    /// included).
    #[must_use]
    pub fn invalidations(&self) -> u64 {
        self.invalidations.get()
    }
}

impl Mmu for SimMmu {
    fn active_root(&self) -> PhysicalPage<Size4K> {
        self.active.get()
    }

    unsafe fn activate(&self, root: PhysicalPage<Size4K>) {
        self.active.set(root);
        // A CR3 write flushes non-global TLB entries.
        self.invalidations.set(self.invalidations.get() + 1);
    }

    fn tables_changed(&self, root: PhysicalPage<Size4K>) {
        // Kernel tables are aliased into every space via the shared PML4
        // slot, so changes there are always visible.
        if root == self.active.get() || root == self.kernel_root {
            self.invalidations.set(self.invalidations.get() + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_come_back_zeroed() {
        let ram = SimRam::with_frames(2);
        let mut pool = SimFrames::new(&ram, 2);

        let frame = pool.alloc_4k().unwrap();
        unsafe { core::ptr::write_bytes(frame.base().as_u64() as *mut u8, 0xAB, 4096) };
        pool.free_4k(frame);

        let again = pool.alloc_4k().unwrap();
        let bytes: &[u8; 4096] = unsafe { ram.phys_to_mut(again.base()) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let ram = SimRam::with_frames(1);
        let mut pool = SimFrames::new(&ram, 1);
        let frame = pool.alloc_4k().unwrap();
        pool.free_4k(frame);
        pool.free_4k(frame);
    }

    #[test]
    fn mmu_invalidates_for_active_and_kernel_roots() {
        let ram = SimRam::with_frames(3);
        let kernel = ram.frame(0);
        let proc_a = ram.frame(1);
        let proc_b = ram.frame(2);

        let mmu = SimMmu::new(kernel);
        assert_eq!(mmu.active_root(), kernel);

        mmu.tables_changed(kernel);
        assert_eq!(mmu.invalidations(), 1);
        // Inactive, non-kernel root: no flush needed.
        mmu.tables_changed(proc_a);
        assert_eq!(mmu.invalidations(), 1);

        unsafe { mmu.activate(proc_a) };
        assert_eq!(mmu.invalidations(), 2);
        mmu.tables_changed(proc_a);
        assert_eq!(mmu.invalidations(), 3);
        mmu.tables_changed(proc_b);
        assert_eq!(mmu.invalidations(), 3);
        // Kernel root stays special while a process root is active.
        mmu.tables_changed(kernel);
        assert_eq!(mmu.invalidations(), 4);
    }
}
