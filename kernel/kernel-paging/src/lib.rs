//! # 4-Level Page Table Manipulation
//!
//! Map/unmap machinery for the x86-64 4-level radix page-table format,
//! together with the seams that make it testable off-target.
//!
//! ## Translation walk
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        └───► PTE → maps 4 KiB page (always a leaf)
//!   │        │        └────────────► PDE → PS=1 → 2 MiB page (pmap only)
//!   │        └─────────────────────► PDPTE
//!   └──────────────────────────────► PML4E (root referenced by CR3)
//! ```
//!
//! ## What you get
//!
//! - [`PageTableEntry`] — a thin `u64` wrapper with explicit mask/shift
//!   accessors (no reliance on bitfield layout), and the 512-entry
//!   [`PageTable`].
//! - [`AddressSpace`] — map/unmap of whole virtual ranges against one PML4
//!   root, with bottom-up reclamation of interior tables that become empty,
//!   plus full recursive teardown and kernel PML4-slot sharing.
//! - [`pmap::init_pmap`] — the boot-time 2 MiB-page identity map of physical
//!   memory, built once and never torn down.
//! - The seams: [`PhysMapper`] (phys → usable pointer), [`FrameSource`]
//!   (where 4 KiB frames come from), [`Mmu`] (translation-root ownership and
//!   TLB invalidation). Host tests plug simulated implementations into all
//!   three (see [`sim`]).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(any(test, feature = "sim"))]
extern crate alloc;

mod entry;
pub mod pmap;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
mod walker;

pub use entry::{PageFlags, PageTable, PageTableEntry};
pub use walker::AddressSpace;

use kernel_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// No free physical frame was available.
///
/// Propagated to the syscall/boot layer; whether to halt is the top level's
/// decision.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("out of physical frames")]
pub struct OutOfFrames;

/// Source of 4 KiB physical frames for page tables and leaf pages.
///
/// Returned frames must be 4 KiB aligned and **zero-filled** — clearing stale
/// data is a correctness requirement for both page tables and user-visible
/// memory, not an optimization.
pub trait FrameSource {
    /// Allocate one zero-filled 4 KiB physical frame.
    fn alloc_4k(&mut self) -> Result<PhysicalPage<Size4K>, OutOfFrames>;

    /// Return a frame to the pool.
    ///
    /// # Panics
    /// Implementations must treat freeing a frame that is not currently
    /// allocated as a fatal error.
    fn free_4k(&mut self, frame: PhysicalPage<Size4K>);
}

/// Converts physical addresses to *temporarily* usable pointers in the
/// current virtual address space.
///
/// The kernel's implementation is the pmap identity map; host tests use a
/// `Vec`-backed fake.
///
/// # Safety
/// - `pa` must be mapped writable in the current address space for `&mut T`.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - `T` must match the bytes at `pa`.
pub trait PhysMapper {
    /// Convert a physical address to a usable mutable reference.
    ///
    /// # Safety
    /// See the trait-level contract.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// Ownership of the active translation root and the TLB that caches it.
///
/// The kernel implementation reads/writes CR3; the simulated one records
/// calls so tests can assert invalidation behavior.
pub trait Mmu {
    /// The currently active PML4 root.
    fn active_root(&self) -> PhysicalPage<Size4K>;

    /// Switch the active translation root.
    ///
    /// # Safety
    /// `root` must be a valid PML4 whose mappings cover the currently
    /// executing code and stack.
    unsafe fn activate(&self, root: PhysicalPage<Size4K>);

    /// Tables under `root` were structurally changed. Implementations must
    /// invalidate cached translations if the change is visible to the active
    /// address space (the root is active, or it is the kernel root, which is
    /// aliased into every space).
    fn tables_changed(&self, root: PhysicalPage<Size4K>);
}

/// Reference a page-table frame through the mapper.
///
/// # Safety
/// - `phys` must point to a valid 4 KiB page containing a page table.
/// - The mapping must be writable.
#[inline]
pub(crate) unsafe fn get_table<'a, M: PhysMapper>(
    m: &M,
    phys: PhysicalPage<Size4K>,
) -> &'a mut PageTable {
    unsafe { m.phys_to_mut::<PageTable>(phys.base()) }
}
