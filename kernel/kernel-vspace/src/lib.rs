//! # Virtual Address Space Management
//!
//! Everything between "I have physical frames" and "a process can call
//! `alloc`":
//!
//! - [`AllocList`] — a free list of virtual ranges with first-fit allocation
//!   and exact-adjacency coalescing. Its nodes live in physical frames
//!   reached through the pmap, never in the heap it is busy providing.
//! - [`VSpace`] — one virtual address space: a page-table tree plus the
//!   [`AllocList`] governing its span. Allocations prepend a one-page header
//!   recording the full mapped range, so `free` needs nothing but the
//!   pointer.
//! - [`VObject`] — an eagerly allocated set of frames that can be mapped
//!   into several spaces at once (process images, stacks, shared buffers).
//!
//! The kernel's own space spans 32 GiB starting at
//! [`kernel_layout::KERNEL_VSPACE_START`] and sits entirely inside PML4
//! slot 0, which lets [`VSpace::share_kernelspace`] alias the whole kernel
//! into a process by copying a single entry.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod alloc_list;
mod vobject;
mod vspace;

pub use alloc_list::AllocList;
pub use vobject::VObject;
pub use vspace::VSpace;

use kernel_paging::OutOfFrames;

/// Why a virtual allocation failed.
///
/// Both variants are ordinary runtime conditions to report to the caller.
/// Corrupted internal state (double free, bad header magic) is asserted, not
/// returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VspaceError {
    #[error(transparent)]
    OutOfFrames(#[from] OutOfFrames),

    /// No free virtual range is large enough.
    #[error("virtual address space exhausted (requested {requested} bytes)")]
    OutOfVirtualSpace { requested: u64 },
}
