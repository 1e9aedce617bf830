//! # Typed Memory Addresses
//!
//! Thin `u64` newtypes that carry the *kind* of an address at the type level
//! so physical and virtual values cannot be mixed by accident:
//!
//! - [`MemoryAddress`] — a bare 64-bit address with no kind attached.
//! - [`VirtualAddress`] / [`VirtualPage<S>`] — virtual addresses and their
//!   page-aligned bases for a concrete [`PageSize`].
//! - [`PhysicalAddress`] / [`PhysicalPage<S>`] — the same for physical frames.
//! - [`VirtualRange`] / [`PhysicalRange`] — half-open `{start, length}` spans
//!   with `one_past_end` arithmetic.
//!
//! None of these types validate canonicality or mapping state; they only make
//! the units explicit. Alignment is guaranteed exactly where the API says so
//! (values produced by `page::<S>()` and the `Page` wrappers).

#![cfg_attr(not(any(test, doctest)), no_std)]

mod memory_address;
mod page_size;
mod physical_address;
mod range;
mod virtual_address;

pub use memory_address::MemoryAddress;
pub use page_size::{PageSize, Size2M, Size4K};
pub use physical_address::{PhysicalAddress, PhysicalPage};
pub use range::{PhysicalRange, VirtualRange};
pub use virtual_address::{VirtualAddress, VirtualPage};

/// Align `x` down to the nearest multiple of `a` (`a` must be a power of two).
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a` (`a` must be a power of two).
///
/// `x + (a - 1)` must not overflow `u64`.
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

/// Whether `x` is a multiple of `a` (`a` must be a power of two).
#[inline(always)]
#[must_use]
pub const fn is_aligned(x: u64, a: u64) -> bool {
    x & (a - 1) == 0
}
