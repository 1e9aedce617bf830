//! # Memory Layout & Scheduling Constants
//!
//! Single source of truth for the virtual-memory layout and the scheduler
//! quantum. Everything here is checked at compile time where a relationship
//! between constants must hold.

#![cfg_attr(not(any(test, doctest)), no_std)]

use kernel_addresses::{VirtualAddress, VirtualRange};

pub const KB: u64 = 1024;
pub const MB: u64 = 1024 * KB;
pub const GB: u64 = 1024 * MB;

/// Bytes covered by one PT entry (one 4 KiB page).
pub const BYTES_MAPPED_BY_PT_ENTRY: u64 = 4096;
/// Bytes covered by one PT (512 leaf pages).
pub const BYTES_MAPPED_BY_PT: u64 = 512 * BYTES_MAPPED_BY_PT_ENTRY;
/// Bytes covered by one PD (2 MiB per entry).
pub const BYTES_MAPPED_BY_PD: u64 = 512 * BYTES_MAPPED_BY_PT;
/// Bytes covered by one PDPT (1 GiB per entry).
pub const BYTES_MAPPED_BY_PDPT: u64 = 512 * BYTES_MAPPED_BY_PD;
/// Bytes covered by one PML4 entry (512 GiB).
pub const BYTES_MAPPED_BY_PML4_ENTRY: u64 = BYTES_MAPPED_BY_PDPT;

/// Start of the kernel heap's virtual span.
pub const KERNEL_VSPACE_START: u64 = 32 * GB;
/// Size of the kernel heap's virtual span.
pub const KERNEL_VSPACE_SIZE: u64 = 32 * GB;

/// Start of each process's private virtual span. Placed at the 512 GiB
/// boundary so it occupies PML4 slot 1 while the whole kernel region (and the
/// pmap) stays under slot 0.
pub const USER_VSPACE_START: u64 = BYTES_MAPPED_BY_PML4_ENTRY;
/// Size of each process's private virtual span.
pub const USER_VSPACE_SIZE: u64 = 32 * GB;

/// The kernel heap span as a range.
#[must_use]
pub const fn kernel_vspace_range() -> VirtualRange {
    VirtualRange::new(VirtualAddress::new(KERNEL_VSPACE_START), KERNEL_VSPACE_SIZE)
}

/// The per-process span as a range.
#[must_use]
pub const fn user_vspace_range() -> VirtualRange {
    VirtualRange::new(VirtualAddress::new(USER_VSPACE_START), USER_VSPACE_SIZE)
}

/// Timer ticks a process may consume before it is preempted.
pub const TICKS_PER_SLICE: u64 = 25;

/// Default process stack size.
pub const DEFAULT_STACK_SIZE: u64 = 256 * KB;
/// Default process stack alignment (System V ABI wants 16; 64 keeps cache
/// lines whole).
pub const DEFAULT_STACK_ALIGNMENT: u64 = 64;

const _: () = {
    // Kernel-space sharing copies a single PML4 entry; the whole kernel span
    // (and everything below it, including the pmap) must fit under slot 0.
    assert!(KERNEL_VSPACE_START + KERNEL_VSPACE_SIZE <= BYTES_MAPPED_BY_PML4_ENTRY);
    assert!(KERNEL_VSPACE_START % GB == 0);
    assert!(KERNEL_VSPACE_SIZE % GB == 0);
    // Process spans must not overlap kernel space.
    assert!(USER_VSPACE_START >= KERNEL_VSPACE_START + KERNEL_VSPACE_SIZE);
    assert!(USER_VSPACE_START % BYTES_MAPPED_BY_PML4_ENTRY == 0);
    assert!(DEFAULT_STACK_SIZE % 4096 == 0);
    assert!(DEFAULT_STACK_ALIGNMENT.is_power_of_two());
    assert!(TICKS_PER_SLICE > 0);
};
