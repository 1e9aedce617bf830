//! Kernel heap: a fixed arena carved out of the kernel address space once at
//! install time, served by a bump allocator.
//!
//! `GlobalAlloc` runs inside code that may already hold the frame and
//! address-space locks (spawning a process allocates collections), so the
//! heap must never take those locks itself. It touches them exactly once, in
//! [`install`], and serves everything afterwards from its own arena under
//! its own IRQ-masked lock.

use crate::KernelState;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use kernel_addresses::align_up;
use kernel_layout::MB;
use kernel_paging::{Mmu, PhysMapper};
use kernel_sync::{IrqGuard, SpinLock};

/// The kernel gets by on a small fixed heap; its collections hold
/// bookkeeping, not bulk data (that goes through the vspace directly).
const HEAP_SIZE: u64 = 16 * MB;

struct Arena {
    start: u64,
    end: u64,
    next: u64,
    live: usize,
}

static ARENA: SpinLock<Arena> = SpinLock::new(Arena {
    start: 0,
    end: 0,
    next: 0,
    live: 0,
});

/// Carve the heap arena out of the kernel address space. Call once, right
/// after `bring_up`; every heap allocation before that fails.
///
/// # Panics
/// Panics if the arena cannot be allocated or the heap is installed twice.
pub fn install<M: PhysMapper, U: Mmu>(state: &KernelState<'_, M, U>) {
    let base = state
        .sys_alloc(HEAP_SIZE, 4096)
        .expect("cannot allocate the kernel heap arena");
    let _irq = IrqGuard::new();
    let mut arena = ARENA.lock();
    assert!(arena.end == 0, "kernel heap installed twice");
    arena.start = base.as_u64();
    arena.next = base.as_u64();
    arena.end = base.as_u64() + HEAP_SIZE;
}

struct KernelHeap;

#[global_allocator]
static HEAP: KernelHeap = KernelHeap;

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let _irq = IrqGuard::new();
        let mut arena = ARENA.lock();
        let base = align_up(arena.next, layout.align() as u64);
        let end = base + layout.size() as u64;
        if arena.end == 0 || end > arena.end {
            return ptr::null_mut();
        }
        arena.next = end;
        arena.live += 1;
        base as *mut u8
    }

    unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {
        let _irq = IrqGuard::new();
        let mut arena = ARENA.lock();
        arena.live -= 1;
        // Bump allocation cannot reuse holes; recycle the arena wholesale
        // once the last allocation is gone.
        if arena.live == 0 {
            arena.next = arena.start;
        }
    }
}
