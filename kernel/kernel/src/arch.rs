//! x86-64 privileged-instruction glue: the real [`Mmu`] over CR3 and the
//! context restore that hands the CPU to a scheduled process.
//!
//! Compiled only for the architecture; everything above this module runs
//! against the [`Mmu`] trait and is tested with the simulated MMU instead.

use core::arch::asm;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_paging::Mmu;
use kernel_sched::Resume;

/// Address bits of CR3; the low bits are cache-control flags.
const CR3_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

#[inline]
fn read_cr3() -> u64 {
    let value: u64;
    // Safety: reading CR3 has no side effects at CPL 0.
    unsafe {
        asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

#[inline]
unsafe fn write_cr3(value: u64) {
    // Safety: the caller guarantees the new root maps the running code and
    // stack. Writing CR3 flushes all non-global TLB entries.
    unsafe {
        asm!("mov cr3, {}", in(reg) value, options(nostack, preserves_flags));
    }
}

/// [`Mmu`] over the real CR3 register.
///
/// Constructed before the kernel root exists, so the root is injected later:
/// call [`Cr3Mmu::set_kernel_root`] as soon as `bring_up` returns. Until
/// then, kernel-root table changes made while a process root is active would
/// go unflushed.
pub struct Cr3Mmu {
    kernel_root: AtomicU64,
}

impl Cr3Mmu {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            kernel_root: AtomicU64::new(0),
        }
    }

    pub fn set_kernel_root(&self, root: PhysicalPage<Size4K>) {
        self.kernel_root.store(root.base().as_u64(), Ordering::Release);
    }
}

impl Default for Cr3Mmu {
    fn default() -> Self {
        Self::new()
    }
}

impl Mmu for Cr3Mmu {
    fn active_root(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_base(PhysicalAddress::new(read_cr3() & CR3_ADDR_MASK))
    }

    unsafe fn activate(&self, root: PhysicalPage<Size4K>) {
        // Safety: forwarded contract; see `write_cr3`.
        unsafe { write_cr3(root.base().as_u64()) };
    }

    fn tables_changed(&self, root: PhysicalPage<Size4K>) {
        // Reloading CR3 flushes the whole TLB. Kernel tables are aliased
        // into every space through the shared PML4 slot, so a change to the
        // kernel root matters no matter which root is live.
        let active = read_cr3();
        let changed = root.base().as_u64();
        if changed == active & CR3_ADDR_MASK
            || changed == self.kernel_root.load(Ordering::Acquire)
        {
            // Safety: rewriting the value already in CR3.
            unsafe { write_cr3(active) };
        }
    }
}

/// Hand the CPU to a scheduled process: activate its translation root, then
/// walk the register snapshot exactly like the interrupt trampoline's save
/// area in reverse and `iretq` into it.
///
/// # Safety
/// `resume` must come from the scheduler: the root must be a live PML4
/// sharing the kernel slot, and the snapshot's `rip`/`rsp` must be mapped
/// under it.
pub unsafe fn restore_context(resume: &Resume) -> ! {
    // Copy the snapshot onto this stack frame so rsp can walk it. The
    // kernel stack stays mapped across the root switch via the shared
    // kernel slot.
    let regs = resume.regs;
    // Safety: per this function's contract.
    unsafe {
        asm!(
            "mov cr3, {root}",
            "mov rsp, {regs}",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop r11",
            "pop r10",
            "pop r9",
            "pop r8",
            "pop rbp",
            "pop rdi",
            "pop rsi",
            "pop rdx",
            "pop rcx",
            "pop rbx",
            "pop rax",
            "iretq",
            root = in(reg) resume.root.base().as_u64(),
            regs = in(reg) &raw const regs,
            options(noreturn),
        )
    }
}
