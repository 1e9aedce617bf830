use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use kernel_addresses::{PhysicalPage, Size4K, VirtualAddress};
use kernel_paging::PhysMapper;
use kernel_vspace::{VObject, VSpace};

/// Process identifier. Monotonically increasing, never reused.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Pid(pub u64);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

bitflags::bitflags! {
    /// Options for spawning a process.
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct ExecFlags: u32 {
        /// The spawning process blocks until the new process exits.
        const IS_BLOCKING      = 1 << 0;
        /// If the parent exits first, reparent to init instead of killing.
        const CAN_BE_ORPHANED  = 1 << 1;
    }
}

/// Execution state. Transitions only ever move rightwards; "blocked" is not
/// a state but a non-empty blocker set on a `Running` process.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ProcessState {
    NotStarted,
    Running,
    Terminated,
}

/// Kernel code segment selector (GDT entry 1).
pub const KERNEL_CS: u64 = 0x08;
/// Kernel data/stack segment selector (GDT entry 2).
pub const KERNEL_SS: u64 = 0x10;
/// Initial RFLAGS: interrupts enabled plus the always-set reserved bit 1.
pub const INITIAL_RFLAGS: u64 = 0x202;

/// Register snapshot captured at every suspension point and restored
/// verbatim on resume.
///
/// Field order matches the interrupt trampoline's push sequence: the
/// general-purpose registers the handler saves, then the hardware interrupt
/// frame (`rip`..`ss`). The context-restore path relies on this exact layout.
#[repr(C)]
#[derive(Copy, Clone, Default, Debug)]
pub struct SavedRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// One process control block.
///
/// Owns its address space (user processes; kernel processes run directly in
/// the kernel's) and every memory object backing it: stacks, loaded images,
/// and objects handed to it at runtime. All of it is released, in order, by
/// the scheduler's exit path.
pub struct Process<'m, M: PhysMapper> {
    pub(crate) pid: Pid,
    pub(crate) name: String,
    pub(crate) parent: Option<Pid>,
    pub(crate) children: Vec<Pid>,
    /// Pids this process waits to see terminate.
    pub(crate) blockers: Vec<Pid>,
    pub(crate) state: ProcessState,
    pub(crate) can_be_orphaned: bool,
    pub(crate) saved: SavedRegisters,
    /// Working directory, inherited from the parent at spawn.
    pub(crate) pwd: String,
    pub(crate) argv: Vec<String>,
    /// `None` for kernel processes, which live in the kernel's space.
    pub(crate) vspace: Option<VSpace<'m, M>>,
    /// Stacks first, then loaded images, then runtime objects; exit releases
    /// them in that order.
    pub(crate) stacks: Vec<VObject>,
    pub(crate) images: Vec<VObject>,
    pub(crate) objects: Vec<VObject>,
}

impl<M: PhysMapper> Process<'_, M> {
    #[inline]
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    #[must_use]
    pub const fn state(&self) -> ProcessState {
        self.state
    }

    #[inline]
    #[must_use]
    pub const fn parent(&self) -> Option<Pid> {
        self.parent
    }

    #[inline]
    #[must_use]
    pub fn children(&self) -> &[Pid] {
        &self.children
    }

    #[inline]
    #[must_use]
    pub fn blockers(&self) -> &[Pid] {
        &self.blockers
    }

    /// A process with outstanding blockers is skipped by the scheduler.
    #[inline]
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        !self.blockers.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn pwd(&self) -> &str {
        &self.pwd
    }

    #[inline]
    #[must_use]
    pub fn is_kernel_process(&self) -> bool {
        self.vspace.is_none()
    }

    #[inline]
    #[must_use]
    pub const fn saved_registers(&self) -> &SavedRegisters {
        &self.saved
    }

    pub(crate) fn block_on(&mut self, pid: Pid) {
        debug_assert!(!self.blockers.contains(&pid));
        self.blockers.push(pid);
    }

    pub(crate) fn unblock_from(&mut self, pid: Pid) {
        self.blockers.retain(|p| *p != pid);
    }
}

impl<'m, M: PhysMapper> Process<'m, M> {
    /// The process's own address space, if it has one (user processes).
    /// Kernel processes allocate from the kernel's space instead.
    #[must_use]
    pub fn vspace_mut(&mut self) -> Option<&mut VSpace<'m, M>> {
        self.vspace.as_mut()
    }

    /// Charge a runtime allocation to this process; exit releases it along
    /// with everything else the process holds.
    pub fn adopt_object(&mut self, obj: VObject) {
        self.objects.push(obj);
    }

    /// Detach the runtime object mapped at `va` in the space rooted at
    /// `root`, handing ownership back to the caller (the free path).
    pub fn take_object_at(
        &mut self,
        root: PhysicalPage<Size4K>,
        va: VirtualAddress,
    ) -> Option<VObject> {
        let idx = self
            .objects
            .iter()
            .position(|o| o.mapped_at(root) == Some(va))?;
        Some(self.objects.remove(idx))
    }

    /// Number of runtime allocations currently charged to this process.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saved_registers_match_the_trampoline_frame() {
        // 15 pushed GPRs + 5-word interrupt frame.
        assert_eq!(size_of::<SavedRegisters>(), 20 * 8);
        assert_eq!(core::mem::offset_of!(SavedRegisters, r15), 0);
        assert_eq!(core::mem::offset_of!(SavedRegisters, rax), 14 * 8);
        assert_eq!(core::mem::offset_of!(SavedRegisters, rip), 15 * 8);
        assert_eq!(core::mem::offset_of!(SavedRegisters, ss), 19 * 8);
    }
}
