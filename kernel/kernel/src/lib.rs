//! # Kernel Glue
//!
//! Ties the memory and process subsystems together into one bootable whole:
//! [`bring_up`] turns a usable-RAM range into a running [`KernelState`], and
//! `KernelState` is the syscall surface the interrupt stubs call into.
//!
//! Everything hardware-specific stays at the edges — the CR3/TLB primitives
//! and the context restore live in [`arch`], the serial logger in [`logger`],
//! and the heap in `heap` — so the whole boot sequence and every syscall
//! path run as ordinary host tests against the simulated MMU.
//!
//! Boot order matters and is fixed:
//!
//! 1. bump-allocate the kernel root and the pmap's tables off the front of
//!    usable RAM ([`BootFrames`]),
//! 2. hand the rest to the real [`FrameAllocator`],
//! 3. wrap the root in the kernel [`VSpace`],
//! 4. activate the root,
//! 5. start an empty [`Scheduler`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(target_arch = "x86_64")]
pub mod arch;
#[cfg(target_os = "none")]
pub mod heap;
pub mod io;
pub mod logger;

use kernel_addresses::{PageSize, PhysicalAddress, PhysicalPage, PhysicalRange, Size4K,
    VirtualAddress};
use kernel_frames::FrameAllocator;
use kernel_layout::{KERNEL_VSPACE_START, kernel_vspace_range};
use kernel_paging::pmap::init_pmap;
use kernel_paging::{FrameSource, Mmu, OutOfFrames, PhysMapper};
use kernel_sched::{ExecFlags, ImageLoader, Pid, Resume, SavedRegisters, Scheduler, SpawnError};
use kernel_sync::{SpinLock, SpinLockGuard};
use kernel_vspace::{VObject, VSpace, VspaceError};
use log::info;

/// [`PhysMapper`] for the kernel proper: physical memory is identity-mapped —
/// first by the firmware's boot tables, then by the kernel's own pmap — so a
/// physical address *is* a valid pointer.
pub struct PmapMapper;

impl PhysMapper for PmapMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        // Safety: identity mapping per the type's contract; the caller
        // guarantees exclusivity and a live `T` at `pa`.
        unsafe { &mut *(pa.as_u64() as *mut T) }
    }
}

/// Frame source for the window between "we know where usable RAM is" and
/// "the real allocator exists": bumps through the front of the region.
///
/// Nothing allocated here — the kernel root and the pmap's interior tables —
/// is ever freed, so [`FrameSource::free_4k`] is unreachable.
pub struct BootFrames<'m, M: PhysMapper> {
    mapper: &'m M,
    region: PhysicalRange,
    used: u64,
}

impl<'m, M: PhysMapper> BootFrames<'m, M> {
    fn new(mapper: &'m M, region: PhysicalRange) -> Self {
        assert!(region.start().is_aligned_to(Size4K::SIZE));
        assert!(region.length() % Size4K::SIZE == 0);
        Self {
            mapper,
            region,
            used: 0,
        }
    }

    /// Bytes consumed off the front of the region so far.
    #[inline]
    #[must_use]
    pub const fn used(&self) -> u64 {
        self.used
    }
}

impl<M: PhysMapper> FrameSource for BootFrames<'_, M> {
    fn alloc_4k(&mut self) -> Result<PhysicalPage<Size4K>, OutOfFrames> {
        if self.used + Size4K::SIZE > self.region.length() {
            return Err(OutOfFrames);
        }
        let frame = PhysicalPage::from_base(self.region.start() + self.used);
        self.used += Size4K::SIZE;
        // Safety: the frame lies in usable RAM and has not been handed out.
        unsafe {
            let first: *mut u8 = core::ptr::from_mut(self.mapper.phys_to_mut(frame.base()));
            core::ptr::write_bytes(first, 0, usize::try_from(Size4K::SIZE).expect("page fits"));
        }
        Ok(frame)
    }

    fn free_4k(&mut self, _frame: PhysicalPage<Size4K>) {
        unreachable!("boot-time frames are permanent");
    }
}

/// Everything the interrupt and syscall stubs need, behind locks.
///
/// Lock order is scheduler, then frames, then the kernel space; every entry
/// point below follows it. All entry points run non-preemptible (real
/// interrupt masking on target, a no-op on the host).
pub struct KernelState<'m, M: PhysMapper, U: Mmu> {
    mmu: &'m U,
    kernel_root: PhysicalPage<Size4K>,
    frames: SpinLock<FrameAllocator<'m, M>>,
    kvspace: SpinLock<VSpace<'m, M>>,
    scheduler: SpinLock<Scheduler<'m, M>>,
}

/// Build the memory subsystem over `usable` and identity-map
/// `[0, phys_top)`, then activate the kernel root.
///
/// Returns with the scheduler empty; the caller installs the heap, spawns
/// init and calls [`KernelState::schedule`] for the first dispatch.
///
/// # Errors
/// [`VspaceError`] if `usable` cannot hold the pmap tables plus a working
/// frame allocator.
///
/// # Panics
/// Panics if `usable` is not page-aligned or `phys_top` exceeds what one
/// PML4 slot maps.
pub fn bring_up<'m, M: PhysMapper, U: Mmu>(
    mapper: &'m M,
    mmu: &'m U,
    usable: PhysicalRange,
    phys_top: u64,
) -> Result<KernelState<'m, M, U>, VspaceError> {
    // The pmap and the kernel heap span share PML4 slot 0; the 2 MiB
    // identity leaves must stop where the heap span begins.
    assert!(
        phys_top <= KERNEL_VSPACE_START,
        "physical map would overlap the kernel heap span"
    );
    let mut boot = BootFrames::new(mapper, usable);
    let root = boot.alloc_4k().map_err(VspaceError::from)?;
    let stats = init_pmap(mapper, root, phys_top, &mut boot)?;
    info!(
        "pmap: {} bytes behind {} tables",
        stats.bytes_mapped, stats.tables_allocated
    );

    let mut frames = FrameAllocator::init(mapper, usable.subtract_front(boot.used()));
    info!("frame allocator: {} frames usable", frames.frame_count());

    let kvspace = VSpace::adopt_root(mapper, &mut frames, root, kernel_vspace_range())?;

    // Safety: the pmap in `root` covers the code and stack executing this.
    unsafe { mmu.activate(root) };

    Ok(KernelState {
        mmu,
        kernel_root: root,
        frames: SpinLock::new(frames),
        kvspace: SpinLock::new(kvspace),
        scheduler: SpinLock::new(Scheduler::new(mapper, root)),
    })
}

impl<'m, M: PhysMapper, U: Mmu> KernelState<'m, M, U> {
    /// The kernel's PML4 root.
    #[inline]
    #[must_use]
    pub const fn kernel_root(&self) -> PhysicalPage<Size4K> {
        self.kernel_root
    }

    #[must_use]
    pub fn free_frames(&self) -> u64 {
        self.frames.lock().free_frames()
    }

    /// Allocate `size` bytes for the running process — in its own space for
    /// user processes, in the kernel's otherwise. The allocation is charged
    /// to the process as a memory object, so exit reclaims whatever it never
    /// freed. Outside any process (boot) the allocation is kernel-owned and
    /// permanent until freed.
    ///
    /// Buffers are page-aligned, which covers every `alignment` up to a
    /// page.
    ///
    /// # Errors
    /// [`VspaceError`] if virtual space or physical frames run out.
    ///
    /// # Panics
    /// Panics if `size` is zero or `alignment` exceeds a page.
    pub fn sys_alloc(&self, size: u64, alignment: u64) -> Result<VirtualAddress, VspaceError> {
        let _nmi = no_preempt();
        assert!(alignment.is_power_of_two() && alignment <= Size4K::SIZE);
        let mut sched = self.scheduler.lock();
        let mut frames = self.frames.lock();

        let Some(pid) = sched.current() else {
            drop(sched);
            return self
                .kvspace
                .lock()
                .allocate_size(&mut *frames, self.mmu, size, alignment);
        };

        let mut obj = VObject::create(&mut *frames, size)?;
        let proc = sched.process_mut(pid).expect("current process is live");
        let mapped = match proc.vspace_mut() {
            Some(vspace) => obj.map_into(vspace, &mut *frames, self.mmu),
            None => {
                let mut kvspace = self.kvspace.lock();
                obj.map_into(&mut *kvspace, &mut *frames, self.mmu)
            }
        };
        match mapped {
            Ok(va) => {
                proc.adopt_object(obj);
                Ok(va)
            }
            Err(e) => {
                obj.destroy(&mut *frames);
                Err(e)
            }
        }
    }

    /// Free an allocation made by [`Self::sys_alloc`], routed by ownership:
    /// a running process may only free objects charged to it.
    ///
    /// # Errors
    /// [`OutOfFrames`] if free-list bookkeeping cannot refill its pool.
    ///
    /// # Panics
    /// Panics if the running process does not own an allocation at `ptr`,
    /// or (outside any process) if `ptr` does not sit above a valid kernel
    /// allocation header.
    pub fn sys_free(&self, ptr: VirtualAddress) -> Result<(), OutOfFrames> {
        let _nmi = no_preempt();
        let mut sched = self.scheduler.lock();
        let mut frames = self.frames.lock();

        let Some(pid) = sched.current() else {
            drop(sched);
            return self.kvspace.lock().free_size(&mut *frames, self.mmu, ptr);
        };

        let kernel_root = self.kernel_root;
        let proc = sched.process_mut(pid).expect("current process is live");
        let root = proc.vspace_mut().map_or(kernel_root, |v| v.root());
        let mut obj = proc
            .take_object_at(root, ptr)
            .expect("freeing memory this process does not own");
        match proc.vspace_mut() {
            Some(vspace) => obj.unmap_from(vspace, &mut *frames, self.mmu)?,
            None => {
                let mut kvspace = self.kvspace.lock();
                obj.unmap_from(&mut *kvspace, &mut *frames, self.mmu)?;
            }
        }
        obj.destroy(&mut *frames);
        Ok(())
    }

    /// Spawn a kernel process running `entry` on a fresh kernel stack.
    ///
    /// # Errors
    /// [`SpawnError`] if the stack cannot be allocated or mapped.
    pub fn spawn_kernel_process(
        &self,
        name: &str,
        entry: VirtualAddress,
        flags: ExecFlags,
    ) -> Result<Pid, SpawnError> {
        let _nmi = no_preempt();
        let mut sched = self.scheduler.lock();
        let mut frames = self.frames.lock();
        let mut kvspace = self.kvspace.lock();
        sched.spawn_kernel_with(&mut *kvspace, &mut *frames, self.mmu, name, entry, flags)
    }

    /// Spawn a user process from the executable at `path`.
    ///
    /// # Errors
    /// [`SpawnError`] if loading or any allocation fails; nothing is leaked.
    pub fn sys_exec<L: ImageLoader>(
        &self,
        loader: &mut L,
        path: &str,
        args: &[&str],
        flags: ExecFlags,
    ) -> Result<Pid, SpawnError> {
        let _nmi = no_preempt();
        let mut sched = self.scheduler.lock();
        let mut frames = self.frames.lock();
        sched.spawn_user(&mut *frames, self.mmu, loader, path, args, flags)
    }

    /// Designate the adopter of orphaned processes.
    pub fn set_init(&self, pid: Pid) {
        self.scheduler.lock().set_init(pid);
    }

    /// Pick the next runnable process. Used for the first dispatch after
    /// boot and after [`Self::sys_exit`] is handled.
    pub fn schedule(&self) -> Resume {
        let _nmi = no_preempt();
        self.scheduler.lock().schedule()
    }

    /// The running process gives up the rest of its slice.
    pub fn sys_yield(&self, regs: SavedRegisters) -> Resume {
        let _nmi = no_preempt();
        let mut sched = self.scheduler.lock();
        sched.suspend_current(regs);
        sched.schedule()
    }

    /// Account one timer tick; `Some` when the slice is used up and the
    /// returned process must be switched to.
    pub fn timer_tick(&self, regs: SavedRegisters) -> Option<Resume> {
        let _nmi = no_preempt();
        let mut sched = self.scheduler.lock();
        if sched.tick() {
            sched.suspend_current(regs);
            return Some(sched.schedule());
        }
        None
    }

    /// Tear down the running process and pick whoever runs next.
    ///
    /// # Errors
    /// [`OutOfFrames`] if free-list bookkeeping fails mid-teardown.
    pub fn sys_exit(&self) -> Result<Resume, OutOfFrames> {
        let _nmi = no_preempt();
        let mut sched = self.scheduler.lock();
        let mut frames = self.frames.lock();
        let mut kvspace = self.kvspace.lock();
        sched.exit_current(&mut *kvspace, &mut *frames, self.mmu)?;
        Ok(sched.schedule())
    }

    /// Forcibly terminate `pid` (which must not be running).
    ///
    /// # Errors
    /// [`OutOfFrames`] if free-list bookkeeping fails mid-teardown.
    pub fn sys_kill(&self, pid: Pid) -> Result<(), OutOfFrames> {
        let _nmi = no_preempt();
        let mut sched = self.scheduler.lock();
        let mut frames = self.frames.lock();
        let mut kvspace = self.kvspace.lock();
        sched.kill(pid, &mut *kvspace, &mut *frames, self.mmu)
    }

    /// Direct scheduler access for stubs that need more than the wrappers
    /// expose. Hold the guard briefly and never across a context switch.
    pub fn scheduler(&self) -> SpinLockGuard<'_, Scheduler<'m, M>> {
        self.scheduler.lock()
    }

    pub fn frames(&self) -> SpinLockGuard<'_, FrameAllocator<'m, M>> {
        self.frames.lock()
    }

    pub fn kernel_vspace(&self) -> SpinLockGuard<'_, VSpace<'m, M>> {
        self.kvspace.lock()
    }
}

/// Mask interrupts for the current scope. Off target there is nothing to
/// mask, but the call sites stay uniform.
#[cfg(target_os = "none")]
pub(crate) fn no_preempt() -> impl Drop {
    kernel_sync::IrqGuard::new()
}

#[cfg(not(target_os = "none"))]
pub(crate) fn no_preempt() -> impl Drop {
    struct Unmasked;
    impl Drop for Unmasked {
        fn drop(&mut self) {}
    }
    Unmasked
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_layout::{GB, KERNEL_VSPACE_START, MB, TICKS_PER_SLICE};
    use kernel_paging::sim::{HostIdentity, SimMmu, SimRegion};
    use kernel_sched::{LoadError, LoadedImage};
    use kernel_vspace::VObject;

    fn placeholder_root() -> PhysicalPage<Size4K> {
        PhysicalPage::from_base(PhysicalAddress::zero())
    }

    #[test]
    fn bring_up_carves_boot_memory_and_serves_the_kernel_heap() {
        let region = SimRegion::with_pages(4096);
        let mmu = SimMmu::new(placeholder_root());
        let state = bring_up(&HostIdentity, &mmu, region.range(), 16 * MB).unwrap();

        // The kernel root went live during bring-up.
        assert_eq!(mmu.active_root(), state.kernel_root());
        // Root plus two pmap tables off the front, a few metadata pages and
        // one free-list pool frame; the rest is allocatable.
        assert!(state.free_frames() > 4096 - 16);

        let before = state.free_frames();
        let ptr = state.sys_alloc(2 * 4096, 8).unwrap();
        // No process is running, so the allocation landed in kernel space
        // and is backed by managed frames.
        let pa = state.kernel_vspace().query(ptr).expect("mapped");
        assert!(region.range().contains(pa));

        state.sys_free(ptr).unwrap();
        assert_eq!(state.free_frames(), before);
    }

    #[test]
    #[should_panic(expected = "overlap the kernel heap span")]
    fn bring_up_refuses_physical_memory_past_the_heap_span() {
        let region = SimRegion::with_pages(4096);
        let mmu = SimMmu::new(placeholder_root());
        // 33 GiB of physical memory would push the identity map into the
        // kernel heap's PML4 slot territory.
        let _ = bring_up(&HostIdentity, &mmu, region.range(), 33 * GB);
    }

    struct FakeLoader;

    impl ImageLoader for FakeLoader {
        fn load<A: FrameSource>(
            &mut self,
            alloc: &mut A,
            path: &str,
        ) -> Result<LoadedImage, LoadError> {
            if path == "/missing" {
                return Err(LoadError::NotFound { path: path.into() });
            }
            Ok(LoadedImage {
                object: VObject::create(alloc, 2 * 4096)?,
                entry_offset: 0,
            })
        }
    }

    #[test]
    fn exec_preempt_and_exit_through_the_syscall_surface() {
        let region = SimRegion::with_pages(4096);
        let mmu = SimMmu::new(placeholder_root());
        let state = bring_up(&HostIdentity, &mmu, region.range(), 16 * MB).unwrap();

        let idle = state
            .spawn_kernel_process(
                "idle",
                VirtualAddress::new(KERNEL_VSPACE_START),
                ExecFlags::empty(),
            )
            .unwrap();
        let baseline = state.free_frames();

        let pid = state
            .sys_exec(&mut FakeLoader, "/bin/sh", &["-l"], ExecFlags::empty())
            .unwrap();

        let resume = state.schedule();
        assert_eq!(resume.pid, idle);
        // The slice runs out after exactly the configured quota.
        for _ in 0..TICKS_PER_SLICE - 1 {
            assert!(state.timer_tick(resume.regs).is_none());
        }
        let resume = state.timer_tick(resume.regs).expect("slice exhausted");
        assert_eq!(resume.pid, pid);
        assert_ne!(resume.root, state.kernel_root());

        // Exit hands the CPU back and returns every frame the exec took.
        let resume = state.sys_exit().unwrap();
        assert_eq!(resume.pid, idle);
        assert!(state.scheduler().process(pid).is_none());
        assert_eq!(state.free_frames(), baseline);
    }

    #[test]
    fn exit_reclaims_allocations_the_process_never_freed() {
        let region = SimRegion::with_pages(4096);
        let mmu = SimMmu::new(placeholder_root());
        let state = bring_up(&HostIdentity, &mmu, region.range(), 16 * MB).unwrap();

        let idle = state
            .spawn_kernel_process(
                "idle",
                VirtualAddress::new(KERNEL_VSPACE_START),
                ExecFlags::empty(),
            )
            .unwrap();
        let baseline = state.free_frames();
        let worker = state
            .spawn_kernel_process(
                "worker",
                VirtualAddress::new(KERNEL_VSPACE_START + 0x1000),
                ExecFlags::empty(),
            )
            .unwrap();

        let resume = state.schedule();
        assert_eq!(resume.pid, idle);
        let resume = state.sys_yield(resume.regs);
        assert_eq!(resume.pid, worker);

        // The allocation is charged to the worker, not lost in kernel space.
        let ptr = state.sys_alloc(8 * 4096, 8).unwrap();
        assert!(state.kernel_vspace().query(ptr).is_some());
        assert_eq!(state.scheduler().process(worker).unwrap().object_count(), 1);

        // The worker exits without freeing; teardown unmaps and returns the
        // frames anyway.
        let resume = state.sys_exit().unwrap();
        assert_eq!(resume.pid, idle);
        assert!(state.kernel_vspace().query(ptr).is_none());
        assert_eq!(state.free_frames(), baseline);
    }

    #[test]
    fn failed_exec_reports_without_leaking() {
        let region = SimRegion::with_pages(2048);
        let mmu = SimMmu::new(placeholder_root());
        let state = bring_up(&HostIdentity, &mmu, region.range(), 16 * MB).unwrap();
        let baseline = state.free_frames();

        let result = state.sys_exec(&mut FakeLoader, "/missing", &[], ExecFlags::empty());
        assert!(matches!(result, Err(SpawnError::Load(LoadError::NotFound { .. }))));
        assert_eq!(state.free_frames(), baseline);
    }
}
