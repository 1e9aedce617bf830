use crate::{
    ExecFlags, INITIAL_RFLAGS, KERNEL_CS, KERNEL_SS, Pid, Process, ProcessState, SavedRegisters,
};
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use kernel_addresses::{PageSize, PhysicalPage, Size4K, VirtualAddress, align_down};
use kernel_layout::{DEFAULT_STACK_ALIGNMENT, DEFAULT_STACK_SIZE, TICKS_PER_SLICE, user_vspace_range};
use kernel_paging::{FrameSource, Mmu, OutOfFrames, PhysMapper};
use kernel_vspace::{VObject, VSpace, VspaceError};
use log::{debug, info};

/// Path of the entry stub mapped into every user process. The stub runs
/// first, sets up the C runtime environment and jumps to the executable's
/// entry (passed in `rdx`).
pub const STUB_PATH: &str = "/bin/stub";

/// An executable image pulled off disk into physical frames.
pub struct LoadedImage {
    pub object: VObject,
    /// Entry point, relative to the image's mapped base.
    pub entry_offset: u64,
}

/// Loading failures the syscall layer reports back to the caller of `exec`.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("no executable at {path}")]
    NotFound { path: String },

    #[error("malformed executable image at {path}")]
    BadImage { path: String },

    #[error(transparent)]
    OutOfFrames(#[from] OutOfFrames),
}

/// Why a spawn failed. All variants are reportable, not fatal.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error(transparent)]
    Vspace(#[from] VspaceError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("process arguments need {required} bytes of stack")]
    ArgvTooLarge { required: u64 },
}

impl From<OutOfFrames> for SpawnError {
    fn from(e: OutOfFrames) -> Self {
        Self::Vspace(VspaceError::OutOfFrames(e))
    }
}

/// Boundary to the ELF loader and filesystem: reads the file at `path` into
/// freshly allocated frames and reports the entry point.
pub trait ImageLoader {
    /// # Errors
    /// [`LoadError`] if the path does not resolve to a loadable image or the
    /// frames cannot be allocated.
    fn load<A: FrameSource>(&mut self, alloc: &mut A, path: &str)
    -> Result<LoadedImage, LoadError>;
}

/// What the low-level switch code needs to hand the CPU to a process:
/// activate `root`, restore `regs`, and return into it.
#[derive(Copy, Clone, Debug)]
pub struct Resume {
    pub pid: Pid,
    pub root: PhysicalPage<Size4K>,
    pub regs: SavedRegisters,
}

/// Round-robin scheduler and owner of every process control block.
///
/// Pure state machine: it decides *which* process runs next and keeps all
/// bookkeeping, but the actual CR3 switch and register restore happen in the
/// caller, driven by the returned [`Resume`]. That split keeps every
/// transition testable off-target.
///
/// Queue discipline: FIFO with a fixed tick quota per slice. Blocked
/// processes are skipped during selection but deliberately stay in the
/// queue, rotating without running until their blockers exit.
pub struct Scheduler<'m, M: PhysMapper> {
    mapper: &'m M,
    kernel_root: PhysicalPage<Size4K>,
    procs: BTreeMap<Pid, Process<'m, M>>,
    queue: VecDeque<Pid>,
    current: Option<Pid>,
    ticks_left: u64,
    next_pid: u64,
    init: Option<Pid>,
}

impl<'m, M: PhysMapper> Scheduler<'m, M> {
    #[must_use]
    pub fn new(mapper: &'m M, kernel_root: PhysicalPage<Size4K>) -> Self {
        Self {
            mapper,
            kernel_root,
            procs: BTreeMap::new(),
            queue: VecDeque::new(),
            current: None,
            ticks_left: 0,
            next_pid: 1,
            init: None,
        }
    }

    /// Designate the adopter of orphaned processes.
    ///
    /// # Panics
    /// Panics if `pid` does not name a live process.
    pub fn set_init(&mut self, pid: Pid) {
        assert!(self.procs.contains_key(&pid));
        self.init = Some(pid);
    }

    #[inline]
    #[must_use]
    pub const fn current(&self) -> Option<Pid> {
        self.current
    }

    #[must_use]
    pub fn process(&self, pid: Pid) -> Option<&Process<'m, M>> {
        self.procs.get(&pid)
    }

    #[must_use]
    pub fn process_mut(&mut self, pid: Pid) -> Option<&mut Process<'m, M>> {
        self.procs.get_mut(&pid)
    }

    #[must_use]
    pub fn is_queued(&self, pid: Pid) -> bool {
        self.queue.contains(&pid)
    }

    #[must_use]
    pub fn process_count(&self) -> usize {
        self.procs.len()
    }

    /// Spawn a process that runs `entry` in the kernel's own address space,
    /// on a fresh stack mapped into `kvspace`.
    ///
    /// # Errors
    /// [`SpawnError`] if the stack cannot be allocated or mapped.
    pub fn spawn_kernel<A: FrameSource, U: Mmu>(
        &mut self,
        kvspace: &mut VSpace<'m, M>,
        alloc: &mut A,
        mmu: &U,
        name: &str,
        entry: VirtualAddress,
    ) -> Result<Pid, SpawnError> {
        self.spawn_kernel_with(kvspace, alloc, mmu, name, entry, ExecFlags::empty())
    }

    /// [`Self::spawn_kernel`] with explicit [`ExecFlags`].
    ///
    /// # Errors
    /// [`SpawnError`] if the stack cannot be allocated or mapped.
    pub fn spawn_kernel_with<A: FrameSource, U: Mmu>(
        &mut self,
        kvspace: &mut VSpace<'m, M>,
        alloc: &mut A,
        mmu: &U,
        name: &str,
        entry: VirtualAddress,
        flags: ExecFlags,
    ) -> Result<Pid, SpawnError> {
        let mut stack = VObject::create(alloc, DEFAULT_STACK_SIZE)?;
        let stack_base = stack.map_into(kvspace, alloc, mmu)?;
        let stack_top = align_down(
            stack_base.as_u64() + DEFAULT_STACK_SIZE,
            DEFAULT_STACK_ALIGNMENT,
        );

        let saved = SavedRegisters {
            rip: entry.as_u64(),
            rsp: stack_top,
            cs: KERNEL_CS,
            ss: KERNEL_SS,
            rflags: INITIAL_RFLAGS,
            ..SavedRegisters::default()
        };

        let pid = self.register(name, None, vec![stack], Vec::new(), saved, flags);
        info!("spawned kernel process {pid} ({name})");
        Ok(pid)
    }

    /// Spawn a process with its own address space, running the executable at
    /// `path` behind the entry stub, with `argv` copied onto its stack.
    ///
    /// The new space shares the kernel's PML4 slot, gets the images, a user
    /// stack and a private interrupt stack mapped in, and is primed so the
    /// first resume lands in the stub with the convention
    /// `rdi = argc, rsi = argv, rdx = executable entry`.
    ///
    /// # Errors
    /// [`SpawnError`] if loading or any allocation fails.
    pub fn spawn_user<A: FrameSource, U: Mmu, L: ImageLoader>(
        &mut self,
        alloc: &mut A,
        mmu: &U,
        loader: &mut L,
        path: &str,
        args: &[&str],
        flags: ExecFlags,
    ) -> Result<Pid, SpawnError> {
        // Worst case for `write_argv`: the string bytes with NULs, the
        // pointer array with its NULL terminator, and both alignment steps.
        // Half the stack is the cap; the process still has to run on it.
        let argv_bytes: u64 = core::iter::once(path)
            .chain(args.iter().copied())
            .map(|s| s.len() as u64 + 1)
            .sum::<u64>()
            + (args.len() as u64 + 2) * 8
            + 24;
        if argv_bytes > DEFAULT_STACK_SIZE / 2 {
            return Err(SpawnError::ArgvTooLarge {
                required: argv_bytes,
            });
        }

        let mut exe = loader.load(alloc, path)?;
        let mut stub = match loader.load(alloc, STUB_PATH) {
            Ok(s) => s,
            Err(e) => {
                exe.object.destroy(alloc);
                return Err(e.into());
            }
        };
        let mut vspace = match VSpace::create(self.mapper, alloc, user_vspace_range()) {
            Ok(v) => v,
            Err(e) => {
                exe.object.destroy(alloc);
                stub.object.destroy(alloc);
                return Err(e.into());
            }
        };
        vspace.share_kernelspace(mmu, self.kernel_root);

        let built = Self::build_user_mappings(&mut vspace, alloc, mmu, &mut exe, &mut stub);
        let (exe_base, stub_base, user_stack, irq_stack, stack_base) = match built {
            Ok(parts) => parts,
            Err((e, mut objects)) => {
                objects.push(exe.object);
                objects.push(stub.object);
                self.abort_user_spawn(alloc, mmu, vspace, objects);
                return Err(e);
            }
        };

        let mut argv: Vec<String> = Vec::with_capacity(args.len() + 1);
        argv.push(path.to_string());
        argv.extend(args.iter().map(ToString::to_string));
        let (rsp, argv_va) =
            write_argv(self.mapper, user_stack.frames(), stack_base, &argv);

        let saved = SavedRegisters {
            rip: stub_base.as_u64() + stub.entry_offset,
            rdx: exe_base.as_u64() + exe.entry_offset,
            rdi: argv.len() as u64,
            rsi: argv_va.as_u64(),
            rsp: rsp.as_u64(),
            cs: KERNEL_CS,
            ss: KERNEL_SS,
            rflags: INITIAL_RFLAGS,
            ..SavedRegisters::default()
        };

        let name = path.rsplit('/').next().unwrap_or(path);
        let pid = self.register(
            name,
            Some(vspace),
            vec![user_stack, irq_stack],
            vec![exe.object, stub.object],
            saved,
            flags,
        );
        let proc = self.procs.get_mut(&pid).expect("just inserted");
        proc.argv = argv;
        info!("spawned user process {pid} ({path})");
        Ok(pid)
    }

    /// Map the images and create/map both stacks, step by step. On failure
    /// the caller receives the stack objects built so far (possibly mapped)
    /// for teardown; the image objects stay with the caller either way.
    #[allow(clippy::type_complexity)]
    fn build_user_mappings<A: FrameSource, U: Mmu>(
        vspace: &mut VSpace<'m, M>,
        alloc: &mut A,
        mmu: &U,
        exe: &mut LoadedImage,
        stub: &mut LoadedImage,
    ) -> Result<
        (VirtualAddress, VirtualAddress, VObject, VObject, VirtualAddress),
        (SpawnError, Vec<VObject>),
    > {
        let exe_base = match exe.object.map_into(vspace, alloc, mmu) {
            Ok(v) => v,
            Err(e) => return Err((e.into(), Vec::new())),
        };
        let stub_base = match stub.object.map_into(vspace, alloc, mmu) {
            Ok(v) => v,
            Err(e) => return Err((e.into(), Vec::new())),
        };
        let mut user_stack = match VObject::create(alloc, DEFAULT_STACK_SIZE) {
            Ok(o) => o,
            Err(e) => return Err((e.into(), Vec::new())),
        };
        let stack_base = match user_stack.map_into(vspace, alloc, mmu) {
            Ok(v) => v,
            Err(e) => return Err((e.into(), vec![user_stack])),
        };
        let mut irq_stack = match VObject::create(alloc, DEFAULT_STACK_SIZE) {
            Ok(o) => o,
            Err(e) => return Err((e.into(), vec![user_stack])),
        };
        if let Err(e) = irq_stack.map_into(vspace, alloc, mmu) {
            return Err((e.into(), vec![user_stack, irq_stack]));
        }
        Ok((exe_base, stub_base, user_stack, irq_stack, stack_base))
    }

    /// Undo a partially built user process: unmap and destroy every object,
    /// then drop the space. A nested allocation failure on this path leaves
    /// nothing consistent to report to, so it is fatal.
    fn abort_user_spawn<A: FrameSource, U: Mmu>(
        &self,
        alloc: &mut A,
        mmu: &U,
        mut vspace: VSpace<'m, M>,
        objects: Vec<VObject>,
    ) {
        let root = vspace.root();
        for mut obj in objects {
            if obj.mapped_at(root).is_some() {
                obj.unmap_from(&mut vspace, alloc, mmu)
                    .expect("allocation failed while aborting a failed spawn");
            }
            obj.destroy(alloc);
        }
        vspace.unshare_kernelspace(mmu, self.kernel_root);
        vspace.teardown(alloc);
    }

    fn register(
        &mut self,
        name: &str,
        vspace: Option<VSpace<'m, M>>,
        stacks: Vec<VObject>,
        images: Vec<VObject>,
        saved: SavedRegisters,
        flags: ExecFlags,
    ) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;

        let parent = self.current;
        let pwd = parent
            .and_then(|p| self.procs.get(&p))
            .map_or_else(|| String::from("/"), |p| p.pwd.clone());

        let proc = Process {
            pid,
            name: name.to_string(),
            parent,
            children: Vec::new(),
            blockers: Vec::new(),
            state: ProcessState::NotStarted,
            can_be_orphaned: flags.contains(ExecFlags::CAN_BE_ORPHANED),
            saved,
            pwd,
            argv: Vec::new(),
            vspace,
            stacks,
            images,
            objects: Vec::new(),
        };
        self.procs.insert(pid, proc);
        self.queue.push_back(pid);

        if let Some(parent_pid) = parent {
            let parent = self.procs.get_mut(&parent_pid).expect("parent is live");
            parent.children.push(pid);
            if flags.contains(ExecFlags::IS_BLOCKING) {
                parent.block_on(pid);
            }
        }
        pid
    }

    /// Capture the running process's registers and rotate it to the queue
    /// tail.
    ///
    /// # Panics
    /// Panics if nothing is running.
    pub fn suspend_current(&mut self, regs: SavedRegisters) {
        let pid = self.current.take().expect("suspend without a running process");
        let proc = self.procs.get_mut(&pid).expect("current process is live");
        proc.saved = regs;
        self.queue.push_back(pid);
        debug!("suspended {pid}");
    }

    /// Pick the first unblocked process from the queue front and make it
    /// current with a fresh tick slice. Blocked processes are skipped in
    /// place.
    ///
    /// # Panics
    /// Panics if a process is still current, if the queue is empty, or if
    /// every queued process is blocked — with no runnable process the system
    /// has deadlocked and there is nothing sensible left to do.
    pub fn schedule(&mut self) -> Resume {
        assert!(
            self.current.is_none(),
            "suspend or exit the running process before scheduling"
        );
        let pos = self
            .queue
            .iter()
            .position(|pid| !self.procs[pid].is_blocked())
            .expect("every process is blocked or the queue is empty");
        let pid = self.queue.remove(pos).expect("position is in range");

        let proc = self.procs.get_mut(&pid).expect("queued process is live");
        match proc.state {
            ProcessState::NotStarted => proc.state = ProcessState::Running,
            ProcessState::Running => {}
            ProcessState::Terminated => unreachable!("terminated process in ready queue"),
        }
        self.current = Some(pid);
        self.ticks_left = TICKS_PER_SLICE;

        let root = proc
            .vspace
            .as_ref()
            .map_or(self.kernel_root, VSpace::root);
        debug!("scheduling {pid} ({})", proc.name);
        Resume {
            pid,
            root,
            regs: proc.saved,
        }
    }

    /// Account one timer tick against the current slice. Returns `true` when
    /// the slice is exhausted and the caller must force a suspension.
    pub fn tick(&mut self) -> bool {
        if self.current.is_none() {
            return false;
        }
        self.ticks_left = self.ticks_left.saturating_sub(1);
        self.ticks_left == 0
    }

    /// Tear down the running process completely: every memory object, its
    /// address space, its process record. Unblocks the parent; orphanable
    /// children move to init, the rest are killed recursively.
    ///
    /// The caller must follow up with [`Self::schedule`] — there is no
    /// process to return to.
    ///
    /// # Errors
    /// [`OutOfFrames`] if free-list bookkeeping cannot refill its node pool
    /// mid-teardown.
    ///
    /// # Panics
    /// Panics if nothing is running.
    pub fn exit_current<A: FrameSource, U: Mmu>(
        &mut self,
        kvspace: &mut VSpace<'m, M>,
        alloc: &mut A,
        mmu: &U,
    ) -> Result<(), OutOfFrames> {
        let pid = self.current.take().expect("exit without a running process");
        let mut proc = self.procs.remove(&pid).expect("current process is live");
        info!("exit: {pid} ({})", proc.name);
        proc.state = ProcessState::Terminated;

        self.release_resources(&mut proc, kvspace, alloc, mmu)?;

        // The pid is dead: nobody may keep waiting on it or claim it as a
        // child.
        for p in self.procs.values_mut() {
            p.unblock_from(pid);
        }
        if let Some(parent) = proc.parent.and_then(|p| self.procs.get_mut(&p)) {
            parent.children.retain(|c| *c != pid);
        }
        self.settle_children(core::mem::take(&mut proc.children), kvspace, alloc, mmu)
    }

    /// Forcibly terminate `pid` and, recursively, all of its non-orphanable
    /// descendants. Orphanable descendants go to init.
    ///
    /// # Errors
    /// [`OutOfFrames`] as in [`Self::exit_current`].
    ///
    /// # Panics
    /// Panics if `pid` is the running process (use [`Self::exit_current`]).
    pub fn kill<A: FrameSource, U: Mmu>(
        &mut self,
        pid: Pid,
        kvspace: &mut VSpace<'m, M>,
        alloc: &mut A,
        mmu: &U,
    ) -> Result<(), OutOfFrames> {
        assert!(self.current != Some(pid));
        let Some(mut proc) = self.procs.remove(&pid) else {
            return Ok(());
        };
        info!("kill: {pid} ({})", proc.name);
        proc.state = ProcessState::Terminated;
        self.queue.retain(|p| *p != pid);

        self.release_resources(&mut proc, kvspace, alloc, mmu)?;

        for p in self.procs.values_mut() {
            p.unblock_from(pid);
        }
        self.settle_children(core::mem::take(&mut proc.children), kvspace, alloc, mmu)
    }

    /// Orphanable children of a dead process move to init; the rest are
    /// killed, recursively.
    fn settle_children<A: FrameSource, U: Mmu>(
        &mut self,
        children: Vec<Pid>,
        kvspace: &mut VSpace<'m, M>,
        alloc: &mut A,
        mmu: &U,
    ) -> Result<(), OutOfFrames> {
        for child in children {
            if !self.procs.contains_key(&child) {
                continue;
            }
            if self.procs[&child].can_be_orphaned {
                let init = self.init.expect("no init process to adopt orphans");
                self.procs.get_mut(&child).expect("child is live").parent = Some(init);
                self.procs
                    .get_mut(&init)
                    .expect("init is live")
                    .children
                    .push(child);
                debug!("reparented {child} to init {init}");
            } else {
                self.kill(child, kvspace, alloc, mmu)?;
            }
        }
        Ok(())
    }

    /// Release every memory object and the address space of `proc`, in
    /// dependency order: runtime objects, images, stacks, then the space
    /// itself.
    fn release_resources<A: FrameSource, U: Mmu>(
        &mut self,
        proc: &mut Process<'m, M>,
        kvspace: &mut VSpace<'m, M>,
        alloc: &mut A,
        mmu: &U,
    ) -> Result<(), OutOfFrames> {
        let drained = proc
            .objects
            .drain(..)
            .chain(proc.images.drain(..))
            .chain(proc.stacks.drain(..));
        match proc.vspace.as_mut() {
            Some(vspace) => {
                for mut obj in drained {
                    obj.unmap_from(vspace, alloc, mmu)?;
                    obj.destroy(alloc);
                }
            }
            None => {
                for mut obj in drained {
                    obj.unmap_from(kvspace, alloc, mmu)?;
                    obj.destroy(alloc);
                }
            }
        }

        if let Some(mut vspace) = proc.vspace.take() {
            // Never tear down the tables the CPU is walking.
            if mmu.active_root() == vspace.root() {
                // Safety: the kernel root maps the code and stack running
                // this teardown.
                unsafe { mmu.activate(self.kernel_root) };
            }
            vspace.unshare_kernelspace(mmu, self.kernel_root);
            vspace.teardown(alloc);
        }
        Ok(())
    }
}

/// Copy `argv` onto the top of a not-yet-running user stack, building the
/// pointer array the stub expects. Returns the primed stack pointer and the
/// user-space address of the argv array.
///
/// Layout, growing downwards from the stack top: the string bytes
/// (NUL-terminated), then the 8-byte-aligned pointer array with a NULL
/// terminator, then a 16-byte-aligned stack pointer.
fn write_argv<M: PhysMapper>(
    mapper: &M,
    frames: &[PhysicalPage<Size4K>],
    stack_base: VirtualAddress,
    argv: &[String],
) -> (VirtualAddress, VirtualAddress) {
    let stack_size = frames.len() as u64 * Size4K::SIZE;
    let mut cursor = stack_size;

    let mut pointers: Vec<u64> = Vec::with_capacity(argv.len() + 1);
    for arg in argv {
        cursor -= arg.len() as u64 + 1;
        write_stack_bytes(mapper, frames, cursor, arg.as_bytes());
        write_stack_bytes(mapper, frames, cursor + arg.len() as u64, &[0]);
        pointers.push(stack_base.as_u64() + cursor);
    }
    pointers.push(0);

    cursor = align_down(cursor, 8) - pointers.len() as u64 * 8;
    let argv_va = VirtualAddress::new(stack_base.as_u64() + cursor);
    for (i, p) in pointers.iter().enumerate() {
        write_stack_bytes(mapper, frames, cursor + i as u64 * 8, &p.to_le_bytes());
    }

    let rsp = VirtualAddress::new(stack_base.as_u64() + align_down(cursor, 16));
    (rsp, argv_va)
}

/// Write bytes at a byte offset into a stack described by its ordered
/// frames, crossing frame boundaries as needed.
fn write_stack_bytes<M: PhysMapper>(
    mapper: &M,
    frames: &[PhysicalPage<Size4K>],
    offset: u64,
    bytes: &[u8],
) {
    for (i, b) in bytes.iter().enumerate() {
        let pos = offset + i as u64;
        let frame = frames[usize::try_from(pos / Size4K::SIZE).expect("offset fits")];
        let pa = frame.base() + pos % Size4K::SIZE;
        // Safety: the frames belong to a stack object not yet visible to any
        // running process.
        unsafe { *mapper.phys_to_mut::<u8>(pa) = *b };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_layout::kernel_vspace_range;
    use kernel_paging::sim::{SimFrames, SimMmu, SimRam};

    struct Fixture {
        pool: SimFrames,
        kvspace: VSpace<'static, SimRam>,
        mmu: SimMmu,
    }

    // Tests lean on a leaked SimRam so the mapper outlives the scheduler
    // without lifetime gymnastics.
    fn fixture(frames: usize) -> (&'static SimRam, Fixture) {
        let ram: &'static SimRam = Box::leak(Box::new(SimRam::with_frames(frames)));
        let mut pool = SimFrames::new(ram, frames as u64);
        let mut kvspace = VSpace::create(ram, &mut pool, kernel_vspace_range()).unwrap();
        let mmu = SimMmu::new(kvspace.root());
        // Kernel-space sharing copies PML4 slot 0, which must be populated;
        // give the kernel span one mapped page like a booted kernel has.
        let _heap = kvspace.allocate_size(&mut pool, &mmu, 4096, 1).unwrap();
        (ram, Fixture { pool, kvspace, mmu })
    }

    fn entry(n: u64) -> VirtualAddress {
        VirtualAddress::new(kernel_layout::KERNEL_VSPACE_START + 0x1000 * n)
    }

    #[test]
    fn kernel_spawn_primes_the_snapshot() {
        let (ram, mut fx) = fixture(512);
        let mut sched = Scheduler::new(ram, fx.kvspace.root());

        let pid = sched
            .spawn_kernel(&mut fx.kvspace, &mut fx.pool, &fx.mmu, "ticker", entry(1))
            .unwrap();
        let proc = sched.process(pid).unwrap();
        assert_eq!(proc.state(), ProcessState::NotStarted);
        assert!(proc.is_kernel_process());
        assert_eq!(proc.saved_registers().rip, entry(1).as_u64());
        assert_eq!(proc.saved_registers().cs, KERNEL_CS);
        assert_eq!(proc.saved_registers().rflags, INITIAL_RFLAGS);
        // The stack is mapped in kernel space and the primed rsp points into
        // it.
        let rsp = VirtualAddress::new(proc.saved_registers().rsp);
        assert!(fx.kvspace.query(VirtualAddress::new(rsp.as_u64() - 8)).is_some());
        assert!(rsp.is_aligned_to(DEFAULT_STACK_ALIGNMENT));
    }

    #[test]
    fn round_robin_is_fifo_and_slices_are_fixed() {
        let (ram, mut fx) = fixture(1024);
        let mut sched = Scheduler::new(ram, fx.kvspace.root());

        let pids: Vec<Pid> = (0..3)
            .map(|i| {
                sched
                    .spawn_kernel(&mut fx.kvspace, &mut fx.pool, &fx.mmu, "spin", entry(i))
                    .unwrap()
            })
            .collect();

        // Within N * TICKS_PER_SLICE ticks every process runs once, in
        // spawn order.
        let mut order = Vec::new();
        let mut ticks = 0u64;
        for _ in 0..pids.len() {
            let resume = sched.schedule();
            order.push(resume.pid);
            loop {
                ticks += 1;
                if sched.tick() {
                    break;
                }
            }
            sched.suspend_current(resume.regs);
        }
        assert_eq!(order, pids);
        assert_eq!(ticks, pids.len() as u64 * TICKS_PER_SLICE);

        // The rotation continues from the front.
        assert_eq!(sched.schedule().pid, pids[0]);
    }

    #[test]
    fn blocking_spawn_parks_the_parent_until_child_exit() {
        let (ram, mut fx) = fixture(1024);
        let mut sched = Scheduler::new(ram, fx.kvspace.root());

        let parent = sched
            .spawn_kernel(&mut fx.kvspace, &mut fx.pool, &fx.mmu, "parent", entry(1))
            .unwrap();
        let resume = sched.schedule();
        assert_eq!(resume.pid, parent);

        let child = sched
            .spawn_kernel_with(
                &mut fx.kvspace,
                &mut fx.pool,
                &fx.mmu,
                "child",
                entry(2),
                ExecFlags::IS_BLOCKING,
            )
            .unwrap();
        assert_eq!(sched.process(parent).unwrap().blockers(), &[child]);
        assert_eq!(sched.process(child).unwrap().parent(), Some(parent));

        // Parent yields and is now skipped, but stays queued.
        sched.suspend_current(resume.regs);
        let resume = sched.schedule();
        assert_eq!(resume.pid, child);
        assert!(sched.is_queued(parent));

        sched
            .exit_current(&mut fx.kvspace, &mut fx.pool, &fx.mmu)
            .unwrap();
        assert!(sched.process(child).is_none());
        let parent_proc = sched.process(parent).unwrap();
        assert!(parent_proc.blockers().is_empty());
        assert!(parent_proc.children().is_empty());

        // Parent is runnable again.
        assert_eq!(sched.schedule().pid, parent);
    }

    #[test]
    fn orphans_go_to_init_and_the_rest_die_with_their_parent() {
        let (ram, mut fx) = fixture(2048);
        let mut sched = Scheduler::new(ram, fx.kvspace.root());

        let init = sched
            .spawn_kernel(&mut fx.kvspace, &mut fx.pool, &fx.mmu, "init", entry(0))
            .unwrap();
        sched.set_init(init);

        let resume = sched.schedule();
        assert_eq!(resume.pid, init);
        let a = sched
            .spawn_kernel(&mut fx.kvspace, &mut fx.pool, &fx.mmu, "a", entry(1))
            .unwrap();
        sched.suspend_current(resume.regs);

        let resume = sched.schedule();
        assert_eq!(resume.pid, a);
        let b = sched
            .spawn_kernel(&mut fx.kvspace, &mut fx.pool, &fx.mmu, "b", entry(2))
            .unwrap();
        let c = sched
            .spawn_kernel_with(
                &mut fx.kvspace,
                &mut fx.pool,
                &fx.mmu,
                "c",
                entry(3),
                ExecFlags::CAN_BE_ORPHANED,
            )
            .unwrap();

        let held = fx.pool.allocated();
        sched
            .exit_current(&mut fx.kvspace, &mut fx.pool, &fx.mmu)
            .unwrap();

        // B went down with its parent; C was adopted and stays schedulable.
        assert!(sched.process(b).is_none());
        assert!(!sched.is_queued(b));
        let c_proc = sched.process(c).unwrap();
        assert_eq!(c_proc.parent(), Some(init));
        assert!(sched.process(init).unwrap().children().contains(&c));
        assert!(sched.is_queued(c));

        // At least A's and B's stacks (64 frames each) came back, plus their
        // header pages and whatever page tables emptied out.
        assert!(held - fx.pool.allocated() >= 2 * 64);
    }

    struct FakeLoader;

    impl ImageLoader for FakeLoader {
        fn load<A: FrameSource>(
            &mut self,
            alloc: &mut A,
            path: &str,
        ) -> Result<LoadedImage, LoadError> {
            if path == "/missing" {
                return Err(LoadError::NotFound {
                    path: path.to_string(),
                });
            }
            let object = VObject::create(alloc, 2 * 4096)?;
            let entry_offset = if path == STUB_PATH { 0x40 } else { 0x80 };
            Ok(LoadedImage {
                object,
                entry_offset,
            })
        }
    }

    #[test]
    fn user_spawn_wires_stub_entry_and_argv() {
        let (ram, mut fx) = fixture(2048);
        let mut sched = Scheduler::new(ram, fx.kvspace.root());
        let baseline = fx.pool.allocated();

        let pid = sched
            .spawn_user(
                &mut fx.pool,
                &fx.mmu,
                &mut FakeLoader,
                "/bin/sh",
                &["-l", "-x"],
                ExecFlags::empty(),
            )
            .unwrap();
        let proc = sched.process(pid).unwrap();
        assert!(!proc.is_kernel_process());
        assert_eq!(proc.name(), "sh");
        assert_eq!(proc.pwd(), "/");

        let regs = *proc.saved_registers();
        assert_eq!(regs.rdi, 3, "argc counts the program name");
        assert_eq!(regs.rip % 4096, 0x40, "stub entry offset");
        assert_eq!(regs.rdx % 4096, 0x80, "executable entry offset");
        assert_eq!(regs.rsp % 16, 0);

        // Follow rsi through the process's own page tables and read argv[0]
        // back out of physical memory.
        let vspace = proc.vspace.as_ref().unwrap();
        let argv0_ptr_pa = vspace.query(VirtualAddress::new(regs.rsi)).unwrap();
        let argv0_va = u64::from_le_bytes(
            *unsafe { ram.phys_to_mut::<[u8; 8]>(argv0_ptr_pa) },
        );
        let argv0_pa = vspace.query(VirtualAddress::new(argv0_va)).unwrap();
        let bytes = unsafe { ram.phys_to_mut::<[u8; 8]>(argv0_pa) };
        assert_eq!(&bytes[..7], b"/bin/sh");
        assert_eq!(bytes[7], 0);

        // Schedule it: the resume carries the process's own root.
        let resume = sched.schedule();
        assert_eq!(resume.pid, pid);
        assert_ne!(resume.root, fx.kvspace.root());

        // Full teardown returns every frame the spawn took.
        sched
            .exit_current(&mut fx.kvspace, &mut fx.pool, &fx.mmu)
            .unwrap();
        assert_eq!(fx.pool.allocated(), baseline);
    }

    #[test]
    fn failed_load_reports_and_leaks_nothing() {
        let (ram, mut fx) = fixture(1024);
        let mut sched = Scheduler::new(ram, fx.kvspace.root());
        let baseline = fx.pool.allocated();

        let result = sched.spawn_user(
            &mut fx.pool,
            &fx.mmu,
            &mut FakeLoader,
            "/missing",
            &[],
            ExecFlags::empty(),
        );
        assert!(matches!(result, Err(SpawnError::Load(LoadError::NotFound { .. }))));
        assert_eq!(sched.process_count(), 0);
        assert_eq!(fx.pool.allocated(), baseline);
    }

    #[test]
    fn oversized_argv_is_rejected_before_anything_is_built() {
        let (ram, mut fx) = fixture(2048);
        let mut sched = Scheduler::new(ram, fx.kvspace.root());
        let baseline = fx.pool.allocated();

        // One argument close to the full stack size would walk the argv
        // cursor straight off the bottom of the stack.
        let huge = "x".repeat(200 * 1024);
        let result = sched.spawn_user(
            &mut fx.pool,
            &fx.mmu,
            &mut FakeLoader,
            "/bin/sh",
            &[huge.as_str()],
            ExecFlags::empty(),
        );
        assert!(matches!(result, Err(SpawnError::ArgvTooLarge { .. })));
        assert_eq!(sched.process_count(), 0);
        assert_eq!(fx.pool.allocated(), baseline);
    }

    #[test]
    fn exit_reclaims_runtime_objects_charged_to_the_process() {
        let (ram, mut fx) = fixture(1024);
        let mut sched = Scheduler::new(ram, fx.kvspace.root());

        let pid = sched
            .spawn_kernel(&mut fx.kvspace, &mut fx.pool, &fx.mmu, "worker", entry(1))
            .unwrap();
        let resume = sched.schedule();
        assert_eq!(resume.pid, pid);
        let baseline = fx.pool.allocated();

        // A runtime allocation charged to the process, as the alloc syscall
        // does it.
        let mut obj = VObject::create(&mut fx.pool, 8 * 4096).unwrap();
        let va = obj.map_into(&mut fx.kvspace, &mut fx.pool, &fx.mmu).unwrap();
        sched.process_mut(pid).unwrap().adopt_object(obj);
        assert_eq!(sched.process(pid).unwrap().object_count(), 1);
        assert!(fx.kvspace.query(va).is_some());

        // The process never frees it; exit does.
        sched
            .exit_current(&mut fx.kvspace, &mut fx.pool, &fx.mmu)
            .unwrap();
        assert!(fx.kvspace.query(va).is_none());
        assert!(fx.pool.allocated() < baseline);
    }

    #[test]
    #[should_panic(expected = "every process is blocked or the queue is empty")]
    fn scheduling_with_nothing_runnable_is_fatal() {
        let (ram, fx) = fixture(64);
        let mut sched: Scheduler<'_, SimRam> = Scheduler::new(ram, fx.kvspace.root());
        let _ = sched.schedule();
    }
}
