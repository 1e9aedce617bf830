//! # Processes and the Round-Robin Scheduler
//!
//! The process control block ([`Process`]), its register snapshot
//! ([`SavedRegisters`]), and the [`Scheduler`] state machine that owns every
//! process and decides who runs next.
//!
//! The state machine is deliberately split from the hardware: all transitions
//! (spawn, suspend, schedule, tick, exit, kill) are ordinary methods over
//! ordinary data, and the only hardware-facing output is a [`Resume`] record
//! telling the caller which translation root to activate and which registers
//! to restore. The context-switch instruction sequence itself lives with the
//! rest of the architecture glue, not here — which is also what makes every
//! scheduling decision testable on the host.
//!
//! Execution states move strictly `NotStarted → Running → Terminated`.
//! Waiting is not a state: a process with a non-empty blocker set (pids it
//! waits on) simply gets skipped by [`Scheduler::schedule`] while staying in
//! the rotation.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod process;
mod scheduler;

pub use process::{
    ExecFlags, INITIAL_RFLAGS, KERNEL_CS, KERNEL_SS, Pid, Process, ProcessState, SavedRegisters,
};
pub use scheduler::{
    ImageLoader, LoadError, LoadedImage, Resume, STUB_PATH, Scheduler, SpawnError,
};
