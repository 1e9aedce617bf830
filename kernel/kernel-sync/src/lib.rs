//! # Kernel Synchronization Primitives
//!
//! Two small pieces:
//!
//! - [`IrqGuard`] — an RAII non-preemptible section. On a single-core kernel,
//!   disabling interrupts *is* mutual exclusion; the allocators in this
//!   workspace have no internal locking and rely on their entry points being
//!   wrapped in one of these.
//! - [`SpinLock`] — a minimal test-and-set lock for the few places that need
//!   a `Sync` container (logger, global allocator).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;

pub use irq::IrqGuard;
pub use spin_lock::{SpinLock, SpinLockGuard};
