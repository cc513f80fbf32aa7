//! Meridian OS Kernel
//!
//! A small teaching-style kernel for x86_64, built around a cooperative
//! execution model for user tasks.
//!
//! # Architecture Overview
//!
//! The kernel's major subsystems:
//!
//! - **task** - task table, generation-stamped ids, lifecycle, ELF loading
//! - **sched** - cooperative round-robin scheduler
//! - **trap** - trap/interrupt dispatch, page-fault upcalls
//! - **syscall** - the validating system-call surface
//! - **ipc** - synchronous rendezvous message passing
//! - **signal** - POSIX-style signals delivered through the upcall path
//! - **mm** - address spaces, frame allocator, user-memory access rules
//! - **vsys** - the read-only vsyscall page
//! - **arch** - GDT/IDT, PIC, PIT tick, CMOS clock, port I/O
//! - **console** / **serial** / **klog** - I/O and diagnostics
//!
//! # Execution model
//!
//! Single CPU. Kernel code runs with interrupts disabled; user tasks
//! run with them enabled. Every kernel entry is a trap carrying a full
//! saved register frame, and every kernel exit restores one — either
//! the task's interrupted frame or one rewritten to divert the task
//! into its user-space upcall (page faults and signal delivery).

#![no_std]
// Kernel-specific lint configuration:
// - static_mut_refs: the single-CPU model makes the global task table a
//   plain static reached from trap context
// - missing_safety_doc: in a kernel, most low-level functions are unsafe
//   by nature
#![allow(static_mut_refs)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::new_without_default)]
#![allow(clippy::result_unit_err)]

#[cfg(test)]
extern crate std;

pub mod arch;
pub mod boot;
pub mod console;
pub mod error;
pub mod ipc;
pub mod klog;
pub mod mm;
pub mod sched;
pub mod serial;
pub mod signal;
pub mod syscall;
pub mod task;
pub mod trap;
pub mod vsys;
