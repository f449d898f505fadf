//! # Processes and Scheduling
//!
//! The process half of the kernel: process records, the priority scheduler,
//! the context-switch trampoline, system calls, named-channel IPC and
//! deferred kernel work, all hanging off one [`Kernel`] value.
//!
//! ```text
//!   int 0x5C / IRQ 0                                   iret
//!         │                                              ▲
//!   ┌─────▼──────┐   RegisterDump   ┌────────────────────┴─┐
//!   │ asm stub   ├─────────────────►│ Kernel::enter        │
//!   └────────────┘                  │  ├ syscall::dispatch │──► ipc, work
//!                                   │  ├ Scheduler         │
//!                                   │  └ resume            │
//!                                   └─────────┬────────────┘
//!                                             │ KernelMemory, AddressSpace
//!                                             ▼
//!                                        kernel-vmem
//! ```
//!
//! ## Blocking
//!
//! Nothing in here waits in a loop. An operation that cannot complete yet
//! parks the process (state `Waiting`, with a [`WaitReason`]) and returns
//! [`Poll::Pending`](core::task::Poll::Pending). The event it waits for
//! makes it runnable again, and the operation is simply called once more:
//! system calls do that by rewinding the user `eip` over the `int`
//! instruction, so the same call runs again when the process is resumed.
//!
//! ## Hardware
//!
//! Everything the task layer needs from the CPU goes through
//! [`arch::Platform`]. [`hosted`] provides a simulated platform and, together
//! with `kernel_vmem::hosted`, lets the whole layer run as a host program:
//!
//! ```rust
//! use kernel_info::boot::MemoryRegion;
//! use kernel_task::{RegisterDump, SpawnOptions, Trap, hosted};
//!
//! let mut kernel = hosted::boot(&[MemoryRegion::available(0, 16 << 20)]).unwrap();
//! let init = kernel.spawn_init(&SpawnOptions::new("init", 0x0804_8000)).unwrap();
//! kernel.start();
//!
//! let mut dump = RegisterDump::default();
//! kernel.enter(&mut dump, Trap::Timer).unwrap();
//! assert_eq!(kernel.scheduler().current(), Some(init));
//! assert_eq!(dump.registers().eip, 0x0804_8000);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod arch;
pub mod fatal;
pub mod hosted;
pub mod ipc;
pub mod kernel;
pub mod process;
pub mod process_ref;
pub mod registers;
pub mod scheduler;
pub mod syscall;
pub mod trampoline;
pub mod work;

pub use crate::arch::Platform;
pub use crate::fatal::Fatal;
pub use crate::ipc::{ChannelMode, ChannelReceiver, IpcError, Message};
pub use crate::kernel::{EXIT_KILLED, Kernel};
pub use crate::process::{Process, ProcessId, ProcessState, SpawnOptions, WaitReason};
pub use crate::process_ref::{ProcessRef, StaleReference};
pub use crate::registers::{CpuRegisters, RegisterDump};
pub use crate::scheduler::{SchedError, Scheduler};
pub use crate::syscall::{SyscallError, SyscallOutcome};
pub use crate::trampoline::Trap;
pub use crate::work::{Job, WorkError, WorkId};
