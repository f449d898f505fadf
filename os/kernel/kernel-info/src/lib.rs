//! # Kernel Configuration and Boot Interface
//!
//! This crate is the single source of truth for the kernel's compile-time
//! configuration: the 32-bit virtual memory layout, the scheduler tuning
//! knobs, the CPU selectors and flags the context switch relies on, and the
//! memory map handed over by the boot loader.
//!
//! ## Virtual Memory Architecture
//!
//! Every process sees the same 3/1 GiB split. The lower three gigabytes are
//! private to the process, the upper gigabyte belongs to the kernel and is
//! identical in every page directory.
//!
//! ```text
//! Virtual Address Space Layout (32-bit):
//!
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │   Null Guard (never mapped)     │
//! 0x0000_1000 ├─────────────────────────────────┤
//!             │         User Space              │
//!             │  (image, heap from break_val)   │
//!             │                                 │
//! 0xBFFF_C000 ├─────────────────────────────────┤ PROCESS_STACK_PAGES below
//!             │         User Stack              │ the split
//! KERNEL_BASE ├─────────────────────────────────┤ 0xC000_0000 (directory slot 768)
//!             │   Kernel Image (shared table)   │
//! 0xC040_0000 ├─────────────────────────────────┤ KERNEL_WINDOW_START
//!             │   Initial Kernel Heap           │
//!             ├─────────────────────────────────┤
//!             │   Kernel Window (temporary      │
//!             │   mappings, stacks, buffers)    │
//! 0xFFC0_0000 ├─────────────────────────────────┤ KERNEL_WINDOW_END (slot 1023)
//!             │   Recursive Page Tables         │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! Directory slot 0 (identity mapping of low memory) and slot 768 (the kernel
//! image) are linked into every address space and never copied on fork.
//!
//! ## Modules
//!
//! * [`memory`]: address space layout, page and stack sizes, buddy orders.
//! * [`sched`]: priority levels, timeslice, reserved and restart PIDs.
//! * [`cpu`]: GDT selectors, `EFLAGS` bits, IRQ lines.
//! * [`boot`]: the boot loader's physical memory map.
//!
//! ## Configuration Management
//!
//! All values are `const` and validated at compile time with `const`
//! assertions, so an inconsistent layout fails the build rather than the
//! boot.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod cpu;
pub mod memory;
pub mod sched;
