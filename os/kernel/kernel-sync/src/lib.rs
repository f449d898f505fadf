//! # Kernel synchronization primitives
//!
//! The kernel runs on a single CPU, so most of its state is protected by
//! masking interrupts rather than by locks. [`IrqGuard`] does that through an
//! [`InterruptControl`] implementation: [`X86Interrupts`] on real hardware and
//! [`InterruptFlag`] when the kernel runs hosted. [`SpinLock`] covers the few
//! places that are shared by reference, like per-process mailboxes.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;

pub use irq::{InterruptControl, InterruptFlag, IrqGuard};
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub use irq::X86Interrupts;
pub use spin_lock::{SpinLock, SpinLockGuard};
