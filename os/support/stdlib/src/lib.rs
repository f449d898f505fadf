//! # System Call Interface
//!
//! Shared between the kernel and user programs:
//!
//! - [`syscall_abi`] (feature `syscall-abi`): call numbers, the interrupt
//!   vector, sentinels and the `#[repr(C)]` structures passed through user
//!   memory. The kernel enables only this part via the `kernel` feature.
//! - [`syscall`] (feature `syscall`): `int 0x5C` stubs for 32-bit x86 user
//!   programs.
//!
//! ## Calling Convention
//!
//! | Register | Content |
//! |----------|---------|
//! | `eax`    | call number in, return value out |
//! | `ebx`, `ecx`, `edx`, `esi`, `edi` | arguments 1 to 5 |
//!
//! All other registers are preserved. Failing calls return
//! [`SYSCALL_ERROR`](syscall_abi::SYSCALL_ERROR).

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(feature = "syscall"), forbid(unsafe_code))]
#![cfg_attr(feature = "syscall", allow(unsafe_code))]

#[cfg(feature = "syscall")]
pub mod syscall;

#[cfg(feature = "syscall-abi")]
pub mod syscall_abi;
