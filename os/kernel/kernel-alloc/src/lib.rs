//! # Kernel Memory Allocators
//!
//! The two allocators everything else in the memory subsystem is built on:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │        Address spaces, page tables, kernel mmap     │   kernel-vmem
//! └───────────────┬─────────────────────────┬───────────┘
//!                 │ frames                  │ window addresses
//! ┌───────────────▼───────────┐ ┌───────────▼───────────┐
//! │   Buddy frame allocator   │ │ Virtual range alloc.  │
//! │  • orders 0..=8 (4K..1M)  │ │  • first fit          │
//! │  • per-order bitmaps      │ │  • coalescing free    │
//! │  • multi-range memory map │ │  • kernel window only │
//! └───────────────────────────┘ └───────────────────────┘
//! ```
//!
//! ## Physical Frames ([`buddy`])
//!
//! [`BuddyAllocator`](buddy::BuddyAllocator) is built once from the boot
//! memory map and lives for the rest of the kernel's life. Low memory holding
//! the kernel image is pinned with
//! [`restrict_range`](buddy::BuddyAllocator::restrict_range) right after.
//!
//! ```rust
//! use kernel_alloc::buddy::BuddyAllocator;
//! use kernel_info::boot::MemoryRegion;
//!
//! let mut frames = BuddyAllocator::new(&[MemoryRegion::available(0x10_0000, 0x10_0000)]);
//! let before = frames.clone();
//! let allocation = frames.allocate(3).unwrap();
//! assert_eq!(allocation.len(), 3);
//! frames.deallocate(allocation).unwrap();
//! assert_eq!(frames, before);
//! ```
//!
//! ## Kernel Virtual Addresses ([`vrange`])
//!
//! [`VirtualRangeAllocator`](vrange::VirtualRangeAllocator) hands out page
//! runs of the kernel window for temporary mappings of page tables, kernel
//! stacks and device buffers.
//!
//! ## Concurrency
//!
//! Neither allocator locks. The kernel owns a single instance of each and only
//! touches them with interrupts masked on its only CPU. In particular the
//! multi-block path of [`allocate`](buddy::BuddyAllocator::allocate) is not
//! atomic with respect to an interrupt handler that frees frames.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod buddy;
pub mod vrange;

pub use buddy::{Block, BuddyAllocator, FrameAllocation, FrameError};
pub use vrange::{RangeError, VirtualRange, VirtualRangeAllocator};
