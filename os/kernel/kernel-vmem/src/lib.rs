//! # Virtual Memory Support
//!
//! 32-bit (non-PAE) x86 paging for the kernel and its processes.
//!
//! ## Address Translation
//!
//! A 32-bit virtual address is split into three fields:
//!
//! ```text
//! | 31‒22     | 21‒12 | 11‒0   |
//! | Directory | Table | Offset |
//! ```
//!
//! `CR3` holds the physical address of a page directory of 1024 entries. Each
//! present directory entry points at a page table of 1024 entries, and each
//! present table entry maps one 4 KiB frame. Both levels use the same entry
//! format, [`PageEntryBits`].
//!
//! ## Layout of an Address Space
//!
//! ```text
//! 0x0000_0000 ┌────────────────────────────┐ slot 0: low memory, shared
//! 0x0040_0000 ├────────────────────────────┤
//!             │ user code, heap            │ owned by the AddressSpace
//! 0xBFFF_C000 │ user stack (4 pages)       │
//! 0xC000_0000 ├────────────────────────────┤ slot 768: kernel image, shared
//! 0xC040_0000 │ kernel window              │ kernel tables, synced on fault
//! 0xFFC0_0000 ├────────────────────────────┤ slot 1023: recursive
//!             └────────────────────────────┘
//! ```
//!
//! ## Pieces
//!
//! - [`KernelMemory`]: frame allocator, kernel window and [`KernelMapper`]
//!   bundled into the services everything else uses: temporary frame
//!   mappings, frame copies, kernel `mmap`, device mappings.
//! - [`PageTable`]: one directory or table frame with its temporary mapping.
//! - [`AddressSpace`]: a process's directory and tables, with `map`, `unmap`,
//!   `get`, fork duplication, and reads and writes of its memory.
//! - [`fault`]: page-fault resolution.
//! - [`hosted`]: host-backed physical memory for tests.
//!
//! ## Example
//!
//! ```rust
//! use kernel_info::boot::MemoryRegion;
//! use kernel_memory_addresses::VirtualAddress;
//! use kernel_vmem::{AddressSpace, PageEntryBits, hosted};
//!
//! let mut mem = hosted::boot(&[MemoryRegion::available(0, 8 << 20)]).unwrap();
//! let mut space = AddressSpace::new(&mut mem).unwrap();
//! let va = VirtualAddress::new(0x0804_8000);
//! space.map_new(&mut mem, va, PageEntryBits::user_rw()).unwrap();
//! space.write(&mut mem, va + 4, b"hello").unwrap();
//!
//! let mut buf = [0; 5];
//! space.read(&mut mem, va + 4, &mut buf).unwrap();
//! assert_eq!(&buf, b"hello");
//! space.release(&mut mem);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod address_space;
pub mod fault;
pub mod hosted;
pub mod kernel_memory;
mod mapper;
mod page_entry_bits;
pub mod page_table;
#[cfg(target_arch = "x86")]
pub mod recursive;
mod table;

pub use crate::address_space::AddressSpace;
pub use crate::kernel_memory::{KernelMemory, MemoryError};
pub use crate::mapper::KernelMapper;
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::PageTable;
pub use crate::table::{PageTableEntry, RawTable};
