//! # Memory Layout

/// Size of a page frame and of a virtual page, in bytes.
pub const PAGE_SIZE: u32 = 0x1000;

/// Number of entries in a page directory or page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// The user/kernel split. Everything at or above belongs to the kernel.
pub const KERNEL_BASE: u32 = 0xC000_0000;

/// Accesses below this address are treated as null pointer dereferences.
pub const NULL_GUARD_END: u32 = 0x1000;

/// Directory slot holding the identity mapping of low physical memory.
pub const IDENTITY_SLOT: usize = 0;

/// Directory slot holding the kernel image at [`KERNEL_BASE`].
pub const HIGHER_HALF_SLOT: usize = (KERNEL_BASE >> 22) as usize;

/// Directory slot that points back at the directory itself.
pub const RECURSIVE_SLOT: usize = ENTRIES_PER_TABLE - 1;

/// Where the page tables appear through [`RECURSIVE_SLOT`].
pub const RECURSIVE_TABLES_BASE: u32 = 0xFFC0_0000;

/// Where the active page directory appears through [`RECURSIVE_SLOT`].
pub const RECURSIVE_DIRECTORY: u32 = 0xFFFF_F000;

/// Start of the kernel's private virtual address window.
pub const KERNEL_WINDOW_START: u32 = 0xC040_0000;

/// Bytes at the start of the window occupied by the boot-time kernel heap.
pub const KERNEL_HEAP_INITIAL: u32 = 0x40_0000;

/// End (exclusive) of the kernel's private virtual address window.
pub const KERNEL_WINDOW_END: u32 = RECURSIVE_TABLES_BASE;

/// Physical memory below this address holds the kernel image, the boot
/// page tables and the BIOS areas, and is never handed out.
pub const LOW_MEMORY_RESERVED: u32 = 0x40_0000;

/// Pages mapped for the user stack of a freshly spawned process.
pub const PROCESS_STACK_PAGES: u32 = 4;

/// Lowest address of a fresh process's stack.
pub const PROCESS_STACK_BOTTOM: u32 = KERNEL_BASE - PROCESS_STACK_PAGES * PAGE_SIZE;

/// Initial `esp`/`ebp` of a fresh process: room for the three-word call frame.
pub const INITIAL_STACK_POINTER: u32 = 0xBFFF_FFF0;

/// Pages of kernel stack given to each user-mode process.
pub const KERNEL_STACK_PAGES: u32 = 4;

/// Default initial program break of a spawned process.
pub const USER_HEAP_BASE: u32 = 0x1000_0000;

/// Highest buddy order: blocks of `1 << BUDDY_MAX_ORDER` frames (1 MiB).
pub const BUDDY_MAX_ORDER: u8 = 8;

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(HIGHER_HALF_SLOT == 768);
    assert!((RECURSIVE_TABLES_BASE >> 22) as usize == RECURSIVE_SLOT);
    assert!(((RECURSIVE_DIRECTORY >> 12) & 0x3FF) as usize == RECURSIVE_SLOT);
    assert!(KERNEL_WINDOW_START > KERNEL_BASE);
    assert!(KERNEL_WINDOW_START + KERNEL_HEAP_INITIAL < KERNEL_WINDOW_END);
    assert!(INITIAL_STACK_POINTER > PROCESS_STACK_BOTTOM);
    assert!(INITIAL_STACK_POINTER + 12 < KERNEL_BASE);
    assert!(USER_HEAP_BASE < PROCESS_STACK_BOTTOM);
    assert!(NULL_GUARD_END == PAGE_SIZE);
    assert!((PAGE_SIZE << BUDDY_MAX_ORDER) == 0x10_0000);
};
