//! # CPU Constants
//!
//! Segment selectors follow the boot GDT: null, kernel code, kernel data,
//! user code, user data, TSS. User selectors carry RPL 3.

pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
pub const USER_CODE_SELECTOR: u16 = 0x18 | 3;
pub const USER_DATA_SELECTOR: u16 = 0x20 | 3;

/// Requested privilege level mask of a selector.
pub const SELECTOR_RPL_MASK: u16 = 0b11;

/// Interrupt enable flag (`EFLAGS.IF`, bit 9).
pub const EFLAGS_IF: u32 = 1 << 9;

/// CPUID availability flag (`EFLAGS.ID`, bit 21).
pub const EFLAGS_ID: u32 = 1 << 21;

/// Lines on the cascaded legacy PICs.
pub const IRQ_LINES: usize = 16;

/// The PIT's line.
pub const TIMER_IRQ: u8 = 0;

const _: () = {
    assert!(USER_CODE_SELECTOR & SELECTOR_RPL_MASK == 3);
    assert!(KERNEL_CODE_SELECTOR & SELECTOR_RPL_MASK == 0);
};
