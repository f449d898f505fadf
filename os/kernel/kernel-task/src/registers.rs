//! # Saved CPU State
//!
//! The interrupt stubs store the interrupted state in a [`RegisterDump`] and
//! load it back before `iret`, including `cr3`. The layout is shared with
//! the assembly and must not change:
//!
//! ```text
//! offset  0  eax ebx ecx edx esi edi eip eflags esp ebp   (u32 each)
//! offset 40  cs ds es fs gs ss                           (u16 each)
//! offset 52  cr3
//! offset 56  kernel_stack                                 (60 bytes total)
//! ```

use core::mem::offset_of;
use kernel_info::cpu::{
    EFLAGS_ID, EFLAGS_IF, KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, SELECTOR_RPL_MASK,
    USER_CODE_SELECTOR, USER_DATA_SELECTOR,
};

/// One register snapshot of a process.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct CpuRegisters {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub eip: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ebp: u32,
    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub ss: u16,
    pub cr3: u32,
    /// Top of the kernel stack loaded into the TSS when this process runs.
    pub kernel_stack: u32,
}

const _: () = {
    assert!(size_of::<CpuRegisters>() == 60);
    assert!(offset_of!(CpuRegisters, ebp) == 36);
    assert!(offset_of!(CpuRegisters, cs) == 40);
    assert!(offset_of!(CpuRegisters, ss) == 50);
    assert!(offset_of!(CpuRegisters, cr3) == 52);
    assert!(offset_of!(CpuRegisters, kernel_stack) == 56);
};

impl CpuRegisters {
    /// A fresh context starting at `eip` with interrupts and CPUID enabled.
    #[must_use]
    pub fn entry(eip: u32, user_mode: bool) -> Self {
        let mut regs = Self {
            eip,
            eflags: EFLAGS_IF | EFLAGS_ID,
            ..Self::default()
        };
        if user_mode {
            regs.set_segments(USER_CODE_SELECTOR, USER_DATA_SELECTOR);
        } else {
            regs.set_segments(KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR);
        }
        regs
    }

    pub const fn set_segments(&mut self, code: u16, data: u16) {
        self.cs = code;
        self.ds = data;
        self.es = data;
        self.fs = data;
        self.gs = data;
        self.ss = data;
    }

    /// Whether the snapshot was taken in ring 3.
    #[must_use]
    pub const fn is_user_mode(&self) -> bool {
        self.cs & SELECTOR_RPL_MASK == SELECTOR_RPL_MASK
    }

    /// System call arguments in ABI order.
    #[must_use]
    pub const fn syscall_args(&self) -> [u32; 5] {
        [self.ebx, self.ecx, self.edx, self.esi, self.edi]
    }

    /// Copies the dump into this snapshot, keeping `kernel_stack`.
    pub const fn capture(&mut self, dump: &RegisterDump) {
        let kernel_stack = self.kernel_stack;
        *self = dump.0;
        self.kernel_stack = kernel_stack;
    }

    /// Copies this snapshot into the dump, keeping the dump's `kernel_stack`.
    pub const fn restore(&self, dump: &mut RegisterDump) {
        let kernel_stack = dump.0.kernel_stack;
        dump.0 = *self;
        dump.0.kernel_stack = kernel_stack;
    }
}

/// The area the interrupt stubs save into and load from.
#[repr(transparent)]
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct RegisterDump(CpuRegisters);

impl RegisterDump {
    #[must_use]
    pub const fn new(regs: CpuRegisters) -> Self {
        Self(regs)
    }

    #[must_use]
    pub const fn registers(&self) -> &CpuRegisters {
        &self.0
    }

    pub const fn registers_mut(&mut self) -> &mut CpuRegisters {
        &mut self.0
    }

    /// The call number of a system call trap.
    #[must_use]
    pub const fn syscall_number(&self) -> u32 {
        self.0.eax
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_and_restore_keep_kernel_stack() {
        let mut dump = RegisterDump::new(CpuRegisters {
            eax: 7,
            eip: 0x0804_8000,
            kernel_stack: 0xDEAD_0000,
            ..CpuRegisters::default()
        });
        let mut regs = CpuRegisters {
            kernel_stack: 0xC050_4000,
            ..CpuRegisters::default()
        };
        regs.capture(&dump);
        assert_eq!(regs.eax, 7);
        assert_eq!(regs.eip, 0x0804_8000);
        assert_eq!(regs.kernel_stack, 0xC050_4000);

        regs.eax = 9;
        regs.restore(&mut dump);
        assert_eq!(dump.registers().eax, 9);
        assert_eq!(dump.registers().kernel_stack, 0xDEAD_0000);
    }

    #[test]
    fn entry_selectors() {
        let user = CpuRegisters::entry(0x0804_8000, true);
        assert!(user.is_user_mode());
        assert_eq!(user.ss, USER_DATA_SELECTOR);
        assert_eq!(user.eflags & EFLAGS_IF, EFLAGS_IF);

        let kernel = CpuRegisters::entry(0xC010_0000, false);
        assert!(!kernel.is_user_mode());
        assert_eq!(kernel.cs, KERNEL_CODE_SELECTOR);
    }
}
