//! # Hosted Platform
//!
//! Runs the task layer as an ordinary program: the interrupt flag lives in
//! memory, `esp0` is recorded instead of written to a TSS, and halting pops
//! the next interrupt off a scripted queue. Together with
//! [`kernel_vmem::hosted`] this is what the test suites boot.

use crate::arch::Platform;
use crate::kernel::Kernel;
use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_info::boot::MemoryRegion;
use kernel_sync::{InterruptControl, InterruptFlag};
use kernel_vmem::hosted::HostedMapper;
use kernel_vmem::MemoryError;

/// Return address of the simulated exit trampoline.
pub const HOSTED_EXIT_TRAMPOLINE: u32 = 0x0804_0000;

#[derive(Debug)]
pub struct HostedPlatform {
    interrupts: InterruptFlag,
    unmasks: AtomicUsize,
    kernel_stack: u32,
    pending: VecDeque<u8>,
    halts: usize,
}

impl HostedPlatform {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            interrupts: InterruptFlag::new(false),
            unmasks: AtomicUsize::new(0),
            kernel_stack: 0,
            pending: VecDeque::new(),
            halts: 0,
        }
    }

    /// Queues `irq` for the next halt.
    pub fn raise(&mut self, irq: u8) {
        self.pending.push_back(irq);
    }

    /// Last value given to [`Platform::set_kernel_stack`].
    #[must_use]
    pub const fn kernel_stack(&self) -> u32 {
        self.kernel_stack
    }

    /// How often the CPU was halted.
    #[must_use]
    pub const fn halts(&self) -> usize {
        self.halts
    }

    /// How often interrupts were enabled.
    #[must_use]
    pub fn unmasks(&self) -> usize {
        self.unmasks.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl Default for HostedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptControl for HostedPlatform {
    fn enabled(&self) -> bool {
        self.interrupts.enabled()
    }

    fn disable(&self) {
        self.interrupts.disable();
    }

    fn enable(&self) {
        self.unmasks.fetch_add(1, Ordering::Relaxed);
        self.interrupts.enable();
    }
}

impl Platform for HostedPlatform {
    fn set_kernel_stack(&mut self, esp0: u32) {
        self.kernel_stack = esp0;
    }

    fn wait_for_interrupt(&mut self) -> Option<u8> {
        debug_assert!(self.enabled(), "halting with interrupts masked");
        self.halts += 1;
        self.pending.pop_front()
    }

    fn exit_trampoline(&self) -> u32 {
        HOSTED_EXIT_TRAMPOLINE
    }
}

pub type HostedKernel = Kernel<HostedMapper, HostedPlatform>;

/// A kernel over freshly simulated RAM, with no processes yet.
///
/// # Errors
/// The memory map is too small for the shared kernel tables.
pub fn boot(regions: &[MemoryRegion]) -> Result<HostedKernel, MemoryError> {
    let memory = kernel_vmem::hosted::boot(regions)?;
    Ok(Kernel::new(memory, HostedPlatform::new()))
}
