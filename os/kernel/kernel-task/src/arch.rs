//! # Platform Seam
//!
//! What the task layer needs from the CPU beyond the interrupt flag: the
//! ring-0 stack loaded on privilege changes, a way to halt until an
//! interrupt arrives, and the address processes return to when their entry
//! point returns.
//!
//! [`X86Platform`] drives the real hardware on 32-bit x86;
//! [`HostedPlatform`](crate::hosted::HostedPlatform) simulates it.

use kernel_sync::InterruptControl;

pub trait Platform: InterruptControl {
    /// Stack pointer the CPU switches to when entering ring 0 (`TSS.esp0`).
    fn set_kernel_stack(&mut self, esp0: u32);

    /// Enables interrupts, halts until one arrives and masks them again.
    /// Returns the IRQ line that fired, or `None` when nothing ever will.
    fn wait_for_interrupt(&mut self) -> Option<u8>;

    /// Return address placed on every fresh process stack.
    fn exit_trampoline(&self) -> u32;
}

/// Installs [`kernel_qemu::QemuLogger`] as the `log` backend.
///
/// # Errors
/// Another logger was installed first.
#[cfg(feature = "qemu")]
pub fn init_logging(level: log::LevelFilter) -> Result<(), log::SetLoggerError> {
    kernel_qemu::QemuLogger::new(level).init()
}

#[cfg(target_arch = "x86")]
pub use x86::{X86Platform, raise_irq};

#[cfg(target_arch = "x86")]
mod x86 {
    use super::Platform;
    use core::ptr::NonNull;
    use core::sync::atomic::{AtomicU16, Ordering};
    use kernel_sync::{InterruptControl, X86Interrupts};

    /// One bit per PIC line, set by the interrupt stubs.
    static PENDING_IRQS: AtomicU16 = AtomicU16::new(0);

    /// Records that `irq` fired while the CPU was halted. Called from the
    /// IRQ stubs.
    pub fn raise_irq(irq: u8) {
        if irq < 16 {
            PENDING_IRQS.fetch_or(1 << irq, Ordering::AcqRel);
        }
    }

    fn take_pending() -> Option<u8> {
        let mut pending = PENDING_IRQS.load(Ordering::Acquire);
        while pending != 0 {
            #[allow(clippy::cast_possible_truncation)]
            let irq = pending.trailing_zeros() as u8;
            match PENDING_IRQS.compare_exchange(
                pending,
                pending & !(1 << irq),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(irq),
                Err(now) => pending = now,
            }
        }
        None
    }

    pub struct X86Platform {
        esp0: NonNull<u32>,
        exit_trampoline: u32,
    }

    impl X86Platform {
        /// # Safety
        /// `esp0` must point at the `esp0` field of the loaded TSS and stay
        /// valid for the lifetime of the platform.
        #[must_use]
        pub const unsafe fn new(esp0: NonNull<u32>, exit_trampoline: u32) -> Self {
            Self {
                esp0,
                exit_trampoline,
            }
        }
    }

    impl InterruptControl for X86Platform {
        fn enabled(&self) -> bool {
            X86Interrupts.enabled()
        }

        fn disable(&self) {
            X86Interrupts.disable();
        }

        fn enable(&self) {
            X86Interrupts.enable();
        }
    }

    impl Platform for X86Platform {
        fn set_kernel_stack(&mut self, esp0: u32) {
            // SAFETY: guaranteed by `new`.
            unsafe { self.esp0.as_ptr().write_volatile(esp0) };
        }

        fn wait_for_interrupt(&mut self) -> Option<u8> {
            loop {
                if let Some(irq) = take_pending() {
                    return Some(irq);
                }
                // SAFETY: ring 0; `sti; hlt` is atomic with respect to
                // interrupt delivery, so no wakeup is lost in between.
                unsafe { core::arch::asm!("sti; hlt; cli", options(nomem, nostack)) };
            }
        }

        fn exit_trampoline(&self) -> u32 {
            self.exit_trampoline
        }
    }
}
