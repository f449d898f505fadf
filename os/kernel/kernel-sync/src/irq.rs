use core::sync::atomic::{AtomicBool, Ordering};

/// Access to the CPU's interrupt enable flag.
///
/// The kernel only ever runs on one CPU, so "interrupts disabled" is the
/// kernel's big lock: scheduler queues, the process table and the channel
/// registry are only touched with the flag cleared.
///
/// # Platform
///
/// [`X86Interrupts`] drives the real `IF` bit with `cli`/`sti`.
/// [`InterruptFlag`] keeps the flag in memory for hosted runs and tests.
pub trait InterruptControl {
    /// Whether interrupts are currently delivered.
    fn enabled(&self) -> bool;

    /// Masks interrupts (`cli`).
    fn disable(&self);

    /// Unmasks interrupts (`sti`).
    fn enable(&self);
}

impl<T: InterruptControl + ?Sized> InterruptControl for &T {
    #[inline]
    fn enabled(&self) -> bool {
        (**self).enabled()
    }

    #[inline]
    fn disable(&self) {
        (**self).disable();
    }

    #[inline]
    fn enable(&self) {
        (**self).enable();
    }
}

/// The real interrupt flag of the executing CPU.
///
/// # Safety & Privilege
///
/// `cli`/`sti` fault outside ring 0 (or without IOPL). Only use this from
/// kernel code.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[derive(Debug, Default, Copy, Clone)]
pub struct X86Interrupts;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl X86Interrupts {
    const IF: usize = 1 << 9;

    /// Reads `EFLAGS`/`RFLAGS` via `pushf; pop`.
    #[inline]
    #[must_use]
    pub fn flags() -> usize {
        let r: usize;
        #[cfg(target_arch = "x86")]
        unsafe {
            core::arch::asm!("pushfd; pop {}", out(reg) r, options(preserves_flags));
        }
        #[cfg(target_arch = "x86_64")]
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) r, options(preserves_flags));
        }
        r
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl InterruptControl for X86Interrupts {
    #[inline]
    fn enabled(&self) -> bool {
        Self::flags() & Self::IF != 0
    }

    #[inline]
    fn disable(&self) {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    fn enable(&self) {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }
}

/// An interrupt flag kept in memory.
///
/// Lets the scheduler and the context switch run on a host, where touching
/// the real flag is impossible, while still checking that critical sections
/// mask and unmask in the right order.
#[derive(Debug)]
pub struct InterruptFlag {
    enabled: AtomicBool,
}

impl InterruptFlag {
    #[must_use]
    pub const fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }
}

impl Default for InterruptFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl InterruptControl for InterruptFlag {
    #[inline]
    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    #[inline]
    fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    #[inline]
    fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the flag. If interrupts were enabled, it
/// disables them. On drop, it re-enables them **only** if they were enabled
/// before, so guards nest.
///
/// # Examples
///
/// ```
/// use kernel_sync::{InterruptControl, InterruptFlag, IrqGuard};
///
/// let flag = InterruptFlag::new(true);
/// {
///     let _outer = IrqGuard::new(&flag);
///     {
///         let _inner = IrqGuard::new(&flag);
///     }
///     assert!(!flag.enabled()); // inner guard did not re-enable
/// }
/// assert!(flag.enabled());
/// ```
#[must_use = "interrupts are restored as soon as the guard is dropped"]
pub struct IrqGuard<'a, I: InterruptControl + ?Sized> {
    control: &'a I,
    were_enabled: bool,
}

impl<'a, I: InterruptControl + ?Sized> IrqGuard<'a, I> {
    #[inline]
    pub fn new(control: &'a I) -> Self {
        let were_enabled = control.enabled();
        if were_enabled {
            control.disable();
        }
        Self {
            control,
            were_enabled,
        }
    }

    /// Whether dropping this guard will re-enable interrupts.
    #[inline]
    #[must_use]
    pub const fn restores(&self) -> bool {
        self.were_enabled
    }
}

impl<I: InterruptControl + ?Sized> Drop for IrqGuard<'_, I> {
    fn drop(&mut self) {
        if self.were_enabled {
            self.control.enable();
        }
    }
}
