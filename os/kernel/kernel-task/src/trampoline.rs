//! # Context-Switch Trampoline
//!
//! Every trap that may change the running process goes through
//! [`Kernel::enter`]. The assembly stub saves the interrupted state into a
//! [`RegisterDump`], calls `enter`, and loads whatever the dump holds when it
//! returns. Switching processes therefore means nothing more than rewriting
//! the dump.
//!
//! ```text
//!                    ┌─ bootstrap ───────────────→ resume(current)
//! enter(dump, trap) ─┼─ timer ─→ tick ─ expired? → switch(save)
//!                    ├─ int, eax = 0 ────────────→ switch(save)
//!                    └─ int, eax ≠ 0 ─→ dispatch ─┬ return value → dump
//!                                                 ├ blocked ────→ switch
//!                                                 └ exited ─────→ switch
//! ```
//!
//! A system call that has to wait rewinds the saved user `eip` over the
//! `int` instruction and is resumed from `user_regs`, so the call runs again
//! once the process is woken.

use crate::arch::Platform;
use crate::fatal::Fatal;
use crate::kernel::Kernel;
use crate::process::ProcessState;
use crate::registers::RegisterDump;
use crate::syscall::SyscallOutcome;
use kernel_info::cpu::EFLAGS_IF;
use kernel_info::sched::{MIN_ENTRY_POINT, RUN_TIMESLICE};
use kernel_vmem::KernelMapper;
use log::{debug, error, info, warn};
use stdlib::syscall_abi::SYSCALL_INSTRUCTION_LEN;

/// How the CPU entered the kernel.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Trap {
    /// `int 0x5C`; `eax` holds the call number.
    SoftwareInterrupt,
    /// IRQ 0.
    Timer,
}

impl<M: KernelMapper, P: Platform> Kernel<M, P> {
    /// Handles one trap and leaves the context to resume in `dump`.
    ///
    /// # Errors
    /// Any [`Fatal`] condition; the caller halts.
    pub fn enter(&mut self, dump: &mut RegisterDump, trap: Trap) -> Result<(), Fatal> {
        self.platform.disable();
        self.reclaim();

        if self.bootstrap {
            self.bootstrap = false;
            let pid = self.scheduler.current().ok_or(Fatal::NoCurrentProcess)?;
            info!("bootstrapping into process {pid}");
            return self.resume(dump);
        }

        match trap {
            Trap::Timer => {
                let from_user = dump.registers().is_user_mode();
                if self.timer_tick(from_user) {
                    self.switch(dump, true)
                } else {
                    Ok(())
                }
            }
            Trap::SoftwareInterrupt if dump.syscall_number() == 0 => self.switch(dump, true),
            Trap::SoftwareInterrupt => self.system_call(dump),
        }
    }

    fn system_call(&mut self, dump: &mut RegisterDump) -> Result<(), Fatal> {
        let pid = self.scheduler.current().ok_or(Fatal::NoCurrentProcess)?;
        let process = self
            .scheduler
            .lookup_mut(pid)
            .ok_or(Fatal::NoCurrentProcess)?;
        process.user_regs.capture(dump);
        let args = process.user_regs.syscall_args();

        // Interrupts stay masked: an IRQ stub would re-enter `self`.
        match self.dispatch(pid, dump.syscall_number(), args)? {
            SyscallOutcome::Return(value) => {
                // After a fork this is the child.
                let current = self.scheduler.current().ok_or(Fatal::NoCurrentProcess)?;
                let process = self
                    .scheduler
                    .lookup_mut(current)
                    .ok_or(Fatal::NoCurrentProcess)?;
                process.user_regs.eax = value;
                process.user_regs.eflags |= EFLAGS_IF;
                let regs = process.user_regs;
                if current != pid && regs.kernel_stack != 0 {
                    self.platform.set_kernel_stack(regs.kernel_stack);
                }
                regs.restore(dump);
                Ok(())
            }
            SyscallOutcome::Block => {
                if let Some(process) = self.scheduler.lookup_mut(pid) {
                    process.user_regs.eip =
                        process.user_regs.eip.wrapping_sub(SYSCALL_INSTRUCTION_LEN);
                    process.flags.set_resume_user(true);
                }
                self.switch(dump, false)
            }
            SyscallOutcome::Exited => self.switch(dump, false),
        }
    }

    /// Parks the current process (saving the dump if `save`), picks the next
    /// one and loads it.
    fn switch(&mut self, dump: &mut RegisterDump, save: bool) -> Result<(), Fatal> {
        if let Some(pid) = self.scheduler.current()
            && let Some(process) = self.scheduler.lookup_mut(pid)
        {
            if save {
                process.kernel_regs.capture(dump);
            }
            if process.state() == ProcessState::Runnable {
                if let Err(e) = self.scheduler.add_to_runqueue(pid) {
                    warn!("requeueing process {pid}: {e}");
                }
            }
        }
        self.timeslice = RUN_TIMESLICE;
        self.schedule()?;
        self.resume(dump)
    }

    /// Loads the current process into the dump.
    fn resume(&mut self, dump: &mut RegisterDump) -> Result<(), Fatal> {
        let pid = self.scheduler.current().ok_or(Fatal::NoCurrentProcess)?;
        let process = self
            .scheduler
            .lookup_mut(pid)
            .ok_or(Fatal::NoCurrentProcess)?;

        let mut regs = match process.state() {
            ProcessState::Dead => return Err(Fatal::DeadProcessScheduled(pid)),
            ProcessState::Forking => {
                process.state = ProcessState::Runnable;
                process.user_regs
            }
            _ if process.flags().resume_user() => {
                process.flags.set_resume_user(false);
                process.user_regs
            }
            _ => process.kernel_regs,
        };
        regs.eflags |= EFLAGS_IF;

        if regs.eip < MIN_ENTRY_POINT {
            error!("process {pid} would resume at {:#010X}", regs.eip);
            return Err(Fatal::InvalidEntryPoint { pid, eip: regs.eip });
        }
        if regs.kernel_stack != 0 {
            self.platform.set_kernel_stack(regs.kernel_stack);
        }
        debug!("resuming process {pid} at {:#010X}", regs.eip);
        regs.restore(dump);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SpawnOptions;
    use crate::hosted;
    use kernel_info::boot::MemoryRegion;

    #[test]
    fn bootstrap_loads_init_without_saving() {
        let mut kernel = hosted::boot(&[MemoryRegion::available(0, 16 << 20)]).unwrap();
        let init = kernel
            .spawn_init(&SpawnOptions::new("init", 0x0804_8000))
            .unwrap();
        kernel.start();

        let mut dump = RegisterDump::default();
        kernel.enter(&mut dump, Trap::Timer).unwrap();
        assert_eq!(dump.registers().eip, 0x0804_8000);
        assert_ne!(dump.registers().eflags & EFLAGS_IF, 0);
        assert_eq!(kernel.scheduler().current(), Some(init));
        assert_eq!(kernel.ticks(), 0, "the bootstrap trap is not a tick");
    }

    #[test]
    fn zeroed_context_is_fatal() {
        let mut kernel = hosted::boot(&[MemoryRegion::available(0, 16 << 20)]).unwrap();
        kernel.spawn_init(&SpawnOptions::new("init", 0)).unwrap();
        kernel.start();

        let mut dump = RegisterDump::default();
        assert_eq!(
            kernel.enter(&mut dump, Trap::SoftwareInterrupt),
            Err(Fatal::InvalidEntryPoint {
                pid: crate::ProcessId::INIT,
                eip: 0
            })
        );
    }
}
