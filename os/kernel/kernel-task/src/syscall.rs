//! # System Calls
//!
//! `eax` holds the call number, `ebx`, `ecx`, `edx`, `esi` and `edi` the
//! arguments; the result goes back in `eax`. Failed calls return
//! [`SYSCALL_ERROR`] and are logged; only [`Fatal`] conditions escape.
//!
//! Pointers are user virtual addresses of the calling process. Buffers are
//! copied through its address space, and pages it never touched are mapped
//! on the way, as the page-fault path would.

use crate::arch::Platform;
use crate::fatal::Fatal;
use crate::ipc::{IpcError, MAX_CHANNEL_NAME, MAX_MESSAGE_SIZE, Message};
use crate::kernel::Kernel;
use crate::process::{Process, ProcessId};
use crate::scheduler::{SchedError, Scheduler};
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::task::Poll;
use kernel_info::memory::{KERNEL_BASE, NULL_GUARD_END, PAGE_SIZE};
use kernel_memory_addresses::{Size4K, VirtualAddress};
use kernel_vmem::{AddressSpace, KernelMapper, KernelMemory, MemoryError, PageEntryBits};
use log::{trace, warn};
use stdlib::syscall_abi::{ChannelMode, MessageInfo, SYSCALL_ERROR, Sysno, WAIT_ANY};

/// What the trampoline does after a call.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SyscallOutcome {
    /// Resume the current process with this value in `eax`.
    Return(u32),
    /// The caller was parked; retry the call when it is woken.
    Block,
    /// The caller is gone.
    Exited,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum SyscallError {
    #[error(transparent)]
    Sched(#[from] SchedError),
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Fatal(#[from] Fatal),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl<M: KernelMapper, P: Platform> Kernel<M, P> {
    /// Runs system call `number` for `pid`.
    ///
    /// # Errors
    /// Only [`Fatal`] conditions; everything else becomes [`SYSCALL_ERROR`].
    pub fn dispatch(
        &mut self,
        pid: ProcessId,
        number: u32,
        args: [u32; 5],
    ) -> Result<SyscallOutcome, Fatal> {
        let Ok(sysno) = Sysno::try_from(number) else {
            warn!("process {pid}: unknown system call {number}");
            return Ok(SyscallOutcome::Return(SYSCALL_ERROR));
        };
        trace!("process {pid}: {sysno:?} {args:X?}");
        match self.run_call(pid, sysno, args) {
            Ok(outcome) => Ok(outcome),
            Err(SyscallError::Fatal(e)) => Err(e),
            Err(SyscallError::Memory(e)) if e.is_exhaustion() => Err(Fatal::OutOfMemory(e)),
            Err(e) => {
                warn!("process {pid}: {sysno:?} failed: {e}");
                Ok(SyscallOutcome::Return(SYSCALL_ERROR))
            }
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn run_call(
        &mut self,
        pid: ProcessId,
        sysno: Sysno,
        args: [u32; 5],
    ) -> Result<SyscallOutcome, SyscallError> {
        use SyscallOutcome::{Block, Exited, Return};

        let outcome = match sysno {
            Sysno::Yield => Return(0),
            Sysno::Fork => {
                self.fork()?;
                Return(0)
            }
            Sysno::Exit => {
                self.exit(pid, args[0])?;
                Exited
            }
            Sysno::Wait => {
                if args[1] != 0 {
                    user_range(args[1], 4)?;
                }
                let waited = if args[0] == WAIT_ANY {
                    self.wait_any(pid)?
                } else {
                    let child = ProcessId::new(args[0]);
                    self.wait_child(pid, child)?.map(|code| (child, code))
                };
                let Poll::Ready((child, code)) = waited else {
                    return Ok(Block);
                };
                if args[1] != 0 {
                    self.copy_to_user(pid, args[1], &code.to_le_bytes())?;
                }
                Return(child.as_u32())
            }
            Sysno::GetPid => Return(pid.as_u32()),
            Sysno::Sbrk => match self.sbrk(pid, args[0].cast_signed()) {
                Ok(old) => Return(old),
                Err(SchedError::HeapCollision(_)) => Exited,
                Err(e) => return Err(e.into()),
            },
            Sysno::Times => {
                let (tms, ticks) = self.times(pid)?;
                if args[0] != 0 {
                    self.copy_to_user(pid, args[0], &tms.to_bytes())?;
                }
                Return(ticks as u32)
            }
            Sysno::Sleep => match self.sleep_ms(pid, u64::from(args[0]))? {
                Poll::Ready(()) => Return(0),
                Poll::Pending => Block,
            },
            Sysno::RegisterChannel => {
                let name = self.read_name(pid, args[0], args[1])?;
                let mode = ChannelMode::try_from(args[2])
                    .map_err(|_| SyscallError::InvalidArgument("channel mode"))?;
                self.register_channel(&name, mode, pid)?;
                Return(0)
            }
            Sysno::Listen => {
                let name = self.read_name(pid, args[0], args[1])?;
                let changed = self.listen(pid, &name, args[2] != 0)?;
                Return(u32::from(changed))
            }
            Sysno::Send => {
                let name = self.read_name(pid, args[0], args[1])?;
                let len = args[3] as usize;
                if len > MAX_MESSAGE_SIZE {
                    return Err(IpcError::TooLarge(len).into());
                }
                let payload = self.copy_from_user(pid, args[2], len)?;
                let target = (args[4] != 0).then(|| ProcessId::new(args[4]));
                let delivered = self.send(pid, &name, &payload, target)?;
                Return(delivered as u32)
            }
            Sysno::Receive => {
                let capacity = args[3] as usize;
                if capacity > 0 {
                    user_range(args[2], capacity)?;
                }
                if args[4] != 0 {
                    user_range(args[4], MessageInfo::SIZE)?;
                }
                let received = if args[1] == 0 {
                    self.wait_for_message(pid)?
                } else {
                    let name = self.read_name(pid, args[0], args[1])?;
                    self.receive_on(pid, &name)?
                };
                let Poll::Ready(message) = received else {
                    return Ok(Block);
                };
                Return(self.deliver(pid, &message, args[2], capacity, args[4])?)
            }
        };
        Ok(outcome)
    }

    /// Copies a received message out; the payload is cut to `capacity`.
    #[allow(clippy::cast_possible_truncation)]
    fn deliver(
        &mut self,
        pid: ProcessId,
        message: &Message,
        buffer: u32,
        capacity: usize,
        info: u32,
    ) -> Result<u32, SyscallError> {
        let size = message.size();
        let copied = size.min(capacity);
        if copied > 0 {
            self.copy_to_user(pid, buffer, &message.payload()[..copied])?;
        }
        if info != 0 {
            let info_block = MessageInfo {
                uid: message.uid(),
                sender: message.sender().as_u32(),
                size: size as u32,
            };
            self.copy_to_user(pid, info, &info_block.to_bytes())?;
        }
        Ok(size as u32)
    }

    fn read_name(&mut self, pid: ProcessId, address: u32, len: u32) -> Result<String, SyscallError> {
        let len = len as usize;
        if len == 0 || len > MAX_CHANNEL_NAME {
            return Err(IpcError::InvalidName.into());
        }
        let bytes = self.copy_from_user(pid, address, len)?;
        String::from_utf8(bytes).map_err(|_| SyscallError::InvalidArgument("name is not UTF-8"))
    }

    /// Reads `len` bytes at user address `address` of `pid`.
    ///
    /// # Errors
    /// The range is null, wraps, reaches into the kernel half, or cannot be
    /// mapped.
    pub fn copy_from_user(
        &mut self,
        pid: ProcessId,
        address: u32,
        len: usize,
    ) -> Result<Vec<u8>, SyscallError> {
        let va = user_range(address, len)?;
        let space = user_space(&mut self.scheduler, pid)?;
        fault_in(&mut self.memory, space, va, len)?;
        let mut buf = vec![0; len];
        space.read(&mut self.memory, va, &mut buf)?;
        Ok(buf)
    }

    /// Writes `bytes` to user address `address` of `pid`.
    ///
    /// # Errors
    /// Same as [`copy_from_user`](Self::copy_from_user).
    pub fn copy_to_user(
        &mut self,
        pid: ProcessId,
        address: u32,
        bytes: &[u8],
    ) -> Result<(), SyscallError> {
        let va = user_range(address, bytes.len())?;
        let space = user_space(&mut self.scheduler, pid)?;
        fault_in(&mut self.memory, space, va, bytes.len())?;
        space.write(&mut self.memory, va, bytes)?;
        Ok(())
    }
}

fn user_space(scheduler: &mut Scheduler, pid: ProcessId) -> Result<&mut AddressSpace, SchedError> {
    scheduler
        .lookup_mut(pid)
        .and_then(Process::address_space_mut)
        .ok_or(SchedError::UnknownProcess(pid))
}

/// Validates a user buffer and returns its start.
fn user_range(address: u32, len: usize) -> Result<VirtualAddress, SyscallError> {
    if address < NULL_GUARD_END {
        return Err(SyscallError::InvalidArgument("null pointer"));
    }
    let len = u32::try_from(len).map_err(|_| SyscallError::InvalidArgument("buffer too large"))?;
    let end = address
        .checked_add(len)
        .ok_or(SyscallError::InvalidArgument("buffer wraps around"))?;
    if end > KERNEL_BASE {
        return Err(SyscallError::InvalidArgument("buffer reaches into the kernel"));
    }
    Ok(VirtualAddress::new(address))
}

/// Maps a fresh page for every page of `[va, va + len)` not yet mapped.
fn fault_in<M: KernelMapper>(
    mem: &mut KernelMemory<M>,
    space: &mut AddressSpace,
    va: VirtualAddress,
    len: usize,
) -> Result<(), MemoryError> {
    if len == 0 {
        return Ok(());
    }
    let first = va.align_down::<Size4K>().as_u32();
    #[allow(clippy::cast_possible_truncation)]
    let last = va.as_u32() + (len as u32 - 1);
    let mut page = first;
    loop {
        let at = VirtualAddress::new(page);
        if space.get(mem, at).is_none() {
            space.map_new(mem, at, PageEntryBits::user_rw())?;
        }
        match page.checked_add(PAGE_SIZE) {
            Some(next) if next <= last => page = next,
            _ => return Ok(()),
        }
    }
}
