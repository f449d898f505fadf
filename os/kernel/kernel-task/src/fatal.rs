use crate::process::ProcessId;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::MemoryError;
use kernel_vmem::fault::FaultError;

/// Conditions the kernel cannot continue from.
///
/// Returned by the top-level entry points instead of panicking deep inside
/// a subsystem; the interrupt glue reports and halts via [`Fatal::halt`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum Fatal {
    #[error("out of memory: {0}")]
    OutOfMemory(MemoryError),
    #[error("memory corrupted: {0}")]
    Memory(MemoryError),
    #[error("no current process")]
    NoCurrentProcess,
    #[error("scheduled dead process {0}")]
    DeadProcessScheduled(ProcessId),
    #[error("process {pid} resumes at invalid entry point {eip:#010X}")]
    InvalidEntryPoint { pid: ProcessId, eip: u32 },
    #[error("null pointer dereference at {address} (eip {eip:#010X})")]
    NullDereference { address: VirtualAddress, eip: u32 },
    #[error("kernel protection violation at {address} (eip {eip:#010X})")]
    KernelProtection { address: VirtualAddress, eip: u32 },
    #[error("idle with no interrupt source left")]
    Idle,
}

impl Fatal {
    /// Logs the condition and stops the kernel.
    pub fn halt(self) -> ! {
        log::error!("kernel panic: {self}");
        panic!("kernel panic: {self}")
    }
}

impl From<MemoryError> for Fatal {
    fn from(e: MemoryError) -> Self {
        if e.is_exhaustion() {
            Self::OutOfMemory(e)
        } else {
            Self::Memory(e)
        }
    }
}

impl From<FaultError> for Fatal {
    fn from(e: FaultError) -> Self {
        match e {
            FaultError::NullDereference { address, eip } => Self::NullDereference { address, eip },
            FaultError::KernelProtection { address, eip } => Self::KernelProtection { address, eip },
            FaultError::NoAddressSpace(address) => Self::KernelProtection { address, eip: 0 },
            FaultError::Memory(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_alloc::FrameError;

    #[test]
    fn memory_errors_split_by_exhaustion() {
        let oom = MemoryError::Frame(FrameError::OutOfMemory);
        assert_eq!(Fatal::from(oom), Fatal::OutOfMemory(oom));
        let broken = MemoryError::NotMapped(VirtualAddress::new(0x1000));
        assert_eq!(Fatal::from(broken), Fatal::Memory(broken));
    }

    #[test]
    #[should_panic(expected = "kernel panic: no current process")]
    fn halt_panics() {
        Fatal::NoCurrentProcess.halt();
    }
}
