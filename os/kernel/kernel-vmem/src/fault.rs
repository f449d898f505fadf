//! # Page Fault Resolution
//!
//! Decides what a `#PF` means and, where possible, repairs it:
//!
//! | Fault | Resolution |
//! |-------|------------|
//! | address below `0x1000` | fatal null dereference |
//! | protection violation, kernel mode | fatal |
//! | protection violation, user mode | reported to the caller |
//! | not present, kernel half | directory sync or a fresh kernel frame |
//! | not present, user half | a fresh user frame in the faulting space |
//!
//! Terminating a user process that faulted is left to the caller.

use crate::{AddressSpace, KernelMapper, KernelMemory, MemoryError, PageEntryBits};
use bitfield_struct::bitfield;
use kernel_info::memory::NULL_GUARD_END;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use log::{debug, error, warn};

/// Page-fault error code pushed by the CPU (32-bit).
///
/// Reference: Intel SDM Vol. 3A, §6.15 "Page-Fault Exception (#PF)".
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// 0 = non-present page, 1 = protection violation.
    pub present: bool,

    /// 0 = read, 1 = write.
    pub write: bool,

    /// 0 = supervisor, 1 = user mode (CPL 3).
    pub user: bool,

    /// A reserved bit was set in a paging structure.
    pub reserved_bit: bool,

    /// Instruction fetch.
    pub instruction_fetch: bool,

    #[bits(27)]
    __: u32,
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            "Non-present page"
        } else if self.instruction_fetch() {
            "Instruction fetch on protected page"
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

/// How a fault was resolved.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FaultResolution {
    /// The kernel table was linked into the active directory.
    KernelSynced,
    /// A fresh frame now backs the kernel page.
    KernelMapped(PhysicalAddress),
    /// A fresh frame now backs the user page.
    UserMapped(PhysicalAddress),
    /// A user-mode access violated page protections; the page is unchanged.
    ProtectionViolation,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum FaultError {
    #[error("null pointer dereference at {address} (eip {eip:#010X})")]
    NullDereference { address: VirtualAddress, eip: u32 },
    #[error("kernel protection violation at {address} (eip {eip:#010X})")]
    KernelProtection { address: VirtualAddress, eip: u32 },
    #[error("user fault at {0} without an address space")]
    NoAddressSpace(VirtualAddress),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Resolves a page fault at `address`. `space` is the faulting process's
/// address space, if any.
///
/// # Errors
/// Faults that cannot be repaired, see [`FaultError`].
pub fn handle_page_fault<M: KernelMapper>(
    mem: &mut KernelMemory<M>,
    space: Option<&mut AddressSpace>,
    address: VirtualAddress,
    error: PageFaultError,
    eip: u32,
) -> Result<FaultResolution, FaultError> {
    if address.as_u32() < NULL_GUARD_END {
        error!("page fault: null dereference at {address}, eip {eip:#010X}");
        return Err(FaultError::NullDereference { address, eip });
    }

    if error.present() {
        if !error.user() {
            error!(
                "page fault: {} at {address} in kernel mode, eip {eip:#010X}",
                error.explain()
            );
            return Err(FaultError::KernelProtection { address, eip });
        }
        warn!(
            "page fault: {} at {address} in user mode, eip {eip:#010X}",
            error.explain()
        );
        return Ok(FaultResolution::ProtectionViolation);
    }

    if address.is_kernel() {
        let resolution = match mem.kernel_fault(address)? {
            None => FaultResolution::KernelSynced,
            Some(pa) => FaultResolution::KernelMapped(pa),
        };
        debug!("page fault at {address}: {resolution:?}");
        return Ok(resolution);
    }

    let Some(space) = space else {
        error!("page fault at user address {address} with no address space");
        return Err(FaultError::NoAddressSpace(address));
    };
    let pa = space.map_new(mem, address, PageEntryBits::user_rw())?;
    debug!("page fault at {address}: mapped {pa}");
    Ok(FaultResolution::UserMapped(pa))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_bits() {
        let e = PageFaultError::from_bits(0b110);
        assert!(!e.present() && e.write() && e.user());
        assert_eq!(e.explain(), "Non-present page");
        let e = PageFaultError::new().with_present(true).with_instruction_fetch(true);
        assert_eq!(e.into_bits(), 0b1_0001);
        assert_eq!(e.explain(), "Instruction fetch on protected page");
    }
}
