use crate::{MemoryError, PageEntryBits, PageTableEntry};
use core::ptr::NonNull;
use kernel_alloc::BuddyAllocator;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Edits the kernel half of the address space.
///
/// The kernel's mappings above `0xC000_0000` are shared by every process, so
/// they are not owned by any [`AddressSpace`](crate::AddressSpace). This
/// trait is the seam between the paging logic and however the kernel reaches
/// its own page tables:
///
/// * [`RecursiveMapper`](crate::recursive::RecursiveMapper) on 32-bit x86,
///   through the recursive directory slot;
/// * [`HostedMapper`](crate::hosted::HostedMapper) in tests, backed by host
///   memory.
pub trait KernelMapper {
    /// Maps one kernel page. Creates the kernel page table for the slot if
    /// needed, taking its frame from `frames`.
    ///
    /// # Errors
    /// [`MemoryError::AlreadyMapped`] if `va` maps a frame already, or an
    /// allocation error for a new page table.
    fn set_pte(
        &mut self,
        frames: &mut BuddyAllocator,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), MemoryError>;

    /// Removes a kernel mapping and returns the frame it pointed to.
    fn unset_pte(&mut self, va: VirtualAddress) -> Option<PhysicalAddress>;

    /// Physical address behind a kernel virtual address.
    fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress>;

    /// A pointer through which the mapped kernel page at `va` can be accessed.
    fn page(&self, va: VirtualAddress) -> Option<NonNull<[u8; 4096]>>;

    /// Brings the active directory in line with the kernel directory for
    /// `va`'s slot. Returns whether that made `va` accessible.
    fn resolve_fault(&mut self, va: VirtualAddress) -> bool;

    /// The directory entry every address space links at a shared `slot`, if
    /// the boot environment provides one.
    fn shared_entry(&self, slot: usize) -> Option<PageTableEntry>;
}
