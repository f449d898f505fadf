//! # Recursive Kernel Mapper (32-bit x86)
//!
//! The last directory slot of every address space points at the directory
//! itself, so the active directory is visible at `0xFFFF_F000` and the page
//! table of slot `s` at `0xFFC0_0000 + s * 0x1000`.
//!
//! Kernel page tables (slots 768 and above) are recorded in the boot
//! directory, which stays authoritative. A process directory created before
//! a kernel table existed lacks that slot and picks it up on the first fault
//! through [`KernelMapper::resolve_fault`].

use crate::{KernelMapper, MemoryError, PageEntryBits, PageTableEntry, RawTable};
use core::arch::asm;
use core::ptr::NonNull;
use kernel_alloc::BuddyAllocator;
use kernel_info::memory::{KERNEL_BASE, PAGE_SIZE, RECURSIVE_DIRECTORY, RECURSIVE_TABLES_BASE};
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use log::trace;

pub struct RecursiveMapper {
    kernel_directory: NonNull<RawTable>,
}

impl RecursiveMapper {
    /// # Safety
    /// `boot_directory` must be the physical address of the boot page
    /// directory, reachable through the higher-half mapping at
    /// `KERNEL_BASE + boot_directory`, with its recursive slot installed.
    #[must_use]
    pub const unsafe fn new(boot_directory: PhysicalAddress) -> Self {
        let va = (KERNEL_BASE + boot_directory.as_u32()) as usize;
        // SAFETY: the higher-half address of a physical address is never null.
        Self {
            kernel_directory: unsafe { NonNull::new_unchecked(va as *mut RawTable) },
        }
    }

    const fn kernel(&self) -> &RawTable {
        // SAFETY: the boot directory lives for the whole kernel lifetime.
        unsafe { self.kernel_directory.as_ref() }
    }

    const fn kernel_mut(&mut self) -> &mut RawTable {
        // SAFETY: as above; edited only with interrupts masked on the single CPU.
        unsafe { self.kernel_directory.as_mut() }
    }

    fn active() -> &'static mut RawTable {
        // SAFETY: the recursive slot is installed in every directory.
        unsafe { &mut *VirtualAddress::new(RECURSIVE_DIRECTORY).as_mut_ptr::<RawTable>() }
    }

    fn table(slot: usize) -> &'static mut RawTable {
        // SAFETY: only called for slots present in the active directory.
        unsafe { &mut *Self::table_address(slot).as_mut_ptr::<RawTable>() }
    }

    /// Links the kernel table of `slot` into the active directory.
    fn sync(&self, slot: usize) -> bool {
        let entry = self.kernel()[slot];
        let active = Self::active();
        if !entry.is_present() || active[slot] == entry {
            return false;
        }
        active[slot] = entry;
        invalidate(Self::table_address(slot));
        trace!("synced kernel slot {slot}");
        true
    }

    #[allow(clippy::cast_possible_truncation)]
    fn table_address(slot: usize) -> VirtualAddress {
        VirtualAddress::new(RECURSIVE_TABLES_BASE + slot as u32 * PAGE_SIZE)
    }
}

impl KernelMapper for RecursiveMapper {
    fn set_pte(
        &mut self,
        frames: &mut BuddyAllocator,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), MemoryError> {
        let slot = va.directory_index();
        if !self.kernel()[slot].is_present() {
            let frame = frames.allocate_frame()?;
            self.kernel_mut()[slot] = PageTableEntry::mapping(frame, PageEntryBits::kernel_rw());
            self.sync(slot);
            Self::table(slot).clear();
            trace!("new kernel page table for slot {slot} at {frame}");
        } else {
            self.sync(slot);
        }

        let table = Self::table(slot);
        let index = va.table_index();
        if let Some(existing) = table[index].frame() {
            return Err(MemoryError::AlreadyMapped {
                va: va.align_down::<Size4K>(),
                existing,
            });
        }
        table[index] = PageTableEntry::mapping(pa, flags);
        invalidate(va);
        Ok(())
    }

    fn unset_pte(&mut self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let slot = va.directory_index();
        self.sync(slot);
        if !Self::active()[slot].is_present() {
            return None;
        }
        let table = Self::table(slot);
        let frame = table[va.table_index()].frame()?;
        table[va.table_index()] = PageTableEntry::zero();
        invalidate(va);
        Some(frame)
    }

    fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let slot = va.directory_index();
        if !Self::active()[slot].is_present() {
            return None;
        }
        let frame = Self::table(slot)[va.table_index()].frame()?;
        Some(frame + va.offset::<Size4K>().as_u32())
    }

    fn page(&self, va: VirtualAddress) -> Option<NonNull<[u8; 4096]>> {
        self.translate(va)?;
        NonNull::new(va.align_down::<Size4K>().as_mut_ptr())
    }

    fn resolve_fault(&mut self, va: VirtualAddress) -> bool {
        self.sync(va.directory_index())
    }

    fn shared_entry(&self, slot: usize) -> Option<PageTableEntry> {
        let entry = self.kernel()[slot];
        entry.is_present().then_some(entry)
    }
}

fn invalidate(va: VirtualAddress) {
    // SAFETY: invalidating a TLB entry has no memory effects.
    unsafe {
        asm!("invlpg [{}]", in(reg) va.as_u32(), options(nostack, preserves_flags));
    }
}

/// Switches to the address space whose directory is at `directory`.
///
/// # Safety
/// The directory must link the kernel slots and its recursive slot.
pub unsafe fn load_directory(directory: PhysicalAddress) {
    unsafe {
        asm!("mov cr3, {}", in(reg) directory.as_u32(), options(nostack, preserves_flags));
    }
}
