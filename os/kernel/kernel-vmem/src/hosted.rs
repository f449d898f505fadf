//! # Hosted Physical Memory
//!
//! Lets the paging code run as an ordinary process: every available region
//! of a simulated memory map is backed by a page-aligned host allocation,
//! and kernel mappings are kept in a translation table instead of real page
//! tables. Used by the test suites of this crate and of the task layer.

use crate::{KernelMapper, KernelMemory, MemoryError, PageEntryBits, PageTableEntry};
use alloc::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ptr::NonNull;
use kernel_alloc::BuddyAllocator;
use kernel_info::boot::MemoryRegion;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use log::warn;

struct Bank {
    base: u32,
    layout: Layout,
    ptr: NonNull<u8>,
}

/// Host allocations standing in for physical RAM.
pub struct PhysicalMemory {
    banks: Vec<Bank>,
}

impl PhysicalMemory {
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(regions: &[MemoryRegion]) -> Self {
        let mut banks = Vec::new();
        for region in regions.iter().filter(|r| r.is_available()) {
            let base = region.base.min(u64::from(u32::MAX)) as u32;
            let size = (region.end().min(1 << 32) - u64::from(base)) as usize;
            let Ok(layout) = Layout::from_size_align(size, PAGE_SIZE as usize) else {
                warn!("hosted memory: cannot back region at {base:#010X}");
                continue;
            };
            if size == 0 {
                continue;
            }
            // SAFETY: non-zero size checked above.
            let raw = unsafe { alloc_zeroed(layout) };
            let Some(ptr) = NonNull::new(raw) else {
                handle_alloc_error(layout);
            };
            banks.push(Bank { base, layout, ptr });
        }
        Self { banks }
    }

    /// Host pointer to the byte at `pa`.
    #[must_use]
    pub fn ptr(&self, pa: PhysicalAddress) -> Option<NonNull<u8>> {
        let pa = pa.as_u32();
        self.banks.iter().find_map(|b| {
            let offset = pa.checked_sub(b.base)? as usize;
            // SAFETY: the offset is within the bank's allocation.
            (offset < b.layout.size()).then(|| unsafe { b.ptr.add(offset) })
        })
    }

    /// Copies bytes out of one frame.
    ///
    /// # Errors
    /// The range is not backed or crosses a page boundary.
    pub fn read(&self, pa: PhysicalAddress, buf: &mut [u8]) -> Result<(), MemoryError> {
        let src = self.checked(pa, buf.len())?;
        // SAFETY: `checked` bounds the range to one backed frame.
        unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    /// Copies bytes into one frame.
    ///
    /// # Errors
    /// The range is not backed or crosses a page boundary.
    pub fn write(&self, pa: PhysicalAddress, buf: &[u8]) -> Result<(), MemoryError> {
        let dst = self.checked(pa, buf.len())?;
        // SAFETY: `checked` bounds the range to one backed frame.
        unsafe { core::ptr::copy_nonoverlapping(buf.as_ptr(), dst.as_ptr(), buf.len()) };
        Ok(())
    }

    fn checked(&self, pa: PhysicalAddress, len: usize) -> Result<NonNull<u8>, MemoryError> {
        let offset = pa.offset::<Size4K>().as_u32() as usize;
        if offset + len > PAGE_SIZE as usize {
            return Err(MemoryError::NotMapped(VirtualAddress::new(pa.as_u32())));
        }
        self.ptr(pa)
            .ok_or(MemoryError::Frame(kernel_alloc::FrameError::UnknownAddress(pa)))
    }
}

impl Drop for PhysicalMemory {
    fn drop(&mut self) {
        for bank in self.banks.drain(..) {
            // SAFETY: allocated in `new` with exactly this layout.
            unsafe { dealloc(bank.ptr.as_ptr(), bank.layout) };
        }
    }
}

/// [`KernelMapper`] over [`PhysicalMemory`].
pub struct HostedMapper {
    memory: PhysicalMemory,
    kernel: BTreeMap<u32, PageTableEntry>,
}

impl HostedMapper {
    #[must_use]
    pub fn new(regions: &[MemoryRegion]) -> Self {
        Self {
            memory: PhysicalMemory::new(regions),
            kernel: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn physical(&self) -> &PhysicalMemory {
        &self.memory
    }

    /// Number of kernel pages currently mapped.
    #[must_use]
    pub fn kernel_pages(&self) -> usize {
        self.kernel.len()
    }
}

impl KernelMapper for HostedMapper {
    fn set_pte(
        &mut self,
        _frames: &mut BuddyAllocator,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), MemoryError> {
        let page = va.page::<Size4K>().number();
        if let Some(existing) = self.kernel.get(&page).and_then(|e| e.frame()) {
            return Err(MemoryError::AlreadyMapped {
                va: va.align_down::<Size4K>(),
                existing,
            });
        }
        self.kernel.insert(page, PageTableEntry::mapping(pa, flags));
        Ok(())
    }

    fn unset_pte(&mut self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.kernel
            .remove(&va.page::<Size4K>().number())
            .and_then(PageTableEntry::frame)
    }

    fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let frame = self.kernel.get(&va.page::<Size4K>().number())?.frame()?;
        Some(frame + va.offset::<Size4K>().as_u32())
    }

    fn page(&self, va: VirtualAddress) -> Option<NonNull<[u8; 4096]>> {
        let pa = self.translate(va.align_down::<Size4K>())?;
        self.memory.ptr(pa).map(NonNull::cast)
    }

    fn resolve_fault(&mut self, va: VirtualAddress) -> bool {
        self.kernel.contains_key(&va.page::<Size4K>().number())
    }

    fn shared_entry(&self, _slot: usize) -> Option<PageTableEntry> {
        None
    }
}

/// Kernel memory over freshly simulated RAM.
///
/// # Errors
/// The memory map is too small for the shared kernel tables.
pub fn boot(regions: &[MemoryRegion]) -> Result<KernelMemory<HostedMapper>, MemoryError> {
    KernelMemory::bootstrap(regions, HostedMapper::new(regions))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banks_follow_the_memory_map() {
        let memory = PhysicalMemory::new(&[
            MemoryRegion::available(0x10_0000, 0x2000),
            MemoryRegion::reserved(0x10_2000, 0x1000),
            MemoryRegion::available(0x20_0000, 0x1000),
        ]);
        assert!(memory.ptr(PhysicalAddress::new(0x10_1FFF)).is_some());
        assert!(memory.ptr(PhysicalAddress::new(0x10_2000)).is_none());
        assert!(memory.ptr(PhysicalAddress::new(0x20_0000)).is_some());

        memory.write(PhysicalAddress::new(0x20_0010), b"frame").unwrap();
        let mut out = [0; 5];
        memory.read(PhysicalAddress::new(0x20_0010), &mut out).unwrap();
        assert_eq!(&out, b"frame");
        assert!(memory.write(PhysicalAddress::new(0x20_0FFE), b"abc").is_err());
    }
}
