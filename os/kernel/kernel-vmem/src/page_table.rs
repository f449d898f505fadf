//! # Page Table Frames
//!
//! A [`PageTable`] owns one physical frame holding a page directory or a page
//! table of some address space. The frame is not permanently mapped. Whoever
//! needs to edit it maps it into the kernel window with [`PageTable::map`],
//! and the window address is remembered so nested users share one mapping.

use crate::{KernelMapper, KernelMemory, MemoryError, RawTable};
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use log::{trace, warn};

#[derive(Debug)]
pub struct PageTable {
    frame: PhysicalAddress,
    /// Directory slot this table serves; the recursive slot for a directory.
    slot: usize,
    /// Present entries, maintained by the owner.
    entries: u32,
    /// Kernel window address while mapped, `0` otherwise.
    window: AtomicU32,
}

impl PageTable {
    /// Allocates and zeroes a frame for a new table.
    ///
    /// # Errors
    /// Out of frames or kernel window.
    pub fn new<M: KernelMapper>(mem: &mut KernelMemory<M>, slot: usize) -> Result<Self, MemoryError> {
        let frame = mem.allocate_frame()?;
        if let Err(e) = mem.zero_frame(frame) {
            if let Err(free) = mem.free_frame(frame) {
                warn!("dropping page table frame {frame}: {free}");
            }
            return Err(e);
        }
        trace!("page table for slot {slot} at {frame}");
        Ok(Self {
            frame,
            slot,
            entries: 0,
            window: AtomicU32::new(0),
        })
    }

    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalAddress {
        self.frame
    }

    #[inline]
    #[must_use]
    pub const fn slot(&self) -> usize {
        self.slot
    }

    #[inline]
    #[must_use]
    pub const fn entries(&self) -> u32 {
        self.entries
    }

    pub(crate) const fn entries_mut(&mut self) -> &mut u32 {
        &mut self.entries
    }

    /// The current window address, if mapped.
    #[must_use]
    pub fn mapped_at(&self) -> Option<VirtualAddress> {
        match self.window.load(Ordering::Acquire) {
            0 => None,
            va => Some(VirtualAddress::new(va)),
        }
    }

    /// Maps the frame into the kernel window, or returns the existing mapping.
    ///
    /// If two callers race, the loser drops its own mapping and uses the
    /// winner's.
    ///
    /// # Errors
    /// Out of kernel window.
    pub fn map<M: KernelMapper>(&self, mem: &mut KernelMemory<M>) -> Result<VirtualAddress, MemoryError> {
        if let Some(va) = self.mapped_at() {
            return Ok(va);
        }
        let va = mem.map_temporary(self.frame)?;
        match self
            .window
            .compare_exchange(0, va.as_u32(), Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(va),
            Err(existing) => {
                mem.unmap_temporary(va);
                Ok(VirtualAddress::new(existing))
            }
        }
    }

    /// Drops the window mapping, if any.
    pub fn unmap<M: KernelMapper>(&self, mem: &mut KernelMemory<M>) {
        let va = self.window.swap(0, Ordering::AcqRel);
        if va != 0 {
            mem.unmap_temporary(VirtualAddress::new(va));
        }
    }

    /// Runs `f` on the table contents. A mapping created for the call is
    /// removed afterwards; an existing one is left in place.
    ///
    /// # Errors
    /// The table could not be mapped.
    pub fn with_entries<M: KernelMapper, R>(
        &self,
        mem: &mut KernelMemory<M>,
        f: impl FnOnce(&mut RawTable) -> R,
    ) -> Result<R, MemoryError> {
        let was_mapped = self.mapped_at().is_some();
        let va = self.map(mem)?;
        let Some(page) = mem.page_ptr(va) else {
            if !was_mapped {
                self.unmap(mem);
            }
            return Err(MemoryError::NotMapped(va));
        };
        // SAFETY: the window page holds this table's frame, is page aligned
        // and stays mapped for the duration of `f`.
        let result = f(unsafe { page.cast::<RawTable>().as_mut() });
        if !was_mapped {
            self.unmap(mem);
        }
        Ok(result)
    }

    /// Unmaps and frees the frame.
    pub fn release<M: KernelMapper>(self, mem: &mut KernelMemory<M>) {
        self.unmap(mem);
        if let Err(e) = mem.free_frame(self.frame) {
            warn!("releasing page table {}: {e}", self.frame);
        }
    }
}
