//! # Per-Process Address Spaces
//!
//! An [`AddressSpace`] owns a page directory and the page tables of the user
//! half below `0xC000_0000`. Three directory slots are not owned:
//!
//! | Slot | Content |
//! |------|---------|
//! | 0    | identity-mapped low memory, shared with the kernel |
//! | 768  | the kernel image at `0xC000_0000`, shared |
//! | 1023 | the directory itself (recursive mapping) |
//!
//! Neither the directory nor the tables are mapped while idle. Every edit goes
//! through a temporary kernel window mapping, see [`PageTable`].

use crate::{KernelMapper, KernelMemory, MemoryError, PageEntryBits, PageTable, PageTableEntry};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use kernel_info::memory::{HIGHER_HALF_SLOT, IDENTITY_SLOT, PAGE_SIZE, RECURSIVE_SLOT};
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use log::{debug, trace, warn};

#[derive(Debug)]
pub struct AddressSpace {
    directory: PageTable,
    tables: BTreeMap<usize, PageTable>,
}

impl AddressSpace {
    /// A fresh directory with the recursive slot and the shared kernel slots.
    ///
    /// # Errors
    /// Out of frames or kernel window.
    pub fn new<M: KernelMapper>(mem: &mut KernelMemory<M>) -> Result<Self, MemoryError> {
        let directory = PageTable::new(mem, RECURSIVE_SLOT)?;
        let frame = directory.frame();
        let shared = [IDENTITY_SLOT, HIGHER_HALF_SLOT].map(|slot| (slot, mem.shared_entry(slot)));
        let linked = directory.with_entries(mem, |dir| {
            dir[RECURSIVE_SLOT] = PageTableEntry::mapping(frame, PageEntryBits::kernel_rw());
            for (slot, entry) in shared {
                if let Some(entry) = entry {
                    dir[slot] = entry;
                }
            }
        });
        if let Err(e) = linked {
            directory.release(mem);
            return Err(e);
        }
        debug!("address space with directory {frame}");
        Ok(Self {
            directory,
            tables: BTreeMap::new(),
        })
    }

    /// Physical address of the page directory, the value for `CR3`.
    #[inline]
    #[must_use]
    pub const fn directory(&self) -> PhysicalAddress {
        self.directory.frame()
    }

    /// Number of user pages currently mapped.
    #[must_use]
    pub fn mapped_pages(&self) -> u32 {
        self.tables.values().map(PageTable::entries).sum()
    }

    fn check_user(va: VirtualAddress) -> Result<usize, MemoryError> {
        if va.is_kernel() {
            return Err(MemoryError::KernelAddress(va));
        }
        match va.directory_index() {
            IDENTITY_SLOT => Err(MemoryError::ReservedSlot(IDENTITY_SLOT)),
            slot => Ok(slot),
        }
    }

    /// Maps the user page containing `va` to the frame containing `pa`.
    ///
    /// Mapping a page again to the frame it already maps only updates the
    /// flags.
    ///
    /// # Errors
    /// * [`MemoryError::KernelAddress`], [`MemoryError::ReservedSlot`] for
    ///   addresses this space does not own;
    /// * [`MemoryError::AlreadyMapped`] if another frame is mapped there;
    /// * allocation errors for a new page table.
    pub fn map<M: KernelMapper>(
        &mut self,
        mem: &mut KernelMemory<M>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), MemoryError> {
        let slot = Self::check_user(va)?;
        let page = va.align_down::<Size4K>();
        let frame = pa.align_down::<Size4K>();

        if !self.tables.contains_key(&slot) {
            let table = PageTable::new(mem, slot)?;
            let table_frame = table.frame();
            if let Err(e) = self
                .directory
                .with_entries(mem, |dir| dir[slot] = PageTableEntry::table(table_frame))
            {
                table.release(mem);
                return Err(e);
            }
            self.tables.insert(slot, table);
        }
        let Some(table) = self.tables.get_mut(&slot) else {
            return Err(MemoryError::NotMapped(va));
        };

        let index = va.table_index();
        let added = table.with_entries(mem, |t| match t[index].frame() {
            Some(existing) if existing == frame => {
                t[index] = PageTableEntry::mapping(frame, flags);
                Ok(false)
            }
            Some(existing) => Err(MemoryError::AlreadyMapped { va: page, existing }),
            None => {
                t[index] = PageTableEntry::mapping(frame, flags);
                Ok(true)
            }
        });
        match added {
            Ok(Ok(true)) => {
                *table.entries_mut() += 1;
                trace!("map {page} -> {frame}");
                Ok(())
            }
            Ok(Ok(false)) => Ok(()),
            Ok(Err(e)) => {
                warn!("map {page} -> {frame}: {e}");
                Err(e)
            }
            Err(e) => {
                if table.entries() == 0 {
                    self.drop_table(mem, slot);
                }
                Err(e)
            }
        }
    }

    /// Maps a fresh zeroed frame at `va` and returns it.
    ///
    /// # Errors
    /// See [`map`](Self::map).
    pub fn map_new<M: KernelMapper>(
        &mut self,
        mem: &mut KernelMemory<M>,
        va: VirtualAddress,
        flags: PageEntryBits,
    ) -> Result<PhysicalAddress, MemoryError> {
        Self::check_user(va)?;
        let frame = mem.allocate_frame()?;
        let mapped = mem
            .zero_frame(frame)
            .and_then(|()| self.map(mem, va, frame, flags));
        if let Err(e) = mapped {
            if let Err(free) = mem.free_frame(frame) {
                warn!("dropping unmapped frame {frame}: {free}");
            }
            return Err(e);
        }
        Ok(frame)
    }

    /// Removes the mapping at `va` and frees its frame. A page table left
    /// without entries is freed as well.
    ///
    /// # Errors
    /// [`MemoryError::NotMapped`] if nothing is mapped at `va`.
    pub fn unmap<M: KernelMapper>(
        &mut self,
        mem: &mut KernelMemory<M>,
        va: VirtualAddress,
    ) -> Result<(), MemoryError> {
        let slot = Self::check_user(va)?;
        let Some(table) = self.tables.get_mut(&slot) else {
            warn!("unmap of {va}: no page table");
            return Err(MemoryError::NotMapped(va));
        };
        let index = va.table_index();
        let removed = table.with_entries(mem, |t| {
            let frame = t[index].frame();
            t[index] = PageTableEntry::zero();
            frame
        })?;
        let Some(frame) = removed else {
            warn!("unmap of {va}: not mapped");
            return Err(MemoryError::NotMapped(va));
        };
        *table.entries_mut() -= 1;
        let empty = table.entries() == 0;
        mem.free_frame(frame)?;
        trace!("unmap {va} (frame {frame})");
        if empty {
            self.drop_table(mem, slot);
        }
        Ok(())
    }

    fn drop_table<M: KernelMapper>(&mut self, mem: &mut KernelMemory<M>, slot: usize) {
        let Some(table) = self.tables.remove(&slot) else {
            return;
        };
        if let Err(e) = self
            .directory
            .with_entries(mem, |dir| dir[slot] = PageTableEntry::zero())
        {
            warn!("clearing directory slot {slot}: {e}");
        }
        table.release(mem);
    }

    /// The table entry for `va`, if its table exists and the entry is present.
    #[must_use]
    pub fn entry<M: KernelMapper>(
        &self,
        mem: &mut KernelMemory<M>,
        va: VirtualAddress,
    ) -> Option<PageTableEntry> {
        let table = self.tables.get(&va.directory_index())?;
        let index = va.table_index();
        match table.with_entries(mem, |t| t[index]) {
            Ok(entry) if entry.is_present() => Some(entry),
            Ok(_) => None,
            Err(e) => {
                warn!("reading page table for {va}: {e}");
                None
            }
        }
    }

    /// Physical address `va` translates to in this space.
    #[must_use]
    pub fn get<M: KernelMapper>(
        &self,
        mem: &mut KernelMemory<M>,
        va: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        let frame = self.entry(mem, va)?.frame()?;
        Some(frame + va.offset::<Size4K>().as_u32())
    }

    /// A copy of this space: every mapped page is backed by a new frame with
    /// the same contents. Shared kernel slots are linked, not copied.
    ///
    /// # Errors
    /// Out of frames or kernel window; nothing of the copy remains allocated.
    pub fn duplicate<M: KernelMapper>(
        &self,
        mem: &mut KernelMemory<M>,
    ) -> Result<Self, MemoryError> {
        let mut copy = Self::new(mem)?;
        match self.copy_tables_into(mem, &mut copy) {
            Ok(()) => {
                debug!(
                    "duplicated {} pages from {} into {}",
                    copy.mapped_pages(),
                    self.directory(),
                    copy.directory()
                );
                Ok(copy)
            }
            Err(e) => {
                warn!("address space duplication failed: {e}");
                copy.release(mem);
                Err(e)
            }
        }
    }

    fn copy_tables_into<M: KernelMapper>(
        &self,
        mem: &mut KernelMemory<M>,
        copy: &mut Self,
    ) -> Result<(), MemoryError> {
        for (&slot, source) in &self.tables {
            let entries: Vec<(usize, PageTableEntry)> =
                source.with_entries(mem, |t| t.present().collect())?;

            let table = PageTable::new(mem, slot)?;
            let table_frame = table.frame();
            copy.tables.insert(slot, table);
            copy.directory
                .with_entries(mem, |dir| dir[slot] = PageTableEntry::table(table_frame))?;

            let Some(target) = copy.tables.get_mut(&slot) else {
                continue;
            };
            // Keep the target mapped across the whole slot.
            target.map(mem)?;
            let copied: Result<(), MemoryError> = entries.into_iter().try_for_each(|(index, entry)| {
                let Some(frame) = entry.frame() else {
                    return Ok(());
                };
                let duplicate = mem.duplicate_frame(frame)?;
                if let Err(e) = target.with_entries(mem, |t| t[index] = entry.with_frame(duplicate)) {
                    if let Err(free) = mem.free_frame(duplicate) {
                        warn!("dropping copied frame {duplicate}: {free}");
                    }
                    return Err(e);
                }
                *target.entries_mut() += 1;
                Ok(())
            });
            target.unmap(mem);
            copied?;
        }
        Ok(())
    }

    /// Copies `buf.len()` bytes starting at `va` out of this space.
    ///
    /// # Errors
    /// [`MemoryError::NotMapped`] for the first page that is not mapped.
    pub fn read<M: KernelMapper>(
        &self,
        mem: &mut KernelMemory<M>,
        va: VirtualAddress,
        buf: &mut [u8],
    ) -> Result<(), MemoryError> {
        self.for_each_chunk(mem, va, buf.len(), |mem, frame, offset, range| {
            let dst = &mut buf[range];
            mem.with_frame(frame, |page| {
                dst.copy_from_slice(&page[offset..offset + dst.len()]);
            })
        })
    }

    /// Copies `buf` into this space starting at `va`.
    ///
    /// # Errors
    /// [`MemoryError::NotMapped`] for the first page that is not mapped.
    pub fn write<M: KernelMapper>(
        &self,
        mem: &mut KernelMemory<M>,
        va: VirtualAddress,
        buf: &[u8],
    ) -> Result<(), MemoryError> {
        self.for_each_chunk(mem, va, buf.len(), |mem, frame, offset, range| {
            let src = &buf[range];
            mem.with_frame(frame, |page| {
                page[offset..offset + src.len()].copy_from_slice(src);
            })
        })
    }

    fn for_each_chunk<M: KernelMapper>(
        &self,
        mem: &mut KernelMemory<M>,
        va: VirtualAddress,
        len: usize,
        mut f: impl FnMut(
            &mut KernelMemory<M>,
            PhysicalAddress,
            usize,
            core::ops::Range<usize>,
        ) -> Result<(), MemoryError>,
    ) -> Result<(), MemoryError> {
        let page_size = PAGE_SIZE as usize;
        let mut done = 0;
        while done < len {
            #[allow(clippy::cast_possible_truncation)]
            let at = va
                .checked_add(done as u32)
                .ok_or(MemoryError::NotMapped(va))?;
            let offset = at.offset::<Size4K>().as_u32() as usize;
            let chunk = (page_size - offset).min(len - done);
            let frame = self
                .entry(mem, at)
                .and_then(PageTableEntry::frame)
                .ok_or(MemoryError::NotMapped(at.align_down::<Size4K>()))?;
            f(mem, frame, offset, done..done + chunk)?;
            done += chunk;
        }
        Ok(())
    }

    /// Frees every mapped frame, every page table and the directory.
    pub fn release<M: KernelMapper>(self, mem: &mut KernelMemory<M>) {
        let directory = self.directory.frame();
        let mut freed = 0_u32;
        for table in self.tables.into_values() {
            match table.with_entries(mem, |t| t.present().collect::<Vec<_>>()) {
                Ok(entries) => {
                    for frame in entries.into_iter().filter_map(|(_, e)| e.frame()) {
                        match mem.free_frame(frame) {
                            Ok(()) => freed += 1,
                            Err(e) => warn!("releasing frame {frame}: {e}"),
                        }
                    }
                }
                Err(e) => warn!("page table {} unreadable, leaking its frames: {e}", table.frame()),
            }
            table.release(mem);
        }
        self.directory.release(mem);
        debug!("released address space {directory} ({freed} pages)");
    }
}
