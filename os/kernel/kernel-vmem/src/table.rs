//! # Raw Paging Structures
//!
//! A page directory and a page table have the same shape: 1024 four-byte
//! entries in one 4 KiB frame. [`RawTable`] is that frame, [`PageTableEntry`]
//! one slot of it.

use crate::PageEntryBits;
use core::ops::{Index, IndexMut};
use kernel_info::memory::ENTRIES_PER_TABLE;
use kernel_memory_addresses::PhysicalAddress;

#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PageTableEntry(PageEntryBits);

impl PageTableEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    /// An entry mapping `frame` with `flags`; `present` is forced on.
    #[inline]
    #[must_use]
    pub const fn mapping(frame: PhysicalAddress, flags: PageEntryBits) -> Self {
        Self(flags.with_present(true).with_physical_address(frame))
    }

    /// A directory entry linking a page table. User access is granted at
    /// this level and restricted per page.
    #[inline]
    #[must_use]
    pub const fn table(frame: PhysicalAddress) -> Self {
        Self::mapping(frame, PageEntryBits::user_rw())
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    /// The frame, if the entry is present.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> Option<PhysicalAddress> {
        if self.0.present() {
            Some(self.0.physical_address())
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageEntryBits {
        self.0.flags()
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> PageEntryBits {
        self.0
    }

    /// Same flags, different frame.
    #[inline]
    #[must_use]
    pub const fn with_frame(self, frame: PhysicalAddress) -> Self {
        Self(self.0.with_physical_address(frame))
    }

    #[inline]
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0.into()
    }

    #[inline]
    #[must_use]
    pub fn from_raw(v: u32) -> Self {
        Self(PageEntryBits::from(v))
    }
}

/// One 4 KiB paging structure.
#[repr(C, align(4096))]
pub struct RawTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

const _: () = assert!(size_of::<RawTable>() == 4096);

impl RawTable {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::zero(); ENTRIES_PER_TABLE],
        }
    }

    pub fn clear(&mut self) {
        self.entries.fill(PageTableEntry::zero());
    }

    /// `(index, entry)` for every present entry.
    pub fn present(&self) -> impl Iterator<Item = (usize, PageTableEntry)> + '_ {
        self.entries
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, e)| e.is_present())
    }

    #[must_use]
    pub fn count_present(&self) -> usize {
        self.entries.iter().filter(|e| e.is_present()).count()
    }
}

impl Index<usize> for RawTable {
    type Output = PageTableEntry;

    #[inline]
    fn index(&self, index: usize) -> &PageTableEntry {
        &self.entries[index]
    }
}

impl IndexMut<usize> for RawTable {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_entry_grants_user_access() {
        let e = PageTableEntry::table(PhysicalAddress::new(0x0050_0000));
        assert_eq!(e.raw(), 0x0050_0007);
        assert_eq!(e.frame(), Some(PhysicalAddress::new(0x0050_0000)));
        assert_eq!(PageTableEntry::zero().frame(), None);
    }

    #[test]
    fn present_iterates_in_order() {
        let mut t = RawTable::zeroed();
        t[3] = PageTableEntry::mapping(PhysicalAddress::new(0x1000), PageEntryBits::kernel_rw());
        t[1023] = PageTableEntry::mapping(PhysicalAddress::new(0x2000), PageEntryBits::user_ro());
        let idx: std::vec::Vec<usize> = t.present().map(|(i, _)| i).collect();
        assert_eq!(idx, [3, 1023]);
        assert_eq!(t.count_present(), 2);
        t.clear();
        assert_eq!(t.count_present(), 0);
    }
}
