//! # Kernel Virtual Address Ranges
//!
//! The kernel's private window (`0xC040_0000..0xFFC0_0000`) is partitioned
//! into consecutive ranges, each either free or in use. Node `i` covers
//! `[nodes[i].start, nodes[i + 1].start)`, the last one runs to the end of
//! the window. Allocation is first fit; freeing coalesces with free
//! neighbours on both sides, so no two adjacent nodes are ever both free.
//!
//! Only addresses are managed here. Backing frames and page table entries
//! are the caller's business.

use alloc::vec;
use alloc::vec::Vec;
use kernel_info::memory::{KERNEL_HEAP_INITIAL, KERNEL_WINDOW_END, KERNEL_WINDOW_START, PAGE_SIZE};
use kernel_memory_addresses::{Size4K, VirtualAddress};
use log::{debug, warn};

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum RangeError {
    #[error("zero-length range requested")]
    ZeroLength,
    #[error("no free range of {0} pages left")]
    Exhausted(u32),
    #[error("range {start}..{end} is not available")]
    Unavailable {
        start: VirtualAddress,
        end: VirtualAddress,
    },
    #[error("no allocated range starts at {0}")]
    UnknownAddress(VirtualAddress),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct RangeNode {
    start: VirtualAddress,
    free: bool,
}

/// A contiguous span reported by [`VirtualRangeAllocator::ranges`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct VirtualRange {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
    pub free: bool,
}

impl VirtualRange {
    #[must_use]
    pub fn bytes(&self) -> u32 {
        self.end - self.start
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VirtualRangeAllocator {
    nodes: Vec<RangeNode>,
    end: VirtualAddress,
}

impl VirtualRangeAllocator {
    /// One free range covering `[start, end)`, both rounded inward to pages.
    #[must_use]
    pub fn new(start: VirtualAddress, end: VirtualAddress) -> Self {
        let start = start
            .checked_align_up::<Size4K>()
            .unwrap_or_else(|| end.align_down::<Size4K>());
        let end = end.align_down::<Size4K>();
        debug_assert!(start < end, "empty virtual window");
        Self {
            nodes: vec![RangeNode { start, free: true }],
            end,
        }
    }

    /// The kernel window with the boot heap already in use.
    #[must_use]
    pub fn kernel() -> Self {
        let start = VirtualAddress::new(KERNEL_WINDOW_START);
        Self {
            nodes: vec![
                RangeNode { start, free: false },
                RangeNode {
                    start: start + KERNEL_HEAP_INITIAL,
                    free: true,
                },
            ],
            end: VirtualAddress::new(KERNEL_WINDOW_END),
        }
    }

    fn node_end(&self, i: usize) -> VirtualAddress {
        self.nodes.get(i + 1).map_or(self.end, |n| n.start)
    }

    #[must_use]
    pub fn contains(&self, address: VirtualAddress) -> bool {
        self.nodes
            .first()
            .is_some_and(|n| address >= n.start && address < self.end)
    }

    /// First-fit allocation of `pages` pages.
    ///
    /// # Errors
    /// [`RangeError::ZeroLength`] or [`RangeError::Exhausted`].
    pub fn allocate(&mut self, pages: u32) -> Result<VirtualAddress, RangeError> {
        if pages == 0 {
            return Err(RangeError::ZeroLength);
        }
        let bytes = pages
            .checked_mul(PAGE_SIZE)
            .ok_or(RangeError::Exhausted(pages))?;

        let found = (0..self.nodes.len())
            .find(|&i| self.nodes[i].free && self.node_end(i) - self.nodes[i].start >= bytes);
        let Some(i) = found else {
            warn!("vrange: no free range of {pages} pages");
            return Err(RangeError::Exhausted(pages));
        };

        let start = self.nodes[i].start;
        self.nodes[i].free = false;
        if self.node_end(i) - start > bytes {
            self.nodes.insert(
                i + 1,
                RangeNode {
                    start: start + bytes,
                    free: true,
                },
            );
        }
        debug!("vrange: allocated {pages} pages at {start}");
        Ok(start)
    }

    /// Reserves exactly `[start, end)`, which must lie in one free range.
    ///
    /// # Errors
    /// [`RangeError::Unavailable`] if any part is used or outside the window.
    pub fn allocate_specific(
        &mut self,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Result<(), RangeError> {
        let start = start.align_down::<Size4K>();
        let end = end
            .checked_align_up::<Size4K>()
            .ok_or(RangeError::Unavailable { start, end })?;
        if start >= end {
            return Err(RangeError::ZeroLength);
        }

        let i = self
            .nodes
            .iter()
            .rposition(|n| n.start <= start)
            .ok_or(RangeError::Unavailable { start, end })?;
        let node_end = self.node_end(i);
        if !self.nodes[i].free || end > node_end {
            return Err(RangeError::Unavailable { start, end });
        }

        let mut at = i;
        if self.nodes[i].start < start {
            at += 1;
            self.nodes.insert(at, RangeNode { start, free: false });
        } else {
            self.nodes[i].free = false;
        }
        if end < node_end {
            self.nodes.insert(at + 1, RangeNode { start: end, free: true });
        }
        debug!("vrange: reserved {start}..{end}");
        Ok(())
    }

    /// Releases the range starting at `address`, merging it with free
    /// neighbours. Returns the size of the released range in bytes.
    ///
    /// # Errors
    /// [`RangeError::UnknownAddress`] if no used range starts there.
    pub fn free(&mut self, address: VirtualAddress) -> Result<u32, RangeError> {
        let Some(mut i) = self
            .nodes
            .iter()
            .position(|n| n.start == address && !n.free)
        else {
            warn!("vrange: free of unknown range {address}");
            return Err(RangeError::UnknownAddress(address));
        };

        let bytes = self.node_end(i) - address;
        self.nodes[i].free = true;
        if self.nodes.get(i + 1).is_some_and(|n| n.free) {
            self.nodes.remove(i + 1);
        }
        if i > 0 && self.nodes[i - 1].free {
            self.nodes.remove(i);
            i -= 1;
        }
        debug!("vrange: freed {bytes:#X} bytes at {address}, node {i}");
        Ok(bytes)
    }

    pub fn ranges(&self) -> impl Iterator<Item = VirtualRange> + '_ {
        (0..self.nodes.len()).map(|i| VirtualRange {
            start: self.nodes[i].start,
            end: self.node_end(i),
            free: self.nodes[i].free,
        })
    }

    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.ranges()
            .filter(|r| r.free)
            .map(|r| u64::from(r.bytes()))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> VirtualRangeAllocator {
        VirtualRangeAllocator::new(VirtualAddress::new(0x1000_0000), VirtualAddress::new(0x1001_0000))
    }

    #[test]
    fn kernel_window_starts_after_heap() {
        let mut v = VirtualRangeAllocator::kernel();
        let first = v.allocate(1).unwrap();
        assert_eq!(first.as_u32(), KERNEL_WINDOW_START + KERNEL_HEAP_INITIAL);
        assert!(v.contains(first));
        assert!(!v.contains(VirtualAddress::new(KERNEL_WINDOW_END)));
    }

    #[test]
    fn first_fit_reuses_holes() {
        let mut v = window();
        let a = v.allocate(2).unwrap();
        let b = v.allocate(1).unwrap();
        assert_eq!(b, a + 0x2000);
        v.free(a).unwrap();
        let c = v.allocate(1).unwrap();
        assert_eq!(c, a, "first free range is the hole left by a");
    }

    #[test]
    fn free_merges_both_neighbours() {
        let mut v = window();
        let a = v.allocate(1).unwrap();
        let b = v.allocate(1).unwrap();
        let c = v.allocate(1).unwrap();
        v.free(a).unwrap();
        v.free(c).unwrap();
        assert_eq!(v.free(b), Ok(0x1000));
        assert_eq!(v.ranges().count(), 1);
        assert_eq!(v.free_bytes(), 0x1_0000);
    }

    #[test]
    fn specific_reservation_splits() {
        let mut v = window();
        v.allocate_specific(VirtualAddress::new(0x1000_4000), VirtualAddress::new(0x1000_6000))
            .unwrap();
        let spans: Vec<_> = v.ranges().map(|r| (r.start.as_u32(), r.free)).collect();
        assert_eq!(
            spans,
            [(0x1000_0000, true), (0x1000_4000, false), (0x1000_6000, true)]
        );
        assert!(
            v.allocate_specific(VirtualAddress::new(0x1000_5000), VirtualAddress::new(0x1000_7000))
                .is_err()
        );
    }

    #[test]
    fn exhaustion_and_errors() {
        let mut v = window();
        assert_eq!(v.allocate(0), Err(RangeError::ZeroLength));
        assert_eq!(v.allocate(17), Err(RangeError::Exhausted(17)));
        assert!(v.allocate(16).is_ok());
        assert_eq!(v.allocate(1), Err(RangeError::Exhausted(1)));
        assert_eq!(
            v.free(VirtualAddress::new(0x1000_1000)),
            Err(RangeError::UnknownAddress(VirtualAddress::new(0x1000_1000)))
        );
    }
}
