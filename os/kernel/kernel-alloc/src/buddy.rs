//! # Buddy Frame Allocator
//!
//! Physical memory is handed out in power-of-two blocks of 4 KiB frames,
//! from order 0 (one frame) up to [`BUDDY_MAX_ORDER`] (256 frames, 1 MiB).
//!
//! ## Frame Numbering
//!
//! The boot loader's memory map is rarely one contiguous range. Usable ranges
//! are numbered back to back, so frame `n` is a logical index that is turned
//! into an address by looking up its range:
//!
//! ```text
//!   range 0: 0x0000_1000 .. 0x0009_F000   frames    0 ..  N0
//!   range 1: 0x0100_0000 .. 0x0800_0000   frames   N0 ..  N0 + N1
//! ```
//!
//! A block therefore covers consecutive frame *numbers*, which may straddle
//! two physical ranges. [`FrameAllocation`] keeps the address of each frame
//! for that reason.
//!
//! ## Bitmaps
//!
//! One bitmap per order. A set bit means the block is *not wholly free*: it
//! is allocated itself, or some frame below it is. Block `i` of order `k`
//! has the children `2i` and `2i + 1` at order `k - 1` and its buddy is
//! `i ^ 1`. The allocator keeps two rules:
//!
//! * a block is clear only if both of its children are clear;
//! * allocating a block sets its descendants and all of its ancestors.
//!
//! Blocks at the tail whose frames run past the last usable frame are set
//! from the start and can never be handed out.

use alloc::vec;
use alloc::vec::Vec;
use core::array;
use kernel_info::boot::MemoryRegion;
use kernel_info::memory::{BUDDY_MAX_ORDER, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, Size4K};
use log::{debug, info, warn};

const ORDERS: usize = BUDDY_MAX_ORDER as usize + 1;

/// Frames in a block of the highest order.
pub const MAX_BLOCK_FRAMES: u32 = 1 << BUDDY_MAX_ORDER;

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("block {index} of order {order} is not managed by the allocator")]
    InvalidBlock { index: u32, order: u8 },
    #[error("physical address {0} is not managed by the allocator")]
    UnknownAddress(PhysicalAddress),
    #[error("block {index} of order {order} is already allocated")]
    AlreadyAllocated { index: u32, order: u8 },
    #[error("block {index} of order {order} is not allocated")]
    NotAllocated { index: u32, order: u8 },
    #[error("zero frames requested")]
    ZeroFrames,
}

/// A block of `1 << order` frames starting at frame `index << order`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Block {
    pub index: u32,
    pub order: u8,
}

impl Block {
    #[must_use]
    pub const fn new(index: u32, order: u8) -> Self {
        Self { index, order }
    }

    /// Block number of the first frame.
    #[must_use]
    pub const fn first_frame(self) -> u32 {
        self.index << self.order
    }

    #[must_use]
    pub const fn frames(self) -> u32 {
        1 << self.order
    }

    /// The block this one merges with.
    #[must_use]
    pub const fn buddy(self) -> Self {
        Self::new(self.index ^ 1, self.order)
    }

    #[must_use]
    pub const fn parent(self) -> Self {
        Self::new(self.index >> 1, self.order + 1)
    }
}

/// The frames handed out by [`BuddyAllocator::allocate`].
///
/// `frames` lists the requested frames in order; `blocks` holds everything
/// that must be returned, which may be more than was asked for when the
/// count was rounded up to a power of two.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct FrameAllocation {
    blocks: Vec<Block>,
    frames: Vec<PhysicalAddress>,
}

impl FrameAllocation {
    #[must_use]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    #[must_use]
    pub fn frames(&self) -> &[PhysicalAddress] {
        &self.frames
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[must_use]
    pub fn first(&self) -> Option<PhysicalAddress> {
        self.frames.first().copied()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct FrameRange {
    base: PhysicalAddress,
    first_frame: u32,
    frames: u32,
}

impl FrameRange {
    const fn contains_frame(&self, frame: u32) -> bool {
        frame >= self.first_frame && frame - self.first_frame < self.frames
    }

    fn end(&self) -> u64 {
        u64::from(self.base.as_u32()) + u64::from(self.frames) * u64::from(PAGE_SIZE)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BuddyAllocator {
    ranges: Vec<FrameRange>,
    total_frames: u32,
    free_frames: u32,
    bitmaps: [Vec<u64>; ORDERS],
}

impl BuddyAllocator {
    /// Builds the allocator over the available regions of a memory map.
    ///
    /// Regions are clamped to 4 GiB and shrunk to whole frames. Overlapping
    /// regions are trimmed to the part not covered by an earlier one.
    #[must_use]
    pub fn new(regions: &[MemoryRegion]) -> Self {
        const FOUR_GIB: u64 = 1 << 32;
        let page = u64::from(PAGE_SIZE);

        let mut usable: Vec<(u64, u64)> = regions
            .iter()
            .filter(|r| r.is_available())
            .map(|r| {
                let start = r.base.min(FOUR_GIB).next_multiple_of(page);
                let end = r.end().min(FOUR_GIB) / page * page;
                (start, end)
            })
            .filter(|(start, end)| start < end)
            .collect();
        usable.sort_unstable();

        let mut ranges = Vec::with_capacity(usable.len());
        let mut total_frames = 0u32;
        let mut covered = 0u64;
        for (start, end) in usable {
            let start = start.max(covered);
            if start >= end {
                continue;
            }
            #[allow(clippy::cast_possible_truncation)]
            let frames = ((end - start) / page) as u32;
            #[allow(clippy::cast_possible_truncation)]
            ranges.push(FrameRange {
                base: PhysicalAddress::new(start as u32),
                first_frame: total_frames,
                frames,
            });
            total_frames += frames;
            covered = end;
        }

        let bitmaps = array::from_fn(|order| {
            let blocks = Self::blocks_at(total_frames, order);
            vec![0u64; blocks.div_ceil(64) as usize]
        });

        let mut this = Self {
            ranges,
            total_frames,
            free_frames: total_frames,
            bitmaps,
        };

        // Tail blocks reaching past the last frame are never wholly free.
        for order in 1..ORDERS {
            let blocks = Self::blocks_at(total_frames, order);
            if blocks << order > total_frames {
                this.set(order, blocks - 1);
            }
        }

        info!(
            "buddy: {} frames ({} KiB) in {} ranges",
            total_frames,
            u64::from(total_frames) * u64::from(PAGE_SIZE) / 1024,
            this.ranges.len()
        );
        this
    }

    const fn blocks_at(total_frames: u32, order: usize) -> u32 {
        total_frames.div_ceil(1 << order)
    }

    #[must_use]
    pub const fn total_frames(&self) -> u32 {
        self.total_frames
    }

    #[must_use]
    pub const fn free_frames(&self) -> u32 {
        self.free_frames
    }

    fn is_set(&self, order: usize, index: u32) -> bool {
        if index >= Self::blocks_at(self.total_frames, order) {
            return true;
        }
        let (word, bit) = (index as usize / 64, index % 64);
        self.bitmaps[order][word] & (1 << bit) != 0
    }

    fn set(&mut self, order: usize, index: u32) {
        let (word, bit) = (index as usize / 64, index % 64);
        self.bitmaps[order][word] |= 1 << bit;
    }

    fn clear(&mut self, order: usize, index: u32) {
        let (word, bit) = (index as usize / 64, index % 64);
        self.bitmaps[order][word] &= !(1 << bit);
    }

    /// Whether the whole block is free.
    #[must_use]
    pub fn is_free(&self, block: Block) -> bool {
        usize::from(block.order) < ORDERS && !self.is_set(usize::from(block.order), block.index)
    }

    fn validate(&self, block: Block) -> Result<(), FrameError> {
        let end = u64::from(block.index + 1) << block.order;
        if block.order > BUDDY_MAX_ORDER || end > u64::from(self.total_frames) {
            return Err(FrameError::InvalidBlock {
                index: block.index,
                order: block.order,
            });
        }
        Ok(())
    }

    /// Address of frame number `frame`.
    #[must_use]
    pub fn frame_address(&self, frame: u32) -> Option<PhysicalAddress> {
        let range = self.ranges.iter().find(|r| r.contains_frame(frame))?;
        Some(range.base + (frame - range.first_frame) * PAGE_SIZE)
    }

    /// Frame number of the frame containing `address`.
    #[must_use]
    pub fn frame_number(&self, address: PhysicalAddress) -> Option<u32> {
        let address = address.align_down::<Size4K>();
        let range = self.ranges.iter().find(|r| {
            address >= r.base && u64::from(address.as_u32()) < r.end()
        })?;
        Some(range.first_frame + (address - range.base) / PAGE_SIZE)
    }

    /// Address of the first frame of `block`.
    ///
    /// # Errors
    /// The block is outside the managed frames.
    pub fn block_address(&self, block: Block) -> Result<PhysicalAddress, FrameError> {
        self.validate(block)?;
        self.frame_address(block.first_frame())
            .ok_or(FrameError::InvalidBlock {
                index: block.index,
                order: block.order,
            })
    }

    /// The order-0 block holding `address`.
    ///
    /// # Errors
    /// The address is not in any usable range.
    pub fn block_of(&self, address: PhysicalAddress) -> Result<Block, FrameError> {
        self.frame_number(address)
            .map(|frame| Block::new(frame, 0))
            .ok_or(FrameError::UnknownAddress(address))
    }

    /// Sets `block`, everything below it and everything above it.
    /// Returns the number of frames that were free before.
    fn mark_used(&mut self, block: Block) -> u32 {
        let order = usize::from(block.order);
        let mut newly_used = 0;
        for frame in block.first_frame()..block.first_frame() + block.frames() {
            if !self.is_set(0, frame) {
                newly_used += 1;
            }
        }

        for below in 0..=order {
            let shift = order - below;
            let first = block.index << shift;
            for index in first..first + (1 << shift) {
                self.set(below, index);
            }
        }

        let mut index = block.index;
        for above in order + 1..ORDERS {
            index >>= 1;
            self.set(above, index);
        }

        self.free_frames -= newly_used;
        newly_used
    }

    /// Claims the lowest-indexed free block of `order`.
    ///
    /// # Errors
    /// [`FrameError::OutOfMemory`] if no block of that order is free.
    pub fn allocate_order(&mut self, order: u8) -> Result<Block, FrameError> {
        if order > BUDDY_MAX_ORDER {
            return Err(FrameError::InvalidBlock { index: 0, order });
        }
        let o = usize::from(order);
        let blocks = Self::blocks_at(self.total_frames, o);
        let found = self.bitmaps[o]
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(w, word)| {
                #[allow(clippy::cast_possible_truncation)]
                let base = (w * 64) as u32;
                base + word.trailing_ones()
            })
            .filter(|index| *index < blocks);

        let Some(index) = found else {
            debug!("buddy: no free block of order {order}");
            return Err(FrameError::OutOfMemory);
        };
        let block = Block::new(index, order);
        self.mark_used(block);
        debug!("buddy: allocated block {index} of order {order}");
        Ok(block)
    }

    /// Claims a specific block if it is wholly free.
    ///
    /// # Errors
    /// The block is unmanaged or some frame in it is in use.
    pub fn allocate_specific(&mut self, block: Block) -> Result<(), FrameError> {
        self.validate(block)?;
        if !self.is_free(block) {
            return Err(FrameError::AlreadyAllocated {
                index: block.index,
                order: block.order,
            });
        }
        self.mark_used(block);
        Ok(())
    }

    /// Allocates a single frame.
    ///
    /// # Errors
    /// [`FrameError::OutOfMemory`] when no frame is left.
    pub fn allocate_frame(&mut self) -> Result<PhysicalAddress, FrameError> {
        let block = self.allocate_order(0)?;
        self.block_address(block)
    }

    /// Allocates `n` frames.
    ///
    /// Up to [`MAX_BLOCK_FRAMES`] frames come from one block, rounded up to
    /// a power of two. Larger requests take as many highest-order blocks as
    /// fit and one smaller block for the rest. Nothing stays allocated if
    /// any part fails.
    ///
    /// # Errors
    /// [`FrameError::ZeroFrames`] for `n == 0`, otherwise
    /// [`FrameError::OutOfMemory`].
    pub fn allocate(&mut self, n: u32) -> Result<FrameAllocation, FrameError> {
        if n == 0 {
            return Err(FrameError::ZeroFrames);
        }
        if n > self.free_frames {
            debug!("buddy: {n} frames requested, {} free", self.free_frames);
            return Err(FrameError::OutOfMemory);
        }

        let mut orders: Vec<u8> = vec![BUDDY_MAX_ORDER; (n / MAX_BLOCK_FRAMES) as usize];
        let rest = n % MAX_BLOCK_FRAMES;
        if rest != 0 {
            #[allow(clippy::cast_possible_truncation)]
            orders.push(rest.next_power_of_two().trailing_zeros() as u8);
        }

        let mut allocation = FrameAllocation {
            blocks: Vec::with_capacity(orders.len()),
            frames: Vec::with_capacity(orders.iter().map(|&o| 1_usize << o).sum()),
        };
        for order in orders {
            match self.allocate_order(order) {
                Ok(block) => allocation.blocks.push(block),
                Err(e) => {
                    warn!("buddy: allocation of {n} frames failed, rolling back");
                    for block in allocation.blocks.drain(..) {
                        self.release(block);
                    }
                    return Err(e);
                }
            }
        }

        'outer: for block in &allocation.blocks {
            for frame in block.first_frame()..block.first_frame() + block.frames() {
                if allocation.frames.len() == n as usize {
                    break 'outer;
                }
                let address = self
                    .frame_address(frame)
                    .ok_or(FrameError::InvalidBlock {
                        index: block.index,
                        order: block.order,
                    })?;
                allocation.frames.push(address);
            }
        }
        Ok(allocation)
    }

    /// Pins `n` frames starting at `address`, e.g. for device buffers.
    ///
    /// # Errors
    /// Any of the frames is unmanaged or already in use; nothing is pinned.
    pub fn allocate_at(
        &mut self,
        address: PhysicalAddress,
        n: u32,
    ) -> Result<FrameAllocation, FrameError> {
        if n == 0 {
            return Err(FrameError::ZeroFrames);
        }
        let mut allocation = FrameAllocation::default();
        for i in 0..n {
            let frame_address = address.align_down::<Size4K>() + i * PAGE_SIZE;
            let claimed = self
                .block_of(frame_address)
                .and_then(|block| self.allocate_specific(block).map(|()| block));
            match claimed {
                Ok(block) => {
                    allocation.blocks.push(block);
                    allocation.frames.push(frame_address);
                }
                Err(e) => {
                    for block in allocation.blocks.drain(..) {
                        self.release(block);
                    }
                    return Err(e);
                }
            }
        }
        Ok(allocation)
    }

    /// Frees `block` and everything below it, then merges upward while the
    /// buddy at the same order is free.
    ///
    /// # Errors
    /// The block is unmanaged or not allocated.
    pub fn deallocate_specific(&mut self, block: Block) -> Result<(), FrameError> {
        self.validate(block)?;
        if self.is_free(block) {
            warn!(
                "buddy: freeing block {} of order {} that is not allocated",
                block.index, block.order
            );
            return Err(FrameError::NotAllocated {
                index: block.index,
                order: block.order,
            });
        }
        self.release(block);
        Ok(())
    }

    fn release(&mut self, block: Block) {
        let order = usize::from(block.order);
        for frame in block.first_frame()..block.first_frame() + block.frames() {
            if self.is_set(0, frame) {
                self.free_frames += 1;
            }
        }

        for below in 0..=order {
            let shift = order - below;
            let first = block.index << shift;
            for index in first..first + (1 << shift) {
                self.clear(below, index);
            }
        }

        let mut current = block;
        while usize::from(current.order) < ORDERS - 1 {
            if self.is_set(usize::from(current.order), current.buddy().index) {
                break;
            }
            current = current.parent();
            self.clear(usize::from(current.order), current.index);
        }
        debug!(
            "buddy: freed block {} of order {}, merged up to order {}",
            block.index, block.order, current.order
        );
    }

    /// Returns every block of an allocation.
    ///
    /// # Errors
    /// The first block that could not be freed; the others are still freed.
    pub fn deallocate(&mut self, allocation: FrameAllocation) -> Result<(), FrameError> {
        let mut result = Ok(());
        for block in allocation.blocks {
            if let Err(e) = self.deallocate_specific(block) {
                result = result.and(Err(e));
            }
        }
        result
    }

    /// Frees the single frame at `address`.
    ///
    /// # Errors
    /// The address is unmanaged or the frame is free.
    pub fn free_frame(&mut self, address: PhysicalAddress) -> Result<(), FrameError> {
        let block = self.block_of(address)?;
        self.deallocate_specific(block)
    }

    /// Pins every frame intersecting `[start, end)` as permanently used.
    /// Returns how many frames were newly pinned.
    pub fn restrict_range(&mut self, start: PhysicalAddress, end: PhysicalAddress) -> u32 {
        let (start, end) = (u64::from(start.as_u32()), u64::from(end.as_u32()));
        let page = u64::from(PAGE_SIZE);
        let mut pinned = 0;
        let ranges = self.ranges.clone();
        for range in ranges {
            let base = u64::from(range.base.as_u32());
            let lo = start.max(base);
            let hi = end.min(range.end());
            if lo >= hi {
                continue;
            }
            #[allow(clippy::cast_possible_truncation)]
            let (first, last) = (((lo - base) / page) as u32, ((hi - base).div_ceil(page)) as u32);
            for frame in first..last {
                let block = Block::new(range.first_frame + frame, 0);
                if self.is_free(block) {
                    pinned += self.mark_used(block);
                }
            }
        }
        debug!("buddy: pinned {pinned} frames in [{start:#X}, {end:#X})");
        pinned
    }

    /// Checks the bitmap rules and the free counter.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        for order in 1..ORDERS {
            for index in 0..Self::blocks_at(self.total_frames, order) {
                let clear = !self.is_set(order, index);
                let children_clear =
                    !self.is_set(order - 1, index * 2) && !self.is_set(order - 1, index * 2 + 1);
                if clear && !children_clear {
                    return false;
                }
            }
        }
        let free = (0..self.total_frames)
            .filter(|frame| !self.is_set(0, *frame))
            .count();
        free == self.free_frames as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(frames: u64) -> BuddyAllocator {
        BuddyAllocator::new(&[MemoryRegion::available(0x10_0000, frames * 4096)])
    }

    #[test]
    fn block_relations() {
        let b = Block::new(5, 2);
        assert_eq!(b.first_frame(), 20);
        assert_eq!(b.frames(), 4);
        assert_eq!(b.buddy(), Block::new(4, 2));
        assert_eq!(b.parent(), Block::new(2, 3));
    }

    #[test]
    fn tail_blocks_are_never_free() {
        let a = allocator(300);
        assert_eq!(a.total_frames(), 300);
        assert!(a.is_free(Block::new(0, 8)));
        assert!(!a.is_free(Block::new(1, 8)), "frames 256..512 do not all exist");
        assert!(a.is_free(Block::new(73, 2)));
        assert!(a.is_consistent());
    }

    #[test]
    fn frame_address_spans_ranges() {
        let a = BuddyAllocator::new(&[
            MemoryRegion::available(0x10_0000, 2 * 4096),
            MemoryRegion::reserved(0x10_2000, 0x1000),
            MemoryRegion::available(0x20_0000, 2 * 4096),
        ]);
        assert_eq!(a.total_frames(), 4);
        assert_eq!(a.frame_address(2), Some(PhysicalAddress::new(0x20_0000)));
        assert_eq!(a.frame_number(PhysicalAddress::new(0x10_1234)), Some(1));
        assert_eq!(a.frame_number(PhysicalAddress::new(0x10_2000)), None);
    }

    #[test]
    fn unaligned_regions_are_trimmed() {
        let a = BuddyAllocator::new(&[MemoryRegion::available(0x1001, 0x3000)]);
        assert_eq!(a.total_frames(), 2);
        assert_eq!(a.frame_address(0), Some(PhysicalAddress::new(0x2000)));
    }
}
