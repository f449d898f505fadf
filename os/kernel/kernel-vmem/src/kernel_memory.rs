use crate::{KernelMapper, PageEntryBits, PageTableEntry};
use kernel_alloc::{BuddyAllocator, FrameError, RangeError, VirtualRangeAllocator};
use kernel_info::boot::MemoryRegion;
use kernel_info::memory::{HIGHER_HALF_SLOT, IDENTITY_SLOT, LOW_MEMORY_RESERVED, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use log::{debug, trace, warn};

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum MemoryError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error("{0} lies in the kernel half")]
    KernelAddress(VirtualAddress),
    #[error("{va} already maps {existing}")]
    AlreadyMapped {
        va: VirtualAddress,
        existing: PhysicalAddress,
    },
    #[error("{0} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("directory slot {0} is shared with the kernel")]
    ReservedSlot(usize),
}

impl MemoryError {
    /// Out of frames or out of kernel window: nothing the caller can fix.
    #[must_use]
    pub const fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::Frame(FrameError::OutOfMemory) | Self::Range(RangeError::Exhausted(_))
        )
    }
}

/// Kernel-wide memory services on top of the frame allocator, the kernel
/// window and the kernel mapper.
///
/// Physical frames are never accessed directly. They are mapped into the
/// kernel window for the duration of an access and unmapped afterwards, so
/// the kernel does not need all of RAM mapped.
pub struct KernelMemory<M: KernelMapper> {
    frames: BuddyAllocator,
    window: VirtualRangeAllocator,
    mapper: M,
    shared: [PageTableEntry; 2],
}

impl<M: KernelMapper> KernelMemory<M> {
    /// Builds kernel memory from the boot memory map: frames below
    /// [`LOW_MEMORY_RESERVED`] are pinned and the boot heap part of the
    /// window is marked used.
    ///
    /// # Errors
    /// Allocation of the shared kernel tables failed.
    pub fn bootstrap(regions: &[MemoryRegion], mapper: M) -> Result<Self, MemoryError> {
        let mut frames = BuddyAllocator::new(regions);
        frames.restrict_range(
            PhysicalAddress::zero(),
            PhysicalAddress::new(LOW_MEMORY_RESERVED),
        );
        Self::new(frames, VirtualRangeAllocator::kernel(), mapper)
    }

    /// # Errors
    /// The mapper has no shared tables and allocating them failed.
    pub fn new(
        mut frames: BuddyAllocator,
        window: VirtualRangeAllocator,
        mut mapper: M,
    ) -> Result<Self, MemoryError> {
        let mut shared = [PageTableEntry::zero(); 2];
        for (entry, slot) in shared.iter_mut().zip([IDENTITY_SLOT, HIGHER_HALF_SLOT]) {
            *entry = match mapper.shared_entry(slot) {
                Some(e) => e,
                None => {
                    let frame = frames.allocate_frame()?;
                    zero_through(&mut mapper, &mut frames, frame)?;
                    PageTableEntry::table(frame)
                }
            };
        }
        Ok(Self {
            frames,
            window,
            mapper,
            shared,
        })
    }

    #[must_use]
    pub const fn frames(&self) -> &BuddyAllocator {
        &self.frames
    }

    pub const fn frames_mut(&mut self) -> &mut BuddyAllocator {
        &mut self.frames
    }

    #[must_use]
    pub const fn window(&self) -> &VirtualRangeAllocator {
        &self.window
    }

    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    pub const fn mapper_mut(&mut self) -> &mut M {
        &mut self.mapper
    }

    /// Directory entry for a kernel-shared slot (0 or 768).
    #[must_use]
    pub fn shared_entry(&self, slot: usize) -> Option<PageTableEntry> {
        match slot {
            IDENTITY_SLOT => Some(self.shared[0]),
            HIGHER_HALF_SLOT => Some(self.shared[1]),
            _ => None,
        }
    }

    /// # Errors
    /// [`FrameError::OutOfMemory`].
    pub fn allocate_frame(&mut self) -> Result<PhysicalAddress, MemoryError> {
        Ok(self.frames.allocate_frame()?)
    }

    /// # Errors
    /// The frame was not allocated.
    pub fn free_frame(&mut self, frame: PhysicalAddress) -> Result<(), MemoryError> {
        Ok(self.frames.free_frame(frame)?)
    }

    /// Maps `frame` into the kernel window.
    ///
    /// # Errors
    /// The window is exhausted or the mapper failed.
    pub fn map_temporary(&mut self, frame: PhysicalAddress) -> Result<VirtualAddress, MemoryError> {
        let va = self.window.allocate(1)?;
        if let Err(e) = self.mapper.set_pte(
            &mut self.frames,
            va,
            frame.align_down::<Size4K>(),
            PageEntryBits::kernel_rw(),
        ) {
            if let Err(free) = self.window.free(va) {
                warn!("returning window page {va}: {free}");
            }
            return Err(e);
        }
        trace!("temporary mapping {va} -> {frame}");
        Ok(va)
    }

    /// Undoes [`map_temporary`](Self::map_temporary).
    pub fn unmap_temporary(&mut self, va: VirtualAddress) {
        if self.mapper.unset_pte(va).is_none() {
            warn!("unmapping temporary mapping {va} that is not mapped");
        }
        if let Err(e) = self.window.free(va) {
            warn!("releasing temporary window page {va}: {e}");
        }
    }

    /// Pointer to a page mapped in the kernel half.
    #[must_use]
    pub fn page_ptr(&self, va: VirtualAddress) -> Option<core::ptr::NonNull<[u8; 4096]>> {
        self.mapper.page(va.align_down::<Size4K>())
    }

    /// Runs `f` on the contents of a physical frame.
    ///
    /// # Errors
    /// The frame could not be mapped.
    pub fn with_frame<R>(
        &mut self,
        frame: PhysicalAddress,
        f: impl FnOnce(&mut [u8; 4096]) -> R,
    ) -> Result<R, MemoryError> {
        let va = self.map_temporary(frame)?;
        let Some(mut page) = self.page_ptr(va) else {
            self.unmap_temporary(va);
            return Err(MemoryError::NotMapped(va));
        };
        // SAFETY: the page was mapped just above and stays mapped until the
        // unmap below; nothing else refers to this window page.
        let result = f(unsafe { page.as_mut() });
        self.unmap_temporary(va);
        Ok(result)
    }

    /// # Errors
    /// The frame could not be mapped.
    pub fn zero_frame(&mut self, frame: PhysicalAddress) -> Result<(), MemoryError> {
        self.with_frame(frame, |page| page.fill(0))
    }

    /// Copies the contents of one frame into another.
    ///
    /// # Errors
    /// Either frame could not be mapped.
    pub fn copy_frame(
        &mut self,
        src: PhysicalAddress,
        dst: PhysicalAddress,
    ) -> Result<(), MemoryError> {
        let from = self.map_temporary(src)?;
        let to = match self.map_temporary(dst) {
            Ok(va) => va,
            Err(e) => {
                self.unmap_temporary(from);
                return Err(e);
            }
        };
        let result = match (self.page_ptr(from), self.page_ptr(to)) {
            (Some(from), Some(mut to)) => {
                // SAFETY: two distinct window pages, both mapped until the
                // unmaps below.
                unsafe { to.as_mut().copy_from_slice(from.as_ref()) };
                Ok(())
            }
            _ => Err(MemoryError::NotMapped(from)),
        };
        self.unmap_temporary(to);
        self.unmap_temporary(from);
        result
    }

    /// A new frame with the same contents as `src`.
    ///
    /// # Errors
    /// Out of frames, or the frames could not be mapped.
    pub fn duplicate_frame(&mut self, src: PhysicalAddress) -> Result<PhysicalAddress, MemoryError> {
        let dst = self.allocate_frame()?;
        if let Err(e) = self.copy_frame(src, dst) {
            if let Err(free) = self.frames.free_frame(dst) {
                warn!("dropping copy target {dst}: {free}");
            }
            return Err(e);
        }
        Ok(dst)
    }

    /// Allocates `pages` zeroed pages of kernel memory, e.g. a kernel stack.
    ///
    /// # Errors
    /// Out of frames or window; nothing stays allocated.
    pub fn mmap(&mut self, pages: u32) -> Result<VirtualAddress, MemoryError> {
        let start = self.window.allocate(pages)?;
        for i in 0..pages {
            if let Err(e) = self.map_fresh(start + i * PAGE_SIZE) {
                warn!("kernel mmap of {pages} pages failed: {e}");
                self.release_pages(start, i, true);
                if let Err(free) = self.window.free(start) {
                    warn!("returning window range {start}: {free}");
                }
                return Err(e);
            }
        }
        debug!("kernel mmap: {pages} pages at {start}");
        Ok(start)
    }

    /// Releases memory obtained from [`mmap`](Self::mmap).
    ///
    /// # Errors
    /// `va` is not the start of a window allocation.
    pub fn munmap(&mut self, va: VirtualAddress, pages: u32) -> Result<(), MemoryError> {
        self.release_pages(va, pages, true);
        self.window.free(va)?;
        debug!("kernel munmap: {pages} pages at {va}");
        Ok(())
    }

    /// Maps device memory at `pa` uncached into the kernel window.
    ///
    /// # Errors
    /// Out of window.
    pub fn map_physical(
        &mut self,
        pa: PhysicalAddress,
        pages: u32,
    ) -> Result<VirtualAddress, MemoryError> {
        let start = self.window.allocate(pages)?;
        let base = pa.align_down::<Size4K>();
        for i in 0..pages {
            if let Err(e) = self.mapper.set_pte(
                &mut self.frames,
                start + i * PAGE_SIZE,
                base + i * PAGE_SIZE,
                PageEntryBits::kernel_mmio(),
            ) {
                self.release_pages(start, i, false);
                if let Err(free) = self.window.free(start) {
                    warn!("returning window range {start}: {free}");
                }
                return Err(e);
            }
        }
        Ok(start + pa.offset::<Size4K>().as_u32())
    }

    /// Undoes [`map_physical`](Self::map_physical); the frames are not freed.
    ///
    /// # Errors
    /// `va` was not returned by `map_physical`.
    pub fn unmap_physical(&mut self, va: VirtualAddress, pages: u32) -> Result<(), MemoryError> {
        let start = va.align_down::<Size4K>();
        self.release_pages(start, pages, false);
        self.window.free(start)?;
        Ok(())
    }

    /// Backs the kernel page at `va` with a zeroed frame.
    fn map_fresh(&mut self, va: VirtualAddress) -> Result<PhysicalAddress, MemoryError> {
        let pa = self.frames.allocate_frame()?;
        if let Err(e) = self
            .mapper
            .set_pte(&mut self.frames, va, pa, PageEntryBits::kernel_rw())
        {
            if let Err(free) = self.frames.free_frame(pa) {
                warn!("dropping unmapped kernel frame {pa}: {free}");
            }
            return Err(e);
        }
        if let Some(mut page) = self.page_ptr(va) {
            // SAFETY: freshly mapped, nothing else refers to it yet.
            unsafe { page.as_mut().fill(0) };
        }
        Ok(pa)
    }

    fn release_pages(&mut self, start: VirtualAddress, pages: u32, free_frames: bool) {
        for i in 0..pages {
            let va = start + i * PAGE_SIZE;
            match self.mapper.unset_pte(va) {
                Some(pa) if free_frames => {
                    if let Err(e) = self.frames.free_frame(pa) {
                        warn!("freeing frame {pa} behind {va}: {e}");
                    }
                }
                Some(_) => {}
                None => warn!("kernel page {va} was not mapped"),
            }
        }
    }

    /// Resolves a not-present fault on a kernel address: either the active
    /// directory was missing the kernel table, or the page gets a fresh frame.
    ///
    /// # Errors
    /// Out of frames.
    pub fn kernel_fault(&mut self, va: VirtualAddress) -> Result<Option<PhysicalAddress>, MemoryError> {
        if self.mapper.resolve_fault(va) {
            return Ok(None);
        }
        let pa = self.map_fresh(va.align_down::<Size4K>())?;
        Ok(Some(pa))
    }
}

/// Zeroes a frame before [`KernelMemory`] exists, through a fixed window
/// page at the end of the boot heap.
fn zero_through<M: KernelMapper>(
    mapper: &mut M,
    frames: &mut BuddyAllocator,
    frame: PhysicalAddress,
) -> Result<(), MemoryError> {
    let va = VirtualAddress::new(
        kernel_info::memory::KERNEL_WINDOW_START + kernel_info::memory::KERNEL_HEAP_INITIAL
            - PAGE_SIZE,
    );
    mapper.set_pte(frames, va, frame, PageEntryBits::kernel_rw())?;
    if let Some(mut page) = mapper.page(va) {
        // SAFETY: mapped just above, unmapped right after.
        unsafe { page.as_mut().fill(0) };
    }
    mapper.unset_pte(va);
    Ok(())
}
