//! # Boot Memory Map
//!
//! The boot loader reports physical memory as a list of regions. Only
//! [`MemoryKind::Available`] regions are handed to the frame allocator;
//! everything else (BIOS data, ACPI tables, MMIO holes) is left alone.

/// Classification of a memory map entry.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryKind {
    /// Usable RAM.
    Available = 1,
    /// Anything the kernel must not allocate from.
    Reserved = 2,
}

impl MemoryKind {
    /// Maps a multiboot memory map `type` field; type 1 is usable RAM.
    #[must_use]
    pub const fn from_multiboot(kind: u32) -> Self {
        if kind == 1 {
            Self::Available
        } else {
            Self::Reserved
        }
    }
}

/// One entry of the boot loader's physical memory map.
///
/// Values are kept 64 bits wide as reported; consumers clamp to the
/// 32-bit physical address space.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn available(base: u64, length: u64) -> Self {
        Self {
            base,
            length,
            kind: MemoryKind::Available,
        }
    }

    #[must_use]
    pub const fn reserved(base: u64, length: u64) -> Self {
        Self {
            base,
            length,
            kind: MemoryKind::Reserved,
        }
    }

    /// One past the last byte of the region.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    #[must_use]
    pub const fn is_available(&self) -> bool {
        matches!(self.kind, MemoryKind::Available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiboot_types() {
        assert_eq!(MemoryKind::from_multiboot(1), MemoryKind::Available);
        assert_eq!(MemoryKind::from_multiboot(2), MemoryKind::Reserved);
        assert_eq!(MemoryKind::from_multiboot(3), MemoryKind::Reserved);
    }

    #[test]
    fn region_end_saturates() {
        let r = MemoryRegion::available(u64::MAX - 1, 16);
        assert_eq!(r.end(), u64::MAX);
        assert!(r.is_available());
        assert!(!MemoryRegion::reserved(0, 0x1000).is_available());
    }
}
