use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// A 32-bit (non-PAE) page directory or page table entry.
///
/// Directory entries and table entries share one layout; the only difference
/// is bit 7, which selects a 4 MiB page in a directory entry and the PAT
/// index in a table entry.
///
/// ### Bit layout
///
/// | Bits   | Name    | Meaning |
/// |--------|---------|---------|
/// | 0      | `P`     | Present |
/// | 1      | `RW`    | Writable |
/// | 2      | `US`    | User-mode accessible |
/// | 3      | `PWT`   | Write-through caching |
/// | 4      | `PCD`   | Cache disable |
/// | 5      | `A`     | Accessed |
/// | 6      | `D`     | Dirty (table entries) |
/// | 7      | `PS`/`PAT` | 4 MiB page (directory) / PAT (table) |
/// | 8      | `G`     | Global (table entries) |
/// | 9–11   | avail.  | Free for the OS |
/// | 12–31  | frame   | Physical address bits 31:12 |
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntryBits;
/// let e = PageEntryBits::user_rw().with_physical_address(PhysicalAddress::new(0x0040_3000));
/// assert!(e.present() && e.user_access());
/// assert_eq!(e.into_bits(), 0x0040_3007);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1). Supervisor writes ignore it unless `CR0.WP`.
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4). Set for MMIO.
    pub cache_disabled: bool,

    /// Accessed (A, bit 5), set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6), set by the CPU on the first write.
    pub dirty: bool,

    /// Page Size in a directory entry, PAT in a table entry (bit 7).
    pub large_page: bool,

    /// Global (G, bit 8). Survives `CR3` reloads when `CR4.PGE` is set.
    pub global: bool,

    /// Free for the OS (bits 9..=11).
    #[bits(3)]
    pub os_available: u8,

    /// Physical address bits 31:12.
    #[bits(20)]
    frame: u32,
}

impl PageEntryBits {
    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << 12)
    }

    #[inline]
    pub fn set_physical_address(&mut self, pa: PhysicalAddress) {
        self.set_frame(pa.as_u32() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_address(self, pa: PhysicalAddress) -> Self {
        self.with_frame(pa.as_u32() >> 12)
    }

    /// Only the permission and caching bits, without the frame.
    #[inline]
    #[must_use]
    pub const fn flags(self) -> Self {
        self.with_frame(0)
    }

    /// Kernel read/write: `P | RW`.
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// User read/write: `P | RW | US`.
    #[inline]
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::kernel_rw().with_user_access(true)
    }

    /// User read-only: `P | US`.
    #[inline]
    #[must_use]
    pub const fn user_ro() -> Self {
        Self::new().with_present(true).with_user_access(true)
    }

    /// Kernel device memory: `P | RW | PCD | PWT`.
    #[inline]
    #[must_use]
    pub const fn kernel_mmio() -> Self {
        Self::kernel_rw()
            .with_cache_disabled(true)
            .with_write_through(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_layout_matches_hardware() {
        let e = PageEntryBits::kernel_rw().with_physical_address(PhysicalAddress::new(0xFFFF_F123));
        assert_eq!(e.into_bits(), 0xFFFF_F003);
        assert_eq!(e.physical_address(), PhysicalAddress::new(0xFFFF_F000));
        assert_eq!(e.flags(), PageEntryBits::kernel_rw());
    }

    #[test]
    fn user_flags() {
        assert_eq!(PageEntryBits::user_rw().into_bits(), 0x7);
        assert_eq!(PageEntryBits::user_ro().into_bits(), 0x5);
        assert_eq!(PageEntryBits::kernel_mmio().into_bits(), 0x1B);
        let raw = PageEntryBits::from_bits(0x0000_0E00);
        assert_eq!(raw.os_available(), 0b111);
    }
}
