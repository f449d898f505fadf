//! # Virtual and Physical Memory Address Types (32-bit)
//!
//! Strongly typed wrappers for raw addresses and page bases used by the
//! frame allocator, the page tables and the process address spaces.
//!
//! ## Overview
//!
//! Kernel code constantly juggles three kinds of numbers that are all `u32`
//! underneath: physical frame addresses, virtual addresses, and page table
//! indices. Mixing them up is the classic paging bug, so each gets a type:
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | RAM as the CPU's bus sees it. |
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Addresses translated by the MMU. |
//! | [`MemoryAddressOffset<S>`] | Byte offset inside a page of size `S`. |
//!
//! ## Page Sizes
//!
//! Non-PAE 32-bit paging knows two page sizes, selected through marker types
//! implementing [`PageSize`]:
//!
//! - [`Size4K`]: regular pages mapped through a page table
//! - [`Size4M`]: large pages mapped directly from a directory entry
//!
//! ## Two-Level Translation
//!
//! A virtual address splits into a directory index (bits 22..32), a table
//! index (bits 12..22) and a page offset (bits 0..12):
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xC040_3123);
//! assert_eq!(va.directory_index(), 769);
//! assert_eq!(va.table_index(), 3);
//! assert_eq!(va.offset::<Size4K>().as_u32(), 0x123);
//! assert_eq!(VirtualAddress::from_indices(769, 3), va.page::<Size4K>().base());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

use core::fmt;
use core::hash::Hash;
use core::marker::PhantomData;
use core::ops::{Add, AddAssign, Sub};

mod sealed {
    pub trait Sealed {}
}

/// Marker trait for the supported page sizes.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Debug
{
    /// Page size in bytes.
    const SIZE: u32;
    /// `log2(SIZE)`.
    const SHIFT: u32;
    /// Short name used in `Display` output.
    const NAME: &'static str;
}

/// 4 KiB page.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4K;
impl sealed::Sealed for Size4K {}
impl PageSize for Size4K {
    const SIZE: u32 = 4096;
    const SHIFT: u32 = 12;
    const NAME: &'static str = "4K";
}

/// 4 MiB page (PSE).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4M;
impl sealed::Sealed for Size4M {}
impl PageSize for Size4M {
    const SIZE: u32 = 4 * 1024 * 1024;
    const SHIFT: u32 = 22;
    const NAME: &'static str = "4M";
}

/// Raw 32-bit address, used as the backing store of the typed wrappers.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryAddress(u32);

impl MemoryAddress {
    #[inline(always)]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[inline(always)]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(self.0 & !(S::SIZE - 1))
    }

    /// Rounds up to the next boundary of `S`, or `None` past 4 GiB.
    #[inline]
    #[must_use]
    pub const fn checked_align_up<S: PageSize>(self) -> Option<Self> {
        match self.0.checked_add(S::SIZE - 1) {
            Some(v) => Some(Self(v & !(S::SIZE - 1))),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.0 & (S::SIZE - 1) == 0
    }

    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> MemoryPage<S> {
        MemoryPage {
            value: self.align_down::<S>().0,
            _phantom: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> MemoryAddressOffset<S> {
        MemoryAddressOffset {
            value: self.0 & (S::SIZE - 1),
            _phantom: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn split<S: PageSize>(self) -> (MemoryPage<S>, MemoryAddressOffset<S>) {
        (self.page::<S>(), self.offset::<S>())
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u32) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryAddress(0x{:08X})", self.0)
    }
}

impl fmt::Display for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl Add<u32> for MemoryAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u32> for MemoryAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs;
    }
}

/// A page-aligned base address.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryPage<S: PageSize> {
    value: u32,
    _phantom: PhantomData<S>,
}

impl<S: PageSize> MemoryPage<S> {
    /// Page containing `addr`.
    #[inline]
    #[must_use]
    pub const fn containing(addr: MemoryAddress) -> Self {
        addr.page::<S>()
    }

    /// Page number, i.e. the base divided by the page size.
    #[inline]
    #[must_use]
    pub const fn number(self) -> u32 {
        self.value >> S::SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn from_number(number: u32) -> Self {
        Self {
            value: number << S::SHIFT,
            _phantom: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> MemoryAddress {
        MemoryAddress(self.value)
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: MemoryAddressOffset<S>) -> MemoryAddress {
        MemoryAddress(self.value | off.value)
    }
}

impl<S: PageSize> fmt::Debug for MemoryPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryPage<{}>(0x{:08X})", S::NAME, self.value)
    }
}

impl<S: PageSize> fmt::Display for MemoryPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}/{}", self.value, S::NAME)
    }
}

/// Offset inside a page of size `S`.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryAddressOffset<S: PageSize> {
    value: u32,
    _phantom: PhantomData<S>,
}

impl<S: PageSize> MemoryAddressOffset<S> {
    /// Creates an offset, discarding bits at or above `S::SIZE`.
    #[inline]
    #[must_use]
    pub fn new(value: u32) -> Self {
        debug_assert!(value < S::SIZE, "offset must be smaller than the page");
        Self {
            value: value & (S::SIZE - 1),
            _phantom: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.value
    }
}

impl<S: PageSize> fmt::Debug for MemoryAddressOffset<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Offset<{}>({:#X})", S::NAME, self.value)
    }
}

macro_rules! address_kind {
    ($(#[$meta:meta])* $name:ident, $page:ident, $short:literal) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(MemoryAddress);

        impl $name {
            #[inline(always)]
            #[must_use]
            pub const fn new(value: u32) -> Self {
                Self(MemoryAddress::new(value))
            }

            #[inline(always)]
            #[must_use]
            pub const fn zero() -> Self {
                Self::new(0)
            }

            #[inline(always)]
            #[must_use]
            pub const fn as_u32(self) -> u32 {
                self.0.as_u32()
            }

            #[inline(always)]
            #[must_use]
            pub const fn is_null(self) -> bool {
                self.0.as_u32() == 0
            }

            #[inline]
            #[must_use]
            pub const fn page<S: PageSize>(self) -> $page<S> {
                $page(self.0.page::<S>())
            }

            #[inline]
            #[must_use]
            pub const fn offset<S: PageSize>(self) -> MemoryAddressOffset<S> {
                self.0.offset::<S>()
            }

            #[inline]
            #[must_use]
            pub const fn split<S: PageSize>(self) -> ($page<S>, MemoryAddressOffset<S>) {
                (self.page::<S>(), self.offset::<S>())
            }

            #[inline]
            #[must_use]
            pub const fn align_down<S: PageSize>(self) -> Self {
                Self(self.0.align_down::<S>())
            }

            #[inline]
            #[must_use]
            pub const fn checked_align_up<S: PageSize>(self) -> Option<Self> {
                match self.0.checked_align_up::<S>() {
                    Some(a) => Some(Self(a)),
                    None => None,
                }
            }

            #[inline]
            #[must_use]
            pub const fn is_aligned<S: PageSize>(self) -> bool {
                self.0.is_aligned::<S>()
            }

            #[inline]
            #[must_use]
            pub const fn checked_add(self, rhs: u32) -> Option<Self> {
                match self.0.checked_add(rhs) {
                    Some(a) => Some(Self(a)),
                    None => None,
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($short, "(0x{:08X})"), self.as_u32())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl Add<u32> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: u32) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl AddAssign<u32> for $name {
            #[inline]
            fn add_assign(&mut self, rhs: u32) {
                self.0 += rhs;
            }
        }

        impl Sub for $name {
            type Output = u32;

            #[inline]
            fn sub(self, rhs: Self) -> u32 {
                self.as_u32() - rhs.as_u32()
            }
        }

        impl From<u32> for $name {
            #[inline]
            fn from(value: u32) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u32 {
            #[inline]
            fn from(value: $name) -> Self {
                value.as_u32()
            }
        }

        /// Page base for size `S`. The low `S::SHIFT` bits are always zero.
        #[repr(transparent)]
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $page<S: PageSize>(MemoryPage<S>);

        impl<S: PageSize> $page<S> {
            #[inline]
            #[must_use]
            pub const fn containing(addr: $name) -> Self {
                addr.page::<S>()
            }

            #[inline]
            #[must_use]
            pub const fn from_number(number: u32) -> Self {
                Self(MemoryPage::from_number(number))
            }

            #[inline]
            #[must_use]
            pub const fn number(self) -> u32 {
                self.0.number()
            }

            #[inline]
            #[must_use]
            pub const fn base(self) -> $name {
                $name(self.0.base())
            }

            #[inline]
            #[must_use]
            pub const fn join(self, off: MemoryAddressOffset<S>) -> $name {
                $name(self.0.join(off))
            }
        }

        impl<S: PageSize> fmt::Debug for $page<S> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($page), "<{}>(0x{:08X})"), S::NAME, self.base().as_u32())
            }
        }

        impl<S: PageSize> fmt::Display for $page<S> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl<S: PageSize> From<$page<S>> for $name {
            #[inline]
            fn from(value: $page<S>) -> Self {
                value.base()
            }
        }

        impl<S: PageSize> TryFrom<$name> for $page<S> {
            type Error = $name;

            /// Fails with the original address if it is not page aligned.
            #[inline]
            fn try_from(addr: $name) -> Result<Self, $name> {
                if addr.is_aligned::<S>() {
                    Ok(addr.page())
                } else {
                    Err(addr)
                }
            }
        }
    };
}

address_kind!(
    /// Virtual memory address.
    ///
    /// Carries no invariant beyond intent; alignment is only guaranteed for
    /// values produced from a [`VirtualPage`].
    VirtualAddress,
    VirtualPage,
    "VA"
);

address_kind!(
    /// Physical memory address (RAM or MMIO).
    ///
    /// Page table entries store the page-aligned part of it in bits 12..32.
    PhysicalAddress,
    PhysicalPage,
    "PA"
);

impl VirtualAddress {
    /// Index into the page directory (bits 22..32).
    #[inline]
    #[must_use]
    pub const fn directory_index(self) -> usize {
        (self.as_u32() >> 22) as usize
    }

    /// Index into the page table (bits 12..22).
    #[inline]
    #[must_use]
    pub const fn table_index(self) -> usize {
        ((self.as_u32() >> 12) & 0x3FF) as usize
    }

    /// Rebuilds the page base addressed by a directory and table index.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_indices(directory: usize, table: usize) -> Self {
        Self::new(((directory as u32 & 0x3FF) << 22) | ((table as u32 & 0x3FF) << 12))
    }

    /// Whether the address lies in the kernel half (`>= 0xC000_0000`).
    #[inline]
    #[must_use]
    pub const fn is_kernel(self) -> bool {
        self.as_u32() >= 0xC000_0000
    }

    #[inline]
    #[must_use]
    pub fn as_ptr<T>(self) -> *const T {
        self.as_u32() as usize as *const T
    }

    #[inline]
    #[must_use]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.as_u32() as usize as *mut T
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join_4k() {
        let a = MemoryAddress::new(0x1234_5678);
        let (p, o) = a.split::<Size4K>();
        assert_eq!(p.base().as_u32(), 0x1234_5000);
        assert_eq!(o.as_u32(), 0x678);
        assert_eq!(p.join(o), a);
    }

    #[test]
    fn split_and_join_4m() {
        let a = MemoryAddress::new(0xC012_3456);
        let (p, o) = a.split::<Size4M>();
        assert_eq!(p.base().as_u32(), 0xC000_0000);
        assert_eq!(o.as_u32(), 0x12_3456);
        assert_eq!(p.join(o), a);
    }

    #[test]
    fn directory_and_table_indices() {
        let va = VirtualAddress::new(0xBFFF_FFF0);
        assert_eq!(va.directory_index(), 767);
        assert_eq!(va.table_index(), 1023);
        assert!(!va.is_kernel());
        assert!(VirtualAddress::new(0xC000_0000).is_kernel());
        assert_eq!(
            VirtualAddress::from_indices(767, 1023),
            VirtualAddress::new(0xBFFF_F000)
        );
    }

    #[test]
    fn alignment_helpers() {
        let pa = PhysicalAddress::new(0x12345);
        assert_eq!(pa.align_down::<Size4K>().as_u32(), 0x12000);
        assert_eq!(pa.checked_align_up::<Size4K>(), Some(PhysicalAddress::new(0x13000)));
        assert_eq!(PhysicalAddress::new(0xFFFF_F001).checked_align_up::<Size4K>(), None);
        assert!(PhysicalAddress::new(0x40_0000).is_aligned::<Size4M>());
    }

    #[test]
    fn page_numbers() {
        let p = PhysicalPage::<Size4K>::from_number(0x400);
        assert_eq!(p.base(), PhysicalAddress::new(0x40_0000));
        assert_eq!(p.number(), 0x400);
        assert!(PhysicalPage::<Size4K>::try_from(PhysicalAddress::new(0x1001)).is_err());
    }

    #[test]
    fn formatting() {
        assert_eq!(format!("{}", VirtualAddress::new(0xC000_0000)), "0xC0000000");
        assert_eq!(format!("{:?}", PhysicalAddress::new(0x1000)), "PA(0x00001000)");
        assert_eq!(
            format!("{:?}", VirtualAddress::new(0x2000).page::<Size4K>()),
            "VirtualPage<4K>(0x00002000)"
        );
    }
}
