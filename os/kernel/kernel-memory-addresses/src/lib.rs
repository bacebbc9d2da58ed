//! # Virtual, Physical and Bus Address Types
//!
//! Strongly typed wrappers for the three address spaces a DMA buffer lives in:
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`VirtualAddress`] | Where the CPU (kernel or user) dereferences the buffer. |
//! | [`PhysicalAddress`] | Where the buffer sits in RAM. |
//! | [`BusAddress`] | What the DMA engine is programmed with. Only valid while a page is mapped for device access. |
//!
//! Mixing them up is a classic driver bug (handing a kernel pointer to the
//! DMA engine, or the bus address to `memset`), so they do not convert into
//! each other implicitly.
//!
//! ## Page arithmetic
//!
//! Transfers are cut into pages. [`pages_spanning`] and [`tail_length`] give
//! the page count of a byte length and the number of bytes that land in the
//! last page:
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let len = 2 * PAGE_SIZE + 10;
//! assert_eq!(pages_spanning::<Size4K>(len), 3);
//! assert_eq!(tail_length::<Size4K>(len), 10);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

use core::fmt;
use core::hash::Hash;
use core::ops::Add;

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for supported page sizes.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e., number of low bits used for the offset.
    const SHIFT: u32;
}

/// 4 KiB page (4096 bytes), the granularity of every DMA page.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4K;
impl sealed::Sealed for Size4K {}
impl PageSize for Size4K {
    const SIZE: u64 = 4096;
    const SHIFT: u32 = 12;
}

/// [`Size4K::SIZE`] as `usize`, for buffer lengths.
#[allow(clippy::cast_possible_truncation)]
pub const PAGE_SIZE: usize = Size4K::SIZE as usize;

/// Number of `S` pages needed to hold `len` bytes (`ceil(len / S::SIZE)`).
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn pages_spanning<S: PageSize>(len: usize) -> usize {
    len.div_ceil(S::SIZE as usize)
}

/// Bytes that fall into the last page of a `len`-byte run.
///
/// This is `len - (pages - 1) * S::SIZE`; a run that ends on a page boundary
/// has a full last page. Zero for an empty run.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn tail_length<S: PageSize>(len: usize) -> usize {
    let pages = pages_spanning::<S>(len);
    if pages == 0 {
        0
    } else {
        len - (pages - 1) * S::SIZE as usize
    }
}

/// A CPU-visible address.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The address as a raw pointer.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }

    /// Offset within the containing `S` page.
    #[inline]
    #[must_use]
    pub const fn page_offset<S: PageSize>(self) -> u64 {
        self.0 & (S::SIZE - 1)
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.page_offset::<S>() == 0
    }

    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(self.0 & !(S::SIZE - 1))
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualAddress(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

/// A RAM address as seen by the memory controller.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Page frame number of the containing `S` page.
    #[inline]
    #[must_use]
    pub const fn frame_number<S: PageSize>(self) -> u64 {
        self.0 >> S::SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.0 & (S::SIZE - 1) == 0
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalAddress(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

/// A device-side (IOVA / `dma_addr_t`) address handed to the DMA engine.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BusAddress(u64);

impl BusAddress {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Identity translation, for engines without an IOMMU in front of RAM.
    #[inline]
    #[must_use]
    pub const fn identity(pa: PhysicalAddress) -> Self {
        Self(pa.as_u64())
    }
}

impl fmt::Debug for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BusAddress(0x{:016X})", self.0)
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}
