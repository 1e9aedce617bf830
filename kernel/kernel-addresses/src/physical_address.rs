use crate::{MemoryAddress, PageSize};
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Add, AddAssign};

/// Physical memory address.
///
/// A thin wrapper around [`MemoryAddress`] that denotes **physical** addresses
/// (frame addresses, page-table pointers). Dereferencing one always goes
/// through a `PhysMapper`-style translation owned by the caller.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(pub(crate) MemoryAddress);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(MemoryAddress::new(v))
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0.as_u64()
    }

    /// The frame of size `S` containing this address.
    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> PhysicalPage<S> {
        PhysicalPage(self.0.page_base::<S>(), PhantomData)
    }

    #[inline]
    #[must_use]
    pub const fn page_offset<S: PageSize>(self) -> u64 {
        self.0.page_offset::<S>()
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned_to(self, align: u64) -> bool {
        self.0.is_aligned_to(align)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.as_u64())
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.as_u64())
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

/// A page-aligned physical frame address for page size `S`.
///
/// Used both for allocatable 4 KiB frames and for page-table roots.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize>(MemoryAddress, PhantomData<S>);

impl<S: PageSize> PhysicalPage<S> {
    /// Wraps an address that is already `S`-aligned.
    ///
    /// # Panics
    /// Panics in debug builds if `base` is not aligned to `S::SIZE`.
    #[inline]
    #[must_use]
    pub fn from_base(base: PhysicalAddress) -> Self {
        debug_assert!(base.is_aligned_to(S::SIZE));
        Self(base.0, PhantomData)
    }

    /// The frame containing `addr` (rounds down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        addr.page::<S>()
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.0)
    }

    #[inline]
    #[must_use]
    pub const fn add_pages(self, n: u64) -> Self {
        Self(MemoryAddress::new(self.0.as_u64() + n * S::SIZE), PhantomData)
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PP<{}>(0x{:016X})", S::as_str(), self.0.as_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Size4K;

    #[test]
    fn frame_arithmetic() {
        let pa = PhysicalAddress::new(0x30_1234);
        let frame = pa.page::<Size4K>();
        assert_eq!(frame.base().as_u64(), 0x30_1000);
        assert_eq!(frame.add_pages(2).base().as_u64(), 0x30_3000);
        assert_eq!(pa.page_offset::<Size4K>(), 0x234);
    }
}
