use crate::{MemoryAddress, PageSize};
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Add, AddAssign};

/// Virtual memory address.
///
/// A thin wrapper around [`MemoryAddress`] that denotes **virtual** addresses.
/// It does not validate canonicality at runtime; it only carries the kind of
/// address at the type level.
///
/// The `*_index` accessors extract the four 9-bit page-table indices used by
/// the 4-level translation walk:
///
/// ```text
/// | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
/// |  PML4 |  PDPT |   PD  |   PT  | Offset |
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(pub(crate) MemoryAddress);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(MemoryAddress::new(v))
    }

    #[inline]
    #[must_use]
    pub const fn from_ptr<T>(ptr: *const T) -> Self {
        Self(MemoryAddress::from_ptr(ptr))
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

    /// The page of size `S` containing this address.
    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> VirtualPage<S> {
        VirtualPage(self.0.page_base::<S>(), PhantomData)
    }

    /// Byte offset within the containing page of size `S`.
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

    /// Index into the PML4 (bits 47..39).
    #[inline]
    #[must_use]
    pub const fn pml4_index(self) -> usize {
        ((self.as_u64() >> 39) & 0x1ff) as usize
    }

    /// Index into the PDPT (bits 38..30).
    #[inline]
    #[must_use]
    pub const fn pdpt_index(self) -> usize {
        ((self.as_u64() >> 30) & 0x1ff) as usize
    }

    /// Index into the PD (bits 29..21).
    #[inline]
    #[must_use]
    pub const fn pd_index(self) -> usize {
        ((self.as_u64() >> 21) & 0x1ff) as usize
    }

    /// Index into the PT (bits 20..12).
    #[inline]
    #[must_use]
    pub const fn pt_index(self) -> usize {
        ((self.as_u64() >> 12) & 0x1ff) as usize
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.as_u64())
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.as_u64())
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

/// A page-aligned virtual address for page size `S`.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage<S: PageSize>(MemoryAddress, PhantomData<S>);

impl<S: PageSize> VirtualPage<S> {
    /// Wraps an address that is already `S`-aligned.
    ///
    /// # Panics
    /// Panics in debug builds if `base` is not aligned to `S::SIZE`.
    #[inline]
    #[must_use]
    pub fn from_base(base: VirtualAddress) -> Self {
        debug_assert!(base.is_aligned_to(S::SIZE));
        Self(base.0, PhantomData)
    }

    /// The page containing `addr` (rounds down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: VirtualAddress) -> Self {
        addr.page::<S>()
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress(self.0)
    }

    /// The page `n` pages after this one.
    #[inline]
    #[must_use]
    pub const fn add_pages(self, n: u64) -> Self {
        Self(MemoryAddress::new(self.0.as_u64() + n * S::SIZE), PhantomData)
    }
}

impl<S: PageSize> fmt::Debug for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VP<{}>(0x{:016X})", S::as_str(), self.0.as_u64())
    }
}
