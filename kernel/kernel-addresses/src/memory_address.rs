use crate::PageSize;
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// A raw 64-bit memory address with no physical/virtual kind attached.
///
/// [`VirtualAddress`](crate::VirtualAddress) and
/// [`PhysicalAddress`](crate::PhysicalAddress) wrap this type; use those in
/// APIs. `MemoryAddress` exists so the page/offset arithmetic is written once.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryAddress(u64);

impl MemoryAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn from_ptr<T>(ptr: *const T) -> Self {
        const _: () = assert!(
            size_of::<*const ()>() == size_of::<u64>(),
            "pointer size mismatch"
        );

        // Pointer-to-integer casts are rejected in const eval; a union read
        // of the same bits is not.
        union Ptr<T> {
            ptr: *const T,
            raw: u64,
        }

        let ptr = Ptr { ptr };
        Self(unsafe { ptr.raw })
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Base address of the page of size `S` containing this address.
    #[inline]
    #[must_use]
    pub const fn page_base<S: PageSize>(self) -> Self {
        Self(self.0 & !(S::SIZE - 1))
    }

    /// Byte offset of this address within its page of size `S`.
    #[inline]
    #[must_use]
    pub const fn page_offset<S: PageSize>(self) -> u64 {
        self.0 & (S::SIZE - 1)
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned_to(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }
}

impl fmt::Debug for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl fmt::Display for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl Add<u64> for MemoryAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for MemoryAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub<MemoryAddress> for MemoryAddress {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: MemoryAddress) -> Self::Output {
        self.0 - rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_ptr_round_trips_the_address() {
        let value = 42u32;
        let ptr = &raw const value;
        assert_eq!(MemoryAddress::from_ptr(ptr).as_u64(), ptr as u64);
    }
}
