use crate::{PageSize, PhysicalAddress, Size4K, VirtualAddress, VirtualPage};
use core::fmt;

/// A half-open span of virtual address space: `[start, start + length)`.
///
/// Two ranges are *adjacent* iff `a.one_past_end() == b.start()`; allocators
/// coalesce exactly-adjacent free ranges and never hand out overlapping ones.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct VirtualRange {
    start: VirtualAddress,
    length: u64,
}

impl VirtualRange {
    #[inline]
    #[must_use]
    pub const fn new(start: VirtualAddress, length: u64) -> Self {
        Self { start, length }
    }

    #[inline]
    #[must_use]
    pub const fn start(self) -> VirtualAddress {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn length(self) -> u64 {
        self.length
    }

    /// First address past the end of the range.
    #[inline]
    #[must_use]
    pub const fn one_past_end(self) -> VirtualAddress {
        VirtualAddress::new(self.start.as_u64() + self.length)
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.length == 0
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, addr: VirtualAddress) -> bool {
        addr.as_u64() >= self.start.as_u64() && addr.as_u64() < self.one_past_end().as_u64()
    }

    /// Whether `self` ends exactly where `other` begins.
    #[inline]
    #[must_use]
    pub const fn is_adjacent_to(self, other: Self) -> bool {
        self.one_past_end().as_u64() == other.start.as_u64()
    }

    /// Remove `prefix` from the front of the range, returning the remainder.
    ///
    /// # Panics
    /// Panics if `prefix` does not start at `self.start()` or is longer than
    /// `self`.
    #[must_use]
    pub fn subtract_prefix(self, prefix: Self) -> Self {
        assert_eq!(prefix.start, self.start);
        assert!(prefix.length <= self.length);
        Self::new(prefix.one_past_end(), self.length - prefix.length)
    }

    /// Number of whole 4 KiB pages covered; the range length must be a page
    /// multiple.
    #[inline]
    #[must_use]
    pub const fn page_count(self) -> u64 {
        self.length / Size4K::SIZE
    }

    /// Iterate the 4 KiB pages of the range, in address order.
    pub fn pages(self) -> impl Iterator<Item = VirtualPage<Size4K>> {
        let first = self.start.page::<Size4K>();
        (0..self.page_count()).map(move |i| first.add_pages(i))
    }
}

impl fmt::Debug for VirtualRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VRange(0x{:016X}..0x{:016X})",
            self.start.as_u64(),
            self.one_past_end().as_u64()
        )
    }
}

/// A half-open span of physical address space: `[start, start + length)`.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct PhysicalRange {
    start: PhysicalAddress,
    length: u64,
}

impl PhysicalRange {
    #[inline]
    #[must_use]
    pub const fn new(start: PhysicalAddress, length: u64) -> Self {
        Self { start, length }
    }

    #[inline]
    #[must_use]
    pub const fn start(self) -> PhysicalAddress {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn length(self) -> u64 {
        self.length
    }

    #[inline]
    #[must_use]
    pub const fn one_past_end(self) -> PhysicalAddress {
        PhysicalAddress::new(self.start.as_u64() + self.length)
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, addr: PhysicalAddress) -> bool {
        addr.as_u64() >= self.start.as_u64() && addr.as_u64() < self.one_past_end().as_u64()
    }

    /// Remove `prefix` bytes from the front, returning the remainder.
    ///
    /// # Panics
    /// Panics if `prefix` exceeds the range length.
    #[must_use]
    pub fn subtract_front(self, prefix: u64) -> Self {
        assert!(prefix <= self.length);
        Self::new(self.start + prefix, self.length - prefix)
    }
}

impl fmt::Debug for PhysicalRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PRange(0x{:016X}..0x{:016X})",
            self.start.as_u64(),
            self.one_past_end().as_u64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjacency_is_exact() {
        let a = VirtualRange::new(VirtualAddress::new(0x1000), 0x2000);
        let b = VirtualRange::new(VirtualAddress::new(0x3000), 0x1000);
        let c = VirtualRange::new(VirtualAddress::new(0x4000), 0x1000);
        assert!(a.is_adjacent_to(b));
        assert!(!a.is_adjacent_to(c));
        assert!(!b.is_adjacent_to(a));
    }

    #[test]
    fn subtract_prefix_yields_remainder() {
        let full = VirtualRange::new(VirtualAddress::new(0x10_0000), 0x5000);
        let header = VirtualRange::new(VirtualAddress::new(0x10_0000), 0x1000);
        let rest = full.subtract_prefix(header);
        assert_eq!(rest.start().as_u64(), 0x10_1000);
        assert_eq!(rest.length(), 0x4000);
        assert_eq!(rest.one_past_end(), full.one_past_end());
    }

    #[test]
    fn page_iteration() {
        let r = VirtualRange::new(VirtualAddress::new(0x8000), 3 * 4096);
        let pages: Vec<_> = r.pages().map(|p| p.base().as_u64()).collect();
        assert_eq!(pages, [0x8000, 0x9000, 0xA000]);
    }
}
