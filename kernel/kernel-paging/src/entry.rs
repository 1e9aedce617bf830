use kernel_addresses::{PhysicalAddress, PhysicalPage, Size2M, Size4K};
use core::fmt;

bitflags::bitflags! {
    /// Page table entry flags used in x86-64 virtual memory.
    ///
    /// They apply to all paging levels (PTE, PDE, PDPTE, PML4E), except where
    /// noted.
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub struct PageFlags: u64 {
        /// Page is present in physical memory. Cleared entries fault on
        /// access.
        const PRESENT  = 1 << 0;

        /// Page is writable. If cleared the page is read-only.
        const WRITABLE = 1 << 1;

        /// Page is accessible from user mode (CPL=3).
        const USER     = 1 << 2;

        /// Page size flag. Valid only in a PDE (2 MiB leaf) or PDPTE (1 GiB
        /// leaf); this kernel uses it for the pmap's 2 MiB pages.
        const PS       = 1 << 7;

        /// No-execute. Marks the page non-executable when EFER.NXE is set.
        const NX       = 1 << 63;
    }
}

/// Physical address field of a 4 KiB-granular entry (interior tables and PT
/// leaves).
const ADDR_MASK_4K: u64 = 0x0000_FFFF_FFFF_F000;
/// Physical address field of a 2 MiB PD leaf (PS=1).
const ADDR_MASK_2M: u64 = 0x0000_FFFF_FFE0_0000;

/// One 64-bit entry of any paging level.
///
/// Deliberately a thin wrapper over the raw value with explicit mask/shift
/// accessors: the hardware format is fixed, and spelling the bits out avoids
/// depending on any compiler's bitfield packing.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// An entry with all bits clear (not present).
    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// A non-leaf entry pointing at the next-level table.
    #[inline]
    #[must_use]
    pub fn table(next: PhysicalPage<Size4K>) -> Self {
        Self((next.base().as_u64() & ADDR_MASK_4K) | (PageFlags::PRESENT | PageFlags::WRITABLE).bits())
    }

    /// A PT leaf mapping one 4 KiB frame.
    #[inline]
    #[must_use]
    pub fn leaf_4k(frame: PhysicalPage<Size4K>, flags: PageFlags) -> Self {
        Self((frame.base().as_u64() & ADDR_MASK_4K) | (flags | PageFlags::PRESENT).bits())
    }

    /// A PD leaf mapping one 2 MiB page (sets PS).
    #[inline]
    #[must_use]
    pub fn leaf_2m(frame: PhysicalPage<Size2M>, flags: PageFlags) -> Self {
        Self(
            (frame.base().as_u64() & ADDR_MASK_2M)
                | (flags | PageFlags::PRESENT | PageFlags::PS).bits(),
        )
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn present(self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    #[inline]
    #[must_use]
    pub const fn writable(self) -> bool {
        self.0 & PageFlags::WRITABLE.bits() != 0
    }

    #[inline]
    #[must_use]
    pub const fn user(self) -> bool {
        self.0 & PageFlags::USER.bits() != 0
    }

    #[inline]
    #[must_use]
    pub const fn ps(self) -> bool {
        self.0 & PageFlags::PS.bits() != 0
    }

    #[inline]
    #[must_use]
    pub const fn nx(self) -> bool {
        self.0 & PageFlags::NX.bits() != 0
    }

    /// Physical address for 4 KiB-granular entries (interior tables, PT
    /// leaves).
    #[inline]
    #[must_use]
    pub const fn addr_4k(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 & ADDR_MASK_4K)
    }

    /// Physical address of a 2 MiB leaf (PS must be set).
    #[inline]
    #[must_use]
    pub const fn addr_2m(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 & ADDR_MASK_2M)
    }

    /// The next-level table this non-leaf entry points at.
    #[inline]
    #[must_use]
    pub fn next_table(self) -> PhysicalPage<Size4K> {
        debug_assert!(self.present() && !self.ps());
        PhysicalPage::from_base(self.addr_4k())
    }

    /// Reset to not-present with all bits clear.
    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PTE(0x{:016X})", self.0)
    }
}

/// One page of 512 entries; the same shape serves all four levels.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; Self::ENTRY_COUNT],
}

impl PageTable {
    pub const ENTRY_COUNT: usize = 512;

    #[inline]
    #[must_use]
    pub const fn entry(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    #[inline]
    pub fn set_entry(&mut self, index: usize, entry: PageTableEntry) {
        self.entries[index] = entry;
    }

    #[inline]
    pub fn clear_entry(&mut self, index: usize) {
        self.entries[index].clear();
    }

    /// Clear every entry.
    pub fn zero(&mut self) {
        self.entries = [PageTableEntry::empty(); Self::ENTRY_COUNT];
    }

    /// A table is empty iff no entry is present; emptiness makes its backing
    /// frame reclaimable by the parent during unmap.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.present())
    }
}
