//! The pmap: a boot-time identity map of all physical memory, built from
//! 2 MiB pages under PML4 slot 0.
//!
//! Every kernel access to physical memory (page tables included) goes through
//! this map, so it is built exactly once, never modified afterwards, and
//! shared into every process address space by copying the single PML4 entry.

use crate::{FrameSource, OutOfFrames, PageFlags, PageTableEntry, PhysMapper, get_table};
use crate::walker::descend_or_create;
use kernel_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size2M, Size4K, VirtualAddress};
use log::info;

/// What [`init_pmap`] built.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PmapStats {
    /// Interior tables (PDPT + PDs) allocated for the map.
    pub tables_allocated: u64,
    /// Bytes covered, rounded up to a 2 MiB multiple.
    pub bytes_mapped: u64,
}

/// Identity-map `[0, phys_bytes)` into `root` with writable 2 MiB pages.
///
/// Coverage is rounded up to a whole 2 MiB page; physical memory rarely ends
/// on that boundary and mapping slightly past the end is harmless as long as
/// nothing dereferences it.
///
/// # Errors
/// [`OutOfFrames`] if an interior table cannot be allocated.
///
/// # Panics
/// Panics if `phys_bytes` exceeds the 512 GiB a single PML4 slot can map, or
/// if any target entry is already present.
pub fn init_pmap<M: PhysMapper, A: FrameSource>(
    mapper: &M,
    root: PhysicalPage<Size4K>,
    phys_bytes: u64,
    alloc: &mut A,
) -> Result<PmapStats, OutOfFrames> {
    let end = kernel_addresses::align_up(phys_bytes, Size2M::SIZE);
    assert!(end <= 512 * 1024 * 1024 * 1024, "pmap must fit one PML4 slot");

    let mut tables = 0u64;
    let mut pa = 0u64;
    while pa < end {
        let va = VirtualAddress::new(pa);
        debug_assert_eq!(va.pml4_index(), 0);

        let pml4 = unsafe { get_table(mapper, root) };
        let before = pml4.entry(va.pml4_index()).present();
        let pdpt_frame = descend_or_create(pml4, va.pml4_index(), alloc)?;
        tables += u64::from(!before);

        let pdpt = unsafe { get_table(mapper, pdpt_frame) };
        let before = pdpt.entry(va.pdpt_index()).present();
        let pd_frame = descend_or_create(pdpt, va.pdpt_index(), alloc)?;
        tables += u64::from(!before);

        let pd = unsafe { get_table(mapper, pd_frame) };
        assert!(!pd.entry(va.pd_index()).present(), "pmap is built exactly once");
        let frame = PhysicalPage::<Size2M>::from_base(PhysicalAddress::new(pa));
        pd.set_entry(va.pd_index(), PageTableEntry::leaf_2m(frame, PageFlags::WRITABLE));

        pa += Size2M::SIZE;
    }

    let stats = PmapStats {
        tables_allocated: tables,
        bytes_mapped: end,
    };
    info!(
        "pmap: identity-mapped {} MiB with {} interior tables",
        stats.bytes_mapped / (1024 * 1024),
        stats.tables_allocated
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AddressSpace;
    use crate::sim::{SimFrames, SimRam};

    #[test]
    fn identity_translation_through_2m_leaves() {
        let ram = SimRam::with_frames(16);
        let mut pool = SimFrames::new(&ram, 16);
        let root = pool.alloc_4k().unwrap();

        // 5 MiB rounds up to three 2 MiB pages.
        let stats = init_pmap(&ram, root, 5 * 1024 * 1024, &mut pool).unwrap();
        assert_eq!(stats.bytes_mapped, 6 * 1024 * 1024);
        // One PDPT, one PD.
        assert_eq!(stats.tables_allocated, 2);

        let aspace = AddressSpace::from_root(&ram, root);
        for va in [0u64, 0x1000, 0x1F_FFFF, 0x20_0000, 0x5F_ABCD] {
            let pa = aspace.query(VirtualAddress::new(va)).unwrap();
            assert_eq!(pa.as_u64(), va);
        }
        assert!(aspace.query(VirtualAddress::new(6 * 1024 * 1024)).is_none());
    }

    #[test]
    fn pd_leaves_carry_the_ps_bit() {
        let ram = SimRam::with_frames(16);
        let mut pool = SimFrames::new(&ram, 16);
        let root = pool.alloc_4k().unwrap();
        init_pmap(&ram, root, 2 * Size2M::SIZE, &mut pool).unwrap();

        let pml4 = unsafe { crate::get_table(&ram, root) };
        let pdpt = unsafe { crate::get_table(&ram, pml4.entry(0).next_table()) };
        let pd = unsafe { crate::get_table(&ram, pdpt.entry(0).next_table()) };
        for i in 0..2 {
            let e = pd.entry(i);
            assert!(e.present());
            assert!(e.ps());
            assert_eq!(e.addr_2m().as_u64(), i as u64 * Size2M::SIZE);
        }
    }

    #[test]
    fn spans_pd_boundaries() {
        // 1 GiB + 2 MiB needs two PDs under one PDPT.
        let ram = SimRam::with_frames(16);
        let mut pool = SimFrames::new(&ram, 16);
        let root = pool.alloc_4k().unwrap();

        let gib = 1024 * 1024 * 1024;
        let stats = init_pmap(&ram, root, gib + Size2M::SIZE, &mut pool).unwrap();
        assert_eq!(stats.tables_allocated, 3);

        let aspace = AddressSpace::from_root(&ram, root);
        assert_eq!(aspace.query(VirtualAddress::new(gib)).unwrap().as_u64(), gib);
    }
}
