//! Legacy 32-bit page directory / page table entries.

pub const PTE_P: u32 = 1 << 0;
pub const PTE_RW: u32 = 1 << 1;
pub const PTE_US: u32 = 1 << 2;
pub const PTE_A: u32 = 1 << 5;
pub const PTE_D: u32 = 1 << 6;
pub const PTE_PS: u32 = 1 << 7;

#[inline]
pub(crate) fn is_present(entry: u32) -> bool {
    entry & PTE_P != 0
}

/// Base physical page of a table entry, or of the page table a directory entry points at.
#[inline]
pub(crate) fn base_page(entry: u32) -> u32 {
    entry >> 12
}

/// Physical page backing `lin_page` inside a 4MiB page.
///
/// Bits 13..21 of the entry are reserved on a 32-bit physical bus and ignored.
#[inline]
pub(crate) fn large_page_phys(pde: u32, lin_page: u32) -> u32 {
    (((pde >> 22) & 0x3ff) << 10) | (lin_page & 0x3ff)
}

#[inline]
pub(crate) fn pde_addr(dir_base: u32, linear: u32) -> u32 {
    dir_base | ((linear >> 22) << 2)
}

#[inline]
pub(crate) fn pte_addr(pde: u32, linear: u32) -> u32 {
    (base_page(pde) << 12) | ((linear >> 10) & 0xffc)
}

/// Value to write back to an entry after an access, or `None` if nothing changes.
#[inline]
pub(crate) fn touched(entry: u32, write: bool) -> Option<u32> {
    let mut updated = entry | PTE_A;
    if write {
        updated |= PTE_D;
    }
    (updated != entry).then_some(updated)
}
