//! Miss resolver: walks the guest page tables for unresolved TLB slots.

use tracing::{debug, error};

use crate::access::{access_class, mapping, predicts_fault, AccessClass};
use crate::bus::{Machine, PhysicalMemory};
use crate::entry::{
    base_page, is_present, large_page_phys, pde_addr, pte_addr, touched, PTE_A, PTE_D, PTE_PS,
};
use crate::error::{AccessError, PagingError};
use crate::fault::{FaultMode, PageFaultCode};
use crate::tlb::{Handler, PAGE_SHIFT, TLB_SLOTS};
use crate::PagingUnit;

/// The entry that maps a linear address.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Leaf {
    /// Guest-physical address of the PTE, or of the PDE for 4MiB pages.
    pub(crate) addr: u32,
    pub(crate) entry: u32,
    pub(crate) class: AccessClass,
    pub(crate) phys_page: u32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Lookup {
    Mapped(Leaf),
    /// The directory or table entry at `entry_addr` is not present.
    Missing { entry_addr: u32 },
}

/// Set A (and D for writes) in an entry, returning the updated value.
fn touch<P: PhysicalMemory + ?Sized>(mem: &mut P, addr: u32, entry: u32, write: bool) -> u32 {
    match touched(entry, write) {
        Some(updated) => {
            mem.write_u32(addr, updated);
            updated
        }
        None => entry,
    }
}

impl PagingUnit {
    #[inline]
    pub(crate) fn identity_page(&self, lin_page: u32) -> u32 {
        self.identity
            .get(lin_page as usize)
            .copied()
            .unwrap_or(lin_page)
    }

    #[inline]
    fn is_large(&self, pde: u32) -> bool {
        self.pse && pde & PTE_PS != 0
    }

    /// Read the entries mapping `linear` without touching them.
    pub(crate) fn lookup_leaf<P: PhysicalMemory + ?Sized>(&self, mem: &mut P, linear: u32) -> Lookup {
        let lin_page = linear >> PAGE_SHIFT;
        let pde_addr = pde_addr(self.dir_base, linear);
        let pde = mem.read_u32(pde_addr);
        if !is_present(pde) {
            return Lookup::Missing {
                entry_addr: pde_addr,
            };
        }
        if self.is_large(pde) {
            return Lookup::Mapped(Leaf {
                addr: pde_addr,
                entry: pde,
                class: access_class(pde, pde),
                phys_page: large_page_phys(pde, lin_page),
            });
        }
        let pte_addr = pte_addr(pde, linear);
        let pte = mem.read_u32(pte_addr);
        if !is_present(pte) {
            return Lookup::Missing {
                entry_addr: pte_addr,
            };
        }
        Lookup::Mapped(Leaf {
            addr: pte_addr,
            entry: pte,
            class: access_class(pde, pte),
            phys_page: base_page(pte),
        })
    }

    /// Resolve the unresolved slot covering `linear` for a read or write.
    pub(crate) fn resolve<M: Machine + ?Sized>(
        &mut self,
        m: &mut M,
        linear: u32,
        write: bool,
        mode: FaultMode,
    ) -> Result<(), AccessError> {
        let lin_page = linear >> PAGE_SHIFT;
        if !self.enabled {
            let phys_page = self.identity_page(lin_page);
            self.install(&*m, lin_page, phys_page, AccessClass::UserReadWrite, true)?;
            return Ok(());
        }

        loop {
            let user = self.privilege.is_user();
            let pde_addr = pde_addr(self.dir_base, linear);
            let pde = m.read_u32(pde_addr);
            if !is_present(pde) {
                self.fault_not_present(m, linear, pde_addr, write, user, mode)?;
                continue;
            }

            if self.is_large(pde) {
                let class = access_class(pde, pde);
                if predicts_fault(class, write, user, self.wp) {
                    let code = PageFaultCode::new(true, write, user);
                    self.raise_page_fault(m, linear, pde_addr, code, mode)?;
                    continue;
                }
                let pde = touch(m, pde_addr, pde, write);
                let phys_page = large_page_phys(pde, lin_page);
                self.install(&*m, lin_page, phys_page, class, pde & PTE_D != 0)?;
                return Ok(());
            }

            let pte_addr = pte_addr(pde, linear);
            let pte = m.read_u32(pte_addr);
            if !is_present(pte) {
                self.fault_not_present(m, linear, pte_addr, write, user, mode)?;
                continue;
            }
            if pde & PTE_A == 0 {
                m.write_u32(pde_addr, pde | PTE_A);
            }

            // Faults must be raised before A/D are committed.
            let class = access_class(pde, pte);
            if predicts_fault(class, write, user, self.wp) {
                let code = PageFaultCode::new(true, write, user);
                self.raise_page_fault(m, linear, pte_addr, code, mode)?;
                continue;
            }
            let pte = touch(m, pte_addr, pte, write);
            self.install(&*m, lin_page, base_page(pte), class, pte & PTE_D != 0)?;
            return Ok(());
        }
    }

    fn fault_not_present<M: Machine + ?Sized>(
        &mut self,
        m: &mut M,
        linear: u32,
        entry_addr: u32,
        write: bool,
        user: bool,
        mode: FaultMode,
    ) -> Result<(), AccessError> {
        let code = PageFaultCode::new(false, write, user);
        self.raise_page_fault(m, linear, entry_addr, code, mode)?;
        if !is_present(m.read_u32(entry_addr)) {
            let err = PagingError::FaultNotCorrected { linear, entry_addr };
            error!(%err, "guest page fault handler did not map the page");
            return Err(err.into());
        }
        Ok(())
    }

    /// Resolve `linear` outside the normal access path.
    ///
    /// Only acts on unresolved slots; returns whether a mapping was installed. Not-present
    /// entries still fault, but protection is not checked and only the accessed bits are set.
    pub fn force_resolve<M: Machine + ?Sized>(
        &mut self,
        m: &mut M,
        linear: u32,
    ) -> Result<bool, AccessError> {
        let lin_page = linear >> PAGE_SHIFT;
        if self.tlb.slot(lin_page).read_handler() != Handler::Unresolved {
            return Ok(false);
        }
        if !self.enabled {
            let phys_page = self.identity_page(lin_page);
            self.install(&*m, lin_page, phys_page, AccessClass::UserReadWrite, true)?;
            return Ok(true);
        }

        loop {
            let user = self.privilege.is_user();
            let pde_addr = pde_addr(self.dir_base, linear);
            let pde = m.read_u32(pde_addr);
            if !is_present(pde) {
                self.fault_not_present(m, linear, pde_addr, false, user, FaultMode::Deliver)?;
                continue;
            }
            if self.is_large(pde) {
                let pde = touch(m, pde_addr, pde, false);
                let phys_page = large_page_phys(pde, lin_page);
                let class = access_class(pde, pde);
                self.install(&*m, lin_page, phys_page, class, pde & PTE_D != 0)?;
                return Ok(true);
            }

            let pte_addr = pte_addr(pde, linear);
            let pte = m.read_u32(pte_addr);
            if !is_present(pte) {
                self.fault_not_present(m, linear, pte_addr, false, user, FaultMode::Deliver)?;
                continue;
            }
            touch(m, pde_addr, pde, false);
            let pte = touch(m, pte_addr, pte, false);
            let class = access_class(pde, pte);
            self.install(&*m, lin_page, base_page(pte), class, pte & PTE_D != 0)?;
            return Ok(true);
        }
    }

    /// Physical page that `lin_page` maps to, read from the guest tables without side effects.
    pub fn translate<P: PhysicalMemory + ?Sized>(&self, mem: &mut P, lin_page: u32) -> Option<u32> {
        let lin_page = lin_page & (TLB_SLOTS as u32 - 1);
        if !self.enabled {
            return Some(self.identity_page(lin_page));
        }
        match self.lookup_leaf(mem, lin_page << PAGE_SHIFT) {
            Lookup::Mapped(leaf) => Some(leaf.phys_page),
            Lookup::Missing { .. } => None,
        }
    }

    /// Install a translation and link the slot.
    pub(crate) fn install<P: PhysicalMemory + ?Sized>(
        &mut self,
        mem: &P,
        lin_page: u32,
        phys_page: u32,
        class: AccessClass,
        dirty: bool,
    ) -> Result<(), PagingError> {
        if lin_page as usize >= TLB_SLOTS || phys_page as usize >= TLB_SLOTS {
            let err = PagingError::IllegalPage {
                lin_page,
                phys_page,
            };
            error!(%err, "refusing to link page");
            return Err(err);
        }

        let previous = self.tlb.slot(lin_page).word();
        if previous.linked() {
            self.links.remove(lin_page, previous.class());
        } else if self.links.is_full() {
            debug!(
                capacity = self.links.capacity(),
                "link tables full, flushing TLB"
            );
            self.clear_tlb();
        }

        let mapping = mapping(class, self.wp, self.privilege.is_user());
        let handler = mem.page_handler(phys_page);
        if let Err(err) = self.tlb.fill(
            lin_page,
            phys_page,
            class,
            dirty,
            mapping,
            handler,
            mem.arena().len(),
        ) {
            self.tlb.reset(lin_page);
            error!(%err, "cannot map host page");
            return Err(err);
        }
        self.links.insert(lin_page, class);
        Ok(())
    }

    /// Re-wire a linked slot from its packed word for the current mode.
    pub(crate) fn refill<P: PhysicalMemory + ?Sized>(
        &mut self,
        mem: &P,
        lin_page: u32,
        dirty: bool,
    ) -> Result<(), PagingError> {
        let word = self.tlb.slot(lin_page).word();
        let class = word.class();
        let mapping = mapping(class, self.wp, self.privilege.is_user());
        self.tlb.fill(
            lin_page,
            word.phys_page(),
            class,
            dirty,
            mapping,
            mem.page_handler(word.phys_page()),
            mem.arena().len(),
        )
    }
}
