//! Software paging unit for a 386/486-class x86 guest.
//!
//! Every guest linear page has a TLB slot. A resolved slot either carries a direct bias into the
//! host memory arena (the fast path, no dispatch) or names a [`Handler`] that decides what the
//! access does: walk the guest tables, set the dirty bit on first write, raise a page fault, or
//! forward to the physical page.
//!
//! Page faults are delivered by re-entering the execution loop while the faulting access waits
//! (see [`ExecutionLoop::run_until_fault_resolved`]), so a guest fault handler that faults again
//! nests on the bounded [`FaultFrame`] stack.

mod access;
mod bus;
mod config;
mod entry;
mod error;
mod fault;
mod handler;
mod io;
mod links;
mod relink;
mod snapshot;
mod tlb;
mod walk;

pub use access::{access_class, mapping, predicts_fault, AccessClass, Mapping};
pub use bus::{
    ExceptionSink, ExecutionLoop, GuestIp, Machine, PageFlags, PhysPageHandler, PhysicalMemory,
};
pub use config::{FaultDelivery, PagingConfig};
pub use entry::{PTE_A, PTE_D, PTE_P, PTE_PS, PTE_RW, PTE_US};
pub use error::{AccessError, PagingError, SnapshotError};
pub use fault::{FaultFrame, PageFault, PageFaultCode, PAGE_FAULT_VECTOR};
pub use relink::Privilege;
pub use tlb::{Handler, HostBias, TlbSlot, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, TLB_SLOTS};

use fault::FaultQueue;
use links::LinkTables;
use tlb::Tlb;

#[cfg(test)]
mod test_util;

/// Linear pages below this (first MiB plus the HMA) go through the identity map while paging is
/// disabled.
pub const IDENTITY_PAGES: usize = (1024 + 64) / 4;

/// The paging state of one emulated CPU.
pub struct PagingUnit {
    config: PagingConfig,
    tlb: Tlb,
    links: LinkTables,
    faults: FaultQueue,
    identity: Vec<u32>,
    enabled: bool,
    dir_base: u32,
    cr2: u32,
    wp: bool,
    pse: bool,
    privilege: Privilege,
    pending: Option<PageFault>,
}

impl Default for PagingUnit {
    fn default() -> Self {
        Self::new(PagingConfig::default())
    }
}

impl PagingUnit {
    pub fn new(config: PagingConfig) -> Self {
        Self {
            tlb: Tlb::new(),
            links: LinkTables::new(config.link_capacity),
            faults: FaultQueue::new(config.fault_queue_depth),
            identity: (0..IDENTITY_PAGES as u32).collect(),
            enabled: false,
            dir_base: 0,
            cr2: 0,
            wp: false,
            pse: config.pse,
            privilege: Privilege::Supervisor,
            pending: None,
            config,
        }
    }

    pub fn config(&self) -> &PagingConfig {
        &self.config
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// CR0.PG.
    pub fn enable(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        self.clear_tlb();
    }

    pub fn dir_base(&self) -> u32 {
        self.dir_base
    }

    /// Load CR3. The low 12 bits are ignored.
    pub fn set_dir_base(&mut self, cr3: u32) {
        self.dir_base = cr3 & !PAGE_MASK;
        if self.enabled {
            self.clear_tlb();
        }
    }

    pub fn write_protect(&self) -> bool {
        self.wp
    }

    /// CR0.WP.
    pub fn set_write_protect(&mut self, wp: bool) {
        self.wp = wp;
        if self.enabled {
            self.clear_tlb();
        }
    }

    pub fn pse(&self) -> bool {
        self.pse
    }

    /// CR4.PSE.
    pub fn set_pse(&mut self, pse: bool) {
        if self.pse == pse {
            return;
        }
        self.pse = pse;
        if self.enabled {
            self.clear_tlb();
        }
    }

    pub fn privilege(&self) -> Privilege {
        self.privilege
    }

    /// Last faulting linear address.
    pub fn cr2(&self) -> u32 {
        self.cr2
    }

    /// The fault recorded by the last failed checked access, if not taken yet.
    pub fn take_pending_fault(&mut self) -> Option<PageFault> {
        self.pending.take()
    }

    /// Faults currently being handled, outermost first.
    pub fn fault_frames(&self) -> &[FaultFrame] {
        self.faults.frames()
    }

    /// The TLB slot covering `linear`.
    #[inline]
    pub fn lookup(&self, linear: u32) -> &TlbSlot {
        self.tlb.slot(linear >> PAGE_SHIFT)
    }

    /// Cached physical page of `linear`, if its slot is linked.
    pub fn tlb_physical_page(&self, linear: u32) -> Option<u32> {
        self.lookup(linear).phys_page()
    }

    pub fn tlb_physical_address(&self, linear: u32) -> Option<u32> {
        self.tlb_physical_page(linear)
            .map(|page| (page << PAGE_SHIFT) | (linear & PAGE_MASK))
    }

    /// Number of linked slots.
    pub fn linked_pages(&self) -> usize {
        self.links.all().len()
    }

    /// Linked slots of one access class. Always empty for [`AccessClass::UserReadWrite`].
    pub fn linked_pages_of(&self, class: AccessClass) -> &[u32] {
        self.links.classified(class)
    }

    /// Drop every cached translation.
    pub fn clear_tlb(&mut self) {
        for lin_page in self.links.drain() {
            self.tlb.reset(lin_page);
        }
    }

    pub(crate) fn unlink(&mut self, lin_page: u32) {
        let word = self.tlb.slot(lin_page).word();
        if word.linked() {
            self.links.remove(lin_page, word.class());
        }
        self.tlb.reset(lin_page);
    }

    /// Return `count` slots starting at `lin_page` to the unresolved state.
    pub fn unlink_pages(&mut self, lin_page: u32, count: u32) {
        let end = lin_page.saturating_add(count).min(TLB_SLOTS as u32);
        for page in lin_page..end {
            self.unlink(page);
        }
    }

    /// Link `lin_page` straight to `phys_page` with full access, bypassing the guest tables.
    pub fn link_page<P: PhysicalMemory + ?Sized>(
        &mut self,
        mem: &P,
        lin_page: u32,
        phys_page: u32,
    ) -> Result<(), PagingError> {
        self.install(mem, lin_page, phys_page, AccessClass::UserReadWrite, true)
    }

    /// Remap a linear page. Pages inside the identity-mapped range update the identity map used
    /// while paging is off; others are linked directly.
    pub fn map_page<P: PhysicalMemory + ?Sized>(
        &mut self,
        mem: &P,
        lin_page: u32,
        phys_page: u32,
    ) -> Result<(), PagingError> {
        if (lin_page as usize) < IDENTITY_PAGES {
            if phys_page as usize >= TLB_SLOTS {
                return Err(PagingError::IllegalPage {
                    lin_page,
                    phys_page,
                });
            }
            self.identity[lin_page as usize] = phys_page;
            self.unlink(lin_page);
            return Ok(());
        }
        self.link_page(mem, lin_page, phys_page)
    }

    /// Identity map entry for `lin_page`, used while paging is disabled.
    pub fn identity_mapping(&self, lin_page: u32) -> u32 {
        self.identity_page(lin_page)
    }
}
