use std::collections::{BTreeSet, VecDeque};

use crate::{
    AccessError, ExceptionSink, ExecutionLoop, FaultFrame, GuestIp, PagingError, PagingUnit,
    PhysPageHandler, PhysicalMemory, Privilege, PAGE_SHIFT, PTE_P,
};

pub(crate) const RAM_SIZE: usize = 4 * 1024 * 1024;
pub(crate) const DIR_BASE: u32 = 0x0020_0000;
pub(crate) const TABLE_BASE: u32 = 0x0020_1000;

/// What the fake guest fault handler does for one delivered fault.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FaultAction {
    /// Store a dword to guest-physical memory.
    Poke { paddr: u32, value: u32 },
    /// Access linear memory through the paging unit.
    Touch { linear: u32, write: bool },
}

/// Flat RAM with optional MMIO pages and a scripted fault handler.
pub(crate) struct TestMachine {
    pub(crate) ram: Vec<u8>,
    pub(crate) mmio_pages: BTreeSet<u32>,
    pub(crate) mmio_reads: usize,
    pub(crate) ip: GuestIp,
    pub(crate) raised: Vec<(u8, u32)>,
    pub(crate) handled: Vec<(FaultFrame, Privilege)>,
    script: VecDeque<Vec<FaultAction>>,
}

impl TestMachine {
    pub(crate) fn new() -> Self {
        Self {
            ram: vec![0; RAM_SIZE],
            mmio_pages: BTreeSet::new(),
            mmio_reads: 0,
            ip: GuestIp {
                cs: 0x1b,
                eip: 0x0040_1000,
            },
            raised: Vec::new(),
            handled: Vec::new(),
            script: VecDeque::new(),
        }
    }

    /// Queue the handler actions for the next delivered fault.
    pub(crate) fn on_fault(&mut self, actions: Vec<FaultAction>) {
        self.script.push_back(actions);
    }

    pub(crate) fn write_u32_raw(&mut self, paddr: u32, value: u32) {
        let off = paddr as usize;
        self.ram[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn read_u32_raw(&self, paddr: u32) -> u32 {
        let off = paddr as usize;
        u32::from_le_bytes([
            self.ram[off],
            self.ram[off + 1],
            self.ram[off + 2],
            self.ram[off + 3],
        ])
    }

    pub(crate) fn pde_addr(linear: u32) -> u32 {
        DIR_BASE + (linear >> 22) * 4
    }

    /// PTE address assuming directory slot `n` points at `TABLE_BASE + n * 4096`.
    pub(crate) fn pte_addr(linear: u32) -> u32 {
        TABLE_BASE + (linear >> 22) * 0x1000 + ((linear >> 12) & 0x3ff) * 4
    }

    /// Map a 4KiB page with the given PDE/PTE flag bits (P is added to both).
    pub(crate) fn map_4k(&mut self, linear: u32, phys_page: u32, pde_flags: u32, pte_flags: u32) {
        let table = TABLE_BASE + (linear >> 22) * 0x1000;
        self.write_u32_raw(Self::pde_addr(linear), table | pde_flags | PTE_P);
        self.write_u32_raw(
            Self::pte_addr(linear),
            (phys_page << PAGE_SHIFT) | pte_flags | PTE_P,
        );
    }

    pub(crate) fn pte(&self, linear: u32) -> u32 {
        self.read_u32_raw(Self::pte_addr(linear))
    }

    pub(crate) fn pde(&self, linear: u32) -> u32 {
        self.read_u32_raw(Self::pde_addr(linear))
    }
}

impl PhysicalMemory for TestMachine {
    fn read_u8(&mut self, paddr: u32) -> u8 {
        if self.mmio_pages.contains(&(paddr >> PAGE_SHIFT)) {
            self.mmio_reads += 1;
            return 0xa5;
        }
        self.ram.get(paddr as usize).copied().unwrap_or(0xff)
    }

    fn write_u8(&mut self, paddr: u32, value: u8) {
        if self.mmio_pages.contains(&(paddr >> PAGE_SHIFT)) {
            return;
        }
        if let Some(slot) = self.ram.get_mut(paddr as usize) {
            *slot = value;
        }
    }

    fn page_handler(&self, phys_page: u32) -> PhysPageHandler {
        let base = phys_page << PAGE_SHIFT;
        if self.mmio_pages.contains(&phys_page) || base as usize >= self.ram.len() {
            PhysPageHandler::mmio()
        } else {
            PhysPageHandler::ram(base)
        }
    }

    fn arena(&self) -> &[u8] {
        &self.ram
    }

    fn arena_mut(&mut self) -> &mut [u8] {
        &mut self.ram
    }
}

impl ExceptionSink for TestMachine {
    fn raise_exception(&mut self, vector: u8, error_code: u32) {
        self.raised.push((vector, error_code));
    }
}

impl ExecutionLoop for TestMachine {
    fn segment_ip(&self) -> GuestIp {
        self.ip
    }

    fn run_until_fault_resolved(
        &mut self,
        paging: &mut PagingUnit,
        frame: &FaultFrame,
    ) -> Result<(), PagingError> {
        self.handled.push((*frame, paging.privilege()));
        let Some(actions) = self.script.pop_front() else {
            return Err(PagingError::MachineStopped {
                linear: frame.linear,
            });
        };
        for action in actions {
            let result = match action {
                FaultAction::Poke { paddr, value } => {
                    self.write_u32_raw(paddr, value);
                    Ok(())
                }
                FaultAction::Touch { linear, write: false } => {
                    paging.read_u8(self, linear).map(drop)
                }
                FaultAction::Touch { linear, write: true } => paging.write_u8(self, linear, 0),
            };
            match result {
                Ok(()) => {}
                Err(AccessError::Fatal(err)) => return Err(err),
                Err(AccessError::PageFault(pf)) => {
                    return Err(PagingError::MachineStopped { linear: pf.linear })
                }
            }
        }
        Ok(())
    }
}
