#![allow(dead_code)]

use aero_paging::{
    AccessError, ExceptionSink, ExecutionLoop, FaultFrame, GuestIp, PagingError, PagingUnit,
    PhysPageHandler, PhysicalMemory, Privilege, PAGE_SHIFT, PTE_P,
};

pub const RAM_SIZE: usize = 8 * 1024 * 1024;
pub const PAGE_DIR: u32 = 0x0010_0000;
/// Page tables are allocated upwards from here.
pub const TABLES: u32 = 0x0010_1000;

pub const USER_IP: GuestIp = GuestIp {
    cs: 0x1b,
    eip: 0x0804_8000,
};
pub const HANDLER_IP: GuestIp = GuestIp {
    cs: 0x08,
    eip: 0xc010_0000,
};

/// Guest page fault handler body: runs with the paging unit in supervisor mode.
pub type FaultHandler = fn(&mut Guest, &mut PagingUnit, &FaultFrame) -> Result<(), AccessError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered {
    pub frame: FaultFrame,
    pub vector: u8,
    pub error_code: u32,
    pub privilege: Privilege,
    pub depth: usize,
}

/// A tiny machine: flat RAM, one fault handler, and an instruction pointer that moves to the
/// handler and back like an interrupt gate and IRET would.
pub struct Guest {
    pub ram: Vec<u8>,
    pub ip: GuestIp,
    pub handler: FaultHandler,
    pub delivered: Vec<Delivered>,
    pub resolved_on_return: Vec<bool>,
    /// Scratch state for handlers: `(linear, pte)` pairs to install on the next fault.
    pub backing: Vec<(u32, u32)>,
    pending_exception: Option<(u8, u32)>,
    next_table: u32,
}

pub fn ignore_fault(_: &mut Guest, _: &mut PagingUnit, _: &FaultFrame) -> Result<(), AccessError> {
    Ok(())
}

/// Map the faulting page from `Guest::backing`, like a demand-paging kernel.
pub fn demand_page(
    guest: &mut Guest,
    _: &mut PagingUnit,
    frame: &FaultFrame,
) -> Result<(), AccessError> {
    let page = frame.linear & !0xfff;
    if let Some(&(_, pte)) = guest.backing.iter().find(|(linear, _)| *linear == page) {
        guest.set_pte(page, pte);
    }
    Ok(())
}

impl Guest {
    pub fn new() -> Self {
        Self {
            ram: vec![0; RAM_SIZE],
            ip: USER_IP,
            handler: ignore_fault,
            delivered: Vec::new(),
            resolved_on_return: Vec::new(),
            backing: Vec::new(),
            pending_exception: None,
            next_table: TABLES,
        }
    }

    pub fn poke_u32(&mut self, paddr: u32, value: u32) {
        let off = paddr as usize;
        self.ram[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn peek_u32(&self, paddr: u32) -> u32 {
        let off = paddr as usize;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.ram[off..off + 4]);
        u32::from_le_bytes(buf)
    }

    pub fn pde_addr(linear: u32) -> u32 {
        PAGE_DIR + (linear >> 22) * 4
    }

    /// Address of the PTE for `linear`, allocating its page table (with `pde_flags`) if needed.
    pub fn pte_addr(&mut self, linear: u32, pde_flags: u32) -> u32 {
        let pde_addr = Self::pde_addr(linear);
        let mut pde = self.peek_u32(pde_addr);
        if pde & PTE_P == 0 {
            pde = self.next_table | pde_flags | PTE_P;
            self.next_table += 0x1000;
            self.poke_u32(pde_addr, pde);
        }
        (pde & !0xfff) + ((linear >> 12) & 0x3ff) * 4
    }

    pub fn map(&mut self, linear: u32, phys_page: u32, pde_flags: u32, pte_flags: u32) {
        let pte_addr = self.pte_addr(linear, pde_flags);
        self.poke_u32(pte_addr, (phys_page << PAGE_SHIFT) | pte_flags | PTE_P);
    }

    pub fn set_pte(&mut self, linear: u32, pte: u32) {
        let pde = self.peek_u32(Self::pde_addr(linear));
        let pte_addr = (pde & !0xfff) + ((linear >> 12) & 0x3ff) * 4;
        self.poke_u32(pte_addr, pte);
    }

    pub fn pte(&self, linear: u32) -> u32 {
        let pde = self.peek_u32(Self::pde_addr(linear));
        self.peek_u32((pde & !0xfff) + ((linear >> 12) & 0x3ff) * 4)
    }
}

impl PhysicalMemory for Guest {
    fn read_u8(&mut self, paddr: u32) -> u8 {
        self.ram.get(paddr as usize).copied().unwrap_or(0xff)
    }

    fn write_u8(&mut self, paddr: u32, value: u8) {
        if let Some(byte) = self.ram.get_mut(paddr as usize) {
            *byte = value;
        }
    }

    fn read_u32(&mut self, paddr: u32) -> u32 {
        if paddr as usize + 4 > self.ram.len() {
            return u32::MAX;
        }
        self.peek_u32(paddr)
    }

    fn page_handler(&self, phys_page: u32) -> PhysPageHandler {
        let base = phys_page << PAGE_SHIFT;
        if (base as usize) < self.ram.len() {
            PhysPageHandler::ram(base)
        } else {
            PhysPageHandler::mmio()
        }
    }

    fn arena(&self) -> &[u8] {
        &self.ram
    }

    fn arena_mut(&mut self) -> &mut [u8] {
        &mut self.ram
    }
}

impl ExceptionSink for Guest {
    fn raise_exception(&mut self, vector: u8, error_code: u32) {
        self.pending_exception = Some((vector, error_code));
    }
}

impl ExecutionLoop for Guest {
    fn segment_ip(&self) -> GuestIp {
        self.ip
    }

    fn run_until_fault_resolved(
        &mut self,
        paging: &mut PagingUnit,
        frame: &FaultFrame,
    ) -> Result<(), PagingError> {
        let Some((vector, error_code)) = self.pending_exception.take() else {
            return Err(PagingError::MachineStopped {
                linear: frame.linear,
            });
        };
        self.delivered.push(Delivered {
            frame: *frame,
            vector,
            error_code,
            privilege: paging.privilege(),
            depth: paging.fault_frames().len(),
        });

        let return_ip = self.ip;
        self.ip = HANDLER_IP;
        let handler = self.handler;
        let result = handler(self, paging, frame);
        self.ip = return_ip;

        let ip = self.ip;
        let resolved = frame.is_resolved(self, ip);
        self.resolved_on_return.push(resolved);
        match result {
            Ok(()) => Ok(()),
            Err(AccessError::Fatal(err)) => Err(err),
            Err(AccessError::PageFault(pf)) => Err(PagingError::MachineStopped { linear: pf.linear }),
        }
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
