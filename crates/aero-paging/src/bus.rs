//! Contracts with the rest of the emulator.

use bitflags::bitflags;

use crate::error::PagingError;
use crate::fault::FaultFrame;
use crate::PagingUnit;

bitflags! {
    /// Capabilities of a physical page as reported by its owner.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct PageFlags: u8 {
        /// Reads may go straight to the host arena.
        const READABLE = 1 << 0;
        /// Writes may go straight to the host arena.
        const WRITEABLE = 1 << 1;
        /// Device memory; every access must go through the bus.
        const MMIO = 1 << 2;
    }
}

/// What backs a single physical page.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PhysPageHandler {
    pub flags: PageFlags,
    /// Byte offset of the page in [`PhysicalMemory::arena`]. Ignored unless the page is
    /// directly readable or writeable.
    pub host_base: u32,
}

impl PhysPageHandler {
    /// Plain RAM backed by the arena at `host_base`.
    pub const fn ram(host_base: u32) -> Self {
        Self {
            flags: PageFlags::READABLE.union(PageFlags::WRITEABLE),
            host_base,
        }
    }

    /// ROM: direct reads, writes go through the bus (which usually drops them).
    pub const fn rom(host_base: u32) -> Self {
        Self {
            flags: PageFlags::READABLE,
            host_base,
        }
    }

    pub const fn mmio() -> Self {
        Self {
            flags: PageFlags::MMIO,
            host_base: 0,
        }
    }

    #[inline]
    pub fn host_read(&self) -> Option<u32> {
        self.direct(PageFlags::READABLE)
    }

    #[inline]
    pub fn host_write(&self) -> Option<u32> {
        self.direct(PageFlags::WRITEABLE)
    }

    #[inline]
    fn direct(&self, flag: PageFlags) -> Option<u32> {
        (self.flags.contains(flag) && !self.flags.contains(PageFlags::MMIO)).then_some(self.host_base)
    }
}

/// Guest physical memory and its per-page handler registry.
pub trait PhysicalMemory {
    fn read_u8(&mut self, paddr: u32) -> u8;
    fn write_u8(&mut self, paddr: u32, value: u8);

    #[inline]
    fn read_u16(&mut self, paddr: u32) -> u16 {
        u16::from_le_bytes([self.read_u8(paddr), self.read_u8(paddr.wrapping_add(1))])
    }

    #[inline]
    fn read_u32(&mut self, paddr: u32) -> u32 {
        let lo = self.read_u16(paddr);
        let hi = self.read_u16(paddr.wrapping_add(2));
        u32::from(lo) | (u32::from(hi) << 16)
    }

    #[inline]
    fn write_u16(&mut self, paddr: u32, value: u16) {
        let [lo, hi] = value.to_le_bytes();
        self.write_u8(paddr, lo);
        self.write_u8(paddr.wrapping_add(1), hi);
    }

    #[inline]
    fn write_u32(&mut self, paddr: u32, value: u32) {
        self.write_u16(paddr, value as u16);
        self.write_u16(paddr.wrapping_add(2), (value >> 16) as u16);
    }

    /// Handler for physical page `phys_page` (`paddr >> 12`).
    fn page_handler(&self, phys_page: u32) -> PhysPageHandler;

    /// Host memory that direct TLB slots index into.
    fn arena(&self) -> &[u8];
    fn arena_mut(&mut self) -> &mut [u8];
}

/// CS:EIP of the instruction currently executing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct GuestIp {
    pub cs: u16,
    pub eip: u32,
}

/// The instruction execution loop that drives the paging unit.
pub trait ExecutionLoop {
    fn segment_ip(&self) -> GuestIp;

    /// Execute guest code (the page fault handler) until `frame` is resolved.
    ///
    /// Implementations step the guest until [`FaultFrame::is_resolved`] holds for the current
    /// CS:EIP. Memory accesses made while doing so go through `paging`, so further faults nest.
    fn run_until_fault_resolved(
        &mut self,
        paging: &mut PagingUnit,
        frame: &FaultFrame,
    ) -> Result<(), PagingError>;
}

/// Hands exceptions to the CPU's general delivery mechanism.
pub trait ExceptionSink {
    fn raise_exception(&mut self, vector: u8, error_code: u32);
}

/// Everything the paging unit needs from the surrounding machine.
pub trait Machine: PhysicalMemory + ExecutionLoop + ExceptionSink {}

impl<T: PhysicalMemory + ExecutionLoop + ExceptionSink + ?Sized> Machine for T {}
