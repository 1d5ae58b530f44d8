//! Guest memory accesses through the TLB and the page handlers behind it.

use tracing::{error, warn};

use crate::access::predicts_fault;
use crate::bus::{Machine, PhysicalMemory};
use crate::entry::touched;
use crate::error::{AccessError, PagingError};
use crate::fault::{FaultMode, PageFaultCode};
use crate::tlb::{Handler, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};
use crate::walk::Lookup;
use crate::PagingUnit;

/// Access width.
pub(crate) trait Width: Copy {
    const BYTES: u32;

    fn load(arena: &[u8], index: usize) -> Self;
    fn store(self, arena: &mut [u8], index: usize);
    fn read_phys<P: PhysicalMemory + ?Sized>(mem: &mut P, paddr: u32) -> Self;
    fn write_phys<P: PhysicalMemory + ?Sized>(self, mem: &mut P, paddr: u32);
    fn from_u32(value: u32) -> Self;
    fn to_u32(self) -> u32;
}

macro_rules! impl_width {
    ($ty:ty, $read:ident, $write:ident) => {
        impl Width for $ty {
            const BYTES: u32 = core::mem::size_of::<$ty>() as u32;

            #[inline]
            fn load(arena: &[u8], index: usize) -> Self {
                const N: usize = core::mem::size_of::<$ty>();
                let mut buf = [0u8; N];
                buf.copy_from_slice(&arena[index..index + N]);
                <$ty>::from_le_bytes(buf)
            }

            #[inline]
            fn store(self, arena: &mut [u8], index: usize) {
                const N: usize = core::mem::size_of::<$ty>();
                arena[index..index + N].copy_from_slice(&self.to_le_bytes());
            }

            #[inline]
            fn read_phys<P: PhysicalMemory + ?Sized>(mem: &mut P, paddr: u32) -> Self {
                mem.$read(paddr)
            }

            #[inline]
            fn write_phys<P: PhysicalMemory + ?Sized>(self, mem: &mut P, paddr: u32) {
                mem.$write(paddr, self)
            }

            #[inline]
            fn from_u32(value: u32) -> Self {
                value as $ty
            }

            #[inline]
            fn to_u32(self) -> u32 {
                self as u32
            }
        }
    };
}

impl_width!(u8, read_u8, write_u8);
impl_width!(u16, read_u16, write_u16);
impl_width!(u32, read_u32, write_u32);

#[inline]
fn crosses_page<W: Width>(linear: u32) -> bool {
    W::BYTES > 1 && (linear & PAGE_MASK) > PAGE_SIZE - W::BYTES
}

impl PagingUnit {
    /// Read guest linear memory. Faults are delivered.
    #[inline]
    pub fn read_u8<M: Machine + ?Sized>(&mut self, m: &mut M, linear: u32) -> Result<u8, AccessError> {
        self.read(m, linear, FaultMode::Deliver)
    }

    #[inline]
    pub fn read_u16<M: Machine + ?Sized>(&mut self, m: &mut M, linear: u32) -> Result<u16, AccessError> {
        self.read(m, linear, FaultMode::Deliver)
    }

    #[inline]
    pub fn read_u32<M: Machine + ?Sized>(&mut self, m: &mut M, linear: u32) -> Result<u32, AccessError> {
        self.read(m, linear, FaultMode::Deliver)
    }

    #[inline]
    pub fn write_u8<M: Machine + ?Sized>(
        &mut self,
        m: &mut M,
        linear: u32,
        value: u8,
    ) -> Result<(), AccessError> {
        self.write(m, linear, value, FaultMode::Deliver)
    }

    #[inline]
    pub fn write_u16<M: Machine + ?Sized>(
        &mut self,
        m: &mut M,
        linear: u32,
        value: u16,
    ) -> Result<(), AccessError> {
        self.write(m, linear, value, FaultMode::Deliver)
    }

    #[inline]
    pub fn write_u32<M: Machine + ?Sized>(
        &mut self,
        m: &mut M,
        linear: u32,
        value: u32,
    ) -> Result<(), AccessError> {
        self.write(m, linear, value, FaultMode::Deliver)
    }

    /// Read guest linear memory without delivering faults.
    ///
    /// A fault is returned as [`AccessError::PageFault`] and recorded for
    /// [`PagingUnit::take_pending_fault`].
    #[inline]
    pub fn read_u8_checked<M: Machine + ?Sized>(
        &mut self,
        m: &mut M,
        linear: u32,
    ) -> Result<u8, AccessError> {
        self.read(m, linear, FaultMode::Prepare)
    }

    #[inline]
    pub fn read_u16_checked<M: Machine + ?Sized>(
        &mut self,
        m: &mut M,
        linear: u32,
    ) -> Result<u16, AccessError> {
        self.read(m, linear, FaultMode::Prepare)
    }

    #[inline]
    pub fn read_u32_checked<M: Machine + ?Sized>(
        &mut self,
        m: &mut M,
        linear: u32,
    ) -> Result<u32, AccessError> {
        self.read(m, linear, FaultMode::Prepare)
    }

    #[inline]
    pub fn write_u8_checked<M: Machine + ?Sized>(
        &mut self,
        m: &mut M,
        linear: u32,
        value: u8,
    ) -> Result<(), AccessError> {
        self.write(m, linear, value, FaultMode::Prepare)
    }

    #[inline]
    pub fn write_u16_checked<M: Machine + ?Sized>(
        &mut self,
        m: &mut M,
        linear: u32,
        value: u16,
    ) -> Result<(), AccessError> {
        self.write(m, linear, value, FaultMode::Prepare)
    }

    #[inline]
    pub fn write_u32_checked<M: Machine + ?Sized>(
        &mut self,
        m: &mut M,
        linear: u32,
        value: u32,
    ) -> Result<(), AccessError> {
        self.write(m, linear, value, FaultMode::Prepare)
    }

    pub(crate) fn read<W: Width, M: Machine + ?Sized>(
        &mut self,
        m: &mut M,
        linear: u32,
        mode: FaultMode,
    ) -> Result<W, AccessError> {
        if crosses_page::<W>(linear) {
            let mut value = 0u32;
            for i in 0..W::BYTES {
                let byte: u8 = self.read(m, linear.wrapping_add(i), mode)?;
                value |= u32::from(byte) << (8 * i);
            }
            return Ok(W::from_u32(value));
        }

        let lin_page = linear >> PAGE_SHIFT;
        loop {
            let slot = *self.tlb.slot(lin_page);
            if let Some(bias) = slot.read_bias() {
                return Ok(W::load(m.arena(), bias.index(linear)));
            }
            match slot.read_handler() {
                Handler::Physical | Handler::UserReadOnly => {
                    return Ok(W::read_phys(m, slot.phys_addr(linear)));
                }
                Handler::Unresolved => self.resolve(m, linear, false, mode)?,
                Handler::AccessTrap => {
                    if let Some(paddr) = self.access_trap(m, linear, false, mode)? {
                        return Ok(W::read_phys(m, paddr));
                    }
                }
                Handler::DirtyTracking => {
                    let err = PagingError::DirtyTrackerRead { linear };
                    error!(%err, "read through a write-only handler");
                    return Err(err.into());
                }
            }
        }
    }

    pub(crate) fn write<W: Width, M: Machine + ?Sized>(
        &mut self,
        m: &mut M,
        linear: u32,
        value: W,
        mode: FaultMode,
    ) -> Result<(), AccessError> {
        if crosses_page::<W>(linear) {
            let value = value.to_u32();
            for i in 0..W::BYTES {
                self.write(m, linear.wrapping_add(i), (value >> (8 * i)) as u8, mode)?;
            }
            return Ok(());
        }

        let lin_page = linear >> PAGE_SHIFT;
        loop {
            let slot = *self.tlb.slot(lin_page);
            if let Some(bias) = slot.write_bias() {
                value.store(m.arena_mut(), bias.index(linear));
                return Ok(());
            }
            match slot.write_handler() {
                Handler::Physical => {
                    value.write_phys(m, slot.phys_addr(linear));
                    return Ok(());
                }
                Handler::Unresolved => self.resolve(m, linear, true, mode)?,
                Handler::DirtyTracking => self.track_dirty(m, linear)?,
                Handler::UserReadOnly => {
                    let class = slot.word().class();
                    if predicts_fault(class, true, self.privilege.is_user(), self.wp) {
                        if let Some(paddr) = self.access_trap(m, linear, true, mode)? {
                            value.write_phys(m, paddr);
                            return Ok(());
                        }
                    } else {
                        self.track_dirty(m, linear)?;
                    }
                }
                Handler::AccessTrap => {
                    if let Some(paddr) = self.access_trap(m, linear, true, mode)? {
                        value.write_phys(m, paddr);
                        return Ok(());
                    }
                }
            }
        }
    }

    /// First write to a clean page: set the guest dirty bit and switch the slot to direct writes.
    ///
    /// If the guest tables no longer describe the cached page the slot is dropped, so the retried
    /// write walks the tables again.
    fn track_dirty<M: Machine + ?Sized>(&mut self, m: &mut M, linear: u32) -> Result<(), PagingError> {
        let lin_page = linear >> PAGE_SHIFT;
        if !self.enabled {
            return self.refill(&*m, lin_page, true);
        }

        let cached = self.tlb.slot(lin_page).word().phys_page();
        match self.lookup_leaf(m, linear) {
            Lookup::Mapped(leaf) if leaf.phys_page == cached => {
                if let Some(updated) = touched(leaf.entry, true) {
                    m.write_u32(leaf.addr, updated);
                }
                self.refill(&*m, lin_page, true)
            }
            _ => {
                self.unlink(lin_page);
                Ok(())
            }
        }
    }

    /// Access denied by the cached permissions.
    ///
    /// Returns the physical address to use if the access turns out to be allowed, or `None` to
    /// retry after the TLB or the guest tables changed.
    fn access_trap<M: Machine + ?Sized>(
        &mut self,
        m: &mut M,
        linear: u32,
        write: bool,
        mode: FaultMode,
    ) -> Result<Option<u32>, AccessError> {
        let lin_page = linear >> PAGE_SHIFT;
        let slot = *self.tlb.slot(lin_page);
        let cached = slot.word().class();
        let user = self.privilege.is_user();
        if !predicts_fault(cached, write, user, self.wp) {
            return Ok(Some(slot.phys_addr(linear)));
        }
        if !self.enabled {
            self.clear_tlb();
            return Ok(None);
        }

        let (entry_addr, present) = match self.lookup_leaf(m, linear) {
            Lookup::Mapped(leaf) => {
                if self.config.stale_attribute_workaround && leaf.class != cached {
                    warn!(
                        linear = format_args!("{linear:#010x}"),
                        ?cached,
                        current = ?leaf.class,
                        "page attributes modified without TLB flush"
                    );
                    self.clear_tlb();
                    return Ok(None);
                }
                (leaf.addr, true)
            }
            Lookup::Missing { entry_addr } => (entry_addr, false),
        };

        // #PF invalidates the faulting page; the retry walks whatever the handler left behind.
        self.unlink(lin_page);
        let code = PageFaultCode::new(present, write, user);
        self.raise_page_fault(m, linear, entry_addr, code, mode)?;
        Ok(None)
    }
}
