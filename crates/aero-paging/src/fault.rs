use core::fmt;

use bitflags::bitflags;
use tracing::{debug, error};

use crate::bus::{GuestIp, Machine, PhysicalMemory};
use crate::config::FaultDelivery;
use crate::entry::is_present;
use crate::error::{AccessError, PagingError};
use crate::relink::Privilege;
use crate::PagingUnit;

/// Interrupt vector of #PF.
pub const PAGE_FAULT_VECTOR: u8 = 14;

bitflags! {
    /// #PF error code.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct PageFaultCode: u32 {
        /// Protection violation (clear: the entry was not present).
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
    }
}

impl PageFaultCode {
    #[inline]
    pub fn new(present: bool, write: bool, user: bool) -> Self {
        let mut code = PageFaultCode::empty();
        code.set(PageFaultCode::PRESENT, present);
        code.set(PageFaultCode::WRITE, write);
        code.set(PageFaultCode::USER, user);
        code
    }
}

/// A guest-visible page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting linear address (CR2).
    pub linear: u32,
    pub code: PageFaultCode,
}

impl PageFault {
    #[inline]
    pub fn error_code(&self) -> u32 {
        self.code.bits()
    }
}

impl fmt::Display for PageFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "page fault at {:#010x} (error code {:#x})",
            self.linear,
            self.error_code()
        )
    }
}

/// Saved state of one in-flight page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultFrame {
    /// CS:EIP of the faulting instruction.
    pub guest_ip: GuestIp,
    pub linear: u32,
    /// Guest-physical address of the directory or table entry that caused the fault.
    pub entry_addr: u32,
    pub code: PageFaultCode,
    /// Privilege to restore once the fault is resolved.
    pub saved_privilege: Privilege,
}

impl FaultFrame {
    /// The guest handler is done once execution is back at the faulting instruction and the
    /// offending entry is present.
    pub fn is_resolved<P: PhysicalMemory + ?Sized>(&self, mem: &mut P, ip: GuestIp) -> bool {
        ip == self.guest_ip && is_present(mem.read_u32(self.entry_addr))
    }
}

/// Bounded stack of nested faults.
#[derive(Debug, Clone)]
pub(crate) struct FaultQueue {
    frames: Vec<FaultFrame>,
    bound: usize,
}

impl FaultQueue {
    pub(crate) fn new(bound: usize) -> Self {
        Self {
            frames: Vec::with_capacity(bound),
            bound,
        }
    }

    pub(crate) fn push(&mut self, frame: FaultFrame) -> Result<(), PagingError> {
        if self.frames.len() >= self.bound {
            return Err(PagingError::FaultQueueOverflow {
                depth: self.frames.len(),
                linear: frame.linear,
            });
        }
        self.frames.push(frame);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Option<FaultFrame> {
        self.frames.pop()
    }

    pub(crate) fn frames(&self) -> &[FaultFrame] {
        &self.frames
    }

    pub(crate) fn bound(&self) -> usize {
        self.bound
    }

    pub(crate) fn replace(&mut self, frames: Vec<FaultFrame>) {
        self.frames = frames;
    }
}

/// Whether a fault may be delivered to the guest from this call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FaultMode {
    /// Deliver according to [`FaultDelivery`].
    Deliver,
    /// Only record the fault; the caller synthesizes it.
    Prepare,
}

impl PagingUnit {
    /// Raise a page fault for `linear`.
    ///
    /// Returns `Ok(())` only when the fault was delivered recursively and the guest handler has
    /// returned, in which case the caller retries the walk.
    pub(crate) fn raise_page_fault<M: Machine + ?Sized>(
        &mut self,
        m: &mut M,
        linear: u32,
        entry_addr: u32,
        code: PageFaultCode,
        mode: FaultMode,
    ) -> Result<(), AccessError> {
        let fault = PageFault { linear, code };
        self.cr2 = linear;

        if mode == FaultMode::Prepare {
            self.pending = Some(fault);
            return Err(fault.into());
        }

        match self.config.fault_delivery {
            FaultDelivery::Unwind => {
                m.raise_exception(PAGE_FAULT_VECTOR, code.bits());
                Err(fault.into())
            }
            FaultDelivery::Recursive => Ok(self.deliver_nested(m, fault, entry_addr)?),
        }
    }

    fn deliver_nested<M: Machine + ?Sized>(
        &mut self,
        m: &mut M,
        fault: PageFault,
        entry_addr: u32,
    ) -> Result<(), PagingError> {
        let frame = FaultFrame {
            guest_ip: m.segment_ip(),
            linear: fault.linear,
            entry_addr,
            code: fault.code,
            saved_privilege: self.privilege,
        };
        if let Err(err) = self.faults.push(frame) {
            error!(%err, "nested page faults exceeded the fault queue");
            return Err(err);
        }

        let depth = self.faults.frames().len();
        debug!(
            linear = format_args!("{:#010x}", fault.linear),
            error_code = fault.error_code(),
            depth,
            "delivering page fault"
        );

        let handled = self
            .switch_privilege(&*m, Privilege::Supervisor)
            .and_then(|()| {
                m.raise_exception(PAGE_FAULT_VECTOR, fault.error_code());
                m.run_until_fault_resolved(self, &frame)
            });

        self.faults.pop();
        let restored = self.switch_privilege(&*m, frame.saved_privilege);

        debug!(
            linear = format_args!("{:#010x}", fault.linear),
            depth,
            ok = handled.is_ok(),
            "page fault handler returned"
        );
        handled?;
        restored
    }
}
