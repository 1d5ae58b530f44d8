use thiserror::Error;

use crate::fault::PageFault;

/// Fatal paging invariant violations.
///
/// None of these are guest-visible. They mean either the guest is pathologically broken or the
/// emulator is, and the session must stop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PagingError {
    #[error(
        "page fault queue overflow: {depth} nested faults outstanding, fault at linear {linear:#010x}"
    )]
    FaultQueueOverflow { depth: usize, linear: u32 },

    #[error(
        "guest fault handler returned without mapping linear {linear:#010x} (entry at physical {entry_addr:#010x} still not present)"
    )]
    FaultNotCorrected { linear: u32, entry_addr: u32 },

    #[error("illegal page link: linear page {lin_page:#x} -> physical page {phys_page:#x}")]
    IllegalPage { lin_page: u32, phys_page: u32 },

    #[error("host page for physical page {phys_page:#x} lies outside the memory arena")]
    HostPageOutOfRange { phys_page: u32 },

    #[error("dirty-tracking handler read at linear {linear:#010x}")]
    DirtyTrackerRead { linear: u32 },

    #[error("execution loop stopped while a page fault at linear {linear:#010x} was outstanding")]
    MachineStopped { linear: u32 },
}

/// Result of a guest memory access through the paging unit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    /// A guest page fault that was not delivered in-line.
    ///
    /// Returned by checked accesses, and by every access when faults are delivered by
    /// unwinding. The exception has already been requested from the [`ExceptionSink`] in the
    /// latter case.
    ///
    /// [`ExceptionSink`]: crate::ExceptionSink
    #[error("{0}")]
    PageFault(PageFault),

    #[error(transparent)]
    Fatal(#[from] PagingError),
}

impl AccessError {
    pub fn page_fault(&self) -> Option<PageFault> {
        match self {
            AccessError::PageFault(pf) => Some(*pf),
            AccessError::Fatal(_) => None,
        }
    }
}

impl From<PageFault> for AccessError {
    fn from(pf: PageFault) -> Self {
        AccessError::PageFault(pf)
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid paging snapshot magic")]
    InvalidMagic,

    #[error("unsupported paging snapshot version {0}")]
    UnsupportedVersion(u16),

    #[error("corrupt paging snapshot: {0}")]
    Corrupt(&'static str),
}
