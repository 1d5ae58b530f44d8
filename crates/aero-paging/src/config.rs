/// How a page fault raised by an unchecked access reaches the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultDelivery {
    /// Push a [`FaultFrame`](crate::FaultFrame), raise #PF and re-enter the execution loop until
    /// the guest handler has fixed the fault, then retry the access.
    #[default]
    Recursive,
    /// Record CR2, raise #PF and return [`AccessError::PageFault`](crate::AccessError) so the
    /// caller can abandon the faulting instruction.
    Unwind,
}

/// Construction-time configuration for a [`PagingUnit`](crate::PagingUnit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagingConfig {
    /// Fault delivery model used by unchecked accesses.
    pub fault_delivery: FaultDelivery,
    /// Maximum number of nested page faults in flight.
    ///
    /// Exceeding it is fatal ([`PagingError::FaultQueueOverflow`](crate::PagingError)).
    pub fault_queue_depth: usize,
    /// Number of linear pages that may be linked before the whole TLB is flushed.
    ///
    /// The default covers 128MiB worth of 4KiB pages.
    pub link_capacity: usize,
    /// Tolerate guests that change page attributes without flushing the TLB.
    ///
    /// When a trapped access finds that the guest entries now describe a different access class
    /// than the cached one, the TLB is flushed and the access retried instead of faulting.
    pub stale_attribute_workaround: bool,
    /// Initial CR4.PSE state. 4MiB directory entries are only honoured while this is set.
    pub pse: bool,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            fault_delivery: FaultDelivery::Recursive,
            fault_queue_depth: 16,
            link_capacity: 128 * 1024 / 4,
            stale_attribute_workaround: true,
            pse: true,
        }
    }
}
