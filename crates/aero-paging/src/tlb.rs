use crate::access::{AccessClass, Mapping};
use crate::bus::PhysPageHandler;
use crate::error::PagingError;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u32 = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u32 = PAGE_SIZE - 1;

/// One slot per 4KiB linear page of the 32-bit address space.
pub const TLB_SLOTS: usize = 1 << 20;

/// What happens when a slot without a direct pointer is accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Handler {
    /// Not resolved yet; the next access walks the guest page tables.
    #[default]
    Unresolved,
    /// Clean read-write page; the first write sets the guest dirty bit.
    DirtyTracking,
    /// Access denied by the cached permissions; faults unless the guest tables disagree.
    AccessTrap,
    /// Write side of a user-read-only page.
    UserReadOnly,
    /// Forward to the physical page (direct arena access or the bus).
    Physical,
}

/// Host arena offset minus linear address, fixed for the lifetime of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostBias(u32);

impl HostBias {
    #[inline]
    fn new(host_base: u32, lin_page: u32) -> Self {
        Self(host_base.wrapping_sub(lin_page << PAGE_SHIFT))
    }

    /// Arena index of `linear`. Only meaningful for addresses inside the slot's page.
    #[inline]
    pub fn index(self, linear: u32) -> usize {
        self.0.wrapping_add(linear) as usize
    }
}

/// Packed physical page number, access class and state bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct PhysWord(u32);

impl PhysWord {
    const PHYS_MASK: u32 = 0x000f_ffff;
    const DIRTY: u32 = 1 << 28;
    const LINKED: u32 = 1 << 29;
    const CLASS_SHIFT: u32 = 30;

    #[inline]
    pub(crate) fn new(phys_page: u32, class: AccessClass, dirty: bool) -> Self {
        let mut raw =
            (phys_page & Self::PHYS_MASK) | Self::LINKED | (class.bits() << Self::CLASS_SHIFT);
        if dirty {
            raw |= Self::DIRTY;
        }
        Self(raw)
    }

    #[inline]
    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub(crate) fn raw(self) -> u32 {
        self.0
    }

    /// Raw bits outside the defined fields.
    #[inline]
    pub(crate) fn reserved_bits(raw: u32) -> u32 {
        raw & !(Self::PHYS_MASK | Self::DIRTY | Self::LINKED | (3 << Self::CLASS_SHIFT))
    }

    #[inline]
    pub(crate) fn phys_page(self) -> u32 {
        self.0 & Self::PHYS_MASK
    }

    #[inline]
    pub(crate) fn class(self) -> AccessClass {
        AccessClass::from_bits(self.0 >> Self::CLASS_SHIFT)
    }

    #[inline]
    pub(crate) fn dirty(self) -> bool {
        self.0 & Self::DIRTY != 0
    }

    #[inline]
    pub(crate) fn linked(self) -> bool {
        self.0 & Self::LINKED != 0
    }
}

/// A cached translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TlbSlot {
    read: Option<HostBias>,
    write: Option<HostBias>,
    read_handler: Handler,
    write_handler: Handler,
    word: PhysWord,
}

impl TlbSlot {
    /// Direct read bias. `Some` only while reads may bypass the handler.
    #[inline]
    pub fn read_bias(&self) -> Option<HostBias> {
        self.read
    }

    /// Direct write bias. `Some` only while writes may bypass the handler, which requires the
    /// page to be dirty.
    #[inline]
    pub fn write_bias(&self) -> Option<HostBias> {
        self.write
    }

    #[inline]
    pub fn read_handler(&self) -> Handler {
        self.read_handler
    }

    #[inline]
    pub fn write_handler(&self) -> Handler {
        self.write_handler
    }

    pub fn phys_page(&self) -> Option<u32> {
        self.word.linked().then(|| self.word.phys_page())
    }

    pub fn class(&self) -> Option<AccessClass> {
        self.word.linked().then(|| self.word.class())
    }

    pub fn dirty(&self) -> bool {
        self.word.dirty()
    }

    #[inline]
    pub(crate) fn word(&self) -> PhysWord {
        self.word
    }

    /// Physical address of `linear`, taken from the cached page number.
    #[inline]
    pub(crate) fn phys_addr(&self, linear: u32) -> u32 {
        (self.word.phys_page() << PAGE_SHIFT) | (linear & PAGE_MASK)
    }
}

pub(crate) struct Tlb {
    slots: Box<[TlbSlot]>,
}

impl Tlb {
    pub(crate) fn new() -> Self {
        Self {
            slots: vec![TlbSlot::default(); TLB_SLOTS].into_boxed_slice(),
        }
    }

    #[inline]
    pub(crate) fn slot(&self, lin_page: u32) -> &TlbSlot {
        &self.slots[lin_page as usize]
    }

    /// Wire up `lin_page` for `mapping`, recording the translation in the packed word.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn fill(
        &mut self,
        lin_page: u32,
        phys_page: u32,
        class: AccessClass,
        dirty: bool,
        mapping: Mapping,
        handler: PhysPageHandler,
        arena_len: usize,
    ) -> Result<(), PagingError> {
        let in_arena = |base: u32| base as usize + PAGE_SIZE as usize <= arena_len;
        let host_read = handler.host_read();
        let host_write = handler.host_write();
        if !host_read.into_iter().chain(host_write).all(in_arena) {
            return Err(PagingError::HostPageOutOfRange { phys_page });
        }
        let direct_read = host_read.map(|base| HostBias::new(base, lin_page));
        let direct_write = host_write.map(|base| HostBias::new(base, lin_page));

        let trap_write = if class == AccessClass::UserReadOnly {
            Handler::UserReadOnly
        } else {
            Handler::AccessTrap
        };

        let slot = &mut self.slots[lin_page as usize];
        slot.word = PhysWord::new(phys_page, class, dirty);
        match mapping {
            Mapping::ReadWrite => {
                slot.read = direct_read;
                slot.read_handler = Handler::Physical;
                if dirty {
                    slot.write = direct_write;
                    slot.write_handler = Handler::Physical;
                } else {
                    slot.write = None;
                    slot.write_handler = if class == AccessClass::UserReadOnly {
                        Handler::UserReadOnly
                    } else {
                        Handler::DirtyTracking
                    };
                }
            }
            Mapping::ReadOnly => {
                slot.read = direct_read;
                slot.read_handler = Handler::Physical;
                slot.write = None;
                slot.write_handler = trap_write;
            }
            Mapping::Trapped => {
                slot.read = None;
                slot.write = None;
                slot.read_handler = Handler::AccessTrap;
                slot.write_handler = Handler::AccessTrap;
            }
        }
        Ok(())
    }

    /// Back to the unresolved state.
    #[inline]
    pub(crate) fn reset(&mut self, lin_page: u32) {
        self.slots[lin_page as usize] = TlbSlot::default();
    }

    /// Restore a saved packed word with unresolved handlers.
    pub(crate) fn restore(&mut self, lin_page: u32, word: PhysWord) {
        self.slots[lin_page as usize] = TlbSlot {
            word,
            ..TlbSlot::default()
        };
    }

    pub(crate) fn linked_words(&self) -> impl Iterator<Item = (u32, PhysWord)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.word.linked())
            .map(|(lin_page, slot)| (lin_page as u32, slot.word))
    }
}
