use tracing::trace;

use crate::access::{mapping, privilege_sensitive, AccessClass};
use crate::bus::PhysicalMemory;
use crate::error::PagingError;
use crate::PagingUnit;

/// Privilege level as far as paging is concerned: CPL 3 is user, everything else supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Privilege {
    #[default]
    Supervisor,
    User,
}

impl Privilege {
    #[inline]
    pub fn from_cpl(cpl: u8) -> Self {
        if cpl == 3 {
            Privilege::User
        } else {
            Privilege::Supervisor
        }
    }

    #[inline]
    pub fn is_user(self) -> bool {
        self == Privilege::User
    }
}

impl PagingUnit {
    /// Switch between supervisor and user mode.
    ///
    /// Only slots whose mapping depends on the privilege level are rewritten, found through the
    /// link tables: kernel pages always, user-read-only pages only while WP is clear.
    pub fn switch_privilege<P: PhysicalMemory + ?Sized>(
        &mut self,
        mem: &P,
        to: Privilege,
    ) -> Result<(), PagingError> {
        if self.privilege == to {
            return Ok(());
        }
        self.privilege = to;

        let arena_len = mem.arena().len();
        let mut relinked = 0usize;
        for class in AccessClass::ALL {
            if !privilege_sensitive(class, self.wp) {
                continue;
            }
            let mapping = mapping(class, self.wp, to.is_user());
            for &lin_page in self.links.classified(class) {
                let word = self.tlb.slot(lin_page).word();
                let phys_page = word.phys_page();
                self.tlb.fill(
                    lin_page,
                    phys_page,
                    class,
                    word.dirty(),
                    mapping,
                    mem.page_handler(phys_page),
                    arena_len,
                )?;
                relinked += 1;
            }
        }

        trace!(?to, relinked, "privilege switch");
        Ok(())
    }
}
