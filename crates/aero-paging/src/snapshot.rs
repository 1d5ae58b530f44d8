//! Save-state encoding.
//!
//! Layout (little endian):
//!
//! ```text
//! magic "AEROPAGE", version u16
//! flags u8 (enabled, wp, pse, user), dir_base u32, cr2 u32
//! pending u8 [linear u32, code u32]
//! identity map: len u32, phys pages u32*
//! tlb: len u32, (lin page u32, packed word u32)*   linked slots only, ascending
//! link tables: kernel-ro, kernel-rw, user-ro, all: len u32, lin pages u32*
//! fault queue: len u32, (cs u16, eip u32, linear u32, entry u32, code u32, privilege u8)*
//! ```
//!
//! Handlers are not saved: restored slots keep their translation but start out unresolved.

use std::io::{Read, Write};

use crate::access::AccessClass;
use crate::bus::GuestIp;
use crate::error::SnapshotError;
use crate::fault::{FaultFrame, PageFault, PageFaultCode};
use crate::io::{ReadLeExt, WriteLeExt};
use crate::relink::Privilege;
use crate::tlb::{PhysWord, TLB_SLOTS};
use crate::{PagingUnit, IDENTITY_PAGES};

const MAGIC: [u8; 8] = *b"AEROPAGE";
const VERSION: u16 = 1;

const FLAG_ENABLED: u8 = 1 << 0;
const FLAG_WP: u8 = 1 << 1;
const FLAG_PSE: u8 = 1 << 2;
const FLAG_USER: u8 = 1 << 3;

const CLASSIFIED: [AccessClass; 3] = [
    AccessClass::KernelReadOnly,
    AccessClass::KernelReadWrite,
    AccessClass::UserReadOnly,
];

const PAGE_LIMIT: u32 = TLB_SLOTS as u32;

impl PagingUnit {
    pub fn save_state<W: Write + ?Sized>(&self, w: &mut W) -> Result<(), SnapshotError> {
        w.write_all(&MAGIC)?;
        w.write_u16_le(VERSION)?;

        let mut flags = 0u8;
        for (set, flag) in [
            (self.enabled, FLAG_ENABLED),
            (self.wp, FLAG_WP),
            (self.pse, FLAG_PSE),
            (self.privilege.is_user(), FLAG_USER),
        ] {
            if set {
                flags |= flag;
            }
        }
        w.write_u8(flags)?;
        w.write_u32_le(self.dir_base)?;
        w.write_u32_le(self.cr2)?;

        match self.pending {
            Some(pf) => {
                w.write_u8(1)?;
                w.write_u32_le(pf.linear)?;
                w.write_u32_le(pf.error_code())?;
            }
            None => w.write_u8(0)?,
        }

        w.write_pages(&self.identity)?;

        let linked: Vec<(u32, PhysWord)> = self.tlb.linked_words().collect();
        w.write_len_u32(linked.len())?;
        for (lin_page, word) in linked {
            w.write_u32_le(lin_page)?;
            w.write_u32_le(word.raw())?;
        }

        for class in CLASSIFIED {
            w.write_pages(self.links.classified(class))?;
        }
        w.write_pages(self.links.all())?;

        let frames = self.faults.frames();
        w.write_len_u32(frames.len())?;
        for frame in frames {
            w.write_u16_le(frame.guest_ip.cs)?;
            w.write_u32_le(frame.guest_ip.eip)?;
            w.write_u32_le(frame.linear)?;
            w.write_u32_le(frame.entry_addr)?;
            w.write_u32_le(frame.code.bits())?;
            w.write_u8(u8::from(frame.saved_privilege.is_user()))?;
        }
        Ok(())
    }

    pub fn save_state_to_vec(&self) -> Result<Vec<u8>, SnapshotError> {
        let mut buf = Vec::new();
        self.save_state(&mut buf)?;
        Ok(buf)
    }

    /// Restore state written by [`PagingUnit::save_state`].
    ///
    /// The snapshot is validated completely before anything is applied; on error the unit is
    /// left untouched.
    pub fn load_state<R: Read + ?Sized>(&mut self, r: &mut R) -> Result<(), SnapshotError> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }
        let version = r.read_u16_le()?;
        if version != VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }

        let flags = r.read_u8()?;
        if flags & !(FLAG_ENABLED | FLAG_WP | FLAG_PSE | FLAG_USER) != 0 {
            return Err(SnapshotError::Corrupt("unknown paging flags"));
        }
        let dir_base = r.read_u32_le()?;
        if dir_base & crate::PAGE_MASK != 0 {
            return Err(SnapshotError::Corrupt("unaligned page directory base"));
        }
        let cr2 = r.read_u32_le()?;

        let pending = match r.read_u8()? {
            0 => None,
            1 => {
                let linear = r.read_u32_le()?;
                let code = read_code(r)?;
                Some(PageFault { linear, code })
            }
            _ => return Err(SnapshotError::Corrupt("invalid pending fault tag")),
        };

        let identity = r.read_pages(IDENTITY_PAGES, PAGE_LIMIT, "invalid identity map")?;
        if identity.len() != IDENTITY_PAGES {
            return Err(SnapshotError::Corrupt("identity map size mismatch"));
        }

        let capacity = self.links.capacity();
        let count = r.read_len_u32(capacity, "too many linked TLB slots")?;
        let mut words = Vec::with_capacity(count);
        for _ in 0..count {
            let lin_page = r.read_u32_le()?;
            let raw = r.read_u32_le()?;
            if lin_page >= PAGE_LIMIT {
                return Err(SnapshotError::Corrupt("TLB slot out of range"));
            }
            if words.last().is_some_and(|&(prev, _)| prev >= lin_page) {
                return Err(SnapshotError::Corrupt("TLB slots not in ascending order"));
            }
            let word = PhysWord::from_raw(raw);
            if PhysWord::reserved_bits(raw) != 0 || !word.linked() {
                return Err(SnapshotError::Corrupt("invalid TLB word"));
            }
            words.push((lin_page, word));
        }

        let mut classified: [Vec<u32>; 3] = Default::default();
        for (list, class) in classified.iter_mut().zip(CLASSIFIED) {
            let pages = r.read_pages(capacity, PAGE_LIMIT, "invalid link table")?;
            let mut sorted = pages.clone();
            sorted.sort_unstable();
            let expected = words
                .iter()
                .filter(|(_, word)| word.class() == class)
                .map(|&(lin_page, _)| lin_page);
            if !sorted.into_iter().eq(expected) {
                return Err(SnapshotError::Corrupt("link table does not match TLB"));
            }
            *list = pages;
        }

        let all = r.read_pages(capacity, PAGE_LIMIT, "invalid link table")?;
        let mut sorted = all.clone();
        sorted.sort_unstable();
        if !sorted.into_iter().eq(words.iter().map(|&(lin_page, _)| lin_page)) {
            return Err(SnapshotError::Corrupt("link table does not match TLB"));
        }

        let depth = r.read_len_u32(self.faults.bound(), "fault queue overflow")?;
        let mut frames = Vec::with_capacity(depth);
        for _ in 0..depth {
            let cs = r.read_u16_le()?;
            let eip = r.read_u32_le()?;
            let linear = r.read_u32_le()?;
            let entry_addr = r.read_u32_le()?;
            let code = read_code(r)?;
            let saved_privilege = match r.read_u8()? {
                0 => Privilege::Supervisor,
                1 => Privilege::User,
                _ => return Err(SnapshotError::Corrupt("invalid privilege")),
            };
            frames.push(FaultFrame {
                guest_ip: GuestIp { cs, eip },
                linear,
                entry_addr,
                code,
                saved_privilege,
            });
        }

        self.clear_tlb();
        for &(lin_page, word) in &words {
            self.tlb.restore(lin_page, word);
        }
        self.links.restore(classified, all);
        self.faults.replace(frames);
        self.identity = identity;
        self.enabled = flags & FLAG_ENABLED != 0;
        self.wp = flags & FLAG_WP != 0;
        self.pse = flags & FLAG_PSE != 0;
        self.privilege = if flags & FLAG_USER != 0 {
            Privilege::User
        } else {
            Privilege::Supervisor
        };
        self.dir_base = dir_base;
        self.cr2 = cr2;
        self.pending = pending;
        Ok(())
    }
}

fn read_code<R: Read + ?Sized>(r: &mut R) -> Result<PageFaultCode, SnapshotError> {
    PageFaultCode::from_bits(r.read_u32_le()?)
        .ok_or(SnapshotError::Corrupt("invalid page fault error code"))
}
