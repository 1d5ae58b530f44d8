use std::collections::HashMap;

use crate::access::AccessClass;

/// Where a linked page sits in the lists.
#[derive(Debug, Clone, Copy)]
struct Position {
    all: usize,
    classified: Option<usize>,
}

/// Side indexes of linked TLB slots.
///
/// Each linked page is in `all` once, and in at most one classified list. User-read-write pages
/// have no classified list because privilege switches never change them. Lists are unordered;
/// removal swaps the last entry into the hole.
#[derive(Debug, Clone, Default)]
pub(crate) struct LinkTables {
    /// Kernel-read-only, kernel-read-write, user-read-only, indexed by class bits.
    classified: [Vec<u32>; 3],
    all: Vec<u32>,
    positions: HashMap<u32, Position>,
    capacity: usize,
}

#[inline]
fn list_index(class: AccessClass) -> Option<usize> {
    match class {
        AccessClass::UserReadWrite => None,
        class => Some(class.bits() as usize),
    }
}

/// Remove `list[index]` by swapping the tail in; returns the page that moved into `index`.
#[inline]
fn swap_out(list: &mut Vec<u32>, index: usize) -> Option<u32> {
    list.swap_remove(index);
    list.get(index).copied()
}

impl LinkTables {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.all.len() >= self.capacity
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn insert(&mut self, lin_page: u32, class: AccessClass) {
        let classified = list_index(class).map(|i| {
            self.classified[i].push(lin_page);
            self.classified[i].len() - 1
        });
        self.all.push(lin_page);
        self.positions.insert(
            lin_page,
            Position {
                all: self.all.len() - 1,
                classified,
            },
        );
    }

    pub(crate) fn remove(&mut self, lin_page: u32, class: AccessClass) {
        let Some(pos) = self.positions.remove(&lin_page) else {
            return;
        };
        if let Some(moved) = swap_out(&mut self.all, pos.all) {
            if let Some(p) = self.positions.get_mut(&moved) {
                p.all = pos.all;
            }
        }
        if let (Some(list), Some(index)) = (list_index(class), pos.classified) {
            if let Some(moved) = swap_out(&mut self.classified[list], index) {
                if let Some(p) = self.positions.get_mut(&moved) {
                    p.classified = Some(index);
                }
            }
        }
    }

    pub(crate) fn classified(&self, class: AccessClass) -> &[u32] {
        match list_index(class) {
            Some(i) => &self.classified[i],
            None => &[],
        }
    }

    pub(crate) fn all(&self) -> &[u32] {
        &self.all
    }

    /// Empty every list, returning the pages that were linked.
    pub(crate) fn drain(&mut self) -> Vec<u32> {
        for list in &mut self.classified {
            list.clear();
        }
        self.positions.clear();
        std::mem::take(&mut self.all)
    }

    /// Replace the lists wholesale. `classified` is in kernel-RO, kernel-RW, user-RO order.
    pub(crate) fn restore(&mut self, classified: [Vec<u32>; 3], all: Vec<u32>) {
        let mut positions: HashMap<u32, Position> = all
            .iter()
            .enumerate()
            .map(|(index, &lin_page)| {
                (
                    lin_page,
                    Position {
                        all: index,
                        classified: None,
                    },
                )
            })
            .collect();
        for list in &classified {
            for (index, lin_page) in list.iter().enumerate() {
                if let Some(p) = positions.get_mut(lin_page) {
                    p.classified = Some(index);
                }
            }
        }
        self.classified = classified;
        self.all = all;
        self.positions = positions;
    }
}
