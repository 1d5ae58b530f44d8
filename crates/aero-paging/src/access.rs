//! Permission resolution tables.
//!
//! These reproduce the 386/486 behaviour bit for bit. Guest software probes them to tell CPU
//! generations apart, so they are data, not logic.

use crate::entry::{PTE_RW, PTE_US};

/// Effective access class of a linear page, combined from its directory and table entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AccessClass {
    KernelReadOnly = 0,
    KernelReadWrite = 1,
    UserReadOnly = 2,
    UserReadWrite = 3,
}

impl AccessClass {
    pub const ALL: [AccessClass; 4] = [
        AccessClass::KernelReadOnly,
        AccessClass::KernelReadWrite,
        AccessClass::UserReadOnly,
        AccessClass::UserReadWrite,
    ];

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            0 => AccessClass::KernelReadOnly,
            1 => AccessClass::KernelReadWrite,
            2 => AccessClass::UserReadOnly,
            _ => AccessClass::UserReadWrite,
        }
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self as u32
    }
}

/// How a TLB slot of a given class is wired up for the current mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    /// Direct reads and writes (writes still go through dirty tracking while the page is clean).
    ReadWrite,
    /// Direct reads, trapped writes.
    ReadOnly,
    /// Both directions trapped.
    Trapped,
}

use AccessClass::{
    KernelReadOnly as KR, KernelReadWrite as KRW, UserReadOnly as UR, UserReadWrite as URW,
};
use Mapping::{ReadOnly as RE, ReadWrite as RW, Trapped as EE};

/// Indexed by `PDE.US:PDE.RW:PTE.US:PTE.RW`.
const ACCESS_CLASS: [AccessClass; 16] = [
    KR, KR, KR, KR, //
    KR, KRW, KR, KRW, //
    KR, KR, UR, UR, //
    KR, KRW, UR, URW, //
];

/// Indexed by `WP:user:class`.
const MAPPING: [Mapping; 16] = [
    // WP=0, supervisor
    RW, RW, RW, RW, //
    // WP=0, user
    EE, EE, RE, RW, //
    // WP=1, supervisor
    RE, RW, RE, RW, //
    // WP=1, user
    EE, EE, RE, RW, //
];

/// Indexed by `WP:write:user:class`.
const FAULT: [bool; 32] = [
    // WP=0
    false, false, false, false, // supervisor read
    true, true, false, false, // user read
    false, false, false, false, // supervisor write
    true, true, true, false, // user write
    // WP=1
    false, false, false, false, // supervisor read
    true, true, false, false, // user read
    true, false, true, false, // supervisor write
    true, true, true, false, // user write
];

/// Combine a directory entry and a table entry into an access class.
///
/// For 4MiB pages pass the directory entry twice.
#[inline]
pub fn access_class(pde: u32, pte: u32) -> AccessClass {
    let mask = PTE_RW | PTE_US;
    let index = ((pde & mask) << 1) | ((pte & mask) >> 1);
    ACCESS_CLASS[index as usize]
}

#[inline]
pub fn mapping(class: AccessClass, wp: bool, user: bool) -> Mapping {
    let index = class.bits() | (u32::from(user) << 2) | (u32::from(wp) << 3);
    MAPPING[index as usize]
}

/// Would an access of this kind fault on a page of `class`?
#[inline]
pub fn predicts_fault(class: AccessClass, write: bool, user: bool, wp: bool) -> bool {
    let index =
        class.bits() | (u32::from(user) << 2) | (u32::from(write) << 3) | (u32::from(wp) << 4);
    FAULT[index as usize]
}

/// Does switching privilege change the mapping of `class` under the given WP setting?
#[inline]
pub(crate) fn privilege_sensitive(class: AccessClass, wp: bool) -> bool {
    mapping(class, wp, false) != mapping(class, wp, true)
}
