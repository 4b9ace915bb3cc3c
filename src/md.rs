//! Memory descriptor (spec §3 "Memory Descriptor (MD)").

use crate::handle::Handle;
use crate::iovec::{IoSlice, IoSliceMut};

pub mod options {
    pub const EVENT_CT_BYTES: u32 = 1 << 0;
    pub const EVENT_SEND_DISABLE: u32 = 1 << 1;
    pub const EVENT_SUCCESS_DISABLE: u32 = 1 << 2;
    pub const EVENT_CT_ACK: u32 = 1 << 3;
    pub const EVENT_CT_REPLY: u32 = 1 << 4;
    pub const IOVEC: u32 = 1 << 5;
    pub const UNORDERED: u32 = 1 << 6;
    pub const VOLATILE: u32 = 1 << 7;
}

/// Either a single contiguous region or a scatter/gather iovec — mirrors
/// the reference's `(start, length)` vs `(iov, niov)` union, disambiguated
/// by `options::IOVEC` rather than a raw flag check on a void pointer.
pub enum MdRegion {
    Contiguous(Vec<u8>),
    Iovec(Vec<Vec<u8>>),
}

impl MdRegion {
    pub fn len(&self) -> u64 {
        match self {
            MdRegion::Contiguous(v) => v.len() as u64,
            MdRegion::Iovec(slots) => slots.iter().map(|s| s.len() as u64).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slices(&self) -> Vec<IoSlice<'_>> {
        match self {
            MdRegion::Contiguous(v) => vec![IoSlice { base: v }],
            MdRegion::Iovec(slots) => slots.iter().map(|s| IoSlice { base: s }).collect(),
        }
    }

    pub fn as_slices_mut(&mut self) -> Vec<IoSliceMut<'_>> {
        match self {
            MdRegion::Contiguous(v) => vec![IoSliceMut { base: v }],
            MdRegion::Iovec(slots) => slots.iter_mut().map(|s| IoSliceMut { base: s }).collect(),
        }
    }
}

/// Initiator-side data region bound to an NI (spec §3).
pub struct Md {
    pub region: MdRegion,
    pub eq: Option<Handle>,
    pub ct: Option<Handle>,
    pub options: u32,
    /// Number of in-flight XIs referencing this MD (spec §3 invariant: "An
    /// MD may not be released while any XI references it").
    pub(crate) in_flight: u32,
}

impl Md {
    pub fn new(region: MdRegion, eq: Option<Handle>, ct: Option<Handle>, options: u32) -> Self {
        Md { region, eq, ct, options, in_flight: 0 }
    }

    pub fn has(&self, flag: u32) -> bool {
        self.options & flag != 0
    }

    pub fn len(&self) -> u64 {
        self.region.len()
    }
}
