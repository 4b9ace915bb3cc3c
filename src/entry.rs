//! Target-side list entries (spec §3 "List Entry (LE) / Matching List Entry
//! (ME)", §9 re-architecture guidance).
//!
//! The reference distinguishes LE and ME through shared macro-generated
//! fields; here that's a tagged variant over one `EntryCommon` so
//! match-irrelevant code (permission checks, auto-unlink, data movement)
//! operates on `Entry` without caring which flavor it holds.

use crate::handle::Handle;
use crate::identifiers::ProcessId;
use crate::iovec::{IoSlice, IoSliceMut};

pub mod options {
    pub const OP_PUT: u32 = 1 << 0;
    pub const OP_GET: u32 = 1 << 1;
    pub const OP_ATOMIC: u32 = 1 << 2;
    pub const USE_ONCE: u32 = 1 << 3;
    pub const MANAGE_LOCAL: u32 = 1 << 4;
    pub const NO_TRUNCATE: u32 = 1 << 5;
    pub const AUTH_USE_JID: u32 = 1 << 6;
    pub const IS_ACCESSIBLE: u32 = 1 << 7;
    pub const EVENT_CT_BYTES: u32 = 1 << 8;
    pub const EVENT_SUCCESS_DISABLE: u32 = 1 << 9;
    pub const EVENT_CT_COMM: u32 = 1 << 10;
    pub const EVENT_CT_OVERFLOW: u32 = 1 << 11;
    pub const UNEXPECTED_HDR_DISABLE: u32 = 1 << 12;
    pub const OVER_DISABLE: u32 = 1 << 13;
}

/// Fields shared by LE and ME (spec §3).
pub struct EntryCommon {
    pub region: Vec<u8>,
    pub ct: Option<Handle>,
    pub options: u32,
    pub ac_id: u32,
    /// Bytes already consumed by prior matches, when `MANAGE_LOCAL`.
    pub local_offset: u64,
    /// Remaining references (an AUTO_UNLINK is deferred while a request is
    /// still bound to this entry, spec §4.4 "Auto-unlink happens after the
    /// current operation is bound to the entry").
    pub(crate) in_flight: u32,
    pub(crate) unlinked: bool,
}

impl EntryCommon {
    fn new(region: Vec<u8>, ct: Option<Handle>, options: u32, ac_id: u32) -> Self {
        EntryCommon {
            region,
            ct,
            options,
            ac_id,
            local_offset: 0,
            in_flight: 0,
            unlinked: false,
        }
    }

    pub fn has(&self, flag: u32) -> bool {
        self.options & flag != 0
    }

    pub fn len(&self) -> u64 {
        self.region.len() as u64
    }

    pub fn as_slices(&self) -> Vec<IoSlice<'_>> {
        vec![IoSlice { base: &self.region }]
    }

    pub fn as_slices_mut(&mut self) -> Vec<IoSliceMut<'_>> {
        vec![IoSliceMut { base: &mut self.region }]
    }
}

/// A non-matching list entry.
pub struct Le {
    pub common: EntryCommon,
}

/// A matching list entry: adds tag matching over an LE (spec §3).
pub struct Me {
    pub common: EntryCommon,
    pub match_bits: u64,
    pub ignore_bits: u64,
    pub min_free: u64,
    /// Sender filter; `NID_ANY`/`PID_ANY` wildcards honored (spec §4.4).
    pub id: ProcessId,
}

impl Me {
    /// `(incoming ^ me.match_bits) & ~me.ignore_bits == 0` (spec §4.4).
    pub fn matches_bits(&self, incoming: u64) -> bool {
        (incoming ^ self.match_bits) & !self.ignore_bits == 0
    }
}

pub enum Entry {
    Matching(Me),
    NonMatching(Le),
}

impl Entry {
    pub fn common(&self) -> &EntryCommon {
        match self {
            Entry::Matching(me) => &me.common,
            Entry::NonMatching(le) => &le.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut EntryCommon {
        match self {
            Entry::Matching(me) => &mut me.common,
            Entry::NonMatching(le) => &mut le.common,
        }
    }

    /// Bit-match against an incoming request; non-matching entries always
    /// match (an LE has no tag to check).
    pub fn matches_bits(&self, incoming_match_bits: u64) -> bool {
        match self {
            Entry::Matching(me) => me.matches_bits(incoming_match_bits),
            Entry::NonMatching(_) => true,
        }
    }

    /// Sender-id filter; only MEs carry one.
    pub fn matches_id(&self, initiator: ProcessId) -> bool {
        match self {
            Entry::Matching(me) => initiator.matches(me.id),
            Entry::NonMatching(_) => true,
        }
    }

    pub fn new_le(region: Vec<u8>, ct: Option<Handle>, options: u32, ac_id: u32) -> Self {
        Entry::NonMatching(Le { common: EntryCommon::new(region, ct, options, ac_id) })
    }

    pub fn new_me(
        region: Vec<u8>,
        ct: Option<Handle>,
        options: u32,
        ac_id: u32,
        match_bits: u64,
        ignore_bits: u64,
        min_free: u64,
        id: ProcessId,
    ) -> Self {
        Entry::Matching(Me {
            common: EntryCommon::new(region, ct, options, ac_id),
            match_bits,
            ignore_bits,
            min_free,
            id,
        })
    }
}
