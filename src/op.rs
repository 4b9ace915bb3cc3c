//! Shared description of one initiator-side operation (spec §6 `Put, Get,
//! Atomic, FetchAtomic, Swap` and the `Triggered*` family).
//!
//! Both direct submission (`Ni::put`, `Ni::atomic`, ...) and triggered-op
//! firing (§4.7) build one of these and hand it to [`crate::initiator`]; the
//! params are otherwise identical, they differ only in when the initiator
//! state machine sees them.

use crate::atomic_ops::{AtomOp, AtomType};
use crate::handle::Handle;
use crate::identifiers::ProcessId;
use crate::wire::AckReq;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Put,
    Get,
    Atomic,
    FetchAtomic,
    Swap,
}

impl OpKind {
    /// Whether this op carries an outbound payload (Put/Atomic/FetchAtomic/Swap).
    pub fn has_data_out(self) -> bool {
        !matches!(self, OpKind::Get)
    }

    /// Whether the target sends data back (Get/FetchAtomic/Swap).
    pub fn has_data_in(self) -> bool {
        matches!(self, OpKind::Get | OpKind::FetchAtomic | OpKind::Swap)
    }
}

/// Fully-resolved parameters for one outbound operation (spec §3 XI fields).
#[derive(Debug, Clone)]
pub struct OperationParams {
    pub kind: OpKind,
    pub target: ProcessId,
    pub pt_index: u32,
    pub match_bits: u64,
    pub remote_offset: u64,
    pub length: u64,
    pub local_offset: u64,
    /// Source MD for Put/Atomic/FetchAtomic/Swap.
    pub put_md: Option<Handle>,
    /// Sink MD for Get/FetchAtomic/Swap (receives reply data).
    pub get_md: Option<Handle>,
    pub ack_req: AckReq,
    pub hdr_data: u64,
    pub atom_op: Option<AtomOp>,
    pub atom_type: Option<AtomType>,
    /// Comparison value for the CSWAP/MSWAP family; one element
    /// (`sizeof(atom_type)` bytes), required iff `atom_op.uses_operand()`.
    pub operand: Option<Vec<u8>>,
    /// Caller-opaque tag, returned unchanged on every event for this op.
    pub user_ptr: u64,
}
