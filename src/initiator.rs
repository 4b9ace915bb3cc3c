//! Initiator state machine (spec §4.6, C6): drives one outbound operation
//! from submission to completion/event delivery.

use tracing::{debug, trace, warn};

use crate::atomic_ops::Usage;
use crate::ct::CtEvent;
use crate::eq::{Event, EventKind};
use crate::error::{PtlError, PtlResult};
use crate::handle::Handle;
use crate::md::{options as md_opts, Md};
use crate::op::{OpKind, OperationParams};
use crate::wire::{hdr_flags, AckReq, Header, WireOp};

/// Keep the state enum shape of spec §4.6 so traces remain comparable
/// across this implementation and the reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorState {
    Start,
    PrepReq,
    WaitConn,
    SendReq,
    WaitComp,
    SendError,
    EarlySendEvent,
    WaitRecv,
    DataIn,
    LateSendEvent,
    AckEvent,
    ReplyEvent,
    Cleanup,
    Error,
    Done,
}

/// In-flight outbound operation (spec §3 "XI").
pub struct Xi {
    pub params: OperationParams,
    pub state: InitiatorState,
    pub ni_fail: Option<PtlError>,
}

impl Xi {
    pub fn new(params: OperationParams) -> Self {
        Xi { params, state: InitiatorState::Start, ni_fail: None }
    }
}

/// Submission-time validation (spec §3 invariants + §4.6 atomic matrix).
/// Returns `Err` synchronously; no event is generated for a rejected
/// submission (spec §7 "Submission errors").
pub fn validate_submission(
    params: &OperationParams,
    max_msg_size: u64,
    max_atomic_size: u64,
    put_md: Option<&Md>,
    get_md: Option<&Md>,
) -> PtlResult<()> {
    let size_limit = match params.kind {
        OpKind::Put | OpKind::Get => max_msg_size,
        OpKind::Atomic | OpKind::FetchAtomic | OpKind::Swap => max_atomic_size,
    };
    if params.length > size_limit {
        return Err(PtlError::ArgInvalid);
    }

    if params.ack_req == AckReq::Ack && put_md.map(|m| m.eq.is_none()).unwrap_or(true) {
        return Err(PtlError::ArgInvalid);
    }
    if params.ack_req == AckReq::CtAck && put_md.map(|m| m.ct.is_none()).unwrap_or(true) {
        return Err(PtlError::ArgInvalid);
    }

    if let (Some(op), Some(ty)) = (params.atom_op, params.atom_type) {
        let usage = if op.is_swap_family() { Usage::Swap } else { Usage::Atomic };
        op.validate(ty, usage)?;
        crate::atomic_ops::check_swap_length(op, ty, params.length)?;
    }

    match params.kind {
        OpKind::Put | OpKind::Atomic | OpKind::FetchAtomic | OpKind::Swap => {
            if put_md.is_none() {
                return Err(PtlError::ArgInvalid);
            }
        }
        OpKind::Get => {}
    }
    if matches!(params.kind, OpKind::Get | OpKind::FetchAtomic | OpKind::Swap) && get_md.is_none() {
        return Err(PtlError::ArgInvalid);
    }

    Ok(())
}

/// Build the outbound request header (`PREP_REQ`/`SEND_REQ`, spec §4.6).
pub fn build_request_header(xi: &Xi, src_nid: u32, src_pid: u32, hdr_handle: u32) -> Header {
    let operation = match xi.params.kind {
        OpKind::Put => WireOp::Put,
        OpKind::Get => WireOp::Get,
        OpKind::Atomic => WireOp::Atomic,
        OpKind::FetchAtomic => WireOp::FetchAtomic,
        OpKind::Swap => WireOp::Swap,
    };

    let mut flags = 0u8;
    if xi.params.kind.has_data_out() {
        flags |= hdr_flags::DATA_IN; // the *target's* data-in direction
    }
    if xi.params.kind.has_data_in() {
        flags |= hdr_flags::DATA_OUT;
    }
    if xi.params.ack_req != AckReq::NoAck {
        flags |= hdr_flags::ACK_REQ;
    }

    Header {
        version: crate::wire::VERSION,
        operation: operation as u8,
        ni_type: 0,
        pkt_fmt: 0,
        flags,
        hdr_handle,
        src_nid,
        src_pid,
        length: xi.params.length,
        pt_index: xi.params.pt_index,
        match_bits: xi.params.match_bits,
        remote_offset: xi.params.remote_offset,
        hdr_data: xi.params.hdr_data,
        atom_op: xi.params.atom_op.map(atom_op_wire).unwrap_or(0),
        atom_type: xi.params.atom_type.map(atom_type_wire).unwrap_or(0),
        ack_req: xi.params.ack_req as u8,
        nack: 0,
    }
}

fn atom_op_wire(op: crate::atomic_ops::AtomOp) -> u8 {
    use crate::atomic_ops::AtomOp::*;
    match op {
        Min => 0, Max => 1, Sum => 2, Prod => 3, Lor => 4, Land => 5, Bor => 6, Band => 7,
        Lxor => 8, Bxor => 9, Swap => 10, Cswap => 11, CswapNe => 12, CswapLe => 13,
        CswapLt => 14, CswapGe => 15, CswapGt => 16, Mswap => 17,
    }
}

fn atom_type_wire(ty: crate::atomic_ops::AtomType) -> u8 {
    use crate::atomic_ops::AtomType::*;
    match ty {
        Int8 => 0, Int16 => 1, Int32 => 2, Int64 => 3, Uint8 => 4, Uint16 => 5,
        Uint32 => 6, Uint64 => 7, Float => 8, Double => 9, FloatComplex => 10, DoubleComplex => 11,
    }
}

/// Outcome of driving one event emission decision (spec §4.6 "Event
/// emission rules").
pub struct Outcome {
    pub event: Option<Event>,
    pub ct_delta: Option<CtEvent>,
}

fn bytes_or_ops(md: &Md, length: u64) -> u64 {
    if md.has(md_opts::EVENT_CT_BYTES) {
        length
    } else {
        1
    }
}

/// `EARLY_SEND_EVENT` (spec §4.6): the local send completed. Suppressed by
/// `EVENT_SEND_DISABLE`.
pub fn on_send_complete(xi: &mut Xi, put_md: Option<&Md>) -> Outcome {
    xi.state = InitiatorState::WaitRecv;
    trace!(state = ?xi.state, "xi advanced");

    let suppressed = put_md.map(|m| m.has(md_opts::EVENT_SEND_DISABLE)).unwrap_or(false);
    if suppressed {
        return Outcome { event: None, ct_delta: None };
    }

    let mut event = Event::new(EventKind::Send);
    event.user_ptr = xi.params.user_ptr;
    event.match_bits = xi.params.match_bits;
    event.pt_index = xi.params.pt_index;
    Outcome { event: Some(event), ct_delta: None }
}

/// `ACK_EVENT` / `REPLY_EVENT` (spec §4.6): the target's response arrived.
/// `payload` (when present) is the data carried by a reply (Get/FetchAtomic/
/// Swap's previous-value bytes).
pub fn on_response(xi: &mut Xi, header: &Header, put_md: Option<&Md>, ni_fail: Option<PtlError>) -> Outcome {
    xi.ni_fail = ni_fail;
    xi.state = if xi.params.kind.has_data_in() { InitiatorState::ReplyEvent } else { InitiatorState::AckEvent };
    trace!(state = ?xi.state, ni_fail = ?ni_fail, "xi advanced");

    let kind = if xi.params.kind.has_data_in() { EventKind::Reply } else { EventKind::Ack };

    let success_disabled = put_md.map(|m| m.has(md_opts::EVENT_SUCCESS_DISABLE)).unwrap_or(false);
    let suppress = success_disabled && ni_fail.is_none();

    let event = if suppress {
        None
    } else {
        let mut e = Event::new(kind);
        e.user_ptr = xi.params.user_ptr;
        e.match_bits = xi.params.match_bits;
        e.pt_index = xi.params.pt_index;
        e.ni_fail = ni_fail;
        e.mlength = header.length;
        e.rlength = xi.params.length;
        Some(e)
    };

    // CT increments when EVENT_CT_ACK/EVENT_CT_REPLY set; failures always
    // count (spec §4.6 "Failure... always increments ct.failure").
    let ct_delta = put_md.and_then(|m| {
        let wants_ct = match kind {
            EventKind::Ack => m.has(md_opts::EVENT_CT_ACK),
            _ => m.has(md_opts::EVENT_CT_REPLY),
        };
        if !wants_ct && ni_fail.is_none() {
            return None;
        }
        let units = bytes_or_ops(m, header.length);
        Some(if ni_fail.is_some() {
            CtEvent { success: 0, failure: 1 }
        } else {
            CtEvent { success: units, failure: 0 }
        })
    });

    xi.state = InitiatorState::Cleanup;
    Outcome { event, ct_delta }
}

/// Transport/delivery failure path (spec §7 "Delivery errors"):
/// `ERROR → CLEANUP → DONE`, always incrementing `ct.failure`.
pub fn on_delivery_failure(xi: &mut Xi, failure: PtlError, put_md: Option<&Md>) -> Outcome {
    xi.state = InitiatorState::Error;
    xi.ni_fail = Some(failure);
    warn!(error = ?failure, "xi delivery failed");
    xi.state = InitiatorState::Cleanup;

    let mut event = Event::new(EventKind::Ack);
    event.ni_fail = Some(failure);
    event.user_ptr = xi.params.user_ptr;

    let ct_delta = put_md.map(|_| CtEvent { success: 0, failure: 1 });
    debug!("xi completed with failure, entering cleanup");
    Outcome { event: Some(event), ct_delta }
}

pub fn finish(xi: &mut Xi) {
    xi.state = InitiatorState::Done;
}

/// Handle type used by `Ni` to track in-flight XIs (distinguished from the
/// user-visible C1 handles so triggered ops can reference a submission that
/// hasn't resolved to a wire-level `hdr_handle` yet).
pub type XiHandle = Handle;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::ProcessId;

    fn params(kind: OpKind) -> OperationParams {
        OperationParams {
            kind,
            target: ProcessId::new(1, 1),
            pt_index: 0,
            match_bits: 0,
            remote_offset: 0,
            length: 16,
            local_offset: 0,
            put_md: Some(Handle { index: 0, generation: 0 }),
            get_md: None,
            ack_req: AckReq::NoAck,
            hdr_data: 0,
            atom_op: None,
            atom_type: None,
            operand: None,
            user_ptr: 0,
        }
    }

    #[test]
    fn ack_requires_eq_on_md() {
        let p = params(OpKind::Put);
        let md = Md::new(crate::md::MdRegion::Contiguous(vec![0; 64]), None, None, 0);
        let mut p_ack = p;
        p_ack.ack_req = AckReq::Ack;
        assert!(validate_submission(&p_ack, 1024, 1024, Some(&md), None).is_err());
    }

    #[test]
    fn oversized_put_rejected() {
        let mut p = params(OpKind::Put);
        p.length = 2000;
        let md = Md::new(crate::md::MdRegion::Contiguous(vec![0; 4096]), None, None, 0);
        assert!(validate_submission(&p, 1024, 1024, Some(&md), None).is_err());
    }

    #[test]
    fn send_event_suppressed_by_flag() {
        let mut xi = Xi::new(params(OpKind::Put));
        let md = Md::new(crate::md::MdRegion::Contiguous(vec![0; 64]), None, None, md_opts::EVENT_SEND_DISABLE);
        let outcome = on_send_complete(&mut xi, Some(&md));
        assert!(outcome.event.is_none());
        assert_eq!(xi.state, InitiatorState::WaitRecv);
    }

    #[test]
    fn failure_always_increments_ct_failure() {
        let mut xi = Xi::new(params(OpKind::Put));
        let md = Md::new(crate::md::MdRegion::Contiguous(vec![0; 64]), None, None, 0);
        let outcome = on_delivery_failure(&mut xi, PtlError::NiUndeliverable, Some(&md));
        assert_eq!(outcome.ct_delta, Some(CtEvent { success: 0, failure: 1 }));
    }
}
