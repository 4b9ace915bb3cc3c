//! Target state machine (spec §4.5, C5): drives one inbound request through
//! matching, permission checks, data transfer, and acknowledgement.

use tracing::{debug, trace};

use crate::atomic_ops::{AtomOp, AtomType};
use crate::entry::{options as entry_opts, Entry};
use crate::eq::{Event, EventKind};
use crate::error::{PtlError, PtlResult};
use crate::handle::{Handle, Pool};
use crate::identifiers::ProcessId;
use crate::iovec;
use crate::match_engine::{self, MatchResult};
use crate::op::OpKind;
use crate::pt::PtEntry;
use crate::wire::{Header, WireOp};

/// Keep the state enum shape of spec §4.5 so traces remain comparable
/// across this implementation and the reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Start,
    Drop,
    GetMatch,
    GetLength,
    WaitConn,
    DataIn,
    DataOut,
    AtomicDataIn,
    SwapDataIn,
    Rdma,
    WaitRdmaDesc,
    ShmemDesc,
    SendAck,
    SendReply,
    CommEvent,
    WaitAppend,
    OverflowEvent,
    Cleanup,
    Cleanup2,
    Error,
    Done,
}

pub struct Xt {
    pub source: ProcessId,
    pub state: TargetState,
}

/// What the caller (`Ni`/progress engine) must do once `process_request`
/// returns: send a response packet and/or deliver events/CT updates.
pub struct TargetOutcome {
    pub state: TargetState,
    /// Bytes to carry back to the initiator — the ack has none; a reply
    /// (Get/FetchAtomic/Swap) carries the matched/previous data.
    pub response_payload: Vec<u8>,
    pub response_op: WireOp,
    pub ni_fail: Option<PtlError>,
    pub target_event: Option<Event>,
    pub overflow_event: Option<Event>,
}

fn op_flag(kind: OpKind) -> u32 {
    match kind {
        OpKind::Put => entry_opts::OP_PUT,
        OpKind::Get => entry_opts::OP_GET,
        OpKind::Atomic | OpKind::FetchAtomic | OpKind::Swap => entry_opts::OP_ATOMIC,
    }
}

fn kind_from_header(header: &Header) -> PtlResult<OpKind> {
    match WireOp::from_u8(header.operation).ok_or(PtlError::ArgInvalid)? {
        WireOp::Put => Ok(OpKind::Put),
        WireOp::Get => Ok(OpKind::Get),
        WireOp::Atomic => Ok(OpKind::Atomic),
        WireOp::FetchAtomic => Ok(OpKind::FetchAtomic),
        WireOp::Swap => Ok(OpKind::Swap),
        _ => Err(PtlError::ArgInvalid),
    }
}

fn atom_op_from_wire(v: u8) -> Option<AtomOp> {
    use AtomOp::*;
    Some(match v {
        0 => Min, 1 => Max, 2 => Sum, 3 => Prod, 4 => Lor, 5 => Land, 6 => Bor, 7 => Band,
        8 => Lxor, 9 => Bxor, 10 => Swap, 11 => Cswap, 12 => CswapNe, 13 => CswapLe,
        14 => CswapLt, 15 => CswapGe, 16 => CswapGt, 17 => Mswap,
        _ => return None,
    })
}

fn atom_type_from_wire(v: u8) -> Option<AtomType> {
    use AtomType::*;
    Some(match v {
        0 => Int8, 1 => Int16, 2 => Int32, 3 => Int64, 4 => Uint8, 5 => Uint16,
        6 => Uint32, 7 => Uint64, 8 => Float, 9 => Double, 10 => FloatComplex, 11 => DoubleComplex,
        _ => return None,
    })
}

/// Drive one inbound request end to end (spec §4.5's canonical PUT/GET/
/// ATOMIC/SWAP transitions collapsed into one call, since our transports
/// complete synchronously — `WAIT_CONN`/`WAIT_RDMA_DESC`/`SHMEM_DESC` are
/// no-ops here: connection/descriptor setup is the fabric driver's
/// responsibility, out of scope per spec §1).
pub fn process_request(
    pt: &PtEntry,
    entries: &Pool<Entry>,
    source: ProcessId,
    requester_ac_id: u32,
    header: &Header,
    request_payload: &[u8],
) -> TargetOutcome {
    let mut state = TargetState::Start;
    trace!(?state, "xt started");

    let kind = match kind_from_header(header) {
        Ok(k) => k,
        Err(_) => return drop_outcome(PtlError::ArgInvalid),
    };

    state = TargetState::GetMatch;
    trace!(?state);
    let m: MatchResult = match match_engine::find_match(
        pt,
        entries,
        source,
        header.match_bits,
        header.remote_offset,
        header.length,
        op_flag(kind),
    ) {
        Ok(m) => m,
        Err(e) => {
            debug!(error = ?e, "no match for inbound request");
            return drop_outcome(e);
        }
    };

    state = TargetState::GetLength;
    trace!(?state);
    if let Err(e) = match_engine::check_permission(entries, m.handle, requester_ac_id) {
        return drop_outcome(e);
    }

    let from_overflow = m.from_overflow;
    let overflow_event = from_overflow.then(|| {
        let mut e = Event::new(overflow_kind(kind));
        e.pt_index = header.pt_index;
        e.match_bits = header.match_bits;
        e.mlength = m.mlength;
        e.rlength = header.length;
        e.initiator = Some(source);
        e
    });

    let (response_payload, ni_fail, final_state) = match kind {
        OpKind::Put => {
            state = TargetState::DataIn;
            trace!(?state);
            let n = m.mlength;
            let result = entries.with_mut(m.handle, |entry| {
                let mut slices = entry.common_mut().as_slices_mut();
                iovec::copy_in(&request_payload[..n as usize], &mut slices, m.effective_offset, n)
            });
            (Vec::new(), result.and_then(|r| r).err(), TargetState::SendAck)
        }
        OpKind::Get => {
            state = TargetState::DataOut;
            trace!(?state);
            let n = m.mlength;
            let mut out = vec![0u8; n as usize];
            let result = entries.with(m.handle, |entry| {
                let slices = entry.common().as_slices();
                iovec::copy_out(&mut out, &slices, m.effective_offset, n)
            });
            (out, result.and_then(|r| r).err(), TargetState::SendReply)
        }
        OpKind::Atomic => {
            state = TargetState::AtomicDataIn;
            trace!(?state);
            let (op, ty) = match (atom_op_from_wire(header.atom_op), atom_type_from_wire(header.atom_type)) {
                (Some(op), Some(ty)) => (op, ty),
                _ => return drop_outcome(PtlError::ArgInvalid),
            };
            let result = entries.with_mut(m.handle, |entry| {
                let mut slices = entry.common_mut().as_slices_mut();
                iovec::atomic_in(op, ty, request_payload, &mut slices, m.effective_offset, header.length)
            });
            (Vec::new(), result.and_then(|r| r).err(), TargetState::SendAck)
        }
        OpKind::FetchAtomic => {
            state = TargetState::AtomicDataIn;
            trace!(?state);
            let (op, ty) = match (atom_op_from_wire(header.atom_op), atom_type_from_wire(header.atom_type)) {
                (Some(op), Some(ty)) => (op, ty),
                _ => return drop_outcome(PtlError::ArgInvalid),
            };
            let mut previous = vec![0u8; header.length as usize];
            let result = entries.with_mut(m.handle, |entry| {
                let mut slices = entry.common_mut().as_slices_mut();
                let r = iovec::copy_out(
                    &mut previous,
                    &slices.iter().map(|s| crate::iovec::IoSlice { base: s.base }).collect::<Vec<_>>(),
                    m.effective_offset,
                    header.length,
                );
                if r.is_ok() {
                    iovec::atomic_in(op, ty, request_payload, &mut slices, m.effective_offset, header.length)
                } else {
                    r
                }
            });
            (previous, result.and_then(|r| r).err(), TargetState::SendReply)
        }
        OpKind::Swap => {
            state = TargetState::SwapDataIn;
            trace!(?state);
            let (op, ty) = match (atom_op_from_wire(header.atom_op), atom_type_from_wire(header.atom_type)) {
                (Some(op), Some(ty)) => (op, ty),
                _ => return drop_outcome(PtlError::ArgInvalid),
            };
            let elem = ty.size();
            let mut previous = vec![0u8; header.length as usize];
            let result: PtlResult<()> = entries.with_mut(m.handle, |entry| {
                let region = &mut entry.common_mut().region;
                let start = m.effective_offset as usize;
                let len = header.length as usize;
                if start + len > region.len() {
                    return Err(PtlError::ArgInvalid);
                }
                let operand = if op.uses_operand() { Some(&request_payload[len..len + elem]) } else { None };
                let mut i = 0;
                while i < len {
                    op.swap_elem(
                        ty,
                        &mut region[start + i..start + i + elem],
                        &request_payload[i..i + elem],
                        operand,
                        &mut previous[i..i + elem],
                    );
                    i += elem;
                }
                Ok(())
            });
            (previous, result.err(), TargetState::SendReply)
        }
    };

    if let Some(fail) = ni_fail {
        return drop_outcome(fail);
    }

    // spec §4.4 step 5: auto-unlink happens after the current operation is
    // bound to the entry, i.e. now.
    if match_engine::should_auto_unlink(entries, m.handle, m.effective_offset, header.length).unwrap_or(false) {
        match_engine::unlink(pt, m.handle);
        trace!("auto-unlinked matched entry");
    }

    state = TargetState::CommEvent;
    trace!(?state);
    let mut target_event = Event::new(target_kind(kind));
    target_event.pt_index = header.pt_index;
    target_event.match_bits = header.match_bits;
    target_event.mlength = m.mlength;
    target_event.rlength = header.length;
    target_event.hdr_data = header.hdr_data;
    target_event.initiator = Some(source);

    state = TargetState::Done;
    trace!(?state, "xt completed");

    TargetOutcome {
        state: final_state,
        response_payload,
        response_op: if matches!(kind, OpKind::Get | OpKind::FetchAtomic | OpKind::Swap) {
            WireOp::Reply
        } else {
            WireOp::Ack
        },
        ni_fail: None,
        target_event: Some(target_event),
        overflow_event,
    }
}

fn overflow_kind(kind: OpKind) -> EventKind {
    match kind {
        OpKind::Put => EventKind::PutOverflow,
        OpKind::Get => EventKind::GetOverflow,
        OpKind::Atomic | OpKind::FetchAtomic => EventKind::AtomicOverflow,
        OpKind::Swap => EventKind::FetchAtomicOverflow,
    }
}

fn target_kind(kind: OpKind) -> EventKind {
    match kind {
        OpKind::Put => EventKind::Put,
        OpKind::Get => EventKind::Get,
        OpKind::Atomic => EventKind::Atomic,
        OpKind::FetchAtomic | OpKind::Swap => EventKind::FetchAtomic,
    }
}

/// `DROP` (spec §4.5): disabled PT, no match, permission failure, or
/// malformed header. Still emits the configured failure event and, if
/// requested, a NACK — callers check `ack_req` on the original header to
/// decide whether to send one.
fn drop_outcome(fail: PtlError) -> TargetOutcome {
    let mut event = Event::new(EventKind::Put);
    event.ni_fail = Some(fail);
    TargetOutcome {
        state: TargetState::Drop,
        response_payload: Vec::new(),
        response_op: WireOp::Ack,
        ni_fail: Some(fail),
        target_event: Some(event),
        overflow_event: None,
    }
}

pub type XtHandle = Handle;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::{NID_ANY, PID_ANY};
    use crate::wire::AckReq;

    fn pt_with_me(entries: &Pool<Entry>, options: u32, len: usize) -> PtEntry {
        let pt = PtEntry::new(None, 0);
        let h = entries
            .insert(Entry::new_me(vec![0; len], None, options, u32::MAX, 0x1234, 0, 0, ProcessId::new(NID_ANY, PID_ANY)))
            .unwrap();
        pt.lists.lock().unwrap().priority.push(h);
        pt
    }

    fn header(op: WireOp, length: u64, remote_offset: u64) -> Header {
        Header {
            version: crate::wire::VERSION,
            operation: op as u8,
            ni_type: 0,
            pkt_fmt: 0,
            flags: 0,
            hdr_handle: 0,
            src_nid: 9,
            src_pid: 1,
            length,
            pt_index: 3,
            match_bits: 0x1234,
            remote_offset,
            hdr_data: 0,
            atom_op: 0,
            atom_type: 0,
            ack_req: AckReq::Ack as u8,
            nack: 0,
        }
    }

    #[test]
    fn put_writes_into_matched_entry() {
        let entries: Pool<Entry> = Pool::new(8);
        let pt = pt_with_me(&entries, entry_opts::OP_PUT, 64);
        let h = header(WireOp::Put, 16, 8);
        let payload = vec![7u8; 16];
        let outcome = process_request(&pt, &entries, ProcessId::new(9, 1), u32::MAX, &h, &payload);
        assert_eq!(outcome.state, TargetState::SendAck);
        assert!(outcome.ni_fail.is_none());
    }

    #[test]
    fn get_reads_from_matched_entry() {
        let entries: Pool<Entry> = Pool::new(8);
        let pt = pt_with_me(&entries, entry_opts::OP_GET, 64);
        let h = header(WireOp::Get, 16, 0);
        let outcome = process_request(&pt, &entries, ProcessId::new(9, 1), u32::MAX, &h, &[]);
        assert_eq!(outcome.state, TargetState::SendReply);
        assert_eq!(outcome.response_payload.len(), 16);
    }

    #[test]
    fn no_match_drops() {
        let entries: Pool<Entry> = Pool::new(8);
        let pt = PtEntry::new(None, 0);
        let h = header(WireOp::Put, 16, 0);
        let outcome = process_request(&pt, &entries, ProcessId::new(9, 1), u32::MAX, &h, &[0; 16]);
        assert_eq!(outcome.state, TargetState::Drop);
        assert!(outcome.ni_fail.is_some());
    }
}
