//! End-to-end scenarios driven over the in-process loopback transport,
//! exercising the full initiator → wire → target → wire → initiator path
//! through the public `Ni` API rather than any one component in isolation.

use ptl4ni::atomic_ops::{AtomOp, AtomType};
use ptl4ni::config::NiConfig;
use ptl4ni::ct::CtEvent;
use ptl4ni::entry::{options as entry_opts, Entry};
use ptl4ni::error::PtlError;
use ptl4ni::eq::EventKind;
use ptl4ni::identifiers::{ProcessId, NID_ANY, PID_ANY};
use ptl4ni::md::{options as md_opts, Md, MdRegion};
use ptl4ni::ni::{MatchMode, Ni, NiKind, NiLimits};
use ptl4ni::op::{OpKind, OperationParams};
use ptl4ni::progress::ProgressEngine;
use ptl4ni::transport::null::NullTransport;
use ptl4ni::wire::AckReq;

fn make_ni() -> Ni {
    let id = ProcessId::new(1, 1);
    Ni::new(id, NiKind::Physical, MatchMode::Matching, NiLimits::default(), NiConfig::default(), Box::new(NullTransport::new()))
}

fn any_id() -> ProcessId {
    ProcessId::new(NID_ANY, PID_ANY)
}

/// Drive the progress engine enough passes to carry one full request/reply
/// round trip through `NullTransport`: each `poll_once` only harvests
/// completions already queued before reposting, and reposting is what
/// triggers the *next* hop's delivery, so a single call never suffices.
fn drain(ni: &Ni, rounds: usize) {
    let engine = ProgressEngine::new(ni);
    for _ in 0..rounds {
        engine.poll_once();
    }
}

/// Scenario 1: Put with ACK — initiator sees SEND then ACK, target sees PUT,
/// and the bytes actually land in the matched entry's region.
#[test]
fn put_with_ack_delivers_events_and_data() {
    let ni = make_ni();
    let eq_i = ni.eq_alloc(16).unwrap();
    let eq_t = ni.eq_alloc(16).unwrap();

    let source: Vec<u8> = (0u8..64).collect();
    let put_md = ni.md_bind(Md::new(MdRegion::Contiguous(source), Some(eq_i), None, 0)).unwrap();

    let pt_index = ni.pt_alloc(Some(eq_t), 0).unwrap();
    ni.pt_enable(pt_index).unwrap();
    let me = ni
        .entry_append(
            pt_index,
            Entry::new_me(vec![0u8; 64], None, entry_opts::OP_PUT, u32::MAX, 0x1234, 0, 0, any_id()),
            false,
        )
        .unwrap();

    let target = ni.id;
    ni.put(target, pt_index, 0x1234, 8, 16, 0, put_md, AckReq::Ack, 0, 42).unwrap();

    drain(&ni, 8);

    let send_event = ni.eq_get(eq_i).expect("send event");
    assert_eq!(send_event.kind, EventKind::Send);

    let ack_event = ni.eq_get(eq_i).expect("ack event");
    assert_eq!(ack_event.kind, EventKind::Ack);
    assert!(ack_event.ni_fail.is_none());
    assert_eq!(ack_event.mlength, 16);
    assert_eq!(ack_event.rlength, 16);
    assert_eq!(ack_event.user_ptr, 42);

    let put_event = ni.eq_get(eq_t).expect("target put event");
    assert_eq!(put_event.kind, EventKind::Put);
    assert_eq!(put_event.mlength, 16);
    assert_eq!(put_event.rlength, 16);

    let written = ni.entries.with(me, |e| e.common().region[8..24].to_vec()).unwrap();
    assert_eq!(written, (0u8..16).collect::<Vec<u8>>());
}

/// Scenario 2a: Get against an ME too small for the request, NO_TRUNCATE
/// set — the target must reject the match outright and NACK the initiator.
#[test]
fn get_no_truncate_rejects_overlap() {
    let ni = make_ni();
    let eq_i = ni.eq_alloc(16).unwrap();
    let eq_t = ni.eq_alloc(16).unwrap();

    let get_md = ni.md_bind(Md::new(MdRegion::Contiguous(vec![0u8; 40]), Some(eq_i), None, 0)).unwrap();

    let pt_index = ni.pt_alloc(Some(eq_t), 0).unwrap();
    ni.pt_enable(pt_index).unwrap();
    ni.entry_append(
        pt_index,
        Entry::new_me(vec![7u8; 32], None, entry_opts::OP_GET | entry_opts::NO_TRUNCATE, u32::MAX, 0x1, 0, 0, any_id()),
        false,
    )
    .unwrap();

    let target = ni.id;
    ni.get(target, pt_index, 0x1, 0, 40, 0, get_md, 7).unwrap();

    drain(&ni, 8);

    let reply_event = ni.eq_get(eq_i).expect("reply event");
    assert_eq!(reply_event.kind, EventKind::Reply);
    assert_eq!(reply_event.ni_fail, Some(PtlError::NiDropped));
    assert_eq!(reply_event.user_ptr, 7);
}

/// Scenario 2b: same request, NO_TRUNCATE absent — the match succeeds and
/// the reply is silently truncated to what the ME actually holds (32, not
/// the 40 requested).
#[test]
fn get_without_no_truncate_returns_truncated_match() {
    let ni = make_ni();
    let eq_i = ni.eq_alloc(16).unwrap();
    let ct_i = ni.ct_alloc().unwrap();

    let get_md = ni
        .md_bind(Md::new(
            MdRegion::Contiguous(vec![0u8; 40]),
            Some(eq_i),
            Some(ct_i),
            md_opts::EVENT_CT_BYTES | md_opts::EVENT_CT_REPLY,
        ))
        .unwrap();

    let pt_index = ni.pt_alloc(None, 0).unwrap();
    ni.pt_enable(pt_index).unwrap();
    ni.entry_append(
        pt_index,
        Entry::new_me(vec![9u8; 32], None, entry_opts::OP_GET, u32::MAX, 0x2, 0, 0, any_id()),
        false,
    )
    .unwrap();

    let target = ni.id;
    ni.get(target, pt_index, 0x2, 0, 40, 0, get_md, 0).unwrap();

    drain(&ni, 8);

    let reply_event = ni.eq_get(eq_i).expect("reply event");
    assert_eq!(reply_event.kind, EventKind::Reply);
    assert!(reply_event.ni_fail.is_none());
    assert_eq!(reply_event.mlength, 32);
    assert_eq!(reply_event.rlength, 40);

    let ct = ni.ct_get(ct_i).unwrap();
    assert_eq!(ct, CtEvent { success: 32, failure: 0 });

    let received = ni.mds.with(get_md, |md| match &md.region {
        MdRegion::Contiguous(v) => v[..32].to_vec(),
        _ => unreachable!(),
    }).unwrap();
    assert_eq!(received, vec![9u8; 32]);
}

/// Scenario 3: Atomic SUM over an int32 iovec element.
#[test]
fn atomic_sum_int32() {
    let ni = make_ni();
    let eq_i = ni.eq_alloc(16).unwrap();
    let eq_t = ni.eq_alloc(16).unwrap();

    let mut operand = Vec::new();
    operand.extend_from_slice(&7i32.to_le_bytes());
    let put_md = ni.md_bind(Md::new(MdRegion::Contiguous(operand), Some(eq_i), None, 0)).unwrap();

    let pt_index = ni.pt_alloc(Some(eq_t), 0).unwrap();
    ni.pt_enable(pt_index).unwrap();
    let me = ni
        .entry_append(
            pt_index,
            Entry::new_me(35i32.to_le_bytes().to_vec(), None, entry_opts::OP_ATOMIC, u32::MAX, 0x5, 0, 0, any_id()),
            false,
        )
        .unwrap();

    let target = ni.id;
    ni.atomic(target, pt_index, 0x5, 0, 4, 0, put_md, AckReq::Ack, 0, AtomOp::Sum, AtomType::Int32, 0).unwrap();

    drain(&ni, 8);

    let _send = ni.eq_get(eq_i).expect("send event");
    let ack = ni.eq_get(eq_i).expect("ack event");
    assert_eq!(ack.kind, EventKind::Ack);
    assert!(ack.ni_fail.is_none());

    let result = ni.entries.with(me, |e| i32::from_le_bytes(e.common().region[..4].try_into().unwrap())).unwrap();
    assert_eq!(result, 42);
}

/// Scenario 4: CSWAP_LT on an int32 element — matches the example values
/// exactly: remote=5, local=3, operand=4, `5 < 4` is false so the remote
/// keeps its original value and the initiator's fetch MD receives the
/// previous (unchanged) remote value.
#[test]
fn cswap_lt_conditional_swap() {
    let ni = make_ni();
    let eq_i = ni.eq_alloc(16).unwrap();
    let eq_t = ni.eq_alloc(16).unwrap();

    let mut local = Vec::new();
    local.extend_from_slice(&3i32.to_le_bytes());
    let put_md = ni.md_bind(Md::new(MdRegion::Contiguous(local), None, None, 0)).unwrap();
    let get_md = ni.md_bind(Md::new(MdRegion::Contiguous(vec![0u8; 4]), Some(eq_i), None, 0)).unwrap();

    let pt_index = ni.pt_alloc(Some(eq_t), 0).unwrap();
    ni.pt_enable(pt_index).unwrap();
    let me = ni
        .entry_append(
            pt_index,
            Entry::new_me(5i32.to_le_bytes().to_vec(), None, entry_opts::OP_ATOMIC, u32::MAX, 0x6, 0, 0, any_id()),
            false,
        )
        .unwrap();

    let target = ni.id;
    let operand = 4i32.to_le_bytes().to_vec();
    ni.swap(target, pt_index, 0x6, 0, 4, 0, put_md, get_md, 0, AtomOp::CswapLt, AtomType::Int32, operand, 0).unwrap();

    drain(&ni, 8);

    let reply = ni.eq_get(eq_i).expect("reply event");
    assert_eq!(reply.kind, EventKind::Reply);
    assert!(reply.ni_fail.is_none());

    let previous = ni.mds.with(get_md, |md| match &md.region {
        MdRegion::Contiguous(v) => i32::from_le_bytes(v[..4].try_into().unwrap()),
        _ => unreachable!(),
    }).unwrap();
    assert_eq!(previous, 5);

    let remote_after = ni.entries.with(me, |e| i32::from_le_bytes(e.common().region[..4].try_into().unwrap())).unwrap();
    assert_eq!(remote_after, 5, "5 < 4 is false, remote must be unchanged");
}

/// Scenario 5: a triggered Put stays dormant below its CT's threshold, then
/// fires exactly once the moment the threshold is crossed.
#[test]
fn triggered_put_fires_at_threshold() {
    let ni = make_ni();
    let ct_gate = ni.ct_alloc().unwrap();
    let eq_t = ni.eq_alloc(16).unwrap();

    let source = vec![1u8, 2, 3, 4];
    let put_md = ni.md_bind(Md::new(MdRegion::Contiguous(source), None, None, 0)).unwrap();

    let pt_index = ni.pt_alloc(Some(eq_t), 0).unwrap();
    ni.pt_enable(pt_index).unwrap();
    let me = ni
        .entry_append(
            pt_index,
            Entry::new_me(vec![0u8; 4], None, entry_opts::OP_PUT, u32::MAX, 0x7, 0, 0, any_id()),
            false,
        )
        .unwrap();

    let target = ni.id;
    let params = OperationParams {
        kind: OpKind::Put,
        target,
        pt_index,
        match_bits: 0x7,
        remote_offset: 0,
        length: 4,
        local_offset: 0,
        put_md: Some(put_md),
        get_md: None,
        ack_req: AckReq::NoAck,
        hdr_data: 0,
        atom_op: None,
        atom_type: None,
        operand: None,
        user_ptr: 0,
    };
    ni.triggered_submit(ct_gate, 3, params).unwrap();

    ni.ct_inc(ct_gate, CtEvent { success: 1, failure: 0 }).unwrap();
    drain(&ni, 4);
    assert!(ni.eq_get(eq_t).is_err(), "triggered put must not fire below threshold");
    assert_eq!(ni.entries.with(me, |e| e.common().region.clone()).unwrap(), vec![0u8; 4]);

    ni.ct_inc(ct_gate, CtEvent { success: 2, failure: 0 }).unwrap();
    drain(&ni, 8);

    let event = ni.eq_get(eq_t).expect("triggered put delivered");
    assert_eq!(event.kind, EventKind::Put);
    assert_eq!(ni.entries.with(me, |e| e.common().region.clone()).unwrap(), vec![1, 2, 3, 4]);
}

/// Scenario 6: an EQ with capacity 4 fed 6 events overflows into a single
/// `Dropped` sentinel accumulating `lost == 2`, draining after the events
/// that were already buffered ahead of it.
#[test]
fn eq_overflow_reports_dropped_after_buffered_events() {
    let ni = make_ni();
    let eq_t = ni.eq_alloc(4).unwrap();
    let put_md = ni.md_bind(Md::new(MdRegion::Contiguous(vec![0u8; 1]), None, None, 0)).unwrap();

    let pt_index = ni.pt_alloc(Some(eq_t), 0).unwrap();
    ni.pt_enable(pt_index).unwrap();
    ni.entry_append(
        pt_index,
        Entry::new_me(vec![0u8; 1], None, entry_opts::OP_PUT, u32::MAX, 0x8, 0, 0, any_id()),
        false,
    )
    .unwrap();

    let target = ni.id;
    for i in 0..6u64 {
        ni.put(target, pt_index, 0x8, 0, 1, 0, put_md, AckReq::NoAck, 0, i).unwrap();
        drain(&ni, 4);
    }

    let mut kinds = Vec::new();
    while let Ok(event) = ni.eq_get(eq_t) {
        kinds.push((event.kind, event.lost));
    }

    assert_eq!(kinds.len(), 5);
    assert!(kinds[..4].iter().all(|(k, _)| *k == EventKind::Put));
    assert_eq!(kinds[4], (EventKind::Dropped, 2));
}

/// Scenario 7: `MESearch` reports a hit once a matching ME is posted and a
/// miss against an unrelated tag; `CTCancelTriggered` withdraws a pending
/// triggered op before its CT ever reaches threshold; `StartBundle`/
/// `EndBundle` are liveness-gated no-ops.
#[test]
fn search_cancel_and_bundle_ops() {
    let ni = make_ni();
    let eq_t = ni.eq_alloc(16).unwrap();
    let pt_index = ni.pt_alloc(Some(eq_t), 0).unwrap();
    ni.pt_enable(pt_index).unwrap();
    ni.entry_append(
        pt_index,
        Entry::new_me(vec![0u8; 8], None, entry_opts::OP_PUT, u32::MAX, 0x9, 0, 0, any_id()),
        false,
    )
    .unwrap();

    let requester = ProcessId::new(7, 3);
    assert!(ni.me_search(pt_index, requester, 0x9, 0, 8, entry_opts::OP_PUT, 11).unwrap());
    let hit = ni.eq_get(eq_t).expect("search hit event");
    assert_eq!(hit.kind, EventKind::Search);
    assert!(hit.ni_fail.is_none());
    assert_eq!(hit.user_ptr, 11);

    assert!(!ni.me_search(pt_index, requester, 0xdead, 0, 8, entry_opts::OP_PUT, 12).unwrap());
    let miss = ni.eq_get(eq_t).expect("search miss event");
    assert_eq!(miss.kind, EventKind::Search);
    assert_eq!(miss.ni_fail, Some(PtlError::NiDropped));

    let ct_gate = ni.ct_alloc().unwrap();
    let dummy_put_md = ni.md_bind(Md::new(MdRegion::Contiguous(vec![0u8; 4]), None, None, 0)).unwrap();
    let params = OperationParams {
        kind: OpKind::Put,
        target: ni.id,
        pt_index,
        match_bits: 0x9,
        remote_offset: 0,
        length: 4,
        local_offset: 0,
        put_md: Some(dummy_put_md),
        get_md: None,
        ack_req: AckReq::NoAck,
        hdr_data: 0,
        atom_op: None,
        atom_type: None,
        operand: None,
        user_ptr: 0,
    };
    let triggered_id = ni.triggered_submit(ct_gate, 5, params).unwrap();
    assert!(ni.ct_cancel_triggered(ct_gate, triggered_id).unwrap());
    ni.ct_inc(ct_gate, CtEvent { success: 5, failure: 0 }).unwrap();
    drain(&ni, 4);
    assert!(ni.eq_get(eq_t).is_err(), "cancelled triggered op must never fire");

    ni.start_bundle().unwrap();
    ni.end_bundle().unwrap();
}
