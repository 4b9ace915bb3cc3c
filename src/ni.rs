//! Network Interface (spec §3 "Network Interface (NI)"): the object that
//! owns every handle pool, the portal table, and per-transport state, and
//! exposes the public operations of spec §6.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::{info, warn};

use crate::buf::{BufPool, BufTag};
use crate::config::NiConfig;
use crate::ct::{Ct, CtEvent, TriggeredAction};
use crate::entry::Entry;
use crate::eq::Eq;
use crate::error::{PtlError, PtlResult};
use crate::handle::{Handle, Pool};
use crate::identifiers::{ProcessId, RankMap};
use crate::initiator::{self, Xi, XiHandle};
use crate::md::Md;
use crate::op::{OpKind, OperationParams};
use crate::pt::PtEntry;
use crate::target;
use crate::transport::{CompletionKind, Transport};
use crate::wire::{AckReq, Header, WireOp};

/// NI limits (spec §3: "a set of limits").
#[derive(Debug, Clone, Copy)]
pub struct NiLimits {
    pub max_msg_size: u64,
    pub max_atomic_size: u64,
    pub max_iovecs: u32,
    pub max_mds: usize,
    pub max_entries: usize,
    pub max_eqs: usize,
    pub max_cts: usize,
    pub max_pt_index: usize,
    pub max_list_size: usize,
}

impl Default for NiLimits {
    fn default() -> Self {
        NiLimits {
            max_msg_size: 1 << 20,
            max_atomic_size: 4096,
            max_iovecs: 64,
            max_mds: 4096,
            max_entries: 4096,
            max_eqs: 256,
            max_cts: 256,
            max_pt_index: 64,
            max_list_size: 4096,
        }
    }
}

/// Physical (addressed by `(nid, pid)`) or logical (addressed by rank).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NiKind {
    Physical,
    Logical,
}

/// Matching (uses MEs) or non-matching (uses LEs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Matching,
    NonMatching,
}

pub struct Ni {
    pub id: ProcessId,
    pub kind: NiKind,
    pub match_mode: MatchMode,
    pub limits: NiLimits,
    pub config: NiConfig,

    pub mds: Pool<Md>,
    pub entries: Pool<Entry>,
    pub cts: Pool<Ct>,
    pub eqs: Pool<Eq>,
    pub xis: Pool<Xi>,
    pts: Mutex<Vec<Option<PtEntry>>>,
    rank_map: Mutex<Option<RankMap>>,

    transport: Box<dyn Transport>,
    bufs: Mutex<BufPool>,

    shutting_down: AtomicBool,
    num_recv_drops: std::sync::atomic::AtomicU64,
}

impl Ni {
    /// `NIInit` (spec §6).
    pub fn new(id: ProcessId, kind: NiKind, match_mode: MatchMode, limits: NiLimits, config: NiConfig, transport: Box<dyn Transport>) -> Self {
        info!(nid = id.nid, pid = id.pid, ?kind, ?match_mode, "NI initialized");
        let max_pt_index = limits.max_pt_index;
        Ni {
            id,
            kind,
            match_mode,
            limits,
            config,
            mds: Pool::new(limits.max_mds),
            entries: Pool::new(limits.max_entries),
            cts: Pool::new(limits.max_cts),
            eqs: Pool::new(limits.max_eqs),
            xis: Pool::new(limits.max_list_size),
            pts: Mutex::new((0..max_pt_index).map(|_| None).collect()),
            rank_map: Mutex::new(None),
            transport,
            bufs: Mutex::new(BufPool::new(256, 4096)),
            shutting_down: AtomicBool::new(false),
            num_recv_drops: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn check_alive(&self) -> PtlResult<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(PtlError::NoInit);
        }
        Ok(())
    }

    /// `NIStatus` (spec §6): a coarse liveness probe.
    pub fn status(&self) -> PtlResult<()> {
        self.check_alive()
    }

    /// `NIFini` (spec §6).
    ///
    /// Triggered lists are drained (via `Ct::shutdown`) and every EQ/CT
    /// waiter is woken *before* the handle pools are torn down — the
    /// reference implementation zeroes the NI first and only then walks
    /// `ppe_ct` to free triggered lists, a use-after-clear bug this ordering
    /// avoids by construction.
    pub fn fini(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.cts.for_each(|_, ct| {
            ct.shutdown();
        });
        self.eqs.for_each(|_, eq| eq.shutdown());
        info!(nid = self.id.nid, pid = self.id.pid, "NI torn down");
    }

    pub fn num_recv_drops(&self) -> u64 {
        self.num_recv_drops.load(Ordering::Relaxed)
    }

    // -- rank map --------------------------------------------------------

    /// `SetMap` (spec §6).
    pub fn set_map(&self, table: Vec<ProcessId>) -> PtlResult<()> {
        *self.rank_map.lock().unwrap() = Some(RankMap::new(table));
        Ok(())
    }

    /// `GetMap` (spec §6).
    pub fn get_map(&self) -> PtlResult<RankMap> {
        self.rank_map.lock().unwrap().clone().ok_or(PtlError::NoInit)
    }

    fn resolve(&self, target: ProcessId) -> PtlResult<ProcessId> {
        if self.kind == NiKind::Physical {
            return Ok(target);
        }
        // Logical NIs pass rank.0 in `nid` and resolve through the map.
        self.rank_map
            .lock()
            .unwrap()
            .as_ref()
            .ok_or(PtlError::NoInit)?
            .resolve(crate::identifiers::Rank(target.nid))
            .ok_or(PtlError::ArgInvalid)
    }

    // -- portal table -----------------------------------------------------

    /// `PTAlloc` (spec §6): lowest free index.
    pub fn pt_alloc(&self, eq: Option<Handle>, options: u32) -> PtlResult<u32> {
        self.check_alive()?;
        let mut pts = self.pts.lock().unwrap();
        let index = pts.iter().position(|p| p.is_none()).ok_or(PtlError::NoSpace)?;
        pts[index] = Some(PtEntry::new(eq, options));
        Ok(index as u32)
    }

    pub fn pt_free(&self, pt_index: u32) -> PtlResult<()> {
        let mut pts = self.pts.lock().unwrap();
        let slot = pts.get_mut(pt_index as usize).ok_or(PtlError::ArgInvalid)?;
        if slot.is_none() {
            return Err(PtlError::ArgInvalid);
        }
        *slot = None;
        Ok(())
    }

    pub fn pt_enable(&self, pt_index: u32) -> PtlResult<()> {
        self.with_pt_mut(pt_index, |pt| pt.status = crate::pt::PtStatus::Enabled)
    }

    pub fn pt_disable(&self, pt_index: u32) -> PtlResult<()> {
        self.with_pt_mut(pt_index, |pt| pt.status = crate::pt::PtStatus::Disabled)
    }

    fn with_pt<R>(&self, pt_index: u32, f: impl FnOnce(&PtEntry) -> R) -> PtlResult<R> {
        let pts = self.pts.lock().unwrap();
        let pt = pts.get(pt_index as usize).and_then(|p| p.as_ref()).ok_or(PtlError::ArgInvalid)?;
        Ok(f(pt))
    }

    fn with_pt_mut<R>(&self, pt_index: u32, f: impl FnOnce(&mut PtEntry) -> R) -> PtlResult<R> {
        let mut pts = self.pts.lock().unwrap();
        let pt = pts.get_mut(pt_index as usize).and_then(|p| p.as_mut()).ok_or(PtlError::ArgInvalid)?;
        Ok(f(pt))
    }

    // -- memory descriptors -------------------------------------------------

    /// `MDBind` (spec §6): bind a source/sink region to this NI.
    pub fn md_bind(&self, md: Md) -> PtlResult<Handle> {
        self.check_alive()?;
        self.mds.insert(md)
    }

    /// `MDRelease` (spec §6): rejects while any XI still references the MD
    /// (spec §3 invariant "An MD may not be released while any XI references it").
    pub fn md_release(&self, handle: Handle) -> PtlResult<()> {
        let in_flight = self.mds.with(handle, |md| md.in_flight)?;
        if in_flight > 0 {
            return Err(PtlError::InUse);
        }
        self.mds.release(handle)?;
        Ok(())
    }

    // -- list entries ------------------------------------------------------

    /// `LEAppend`/`MEAppend` (spec §6): append to a PT's priority or
    /// overflow list. `overflow = true` targets the overflow list.
    pub fn entry_append(&self, pt_index: u32, entry: Entry, overflow: bool) -> PtlResult<Handle> {
        self.check_alive()?;
        let handle = self.entries.insert(entry)?;

        let max_list_size = self.limits.max_list_size;
        let append = self.with_pt(pt_index, move |pt| {
            let mut lists = pt.lists.lock().unwrap();
            let list = if overflow { &mut lists.overflow } else { &mut lists.priority };
            if list.len() >= max_list_size {
                return Err(PtlError::NoSpace);
            }
            list.push(handle);
            Ok(())
        });

        match append {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(e)) | Err(e) => {
                let _ = self.entries.release(handle);
                Err(e)
            }
        }
    }

    /// `LEUnlink`/`MEUnlink` (spec §6).
    pub fn entry_unlink(&self, pt_index: u32, handle: Handle) -> PtlResult<()> {
        self.with_pt(pt_index, |pt| crate::match_engine::unlink(pt, handle))?;
        self.entries.release(handle)?;
        Ok(())
    }

    /// `LESearch`/`MESearch` (spec §6): report whether `pt_index`'s priority
    /// or overflow list already holds an entry that would match a request
    /// with these parameters, without appending or binding anything. Emits
    /// a `Search` event to the PT's EQ (if any) carrying the outcome.
    #[allow(clippy::too_many_arguments)]
    pub fn me_search(&self, pt_index: u32, initiator: ProcessId, match_bits: u64, remote_offset: u64, length: u64, op_flag: u32, user_ptr: u64) -> PtlResult<bool> {
        self.check_alive()?;
        let found = self.with_pt(pt_index, |pt| crate::match_engine::search(pt, &self.entries, initiator, match_bits, remote_offset, length, op_flag))??;

        let mut event = crate::eq::Event::new(crate::eq::EventKind::Search);
        event.pt_index = pt_index;
        event.match_bits = match_bits;
        event.user_ptr = user_ptr;
        if found.is_none() {
            event.ni_fail = Some(PtlError::NiDropped);
        }
        if let Ok(Some(eq)) = self.with_pt(pt_index, |pt| pt.eq) {
            let _ = self.eqs.with(eq, |q| q.enqueue(event));
        }
        Ok(found.is_some())
    }

    /// Non-matching counterpart of [`Ni::me_search`]; `LESearch` never
    /// filters on match bits, so any `OP_*`-permitted, unlinked entry in the
    /// PT's lists is a hit.
    pub fn le_search(&self, pt_index: u32, initiator: ProcessId, length: u64, op_flag: u32, user_ptr: u64) -> PtlResult<bool> {
        self.me_search(pt_index, initiator, 0, 0, length, op_flag, user_ptr)
    }

    /// `StartBundle`/`EndBundle` (spec §6): hint to the NI that the
    /// operations submitted between the two calls may be grouped for
    /// scheduling purposes; carries no required semantics of its own, so
    /// both are accounting no-ops beyond the liveness check.
    pub fn start_bundle(&self) -> PtlResult<()> {
        self.check_alive()
    }

    pub fn end_bundle(&self) -> PtlResult<()> {
        self.check_alive()
    }

    // -- CT / EQ ------------------------------------------------------------

    pub fn ct_alloc(&self) -> PtlResult<Handle> {
        self.cts.insert(Ct::new())
    }

    pub fn ct_free(&self, handle: Handle) -> PtlResult<()> {
        self.cts.release(handle)?;
        Ok(())
    }

    pub fn ct_get(&self, handle: Handle) -> PtlResult<CtEvent> {
        self.cts.with(handle, |ct| ct.get())
    }

    pub fn ct_wait(&self, handle: Handle, threshold: u64) -> PtlResult<CtEvent> {
        self.cts.with(handle, |ct| ct.wait(threshold))?
    }

    pub fn ct_set(&self, handle: Handle, value: CtEvent) -> PtlResult<()> {
        let fired = self.cts.with(handle, |ct| ct.set(value))?;
        self.dispatch_triggered(fired);
        Ok(())
    }

    pub fn ct_inc(&self, handle: Handle, delta: CtEvent) -> PtlResult<()> {
        let fired = self.cts.with(handle, |ct| ct.inc(delta))?;
        self.dispatch_triggered(fired);
        Ok(())
    }

    fn dispatch_triggered(&self, fired: Vec<TriggeredAction>) {
        for action in fired {
            match action {
                TriggeredAction::Submit(params) => {
                    if let Err(e) = self.submit(params) {
                        warn!(error = ?e, "triggered op failed to submit");
                    }
                }
                TriggeredAction::CtSet(handle, value) => {
                    let _ = self.ct_set(handle, value);
                }
                TriggeredAction::CtInc(handle, delta) => {
                    let _ = self.ct_inc(handle, delta);
                }
            }
        }
    }

    pub fn eq_alloc(&self, capacity: usize) -> PtlResult<Handle> {
        self.eqs.insert(Eq::new(capacity))
    }

    pub fn eq_free(&self, handle: Handle) -> PtlResult<()> {
        self.eqs.release(handle)?;
        Ok(())
    }

    pub fn eq_get(&self, handle: Handle) -> PtlResult<crate::eq::Event> {
        self.eqs.with(handle, |eq| eq.get())?
    }

    pub fn eq_wait(&self, handle: Handle) -> PtlResult<crate::eq::Event> {
        self.eqs.with(handle, |eq| eq.wait())?
    }

    // -- initiator operations -----------------------------------------------

    fn submit(&self, params: OperationParams) -> PtlResult<XiHandle> {
        self.check_alive()?;

        let put_md_snapshot = params.put_md.map(|h| self.mds.with(h, md_snapshot)).transpose()?;
        let get_md_snapshot = params.get_md.map(|h| self.mds.with(h, md_snapshot)).transpose()?;

        initiator::validate_submission(
            &params,
            self.limits.max_msg_size,
            self.limits.max_atomic_size,
            put_md_snapshot.as_ref(),
            get_md_snapshot.as_ref(),
        )?;

        let target = self.resolve(params.target)?;
        let mut resolved = params;
        resolved.target = target;

        if let Some(h) = resolved.put_md {
            self.mds.with_mut(h, |md| md.in_flight += 1)?;
        }

        let xi = Xi::new(resolved);
        let handle = self.xis.insert(xi)?;

        self.send_request(handle)?;
        Ok(handle)
    }

    fn send_request(&self, handle: XiHandle) -> PtlResult<()> {
        let header = self.xis.with(handle, |xi| initiator::build_request_header(xi, self.id.nid, self.id.pid, handle.index))?;

        let payload = self.xis.with(handle, |xi| -> PtlResult<Vec<u8>> {
            if !xi.params.kind.has_data_out() {
                return Ok(Vec::new());
            }
            let put_md = xi.params.put_md.ok_or(PtlError::ArgInvalid)?;
            let mut out = vec![0u8; xi.params.length as usize];
            self.mds.with(put_md, |md| {
                let slices = md.region.as_slices();
                crate::iovec::copy_out(&mut out, &slices, xi.params.local_offset, xi.params.length)
            })??;
            if let Some(operand) = &xi.params.operand {
                out.extend_from_slice(operand);
            }
            Ok(out)
        })??;

        let mut buf = self.bufs.lock().unwrap().acquire(BufTag::Init).ok_or(PtlError::NoSpace)?;
        header.encode(buf.header_mut());
        buf.payload_mut()[..payload.len()].copy_from_slice(&payload);
        buf.length = payload.len();

        let target = self.xis.with(handle, |xi| xi.params.target)?;
        self.transport.send(buf, target, true)
    }

    pub fn put(&self, target: ProcessId, pt_index: u32, match_bits: u64, remote_offset: u64, length: u64, local_offset: u64, put_md: Handle, ack_req: AckReq, hdr_data: u64, user_ptr: u64) -> PtlResult<XiHandle> {
        self.submit(OperationParams { kind: OpKind::Put, target, pt_index, match_bits, remote_offset, length, local_offset, put_md: Some(put_md), get_md: None, ack_req, hdr_data, atom_op: None, atom_type: None, operand: None, user_ptr })
    }

    pub fn get(&self, target: ProcessId, pt_index: u32, match_bits: u64, remote_offset: u64, length: u64, local_offset: u64, get_md: Handle, user_ptr: u64) -> PtlResult<XiHandle> {
        self.submit(OperationParams { kind: OpKind::Get, target, pt_index, match_bits, remote_offset, length, local_offset, put_md: None, get_md: Some(get_md), ack_req: AckReq::NoAck, hdr_data: 0, atom_op: None, atom_type: None, operand: None, user_ptr })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn atomic(&self, target: ProcessId, pt_index: u32, match_bits: u64, remote_offset: u64, length: u64, local_offset: u64, put_md: Handle, ack_req: AckReq, hdr_data: u64, atom_op: crate::atomic_ops::AtomOp, atom_type: crate::atomic_ops::AtomType, user_ptr: u64) -> PtlResult<XiHandle> {
        self.submit(OperationParams { kind: OpKind::Atomic, target, pt_index, match_bits, remote_offset, length, local_offset, put_md: Some(put_md), get_md: None, ack_req, hdr_data, atom_op: Some(atom_op), atom_type: Some(atom_type), operand: None, user_ptr })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn fetch_atomic(&self, target: ProcessId, pt_index: u32, match_bits: u64, remote_offset: u64, length: u64, local_offset: u64, put_md: Handle, get_md: Handle, hdr_data: u64, atom_op: crate::atomic_ops::AtomOp, atom_type: crate::atomic_ops::AtomType, user_ptr: u64) -> PtlResult<XiHandle> {
        self.submit(OperationParams { kind: OpKind::FetchAtomic, target, pt_index, match_bits, remote_offset, length, local_offset, put_md: Some(put_md), get_md: Some(get_md), ack_req: AckReq::NoAck, hdr_data, atom_op: Some(atom_op), atom_type: Some(atom_type), operand: None, user_ptr })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn swap(&self, target: ProcessId, pt_index: u32, match_bits: u64, remote_offset: u64, length: u64, local_offset: u64, put_md: Handle, get_md: Handle, hdr_data: u64, atom_op: crate::atomic_ops::AtomOp, atom_type: crate::atomic_ops::AtomType, operand: Vec<u8>, user_ptr: u64) -> PtlResult<XiHandle> {
        self.submit(OperationParams { kind: OpKind::Swap, target, pt_index, match_bits, remote_offset, length, local_offset, put_md: Some(put_md), get_md: Some(get_md), ack_req: AckReq::NoAck, hdr_data, atom_op: Some(atom_op), atom_type: Some(atom_type), operand: Some(operand), user_ptr })
    }

    /// `TriggeredPut`/`Get`/`Atomic`/`FetchAtomic`/`Swap` (spec §6): defer
    /// `params` behind `ct`'s threshold. Returns an id `CTCancelTriggered`
    /// can later reference (meaningless once the op has already fired).
    pub fn triggered_submit(&self, ct: Handle, threshold: u64, params: OperationParams) -> PtlResult<u64> {
        let (id, fired) = self.cts.with(ct, |c| c.add_triggered(threshold, TriggeredAction::Submit(params)))?;
        if let Some(action) = fired {
            self.dispatch_triggered(vec![action]);
        }
        Ok(id)
    }

    pub fn triggered_ct_set(&self, ct: Handle, threshold: u64, target: Handle, value: CtEvent) -> PtlResult<u64> {
        let (id, fired) = self.cts.with(ct, |c| c.add_triggered(threshold, TriggeredAction::CtSet(target, value)))?;
        if let Some(action) = fired {
            self.dispatch_triggered(vec![action]);
        }
        Ok(id)
    }

    pub fn triggered_ct_inc(&self, ct: Handle, threshold: u64, target: Handle, delta: CtEvent) -> PtlResult<u64> {
        let (id, fired) = self.cts.with(ct, |c| c.add_triggered(threshold, TriggeredAction::CtInc(target, delta)))?;
        if let Some(action) = fired {
            self.dispatch_triggered(vec![action]);
        }
        Ok(id)
    }

    /// `CTCancelTriggered` (spec §6).
    pub fn ct_cancel_triggered(&self, ct: Handle, triggered_id: u64) -> PtlResult<bool> {
        self.cts.with(ct, |c| c.cancel_triggered(triggered_id))
    }

    /// `CTPoll` (spec §6): block until any of `cts` reaches its paired
    /// threshold; returns the winning index and the CT's value at that time.
    pub fn ct_poll(&self, cts: &[(Handle, u64)]) -> PtlResult<(usize, CtEvent)> {
        if cts.is_empty() {
            return Err(PtlError::ArgInvalid);
        }
        loop {
            for (i, &(h, threshold)) in cts.iter().enumerate() {
                let value = self.cts.with(h, |c| c.get())?;
                if value.total() >= threshold {
                    return Ok((i, value));
                }
            }
            std::thread::yield_now();
        }
    }

    /// `EQPoll` (spec §6): block until any of `eqs` has an event ready;
    /// returns the winning index and the event.
    pub fn eq_poll(&self, eqs: &[Handle]) -> PtlResult<(usize, crate::eq::Event)> {
        if eqs.is_empty() {
            return Err(PtlError::ArgInvalid);
        }
        loop {
            for (i, &h) in eqs.iter().enumerate() {
                if let Ok(Ok(event)) = self.eqs.with(h, |q| q.get()) {
                    return Ok((i, event));
                }
            }
            std::thread::yield_now();
        }
    }

    // -- progress -------------------------------------------------------

    pub fn transport(&self) -> &dyn Transport {
        &*self.transport
    }

    /// Pull one buffer from the shared pool, used by the progress engine's
    /// repost step.
    pub(crate) fn acquire_buf(&self, tag: BufTag) -> Option<crate::buf::Buf> {
        self.bufs.lock().unwrap().acquire(tag)
    }

    /// One pass of the progress engine (spec §4.8), driven externally by
    /// [`crate::progress::ProgressEngine`].
    pub(crate) fn dispatch_completion(&self, completion: crate::transport::Completion) {
        use crate::transport::CompletionStatus;
        match (completion.kind, completion.status) {
            (CompletionKind::SendComplete, CompletionStatus::Ok) => self.on_send_complete(completion.buf),
            (CompletionKind::SendComplete, CompletionStatus::Failed) => self.on_send_failed(completion.buf),
            (CompletionKind::RecvComplete, CompletionStatus::Ok) => self.on_recv_complete(completion.buf),
            (CompletionKind::RecvComplete, CompletionStatus::Failed) => {
                self.num_recv_drops.fetch_add(1, Ordering::Relaxed);
                self.bufs.lock().unwrap().release(completion.buf);
            }
        }
    }

    fn on_send_complete(&self, buf: crate::buf::Buf) {
        let header = match Header::decode(buf.header()) {
            Ok(h) => h,
            Err(_) => return,
        };
        let handle = Handle { index: header.hdr_handle, generation: 0 };
        if let Some(xi_handle) = self.xis_handle_for(handle) {
            let put_md = self.xis.with(xi_handle, |xi| xi.params.put_md).ok().flatten();
            let md_snapshot = put_md.and_then(|h| self.mds.with(h, md_snapshot).ok());
            let outcome = self.xis.with_mut(xi_handle, |xi| initiator::on_send_complete(xi, md_snapshot.as_ref()));
            if let Ok(outcome) = outcome {
                self.deliver_initiator_outcome(put_md, outcome);
            }

            // A Put/Atomic submitted with ack_req == NoAck never produces a
            // response packet (spec §4.5 "if ack_req == NoAck and the
            // request succeeded, no ack is sent") — nothing will ever drive
            // this XI through `handle_response`, so reclaim it here instead
            // of leaking it for the NI's lifetime. Get/FetchAtomic/Swap
            // always get a reply regardless of ack_req.
            let (ack_req, has_data_in) = self
                .xis
                .with(xi_handle, |xi| (xi.params.ack_req, xi.params.kind.has_data_in()))
                .unwrap_or((AckReq::NoAck, true));
            if ack_req == AckReq::NoAck && !has_data_in {
                if let Some(put_md) = put_md {
                    let _ = self.mds.with_mut(put_md, |md| md.in_flight = md.in_flight.saturating_sub(1));
                }
                let _ = self.xis.release(xi_handle);
            }
        }

        self.bufs.lock().unwrap().release(buf);
    }

    /// A posted send never left the wire (spec §7 "Delivery errors"):
    /// drive the owning XI through `on_delivery_failure` instead of the
    /// normal `on_send_complete`/`on_response` pair.
    fn on_send_failed(&self, buf: crate::buf::Buf) {
        let header = match Header::decode(buf.header()) {
            Ok(h) => h,
            Err(_) => {
                self.bufs.lock().unwrap().release(buf);
                return;
            }
        };
        let handle = Handle { index: header.hdr_handle, generation: 0 };
        if let Some(xi_handle) = self.xis_handle_for(handle) {
            let put_md = self.xis.with(xi_handle, |xi| xi.params.put_md).ok().flatten();
            let md_snapshot = put_md.and_then(|h| self.mds.with(h, md_snapshot).ok());
            let outcome = self.xis.with_mut(xi_handle, |xi| initiator::on_delivery_failure(xi, PtlError::NiUndeliverable, md_snapshot.as_ref()));
            if let Ok(outcome) = outcome {
                self.deliver_initiator_outcome(put_md, outcome);
            }
            if let Some(put_md) = put_md {
                let _ = self.mds.with_mut(put_md, |md| md.in_flight = md.in_flight.saturating_sub(1));
            }
            let _ = self.xis.release(xi_handle);
        }

        self.bufs.lock().unwrap().release(buf);
    }

    fn on_recv_complete(&self, mut buf: crate::buf::Buf) {
        let header = match Header::decode(buf.header()) {
            Ok(h) => h,
            Err(_) => {
                self.num_recv_drops.fetch_add(1, Ordering::Relaxed);
                self.bufs.lock().unwrap().release(buf);
                return;
            }
        };

        let op = match WireOp::from_u8(header.operation) {
            Some(op) => op,
            None => {
                self.num_recv_drops.fetch_add(1, Ordering::Relaxed);
                self.bufs.lock().unwrap().release(buf);
                return;
            }
        };

        if op.is_request() {
            self.handle_inbound_request(&header, buf.payload());
        } else {
            self.handle_response(&header, buf.payload());
        }

        buf.length = 0;
        self.bufs.lock().unwrap().release(buf);
    }

    fn handle_inbound_request(&self, header: &Header, payload: &[u8]) {
        let source = ProcessId::new(header.src_nid, header.src_pid);
        let outcome = match self.with_pt(header.pt_index, |pt| {
            target::process_request(pt, &self.entries, source, u32::MAX, header, payload)
        }) {
            Ok(o) => o,
            Err(e) => {
                warn!(error = ?e, "request referenced an unknown PT index");
                return;
            }
        };

        if let Some(event) = outcome.target_event {
            if let Ok(Some(eq)) = self.with_pt(header.pt_index, |pt| pt.eq) {
                let _ = self.eqs.with(eq, |q| q.enqueue(event));
            }
        }
        if let Some(event) = outcome.overflow_event {
            if let Ok(Some(eq)) = self.with_pt(header.pt_index, |pt| pt.eq) {
                let _ = self.eqs.with(eq, |q| q.enqueue(event));
            }
        }

        if header.ack_req == AckReq::NoAck as u8 && outcome.ni_fail.is_none() {
            return;
        }

        let mut reply_header = *header;
        reply_header.operation = outcome.response_op as u8;
        reply_header.src_nid = self.id.nid;
        reply_header.src_pid = self.id.pid;
        reply_header.length = outcome.response_payload.len() as u64;
        reply_header.nack = outcome.ni_fail.map(crate::wire::ni_fail_to_wire).unwrap_or(0);

        let mut buf = match self.bufs.lock().unwrap().acquire(BufTag::Tgt) {
            Some(b) => b,
            None => return,
        };
        reply_header.encode(buf.header_mut());
        buf.payload_mut()[..outcome.response_payload.len()].copy_from_slice(&outcome.response_payload);
        buf.length = outcome.response_payload.len();
        let _ = self.transport.send(buf, source, true);
    }

    fn handle_response(&self, header: &Header, payload: &[u8]) {
        let xi_handle = Handle { index: header.hdr_handle, generation: 0 };
        let xi_handle = match self.xis_handle_for(xi_handle) {
            Some(h) => h,
            None => return,
        };

        let (get_md, local_offset, has_data_in) = self
            .xis
            .with(xi_handle, |xi| (xi.params.get_md, xi.params.local_offset, xi.params.kind.has_data_in()))
            .unwrap_or((None, 0, false));
        if let Some(get_md) = get_md {
            let _ = self.mds.with_mut(get_md, |md| {
                let mut slices = md.region.as_slices_mut();
                let _ = crate::iovec::copy_in(payload, &mut slices, local_offset, payload.len() as u64);
            });
        }

        let put_md = self.xis.with(xi_handle, |xi| xi.params.put_md).ok().flatten();
        // Events/CT deltas for a reply (Get/FetchAtomic/Swap) belong to the
        // get_md's EQ/CT, the MD actually receiving the data; an ack
        // (Put/Atomic) has no get_md so put_md carries them instead.
        let event_md = if has_data_in { get_md } else { put_md };
        let md_snapshot = event_md.and_then(|h| self.mds.with(h, md_snapshot).ok());
        let ni_fail = crate::wire::wire_to_ni_fail(header.nack);
        let outcome = self.xis.with_mut(xi_handle, |xi| initiator::on_response(xi, header, md_snapshot.as_ref(), ni_fail));
        if let Ok(outcome) = outcome {
            self.deliver_initiator_outcome(event_md, outcome);
        }

        if let Some(put_md) = put_md {
            let _ = self.mds.with_mut(put_md, |md| md.in_flight = md.in_flight.saturating_sub(1));
        }
        let _ = self.xis.release(xi_handle);
    }

    fn deliver_initiator_outcome(&self, event_md: Option<Handle>, outcome: initiator::Outcome) {
        if let (Some(event), Some(md)) = (outcome.event, event_md) {
            if let Ok(Some(eq)) = self.mds.with(md, |m| m.eq) {
                let _ = self.eqs.with(eq, |q| q.enqueue(event));
            }
        }
        if let (Some(delta), Some(md)) = (outcome.ct_delta, event_md) {
            if let Ok(Some(ct)) = self.mds.with(md, |m| m.ct) {
                let _ = self.ct_inc(ct, delta);
            }
        }
    }

    /// Resolve a wire `hdr_handle` (index only, no generation) back to the
    /// live `Xi` handle, if any XI with that index is still outstanding.
    fn xis_handle_for(&self, by_index: Handle) -> Option<Handle> {
        let mut found = None;
        self.xis.for_each(|handle, _| {
            if handle.index == by_index.index {
                found = Some(handle);
            }
        });
        found
    }
}

fn md_snapshot(md: &Md) -> Md {
    Md::new(
        match &md.region {
            crate::md::MdRegion::Contiguous(v) => crate::md::MdRegion::Contiguous(v.clone()),
            crate::md::MdRegion::Iovec(v) => crate::md::MdRegion::Iovec(v.clone()),
        },
        md.eq,
        md.ct,
        md.options,
    )
}
