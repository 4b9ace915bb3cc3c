//! Shared-memory transport (spec §4.3 backend, detail in §4.9).
//!
//! The concrete cross-process shared-memory segment (`portals4_comm_pad`,
//! spec §6) and its setup are an external collaborator per spec §1 — out of
//! scope here. What's in scope is the NEMESIS queue discipline itself
//! (§4.9): one [`BlockingNemesis`] ring per receiver, fed by any number of
//! producer threads/processes once they hold a reference to it.

use std::sync::Arc;

use super::{Completion, CompletionKind, CompletionStatus, Transport};
use crate::buf::{Buf, BufTag};
use crate::error::PtlResult;
use crate::identifiers::ProcessId;
use crate::nemesis::BlockingNemesis;
use crate::wire::HEADER_LEN;

/// One packet's worth of bytes queued for a receiver: header and payload
/// together, exactly as they travel on the wire.
struct Packet {
    data: Vec<u8>,
}

pub struct ShmemTransport {
    /// This receiver's inbound queue; producers elsewhere hold a clone of
    /// the same `Arc` (e.g. handed out by whatever sets up the comm pad).
    inbound: Arc<BlockingNemesis<Packet>>,
    posted: std::sync::Mutex<std::collections::VecDeque<Buf>>,
    send_done: std::sync::Mutex<Vec<Buf>>,
}

impl ShmemTransport {
    pub fn new(inbound: Arc<BlockingNemesis<Packet>>) -> Self {
        ShmemTransport {
            inbound,
            posted: std::sync::Mutex::new(std::collections::VecDeque::new()),
            send_done: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// A fresh, unconnected pair of queues for loopback/unit-test wiring;
    /// real deployments instead resolve each peer's queue out of the shared
    /// comm pad (out of scope here, per spec §1).
    pub fn new_endpoint() -> Arc<BlockingNemesis<Packet>> {
        Arc::new(BlockingNemesis::default())
    }

    /// The queue peers must push onto to deliver a packet to this receiver.
    pub fn inbound_handle(&self) -> Arc<BlockingNemesis<Packet>> {
        self.inbound.clone()
    }
}

impl Transport for ShmemTransport {
    fn post_recv(&self, buf: Buf) -> PtlResult<()> {
        self.posted.lock().unwrap().push_back(buf);
        Ok(())
    }

    fn send(&self, buf: Buf, _dest: ProcessId, _inline_ok: bool) -> PtlResult<()> {
        let data = buf.data[..HEADER_LEN + buf.length].to_vec();
        self.inbound.push(Packet { data });
        self.send_done.lock().unwrap().push(buf);
        Ok(())
    }

    fn poll(&self) -> Vec<Completion> {
        let mut out = Vec::new();
        for buf in self.send_done.lock().unwrap().drain(..) {
            out.push(Completion { buf, kind: CompletionKind::SendComplete, status: CompletionStatus::Ok });
        }

        while let Some(mut recv_buf) = {
            let has_packet = {
                let posted = self.posted.lock().unwrap();
                !posted.is_empty()
            };
            if has_packet { self.posted.lock().unwrap().pop_front() } else { None }
        } {
            match self.inbound.try_pop() {
                Some(packet) => {
                    let len = packet.data.len().min(recv_buf.data.len());
                    recv_buf.data[..len].copy_from_slice(&packet.data[..len]);
                    recv_buf.length = len.saturating_sub(HEADER_LEN);
                    out.push(Completion { buf: recv_buf, kind: CompletionKind::RecvComplete, status: CompletionStatus::Ok });
                }
                None => {
                    self.posted.lock().unwrap().push_front(recv_buf);
                    break;
                }
            }
        }

        out
    }

    fn posted_recv_count(&self) -> usize {
        self.posted.lock().unwrap().len()
    }
}
