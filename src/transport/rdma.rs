//! RDMA transport (spec §4.3 backend).
//!
//! The concrete fabric driver — queue-pair/SRQ management, connection
//! setup via an out-of-band event stream — is an external collaborator per
//! spec §1, accessed only through [`RdmaQueuePair`]. `RdmaTransport` adapts
//! any implementor of that contract to [`super::Transport`]; it owns no
//! fabric state of its own beyond the connect retry budget (spec §7
//! "Transport errors... retried inside C3 up to a bounded retry count").

use std::sync::atomic::{AtomicU32, Ordering};

use super::{Completion, Transport};
use crate::buf::Buf;
use crate::error::PtlResult;
use crate::identifiers::ProcessId;

/// A connected RDMA queue-pair (plus its shared receive queue), as a
/// contract the concrete fabric driver must satisfy. One instance per peer,
/// matching the reference's "one queue-pair per connected peer + SRQ"
/// (spec §4.3).
pub trait RdmaQueuePair: Send + Sync {
    /// Post `buf` to the receive queue.
    fn post_recv(&self, buf: Buf) -> PtlResult<()>;

    /// Post a send work request for `buf`, inlined when `inline_ok` and the
    /// payload fits the queue pair's inline threshold.
    fn post_send(&self, buf: Buf, inline_ok: bool) -> PtlResult<()>;

    /// Harvest completions from this queue pair's completion queue.
    fn poll_cq(&self) -> Vec<Completion>;

    fn posted_recv_count(&self) -> usize;

    /// Whether the peer is still reachable, per spec §7's propagation rule
    /// ("a failure is local... if and only if the transport says the peer
    /// is still reachable").
    fn peer_reachable(&self) -> bool;
}

/// Bounded retry count for addr-resolve/route-resolve/connect (spec §7).
pub const CONNECT_RETRY_LIMIT: u32 = 3;

pub struct RdmaTransport<Q: RdmaQueuePair> {
    qp: Q,
    connect_attempts: AtomicU32,
}

impl<Q: RdmaQueuePair> RdmaTransport<Q> {
    pub fn new(qp: Q) -> Self {
        RdmaTransport { qp, connect_attempts: AtomicU32::new(0) }
    }

    /// Record one failed connect/resolve attempt; returns `true` while more
    /// retries remain inside C3 before the caller must surface
    /// `NI_UNDELIVERABLE` (spec §7).
    pub fn note_connect_failure(&self) -> bool {
        let attempts = self.connect_attempts.fetch_add(1, Ordering::AcqRel) + 1;
        attempts < CONNECT_RETRY_LIMIT
    }

    pub fn note_connect_success(&self) {
        self.connect_attempts.store(0, Ordering::Release);
    }
}

impl<Q: RdmaQueuePair> Transport for RdmaTransport<Q> {
    fn post_recv(&self, buf: Buf) -> PtlResult<()> {
        self.qp.post_recv(buf)
    }

    fn send(&self, buf: Buf, _dest: ProcessId, inline_ok: bool) -> PtlResult<()> {
        self.qp.post_send(buf, inline_ok)
    }

    fn poll(&self) -> Vec<Completion> {
        self.qp.poll_cq()
    }

    fn posted_recv_count(&self) -> usize {
        self.qp.posted_recv_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeQp {
        posted: Mutex<Vec<Buf>>,
        reachable: bool,
    }

    impl RdmaQueuePair for FakeQp {
        fn post_recv(&self, buf: Buf) -> PtlResult<()> {
            self.posted.lock().unwrap().push(buf);
            Ok(())
        }

        fn post_send(&self, buf: Buf, _inline_ok: bool) -> PtlResult<()> {
            Ok(drop(buf))
        }

        fn poll_cq(&self) -> Vec<Completion> {
            Vec::new()
        }

        fn posted_recv_count(&self) -> usize {
            self.posted.lock().unwrap().len()
        }

        fn peer_reachable(&self) -> bool {
            self.reachable
        }
    }

    #[test]
    fn retry_budget_exhausts_after_three_failures() {
        let t = RdmaTransport::new(FakeQp { posted: Mutex::new(Vec::new()), reachable: false });
        assert!(t.note_connect_failure());
        assert!(t.note_connect_failure());
        assert!(!t.note_connect_failure());
    }

    #[test]
    fn success_resets_budget() {
        let t = RdmaTransport::new(FakeQp { posted: Mutex::new(Vec::new()), reachable: true });
        t.note_connect_failure();
        t.note_connect_success();
        assert!(t.note_connect_failure());
    }
}
