//! Progress engine (spec §4.8, C8): the loop that drains transport
//! completions into the NI's initiator/target state machines and keeps the
//! receive-buffer pool topped up.
//!
//! Kept the reference's explicit state-name shape so a trace of one
//! iteration reads the same way across implementations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::trace;

use crate::buf::BufTag;
use crate::ni::Ni;

/// One iteration's state, mirrored from the reference's progress loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    SendComp,
    RdmaComp,
    PacketRdma,
    Packet,
    DropBuf,
    Req,
    Init,
    Repost,
    Error,
    Done,
}

/// Drives [`Ni::transport`]'s completion queue. Not `Ni`'s own method since
/// a deployment may run several progress threads/tasks against shared NIs,
/// and polling cadence (spin vs. park) is a deployment choice, not NI state.
pub struct ProgressEngine<'a> {
    ni: &'a Ni,
    repost_threshold: usize,
    running: AtomicBool,
}

impl<'a> ProgressEngine<'a> {
    pub fn new(ni: &'a Ni) -> Self {
        ProgressEngine { ni, repost_threshold: 16, running: AtomicBool::new(true) }
    }

    pub fn with_repost_threshold(mut self, threshold: usize) -> Self {
        self.repost_threshold = threshold;
        self
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// One non-blocking pass: harvest whatever completions are ready,
    /// dispatch each (`Req`/`Packet` paths route through `Ni`), then
    /// replenish posted receive buffers if they fell under threshold
    /// (`Repost`).
    pub fn poll_once(&self) -> RecvState {
        let completions = self.ni.transport().poll();
        if completions.is_empty() {
            trace!(state = ?RecvState::Done, "progress tick: nothing ready");
            self.repost();
            return RecvState::Done;
        }

        for completion in completions {
            let state = match completion.kind {
                crate::transport::CompletionKind::SendComplete => RecvState::SendComp,
                crate::transport::CompletionKind::RecvComplete => RecvState::Packet,
            };
            trace!(?state, "dispatching completion");
            self.ni.dispatch_completion(completion);
        }

        trace!(state = ?RecvState::Repost);
        self.repost();
        RecvState::Done
    }

    /// `REPOST` (spec §4.8 step 4): keep the posted-recv count above
    /// `repost_threshold` so the transport always has buffers to deliver
    /// into.
    fn repost(&self) {
        let transport = self.ni.transport();
        while transport.posted_recv_count() < self.repost_threshold {
            let buf = match self.ni.acquire_buf(BufTag::Recv) {
                Some(b) => b,
                None => break,
            };
            if transport.post_recv(buf).is_err() {
                break;
            }
        }
    }

    /// Run `poll_once` in a loop until [`Self::stop`] is called, sleeping
    /// briefly between empty passes to avoid a pure busy-spin.
    pub fn run(&self) {
        while self.running.load(Ordering::Acquire) {
            if self.poll_once() == RecvState::Done {
                std::thread::sleep(Duration::from_micros(200));
            }
        }
    }
}
