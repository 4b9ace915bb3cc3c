//! Transport abstraction (spec §4.3, C3).
//!
//! Two real backends ([`rdma`], [`shmem`]) plus [`null`], a first-class
//! in-process loopback used both by tests and by a single-process NI that
//! addresses only itself. All three implement the same [`Transport`] trait
//! in place of the reference's `transport.send_message`/`post_recv`
//! function-pointer pair (spec §9 re-architecture guidance).

pub mod null;
pub mod rdma;
pub mod shmem;

use crate::buf::Buf;
use crate::error::PtlResult;
use crate::identifiers::ProcessId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    /// A buffer previously passed to `send` has left the wire.
    SendComplete,
    /// A buffer previously passed to `post_recv` now holds one packet.
    RecvComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Ok,
    Failed,
}

pub struct Completion {
    pub buf: Buf,
    pub kind: CompletionKind,
    pub status: CompletionStatus,
}

/// Uniform send/receive contract over RDMA and shared-memory backends
/// (spec §4.3). Both real backends preserve per-destination FIFO for every
/// packet from a given initiator (spec §5).
pub trait Transport: Send + Sync {
    /// Make `buf` eligible to receive one packet.
    fn post_recv(&self, buf: Buf) -> PtlResult<()>;

    /// Asynchronously deliver `buf.data[0..buf.length]` to `dest`. May
    /// return before network completion; completion is reported by `poll`.
    fn send(&self, buf: Buf, dest: ProcessId, inline_ok: bool) -> PtlResult<()>;

    /// Harvest completions accumulated since the last call.
    fn poll(&self) -> Vec<Completion>;

    /// Receive buffers currently posted and awaiting a packet, used by the
    /// progress engine's repost-threshold check (spec §4.8 step 4).
    fn posted_recv_count(&self) -> usize;
}
