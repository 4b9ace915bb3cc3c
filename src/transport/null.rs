//! In-process loopback transport (spec §9: "a `NullTransport` for tests").
//!
//! Ships unconditionally, not only under `cfg(test)`: a single-process NI
//! addressing only itself (the common case for driving the state machines
//! without a real fabric) has no other way to move bytes between its own
//! initiator and target sides.

use std::collections::VecDeque;
use std::sync::Mutex;

use super::{Completion, CompletionKind, CompletionStatus, Transport};
use crate::buf::Buf;
use crate::error::PtlResult;
use crate::identifiers::ProcessId;

fn deliver_packet(buf: &mut Buf, packet: &[u8]) {
    let len = packet.len().min(buf.data.len());
    buf.data[..len].copy_from_slice(&packet[..len]);
    buf.length = len.saturating_sub(crate::wire::HEADER_LEN);
}

struct Inner {
    /// Recv buffers posted by the target side, awaiting a packet.
    posted: VecDeque<Buf>,
    /// Packet bytes that arrived before any recv buffer was posted for them.
    pending_data: VecDeque<Vec<u8>>,
    completions: VecDeque<Completion>,
}

pub struct NullTransport {
    inner: Mutex<Inner>,
}

impl NullTransport {
    pub fn new() -> Self {
        NullTransport {
            inner: Mutex::new(Inner {
                posted: VecDeque::new(),
                pending_data: VecDeque::new(),
                completions: VecDeque::new(),
            }),
        }
    }
}

impl Default for NullTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for NullTransport {
    fn post_recv(&self, mut buf: Buf) -> PtlResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(packet) = inner.pending_data.pop_front() {
            deliver_packet(&mut buf, &packet);
            inner.completions.push_back(Completion { buf, kind: CompletionKind::RecvComplete, status: CompletionStatus::Ok });
        } else {
            inner.posted.push_back(buf);
        }
        Ok(())
    }

    fn send(&self, buf: Buf, _dest: ProcessId, _inline_ok: bool) -> PtlResult<()> {
        let mut inner = self.inner.lock().unwrap();
        // The whole wire packet — header and payload — travels as one unit;
        // `Buf::length` tracks only the payload portion.
        let packet = buf.data[..crate::wire::HEADER_LEN + buf.length].to_vec();

        if let Some(mut recv_buf) = inner.posted.pop_front() {
            deliver_packet(&mut recv_buf, &packet);
            inner.completions.push_back(Completion { buf: recv_buf, kind: CompletionKind::RecvComplete, status: CompletionStatus::Ok });
        } else {
            inner.pending_data.push_back(packet);
        }

        inner.completions.push_back(Completion { buf, kind: CompletionKind::SendComplete, status: CompletionStatus::Ok });
        Ok(())
    }

    fn poll(&self) -> Vec<Completion> {
        let mut inner = self.inner.lock().unwrap();
        inner.completions.drain(..).collect()
    }

    fn posted_recv_count(&self) -> usize {
        self.inner.lock().unwrap().posted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::BufTag;

    fn make_buf(payload: &[u8]) -> Buf {
        let mut pool = crate::buf::BufPool::new(1, 256);
        let mut buf = pool.acquire(BufTag::Send).unwrap();
        buf.payload_mut()[..payload.len()].copy_from_slice(payload);
        buf.length = payload.len();
        buf
    }

    #[test]
    fn send_before_post_recv_is_buffered() {
        let t = NullTransport::new();
        t.send(make_buf(b"hello"), ProcessId::new(0, 0), true).unwrap();
        let completions = t.poll();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].kind, CompletionKind::SendComplete);

        let mut pool = crate::buf::BufPool::new(1, 256);
        t.post_recv(pool.acquire(BufTag::Recv).unwrap()).unwrap();
        let completions = t.poll();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].kind, CompletionKind::RecvComplete);
        assert_eq!(&completions[0].buf.payload()[..5], b"hello");
    }

    #[test]
    fn post_recv_before_send_delivers_immediately() {
        let t = NullTransport::new();
        let mut pool = crate::buf::BufPool::new(1, 256);
        t.post_recv(pool.acquire(BufTag::Recv).unwrap()).unwrap();
        t.send(make_buf(b"hi"), ProcessId::new(0, 0), true).unwrap();

        let completions = t.poll();
        assert_eq!(completions.len(), 2);
        assert!(completions.iter().any(|c| c.kind == CompletionKind::SendComplete));
        assert!(completions.iter().any(|c| c.kind == CompletionKind::RecvComplete));
    }
}
