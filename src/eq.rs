//! Event queues (spec §4.7 "EQ").
//!
//! A bounded single-consumer ring. `get`/`wait`/`poll` drain it; on overflow
//! a single `EQ_DROPPED` sentinel event is appended behind the `capacity`
//! events already buffered (the ring reserves one extra slot for exactly
//! this), and further enqueues are silently swallowed (counted) until the
//! consumer drains the sentinel, exactly as spec §4.7 mandates: every
//! already-buffered event survives and drains before the sentinel does.

use std::sync::{Condvar, Mutex};

use crate::error::{NiFail, PtlError, PtlResult};
use crate::identifiers::ProcessId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Send,
    Ack,
    Reply,
    Put,
    Get,
    Atomic,
    FetchAtomic,
    PutOverflow,
    GetOverflow,
    AtomicOverflow,
    FetchAtomicOverflow,
    AutoUnlink,
    AutoFree,
    Link,
    PtDisabled,
    Search,
    Dropped,
}

#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub kind: EventKind,
    pub ni_fail: NiFail,
    pub pt_index: u32,
    pub match_bits: u64,
    /// Length matched against the local region (truncated length).
    pub mlength: u64,
    /// Length requested by the remote operation.
    pub rlength: u64,
    pub remote_offset: u64,
    pub hdr_data: u64,
    pub user_ptr: u64,
    pub initiator: Option<ProcessId>,
    /// Only meaningful on `Dropped`: number of events lost.
    pub lost: u64,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Event {
            kind,
            ni_fail: None,
            pt_index: 0,
            match_bits: 0,
            mlength: 0,
            rlength: 0,
            remote_offset: 0,
            hdr_data: 0,
            user_ptr: 0,
            initiator: None,
            lost: 0,
        }
    }
}

struct Inner {
    ring: Vec<Option<Event>>,
    head: usize,
    len: usize,
    /// Index of a pending `Dropped` sentinel already occupying a ring slot,
    /// still accumulating `lost` as further enqueues are swallowed.
    dropped_slot: Option<usize>,
    shutting_down: bool,
}

pub struct Eq {
    capacity: usize,
    inner: Mutex<Inner>,
    cv: Condvar,
}

impl Eq {
    pub fn new(capacity: usize) -> Self {
        Eq {
            capacity,
            // One extra slot reserved for the `Dropped` sentinel, so an
            // overflow never has to evict one of the `capacity` events
            // already buffered.
            inner: Mutex::new(Inner {
                ring: vec![None; capacity + 1],
                head: 0,
                len: 0,
                dropped_slot: None,
                shutting_down: false,
            }),
            cv: Condvar::new(),
        }
    }

    fn tail_index(inner: &Inner) -> usize {
        (inner.head + inner.len) % inner.ring.len()
    }

    /// Enqueue one event (called from C5/C6/C7 delivery paths). Never
    /// blocks; on overflow, converts to (or extends) a `Dropped` sentinel.
    pub fn enqueue(&self, event: Event) {
        let mut inner = self.inner.lock().unwrap();
        if inner.dropped_slot.is_some() {
            // Sentinel already pending: this event is the one that overflows.
            let slot = inner.dropped_slot.unwrap();
            if let Some(e) = inner.ring[slot].as_mut() {
                e.lost += 1;
            }
            self.cv.notify_all();
            return;
        }

        if inner.len == self.capacity {
            // All `capacity` real slots are full: this event overflows.
            // Append the sentinel into the reserved extra slot at the tail
            // instead of evicting anything, so the `capacity` events already
            // buffered all survive and drain ahead of it.
            let slot = Self::tail_index(&inner);
            let mut dropped = Event::new(EventKind::Dropped);
            dropped.lost = 1;
            inner.ring[slot] = Some(dropped);
            inner.len += 1;
            inner.dropped_slot = Some(slot);
            self.cv.notify_all();
            return;
        }

        let slot = Self::tail_index(&inner);
        inner.ring[slot] = Some(event);
        inner.len += 1;
        self.cv.notify_all();
    }

    fn take_front(inner: &mut Inner) -> Option<Event> {
        if inner.len == 0 {
            return None;
        }
        let head = inner.head;
        let event = inner.ring[head].take();
        if inner.dropped_slot == Some(head) {
            inner.dropped_slot = None;
        }
        inner.head = (head + 1) % inner.ring.len();
        inner.len -= 1;
        event
    }

    /// Non-blocking `eq_get` (spec §4.7).
    pub fn get(&self) -> PtlResult<Event> {
        let mut inner = self.inner.lock().unwrap();
        Self::take_front(&mut inner).ok_or(PtlError::EqEmpty)
    }

    /// Blocking `eq_wait`; returns `Interrupted` once the NI starts shutdown.
    pub fn wait(&self) -> PtlResult<Event> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(event) = Self::take_front(&mut inner) {
                return Ok(event);
            }
            if inner.shutting_down {
                return Err(PtlError::Interrupted);
            }
            inner = self.cv.wait(inner).unwrap();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wake every waiter with `Interrupted` (spec §5 "NI teardown... wakes
    /// all waiters").
    pub fn shutdown(&self) {
        self.inner.lock().unwrap().shutting_down = true;
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_reports_dropped_with_lost_count() {
        let eq = Eq::new(4);
        for _ in 0..6 {
            eq.enqueue(Event::new(EventKind::Put));
        }
        for _ in 0..4 {
            let e = eq.get().unwrap();
            assert_eq!(e.kind, EventKind::Put);
        }
        let e = eq.get().unwrap();
        assert_eq!(e.kind, EventKind::Dropped);
        assert_eq!(e.lost, 2);
        assert!(eq.get().is_err());
    }

    #[test]
    fn fifo_order_preserved() {
        let eq = Eq::new(2);
        let mut a = Event::new(EventKind::Send);
        a.user_ptr = 1;
        let mut b = Event::new(EventKind::Ack);
        b.user_ptr = 2;
        eq.enqueue(a);
        eq.enqueue(b);
        assert_eq!(eq.get().unwrap().user_ptr, 1);
        assert_eq!(eq.get().unwrap().user_ptr, 2);
    }
}
