//! NEMESIS lock-free single-consumer, multi-producer queue (spec §4.9).
//!
//! Enqueue CAS-swaps the tail pointer; if the previous tail was null the new
//! node is published straight into `head`, otherwise it's linked from the
//! previous tail's `next`. Dequeue reads `head`; if `head.next` is null it
//! CASes `tail` from `head` back to null to detect the single-element case.
//! Only one thread may ever call `pop` — the data-race-unsafety of a second
//! consumer is exactly why this is a single-consumer design, not MPMC.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: Option<T>,
}

pub struct Nemesis<T> {
    head: AtomicPtr<Node<T>>,
    tail: AtomicPtr<Node<T>>,
}

unsafe impl<T: Send> Send for Nemesis<T> {}
unsafe impl<T: Send> Sync for Nemesis<T> {}

impl<T> Nemesis<T> {
    pub fn new() -> Self {
        Nemesis { head: AtomicPtr::new(ptr::null_mut()), tail: AtomicPtr::new(ptr::null_mut()) }
    }

    /// Producer side; safe to call from any number of threads concurrently.
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node { next: AtomicPtr::new(ptr::null_mut()), value: Some(value) }));
        let prev = self.tail.swap(node, Ordering::AcqRel);
        if prev.is_null() {
            self.head.store(node, Ordering::Release);
        } else {
            unsafe { (*prev).next.store(node, Ordering::Release) };
        }
    }

    /// Consumer side. Caller MUST guarantee only one thread ever calls this
    /// for a given queue (spec §4.9 "Dequeue is called from one thread only").
    pub fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Acquire);
        if head.is_null() {
            return None;
        }

        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        if !next.is_null() {
            self.head.store(next, Ordering::Release);
            let node = unsafe { Box::from_raw(head) };
            return node.value;
        }

        if self
            .tail
            .compare_exchange(head, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.head.store(ptr::null_mut(), Ordering::Release);
            let node = unsafe { Box::from_raw(head) };
            return node.value;
        }

        // A concurrent push published a new tail but hasn't linked `next`
        // yet; spin for the handful of cycles until it becomes visible.
        loop {
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            if !next.is_null() {
                self.head.store(next, Ordering::Release);
                let node = unsafe { Box::from_raw(head) };
                return node.value;
            }
            std::hint::spin_loop();
        }
    }
}

impl<T> Default for Nemesis<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Nemesis<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

/// Ordered variant (spec §4.9): each entry carries a monotonic sequence
/// number; a push whose sequence does not exceed the last accepted one is
/// rejected rather than silently reordering the queue — used to preserve
/// send order when multiple senders interleave on the same destination.
pub struct OrderedNemesis<T> {
    queue: Nemesis<(u64, T)>,
    last_seq: AtomicU64,
}

impl<T> OrderedNemesis<T> {
    pub fn new() -> Self {
        OrderedNemesis { queue: Nemesis::new(), last_seq: AtomicU64::new(0) }
    }

    /// Returns `false` (and does not enqueue) if `seq` is not strictly
    /// greater than the highest sequence accepted so far.
    pub fn push(&self, seq: u64, value: T) -> bool {
        let mut cur = self.last_seq.load(Ordering::Acquire);
        loop {
            if seq <= cur {
                return false;
            }
            match self
                .last_seq
                .compare_exchange_weak(cur, seq, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        self.queue.push((seq, value));
        true
    }

    pub fn pop(&self) -> Option<(u64, T)> {
        self.queue.pop()
    }
}

impl<T> Default for OrderedNemesis<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Default frustration threshold before a blocked consumer is woken via the
/// condition variable rather than found by its own spin (spec §11 ambient
/// supplement, taken from the reference's `> 1000` check).
pub const DEFAULT_FRUSTRATION_THRESHOLD: u32 = 1000;

/// Blocking overlay on [`Nemesis`]: a producer only pays for a
/// `Condvar::notify_one` once enough pushes have accumulated without the
/// consumer catching up (spec §4.9 "signals only when it exceeds a bounded
/// spin threshold").
pub struct BlockingNemesis<T> {
    queue: Nemesis<T>,
    mutex: Mutex<()>,
    cv: Condvar,
    frustration: AtomicU32,
    threshold: u32,
}

impl<T> BlockingNemesis<T> {
    pub fn new(threshold: u32) -> Self {
        BlockingNemesis {
            queue: Nemesis::new(),
            mutex: Mutex::new(()),
            cv: Condvar::new(),
            frustration: AtomicU32::new(0),
            threshold,
        }
    }

    pub fn push(&self, value: T) {
        self.queue.push(value);
        let count = self.frustration.fetch_add(1, Ordering::Relaxed) + 1;
        if count > self.threshold {
            self.frustration.store(0, Ordering::Relaxed);
            let _guard = self.mutex.lock().unwrap();
            self.cv.notify_one();
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let v = self.queue.pop();
        if v.is_some() {
            self.frustration.store(0, Ordering::Relaxed);
        }
        v
    }

    /// Spin briefly, then park on the condvar with a bounded timeout so a
    /// missed wakeup (push landed just before we locked the mutex) can't
    /// stall the consumer forever.
    pub fn pop_blocking(&self) -> T {
        loop {
            if let Some(v) = self.try_pop() {
                return v;
            }
            let guard = self.mutex.lock().unwrap();
            if let Some(v) = self.try_pop() {
                return v;
            }
            let _ = self.cv.wait_timeout(guard, Duration::from_millis(1));
        }
    }
}

impl<T> Default for BlockingNemesis<T> {
    fn default() -> Self {
        Self::new(DEFAULT_FRUSTRATION_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_single_producer() {
        let q = Nemesis::new();
        for i in 0..100 {
            q.push(i);
        }
        for i in 0..100 {
            assert_eq!(q.pop(), Some(i));
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn per_producer_fifo_with_concurrent_producers() {
        let q = Arc::new(Nemesis::new());
        let mut handles = Vec::new();
        for p in 0..4 {
            let q = q.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    q.push((p, i));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut last = [None; 4];
        let mut count = 0;
        while let Some((p, i)) = q.pop() {
            if let Some(prev) = last[p] {
                assert!(i > prev, "producer {p} FIFO violated: {prev} then {i}");
            }
            last[p] = Some(i);
            count += 1;
        }
        assert_eq!(count, 4000);
    }

    #[test]
    fn ordered_rejects_non_monotonic() {
        let q: OrderedNemesis<&str> = OrderedNemesis::new();
        assert!(q.push(1, "a"));
        assert!(q.push(2, "b"));
        assert!(!q.push(2, "stale"));
        assert_eq!(q.pop().unwrap().1, "a");
        assert_eq!(q.pop().unwrap().1, "b");
    }

    #[test]
    fn blocking_wakes_consumer() {
        let q = Arc::new(BlockingNemesis::new(2));
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                q.push(42);
            })
        };
        assert_eq!(q.pop_blocking(), 42);
        producer.join().unwrap();
    }
}
