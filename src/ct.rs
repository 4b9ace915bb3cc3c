//! Counting events and triggered operations (spec §4.7 "CT" / "Triggered").
//!
//! A CT holds two monotonically-increasing counters and a list of deferred
//! operations gated on their sum. `inc`/`set` drain any triggered op whose
//! threshold is now satisfied and return it to the caller (`Ni`) to dispatch
//! — keeping this module ignorant of the initiator/PT machinery it feeds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use crate::error::{PtlError, PtlResult};
use crate::handle::Handle;
use crate::op::OperationParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CtEvent {
    pub success: u64,
    pub failure: u64,
}

impl CtEvent {
    pub fn total(self) -> u64 {
        self.success + self.failure
    }
}

/// A deferred action released once its owning CT's total reaches `threshold`
/// (spec §6 `Triggered*` family).
pub enum TriggeredAction {
    Submit(OperationParams),
    CtSet(Handle, CtEvent),
    CtInc(Handle, CtEvent),
}

pub struct TriggeredOp {
    id: u64,
    threshold: u64,
    /// Ensures a triggered op fires at most once even if two concurrent
    /// `inc`/`set` calls both observe the threshold crossed (spec §4.7).
    claimed: AtomicBool,
    action: Mutex<Option<TriggeredAction>>,
}

impl TriggeredOp {
    pub fn new(id: u64, threshold: u64, action: TriggeredAction) -> Self {
        TriggeredOp {
            id,
            threshold,
            claimed: AtomicBool::new(false),
            action: Mutex::new(Some(action)),
        }
    }

    fn try_claim(&self, total: u64) -> Option<TriggeredAction> {
        if total < self.threshold {
            return None;
        }
        if self.claimed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return None;
        }
        self.action.lock().unwrap().take()
    }
}

struct Inner {
    value: CtEvent,
    triggered: Vec<TriggeredOp>,
    next_triggered_id: u64,
    shutting_down: bool,
}

pub struct Ct {
    inner: Mutex<Inner>,
    cv: Condvar,
}

impl Ct {
    pub fn new() -> Self {
        Ct {
            inner: Mutex::new(Inner {
                value: CtEvent::default(),
                triggered: Vec::new(),
                next_triggered_id: 0,
                shutting_down: false,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn get(&self) -> CtEvent {
        self.inner.lock().unwrap().value
    }

    /// `ct_set` (spec §4.7): overwrites the counters, draining any triggered
    /// op the new total now satisfies.
    pub fn set(&self, value: CtEvent) -> Vec<TriggeredAction> {
        let mut inner = self.inner.lock().unwrap();
        inner.value = value;
        let fired = Self::drain_ready(&mut inner);
        self.cv.notify_all();
        fired
    }

    /// `ct_inc` (spec §4.7): atomically adds `delta`.
    pub fn inc(&self, delta: CtEvent) -> Vec<TriggeredAction> {
        let mut inner = self.inner.lock().unwrap();
        inner.value.success += delta.success;
        inner.value.failure += delta.failure;
        let fired = Self::drain_ready(&mut inner);
        self.cv.notify_all();
        fired
    }

    fn drain_ready(inner: &mut Inner) -> Vec<TriggeredAction> {
        let total = inner.value.total();
        let mut fired = Vec::new();
        inner.triggered.retain(|op| {
            match op.try_claim(total) {
                Some(action) => {
                    fired.push(action);
                    false
                }
                None => true,
            }
        });
        fired
    }

    /// Append a triggered op (spec §4.7 "appended to the CT's list under the
    /// CT lock"); fires immediately (returned to the caller) if the current
    /// total already satisfies the threshold. Returns the id a later
    /// `CTCancelTriggered` can reference, alongside any action that already
    /// fired (in which case there is nothing left in the list to cancel).
    pub fn add_triggered(&self, threshold: u64, action: TriggeredAction) -> (u64, Option<TriggeredAction>) {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_triggered_id;
        inner.next_triggered_id += 1;
        let op = TriggeredOp::new(id, threshold, action);
        let total = inner.value.total();
        if let Some(action) = op.try_claim(total) {
            return (id, Some(action));
        }
        inner.triggered.push(op);
        (id, None)
    }

    /// `CTCancelTriggered` (spec §6): withdraw a not-yet-fired triggered op.
    /// Returns `false` if it already fired or never existed.
    pub fn cancel_triggered(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.triggered.len();
        inner.triggered.retain(|op| op.id != id);
        inner.triggered.len() != before
    }

    /// `ct_wait` (spec §4.7): blocks until total ≥ threshold or cancellation.
    pub fn wait(&self, threshold: u64) -> PtlResult<CtEvent> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.value.total() >= threshold {
                return Ok(inner.value);
            }
            if inner.shutting_down {
                return Err(PtlError::Interrupted);
            }
            inner = self.cv.wait(inner).unwrap();
        }
    }

    pub fn shutdown(&self) -> Vec<TriggeredAction> {
        let mut inner = self.inner.lock().unwrap();
        inner.shutting_down = true;
        // Triggered ops pending at teardown are dropped with a failure
        // increment to their CT (spec §5 "Cancellation").
        inner.value.failure += inner.triggered.len() as u64;
        inner.triggered.clear();
        self.cv.notify_all();
        Vec::new()
    }
}

impl Default for Ct {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inc_fires_triggered_op_once() {
        let ct = Ct::new();
        ct.inc(CtEvent { success: 2, failure: 0 });
        assert!(ct
            .add_triggered(5, TriggeredAction::CtInc(Handle { index: 0, generation: 0 }, CtEvent { success: 1, failure: 0 }))
            .1
            .is_none());

        let mut fired_total = 0;
        for _ in 0..3 {
            let fired = ct.inc(CtEvent { success: 1, failure: 0 });
            fired_total += fired.len();
        }
        assert_eq!(fired_total, 1);
        assert_eq!(ct.get().total(), 5);
    }

    #[test]
    fn set_overwrites_and_can_fire_immediately() {
        let ct = Ct::new();
        let (_, fired) = ct.add_triggered(5, TriggeredAction::CtInc(Handle { index: 0, generation: 0 }, CtEvent::default()));
        assert!(fired.is_none());
        ct.set(CtEvent { success: 5, failure: 0 });
        // already past threshold before add_triggered would have fired above;
        // a *new* triggered op added now fires immediately.
        let (_, immediate) = ct.add_triggered(1, TriggeredAction::CtInc(Handle { index: 0, generation: 0 }, CtEvent::default()));
        assert!(immediate.is_some());
    }

    #[test]
    fn wait_blocks_until_threshold() {
        let ct = Ct::new();
        ct.inc(CtEvent { success: 1, failure: 0 });
        assert!(ct.wait(1).is_ok());
    }

    #[test]
    fn cancel_triggered_withdraws_pending_op() {
        let ct = Ct::new();
        let (id, fired) = ct.add_triggered(5, TriggeredAction::CtInc(Handle { index: 0, generation: 0 }, CtEvent::default()));
        assert!(fired.is_none());
        assert!(ct.cancel_triggered(id));
        assert!(!ct.cancel_triggered(id));

        let fired = ct.inc(CtEvent { success: 10, failure: 0 });
        assert!(fired.is_empty());
    }
}
