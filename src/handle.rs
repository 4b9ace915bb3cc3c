//! Handle & object pools (spec §4.1, C1).
//!
//! A pool stores homogeneous objects by index, paired with a monotonically
//! incrementing generation per slot. A [`Handle`] is the packed
//! `(index, generation)` tuple; [`Pool::get`] only returns the object when
//! the generation still matches, exactly as §4.1 specifies. This is the
//! "arena + generation-indexed handle" re-architecture §9 calls for in
//! place of the reference implementation's ad-hoc pointer/refcount graph.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::{PtlError, PtlResult};

/// A `(pool slot, generation)` pair. `NULL`-equivalent is modeled as
/// `Option<Handle>` at call sites (spec §3: "every handle is either NULL or
/// resolves to a live object").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    pub index: u32,
    pub generation: u32,
}

struct Slot<T> {
    generation: AtomicU32,
    refcount: AtomicU32,
    value: Option<T>,
}

/// A generational arena of `T`, safe for concurrent allocate/release calls
/// (spec §4.1's explicit requirement).
pub struct Pool<T> {
    slots: Mutex<Vec<Slot<T>>>,
    free: Mutex<Vec<u32>>,
    len: AtomicUsize,
    limit: usize,
}

impl<T> Pool<T> {
    pub fn new(limit: usize) -> Self {
        Pool {
            slots: Mutex::new(Vec::new()),
            free: Mutex::new(Vec::new()),
            len: AtomicUsize::new(0),
            limit,
        }
    }

    /// Allocate a new object, returning its handle. `NO_SPACE` once the
    /// configured `max-list-size`-equivalent limit is hit (spec §3 NI
    /// limits).
    pub fn insert(&self, value: T) -> PtlResult<Handle> {
        let mut free = self.free.lock().unwrap();
        if let Some(index) = free.pop() {
            let mut slots = self.slots.lock().unwrap();
            let slot = &mut slots[index as usize];
            slot.value = Some(value);
            slot.refcount.store(1, Ordering::Release);
            let generation = slot.generation.load(Ordering::Acquire);
            return Ok(Handle { index, generation });
        }

        if self.len.load(Ordering::Relaxed) >= self.limit {
            return Err(PtlError::NoSpace);
        }

        let mut slots = self.slots.lock().unwrap();
        let index = slots.len() as u32;
        slots.push(Slot {
            generation: AtomicU32::new(0),
            refcount: AtomicU32::new(1),
            value: Some(value),
        });
        self.len.fetch_add(1, Ordering::Relaxed);
        Ok(Handle { index, generation: 0 })
    }

    fn check(&self, handle: Handle, slots: &MutexGuard<'_, Vec<Slot<T>>>) -> PtlResult<()> {
        let slot = slots
            .get(handle.index as usize)
            .ok_or(PtlError::ArgInvalid)?;
        if slot.generation.load(Ordering::Acquire) != handle.generation || slot.value.is_none() {
            return Err(PtlError::ArgInvalid);
        }
        Ok(())
    }

    /// Run `f` with a reference to the live object, or `ARG_INVALID` if the
    /// handle's generation is stale (spec §4.1 `lookup`).
    pub fn with<R>(&self, handle: Handle, f: impl FnOnce(&T) -> R) -> PtlResult<R> {
        let slots = self.slots.lock().unwrap();
        self.check(handle, &slots)?;
        Ok(f(slots[handle.index as usize].value.as_ref().unwrap()))
    }

    pub fn with_mut<R>(&self, handle: Handle, f: impl FnOnce(&mut T) -> R) -> PtlResult<R> {
        let mut slots = self.slots.lock().unwrap();
        self.check(handle, &slots)?;
        Ok(f(slots[handle.index as usize].value.as_mut().unwrap()))
    }

    /// Add a reference (spec §4.1 "acquisition adds one").
    pub fn acquire(&self, handle: Handle) -> PtlResult<()> {
        let slots = self.slots.lock().unwrap();
        self.check(handle, &slots)?;
        slots[handle.index as usize]
            .refcount
            .fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Drop a reference; at zero, reclaim the slot and bump its generation
    /// so stale handles fail to resolve (spec §4.1 "the pool reclaims the
    /// slot and bumps the generation").
    pub fn release(&self, handle: Handle) -> PtlResult<Option<T>> {
        let mut slots = self.slots.lock().unwrap();
        self.check(handle, &slots)?;
        let slot = &mut slots[handle.index as usize];
        let prev = slot.refcount.fetch_sub(1, Ordering::AcqRel);
        if prev != 1 {
            return Ok(None);
        }

        let value = slot.value.take();
        slot.generation.fetch_add(1, Ordering::AcqRel);
        drop(slots);
        self.free.lock().unwrap().push(handle.index);
        Ok(value)
    }

    /// Current live-object count, used to enforce NI limits at submission.
    pub fn count(&self) -> usize {
        self.len.load(Ordering::Relaxed) - self.free.lock().unwrap().len()
    }

    /// Run `f` over every currently-live object and its handle, e.g. for NI
    /// teardown walking every allocated CT/EQ regardless of generation.
    pub fn for_each(&self, mut f: impl FnMut(Handle, &T)) {
        let slots = self.slots.lock().unwrap();
        for (index, slot) in slots.iter().enumerate() {
            if let Some(value) = slot.value.as_ref() {
                let handle = Handle { index: index as u32, generation: slot.generation.load(Ordering::Acquire) };
                f(handle, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_fails() {
        let pool: Pool<u32> = Pool::new(4);
        let h = pool.insert(7).unwrap();
        assert_eq!(pool.with(h, |v| *v).unwrap(), 7);
        pool.release(h).unwrap();
        assert!(pool.with(h, |v| *v).is_err());
    }

    #[test]
    fn reuses_slot_with_new_generation() {
        let pool: Pool<u32> = Pool::new(4);
        let h1 = pool.insert(1).unwrap();
        pool.release(h1).unwrap();
        let h2 = pool.insert(2).unwrap();
        assert_eq!(h1.index, h2.index);
        assert_ne!(h1.generation, h2.generation);
        assert!(pool.with(h1, |v| *v).is_err());
        assert_eq!(pool.with(h2, |v| *v).unwrap(), 2);
    }

    #[test]
    fn respects_limit() {
        let pool: Pool<u32> = Pool::new(1);
        pool.insert(1).unwrap();
        assert!(matches!(pool.insert(2), Err(PtlError::NoSpace)));
    }

    #[test]
    fn refcount_keeps_slot_alive() {
        let pool: Pool<u32> = Pool::new(4);
        let h = pool.insert(9).unwrap();
        pool.acquire(h).unwrap();
        assert!(pool.release(h).unwrap().is_none());
        assert!(pool.with(h, |v| *v).is_ok());
        assert!(pool.release(h).unwrap().is_some());
        assert!(pool.with(h, |v| *v).is_err());
    }
}
