//! Process-local slot backend.
//!
//! Same contract as the named semaphores, scoped to one process: used by tests
//! and on platforms without POSIX named semaphores.

use super::{Permit, SlotBackend, SlotCapacities, SlotReport};
use fisk_common::SlotKind;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Counting semaphores built from a mutex and a condition variable.
#[derive(Debug)]
pub struct InProcessSlots {
    capacities: SlotCapacities,
    /// Free units per kind.
    available: Mutex<[usize; 2]>,
    cv: Condvar,
}

impl InProcessSlots {
    pub fn new(capacities: SlotCapacities) -> Self {
        Self {
            capacities,
            available: Mutex::new([capacities.compile, capacities.preprocess]),
            cv: Condvar::new(),
        }
    }

    /// Release paths run from `Drop`; a poisoned lock must not turn into a
    /// second panic.
    fn lock(&self) -> MutexGuard<'_, [usize; 2]> {
        self.available.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SlotBackend for InProcessSlots {
    fn try_acquire(&self, kind: SlotKind) -> Option<Permit> {
        let mut available = self.lock();
        let free = &mut available[kind.index()];
        if *free == 0 {
            return None;
        }
        *free -= 1;
        Some(Permit::Counted)
    }

    fn acquire(&self, kind: SlotKind) -> Permit {
        let mut available = self.lock();
        while available[kind.index()] == 0 {
            available = self.cv.wait(available).unwrap_or_else(PoisonError::into_inner);
        }
        available[kind.index()] -= 1;
        Permit::Counted
    }

    fn release(&self, kind: SlotKind) {
        let mut available = self.lock();
        let free = &mut available[kind.index()];
        debug_assert!(*free < self.capacities.get(kind), "slot over-release");
        if *free < self.capacities.get(kind) {
            *free += 1;
        }
        drop(available);
        self.cv.notify_all();
    }

    fn report(&self, kind: SlotKind) -> SlotReport {
        SlotReport {
            kind,
            name: format!("in-process:{}", kind),
            capacity: self.capacities.get(kind),
            available: Some(self.lock()[kind.index()] as i64),
            counted: true,
        }
    }
}
