//! Host-wide admission control for local compiles and preprocessor runs.
//!
//! Every `fiskc` process on a host shares two counting semaphores, one per
//! [`SlotKind`]. A [`Slot`] is the ownership token for one unit of capacity
//! and posts it back when dropped. The controller additionally keeps a ledger
//! of what this process holds so the fatal-exit and signal paths can return
//! everything with [`SlotController::release_all`].
//!
//! # Fail-open
//!
//! A semaphore that cannot be opened (no `/dev/shm`, permissions) makes its
//! kind unlimited for this process. Compiles must never deadlock on broken
//! admission control.

mod memory;
#[cfg(unix)]
pub mod posix;

pub use memory::InProcessSlots;

use fisk_common::{ClientConfig, SlotKind};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Errors from the named-semaphore backend.
#[derive(Debug, Error)]
pub enum SlotError {
    #[error("failed to open semaphore {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to unlink semaphore {name}: {source}")]
    Unlink {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// How [`SlotController::acquire`] behaves when no capacity is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Return `None` immediately.
    Try,
    /// Block the calling thread until capacity exists.
    Wait,
}

/// What a backend handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// A unit taken from a counting semaphore; must be posted back.
    Counted,
    /// The kind is unlimited (backend unavailable); nothing to post.
    Uncounted,
}

/// Configured capacity per slot kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotCapacities {
    pub compile: usize,
    pub preprocess: usize,
}

impl SlotCapacities {
    pub fn new(compile: usize, preprocess: usize) -> Self {
        Self {
            compile: compile.max(1),
            preprocess: preprocess.max(1),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.compile_slots, config.cpp_slots)
    }

    pub fn get(&self, kind: SlotKind) -> usize {
        match kind {
            SlotKind::Compile => self.compile,
            SlotKind::Preprocess => self.preprocess,
        }
    }
}

/// Diagnostic snapshot of one slot kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotReport {
    pub kind: SlotKind,
    pub name: String,
    pub capacity: usize,
    /// Free units, where the backend can tell.
    pub available: Option<i64>,
    /// False when the kind is running unlimited.
    pub counted: bool,
}

impl fmt::Display for SlotReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<10} {:<14} capacity {}", self.kind, self.name, self.capacity)?;
        match (self.counted, self.available) {
            (false, _) => write!(f, " (unavailable, unlimited)"),
            (true, Some(available)) => write!(f, " available {}", available),
            (true, None) => write!(f, " available unknown"),
        }
    }
}

/// A source of slot capacity shared between processes (or threads).
pub trait SlotBackend: Send + Sync {
    fn try_acquire(&self, kind: SlotKind) -> Option<Permit>;

    /// Blocks until a unit is free.
    fn acquire(&self, kind: SlotKind) -> Permit;

    /// Post back one counted unit.
    fn release(&self, kind: SlotKind);

    fn report(&self, kind: SlotKind) -> SlotReport;
}

/// Acquisition counters kept for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    /// Counted slots currently held by this process.
    pub held: usize,
    /// `Try` acquisitions attempted.
    pub tried: usize,
    /// `Wait` acquisitions completed.
    pub waited: usize,
}

#[derive(Debug, Default)]
struct SlotLedger {
    stats: [SlotStats; 2],
}

/// Hands out [`Slot`]s and tracks the ones this process holds.
#[derive(Clone)]
pub struct SlotController {
    backend: Arc<dyn SlotBackend>,
    ledger: Arc<Mutex<SlotLedger>>,
}

impl fmt::Debug for SlotController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotController")
            .field("ledger", &*self.ledger())
            .finish()
    }
}

impl SlotController {
    pub fn new(backend: Arc<dyn SlotBackend>) -> Self {
        Self {
            backend,
            ledger: Arc::new(Mutex::new(SlotLedger::default())),
        }
    }

    /// Controller over the host-wide named semaphores.
    #[cfg(unix)]
    pub fn system(capacities: SlotCapacities) -> Self {
        Self::new(Arc::new(posix::PosixSlots::open(capacities)))
    }

    /// Without named semaphores each process only limits itself.
    #[cfg(not(unix))]
    pub fn system(capacities: SlotCapacities) -> Self {
        Self::in_process(capacities)
    }

    pub fn in_process(capacities: SlotCapacities) -> Self {
        Self::new(Arc::new(InProcessSlots::new(capacities)))
    }

    fn ledger(&self) -> MutexGuard<'_, SlotLedger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire one unit of `kind`. `None` only in [`AcquireMode::Try`].
    pub fn acquire(&self, kind: SlotKind, mode: AcquireMode) -> Option<Slot> {
        let permit = match mode {
            AcquireMode::Try => {
                self.ledger().stats[kind.index()].tried += 1;
                self.backend.try_acquire(kind)?
            }
            AcquireMode::Wait => {
                let permit = self.backend.acquire(kind);
                self.ledger().stats[kind.index()].waited += 1;
                permit
            }
        };
        if permit == Permit::Counted {
            self.ledger().stats[kind.index()].held += 1;
        }
        trace!("Acquired {} slot ({:?}, {:?})", kind, mode, permit);
        Some(Slot {
            controller: self.clone(),
            kind,
            permit,
            released: false,
        })
    }

    /// [`AcquireMode::Wait`] on the blocking pool, keeping the event loop free.
    ///
    /// `None` if the blocking task could not run; the caller proceeds
    /// unslotted.
    pub async fn acquire_blocking(&self, kind: SlotKind) -> Option<Slot> {
        let controller = self.clone();
        match tokio::task::spawn_blocking(move || controller.acquire(kind, AcquireMode::Wait)).await
        {
            Ok(slot) => slot,
            Err(e) => {
                warn!("Failed to wait for a {} slot: {}, running unslotted", kind, e);
                None
            }
        }
    }

    /// Post every counted slot this process still holds.
    ///
    /// Outstanding [`Slot`]s become inert: their later release posts nothing.
    pub fn release_all(&self) -> usize {
        let mut ledger = self.ledger();
        let mut released = 0;
        for kind in SlotKind::ALL {
            let held = std::mem::take(&mut ledger.stats[kind.index()].held);
            for _ in 0..held {
                self.backend.release(kind);
            }
            released += held;
        }
        if released > 0 {
            debug!("Released {} held slot(s) on exit", released);
        }
        released
    }

    pub fn held(&self, kind: SlotKind) -> usize {
        self.ledger().stats[kind.index()].held
    }

    pub fn stats(&self, kind: SlotKind) -> SlotStats {
        self.ledger().stats[kind.index()]
    }

    pub fn report(&self) -> Vec<SlotReport> {
        SlotKind::ALL
            .iter()
            .map(|kind| self.backend.report(*kind))
            .collect()
    }

    /// Returns true if the caller should post the unit back.
    fn forget_held(&self, kind: SlotKind) -> bool {
        let mut ledger = self.ledger();
        let held = &mut ledger.stats[kind.index()].held;
        if *held == 0 {
            return false;
        }
        *held -= 1;
        true
    }
}

/// One unit of local capacity; released on drop.
#[must_use = "dropping a Slot releases it immediately"]
pub struct Slot {
    controller: SlotController,
    kind: SlotKind,
    permit: Permit,
    released: bool,
}

impl Slot {
    pub fn kind(&self) -> SlotKind {
        self.kind
    }

    pub fn permit(&self) -> Permit {
        self.permit
    }

    /// Release now. Calling this more than once is harmless.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.permit == Permit::Counted && self.controller.forget_held(self.kind) {
            self.controller.backend.release(self.kind);
            trace!("Released {} slot", self.kind);
        }
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("kind", &self.kind)
            .field("permit", &self.permit)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.release();
    }
}
