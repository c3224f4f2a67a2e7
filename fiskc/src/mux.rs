//! Single-threaded readiness multiplexer.
//!
//! The remote path drives up to two websocket connections and the watchdog
//! timer from one thread. Each of them registers as an [`EventSource`];
//! [`Multiplexer::exec`] waits until at least one source is ready and
//! dispatches exactly the ready ones, in registration order.
//!
//! `exec` is one iteration. Call sites loop with [`run_until`] and a
//! predicate over the state they are waiting for.

use std::cell::RefCell;
use std::future::poll_fn;
use std::rc::Rc;
use std::task::{Context, Poll};
use thiserror::Error;
use tracing::trace;

/// Something the multiplexer can wait on.
pub trait EventSource {
    fn name(&self) -> &str;

    /// Make progress on I/O and report whether [`EventSource::on_ready`] has
    /// work to do. A pending source must have registered `cx`'s waker.
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<()>;

    /// Handle whatever made the source ready.
    fn on_ready(&mut self);
}

pub type SharedSource = Rc<RefCell<dyn EventSource>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MuxError {
    /// Waiting with nothing registered would block forever.
    #[error("no event sources registered")]
    NoSources,
}

#[derive(Default)]
pub struct Multiplexer {
    sources: Vec<(SourceId, SharedSource)>,
    next_id: u64,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, source: SharedSource) -> SourceId {
        let id = SourceId(self.next_id);
        self.next_id += 1;
        trace!("mux: add {} as {:?}", source.borrow().name(), id);
        self.sources.push((id, source));
        id
    }

    /// Returns false if `id` was not registered.
    pub fn remove(&mut self, id: SourceId) -> bool {
        let before = self.sources.len();
        self.sources.retain(|(source_id, _)| *source_id != id);
        before != self.sources.len()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Wait for readiness and dispatch the ready sources once. Returns the
    /// number of sources dispatched, always at least one.
    pub async fn exec(&mut self) -> Result<usize, MuxError> {
        if self.sources.is_empty() {
            return Err(MuxError::NoSources);
        }

        let ready: Vec<SharedSource> = poll_fn(|cx| {
            let ready: Vec<SharedSource> = self
                .sources
                .iter()
                .filter(|(_, source)| source.borrow_mut().poll_ready(cx).is_ready())
                .map(|(_, source)| source.clone())
                .collect();
            if ready.is_empty() {
                Poll::Pending
            } else {
                Poll::Ready(ready)
            }
        })
        .await;

        for source in &ready {
            let mut source = source.borrow_mut();
            trace!("mux: dispatch {}", source.name());
            source.on_ready();
        }
        Ok(ready.len())
    }
}

/// Run [`Multiplexer::exec`] until `done` holds. Returns the number of
/// iterations; zero if `done` already held.
pub async fn run_until(
    mux: &mut Multiplexer,
    mut done: impl FnMut() -> bool,
) -> Result<usize, MuxError> {
    let mut iterations = 0;
    while !done() {
        mux.exec().await?;
        iterations += 1;
    }
    Ok(iterations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;
    use tokio::time::Sleep;

    /// Ready while `pending` is non-zero; each dispatch consumes one.
    struct Counter {
        name: &'static str,
        pending: Rc<Cell<usize>>,
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl EventSource for Counter {
        fn name(&self) -> &str {
            self.name
        }

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<()> {
            if self.pending.get() > 0 {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        }

        fn on_ready(&mut self) {
            self.pending.set(self.pending.get() - 1);
            self.log.borrow_mut().push(self.name);
        }
    }

    struct Timer {
        sleep: Pin<Box<Sleep>>,
        fired: Rc<Cell<bool>>,
    }

    impl EventSource for Timer {
        fn name(&self) -> &str {
            "timer"
        }

        fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<()> {
            if self.fired.get() {
                return Poll::Pending;
            }
            self.sleep.as_mut().poll(cx)
        }

        fn on_ready(&mut self) {
            self.fired.set(true);
        }
    }

    fn counter(
        name: &'static str,
        pending: usize,
        log: &Rc<RefCell<Vec<&'static str>>>,
    ) -> (SharedSource, Rc<Cell<usize>>) {
        let pending = Rc::new(Cell::new(pending));
        let source: SharedSource = Rc::new(RefCell::new(Counter {
            name,
            pending: pending.clone(),
            log: log.clone(),
        }));
        (source, pending)
    }

    #[tokio::test]
    async fn test_exec_on_empty_is_an_error() {
        let mut mux = Multiplexer::new();
        assert_eq!(mux.exec().await, Err(MuxError::NoSources));
        assert_eq!(run_until(&mut mux, || false).await, Err(MuxError::NoSources));
    }

    #[tokio::test]
    async fn test_exec_dispatches_only_ready_sources() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut mux = Multiplexer::new();
        let (idle, _) = counter("idle", 0, &log);
        let (busy, _) = counter("busy", 1, &log);
        mux.add(idle);
        mux.add(busy);

        assert_eq!(mux.exec().await, Ok(1));
        assert_eq!(*log.borrow(), vec!["busy"]);
    }

    #[tokio::test]
    async fn test_exec_dispatches_in_registration_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut mux = Multiplexer::new();
        let (b, _) = counter("b", 1, &log);
        let (a, _) = counter("a", 1, &log);
        let (c, _) = counter("c", 1, &log);
        mux.add(b);
        mux.add(a);
        mux.add(c);

        assert_eq!(mux.exec().await, Ok(3));
        assert_eq!(*log.borrow(), vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_removed_source_is_not_dispatched() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut mux = Multiplexer::new();
        let (gone, _) = counter("gone", 1, &log);
        let (kept, _) = counter("kept", 1, &log);
        let gone_id = mux.add(gone);
        mux.add(kept);

        assert!(mux.remove(gone_id));
        assert!(!mux.remove(gone_id));
        assert_eq!(mux.len(), 1);
        assert_eq!(mux.exec().await, Ok(1));
        assert_eq!(*log.borrow(), vec!["kept"]);
    }

    #[tokio::test]
    async fn test_run_until_counts_iterations() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut mux = Multiplexer::new();
        let (source, pending) = counter("work", 3, &log);
        mux.add(source);

        let iterations = run_until(&mut mux, || pending.get() == 0).await;
        assert_eq!(iterations, Ok(3));
        assert_eq!(run_until(&mut mux, || true).await, Ok(0));
    }

    #[tokio::test]
    async fn test_exec_waits_for_timer() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let fired = Rc::new(Cell::new(false));
        let mut mux = Multiplexer::new();
        let (idle, _) = counter("idle", 0, &log);
        mux.add(idle);
        mux.add(Rc::new(RefCell::new(Timer {
            sleep: Box::pin(tokio::time::sleep(Duration::from_millis(20))),
            fired: fired.clone(),
        })));

        let start = std::time::Instant::now();
        assert_eq!(mux.exec().await, Ok(1));
        assert!(fired.get());
        assert!(start.elapsed() >= Duration::from_millis(15));
        assert!(log.borrow().is_empty());
    }
}
