//! Stage watchdog for the remote compile path.
//!
//! The remote attempt advances through [`WatchdogStage`]s in order. Each stage
//! has a deadline measured from the moment it was entered; when the active
//! stage overruns, the abort callback fires once and the watchdog disarms.
//! The orchestrator then abandons the remote attempt and compiles locally.
//!
//! The watchdog never blocks. Its timer is an [`EventSource`] registered in
//! the [`Multiplexer`](crate::mux::Multiplexer), so every wait on the remote
//! path is bounded by the next tick.

use crate::mux::EventSource;
use fisk_common::{ClientConfig, WatchdogStage};
use std::fmt;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, warn};

const MIN_TICK: Duration = Duration::from_millis(5);
const MAX_TICK: Duration = Duration::from_millis(100);

/// Per-stage time budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDeadlines {
    /// Budget for reaching the scheduler (stage `Init`).
    pub scheduler_connect: Duration,
    /// Budget for being assigned a worker (stage `ConnectedToScheduler`).
    pub worker_acquire: Duration,
    /// Budget for handing the job to the worker (stage `AcquiredWorker`).
    pub job_upload: Duration,
    /// Budget for the remote compile itself (stage `UploadedJob`).
    pub response: Duration,
}

impl Default for StageDeadlines {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl StageDeadlines {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            scheduler_connect: config.scheduler_connect_timeout,
            worker_acquire: config.acquired_slave_timeout,
            job_upload: config.upload_job_timeout,
            response: config.response_timeout,
        }
    }

    /// Every stage gets `deadline`.
    pub fn uniform(deadline: Duration) -> Self {
        Self {
            scheduler_connect: deadline,
            worker_acquire: deadline,
            job_upload: deadline,
            response: deadline,
        }
    }

    /// Deadline of `stage`; `Finished` has none.
    pub fn for_stage(&self, stage: WatchdogStage) -> Option<Duration> {
        match stage {
            WatchdogStage::Init => Some(self.scheduler_connect),
            WatchdogStage::ConnectedToScheduler => Some(self.worker_acquire),
            WatchdogStage::AcquiredWorker => Some(self.job_upload),
            WatchdogStage::UploadedJob => Some(self.response),
            WatchdogStage::Finished => None,
        }
    }

    /// A quarter of the smallest deadline, kept within 5..=100 ms.
    pub fn tick_interval(&self) -> Duration {
        let smallest = [
            self.scheduler_connect,
            self.worker_acquire,
            self.job_upload,
            self.response,
        ]
        .into_iter()
        .min()
        .unwrap_or(MAX_TICK);
        (smallest / 4).clamp(MIN_TICK, MAX_TICK)
    }
}

pub type AbortCallback = Box<dyn FnMut(WatchdogStage, Duration)>;

pub struct StageWatchdog {
    deadlines: StageDeadlines,
    enabled: bool,
    stage: WatchdogStage,
    entered: [Option<Instant>; WatchdogStage::COUNT],
    timer: Option<Interval>,
    fired: bool,
    on_abort: Option<AbortCallback>,
}

impl fmt::Debug for StageWatchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageWatchdog")
            .field("deadlines", &self.deadlines)
            .field("enabled", &self.enabled)
            .field("stage", &self.stage)
            .field("running", &self.is_running())
            .field("fired", &self.fired)
            .finish()
    }
}

impl StageWatchdog {
    /// `enabled = false` tracks stages but never fires.
    pub fn new(deadlines: StageDeadlines, enabled: bool) -> Self {
        Self {
            deadlines,
            enabled,
            stage: WatchdogStage::Init,
            entered: [None; WatchdogStage::COUNT],
            timer: None,
            fired: false,
            on_abort: None,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(StageDeadlines::from_config(config), config.watchdog)
    }

    /// Register the callback run when a deadline is missed.
    pub fn on_abort(&mut self, callback: impl FnMut(WatchdogStage, Duration) + 'static) {
        self.on_abort = Some(Box::new(callback));
    }

    /// Enter `Init` now and arm the timer. Must run inside a tokio runtime.
    pub fn start(&mut self) {
        self.start_at(Instant::now());
        if self.enabled && !self.fired && self.timer.is_none() {
            let tick = self.deadlines.tick_interval();
            let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.timer = Some(timer);
            debug!("Watchdog armed, tick {:?}", tick);
        }
    }

    pub(crate) fn start_at(&mut self, now: Instant) {
        let init = &mut self.entered[WatchdogStage::Init.index()];
        if init.is_none() {
            *init = Some(now);
        }
    }

    /// Advance to `stage`. Returns false (and changes nothing) if `stage` is
    /// not ahead of the current one or the watchdog already fired.
    pub fn transition(&mut self, stage: WatchdogStage) -> bool {
        self.transition_at(stage, Instant::now())
    }

    pub(crate) fn transition_at(&mut self, stage: WatchdogStage, now: Instant) -> bool {
        if self.fired || stage <= self.stage {
            return false;
        }
        debug!("Watchdog: {} -> {}", self.stage, stage);
        self.stage = stage;
        self.entered[stage.index()] = Some(now);
        true
    }

    /// Disarm the timer. Safe to call any number of times.
    pub fn stop(&mut self) {
        if self.timer.take().is_some() {
            debug!("Watchdog stopped in stage {}", self.stage);
        }
    }

    /// Compare the active stage's elapsed time against its deadline at `now`.
    /// Fires the abort callback and returns true on the first overrun only.
    pub fn check(&mut self, now: Instant) -> bool {
        if self.fired || !self.enabled {
            return false;
        }
        let Some(deadline) = self.deadlines.for_stage(self.stage) else {
            return false;
        };
        let Some(entered) = self.entered[self.stage.index()] else {
            return false;
        };
        let elapsed = now.saturating_duration_since(entered);
        if elapsed <= deadline {
            return false;
        }

        self.fired = true;
        self.stop();
        warn!(
            "Watchdog timeout in stage {} after {}ms (deadline {}ms), running locally",
            self.stage,
            elapsed.as_millis(),
            deadline.as_millis()
        );
        if let Some(callback) = self.on_abort.as_mut() {
            callback(self.stage, elapsed);
        }
        true
    }

    pub fn stage(&self) -> WatchdogStage {
        self.stage
    }

    pub fn fired(&self) -> bool {
        self.fired
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_some()
    }

    pub fn stage_entered_at(&self, stage: WatchdogStage) -> Option<Instant> {
        self.entered[stage.index()]
    }

}

impl EventSource for StageWatchdog {
    fn name(&self) -> &str {
        "watchdog"
    }

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        match self.timer.as_mut() {
            Some(timer) => timer.poll_tick(cx).map(|_| ()),
            None => Poll::Pending,
        }
    }

    fn on_ready(&mut self) {
        self.check(Instant::now());
    }
}
