//! Remote-or-local compile policy.
//!
//! [`run`] always completes the compile. The remote path is tried only when
//! nothing forces a local build and no local compile slot is free; every
//! failure on it (refused connections, protocol errors, watchdog timeouts)
//! abandons the attempt and compiles locally instead. The one exception is a
//! scheduler that rejects this client's version, which ends the process.
//!
//! # Remote attempt
//!
//! ```text
//! start watchdog + preprocess ──> scheduler ──> worker handshake ──> upload ──> result
//!       (Init)             (ConnectedToScheduler) (AcquiredWorker) (UploadedJob) (Finished)
//! ```
//!
//! Preprocessing runs in the background while the scheduler picks a worker.
//! All waiting happens in one [`Multiplexer`] that also holds the watchdog,
//! so no wait outlives the active stage's deadline.

use crate::connection::{FrameProtocol, ProtocolConnection};
use crate::context::ClientContext;
use crate::mux::{EventSource, Multiplexer, SourceId, run_until};
use crate::scheduler::{SchedulerOutcome, SchedulerProtocol};
use crate::slots::{AcquireMode, Slot};
use crate::toolchain::{PreprocessResult, ToolchainError};
use crate::transport::ConnectRequest;
use crate::watchdog::StageWatchdog;
use crate::worker::{JobResult, WorkerProtocol, WorkerState};
use fisk_common::{
    CLIENT_VERSION, Environment, JobEnvelope, SlotKind, VERSION_MISMATCH_EXIT_CODE, WatchdogStage,
    headers,
};
use std::cell::RefCell;
use std::fs;
use std::future::{Future, poll_fn};
use std::path::PathBuf;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Close reason sent to the scheduler after a remote compile.
const SCHEDULER_CLOSE_REASON: &str = "got response";

// ============================================================================
// Outcome and errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    Remote { worker: String },
    Local { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOutcome {
    pub exit_code: i32,
    pub execution: Execution,
}

impl CompileOutcome {
    pub fn is_remote(&self) -> bool {
        matches!(self.execution, Execution::Remote { .. })
    }
}

/// Failures that end the process without a compile result.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(
        "fisk client {} is older than the scheduler's minimum version {min_version}",
        CLIENT_VERSION
    )]
    VersionMismatch { min_version: String },

    #[error(transparent)]
    Toolchain(#[from] ToolchainError),
}

impl ClientError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::VersionMismatch { .. } => VERSION_MISMATCH_EXIT_CODE,
            Self::Toolchain(_) => 1,
        }
    }
}

/// Why a remote attempt stopped short of a result.
#[derive(Debug)]
enum Abandon {
    /// Compile locally instead.
    Fallback(String),
    Fatal(ClientError),
}

fn fallback(reason: impl Into<String>) -> Abandon {
    Abandon::Fallback(reason.into())
}

// ============================================================================
// Policy
// ============================================================================

/// Compile `ctx.invocation`, remotely if possible.
pub async fn run(ctx: &ClientContext) -> Result<CompileOutcome, ClientError> {
    if let Some(reason) = ctx.forced_local_reason() {
        debug!("Compiling locally: {}", reason);
        return run_local(ctx, reason, None).await;
    }
    if !ctx.config.no_local {
        if let Some(slot) = ctx.slots.acquire(SlotKind::Compile, AcquireMode::Try) {
            debug!("Local compile slot free, compiling locally");
            return run_local(ctx, "local slot available".to_string(), Some(slot)).await;
        }
    }

    let mut attempt = RemoteAttempt::new(ctx);
    let result = attempt.run().await;
    attempt.finish();
    match result {
        Ok(outcome) => Ok(outcome),
        Err(Abandon::Fatal(error)) => Err(error),
        Err(Abandon::Fallback(reason)) => {
            warn!("Remote compile failed: {}, running locally", reason);
            drop(attempt);
            run_local(ctx, reason, None).await
        }
    }
}

/// Run the compiler here, waiting for a compile slot unless one is given.
async fn run_local(
    ctx: &ClientContext,
    reason: String,
    slot: Option<Slot>,
) -> Result<CompileOutcome, ClientError> {
    let slot = match slot {
        Some(slot) => Some(slot),
        None => ctx.slots.acquire_blocking(SlotKind::Compile).await,
    };
    let exit_code = ctx.toolchain.run_local(&ctx.invocation, slot).await?;
    debug!("Local compile exited with {}", exit_code);
    Ok(CompileOutcome {
        exit_code,
        execution: Execution::Local { reason },
    })
}

// ============================================================================
// Background preprocessing
// ============================================================================

type PreprocessTask = JoinHandle<Result<PreprocessResult, ToolchainError>>;

/// The preprocessor running as a tokio task, polled by the multiplexer.
struct PreprocessSource {
    task: Option<PreprocessTask>,
    result: Option<Result<PreprocessResult, String>>,
}

impl PreprocessSource {
    fn spawn(ctx: &ClientContext) -> Self {
        let toolchain = ctx.toolchain.clone();
        let invocation = ctx.invocation.clone();
        let slots = ctx.slots.clone();
        let task = tokio::spawn(async move { toolchain.preprocess(&invocation, &slots).await });
        Self {
            task: Some(task),
            result: None,
        }
    }

    fn is_done(&self) -> bool {
        self.result.is_some()
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            debug!("Abandoning preprocessor");
            task.abort();
        }
    }
}

impl EventSource for PreprocessSource {
    fn name(&self) -> &str {
        "preprocess"
    }

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let Some(task) = self.task.as_mut() else {
            return Poll::Pending;
        };
        let joined = match Pin::new(task).poll(cx) {
            Poll::Ready(joined) => joined,
            Poll::Pending => return Poll::Pending,
        };
        self.task = None;
        self.result = Some(match joined {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(ToolchainError::Task(e.to_string()).to_string()),
        });
        Poll::Ready(())
    }

    fn on_ready(&mut self) {
        trace!("Preprocessor finished");
    }
}

// ============================================================================
// Remote attempt
// ============================================================================

type SchedulerConnection = Rc<RefCell<ProtocolConnection<SchedulerProtocol>>>;
type WorkerConnection = Rc<RefCell<ProtocolConnection<WorkerProtocol>>>;

struct RemoteAttempt<'a> {
    ctx: &'a ClientContext,
    mux: Multiplexer,
    watchdog: Rc<RefCell<StageWatchdog>>,
    /// Set by the watchdog's abort callback.
    aborted: Rc<RefCell<Option<String>>>,
    preprocess: Option<Rc<RefCell<PreprocessSource>>>,
    scheduler: Option<(SourceId, SchedulerConnection)>,
    stderr_flushed: bool,
}

impl<'a> RemoteAttempt<'a> {
    fn new(ctx: &'a ClientContext) -> Self {
        let aborted = Rc::new(RefCell::new(None));
        let mut watchdog = StageWatchdog::from_config(&ctx.config);
        let reason = aborted.clone();
        watchdog.on_abort(move |stage, elapsed| {
            *reason.borrow_mut() = Some(format!(
                "watchdog timeout in stage {} after {}ms",
                stage,
                elapsed.as_millis()
            ));
        });
        Self {
            ctx,
            mux: Multiplexer::new(),
            watchdog: Rc::new(RefCell::new(watchdog)),
            aborted,
            preprocess: None,
            scheduler: None,
            stderr_flushed: false,
        }
    }

    async fn run(&mut self) -> Result<CompileOutcome, Abandon> {
        let ctx = self.ctx;
        let source_file = ctx
            .invocation
            .source_file()
            .ok_or_else(|| fallback("no single source file"))?
            .to_string();

        // Watchdog and preprocessing.
        self.watchdog.borrow_mut().start();
        self.mux.add(self.watchdog.clone());
        let preprocess = Rc::new(RefCell::new(PreprocessSource::spawn(ctx)));
        self.mux.add(preprocess.clone());
        self.preprocess = Some(preprocess.clone());
        poll_fn(|cx| {
            let _ = preprocess.borrow_mut().poll_ready(cx);
            Poll::Ready(())
        })
        .await;
        self.check_preprocess()?;

        // Scheduler connection.
        let hash = ctx
            .toolchain
            .environment_hash()
            .map_err(|e| fallback(format!("cannot identify compiler: {}", e)))?;
        let environment = Environment::new(hash.clone(), ctx.config.compatible_hashes(&hash));
        let request = self.scheduler_request(&environment, &source_file);
        debug!("Connecting to scheduler {}", request.url);
        let connection = ctx
            .connector
            .connect(request)
            .await
            .map_err(|e| fallback(format!("scheduler: {}", e)))?;

        // Scheduler conversation.
        self.watchdog
            .borrow_mut()
            .transition(WatchdogStage::ConnectedToScheduler);
        let assignment = {
            let mut protocol = SchedulerProtocol::new(ctx.config.name.clone());
            protocol.on_open();
            let scheduler = Rc::new(RefCell::new(ProtocolConnection::new(
                connection.channel,
                protocol,
            )));
            let id = self.mux.add(scheduler.clone());
            self.scheduler = Some((id, scheduler.clone()));
            self.drive(|| scheduler.borrow().protocol().is_terminal())
                .await?;
            let outcome = scheduler.borrow_mut().protocol_mut().take_outcome();
            match outcome {
                Some(SchedulerOutcome::Assigned(assignment)) => assignment,
                Some(SchedulerOutcome::VersionMismatch { min_version }) => {
                    return Err(Abandon::Fatal(ClientError::VersionMismatch { min_version }));
                }
                Some(SchedulerOutcome::NeedsEnvironment) => {
                    return Err(fallback("scheduler has no worker with our environment"));
                }
                Some(SchedulerOutcome::NoWorker) => return Err(fallback("no worker available")),
                Some(SchedulerOutcome::VersionVerified { .. }) => {
                    return Err(fallback("scheduler assigned no worker"));
                }
                Some(SchedulerOutcome::Failed(error)) => return Err(fallback(error)),
                None => return Err(fallback("scheduler conversation ended without an answer")),
            }
        };
        self.check_preprocess()?;

        // Worker connection.
        self.watchdog
            .borrow_mut()
            .transition(WatchdogStage::AcquiredWorker);
        let worker_name = format!("{}:{}", assignment.host(), assignment.port);
        let request = ConnectRequest::new(assignment.compile_url(), ctx.config.slave_connect_timeout)
            .header(headers::JOB_ID, assignment.job_id.to_string());
        debug!("Connecting to worker {} for job {}", worker_name, assignment.job_id);
        let connection = ctx
            .connector
            .connect(request)
            .await
            .map_err(|e| fallback(format!("worker {}: {}", worker_name, e)))?;
        let wait = connection.header(headers::WAIT) == Some("true");

        // Worker handshake, then the preprocessed source.
        let mut protocol = WorkerProtocol::new();
        protocol.on_open(wait);
        let worker: WorkerConnection =
            Rc::new(RefCell::new(ProtocolConnection::new(connection.channel, protocol)));
        self.mux.add(worker.clone());
        self.drive(|| {
            let worker = worker.borrow();
            worker.protocol().is_clear_to_upload() || worker.protocol().is_terminal()
        })
        .await?;
        worker_failed(&worker)?;

        self.drive(|| preprocess.borrow().is_done() || worker.borrow().protocol().is_terminal())
            .await?;
        worker_failed(&worker)?;
        self.check_preprocess()?;
        let payload = self.take_preprocessed()?;

        // Upload.
        let command_line = ctx.invocation.remote_command_line(&assignment.extra_args);
        let envelope =
            JobEnvelope::new(command_line, ctx.toolchain.argv0(), wait, payload.len() as u64);
        worker
            .borrow_mut()
            .protocol_mut()
            .begin_upload(&envelope, payload)
            .map_err(|e| fallback(format!("worker {}: {}", worker_name, e)))?;
        self.drive(|| {
            let worker = worker.borrow();
            worker.protocol().upload_flushed() || worker.protocol().is_terminal()
        })
        .await?;
        worker_failed(&worker)?;
        self.watchdog
            .borrow_mut()
            .transition(WatchdogStage::UploadedJob);

        // Result.
        self.drive(|| worker.borrow().protocol().is_terminal())
            .await?;
        worker_failed(&worker)?;
        let result = worker
            .borrow_mut()
            .protocol_mut()
            .take_result()
            .ok_or_else(|| fallback("worker finished without a result"))?;
        if !result.success && result.exit_code == 0 {
            return Err(fallback(format!("worker {} reported failure", worker_name)));
        }
        self.write_files(&result)?;

        self.watchdog.borrow_mut().transition(WatchdogStage::Finished);
        self.flush_preprocess_stderr();
        self.watchdog.borrow_mut().stop();
        self.close_scheduler().await;
        self.write_output(&result);
        info!(
            "Compiled {} on {}, exit {}",
            source_file, worker_name, result.exit_code
        );
        Ok(CompileOutcome {
            exit_code: result.exit_code,
            execution: Execution::Remote {
                worker: worker_name,
            },
        })
    }

    fn scheduler_request(&self, environment: &Environment, source_file: &str) -> ConnectRequest {
        let ctx = self.ctx;
        let config = &ctx.config;
        let mut request =
            ConnectRequest::new(config.scheduler_endpoint(), config.scheduler_connect_timeout)
                .header(headers::ENVIRONMENTS, environment.header_value())
                .header(headers::SOURCE_FILE, source_file)
                .header(headers::CLIENT_NAME, config.client_name.as_str())
                .header(headers::NPM_VERSION, CLIENT_VERSION);
        if let Some(slave) = &ctx.flags.slave {
            request = request.header(headers::SLAVE, slave.as_str());
        }
        if let Some(hostname) = &config.hostname {
            request = request.header(headers::CLIENT_HOSTNAME, hostname.as_str());
        }
        request
    }

    /// Run the multiplexer until `done` or the watchdog fires.
    async fn drive(&mut self, mut done: impl FnMut() -> bool) -> Result<(), Abandon> {
        let watchdog = self.watchdog.clone();
        run_until(&mut self.mux, || watchdog.borrow().fired() || done())
            .await
            .map_err(|e| fallback(format!("event loop: {}", e)))?;
        if watchdog.borrow().fired() {
            let reason = self
                .aborted
                .borrow()
                .clone()
                .unwrap_or_else(|| "watchdog timeout".to_string());
            return Err(fallback(reason));
        }
        Ok(())
    }

    /// Fails if preprocessing already finished unsuccessfully.
    fn check_preprocess(&self) -> Result<(), Abandon> {
        let Some(preprocess) = &self.preprocess else {
            return Ok(());
        };
        match &preprocess.borrow().result {
            Some(Err(e)) => Err(fallback(format!("preprocessing failed: {}", e))),
            Some(Ok(result)) if !result.succeeded() => Err(fallback(format!(
                "preprocessor exited with {}",
                result.exit_status
            ))),
            _ => Ok(()),
        }
    }

    /// Move the preprocessed source out, leaving stderr for the user.
    fn take_preprocessed(&self) -> Result<Vec<u8>, Abandon> {
        let preprocess = self
            .preprocess
            .as_ref()
            .ok_or_else(|| fallback("preprocessor never started"))?;
        match preprocess.borrow_mut().result.as_mut() {
            Some(Ok(result)) => Ok(std::mem::take(&mut result.stdout)),
            _ => Err(fallback("preprocessed source unavailable")),
        }
    }

    /// Show buffered preprocessor diagnostics. Only the first call writes.
    fn flush_preprocess_stderr(&mut self) {
        if self.stderr_flushed {
            return;
        }
        self.stderr_flushed = true;
        let Some(preprocess) = &self.preprocess else {
            return;
        };
        if let Some(Ok(result)) = &preprocess.borrow().result {
            // A failed preprocess is rerun locally, which prints its own errors.
            if result.succeeded() && !result.stderr.is_empty() {
                if let Err(e) = self.ctx.output.write_stderr(&result.stderr) {
                    warn!("Failed to write preprocessor output: {}", e);
                }
            }
        }
    }

    fn write_files(&self, result: &JobResult) -> Result<(), Abandon> {
        for file in &result.files {
            let path = match &file.path {
                Some(path) => PathBuf::from(path),
                None => self
                    .ctx
                    .invocation
                    .object_output()
                    .ok_or_else(|| fallback("no output path for the object file"))?,
            };
            fs::write(&path, &file.data)
                .map_err(|e| fallback(format!("failed to write {}: {}", path.display(), e)))?;
            trace!("Wrote {} ({} bytes)", path.display(), file.data.len());
        }
        Ok(())
    }

    fn write_output(&self, result: &JobResult) {
        let output = &self.ctx.output;
        if !result.stdout.is_empty() {
            if let Err(e) = output.write_stdout(&result.stdout) {
                warn!("Failed to write compiler stdout: {}", e);
            }
        }
        if !result.stderr.is_empty() {
            if let Err(e) = output.write_stderr(&result.stderr) {
                warn!("Failed to write compiler stderr: {}", e);
            }
        }
    }

    async fn close_scheduler(&mut self) {
        let Some((id, scheduler)) = self.scheduler.take() else {
            return;
        };
        self.mux.remove(id);
        match Rc::try_unwrap(scheduler) {
            Ok(connection) => {
                if let Err(e) = connection.into_inner().close(SCHEDULER_CLOSE_REASON).await {
                    debug!("Failed to close scheduler connection: {}", e);
                }
            }
            Err(_) => debug!("Scheduler connection still shared, dropping it"),
        }
    }

    /// Tear down whatever is still running. Safe to call more than once.
    fn finish(&mut self) {
        self.watchdog.borrow_mut().stop();
        if let Some(preprocess) = &self.preprocess {
            preprocess.borrow_mut().abort();
        }
        self.flush_preprocess_stderr();
    }
}

fn worker_failed(worker: &WorkerConnection) -> Result<(), Abandon> {
    let worker = worker.borrow();
    let protocol = worker.protocol();
    if protocol.state() == WorkerState::Failed {
        return Err(fallback(
            protocol.error().unwrap_or("worker connection failed").to_string(),
        ));
    }
    Ok(())
}
