//! Worker conversation: wait for the go-ahead, upload the preprocessed job and
//! collect the compiler's output.
//!
//! Uploads and results are two-phase: a JSON control frame announces how many
//! bytes follow, then binary frames carry them. A result is complete only when
//! exactly the advertised number of bytes has arrived.

use crate::connection::FrameProtocol;
use crate::transport::Frame;
use fisk_common::{JobEnvelope, JobResponse, OutputKind, ProtocolError, WorkerMessage};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, trace};

/// Largest job output we are willing to buffer.
const MAX_RESULT_BYTES: u64 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Connecting,
    Connected,
    /// The worker asked us to hold the upload until it sends `resume`.
    AwaitingWaitAck,
    Uploading,
    AwaitingResult,
    Done,
    Failed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("cannot upload while {0:?}")]
    NotReady(WorkerState),

    #[error("envelope announces {announced} bytes but payload has {actual}")]
    SizeMismatch { announced: u64, actual: u64 },

    #[error("failed to encode job envelope: {0}")]
    Encode(String),
}

/// A file written by the remote compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    /// `None` is the primary output (the object file).
    pub path: Option<String>,
    pub data: Vec<u8>,
}

/// Output of a remote compile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobResult {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub files: Vec<OutputFile>,
}

impl JobResult {
    /// Split the concatenated payload by the response index. `None` if the
    /// index does not fit the payload.
    fn assemble(response: &JobResponse, payload: &[u8]) -> Option<Self> {
        let mut result = JobResult {
            success: response.success,
            exit_code: response.exit_code,
            ..Default::default()
        };
        let mut offset = 0usize;
        for chunk in &response.index {
            let len = usize::try_from(chunk.bytes).ok()?;
            let end = offset.checked_add(len)?;
            let data = payload.get(offset..end)?;
            match chunk.kind {
                OutputKind::Stdout => result.stdout.extend_from_slice(data),
                OutputKind::Stderr => result.stderr.extend_from_slice(data),
                OutputKind::File => result.files.push(OutputFile {
                    path: chunk.path.clone(),
                    data: data.to_vec(),
                }),
            }
            offset = end;
        }
        Some(result)
    }
}

#[derive(Debug)]
pub struct WorkerProtocol {
    state: WorkerState,
    outbox: VecDeque<Frame>,
    upload_flushed: bool,
    response: Option<JobResponse>,
    /// Bytes announced by `response`.
    expected: u64,
    received: Vec<u8>,
    result: Option<JobResult>,
    error: Option<String>,
}

impl Default for WorkerProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerProtocol {
    pub fn new() -> Self {
        Self {
            state: WorkerState::Connecting,
            outbox: VecDeque::new(),
            upload_flushed: false,
            response: None,
            expected: 0,
            received: Vec::new(),
            result: None,
            error: None,
        }
    }

    /// The handshake completed. `wait` is the `x-fisk-wait` response header.
    pub fn on_open(&mut self, wait: bool) {
        if self.state != WorkerState::Connecting {
            return;
        }
        self.state = if wait {
            debug!("Worker asked us to wait");
            WorkerState::AwaitingWaitAck
        } else {
            WorkerState::Connected
        };
    }

    /// Queue the job envelope and its payload.
    pub fn begin_upload(&mut self, envelope: &JobEnvelope, payload: Vec<u8>) -> Result<(), UploadError> {
        if self.state != WorkerState::Connected {
            return Err(UploadError::NotReady(self.state));
        }
        if envelope.bytes != payload.len() as u64 {
            return Err(UploadError::SizeMismatch {
                announced: envelope.bytes,
                actual: payload.len() as u64,
            });
        }
        let json = serde_json::to_string(envelope).map_err(|e| UploadError::Encode(e.to_string()))?;
        self.outbox.push_back(Frame::Text(json));
        // Workers reject empty binary frames.
        if !payload.is_empty() {
            self.outbox.push_back(Frame::Binary(payload));
        }
        self.state = WorkerState::Uploading;
        Ok(())
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn is_clear_to_upload(&self) -> bool {
        self.state == WorkerState::Connected
    }

    /// Envelope and payload reached the socket.
    pub fn upload_flushed(&self) -> bool {
        self.upload_flushed
    }

    pub fn result(&self) -> Option<&JobResult> {
        self.result.as_ref()
    }

    pub fn take_result(&mut self) -> Option<JobResult> {
        self.result.take()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn fail(&mut self, error: String) {
        debug!("Worker protocol failed in {:?}: {}", self.state, error);
        self.state = WorkerState::Failed;
        self.outbox.clear();
        self.error = Some(error);
    }

    fn on_message(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Resume if self.state == WorkerState::AwaitingWaitAck => {
                debug!("Worker resumed");
                self.state = WorkerState::Connected;
            }
            WorkerMessage::Resume => self.fail(format!("unexpected resume while {:?}", self.state)),
            WorkerMessage::Response(response)
                if matches!(self.state, WorkerState::Uploading | WorkerState::AwaitingResult)
                    && self.response.is_none() =>
            {
                let expected = match response.total_bytes() {
                    Some(total) if total <= MAX_RESULT_BYTES => total,
                    Some(total) => {
                        self.fail(format!("worker announced {} bytes of output", total));
                        return;
                    }
                    None => {
                        self.fail("worker response index overflows".to_string());
                        return;
                    }
                };
                trace!(
                    "Worker response: exit {}, {} bytes to follow",
                    response.exit_code,
                    expected
                );
                self.state = WorkerState::AwaitingResult;
                self.outbox.clear();
                self.response = Some(response);
                self.expected = expected;
                self.maybe_complete();
            }
            WorkerMessage::Response(_) => {
                self.fail(format!("unexpected response while {:?}", self.state))
            }
        }
    }

    fn on_binary(&mut self, data: Vec<u8>) {
        if self.response.is_none() {
            self.fail(format!("unexpected binary frame ({} bytes) while {:?}", data.len(), self.state));
            return;
        }
        let expected = self.expected;
        let total = self.received.len() as u64 + data.len() as u64;
        if total > expected {
            self.fail(format!("worker sent {} bytes, expected {}", total, expected));
            return;
        }
        self.received.extend_from_slice(&data);
        self.maybe_complete();
    }

    fn maybe_complete(&mut self) {
        let Some(response) = self.response.as_ref() else {
            return;
        };
        if self.received.len() as u64 != self.expected {
            return;
        }
        let Some(result) = JobResult::assemble(response, &self.received) else {
            self.fail("worker output does not match its index".to_string());
            return;
        };
        self.received = Vec::new();
        self.result = Some(result);
        self.state = WorkerState::Done;
    }
}

impl FrameProtocol for WorkerProtocol {
    fn name(&self) -> &str {
        "worker"
    }

    fn poll_outbound(&mut self) -> Option<Frame> {
        self.outbox.pop_front()
    }

    fn on_frame(&mut self, frame: Frame) {
        if self.is_terminal() {
            trace!("Ignoring {} frame from worker after {:?}", frame.kind(), self.state);
            return;
        }
        if self.state == WorkerState::Connecting {
            self.fail("worker spoke before the handshake completed".to_string());
            return;
        }
        match frame {
            Frame::Text(text) => match WorkerMessage::parse(&text) {
                Ok(message) => self.on_message(message),
                Err(ProtocolError::Remote(message)) => self.fail(format!("worker error: {}", message)),
                Err(e) => self.fail(format!("bad worker message: {}", e)),
            },
            Frame::Binary(data) => self.on_binary(data),
            Frame::Close(reason) => self.on_closed(reason.unwrap_or_default()),
        }
    }

    fn on_flushed(&mut self) {
        if self.state == WorkerState::Uploading && self.outbox.is_empty() {
            self.upload_flushed = true;
            self.state = WorkerState::AwaitingResult;
        }
    }

    fn on_closed(&mut self, reason: String) {
        if !self.is_terminal() {
            self.fail(format!("worker closed the connection: {}", reason));
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state, WorkerState::Done | WorkerState::Failed)
    }
}
