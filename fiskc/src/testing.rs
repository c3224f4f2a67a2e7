//! In-memory stand-ins for the network, the compiler and the terminal.

use crate::args::CompilerInvocation;
use crate::context::OutputSink;
use crate::slots::{Slot, SlotController};
use crate::toolchain::{PreprocessResult, Toolchain, ToolchainError};
use crate::transport::{BoxChannel, ConnectRequest, Connection, Connector, Frame, TransportError};
use async_trait::async_trait;
use fisk_common::SlotKind;
use futures::{Sink, Stream};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

// ============================================================================
// Fake peer
// ============================================================================

/// What a [`FakePeer`] does with a frame it received.
pub enum PeerAction {
    Nothing,
    Reply(Vec<Frame>),
    /// Vanish: the frame is accepted, the following flush fails and reads
    /// end.
    Drop,
}

type Responder = Box<dyn FnMut(&Frame) -> PeerAction>;

#[derive(Default)]
struct PeerState {
    inbox: VecDeque<Frame>,
    sent: Vec<Frame>,
    ended: bool,
    dropped: bool,
    closed: bool,
    responder: Option<Responder>,
    waker: Option<Waker>,
}

impl PeerState {
    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

/// The far end of one connection.
#[derive(Clone, Default)]
pub struct FakePeer {
    state: Rc<RefCell<PeerState>>,
}

impl FakePeer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame for the client to read.
    pub fn push(&self, frame: Frame) {
        let mut state = self.state.borrow_mut();
        state.inbox.push_back(frame);
        state.wake();
    }

    /// End the stream after the queued frames.
    pub fn end(&self) {
        let mut state = self.state.borrow_mut();
        state.ended = true;
        state.wake();
    }

    pub fn sent(&self) -> Vec<Frame> {
        self.state.borrow().sent.clone()
    }

    pub fn sent_text(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Text(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn respond_with(&self, responder: impl FnMut(&Frame) -> PeerAction + 'static) {
        self.state.borrow_mut().responder = Some(Box::new(responder));
    }

    /// Answer every text frame with `json`.
    pub fn reply_to_text(&self, json: &str) {
        let json = json.to_string();
        self.respond_with(move |frame| match frame {
            Frame::Text(_) => PeerAction::Reply(vec![Frame::Text(json.clone())]),
            _ => PeerAction::Nothing,
        });
    }

    pub fn channel(&self) -> BoxChannel {
        Box::pin(FakeChannel {
            state: self.state.clone(),
        })
    }

    /// The client closed its side.
    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }
}

struct FakeChannel {
    state: Rc<RefCell<PeerState>>,
}

impl Stream for FakeChannel {
    type Item = Result<Frame, TransportError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut state = self.state.borrow_mut();
        if let Some(frame) = state.inbox.pop_front() {
            return Poll::Ready(Some(Ok(frame)));
        }
        if state.ended || state.dropped {
            return Poll::Ready(None);
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Sink<Frame> for FakeChannel {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let state = self.state.borrow();
        if state.dropped || state.closed {
            Poll::Ready(Err(TransportError::Closed))
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn start_send(self: Pin<&mut Self>, frame: Frame) -> Result<(), Self::Error> {
        let responder = {
            let mut state = self.state.borrow_mut();
            state.sent.push(frame.clone());
            state.responder.take()
        };
        let Some(mut responder) = responder else {
            return Ok(());
        };
        let action = responder(&frame);

        let mut state = self.state.borrow_mut();
        state.responder = Some(responder);
        match action {
            PeerAction::Nothing => {}
            PeerAction::Reply(frames) => state.inbox.extend(frames),
            PeerAction::Drop => {
                state.dropped = true;
                state.closed = true;
            }
        }
        state.wake();
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.state.borrow().dropped {
            Poll::Ready(Err(TransportError::Closed))
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let mut state = self.state.borrow_mut();
        state.closed = true;
        state.wake();
        Poll::Ready(Ok(()))
    }
}

// ============================================================================
// Fake connector
// ============================================================================

pub enum FakeEndpoint {
    Accept {
        peer: FakePeer,
        headers: HashMap<String, String>,
    },
    Refuse(TransportError),
    /// Never completes the handshake; times out after the request's bound.
    Hang,
}

#[derive(Default)]
struct ConnectorState {
    endpoints: VecDeque<FakeEndpoint>,
    requests: Vec<ConnectRequest>,
}

/// Hands out queued endpoints, one per connection attempt, in order.
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Rc<RefCell<ConnectorState>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&self, peer: &FakePeer) -> &Self {
        self.accept_with_headers(peer, &[])
    }

    pub fn accept_with_headers(&self, peer: &FakePeer, headers: &[(&str, &str)]) -> &Self {
        let headers = headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.to_string()))
            .collect();
        self.state
            .borrow_mut()
            .endpoints
            .push_back(FakeEndpoint::Accept {
                peer: peer.clone(),
                headers,
            });
        self
    }

    pub fn refuse(&self) -> &Self {
        self.state
            .borrow_mut()
            .endpoints
            .push_back(FakeEndpoint::Refuse(TransportError::Connect {
                url: "fake".to_string(),
                reason: "connection refused".to_string(),
            }));
        self
    }

    pub fn hang(&self) -> &Self {
        self.state.borrow_mut().endpoints.push_back(FakeEndpoint::Hang);
        self
    }

    /// Every connection attempt so far.
    pub fn requests(&self) -> Vec<ConnectRequest> {
        self.state.borrow().requests.clone()
    }
}

#[async_trait(?Send)]
impl Connector for FakeConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Connection, TransportError> {
        let endpoint = {
            let mut state = self.state.borrow_mut();
            state.requests.push(request.clone());
            state.endpoints.pop_front()
        };
        match endpoint {
            Some(FakeEndpoint::Accept { peer, headers }) => {
                Ok(Connection::new(peer.channel(), headers))
            }
            Some(FakeEndpoint::Refuse(error)) => Err(error),
            Some(FakeEndpoint::Hang) => {
                tokio::time::sleep(request.timeout).await;
                Err(TransportError::Timeout {
                    url: request.url,
                    after: request.timeout,
                })
            }
            None => Err(TransportError::Connect {
                url: request.url,
                reason: "no endpoint".to_string(),
            }),
        }
    }
}

// ============================================================================
// Fake toolchain
// ============================================================================

/// One local compile the orchestrator ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRun {
    pub args: Vec<String>,
    /// Kind of slot held during the run, if any.
    pub slot: Option<SlotKind>,
}

/// A scripted compiler.
pub struct FakeToolchain {
    preprocessed: PreprocessResult,
    preprocess_delay: Duration,
    hash: Option<String>,
    local_exit: i32,
    preprocess_runs: AtomicUsize,
    local_runs: Mutex<Vec<LocalRun>>,
}

impl Default for FakeToolchain {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeToolchain {
    pub fn new() -> Self {
        Self {
            preprocessed: PreprocessResult {
                stdout: b"int main(void) { return 0; }\n".to_vec(),
                ..Default::default()
            },
            preprocess_delay: Duration::ZERO,
            hash: Some("env-hash".to_string()),
            local_exit: 0,
            preprocess_runs: AtomicUsize::new(0),
            local_runs: Mutex::new(Vec::new()),
        }
    }

    pub fn with_preprocessed(mut self, exit_status: i32, stdout: &[u8], stderr: &[u8]) -> Self {
        self.preprocessed.exit_status = exit_status;
        self.preprocessed.stdout = stdout.to_vec();
        self.preprocessed.stderr = stderr.to_vec();
        self
    }

    pub fn with_preprocess_delay(mut self, delay: Duration) -> Self {
        self.preprocess_delay = delay;
        self
    }

    pub fn with_local_exit(mut self, code: i32) -> Self {
        self.local_exit = code;
        self
    }

    pub fn without_hash(mut self) -> Self {
        self.hash = None;
        self
    }

    pub fn preprocess_runs(&self) -> usize {
        self.preprocess_runs.load(Ordering::SeqCst)
    }

    pub fn local_runs(&self) -> Vec<LocalRun> {
        self.local_runs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Toolchain for FakeToolchain {
    fn argv0(&self) -> &str {
        "gcc"
    }

    fn environment_hash(&self) -> Result<String, ToolchainError> {
        self.hash.clone().ok_or_else(|| ToolchainError::Hash {
            path: "/usr/bin/gcc".into(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        })
    }

    async fn preprocess(
        &self,
        _invocation: &CompilerInvocation,
        slots: &SlotController,
    ) -> Result<PreprocessResult, ToolchainError> {
        self.preprocess_runs.fetch_add(1, Ordering::SeqCst);
        let _slot = slots.acquire_blocking(SlotKind::Preprocess).await;
        if !self.preprocess_delay.is_zero() {
            tokio::time::sleep(self.preprocess_delay).await;
        }
        Ok(self.preprocessed.clone())
    }

    async fn run_local(
        &self,
        invocation: &CompilerInvocation,
        slot: Option<Slot>,
    ) -> Result<i32, ToolchainError> {
        self.local_runs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(LocalRun {
                args: invocation.args.clone(),
                slot: slot.as_ref().map(Slot::kind),
            });
        Ok(self.local_exit)
    }
}

// ============================================================================
// Recording output
// ============================================================================

#[derive(Default)]
pub struct RecordingOutput {
    stdout: Mutex<Vec<u8>>,
    stderr: Mutex<Vec<u8>>,
}

impl RecordingOutput {
    pub fn stdout(&self) -> Vec<u8> {
        self.stdout
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn stderr(&self) -> Vec<u8> {
        self.stderr
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl OutputSink for RecordingOutput {
    fn write_stdout(&self, data: &[u8]) -> io::Result<()> {
        self.stdout
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .extend_from_slice(data);
        Ok(())
    }

    fn write_stderr(&self, data: &[u8]) -> io::Result<()> {
        self.stderr
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .extend_from_slice(data);
        Ok(())
    }
}
