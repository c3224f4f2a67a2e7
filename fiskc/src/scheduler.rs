//! Scheduler conversation: announce the job, receive a worker (or a reason
//! why not).
//!
//! The protocol is a pure state machine over [`Frame`]s; I/O is done by the
//! [`ProtocolConnection`](crate::connection::ProtocolConnection) that owns it.
//! Exactly one terminal transition happens per connection and frames after it
//! are ignored.

use crate::connection::FrameProtocol;
use crate::transport::Frame;
use fisk_common::{ProtocolError, SchedulerAnnouncement, SchedulerMessage, WorkerAssignment};
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Connecting,
    HandshakeSent,
    AwaitingAssignment,
    Done,
    Failed,
}

/// How the scheduler conversation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerOutcome {
    Assigned(WorkerAssignment),
    /// `slave` reply without an address: every worker is busy.
    NoWorker,
    NeedsEnvironment,
    VersionVerified { min_version: String },
    /// This client is too old. Fatal: the caller must not fall back.
    VersionMismatch { min_version: String },
    Failed(String),
}

#[derive(Debug)]
pub struct SchedulerProtocol {
    client: String,
    state: SchedulerState,
    outbox: VecDeque<Frame>,
    outcome: Option<SchedulerOutcome>,
}

impl SchedulerProtocol {
    /// `client` is the name announced in the first frame.
    pub fn new(client: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            state: SchedulerState::Connecting,
            outbox: VecDeque::new(),
            outcome: None,
        }
    }

    /// The connection is open: queue the job announcement.
    pub fn on_open(&mut self) {
        if self.state != SchedulerState::Connecting {
            return;
        }
        match serde_json::to_string(&SchedulerAnnouncement::new(self.client.as_str())) {
            Ok(json) => {
                self.outbox.push_back(Frame::Text(json));
                self.state = SchedulerState::HandshakeSent;
            }
            Err(e) => self.fail(format!("failed to encode announcement: {}", e)),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn outcome(&self) -> Option<&SchedulerOutcome> {
        self.outcome.as_ref()
    }

    pub fn take_outcome(&mut self) -> Option<SchedulerOutcome> {
        self.outcome.take()
    }

    pub fn assignment(&self) -> Option<&WorkerAssignment> {
        match &self.outcome {
            Some(SchedulerOutcome::Assigned(assignment)) => Some(assignment),
            _ => None,
        }
    }

    pub fn needs_environment(&self) -> bool {
        self.outcome == Some(SchedulerOutcome::NeedsEnvironment)
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            Some(SchedulerOutcome::Failed(error)) => Some(error.as_str()),
            _ => None,
        }
    }

    fn finish(&mut self, outcome: SchedulerOutcome) {
        self.state = match outcome {
            SchedulerOutcome::Failed(_) | SchedulerOutcome::VersionMismatch { .. } => {
                SchedulerState::Failed
            }
            _ => SchedulerState::Done,
        };
        self.outbox.clear();
        self.outcome = Some(outcome);
    }

    fn fail(&mut self, error: String) {
        debug!("Scheduler protocol failed: {}", error);
        self.finish(SchedulerOutcome::Failed(error));
    }

    fn dispatch(&mut self, message: SchedulerMessage) {
        match message {
            SchedulerMessage::NeedsEnvironment => {
                debug!("Scheduler has no worker with our environment");
                self.finish(SchedulerOutcome::NeedsEnvironment);
            }
            SchedulerMessage::WorkerAssignment(assignment) if assignment.is_usable() => {
                debug!(
                    "Scheduler assigned {}:{} (job {})",
                    assignment.host(),
                    assignment.port,
                    assignment.job_id
                );
                self.finish(SchedulerOutcome::Assigned(assignment));
            }
            SchedulerMessage::WorkerAssignment(_) => {
                debug!("Scheduler has no worker available");
                self.finish(SchedulerOutcome::NoWorker);
            }
            SchedulerMessage::VersionMismatch { min_version } => {
                warn!(
                    "fisk client version {} is too old for the scheduler (minimum {})",
                    fisk_common::CLIENT_VERSION,
                    min_version
                );
                self.finish(SchedulerOutcome::VersionMismatch { min_version });
            }
            SchedulerMessage::VersionVerified { min_version } => {
                warn!(
                    "Scheduler verified version (minimum {}) without assigning a worker",
                    min_version
                );
                self.finish(SchedulerOutcome::VersionVerified { min_version });
            }
        }
    }
}

impl FrameProtocol for SchedulerProtocol {
    fn name(&self) -> &str {
        "scheduler"
    }

    fn poll_outbound(&mut self) -> Option<Frame> {
        self.outbox.pop_front()
    }

    fn on_frame(&mut self, frame: Frame) {
        if self.is_terminal() {
            trace!("Ignoring {} frame from scheduler after {:?}", frame.kind(), self.state);
            return;
        }
        if self.state == SchedulerState::Connecting {
            self.fail("scheduler spoke before the announcement".to_string());
            return;
        }
        match frame {
            Frame::Text(text) => match SchedulerMessage::parse(&text) {
                Ok(message) => self.dispatch(message),
                Err(ProtocolError::Remote(message)) => {
                    self.fail(format!("scheduler error: {}", message))
                }
                Err(e) => self.fail(format!("bad scheduler message: {}", e)),
            },
            Frame::Binary(data) => {
                self.fail(format!("unexpected binary frame ({} bytes) from scheduler", data.len()))
            }
            Frame::Close(reason) => self.on_closed(reason.unwrap_or_default()),
        }
    }

    fn on_flushed(&mut self) {
        if self.state == SchedulerState::HandshakeSent {
            self.state = SchedulerState::AwaitingAssignment;
        }
    }

    fn on_closed(&mut self, reason: String) {
        if !self.is_terminal() {
            self.fail(format!("scheduler closed the connection: {}", reason));
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state, SchedulerState::Done | SchedulerState::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ProtocolConnection;
    use crate::mux::{Multiplexer, run_until};
    use crate::testing::FakePeer;
    use serde_json::Value;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn awaiting() -> SchedulerProtocol {
        let mut protocol = SchedulerProtocol::new("dev-box");
        protocol.on_open();
        assert!(protocol.poll_outbound().is_some());
        protocol.on_flushed();
        assert_eq!(protocol.state(), SchedulerState::AwaitingAssignment);
        protocol
    }

    fn text(json: &str) -> Frame {
        Frame::Text(json.to_string())
    }

    #[test]
    fn test_open_queues_announcement() {
        let mut protocol = SchedulerProtocol::new("dev-box");
        assert_eq!(protocol.state(), SchedulerState::Connecting);
        protocol.on_open();
        assert_eq!(protocol.state(), SchedulerState::HandshakeSent);

        let Some(Frame::Text(json)) = protocol.poll_outbound() else {
            panic!("Expected announcement");
        };
        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["client"], "dev-box");
        assert_eq!(parsed["type"], "compile");
        assert!(protocol.poll_outbound().is_none());

        // A second open does not announce twice.
        protocol.on_open();
        assert!(protocol.poll_outbound().is_none());
    }

    #[test]
    fn test_assignment_is_captured() {
        let mut protocol = awaiting();
        protocol.on_frame(text(
            r#"{"type":"slave","ip":"10.0.0.5","hostname":"b3","port":4000,"id":7,
               "environment":"abc","extraArgs":["-g0"]}"#,
        ));

        assert_eq!(protocol.state(), SchedulerState::Done);
        let assignment = protocol.assignment().unwrap();
        assert_eq!(assignment.ip, "10.0.0.5");
        assert_eq!(assignment.hostname, "b3");
        assert_eq!(assignment.port, 4000);
        assert_eq!(assignment.job_id, 7);
        assert_eq!(assignment.environment, "abc");
        assert_eq!(assignment.extra_args, vec!["-g0"]);
    }

    #[test]
    fn test_empty_assignment_means_no_worker() {
        let mut protocol = awaiting();
        protocol.on_frame(text(r#"{"type":"slave"}"#));
        assert_eq!(protocol.state(), SchedulerState::Done);
        assert_eq!(protocol.outcome(), Some(&SchedulerOutcome::NoWorker));
        assert!(protocol.assignment().is_none());
    }

    #[test]
    fn test_needs_environment() {
        let mut protocol = awaiting();
        protocol.on_frame(text(r#"{"type":"needsEnvironment"}"#));
        assert_eq!(protocol.state(), SchedulerState::Done);
        assert!(protocol.needs_environment());
    }

    #[test]
    fn test_version_mismatch_is_distinct() {
        let mut protocol = awaiting();
        protocol.on_frame(text(r#"{"type":"version_mismatch","minimum_version":"9.0.0"}"#));
        assert_eq!(protocol.state(), SchedulerState::Failed);
        assert_eq!(
            protocol.outcome(),
            Some(&SchedulerOutcome::VersionMismatch {
                min_version: "9.0.0".to_string()
            })
        );
        assert!(protocol.error().is_none());
    }

    #[test]
    fn test_version_verified_has_no_assignment() {
        let mut protocol = awaiting();
        protocol.on_frame(text(r#"{"type":"version_verified","minimum_version":"1.0.0"}"#));
        assert_eq!(protocol.state(), SchedulerState::Done);
        assert!(protocol.assignment().is_none());
        assert!(matches!(
            protocol.outcome(),
            Some(SchedulerOutcome::VersionVerified { .. })
        ));
    }

    #[test]
    fn test_bad_frames_fail_with_error() {
        let frames = [
            text(r#"{"type":"bogus"}"#),
            text("not json"),
            text(r#"{"error":"No x-fisk-environments header"}"#),
            Frame::Binary(vec![1, 2, 3]),
        ];
        for frame in frames {
            let mut protocol = awaiting();
            protocol.on_frame(frame);
            assert_eq!(protocol.state(), SchedulerState::Failed);
            assert!(!protocol.error().unwrap().is_empty());
        }
    }

    #[test]
    fn test_close_before_terminal_fails() {
        let mut protocol = awaiting();
        protocol.on_closed("connection reset".to_string());
        assert_eq!(protocol.state(), SchedulerState::Failed);
        assert!(protocol.error().unwrap().contains("connection reset"));
    }

    #[test]
    fn test_frames_after_terminal_are_ignored() {
        let mut protocol = awaiting();
        protocol.on_frame(text(r#"{"type":"needsEnvironment"}"#));
        protocol.on_frame(text(r#"{"type":"slave","ip":"10.0.0.5","port":4000}"#));
        protocol.on_frame(text("garbage"));
        protocol.on_closed("bye".to_string());
        assert_eq!(protocol.state(), SchedulerState::Done);
        assert!(protocol.needs_environment());
    }

    #[test]
    fn test_frame_before_open_fails() {
        let mut protocol = SchedulerProtocol::new("dev-box");
        protocol.on_frame(text(r#"{"type":"needsEnvironment"}"#));
        assert_eq!(protocol.state(), SchedulerState::Failed);
    }

    #[tokio::test]
    async fn test_conversation_over_connection() {
        let peer = FakePeer::new();
        peer.reply_to_text(r#"{"type":"slave","ip":"10.0.0.5","port":4000,"id":7}"#);

        let mut protocol = SchedulerProtocol::new("dev-box");
        protocol.on_open();
        let conn = Rc::new(RefCell::new(ProtocolConnection::new(peer.channel(), protocol)));
        let mut mux = Multiplexer::new();
        mux.add(conn.clone());

        run_until(&mut mux, || conn.borrow().protocol().is_terminal())
            .await
            .unwrap();
        assert_eq!(conn.borrow().protocol().assignment().unwrap().job_id, 7);
        assert_eq!(peer.sent().len(), 1);
    }
}
