//! Scheduler and worker wire protocol definitions.
//!
//! Every control message is a JSON text frame. Scheduler replies and worker
//! replies carry a `type` discriminator; either peer may instead answer with
//! `{"error": "..."}` before closing the connection. Payloads (preprocessed
//! source, compiler output) travel as binary frames that follow the control
//! message describing them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Client version reported to the scheduler.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit status used when the scheduler rejects this client's version.
pub const VERSION_MISMATCH_EXIT_CODE: i32 = 108;

/// HTTP headers exchanged during the websocket handshakes.
pub mod headers {
    /// Primary environment hash followed by `;`-joined compatible hashes.
    pub const ENVIRONMENTS: &str = "x-fisk-environments";
    pub const SOURCE_FILE: &str = "x-fisk-sourcefile";
    pub const CLIENT_NAME: &str = "x-fisk-client-name";
    pub const CLIENT_HOSTNAME: &str = "x-fisk-client-hostname";
    /// Preferred worker requested by the user.
    pub const SLAVE: &str = "x-fisk-slave";
    pub const NPM_VERSION: &str = "x-fisk-npm-version";
    pub const JOB_ID: &str = "x-fisk-job-id";
    /// Worker handshake response header; `"true"` means wait for a resume message.
    pub const WAIT: &str = "x-fisk-wait";
}

/// Errors produced while decoding a control frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("message has no type")]
    MissingType,

    #[error("unexpected message type '{0}'")]
    UnknownType(String),

    #[error("peer reported error: {0}")]
    Remote(String),
}

/// Decode a text frame into a JSON object, surfacing `{"error": ...}` replies
/// and returning the `type` discriminator.
fn decode_tagged(text: &str, known: &[&str]) -> Result<Value, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(ProtocolError::Malformed("expected a JSON object".to_string()));
    }
    if let Some(error) = value.get("error") {
        let message = match error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Err(ProtocolError::Remote(message));
    }
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?;
    if !known.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }
    Ok(value)
}

// ============================================================================
// Scheduler
// ============================================================================

/// First frame sent to the scheduler once the connection is open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerAnnouncement {
    pub client: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl SchedulerAnnouncement {
    pub const TYPE: &'static str = "compile";

    pub fn new(client: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            kind: Self::TYPE.to_string(),
        }
    }
}

/// Worker selected by the scheduler for one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAssignment {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub port: u16,
    #[serde(rename = "id", default)]
    pub job_id: u64,
    #[serde(default)]
    pub environment: String,
    #[serde(rename = "extraArgs", default)]
    pub extra_args: Vec<String>,
}

impl WorkerAssignment {
    /// Address to connect to; the IP wins over the advertised hostname.
    pub fn host(&self) -> &str {
        if self.ip.is_empty() {
            &self.hostname
        } else {
            &self.ip
        }
    }

    /// The scheduler answers `{"type": "slave"}` with no address when every
    /// worker is busy.
    pub fn is_usable(&self) -> bool {
        self.port != 0 && !self.host().is_empty()
    }

    pub fn compile_url(&self) -> String {
        format!("ws://{}:{}/compile", self.host(), self.port)
    }
}

/// Messages the scheduler sends to a compiling client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SchedulerMessage {
    /// No worker has an environment matching ours.
    #[serde(rename = "needsEnvironment")]
    NeedsEnvironment,

    #[serde(rename = "slave")]
    WorkerAssignment(WorkerAssignment),

    /// This client is older than the scheduler accepts.
    #[serde(rename = "version_mismatch")]
    VersionMismatch {
        #[serde(rename = "minimum_version", default)]
        min_version: String,
    },

    #[serde(rename = "version_verified")]
    VersionVerified {
        #[serde(rename = "minimum_version", default)]
        min_version: String,
    },
}

impl SchedulerMessage {
    const TYPES: [&'static str; 4] = [
        "needsEnvironment",
        "slave",
        "version_mismatch",
        "version_verified",
    ];

    /// Parse one scheduler text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value = decode_tagged(text, &Self::TYPES)?;
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Control message announcing the preprocessed payload that follows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "commandLine")]
    pub command_line: Vec<String>,
    pub argv0: String,
    /// Whether the worker asked us to wait before uploading.
    pub wait: bool,
    /// Size of the binary payload frame.
    pub bytes: u64,
}

impl JobEnvelope {
    pub const TYPE: &'static str = "job";

    pub fn new(command_line: Vec<String>, argv0: impl Into<String>, wait: bool, bytes: u64) -> Self {
        Self {
            kind: Self::TYPE.to_string(),
            command_line,
            argv0: argv0.into(),
            wait,
            bytes,
        }
    }
}

/// Stream a chunk of job output belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Stdout,
    Stderr,
    /// A file produced by the compiler (object file, dependency file).
    File,
}

/// One entry of a job response index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    #[serde(rename = "type")]
    pub kind: OutputKind,
    pub bytes: u64,
    /// Destination for [`OutputKind::File`] chunks; absent means the primary
    /// compiler output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Result header sent by the worker; binary frames totalling
/// [`JobResponse::total_bytes`] follow it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(rename = "exitCode", default)]
    pub exit_code: i32,
    #[serde(default)]
    pub index: Vec<OutputChunk>,
}

impl JobResponse {
    /// Sum of the index byte counts; `None` if it overflows.
    pub fn total_bytes(&self) -> Option<u64> {
        self.index
            .iter()
            .try_fold(0u64, |total, chunk| total.checked_add(chunk.bytes))
    }
}

/// Messages a worker sends to a compiling client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerMessage {
    /// The worker is ready for the upload it asked us to hold back.
    Resume,
    Response(JobResponse),
}

impl WorkerMessage {
    const TYPES: [&'static str; 2] = ["resume", "response"];

    /// Parse one worker text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value = decode_tagged(text, &Self::TYPES)?;
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_worker_assignment() {
        let json = r#"{
            "type": "slave",
            "ip": "10.0.0.5",
            "hostname": "builder-3",
            "environment": "abc123",
            "extraArgs": ["-fno-color-diagnostics"],
            "port": 4000,
            "id": 7
        }"#;

        let msg = SchedulerMessage::parse(json).unwrap();
        let SchedulerMessage::WorkerAssignment(assignment) = msg else {
            panic!("Expected WorkerAssignment variant");
        };
        assert_eq!(assignment.ip, "10.0.0.5");
        assert_eq!(assignment.hostname, "builder-3");
        assert_eq!(assignment.port, 4000);
        assert_eq!(assignment.job_id, 7);
        assert_eq!(assignment.environment, "abc123");
        assert_eq!(assignment.extra_args, vec!["-fno-color-diagnostics"]);
        assert!(assignment.is_usable());
        assert_eq!(assignment.compile_url(), "ws://10.0.0.5:4000/compile");
    }

    #[test]
    fn test_parse_empty_assignment_is_not_usable() {
        let msg = SchedulerMessage::parse(r#"{"type": "slave"}"#).unwrap();
        let SchedulerMessage::WorkerAssignment(assignment) = msg else {
            panic!("Expected WorkerAssignment variant");
        };
        assert!(!assignment.is_usable());
    }

    #[test]
    fn test_assignment_falls_back_to_hostname() {
        let assignment = WorkerAssignment {
            hostname: "builder-3".to_string(),
            port: 8096,
            ..Default::default()
        };
        assert_eq!(assignment.host(), "builder-3");
        assert!(assignment.is_usable());
    }

    #[test]
    fn test_parse_needs_environment() {
        let msg = SchedulerMessage::parse(r#"{"type": "needsEnvironment"}"#).unwrap();
        assert_eq!(msg, SchedulerMessage::NeedsEnvironment);
    }

    #[test]
    fn test_parse_version_messages() {
        let msg =
            SchedulerMessage::parse(r#"{"type": "version_mismatch", "minimum_version": "2.1.0"}"#)
                .unwrap();
        assert_eq!(
            msg,
            SchedulerMessage::VersionMismatch {
                min_version: "2.1.0".to_string()
            }
        );

        let msg = SchedulerMessage::parse(r#"{"type": "version_verified"}"#).unwrap();
        assert_eq!(
            msg,
            SchedulerMessage::VersionVerified {
                min_version: String::new()
            }
        );
    }

    #[test]
    fn test_parse_unknown_type() {
        let err = SchedulerMessage::parse(r#"{"type": "bogus"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownType("bogus".to_string()));
        assert!(!err.to_string().is_empty());
    }

    #[test]
    fn test_parse_error_reply() {
        let err = SchedulerMessage::parse(r#"{"error": "No x-fisk-environments header"}"#)
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Remote("No x-fisk-environments header".to_string())
        );
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(
            SchedulerMessage::parse("{not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            SchedulerMessage::parse("[1, 2]"),
            Err(ProtocolError::Malformed(_))
        ));
        assert_eq!(
            SchedulerMessage::parse(r#"{"ip": "10.0.0.5"}"#),
            Err(ProtocolError::MissingType)
        );
        // Port out of range for a TCP port.
        assert!(matches!(
            SchedulerMessage::parse(r#"{"type": "slave", "ip": "x", "port": 70000}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_announcement_json_structure() {
        let json = serde_json::to_string(&SchedulerAnnouncement::new("dev-box")).unwrap();
        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["client"], "dev-box");
        assert_eq!(parsed["type"], "compile");
    }

    #[test]
    fn test_job_envelope_json_structure() {
        let envelope = JobEnvelope::new(
            vec!["-c".to_string(), "main.c".to_string()],
            "gcc",
            true,
            1234,
        );
        let parsed: Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(parsed["type"], "job");
        assert_eq!(parsed["commandLine"][1], "main.c");
        assert_eq!(parsed["argv0"], "gcc");
        assert_eq!(parsed["wait"], true);
        assert_eq!(parsed["bytes"], 1234);
    }

    #[test]
    fn test_parse_worker_response() {
        let json = r#"{
            "type": "response",
            "success": true,
            "exitCode": 0,
            "index": [
                {"type": "stdout", "bytes": 3},
                {"type": "stderr", "bytes": 5},
                {"type": "file", "bytes": 10, "path": "main.o"}
            ]
        }"#;
        let WorkerMessage::Response(response) = WorkerMessage::parse(json).unwrap() else {
            panic!("Expected Response variant");
        };
        assert!(response.success);
        assert_eq!(response.total_bytes(), Some(18));
        assert_eq!(response.index[2].kind, OutputKind::File);
        assert_eq!(response.index[2].path.as_deref(), Some("main.o"));
    }

    #[test]
    fn test_total_bytes_overflow_is_none() {
        let json = r#"{
            "type": "response",
            "index": [
                {"type": "stdout", "bytes": 18446744073709551615},
                {"type": "stderr", "bytes": 2}
            ]
        }"#;
        let WorkerMessage::Response(response) = WorkerMessage::parse(json).unwrap() else {
            panic!("Expected Response variant");
        };
        assert_eq!(response.total_bytes(), None);
    }

    #[test]
    fn test_parse_worker_resume_and_errors() {
        assert_eq!(
            WorkerMessage::parse(r#"{"type": "resume"}"#).unwrap(),
            WorkerMessage::Resume
        );
        assert_eq!(
            WorkerMessage::parse(r#"{"error": "Invalid pathname /x"}"#),
            Err(ProtocolError::Remote("Invalid pathname /x".to_string()))
        );
        assert_eq!(
            WorkerMessage::parse(r#"{"type": "slave"}"#),
            Err(ProtocolError::UnknownType("slave".to_string()))
        );
    }
}
