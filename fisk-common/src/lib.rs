//! Shared types and utilities for the fisk compiler client.
//!
//! The `fiskc` wrapper and any future scheduler/worker tooling agree on the
//! wire messages defined in [`protocol`], the layered configuration in
//! [`config`] and the logging conventions in [`logging`].

pub mod config;
pub mod logging;
pub mod protocol;
pub mod types;
pub mod util;

pub use config::{ClientConfig, ConfigError, ConfigLayers, ConfigSource, EnvParser, Sourced};
pub use logging::{LogConfig, LoggingGuards, init_logging};
pub use protocol::{
    CLIENT_VERSION, JobEnvelope, JobResponse, OutputChunk, OutputKind, ProtocolError,
    SchedulerAnnouncement, SchedulerMessage, VERSION_MISMATCH_EXIT_CODE, WorkerAssignment,
    WorkerMessage, headers,
};
pub use types::{Environment, SlotKind, WatchdogStage};
