//! Common types used across fisk components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of local compute capacity guarded by a host-wide semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    /// Full compiler invocations run on this host.
    Compile,
    /// Preprocessor runs feeding remote jobs.
    Preprocess,
}

impl SlotKind {
    pub const ALL: [SlotKind; 2] = [SlotKind::Compile, SlotKind::Preprocess];

    /// Stable index for per-kind tables.
    pub fn index(self) -> usize {
        match self {
            Self::Compile => 0,
            Self::Preprocess => 1,
        }
    }

    /// Name of the kernel-visible semaphore shared by every client on the host.
    pub fn semaphore_name(self) -> &'static str {
        match self {
            Self::Compile => "/fisk.compile",
            Self::Preprocess => "/fisk.cpp",
        }
    }
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile => write!(f, "compile"),
            Self::Preprocess => write!(f, "preprocess"),
        }
    }
}

/// Checkpoints of a remote compile, in the order they are reached.
///
/// Stages only move forward; each one has its own deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogStage {
    Init,
    ConnectedToScheduler,
    AcquiredWorker,
    UploadedJob,
    Finished,
}

impl WatchdogStage {
    pub const COUNT: usize = 5;

    pub fn index(self) -> usize {
        self as usize
    }

    /// The stage after this one, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Init => Some(Self::ConnectedToScheduler),
            Self::ConnectedToScheduler => Some(Self::AcquiredWorker),
            Self::AcquiredWorker => Some(Self::UploadedJob),
            Self::UploadedJob => Some(Self::Finished),
            Self::Finished => None,
        }
    }
}

impl fmt::Display for WatchdogStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::ConnectedToScheduler => "connected-to-scheduler",
            Self::AcquiredWorker => "acquired-worker",
            Self::UploadedJob => "uploaded-job",
            Self::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Toolchain identity announced to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    /// Hash of the local compiler.
    pub hash: String,
    /// Hashes of remote environments declared compatible with `hash`.
    pub compatible: Vec<String>,
}

impl Environment {
    pub fn new(hash: impl Into<String>, compatible: Vec<String>) -> Self {
        Self {
            hash: hash.into(),
            compatible,
        }
    }

    /// Value of the `x-fisk-environments` header: primary hash first, then
    /// the compatible hashes, `;`-separated.
    pub fn header_value(&self) -> String {
        std::iter::once(self.hash.as_str())
            .chain(self.compatible.iter().map(String::as_str))
            .filter(|hash| !hash.is_empty())
            .collect::<Vec<_>>()
            .join(";")
    }
}
