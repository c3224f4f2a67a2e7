//! Everything one compile needs, passed explicitly to the orchestrator.

use crate::args::CompilerInvocation;
use crate::cli::FiskFlags;
use crate::slots::SlotController;
use crate::toolchain::Toolchain;
use crate::transport::Connector;
use fisk_common::ClientConfig;
use std::io::{self, Write};
use std::sync::Arc;

/// Where compiler output shown to the user goes.
pub trait OutputSink {
    fn write_stdout(&self, data: &[u8]) -> io::Result<()>;
    fn write_stderr(&self, data: &[u8]) -> io::Result<()>;
}

/// The process's own stdout and stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdStreams;

impl OutputSink for StdStreams {
    fn write_stdout(&self, data: &[u8]) -> io::Result<()> {
        let mut out = io::stdout().lock();
        out.write_all(data)?;
        out.flush()
    }

    fn write_stderr(&self, data: &[u8]) -> io::Result<()> {
        let mut err = io::stderr().lock();
        err.write_all(data)?;
        err.flush()
    }
}

pub struct ClientContext {
    pub config: ClientConfig,
    pub flags: FiskFlags,
    pub invocation: CompilerInvocation,
    pub slots: SlotController,
    pub toolchain: Arc<dyn Toolchain>,
    pub connector: Box<dyn Connector>,
    pub output: Arc<dyn OutputSink>,
    /// Set when the remote path is unusable for this run, e.g. a broken
    /// config file.
    pub remote_disabled: Option<String>,
}

impl ClientContext {
    /// Why this compile must run locally before anything else is tried.
    pub fn forced_local_reason(&self) -> Option<String> {
        if self.flags.disabled {
            return Some("fisk disabled".to_string());
        }
        if let Some(reason) = &self.remote_disabled {
            return Some(reason.clone());
        }
        self.invocation.local_reason()
    }
}
