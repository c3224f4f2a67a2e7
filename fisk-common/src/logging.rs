//! Logging setup shared by fisk binaries.
//!
//! The compiler wrapper must stay quiet by default: its stderr is the
//! compiler's stderr as far as the build system is concerned. Logging goes to
//! stderr only when explicitly raised, or to a log file.

use crate::config::{ConfigSource, EnvParser, Sourced};
use std::fs::OpenOptions;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Logging configuration resolved from flags, environment and config.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Sourced<String>,
    pub file: Option<Sourced<PathBuf>>,
    pub append: bool,
}

impl LogConfig {
    /// Read `FISK_LOG`, `FISK_DEBUG`, `FISK_VERBOSE`, `FISK_LOG_FILE` and
    /// `FISK_LOG_APPEND`, with `default_level` when none sets a level.
    pub fn from_env(default_level: &str) -> Self {
        Self::from_parser(&mut EnvParser::new(), default_level)
    }

    pub fn from_parser(env: &mut EnvParser, default_level: &str) -> Self {
        let level = if let Some(level) = env.get_string("LOG") {
            level
        } else if env.is_set("VERBOSE") {
            Sourced::from_env("trace".to_string(), "FISK_VERBOSE")
        } else if env.is_set("DEBUG") {
            Sourced::from_env("debug".to_string(), "FISK_DEBUG")
        } else {
            Sourced::default_value(default_level.to_string())
        };
        Self {
            level,
            file: env.get_path("LOG_FILE"),
            append: env.get_bool("LOG_APPEND").map(|b| b.value).unwrap_or(false),
        }
    }

    /// Use `level` unless a higher precedence source already chose one.
    pub fn with_fallback_level(mut self, level: &str, source: ConfigSource) -> Self {
        if self.level.is_default() {
            self.level = Sourced::new(level.to_string(), source);
        }
        self
    }

    /// Override the level from the command line.
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = Sourced::new(level.into(), ConfigSource::Cli);
        self
    }

    /// Use `file` unless the environment already named one.
    pub fn with_fallback_file(mut self, file: Option<PathBuf>, append: bool) -> Self {
        if self.file.is_none()
            && let Some(file) = file
        {
            self.file = Some(Sourced::default_value(file));
            self.append = self.append || append;
        }
        self
    }

    /// Override the log file from the command line.
    pub fn with_file(mut self, file: PathBuf) -> Self {
        self.file = Some(Sourced::new(file, ConfigSource::Cli));
        self
    }

    /// `EnvFilter` directive for the configured level.
    pub fn filter_directive(&self) -> String {
        normalize_level(&self.level.value)
    }
}

/// Map fisk level names onto `tracing` filter directives.
pub fn normalize_level(level: &str) -> String {
    match level.trim().to_lowercase().as_str() {
        "" | "silent" | "none" | "off" => "off".to_string(),
        "verbose" => "trace".to_string(),
        "warning" => "warn".to_string(),
        "fatal" => "error".to_string(),
        other => other.to_string(),
    }
}

/// Keeps non-blocking writers flushing until dropped.
#[derive(Default)]
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

/// Install the global subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<LoggingGuards> {
    let filter = EnvFilter::try_new(config.filter_directive())
        .unwrap_or_else(|_| EnvFilter::new(crate::config::DEFAULT_LOG_LEVEL));
    let mut guards = LoggingGuards::default();

    if let Some(file) = &config.file {
        let mut options = OpenOptions::new();
        options.create(true);
        if config.append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        let file = options.open(&file.value)?;
        let (writer, guard) = tracing_appender::non_blocking(file);
        guards._guards.push(guard);
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(writer).with_ansi(false))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .try_init()?;
    }
    Ok(guards)
}
