//! Configuration system for the fisk client.
//!
//! This module provides:
//! - Layered JSON config files (user config, then system config)
//! - Environment variable parsing with error collection
//! - Source tracking for debugging
//! - The resolved [`ClientConfig`] with documented defaults

mod env;
mod file;
mod source;

pub use env::{EnvError, EnvParser};
pub use file::ConfigLayers;
pub use source::{ConfigSource, Sourced};

use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors raised while loading config files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file {0} is empty")]
    Empty(PathBuf),

    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

pub const DEFAULT_SCHEDULER: &str = "ws://localhost:8097";
pub const DEFAULT_SCHEDULER_CONNECT_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_ACQUIRED_SLAVE_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_SLAVE_CONNECT_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_UPLOAD_JOB_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_LOG_LEVEL: &str = "error";

/// Resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Scheduler URL as configured; see [`ClientConfig::scheduler_endpoint`].
    pub scheduler: String,
    pub scheduler_connect_timeout: Duration,
    /// Time allowed between reaching the scheduler and getting a worker.
    pub acquired_slave_timeout: Duration,
    /// Transport connect timeout for the worker connection.
    pub slave_connect_timeout: Duration,
    pub upload_job_timeout: Duration,
    pub response_timeout: Duration,
    pub client_name: String,
    pub cache_dir: Option<PathBuf>,
    pub compile_slots: usize,
    pub cpp_slots: usize,
    /// Enforce stage deadlines.
    pub watchdog: bool,
    /// Never try a local compile slot before going remote.
    pub no_local: bool,
    /// Environment hash -> hashes of remote environments that can build for it.
    pub compatible_hashes: HashMap<String, Vec<String>>,
    pub log_file: Option<PathBuf>,
    pub log_file_append: bool,
    pub log_level: String,
    /// Advertised as `x-fisk-client-hostname` when set.
    pub hostname: Option<String>,
    pub name: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_layers(&ConfigLayers::default())
    }
}

impl ClientConfig {
    /// Config files consulted by [`ClientConfig::load`], highest precedence first.
    pub fn default_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config/fisk/client.conf"));
        }
        paths.push(PathBuf::from("/etc/xdg/fisk/client.conf"));
        paths
    }

    /// Load the user and system config files.
    pub fn load() -> Result<Self, ConfigError> {
        let layers = ConfigLayers::load(&Self::default_paths())?;
        Ok(Self::from_layers(&layers))
    }

    /// Resolve every key against `layers`, falling back to defaults.
    pub fn from_layers(layers: &ConfigLayers) -> Self {
        let cpus = host_cpus();
        let millis = |key: &str, default: u64| {
            let value = layers
                .integer(key)
                .and_then(|v| u64::try_from(v.value).ok())
                .unwrap_or(default);
            Duration::from_millis(value)
        };

        let compile_slots = match layers.integer("slots") {
            Some(slots) => slots.value.max(1) as usize,
            None => match layers.integer("desired_slots") {
                Some(desired) if desired.value > 0 => desired.value as usize,
                _ => cpus,
            },
        };
        let cpp_slots = layers
            .integer("cpp-slots")
            .map(|slots| slots.value.max(1) as usize)
            .unwrap_or(cpus * 2);

        let hostname = layers.string("hostname").map(|h| h.value);
        let name = layers
            .string("name")
            .map(|n| n.value)
            .or_else(|| hostname.clone())
            .unwrap_or_else(os_hostname);
        let client_name = layers
            .string("client-name")
            .map(|n| n.value)
            .unwrap_or_else(|| name.clone());

        let cache_dir = layers
            .string("cache-dir")
            .map(|dir| dir.value)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|home| home.join(".cache/fisk/client")));

        let scheduler = layers.string("scheduler");
        if let Some(scheduler) = &scheduler {
            debug!("scheduler = {} (from {})", scheduler.value, scheduler.source);
        }

        Self {
            scheduler: scheduler
                .map(|s| s.value)
                .unwrap_or_else(|| DEFAULT_SCHEDULER.to_string()),
            scheduler_connect_timeout: millis(
                "scheduler-connect-timeout",
                DEFAULT_SCHEDULER_CONNECT_TIMEOUT_MS,
            ),
            acquired_slave_timeout: millis(
                "acquired-slave-timeout",
                DEFAULT_ACQUIRED_SLAVE_TIMEOUT_MS,
            ),
            slave_connect_timeout: millis("slave-connect-timeout", DEFAULT_SLAVE_CONNECT_TIMEOUT_MS),
            upload_job_timeout: millis("upload-job-timeout", DEFAULT_UPLOAD_JOB_TIMEOUT_MS),
            response_timeout: millis("response-timeout", DEFAULT_RESPONSE_TIMEOUT_MS),
            client_name,
            cache_dir,
            compile_slots,
            cpp_slots,
            watchdog: layers.boolean("watchdog").map(|b| b.value).unwrap_or(true),
            no_local: layers.boolean("no-local").map(|b| b.value).unwrap_or(false),
            compatible_hashes: parse_compatible_hashes(layers.get("compatible-hashes")),
            log_file: layers.string("log-file").map(|f| PathBuf::from(f.value)),
            log_file_append: layers
                .boolean("log-file-append")
                .map(|b| b.value)
                .unwrap_or(false),
            log_level: layers
                .string("log-level")
                .map(|l| l.value)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            hostname,
            name,
        }
    }

    /// Websocket URL of the scheduler's compile endpoint.
    ///
    /// A bare `host:port` gets the `ws://` scheme and a URL without a path
    /// gets `/compile` appended.
    pub fn scheduler_endpoint(&self) -> String {
        let base = self.scheduler.trim().trim_end_matches('/');
        let base = if base.contains("://") {
            base.to_string()
        } else {
            format!("ws://{}", base)
        };
        let authority_start = base.find("://").map(|i| i + 3).unwrap_or(0);
        if base[authority_start..].contains('/') {
            base
        } else {
            format!("{}/compile", base)
        }
    }

    /// Remote environments declared compatible with `hash`.
    pub fn compatible_hashes(&self, hash: &str) -> Vec<String> {
        self.compatible_hashes.get(hash).cloned().unwrap_or_default()
    }

    /// Path of the compiler environment hash cache.
    pub fn environment_cache(&self) -> Option<PathBuf> {
        self.cache_dir
            .as_ref()
            .map(|dir| dir.join("environment_cache.json"))
    }
}

fn parse_compatible_hashes(value: Option<Sourced<&Value>>) -> HashMap<String, Vec<String>> {
    let Some(Value::Object(map)) = value.map(|v| v.value) else {
        return HashMap::new();
    };
    map.iter()
        .filter_map(|(hash, aliases)| {
            let aliases = match aliases {
                Value::String(alias) => vec![alias.clone()],
                Value::Array(items) => items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect(),
                _ => return None,
            };
            Some((hash.clone(), aliases))
        })
        .collect()
}

fn host_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn os_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
