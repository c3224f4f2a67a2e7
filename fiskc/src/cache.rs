//! On-disk client cache.
//!
//! The cache directory carries a `version` stamp; a directory written by a
//! different client version is wiped and recreated. It also stores the
//! compiler environment hashes so the compiler binary is only hashed again
//! after it changes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

/// Bumped whenever the cache layout changes.
pub const CACHE_VERSION: u32 = 4;

const VERSION_FILE: &str = "version";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Stamp matched; contents kept.
    Current,
    /// Missing or stale stamp; directory recreated.
    Recreated,
}

fn read_stamp(path: &Path) -> Option<u32> {
    let mut file = File::open(path).ok()?;
    if let Err(e) = file.lock_shared() {
        warn!("Failed to lock {}: {}, reading unlocked", path.display(), e);
    }
    let mut bytes = [0u8; 4];
    let read = file.read_exact(&mut bytes);
    let _ = file.unlock();
    read.ok()?;
    Some(u32::from_be_bytes(bytes))
}

fn write_stamp(path: &Path, version: u32) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    if let Err(e) = file.lock() {
        warn!("Failed to lock {}: {}, writing unlocked", path.display(), e);
    }
    let result = file.set_len(0).and_then(|_| file.write_all(&version.to_be_bytes()));
    let _ = file.unlock();
    result
}

/// Make sure `dir` exists and carries the current [`CACHE_VERSION`].
pub fn prepare_cache_dir(dir: &Path) -> io::Result<CacheState> {
    prepare_cache_dir_with_version(dir, CACHE_VERSION)
}

fn prepare_cache_dir_with_version(dir: &Path, version: u32) -> io::Result<CacheState> {
    let stamp = dir.join(VERSION_FILE);
    if read_stamp(&stamp) == Some(version) {
        return Ok(CacheState::Current);
    }

    debug!("Recreating cache dir {}", dir.display());
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::create_dir_all(dir)?;
    write_stamp(&stamp, version)?;
    Ok(CacheState::Recreated)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CachedHash {
    size: u64,
    mtime_secs: u64,
    mtime_nanos: u32,
    hash: String,
}

impl CachedHash {
    fn matches(&self, metadata: &Metadata) -> bool {
        let (secs, nanos) = mtime(metadata);
        self.size == metadata.len() && self.mtime_secs == secs && self.mtime_nanos == nanos
    }
}

fn mtime(metadata: &Metadata) -> (u64, u32) {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|d| (d.as_secs(), d.subsec_nanos()))
        .unwrap_or((0, 0))
}

/// Compiler path -> environment hash, invalidated by size and mtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentCache {
    #[serde(default)]
    entries: HashMap<String, CachedHash>,
}

impl EnvironmentCache {
    /// Load from `path`; a missing or unreadable cache is empty.
    pub fn load(path: &Path) -> Self {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                debug!("Ignoring environment cache {}: {}", path.display(), e);
                return Self::default();
            }
        };
        serde_json::from_str(&contents).unwrap_or_else(|e| {
            debug!("Ignoring corrupt environment cache {}: {}", path.display(), e);
            Self::default()
        })
    }

    /// Write atomically through a temporary file in the same directory.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_vec(self).map_err(io::Error::other)?;
        let tmp = PathBuf::from(format!("{}.{}.tmp", path.display(), std::process::id()));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)
    }

    pub fn lookup(&self, compiler: &Path, metadata: &Metadata) -> Option<&str> {
        self.entries
            .get(compiler.to_string_lossy().as_ref())
            .filter(|entry| entry.matches(metadata))
            .map(|entry| entry.hash.as_str())
    }

    pub fn insert(&mut self, compiler: &Path, metadata: &Metadata, hash: impl Into<String>) {
        let (mtime_secs, mtime_nanos) = mtime(metadata);
        self.entries.insert(
            compiler.to_string_lossy().into_owned(),
            CachedHash {
                size: metadata.len(),
                mtime_secs,
                mtime_nanos,
                hash: hash.into(),
            },
        );
    }
}
