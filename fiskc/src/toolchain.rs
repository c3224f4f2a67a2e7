//! The local compiler: locating it, hashing it, running it.
//!
//! The orchestrator only talks to the [`Toolchain`] trait, so tests can swap
//! in a scripted compiler. [`SystemToolchain`] runs the real binary through
//! `tokio::process`.

use crate::args::CompilerInvocation;
use crate::cache::EnvironmentCache;
use crate::slots::{Slot, SlotController};
use async_trait::async_trait;
use fisk_common::SlotKind;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Name of the wrapper binary; never picked as the compiler.
const WRAPPER_NAME: &str = "fiskc";

#[derive(Debug, Error)]
pub enum ToolchainError {
    #[error("no compiler named {0} found in PATH")]
    NotFound(String),

    #[error("no compiler given; run as `fiskc <compiler> ...` or set FISK_COMPILER")]
    NoCompiler,

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to hash {path}: {source}")]
    Hash {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("preprocessor task failed: {0}")]
    Task(String),
}

/// Output of one preprocessor run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreprocessResult {
    pub exit_status: i32,
    /// The preprocessed translation unit.
    pub stdout: Vec<u8>,
    /// Diagnostics, shown to the user once.
    pub stderr: Vec<u8>,
    pub wall_duration: Duration,
    /// Time spent waiting for a preprocess slot.
    pub slot_wait: Duration,
}

impl PreprocessResult {
    pub fn succeeded(&self) -> bool {
        self.exit_status == 0
    }
}

#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Compiler name as sent to workers.
    fn argv0(&self) -> &str;

    /// Identifies the compiler build; workers must have a matching
    /// environment.
    fn environment_hash(&self) -> Result<String, ToolchainError>;

    /// Run the preprocessor, holding a preprocess slot while it runs.
    async fn preprocess(
        &self,
        invocation: &CompilerInvocation,
        slots: &SlotController,
    ) -> Result<PreprocessResult, ToolchainError>;

    /// Run the full compile locally with inherited stdio. `slot` is held
    /// until the compiler exits.
    async fn run_local(
        &self,
        invocation: &CompilerInvocation,
        slot: Option<Slot>,
    ) -> Result<i32, ToolchainError>;
}

/// Exit code of a finished child; signals map to `128 + signal`.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// Hash a file's contents with blake3.
pub fn hash_file(path: &Path) -> Result<String, ToolchainError> {
    let hash_error = |source| ToolchainError::Hash {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(hash_error)?;
    let mut hasher = blake3::Hasher::new();
    hasher.update_reader(file).map_err(hash_error)?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// The compiler found on this host.
#[derive(Debug, Clone)]
pub struct SystemToolchain {
    compiler: PathBuf,
    argv0: String,
    env_cache: Option<PathBuf>,
}

impl SystemToolchain {
    pub fn new(compiler: PathBuf, argv0: impl Into<String>) -> Self {
        Self {
            compiler,
            argv0: argv0.into(),
            env_cache: None,
        }
    }

    /// Remember environment hashes in `path` between runs.
    pub fn with_env_cache(mut self, path: Option<PathBuf>) -> Self {
        self.env_cache = path;
        self
    }
}

#[async_trait]
impl Toolchain for SystemToolchain {
    fn argv0(&self) -> &str {
        &self.argv0
    }

    fn environment_hash(&self) -> Result<String, ToolchainError> {
        let metadata = fs::metadata(&self.compiler).map_err(|source| ToolchainError::Hash {
            path: self.compiler.clone(),
            source,
        })?;
        let Some(cache_path) = self.env_cache.as_deref() else {
            return hash_file(&self.compiler);
        };

        let mut cache = EnvironmentCache::load(cache_path);
        if let Some(hash) = cache.lookup(&self.compiler, &metadata) {
            return Ok(hash.to_string());
        }
        let hash = hash_file(&self.compiler)?;
        debug!("Hashed {}: {}", self.compiler.display(), hash);
        cache.insert(&self.compiler, &metadata, hash.clone());
        if let Err(e) = cache.save(cache_path) {
            warn!("Failed to save environment cache {}: {}", cache_path.display(), e);
        }
        Ok(hash)
    }

    async fn preprocess(
        &self,
        invocation: &CompilerInvocation,
        slots: &SlotController,
    ) -> Result<PreprocessResult, ToolchainError> {
        let waited = Instant::now();
        let _slot = slots.acquire_blocking(SlotKind::Preprocess).await;
        let slot_wait = waited.elapsed();

        let started = Instant::now();
        let output = Command::new(&self.compiler)
            .args(invocation.preprocess_args())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ToolchainError::Spawn {
                program: self.compiler.display().to_string(),
                source,
            })?;

        let result = PreprocessResult {
            exit_status: exit_code(output.status),
            stdout: output.stdout,
            stderr: output.stderr,
            wall_duration: started.elapsed(),
            slot_wait,
        };
        debug!(
            "Preprocessed {} bytes in {}ms (slot wait {}ms), exit {}",
            result.stdout.len(),
            result.wall_duration.as_millis(),
            result.slot_wait.as_millis(),
            result.exit_status
        );
        Ok(result)
    }

    async fn run_local(
        &self,
        invocation: &CompilerInvocation,
        slot: Option<Slot>,
    ) -> Result<i32, ToolchainError> {
        let status = Command::new(&self.compiler)
            .args(&invocation.args)
            .status()
            .await
            .map_err(|source| ToolchainError::Spawn {
                program: self.compiler.display().to_string(),
                source,
            })?;
        drop(slot);
        Ok(exit_code(status))
    }
}

/// Where the real compiler lives and what it was called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCompiler {
    pub path: PathBuf,
    pub argv0: String,
}

fn is_wrapper(candidate: &Path, wrapper: Option<&Path>) -> bool {
    let Some(wrapper) = wrapper else {
        return false;
    };
    match (fs::canonicalize(candidate), fs::canonicalize(wrapper)) {
        (Ok(candidate), Ok(wrapper)) => candidate == wrapper,
        _ => false,
    }
}

/// Find the compiler to run.
///
/// `fiskc` is normally installed as a symlink named after the compiler
/// (`gcc -> fiskc`), so the first `argv0` in PATH that is not this binary is
/// the real one. Invoked as `fiskc gcc ...`, the compiler name is taken from
/// the first argument, which is removed from `args`. An explicit `compiler`
/// path skips the lookup.
pub fn find_compiler(
    argv0: &str,
    compiler: Option<&Path>,
    args: &mut Vec<String>,
) -> Result<ResolvedCompiler, ToolchainError> {
    let wrapper = std::env::current_exe().ok();
    let invoked_as = Path::new(argv0)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(argv0)
        .to_string();

    if let Some(compiler) = compiler {
        let path = if compiler.components().count() > 1 {
            compiler.to_path_buf()
        } else {
            which::which(compiler)
                .map_err(|_| ToolchainError::NotFound(compiler.display().to_string()))?
        };
        return Ok(ResolvedCompiler {
            path,
            argv0: invoked_as,
        });
    }

    let name = if invoked_as == WRAPPER_NAME {
        if args.is_empty() {
            return Err(ToolchainError::NoCompiler);
        }
        args.remove(0)
    } else {
        invoked_as
    };

    if name.contains('/') {
        return Ok(ResolvedCompiler {
            path: PathBuf::from(&name),
            argv0: name,
        });
    }

    let found = which::which_all(&name)
        .map_err(|_| ToolchainError::NotFound(name.clone()))?
        .find(|candidate| !is_wrapper(candidate, wrapper.as_deref()))
        .ok_or_else(|| ToolchainError::NotFound(name.clone()))?;
    debug!("Resolved compiler {} to {}", name, found.display());
    Ok(ResolvedCompiler {
        path: found,
        argv0: name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::SlotCapacities;
    use tempfile::TempDir;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_hash_file_is_stable_and_content_sensitive() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        fs::write(&a, b"compiler one").unwrap();
        fs::write(&b, b"compiler two").unwrap();

        let hash = hash_file(&a).unwrap();
        assert_eq!(hash, hash_file(&a).unwrap());
        assert_eq!(hash, blake3::hash(b"compiler one").to_hex().to_string());
        assert_ne!(hash, hash_file(&b).unwrap());
    }

    #[test]
    fn test_hash_missing_file_errors() {
        let err = hash_file(Path::new("/nonexistent/compiler")).unwrap_err();
        assert!(matches!(err, ToolchainError::Hash { .. }));
    }

    #[test]
    fn test_environment_hash_uses_cache() {
        let tmp = TempDir::new().unwrap();
        let compiler = tmp.path().join("cc");
        fs::write(&compiler, b"real compiler").unwrap();
        let cache_path = tmp.path().join("environment_cache.json");

        let toolchain =
            SystemToolchain::new(compiler.clone(), "cc").with_env_cache(Some(cache_path.clone()));
        let first = toolchain.environment_hash().unwrap();
        assert!(cache_path.exists());

        // A cache hit is served without rehashing.
        let metadata = fs::metadata(&compiler).unwrap();
        let mut cache = EnvironmentCache::load(&cache_path);
        cache.insert(&compiler, &metadata, "from-cache");
        cache.save(&cache_path).unwrap();
        assert_eq!(toolchain.environment_hash().unwrap(), "from-cache");
        assert_ne!(first, "from-cache");
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_code_maps_signals() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
    }

    #[test]
    fn test_find_compiler_with_explicit_path() {
        let mut args = strings(&["-c", "a.c"]);
        let resolved = find_compiler("gcc", Some(Path::new("/opt/cc/bin/gcc")), &mut args).unwrap();
        assert_eq!(resolved.path, PathBuf::from("/opt/cc/bin/gcc"));
        assert_eq!(resolved.argv0, "gcc");
        assert_eq!(args, strings(&["-c", "a.c"]));
    }

    #[test]
    fn test_find_compiler_shifts_name_when_invoked_directly() {
        let mut args = strings(&["/usr/bin/cc", "-c", "a.c"]);
        let resolved = find_compiler("/usr/local/bin/fiskc", None, &mut args).unwrap();
        assert_eq!(resolved.path, PathBuf::from("/usr/bin/cc"));
        assert_eq!(args, strings(&["-c", "a.c"]));
    }

    #[test]
    fn test_find_compiler_without_name_fails() {
        let mut args = Vec::new();
        let err = find_compiler("fiskc", None, &mut args).unwrap_err();
        assert!(matches!(err, ToolchainError::NoCompiler));
    }

    #[test]
    fn test_find_compiler_unknown_name_fails() {
        let mut args = Vec::new();
        let err = find_compiler("no-such-compiler-fisk-test", None, &mut args).unwrap_err();
        assert!(matches!(err, ToolchainError::NotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_preprocess_runs_compiler_with_e() {
        // `sh script -E`: the script ignores its arguments.
        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("cpp.sh");
        fs::write(&script, "printf preprocessed\nprintf warn >&2\n").unwrap();
        let toolchain = SystemToolchain::new(PathBuf::from("/bin/sh"), "sh");
        let invocation = CompilerInvocation::parse(
            "sh",
            vec![script.display().to_string(), "-c".to_string()],
        );
        let slots = SlotController::in_process(SlotCapacities::new(1, 1));
        let result = toolchain.preprocess(&invocation, &slots).await.unwrap();

        assert!(result.succeeded());
        assert_eq!(result.stdout, b"preprocessed");
        assert_eq!(result.stderr, b"warn");
        assert_eq!(slots.stats(SlotKind::Preprocess).waited, 1);
        assert_eq!(slots.held(SlotKind::Preprocess), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_local_returns_exit_code_and_releases_slot() {
        let toolchain = SystemToolchain::new(PathBuf::from("/bin/sh"), "sh");
        let invocation = CompilerInvocation::parse("sh", strings(&["-c", "exit 7"]));
        let slots = SlotController::in_process(SlotCapacities::new(1, 1));
        let slot = slots.acquire(SlotKind::Compile, crate::slots::AcquireMode::Try);

        assert_eq!(toolchain.run_local(&invocation, slot).await.unwrap(), 7);
        assert_eq!(slots.held(SlotKind::Compile), 0);
    }

    #[tokio::test]
    async fn test_run_local_missing_compiler_errors() {
        let toolchain = SystemToolchain::new(PathBuf::from("/nonexistent/cc"), "cc");
        let invocation = CompilerInvocation::parse("cc", strings(&["-c", "a.c"]));
        let err = toolchain.run_local(&invocation, None).await.unwrap_err();
        assert!(matches!(err, ToolchainError::Spawn { .. }));
    }
}
