//! `--fisk-*` flags.
//!
//! The wrapper shares its command line with the compiler. Arguments starting
//! with `--fisk-` belong to us and are removed before anything is forwarded;
//! everything else is passed through untouched. `FISK_COMPILER`, `FISK_SLAVE`
//! and `FISK_DISABLED` fill in whatever the flags leave unset.

use clap::{ArgAction, Parser};
use fisk_common::EnvParser;
use std::path::PathBuf;

const FLAG_PREFIX: &str = "--fisk-";

#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "fiskc",
    no_binary_name = true,
    disable_help_flag = true,
    disable_version_flag = true
)]
pub struct FiskFlags {
    /// Log level (error, warn, info, debug, trace, silent).
    #[arg(long = "fisk-log", alias = "fisk-log-level", value_name = "LEVEL")]
    pub log: Option<String>,

    #[arg(long = "fisk-log-file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Compiler to run instead of looking one up in PATH.
    #[arg(long = "fisk-compiler", value_name = "PATH")]
    pub compiler: Option<PathBuf>,

    /// Preferred worker, forwarded to the scheduler.
    #[arg(long = "fisk-slave", value_name = "WORKER")]
    pub slave: Option<String>,

    /// Never compile remotely.
    #[arg(long = "fisk-disabled", action = ArgAction::SetTrue)]
    pub disabled: bool,

    /// Unlink the host-wide slot semaphores and exit.
    #[arg(long = "fisk-clean-semaphores", action = ArgAction::SetTrue)]
    pub clean_semaphores: bool,

    /// Print the slot semaphores and exit.
    #[arg(long = "fisk-dump-semaphores", action = ArgAction::SetTrue)]
    pub dump_semaphores: bool,
}

impl FiskFlags {
    /// Parse flags already separated by [`split_args`].
    pub fn parse_flags<I, S>(flags: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<std::ffi::OsString> + Clone,
    {
        Self::try_parse_from(flags)
    }

    /// Fill unset options from the `FISK_*` environment. Flags win.
    pub fn with_env(mut self, env: &mut EnvParser) -> Self {
        if self.compiler.is_none() {
            self.compiler = env.get_path("COMPILER").map(|p| p.value);
        }
        if self.slave.is_none() {
            self.slave = env.get_string("SLAVE").map(|s| s.value);
        }
        if !self.disabled {
            self.disabled = env.get_bool("DISABLED").is_some_and(|d| d.value);
        }
        self
    }

    /// Whether the invocation is a diagnostic that exits without compiling.
    pub fn is_maintenance(&self) -> bool {
        self.clean_semaphores || self.dump_semaphores
    }
}

/// Separate `--fisk-*` arguments from compiler arguments, keeping order.
pub fn split_args<I>(args: I) -> (Vec<String>, Vec<String>)
where
    I: IntoIterator<Item = String>,
{
    args.into_iter().partition(|arg| arg.starts_with(FLAG_PREFIX))
}

/// Flags plus the compiler arguments left after removing them.
#[derive(Debug, Clone)]
pub struct ParsedCommandLine {
    pub flags: FiskFlags,
    pub compiler_args: Vec<String>,
    /// Set when the `--fisk-*` flags were unusable; defaults were used.
    pub flag_error: Option<String>,
}

/// Parse everything after argv[0].
pub fn parse_command_line<I>(args: I) -> ParsedCommandLine
where
    I: IntoIterator<Item = String>,
{
    let (fisk_args, compiler_args) = split_args(args);
    let (flags, flag_error) = match FiskFlags::parse_flags(&fisk_args) {
        Ok(flags) => (flags, None),
        Err(e) => (
            FiskFlags::parse_flags(Vec::<String>::new()).unwrap_or_default(),
            Some(e.to_string().trim().to_string()),
        ),
    };
    ParsedCommandLine {
        flags,
        compiler_args,
        flag_error,
    }
}
