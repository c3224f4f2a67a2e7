//! fiskc - distributed compiler wrapper.
//!
//! Installed in front of the real compiler (`gcc -> fiskc`). Each invocation
//! either compiles locally or ships the preprocessed translation unit to a
//! worker picked by the scheduler, falling back to a local compile whenever
//! the remote path fails.

mod args;
mod cache;
mod cli;
mod connection;
mod context;
mod mux;
mod orchestrator;
mod scheduler;
mod slots;
mod toolchain;
mod transport;
mod watchdog;
mod worker;

#[cfg(test)]
mod testing;

use anyhow::Context;
use args::CompilerInvocation;
use cli::{FiskFlags, parse_command_line};
use context::{ClientContext, StdStreams};
use fisk_common::config::DEFAULT_LOG_LEVEL;
use fisk_common::util::mask_command_line;
use fisk_common::{
    ClientConfig, ConfigLayers, EnvParser, LogConfig, LoggingGuards, init_logging,
};
use orchestrator::ClientError;
use slots::{SlotCapacities, SlotController};
use std::sync::Arc;
use toolchain::{SystemToolchain, find_compiler};
use tracing::{debug, warn};
use transport::WsConnector;

fn main() {
    let code = run_wrapper();
    std::process::exit(code);
}

/// Parse everything, then compile. Returns the process exit code.
fn run_wrapper() -> i32 {
    let mut argv = std::env::args();
    let argv0 = argv.next().unwrap_or_else(|| "fiskc".to_string());
    let parsed = parse_command_line(argv);
    let mut env = EnvParser::new();
    let flags = parsed.flags.with_env(&mut env);
    let mut compiler_args = parsed.compiler_args;

    // A broken config file still compiles, just never remotely.
    let (layers, config_error) = match ConfigLayers::load(&ClientConfig::default_paths()) {
        Ok(layers) => (layers, None),
        Err(e) => (ConfigLayers::default(), Some(e)),
    };
    let config = ClientConfig::from_layers(&layers);

    let _guards = setup_logging(&flags, &layers, &config, &mut env);
    for e in env.take_errors() {
        warn!("{}", e);
    }
    if let Some(e) = &parsed.flag_error {
        warn!("Ignoring --fisk flags: {}", e);
    }
    if let Some(e) = &config_error {
        warn!("Failed to load config: {}, compiling locally", e);
    }
    debug!("{} {}", argv0, mask_command_line(&compiler_args));

    if flags.is_maintenance() {
        return match run_maintenance(&flags, &config) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("fiskc: {:#}", e);
                1
            }
        };
    }

    if let Some(dir) = &config.cache_dir {
        if let Err(e) = cache::prepare_cache_dir(dir) {
            warn!("Failed to prepare cache dir {}: {}", dir.display(), e);
        }
    }

    let compiler = match find_compiler(&argv0, flags.compiler.as_deref(), &mut compiler_args) {
        Ok(compiler) => compiler,
        Err(e) => {
            eprintln!("fiskc: {}", e);
            return 1;
        }
    };
    debug!("Compiler: {}", compiler.path.display());

    let slots = SlotController::system(SlotCapacities::from_config(&config));
    let toolchain = SystemToolchain::new(compiler.path, compiler.argv0.clone())
        .with_env_cache(config.environment_cache());
    let ctx = ClientContext {
        invocation: CompilerInvocation::parse(compiler.argv0, compiler_args),
        remote_disabled: config_error.map(|e| format!("config error: {}", e)),
        config,
        flags,
        slots: slots.clone(),
        toolchain: Arc::new(toolchain),
        connector: Box::new(WsConnector),
        output: Arc::new(StdStreams),
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("fiskc: failed to start runtime: {}", e);
            return 1;
        }
    };

    let code = runtime.block_on(async {
        tokio::select! {
            result = orchestrator::run(&ctx) => match result {
                Ok(outcome) => {
                    debug!("Compile finished: {:?}", outcome);
                    outcome.exit_code
                }
                Err(e) => {
                    if matches!(e, ClientError::VersionMismatch { .. }) {
                        slots.release_all();
                    }
                    eprintln!("fiskc: {}", e);
                    e.exit_code()
                }
            },
            signal = termination_signal() => {
                warn!("Caught signal {}, exiting", signal);
                slots.release_all();
                128 + signal
            }
        }
    });
    // Blocked slot waiters must not hold up exit.
    runtime.shutdown_background();
    code
}

/// Level: `--fisk-log`, then the environment, then `log-level`, then the
/// default. File: `--fisk-log-file`, then `FISK_LOG_FILE`, then `log-file`.
fn setup_logging(
    flags: &FiskFlags,
    layers: &ConfigLayers,
    config: &ClientConfig,
    env: &mut EnvParser,
) -> LoggingGuards {
    let mut log = LogConfig::from_parser(env, DEFAULT_LOG_LEVEL);
    if let Some(level) = layers.string("log-level") {
        log = log.with_fallback_level(&level.value, level.source);
    }
    log = log.with_fallback_file(config.log_file.clone(), config.log_file_append);
    if let Some(level) = &flags.log {
        log = log.with_level(level.as_str());
    }
    if let Some(file) = &flags.log_file {
        log = log.with_file(file.clone());
    }

    match init_logging(&log) {
        Ok(guards) => guards,
        Err(e) => {
            eprintln!("fiskc: failed to initialize logging: {}", e);
            LoggingGuards::default()
        }
    }
}

/// `--fisk-clean-semaphores` and `--fisk-dump-semaphores`.
fn run_maintenance(flags: &FiskFlags, config: &ClientConfig) -> anyhow::Result<()> {
    if flags.clean_semaphores {
        #[cfg(unix)]
        {
            let removed = slots::posix::clean().context("failed to clean semaphores")?;
            println!("Removed {} semaphore(s)", removed);
        }
        #[cfg(not(unix))]
        println!("No semaphores on this platform");
    }
    if flags.dump_semaphores {
        let slots = SlotController::system(SlotCapacities::from_config(config));
        for report in slots.report() {
            println!("{}", report);
        }
    }
    Ok(())
}

/// Resolves with the number of the first termination signal received.
#[cfg(unix)]
async fn termination_signal() -> i32 {
    use std::task::Poll;
    use tokio::signal::unix::{SignalKind, signal};

    let kinds = [
        (SignalKind::terminate(), libc::SIGTERM),
        (SignalKind::interrupt(), libc::SIGINT),
        (SignalKind::hangup(), libc::SIGHUP),
    ];
    let mut streams = Vec::new();
    for (kind, number) in kinds {
        match signal(kind) {
            Ok(stream) => streams.push((stream, number)),
            Err(e) => warn!("Failed to install handler for signal {}: {}", number, e),
        }
    }
    if streams.is_empty() {
        return std::future::pending().await;
    }
    std::future::poll_fn(|cx| {
        for (stream, number) in streams.iter_mut() {
            if stream.poll_recv(cx).is_ready() {
                return Poll::Ready(*number);
            }
        }
        Poll::Pending
    })
    .await
}

#[cfg(not(unix))]
async fn termination_signal() -> i32 {
    const SIGINT: i32 = 2;
    match tokio::signal::ctrl_c().await {
        Ok(()) => SIGINT,
        Err(e) => {
            warn!("Failed to install Ctrl-C handler: {}", e);
            std::future::pending().await
        }
    }
}
