//! Runs the built `fiskc` binary with `/bin/sh` standing in for the compiler.

#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

/// `fiskc` with a private HOME and no inherited FISK_* settings.
fn fiskc(home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_fiskc"));
    cmd.env("HOME", home)
        .env_remove("FISK_LOG")
        .env_remove("FISK_DEBUG")
        .env_remove("FISK_VERBOSE")
        .env_remove("FISK_LOG_FILE")
        .env_remove("FISK_DISABLED")
        .env_remove("FISK_SLAVE")
        .env_remove("FISK_COMPILER");
    cmd
}

fn run(cmd: &mut Command) -> Output {
    cmd.output().expect("Failed to run fiskc")
}

#[test]
fn test_local_exit_code_is_propagated() {
    let home = TempDir::new().unwrap();
    let output = run(fiskc(home.path())
        .env("FISK_COMPILER", "/bin/sh")
        .args(["-c", "exit 3"]));

    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn test_fisk_flags_are_not_forwarded() {
    let home = TempDir::new().unwrap();
    let output = run(fiskc(home.path()).args([
        "--fisk-compiler=/bin/sh",
        "--fisk-disabled",
        "--fisk-log=silent",
        "-c",
        "printf '%s' \"$*\"",
        "sh",
        "kept",
    ]));

    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "kept");
    assert!(output.stderr.is_empty());
}

#[test]
fn test_numeric_disabled_env_keeps_flags() {
    let home = TempDir::new().unwrap();
    let output = run(fiskc(home.path())
        .env("FISK_DISABLED", "1")
        .args(["--fisk-compiler=/bin/sh", "--fisk-log=silent", "-c", "exit 4"]));

    assert_eq!(output.status.code(), Some(4));
    assert!(output.stderr.is_empty());
}

#[test]
fn test_cache_dir_is_stamped() {
    let home = TempDir::new().unwrap();
    let output = run(fiskc(home.path())
        .env("FISK_COMPILER", "/bin/sh")
        .args(["-c", "true"]));

    assert!(output.status.success());
    let stamp = fs::read(home.path().join(".cache/fisk/client/version")).unwrap();
    assert_eq!(stamp.len(), 4);
}

#[test]
fn test_missing_compiler_exits_1() {
    let home = TempDir::new().unwrap();
    let output = run(&mut fiskc(home.path()));

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).starts_with("fiskc:"));
}

#[test]
fn test_dump_semaphores_lists_both_kinds() {
    let home = TempDir::new().unwrap();
    let output = run(fiskc(home.path()).arg("--fisk-dump-semaphores"));

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("/fisk.compile"), "{}", stdout);
    assert!(stdout.contains("/fisk.cpp"), "{}", stdout);
}

#[test]
fn test_log_file_receives_debug_output() {
    let home = TempDir::new().unwrap();
    let log = home.path().join("fisk.log");
    let output = run(fiskc(home.path())
        .env("FISK_COMPILER", "/bin/sh")
        .arg("--fisk-log=debug")
        .arg(format!("--fisk-log-file={}", log.display()))
        .args(["-c", "true"]));

    assert!(output.status.success());
    let contents = fs::read_to_string(&log).unwrap();
    assert!(contents.contains("Compiler: /bin/sh"), "{}", contents);
}

#[test]
fn test_invalid_config_still_compiles() {
    let home = TempDir::new().unwrap();
    let conf_dir = home.path().join(".config/fisk");
    fs::create_dir_all(&conf_dir).unwrap();
    fs::write(conf_dir.join("client.conf"), "{ not json").unwrap();

    let output = run(fiskc(home.path())
        .env("FISK_COMPILER", "/bin/sh")
        .args(["-c", "exit 5"]));

    assert_eq!(output.status.code(), Some(5));
}
