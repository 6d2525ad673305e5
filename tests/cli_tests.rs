//! CLI surface tests
//!
//! Drives the compiled binary to check flag validation, exit codes and
//! the single-instance lock behaviour.

use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

fn coffer() -> Command {
    Command::new(env!("CARGO_BIN_EXE_coffer"))
}

fn write_config(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("config.ini");
    fs::write(&path, body).unwrap();
    path
}

#[test]
fn version_flag() {
    let output = coffer().arg("--version").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("coffer"));
}

#[test]
fn no_arguments_prints_help() {
    let output = coffer().output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--backup-mode"));
}

#[test]
fn scheduled_conflicts_with_dry_run() {
    let output = coffer().args(["--scheduled", "--dry-run"]).output().unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cannot be used with"));
}

#[test]
fn restore_conflicts_with_backup_flags() {
    let output = coffer()
        .args(["--restore", "--encrypt"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn missing_config_is_a_config_error() {
    let output = coffer()
        .args(["--status", "--config", "/definitely/not/here.ini"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn unknown_profile_is_a_config_error() {
    let output = coffer()
        .args(["--profile", "no-such-profile", "--status"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn full_run_exit_code_and_layout() {
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    fs::write(source.path().join("a.txt"), b"0123456789").unwrap();

    let output = coffer()
        .args([
            "--operation-modes",
            "local",
            "--backup-mode",
            "full",
            "--source-dir",
            source.path().to_str().unwrap(),
            "--backup-dirs",
            dest.path().to_str().unwrap(),
            "--config",
            "/dev/null",
        ])
        .output()
        .unwrap();
    assert_eq!(
        output.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(dest.path().join("a.txt").is_file());
    assert_eq!(
        fs::read_dir(dest.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("backup_manifest_"))
            .count(),
        1
    );
}

#[test]
fn second_scheduled_instance_exits_with_lock_code() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        dir.path(),
        "[DEFAULT]\nsource_dir = /tmp\n\
         [BACKUPS]\nbackup_dirs = /tmp/coffer-test-dest\n\
         [MODES]\nlocal = True\n\
         [SCHEDULE]\ntimes = 03:00\ninterval_minutes = 1\n",
    );

    // Simulate a live first instance: its lock carries this test's PID
    let lock_path = dir.path().join(".coffer.lock");
    fs::write(&lock_path, std::process::id().to_string()).unwrap();

    let output = coffer()
        .args(["--scheduled", "--config", config.to_str().unwrap()])
        .output()
        .unwrap();
    assert_eq!(
        output.status.code(),
        Some(2),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    // The first instance's lock is untouched
    assert_eq!(
        fs::read_to_string(&lock_path).unwrap(),
        std::process::id().to_string()
    );
}

#[test]
fn dry_run_reports_without_writing() {
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    fs::write(source.path().join("a.txt"), b"x").unwrap();

    let output = coffer()
        .args([
            "--dry-run",
            "--operation-modes",
            "local",
            "--source-dir",
            source.path().to_str().unwrap(),
            "--backup-dirs",
            dest.path().to_str().unwrap(),
            "--config",
            "/dev/null",
        ])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    assert!(!dest.path().join("a.txt").exists());
}
