//! End-to-end pipeline tests
//!
//! Exercises complete runs against temp-directory destinations: full and
//! incremental selection, manifests, encryption with dedup and
//! retention, verification, and point-in-time restore. Network copiers
//! are covered at the unit level inside their modules; everything here
//! stays on the local filesystem.

use coffer::config::{BackupConfig, ModesConfig};
use coffer::encryption::KeySource;
use coffer::manifest::{self, FileStatus};
use coffer::orchestrator::Orchestrator;
use coffer::restore::{restore_backup, RestoreOptions};
use coffer::types::{BackupMode, RunOutcome};
use coffer::utils;
use coffer::verify::verify_destination;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

/// Minimal local-only config over temp dirs
fn local_config(source: &Path, dest: &Path) -> BackupConfig {
    BackupConfig {
        source_dir: Some(source.to_path_buf()),
        backup_dirs: vec![dest.to_path_buf()],
        modes: ModesConfig {
            local: true,
            ..Default::default()
        },
        parallel_copies: 4,
        ..Default::default()
    }
}

/// Runs get second-granularity ids; space consecutive runs apart
fn next_run_slot() {
    std::thread::sleep(Duration::from_millis(1100));
}

#[test]
fn full_local_backup_with_symlink() -> anyhow::Result<()> {
    let source = TempDir::new()?;
    let dest = TempDir::new()?;
    fs::write(source.path().join("a.txt"), b"0123456789")?;
    fs::create_dir(source.path().join("dir"))?;
    fs::write(source.path().join("dir/b.txt"), b"hello")?;
    #[cfg(unix)]
    utils::create_symlink(Path::new("a.txt"), &source.path().join("link"))?;

    let report = Orchestrator::new(local_config(source.path(), dest.path())).execute()?;
    assert_eq!(report.outcome, RunOutcome::Success);

    // Files landed with the source layout
    assert_eq!(fs::read(dest.path().join("a.txt"))?, b"0123456789");
    assert_eq!(fs::read(dest.path().join("dir/b.txt"))?, b"hello");
    #[cfg(unix)]
    {
        let link = dest.path().join("link");
        assert!(fs::symlink_metadata(&link)?.file_type().is_symlink());
        assert_eq!(fs::read_link(&link)?, std::path::PathBuf::from("a.txt"));
    }

    // One manifest, rows with correct hashes
    let manifests = manifest::list_manifests(dest.path())?;
    assert_eq!(manifests.len(), 1);
    let m = manifest::Manifest::load(&manifests[0])?;
    assert_eq!(m.mode, BackupMode::Full);

    let a = m.entry("a.txt").unwrap();
    assert_eq!(a.status, FileStatus::Copied);
    assert_eq!(a.sha256, utils::hash_data(b"0123456789"));
    assert_eq!(a.size, 10);

    let b = m.entry("dir/b.txt").unwrap();
    assert_eq!(b.sha256, utils::hash_data(b"hello"));

    #[cfg(unix)]
    {
        let link = m.entry("link").unwrap();
        assert_eq!(link.status, FileStatus::Symlink);
    }
    Ok(())
}

#[test]
fn incremental_detects_only_changes() -> anyhow::Result<()> {
    let source = TempDir::new()?;
    let dest = TempDir::new()?;
    fs::write(source.path().join("a.txt"), b"0123456789")?;
    fs::create_dir(source.path().join("dir"))?;
    fs::write(source.path().join("dir/b.txt"), b"hello")?;

    let config = local_config(source.path(), dest.path());
    Orchestrator::new(config.clone()).execute()?;

    next_run_slot();
    fs::write(source.path().join("a.txt"), b"0123456789x")?;

    let mut incremental = config;
    incremental.mode = BackupMode::Incremental;
    let report = Orchestrator::new(incremental).execute()?;
    assert_eq!(report.outcome, RunOutcome::Success);

    let m = manifest::latest_manifest(dest.path())?.unwrap();
    assert_eq!(m.mode, BackupMode::Incremental);
    let copied: Vec<&str> = m
        .files
        .iter()
        .filter(|f| f.status == FileStatus::Copied)
        .map(|f| f.path.as_str())
        .collect();
    assert_eq!(copied, vec!["a.txt"]);
    assert_eq!(
        m.entry("a.txt").unwrap().sha256,
        utils::hash_data(b"0123456789x")
    );
    // Unchanged files are absent, not skipped rows
    assert!(m.entry("dir/b.txt").is_none());
    Ok(())
}

#[test]
fn differential_compares_against_latest_full() -> anyhow::Result<()> {
    let source = TempDir::new()?;
    let dest = TempDir::new()?;
    fs::write(source.path().join("base.txt"), b"base")?;

    let config = local_config(source.path(), dest.path());
    Orchestrator::new(config.clone()).execute()?;

    // First change, captured by a differential run
    next_run_slot();
    fs::write(source.path().join("day1.txt"), b"one")?;
    let mut differential = config.clone();
    differential.mode = BackupMode::Differential;
    Orchestrator::new(differential.clone()).execute()?;

    // Second differential still compares against the full run, so the
    // day-1 file participates again
    next_run_slot();
    fs::write(source.path().join("day2.txt"), b"two")?;
    Orchestrator::new(differential).execute()?;

    let m = manifest::latest_manifest(dest.path())?.unwrap();
    let copied: Vec<&str> = m
        .files
        .iter()
        .filter(|f| f.status == FileStatus::Copied)
        .map(|f| f.path.as_str())
        .collect();
    assert!(copied.contains(&"day1.txt"));
    assert!(copied.contains(&"day2.txt"));
    assert!(!copied.contains(&"base.txt"));
    Ok(())
}

#[test]
fn exclude_globs_filter_selection() -> anyhow::Result<()> {
    let source = TempDir::new()?;
    let dest = TempDir::new()?;
    fs::write(source.path().join("keep.txt"), b"keep")?;
    fs::write(source.path().join("skip.log"), b"skip")?;

    let mut config = local_config(source.path(), dest.path());
    config.exclude_patterns = vec!["*.log".to_string()];
    Orchestrator::new(config).execute()?;

    assert!(dest.path().join("keep.txt").exists());
    assert!(!dest.path().join("skip.log").exists());
    let m = manifest::latest_manifest(dest.path())?.unwrap();
    assert!(m.entry("skip.log").is_none());
    Ok(())
}

#[test]
fn encrypt_dedup_retention_pipeline() -> anyhow::Result<()> {
    let source = TempDir::new()?;
    let dest = TempDir::new()?;
    let payload = vec![7u8; 1024 * 1024];
    fs::write(source.path().join("x"), &payload)?;
    fs::write(source.path().join("y"), &payload)?;

    let mut config = local_config(source.path(), dest.path());
    config.encryption.enabled = true;
    config.encryption.passphrase = Some("opening night".to_string());
    config.dedup_enabled = true;
    config.retention.max_count = 2;

    let report = Orchestrator::new(config.clone()).execute()?;
    assert_eq!(report.outcome, RunOutcome::Success);

    // Identical plaintext => envelopes share an inode after dedup
    assert_eq!(
        utils::inode(&dest.path().join("x.enc")),
        utils::inode(&dest.path().join("y.enc"))
    );
    assert!(!dest.path().join("x").exists());

    // The manifest still records the plaintext hash for both
    let m = manifest::latest_manifest(dest.path())?.unwrap();
    let plain_hash = utils::hash_data(&payload);
    assert_eq!(m.entry("x").unwrap().sha256, plain_hash);
    assert_eq!(m.entry("y").unwrap().sha256, plain_hash);
    assert_eq!(m.entry("x").unwrap().stored_path, "x.enc");

    // Two more full runs; only the two newest manifests survive
    next_run_slot();
    Orchestrator::new(config.clone()).execute()?;
    next_run_slot();
    Orchestrator::new(config).execute()?;

    let manifests = manifest::list_manifests(dest.path())?;
    assert_eq!(manifests.len(), 2);
    Ok(())
}

#[test]
fn verify_clean_and_corrupted_destination() -> anyhow::Result<()> {
    let source = TempDir::new()?;
    let dest = TempDir::new()?;
    fs::write(source.path().join("a.txt"), b"intact")?;
    fs::write(source.path().join("b.txt"), b"will corrupt")?;

    Orchestrator::new(local_config(source.path(), dest.path())).execute()?;

    let clean = verify_destination(dest.path(), None)?;
    assert!(clean.is_clean());
    assert_eq!(clean.verified, 2);

    // Verification is idempotent on an unchanged destination
    let again = verify_destination(dest.path(), None)?;
    assert_eq!(clean.verified, again.verified);
    assert_eq!(clean.details, again.details);

    // Flip bytes behind the manifest's back
    fs::write(dest.path().join("b.txt"), b"was corrupt!")?;
    let dirty = verify_destination(dest.path(), None)?;
    assert!(!dirty.is_clean());
    assert_eq!(dirty.corrupted, 1);
    // Reported, not mutated
    assert_eq!(fs::read(dest.path().join("b.txt"))?, b"was corrupt!");
    Ok(())
}

#[test]
fn encrypted_verify_roundtrip() -> anyhow::Result<()> {
    let source = TempDir::new()?;
    let dest = TempDir::new()?;
    fs::write(source.path().join("s.bin"), b"sensitive payload")?;

    let mut config = local_config(source.path(), dest.path());
    config.encryption.enabled = true;
    config.encryption.passphrase = Some("pw".to_string());
    Orchestrator::new(config.clone()).execute()?;

    let key_source = KeySource::from_config(&config.encryption)?.unwrap();
    let result = verify_destination(dest.path(), Some(&key_source))?;
    assert!(result.is_clean(), "details: {:?}", result.details);
    assert_eq!(result.verified, 1);
    Ok(())
}

#[test]
fn point_in_time_restore_across_runs() -> anyhow::Result<()> {
    let source = TempDir::new()?;
    let dest = TempDir::new()?;
    let target = TempDir::new()?;

    let config = local_config(source.path(), dest.path());

    // Day 1 and day 2 change k.txt; day 3 only adds a new file, so the
    // surviving k.txt bytes are the day-2 version
    fs::write(source.path().join("k.txt"), b"day one")?;
    Orchestrator::new(config.clone()).execute()?;
    next_run_slot();

    fs::write(source.path().join("k.txt"), b"day two!")?;
    let day2 = Orchestrator::new(config.clone()).execute()?;
    assert_eq!(day2.outcome, RunOutcome::Success);
    next_run_slot();

    fs::write(source.path().join("extra.txt"), b"day three")?;
    Orchestrator::new(config).execute()?;

    let options = RestoreOptions {
        timestamp: Some(day2.run_id),
        ..Default::default()
    };
    let summary = restore_backup(dest.path().to_str().unwrap(), target.path(), &options)?;
    assert!(summary.is_success());
    assert_eq!(fs::read(target.path().join("k.txt"))?, b"day two!");
    // The day-3 file is not part of the day-2 state
    assert!(!target.path().join("extra.txt").exists());
    Ok(())
}

#[test]
fn restore_decrypts_with_key_material() -> anyhow::Result<()> {
    let source = TempDir::new()?;
    let dest = TempDir::new()?;
    let target = TempDir::new()?;
    fs::write(source.path().join("secret.txt"), b"classified")?;

    let mut config = local_config(source.path(), dest.path());
    config.encryption.enabled = true;
    config.encryption.passphrase = Some("pw".to_string());
    let report = Orchestrator::new(config.clone()).execute()?;

    let options = RestoreOptions {
        timestamp: Some(report.run_id),
        key_source: KeySource::from_config(&config.encryption)?,
        ..Default::default()
    };
    let summary = restore_backup(dest.path().to_str().unwrap(), target.path(), &options)?;
    assert!(summary.is_success());
    assert_eq!(fs::read(target.path().join("secret.txt"))?, b"classified");
    Ok(())
}

#[test]
fn multiple_local_destinations_fail_independently() -> anyhow::Result<()> {
    let source = TempDir::new()?;
    let good = TempDir::new()?;
    fs::write(source.path().join("a.txt"), b"x")?;

    let mut config = local_config(source.path(), good.path());
    // Second destination cannot be created
    config
        .backup_dirs
        .push(Path::new("/proc/coffer-cannot-write-here").to_path_buf());

    let report = Orchestrator::new(config).execute()?;
    assert_eq!(report.outcome, RunOutcome::Partial);

    // The healthy destination has a complete manifest
    let m = manifest::latest_manifest(good.path())?.unwrap();
    assert_eq!(m.files.len(), 1);
    // The dead one produced none
    assert_eq!(
        report
            .destinations
            .iter()
            .filter(|d| d.manifest_written)
            .count(),
        1
    );
    Ok(())
}

#[test]
fn compressed_run_fans_out_single_archive() -> anyhow::Result<()> {
    let source = TempDir::new()?;
    let dest_a = TempDir::new()?;
    let dest_b = TempDir::new()?;
    fs::write(source.path().join("a.txt"), b"alpha")?;
    fs::create_dir(source.path().join("dir"))?;
    fs::write(source.path().join("dir/b.txt"), b"beta")?;

    let mut config = local_config(source.path(), dest_a.path());
    config.backup_dirs.push(dest_b.path().to_path_buf());
    config.compress = coffer::config::CompressType::Zip;

    let report = Orchestrator::new(config).execute()?;
    assert_eq!(report.outcome, RunOutcome::Success);

    for dest in [dest_a.path(), dest_b.path()] {
        let m = manifest::latest_manifest(dest)?.unwrap();
        assert_eq!(m.files.len(), 1);
        let row = &m.files[0];
        assert!(row.path.ends_with(".zip"));
        assert!(dest.join(&row.stored_path).is_file());
        // Individual source files are not mirrored in archive mode
        assert!(!dest.join("a.txt").exists());
    }

    // The archive restores the original tree
    let target = TempDir::new()?;
    let m = manifest::latest_manifest(dest_a.path())?.unwrap();
    let archive = dest_a.path().join(&m.files[0].stored_path);
    let summary = restore_backup(
        archive.to_str().unwrap(),
        target.path(),
        &RestoreOptions::default(),
    )?;
    assert!(summary.is_success());
    assert_eq!(fs::read(target.path().join("a.txt"))?, b"alpha");
    assert_eq!(fs::read(target.path().join("dir/b.txt"))?, b"beta");
    Ok(())
}
