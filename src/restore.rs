//! Restore from a backup source
//!
//! A restore source is a local destination directory, a single `.zip`
//! archive, a remote SFTP path (`user@host:/abs/path` or
//! `ssh://user@host/abs/path`), or an object-store prefix
//! (`s3://bucket/prefix`). Remote sources are downloaded into a scratch
//! directory first and then restored like a local one.
//!
//! With `--restore-timestamp`, the manifests up to that run id are
//! replayed oldest-first with latest-version-wins per path, which
//! reconstructs the source exactly as of that run. Without a timestamp
//! the whole directory (minus manifests) is copied. Encrypted siblings
//! are decrypted on the way out when key material is configured; without
//! it they are copied as-is with a warning.

use crate::compress;
use crate::encryption::{self, KeySource, RunKey};
use crate::error::{BackupError, Result};
use crate::manifest::{self, FileStatus, ManifestEntry};
use crate::object_store::{ObjectStoreCopier, ObjectStoreTarget};
use crate::sftp_copy::{SftpCopier, SftpTarget};
use crate::types::RunId;
use crate::utils;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Parsed restore source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreSource {
    /// A local destination directory
    LocalDir(PathBuf),
    /// A single ZIP archive
    Archive(PathBuf),
    /// A remote SFTP directory
    Ssh {
        /// Login user (falls back to the configured SSH username)
        user: Option<String>,
        /// Remote host
        host: String,
        /// Absolute remote directory
        path: PathBuf,
    },
    /// An object-store prefix
    ObjectStore {
        /// Bucket name
        bucket: String,
        /// Key prefix (may be empty)
        prefix: String,
    },
}

/// Parse a `--from-dir` value into a restore source
pub fn parse_source(from: &str) -> RestoreSource {
    if let Some(rest) = from.strip_prefix("s3://") {
        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        return RestoreSource::ObjectStore {
            bucket: bucket.to_string(),
            prefix: prefix.trim_end_matches('/').to_string(),
        };
    }
    if let Some(rest) = from.strip_prefix("ssh://") {
        let (user_host, path) = rest.split_once('/').unwrap_or((rest, ""));
        let (user, host) = match user_host.split_once('@') {
            Some((user, host)) => (Some(user.to_string()), host.to_string()),
            None => (None, user_host.to_string()),
        };
        return RestoreSource::Ssh {
            user,
            host,
            path: PathBuf::from(format!("/{path}")),
        };
    }
    if let Some((user_host, path)) = from.split_once(':').filter(|_| is_scp_like(from)) {
        let (user, host) = match user_host.split_once('@') {
            Some((user, host)) => (Some(user.to_string()), host.to_string()),
            None => (None, user_host.to_string()),
        };
        return RestoreSource::Ssh {
            user,
            host,
            path: PathBuf::from(path),
        };
    }
    let path = PathBuf::from(from);
    if path.extension().map(|e| e == "zip").unwrap_or(false) && path.is_file() {
        RestoreSource::Archive(path)
    } else {
        RestoreSource::LocalDir(path)
    }
}

/// `user@host:/abs/path` shape (and not a Windows drive path)
fn is_scp_like(s: &str) -> bool {
    match s.split_once(':') {
        Some((user_host, path)) => {
            user_host.contains('@')
                && !user_host.contains('/')
                && path.starts_with('/')
        }
        None => false,
    }
}

/// Everything a restore needs besides the source and target
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Reconstruct the state as of this run id
    pub timestamp: Option<RunId>,
    /// Key material for decrypting `.enc` siblings
    pub key_source: Option<KeySource>,
    /// SSH credentials for remote sources
    pub ssh_username: Option<String>,
    /// SSH password
    pub ssh_password: Option<String>,
    /// SSH private key
    pub ssh_key_file: Option<PathBuf>,
    /// Object-store region
    pub s3_region: Option<String>,
    /// Object-store access key
    pub s3_access_key: Option<String>,
    /// Object-store secret key
    pub s3_secret_key: Option<String>,
}

/// Outcome of a restore
#[derive(Debug, Default, Clone)]
pub struct RestoreSummary {
    /// Files written to the target
    pub files_restored: usize,
    /// Files that could not be restored
    pub files_failed: usize,
}

impl RestoreSummary {
    /// Whether every file restored cleanly
    pub fn is_success(&self) -> bool {
        self.files_failed == 0
    }
}

/// Restore a backup source into a target directory
pub fn restore_backup(from: &str, to_dir: &Path, options: &RestoreOptions) -> Result<RestoreSummary> {
    fs::create_dir_all(to_dir)?;

    match parse_source(from) {
        RestoreSource::Archive(archive) => {
            info!("Restoring from archive {:?}", archive);
            let entries = compress::extract_archive(&archive, to_dir)?;
            Ok(RestoreSummary {
                files_restored: entries,
                files_failed: 0,
            })
        }
        RestoreSource::LocalDir(dir) => {
            if !dir.is_dir() {
                return Err(BackupError::RestoreFailed(format!(
                    "restore source does not exist: {}",
                    dir.display()
                )));
            }
            restore_local(&dir, to_dir, options)
        }
        RestoreSource::Ssh { user, host, path } => {
            let username = user
                .or_else(|| options.ssh_username.clone())
                .ok_or_else(|| {
                    BackupError::RestoreFailed("no SSH username for remote restore".to_string())
                })?;
            let target = SftpTarget {
                host,
                port: 22,
                username,
                password: options.ssh_password.clone(),
                key_file: options.ssh_key_file.clone(),
                remote_root: path,
                bandwidth_limit_kbps: 0,
            };
            let scratch = tempfile::tempdir()?;
            info!("Downloading remote backup from {} for restore", target.host);
            let copier = SftpCopier::connect(target)?;
            copier.download_tree(scratch.path())?;
            restore_local(scratch.path(), to_dir, options)
        }
        RestoreSource::ObjectStore { bucket, prefix } => {
            let target = ObjectStoreTarget {
                bucket,
                prefix,
                region: options.s3_region.clone(),
                access_key: options.s3_access_key.clone(),
                secret_key: options.s3_secret_key.clone(),
            };
            let scratch = tempfile::tempdir()?;
            info!("Downloading {} for restore", target.label());
            let copier = ObjectStoreCopier::connect(target)?;
            copier.download_tree(scratch.path())?;
            restore_local(scratch.path(), to_dir, options)
        }
    }
}

/// Restore from a local directory (possibly a downloaded scratch copy)
fn restore_local(from_dir: &Path, to_dir: &Path, options: &RestoreOptions) -> Result<RestoreSummary> {
    let run_key = match &options.key_source {
        Some(source) => Some(source.materialize()?),
        None => None,
    };

    match &options.timestamp {
        Some(cutoff) => restore_point_in_time(from_dir, to_dir, cutoff, run_key.as_ref()),
        None => restore_full_tree(from_dir, to_dir, run_key.as_ref()),
    }
}

/// Replay manifests up to a run id, latest version of each path winning
fn restore_point_in_time(
    from_dir: &Path,
    to_dir: &Path,
    cutoff: &RunId,
    run_key: Option<&RunKey>,
) -> Result<RestoreSummary> {
    let manifests = manifest::manifests_up_to(from_dir, cutoff)?;
    if manifests.is_empty() {
        warn!(
            "No manifests up to {} in {:?}; falling back to full-tree restore",
            cutoff, from_dir
        );
        return restore_full_tree(from_dir, to_dir, run_key);
    }
    info!(
        "Restoring state as of {} from {} manifest(s)",
        cutoff,
        manifests.len()
    );

    // Oldest first, so later runs overwrite earlier versions
    let mut winning: BTreeMap<String, ManifestEntry> = BTreeMap::new();
    for m in &manifests {
        for entry in &m.files {
            match entry.status {
                FileStatus::Copied | FileStatus::Symlink => {
                    winning.insert(entry.path.clone(), entry.clone());
                }
                FileStatus::Skipped | FileStatus::Failed => {}
            }
        }
    }

    let mut summary = RestoreSummary::default();
    for entry in winning.values() {
        match restore_entry(from_dir, to_dir, entry, run_key) {
            Ok(()) => summary.files_restored += 1,
            Err(e) => {
                warn!("Failed to restore {}: {}", entry.path, e);
                summary.files_failed += 1;
            }
        }
    }

    info!(
        "Point-in-time restore complete: {} restored, {} failed",
        summary.files_restored, summary.files_failed
    );
    Ok(summary)
}

/// Restore one manifest row into the target tree
fn restore_entry(
    from_dir: &Path,
    to_dir: &Path,
    entry: &ManifestEntry,
    run_key: Option<&RunKey>,
) -> Result<()> {
    let dest = to_dir.join(&entry.path);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    if entry.status == FileStatus::Symlink {
        let stored = from_dir.join(&entry.stored_path);
        let target = utils::read_symlink(&stored)?;
        if dest.symlink_metadata().is_ok() {
            fs::remove_file(&dest)?;
        }
        return utils::create_symlink(&target, &dest);
    }

    let stored = from_dir.join(&entry.stored_path);
    if !stored.is_file() {
        return Err(BackupError::RestoreFailed(format!(
            "stored file missing: {}",
            entry.stored_path
        )));
    }

    if encryption::is_encrypted_name(&entry.stored_path) {
        let Some(run_key) = run_key else {
            return Err(BackupError::RestoreFailed(format!(
                "{} is encrypted and no key material is configured",
                entry.stored_path
            )));
        };
        encryption::decrypt_to(&stored, &dest, run_key)?;
        note_manifest_drift(&dest, entry)?;
    } else {
        let (copied, _) = utils::copy_and_hash(&stored, &dest)?;
        let (check, _) = utils::hash_file(&dest)?;
        if copied != check {
            let _ = fs::remove_file(&dest);
            return Err(BackupError::HashMismatch {
                expected: copied,
                actual: check,
            });
        }
        note_manifest_drift(&dest, entry)?;
    }
    Ok(())
}

/// Warn when the restored bytes no longer match the manifest row
///
/// A later run may have overwritten the stored path in place; the copy
/// itself is verified, but the content then belongs to a newer run than
/// the one being restored.
fn note_manifest_drift(dest: &Path, entry: &ManifestEntry) -> Result<()> {
    if entry.sha256.is_empty() {
        return Ok(());
    }
    let (hash, _) = utils::hash_file(dest)?;
    if hash != entry.sha256 {
        warn!(
            "{}: stored content differs from the manifest of the requested run \
             (overwritten by a later run); restored the surviving version",
            entry.path
        );
    }
    Ok(())
}

/// Copy the whole backup tree (minus manifests) into the target
fn restore_full_tree(
    from_dir: &Path,
    to_dir: &Path,
    run_key: Option<&RunKey>,
) -> Result<RestoreSummary> {
    let mut summary = RestoreSummary::default();

    for entry in WalkDir::new(from_dir).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if manifest::run_id_from_file_name(&name).is_some() {
            continue;
        }

        let rel = match path.strip_prefix(from_dir) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => continue,
        };

        let result = (|| -> Result<()> {
            if file_type.is_symlink() {
                let dest = to_dir.join(&rel);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                let target = utils::read_symlink(path)?;
                if dest.symlink_metadata().is_ok() {
                    fs::remove_file(&dest)?;
                }
                return utils::create_symlink(&target, &dest);
            }

            if encryption::is_encrypted_name(&name) {
                if let Some(run_key) = run_key {
                    let plain_rel = rel.with_file_name(
                        name.strip_suffix(encryption::ENC_SUFFIX).unwrap_or(&name).to_string(),
                    );
                    let dest = to_dir.join(plain_rel);
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    return encryption::decrypt_to(path, &dest, run_key);
                }
                warn!(
                    "{:?} is encrypted and no key material is configured; copying as-is",
                    path
                );
            }

            let dest = to_dir.join(&rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            let (copied, _) = utils::copy_and_hash(path, &dest)?;
            let (check, _) = utils::hash_file(&dest)?;
            if copied != check {
                let _ = fs::remove_file(&dest);
                return Err(BackupError::HashMismatch {
                    expected: copied,
                    actual: check,
                });
            }
            Ok(())
        })();

        match result {
            Ok(()) => summary.files_restored += 1,
            Err(e) => {
                warn!("Failed to restore {:?}: {}", rel, e);
                summary.files_failed += 1;
            }
        }
    }

    info!(
        "Full-tree restore complete: {} restored, {} failed",
        summary.files_restored, summary.files_failed
    );
    debug!("Restore target: {:?}", to_dir);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use crate::types::BackupMode;
    use chrono::Local;
    use tempfile::TempDir;

    #[test]
    fn test_parse_source_variants() {
        assert_eq!(
            parse_source("s3://bucket/some/prefix"),
            RestoreSource::ObjectStore {
                bucket: "bucket".into(),
                prefix: "some/prefix".into()
            }
        );
        assert_eq!(
            parse_source("ops@host.example.com:/srv/backups"),
            RestoreSource::Ssh {
                user: Some("ops".into()),
                host: "host.example.com".into(),
                path: PathBuf::from("/srv/backups"),
            }
        );
        assert_eq!(
            parse_source("ssh://ops@host/srv/backups"),
            RestoreSource::Ssh {
                user: Some("ops".into()),
                host: "host".into(),
                path: PathBuf::from("/srv/backups"),
            }
        );
        assert_eq!(
            parse_source("/plain/dir"),
            RestoreSource::LocalDir(PathBuf::from("/plain/dir"))
        );
    }

    fn write_run(root: &Path, run_id: &str, files: &[(&str, &[u8])]) {
        let mut m = Manifest::new(
            RunId::parse(run_id).unwrap(),
            BackupMode::Full,
            PathBuf::from("/src"),
            root.to_path_buf(),
            Local::now(),
        );
        for (rel, content) in files {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
            m.files.push(ManifestEntry::copied(
                rel.to_string(),
                rel.to_string(),
                content.len() as u64,
                utils::hash_data(content),
            ));
        }
        m.save(root).unwrap();
    }

    #[test]
    fn test_point_in_time_restore_picks_correct_version() {
        let backup = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();

        write_run(backup.path(), "20260101_000000", &[("k.txt", b"day one")]);
        let summary = restore_backup(
            backup.path().to_str().unwrap(),
            target.path(),
            &RestoreOptions {
                timestamp: Some(RunId::parse("20260101_000000").unwrap()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(summary.is_success());
        assert_eq!(fs::read(target.path().join("k.txt")).unwrap(), b"day one");
    }

    #[test]
    fn test_later_manifest_wins() {
        let backup = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();

        write_run(backup.path(), "20260101_000000", &[("a.txt", b"old"), ("only_day1.txt", b"1")]);
        write_run(backup.path(), "20260102_000000", &[("a.txt", b"new")]);

        let summary = restore_backup(
            backup.path().to_str().unwrap(),
            target.path(),
            &RestoreOptions {
                timestamp: Some(RunId::parse("20260102_000000").unwrap()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(summary.is_success());
        assert_eq!(fs::read(target.path().join("a.txt")).unwrap(), b"new");
        // Files from earlier manifests still restore
        assert_eq!(fs::read(target.path().join("only_day1.txt")).unwrap(), b"1");
    }

    #[test]
    fn test_timestamp_excludes_later_runs() {
        let backup = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();

        write_run(backup.path(), "20260101_000000", &[("a.txt", b"wanted")]);
        write_run(backup.path(), "20260103_000000", &[("late.txt", b"no")]);

        restore_backup(
            backup.path().to_str().unwrap(),
            target.path(),
            &RestoreOptions {
                timestamp: Some(RunId::parse("20260102_000000").unwrap()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(target.path().join("a.txt").exists());
        assert!(!target.path().join("late.txt").exists());
    }

    #[test]
    fn test_full_tree_restore_skips_manifests() {
        let backup = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        write_run(backup.path(), "20260101_000000", &[("data.txt", b"payload")]);

        let summary = restore_backup(
            backup.path().to_str().unwrap(),
            target.path(),
            &RestoreOptions::default(),
        )
        .unwrap();
        assert_eq!(summary.files_restored, 1);
        assert!(target.path().join("data.txt").exists());
        assert!(manifest::list_manifests(target.path()).unwrap().is_empty());
    }

    #[test]
    fn test_encrypted_restore_roundtrip() {
        let backup = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let source = KeySource::Passphrase("pw".into());
        let run_key = source.materialize().unwrap();

        // Simulate the pipeline: copy, manifest with .enc stored path,
        // then encrypt
        let mut m = Manifest::new(
            RunId::parse("20260101_000000").unwrap(),
            BackupMode::Full,
            PathBuf::from("/src"),
            backup.path().to_path_buf(),
            Local::now(),
        );
        fs::write(backup.path().join("secret.txt"), b"classified").unwrap();
        m.files.push(ManifestEntry::copied(
            "secret.txt".into(),
            "secret.txt.enc".into(),
            10,
            utils::hash_data(b"classified"),
        ));
        m.save(backup.path()).unwrap();
        encryption::encrypt_file(&backup.path().join("secret.txt"), &run_key).unwrap();

        let summary = restore_backup(
            backup.path().to_str().unwrap(),
            target.path(),
            &RestoreOptions {
                timestamp: Some(RunId::parse("20260101_000000").unwrap()),
                key_source: Some(source),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(summary.is_success());
        assert_eq!(
            fs::read(target.path().join("secret.txt")).unwrap(),
            b"classified"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_restored_as_symlink() {
        let backup = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        fs::write(backup.path().join("a.txt"), b"x").unwrap();
        utils::create_symlink(Path::new("a.txt"), &backup.path().join("link")).unwrap();

        let mut m = Manifest::new(
            RunId::parse("20260101_000000").unwrap(),
            BackupMode::Full,
            PathBuf::from("/src"),
            backup.path().to_path_buf(),
            Local::now(),
        );
        m.files.push(ManifestEntry::copied(
            "a.txt".into(),
            "a.txt".into(),
            1,
            utils::hash_data(b"x"),
        ));
        m.files.push(ManifestEntry::symlink("link".into()));
        m.save(backup.path()).unwrap();

        restore_backup(
            backup.path().to_str().unwrap(),
            target.path(),
            &RestoreOptions {
                timestamp: Some(RunId::parse("20260101_000000").unwrap()),
                ..Default::default()
            },
        )
        .unwrap();

        let link = target.path().join("link");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("a.txt"));
    }
}
