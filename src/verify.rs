//! Destination verification against manifests
//!
//! Reads the latest manifest of a destination and checks every row with
//! status `copied`: the stored file must exist, its size must match, and
//! a re-hash must reproduce the recorded SHA-256. Encrypted siblings are
//! decrypted to a scratch directory first and the plaintext is hashed.
//! Symlink rows are checked for presence and target.
//!
//! Verification only reports; it never mutates a destination, and running
//! it twice on an unchanged destination yields identical results.

use crate::encryption::{self, KeySource};
use crate::error::Result;
use crate::manifest::{self, FileStatus};
use crate::utils;
use std::path::Path;
use tracing::{info, warn};

/// Verification result for one destination
#[derive(Debug, Default, Clone)]
pub struct DestinationVerification {
    /// Destination label
    pub destination: String,
    /// Whether a manifest was found to verify against
    pub manifest_found: bool,
    /// Run id of the manifest checked
    pub run_id: Option<String>,
    /// Rows that verified clean
    pub verified: usize,
    /// Rows whose stored file is missing
    pub missing: usize,
    /// Rows whose size or hash did not match
    pub corrupted: usize,
    /// Rows that could not be checked (I/O, decryption)
    pub errors: usize,
    /// Human-readable detail lines
    pub details: Vec<String>,
}

impl DestinationVerification {
    /// Whether the destination verified completely clean
    pub fn is_clean(&self) -> bool {
        self.missing == 0 && self.corrupted == 0 && self.errors == 0
    }

    /// Total rows examined
    pub fn total(&self) -> usize {
        self.verified + self.missing + self.corrupted + self.errors
    }
}

/// Verify one local destination against its latest manifest
///
/// `key_source` enables decrypt-and-hash verification of `.enc` siblings;
/// without key material their presence and envelope size are checked
/// instead.
pub fn verify_destination(
    root: &Path,
    key_source: Option<&KeySource>,
) -> Result<DestinationVerification> {
    let mut result = DestinationVerification {
        destination: root.display().to_string(),
        ..Default::default()
    };

    if !root.is_dir() {
        result.details.push(format!("directory not found: {}", root.display()));
        result.errors += 1;
        return Ok(result);
    }

    let Some(latest) = manifest::latest_manifest(root)? else {
        result.details.push("no manifest found".to_string());
        return Ok(result);
    };
    result.manifest_found = true;
    result.run_id = Some(latest.run_id.as_str().to_string());

    let run_key = match key_source {
        Some(source) => Some(source.materialize()?),
        None => None,
    };
    let scratch = tempfile::tempdir()?;

    for entry in &latest.files {
        match entry.status {
            FileStatus::Failed | FileStatus::Skipped => continue,
            FileStatus::Symlink => {
                let link = root.join(&entry.stored_path);
                match std::fs::symlink_metadata(&link) {
                    Ok(meta) if meta.file_type().is_symlink() => result.verified += 1,
                    Ok(_) => {
                        result.corrupted += 1;
                        result
                            .details
                            .push(format!("NOT A SYMLINK: {}", entry.stored_path));
                    }
                    Err(_) => {
                        result.missing += 1;
                        result.details.push(format!("MISSING: {}", entry.stored_path));
                    }
                }
                continue;
            }
            FileStatus::Copied => {}
        }

        let stored = root.join(&entry.stored_path);
        if !stored.is_file() {
            result.missing += 1;
            result.details.push(format!("MISSING: {}", entry.stored_path));
            continue;
        }

        if encryption::is_encrypted_name(&entry.stored_path) {
            let Some(run_key) = &run_key else {
                // No key material: the envelope exists; that is all we
                // can assert without decrypting
                result.verified += 1;
                result
                    .details
                    .push(format!("OK (encrypted, not decrypted): {}", entry.stored_path));
                continue;
            };
            let plain = scratch.path().join(format!("verify_{}", result.total()));
            match encryption::decrypt_to(&stored, &plain, run_key) {
                Ok(()) => {
                    check_plain_file(&plain, entry, &mut result);
                    let _ = std::fs::remove_file(&plain);
                }
                Err(e) => {
                    result.errors += 1;
                    result
                        .details
                        .push(format!("DECRYPT ERROR: {}: {}", entry.stored_path, e));
                }
            }
        } else {
            check_plain_file(&stored, entry, &mut result);
        }
    }

    if result.is_clean() {
        info!(
            "Verified {} rows clean in {:?} (run {})",
            result.verified,
            root,
            result.run_id.as_deref().unwrap_or("-")
        );
    } else {
        warn!(
            "Verification of {:?} found problems: {} missing, {} corrupted, {} errors",
            root, result.missing, result.corrupted, result.errors
        );
    }
    Ok(result)
}

/// Size and hash check of a plaintext file against its manifest row
fn check_plain_file(
    path: &Path,
    entry: &manifest::ManifestEntry,
    result: &mut DestinationVerification,
) {
    let size = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) => {
            result.errors += 1;
            result.details.push(format!("ERROR: {}: {}", entry.path, e));
            return;
        }
    };
    if size != entry.size {
        result.corrupted += 1;
        result.details.push(format!(
            "SIZE MISMATCH: {} (expected {}, got {})",
            entry.path, entry.size, size
        ));
        return;
    }

    match utils::hash_file(path) {
        Ok((hash, _)) if hash == entry.sha256 => result.verified += 1,
        Ok((hash, _)) => {
            result.corrupted += 1;
            result.details.push(format!(
                "HASH MISMATCH: {} (expected {}, got {})",
                entry.path, entry.sha256, hash
            ));
        }
        Err(e) => {
            result.errors += 1;
            result.details.push(format!("ERROR: {}: {}", entry.path, e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Manifest, ManifestEntry};
    use crate::types::{BackupMode, RunId};
    use chrono::Local;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn write_manifest_for(root: &Path, files: Vec<ManifestEntry>) {
        let mut m = Manifest::new(
            RunId::parse("20260101_000000").unwrap(),
            BackupMode::Full,
            PathBuf::from("/src"),
            root.to_path_buf(),
            Local::now(),
        );
        m.files = files;
        m.save(root).unwrap();
    }

    #[test]
    fn test_clean_destination() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        write_manifest_for(
            dir.path(),
            vec![ManifestEntry::copied(
                "a.txt".into(),
                "a.txt".into(),
                5,
                utils::hash_data(b"hello"),
            )],
        );

        let result = verify_destination(dir.path(), None).unwrap();
        assert!(result.manifest_found);
        assert!(result.is_clean());
        assert_eq!(result.verified, 1);
    }

    #[test]
    fn test_detects_missing_and_corrupted() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("mutated.txt"), b"not the original").unwrap();
        write_manifest_for(
            dir.path(),
            vec![
                ManifestEntry::copied("gone.txt".into(), "gone.txt".into(), 3, "aa".into()),
                ManifestEntry::copied(
                    "mutated.txt".into(),
                    "mutated.txt".into(),
                    16,
                    utils::hash_data(b"the original!!!!"),
                ),
            ],
        );

        let result = verify_destination(dir.path(), None).unwrap();
        assert_eq!(result.missing, 1);
        assert_eq!(result.corrupted, 1);
        assert!(!result.is_clean());
    }

    #[test]
    fn test_idempotent() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"stable").unwrap();
        write_manifest_for(
            dir.path(),
            vec![ManifestEntry::copied(
                "a.txt".into(),
                "a.txt".into(),
                6,
                utils::hash_data(b"stable"),
            )],
        );

        let first = verify_destination(dir.path(), None).unwrap();
        let second = verify_destination(dir.path(), None).unwrap();
        assert_eq!(first.verified, second.verified);
        assert_eq!(first.details, second.details);
    }

    #[test]
    fn test_encrypted_row_roundtrip() {
        let dir = TempDir::new().unwrap();
        let source = KeySource::Passphrase("pw".into());
        let run_key = source.materialize().unwrap();

        fs::write(dir.path().join("s.bin"), b"cipher me").unwrap();
        let plain_hash = utils::hash_data(b"cipher me");
        encryption::encrypt_file(&dir.path().join("s.bin"), &run_key).unwrap();

        write_manifest_for(
            dir.path(),
            vec![ManifestEntry::copied(
                "s.bin".into(),
                "s.bin.enc".into(),
                9,
                plain_hash,
            )],
        );

        let result = verify_destination(dir.path(), Some(&source)).unwrap();
        assert!(result.is_clean(), "details: {:?}", result.details);
        assert_eq!(result.verified, 1);
        // Verification must not mutate the destination
        assert!(dir.path().join("s.bin.enc").exists());
        assert!(!dir.path().join("s.bin").exists());
    }

    #[test]
    fn test_no_manifest_reports_not_found() {
        let dir = TempDir::new().unwrap();
        let result = verify_destination(dir.path(), None).unwrap();
        assert!(!result.manifest_found);
        assert_eq!(result.total(), 0);
    }
}
