//! Verified local copies
//!
//! Copies selected source files into a local destination root. Each file
//! is streamed and hashed in flight, then the destination copy is
//! independently re-hashed; a mismatch deletes the destination file and
//! records a failed row. Symlinks are recreated with the same target,
//! never followed.
//!
//! Up to `parallel_copies` files are copied concurrently on a dedicated
//! rayon pool. A failure of one file never aborts the run, and a stop
//! signal lets in-flight files finish while no new ones start.

use crate::error::Result;
use crate::manifest::ManifestEntry;
use crate::types::{portable_path, DestinationTally, FileRecord, ProgressCallback, ProgressInfo};
use crate::utils;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Copies one run's files into a local destination root
pub struct LocalCopier {
    dest_root: PathBuf,
    parallel_copies: usize,
    /// When set, stored paths gain the `.enc` suffix the encryption stage
    /// will produce after the manifest is written
    encrypt_suffix: bool,
    progress: Option<ProgressCallback>,
}

impl LocalCopier {
    /// Create a copier for a destination root
    pub fn new(dest_root: impl Into<PathBuf>) -> Self {
        LocalCopier {
            dest_root: dest_root.into(),
            parallel_copies: 1,
            encrypt_suffix: false,
            progress: None,
        }
    }

    /// Bound the number of concurrent file copies (minimum 1)
    pub fn with_parallel_copies(mut self, n: usize) -> Self {
        self.parallel_copies = n.max(1);
        self
    }

    /// Record stored paths with the `.enc` suffix of the coming
    /// encryption stage
    pub fn with_encrypt_suffix(mut self, enabled: bool) -> Self {
        self.encrypt_suffix = enabled;
        self
    }

    /// Report per-file progress through a callback
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Copy every record, returning manifest rows and the tally
    ///
    /// `cancel` is observed between files: once set, queued files are no
    /// longer started but the rows for already-finished files survive.
    pub fn copy_run(
        &self,
        source_root: &Path,
        records: &[FileRecord],
        cancel: &AtomicBool,
    ) -> Result<(Vec<ManifestEntry>, DestinationTally)> {
        fs::create_dir_all(&self.dest_root)?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.parallel_copies)
            .build()
            .map_err(|e| crate::error::BackupError::internal(format!("thread pool: {e}")))?;

        let processed = AtomicUsize::new(0);
        let bytes_done = AtomicU64::new(0);
        let entries: Mutex<Vec<(usize, ManifestEntry)>> = Mutex::new(Vec::with_capacity(records.len()));

        pool.install(|| {
            records.par_iter().enumerate().for_each(|(idx, record)| {
                if cancel.load(Ordering::Relaxed) {
                    return;
                }
                let entry = self.copy_one(source_root, record);
                if entry.status == crate::manifest::FileStatus::Copied {
                    bytes_done.fetch_add(entry.size, Ordering::Relaxed);
                }
                let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(ref callback) = self.progress {
                    callback(ProgressInfo {
                        operation: "Copying files".to_string(),
                        current_item: Some(entry.path.clone()),
                        processed: done,
                        total: Some(records.len()),
                        bytes_processed: bytes_done.load(Ordering::Relaxed),
                    });
                }
                entries.lock().push((idx, entry));
            });
        });

        let mut indexed = entries.into_inner();
        indexed.sort_by_key(|(idx, _)| *idx);
        let entries: Vec<ManifestEntry> = indexed.into_iter().map(|(_, e)| e).collect();

        let mut tally = DestinationTally::new(self.dest_root.display().to_string());
        for entry in &entries {
            match entry.status {
                crate::manifest::FileStatus::Copied => {
                    tally.files_copied += 1;
                    tally.bytes_copied += entry.size;
                }
                crate::manifest::FileStatus::Skipped => tally.files_skipped += 1,
                crate::manifest::FileStatus::Failed => tally.files_failed += 1,
                crate::manifest::FileStatus::Symlink => tally.symlinks += 1,
            }
        }
        debug!(
            "Local copy to {:?}: {} copied, {} failed, {} symlinks",
            self.dest_root, tally.files_copied, tally.files_failed, tally.symlinks
        );
        Ok((entries, tally))
    }

    /// Copy a single record; failures become failed rows, never errors
    fn copy_one(&self, source_root: &Path, record: &FileRecord) -> ManifestEntry {
        let rel = record.portable_path();
        let source = source_root.join(&record.rel_path);
        let dest = self.dest_root.join(&record.rel_path);

        if let Some(parent) = dest.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                return ManifestEntry::failed(rel, format!("cannot create parent: {e}"));
            }
        }

        if record.is_symlink {
            return self.recreate_symlink(record, &dest, rel);
        }

        let (copied_hash, copied_size) = match utils::copy_and_hash(&source, &dest) {
            Ok(pair) => pair,
            Err(e) => return ManifestEntry::failed(rel, e.to_string()),
        };

        // The copy counts only if an independent re-read of the
        // destination reproduces the in-flight hash
        match utils::hash_file(&dest) {
            Ok((dest_hash, _)) if dest_hash == copied_hash => {
                trace!("Verified {:?} ({} bytes)", dest, copied_size);
                let stored = self.stored_path(&rel);
                ManifestEntry::copied(rel, stored, copied_size, copied_hash)
            }
            Ok((dest_hash, _)) => {
                warn!(
                    "Checksum mismatch for {:?}: wrote {}, read back {}",
                    dest, copied_hash, dest_hash
                );
                let _ = fs::remove_file(&dest);
                ManifestEntry::failed(
                    rel,
                    format!("checksum mismatch: expected {copied_hash}, got {dest_hash}"),
                )
            }
            Err(e) => {
                let _ = fs::remove_file(&dest);
                ManifestEntry::failed(rel, format!("re-hash failed: {e}"))
            }
        }
    }

    fn recreate_symlink(&self, record: &FileRecord, dest: &Path, rel: String) -> ManifestEntry {
        let Some(target) = record.symlink_target.as_deref() else {
            return ManifestEntry::failed(rel, "unreadable symlink target");
        };
        if dest.symlink_metadata().is_ok() {
            if let Err(e) = fs::remove_file(dest) {
                return ManifestEntry::failed(rel, format!("cannot replace symlink: {e}"));
            }
        }
        match utils::create_symlink(target, dest) {
            Ok(()) => ManifestEntry::symlink(rel),
            Err(e) => ManifestEntry::failed(rel, format!("cannot create symlink: {e}")),
        }
    }

    fn stored_path(&self, rel: &str) -> String {
        if self.encrypt_suffix {
            format!("{rel}.enc")
        } else {
            rel.to_string()
        }
    }
}

/// Copy a staged artifact (e.g. a database dump) into further local roots
pub fn replicate_artifact(artifact: &Path, dest_roots: &[PathBuf]) -> Vec<(PathBuf, Result<()>)> {
    let mut results = Vec::new();
    for root in dest_roots {
        let result = (|| -> Result<()> {
            fs::create_dir_all(root)?;
            let name = artifact
                .file_name()
                .ok_or_else(|| crate::error::BackupError::internal("artifact has no file name"))?;
            let dest = root.join(name);
            let (hash, _) = utils::copy_and_hash(artifact, &dest)?;
            let (check, _) = utils::hash_file(&dest)?;
            if hash != check {
                let _ = fs::remove_file(&dest);
                return Err(crate::error::BackupError::HashMismatch {
                    expected: hash,
                    actual: check,
                });
            }
            Ok(())
        })();
        results.push((root.clone(), result));
    }
    results
}

/// Manifest row for a file that already sits inside the destination
/// (database dumps are staged directly into the first local root)
pub fn staged_entry(artifact: &Path, dest_root: &Path, encrypt_suffix: bool) -> Result<ManifestEntry> {
    let rel = utils::make_relative(artifact, dest_root)?;
    let rel = portable_path(&rel);
    let (hash, size) = utils::hash_file(artifact)?;
    let stored = if encrypt_suffix {
        format!("{rel}.enc")
    } else {
        rel.clone()
    };
    Ok(ManifestEntry::copied(rel, stored, size, hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FileStatus;
    use crate::selector::Selector;
    use tempfile::TempDir;

    fn scan(source: &Path) -> Vec<FileRecord> {
        Selector::new(source).scan().unwrap()
    }

    #[test]
    fn test_copy_run_verifies_and_tallies() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::write(source.path().join("a.txt"), b"0123456789").unwrap();
        fs::create_dir(source.path().join("dir")).unwrap();
        fs::write(source.path().join("dir/b.txt"), b"hello").unwrap();

        let records = scan(source.path());
        let copier = LocalCopier::new(dest.path()).with_parallel_copies(2);
        let (entries, tally) = copier
            .copy_run(source.path(), &records, &AtomicBool::new(false))
            .unwrap();

        assert_eq!(tally.files_copied, 2);
        assert_eq!(tally.files_failed, 0);
        assert_eq!(tally.bytes_copied, 15);
        assert!(dest.path().join("dir/b.txt").is_file());

        let row = entries.iter().find(|e| e.path == "a.txt").unwrap();
        assert_eq!(row.status, FileStatus::Copied);
        assert_eq!(row.sha256, utils::hash_data(b"0123456789"));
        // Entries come back in selection order
        assert_eq!(entries[0].path, "a.txt");
        assert_eq!(entries[1].path, "dir/b.txt");
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_recreated_not_followed() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::write(source.path().join("a.txt"), b"data").unwrap();
        utils::create_symlink(Path::new("a.txt"), &source.path().join("link")).unwrap();

        let records = scan(source.path());
        let copier = LocalCopier::new(dest.path());
        let (entries, tally) = copier
            .copy_run(source.path(), &records, &AtomicBool::new(false))
            .unwrap();

        assert_eq!(tally.symlinks, 1);
        let link = dest.path().join("link");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("a.txt"));
        assert!(entries
            .iter()
            .any(|e| e.path == "link" && e.status == FileStatus::Symlink));
    }

    #[test]
    fn test_one_failure_does_not_abort() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::write(source.path().join("good.txt"), b"fine").unwrap();

        let mut records = scan(source.path());
        records.push(FileRecord {
            rel_path: PathBuf::from("ghost.txt"),
            size: 4,
            modified: std::time::SystemTime::now(),
            is_symlink: false,
            symlink_target: None,
        });

        let copier = LocalCopier::new(dest.path());
        let (entries, tally) = copier
            .copy_run(source.path(), &records, &AtomicBool::new(false))
            .unwrap();

        assert_eq!(tally.files_copied, 1);
        assert_eq!(tally.files_failed, 1);
        let failed = entries.iter().find(|e| e.path == "ghost.txt").unwrap();
        assert_eq!(failed.status, FileStatus::Failed);
        assert!(failed.error.is_some());
    }

    #[test]
    fn test_encrypt_suffix_changes_stored_path() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::write(source.path().join("a.txt"), b"x").unwrap();

        let copier = LocalCopier::new(dest.path()).with_encrypt_suffix(true);
        let (entries, _) = copier
            .copy_run(source.path(), &scan(source.path()), &AtomicBool::new(false))
            .unwrap();
        assert_eq!(entries[0].stored_path, "a.txt.enc");
        assert_eq!(entries[0].path, "a.txt");
    }

    #[test]
    fn test_replicate_artifact() {
        let staging = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let artifact = staging.path().join("db_backup.sql");
        fs::write(&artifact, b"CREATE TABLE t;").unwrap();

        let results = replicate_artifact(&artifact, &[other.path().to_path_buf()]);
        assert!(results[0].1.is_ok());
        assert!(other.path().join("db_backup.sql").is_file());
    }
}
