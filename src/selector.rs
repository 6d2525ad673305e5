//! Run selection: deciding which source files participate
//!
//! The selector enumerates the source tree and applies the run's policy:
//!
//! - **full**: every regular file and symlink, minus excluded globs
//! - **incremental**: a file participates iff its mtime is strictly newer
//!   than the latest run's start time, or it is absent from the latest
//!   manifest
//! - **differential**: the same rule against the latest *full* manifest
//!
//! When destinations disagree on "latest", each destination gets its own
//! selection against its own manifest history. Symlinks are always
//! recorded as symlinks and never dereferenced. Output is sorted by
//! relative path so repeated runs are diff-reproducible.

use crate::error::{BackupError, Result};
use crate::manifest::Manifest;
use crate::types::{BackupMode, FileRecord};
use crate::utils;
use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use std::path::PathBuf;
use std::time::SystemTime;
use tracing::{debug, warn};

/// Enumerates and filters source files for one run
#[derive(Debug, Clone)]
pub struct Selector {
    source_root: PathBuf,
    exclude_patterns: Vec<String>,
}

impl Selector {
    /// Create a selector over a source root
    pub fn new(source_root: impl Into<PathBuf>) -> Self {
        Selector {
            source_root: source_root.into(),
            exclude_patterns: Vec::new(),
        }
    }

    /// Set glob patterns excluded from every run
    ///
    /// Patterns are matched against the source-relative path.
    pub fn with_exclude_patterns(mut self, patterns: Vec<String>) -> Self {
        self.exclude_patterns = patterns;
        self
    }

    /// The root this selector scans
    pub fn source_root(&self) -> &std::path::Path {
        &self.source_root
    }

    /// Enumerate every regular file and symlink under the source
    ///
    /// Unreadable entries below the root are logged and skipped; an
    /// unreadable root is fatal for the run.
    pub fn scan(&self) -> Result<Vec<FileRecord>> {
        if !self.source_root.is_dir() {
            return Err(BackupError::selection(format!(
                "source directory {:?} does not exist or is not a directory",
                self.source_root
            )));
        }

        let mut walker = WalkBuilder::new(&self.source_root);
        walker
            .follow_links(false)
            .hidden(false)
            .parents(false)
            .ignore(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .require_git(false);

        // The override builder excludes with a leading '!'
        let mut overrides = OverrideBuilder::new(&self.source_root);
        for pattern in &self.exclude_patterns {
            let final_pattern = if let Some(stripped) = pattern.strip_prefix('!') {
                stripped.to_string()
            } else {
                format!("!{pattern}")
            };
            if let Err(e) = overrides.add(&final_pattern) {
                warn!("Invalid exclude pattern '{}': {}", pattern, e);
            }
        }
        match overrides.build() {
            Ok(ov) => {
                walker.overrides(ov);
            }
            Err(e) => warn!("Exclude patterns disabled: {}", e),
        }

        let mut records = Vec::new();
        for entry in walker.build() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Walk error under {:?}: {}", self.source_root, e);
                    continue;
                }
            };
            let path = entry.path();
            if path == self.source_root {
                continue;
            }

            let metadata = match std::fs::symlink_metadata(path) {
                Ok(m) => m,
                Err(e) => {
                    warn!("Cannot stat {:?}: {}", path, e);
                    continue;
                }
            };
            if metadata.is_dir() {
                continue;
            }

            let rel_path = utils::make_relative(path, &self.source_root)?;
            let is_symlink = metadata.file_type().is_symlink();
            let symlink_target = if is_symlink {
                match utils::read_symlink(path) {
                    Ok(target) => Some(target),
                    Err(e) => {
                        warn!("Cannot read symlink {:?}: {}", path, e);
                        None
                    }
                }
            } else {
                None
            };

            records.push(FileRecord {
                rel_path,
                size: if is_symlink { 0 } else { metadata.len() },
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                is_symlink,
                symlink_target,
            });
        }

        records.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        debug!(
            "Scanned {} entries under {:?}",
            records.len(),
            self.source_root
        );
        Ok(records)
    }

    /// Select the files participating in a run at one destination
    ///
    /// `reference` is the destination's latest manifest for incremental
    /// runs, or its latest full manifest for differential runs; `None`
    /// (no prior runs) selects everything.
    pub fn select(
        &self,
        mode: BackupMode,
        reference: Option<&Manifest>,
    ) -> Result<Vec<FileRecord>> {
        let all = self.scan()?;
        let selected = match (mode, reference) {
            (BackupMode::Full, _) | (_, None) => all,
            (BackupMode::Incremental | BackupMode::Differential, Some(reference)) => {
                let cutoff: SystemTime = reference.started_at.into();
                all.into_iter()
                    .filter(|record| {
                        record.modified > cutoff
                            || reference.entry(&record.portable_path()).is_none()
                    })
                    .collect()
            }
        };
        debug!(
            "Selected {} files for {} run against {:?}",
            selected.len(),
            mode,
            reference.map(|m| m.run_id.as_str().to_string())
        );
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestEntry;
    use crate::types::RunId;
    use chrono::{Duration, Local};
    use std::fs;
    use tempfile::TempDir;

    fn make_source() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"0123456789").unwrap();
        fs::create_dir(dir.path().join("dir")).unwrap();
        fs::write(dir.path().join("dir/b.txt"), b"hello").unwrap();
        dir
    }

    #[test]
    fn test_full_scan_sorted() {
        let source = make_source();
        let records = Selector::new(source.path()).scan().unwrap();
        let paths: Vec<String> = records.iter().map(|r| r.portable_path()).collect();
        assert_eq!(paths, vec!["a.txt", "dir/b.txt"]);
    }

    #[test]
    fn test_exclude_globs() {
        let source = make_source();
        fs::write(source.path().join("skip.log"), b"noise").unwrap();

        let records = Selector::new(source.path())
            .with_exclude_patterns(vec!["*.log".to_string()])
            .scan()
            .unwrap();
        assert!(records.iter().all(|r| r.portable_path() != "skip.log"));
        assert_eq!(records.len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_never_dereferenced() {
        let source = make_source();
        utils::create_symlink(
            std::path::Path::new("a.txt"),
            &source.path().join("link"),
        )
        .unwrap();

        let records = Selector::new(source.path()).scan().unwrap();
        let link = records
            .iter()
            .find(|r| r.portable_path() == "link")
            .unwrap();
        assert!(link.is_symlink);
        assert_eq!(link.symlink_target, Some(PathBuf::from("a.txt")));
        assert_eq!(link.size, 0);
    }

    #[test]
    fn test_missing_source_is_fatal() {
        let err = Selector::new("/definitely/not/here").scan().unwrap_err();
        assert!(matches!(err, BackupError::Selection(_)));
    }

    #[test]
    fn test_incremental_selects_changed_and_new() {
        let source = make_source();
        let selector = Selector::new(source.path());

        // Reference run started in the future relative to the files on
        // disk, so nothing is newer than it.
        let mut reference = Manifest::new(
            RunId::parse("20260101_000000").unwrap(),
            BackupMode::Full,
            source.path().to_path_buf(),
            PathBuf::from("/dst"),
            Local::now() + Duration::hours(1),
        );
        reference.files.push(ManifestEntry::copied(
            "a.txt".into(),
            "a.txt".into(),
            10,
            "h".into(),
        ));
        reference.files.push(ManifestEntry::copied(
            "dir/b.txt".into(),
            "dir/b.txt".into(),
            5,
            "h".into(),
        ));

        let selected = selector
            .select(BackupMode::Incremental, Some(&reference))
            .unwrap();
        assert!(selected.is_empty());

        // A file missing from the manifest participates even when old
        reference.files.retain(|f| f.path != "dir/b.txt");
        let selected = selector
            .select(BackupMode::Incremental, Some(&reference))
            .unwrap();
        let paths: Vec<String> = selected.iter().map(|r| r.portable_path()).collect();
        assert_eq!(paths, vec!["dir/b.txt"]);
    }

    #[test]
    fn test_no_reference_selects_everything() {
        let source = make_source();
        let selected = Selector::new(source.path())
            .select(BackupMode::Incremental, None)
            .unwrap();
        assert_eq!(selected.len(), 2);
    }
}
