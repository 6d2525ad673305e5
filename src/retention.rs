//! Retention pruning of old runs
//!
//! A "run" at a destination is the set of files referenced by one
//! manifest plus the manifest itself. Two independent rules can both be
//! active:
//!
//! - **age**: delete every run whose run id is older than `max_age_days`
//! - **count**: keep only the `max_count` newest runs
//!
//! With both knobs at zero the stage is a no-op.
//!
//! Because dedup hardlinks files and later runs re-list unchanged paths,
//! a doomed run's files are only unlinked when no surviving manifest
//! still references the same stored path: the unlink set is the
//! difference between the doomed manifest's paths and the union of the
//! kept manifests' paths.

use crate::error::Result;
use crate::manifest::{self, FileStatus, Manifest};
use crate::types::RunId;
use crate::utils;
use chrono::{Duration, Local};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Outcome of the retention stage at one destination
#[derive(Debug, Default, Clone)]
pub struct RetentionStats {
    /// Manifests (runs) deleted
    pub runs_removed: usize,
    /// Files unlinked
    pub files_removed: usize,
    /// Files kept because a surviving manifest still lists them
    pub files_retained: usize,
}

/// Apply age and count rules to one local destination root
pub fn apply_retention(
    root: &Path,
    max_age_days: u32,
    max_count: usize,
) -> Result<RetentionStats> {
    let mut stats = RetentionStats::default();
    if max_age_days == 0 && max_count == 0 {
        return Ok(stats);
    }

    let manifest_paths = manifest::list_manifests(root)?;
    if manifest_paths.is_empty() {
        return Ok(stats);
    }

    // Newest first; run ids sort chronologically
    let mut runs: Vec<(RunId, PathBuf)> = manifest_paths
        .into_iter()
        .filter_map(|path| {
            let name = path.file_name()?.to_string_lossy().into_owned();
            manifest::run_id_from_file_name(&name).map(|id| (id, path))
        })
        .collect();
    runs.sort_by(|a, b| b.0.cmp(&a.0));

    let mut doomed: Vec<(RunId, PathBuf)> = Vec::new();
    let mut kept: Vec<(RunId, PathBuf)> = Vec::new();

    let age_cutoff = if max_age_days > 0 {
        Some(Local::now() - Duration::days(max_age_days as i64))
    } else {
        None
    };

    for (index, (run_id, path)) in runs.into_iter().enumerate() {
        let too_old = match (&age_cutoff, run_id.timestamp()) {
            (Some(cutoff), Ok(started)) => started < *cutoff,
            _ => false,
        };
        let beyond_count = max_count > 0 && index >= max_count;
        if too_old || beyond_count {
            doomed.push((run_id, path));
        } else {
            kept.push((run_id, path));
        }
    }

    if doomed.is_empty() {
        return Ok(stats);
    }

    // Union of stored paths every surviving manifest still needs
    let mut protected: HashSet<String> = HashSet::new();
    for (_, path) in &kept {
        match Manifest::load(path) {
            Ok(m) => {
                for entry in &m.files {
                    if entry.status != FileStatus::Failed {
                        protected.insert(entry.stored_path.clone());
                    }
                }
            }
            Err(e) => {
                // An unreadable survivor must not cause deletions it
                // might still reference; keep everything instead.
                warn!(
                    "Cannot read surviving manifest {:?}: {}; skipping retention in {:?}",
                    path, e, root
                );
                return Ok(stats);
            }
        }
    }

    for (run_id, manifest_path) in doomed {
        debug!("Pruning run {} from {:?}", run_id, root);
        match Manifest::load(&manifest_path) {
            Ok(m) => {
                for entry in &m.files {
                    if entry.status == FileStatus::Failed {
                        continue;
                    }
                    if protected.contains(&entry.stored_path) {
                        stats.files_retained += 1;
                        continue;
                    }
                    let stored = root.join(&entry.stored_path);
                    match fs::remove_file(&stored) {
                        Ok(()) => {
                            stats.files_removed += 1;
                            prune_empty_parents(root, &stored);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => warn!("Cannot remove {:?}: {}", stored, e),
                    }
                }
            }
            Err(e) => warn!(
                "Cannot read doomed manifest {:?}: {}; removing manifest only",
                manifest_path, e
            ),
        }

        match fs::remove_file(&manifest_path) {
            Ok(()) => stats.runs_removed += 1,
            Err(e) => warn!("Cannot remove manifest {:?}: {}", manifest_path, e),
        }
    }

    info!(
        "Retention in {:?}: {} runs removed, {} files removed, {} still referenced",
        root, stats.runs_removed, stats.files_removed, stats.files_retained
    );
    Ok(stats)
}

/// Remove now-empty directories between a deleted file and the root
fn prune_empty_parents(root: &Path, removed: &Path) {
    let mut parent = removed.parent();
    while let Some(dir) = parent {
        if dir == root {
            break;
        }
        match utils::remove_dir_if_empty(dir) {
            Ok(true) => parent = dir.parent(),
            _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestEntry;
    use crate::types::BackupMode;
    use tempfile::TempDir;

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
    fn test_zero_knobs_is_noop() {
        let dir = TempDir::new().unwrap();
        write_run(dir.path(), "20200101_000000", &[("old.txt", b"old")]);

        let stats = apply_retention(dir.path(), 0, 0).unwrap();
        assert_eq!(stats.runs_removed, 0);
        assert!(dir.path().join("old.txt").exists());
    }

    #[test]
    fn test_count_rule_keeps_newest() {
        let dir = TempDir::new().unwrap();
        write_run(dir.path(), "20260101_000000", &[("r1.txt", b"1")]);
        write_run(dir.path(), "20260102_000000", &[("r2.txt", b"2")]);
        write_run(dir.path(), "20260103_000000", &[("r3.txt", b"3")]);

        let stats = apply_retention(dir.path(), 0, 2).unwrap();
        assert_eq!(stats.runs_removed, 1);
        assert!(!dir.path().join("r1.txt").exists());
        assert!(dir.path().join("r2.txt").exists());
        assert!(dir.path().join("r3.txt").exists());

        let remaining = manifest::list_manifests(dir.path()).unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[test]
    fn test_age_rule() {
        let dir = TempDir::new().unwrap();
        write_run(dir.path(), "20200101_000000", &[("ancient.txt", b"x")]);
        let recent = Local::now().format("%Y%m%d_%H%M%S").to_string();
        write_run(dir.path(), &recent, &[("fresh.txt", b"y")]);

        let stats = apply_retention(dir.path(), 30, 0).unwrap();
        assert_eq!(stats.runs_removed, 1);
        assert!(!dir.path().join("ancient.txt").exists());
        assert!(dir.path().join("fresh.txt").exists());
    }

    #[test]
    fn test_shared_files_survive() {
        let dir = TempDir::new().unwrap();
        // Both runs list the same stored path
        write_run(dir.path(), "20260101_000000", &[("shared.txt", b"s")]);
        write_run(dir.path(), "20260102_000000", &[("shared.txt", b"s")]);

        let stats = apply_retention(dir.path(), 0, 1).unwrap();
        assert_eq!(stats.runs_removed, 1);
        assert_eq!(stats.files_removed, 0);
        assert_eq!(stats.files_retained, 1);
        assert!(dir.path().join("shared.txt").exists());
    }

    #[test]
    fn test_empty_parent_dirs_pruned() {
        let dir = TempDir::new().unwrap();
        write_run(dir.path(), "20260101_000000", &[("deep/nested/f.txt", b"x")]);
        write_run(dir.path(), "20260102_000000", &[("top.txt", b"y")]);

        apply_retention(dir.path(), 0, 1).unwrap();
        assert!(!dir.path().join("deep").exists());
        assert!(dir.path().join("top.txt").exists());
    }
}
