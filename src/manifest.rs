//! Per-run backup manifests
//!
//! A manifest is the authoritative record of what one run produced at a
//! single destination. Exactly one manifest is written per run per
//! destination, named `backup_manifest_<run-id>.json`, and manifests are
//! never encrypted: restore, verification and retention all need to read
//! them back.
//!
//! Because run ids are zero-padded local timestamps, a lexicographic sort
//! of manifest file names is a chronological sort, which is how "latest"
//! and "latest full" are resolved.

use crate::error::{BackupError, Result};
use crate::types::{BackupMode, RunId};
use crate::utils;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File-name prefix shared by every manifest
pub const MANIFEST_PREFIX: &str = "backup_manifest_";

/// Outcome of one file within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// Copied and checksum-verified
    Copied,
    /// Present but unchanged, not transferred
    Skipped,
    /// Copy attempted and failed
    Failed,
    /// Recreated as a symbolic link
    Symlink,
}

/// One file row in a manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Source-relative path, forward-slash normalized
    pub path: String,
    /// Path of the bytes on the destination (gains `.enc` when encrypted)
    pub stored_path: String,
    /// Plaintext size in bytes
    pub size: u64,
    /// SHA-256 of the plaintext content (empty for symlinks)
    pub sha256: String,
    /// What happened to this file
    pub status: FileStatus,
    /// Failure detail when `status` is `Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ManifestEntry {
    /// Row for a successfully copied and verified file
    pub fn copied(path: String, stored_path: String, size: u64, sha256: String) -> Self {
        ManifestEntry {
            path,
            stored_path,
            size,
            sha256,
            status: FileStatus::Copied,
            error: None,
        }
    }

    /// Row for an unchanged file that was not transferred
    pub fn skipped(path: String, size: u64) -> Self {
        ManifestEntry {
            stored_path: path.clone(),
            path,
            size,
            sha256: String::new(),
            status: FileStatus::Skipped,
            error: None,
        }
    }

    /// Row for a failed copy
    pub fn failed(path: String, error: impl Into<String>) -> Self {
        ManifestEntry {
            stored_path: path.clone(),
            path,
            size: 0,
            sha256: String::new(),
            status: FileStatus::Failed,
            error: Some(error.into()),
        }
    }

    /// Row for a recreated symlink
    pub fn symlink(path: String) -> Self {
        ManifestEntry {
            stored_path: path.clone(),
            path,
            size: 0,
            sha256: String::new(),
            status: FileStatus::Symlink,
            error: None,
        }
    }
}

/// The authoritative record of one run at one destination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Run identifier (`YYYYMMDD_HHMMSS`)
    pub run_id: RunId,
    /// Selection policy of the run
    pub mode: BackupMode,
    /// Absolute source root
    pub source_root: PathBuf,
    /// Absolute destination root (local path, remote path, or bucket URL)
    pub destination_root: PathBuf,
    /// When the run started
    pub started_at: DateTime<Local>,
    /// When the destination finished copying
    pub finished_at: DateTime<Local>,
    /// Per-file rows
    pub files: Vec<ManifestEntry>,
}

impl Manifest {
    /// Start a manifest for a run at one destination
    pub fn new(
        run_id: RunId,
        mode: BackupMode,
        source_root: PathBuf,
        destination_root: PathBuf,
        started_at: DateTime<Local>,
    ) -> Self {
        Manifest {
            run_id,
            mode,
            source_root,
            destination_root,
            started_at,
            finished_at: started_at,
            files: Vec::new(),
        }
    }

    /// File name this manifest is stored under
    pub fn file_name(&self) -> String {
        manifest_file_name(&self.run_id)
    }

    /// Count of rows with the given status
    pub fn count(&self, status: FileStatus) -> usize {
        self.files.iter().filter(|f| f.status == status).count()
    }

    /// Total plaintext bytes of copied rows
    pub fn total_bytes(&self) -> u64 {
        self.files
            .iter()
            .filter(|f| f.status == FileStatus::Copied)
            .map(|f| f.size)
            .sum()
    }

    /// Look up a row by its source-relative path
    pub fn entry(&self, path: &str) -> Option<&ManifestEntry> {
        self.files.iter().find(|f| f.path == path)
    }

    /// Serialize and write atomically into `dir`
    ///
    /// The manifest is written to a temp sibling and renamed into place so
    /// a crash can never leave a truncated manifest behind.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        let json = serde_json::to_vec_pretty(self)?;
        utils::atomic_write(&path, &json)?;
        debug!("Wrote manifest {:?} ({} rows)", path, self.files.len());
        Ok(path)
    }

    /// Load a manifest from a file
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| BackupError::InvalidManifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Serialize to pretty JSON bytes (for remote destinations)
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse a manifest from JSON bytes fetched from a remote destination
    pub fn from_json(data: &[u8], origin: &Path) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| BackupError::InvalidManifest {
            path: origin.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

/// File name for a run's manifest
pub fn manifest_file_name(run_id: &RunId) -> String {
    format!("{MANIFEST_PREFIX}{run_id}.json")
}

/// Extract the run id from a manifest file name
pub fn run_id_from_file_name(name: &str) -> Option<RunId> {
    let stem = name.strip_prefix(MANIFEST_PREFIX)?.strip_suffix(".json")?;
    RunId::parse(stem).ok()
}

/// List manifest paths in a directory, lexicographically (= chronologically)
///
/// A missing directory means "no prior runs", not an error.
pub fn list_manifests(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if run_id_from_file_name(&name).is_some() {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

/// Load the newest manifest in a directory, if any
pub fn latest_manifest(dir: &Path) -> Result<Option<Manifest>> {
    let paths = list_manifests(dir)?;
    match paths.last() {
        Some(path) => Ok(Some(Manifest::load(path)?)),
        None => Ok(None),
    }
}

/// Load the newest `full`-mode manifest in a directory, if any
pub fn latest_full_manifest(dir: &Path) -> Result<Option<Manifest>> {
    for path in list_manifests(dir)?.iter().rev() {
        match Manifest::load(path) {
            Ok(m) if m.mode == BackupMode::Full => return Ok(Some(m)),
            Ok(_) => continue,
            Err(e) => {
                warn!("Skipping unreadable manifest {:?}: {}", path, e);
                continue;
            }
        }
    }
    Ok(None)
}

/// Load all manifests with run id up to (and including) `cutoff`, oldest first
pub fn manifests_up_to(dir: &Path, cutoff: &RunId) -> Result<Vec<Manifest>> {
    let mut manifests = Vec::new();
    for path in list_manifests(dir)? {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some(run_id) = run_id_from_file_name(&name) else {
            continue;
        };
        if run_id <= *cutoff {
            manifests.push(Manifest::load(&path)?);
        }
    }
    Ok(manifests)
}
