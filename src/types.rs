//! Core data types shared across the backup pipeline
//!
//! The types in this module represent:
//! - **Run identity**: [`RunId`] - the `YYYYMMDD_HHMMSS` stamp of one run
//! - **File system state**: [`FileRecord`] - a source file selected for a run
//! - **Results**: [`RunReport`], [`DestinationTally`], [`RunOutcome`]
//! - **Progress**: [`ProgressInfo`] and the [`ProgressCallback`] alias

use crate::error::{BackupError, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

/// Backup selection policy for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    /// Every regular file and symlink under the source
    Full,
    /// Files changed since the latest run of any mode
    Incremental,
    /// Files changed since the latest full run
    Differential,
}

impl BackupMode {
    /// Parse a mode from its config/CLI spelling
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(BackupMode::Full),
            "incremental" => Ok(BackupMode::Incremental),
            "differential" => Ok(BackupMode::Differential),
            other => Err(BackupError::config(format!(
                "mode must be full, incremental, or differential, got '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for BackupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupMode::Full => write!(f, "full"),
            BackupMode::Incremental => write!(f, "incremental"),
            BackupMode::Differential => write!(f, "differential"),
        }
    }
}

/// Identifier of a single backup run
///
/// A `RunId` is the local-clock timestamp captured at run start, formatted
/// `YYYYMMDD_HHMMSS`. Zero padding makes lexicographic order equal
/// chronological order, which the manifest store relies on when picking
/// the latest run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

const RUN_ID_FORMAT: &str = "%Y%m%d_%H%M%S";

impl RunId {
    /// Capture a new run id from the local clock
    pub fn now() -> Self {
        RunId(Local::now().format(RUN_ID_FORMAT).to_string())
    }

    /// Validate and wrap an existing `YYYYMMDD_HHMMSS` stamp
    pub fn parse(s: &str) -> Result<Self> {
        NaiveDateTime::parse_from_str(s, RUN_ID_FORMAT).map_err(|_| {
            BackupError::config(format!("invalid run id '{s}', expected YYYYMMDD_HHMMSS"))
        })?;
        Ok(RunId(s.to_string()))
    }

    /// The wall-clock instant this run id encodes
    pub fn timestamp(&self) -> Result<DateTime<Local>> {
        let naive = NaiveDateTime::parse_from_str(&self.0, RUN_ID_FORMAT)
            .map_err(|e| BackupError::internal(format!("malformed run id '{}': {e}", self.0)))?;
        Local
            .from_local_datetime(&naive)
            .single()
            .or_else(|| Local.from_local_datetime(&naive).earliest())
            .ok_or_else(|| BackupError::internal(format!("ambiguous local time in run id '{}'", self.0)))
    }

    /// Borrow the raw stamp
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A source file participating in a run
///
/// Produced by the selector; paths are stored relative to the source root
/// and forward-slash normalized. The content hash is computed lazily by
/// the copier, not at scan time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Path relative to the source root
    pub rel_path: PathBuf,
    /// File size in bytes (0 for symlinks)
    pub size: u64,
    /// Last modification time
    pub modified: SystemTime,
    /// Whether this entry is a symbolic link
    pub is_symlink: bool,
    /// Link target when `is_symlink` is true
    pub symlink_target: Option<PathBuf>,
}

impl FileRecord {
    /// Relative path with forward slashes, as stored in manifests
    pub fn portable_path(&self) -> String {
        portable_path(&self.rel_path)
    }
}

/// Convert a relative path to its forward-slash manifest spelling
pub fn portable_path(path: &std::path::Path) -> String {
    let s = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        s.into_owned()
    } else {
        s.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

/// Overall result of one orchestrated run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    /// Every destination produced a valid manifest and no file failed
    Success,
    /// At least one failure, but at least one destination has a valid manifest
    Partial,
    /// No destination produced a valid manifest
    Failed,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Success => write!(f, "success"),
            RunOutcome::Partial => write!(f, "partial"),
            RunOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// Per-destination accumulator for one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DestinationTally {
    /// Destination label (path, host, or bucket URL)
    pub destination: String,
    /// Files copied successfully
    pub files_copied: usize,
    /// Files skipped as unchanged
    pub files_skipped: usize,
    /// Files that failed to copy
    pub files_failed: usize,
    /// Symlinks recreated
    pub symlinks: usize,
    /// Bytes written for copied files
    pub bytes_copied: u64,
    /// Whether a manifest was written for this destination
    pub manifest_written: bool,
    /// Fatal per-destination error, if the whole destination failed
    pub fatal: Option<String>,
}

impl DestinationTally {
    /// Create an empty tally for a destination label
    pub fn new(destination: impl Into<String>) -> Self {
        DestinationTally {
            destination: destination.into(),
            ..Default::default()
        }
    }

    /// Whether any per-file or per-destination failure was recorded
    pub fn has_failures(&self) -> bool {
        self.files_failed > 0 || self.fatal.is_some()
    }
}

/// Complete report for one orchestrated run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Run identifier
    pub run_id: RunId,
    /// Selection policy used
    pub mode: BackupMode,
    /// Overall outcome
    pub outcome: RunOutcome,
    /// When the run started
    pub started_at: DateTime<Local>,
    /// When the run finished
    pub finished_at: DateTime<Local>,
    /// Per-destination tallies
    pub destinations: Vec<DestinationTally>,
    /// Whether a stop signal interrupted the run
    pub cancelled: bool,
}

impl RunReport {
    /// Total files copied across destinations
    pub fn files_copied(&self) -> usize {
        self.destinations.iter().map(|d| d.files_copied).sum()
    }

    /// Total files failed across destinations
    pub fn files_failed(&self) -> usize {
        self.destinations.iter().map(|d| d.files_failed).sum()
    }

    /// Total bytes copied across destinations
    pub fn bytes_copied(&self) -> u64 {
        self.destinations.iter().map(|d| d.bytes_copied).sum()
    }

    /// Derive the overall outcome from the per-destination tallies
    pub fn derive_outcome(destinations: &[DestinationTally]) -> RunOutcome {
        let with_manifest = destinations.iter().filter(|d| d.manifest_written).count();
        if with_manifest == 0 {
            return RunOutcome::Failed;
        }
        let any_failure = destinations.iter().any(|d| d.has_failures())
            || with_manifest < destinations.len();
        if any_failure {
            RunOutcome::Partial
        } else {
            RunOutcome::Success
        }
    }
}

/// Progress callback for long-running operations
pub type ProgressCallback = Arc<dyn Fn(ProgressInfo) + Send + Sync>;

/// Information passed to progress callbacks
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Operation being performed
    pub operation: String,
    /// Current item being processed
    pub current_item: Option<String>,
    /// Items processed so far
    pub processed: usize,
    /// Total items to process (if known)
    pub total: Option<usize>,
    /// Bytes processed so far
    pub bytes_processed: u64,
}
