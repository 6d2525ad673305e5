//! Error types for the coffer library
//!
//! This module defines all error types that can occur during backup
//! operations. Errors are grouped by the stage that raised them so that
//! the orchestrator can decide whether a failure aborts the run, disables
//! a single destination, or becomes a per-file manifest row.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the coffer library
pub type Result<T> = std::result::Result<T, BackupError>;

/// Main error type for all backup operations
#[derive(Debug, Error)]
pub enum BackupError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid or incomplete configuration (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// An environment variable referenced from the config is not set
    #[error("Environment variable '{name}' is not set (referenced as '${{{name}}}' in config)")]
    UnresolvedEnvVar {
        /// Name of the missing variable
        name: String,
    },

    /// Another instance holds the single-instance lock
    #[error("Another instance is already running (PID {pid}); remove {path:?} if this is incorrect")]
    LockHeld {
        /// PID recorded in the lock file
        pid: u32,
        /// Path of the lock file
        path: PathBuf,
    },

    /// Source tree could not be enumerated (fatal for the run)
    #[error("Selection failed: {0}")]
    Selection(String),

    /// Per-file copy error (recorded in the manifest, run continues)
    #[error("Copy failed for {path:?}: {reason}")]
    Copy {
        /// File that failed to copy
        path: PathBuf,
        /// Why the copy failed
        reason: String,
    },

    /// Checksum mismatch between source and destination
    #[error("Hash mismatch - expected: {expected}, actual: {actual}")]
    HashMismatch {
        /// Expected hash value
        expected: String,
        /// Actual computed hash value
        actual: String,
    },

    /// SFTP or object-store transport failure
    #[error("Transport error ({endpoint}): {reason}")]
    Transport {
        /// Host or bucket that failed
        endpoint: String,
        /// Underlying failure
        reason: String,
    },

    /// Remote authentication was rejected (never retried)
    #[error("Authentication failed for {endpoint}: {reason}")]
    Auth {
        /// Host or bucket that rejected the credentials
        endpoint: String,
        /// Underlying failure
        reason: String,
    },

    /// SSH transport errors from the ssh2 crate
    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    /// No usable key material for encryption (fatal for the destination)
    #[error("Encryption key error: {0}")]
    KeyMaterial(String),

    /// Per-file encryption or decryption failure
    #[error("Crypto error for {path:?}: {reason}")]
    Crypto {
        /// File being encrypted or decrypted
        path: PathBuf,
        /// Why the operation failed
        reason: String,
    },

    /// Deduplication failure that cannot be downgraded
    #[error("Dedup error: {0}")]
    Dedup(String),

    /// Retention pruning failure
    #[error("Retention error: {0}")]
    Retention(String),

    /// Archive creation or extraction failure
    #[error("Archive error: {0}")]
    Archive(String),

    /// Pre- or post-backup hook failed
    #[error("Hook '{phase}' failed: {reason}")]
    Hook {
        /// Which hook phase failed (pre_backup / post_backup)
        phase: String,
        /// Exit status or spawn failure
        reason: String,
    },

    /// Database dump invocation failure
    #[error("Database dump failed: {0}")]
    DbDump(String),

    /// A manifest file is missing or cannot be parsed
    #[error("Invalid manifest {path:?}: {reason}")]
    InvalidManifest {
        /// Path of the offending manifest
        path: PathBuf,
        /// Parse or validation failure
        reason: String,
    },

    /// Destination verification found corruption
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// Restore operation failed
    #[error("Restore failed: {0}")]
    RestoreFailed(String),

    /// Schedule definition is invalid
    #[error("Invalid schedule: {0}")]
    Schedule(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BackupError {
    /// Create a configuration error with a custom message
    pub fn config(msg: impl Into<String>) -> Self {
        BackupError::Config(msg.into())
    }

    /// Create a selection error with a custom message
    pub fn selection(msg: impl Into<String>) -> Self {
        BackupError::Selection(msg.into())
    }

    /// Create a transport error for an endpoint
    pub fn transport(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        BackupError::Transport {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        BackupError::Internal(msg.into())
    }

    /// Whether this error aborts the entire run
    ///
    /// Only configuration, lock and pre-hook errors are run-fatal; per-file
    /// and per-destination errors are absorbed into the run report.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            BackupError::Config(_)
                | BackupError::UnresolvedEnvVar { .. }
                | BackupError::LockHeld { .. }
                | BackupError::Selection(_)
                | BackupError::Hook { .. }
        )
    }

    /// Whether retrying a transport operation can help
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackupError::Transport { .. } | BackupError::Io(_) | BackupError::Ssh(_)
        )
    }
}
