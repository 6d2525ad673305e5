//! # Coffer - verifiable, policy-driven backups
//!
//! Coffer is a backup pipeline engine: given a source tree and a
//! declarative configuration it enumerates files under a selection
//! policy (full / incremental / differential), copies or streams them to
//! every enabled destination with per-file integrity verification,
//! writes an authoritative manifest per run, and then applies the
//! post-processing stages: encrypt, deduplicate, prune.
//!
//! ## Overview
//!
//! - **Destinations**: local directories, SSH/SFTP hosts, an
//!   object-store bucket, and database dump artifacts
//! - **Manifests**: one JSON manifest per run per destination, driving
//!   verification, retention and point-in-time restore
//! - **Encryption at rest**: per-file AES-256-GCM envelopes with keys
//!   from a key file or a PBKDF2-derived passphrase
//! - **Deduplication**: content-addressed hardlinks within and across
//!   local destinations sharing a filesystem
//! - **Retention**: prune runs by age and/or count without ever touching
//!   a file a surviving manifest still references
//! - **Scheduling**: wall-clock timetable with a single-instance PID lock
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use coffer::config::BackupConfig;
//! use coffer::orchestrator::Orchestrator;
//! use std::path::Path;
//!
//! # fn main() -> coffer::Result<()> {
//! let config = BackupConfig::load(Path::new("config/config.ini"))?;
//! let report = Orchestrator::new(config).execute()?;
//! println!("Run {} finished: {}", report.run_id, report.outcome);
//! # Ok(())
//! # }
//! ```
//!
//! ## Pipeline
//!
//! One run moves through a fixed sequence of stages:
//!
//! ```text
//! idle -> locked -> pre-hook -> selecting -> copying -> manifesting
//!      -> encrypting -> deduping -> pruning -> post-hook -> reporting
//! ```
//!
//! Within a destination the post-copy stages are strictly sequential;
//! across destinations stages interleave freely. Per-file errors become
//! manifest rows, per-destination errors disable one destination, and
//! only configuration, lock, selection and pre-hook errors abort a run.

pub mod compress;
pub mod config;
pub mod db_dump;
pub mod dedup;
pub mod destination;
pub mod encryption;
pub mod error;
pub mod events;
pub mod hooks;
pub mod local_copy;
pub mod manifest;
pub mod object_store;
pub mod orchestrator;
pub mod restore;
pub mod retention;
pub mod scheduler;
pub mod selector;
pub mod sftp_copy;
pub mod types;
pub mod utils;
pub mod verify;

pub use config::BackupConfig;
pub use error::{BackupError, Result};
pub use manifest::{Manifest, ManifestEntry};
pub use orchestrator::Orchestrator;
pub use types::{BackupMode, RunId, RunOutcome, RunReport};
