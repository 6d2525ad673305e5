//! Destination descriptors
//!
//! A destination is an addressable write target: a local directory, an
//! SFTP host, or an object-store bucket. Descriptors are built from the
//! configuration snapshot at run start and live for exactly one run.
//! Stages that only apply to local destinations (encryption, dedup,
//! retention) test the tag instead of calling no-op methods.

use crate::config::BackupConfig;
use crate::error::{BackupError, Result};
use crate::object_store::ObjectStoreTarget;
use crate::sftp_copy::SftpTarget;
use std::path::{Path, PathBuf};

/// One write target of a run
#[derive(Debug, Clone)]
pub enum Destination {
    /// A directory on a local filesystem
    LocalDir {
        /// Destination root
        root: PathBuf,
    },
    /// A remote SFTP host
    SftpHost {
        /// Connection parameters
        target: SftpTarget,
    },
    /// An object-store bucket and key prefix
    ObjectBucket {
        /// Connection parameters
        target: ObjectStoreTarget,
    },
}

impl Destination {
    /// Human-readable label used in tallies, events and logs
    pub fn label(&self) -> String {
        match self {
            Destination::LocalDir { root } => root.display().to_string(),
            Destination::SftpHost { target } => target.label(),
            Destination::ObjectBucket { target } => target.label(),
        }
    }

    /// Root recorded as `destination_root` in the manifest
    pub fn manifest_root(&self) -> PathBuf {
        match self {
            Destination::LocalDir { root } => root.clone(),
            Destination::SftpHost { target } => {
                PathBuf::from(format!("{}:{}", target.host, target.remote_root.display()))
            }
            Destination::ObjectBucket { target } => PathBuf::from(target.label()),
        }
    }

    /// Whether post-copy stages (encrypt, dedup, retention) apply
    pub fn is_local(&self) -> bool {
        matches!(self, Destination::LocalDir { .. })
    }

    /// Local root when this is a local destination
    pub fn local_root(&self) -> Option<&Path> {
        match self {
            Destination::LocalDir { root } => Some(root),
            _ => None,
        }
    }
}

/// Build the run's destination set from the configuration snapshot
///
/// The source directory doubles as the remote mirror root for SFTP
/// hosts, so a restore can address them as `user@host:<source_dir>`.
pub fn destinations_from_config(config: &BackupConfig) -> Result<Vec<Destination>> {
    let mut destinations = Vec::new();

    if config.modes.local {
        for root in &config.backup_dirs {
            let root = std::path::absolute(root).unwrap_or_else(|_| root.clone());
            destinations.push(Destination::LocalDir { root });
        }
    }

    if config.modes.ssh {
        let username = config.ssh.username.clone().ok_or_else(|| {
            BackupError::config("'username' is required in [SSH] when ssh mode is enabled")
        })?;
        let remote_root = config
            .source_dir
            .clone()
            .ok_or_else(|| BackupError::config("'source_dir' is required for ssh mode"))?;
        for host in &config.ssh.servers {
            destinations.push(Destination::SftpHost {
                target: SftpTarget {
                    host: host.clone(),
                    port: 22,
                    username: username.clone(),
                    password: config.ssh.password.clone(),
                    key_file: config.ssh.key_file.clone(),
                    remote_root: remote_root.clone(),
                    bandwidth_limit_kbps: config.ssh.bandwidth_limit_kbps,
                },
            });
        }
    }

    if config.modes.s3 {
        let bucket = config.s3.bucket.clone().ok_or_else(|| {
            BackupError::config("'bucket' is required in [S3] when s3 mode is enabled")
        })?;
        destinations.push(Destination::ObjectBucket {
            target: ObjectStoreTarget {
                bucket,
                prefix: config.s3.prefix.clone(),
                region: config.s3.region.clone(),
                access_key: config.s3.access_key.clone(),
                secret_key: config.s3.secret_key.clone(),
            },
        });
    }

    Ok(destinations)
}
