//! Utility functions for coffer
//!
//! File hashing, atomic writes, symlink handling and path helpers shared
//! by the copy, verification and restore stages.
//!
//! All hashing streams files in fixed 8 KiB chunks; nothing here buffers
//! a whole file in memory.

use crate::error::{BackupError, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::trace;

/// Chunk size for streaming reads
const HASH_BUF_SIZE: usize = 8192;

/// Hash a file's content with SHA-256, returning `(hex_digest, size)`
///
/// Streams the file in 8 KiB chunks so arbitrarily large files can be
/// fingerprinted without full buffering. The size is counted from the
/// bytes actually read, not from `stat`, so the pair is always consistent.
pub fn hash_file(path: &Path) -> Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUF_SIZE];
    let mut size = 0u64;

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        size += bytes_read as u64;
    }

    Ok((hex::encode(hasher.finalize()), size))
}

/// Hash arbitrary in-memory data using SHA-256
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Copy `source` to `dest` while hashing the bytes in flight
///
/// Returns the SHA-256 of everything written plus the byte count. The
/// caller is expected to re-hash the destination independently and compare
/// against the returned digest before trusting the copy.
pub fn copy_and_hash(source: &Path, dest: &Path) -> Result<(String, u64)> {
    let mut reader = File::open(source)?;
    let mut writer = File::create(dest)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUF_SIZE];
    let mut written = 0u64;

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        writer.write_all(&buffer[..bytes_read])?;
        written += bytes_read as u64;
    }
    writer.sync_all()?;

    Ok((hex::encode(hasher.finalize()), written))
}

/// Atomic file write (write to temp name then rename)
///
/// The target is never observable in a partially written state: either
/// the whole file lands or the old content stays.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let temp_path = temp_sibling(path);
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Temp name next to `path`, on the same filesystem so rename is atomic
pub fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Make a path relative to a base path
///
/// Tries a lexical strip first to avoid resolving symlinks (which would
/// turn a link path into its target path); falls back to canonicalizing
/// both sides only when the lexical strip fails.
pub fn make_relative(path: &Path, base: &Path) -> Result<PathBuf> {
    if let Ok(relative) = path.strip_prefix(base) {
        return Ok(relative.to_path_buf());
    }

    let path_canon = path.canonicalize()?;
    let base_canon = base.canonicalize()?;

    path_canon
        .strip_prefix(&base_canon)
        .map(|p| p.to_path_buf())
        .map_err(|_| {
            BackupError::internal(format!(
                "Path {:?} is not relative to {:?}",
                path_canon, base_canon
            ))
        })
}

/// Create a symlink (cross-platform)
#[cfg(unix)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    use std::os::unix::fs::symlink;
    symlink(target, link)?;
    Ok(())
}

/// Create a symlink (Windows)
#[cfg(windows)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    use std::os::windows::fs::{symlink_dir, symlink_file};

    if target.is_dir() {
        symlink_dir(target, link)?;
    } else {
        symlink_file(target, link)?;
    }
    Ok(())
}

/// Read a symlink's target
pub fn read_symlink(path: &Path) -> Result<PathBuf> {
    Ok(fs::read_link(path)?)
}

/// Filesystem identifier of the device holding `path`
///
/// Used to decide whether two destinations can share hardlinks. Returns
/// `None` on platforms without a device id, which downgrades cross-device
/// dedup to a no-op.
#[cfg(unix)]
pub fn device_id(path: &Path) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    fs::metadata(path).ok().map(|m| m.dev())
}

/// Filesystem identifier (non-Unix: unavailable)
#[cfg(not(unix))]
pub fn device_id(_path: &Path) -> Option<u64> {
    None
}

/// Inode number of `path`, for hardlink identity checks
#[cfg(unix)]
pub fn inode(path: &Path) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    fs::symlink_metadata(path).ok().map(|m| m.ino())
}

/// Inode number (non-Unix: unavailable)
#[cfg(not(unix))]
pub fn inode(_path: &Path) -> Option<u64> {
    None
}

/// Remove directory if empty
pub fn remove_dir_if_empty(path: &Path) -> Result<bool> {
    if path.is_dir() && fs::read_dir(path)?.next().is_none() {
        fs::remove_dir(path)?;
        trace!("Removed empty directory: {:?}", path);
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
