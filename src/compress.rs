//! Single-archive compression of the source tree
//!
//! When a run is compressed, per-file selection is bypassed: the whole
//! source tree is streamed into one `backup_<run-id>.zip` per local
//! destination, and that archive is what fans out to the remote
//! destinations as a single file.
//!
//! Password-protected mode (`zip_pw`) generates a one-time password per
//! run. The password is cached in the OS credential store and delivered
//! out-of-band through a notification event; it is never written to the
//! filesystem as plaintext.

use crate::error::{BackupError, Result};
use crate::types::RunId;
use rand::Rng;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::unstable::write::FileOptionsExt;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Keyring service under which archive passwords are cached
const KEYRING_SERVICE: &str = "coffer-archive";
/// Generated password length
const PASSWORD_LEN: usize = 16;

/// Archive file name for one run
pub fn archive_file_name(run_id: &RunId) -> String {
    format!("backup_{run_id}.zip")
}

/// Generate a one-time archive password (letters and digits)
pub fn generate_archive_password() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..PASSWORD_LEN)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

/// Cache a run's archive password in the OS credential store
pub fn store_archive_password(run_id: &RunId, password: &str) -> Result<()> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, run_id.as_str())
        .map_err(|e| BackupError::internal(format!("keyring: {e}")))?;
    entry
        .set_password(password)
        .map_err(|e| BackupError::internal(format!("keyring store: {e}")))?;
    info!("Archive password stored in credential store for run {}", run_id);
    Ok(())
}

/// Fetch a previously cached archive password
pub fn load_archive_password(run_id: &RunId) -> Result<Option<String>> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, run_id.as_str())
        .map_err(|e| BackupError::internal(format!("keyring: {e}")))?;
    match entry.get_password() {
        Ok(password) => Ok(Some(password)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => Err(BackupError::internal(format!("keyring read: {e}"))),
    }
}

/// Compress the source tree into `<dest_root>/backup_<run-id>.zip`
///
/// Returns the archive path. Regular files are deflated; symlinks have
/// no portable archive representation and are skipped with a log line.
pub fn compress_source(
    source_root: &Path,
    dest_root: &Path,
    run_id: &RunId,
    password: Option<&str>,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dest_root)?;
    let archive_path = dest_root.join(archive_file_name(run_id));
    let file = File::create(&archive_path)?;
    let mut zip = ZipWriter::new(file);

    let base_options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let mut files_added = 0usize;
    let mut buffer = vec![0u8; 64 * 1024];

    for entry in WalkDir::new(source_root).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if path == source_root {
            continue;
        }
        let rel = path
            .strip_prefix(source_root)
            .map_err(|_| BackupError::Archive(format!("path {path:?} escapes source root")))?;
        let name = crate::types::portable_path(rel);

        if entry.file_type().is_dir() {
            zip.add_directory(&name, base_options)
                .map_err(|e| BackupError::Archive(format!("add dir {name}: {e}")))?;
            continue;
        }
        if entry.file_type().is_symlink() {
            debug!("Skipping symlink {:?} in archive", path);
            continue;
        }

        let options = match password {
            Some(password) => base_options.with_deprecated_encryption(password.as_bytes()),
            None => base_options,
        };
        zip.start_file(&name, options)
            .map_err(|e| BackupError::Archive(format!("start {name}: {e}")))?;

        let mut reader = File::open(path)?;
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            zip.write_all(&buffer[..n])?;
        }
        files_added += 1;
    }

    zip.finish()
        .map_err(|e| BackupError::Archive(format!("finalize: {e}")))?;

    let size = std::fs::metadata(&archive_path)?.len();
    info!(
        "Compressed {:?} into {:?} ({} files, {})",
        source_root,
        archive_path,
        files_added,
        crate::utils::format_bytes(size)
    );
    Ok(archive_path)
}

/// Extract a plain ZIP archive into a directory (restore path)
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| BackupError::Archive(format!("bad archive {archive:?}: {e}")))?;
    std::fs::create_dir_all(dest)?;

    let count = zip.len();
    for i in 0..count {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| BackupError::Archive(format!("read entry {i}: {e}")))?;
        let Some(rel) = entry.enclosed_name() else {
            warn!("Skipping archive entry with unsafe path: {}", entry.name());
            continue;
        };
        let out_path = dest.join(rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;
    }

    debug!("Extracted {:?} into {:?} ({} entries)", archive, dest, count);
    Ok(count)
}
