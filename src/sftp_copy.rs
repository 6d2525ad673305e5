//! SFTP destination copier
//!
//! One authenticated SSH session per remote host. The host-key policy is
//! warn-on-unknown: a key we have never seen is logged loudly, a key that
//! *mismatches* the known_hosts entry fails the connection. Remote parent
//! directories are created with `mkdir -p` semantics (already-exists is
//! ignored). Uploads stream in chunks, optionally throttled to a KB/s cap
//! measured over a short sliding window, and are retried a bounded number
//! of times on transport errors; authentication failures are never
//! retried. After each upload the remote size must equal the local size.
//!
//! A host failing isolates to that destination's tally; other hosts keep
//! going.

use crate::error::{BackupError, Result};
use crate::manifest::{self, Manifest, ManifestEntry};
use crate::types::{DestinationTally, FileRecord, RunId};
use sha2::{Digest, Sha256};
use ssh2::{CheckResult, KnownHostFileKind, OpenFlags, OpenType, RenameFlags, Session, Sftp};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, UNIX_EPOCH};
use tracing::{debug, info, trace, warn};

/// Chunk size for SFTP writes
const UPLOAD_CHUNK: usize = 32 * 1024;
/// Bounded retries for transient transport errors
const UPLOAD_RETRIES: u32 = 3;
/// Base backoff between retries
const RETRY_BACKOFF: Duration = Duration::from_millis(500);
/// TCP connect timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Blocking-call timeout on the session, in milliseconds
const SESSION_TIMEOUT_MS: u32 = 30_000;

/// Connection parameters for one SFTP host
#[derive(Debug, Clone)]
pub struct SftpTarget {
    /// Host name or address
    pub host: String,
    /// SSH port
    pub port: u16,
    /// Login user
    pub username: String,
    /// Password authentication (used when no key file is given)
    pub password: Option<String>,
    /// Private-key authentication (takes precedence)
    pub key_file: Option<PathBuf>,
    /// Absolute remote directory acting as the destination root
    pub remote_root: PathBuf,
    /// Upload throttle in KB/s, 0 = unlimited
    pub bandwidth_limit_kbps: u64,
}

impl SftpTarget {
    /// Label used in tallies and logs
    pub fn label(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.remote_root.display())
    }
}

/// An open, authenticated SFTP session to one host
pub struct SftpCopier {
    target: SftpTarget,
    // Session must outlive the Sftp channel it spawned
    _session: Session,
    sftp: Sftp,
}

impl std::fmt::Debug for SftpCopier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpCopier")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl SftpCopier {
    /// Connect and authenticate to a target host
    ///
    /// Returns an `Auth` error on rejected credentials and a `Transport`
    /// error on anything the network did.
    pub fn connect(target: SftpTarget) -> Result<Self> {
        let addr = format!("{}:{}", target.host, target.port);
        info!("Connecting to SFTP host {}", addr);

        let tcp = addr
            .parse::<std::net::SocketAddr>()
            .map(|sa| TcpStream::connect_timeout(&sa, CONNECT_TIMEOUT))
            .unwrap_or_else(|_| TcpStream::connect(&addr))
            .map_err(|e| BackupError::transport(&target.host, format!("connect: {e}")))?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(SESSION_TIMEOUT_MS);
        session
            .handshake()
            .map_err(|e| BackupError::transport(&target.host, format!("handshake: {e}")))?;

        check_host_key(&session, &target.host)?;

        if let Some(key_file) = &target.key_file {
            session
                .userauth_pubkey_file(&target.username, None, key_file, None)
                .map_err(|e| BackupError::Auth {
                    endpoint: target.host.clone(),
                    reason: format!("public key auth: {e}"),
                })?;
        } else if let Some(password) = &target.password {
            session
                .userauth_password(&target.username, password)
                .map_err(|e| BackupError::Auth {
                    endpoint: target.host.clone(),
                    reason: format!("password auth: {e}"),
                })?;
        }
        if !session.authenticated() {
            return Err(BackupError::Auth {
                endpoint: target.host.clone(),
                reason: "no usable authentication method".to_string(),
            });
        }

        let sftp = session
            .sftp()
            .map_err(|e| BackupError::transport(&target.host, format!("sftp channel: {e}")))?;

        info!("Connected to SFTP host {}", target.host);
        Ok(SftpCopier {
            target,
            _session: session,
            sftp,
        })
    }

    /// Upload every record, returning manifest rows and the tally
    pub fn upload_run(
        &self,
        source_root: &Path,
        records: &[FileRecord],
        cancel: &AtomicBool,
    ) -> (Vec<ManifestEntry>, DestinationTally) {
        let mut entries = Vec::with_capacity(records.len());
        let mut tally = DestinationTally::new(self.target.label());

        for record in records {
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            let entry = self.upload_one(source_root, record);
            match entry.status {
                manifest::FileStatus::Copied => {
                    tally.files_copied += 1;
                    tally.bytes_copied += entry.size;
                }
                manifest::FileStatus::Skipped => tally.files_skipped += 1,
                manifest::FileStatus::Failed => tally.files_failed += 1,
                manifest::FileStatus::Symlink => tally.symlinks += 1,
            }
            entries.push(entry);
        }

        debug!(
            "SFTP upload to {}: {} copied, {} skipped, {} failed",
            self.target.host, tally.files_copied, tally.files_skipped, tally.files_failed
        );
        (entries, tally)
    }

    fn upload_one(&self, source_root: &Path, record: &FileRecord) -> ManifestEntry {
        let rel = record.portable_path();
        let local = source_root.join(&record.rel_path);
        let remote = self.target.remote_root.join(&record.rel_path);

        if record.is_symlink {
            return match record.symlink_target.as_deref() {
                Some(target) => match self.recreate_symlink(target, &remote) {
                    Ok(()) => ManifestEntry::symlink(rel),
                    Err(e) => ManifestEntry::failed(rel, e.to_string()),
                },
                None => ManifestEntry::failed(rel, "unreadable symlink target"),
            };
        }

        if let Some(parent) = record.rel_path.parent() {
            if let Err(e) = self.ensure_remote_dir(parent) {
                return ManifestEntry::failed(rel, format!("mkdir: {e}"));
            }
        }

        let mut attempt = 0;
        loop {
            match self.upload_file(&local, &remote) {
                Ok((sha256, size)) => {
                    return ManifestEntry::copied(rel.clone(), rel, size, sha256);
                }
                Err(e) if e.is_retryable() && attempt + 1 < UPLOAD_RETRIES => {
                    attempt += 1;
                    let backoff = RETRY_BACKOFF * 2u32.pow(attempt - 1);
                    warn!(
                        "Upload of {:?} to {} failed (attempt {}/{}), retrying in {:?}: {}",
                        local, self.target.host, attempt, UPLOAD_RETRIES, backoff, e
                    );
                    std::thread::sleep(backoff);
                }
                Err(e) => return ManifestEntry::failed(rel, e.to_string()),
            }
        }
    }

    /// Stream one file to the remote path, hashing the plaintext in flight
    ///
    /// Returns `(sha256, size)` of the local content. The remote size is
    /// checked against the local size after the upload; a hash-after-upload
    /// is not needed because the transport is authenticated.
    fn upload_file(&self, local: &Path, remote: &Path) -> Result<(String, u64)> {
        let mut reader = std::fs::File::open(local)?;
        let mut remote_file = self
            .sftp
            .open_mode(
                remote,
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                0o644,
                OpenType::File,
            )
            .map_err(|e| BackupError::transport(&self.target.host, format!("create {remote:?}: {e}")))?;

        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; UPLOAD_CHUNK];
        let mut sent = 0u64;
        let mut throttle = Throttle::new(self.target.bandwidth_limit_kbps);

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            remote_file
                .write_all(&buffer[..n])
                .map_err(|e| BackupError::transport(&self.target.host, format!("write: {e}")))?;
            sent += n as u64;
            throttle.pace(n as u64);
        }
        drop(remote_file);

        let stat = self
            .sftp
            .stat(remote)
            .map_err(|e| BackupError::transport(&self.target.host, format!("stat after upload: {e}")))?;
        let remote_size = stat.size.unwrap_or(0);
        if remote_size != sent {
            return Err(BackupError::transport(
                &self.target.host,
                format!("size mismatch after upload: sent {sent}, remote has {remote_size}"),
            ));
        }

        trace!("Uploaded {:?} -> {:?} ({} bytes)", local, remote, sent);
        Ok((hex::encode(hasher.finalize()), sent))
    }

    /// `mkdir -p` for a destination-relative directory
    fn ensure_remote_dir(&self, rel_dir: &Path) -> Result<()> {
        let mut current = self.target.remote_root.clone();
        // Root itself may be missing on a fresh host
        if self.sftp.stat(&current).is_err() {
            self.mkdir_ignore_exists(&current)?;
        }
        for component in rel_dir.components() {
            current.push(component);
            if self.sftp.stat(&current).is_err() {
                self.mkdir_ignore_exists(&current)?;
            }
        }
        Ok(())
    }

    fn mkdir_ignore_exists(&self, dir: &Path) -> Result<()> {
        match self.sftp.mkdir(dir, 0o755) {
            Ok(()) => Ok(()),
            // A concurrent run or a previous pass may have created it
            Err(_) if self.sftp.stat(dir).is_ok() => Ok(()),
            Err(e) => Err(BackupError::transport(
                &self.target.host,
                format!("mkdir {dir:?}: {e}"),
            )),
        }
    }

    fn recreate_symlink(&self, target: &Path, remote: &Path) -> Result<()> {
        if self.sftp.lstat(remote).is_ok() {
            let _ = self.sftp.unlink(remote);
        }
        self.sftp
            .symlink(target, remote)
            .map_err(|e| BackupError::transport(&self.target.host, format!("symlink: {e}")))
    }

    /// Should this record be uploaded under the given mode?
    ///
    /// Incremental and differential uploads skip files whose remote copy
    /// is at least as new as the local one.
    pub fn should_upload(&self, mode: crate::types::BackupMode, record: &FileRecord) -> bool {
        if mode == crate::types::BackupMode::Full || record.is_symlink {
            return true;
        }
        let remote = self.target.remote_root.join(&record.rel_path);
        match self.sftp.stat(&remote) {
            Err(_) => true,
            Ok(stat) => {
                let local_mtime = record
                    .modified
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                stat.mtime.map(|remote| local_mtime > remote).unwrap_or(true)
            }
        }
    }

    /// Remove remote files absent from the local selection (full mirror)
    pub fn remove_extra_remote_files(&self, records: &[FileRecord]) -> Result<usize> {
        let local: HashSet<PathBuf> = records.iter().map(|r| r.rel_path.clone()).collect();
        let mut removed = 0;
        let mut pending = vec![self.target.remote_root.clone()];

        while let Some(dir) = pending.pop() {
            let entries = match self.sftp.readdir(&dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for (path, stat) in entries {
                if stat.is_dir() {
                    pending.push(path);
                    continue;
                }
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if manifest::run_id_from_file_name(&name).is_some() {
                    continue;
                }
                let Ok(rel) = path.strip_prefix(&self.target.remote_root) else {
                    continue;
                };
                if !local.contains(rel) {
                    match self.sftp.unlink(&path) {
                        Ok(()) => {
                            removed += 1;
                            debug!("Removed extra remote file {:?}", path);
                        }
                        Err(e) => warn!("Cannot remove extra remote file {:?}: {}", path, e),
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Run ids of manifests stored at the remote root, oldest first
    pub fn list_manifest_ids(&self) -> Result<Vec<RunId>> {
        let entries = match self.sftp.readdir(&self.target.remote_root) {
            Ok(entries) => entries,
            // Fresh host: no prior runs
            Err(_) => return Ok(Vec::new()),
        };
        let mut ids: Vec<RunId> = entries
            .into_iter()
            .filter_map(|(path, _)| {
                path.file_name()
                    .and_then(|n| manifest::run_id_from_file_name(&n.to_string_lossy()))
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Fetch and parse one manifest from the remote root
    pub fn read_manifest(&self, run_id: &RunId) -> Result<Manifest> {
        let path = self.target.remote_root.join(manifest::manifest_file_name(run_id));
        let mut file = self
            .sftp
            .open(&path)
            .map_err(|e| BackupError::transport(&self.target.host, format!("open {path:?}: {e}")))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| BackupError::transport(&self.target.host, format!("read {path:?}: {e}")))?;
        Manifest::from_json(&data, &path)
    }

    /// Latest manifest on this host, if any
    pub fn latest_manifest(&self) -> Result<Option<Manifest>> {
        match self.list_manifest_ids()?.last() {
            Some(id) => Ok(Some(self.read_manifest(id)?)),
            None => Ok(None),
        }
    }

    /// Latest full-mode manifest on this host, if any
    pub fn latest_full_manifest(&self) -> Result<Option<Manifest>> {
        for id in self.list_manifest_ids()?.iter().rev() {
            match self.read_manifest(id) {
                Ok(m) if m.mode == crate::types::BackupMode::Full => return Ok(Some(m)),
                Ok(_) => continue,
                Err(e) => {
                    warn!("Skipping unreadable remote manifest {}: {}", id, e);
                    continue;
                }
            }
        }
        Ok(None)
    }

    /// Download the whole remote tree into a local directory (restore)
    pub fn download_tree(&self, local_root: &Path) -> Result<usize> {
        let mut downloaded = 0;
        let mut pending = vec![self.target.remote_root.clone()];

        while let Some(dir) = pending.pop() {
            let entries = self.sftp.readdir(&dir).map_err(|e| {
                BackupError::transport(&self.target.host, format!("readdir {dir:?}: {e}"))
            })?;
            for (path, stat) in entries {
                let rel = path
                    .strip_prefix(&self.target.remote_root)
                    .map_err(|_| {
                        BackupError::transport(
                            &self.target.host,
                            format!("remote path {path:?} escapes root"),
                        )
                    })?
                    .to_path_buf();
                let local = local_root.join(&rel);

                if stat.is_dir() {
                    std::fs::create_dir_all(&local)?;
                    pending.push(path);
                    continue;
                }

                if let Some(parent) = local.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut remote_file = self.sftp.open(&path).map_err(|e| {
                    BackupError::transport(&self.target.host, format!("open {path:?}: {e}"))
                })?;
                let mut local_file = std::fs::File::create(&local)?;
                std::io::copy(&mut remote_file, &mut local_file).map_err(|e| {
                    BackupError::transport(&self.target.host, format!("download {path:?}: {e}"))
                })?;
                downloaded += 1;
                trace!("Downloaded {:?} -> {:?}", path, local);
            }
        }

        info!(
            "Downloaded {} files from {} to {:?}",
            downloaded, self.target.host, local_root
        );
        Ok(downloaded)
    }

    /// Write a manifest at the remote root (temp name, then rename)
    pub fn write_manifest(&self, manifest_data: &Manifest) -> Result<()> {
        self.ensure_remote_dir(Path::new(""))?;
        let final_path = self.target.remote_root.join(manifest_data.file_name());
        let tmp_path = self.target.remote_root.join(format!("{}.tmp", manifest_data.file_name()));
        let json = manifest_data.to_json()?;

        let mut file = self
            .sftp
            .open_mode(
                &tmp_path,
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                0o644,
                OpenType::File,
            )
            .map_err(|e| BackupError::transport(&self.target.host, format!("create manifest: {e}")))?;
        file.write_all(&json)
            .map_err(|e| BackupError::transport(&self.target.host, format!("write manifest: {e}")))?;
        drop(file);

        self.sftp
            .rename(&tmp_path, &final_path, Some(RenameFlags::OVERWRITE))
            .map_err(|e| BackupError::transport(&self.target.host, format!("rename manifest: {e}")))?;
        Ok(())
    }
}

/// Check the server's host key against the user's known_hosts file
///
/// Unknown keys are warned about; a mismatching key is treated as a
/// failed connection.
fn check_host_key(session: &Session, host: &str) -> Result<()> {
    let Some((key, _key_type)) = session.host_key() else {
        return Err(BackupError::transport(host, "server sent no host key"));
    };

    let mut known_hosts = session.known_hosts()?;
    let kh_path = std::env::var_os("HOME")
        .map(PathBuf::from)
        .map(|home| home.join(".ssh").join("known_hosts"));

    if let Some(path) = kh_path.filter(|p| p.exists()) {
        if let Err(e) = known_hosts.read_file(&path, KnownHostFileKind::OpenSSH) {
            warn!("Cannot read known_hosts {:?}: {}", path, e);
        }
    }

    match known_hosts.check(host, key) {
        CheckResult::Match => Ok(()),
        CheckResult::NotFound => {
            warn!("Host key for {} is not in known_hosts; continuing", host);
            Ok(())
        }
        CheckResult::Mismatch => Err(BackupError::transport(
            host,
            "host key mismatch with known_hosts entry",
        )),
        CheckResult::Failure => {
            warn!("Host key check failed for {}; continuing", host);
            Ok(())
        }
    }
}

/// Paces writes so the average rate stays at or below a KB/s cap
///
/// Measures over a one-second sliding window, matching "at most N KB/s
/// measured over a short window" rather than a strict token bucket.
struct Throttle {
    limit_bytes_per_sec: u64,
    window_start: Instant,
    window_bytes: u64,
}

impl Throttle {
    fn new(limit_kbps: u64) -> Self {
        Throttle {
            limit_bytes_per_sec: limit_kbps * 1024,
            window_start: Instant::now(),
            window_bytes: 0,
        }
    }

    fn pace(&mut self, just_sent: u64) {
        if self.limit_bytes_per_sec == 0 {
            return;
        }
        self.window_bytes += just_sent;
        let elapsed = self.window_start.elapsed();
        let expected = Duration::from_secs_f64(self.window_bytes as f64 / self.limit_bytes_per_sec as f64);
        if expected > elapsed {
            std::thread::sleep(expected - elapsed);
        }
        if self.window_start.elapsed() >= Duration::from_secs(1) {
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }
    }
}
