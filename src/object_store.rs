//! Object-store destination copier
//!
//! Mirrors the source tree into a bucket under a key prefix: the key of a
//! file is the prefix joined with its forward-slash relative path.
//! Manifests are uploaded as ordinary objects at the prefix root so that
//! restore can list and select them.
//!
//! The pipeline is synchronous; this module owns a small dedicated tokio
//! runtime and blocks on each SDK call. Uploads are retried up to three
//! times with exponential backoff (1s, 2s, 4s); a failed object is
//! recorded and the run continues.

use crate::error::{BackupError, Result};
use crate::manifest::{self, Manifest, ManifestEntry};
use crate::types::{BackupMode, DestinationTally, FileRecord, RunId};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::Client;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, info, trace, warn};

/// Bounded retries for object uploads
const UPLOAD_RETRIES: u32 = 3;

/// Connection parameters for one bucket destination
#[derive(Debug, Clone)]
pub struct ObjectStoreTarget {
    /// Bucket name
    pub bucket: String,
    /// Key prefix acting as the destination root (may be empty)
    pub prefix: String,
    /// Bucket region
    pub region: Option<String>,
    /// Static access key; falls back to ambient credentials when unset
    pub access_key: Option<String>,
    /// Static secret key
    pub secret_key: Option<String>,
}

impl ObjectStoreTarget {
    /// Label used in tallies and logs (`s3://bucket/prefix`)
    pub fn label(&self) -> String {
        if self.prefix.is_empty() {
            format!("s3://{}", self.bucket)
        } else {
            format!("s3://{}/{}", self.bucket, self.prefix)
        }
    }
}

/// A connected client mirroring one run into a bucket
pub struct ObjectStoreCopier {
    target: ObjectStoreTarget,
    runtime: tokio::runtime::Runtime,
    client: Client,
}

impl ObjectStoreCopier {
    /// Build a client for the target bucket
    pub fn connect(target: ObjectStoreTarget) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| BackupError::internal(format!("tokio runtime: {e}")))?;

        let config = runtime.block_on(async {
            let mut loader = aws_config::defaults(BehaviorVersion::latest());
            if let Some(region) = &target.region {
                loader = loader.region(Region::new(region.clone()));
            }
            if let (Some(access_key), Some(secret_key)) = (&target.access_key, &target.secret_key)
            {
                loader = loader.credentials_provider(Credentials::new(
                    access_key.clone(),
                    secret_key.clone(),
                    None,
                    None,
                    "coffer-config",
                ));
            }
            loader.load().await
        });

        let client = Client::new(&config);
        info!("Object-store client ready for {}", target.label());
        Ok(ObjectStoreCopier {
            target,
            runtime,
            client,
        })
    }

    /// Key under the prefix for a destination-relative path
    fn key_for(&self, rel: &str) -> String {
        join_key(&self.target.prefix, rel)
    }

    /// Upload every record, returning manifest rows and the tally
    ///
    /// Symlinks cannot be represented as objects and are recorded as
    /// failed rows rather than silently dereferenced.
    pub fn upload_run(
        &self,
        source_root: &Path,
        records: &[FileRecord],
        mode: BackupMode,
        cancel: &AtomicBool,
    ) -> (Vec<ManifestEntry>, DestinationTally) {
        let mut entries = Vec::with_capacity(records.len());
        let mut tally = DestinationTally::new(self.target.label());

        for record in records {
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            let rel = record.portable_path();

            if record.is_symlink {
                tally.files_failed += 1;
                entries.push(ManifestEntry::failed(
                    rel,
                    "symlinks cannot be stored as objects",
                ));
                continue;
            }

            if mode != BackupMode::Full && !self.object_is_stale(record, &rel) {
                tally.files_skipped += 1;
                entries.push(ManifestEntry::skipped(rel, record.size));
                continue;
            }

            let local = source_root.join(&record.rel_path);
            match self.upload_object(&local, &rel) {
                Ok((sha256, size)) => {
                    tally.files_copied += 1;
                    tally.bytes_copied += size;
                    entries.push(ManifestEntry::copied(rel.clone(), rel, size, sha256));
                }
                Err(e) => {
                    tally.files_failed += 1;
                    entries.push(ManifestEntry::failed(rel, e.to_string()));
                }
            }
        }

        debug!(
            "Object-store upload to {}: {} copied, {} skipped, {} failed",
            self.target.label(),
            tally.files_copied,
            tally.files_skipped,
            tally.files_failed
        );
        (entries, tally)
    }

    /// Whether the stored object is older than the local file (or absent)
    fn object_is_stale(&self, record: &FileRecord, rel: &str) -> bool {
        let key = self.key_for(rel);
        let head = self.runtime.block_on(
            self.client
                .head_object()
                .bucket(&self.target.bucket)
                .key(&key)
                .send(),
        );
        match head {
            Ok(head) => {
                let remote_secs = head.last_modified().map(|t| t.secs()).unwrap_or(0);
                let local_secs = record
                    .modified
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                local_secs > remote_secs
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if !service_err.is_not_found() {
                    warn!("head_object {} failed: {}", key, service_err);
                }
                true
            }
        }
    }

    /// Upload one file with bounded retries and exponential backoff
    fn upload_object(&self, local: &Path, rel: &str) -> Result<(String, u64)> {
        let key = self.key_for(rel);
        let mut attempt = 0u32;

        loop {
            // Read inside the loop so a retry never reuses a clone of a
            // large body
            let body = std::fs::read(local)?;
            let size = body.len() as u64;
            let sha256 = crate::utils::hash_data(&body);

            let result = self.runtime.block_on(
                self.client
                    .put_object()
                    .bucket(&self.target.bucket)
                    .key(&key)
                    .body(body.into())
                    .send(),
            );

            match result {
                Ok(_) => {
                    trace!("Uploaded {} ({} bytes)", key, size);
                    return Ok((sha256, size));
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= UPLOAD_RETRIES {
                        return Err(BackupError::transport(
                            self.target.label(),
                            format!("put_object {key} failed after {UPLOAD_RETRIES} attempts: {e}"),
                        ));
                    }
                    let backoff = Duration::from_secs(1 << (attempt - 1));
                    warn!(
                        "put_object {} failed (attempt {}/{}), retrying in {:?}: {}",
                        key, attempt, UPLOAD_RETRIES, backoff, e
                    );
                    std::thread::sleep(backoff);
                }
            }
        }
    }

    /// Run ids of manifests stored at the prefix root, oldest first
    pub fn list_manifest_ids(&self) -> Result<Vec<RunId>> {
        let list_prefix = self.key_for(manifest::MANIFEST_PREFIX);
        let mut ids = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.target.bucket)
                .prefix(&list_prefix);
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }
            let page = self
                .runtime
                .block_on(req.send())
                .map_err(|e| BackupError::transport(self.target.label(), format!("list: {e}")))?;

            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                let name = key.rsplit('/').next().unwrap_or(key);
                if let Some(id) = manifest::run_id_from_file_name(name) {
                    ids.push(id);
                }
            }

            match page.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        ids.sort();
        Ok(ids)
    }

    /// Fetch and parse one manifest from the prefix root
    pub fn read_manifest(&self, run_id: &RunId) -> Result<Manifest> {
        let key = self.key_for(&manifest::manifest_file_name(run_id));
        let response = self
            .runtime
            .block_on(
                self.client
                    .get_object()
                    .bucket(&self.target.bucket)
                    .key(&key)
                    .send(),
            )
            .map_err(|e| BackupError::transport(self.target.label(), format!("get {key}: {e}")))?;
        let data = self
            .runtime
            .block_on(response.body.collect())
            .map_err(|e| BackupError::transport(self.target.label(), format!("read {key}: {e}")))?
            .into_bytes();
        Manifest::from_json(&data, &PathBuf::from(&key))
    }

    /// Latest manifest in the bucket, if any
    pub fn latest_manifest(&self) -> Result<Option<Manifest>> {
        match self.list_manifest_ids()?.last() {
            Some(id) => Ok(Some(self.read_manifest(id)?)),
            None => Ok(None),
        }
    }

    /// Latest full-mode manifest in the bucket, if any
    pub fn latest_full_manifest(&self) -> Result<Option<Manifest>> {
        for id in self.list_manifest_ids()?.iter().rev() {
            match self.read_manifest(id) {
                Ok(m) if m.mode == BackupMode::Full => return Ok(Some(m)),
                Ok(_) => continue,
                Err(e) => {
                    warn!("Skipping unreadable bucket manifest {}: {}", id, e);
                    continue;
                }
            }
        }
        Ok(None)
    }

    /// Download every object under the prefix into a local directory
    pub fn download_tree(&self, local_root: &Path) -> Result<usize> {
        let mut downloaded = 0;
        let mut continuation: Option<String> = None;
        let strip = if self.target.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.target.prefix.trim_end_matches('/'))
        };

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.target.bucket);
            if !self.target.prefix.is_empty() {
                req = req.prefix(self.target.prefix.trim_end_matches('/'));
            }
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }
            let page = self
                .runtime
                .block_on(req.send())
                .map_err(|e| BackupError::transport(self.target.label(), format!("list: {e}")))?;

            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                let rel = key.strip_prefix(&strip).unwrap_or(key);
                if rel.is_empty() {
                    continue;
                }
                let local = local_root.join(rel);
                if let Some(parent) = local.parent() {
                    std::fs::create_dir_all(parent)?;
                }

                let response = self
                    .runtime
                    .block_on(
                        self.client
                            .get_object()
                            .bucket(&self.target.bucket)
                            .key(key)
                            .send(),
                    )
                    .map_err(|e| {
                        BackupError::transport(self.target.label(), format!("get {key}: {e}"))
                    })?;
                let data = self
                    .runtime
                    .block_on(response.body.collect())
                    .map_err(|e| {
                        BackupError::transport(self.target.label(), format!("read {key}: {e}"))
                    })?
                    .into_bytes();
                std::fs::write(&local, &data)?;
                downloaded += 1;
                trace!("Downloaded {} -> {:?}", key, local);
            }

            match page.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        info!(
            "Downloaded {} objects from {} to {:?}",
            downloaded,
            self.target.label(),
            local_root
        );
        Ok(downloaded)
    }

    /// Upload a manifest to the prefix root
    pub fn write_manifest(&self, manifest_data: &Manifest) -> Result<()> {
        let key = self.key_for(&manifest_data.file_name());
        let body = manifest_data.to_json()?;
        self.runtime
            .block_on(
                self.client
                    .put_object()
                    .bucket(&self.target.bucket)
                    .key(&key)
                    .body(body.into())
                    .send(),
            )
            .map_err(|e| {
                BackupError::transport(self.target.label(), format!("put manifest {key}: {e}"))
            })?;
        Ok(())
    }
}

/// Join a key prefix with a destination-relative path
fn join_key(prefix: &str, rel: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        rel.to_string()
    } else {
        format!("{prefix}/{rel}")
    }
}
