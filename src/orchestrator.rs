//! The run orchestrator
//!
//! Wires the whole pipeline for one run: acquire nothing itself (the
//! lock belongs to the caller in scheduled mode), run the pre-hook, ask
//! the selector for each destination's file set, dispatch copies to
//! every enabled destination in parallel shared-nothing workers, write
//! one manifest per destination, then run encryption, dedup and
//! retention sequentially against the local destinations, and finally
//! the post-hook.
//!
//! Per-file errors become manifest rows; per-destination errors disable
//! only that destination; only configuration, selection and pre-hook
//! errors abort the run. Every transition is published as a structured
//! event so notifications and logs observe the same truth.

use crate::compress;
use crate::config::{BackupConfig, CompressType};
use crate::db_dump;
use crate::dedup;
use crate::destination::{self, Destination};
use crate::encryption::KeySource;
use crate::error::{BackupError, Result};
use crate::events::{broadcast, EventSink, RunEvent, RunStage};
use crate::hooks;
use crate::local_copy::{self, LocalCopier};
use crate::manifest::{self, Manifest, ManifestEntry};
use crate::object_store::ObjectStoreCopier;
use crate::retention;
use crate::selector::Selector;
use crate::sftp_copy::SftpCopier;
use crate::types::{BackupMode, DestinationTally, FileRecord, RunId, RunReport};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Orchestrates one backup run from an immutable config snapshot
pub struct Orchestrator {
    config: BackupConfig,
    sinks: Vec<Arc<dyn EventSink>>,
    cancel: Arc<AtomicBool>,
    dry_run: bool,
    progress: Option<crate::types::ProgressCallback>,
}

/// What one destination worker produced
struct DestinationResult {
    destination: Destination,
    entries: Vec<ManifestEntry>,
    tally: DestinationTally,
    /// Open copier handed back for the manifest write (remote kinds)
    sftp: Option<SftpCopier>,
    object_store: Option<ObjectStoreCopier>,
}

impl Orchestrator {
    /// Create an orchestrator over a configuration snapshot
    pub fn new(config: BackupConfig) -> Self {
        Orchestrator {
            config,
            sinks: vec![Arc::new(crate::events::LogSink)],
            cancel: Arc::new(AtomicBool::new(false)),
            dry_run: false,
            progress: None,
        }
    }

    /// Register an additional event sink
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Observe an external stop signal
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    /// Log planned work without touching anything
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Receive per-file progress from the local copiers
    pub fn with_progress(mut self, callback: crate::types::ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    fn emit(&self, event: RunEvent) {
        broadcast(&self.sinks, &event);
    }

    fn stage(&self, run_id: &RunId, stage: RunStage) {
        self.emit(RunEvent::StageChanged {
            run_id: run_id.clone(),
            stage,
        });
    }

    /// Execute one run end to end
    pub fn execute(&self) -> Result<RunReport> {
        let run_id = RunId::now();
        let started_at = Local::now();
        let mode = self.config.mode;

        self.emit(RunEvent::RunStarted {
            run_id: run_id.clone(),
            mode,
        });

        // Archives are whole-tree snapshots; a delta policy has nothing
        // to archive against
        if self.config.compress.is_enabled() && mode != BackupMode::Full {
            return Err(BackupError::config(format!(
                "compression requires a full backup, not {mode}"
            )));
        }

        let source_dir = self
            .config
            .source_dir
            .clone()
            .ok_or_else(|| BackupError::config("no source directory configured"))?;
        // Manifests record absolute roots
        let source_dir = std::path::absolute(&source_dir).unwrap_or(source_dir);

        // Pre-hook failure aborts before selection
        if let Some(pre) = &self.config.hooks.pre_backup {
            self.stage(&run_id, RunStage::PreHook);
            hooks::run_hook(pre, "pre_backup")?;
        }

        let destinations = destination::destinations_from_config(&self.config)?;
        if destinations.is_empty() {
            return Err(BackupError::config(
                "no destinations enabled; check [MODES] and [BACKUPS]",
            ));
        }

        if self.dry_run {
            return self.dry_run_report(run_id, started_at, &source_dir, &destinations);
        }

        let key_source = KeySource::from_config(&self.config.encryption)?;
        let selector = Selector::new(&source_dir)
            .with_exclude_patterns(self.config.exclude_patterns.clone());

        // Optional database dump, staged into the first local root and
        // an ordinary file of the run from here on
        let staged_artifact = self.stage_db_dump(&destinations, &run_id)?;

        self.stage(&run_id, RunStage::Copying);
        let mut results = if self.config.compress.is_enabled() {
            self.run_compressed(
                &run_id,
                &source_dir,
                destinations,
                key_source.is_some(),
                staged_artifact.as_deref(),
            )?
        } else {
            self.run_file_copies(
                &run_id,
                &selector,
                mode,
                destinations,
                key_source.is_some(),
                staged_artifact.as_deref(),
            )?
        };

        for result in &results {
            self.emit(RunEvent::DestinationFinished {
                run_id: run_id.clone(),
                destination: result.tally.destination.clone(),
                files_copied: result.tally.files_copied,
                files_failed: result.tally.files_failed,
            });
        }

        // One manifest per destination, written by this thread only
        self.stage(&run_id, RunStage::Manifesting);
        let manifests =
            self.write_manifests(&run_id, mode, &source_dir, started_at, &mut results);

        let local_roots: Vec<PathBuf> = results
            .iter()
            .filter(|r| r.tally.manifest_written)
            .filter_map(|r| r.destination.local_root().map(Path::to_path_buf))
            .collect();

        // Post-processing is strictly sequential per destination:
        // encrypt, then dedup, then retention
        if let Some(key_source) = &key_source {
            self.stage(&run_id, RunStage::Encrypting);
            self.encrypt_local_destinations(&mut results, &manifests, key_source);
        }

        if self.config.dedup_enabled && !local_roots.is_empty() {
            self.stage(&run_id, RunStage::Deduping);
            let still_local: Vec<PathBuf> = results
                .iter()
                .filter(|r| r.tally.fatal.is_none())
                .filter_map(|r| r.destination.local_root().map(Path::to_path_buf))
                .collect();
            match dedup::manifest_hash_index(&still_local)
                .and_then(|index| dedup::deduplicate_destinations(&still_local, &index))
            {
                Ok(stats) => debug!(
                    "Dedup linked {} duplicates, saved {}",
                    stats.duplicates_linked,
                    crate::utils::format_bytes(stats.bytes_saved)
                ),
                Err(e) => warn!("Dedup stage failed: {}", e),
            }
        }

        let retention_config = self.config.retention;
        if retention_config.max_age_days > 0 || retention_config.max_count > 0 {
            self.stage(&run_id, RunStage::Pruning);
            for root in &local_roots {
                if let Err(e) = retention::apply_retention(
                    root,
                    retention_config.max_age_days,
                    retention_config.max_count,
                ) {
                    warn!("Retention in {:?} failed: {}", root, e);
                }
            }
        }

        // Post-hook runs regardless of outcome; failure only logs
        if let Some(post) = &self.config.hooks.post_backup {
            self.stage(&run_id, RunStage::PostHook);
            if let Err(e) = hooks::run_hook(post, "post_backup") {
                warn!("Post-backup hook failed (run outcome unchanged): {}", e);
            }
        }

        self.stage(&run_id, RunStage::Reporting);
        let tallies: Vec<DestinationTally> = results.into_iter().map(|r| r.tally).collect();
        let report = RunReport {
            run_id: run_id.clone(),
            mode,
            outcome: RunReport::derive_outcome(&tallies),
            started_at,
            finished_at: Local::now(),
            destinations: tallies,
            cancelled: self.cancel.load(Ordering::Relaxed),
        };
        self.emit(RunEvent::RunFinished {
            report: report.clone(),
        });
        Ok(report)
    }

    /// Produce the database dump artifact when db mode is enabled
    fn stage_db_dump(
        &self,
        destinations: &[Destination],
        run_id: &RunId,
    ) -> Result<Option<PathBuf>> {
        if !self.config.modes.db {
            return Ok(None);
        }
        let Some(staging_root) = destinations.iter().find_map(|d| d.local_root()) else {
            warn!("db mode is enabled but no local destination exists to stage the dump");
            return Ok(None);
        };
        match db_dump::dump_database(&self.config.database, staging_root, run_id) {
            Ok(path) => Ok(Some(path)),
            Err(e) => {
                // The dump is one artifact of the run, not the run itself
                warn!("Database dump failed: {}", e);
                Ok(None)
            }
        }
    }

    /// Copy-phase for archive runs: one ZIP per local destination, the
    /// first archive fans out to the remote destinations
    fn run_compressed(
        &self,
        run_id: &RunId,
        source_dir: &Path,
        destinations: Vec<Destination>,
        encrypt_enabled: bool,
        staged_artifact: Option<&Path>,
    ) -> Result<Vec<DestinationResult>> {
        let password = match self.config.compress {
            CompressType::ZipPw => {
                let password = compress::generate_archive_password();
                if let Err(e) = compress::store_archive_password(run_id, &password) {
                    warn!("Cannot cache archive password in the credential store: {}", e);
                }
                self.emit(RunEvent::ArchivePassword {
                    run_id: run_id.clone(),
                    password: password.clone(),
                });
                Some(password)
            }
            _ => None,
        };

        let mut results = Vec::new();
        let mut first_archive: Option<PathBuf> = None;

        for dest in destinations {
            let label = dest.label();
            let mut tally = DestinationTally::new(label);
            let mut entries = Vec::new();
            let mut sftp = None;
            let mut object_store = None;

            match &dest {
                Destination::LocalDir { root } => {
                    match compress::compress_source(source_dir, root, run_id, password.as_deref())
                    {
                        Ok(archive) => {
                            match local_copy::staged_entry(&archive, root, encrypt_enabled) {
                                Ok(entry) => {
                                    tally.files_copied += 1;
                                    tally.bytes_copied += entry.size;
                                    entries.push(entry);
                                }
                                Err(e) => {
                                    tally.files_failed += 1;
                                    warn!("Cannot fingerprint archive: {}", e);
                                }
                            }
                            if let Some(artifact) = staged_artifact {
                                if artifact.starts_with(root) {
                                    if let Ok(entry) =
                                        local_copy::staged_entry(artifact, root, encrypt_enabled)
                                    {
                                        tally.files_copied += 1;
                                        tally.bytes_copied += entry.size;
                                        entries.push(entry);
                                    }
                                }
                            }
                            first_archive.get_or_insert(archive);
                        }
                        Err(e) => tally.fatal = Some(e.to_string()),
                    }
                }
                Destination::SftpHost { target } => {
                    let Some(archive) = &first_archive else {
                        tally.fatal = Some("no local archive to fan out".to_string());
                        results.push(DestinationResult {
                            destination: dest,
                            entries,
                            tally,
                            sftp,
                            object_store,
                        });
                        continue;
                    };
                    match SftpCopier::connect(target.clone()) {
                        Ok(copier) => {
                            let records = vec![archive_record(archive)?];
                            let parent = archive.parent().unwrap_or(Path::new("."));
                            let (rows, upload_tally) =
                                copier.upload_run(parent, &records, &self.cancel);
                            merge_tally(&mut tally, upload_tally);
                            entries = rows;
                            sftp = Some(copier);
                        }
                        Err(e) => tally.fatal = Some(e.to_string()),
                    }
                }
                Destination::ObjectBucket { target } => {
                    let Some(archive) = &first_archive else {
                        tally.fatal = Some("no local archive to fan out".to_string());
                        results.push(DestinationResult {
                            destination: dest,
                            entries,
                            tally,
                            sftp,
                            object_store,
                        });
                        continue;
                    };
                    match ObjectStoreCopier::connect(target.clone()) {
                        Ok(copier) => {
                            let records = vec![archive_record(archive)?];
                            let parent = archive.parent().unwrap_or(Path::new("."));
                            let (rows, upload_tally) = copier.upload_run(
                                parent,
                                &records,
                                BackupMode::Full,
                                &self.cancel,
                            );
                            merge_tally(&mut tally, upload_tally);
                            entries = rows;
                            object_store = Some(copier);
                        }
                        Err(e) => tally.fatal = Some(e.to_string()),
                    }
                }
            }

            results.push(DestinationResult {
                destination: dest,
                entries,
                tally,
                sftp,
                object_store,
            });
        }
        Ok(results)
    }

    /// Copy-phase for regular runs: per-destination selection, then
    /// shared-nothing workers copying in parallel
    fn run_file_copies(
        &self,
        run_id: &RunId,
        selector: &Selector,
        mode: BackupMode,
        destinations: Vec<Destination>,
        encrypt_enabled: bool,
        staged_artifact: Option<&Path>,
    ) -> Result<Vec<DestinationResult>> {
        self.stage(run_id, RunStage::Selecting);

        // Probe selection once up front so an unreadable source aborts
        // the run before any worker starts
        let _ = selector.scan()?;

        let parallel_copies = self.config.parallel_copies;
        let cancel = Arc::clone(&self.cancel);

        let results: Vec<DestinationResult> = std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for dest in destinations {
                let selector = selector.clone();
                let cancel = Arc::clone(&cancel);
                let artifact = staged_artifact.map(Path::to_path_buf);
                let progress = self.progress.clone();
                handles.push(scope.spawn(move || {
                    copy_one_destination(
                        dest,
                        &selector,
                        mode,
                        parallel_copies,
                        encrypt_enabled,
                        artifact.as_deref(),
                        progress,
                        &cancel,
                    )
                }));
            }
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(_) => panic!("destination worker panicked"),
                })
                .collect()
        });

        Ok(results)
    }

    /// Write one manifest per destination (single-writer discipline) and
    /// return the local ones for the encryption stage
    fn write_manifests(
        &self,
        run_id: &RunId,
        mode: BackupMode,
        source_dir: &Path,
        started_at: chrono::DateTime<Local>,
        results: &mut [DestinationResult],
    ) -> Vec<(PathBuf, Manifest)> {
        let mut local_manifests = Vec::new();

        for result in results.iter_mut() {
            if result.tally.fatal.is_some() {
                continue;
            }
            let mut m = Manifest::new(
                run_id.clone(),
                mode,
                source_dir.to_path_buf(),
                result.destination.manifest_root(),
                started_at,
            );
            m.finished_at = Local::now();
            m.files = result.entries.clone();

            let written = match &result.destination {
                Destination::LocalDir { root } => m.save(root).map(|_| ()),
                Destination::SftpHost { .. } => match &result.sftp {
                    Some(copier) => copier.write_manifest(&m),
                    None => Err(BackupError::internal("sftp session lost before manifest")),
                },
                Destination::ObjectBucket { .. } => match &result.object_store {
                    Some(copier) => copier.write_manifest(&m),
                    None => Err(BackupError::internal("object-store client lost before manifest")),
                },
            };

            match written {
                Ok(()) => {
                    result.tally.manifest_written = true;
                    if let Some(root) = result.destination.local_root() {
                        local_manifests.push((root.to_path_buf(), m));
                    }
                }
                Err(e) => {
                    warn!(
                        "Cannot write manifest for {}: {}",
                        result.tally.destination, e
                    );
                    result.tally.fatal = Some(format!("manifest write failed: {e}"));
                }
            }
        }
        local_manifests
    }

    /// Encrypt each local destination; key failure disables only that
    /// destination
    fn encrypt_local_destinations(
        &self,
        results: &mut [DestinationResult],
        manifests: &[(PathBuf, Manifest)],
        key_source: &KeySource,
    ) {
        for result in results.iter_mut() {
            let Some(root) = result.destination.local_root() else {
                continue;
            };
            if result.tally.fatal.is_some() || !result.tally.manifest_written {
                continue;
            }
            let Some((_, run_manifest)) = manifests.iter().find(|(r, _)| r == root) else {
                continue;
            };
            match crate::encryption::encrypt_destination(root, key_source, run_manifest) {
                Ok(stats) => {
                    result.tally.files_failed += stats.files_failed;
                    debug!(
                        "Encrypted {} files in {:?} ({} skipped)",
                        stats.files_encrypted, root, stats.files_skipped
                    );
                }
                Err(e) => {
                    warn!("Encryption failed for {:?}: {}", root, e);
                    result.tally.fatal = Some(format!("encryption failed: {e}"));
                }
            }
        }
    }

    /// Log and report what a real run would do
    fn dry_run_report(
        &self,
        run_id: RunId,
        started_at: chrono::DateTime<Local>,
        source_dir: &Path,
        destinations: &[Destination],
    ) -> Result<RunReport> {
        info!(
            "[DRY RUN] Would perform {} backup of {:?}",
            self.config.mode, source_dir
        );
        for dest in destinations {
            info!("[DRY RUN]   -> {}", dest.label());
        }
        if self.config.compress.is_enabled() {
            info!("[DRY RUN]   with single-archive compression");
        }
        if !self.config.exclude_patterns.is_empty() {
            info!(
                "[DRY RUN]   excluding: {}",
                self.config.exclude_patterns.join(", ")
            );
        }
        info!("[DRY RUN] Complete. No files were modified.");

        let tallies: Vec<DestinationTally> = destinations
            .iter()
            .map(|d| DestinationTally {
                manifest_written: true,
                ..DestinationTally::new(d.label())
            })
            .collect();
        Ok(RunReport {
            run_id,
            mode: self.config.mode,
            outcome: RunReport::derive_outcome(&tallies),
            started_at,
            finished_at: Local::now(),
            destinations: tallies,
            cancelled: false,
        })
    }
}

/// Copy one destination's selection; runs on its own worker thread
fn copy_one_destination(
    dest: Destination,
    selector: &Selector,
    mode: BackupMode,
    parallel_copies: usize,
    encrypt_enabled: bool,
    staged_artifact: Option<&Path>,
    progress: Option<crate::types::ProgressCallback>,
    cancel: &AtomicBool,
) -> DestinationResult {
    let label = dest.label();
    let mut sftp = None;
    let mut object_store = None;

    let outcome = (|| -> Result<(Vec<ManifestEntry>, DestinationTally)> {
        match &dest {
            Destination::LocalDir { root } => {
                let reference = selection_reference(mode, root)?;
                let records = selector.select(mode, reference.as_ref())?;
                let mut copier = LocalCopier::new(root)
                    .with_parallel_copies(parallel_copies)
                    .with_encrypt_suffix(encrypt_enabled);
                if let Some(progress) = progress.clone() {
                    copier = copier.with_progress(progress);
                }
                let (mut entries, mut tally) =
                    copier.copy_run(selector.source_root(), &records, cancel)?;
                if let Some(artifact) = staged_artifact {
                    attach_artifact(artifact, root, encrypt_enabled, &mut entries, &mut tally);
                }
                Ok((entries, tally))
            }
            Destination::SftpHost { target } => {
                let copier = SftpCopier::connect(target.clone())?;
                let reference = match mode {
                    BackupMode::Full => None,
                    BackupMode::Incremental => copier.latest_manifest()?,
                    BackupMode::Differential => copier.latest_full_manifest()?,
                };
                let records = selector.select(mode, reference.as_ref())?;
                let (records, skipped): (Vec<FileRecord>, Vec<FileRecord>) = records
                    .into_iter()
                    .partition(|r| copier.should_upload(mode, r));
                let (mut entries, mut tally) =
                    copier.upload_run(selector.source_root(), &records, cancel);
                for record in skipped {
                    tally.files_skipped += 1;
                    entries.push(ManifestEntry::skipped(record.portable_path(), record.size));
                }
                if mode == BackupMode::Full {
                    if let Err(e) = copier.remove_extra_remote_files(&records) {
                        warn!("Mirror cleanup on {} failed: {}", target.host, e);
                    }
                }
                if let Some(artifact) = staged_artifact {
                    upload_artifact_sftp(&copier, artifact, &mut entries, &mut tally, cancel);
                }
                sftp = Some(copier);
                Ok((entries, tally))
            }
            Destination::ObjectBucket { target } => {
                let copier = ObjectStoreCopier::connect(target.clone())?;
                let reference = match mode {
                    BackupMode::Full => None,
                    BackupMode::Incremental => copier.latest_manifest()?,
                    BackupMode::Differential => copier.latest_full_manifest()?,
                };
                let records = selector.select(mode, reference.as_ref())?;
                let (mut entries, mut tally) =
                    copier.upload_run(selector.source_root(), &records, mode, cancel);
                if let Some(artifact) = staged_artifact {
                    upload_artifact_s3(&copier, artifact, mode, &mut entries, &mut tally, cancel);
                }
                object_store = Some(copier);
                Ok((entries, tally))
            }
        }
    })();

    match outcome {
        Ok((entries, tally)) => DestinationResult {
            destination: dest,
            entries,
            tally,
            sftp,
            object_store,
        },
        Err(e) => {
            warn!("Destination {} failed: {}", label, e);
            let mut tally = DestinationTally::new(label);
            tally.fatal = Some(e.to_string());
            DestinationResult {
                destination: dest,
                entries: Vec::new(),
                tally,
                sftp: None,
                object_store: None,
            }
        }
    }
}

/// The manifest a local destination's selection compares against
fn selection_reference(mode: BackupMode, root: &Path) -> Result<Option<Manifest>> {
    match mode {
        BackupMode::Full => Ok(None),
        BackupMode::Incremental => manifest::latest_manifest(root),
        BackupMode::Differential => manifest::latest_full_manifest(root),
    }
}

/// Add the staged dump artifact to a local destination's rows
fn attach_artifact(
    artifact: &Path,
    root: &Path,
    encrypt_enabled: bool,
    entries: &mut Vec<ManifestEntry>,
    tally: &mut DestinationTally,
) {
    if artifact.starts_with(root) {
        // Already staged here; just account for it
        match local_copy::staged_entry(artifact, root, encrypt_enabled) {
            Ok(entry) => {
                tally.files_copied += 1;
                tally.bytes_copied += entry.size;
                entries.push(entry);
            }
            Err(e) => {
                tally.files_failed += 1;
                warn!("Cannot fingerprint staged artifact: {}", e);
            }
        }
        return;
    }
    let results = local_copy::replicate_artifact(artifact, &[root.to_path_buf()]);
    for (_, result) in results {
        match result.and_then(|_| {
            let name = artifact.file_name().unwrap_or_default();
            local_copy::staged_entry(&root.join(name), root, encrypt_enabled)
        }) {
            Ok(entry) => {
                tally.files_copied += 1;
                tally.bytes_copied += entry.size;
                entries.push(entry);
            }
            Err(e) => {
                tally.files_failed += 1;
                let name = artifact.display().to_string();
                entries.push(ManifestEntry::failed(name, e.to_string()));
            }
        }
    }
}

/// Fan the dump artifact out to an SFTP destination
fn upload_artifact_sftp(
    copier: &SftpCopier,
    artifact: &Path,
    entries: &mut Vec<ManifestEntry>,
    tally: &mut DestinationTally,
    cancel: &AtomicBool,
) {
    match archive_record(artifact) {
        Ok(record) => {
            let parent = artifact.parent().unwrap_or(Path::new("."));
            let (rows, upload_tally) = copier.upload_run(parent, &[record], cancel);
            entries.extend(rows);
            merge_tally(tally, upload_tally);
        }
        Err(e) => warn!("Cannot stat artifact {:?}: {}", artifact, e),
    }
}

/// Fan the dump artifact out to the object store
fn upload_artifact_s3(
    copier: &ObjectStoreCopier,
    artifact: &Path,
    mode: BackupMode,
    entries: &mut Vec<ManifestEntry>,
    tally: &mut DestinationTally,
    cancel: &AtomicBool,
) {
    match archive_record(artifact) {
        Ok(record) => {
            let parent = artifact.parent().unwrap_or(Path::new("."));
            let (rows, upload_tally) = copier.upload_run(parent, &[record], mode, cancel);
            entries.extend(rows);
            merge_tally(tally, upload_tally);
        }
        Err(e) => warn!("Cannot stat artifact {:?}: {}", artifact, e),
    }
}

/// A single-file record for fanning an artifact out as-is
fn archive_record(path: &Path) -> Result<FileRecord> {
    let metadata = std::fs::metadata(path)?;
    Ok(FileRecord {
        rel_path: PathBuf::from(
            path.file_name()
                .ok_or_else(|| BackupError::internal("artifact has no file name"))?,
        ),
        size: metadata.len(),
        modified: metadata.modified()?,
        is_symlink: false,
        symlink_target: None,
    })
}

/// Fold an upload tally into the destination's accumulator
fn merge_tally(into: &mut DestinationTally, from: DestinationTally) {
    into.files_copied += from.files_copied;
    into.files_skipped += from.files_skipped;
    into.files_failed += from.files_failed;
    into.symlinks += from.symlinks;
    into.bytes_copied += from.bytes_copied;
    if into.fatal.is_none() {
        into.fatal = from.fatal;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModesConfig;
    use crate::manifest::FileStatus;
    use crate::types::RunOutcome;
    use std::fs;
    use tempfile::TempDir;

    fn local_config(source: &Path, dest: &Path) -> BackupConfig {
        BackupConfig {
            source_dir: Some(source.to_path_buf()),
            backup_dirs: vec![dest.to_path_buf()],
            modes: ModesConfig {
                local: true,
                ..Default::default()
            },
            parallel_copies: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_full_local_run() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::write(source.path().join("a.txt"), b"0123456789").unwrap();
        fs::create_dir(source.path().join("dir")).unwrap();
        fs::write(source.path().join("dir/b.txt"), b"hello").unwrap();

        let report = Orchestrator::new(local_config(source.path(), dest.path()))
            .execute()
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Success);
        assert_eq!(report.files_copied(), 2);
        assert!(dest.path().join("a.txt").is_file());
        assert!(dest.path().join("dir/b.txt").is_file());

        let m = manifest::latest_manifest(dest.path()).unwrap().unwrap();
        assert_eq!(m.files.len(), 2);
        assert!(m.files.iter().all(|f| f.status == FileStatus::Copied));
    }

    #[test]
    fn test_incremental_copies_only_changes() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::write(source.path().join("a.txt"), b"0123456789").unwrap();
        fs::write(source.path().join("b.txt"), b"hello").unwrap();

        let config = local_config(source.path(), dest.path());
        Orchestrator::new(config.clone()).execute().unwrap();

        // Touch one file after the first run
        std::thread::sleep(std::time::Duration::from_millis(1100));
        fs::write(source.path().join("a.txt"), b"0123456789x").unwrap();

        let mut incremental = config;
        incremental.mode = BackupMode::Incremental;
        let report = Orchestrator::new(incremental).execute().unwrap();
        assert_eq!(report.outcome, RunOutcome::Success);

        let m = manifest::latest_manifest(dest.path()).unwrap().unwrap();
        let copied: Vec<&str> = m
            .files
            .iter()
            .filter(|f| f.status == FileStatus::Copied)
            .map(|f| f.path.as_str())
            .collect();
        assert_eq!(copied, vec!["a.txt"]);
        assert!(m.entry("b.txt").is_none());
    }

    #[test]
    fn test_pre_hook_failure_aborts() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::write(source.path().join("a.txt"), b"x").unwrap();

        let mut config = local_config(source.path(), dest.path());
        config.hooks.pre_backup = Some("exit 1".to_string());

        let err = Orchestrator::new(config).execute().unwrap_err();
        assert!(matches!(err, BackupError::Hook { .. }));
        assert!(manifest::latest_manifest(dest.path()).unwrap().is_none());
    }

    #[test]
    fn test_post_hook_failure_does_not_change_outcome() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::write(source.path().join("a.txt"), b"x").unwrap();

        let mut config = local_config(source.path(), dest.path());
        config.hooks.post_backup = Some("exit 1".to_string());

        let report = Orchestrator::new(config).execute().unwrap();
        assert_eq!(report.outcome, RunOutcome::Success);
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::write(source.path().join("a.txt"), b"x").unwrap();

        let report = Orchestrator::new(local_config(source.path(), dest.path()))
            .with_dry_run(true)
            .execute()
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Success);
        assert!(!dest.path().join("a.txt").exists());
        assert!(manifest::latest_manifest(dest.path()).unwrap().is_none());
    }

    #[test]
    fn test_compress_requires_full() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let mut config = local_config(source.path(), dest.path());
        config.compress = CompressType::Zip;
        config.mode = BackupMode::Incremental;

        let err = Orchestrator::new(config).execute().unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));
    }

    #[test]
    fn test_compressed_run_produces_archive() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::write(source.path().join("a.txt"), b"alpha").unwrap();

        let mut config = local_config(source.path(), dest.path());
        config.compress = CompressType::Zip;

        let report = Orchestrator::new(config).execute().unwrap();
        assert_eq!(report.outcome, RunOutcome::Success);

        let m = manifest::latest_manifest(dest.path()).unwrap().unwrap();
        assert_eq!(m.files.len(), 1);
        assert!(m.files[0].path.starts_with("backup_"));
        assert!(m.files[0].path.ends_with(".zip"));
        assert!(dest.path().join(&m.files[0].stored_path).is_file());
    }

    #[test]
    fn test_encryption_and_dedup_pipeline() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let payload = vec![9u8; 1024 * 1024];
        fs::write(source.path().join("x"), &payload).unwrap();
        fs::write(source.path().join("y"), &payload).unwrap();

        let mut config = local_config(source.path(), dest.path());
        config.encryption.enabled = true;
        config.encryption.passphrase = Some("pw".to_string());
        config.dedup_enabled = true;

        let report = Orchestrator::new(config).execute().unwrap();
        assert_eq!(report.outcome, RunOutcome::Success);

        // Plaintext replaced by envelopes
        assert!(dest.path().join("x.enc").is_file());
        assert!(dest.path().join("y.enc").is_file());
        assert!(!dest.path().join("x").exists());

        // Same plaintext hash => same inode after dedup
        assert_eq!(
            crate::utils::inode(&dest.path().join("x.enc")),
            crate::utils::inode(&dest.path().join("y.enc"))
        );

        // Manifest keeps the plaintext hash and pre-encryption size
        let m = manifest::latest_manifest(dest.path()).unwrap().unwrap();
        let row = m.entry("x").unwrap();
        assert_eq!(row.stored_path, "x.enc");
        assert_eq!(row.size, payload.len() as u64);
        assert_eq!(row.sha256, crate::utils::hash_data(&payload));
    }

    #[test]
    fn test_retention_keeps_newest_runs() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::write(source.path().join("a.txt"), b"v").unwrap();

        let mut config = local_config(source.path(), dest.path());
        config.retention.max_count = 2;

        for _ in 0..3 {
            Orchestrator::new(config.clone()).execute().unwrap();
            // Distinct run ids need distinct seconds
            std::thread::sleep(std::time::Duration::from_millis(1100));
        }

        let manifests = manifest::list_manifests(dest.path()).unwrap();
        assert_eq!(manifests.len(), 2);
        // The shared file survives because the kept manifests list it
        assert!(dest.path().join("a.txt").is_file());
    }

    #[test]
    fn test_missing_source_fails_run() {
        let dest = TempDir::new().unwrap();
        let config = local_config(Path::new("/definitely/not/here"), dest.path());
        let err = Orchestrator::new(config).execute().unwrap_err();
        assert!(matches!(err, BackupError::Selection(_)));
    }
}
