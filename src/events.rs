//! Lifecycle events emitted by the orchestrator
//!
//! Every stage transition and run result is published as a [`RunEvent`]
//! to the registered [`EventSink`]s, so notifications and logs observe
//! the same truth. Transports (chat bot, outbound mail) live outside the
//! core; the built-in [`LogSink`] forwards events to the log stream.

use crate::types::{BackupMode, RunId, RunOutcome, RunReport};
use tracing::{info, warn};

/// Pipeline stage of a run, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    /// Waiting for work
    Idle,
    /// Single-instance lock acquired
    Locked,
    /// Pre-backup hook running
    PreHook,
    /// Selecting participating files
    Selecting,
    /// Copying to destinations
    Copying,
    /// Writing manifests
    Manifesting,
    /// Encrypting local destinations
    Encrypting,
    /// Hardlink deduplication
    Deduping,
    /// Retention pruning
    Pruning,
    /// Post-backup hook running
    PostHook,
    /// Emitting the run report
    Reporting,
}

impl std::fmt::Display for RunStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunStage::Idle => "idle",
            RunStage::Locked => "locked",
            RunStage::PreHook => "pre-hook",
            RunStage::Selecting => "selecting",
            RunStage::Copying => "copying",
            RunStage::Manifesting => "manifesting",
            RunStage::Encrypting => "encrypting",
            RunStage::Deduping => "deduping",
            RunStage::Pruning => "pruning",
            RunStage::PostHook => "post-hook",
            RunStage::Reporting => "reporting",
        };
        f.write_str(name)
    }
}

/// A structured lifecycle event
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// A run has started
    RunStarted {
        /// Run identifier
        run_id: RunId,
        /// Selection policy
        mode: BackupMode,
    },
    /// The run moved to a new stage
    StageChanged {
        /// Run identifier
        run_id: RunId,
        /// Stage now executing
        stage: RunStage,
    },
    /// One destination finished its copy phase
    DestinationFinished {
        /// Run identifier
        run_id: RunId,
        /// Destination label
        destination: String,
        /// Files copied there
        files_copied: usize,
        /// Files that failed there
        files_failed: usize,
    },
    /// A one-time archive password was generated; deliver out-of-band
    ArchivePassword {
        /// Run identifier
        run_id: RunId,
        /// The generated password
        password: String,
    },
    /// The run finished with a report
    RunFinished {
        /// Complete run report
        report: RunReport,
    },
}

/// Receives lifecycle events; implementations must tolerate concurrency
pub trait EventSink: Send + Sync {
    /// Handle one event
    fn emit(&self, event: &RunEvent);
}

/// Sink that forwards events to the log stream
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &RunEvent) {
        match event {
            RunEvent::RunStarted { run_id, mode } => {
                info!("Run {} started ({} backup)", run_id, mode);
            }
            RunEvent::StageChanged { run_id, stage } => {
                info!("Run {}: {}", run_id, stage);
            }
            RunEvent::DestinationFinished {
                run_id,
                destination,
                files_copied,
                files_failed,
            } => {
                if *files_failed == 0 {
                    info!(
                        "Run {}: {} done, {} files copied",
                        run_id, destination, files_copied
                    );
                } else {
                    warn!(
                        "Run {}: {} done, {} copied, {} failed",
                        run_id, destination, files_copied, files_failed
                    );
                }
            }
            RunEvent::ArchivePassword { run_id, .. } => {
                // The password itself never reaches the log sink output
                info!("Run {}: archive password generated and stored", run_id);
            }
            RunEvent::RunFinished { report } => match report.outcome {
                RunOutcome::Success => info!(
                    "Run {} finished: success, {} files, {} copied",
                    report.run_id,
                    report.files_copied(),
                    crate::utils::format_bytes(report.bytes_copied())
                ),
                RunOutcome::Partial => warn!(
                    "Run {} finished: partial, {} copied, {} failed",
                    report.run_id,
                    report.files_copied(),
                    report.files_failed()
                ),
                RunOutcome::Failed => warn!("Run {} finished: failed", report.run_id),
            },
        }
    }
}

/// Fan an event out to every sink
pub fn broadcast(sinks: &[std::sync::Arc<dyn EventSink>], event: &RunEvent) {
    for sink in sinks {
        sink.emit(event);
    }
}
