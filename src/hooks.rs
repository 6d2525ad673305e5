//! Pre- and post-backup shell hooks
//!
//! Hooks are externally configured shell commands. The pre-backup hook
//! runs before selection and a non-zero exit aborts the run; the
//! post-backup hook runs after the pipeline regardless of outcome, and
//! its failure is logged without changing the run result.

use crate::error::{BackupError, Result};
use std::process::Command;
use tracing::{debug, info, warn};

/// Run one hook command through the shell
pub fn run_hook(command: &str, phase: &str) -> Result<()> {
    info!("Running {} hook: {}", phase, command);

    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .map_err(|e| BackupError::Hook {
            phase: phase.to_string(),
            reason: format!("cannot spawn: {e}"),
        })?;

    if output.status.success() {
        debug!("{} hook finished cleanly", phase);
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut lines: Vec<&str> = stderr.lines().rev().take(5).collect();
        lines.reverse();
        let tail = lines.join("; ");
        warn!("{} hook exited with {}: {}", phase, output.status, tail);
        Err(BackupError::Hook {
            phase: phase.to_string(),
            reason: format!("exit status {}: {}", output.status, tail),
        })
    }
}
