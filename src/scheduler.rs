//! Scheduling and single-instance locking
//!
//! Scheduled operation is one long-lived process that wakes on a ticker.
//! A PID lock file guarantees at most one orchestration per lock path: on
//! startup the lock is created exclusively; if it already exists and the
//! recorded process is still alive the new instance exits, otherwise the
//! stale lock is reclaimed.
//!
//! The timetable is a set of wall-clock `HH:MM` slots with a tolerance
//! window: a slot fires when the current local time is within
//! `interval_minutes` of it, and at most once per slot per day.

use crate::error::{BackupError, Result};
use chrono::{DateTime, Local, NaiveDate, NaiveTime};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Single-instance PID lock
///
/// The lock file contains the owning process id. Dropping the guard (or
/// calling [`PidLock::release`]) removes the file.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    held: bool,
}

impl PidLock {
    /// Acquire the lock, reclaiming it when the recorded owner is dead
    pub fn acquire(path: &Path) -> Result<Self> {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                write!(file, "{}", std::process::id())?;
                debug!("Acquired lock {:?}", path);
                return Ok(PidLock {
                    path: path.to_path_buf(),
                    held: true,
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        let recorded = fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok());

        match recorded {
            Some(pid) if process_alive(pid) => Err(BackupError::LockHeld {
                pid,
                path: path.to_path_buf(),
            }),
            _ => {
                warn!("Reclaiming stale lock {:?}", path);
                fs::remove_file(path)?;
                let mut file = fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(path)?;
                write!(file, "{}", std::process::id())?;
                Ok(PidLock {
                    path: path.to_path_buf(),
                    held: true,
                })
            }
        }
    }

    /// Release the lock explicitly
    pub fn release(&mut self) {
        if self.held {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Cannot remove lock {:?}: {}", self.path, e);
                }
            }
            self.held = false;
        }
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Whether a process id is alive
#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

/// Without a process table to consult, assume the owner is alive; a
/// false positive only delays the next scheduled run
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Wall-clock timetable with a tolerance window
#[derive(Debug, Clone)]
pub struct Schedule {
    slots: Vec<NaiveTime>,
    interval_minutes: u32,
    fired: HashSet<(NaiveDate, NaiveTime)>,
}

impl Schedule {
    /// Parse `HH:MM` slot strings into a schedule
    pub fn new(times: &[String], interval_minutes: u32) -> Result<Self> {
        if times.is_empty() {
            return Err(BackupError::Schedule("no scheduled times configured".into()));
        }
        if interval_minutes == 0 {
            return Err(BackupError::Schedule(
                "interval_minutes must be positive".into(),
            ));
        }
        let mut slots = Vec::with_capacity(times.len());
        for t in times {
            let slot = NaiveTime::parse_from_str(t, "%H:%M")
                .map_err(|_| BackupError::Schedule(format!("invalid time '{t}', use HH:MM")))?;
            slots.push(slot);
        }
        slots.sort();
        slots.dedup();
        Ok(Schedule {
            slots,
            interval_minutes,
            fired: HashSet::new(),
        })
    }

    /// The slot due at `now`, if any
    ///
    /// A slot is due when `now` lies within ± the tolerance interval of
    /// it and the slot has not fired yet today. Claiming the slot marks
    /// it fired for that date, so each slot starts at most one run per
    /// day.
    pub fn claim_due_slot(&mut self, now: DateTime<Local>) -> Option<NaiveTime> {
        let today = now.date_naive();
        let now_time = now.time();
        let tolerance = chrono::Duration::minutes(self.interval_minutes as i64);

        for slot in &self.slots {
            let key = (today, *slot);
            if self.fired.contains(&key) {
                continue;
            }
            let offset = if now_time >= *slot {
                now_time - *slot
            } else {
                *slot - now_time
            };
            if offset <= tolerance {
                self.fired.insert(key);
                // Old entries would only grow the set; keep it bounded
                self.fired.retain(|(date, _)| *date >= today);
                return Some(*slot);
            }
        }
        None
    }

    /// Seconds to sleep between ticks
    ///
    /// Half the tolerance window, clamped to [1s, 60s], so a slot can
    /// never slip through between two ticks.
    pub fn tick_seconds(&self) -> u64 {
        ((self.interval_minutes as u64 * 60) / 2).clamp(1, 60)
    }

    /// The configured slots
    pub fn slots(&self) -> &[NaiveTime] {
        &self.slots
    }
}

/// Register SIGINT/SIGTERM handlers that set a shutdown flag
///
/// The scheduler loop polls the flag; an in-flight run finishes its
/// current file before the process reports and exits.
#[cfg(unix)]
pub fn register_shutdown_flag() -> Result<std::sync::Arc<std::sync::atomic::AtomicBool>> {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    let flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&flag))
        .map_err(|e| BackupError::internal(format!("signal handler: {e}")))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(|e| BackupError::internal(format!("signal handler: {e}")))?;
    info!("Shutdown handlers registered (SIGINT, SIGTERM)");
    Ok(flag)
}

/// Non-Unix fallback: a flag nothing sets
#[cfg(not(unix))]
pub fn register_shutdown_flag() -> Result<std::sync::Arc<std::sync::atomic::AtomicBool>> {
    Ok(std::sync::Arc::new(std::sync::atomic::AtomicBool::new(
        false,
    )))
}
