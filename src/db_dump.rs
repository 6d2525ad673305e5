//! Database dump stage
//!
//! Spawns the external `mysqldump` tool and stages the resulting `.sql`
//! artifact inside the first local destination. The password travels via
//! the `MYSQL_PWD` environment variable, never on the command line where
//! other processes could read it. From the pipeline's point of view the
//! artifact is then an ordinary file of the run: it is manifested, fanned
//! out to remote destinations, encrypted, deduplicated and pruned like
//! anything else.

use crate::config::DatabaseConfig;
use crate::error::{BackupError, Result};
use crate::types::RunId;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// File name of the dump artifact for one run
pub fn dump_file_name(database: &str, run_id: &RunId) -> String {
    format!("{database}_backup_{run_id}.sql")
}

/// Run the dump tool and stage the artifact into `staging_dir`
///
/// Returns the path of the staged artifact. Missing credentials, a
/// missing dump tool, or a non-zero exit all fail the stage.
pub fn dump_database(config: &DatabaseConfig, staging_dir: &Path, run_id: &RunId) -> Result<PathBuf> {
    let user = config
        .user
        .as_deref()
        .ok_or_else(|| BackupError::DbDump("'user' is not configured in [DATABASE]".into()))?;
    let password = config
        .password
        .as_deref()
        .ok_or_else(|| BackupError::DbDump("'password' is not configured in [DATABASE]".into()))?;
    let database = config
        .database
        .as_deref()
        .ok_or_else(|| BackupError::DbDump("'database' is not configured in [DATABASE]".into()))?;

    std::fs::create_dir_all(staging_dir)?;
    let dump_path = staging_dir.join(dump_file_name(database, run_id));

    info!(
        "Dumping database '{}' from {}:{} to {:?}",
        database, config.host, config.port, dump_path
    );

    let output = Command::new("mysqldump")
        .arg("-u")
        .arg(user)
        .arg("-h")
        .arg(&config.host)
        .arg("-P")
        .arg(config.port.to_string())
        .arg("--result-file")
        .arg(&dump_path)
        .arg(database)
        .env("MYSQL_PWD", password)
        .output()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BackupError::DbDump(
                    "mysqldump not found; install the MySQL client tools".to_string(),
                )
            } else {
                BackupError::DbDump(format!("cannot spawn mysqldump: {e}"))
            }
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let _ = std::fs::remove_file(&dump_path);
        return Err(BackupError::DbDump(format!(
            "mysqldump exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let size = std::fs::metadata(&dump_path)?.len();
    debug!("Database dump staged: {:?} ({} bytes)", dump_path, size);
    Ok(dump_path)
}
