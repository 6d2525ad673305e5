//! # Coffer CLI - policy-driven verified backups
//!
//! Command-line front end for the coffer backup pipeline engine.
//!
//! ## Usage
//! ```bash
//! # One-off full backup to local directories
//! coffer --operation-modes local --backup-mode full \
//!        --source-dir /data --backup-dirs /backup/a /backup/b
//!
//! # Scheduled operation from the config file
//! coffer --scheduled --config config/config.ini
//!
//! # Verify destinations against their latest manifests
//! coffer --verify
//!
//! # Point-in-time restore
//! coffer --restore --from-dir /backup/a --to-dir /restored \
//!        --restore-timestamp 20260102_000000
//! ```
//!
//! Exit codes: 0 success, 1 configuration error, 2 lock conflict,
//! 3 run reported partial, 4 run reported failed.

use clap::{Parser, ValueEnum};
use coffer::config::{is_valid_email, BackupConfig, CompressType};
use coffer::encryption::KeySource;
use coffer::error::BackupError;
use coffer::manifest;
use coffer::orchestrator::Orchestrator;
use coffer::restore::{restore_backup, RestoreOptions};
use coffer::scheduler::{register_shutdown_flag, PidLock, Schedule};
use coffer::types::{BackupMode, RunId, RunOutcome};
use coffer::utils::format_bytes;
use coffer::verify::verify_destination;
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use tracing::{error, info};

const EXIT_CONFIG: u8 = 1;
const EXIT_LOCK: u8 = 2;
const EXIT_PARTIAL: u8 = 3;
const EXIT_FAILED: u8 = 4;

/// Coffer - verifiable, policy-driven backups
#[derive(Parser)]
#[command(name = "coffer")]
#[command(version)]
#[command(about = "Verified backups to local, SFTP and object-store destinations")]
struct Cli {
    /// Destination kinds to run (overrides [MODES] in the config)
    #[arg(long, value_enum, num_args = 1..)]
    operation_modes: Option<Vec<OperationMode>>,

    /// Selection policy for this run
    #[arg(long, value_enum)]
    backup_mode: Option<CliBackupMode>,

    /// Override the source directory
    #[arg(long)]
    source_dir: Option<PathBuf>,

    /// Override the local backup directories
    #[arg(long, num_args = 1..)]
    backup_dirs: Option<Vec<PathBuf>>,

    /// Override the SSH servers
    #[arg(long, num_args = 1..)]
    ssh_servers: Option<Vec<String>>,

    /// Comma-separated exclude globs (overrides the config)
    #[arg(long)]
    exclude: Option<String>,

    /// Keep only the N newest runs per destination
    #[arg(long, value_name = "N")]
    retain: Option<usize>,

    /// Compress the source into a single archive
    #[arg(long, value_enum)]
    compress: Option<CliCompress>,

    /// Encrypt destination files after the manifest is written
    #[arg(long)]
    encrypt: bool,

    /// Hardlink-deduplicate local destinations
    #[arg(long)]
    dedup: bool,

    /// Run as a long-lived scheduled process
    #[arg(long, conflicts_with = "dry_run")]
    scheduled: bool,

    /// Show what would be done without copying anything
    #[arg(long)]
    dry_run: bool,

    /// Print the resolved configuration and exit
    #[arg(long)]
    show_setup: bool,

    /// Print backup status and exit
    #[arg(long)]
    status: bool,

    /// Verify destinations against their latest manifests and exit
    #[arg(long)]
    verify: bool,

    /// Restore from a backup source
    #[arg(
        long,
        conflicts_with_all = [
            "operation_modes", "backup_mode", "compress", "encrypt",
            "dedup", "scheduled", "dry_run", "retain"
        ]
    )]
    restore: bool,

    /// Restore source: directory, archive, user@host:/path or s3://bucket/prefix
    #[arg(long, requires = "restore")]
    from_dir: Option<String>,

    /// Directory to restore into
    #[arg(long, requires = "restore")]
    to_dir: Option<PathBuf>,

    /// Reconstruct the state as of this run id (YYYYMMDD_HHMMSS)
    #[arg(long, requires = "restore")]
    restore_timestamp: Option<String>,

    /// Path to the configuration file
    #[arg(long, default_value = "config/config.ini")]
    config: PathBuf,

    /// Named profile resolving to config/config.<NAME>.ini
    #[arg(long)]
    profile: Option<String>,

    /// Enable notification events
    #[arg(long)]
    notifications: bool,

    /// Email addresses to notify
    #[arg(long, num_args = 1..)]
    receiver: Option<Vec<String>>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum OperationMode {
    Local,
    Ssh,
    S3,
    Db,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum CliBackupMode {
    Full,
    Incremental,
    Differential,
}

impl From<CliBackupMode> for BackupMode {
    fn from(mode: CliBackupMode) -> Self {
        match mode {
            CliBackupMode::Full => BackupMode::Full,
            CliBackupMode::Incremental => BackupMode::Incremental,
            CliBackupMode::Differential => BackupMode::Differential,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum CliCompress {
    Zip,
    ZipPw,
}

fn main() -> ExitCode {
    if std::env::args().len() == 1 {
        use clap::CommandFactory;
        let _ = Cli::command().print_help();
        return ExitCode::from(EXIT_CONFIG);
    }
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            let code = match &e {
                BackupError::LockHeld { .. } => EXIT_LOCK,
                BackupError::Config(_) | BackupError::UnresolvedEnvVar { .. } => EXIT_CONFIG,
                _ => EXIT_FAILED,
            };
            ExitCode::from(code)
        }
    }
}

fn run(cli: Cli) -> coffer::Result<ExitCode> {
    if let Some(receivers) = &cli.receiver {
        for email in receivers {
            if !is_valid_email(email) {
                return Err(BackupError::config(format!("invalid email address: {email}")));
            }
        }
    }

    let config_path = resolve_config_path(&cli)?;

    if cli.show_setup {
        let config = BackupConfig::load_unvalidated(&config_path)?;
        print_setup(&config);
        return Ok(ExitCode::SUCCESS);
    }

    if cli.status {
        let config = apply_overrides(BackupConfig::load_unvalidated(&config_path)?, &cli)?;
        print_status(&config);
        return Ok(ExitCode::SUCCESS);
    }

    if cli.restore {
        return run_restore(&cli, &config_path);
    }

    if cli.verify {
        let config = apply_overrides(BackupConfig::load_unvalidated(&config_path)?, &cli)?;
        return run_verify(&config);
    }

    if cli.scheduled {
        let config = apply_overrides(BackupConfig::load_for_schedule(&config_path)?, &cli)?;
        return run_scheduled(&config, &config_path);
    }

    // One-off run
    let config = apply_overrides(BackupConfig::load_unvalidated(&config_path)?, &cli)?;
    config.validate(false)?;

    let spinner = indicatif::ProgressBar::new_spinner();
    spinner.set_style(
        indicatif::ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_spinner()),
    );
    let bar = spinner.clone();
    let report = Orchestrator::new(config)
        .with_dry_run(cli.dry_run)
        .with_progress(std::sync::Arc::new(move |info: coffer::types::ProgressInfo| {
            bar.set_message(format!(
                "{} {}/{} ({})",
                info.operation,
                info.processed,
                info.total.map(|t| t.to_string()).unwrap_or_else(|| "?".into()),
                format_bytes(info.bytes_processed)
            ));
            bar.tick();
        }))
        .execute()?;
    spinner.finish_and_clear();
    print_report_summary(&report);
    Ok(outcome_exit_code(report.outcome))
}

/// Resolve `--profile` / `--config` to the file actually loaded
fn resolve_config_path(cli: &Cli) -> coffer::Result<PathBuf> {
    if let Some(profile) = &cli.profile {
        let path = PathBuf::from(format!("config/config.{profile}.ini"));
        if !path.is_file() {
            return Err(BackupError::config(format!(
                "profile config not found: {}",
                path.display()
            )));
        }
        return Ok(path);
    }
    Ok(cli.config.clone())
}

/// Layer CLI overrides onto the loaded configuration snapshot
fn apply_overrides(mut config: BackupConfig, cli: &Cli) -> coffer::Result<BackupConfig> {
    if let Some(modes) = &cli.operation_modes {
        config.modes.local = modes.contains(&OperationMode::Local);
        config.modes.ssh = modes.contains(&OperationMode::Ssh);
        config.modes.s3 = modes.contains(&OperationMode::S3);
        config.modes.db = modes.contains(&OperationMode::Db);
    } else if !config.modes.local && !config.modes.ssh && !config.modes.s3 && !config.modes.db {
        config.modes.local = true;
    }

    if let Some(mode) = cli.backup_mode {
        if cli.source_dir.is_none() && config.source_dir.is_none() {
            return Err(BackupError::config(
                "--backup-mode requires a source directory (--source-dir or config)",
            ));
        }
        config.mode = mode.into();
    }
    if let Some(source_dir) = &cli.source_dir {
        config.source_dir = Some(source_dir.clone());
    }
    if let Some(backup_dirs) = &cli.backup_dirs {
        config.backup_dirs = backup_dirs.clone();
    }
    if let Some(servers) = &cli.ssh_servers {
        config.ssh.servers = servers.clone();
    }
    if let Some(exclude) = &cli.exclude {
        config.exclude_patterns = exclude
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
    }
    if let Some(retain) = cli.retain {
        config.retention.max_count = retain;
    }
    if let Some(compress) = cli.compress {
        config.compress = match compress {
            CliCompress::Zip => CompressType::Zip,
            CliCompress::ZipPw => CompressType::ZipPw,
        };
    }
    if cli.encrypt {
        config.encryption.enabled = true;
    }
    if cli.dedup {
        config.dedup_enabled = true;
    }
    if cli.notifications {
        if let Some(receivers) = &cli.receiver {
            config.notifications.receiver_emails = receivers.clone();
        }
    }
    Ok(config)
}

fn outcome_exit_code(outcome: RunOutcome) -> ExitCode {
    match outcome {
        RunOutcome::Success => ExitCode::SUCCESS,
        RunOutcome::Partial => ExitCode::from(EXIT_PARTIAL),
        RunOutcome::Failed => ExitCode::from(EXIT_FAILED),
    }
}

/// Long-lived scheduled operation under the single-instance lock
fn run_scheduled(config: &BackupConfig, config_path: &Path) -> coffer::Result<ExitCode> {
    let lock_path = config_path
        .parent()
        .unwrap_or(Path::new("."))
        .join(".coffer.lock");
    let _lock = PidLock::acquire(&lock_path)?;

    let shutdown = register_shutdown_flag()?;
    let mut schedule = Schedule::new(&config.schedule.times, config.schedule.interval_minutes)?;
    info!(
        "Scheduler running with {} slot(s), tolerance {} minute(s)",
        schedule.slots().len(),
        config.schedule.interval_minutes
    );

    let mut worst = RunOutcome::Success;
    while !shutdown.load(Ordering::Relaxed) {
        if let Some(slot) = schedule.claim_due_slot(chrono::Local::now()) {
            info!("Scheduled slot {} matched; starting run", slot.format("%H:%M"));
            match Orchestrator::new(config.clone())
                .with_cancel_flag(shutdown.clone())
                .execute()
            {
                Ok(report) => {
                    print_report_summary(&report);
                    if report.outcome != RunOutcome::Success && worst == RunOutcome::Success {
                        worst = report.outcome;
                    }
                }
                Err(e) => {
                    error!("Scheduled run failed: {}", e);
                    worst = RunOutcome::Failed;
                }
            }
        }

        // Sleep in one-second steps so a stop signal is honored quickly
        for _ in 0..schedule.tick_seconds() {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_secs(1));
        }
    }

    info!("Scheduler stopped cleanly");
    Ok(outcome_exit_code(worst))
}

fn run_verify(config: &BackupConfig) -> coffer::Result<ExitCode> {
    let key_source = KeySource::from_config(&config.encryption).unwrap_or(None);
    let mut all_clean = true;

    println!("\n{}\n", "=== Backup Verification Report ===".bold());
    for dir in &config.backup_dirs {
        let result = verify_destination(dir, key_source.as_ref())?;
        let headline = if result.is_clean() {
            format!("{} {}", "OK".green().bold(), dir.display())
        } else {
            all_clean = false;
            format!("{} {}", "ISSUES".red().bold(), dir.display())
        };
        println!("{headline}");
        println!(
            "    manifest: {}   verified: {}  missing: {}  corrupted: {}  errors: {}",
            result.run_id.as_deref().unwrap_or("none"),
            result.verified,
            result.missing,
            result.corrupted,
            result.errors
        );
        for line in result.details.iter().take(20) {
            println!("      {line}");
        }
        if result.details.len() > 20 {
            println!("      ... and {} more", result.details.len() - 20);
        }
    }
    println!();

    if all_clean {
        println!("Result: {}", "ALL BACKUPS VERIFIED OK".green().bold());
        Ok(ExitCode::SUCCESS)
    } else {
        println!("Result: {}", "VERIFICATION FOUND ISSUES".red().bold());
        Ok(ExitCode::from(EXIT_FAILED))
    }
}

fn run_restore(cli: &Cli, config_path: &Path) -> coffer::Result<ExitCode> {
    let from = cli
        .from_dir
        .as_deref()
        .ok_or_else(|| BackupError::config("--restore requires --from-dir"))?;
    let to = cli
        .to_dir
        .as_deref()
        .ok_or_else(|| BackupError::config("--restore requires --to-dir"))?;

    let timestamp = cli
        .restore_timestamp
        .as_deref()
        .map(RunId::parse)
        .transpose()?;

    // Credentials for remote sources and decryption come from the config
    let config = BackupConfig::load_unvalidated(config_path).unwrap_or_default();
    let options = RestoreOptions {
        timestamp,
        key_source: KeySource::from_config(&config.encryption).unwrap_or(None),
        ssh_username: config.ssh.username.clone(),
        ssh_password: config.ssh.password.clone(),
        ssh_key_file: config.ssh.key_file.clone(),
        s3_region: config.s3.region.clone(),
        s3_access_key: config.s3.access_key.clone(),
        s3_secret_key: config.s3.secret_key.clone(),
    };

    info!("Restoring from {} to {}", from, to.display());
    let summary = restore_backup(from, to, &options)?;
    if summary.is_success() {
        println!(
            "{} {} files restored",
            "Restore completed:".green().bold(),
            summary.files_restored
        );
        Ok(ExitCode::SUCCESS)
    } else {
        println!(
            "{} {} restored, {} failed",
            "Restore completed with errors:".red().bold(),
            summary.files_restored,
            summary.files_failed
        );
        Ok(ExitCode::from(EXIT_FAILED))
    }
}

fn print_report_summary(report: &coffer::RunReport) {
    let outcome = match report.outcome {
        RunOutcome::Success => "success".green().bold(),
        RunOutcome::Partial => "partial".yellow().bold(),
        RunOutcome::Failed => "failed".red().bold(),
    };
    println!(
        "\nRun {} ({}) finished: {}",
        report.run_id.to_string().cyan(),
        report.mode,
        outcome
    );
    for tally in &report.destinations {
        let status = match &tally.fatal {
            Some(fatal) => format!("{} ({})", "FAILED".red(), fatal),
            None => format!(
                "{} copied, {} skipped, {} failed, {}",
                tally.files_copied,
                tally.files_skipped,
                tally.files_failed,
                format_bytes(tally.bytes_copied)
            ),
        };
        println!("  {:<40} {}", tally.destination, status);
    }
    if report.cancelled {
        println!("  {}", "(run was cancelled by a stop signal)".yellow());
    }
    println!();
}

fn print_status(config: &BackupConfig) {
    println!("\n{}\n", "=== Backup Status ===".bold());

    if config.schedule.times.is_empty() {
        println!("Scheduled times: not configured");
    } else {
        println!("Scheduled times: {}", config.schedule.times.join(", "));
    }

    if config.backup_dirs.is_empty() {
        println!("\nNo backup directories configured");
        return;
    }

    println!("\nBackup directories:");
    for dir in &config.backup_dirs {
        if dir.is_dir() {
            let total: u64 = walkdir::WalkDir::new(dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| e.metadata().ok())
                .map(|m| m.len())
                .sum();
            println!("  {}: {}", dir.display(), format_bytes(total));
        } else {
            println!("  {}: (not found)", dir.display());
        }
    }

    println!("\nLatest manifest:");
    for dir in &config.backup_dirs {
        let Ok(Some(m)) = manifest::latest_manifest(dir) else {
            continue;
        };
        let duration = (m.finished_at - m.started_at)
            .to_std()
            .unwrap_or_default();
        println!("  Directory: {}", dir.display());
        println!("    Run:      {}", m.run_id);
        println!("    Mode:     {}", m.mode);
        println!(
            "    Duration: {}",
            humantime::format_duration(std::time::Duration::from_secs(duration.as_secs()))
        );
        println!(
            "    Copied:   {} files",
            m.count(manifest::FileStatus::Copied)
        );
        println!(
            "    Skipped:  {} files",
            m.count(manifest::FileStatus::Skipped)
        );
        println!(
            "    Failed:   {} files",
            m.count(manifest::FileStatus::Failed)
        );
        println!("    Size:     {}", format_bytes(m.total_bytes()));
        return;
    }
    println!("  No manifests found");
}

fn print_setup(config: &BackupConfig) {
    fn mask(value: &Option<String>) -> String {
        match value {
            Some(_) => "*****".to_string(),
            None => "Not Set".to_string(),
        }
    }
    fn or_not_set(value: &Option<String>) -> String {
        value.clone().unwrap_or_else(|| "Not Set".to_string())
    }

    println!("Current Configuration:\n");
    println!("DEFAULT:");
    println!(
        "  Source Directory : {}",
        config
            .source_dir
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "Not Set".into())
    );
    println!("  Mode             : {}", config.mode);
    println!(
        "  Exclude Patterns : {}",
        if config.exclude_patterns.is_empty() {
            "None".to_string()
        } else {
            config.exclude_patterns.join(", ")
        }
    );
    println!("  Parallel Copies  : {}\n", config.parallel_copies);

    println!("BACKUPS:");
    println!(
        "  Backup Directories: {}\n",
        config
            .backup_dirs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    println!("SSH:");
    println!(
        "  Servers          : {}",
        if config.ssh.servers.is_empty() {
            "Not Set".to_string()
        } else {
            config.ssh.servers.join(", ")
        }
    );
    println!("  Username         : {}", or_not_set(&config.ssh.username));
    println!("  Password         : {}", mask(&config.ssh.password));
    println!(
        "  Bandwidth Limit  : {}\n",
        if config.ssh.bandwidth_limit_kbps == 0 {
            "Unlimited".to_string()
        } else {
            format!("{} KB/s", config.ssh.bandwidth_limit_kbps)
        }
    );

    println!("S3:");
    println!("  Bucket : {}", or_not_set(&config.s3.bucket));
    println!(
        "  Prefix : {}",
        if config.s3.prefix.is_empty() {
            "/"
        } else {
            &config.s3.prefix
        }
    );
    println!("  Region : {}\n", or_not_set(&config.s3.region));

    println!("SCHEDULE:");
    println!(
        "  Times          : {}",
        if config.schedule.times.is_empty() {
            "Not Set".to_string()
        } else {
            config.schedule.times.join(", ")
        }
    );
    println!("  Interval (min) : {}\n", config.schedule.interval_minutes);

    println!("MODES:");
    println!("  Local : {}", enabled(config.modes.local));
    println!("  SSH   : {}", enabled(config.modes.ssh));
    println!("  S3    : {}", enabled(config.modes.s3));
    println!("  DB    : {}\n", enabled(config.modes.db));

    println!("HOOKS:");
    println!("  Pre-Backup  : {}", or_not_set(&config.hooks.pre_backup));
    println!("  Post-Backup : {}\n", or_not_set(&config.hooks.post_backup));

    println!("RETENTION:");
    println!(
        "  Max Age (days) : {}",
        if config.retention.max_age_days == 0 {
            "Disabled".to_string()
        } else {
            config.retention.max_age_days.to_string()
        }
    );
    println!(
        "  Max Count      : {}\n",
        if config.retention.max_count == 0 {
            "Unlimited".to_string()
        } else {
            config.retention.max_count.to_string()
        }
    );

    println!("ENCRYPTION:");
    println!("  Enabled    : {}", enabled(config.encryption.enabled));
    println!(
        "  Key File   : {}",
        config
            .encryption
            .key_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "Not Set".into())
    );
    println!(
        "  Passphrase : {}\n",
        mask(&config.encryption.passphrase)
    );

    println!("DATABASE:");
    println!("  User     : {}", or_not_set(&config.database.user));
    println!("  Password : {}", mask(&config.database.password));
    println!("  Database : {}", or_not_set(&config.database.database));
    println!("  Host     : {}", config.database.host);
    println!("  Port     : {}\n", config.database.port);

    println!("SMTP:");
    println!("  Host : {}", or_not_set(&config.smtp.host));
    println!("  Port : {}", config.smtp.port);
    println!("  From : {}", or_not_set(&config.smtp.from_addr));
    println!("  TLS  : {}\n", enabled(config.smtp.use_tls));

    println!("DEDUP:");
    println!("  Enabled : {}\n", enabled(config.dedup_enabled));

    println!("NOTIFICATIONS:");
    println!("  Bot             : {}", enabled(config.notifications.bot));
    println!(
        "  Receiver Emails : {}\n",
        if config.notifications.receiver_emails.is_empty() {
            "Disabled".to_string()
        } else {
            config.notifications.receiver_emails.join(", ")
        }
    );
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "Enabled"
    } else {
        "Disabled"
    }
}
