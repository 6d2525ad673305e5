//! Configuration loading and validation
//!
//! Configuration lives in a sectioned INI file (`DEFAULT`, `BACKUPS`,
//! `SSH`, `S3`, `ENCRYPTION`, `DATABASE`, `SMTP`, `DEDUP`, `SCHEDULE`,
//! `MODES`, `HOOKS`, `RETENTION`, `NOTIFICATIONS`). Any value of the form
//! `${NAME}` is replaced with the environment variable `NAME` at load
//! time; an unresolved reference aborts startup.
//!
//! The loaded [`BackupConfig`] is an immutable snapshot: the orchestrator
//! captures it once at run start and passes it explicitly to each stage.
//! There is no process-wide mutable configuration holder.

use crate::error::{BackupError, Result};
use crate::types::BackupMode;
use configparser::ini::Ini;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Archive compression requested for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressType {
    /// No archive; files are copied individually
    None,
    /// Single plain ZIP archive of the source
    Zip,
    /// Single password-protected ZIP archive; the password is generated
    /// per run and delivered out-of-band
    ZipPw,
}

impl CompressType {
    /// Parse the config/CLI spelling (`none` / `zip` / `zip_pw`)
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(CompressType::None),
            "zip" => Ok(CompressType::Zip),
            "zip_pw" => Ok(CompressType::ZipPw),
            other => Err(BackupError::config(format!(
                "compress_type must be one of none, zip, zip_pw, got '{other}'"
            ))),
        }
    }

    /// Whether any archive is produced
    pub fn is_enabled(&self) -> bool {
        !matches!(self, CompressType::None)
    }
}

/// Which destination kinds are enabled ([MODES])
#[derive(Debug, Clone, Copy, Default)]
pub struct ModesConfig {
    /// Copy to local backup directories
    pub local: bool,
    /// Upload to SSH/SFTP servers
    pub ssh: bool,
    /// Upload to the object-store bucket
    pub s3: bool,
    /// Produce a database dump artifact
    pub db: bool,
}

/// SSH/SFTP destination settings ([SSH])
#[derive(Debug, Clone, Default)]
pub struct SshConfig {
    /// Remote hosts to mirror to
    pub servers: Vec<String>,
    /// Username used for every host
    pub username: Option<String>,
    /// Password authentication (used when no key file is set)
    pub password: Option<String>,
    /// Private-key authentication (takes precedence over password)
    pub key_file: Option<PathBuf>,
    /// Upload throttle in KB/s, 0 = unlimited
    pub bandwidth_limit_kbps: u64,
}

/// Object-store destination settings ([S3])
#[derive(Debug, Clone, Default)]
pub struct S3Config {
    /// Bucket name
    pub bucket: Option<String>,
    /// Key prefix acting as the destination root
    pub prefix: String,
    /// Bucket region
    pub region: Option<String>,
    /// Static access key; environment credentials are used when unset
    pub access_key: Option<String>,
    /// Static secret key
    pub secret_key: Option<String>,
}

/// Encryption-at-rest settings ([ENCRYPTION])
#[derive(Debug, Clone, Default)]
pub struct EncryptionConfig {
    /// Whether the post-copy encryption stage runs
    pub enabled: bool,
    /// 32-byte key file (beats the passphrase when both are set)
    pub key_file: Option<PathBuf>,
    /// Passphrase for PBKDF2 key derivation
    pub passphrase: Option<String>,
}

/// Database dump settings ([DATABASE])
#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    /// Database user
    pub user: Option<String>,
    /// Database password (passed to the dump tool via environment)
    pub password: Option<String>,
    /// Database name
    pub database: Option<String>,
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

/// Outbound mail settings ([SMTP]); consumed by the notification layer
#[derive(Debug, Clone, Default)]
pub struct SmtpConfig {
    /// SMTP server host
    pub host: Option<String>,
    /// SMTP server port
    pub port: u16,
    /// Login user
    pub user: Option<String>,
    /// Login password
    pub password: Option<String>,
    /// From address
    pub from_addr: Option<String>,
    /// Default recipients
    pub to_addrs: Vec<String>,
    /// Whether to use STARTTLS
    pub use_tls: bool,
}

/// Scheduled operation settings ([SCHEDULE])
#[derive(Debug, Clone, Default)]
pub struct ScheduleConfig {
    /// Wall-clock fire times, `HH:MM`
    pub times: Vec<String>,
    /// Tolerance window around each slot, in minutes
    pub interval_minutes: u32,
}

/// Pre/post hook commands ([HOOKS])
#[derive(Debug, Clone, Default)]
pub struct HooksConfig {
    /// Shell command run before selection; non-zero exit aborts the run
    pub pre_backup: Option<String>,
    /// Shell command run after the run regardless of outcome
    pub post_backup: Option<String>,
}

/// Retention rules ([RETENTION]); both zero disables pruning
#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionConfig {
    /// Delete runs older than this many days (0 = disabled)
    pub max_age_days: u32,
    /// Keep only this many newest runs (0 = unlimited)
    pub max_count: usize,
}

/// Notification settings ([NOTIFICATIONS])
///
/// `receiver_emails = None` and an empty list are treated identically as
/// "email notifications disabled".
#[derive(Debug, Clone, Default)]
pub struct NotificationsConfig {
    /// Whether the chat-bot transport is enabled
    pub bot: bool,
    /// Email recipients; empty = disabled
    pub receiver_emails: Vec<String>,
}

/// Immutable configuration snapshot for one run
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Source directory to back up
    pub source_dir: Option<PathBuf>,
    /// Selection policy
    pub mode: BackupMode,
    /// Archive compression
    pub compress: CompressType,
    /// Local backup directories
    pub backup_dirs: Vec<PathBuf>,
    /// Glob patterns excluded from selection
    pub exclude_patterns: Vec<String>,
    /// Bound on concurrent local file copies
    pub parallel_copies: usize,
    /// Enabled destination kinds
    pub modes: ModesConfig,
    /// SSH settings
    pub ssh: SshConfig,
    /// Object-store settings
    pub s3: S3Config,
    /// Encryption settings
    pub encryption: EncryptionConfig,
    /// Database dump settings
    pub database: DatabaseConfig,
    /// Mail settings
    pub smtp: SmtpConfig,
    /// Whether the dedup stage runs
    pub dedup_enabled: bool,
    /// Schedule settings
    pub schedule: ScheduleConfig,
    /// Hook commands
    pub hooks: HooksConfig,
    /// Retention rules
    pub retention: RetentionConfig,
    /// Notification settings
    pub notifications: NotificationsConfig,
}

impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig {
            source_dir: None,
            mode: BackupMode::Full,
            compress: CompressType::None,
            backup_dirs: Vec::new(),
            exclude_patterns: Vec::new(),
            parallel_copies: 1,
            modes: ModesConfig::default(),
            ssh: SshConfig::default(),
            s3: S3Config::default(),
            encryption: EncryptionConfig::default(),
            database: DatabaseConfig {
                host: "localhost".to_string(),
                port: 3306,
                ..Default::default()
            },
            smtp: SmtpConfig {
                port: 587,
                use_tls: true,
                ..Default::default()
            },
            dedup_enabled: false,
            schedule: ScheduleConfig {
                times: Vec::new(),
                interval_minutes: 1,
            },
            hooks: HooksConfig::default(),
            retention: RetentionConfig::default(),
            notifications: NotificationsConfig::default(),
        }
    }
}

impl BackupConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let config = Self::load_unvalidated(path)?;
        config.validate(false)?;
        Ok(config)
    }

    /// Load and validate, additionally requiring a usable schedule
    pub fn load_for_schedule(path: &Path) -> Result<Self> {
        let config = Self::load_unvalidated(path)?;
        config.validate(true)?;
        Ok(config)
    }

    /// Load without validation (for `--show-setup` and `--status`, so
    /// incomplete configs can still be inspected)
    pub fn load_unvalidated(path: &Path) -> Result<Self> {
        let mut ini = Ini::new();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| BackupError::config(format!("cannot read config {path:?}: {e}")))?;
        ini.read(raw)
            .map_err(|e| BackupError::config(format!("cannot parse config {path:?}: {e}")))?;

        resolve_env_refs(&mut ini)?;
        info!("Configuration loaded from {:?}", path);
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self> {
        let mut config = BackupConfig::default();

        config.source_dir = get_opt(ini, "default", "source_dir").map(PathBuf::from);
        if let Some(mode) = get_opt(ini, "default", "mode") {
            config.mode = BackupMode::parse(&mode)?;
        }
        if let Some(compress) = get_opt(ini, "default", "compress_type") {
            config.compress = CompressType::parse(&compress)?;
        }
        config.exclude_patterns = get_list(ini, "default", "exclude_patterns");
        config.parallel_copies = get_uint(ini, "default", "parallel_copies")?
            .map(|n| (n as usize).max(1))
            .unwrap_or(1);

        config.backup_dirs = get_list(ini, "backups", "backup_dirs")
            .into_iter()
            .map(PathBuf::from)
            .collect();

        config.modes = ModesConfig {
            local: get_bool(ini, "modes", "local")?.unwrap_or(false),
            ssh: get_bool(ini, "modes", "ssh")?.unwrap_or(false),
            s3: get_bool(ini, "modes", "s3")?.unwrap_or(false),
            db: get_bool(ini, "modes", "db")?.unwrap_or(false),
        };

        config.ssh = SshConfig {
            servers: get_list(ini, "ssh", "ssh_servers"),
            username: get_opt(ini, "ssh", "username"),
            password: get_opt(ini, "ssh", "password"),
            key_file: get_opt(ini, "ssh", "key_file").map(PathBuf::from),
            bandwidth_limit_kbps: get_uint(ini, "ssh", "bandwidth_limit")?.unwrap_or(0),
        };

        config.s3 = S3Config {
            bucket: get_opt(ini, "s3", "bucket"),
            prefix: get_opt(ini, "s3", "prefix").unwrap_or_default(),
            region: get_opt(ini, "s3", "region"),
            access_key: get_opt(ini, "s3", "access_key"),
            secret_key: get_opt(ini, "s3", "secret_key"),
        };

        config.encryption = EncryptionConfig {
            enabled: get_bool(ini, "encryption", "enabled")?.unwrap_or(false),
            key_file: get_opt(ini, "encryption", "key_file").map(PathBuf::from),
            passphrase: get_opt(ini, "encryption", "passphrase"),
        };

        config.database = DatabaseConfig {
            user: get_opt(ini, "database", "user"),
            password: get_opt(ini, "database", "password"),
            database: get_opt(ini, "database", "database"),
            host: get_opt(ini, "database", "host").unwrap_or_else(|| "localhost".to_string()),
            port: get_uint(ini, "database", "port")?.map(|p| p as u16).unwrap_or(3306),
        };

        config.smtp = SmtpConfig {
            host: get_opt(ini, "smtp", "host"),
            port: get_uint(ini, "smtp", "port")?.map(|p| p as u16).unwrap_or(587),
            user: get_opt(ini, "smtp", "user"),
            password: get_opt(ini, "smtp", "password"),
            from_addr: get_opt(ini, "smtp", "from_addr"),
            to_addrs: get_list(ini, "smtp", "to_addrs"),
            use_tls: get_bool(ini, "smtp", "use_tls")?.unwrap_or(true),
        };

        config.dedup_enabled = get_bool(ini, "dedup", "enabled")?.unwrap_or(false);

        config.schedule = ScheduleConfig {
            times: get_list(ini, "schedule", "times"),
            interval_minutes: get_uint(ini, "schedule", "interval_minutes")?
                .map(|n| n as u32)
                .unwrap_or(1),
        };

        config.hooks = HooksConfig {
            pre_backup: get_opt(ini, "hooks", "pre_backup"),
            post_backup: get_opt(ini, "hooks", "post_backup"),
        };

        config.retention = RetentionConfig {
            max_age_days: get_uint(ini, "retention", "max_age_days")?
                .map(|n| n as u32)
                .unwrap_or(0),
            max_count: get_uint(ini, "retention", "max_count")?
                .map(|n| n as usize)
                .unwrap_or(0),
        };

        config.notifications = NotificationsConfig {
            bot: get_bool(ini, "notifications", "bot")?.unwrap_or(false),
            receiver_emails: get_list(ini, "notifications", "receiver_emails"),
        };

        Ok(config)
    }

    /// Validate the snapshot, collecting every problem before failing
    pub fn validate(&self, require_schedule: bool) -> Result<()> {
        let mut errors = Vec::new();

        if self.source_dir.is_none() {
            errors.push("'source_dir' is not set in [DEFAULT]".to_string());
        }

        if self.modes.local && self.backup_dirs.is_empty() {
            errors.push("'backup_dirs' is not set in [BACKUPS] (required when local mode is enabled)".to_string());
        }

        if self.modes.ssh {
            if self.ssh.servers.is_empty() {
                errors.push("'ssh_servers' is not set in [SSH] (required when ssh mode is enabled)".to_string());
            }
            if self.ssh.username.is_none() {
                errors.push("'username' is not set in [SSH] (required when ssh mode is enabled)".to_string());
            }
            if self.ssh.password.is_none() && self.ssh.key_file.is_none() {
                errors.push("neither 'password' nor 'key_file' is set in [SSH] (one is required when ssh mode is enabled)".to_string());
            }
        }

        if self.modes.s3 {
            if self.s3.bucket.is_none() {
                errors.push("'bucket' is not set in [S3] (required when s3 mode is enabled)".to_string());
            }
            if self.s3.region.is_none() {
                errors.push("'region' is not set in [S3] (required when s3 mode is enabled)".to_string());
            }
        }

        if self.encryption.enabled
            && self.encryption.key_file.is_none()
            && self.encryption.passphrase.is_none()
        {
            errors.push("[ENCRYPTION] is enabled but neither 'key_file' nor 'passphrase' is set".to_string());
        }

        if self.modes.db {
            if self.database.user.is_none() {
                errors.push("'user' is not set in [DATABASE] (required when db mode is enabled)".to_string());
            }
            if self.database.password.is_none() {
                errors.push("'password' is not set in [DATABASE] (required when db mode is enabled)".to_string());
            }
            if self.database.database.is_none() {
                errors.push("'database' is not set in [DATABASE] (required when db mode is enabled)".to_string());
            }
        }

        for email in &self.notifications.receiver_emails {
            if !is_valid_email(email) {
                errors.push(format!(
                    "invalid email address '{email}' in [NOTIFICATIONS].receiver_emails"
                ));
            }
        }

        if require_schedule {
            if self.schedule.times.is_empty() {
                errors.push("'times' is not set in [SCHEDULE] (required for --scheduled mode)".to_string());
            }
            for t in &self.schedule.times {
                if chrono::NaiveTime::parse_from_str(t, "%H:%M").is_err() {
                    errors.push(format!(
                        "invalid time format '{t}' in [SCHEDULE], use HH:MM (24-hour)"
                    ));
                }
            }
            if self.schedule.interval_minutes == 0 {
                errors.push("'interval_minutes' in [SCHEDULE] must be a positive integer".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(BackupError::config(errors.join("; ")))
        }
    }
}

/// Resolve `${NAME}` references in every section against the environment
fn resolve_env_refs(ini: &mut Ini) -> Result<()> {
    let map = ini.get_map().unwrap_or_default();
    for (section, keys) in map {
        for (key, value) in keys {
            let Some(value) = value else { continue };
            if value.contains("${") {
                let resolved = expand_env(&value)?;
                debug!("Resolved env var in [{}].{}", section, key);
                ini.set(&section, &key, Some(resolved));
            }
        }
    }
    Ok(())
}

/// Expand every `${NAME}` in a single value
fn expand_env(value: &str) -> Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // No closing brace: keep the literal text
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let name = &after[..end];
        match std::env::var(name) {
            Ok(v) => out.push_str(&v),
            Err(_) => {
                return Err(BackupError::UnresolvedEnvVar {
                    name: name.to_string(),
                })
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Minimal shape check for email addresses
pub fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.is_empty() {
        return false;
    }
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    !host.is_empty()
        && tld.len() >= 2
        && tld.chars().all(|c| c.is_ascii_alphabetic())
        && !domain.contains("..")
}

/// Fetch a value, mapping `None`, empty and the literal "None" to absent
fn get_opt(ini: &Ini, section: &str, key: &str) -> Option<String> {
    let value = ini.get(section, key)?;
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Fetch a comma-separated list, dropping empty items
fn get_list(ini: &Ini, section: &str, key: &str) -> Vec<String> {
    get_opt(ini, section, key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Fetch an unsigned integer
fn get_uint(ini: &Ini, section: &str, key: &str) -> Result<Option<u64>> {
    match get_opt(ini, section, key) {
        None => Ok(None),
        Some(v) => v.parse::<u64>().map(Some).map_err(|_| {
            BackupError::config(format!(
                "'{key}' in [{}] must be a non-negative integer, got '{v}'",
                section.to_uppercase()
            ))
        }),
    }
}

/// Fetch a boolean (`True`/`False`, case-insensitive)
fn get_bool(ini: &Ini, section: &str, key: &str) -> Result<Option<bool>> {
    match get_opt(ini, section, key) {
        None => Ok(None),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(Some(true)),
            "false" | "no" | "0" => Ok(Some(false)),
            other => Err(BackupError::config(format!(
                "'{key}' in [{}] must be True or False, got '{other}'",
                section.to_uppercase()
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_minimal_config() {
        let file = write_config(
            "[DEFAULT]\nsource_dir = /data\nmode = incremental\n\
             [BACKUPS]\nbackup_dirs = /backup/a, /backup/b\n\
             [MODES]\nlocal = True\n",
        );
        let config = BackupConfig::load(file.path()).unwrap();
        assert_eq!(config.source_dir, Some(PathBuf::from("/data")));
        assert_eq!(config.mode, BackupMode::Incremental);
        assert_eq!(config.backup_dirs.len(), 2);
        assert!(config.modes.local);
        assert!(!config.modes.ssh);
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("COFFER_TEST_BUCKET", "my-bucket");
        let file = write_config(
            "[DEFAULT]\nsource_dir = /data\n\
             [BACKUPS]\nbackup_dirs = /backup\n\
             [MODES]\nlocal = True\ns3 = True\n\
             [S3]\nbucket = ${COFFER_TEST_BUCKET}\nregion = eu-central-1\n",
        );
        let config = BackupConfig::load(file.path()).unwrap();
        assert_eq!(config.s3.bucket.as_deref(), Some("my-bucket"));
    }

    #[test]
    fn test_unresolved_env_aborts() {
        let file = write_config(
            "[DEFAULT]\nsource_dir = ${COFFER_TEST_DOES_NOT_EXIST}\n\
             [BACKUPS]\nbackup_dirs = /backup\n",
        );
        let err = BackupConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, BackupError::UnresolvedEnvVar { .. }));
    }

    #[test]
    fn test_validation_collects_errors() {
        let file = write_config("[MODES]\nssh = True\n[SSH]\n");
        let err = BackupConfig::load(file.path()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("source_dir"));
        assert!(msg.contains("ssh_servers"));
        assert!(msg.contains("username"));
    }

    #[test]
    fn test_none_sentinel_equals_empty() {
        let file = write_config(
            "[DEFAULT]\nsource_dir = /data\n\
             [BACKUPS]\nbackup_dirs = /backup\n\
             [MODES]\nlocal = True\n\
             [NOTIFICATIONS]\nreceiver_emails = None\n",
        );
        let config = BackupConfig::load(file.path()).unwrap();
        assert!(config.notifications.receiver_emails.is_empty());
    }

    #[test]
    fn test_schedule_validation() {
        let file = write_config(
            "[DEFAULT]\nsource_dir = /data\n\
             [BACKUPS]\nbackup_dirs = /backup\n\
             [MODES]\nlocal = True\n\
             [SCHEDULE]\ntimes = 02:30, 26:00\ninterval_minutes = 5\n",
        );
        let err = BackupConfig::load_for_schedule(file.path()).unwrap_err();
        assert!(err.to_string().contains("26:00"));
    }

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("ops@example.com"));
        assert!(!is_valid_email("not-an-email"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("a@.com"));
    }

    #[test]
    fn test_expand_env_keeps_unclosed_braces() {
        assert_eq!(expand_env("plain").unwrap(), "plain");
        assert_eq!(expand_env("has ${ only").unwrap(), "has ${ only");
    }
}
