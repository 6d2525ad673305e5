//! Per-file encryption at rest
//!
//! Files are wrapped in a fixed envelope: 16 bytes of salt, 12 bytes of
//! nonce, then the AES-256-GCM ciphertext with its 16-byte tag at the
//! end, no framing. The key comes either from a 32-byte key file or is
//! derived from a passphrase with PBKDF2-HMAC-SHA256 at 600,000
//! iterations over the envelope's salt; the key file wins when both are
//! configured. In key-file mode the salt bytes are written as zeros and
//! ignored on decrypt.
//!
//! The stage runs after the manifest is written and only against local
//! destinations. Each file is encrypted to a temp sibling and renamed, so
//! partial encryption is never committed; the plaintext is removed only
//! after the rename lands. Manifests keep the plaintext SHA-256 and the
//! pre-encryption size.

use crate::config::EncryptionConfig;
use crate::error::{BackupError, Result};
use crate::manifest::{self, Manifest};
use crate::utils;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

/// PBKDF2-HMAC-SHA256 iteration count
pub const PBKDF2_ITERATIONS: u32 = 600_000;
/// Envelope salt length
pub const SALT_LEN: usize = 16;
/// Envelope nonce length
pub const NONCE_LEN: usize = 12;
/// AES-256 key length
pub const KEY_LEN: usize = 32;
/// Suffix of encrypted siblings
pub const ENC_SUFFIX: &str = ".enc";

/// Where the run's key material comes from
#[derive(Clone)]
pub enum KeySource {
    /// Raw 32-byte key read from a file (beats the passphrase)
    KeyFile(PathBuf),
    /// Passphrase for per-file PBKDF2 derivation
    Passphrase(String),
}

impl std::fmt::Debug for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            KeySource::Passphrase(_) => write!(f, "Passphrase(*****)"),
        }
    }
}

impl KeySource {
    /// Build the run's key source from config
    ///
    /// Returns `None` when encryption is disabled and an error when it is
    /// enabled without any key material.
    pub fn from_config(config: &EncryptionConfig) -> Result<Option<KeySource>> {
        if !config.enabled {
            return Ok(None);
        }
        if let Some(key_file) = &config.key_file {
            return Ok(Some(KeySource::KeyFile(key_file.clone())));
        }
        if let Some(passphrase) = &config.passphrase {
            return Ok(Some(KeySource::Passphrase(passphrase.clone())));
        }
        Err(BackupError::KeyMaterial(
            "[ENCRYPTION] is enabled but neither 'key_file' nor 'passphrase' is set".to_string(),
        ))
    }

    /// Resolve the material once per run, failing fast on a bad key file
    pub fn materialize(&self) -> Result<RunKey> {
        match self {
            KeySource::KeyFile(path) => Ok(RunKey::Raw(load_key_file(path)?)),
            KeySource::Passphrase(passphrase) => Ok(RunKey::Passphrase(passphrase.clone())),
        }
    }
}

/// Key material resolved for one run
pub enum RunKey {
    /// Fixed raw key; envelopes carry a zero salt placeholder
    Raw([u8; KEY_LEN]),
    /// Derive per file from the envelope salt
    Passphrase(String),
}

impl RunKey {
    fn key_for_salt(&self, salt: &[u8]) -> [u8; KEY_LEN] {
        match self {
            RunKey::Raw(key) => *key,
            RunKey::Passphrase(passphrase) => derive_key(passphrase, salt),
        }
    }

    fn fresh_salt(&self) -> [u8; SALT_LEN] {
        match self {
            RunKey::Raw(_) => [0u8; SALT_LEN],
            RunKey::Passphrase(_) => {
                let mut salt = [0u8; SALT_LEN];
                rand::rngs::OsRng.fill_bytes(&mut salt);
                salt
            }
        }
    }
}

/// Read a raw 32-byte key from a file
pub fn load_key_file(path: &Path) -> Result<[u8; KEY_LEN]> {
    let data = fs::read(path)
        .map_err(|e| BackupError::KeyMaterial(format!("cannot read key file {path:?}: {e}")))?;
    if data.len() != KEY_LEN {
        return Err(BackupError::KeyMaterial(format!(
            "key file {path:?} must be exactly {KEY_LEN} bytes, got {}",
            data.len()
        )));
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&data);
    Ok(key)
}

/// Derive a 32-byte AES key from a passphrase and salt
pub fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<sha2::Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Whether a file name denotes an encrypted sibling
pub fn is_encrypted_name(name: &str) -> bool {
    name.ends_with(ENC_SUFFIX)
}

/// Encrypt one file in place, producing `<name>.enc`
///
/// The envelope is written to a temp sibling and renamed before the
/// plaintext is removed, so a crash leaves either the plaintext or a
/// complete envelope, never a torn file.
pub fn encrypt_file(path: &Path, run_key: &RunKey) -> Result<PathBuf> {
    let plaintext = fs::read(path)?;

    let salt = run_key.fresh_salt();
    let key = run_key.key_for_salt(&salt);
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_ref())
        .map_err(|_| BackupError::Crypto {
            path: path.to_path_buf(),
            reason: "AES-GCM encryption failed".to_string(),
        })?;

    let mut envelope = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    envelope.extend_from_slice(&salt);
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&ciphertext);

    let enc_path = enc_sibling(path);
    utils::atomic_write(&enc_path, &envelope)?;
    fs::remove_file(path)?;
    trace!("Encrypted {:?} -> {:?}", path, enc_path);
    Ok(enc_path)
}

/// Decrypt an envelope to an explicit output path (source left intact)
pub fn decrypt_to(enc_path: &Path, out_path: &Path, run_key: &RunKey) -> Result<()> {
    let data = fs::read(enc_path)?;
    if data.len() < SALT_LEN + NONCE_LEN {
        return Err(BackupError::Crypto {
            path: enc_path.to_path_buf(),
            reason: format!("envelope too short ({} bytes)", data.len()),
        });
    }
    let (salt, rest) = data.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let key = run_key.key_for_salt(salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| BackupError::Crypto {
            path: enc_path.to_path_buf(),
            reason: "AES-GCM authentication failed (wrong key or corrupted data)".to_string(),
        })?;

    utils::atomic_write(out_path, &plaintext)?;
    Ok(())
}

/// Decrypt an envelope in place, restoring the original name
pub fn decrypt_file(enc_path: &Path, run_key: &RunKey) -> Result<PathBuf> {
    let out_path = strip_enc_suffix(enc_path);
    decrypt_to(enc_path, &out_path, run_key)?;
    fs::remove_file(enc_path)?;
    trace!("Decrypted {:?} -> {:?}", enc_path, out_path);
    Ok(out_path)
}

/// Outcome of the encryption stage at one destination
#[derive(Debug, Default, Clone)]
pub struct EncryptStats {
    /// Files newly encrypted
    pub files_encrypted: usize,
    /// Files skipped because a matching envelope already existed
    pub files_skipped: usize,
    /// Per-file crypto failures (recorded, stage continues)
    pub files_failed: usize,
}

/// Encrypt every eligible file under a local destination root
///
/// Eligible means: a regular file that is neither a manifest nor already
/// an `.enc` envelope. The manifest drives the idempotence check: a file
/// whose plaintext hash matches its manifest row while an `.enc` sibling
/// exists was already handled by a previous (interrupted) run.
///
/// Missing or invalid key material fails the whole destination before
/// any file is touched.
pub fn encrypt_destination(
    root: &Path,
    key_source: &KeySource,
    run_manifest: &Manifest,
) -> Result<EncryptStats> {
    let run_key = key_source.materialize()?;
    let mut stats = EncryptStats::default();

    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let name = entry.file_name().to_string_lossy();
        if manifest::run_id_from_file_name(&name).is_some() || is_encrypted_name(&name) {
            continue;
        }

        let enc_path = enc_sibling(path);
        if enc_path.exists() {
            if envelope_matches_manifest(path, root, run_manifest) {
                debug!("Envelope already present for {:?}, removing plaintext", path);
                if let Err(e) = fs::remove_file(path) {
                    warn!("Cannot remove already-encrypted plaintext {:?}: {}", path, e);
                }
                stats.files_skipped += 1;
                continue;
            }
            // Stale envelope from an older file version; re-encrypt below
        }

        match encrypt_file(path, &run_key) {
            Ok(_) => stats.files_encrypted += 1,
            Err(e) => {
                warn!("Failed to encrypt {:?}: {}", path, e);
                stats.files_failed += 1;
            }
        }
    }

    info!(
        "Encrypted {} files under {:?} ({} skipped, {} failed)",
        stats.files_encrypted, root, stats.files_skipped, stats.files_failed
    );
    Ok(stats)
}

/// Decrypt every `.enc` file under a directory tree (restore helper)
pub fn decrypt_directory(root: &Path, key_source: &KeySource) -> Result<usize> {
    let run_key = key_source.materialize()?;
    let mut decrypted = 0;

    let enc_files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| is_encrypted_name(&e.file_name().to_string_lossy()))
        .map(|e| e.into_path())
        .collect();

    for enc_path in enc_files {
        match decrypt_file(&enc_path, &run_key) {
            Ok(_) => decrypted += 1,
            Err(e) => warn!("Failed to decrypt {:?}: {}", enc_path, e),
        }
    }

    info!("Decrypted {} files under {:?}", decrypted, root);
    Ok(decrypted)
}

fn enc_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(ENC_SUFFIX);
    path.with_file_name(name)
}

fn strip_enc_suffix(enc_path: &Path) -> PathBuf {
    let name = enc_path.file_name().map(|n| n.to_string_lossy().into_owned());
    match name {
        Some(name) if name.ends_with(ENC_SUFFIX) => {
            enc_path.with_file_name(&name[..name.len() - ENC_SUFFIX.len()])
        }
        _ => enc_path.with_extension(""),
    }
}

/// Whether the plaintext at `path` matches its row in the run manifest
fn envelope_matches_manifest(path: &Path, root: &Path, run_manifest: &Manifest) -> bool {
    let Ok(rel) = utils::make_relative(path, root) else {
        return false;
    };
    let rel = crate::types::portable_path(&rel);
    let Some(row) = run_manifest.entry(&rel) else {
        return false;
    };
    match utils::hash_file(path) {
        Ok((hash, _)) => hash == row.sha256,
        Err(_) => false,
    }
}
