//! Content-addressed hardlink deduplication
//!
//! After encryption, files across all local destinations are grouped by
//! content hash and every group member beyond a chosen canonical file is
//! replaced with a hardlink to it. The canonical file is the
//! lexicographically smallest absolute path in the group.
//!
//! Hashes come from the run manifests where possible, which is what lets
//! encrypted siblings dedup: two `.enc` envelopes with different salts
//! share no bytes, but their manifest rows carry the same plaintext
//! SHA-256. Files not covered by any manifest are hashed on demand;
//! manifests themselves and unreferenced `.enc` files are never dedup
//! candidates.
//!
//! Hardlinks only work within one filesystem. Destinations are grouped by
//! device id first, and a group spanning devices degrades silently to
//! per-device dedup. Replacement is atomic: link to a temp name, then
//! rename over the duplicate.

use crate::encryption;
use crate::error::Result;
use crate::manifest::{self, FileStatus};
use crate::utils;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

/// Outcome of the dedup stage
#[derive(Debug, Default, Clone)]
pub struct DedupStats {
    /// Files considered for deduplication
    pub files_scanned: usize,
    /// Duplicates replaced with hardlinks
    pub duplicates_linked: usize,
    /// Bytes reclaimed
    pub bytes_saved: u64,
}

/// Deduplicate files across local destination roots
///
/// `manifest_hashes` maps absolute stored paths to their plaintext
/// SHA-256 as recorded in the run manifests.
pub fn deduplicate_destinations(
    roots: &[PathBuf],
    manifest_hashes: &HashMap<PathBuf, String>,
) -> Result<DedupStats> {
    let mut stats = DedupStats::default();

    // Hardlinks cannot cross filesystems; group roots by device first
    let mut device_groups: BTreeMap<u64, Vec<&PathBuf>> = BTreeMap::new();
    for root in roots {
        if !root.is_dir() {
            continue;
        }
        match utils::device_id(root) {
            Some(dev) => device_groups.entry(dev).or_default().push(root),
            None => debug!("No device id for {:?}; skipping dedup there", root),
        }
    }
    if device_groups.len() > 1 {
        debug!(
            "Destinations span {} filesystems; dedup stays within each",
            device_groups.len()
        );
    }

    for (device, group) in device_groups {
        trace!("Dedup pass over device {} ({} roots)", device, group.len());
        let group_stats = dedup_device_group(&group, manifest_hashes)?;
        stats.files_scanned += group_stats.files_scanned;
        stats.duplicates_linked += group_stats.duplicates_linked;
        stats.bytes_saved += group_stats.bytes_saved;
    }

    info!(
        "Dedup: {} files scanned, {} duplicates hardlinked, {} saved",
        stats.files_scanned,
        stats.duplicates_linked,
        utils::format_bytes(stats.bytes_saved)
    );
    Ok(stats)
}

/// Dedup all files of the roots sharing one filesystem
fn dedup_device_group(
    roots: &[&PathBuf],
    manifest_hashes: &HashMap<PathBuf, String>,
) -> Result<DedupStats> {
    let mut stats = DedupStats::default();

    // content hash -> all paths carrying that content, sorted so the
    // canonical pick is deterministic
    let mut groups: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();

    for root in roots {
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let name = entry.file_name().to_string_lossy();
            if manifest::run_id_from_file_name(&name).is_some() {
                continue;
            }
            if entry.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
                continue;
            }

            let hash = match manifest_hashes.get(path) {
                Some(hash) => hash.clone(),
                None if encryption::is_encrypted_name(&name) => {
                    // An envelope with no manifest row cannot be matched
                    // by raw bytes (fresh salt per file)
                    continue;
                }
                None => match utils::hash_file(path) {
                    Ok((hash, _)) => hash,
                    Err(e) => {
                        warn!("Cannot hash {:?}: {}", path, e);
                        continue;
                    }
                },
            };

            stats.files_scanned += 1;
            groups.entry(hash).or_default().push(path.to_path_buf());
        }
    }

    for (hash, mut members) in groups {
        if members.len() < 2 {
            continue;
        }
        members.sort();
        let canonical = members[0].clone();
        let canonical_inode = utils::inode(&canonical);

        for member in &members[1..] {
            if utils::inode(member) == canonical_inode {
                continue;
            }
            let size = fs::metadata(member).map(|m| m.len()).unwrap_or(0);
            match replace_with_hardlink(&canonical, member) {
                Ok(()) => {
                    stats.duplicates_linked += 1;
                    stats.bytes_saved += size;
                    trace!(
                        "Hardlinked {:?} -> {:?} ({})",
                        member,
                        canonical,
                        &hash[..8.min(hash.len())]
                    );
                }
                Err(e) => warn!("Cannot hardlink {:?} to {:?}: {}", member, canonical, e),
            }
        }
    }

    Ok(stats)
}

/// Atomically replace `duplicate` with a hardlink to `canonical`
///
/// The link is created under a temp name and renamed over the duplicate,
/// so readers always observe either the old bytes or the canonical bytes.
fn replace_with_hardlink(canonical: &Path, duplicate: &Path) -> Result<()> {
    let temp = utils::temp_sibling(duplicate);
    if temp.exists() {
        fs::remove_file(&temp)?;
    }
    fs::hard_link(canonical, &temp)?;
    if let Err(e) = fs::rename(&temp, duplicate) {
        let _ = fs::remove_file(&temp);
        return Err(e.into());
    }

    // The swap must never change observable content
    debug_assert_eq!(utils::inode(canonical), utils::inode(duplicate));
    Ok(())
}

/// Build the stored-path -> plaintext-hash map the dedup stage consumes
pub fn manifest_hash_index(
    roots: &[PathBuf],
) -> Result<HashMap<PathBuf, String>> {
    let mut index = HashMap::new();
    for root in roots {
        for path in manifest::list_manifests(root)? {
            let m = match manifest::Manifest::load(&path) {
                Ok(m) => m,
                Err(e) => {
                    warn!("Skipping unreadable manifest {:?}: {}", path, e);
                    continue;
                }
            };
            for entry in &m.files {
                if entry.status != FileStatus::Copied || entry.sha256.is_empty() {
                    continue;
                }
                index.insert(root.join(&entry.stored_path), entry.sha256.clone());
            }
        }
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Manifest, ManifestEntry};
    use crate::types::{BackupMode, RunId};
    use chrono::Local;
    use tempfile::TempDir;

    fn inode_of(path: &Path) -> u64 {
        utils::inode(path).unwrap()
    }

    #[test]
    fn test_dedup_within_directory() {
        let dir = TempDir::new().unwrap();
        let content = vec![42u8; 4096];
        fs::write(dir.path().join("x"), &content).unwrap();
        fs::write(dir.path().join("y"), &content).unwrap();
        fs::write(dir.path().join("z"), b"different").unwrap();

        let stats =
            deduplicate_destinations(&[dir.path().to_path_buf()], &HashMap::new()).unwrap();
        assert_eq!(stats.duplicates_linked, 1);
        assert_eq!(stats.bytes_saved, 4096);
        assert_eq!(inode_of(&dir.path().join("x")), inode_of(&dir.path().join("y")));
        assert_ne!(inode_of(&dir.path().join("x")), inode_of(&dir.path().join("z")));

        // Content is unchanged
        assert_eq!(fs::read(dir.path().join("y")).unwrap(), content);
    }

    #[test]
    fn test_dedup_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let content = vec![1u8; 1024];
        fs::write(dir.path().join("a"), &content).unwrap();
        fs::write(dir.path().join("b"), &content).unwrap();

        deduplicate_destinations(&[dir.path().to_path_buf()], &HashMap::new()).unwrap();
        let stats =
            deduplicate_destinations(&[dir.path().to_path_buf()], &HashMap::new()).unwrap();
        assert_eq!(stats.duplicates_linked, 0);
    }

    #[test]
    fn test_manifests_never_deduped() {
        let dir = TempDir::new().unwrap();
        let content = b"{\"same\": true}";
        fs::write(dir.path().join("backup_manifest_20260101_000000.json"), content).unwrap();
        fs::write(dir.path().join("backup_manifest_20260102_000000.json"), content).unwrap();

        let stats =
            deduplicate_destinations(&[dir.path().to_path_buf()], &HashMap::new()).unwrap();
        assert_eq!(stats.duplicates_linked, 0);
    }

    #[test]
    fn test_encrypted_siblings_dedup_via_manifest_hashes() {
        let dir = TempDir::new().unwrap();
        // Envelopes differ byte-wise (distinct salt and nonce) but share
        // a plaintext hash in the manifest
        fs::write(dir.path().join("x.enc"), vec![1u8; 256]).unwrap();
        fs::write(dir.path().join("y.enc"), vec![2u8; 256]).unwrap();

        let mut hashes = HashMap::new();
        let shared = "ab".repeat(32);
        hashes.insert(dir.path().join("x.enc"), shared.clone());
        hashes.insert(dir.path().join("y.enc"), shared);

        let stats = deduplicate_destinations(&[dir.path().to_path_buf()], &hashes).unwrap();
        assert_eq!(stats.duplicates_linked, 1);
        assert_eq!(inode_of(&dir.path().join("x.enc")), inode_of(&dir.path().join("y.enc")));
    }

    #[test]
    fn test_unreferenced_envelopes_are_not_candidates() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.enc"), vec![9u8; 64]).unwrap();
        fs::write(dir.path().join("b.enc"), vec![9u8; 64]).unwrap();

        let stats =
            deduplicate_destinations(&[dir.path().to_path_buf()], &HashMap::new()).unwrap();
        assert_eq!(stats.duplicates_linked, 0);
    }

    #[test]
    fn test_cross_directory_dedup_same_filesystem() {
        let parent = TempDir::new().unwrap();
        let dir_a = parent.path().join("a");
        let dir_b = parent.path().join("b");
        fs::create_dir_all(&dir_a).unwrap();
        fs::create_dir_all(&dir_b).unwrap();
        let content = vec![7u8; 2048];
        fs::write(dir_a.join("f"), &content).unwrap();
        fs::write(dir_b.join("f"), &content).unwrap();

        let stats = deduplicate_destinations(&[dir_a.clone(), dir_b.clone()], &HashMap::new())
            .unwrap();
        assert_eq!(stats.duplicates_linked, 1);
        assert_eq!(inode_of(&dir_a.join("f")), inode_of(&dir_b.join("f")));
    }

    #[test]
    fn test_manifest_hash_index() {
        let dir = TempDir::new().unwrap();
        let mut m = Manifest::new(
            RunId::parse("20260101_000000").unwrap(),
            BackupMode::Full,
            PathBuf::from("/src"),
            dir.path().to_path_buf(),
            Local::now(),
        );
        m.files.push(ManifestEntry::copied(
            "f.bin".into(),
            "f.bin.enc".into(),
            3,
            "cafe".into(),
        ));
        m.files.push(ManifestEntry::failed("g.bin".into(), "io"));
        m.save(dir.path()).unwrap();

        let index = manifest_hash_index(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(index.get(&dir.path().join("f.bin.enc")).unwrap(), "cafe");
        assert_eq!(index.len(), 1);
    }
}
