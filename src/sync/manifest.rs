//! Workspace manifests: per-file metadata with partial content hashes.
//!
//! Regular files up to 10 MiB carry a SHA-256; larger files are compared
//! by `(size, modTime)` with one second of clock slack. The manifest lives
//! next to the repo on the sandbox and drives the incremental sync diff.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::tarball::IgnoreRules;

pub const MANIFEST_VERSION: u32 = 1;

/// Files larger than this are tracked by size/mtime only.
pub const HASH_SIZE_LIMIT: u64 = 10 * 1024 * 1024;

/// Allowed mtime skew before a file counts as modified.
const MOD_TIME_SLACK_NANOS: i128 = 1_000_000_000;

/// Metadata for one workspace entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    pub path: String,
    pub size: u64,
    /// Nanoseconds since the Unix epoch.
    #[serde(rename = "modTime")]
    pub mod_time: i128,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(rename = "isDir")]
    pub is_dir: bool,
    pub mode: u32,
}

/// The whole workspace, keyed by relative path with `/` separators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceManifest {
    pub version: u32,
    pub generated: DateTime<Utc>,
    #[serde(rename = "rootPath")]
    pub root_path: String,
    pub files: BTreeMap<String, FileManifest>,
    #[serde(rename = "totalSize")]
    pub total_size: u64,
}

impl WorkspaceManifest {
    #[must_use]
    pub fn empty(root_path: &str) -> Self {
        Self {
            version: MANIFEST_VERSION,
            generated: Utc::now(),
            root_path: root_path.to_string(),
            files: BTreeMap::new(),
            total_size: 0,
        }
    }
}

/// Byte and entry counters accumulated while diffing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub added_files: usize,
    pub added_bytes: u64,
    pub modified_files: usize,
    pub modified_bytes: u64,
    pub deleted_files: usize,
    pub unchanged_files: usize,
}

/// The partition of local ∪ remote paths into sync categories.
#[derive(Debug, Clone, Default)]
pub struct SyncDiff {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: Vec<String>,
    pub stats: SyncStats,
}

impl SyncDiff {
    /// Fraction of the local file set that changed; `1.0` for an empty
    /// local set so callers fall back to a full upload.
    #[must_use]
    pub fn change_ratio(&self, local_file_count: usize) -> f64 {
        if local_file_count == 0 {
            return 1.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let changed = (self.added.len() + self.modified.len() + self.deleted.len()) as f64;
        #[allow(clippy::cast_precision_loss)]
        let total = local_file_count as f64;
        changed / total
    }
}

fn sha256_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().fold(String::with_capacity(64), |mut s, b| {
        use std::fmt::Write;
        let _ = write!(s, "{b:02x}");
        s
    }))
}

fn mode_of(metadata: &std::fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode()
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        0o644
    }
}

fn mod_time_nanos(metadata: &std::fs::Metadata) -> i128 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| i128::try_from(d.as_nanos()).unwrap_or(i128::MAX))
}

/// Walk `root` and build its manifest, honoring the ignore rules.
///
/// # Errors
///
/// Returns an error when the tree cannot be read.
pub fn build_local_manifest(root: &Path, ignore: &IgnoreRules) -> Result<WorkspaceManifest> {
    let mut manifest = WorkspaceManifest::empty(&root.to_string_lossy());
    walk(root, root, ignore, &mut manifest)?;
    Ok(manifest)
}

fn walk(
    root: &Path,
    dir: &Path,
    ignore: &IgnoreRules,
    manifest: &mut WorkspaceManifest,
) -> Result<()> {
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("reading directory {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("reading entry in {}", dir.display()))?;
        let path = entry.path();
        let Ok(stripped) = path.strip_prefix(root) else {
            continue;
        };
        let rel = stripped
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if ignore.is_ignored(&rel) {
            continue;
        }
        let metadata = entry
            .metadata()
            .with_context(|| format!("reading metadata of {}", path.display()))?;
        if metadata.is_dir() {
            manifest.files.insert(
                rel.clone(),
                FileManifest {
                    path: rel.clone(),
                    size: 0,
                    mod_time: mod_time_nanos(&metadata),
                    hash: None,
                    is_dir: true,
                    mode: mode_of(&metadata),
                },
            );
            walk(root, &path, ignore, manifest)?;
        } else if metadata.is_file() {
            let size = metadata.len();
            let hash = if size <= HASH_SIZE_LIMIT {
                Some(sha256_file(&path)?)
            } else {
                None
            };
            manifest.total_size += size;
            manifest.files.insert(
                rel.clone(),
                FileManifest {
                    path: rel,
                    size,
                    mod_time: mod_time_nanos(&metadata),
                    hash,
                    is_dir: false,
                    mode: mode_of(&metadata),
                },
            );
        }
        // Symlinks and special files are not carried by the sync.
    }
    Ok(())
}

/// Whether a file differs between manifests: hash mismatch when both sides
/// have hashes, otherwise size or mtime (beyond 1 s slack).
#[must_use]
pub fn is_file_modified(local: &FileManifest, remote: &FileManifest) -> bool {
    if let (Some(local_hash), Some(remote_hash)) = (&local.hash, &remote.hash) {
        return local_hash != remote_hash;
    }
    local.size != remote.size
        || (local.mod_time - remote.mod_time).abs() > MOD_TIME_SLACK_NANOS
}

/// Partition local ∪ remote (directories excluded) into added, modified,
/// deleted, and unchanged.
#[must_use]
pub fn compute_diff(local: &WorkspaceManifest, remote: &WorkspaceManifest) -> SyncDiff {
    let mut diff = SyncDiff::default();

    for (path, local_file) in &local.files {
        if local_file.is_dir {
            continue;
        }
        match remote.files.get(path) {
            None => {
                diff.stats.added_files += 1;
                diff.stats.added_bytes += local_file.size;
                diff.added.push(path.clone());
            }
            Some(remote_file) => {
                if is_file_modified(local_file, remote_file) {
                    diff.stats.modified_files += 1;
                    diff.stats.modified_bytes += local_file.size;
                    diff.modified.push(path.clone());
                } else {
                    diff.stats.unchanged_files += 1;
                    diff.unchanged.push(path.clone());
                }
            }
        }
    }

    for (path, remote_file) in &remote.files {
        if remote_file.is_dir {
            continue;
        }
        if !local.files.contains_key(path) {
            diff.stats.deleted_files += 1;
            diff.deleted.push(path.clone());
        }
    }

    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file(path: &str, size: u64, hash: Option<&str>, mod_time: i128) -> FileManifest {
        FileManifest {
            path: path.to_string(),
            size,
            mod_time,
            hash: hash.map(ToString::to_string),
            is_dir: false,
            mode: 0o644,
        }
    }

    fn manifest_of(files: Vec<FileManifest>) -> WorkspaceManifest {
        let mut manifest = WorkspaceManifest::empty("/proj");
        for f in files {
            manifest.files.insert(f.path.clone(), f);
        }
        manifest
    }

    #[test]
    fn test_build_manifest_hashes_small_files() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("a.txt"), b"hello").expect("write");
        std::fs::create_dir(dir.path().join("sub")).expect("mkdir");
        std::fs::write(dir.path().join("sub/b.txt"), b"world").expect("write");

        let manifest =
            build_local_manifest(dir.path(), &IgnoreRules::new(Vec::new())).expect("build");
        let a = manifest.files.get("a.txt").expect("a.txt present");
        assert!(!a.is_dir);
        assert_eq!(a.size, 5);
        // sha256("hello")
        assert_eq!(
            a.hash.as_deref(),
            Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );
        assert!(manifest.files.get("sub").expect("dir present").is_dir);
        assert!(manifest.files.contains_key("sub/b.txt"));
        assert_eq!(manifest.total_size, 10);
    }

    #[test]
    fn test_build_manifest_honors_ignore_rules() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::create_dir(dir.path().join("node_modules")).expect("mkdir");
        std::fs::write(dir.path().join("node_modules/x.js"), b"junk").expect("write");
        std::fs::write(dir.path().join("keep.rs"), b"fn main() {}").expect("write");

        let manifest =
            build_local_manifest(dir.path(), &IgnoreRules::new(Vec::new())).expect("build");
        assert!(manifest.files.contains_key("keep.rs"));
        assert!(!manifest.files.contains_key("node_modules"));
        assert!(!manifest.files.contains_key("node_modules/x.js"));
    }

    #[test]
    fn test_modified_by_hash_when_both_have_hashes() {
        let a = file("f", 10, Some("aaa"), 0);
        let b = file("f", 10, Some("bbb"), 0);
        assert!(is_file_modified(&a, &b));
        let c = file("f", 99, Some("aaa"), 12345);
        // Same hash wins even with different size/mtime metadata.
        assert!(!is_file_modified(&a, &c));
    }

    #[test]
    fn test_modified_by_size_when_hash_missing() {
        let a = file("f", 10, None, 0);
        let b = file("f", 11, None, 0);
        assert!(is_file_modified(&a, &b));
    }

    #[test]
    fn test_modified_by_mtime_beyond_one_second() {
        let a = file("f", 10, None, 0);
        let within = file("f", 10, None, 900_000_000);
        assert!(!is_file_modified(&a, &within));
        let beyond = file("f", 10, None, 1_500_000_000);
        assert!(is_file_modified(&a, &beyond));
    }

    #[test]
    fn test_diff_partitions_every_path_exactly_once() {
        let local = manifest_of(vec![
            file("added.rs", 5, Some("a"), 0),
            file("same.rs", 5, Some("s"), 0),
            file("changed.rs", 5, Some("x"), 0),
        ]);
        let remote = manifest_of(vec![
            file("same.rs", 5, Some("s"), 0),
            file("changed.rs", 5, Some("y"), 0),
            file("gone.rs", 5, Some("g"), 0),
        ]);
        let diff = compute_diff(&local, &remote);
        assert_eq!(diff.added, vec!["added.rs"]);
        assert_eq!(diff.modified, vec!["changed.rs"]);
        assert_eq!(diff.deleted, vec!["gone.rs"]);
        assert_eq!(diff.unchanged, vec!["same.rs"]);

        // Partition invariant: every non-dir path in exactly one category.
        let mut all: Vec<&String> = diff
            .added
            .iter()
            .chain(&diff.modified)
            .chain(&diff.deleted)
            .chain(&diff.unchanged)
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_diff_excludes_directories() {
        let mut dir_entry = file("src", 0, None, 0);
        dir_entry.is_dir = true;
        let local = manifest_of(vec![dir_entry.clone(), file("src/a.rs", 5, Some("a"), 0)]);
        let remote = manifest_of(vec![dir_entry]);
        let diff = compute_diff(&local, &remote);
        assert_eq!(diff.added, vec!["src/a.rs"]);
        assert!(diff.deleted.is_empty());
        assert!(diff.unchanged.is_empty());
    }

    #[test]
    fn test_diff_stats_accumulate_bytes() {
        let local = manifest_of(vec![
            file("a", 100, Some("a"), 0),
            file("b", 50, Some("x"), 0),
        ]);
        let remote = manifest_of(vec![file("b", 50, Some("y"), 0)]);
        let diff = compute_diff(&local, &remote);
        assert_eq!(diff.stats.added_files, 1);
        assert_eq!(diff.stats.added_bytes, 100);
        assert_eq!(diff.stats.modified_files, 1);
        assert_eq!(diff.stats.modified_bytes, 50);
    }

    #[test]
    fn test_change_ratio_matches_fallback_scenario() {
        // 1000 local files, 400 shared and unchanged, 600 new.
        let mut local_files = Vec::new();
        let mut remote_files = Vec::new();
        for i in 0..1000 {
            local_files.push(file(&format!("f{i}"), 1, Some("h"), 0));
        }
        for i in 0..400 {
            remote_files.push(file(&format!("f{i}"), 1, Some("h"), 0));
        }
        let diff = compute_diff(&manifest_of(local_files), &manifest_of(remote_files));
        assert_eq!(diff.added.len(), 600);
        assert_eq!(diff.modified.len(), 0);
        assert_eq!(diff.deleted.len(), 0);
        let ratio = diff.change_ratio(1000);
        assert!(ratio > 0.5, "ratio {ratio} should trigger full upload");
    }

    #[test]
    fn test_change_ratio_empty_local_forces_full() {
        let diff = SyncDiff::default();
        assert!((diff.change_ratio(0) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_manifest_serde_uses_documented_keys() {
        let manifest = manifest_of(vec![file("a", 1, Some("h"), 42)]);
        let json = serde_json::to_value(&manifest).expect("serialize");
        assert!(json.get("rootPath").is_some());
        assert!(json.get("totalSize").is_some());
        assert!(json["files"]["a"].get("modTime").is_some());
        assert!(json["files"]["a"].get("isDir").is_some());
    }
}
