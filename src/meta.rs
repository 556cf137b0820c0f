//! Persistent sandbox metadata on the user's machine.
//!
//! Two JSON files under the amux config directory: `sandbox.json` keyed by
//! worktree id, and the legacy `computer.json` keyed by provider name.
//! Reads tolerate missing or corrupt files (treated as empty); writes
//! replace the whole file with mode 600; an empty map deletes the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agent::Agent;

/// What we remember about a sandbox between invocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxMeta {
    #[serde(rename = "sandboxId")]
    pub sandbox_id: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    pub agent: Agent,
    pub provider: String,
    #[serde(rename = "worktreeId")]
    pub worktree_id: String,
    pub project: String,
    #[serde(rename = "configHash")]
    pub config_hash: String,
}

/// File-backed store of [`SandboxMeta`] entries.
pub struct MetaStore {
    dir: PathBuf,
}

impl MetaStore {
    /// Store under the default amux config directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be determined.
    pub fn new() -> Result<Self> {
        Ok(Self::with_dir(crate::config::amux_home()?))
    }

    /// Store under an explicit directory (used in tests).
    #[must_use]
    pub fn with_dir(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn sandbox_path(&self) -> PathBuf {
        self.dir.join("sandbox.json")
    }

    fn legacy_path(&self) -> PathBuf {
        self.dir.join("computer.json")
    }

    /// All entries, keyed by worktree id. Missing or corrupt files read as
    /// empty.
    #[must_use]
    pub fn load_all(&self) -> BTreeMap<String, SandboxMeta> {
        read_tolerant(&self.sandbox_path())
    }

    /// Look up the sandbox for a worktree, falling back to the legacy
    /// `computer.json` entry for `provider`.
    #[must_use]
    pub fn get(&self, worktree_id: &str, provider: &str) -> Option<SandboxMeta> {
        if let Some(meta) = self.load_all().get(worktree_id) {
            if meta.provider == provider {
                return Some(meta.clone());
            }
        }
        let legacy: BTreeMap<String, SandboxMeta> = read_tolerant(&self.legacy_path());
        legacy.get(provider).cloned()
    }

    /// Insert or replace the entry for `meta.worktree_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub fn put(&self, meta: &SandboxMeta) -> Result<()> {
        let mut all = self.load_all();
        all.insert(meta.worktree_id.clone(), meta.clone());
        self.write(&all)
    }

    /// Remove the entry for a worktree. Deletes the file once the map is
    /// empty. Removing a missing entry is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written or deleted.
    pub fn remove(&self, worktree_id: &str) -> Result<()> {
        let mut all = self.load_all();
        if all.remove(worktree_id).is_none() {
            return Ok(());
        }
        if all.is_empty() {
            let path = self.sandbox_path();
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("removing {}", path.display()))?;
            }
            return Ok(());
        }
        self.write(&all)
    }

    fn write(&self, all: &BTreeMap<String, SandboxMeta>) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating directory {}", self.dir.display()))?;
        let path = self.sandbox_path();
        let content = serde_json::to_string_pretty(all).context("serializing sandbox metadata")?;
        std::fs::write(&path, content)
            .with_context(|| format!("writing meta store {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("setting permissions on {}", path.display()))?;
        }
        Ok(())
    }
}

fn read_tolerant(path: &Path) -> BTreeMap<String, SandboxMeta> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return BTreeMap::new();
    };
    match serde_json::from_str(&content) {
        Ok(map) => map,
        Err(err) => {
            debug!(path = %path.display(), %err, "ignoring corrupt meta file");
            BTreeMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> MetaStore {
        MetaStore::with_dir(dir.path().to_path_buf())
    }

    fn meta(worktree_id: &str, provider: &str) -> SandboxMeta {
        SandboxMeta {
            sandbox_id: format!("sbx-{worktree_id}"),
            created_at: Utc::now(),
            agent: Agent::Claude,
            provider: provider.to_string(),
            worktree_id: worktree_id.to_string(),
            project: "proj".to_string(),
            config_hash: "abcdef0123456789".to_string(),
        }
    }

    #[test]
    fn test_load_all_empty_when_no_file() {
        let dir = TempDir::new().expect("tempdir");
        assert!(store(&dir).load_all().is_empty());
    }

    #[test]
    fn test_put_then_get_round_trips() {
        let dir = TempDir::new().expect("tempdir");
        let s = store(&dir);
        let m = meta("wt1", "daytona");
        s.put(&m).expect("put");
        let loaded = s.get("wt1", "daytona").expect("present");
        assert_eq!(loaded, m);
    }

    #[test]
    fn test_get_requires_matching_provider() {
        let dir = TempDir::new().expect("tempdir");
        let s = store(&dir);
        s.put(&meta("wt1", "daytona")).expect("put");
        assert!(s.get("wt1", "docker").is_none());
    }

    #[test]
    fn test_corrupt_file_reads_as_empty() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("sandbox.json"), b"{not json").expect("write");
        assert!(store(&dir).load_all().is_empty());
    }

    #[test]
    fn test_remove_missing_entry_is_noop() {
        let dir = TempDir::new().expect("tempdir");
        assert!(store(&dir).remove("nope").is_ok());
    }

    #[test]
    fn test_remove_last_entry_deletes_file() {
        let dir = TempDir::new().expect("tempdir");
        let s = store(&dir);
        s.put(&meta("wt1", "daytona")).expect("put");
        assert!(dir.path().join("sandbox.json").exists());
        s.remove("wt1").expect("remove");
        assert!(!dir.path().join("sandbox.json").exists());
    }

    #[test]
    fn test_remove_keeps_file_when_entries_remain() {
        let dir = TempDir::new().expect("tempdir");
        let s = store(&dir);
        s.put(&meta("wt1", "daytona")).expect("put");
        s.put(&meta("wt2", "daytona")).expect("put");
        s.remove("wt1").expect("remove");
        assert!(dir.path().join("sandbox.json").exists());
        assert!(s.get("wt2", "daytona").is_some());
        assert!(s.get("wt1", "daytona").is_none());
    }

    #[test]
    fn test_legacy_computer_json_is_consulted() {
        let dir = TempDir::new().expect("tempdir");
        let legacy = meta("wt-legacy", "daytona");
        let map = BTreeMap::from([("daytona".to_string(), legacy.clone())]);
        std::fs::write(
            dir.path().join("computer.json"),
            serde_json::to_string(&map).expect("serialize"),
        )
        .expect("write legacy");
        let found = store(&dir)
            .get("some-other-worktree", "daytona")
            .expect("legacy entry found");
        assert_eq!(found.sandbox_id, legacy.sandbox_id);
    }

    #[test]
    fn test_serde_uses_camel_case_keys() {
        let m = meta("wt1", "daytona");
        let json = serde_json::to_value(&m).expect("serialize");
        assert!(json.get("sandboxId").is_some());
        assert!(json.get("worktreeId").is_some());
        assert!(json.get("createdAt").is_some());
        assert!(json.get("configHash").is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_write_sets_600_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().expect("tempdir");
        let s = store(&dir);
        s.put(&meta("wt1", "daytona")).expect("put");
        let mode = std::fs::metadata(dir.path().join("sandbox.json"))
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600, "meta store must be mode 600");
    }

    #[test]
    fn test_put_overwrites_existing_entry() {
        let dir = TempDir::new().expect("tempdir");
        let s = store(&dir);
        s.put(&meta("wt1", "daytona")).expect("put");
        let mut updated = meta("wt1", "daytona");
        updated.sandbox_id = "sbx-new".to_string();
        s.put(&updated).expect("put again");
        assert_eq!(
            s.get("wt1", "daytona").expect("present").sandbox_id,
            "sbx-new"
        );
    }
}
