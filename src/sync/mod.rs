//! Workspace synchronization between the laptop and the sandbox.
//!
//! `smart_sync` prefers the manifest-driven incremental path whenever a
//! recent manifest exists on the sandbox, and falls back to a full tarball
//! upload when the manifest is stale, the incremental attempt fails, or
//! more than half the workspace changed.

pub mod manifest;
pub mod tarball;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{ErrorCode, SandboxError};
use crate::sandbox::{ExecOptions, SandboxHandle, run_checked};
use crate::shell::safe;

use manifest::{WorkspaceManifest, build_local_manifest, compute_diff};
use tarball::{IgnoreRules, full_download, full_upload};

/// Incremental sync is skipped above this fraction of changed files.
pub const CHANGE_RATIO_LIMIT: f64 = 0.5;

/// A remote manifest older than this is considered stale.
pub const MANIFEST_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Budget for one incremental file upload.
const FILE_UPLOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Remote filesystem layout for one worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePaths {
    pub workspace_dir: String,
    pub repo: String,
    pub manifest: String,
}

/// Compute the sandbox-side paths for a worktree.
#[must_use]
pub fn remote_paths(home: &str, worktree_id: &str) -> RemotePaths {
    let workspace_dir = format!("{home}/.amux/workspaces/{worktree_id}");
    RemotePaths {
        repo: format!("{workspace_dir}/repo"),
        manifest: format!("{workspace_dir}/.amux-manifest.json"),
        workspace_dir,
    }
}

/// How a sync request was ultimately satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Incremental { uploaded: usize, deleted: usize },
    Full,
}

/// Fetch the manifest stored on the sandbox; missing or corrupt manifests
/// read as empty.
async fn fetch_remote_manifest(
    handle: &dyn SandboxHandle,
    manifest_path: &str,
) -> WorkspaceManifest {
    let output = handle
        .exec(&safe::cat(manifest_path), &ExecOptions::default())
        .await;
    match output {
        Ok(out) if out.success() => match serde_json::from_str(&out.stdout) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(%err, "remote manifest corrupt, treating as empty");
                WorkspaceManifest::empty("")
            }
        },
        _ => WorkspaceManifest::empty(""),
    }
}

/// Whether the remote manifest exists and is younger than seven days.
pub async fn should_use_incremental(handle: &dyn SandboxHandle, manifest_path: &str) -> bool {
    let command = format!("{} && date +%s", safe::stat_mtime(manifest_path));
    let Ok(output) = handle.exec(&command, &ExecOptions::default()).await else {
        return false;
    };
    if !output.success() {
        return false;
    }
    let mut lines = output.stdout.lines();
    let (Some(mtime), Some(now)) = (lines.next(), lines.next()) else {
        return false;
    };
    let (Ok(mtime), Ok(now)) = (mtime.trim().parse::<u64>(), now.trim().parse::<u64>()) else {
        return false;
    };
    now.saturating_sub(mtime) < MANIFEST_MAX_AGE.as_secs()
}

/// Manifest-driven sync: upload added/modified files, delete removed ones,
/// then persist the updated manifest. Falls back to a full upload when the
/// change ratio exceeds one half.
///
/// # Errors
///
/// Returns a `sync` error when a transfer or remote command fails.
pub async fn incremental_sync(
    handle: &dyn SandboxHandle,
    cwd: &Path,
    paths: &RemotePaths,
    include_git: bool,
) -> Result<SyncOutcome> {
    let ignore = IgnoreRules::load(cwd, include_git);
    let mut local = build_local_manifest(cwd, &ignore).context("building local manifest")?;
    let remote = fetch_remote_manifest(handle, &paths.manifest).await;
    let diff = compute_diff(&local, &remote);

    let local_file_count = local.files.values().filter(|f| !f.is_dir).count();
    let ratio = diff.change_ratio(local_file_count);
    if ratio > CHANGE_RATIO_LIMIT {
        info!(
            ratio = format!("{ratio:.2}"),
            "change ratio too high, falling back to full upload"
        );
        full_upload(handle, cwd, &paths.repo, include_git).await?;
        persist_manifest(handle, &mut local, paths).await?;
        return Ok(SyncOutcome::Full);
    }

    run_checked(handle, &safe::mkdir_p(&paths.repo), &ExecOptions::default()).await?;

    for deleted in &diff.deleted {
        crate::shell::validate_path(deleted)
            .with_context(|| format!("suspicious deleted path {deleted}"))?;
        run_checked(
            handle,
            &safe::rm_rf(&format!("{}/{deleted}", paths.repo)),
            &ExecOptions::default(),
        )
        .await?;
    }

    let mut uploaded = 0usize;
    for path in diff.added.iter().chain(&diff.modified) {
        crate::shell::validate_path(path)
            .with_context(|| format!("suspicious sync path {path}"))?;
        let remote_file = format!("{}/{path}", paths.repo);
        if let Some((dir, _)) = remote_file.rsplit_once('/') {
            run_checked(handle, &safe::mkdir_p(dir), &ExecOptions::default()).await?;
        }
        let local_file = cwd.join(path.replace('/', std::path::MAIN_SEPARATOR_STR));
        tokio::time::timeout(
            FILE_UPLOAD_TIMEOUT,
            handle.upload_file(&local_file, &remote_file),
        )
        .await
        .map_err(|_| {
            anyhow::Error::from(
                SandboxError::new(ErrorCode::Timeout, "upload file")
                    .with_sandbox_id(handle.id())
                    .with_context("path", path.clone()),
            )
        })?
        .with_context(|| format!("uploading {path}"))?;
        uploaded += 1;
    }

    persist_manifest(handle, &mut local, paths).await?;
    info!(
        uploaded,
        deleted = diff.deleted.len(),
        unchanged = diff.unchanged.len(),
        "incremental sync complete"
    );
    Ok(SyncOutcome::Incremental {
        uploaded,
        deleted: diff.deleted.len(),
    })
}

async fn persist_manifest(
    handle: &dyn SandboxHandle,
    local: &mut WorkspaceManifest,
    paths: &RemotePaths,
) -> Result<()> {
    local.generated = Utc::now();
    let staging = tempfile::NamedTempFile::new().context("creating manifest staging file")?;
    serde_json::to_writer(&staging, local).context("serializing manifest")?;
    run_checked(
        handle,
        &safe::mkdir_p(&paths.workspace_dir),
        &ExecOptions::default(),
    )
    .await?;
    handle
        .upload_file(staging.path(), &paths.manifest)
        .await
        .context("uploading manifest")
}

/// Incremental when the remote manifest is fresh, full otherwise; an
/// incremental failure degrades to a full upload with a warning.
///
/// # Errors
///
/// Returns a `sync` error when the (final) full upload fails.
pub async fn smart_sync(
    handle: &dyn SandboxHandle,
    cwd: &Path,
    paths: &RemotePaths,
    include_git: bool,
) -> Result<SyncOutcome> {
    if should_use_incremental(handle, &paths.manifest).await {
        match incremental_sync(handle, cwd, paths, include_git).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) => {
                warn!(%err, "incremental sync failed, falling back to full upload");
            }
        }
    }
    full_upload(handle, cwd, &paths.repo, include_git).await?;
    let ignore = IgnoreRules::load(cwd, include_git);
    let mut local = build_local_manifest(cwd, &ignore).context("building local manifest")?;
    persist_manifest(handle, &mut local, paths).await?;
    Ok(SyncOutcome::Full)
}

/// Download the sandbox repo into `dest` (full tarball path).
///
/// # Errors
///
/// Returns a `sync` error when the transfer fails.
pub async fn sync_down(handle: &dyn SandboxHandle, paths: &RemotePaths, dest: &Path) -> Result<()> {
    full_download(handle, &paths.repo, dest).await
}
