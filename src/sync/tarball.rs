//! Full-workspace tarball transfer.
//!
//! Upload streams the ignored-filtered tree into a gzipped tar, ships it to
//! `/tmp/amux-upload.tgz`, and unpacks it over a recreated repo directory.
//! Download reverses the flow with integrity checks: gzip magic, a size
//! comparison against the remote archive, and path-safety validation on
//! every entry before extraction.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::{debug, warn};

use crate::error::{ErrorCode, SandboxError};
use crate::sandbox::{ExecOptions, SandboxHandle, run_checked};
use crate::shell::safe;

/// Transient archive paths inside the sandbox.
pub const UPLOAD_ARCHIVE: &str = "/tmp/amux-upload.tgz";
pub const DOWNLOAD_ARCHIVE: &str = "/tmp/amux-download.tgz";

/// Ceiling for the second (buffered) download attempt after an integrity
/// failure.
const BUFFER_RETRY_LIMIT: u64 = 100 * 1024 * 1024;

/// Directories excluded from every sync.
const BUILTIN_IGNORES: [&str; 5] = ["node_modules", ".next", "dist", "build", ".turbo"];

/// The amux workspace marker directory is never shipped.
const AMUX_DIR: &str = ".amux";

/// Which workspace entries stay local.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    patterns: Vec<String>,
}

impl IgnoreRules {
    /// Built-in patterns plus extras (from `.amuxignore`); `.git` is
    /// excluded unless `extra` says otherwise via [`IgnoreRules::load`].
    #[must_use]
    pub fn new(extra: Vec<String>) -> Self {
        let mut patterns: Vec<String> = BUILTIN_IGNORES
            .iter()
            .map(ToString::to_string)
            .collect();
        patterns.push(AMUX_DIR.to_string());
        patterns.push(".git".to_string());
        patterns.extend(extra);
        Self { patterns }
    }

    /// Read `.amuxignore` from `root` (one pattern per line, `#` comments)
    /// and combine with the built-ins. `include_git` drops the `.git`
    /// exclusion.
    #[must_use]
    pub fn load(root: &Path, include_git: bool) -> Self {
        let mut extra = Vec::new();
        if let Ok(contents) = std::fs::read_to_string(root.join(".amuxignore")) {
            for line in contents.lines() {
                let line = line.trim();
                if !line.is_empty() && !line.starts_with('#') {
                    extra.push(line.to_string());
                }
            }
        }
        let mut rules = Self::new(extra);
        if include_git {
            rules.patterns.retain(|p| p != ".git");
        }
        rules
    }

    /// Whether a `/`-separated relative path is excluded.
    #[must_use]
    pub fn is_ignored(&self, rel: &str) -> bool {
        for pattern in &self.patterns {
            if pattern.contains('/') {
                if rel == pattern || rel.starts_with(&format!("{pattern}/")) {
                    return true;
                }
            } else if rel.split('/').any(|component| component == pattern) {
                return true;
            }
        }
        false
    }
}

/// Write the filtered tree under `root` as a gzipped tar to `out`.
/// Every entry path is relative to `root`.
///
/// # Errors
///
/// Returns an error when the tree or the archive cannot be written.
pub fn create_tarball(root: &Path, out: &Path, ignore: &IgnoreRules) -> Result<()> {
    let file = std::fs::File::create(out)
        .with_context(|| format!("creating archive {}", out.display()))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    append_dir(&mut builder, root, root, ignore)?;
    let encoder = builder.into_inner().context("finishing archive")?;
    encoder.finish().context("flushing gzip stream")?;
    Ok(())
}

fn append_dir<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    dir: &Path,
    ignore: &IgnoreRules,
) -> Result<()> {
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let Ok(stripped) = path.strip_prefix(root) else {
            continue;
        };
        let rel = stripped
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if rel.is_empty() || rel.starts_with("..") || ignore.is_ignored(&rel) {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            builder
                .append_dir(&rel, &path)
                .with_context(|| format!("archiving directory {rel}"))?;
            append_dir(builder, root, &path, ignore)?;
        } else if file_type.is_file() {
            builder
                .append_path_with_name(&path, &rel)
                .with_context(|| format!("archiving {rel}"))?;
        }
    }
    Ok(())
}

/// Reject tar entry paths that would land outside the destination root.
///
/// # Errors
///
/// Returns `"tar entry outside destination"` for absolute paths or any
/// path whose normalization climbs above the root.
pub fn validate_entry_path(path: &Path) -> Result<PathBuf> {
    let mut depth: i32 = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    bail!("tar entry outside destination: {}", path.display());
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                bail!("tar entry outside destination: {}", path.display());
            }
        }
    }
    Ok(path.to_path_buf())
}

/// Unpack a gzipped tar into `dest`, validating every entry path first.
///
/// # Errors
///
/// Returns an error on unreadable archives or escaping entries; nothing is
/// written for an entry that fails validation.
pub fn extract_tarball(archive: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)
        .with_context(|| format!("opening archive {}", archive.display()))?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    std::fs::create_dir_all(dest)
        .with_context(|| format!("creating {}", dest.display()))?;
    for entry in tar.entries().context("reading archive entries")? {
        let mut entry = entry.context("reading archive entry")?;
        let raw = entry.path().context("reading entry path")?.into_owned();
        validate_entry_path(&raw)?;
        entry
            .unpack_in(dest)
            .with_context(|| format!("extracting {}", raw.display()))?;
    }
    Ok(())
}

/// Gzip magic check on a local file.
fn has_gzip_magic(path: &Path) -> Result<bool> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut magic = [0u8; 2];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == [0x1f, 0x8b]),
        Err(_) => Ok(false),
    }
}

/// Upload the whole workspace: archive locally, ship, unpack over a fresh
/// repo directory, and clear the transient archive.
///
/// # Errors
///
/// Returns a `sync` error when archiving, transfer, or remote extraction
/// fails.
pub async fn full_upload(
    handle: &dyn SandboxHandle,
    cwd: &Path,
    repo_path: &str,
    include_git: bool,
) -> Result<()> {
    let ignore = IgnoreRules::load(cwd, include_git);
    let staging = tempfile::NamedTempFile::new().context("creating staging file")?;
    create_tarball(cwd, staging.path(), &ignore).map_err(|err| {
        anyhow::Error::from(
            SandboxError::new(ErrorCode::Sync, "archive workspace").with_source(err),
        )
    })?;

    handle
        .upload_file(staging.path(), UPLOAD_ARCHIVE)
        .await
        .context("uploading workspace archive")?;

    let command = format!(
        "{rm} && {mkdir} && {untar} && {cleanup}",
        rm = safe::rm_rf(repo_path),
        mkdir = safe::mkdir_p(repo_path),
        untar = safe::tar_xzf(UPLOAD_ARCHIVE, repo_path),
        cleanup = safe::rm_f(UPLOAD_ARCHIVE),
    );
    run_checked(handle, &command, &ExecOptions::default())
        .await
        .context("extracting workspace on sandbox")?;
    debug!(repo = %repo_path, "full upload complete");
    Ok(())
}

async fn remote_archive_size(handle: &dyn SandboxHandle, archive: &str) -> Result<u64> {
    let command = format!(
        "stat -c %s {a} 2>/dev/null || wc -c < {a}",
        a = crate::shell::quote(archive)
    );
    let output = run_checked(handle, &command, &ExecOptions::default()).await?;
    output
        .stdout
        .trim()
        .parse::<u64>()
        .context("parsing remote archive size")
}

async fn fetch_and_verify(
    handle: &dyn SandboxHandle,
    expected_size: u64,
    local: &Path,
) -> Result<()> {
    handle
        .download_file(DOWNLOAD_ARCHIVE, local)
        .await
        .context("downloading workspace archive")?;
    if !has_gzip_magic(local)? {
        bail!("archive is not gzip data");
    }
    let actual = std::fs::metadata(local)
        .with_context(|| format!("sizing {}", local.display()))?
        .len();
    if actual != expected_size {
        bail!("archive size mismatch: remote {expected_size}, local {actual}");
    }
    Ok(())
}

/// Download the whole workspace into `dest`.
///
/// On an integrity failure the download is retried once (buffered path)
/// when the remote archive is at most 100 MiB.
///
/// # Errors
///
/// Returns a `sync` error when archiving, transfer, or extraction fails.
pub async fn full_download(
    handle: &dyn SandboxHandle,
    repo_path: &str,
    dest: &Path,
) -> Result<()> {
    run_checked(
        handle,
        &safe::tar_czf(DOWNLOAD_ARCHIVE, repo_path),
        &ExecOptions::default(),
    )
    .await
    .context("archiving workspace on sandbox")?;

    let expected_size = remote_archive_size(handle, DOWNLOAD_ARCHIVE).await?;
    let staging = tempfile::NamedTempFile::new().context("creating staging file")?;

    if let Err(err) = fetch_and_verify(handle, expected_size, staging.path()).await {
        if expected_size > BUFFER_RETRY_LIMIT {
            return Err(SandboxError::new(ErrorCode::Sync, "download workspace")
                .with_sandbox_id(handle.id())
                .with_source(err)
                .into());
        }
        warn!(%err, "archive integrity failure, retrying with buffered download");
        fetch_and_verify(handle, expected_size, staging.path())
            .await
            .map_err(|retry_err| {
                anyhow::Error::from(
                    SandboxError::new(ErrorCode::Sync, "download workspace")
                        .with_sandbox_id(handle.id())
                        .with_source(retry_err),
                )
            })?;
    }

    extract_tarball(staging.path(), dest)?;
    run_checked(
        handle,
        &safe::rm_f(DOWNLOAD_ARCHIVE),
        &ExecOptions::default(),
    )
    .await
    .ok();
    Ok(())
}
