//! The uniform sandbox handle every provider driver returns.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, SandboxError};

/// Labels amux guarantees on every sandbox it creates.
pub const LABEL_PROVIDER: &str = "amux.provider";
pub const LABEL_AGENT: &str = "amux.agent";
pub const LABEL_WORKTREE_ID: &str = "amux.worktreeId";
pub const LABEL_PROJECT: &str = "amux.project";
pub const LABEL_CREATED_AT: &str = "amux.createdAt";
/// Pre-rename label; still honored when deciding ownership.
pub const LABEL_LEGACY_PROJECT_ID: &str = "amux.projectId";

/// Provider-reported sandbox state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Pending,
    Started,
    Stopped,
    Error,
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxState::Pending => "pending",
            SandboxState::Started => "started",
            SandboxState::Stopped => "stopped",
            SandboxState::Error => "error",
        };
        f.write_str(s)
    }
}

/// A sandbox belongs to amux iff it carries the provider label (or the
/// legacy project-id label).
#[must_use]
pub fn is_amux_owned(labels: &BTreeMap<String, String>) -> bool {
    labels.contains_key(LABEL_PROVIDER) || labels.contains_key(LABEL_LEGACY_PROJECT_ID)
}

/// Options for a non-interactive exec.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    /// Deadline for the command; `None` leaves the driver default in place.
    pub timeout: Option<Duration>,
    pub user: Option<String>,
}

/// Captured output of a non-interactive exec.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Uniform handle over one remote sandbox. Implementations keep their
/// provider client internally; callers never see past this trait.
#[async_trait]
pub trait SandboxHandle: Send + Sync + std::fmt::Debug {
    fn id(&self) -> String;

    /// Last observed state; [`SandboxHandle::refresh`] updates it.
    fn state(&self) -> SandboxState;

    fn labels(&self) -> BTreeMap<String, String>;

    /// Idempotent with respect to the current state.
    async fn start(&self) -> Result<()>;

    /// Idempotent with respect to the current state.
    async fn stop(&self) -> Result<()>;

    /// Block until the sandbox reports `started`, failing fast when it
    /// reports `error`.
    async fn wait_ready(&self, timeout: Duration) -> Result<()>;

    /// Run a shell command and capture its output. `opts.timeout` is
    /// applied as a deadline when set.
    async fn exec(&self, command: &str, opts: &ExecOptions) -> Result<ExecOutput>;

    /// Run a command with the caller's stdio attached; allocates a PTY when
    /// stdin is a terminal. Returns the child's exit code.
    async fn exec_interactive(&self, command: &str, opts: &ExecOptions) -> Result<i32>;

    /// Binary-safe file transfer into the sandbox.
    async fn upload_file(&self, local: &Path, remote: &str) -> Result<()>;

    /// Binary-safe file transfer out of the sandbox.
    async fn download_file(&self, remote: &str, local: &Path) -> Result<()>;

    /// Public URL for a sandbox port, when the provider supports preview
    /// URLs. `Ok(None)` means unsupported.
    async fn get_preview_url(&self, port: u16) -> Result<Option<String>>;

    /// Re-fetch state (and labels) from the provider.
    async fn refresh(&self) -> Result<()>;

    /// Environment applied to every subsequent exec. Called once by the
    /// lifecycle controller after adoption.
    fn set_default_env(&self, env: BTreeMap<String, String>);
}

/// Shared readiness poll used by drivers without a server-side wait:
/// refresh, inspect state, sleep, repeat.
///
/// # Errors
///
/// Fails fast on `error` state and times out with a `timeout` error.
pub async fn wait_ready_by_polling(
    handle: &dyn SandboxHandle,
    timeout: Duration,
    interval: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        handle.refresh().await?;
        match handle.state() {
            SandboxState::Started => return Ok(()),
            SandboxState::Error => {
                return Err(SandboxError::new(ErrorCode::SandboxStart, "wait for sandbox")
                    .with_sandbox_id(handle.id())
                    .with_source(anyhow::anyhow!("sandbox entered error state"))
                    .into());
            }
            SandboxState::Pending | SandboxState::Stopped => {}
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(SandboxError::new(ErrorCode::Timeout, "wait for sandbox")
                .with_sandbox_id(handle.id())
                .with_context("timeout", format!("{}s", timeout.as_secs()))
                .into());
        }
        tokio::time::sleep(interval).await;
    }
}

/// Run a command and fail with a structured `sync`-style error when it
/// exits non-zero. The stderr tail lands in the error context.
///
/// # Errors
///
/// Returns the exec error, or a structured error for non-zero exits.
pub async fn run_checked(
    handle: &dyn SandboxHandle,
    command: &str,
    opts: &ExecOptions,
) -> Result<ExecOutput> {
    let output = handle.exec(command, opts).await?;
    if output.success() {
        return Ok(output);
    }
    let trimmed = output.stderr.trim();
    let skip = trimmed.chars().count().saturating_sub(400);
    let stderr_tail: String = trimmed.chars().skip(skip).collect();
    Err(SandboxError::new(ErrorCode::Unknown, "remote command")
        .with_sandbox_id(handle.id())
        .with_context("exitCode", output.exit_code.to_string())
        .with_context("stderr", stderr_tail)
        .with_source(anyhow::anyhow!("command exited with {}", output.exit_code))
        .into())
}

/// Resolve and cache-worthy `$HOME` inside the sandbox.
///
/// # Errors
///
/// Returns an error if the probe command fails.
pub async fn remote_home(handle: &dyn SandboxHandle) -> Result<String> {
    let output = run_checked(handle, "printf '%s' \"$HOME\"", &ExecOptions::default()).await?;
    let home = output.stdout.trim().to_string();
    if home.is_empty() {
        return Err(SandboxError::new(ErrorCode::Unknown, "resolve remote home")
            .with_sandbox_id(handle.id())
            .with_source(anyhow::anyhow!("$HOME is empty in the sandbox"))
            .into());
    }
    Ok(home)
}
