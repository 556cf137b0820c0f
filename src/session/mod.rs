//! Interactive session brokering: laptop terminal ⇄ sandbox agent.
//!
//! For providers with token-authenticated SSH, the broker acquires a
//! short-lived token, waits for it to validate, launches the local `ssh`
//! binary with the bootstrap program as the remote command, and revokes
//! the token on every exit path. Local-container providers run the same
//! bootstrap through the handle's interactive exec instead.

pub mod bootstrap;

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::agent::Agent;
use crate::error::{ErrorCode, SandboxError};
use crate::installer::resolve_agent_command_path;
use crate::provider::daytona::DEFAULT_SSH_TTL_MINUTES;
use crate::provider::{Provider, SshAccess, SshToken};
use crate::sandbox::{ExecOptions, SandboxHandle, remote_home};
use crate::shell::{quote, redact_secrets};

use bootstrap::{BootstrapSpec, build_script};

/// Caller-facing options for one interactive session.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Record the session into this sandbox-side file via `script -f`.
    pub record_path: Option<String>,
    /// Explicit raw-mode request; agents with full-screen TUIs get raw
    /// mode regardless.
    pub raw_mode: Option<bool>,
}

/// Search PATH for an executable.
#[must_use]
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    find_in_path_value(&std::env::var("PATH").unwrap_or_default(), name)
}

/// [`find_in_path`] over an explicit PATH string (testable seam).
#[must_use]
pub fn find_in_path_value(path_value: &str, name: &str) -> Option<PathBuf> {
    for dir in path_value.split(':').filter(|d| !d.is_empty()) {
        let candidate = PathBuf::from(dir).join(name);
        if candidate.is_file() {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(metadata) = candidate.metadata()
                    && metadata.permissions().mode() & 0o111 == 0
                {
                    continue;
                }
            }
            return Some(candidate);
        }
    }
    None
}

fn env_flag(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<bool> {
    match lookup(name).as_deref() {
        Some("1") => Some(true),
        Some("0") => Some(false),
        _ => None,
    }
}

/// Raw-mode decision: full-screen agents, `AMUX_SSH_RAW=1`,
/// `AMUX_SHELL_RAW=1` for the shell agent, or an explicit caller request.
#[must_use]
pub fn should_use_raw_mode(
    agent: Agent,
    explicit: Option<bool>,
    lookup: &impl Fn(&str) -> Option<String>,
) -> bool {
    if explicit == Some(true) {
        return true;
    }
    if env_flag(lookup, "AMUX_SSH_RAW") == Some(true) {
        return true;
    }
    if agent == Agent::Shell && env_flag(lookup, "AMUX_SHELL_RAW") == Some(true) {
        return true;
    }
    agent.wants_raw_mode()
}

/// Local `ssh` argv for a token-authenticated session. `remote_command` is
/// `None` in shell-bootstrap mode, where the script travels over stdin.
#[must_use]
pub fn ssh_args(
    token: &str,
    host: &str,
    remote_command: Option<&str>,
    debug: bool,
) -> Vec<String> {
    let mut argv = vec![
        "-tt".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        "LogLevel=ERROR".to_string(),
    ];
    if debug {
        argv.push("-vvv".to_string());
    }
    argv.push(format!("{token}@{host}"));
    if let Some(command) = remote_command {
        argv.push(command.to_string());
    }
    argv
}

/// Restores the local terminal mode when dropped.
struct RawModeGuard {
    entered: bool,
}

impl RawModeGuard {
    fn new(enable: bool) -> Self {
        let entered = enable
            && std::io::stdout().is_terminal()
            && crossterm::terminal::enable_raw_mode().is_ok();
        Self { entered }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.entered {
            let _ = crossterm::terminal::disable_raw_mode();
        }
    }
}

/// Run `agent` interactively inside the sandbox and return the child's
/// exit code.
///
/// # Errors
///
/// Returns an `ssh` error when the local `ssh` binary is missing or the
/// token never validates, and propagates bootstrap/exec failures.
pub async fn run_agent_interactive(
    provider: &Arc<dyn Provider>,
    handle: &Arc<dyn SandboxHandle>,
    agent: Agent,
    worktree_id: &str,
    opts: &SessionOptions,
) -> Result<i32> {
    let lookup = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
    let debug = env_flag(&lookup, "AMUX_SSH_DEBUG") == Some(true);

    let home = remote_home(handle.as_ref()).await?;
    let paths = crate::sync::remote_paths(&home, worktree_id);
    let command_path = match resolve_agent_command_path(handle.as_ref(), agent).await {
        Ok(path) => Some(path),
        Err(err) => {
            debug!(%err, "command path resolution failed, bootstrap will search");
            None
        }
    };

    let mut spec = BootstrapSpec::new(agent, home, paths.repo.clone());
    spec.env = opts.env.clone();
    spec.args = opts.args.clone();
    spec.command_path = command_path;
    spec.record_path = opts.record_path.clone();
    spec.tty_wrap = env_flag(&lookup, "AMUX_TTY_WRAP");
    spec.debug = debug;
    let script = build_script(&spec);

    let Some(ssh) = provider.ssh_access() else {
        // Local drivers attach a TTY themselves; hand them the bootstrap.
        let exec_opts = ExecOptions::default();
        return handle.exec_interactive(&script, &exec_opts).await;
    };

    if find_in_path("ssh").is_none() {
        return Err(SandboxError::new(ErrorCode::Ssh, "launch session")
            .retryable(true)
            .with_suggestion("Install the OpenSSH client and ensure 'ssh' is on PATH")
            .into());
    }

    let cancel = tokio_util::sync::CancellationToken::new();
    let sandbox_id = handle.id();
    let token = crate::retry::retry(&crate::retry::RetryConfig::ssh(), &cancel, |_| {
        ssh.create_token(&sandbox_id, DEFAULT_SSH_TTL_MINUTES)
    })
    .await
    .context("acquiring ssh token")?;

    let shell_mode = env_flag(&lookup, "AMUX_SSH_SHELL") == Some(true);
    let raw = should_use_raw_mode(agent, opts.raw_mode, &lookup);
    let result = run_ssh_session(ssh, &token, &script, raw, debug, shell_mode, &lookup).await;

    // The token dies with the session, success or not.
    if let Err(err) = ssh.revoke_token(&token.token).await {
        warn!(%err, "failed to revoke ssh token");
    }
    result
}

async fn run_ssh_session(
    ssh: &dyn SshAccess,
    token: &SshToken,
    script: &str,
    raw: bool,
    debug: bool,
    shell_mode: bool,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<i32> {
    let endpoint = ssh.wait_token_valid(&token.token).await?;
    let host = lookup("AMUX_SSH_HOST").unwrap_or(endpoint.host);
    let remote_command = format!("bash -lc {}", quote(script));

    if debug {
        eprintln!("amux: ssh target {}@{host}", token.token);
        eprintln!("amux: remote command: {}", redact_secrets(&remote_command));
    }

    let argv = ssh_args(
        &token.token,
        &host,
        (!shell_mode).then_some(remote_command.as_str()),
        debug,
    );

    let _raw_guard = RawModeGuard::new(raw);
    let mut command = tokio::process::Command::new("ssh");
    command.args(&argv);

    let status = if shell_mode {
        // Feed the bootstrap over stdin (silenced), then bridge the user's
        // stdin into the remote shell.
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        let mut child = command.spawn().context("spawning ssh")?;
        let mut child_stdin = child
            .stdin
            .take()
            .context("ssh child has no stdin pipe")?;
        child_stdin
            .write_all(format!("set +o history; stty -echo\n{script}\n").as_bytes())
            .await
            .context("writing bootstrap over stdin")?;
        let bridge = tokio::spawn(async move {
            let mut stdin = tokio::io::stdin();
            let _ = tokio::io::copy(&mut stdin, &mut child_stdin).await;
        });
        let status = child.wait().await.context("waiting for ssh")?;
        bridge.abort();
        status
    } else {
        command
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        let mut child = command.spawn().context("spawning ssh")?;
        child.wait().await.context("waiting for ssh")?
    };

    Ok(status.code().unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_ssh_args_shape() {
        let argv = ssh_args("tok-1", "runner.example", Some("bash -lc 'x'"), false);
        assert_eq!(
            argv,
            vec![
                "-tt",
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "LogLevel=ERROR",
                "tok-1@runner.example",
                "bash -lc 'x'",
            ]
        );
    }

    #[test]
    fn test_ssh_args_debug_adds_vvv() {
        let argv = ssh_args("t", "h", Some("c"), true);
        assert!(argv.contains(&"-vvv".to_string()));
    }

    #[test]
    fn test_ssh_args_shell_mode_has_no_remote_command() {
        let argv = ssh_args("t", "h", None, false);
        assert_eq!(argv.last().map(String::as_str), Some("t@h"));
    }

    #[test]
    fn test_raw_mode_for_full_screen_agents() {
        let lookup = lookup_from(&[]);
        for agent in [Agent::Codex, Agent::Opencode, Agent::Amp, Agent::Gemini, Agent::Droid] {
            assert!(should_use_raw_mode(agent, None, &lookup), "{agent}");
        }
        assert!(!should_use_raw_mode(Agent::Claude, None, &lookup));
        assert!(!should_use_raw_mode(Agent::Shell, None, &lookup));
    }

    #[test]
    fn test_raw_mode_env_and_explicit_overrides() {
        let env_raw = lookup_from(&[("AMUX_SSH_RAW", "1")]);
        assert!(should_use_raw_mode(Agent::Claude, None, &env_raw));

        let shell_raw = lookup_from(&[("AMUX_SHELL_RAW", "1")]);
        assert!(should_use_raw_mode(Agent::Shell, None, &shell_raw));
        assert!(!should_use_raw_mode(Agent::Claude, None, &shell_raw));

        let empty = lookup_from(&[]);
        assert!(should_use_raw_mode(Agent::Claude, Some(true), &empty));
    }

    #[test]
    fn test_find_in_path_value_locates_executable() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let exe = dir.path().join("mytool");
        std::fs::write(&exe, b"#!/bin/sh\n").expect("write");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755))
                .expect("chmod");
        }
        let path_value = format!("/nonexistent:{}", dir.path().display());
        assert_eq!(
            find_in_path_value(&path_value, "mytool"),
            Some(exe.clone())
        );
        assert!(find_in_path_value(&path_value, "othertool").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_find_in_path_value_skips_non_executable_files() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::TempDir::new().expect("tempdir");
        let file = dir.path().join("notexec");
        std::fs::write(&file, b"data").expect("write");
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o644)).expect("chmod");
        let path_value = dir.path().display().to_string();
        assert!(find_in_path_value(&path_value, "notexec").is_none());
    }

    mod broker {
        use super::super::*;
        use crate::provider::{CreateSandboxRequest, Feature};
        use crate::test_support::ScriptedHandle;
        use async_trait::async_trait;

        /// Provider without SSH access: sessions run through the handle.
        #[derive(Debug)]
        struct LocalOnlyProvider;

        #[async_trait]
        impl Provider for LocalOnlyProvider {
            fn name(&self) -> &str {
                "local"
            }
            fn supports_feature(&self, _feature: Feature) -> bool {
                false
            }
            async fn create_sandbox(
                &self,
                _request: &CreateSandboxRequest,
            ) -> Result<Arc<dyn SandboxHandle>> {
                anyhow::bail!("not expected")
            }
            async fn get_sandbox(&self, _id: &str) -> Result<Arc<dyn SandboxHandle>> {
                anyhow::bail!("not expected")
            }
            async fn list_sandboxes(&self) -> Result<Vec<Arc<dyn SandboxHandle>>> {
                Ok(Vec::new())
            }
            async fn delete_sandbox(&self, _id: &str) -> Result<()> {
                Ok(())
            }
        }

        #[tokio::test]
        async fn test_local_provider_runs_bootstrap_via_handle() {
            let handle = ScriptedHandle::new("sbx");
            handle.on("printf '%s' \"$HOME\"", 0, "/root");
            handle.on("export HOME=", 7, "");
            let provider: Arc<dyn Provider> = Arc::new(LocalOnlyProvider);
            let handle: Arc<dyn SandboxHandle> = Arc::new(handle);

            let code = run_agent_interactive(
                &provider,
                &handle,
                Agent::Shell,
                "wt1234",
                &SessionOptions::default(),
            )
            .await
            .expect("session runs");
            // Exit code propagates from the child untouched.
            assert_eq!(code, 7);
        }
    }
}
