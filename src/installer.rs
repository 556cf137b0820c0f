//! TTL-gated agent installation inside the sandbox.
//!
//! A zero-byte marker at `/amux/.installed/<agent>` records a successful
//! install. Agents that update themselves skip on marker existence alone;
//! the rest skip only while the marker's mtime is younger than 24 hours.
//! The age is computed entirely inside the sandbox so laptop clock skew
//! cannot invalidate markers.

use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

use crate::agent::{Agent, InstallStep};
use crate::error::{ErrorCode, SandboxError};
use crate::sandbox::{ExecOptions, SandboxHandle, remote_home};
use crate::shell::{quote, safe};

/// Directory of install markers on the persistent volume.
pub const MARKER_DIR: &str = "/amux/.installed";

/// Freshness window for non-self-updating agents.
pub const INSTALL_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Budget for one install command.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// PATH prefix for native installers that drop binaries into per-agent
/// bin directories.
const PATH_PRESERVE: &str = r#"export PATH="$HOME/.local/bin:$HOME/.amp/bin:$PATH""#;

/// Marker path for an agent.
#[must_use]
pub fn marker_path(agent: Agent) -> String {
    format!("{MARKER_DIR}/{agent}")
}

/// Render one install step as a remote shell command.
#[must_use]
pub fn install_command(agent: Agent, step: &InstallStep) -> String {
    match step {
        InstallStep::Curl { url, shell } => {
            let pipe = format!("curl -fsSL {} | {shell}", quote(url));
            if matches!(agent, Agent::Claude | Agent::Amp) {
                format!("{PATH_PRESERVE}; {pipe}")
            } else {
                pipe
            }
        }
        InstallStep::Npm { package } => format!("npm install -g {}", quote(package)),
    }
}

/// Whether the marker lets us skip the install entirely.
async fn marker_satisfies(handle: &dyn SandboxHandle, agent: Agent) -> Result<bool> {
    let marker = marker_path(agent);
    if agent.auto_updates() {
        let probe = handle
            .exec(&safe::test_flag('f', &marker), &ExecOptions::default())
            .await?;
        return Ok(probe.success());
    }

    // One round trip: marker mtime then sandbox-local "now".
    let command = format!("{} && date +%s", safe::stat_mtime(&marker));
    let output = handle.exec(&command, &ExecOptions::default()).await?;
    if !output.success() {
        return Ok(false);
    }
    let mut lines = output.stdout.lines();
    let (Some(mtime), Some(now)) = (lines.next(), lines.next()) else {
        return Ok(false);
    };
    let (Ok(mtime), Ok(now)) = (mtime.trim().parse::<u64>(), now.trim().parse::<u64>()) else {
        return Ok(false);
    };
    Ok(now.saturating_sub(mtime) < INSTALL_TTL.as_secs())
}

/// Install `agent` unless a valid marker says it is already present.
///
/// # Errors
///
/// Returns an `agent` error when every install recipe fails.
pub async fn ensure_agent_installed(
    handle: &dyn SandboxHandle,
    agent: Agent,
    force: bool,
) -> Result<()> {
    if agent == Agent::Shell {
        return Ok(());
    }

    if !force && marker_satisfies(handle, agent).await? {
        debug!(%agent, "install marker valid, skipping install");
        return Ok(());
    }

    let opts = ExecOptions {
        timeout: Some(INSTALL_TIMEOUT),
        ..ExecOptions::default()
    };
    let mut last_failure = String::new();
    for step in agent.install_steps() {
        let command = install_command(agent, &step);
        debug!(%agent, %command, "running install step");
        let output = handle.exec(&command, &opts).await?;
        if output.success() {
            touch_marker(handle, agent).await;
            return Ok(());
        }
        warn!(%agent, exit = output.exit_code, "install step failed, trying next");
        last_failure = output.stderr;
    }

    Err(SandboxError::new(ErrorCode::Agent, "install agent")
        .with_agent(agent.to_string())
        .with_sandbox_id(handle.id())
        .with_context("stderr", last_failure)
        .with_suggestion(format!("Install {agent} manually inside the sandbox"))
        .into())
}

/// Best-effort marker refresh after a successful install.
async fn touch_marker(handle: &dyn SandboxHandle, agent: Agent) {
    let command = format!(
        "{} && {}",
        safe::mkdir_p(MARKER_DIR),
        safe::touch(&marker_path(agent))
    );
    if let Err(err) = handle.exec(&command, &ExecOptions::default()).await {
        debug!(%agent, %err, "ignoring marker touch failure");
    }
}

/// Locate the agent binary inside the sandbox: well-known native paths,
/// then `command -v`, then the npm/node bin directory, then the bare
/// command name as a last resort.
///
/// # Errors
///
/// Returns an error only when probing the sandbox itself fails.
pub async fn resolve_agent_command_path(
    handle: &dyn SandboxHandle,
    agent: Agent,
) -> Result<String> {
    let command = agent.command();
    let home = remote_home(handle).await?;

    for relative in agent.native_binary_paths() {
        let candidate = format!("{home}/{relative}");
        let probe = handle
            .exec(&safe::test_flag('f', &candidate), &ExecOptions::default())
            .await?;
        if probe.success() {
            return Ok(candidate);
        }
    }

    let which = handle
        .exec(&format!("command -v {}", quote(command)), &ExecOptions::default())
        .await?;
    if which.success() && !which.stdout.trim().is_empty() {
        return Ok(which.stdout.trim().to_string());
    }

    // npm-installed agents live next to the node binary.
    let node_dir = handle
        .exec("command -v node", &ExecOptions::default())
        .await?;
    if node_dir.success()
        && let Some(dir) = node_dir.stdout.trim().rsplit_once('/').map(|(d, _)| d)
    {
        let candidate = format!("{dir}/{command}");
        let probe = handle
            .exec(&safe::test_flag('f', &candidate), &ExecOptions::default())
            .await?;
        if probe.success() {
            return Ok(candidate);
        }
    }

    Ok(command.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedHandle;

    #[test]
    fn test_marker_path_uses_agent_name() {
        assert_eq!(marker_path(Agent::Claude), "/amux/.installed/claude");
        assert_eq!(marker_path(Agent::Codex), "/amux/.installed/codex");
    }

    #[test]
    fn test_install_command_preserves_path_for_claude_and_amp() {
        let step = InstallStep::Curl {
            url: "https://claude.ai/install.sh",
            shell: "bash",
        };
        let cmd = install_command(Agent::Claude, &step);
        assert!(cmd.starts_with("export PATH=\"$HOME/.local/bin:$HOME/.amp/bin:$PATH\";"));
        assert!(cmd.contains("curl -fsSL 'https://claude.ai/install.sh' | bash"));

        let droid = install_command(
            Agent::Droid,
            &InstallStep::Curl {
                url: "https://app.factory.ai/cli",
                shell: "sh",
            },
        );
        assert!(!droid.contains("export PATH"));
    }

    #[test]
    fn test_install_command_npm_quotes_package() {
        let cmd = install_command(Agent::Codex, &InstallStep::Npm { package: "@openai/codex" });
        assert_eq!(cmd, "npm install -g '@openai/codex'");
    }

    #[tokio::test]
    async fn test_shell_agent_never_installs() {
        let handle = ScriptedHandle::new("sbx");
        ensure_agent_installed(&handle, Agent::Shell, true)
            .await
            .expect("shell is always installed");
        assert_eq!(handle.exec_count(), 0);
    }

    #[tokio::test]
    async fn test_auto_update_agent_skips_on_marker_existence() {
        let handle = ScriptedHandle::new("sbx");
        handle.on("test -f '/amux/.installed/claude'", 0, "");
        ensure_agent_installed(&handle, Agent::Claude, false)
            .await
            .expect("skip");
        // Only the presence probe ran; no curl, no npm, no touch.
        assert_eq!(handle.exec_count(), 1);
        assert!(handle.executed("test -f '/amux/.installed/claude'"));
        assert!(!handle.executed("curl"));
    }

    #[tokio::test]
    async fn test_ttl_agent_skips_when_marker_fresh() {
        let handle = ScriptedHandle::new("sbx");
        // mtime one hour before "now".
        handle.on("stat -c %Y", 0, "1000000\n1003600\n");
        ensure_agent_installed(&handle, Agent::Codex, false)
            .await
            .expect("skip");
        assert!(!handle.executed("npm install"));
    }

    #[tokio::test]
    async fn test_ttl_agent_reinstalls_when_marker_stale() {
        let handle = ScriptedHandle::new("sbx");
        // mtime 25 hours before "now".
        handle.on("stat -c %Y", 0, "1000000\n1090000\n");
        handle.on("npm install -g '@openai/codex'", 0, "");
        handle.on("touch", 0, "");
        ensure_agent_installed(&handle, Agent::Codex, false)
            .await
            .expect("reinstall");
        assert!(handle.executed("npm install -g '@openai/codex'"));
        assert!(handle.executed("touch '/amux/.installed/codex'"));
    }

    #[tokio::test]
    async fn test_missing_marker_triggers_install() {
        let handle = ScriptedHandle::new("sbx");
        handle.on("stat -c %Y", 1, "");
        handle.on("npm install", 0, "");
        ensure_agent_installed(&handle, Agent::Gemini, false)
            .await
            .expect("install");
        assert!(handle.executed("npm install -g '@google/gemini-cli'"));
    }

    #[tokio::test]
    async fn test_force_bypasses_marker_check() {
        let handle = ScriptedHandle::new("sbx");
        handle.on("npm install", 0, "");
        ensure_agent_installed(&handle, Agent::Codex, true)
            .await
            .expect("install");
        assert!(!handle.executed("stat -c %Y"));
        assert!(handle.executed("npm install"));
    }

    #[tokio::test]
    async fn test_fallback_step_runs_when_first_fails() {
        let handle = ScriptedHandle::new("sbx");
        handle.on("test -f", 1, "");
        handle.on("stat -c %Y", 1, "");
        handle.on("curl -fsSL", 1, "");
        handle.on("npm install -g 'opencode-ai'", 0, "");
        ensure_agent_installed(&handle, Agent::Opencode, false)
            .await
            .expect("fallback succeeds");
        assert!(handle.executed("curl -fsSL"));
        assert!(handle.executed("npm install -g 'opencode-ai'"));
    }

    #[tokio::test]
    async fn test_all_steps_failing_yields_agent_error() {
        let handle = ScriptedHandle::new("sbx");
        handle.on("stat -c %Y", 1, "");
        handle.on("curl -fsSL", 1, "");
        handle.on("npm install", 1, "");
        let err = ensure_agent_installed(&handle, Agent::Opencode, false)
            .await
            .expect_err("all steps fail");
        let structured = crate::error::get_sandbox_error(&err).expect("structured");
        assert_eq!(structured.code(), ErrorCode::Agent);
        assert_eq!(structured.agent(), Some("opencode"));
    }

    #[tokio::test]
    async fn test_resolve_prefers_native_path() {
        let handle = ScriptedHandle::new("sbx");
        handle.on("printf '%s' \"$HOME\"", 0, "/root");
        handle.on("test -f '/root/.local/bin/claude'", 0, "");
        let path = resolve_agent_command_path(&handle, Agent::Claude)
            .await
            .expect("resolve");
        assert_eq!(path, "/root/.local/bin/claude");
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_command_v() {
        let handle = ScriptedHandle::new("sbx");
        handle.on("printf '%s' \"$HOME\"", 0, "/root");
        handle.on("test -f", 1, "");
        handle.on("command -v 'codex'", 0, "/usr/local/bin/codex\n");
        let path = resolve_agent_command_path(&handle, Agent::Codex)
            .await
            .expect("resolve");
        assert_eq!(path, "/usr/local/bin/codex");
    }

    #[tokio::test]
    async fn test_resolve_tries_node_bin_directory() {
        let handle = ScriptedHandle::new("sbx");
        handle.on("printf '%s' \"$HOME\"", 0, "/root");
        handle.on("test -f '/root/.local/bin/gemini'", 1, "");
        handle.on("command -v 'gemini'", 1, "");
        handle.on("command -v node", 0, "/usr/local/share/nvm/current/bin/node\n");
        handle.on("test -f '/usr/local/share/nvm/current/bin/gemini'", 0, "");
        let path = resolve_agent_command_path(&handle, Agent::Gemini)
            .await
            .expect("resolve");
        assert_eq!(path, "/usr/local/share/nvm/current/bin/gemini");
    }

    #[tokio::test]
    async fn test_resolve_returns_bare_command_as_last_resort() {
        let handle = ScriptedHandle::new("sbx");
        handle.on("printf '%s' \"$HOME\"", 0, "/root");
        handle.on("test -f", 1, "");
        handle.on("command -v", 1, "");
        let path = resolve_agent_command_path(&handle, Agent::Droid)
            .await
            .expect("resolve");
        assert_eq!(path, "droid");
    }
}
