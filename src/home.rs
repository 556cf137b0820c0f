//! Persistent-home layout inside the sandbox.
//!
//! `/amux` is the persistent volume; `/amux/home/<name>` holds the real
//! directories and `$HOME/<name>` becomes a symlink into them, so agent
//! credentials and caches survive sandbox recreation. Pre-existing
//! non-symlink targets are removed before linking. Everything created here
//! holds live agent credentials, so directories are mode 700 and files
//! mode 600 before they are populated.

use anyhow::Result;
use tracing::debug;

use crate::agent::Agent;
use crate::config::PERSIST_MOUNT_PATH;
use crate::sandbox::{ExecOptions, SandboxHandle, remote_home, run_checked};
use crate::shell::{quote, safe};

/// Root of persisted home directories on the volume.
pub const PERSIST_HOME: &str = "/amux/home";

/// Home entries redirected onto the persistent volume.
const PERSIST_DIRS: [&str; 8] = [
    ".config", ".local", ".npm", ".claude", ".codex", ".gemini", ".amp", ".factory",
];

/// Claude cache directories relinked into `/tmp`; they are ephemeral and
/// churn too much for the volume.
const EPHEMERAL_CACHES: [&str; 2] = [".claude/cache", ".claude/debug"];

/// Presence of an agent's credential file inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialStatus {
    pub agent: Agent,
    pub has_credential: bool,
}

/// Replace `link` with a symlink to `target`, clearing any pre-existing
/// non-symlink entry first. The target directory is created mode 700.
fn replace_with_symlink(target: &str, link: &str) -> String {
    format!(
        "{mkdir} && {restrict} && if {exists} && ! {is_link}; then {clear}; fi && {ln}",
        mkdir = safe::mkdir_p(target),
        restrict = safe::chmod("700", target),
        exists = safe::test_flag('e', link),
        is_link = safe::test_flag('L', link),
        clear = safe::rm_rf(link),
        ln = safe::ln_sfn(target, link),
    )
}

/// Append `line` to `file` unless it is already present verbatim.
fn append_once(line: &str, file: &str) -> String {
    format!(
        "grep -qxF {line} {file} 2>/dev/null || echo {line} >> {file}",
        line = quote(line),
        file = quote(file),
    )
}

/// Lay out the persistent home: volume directories, the symlink farm, and
/// npm prefix/cache configuration.
///
/// # Errors
///
/// Returns an error when a remote command fails.
pub async fn setup_persistent_home(handle: &dyn SandboxHandle) -> Result<()> {
    let home = remote_home(handle).await?;
    let opts = ExecOptions::default();

    run_checked(
        handle,
        &format!(
            "{} && {} && {} && {}",
            safe::mkdir_p(PERSIST_MOUNT_PATH),
            safe::mkdir_p(PERSIST_HOME),
            safe::chmod("700", PERSIST_MOUNT_PATH),
            safe::chmod("700", PERSIST_HOME),
        ),
        &opts,
    )
    .await?;

    for name in PERSIST_DIRS {
        let target = format!("{PERSIST_HOME}/{name}");
        let link = format!("{home}/{name}");
        run_checked(handle, &replace_with_symlink(&target, &link), &opts).await?;
    }

    // Same treatment for the single .npmrc file.
    let npmrc_target = format!("{PERSIST_HOME}/.npmrc");
    let npmrc_link = format!("{home}/.npmrc");
    run_checked(
        handle,
        &format!(
            "{mkdir} && {touch} && {restrict} && if {exists} && ! {is_link}; then {clear}; fi && {ln}",
            mkdir = safe::mkdir_p(PERSIST_HOME),
            touch = safe::touch(&npmrc_target),
            restrict = safe::chmod("600", &npmrc_target),
            exists = safe::test_flag('e', &npmrc_link),
            is_link = safe::test_flag('L', &npmrc_link),
            clear = safe::rm_f(&npmrc_link),
            ln = safe::ln_sfn(&npmrc_target, &npmrc_link),
        ),
        &opts,
    )
    .await?;

    // npm installs land under the persisted prefix.
    for line in [
        format!("prefix={home}/.local"),
        format!("cache={home}/.npm"),
    ] {
        run_checked(handle, &append_once(&line, &npmrc_link), &opts).await?;
    }

    debug!("persistent home layout ready");
    Ok(())
}

/// Create the directories `agent` expects on first run and apply
/// agent-specific configuration tweaks.
///
/// # Errors
///
/// Returns an error when a remote command fails.
pub async fn prepare_agent_home(handle: &dyn SandboxHandle, agent: Agent) -> Result<()> {
    let home = remote_home(handle).await?;
    let opts = ExecOptions::default();

    for dir in agent.home_dirs() {
        let path = format!("{home}/{dir}");
        run_checked(
            handle,
            &format!("{} && {}", safe::mkdir_p(&path), safe::chmod("700", &path)),
            &opts,
        )
        .await?;
    }

    if agent == Agent::Codex {
        // Codex keeps auth in the filesystem only when told to.
        let config = format!("{home}/.codex/config.toml");
        run_checked(
            handle,
            &format!("{} && {}", safe::touch(&config), safe::chmod("600", &config)),
            &opts,
        )
        .await?;
        run_checked(
            handle,
            &format!(
                "grep -q 'cli_auth_credentials_store' {file} || echo {line} >> {file}",
                file = quote(&config),
                line = quote("cli_auth_credentials_store = \"file\""),
            ),
            &opts,
        )
        .await?;
    }

    if agent == Agent::Claude {
        for cache in EPHEMERAL_CACHES {
            let link = format!("{home}/{cache}");
            let tmp = format!("/tmp/amux-{}", cache.replace('/', "-"));
            let command = format!(
                "{clear} && {mkdir} && {ln}",
                clear = safe::rm_rf(&link),
                mkdir = safe::mkdir_p(&tmp),
                ln = safe::ln_sfn(&tmp, &link),
            );
            if let Err(err) = run_checked(handle, &command, &opts).await {
                debug!(%cache, %err, "ignoring cache relink failure");
            }
        }
    }

    Ok(())
}

/// Probe whether the agent has authenticated inside the sandbox.
///
/// # Errors
///
/// Returns an error when the probe command itself fails to run.
pub async fn check_agent_credentials(
    handle: &dyn SandboxHandle,
    agent: Agent,
) -> Result<CredentialStatus> {
    let Some(file) = agent.credential_file() else {
        return Ok(CredentialStatus {
            agent,
            has_credential: true,
        });
    };
    let home = remote_home(handle).await?;
    let probe = handle
        .exec(
            &safe::test_flag('f', &format!("{home}/{file}")),
            &ExecOptions::default(),
        )
        .await?;
    Ok(CredentialStatus {
        agent,
        has_credential: probe.success(),
    })
}
