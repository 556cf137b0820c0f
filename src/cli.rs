//! The `amux` command surface. Thin wrappers over the library; all
//! semantics live in the library modules.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;

use crate::agent::Agent;
use crate::config::{ProviderSettings, SandboxConfig};
use crate::error::{ErrorCode, get_sandbox_error};
use crate::health::HealthStatus;
use crate::meta::MetaStore;
use crate::provider::{Provider, default_registry, resolve_provider};
use crate::sandbox::{ExecOptions, SandboxHandle, remote_home};

#[derive(Parser)]
#[command(name = "amux", version, about = "Remote sandboxes for CLI coding agents")]
pub struct Cli {
    /// Provider to use (defaults to AMUX_PROVIDER, then the registry default)
    #[arg(long, global = true)]
    pub provider: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or reuse the sandbox for this directory and prepare it
    Up {
        /// Agent to install (claude, codex, opencode, amp, gemini, droid, shell)
        #[arg(long, default_value = "shell")]
        agent: String,
        /// Replace the sandbox even when the configuration is unchanged
        #[arg(long)]
        recreate: bool,
        /// Snapshot image id (defaults to AMUX_SNAPSHOT_ID)
        #[arg(long)]
        snapshot: Option<String>,
        /// Also sync local agent settings (secrets stripped)
        #[arg(long)]
        sync_settings: bool,
    },
    /// Open an interactive agent session in the sandbox
    Run {
        /// Agent to run
        agent: String,
        /// Record the session into this sandbox-side file
        #[arg(long)]
        record: Option<String>,
        /// Arguments passed through to the agent
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run a command inside the sandbox workspace
    Exec {
        /// Command and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Sync the workspace (up by default)
    Sync {
        /// Download the sandbox workspace instead of uploading
        #[arg(long)]
        down: bool,
        /// Force a full tarball upload
        #[arg(long)]
        full: bool,
        /// Include the .git directory
        #[arg(long)]
        include_git: bool,
    },
    /// Check local prerequisites and sandbox health
    Doctor,
    /// Show the sandbox recorded for this directory
    Status,
    /// Delete the sandbox for this directory
    Delete,
}

struct AppContext {
    provider: Arc<dyn Provider>,
    settings: ProviderSettings,
    store: MetaStore,
    cwd: PathBuf,
}

impl Cli {
    /// Dispatch the parsed command.
    ///
    /// # Errors
    ///
    /// Returns any error from the underlying library operation.
    pub async fn run(self) -> Result<ExitCode> {
        let settings = ProviderSettings::from_env();
        let registry = default_registry(&settings);
        let provider = resolve_provider(&registry, self.provider.as_deref())?;
        let ctx = AppContext {
            provider,
            settings,
            store: MetaStore::new()?,
            cwd: std::env::current_dir().context("resolving working directory")?,
        };

        match self.command {
            Command::Up {
                agent,
                recreate,
                snapshot,
                sync_settings,
            } => up(&ctx, &agent, recreate, snapshot, sync_settings).await,
            Command::Run {
                agent,
                record,
                args,
            } => run_session(&ctx, &agent, record, args).await,
            Command::Exec { command } => exec(&ctx, &command).await,
            Command::Sync {
                down,
                full,
                include_git,
            } => sync(&ctx, down, full, include_git).await,
            Command::Doctor => doctor(&ctx).await,
            Command::Status => status(&ctx),
            Command::Delete => delete(&ctx).await,
        }
    }
}

fn project_name(cwd: &std::path::Path) -> String {
    cwd.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string())
}

fn base_config(ctx: &AppContext, agent: Agent, snapshot: Option<String>) -> SandboxConfig {
    SandboxConfig {
        agent,
        project: project_name(&ctx.cwd),
        snapshot: snapshot.or_else(|| ctx.settings.snapshot_id.clone()),
        ..SandboxConfig::default()
    }
}

async fn ensure(
    ctx: &AppContext,
    agent: Agent,
    recreate: bool,
    snapshot: Option<String>,
) -> Result<(Arc<dyn SandboxHandle>, crate::meta::SandboxMeta)> {
    let config = base_config(ctx, agent, snapshot);
    crate::lifecycle::ensure_sandbox(&ctx.provider, &ctx.cwd, config, recreate, &ctx.store).await
}

fn preflight_gate(report: &crate::health::PreflightReport) -> Result<()> {
    for warning in report.warnings() {
        eprintln!(
            "{} {}: {}",
            "warn".yellow(),
            warning.name,
            warning.message
        );
    }
    if report.passed() {
        return Ok(());
    }
    for error in report.errors() {
        eprintln!("{} {}: {}", "fail".red(), error.name, error.message);
        if let Some(suggestion) = &error.suggestion {
            eprintln!("       {suggestion}");
        }
    }
    Err(crate::error::SandboxError::new(ErrorCode::Preflight, "preflight").into())
}

async fn up(
    ctx: &AppContext,
    agent: &str,
    recreate: bool,
    snapshot: Option<String>,
    sync_settings: bool,
) -> Result<ExitCode> {
    let agent: Agent = agent.parse()?;
    let report = crate::health::run_preflight(&ctx.settings, ctx.provider.name(), false).await;
    preflight_gate(&report)?;

    let (handle, meta) = ensure(ctx, agent, recreate, snapshot).await?;
    if let Err(err) = crate::home::setup_persistent_home(handle.as_ref()).await {
        eprintln!("{} persistent home setup failed: {err:#}", "warn".yellow());
    }
    crate::home::prepare_agent_home(handle.as_ref(), agent).await?;
    crate::installer::ensure_agent_installed(handle.as_ref(), agent, false).await?;

    let home = remote_home(handle.as_ref()).await?;
    let paths = crate::sync::remote_paths(&home, &meta.worktree_id);
    crate::sync::smart_sync(handle.as_ref(), &ctx.cwd, &paths, false).await?;

    if sync_settings {
        let local_home = dirs::home_dir().context("cannot determine home directory")?;
        let uploaded =
            crate::settings::sync_settings(handle.as_ref(), true, &local_home).await?;
        for file in uploaded {
            println!("  synced {file}");
        }
    }

    println!(
        "{} sandbox {} ready on {}",
        "ok".green(),
        meta.sandbox_id.bold(),
        meta.provider
    );
    Ok(ExitCode::SUCCESS)
}

async fn run_session(
    ctx: &AppContext,
    agent: &str,
    record: Option<String>,
    args: Vec<String>,
) -> Result<ExitCode> {
    let agent: Agent = agent.parse()?;
    let report = crate::health::run_preflight(&ctx.settings, ctx.provider.name(), true).await;
    preflight_gate(&report)?;

    let (handle, meta) = ensure(ctx, agent, false, None).await?;
    crate::home::prepare_agent_home(handle.as_ref(), agent).await?;
    crate::installer::ensure_agent_installed(handle.as_ref(), agent, false).await?;

    let opts = crate::session::SessionOptions {
        args,
        record_path: record,
        ..crate::session::SessionOptions::default()
    };
    let code = crate::session::run_agent_interactive(
        &ctx.provider,
        &handle,
        agent,
        &meta.worktree_id,
        &opts,
    )
    .await?;
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    Ok(ExitCode::from(code.clamp(0, 255) as u8))
}

async fn exec(ctx: &AppContext, command: &[String]) -> Result<ExitCode> {
    let (handle, meta) = ensure(ctx, Agent::Shell, false, None).await?;
    let home = remote_home(handle.as_ref()).await?;
    let paths = crate::sync::remote_paths(&home, &meta.worktree_id);
    let opts = ExecOptions {
        cwd: Some(paths.repo),
        ..ExecOptions::default()
    };
    let output = handle
        .exec(&crate::shell::join(command.iter()), &opts)
        .await?;
    print!("{}", output.stdout);
    eprint!("{}", output.stderr);
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    Ok(ExitCode::from(output.exit_code.clamp(0, 255) as u8))
}

async fn sync(ctx: &AppContext, down: bool, full: bool, include_git: bool) -> Result<ExitCode> {
    let (handle, meta) = ensure(ctx, Agent::Shell, false, None).await?;
    let home = remote_home(handle.as_ref()).await?;
    let paths = crate::sync::remote_paths(&home, &meta.worktree_id);

    if down {
        crate::sync::sync_down(handle.as_ref(), &paths, &ctx.cwd).await?;
        println!("{} workspace downloaded", "ok".green());
        return Ok(ExitCode::SUCCESS);
    }

    let outcome = if full {
        crate::sync::tarball::full_upload(handle.as_ref(), &ctx.cwd, &paths.repo, include_git)
            .await?;
        crate::sync::SyncOutcome::Full
    } else {
        crate::sync::smart_sync(handle.as_ref(), &ctx.cwd, &paths, include_git).await?
    };
    match outcome {
        crate::sync::SyncOutcome::Full => println!("{} full upload complete", "ok".green()),
        crate::sync::SyncOutcome::Incremental { uploaded, deleted } => println!(
            "{} incremental sync: {uploaded} uploaded, {deleted} deleted",
            "ok".green()
        ),
    }
    Ok(ExitCode::SUCCESS)
}

async fn doctor(ctx: &AppContext) -> Result<ExitCode> {
    let report = crate::health::run_preflight(&ctx.settings, ctx.provider.name(), true).await;
    if report.skipped {
        println!("preflight skipped (AMUX_SKIP_PREFLIGHT=1)");
        return Ok(ExitCode::SUCCESS);
    }
    for check in &report.checks {
        let tag = if check.passed {
            "pass".green().to_string()
        } else if check.blocking {
            "fail".red().to_string()
        } else {
            "warn".yellow().to_string()
        };
        println!("{tag} {:12} {}", check.name, check.message);
        if !check.passed
            && let Some(suggestion) = &check.suggestion
        {
            println!("     {}", suggestion.dimmed());
        }
    }

    // When a sandbox is recorded for this directory, probe it too.
    let worktree_id = crate::hash::compute_worktree_id(&ctx.cwd)?;
    if let Some(meta) = ctx.store.get(&worktree_id, ctx.provider.name())
        && let Ok(handle) = ctx.provider.get_sandbox(&meta.sandbox_id).await
    {
        let health = crate::health::check_sandbox_health(handle.as_ref(), meta.agent).await;
        println!("\nsandbox {}:", meta.sandbox_id.bold());
        for check in &health.checks {
            let tag = match check.status {
                HealthStatus::Healthy => "pass".green().to_string(),
                HealthStatus::Degraded => "warn".yellow().to_string(),
                HealthStatus::Unhealthy => "fail".red().to_string(),
                HealthStatus::Unknown => "????".dimmed().to_string(),
            };
            println!("{tag} {:12} {}", check.name, check.detail.lines().next().unwrap_or(""));
        }
    }

    Ok(if report.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn status(ctx: &AppContext) -> Result<ExitCode> {
    let worktree_id = crate::hash::compute_worktree_id(&ctx.cwd)?;
    match ctx.store.get(&worktree_id, ctx.provider.name()) {
        Some(meta) => {
            println!("sandbox:  {}", meta.sandbox_id);
            println!("provider: {}", meta.provider);
            println!("agent:    {}", meta.agent);
            println!("project:  {}", meta.project);
            println!("created:  {}", meta.created_at.to_rfc3339());
            Ok(ExitCode::SUCCESS)
        }
        None => {
            println!("no sandbox recorded for this directory; run 'amux up'");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn delete(ctx: &AppContext) -> Result<ExitCode> {
    match crate::lifecycle::remove_sandbox(&ctx.provider, &ctx.cwd, &ctx.store).await? {
        Some(id) => println!("{} deleted sandbox {id}", "ok".green()),
        None => println!("nothing to delete"),
    }
    Ok(ExitCode::SUCCESS)
}

/// Map an error to its process exit code class.
#[must_use]
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    get_sandbox_error(err).map_or(1, |s| match s.code() {
        ErrorCode::Config => 2,
        ErrorCode::Network | ErrorCode::Timeout => 3,
        ErrorCode::Ssh => 4,
        ErrorCode::Preflight => 5,
        _ => 1,
    })
}

/// Render an error for the terminal: the structured user message when one
/// exists, the plain chain otherwise.
#[must_use]
pub fn render_error(err: &anyhow::Error) -> String {
    match get_sandbox_error(err) {
        Some(structured) => structured.user_message(),
        None => format!("{err:#}"),
    }
}
