//! Health checks on both ends of the wire.
//!
//! Local preflight validates the laptop can reach the provider and drive a
//! session before any sandbox work starts. In-sandbox probes classify the
//! running sandbox as healthy/degraded/unhealthy, and `repair` applies a
//! per-check remediation where one exists.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

use crate::agent::Agent;
use crate::config::ProviderSettings;
use crate::sandbox::{ExecOptions, SandboxHandle};
use crate::session::find_in_path;
use crate::shell::safe;

/// Minimum free space in the temp directory for archive staging.
const MIN_TEMP_DISK_BYTES: u64 = 1024 * 1024 * 1024;

/// Well-known endpoint for the in-sandbox connectivity probe.
const NETWORK_PROBE_URL: &str = "https://example.com";

/// Disk usage thresholds inside the sandbox.
const DISK_WARN_PERCENT: u8 = 80;
const DISK_FAIL_PERCENT: u8 = 95;

/// Zombie processes tolerated before the process table counts as degraded.
const ZOMBIE_LIMIT: u32 = 10;

// ── Local preflight ───────────────────────────────────────────────────────────

/// One preflight check outcome.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub suggestion: Option<String>,
    pub details: BTreeMap<String, String>,
    /// Blocking failures abort the run; the rest are warnings.
    pub blocking: bool,
}

impl CheckResult {
    fn pass(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            message: message.into(),
            suggestion: None,
            details: BTreeMap::new(),
            blocking: true,
        }
    }

    fn fail(name: &str, message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            message: message.into(),
            suggestion: Some(suggestion.into()),
            details: BTreeMap::new(),
            blocking: true,
        }
    }

    fn warning(mut self) -> Self {
        self.blocking = false;
        self
    }
}

/// Aggregated preflight outcome.
#[derive(Debug, Clone, Default)]
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
    pub skipped: bool,
}

impl PreflightReport {
    /// Blocking failures.
    #[must_use]
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.checks
            .iter()
            .filter(|c| !c.passed && c.blocking)
            .collect()
    }

    /// Non-blocking failures.
    #[must_use]
    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.checks
            .iter()
            .filter(|c| !c.passed && !c.blocking)
            .collect()
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.errors().is_empty()
    }
}

fn check_api_key(settings: &ProviderSettings, provider_name: &str) -> CheckResult {
    match provider_name {
        "daytona" => {
            if settings.daytona.is_some() {
                CheckResult::pass("api-key", "Daytona API key present")
            } else {
                CheckResult::fail(
                    "api-key",
                    "No Daytona API key configured",
                    "Set AMUX_DAYTONA_API_KEY (or DAYTONA_API_KEY)",
                )
            }
        }
        "docker" => {
            if find_in_path("docker").is_some() {
                CheckResult::pass("api-key", "docker CLI found")
            } else {
                CheckResult::fail(
                    "api-key",
                    "docker CLI not found on PATH",
                    "Install Docker or pick another provider",
                )
            }
        }
        other => CheckResult::fail(
            "api-key",
            format!("Unknown provider '{other}'"),
            "Use 'daytona' or 'docker'",
        ),
    }
}

fn check_ssh_client() -> CheckResult {
    if find_in_path("ssh").is_some() {
        CheckResult::pass("ssh", "ssh client found")
    } else {
        CheckResult::fail(
            "ssh",
            "ssh client not found on PATH",
            "Install the OpenSSH client",
        )
    }
}

async fn check_provider_reachable(api_url: &str) -> CheckResult {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            return CheckResult::fail(
                "network",
                format!("Cannot build HTTP client: {err}"),
                "Check your TLS configuration",
            );
        }
    };
    match client.head(api_url).send().await {
        Ok(_) => CheckResult::pass("network", format!("{api_url} reachable")),
        Err(err) => CheckResult::fail(
            "network",
            format!("Cannot reach {api_url}: {err}"),
            "Check your internet connection",
        ),
    }
}

fn check_terminal() -> CheckResult {
    use std::io::IsTerminal;
    if std::io::stdin().is_terminal() {
        CheckResult::pass("terminal", "stdin is a TTY")
    } else {
        CheckResult::fail(
            "terminal",
            "stdin is not a terminal",
            "Run amux from an interactive terminal for sessions",
        )
    }
}

fn check_temp_disk() -> CheckResult {
    let temp = std::env::temp_dir();
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let available = disks
        .iter()
        .filter(|disk| temp.starts_with(disk.mount_point()))
        .map(sysinfo::Disk::available_space)
        .max();
    match available {
        Some(bytes) if bytes >= MIN_TEMP_DISK_BYTES => {
            CheckResult::pass("disk", format!("{} MiB free in temp", bytes / 1024 / 1024))
        }
        Some(bytes) => CheckResult::fail(
            "disk",
            format!("Only {} MiB free in temp", bytes / 1024 / 1024),
            "Free at least 1 GiB for archive staging",
        )
        .warning(),
        None => CheckResult::pass("disk", "temp disk not identified, skipping").warning(),
    }
}

fn check_tool(name: &str, hint: &str) -> CheckResult {
    if find_in_path(name).is_some() {
        CheckResult::pass(name, format!("{name} found")).warning()
    } else {
        CheckResult::fail(name, format!("{name} not found on PATH"), hint).warning()
    }
}

/// Run the local preflight suite. `AMUX_SKIP_PREFLIGHT=1` bypasses it
/// entirely.
pub async fn run_preflight(
    settings: &ProviderSettings,
    provider_name: &str,
    interactive: bool,
) -> PreflightReport {
    if std::env::var("AMUX_SKIP_PREFLIGHT").as_deref() == Ok("1") {
        debug!("preflight skipped via AMUX_SKIP_PREFLIGHT");
        return PreflightReport {
            checks: Vec::new(),
            skipped: true,
        };
    }

    let mut checks = vec![check_api_key(settings, provider_name), check_ssh_client()];

    if let Some(daytona) = &settings.daytona
        && provider_name == "daytona"
    {
        checks.push(check_provider_reachable(&daytona.api_url).await);
    }
    if interactive {
        checks.push(check_terminal());
    }

    checks.push(check_temp_disk());
    checks.push(check_tool("git", "Install git to sync version-controlled trees"));
    checks.push(check_tool("node", "Install node for npm-based agent installs"));
    checks.push(check_tool("npm", "Install npm for npm-based agent installs"));

    PreflightReport {
        checks,
        skipped: false,
    }
}

// ── In-sandbox health ─────────────────────────────────────────────────────────

/// Classification of one probe; ordered worst-first so the minimum is the
/// overall status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    Unknown,
    Unhealthy,
    Degraded,
    Healthy,
}

/// One in-sandbox probe outcome.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub name: &'static str,
    pub status: HealthStatus,
    pub detail: String,
}

/// Aggregated sandbox health.
#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    /// The worst status across all probes; `Healthy` for an empty report.
    #[must_use]
    pub fn overall(&self) -> HealthStatus {
        self.checks
            .iter()
            .map(|c| c.status)
            .min()
            .unwrap_or(HealthStatus::Healthy)
    }
}

/// Parse the use% column of `df -P /` output.
#[must_use]
pub fn parse_disk_usage_percent(df_output: &str) -> Option<u8> {
    let line = df_output.lines().nth(1)?;
    line.split_whitespace()
        .find(|field| field.ends_with('%'))
        .and_then(|field| field.trim_end_matches('%').parse().ok())
}

async fn probe(handle: &dyn SandboxHandle, command: &str) -> (HealthStatus, String) {
    match handle.exec(command, &ExecOptions::default()).await {
        Ok(output) if output.success() => (HealthStatus::Healthy, output.stdout),
        Ok(output) => (HealthStatus::Unhealthy, output.stderr),
        Err(err) => (HealthStatus::Unknown, err.to_string()),
    }
}

/// Run every in-sandbox probe.
pub async fn check_sandbox_health(handle: &dyn SandboxHandle, agent: Agent) -> HealthReport {
    let mut checks = Vec::new();

    let (liveness, detail) = probe(handle, "echo healthy").await;
    let liveness = if liveness == HealthStatus::Healthy && !detail.contains("healthy") {
        HealthStatus::Unhealthy
    } else {
        liveness
    };
    checks.push(HealthCheck {
        name: "liveness",
        status: liveness,
        detail,
    });

    let (credentials, detail) = probe(handle, &safe::test_flag('d', "/amux/home")).await;
    checks.push(HealthCheck {
        name: "credentials",
        status: credentials,
        detail,
    });

    if agent != Agent::Shell {
        let (present, detail) = probe(
            handle,
            &format!("command -v {}", crate::shell::quote(agent.command())),
        )
        .await;
        checks.push(HealthCheck {
            name: "agent",
            status: present,
            detail,
        });
    }

    let (network, detail) = probe(
        handle,
        &format!("curl -fsI --max-time 10 -o /dev/null {NETWORK_PROBE_URL}"),
    )
    .await;
    checks.push(HealthCheck {
        name: "network",
        status: network,
        detail,
    });

    match handle.exec("df -P /", &ExecOptions::default()).await {
        Ok(output) if output.success() => {
            let status = match parse_disk_usage_percent(&output.stdout) {
                Some(pct) if pct >= DISK_FAIL_PERCENT => HealthStatus::Unhealthy,
                Some(pct) if pct >= DISK_WARN_PERCENT => HealthStatus::Degraded,
                Some(_) => HealthStatus::Healthy,
                None => HealthStatus::Unknown,
            };
            checks.push(HealthCheck {
                name: "disk",
                status,
                detail: output.stdout,
            });
        }
        _ => checks.push(HealthCheck {
            name: "disk",
            status: HealthStatus::Unknown,
            detail: String::new(),
        }),
    }

    match handle
        .exec("ps -eo stat= | grep -c '^Z' || true", &ExecOptions::default())
        .await
    {
        Ok(output) => {
            let zombies: u32 = output.stdout.trim().parse().unwrap_or(0);
            let status = if zombies > ZOMBIE_LIMIT {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            };
            checks.push(HealthCheck {
                name: "processes",
                status,
                detail: format!("{zombies} zombie processes"),
            });
        }
        Err(err) => checks.push(HealthCheck {
            name: "processes",
            status: HealthStatus::Unknown,
            detail: err.to_string(),
        }),
    }

    HealthReport { checks }
}

/// Apply per-check remediations for recoverable failures. Returns the
/// actions taken; remediation errors are logged and skipped.
pub async fn repair(handle: &dyn SandboxHandle, agent: Agent, report: &HealthReport) -> Vec<String> {
    let mut actions = Vec::new();
    for check in &report.checks {
        if check.status == HealthStatus::Healthy {
            continue;
        }
        let outcome: Result<&str> = match check.name {
            "liveness" => handle.start().await.map(|()| "restarted sandbox"),
            "credentials" => crate::home::setup_persistent_home(handle)
                .await
                .map(|()| "re-created credential layout"),
            "agent" => crate::installer::ensure_agent_installed(handle, agent, true)
                .await
                .map(|()| "reinstalled agent"),
            _ => continue,
        };
        match outcome {
            Ok(action) => actions.push(action.to_string()),
            Err(err) => warn!(check = check.name, %err, "repair action failed"),
        }
    }
    actions
}
