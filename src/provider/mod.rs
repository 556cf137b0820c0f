//! Provider drivers: the pluggable seam between amux and sandbox backends.
//!
//! A driver implements [`Provider`]; optional capabilities are discovered
//! through [`Provider::supports_feature`] and the accessor methods returning
//! `Option<&dyn …>` managers. The registry owns one driver per name and
//! remembers why unavailable drivers failed to construct.

pub mod daytona;
pub mod docker;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::{ProviderSettings, VolumeMount};
use crate::error::{ErrorCode, SandboxError};
use crate::sandbox::SandboxHandle;

/// Optional driver capabilities. Queried, never assumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Volumes,
    Snapshots,
    Desktop,
    PreviewUrls,
    SshAccess,
    ExecSessions,
    Checkpoints,
    NetworkPolicy,
    TcpProxy,
}

/// A provider-owned volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub state: String,
    pub size_gb: Option<u64>,
}

/// Everything a driver needs to create a sandbox.
#[derive(Debug, Clone)]
pub struct CreateSandboxRequest {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub snapshot: Option<String>,
    pub mounts: Vec<VolumeMount>,
    pub auto_stop_minutes: u32,
}

/// Volume lifecycle, exposed by drivers with [`Feature::Volumes`].
#[async_trait]
pub trait VolumeManager: Send + Sync {
    async fn get_or_create(&self, name: &str) -> Result<Volume>;

    /// Poll until the volume is usable. `timeout` of zero means the 60 s
    /// default; the poll cadence is 1.5 s.
    async fn wait_ready(&self, name: &str, timeout: Duration) -> Result<Volume>;

    async fn delete(&self, name: &str) -> Result<()>;
}

/// A provider-side snapshot (pre-built image).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub id: String,
    pub name: String,
    pub state: String,
}

/// Snapshot management, exposed by drivers with [`Feature::Snapshots`].
#[async_trait]
pub trait SnapshotManager: Send + Sync {
    async fn list(&self) -> Result<Vec<SnapshotInfo>>;
    async fn create(&self, name: &str, image: &SnapshotImage) -> Result<SnapshotInfo>;
}

/// Minimal image build DSL: a base image plus `RUN` lines, rendered as a
/// Dockerfile with exec-form argument lists.
#[derive(Debug, Clone, Default)]
pub struct SnapshotImage {
    base: String,
    runs: Vec<Vec<String>>,
}

impl SnapshotImage {
    #[must_use]
    pub fn from_base(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            runs: Vec::new(),
        }
    }

    #[must_use]
    pub fn run<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runs.push(args.into_iter().map(Into::into).collect());
        self
    }

    /// Render the Dockerfile. Argument tokens are `"`-quoted with embedded
    /// quotes and backslashes escaped.
    #[must_use]
    pub fn dockerfile(&self) -> String {
        let mut out = format!("FROM {}\n", self.base);
        for run in &self.runs {
            let args: Vec<String> = run
                .iter()
                .map(|a| format!("\"{}\"", a.replace('\\', "\\\\").replace('"', "\\\"")))
                .collect();
            out.push_str(&format!("RUN [{}]\n", args.join(", ")));
        }
        out
    }
}

/// A short-lived SSH access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshToken {
    pub token: String,
    pub expires_in_minutes: u32,
}

/// Where a validated token may connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    pub host: String,
}

/// Token-authenticated SSH, exposed by drivers with [`Feature::SshAccess`].
#[async_trait]
pub trait SshAccess: Send + Sync {
    async fn create_token(&self, sandbox_id: &str, ttl_minutes: u32) -> Result<SshToken>;

    /// Poll the validation endpoint until the token is usable and a runner
    /// domain is known.
    async fn wait_token_valid(&self, token: &str) -> Result<SshEndpoint>;

    async fn revoke_token(&self, token: &str) -> Result<()>;
}

/// A sandbox backend driver.
#[async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn supports_feature(&self, feature: Feature) -> bool;

    async fn create_sandbox(&self, request: &CreateSandboxRequest)
    -> Result<Arc<dyn SandboxHandle>>;

    async fn get_sandbox(&self, id: &str) -> Result<Arc<dyn SandboxHandle>>;

    async fn list_sandboxes(&self) -> Result<Vec<Arc<dyn SandboxHandle>>>;

    async fn delete_sandbox(&self, id: &str) -> Result<()>;

    fn volumes(&self) -> Option<&dyn VolumeManager> {
        None
    }

    fn snapshots(&self) -> Option<&dyn SnapshotManager> {
        None
    }

    fn ssh_access(&self) -> Option<&dyn SshAccess> {
        None
    }
}

/// Name → driver table with an optional default and a parallel record of
/// drivers that failed to construct.
#[derive(Default)]
pub struct ProviderRegistry {
    drivers: BTreeMap<String, Arc<dyn Provider>>,
    errors: BTreeMap<String, String>,
    default: Option<String>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver: Arc<dyn Provider>) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    /// Record that a driver could not be constructed; [`ProviderRegistry::get`]
    /// reports the reason.
    pub fn register_error(&mut self, name: impl Into<String>, error: impl Into<String>) {
        self.errors.insert(name.into(), error.into());
    }

    pub fn set_default(&mut self, name: impl Into<String>) {
        self.default = Some(name.into());
    }

    #[must_use]
    pub fn default_name(&self) -> Option<&str> {
        self.default.as_deref()
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.drivers.keys().cloned().collect()
    }

    #[must_use]
    pub fn construction_errors(&self) -> &BTreeMap<String, String> {
        &self.errors
    }

    /// Look up a driver by name.
    ///
    /// # Errors
    ///
    /// Returns a `config` error for unknown names, including the recorded
    /// construction failure when there is one.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>> {
        if let Some(driver) = self.drivers.get(name) {
            return Ok(Arc::clone(driver));
        }
        let mut err = SandboxError::new(ErrorCode::Config, "resolve provider")
            .with_context("provider", name.to_string());
        if let Some(reason) = self.errors.get(name) {
            err = err
                .with_source(anyhow::anyhow!("provider failed to initialize: {reason}"))
                .with_suggestion("Fix the provider credentials and retry");
        } else {
            err = err.with_suggestion(format!(
                "Unknown provider '{name}'; available: {}",
                self.names().join(", ")
            ));
        }
        Err(err.into())
    }
}

/// Construct every driver whose credentials are present. The local docker
/// driver is always registered; daytona requires an API key. The default is
/// daytona when configured, docker otherwise.
#[must_use]
pub fn default_registry(settings: &ProviderSettings) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();

    registry.register(Arc::new(docker::DockerProvider::new()));

    match &settings.daytona {
        Some(daytona) => match daytona::DaytonaProvider::new(daytona.clone()) {
            Ok(driver) => {
                registry.register(Arc::new(driver));
                registry.set_default(daytona::PROVIDER_NAME);
            }
            Err(err) => {
                registry.register_error(daytona::PROVIDER_NAME, format!("{err:#}"));
                registry.set_default(docker::PROVIDER_NAME);
            }
        },
        None => {
            registry.register_error(
                daytona::PROVIDER_NAME,
                "no API key (set AMUX_DAYTONA_API_KEY or DAYTONA_API_KEY)",
            );
            registry.set_default(docker::PROVIDER_NAME);
        }
    }

    registry
}

/// Pick a provider: CLI override first, then `AMUX_PROVIDER`, then the
/// registry default.
///
/// # Errors
///
/// Returns an error when the chosen name is unknown, failed to construct,
/// or no default exists.
pub fn resolve_provider(
    registry: &ProviderRegistry,
    cli_override: Option<&str>,
) -> Result<Arc<dyn Provider>> {
    resolve_provider_with(registry, cli_override, |name| std::env::var(name).ok())
}

/// [`resolve_provider`] with an injectable environment lookup.
///
/// # Errors
///
/// Same as [`resolve_provider`].
pub fn resolve_provider_with(
    registry: &ProviderRegistry,
    cli_override: Option<&str>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Arc<dyn Provider>> {
    if let Some(name) = cli_override {
        return registry.get(name);
    }
    if let Some(name) = lookup("AMUX_PROVIDER").filter(|v| !v.is_empty()) {
        return registry.get(&name);
    }
    match registry.default_name() {
        Some(name) => registry.get(name),
        None => Err(SandboxError::new(ErrorCode::Config, "resolve provider")
            .with_suggestion("Configure a provider (e.g. set AMUX_DAYTONA_API_KEY)")
            .into()),
    }
}
