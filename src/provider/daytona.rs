//! Remote-API driver: a thin HTTPS client over the Daytona sandbox API.
//!
//! Sandbox CRUD talks to the main API; per-sandbox operations (exec, file
//! transfer) go through a lazily-discovered "toolbox" base URL from which
//! `<toolbox>/<sandboxId>/…` subresource URLs are derived. Interactive SSH
//! uses short-lived tokens validated by polling.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::breaker::CircuitBreaker;
use crate::config::DaytonaSettings;
use crate::error::{ErrorCode, SandboxError};
use crate::sandbox::{
    ExecOptions, ExecOutput, SandboxHandle, SandboxState, wait_ready_by_polling,
};

use super::{
    CreateSandboxRequest, Feature, Provider, SnapshotImage, SnapshotInfo, SnapshotManager,
    SshAccess, SshEndpoint, SshToken, Volume, VolumeManager,
};

pub const PROVIDER_NAME: &str = "daytona";

/// SSH token readiness poll. Pinned constants, not configurable.
const SSH_POLL_INTERVAL: Duration = Duration::from_secs(1);
const SSH_POLL_BUDGET: Duration = Duration::from_secs(15);

/// Default SSH token lifetime.
pub const DEFAULT_SSH_TTL_MINUTES: u32 = 60;

const VOLUME_POLL_INTERVAL: Duration = Duration::from_millis(1500);
const VOLUME_POLL_DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiSandbox {
    id: String,
    state: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ApiVolume {
    id: String,
    name: String,
    state: String,
    #[serde(default, rename = "sizeGb")]
    size_gb: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSandboxBody<'a> {
    name: &'a str,
    labels: &'a BTreeMap<String, String>,
    env: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot: Option<&'a str>,
    volumes: &'a [crate::config::VolumeMount],
    auto_stop_interval: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecBody<'a> {
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<&'a str>,
    env: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecResponse {
    exit_code: i32,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

#[derive(Debug, Deserialize)]
struct ToolboxResponse {
    url: String,
}

#[derive(Debug, Deserialize)]
struct PreviewUrlResponse {
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SshTokenResponse {
    token: String,
    #[serde(default)]
    expires_in_minutes: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SshValidateResponse {
    valid: bool,
    #[serde(default)]
    runner_domain: Option<String>,
}

/// Map a provider state string onto the handle state enum.
fn map_state(state: &str) -> SandboxState {
    match state {
        "started" | "running" => SandboxState::Started,
        "stopped" => SandboxState::Stopped,
        "error" | "failed" => SandboxState::Error,
        _ => SandboxState::Pending,
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
fn error_for_status(status: StatusCode, op: &str) -> SandboxError {
    let code = match status {
        StatusCode::NOT_FOUND => ErrorCode::SandboxNotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorCode::Permission,
        s if s.is_server_error() => ErrorCode::Network,
        _ => ErrorCode::Network,
    };
    let retryable = status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || (code == ErrorCode::Network && !status.is_client_error());
    SandboxError::new(code, op.to_string())
        .retryable(retryable)
        .with_context("status", status.as_u16().to_string())
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Consecutive API failures tolerated before the breaker opens.
const BREAKER_MAX_FAILURES: u32 = 5;
const BREAKER_RESET_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct DaytonaClient {
    http: reqwest::Client,
    base_url: String,
    target: Option<String>,
    toolbox_url: OnceCell<String>,
    /// Trips after repeated API failures so a dead control plane fails
    /// fast instead of hanging every caller.
    breaker: CircuitBreaker,
}

impl DaytonaClient {
    fn new(settings: &DaytonaSettings) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth =
            reqwest::header::HeaderValue::from_str(&format!("Bearer {}", settings.api_key))
                .context("API key contains invalid header characters")?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            http,
            base_url: settings.api_url.trim_end_matches('/').to_string(),
            target: settings.target.clone(),
            toolbox_url: OnceCell::new(),
            breaker: CircuitBreaker::new(BREAKER_MAX_FAILURES, BREAKER_RESET_TIMEOUT),
        })
    }

    /// Reject the call outright while the breaker is open.
    fn guard(&self, op: &str) -> Result<()> {
        if self.breaker.can_execute() {
            return Ok(());
        }
        Err(SandboxError::new(ErrorCode::Network, op.to_string())
            .retryable(true)
            .with_source(crate::breaker::CircuitOpenError)
            .with_suggestion("The provider API is failing repeatedly; wait and retry")
            .into())
    }

    /// Feed a call outcome into the breaker. Only transport-level and
    /// server-side failures count; 4xx responses are the caller's problem.
    fn observe<T>(&self, result: &Result<T>) {
        match result {
            Ok(_) => self.breaker.record_success(),
            Err(err) => {
                if crate::error::get_sandbox_error(err)
                    .is_some_and(|s| s.code() == ErrorCode::Network && s.is_retryable())
                {
                    self.breaker.record_failure();
                } else {
                    self.breaker.record_success();
                }
            }
        }
    }

    /// Lazily-fetched toolbox base URL; the `OnceCell` is the single-flight
    /// init-once gate, so concurrent callers share one request.
    async fn toolbox_url(&self) -> Result<&str> {
        let url = self
            .toolbox_url
            .get_or_try_init(|| async {
                let response: ToolboxResponse = self
                    .get_json(&format!("{}/toolbox", self.base_url), "fetch toolbox url")
                    .await?;
                debug!(url = %response.url, "resolved toolbox url");
                Ok::<_, anyhow::Error>(response.url.trim_end_matches('/').to_string())
            })
            .await?;
        Ok(url)
    }

    async fn check<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        op: &str,
    ) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(status, op)
                .with_source(anyhow::anyhow!("{status}: {body}"))
                .into());
        }
        response
            .json::<T>()
            .await
            .with_context(|| format!("decoding response for {op}"))
    }

    async fn check_empty(response: reqwest::Response, op: &str) -> Result<()> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(status, op)
                .with_source(anyhow::anyhow!("{status}: {body}"))
                .into());
        }
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str, op: &str) -> Result<T> {
        self.guard(op)?;
        let result = async {
            let response = self
                .http
                .get(url)
                .send()
                .await
                .map_err(|e| network_error(op, e))?;
            Self::check(response, op).await
        }
        .await;
        self.observe(&result);
        result
    }

    async fn post_json<B: serde::Serialize, T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
        op: &str,
    ) -> Result<T> {
        self.guard(op)?;
        let result = async {
            let response = self
                .http
                .post(url)
                .json(body)
                .send()
                .await
                .map_err(|e| network_error(op, e))?;
            Self::check(response, op).await
        }
        .await;
        self.observe(&result);
        result
    }

    async fn post_empty<B: serde::Serialize>(&self, url: &str, body: &B, op: &str) -> Result<()> {
        self.guard(op)?;
        let result = async {
            let response = self
                .http
                .post(url)
                .json(body)
                .send()
                .await
                .map_err(|e| network_error(op, e))?;
            Self::check_empty(response, op).await
        }
        .await;
        self.observe(&result);
        result
    }

    async fn delete(&self, url: &str, op: &str) -> Result<()> {
        self.guard(op)?;
        let result = async {
            let response = self
                .http
                .delete(url)
                .send()
                .await
                .map_err(|e| network_error(op, e))?;
            Self::check_empty(response, op).await
        }
        .await;
        self.observe(&result);
        result
    }
}

fn network_error(op: &str, err: reqwest::Error) -> anyhow::Error {
    SandboxError::new(ErrorCode::Network, op.to_string())
        .with_source(err)
        .into()
}

// ── Handle ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct DaytonaSandbox {
    client: Arc<DaytonaClient>,
    id: String,
    state: Mutex<SandboxState>,
    labels: Mutex<BTreeMap<String, String>>,
    default_env: Mutex<BTreeMap<String, String>>,
}

impl DaytonaSandbox {
    fn from_api(client: Arc<DaytonaClient>, api: ApiSandbox) -> Self {
        Self {
            client,
            id: api.id,
            state: Mutex::new(map_state(&api.state)),
            labels: Mutex::new(api.labels),
            default_env: Mutex::new(BTreeMap::new()),
        }
    }

    fn sandbox_url(&self) -> String {
        format!("{}/sandbox/{}", self.client.base_url, self.id)
    }

    async fn subresource(&self, suffix: &str) -> Result<String> {
        let toolbox = self.client.toolbox_url().await?;
        Ok(format!("{toolbox}/{}/{suffix}", self.id))
    }
}

#[async_trait]
impl SandboxHandle for DaytonaSandbox {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn state(&self) -> SandboxState {
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();
        *state
    }

    fn labels(&self) -> BTreeMap<String, String> {
        #[allow(clippy::unwrap_used)]
        let labels = self.labels.lock().unwrap();
        labels.clone()
    }

    async fn start(&self) -> Result<()> {
        if self.state() == SandboxState::Started {
            return Ok(());
        }
        self.client
            .post_empty(&format!("{}/start", self.sandbox_url()), &(), "start sandbox")
            .await
    }

    async fn stop(&self) -> Result<()> {
        if self.state() == SandboxState::Stopped {
            return Ok(());
        }
        self.client
            .post_empty(&format!("{}/stop", self.sandbox_url()), &(), "stop sandbox")
            .await
    }

    async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        wait_ready_by_polling(self, timeout, Duration::from_secs(2)).await
    }

    async fn exec(&self, command: &str, opts: &ExecOptions) -> Result<ExecOutput> {
        let url = self.subresource("process/exec").await?;
        let mut env = {
            #[allow(clippy::unwrap_used)]
            let default_env = self.default_env.lock().unwrap();
            default_env.clone()
        };
        env.extend(opts.env.clone());
        let body = ExecBody {
            command,
            cwd: opts.cwd.as_deref(),
            env: &env,
            timeout_seconds: opts.timeout.map(|t| t.as_secs()),
            user: opts.user.as_deref(),
        };
        let request = self.client.post_json::<_, ExecResponse>(&url, &body, "exec");
        let response = match opts.timeout {
            Some(timeout) if !timeout.is_zero() => tokio::time::timeout(timeout, request)
                .await
                .map_err(|_| {
                    anyhow::Error::from(
                        SandboxError::new(ErrorCode::Timeout, "exec")
                            .with_sandbox_id(self.id())
                            .with_context("timeout", format!("{}s", timeout.as_secs())),
                    )
                })??,
            _ => request.await?,
        };
        Ok(ExecOutput {
            exit_code: response.exit_code,
            stdout: response.stdout,
            stderr: response.stderr,
        })
    }

    async fn exec_interactive(&self, command: &str, opts: &ExecOptions) -> Result<i32> {
        // The session broker reaches remote TTYs over ssh; direct handle
        // calls degrade to a captured exec with streamed-back output.
        let output = self.exec(command, opts).await?;
        if !output.stdout.is_empty() {
            print!("{}", output.stdout);
        }
        if !output.stderr.is_empty() {
            eprint!("{}", output.stderr);
        }
        Ok(output.exit_code)
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<()> {
        let url = self.subresource("files/upload").await?;
        let bytes = tokio::fs::read(local)
            .await
            .with_context(|| format!("reading {}", local.display()))?;
        let response = self
            .client
            .http
            .post(&url)
            .query(&[("path", remote)])
            .body(bytes)
            .send()
            .await
            .map_err(|e| network_error("upload file", e))?;
        DaytonaClient::check_empty(response, "upload file").await
    }

    async fn download_file(&self, remote: &str, local: &Path) -> Result<()> {
        let url = self.subresource("files/download").await?;
        let response = self
            .client
            .http
            .get(&url)
            .query(&[("path", remote)])
            .send()
            .await
            .map_err(|e| network_error("download file", e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(error_for_status(status, "download file").into());
        }
        let bytes = response
            .bytes()
            .await
            .context("reading download body")?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        tokio::fs::write(local, &bytes)
            .await
            .with_context(|| format!("writing {}", local.display()))?;
        Ok(())
    }

    async fn get_preview_url(&self, port: u16) -> Result<Option<String>> {
        let url = format!("{}/ports/{port}/preview-url", self.sandbox_url());
        let response: PreviewUrlResponse = self.client.get_json(&url, "preview url").await?;
        Ok(Some(response.url))
    }

    async fn refresh(&self) -> Result<()> {
        let api: ApiSandbox = self
            .client
            .get_json(&self.sandbox_url(), "refresh sandbox")
            .await?;
        #[allow(clippy::unwrap_used)]
        {
            *self.state.lock().unwrap() = map_state(&api.state);
            *self.labels.lock().unwrap() = api.labels;
        }
        Ok(())
    }

    fn set_default_env(&self, env: BTreeMap<String, String>) {
        #[allow(clippy::unwrap_used)]
        let mut default_env = self.default_env.lock().unwrap();
        *default_env = env;
    }
}

// ── Capability managers ───────────────────────────────────────────────────────

#[derive(Debug)]
struct DaytonaVolumes {
    client: Arc<DaytonaClient>,
}

#[async_trait]
impl VolumeManager for DaytonaVolumes {
    async fn get_or_create(&self, name: &str) -> Result<Volume> {
        let url = format!("{}/volumes", self.client.base_url);
        let existing: Vec<ApiVolume> = self
            .client
            .get_json(&format!("{url}?name={name}"), "list volumes")
            .await?;
        let api = match existing.into_iter().find(|v| v.name == name) {
            Some(found) => found,
            None => {
                self.client
                    .post_json(&url, &serde_json::json!({ "name": name }), "create volume")
                    .await?
            }
        };
        Ok(Volume {
            id: api.id,
            name: api.name,
            state: api.state,
            size_gb: api.size_gb,
        })
    }

    async fn wait_ready(&self, name: &str, timeout: Duration) -> Result<Volume> {
        let budget = if timeout.is_zero() {
            VOLUME_POLL_DEFAULT_TIMEOUT
        } else {
            timeout
        };
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            let volume = self.get_or_create(name).await?;
            if volume.state == "ready" || volume.state == "available" {
                return Ok(volume);
            }
            if volume.state == "error" {
                return Err(SandboxError::new(ErrorCode::Volume, "wait for volume")
                    .with_context("volume", name.to_string())
                    .with_source(anyhow::anyhow!("volume entered error state"))
                    .into());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SandboxError::new(ErrorCode::Timeout, "wait for volume")
                    .with_context("volume", name.to_string())
                    .retryable(true)
                    .into());
            }
            tokio::time::sleep(VOLUME_POLL_INTERVAL).await;
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let url = format!("{}/volumes/{name}", self.client.base_url);
        self.client.delete(&url, "delete volume").await
    }
}

#[derive(Debug)]
struct DaytonaSnapshots {
    client: Arc<DaytonaClient>,
}

#[async_trait]
impl SnapshotManager for DaytonaSnapshots {
    async fn list(&self) -> Result<Vec<SnapshotInfo>> {
        #[derive(Deserialize)]
        struct ApiSnapshot {
            id: String,
            name: String,
            state: String,
        }
        let url = format!("{}/snapshots", self.client.base_url);
        let snapshots: Vec<ApiSnapshot> = self.client.get_json(&url, "list snapshots").await?;
        Ok(snapshots
            .into_iter()
            .map(|s| SnapshotInfo {
                id: s.id,
                name: s.name,
                state: s.state,
            })
            .collect())
    }

    async fn create(&self, name: &str, image: &SnapshotImage) -> Result<SnapshotInfo> {
        #[derive(Deserialize)]
        struct ApiSnapshot {
            id: String,
            name: String,
            state: String,
        }
        let url = format!("{}/snapshots", self.client.base_url);
        let body = serde_json::json!({
            "name": name,
            "dockerfile": image.dockerfile(),
        });
        let created: ApiSnapshot = self.client.post_json(&url, &body, "create snapshot").await?;
        Ok(SnapshotInfo {
            id: created.id,
            name: created.name,
            state: created.state,
        })
    }
}

#[derive(Debug)]
struct DaytonaSsh {
    client: Arc<DaytonaClient>,
}

#[async_trait]
impl SshAccess for DaytonaSsh {
    async fn create_token(&self, sandbox_id: &str, ttl_minutes: u32) -> Result<SshToken> {
        let url = format!("{}/sandbox/{sandbox_id}/ssh-access", self.client.base_url);
        let body = serde_json::json!({ "expiresInMinutes": ttl_minutes });
        let response: SshTokenResponse = self
            .client
            .post_json(&url, &body, "create ssh token")
            .await?;
        Ok(SshToken {
            token: response.token,
            expires_in_minutes: response.expires_in_minutes.unwrap_or(ttl_minutes),
        })
    }

    async fn wait_token_valid(&self, token: &str) -> Result<SshEndpoint> {
        let url = format!("{}/ssh-access/validate/{token}", self.client.base_url);
        let deadline = tokio::time::Instant::now() + SSH_POLL_BUDGET;
        loop {
            let response: SshValidateResponse =
                self.client.get_json(&url, "validate ssh token").await?;
            if response.valid
                && let Some(host) = response.runner_domain
            {
                return Ok(SshEndpoint { host });
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SandboxError::new(ErrorCode::Ssh, "validate ssh token")
                    .with_context("budget", format!("{}s", SSH_POLL_BUDGET.as_secs()))
                    .with_source(anyhow::anyhow!("token never became valid"))
                    .into());
            }
            tokio::time::sleep(SSH_POLL_INTERVAL).await;
        }
    }

    async fn revoke_token(&self, token: &str) -> Result<()> {
        let url = format!("{}/ssh-access/{token}", self.client.base_url);
        self.client.delete(&url, "revoke ssh token").await
    }
}

// ── Provider ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct DaytonaProvider {
    client: Arc<DaytonaClient>,
    volumes: DaytonaVolumes,
    snapshots: DaytonaSnapshots,
    ssh: DaytonaSsh,
}

impl DaytonaProvider {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed (e.g. an
    /// API key with invalid header characters).
    pub fn new(settings: DaytonaSettings) -> Result<Self> {
        let client = Arc::new(DaytonaClient::new(&settings)?);
        Ok(Self {
            volumes: DaytonaVolumes {
                client: Arc::clone(&client),
            },
            snapshots: DaytonaSnapshots {
                client: Arc::clone(&client),
            },
            ssh: DaytonaSsh {
                client: Arc::clone(&client),
            },
            client,
        })
    }
}

#[async_trait]
impl Provider for DaytonaProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn supports_feature(&self, feature: Feature) -> bool {
        matches!(
            feature,
            Feature::Volumes
                | Feature::Snapshots
                | Feature::PreviewUrls
                | Feature::SshAccess
                | Feature::Desktop
        )
    }

    async fn create_sandbox(
        &self,
        request: &CreateSandboxRequest,
    ) -> Result<Arc<dyn SandboxHandle>> {
        let url = format!("{}/sandbox", self.client.base_url);
        let body = CreateSandboxBody {
            name: &request.name,
            labels: &request.labels,
            env: &request.env,
            snapshot: request.snapshot.as_deref(),
            volumes: &request.mounts,
            auto_stop_interval: request.auto_stop_minutes,
            target: self.client.target.as_deref(),
        };
        let api: ApiSandbox = self
            .client
            .post_json(&url, &body, "create sandbox")
            .await
            .map_err(|err| {
                match crate::error::get_sandbox_error(&err) {
                    // Preserve structured network/permission detail as the cause.
                    Some(_) => anyhow::Error::from(
                        SandboxError::new(ErrorCode::SandboxCreate, "create sandbox")
                            .with_source(err),
                    ),
                    None => err,
                }
            })?;
        Ok(Arc::new(DaytonaSandbox::from_api(
            Arc::clone(&self.client),
            api,
        )))
    }

    async fn get_sandbox(&self, id: &str) -> Result<Arc<dyn SandboxHandle>> {
        let url = format!("{}/sandbox/{id}", self.client.base_url);
        let api: ApiSandbox = self.client.get_json(&url, "get sandbox").await?;
        Ok(Arc::new(DaytonaSandbox::from_api(
            Arc::clone(&self.client),
            api,
        )))
    }

    async fn list_sandboxes(&self) -> Result<Vec<Arc<dyn SandboxHandle>>> {
        let url = format!("{}/sandbox", self.client.base_url);
        let sandboxes: Vec<ApiSandbox> = self.client.get_json(&url, "list sandboxes").await?;
        Ok(sandboxes
            .into_iter()
            .map(|api| {
                Arc::new(DaytonaSandbox::from_api(Arc::clone(&self.client), api))
                    as Arc<dyn SandboxHandle>
            })
            .collect())
    }

    async fn delete_sandbox(&self, id: &str) -> Result<()> {
        let url = format!("{}/sandbox/{id}", self.client.base_url);
        self.client.delete(&url, "delete sandbox").await
    }

    fn volumes(&self) -> Option<&dyn VolumeManager> {
        Some(&self.volumes)
    }

    fn snapshots(&self) -> Option<&dyn SnapshotManager> {
        Some(&self.snapshots)
    }

    fn ssh_access(&self) -> Option<&dyn SshAccess> {
        Some(&self.ssh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> DaytonaSettings {
        DaytonaSettings {
            api_key: "test-key".to_string(),
            api_url: "https://api.example.test/".to_string(),
            target: Some("eu".to_string()),
        }
    }

    #[test]
    fn test_map_state_covers_known_states() {
        assert_eq!(map_state("started"), SandboxState::Started);
        assert_eq!(map_state("running"), SandboxState::Started);
        assert_eq!(map_state("stopped"), SandboxState::Stopped);
        assert_eq!(map_state("error"), SandboxState::Error);
        assert_eq!(map_state("failed"), SandboxState::Error);
        assert_eq!(map_state("creating"), SandboxState::Pending);
        assert_eq!(map_state("whatever"), SandboxState::Pending);
    }

    #[test]
    fn test_error_for_status_maps_taxonomy() {
        let not_found = error_for_status(StatusCode::NOT_FOUND, "get sandbox");
        assert_eq!(not_found.code(), ErrorCode::SandboxNotFound);

        let forbidden = error_for_status(StatusCode::FORBIDDEN, "get sandbox");
        assert_eq!(forbidden.code(), ErrorCode::Permission);

        let server = error_for_status(StatusCode::BAD_GATEWAY, "get sandbox");
        assert_eq!(server.code(), ErrorCode::Network);
        assert!(server.is_retryable());

        let rate_limited = error_for_status(StatusCode::TOO_MANY_REQUESTS, "get sandbox");
        assert!(rate_limited.is_retryable());
    }

    #[test]
    fn test_client_normalizes_trailing_slash() {
        let client = DaytonaClient::new(&settings()).expect("client");
        assert_eq!(client.base_url, "https://api.example.test");
    }

    #[test]
    fn test_provider_feature_bits() {
        let provider = DaytonaProvider::new(settings()).expect("provider");
        for supported in [
            Feature::Volumes,
            Feature::Snapshots,
            Feature::PreviewUrls,
            Feature::SshAccess,
            Feature::Desktop,
        ] {
            assert!(provider.supports_feature(supported), "{supported:?}");
        }
        for unsupported in [
            Feature::ExecSessions,
            Feature::Checkpoints,
            Feature::NetworkPolicy,
            Feature::TcpProxy,
        ] {
            assert!(!provider.supports_feature(unsupported), "{unsupported:?}");
        }
        assert!(provider.volumes().is_some());
        assert!(provider.snapshots().is_some());
        assert!(provider.ssh_access().is_some());
    }

    #[test]
    fn test_ssh_poll_constants_are_pinned() {
        assert_eq!(SSH_POLL_INTERVAL, Duration::from_secs(1));
        assert_eq!(SSH_POLL_BUDGET, Duration::from_secs(15));
        assert_eq!(DEFAULT_SSH_TTL_MINUTES, 60);
    }

    #[test]
    fn test_create_body_serializes_camel_case() {
        let labels = BTreeMap::from([("amux.provider".to_string(), "daytona".to_string())]);
        let env = BTreeMap::new();
        let body = CreateSandboxBody {
            name: "amux-proj",
            labels: &labels,
            env: &env,
            snapshot: Some("snap-1"),
            volumes: &[],
            auto_stop_interval: 30,
            target: Some("eu"),
        };
        let json = serde_json::to_value(&body).expect("serialize");
        assert_eq!(json["autoStopInterval"], 30);
        assert_eq!(json["snapshot"], "snap-1");
        assert_eq!(json["labels"]["amux.provider"], "daytona");
    }

    #[test]
    fn test_validate_response_tolerates_missing_runner_domain() {
        let parsed: SshValidateResponse =
            serde_json::from_str(r#"{"valid": false}"#).expect("parse");
        assert!(!parsed.valid);
        assert!(parsed.runner_domain.is_none());

        let ready: SshValidateResponse =
            serde_json::from_str(r#"{"valid": true, "runnerDomain": "runner.example"}"#)
                .expect("parse");
        assert!(ready.valid);
        assert_eq!(ready.runner_domain.as_deref(), Some("runner.example"));
    }

    #[test]
    fn test_tripped_breaker_rejects_before_sending() {
        let client = DaytonaClient::new(&settings()).expect("client");
        for _ in 0..BREAKER_MAX_FAILURES {
            client.breaker.record_failure();
        }
        let err = client.guard("get sandbox").expect_err("breaker open");
        assert!(
            err.chain()
                .any(|e| e.downcast_ref::<crate::breaker::CircuitOpenError>().is_some())
        );
        let structured = crate::error::get_sandbox_error(&err).expect("structured");
        assert!(structured.is_retryable());
    }

    #[test]
    fn test_observe_counts_only_transport_failures() {
        let client = DaytonaClient::new(&settings()).expect("client");
        // A 4xx-style structured error must not trip the breaker.
        for _ in 0..BREAKER_MAX_FAILURES + 1 {
            let not_found: Result<()> =
                Err(error_for_status(StatusCode::NOT_FOUND, "get sandbox").into());
            client.observe(&not_found);
        }
        assert!(client.guard("get sandbox").is_ok());

        for _ in 0..BREAKER_MAX_FAILURES {
            let server: Result<()> =
                Err(error_for_status(StatusCode::BAD_GATEWAY, "get sandbox").into());
            client.observe(&server);
        }
        assert!(client.guard("get sandbox").is_err());
    }

    #[test]
    fn test_exec_response_defaults_empty_streams() {
        let parsed: ExecResponse = serde_json::from_str(r#"{"exitCode": 7}"#).expect("parse");
        assert_eq!(parsed.exit_code, 7);
        assert!(parsed.stdout.is_empty());
        assert!(parsed.stderr.is_empty());
    }
}
