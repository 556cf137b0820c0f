//! Local-container driver: shells out to the `docker` CLI.
//!
//! The [`ContainerCli`] trait mirrors the handful of docker invocations the
//! driver needs, enabling test doubles; [`DockerCli`] is the production
//! implementation over [`tokio::process::Command`]. Containers are created
//! detached running `sleep infinity` and addressed by name; an existing
//! container with the requested name is reused.

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::Path;
use std::process::Output;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{ErrorCode, NotFound, SandboxError};
use crate::sandbox::{
    ExecOptions, ExecOutput, SandboxHandle, SandboxState, wait_ready_by_polling,
};

use super::{CreateSandboxRequest, Feature, Provider, Volume, VolumeManager};

pub const PROVIDER_NAME: &str = "docker";

/// Image used when no snapshot id is configured.
const DEFAULT_IMAGE: &str = "ubuntu:24.04";

/// Abstraction over the container CLI, enabling test doubles.
#[async_trait]
pub trait ContainerCli: Send + Sync {
    /// Run `docker <args>` and capture output.
    async fn run(&self, args: &[String]) -> Result<Output>;

    /// Run `docker <args>` with the caller's stdio attached.
    async fn status(&self, args: &[String]) -> Result<std::process::ExitStatus>;
}

/// Production implementation — shells out to the `docker` binary.
pub struct DockerCli;

#[async_trait]
impl ContainerCli for DockerCli {
    async fn run(&self, args: &[String]) -> Result<Output> {
        tokio::process::Command::new("docker")
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .context("failed to run docker")
    }

    async fn status(&self, args: &[String]) -> Result<std::process::ExitStatus> {
        tokio::process::Command::new("docker")
            .args(args)
            .stdin(std::process::Stdio::inherit())
            .stdout(std::process::Stdio::inherit())
            .stderr(std::process::Stdio::inherit())
            .status()
            .await
            .context("failed to run docker")
    }
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Status")]
    status: String,
}

#[derive(Debug, Deserialize)]
struct InspectConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct InspectEntry {
    #[serde(rename = "State")]
    state: InspectState,
    #[serde(rename = "Config")]
    config: InspectConfig,
}

/// Parse `docker inspect` output into state + labels.
fn parse_inspect(stdout: &[u8]) -> Result<(SandboxState, BTreeMap<String, String>)> {
    let entries: Vec<InspectEntry> =
        serde_json::from_slice(stdout).context("parsing docker inspect output")?;
    let entry = entries
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::Error::from(NotFound))?;
    let state = match entry.state.status.as_str() {
        "running" => SandboxState::Started,
        "created" | "restarting" => SandboxState::Pending,
        "exited" | "paused" => SandboxState::Stopped,
        "dead" => SandboxState::Error,
        _ => SandboxState::Pending,
    };
    Ok((state, entry.config.labels.unwrap_or_default()))
}

fn command_failed(op: &str, output: &Output) -> anyhow::Error {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("No such container") || stderr.contains("No such object") {
        return NotFound.into();
    }
    SandboxError::new(ErrorCode::Unknown, op.to_string())
        .with_context("stderr", stderr.trim().to_string())
        .with_source(anyhow::anyhow!(
            "docker exited with {}",
            output.status.code().unwrap_or(-1)
        ))
        .into()
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(ToString::to_string).collect()
}

// ── Handle ────────────────────────────────────────────────────────────────────

struct DockerSandbox<C: ContainerCli> {
    cli: Arc<C>,
    /// Container name doubles as the sandbox id.
    id: String,
    state: Mutex<SandboxState>,
    labels: Mutex<BTreeMap<String, String>>,
    default_env: Mutex<BTreeMap<String, String>>,
}

impl<C: ContainerCli> std::fmt::Debug for DockerSandbox<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerSandbox")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("labels", &self.labels)
            .field("default_env", &self.default_env)
            .finish_non_exhaustive()
    }
}

impl<C: ContainerCli> DockerSandbox<C> {
    fn exec_args(&self, command: &str, opts: &ExecOptions, interactive: bool) -> Vec<String> {
        let mut argv = vec!["exec".to_string()];
        if interactive {
            argv.push("-i".to_string());
            if std::io::stdin().is_terminal() {
                argv.push("-t".to_string());
            }
        }
        if let Some(cwd) = &opts.cwd {
            argv.push("-w".to_string());
            argv.push(cwd.clone());
        }
        if let Some(user) = &opts.user {
            argv.push("-u".to_string());
            argv.push(user.clone());
        }
        let merged_env = {
            #[allow(clippy::unwrap_used)]
            let mut env = self.default_env.lock().unwrap().clone();
            env.extend(opts.env.clone());
            env
        };
        for (key, value) in &merged_env {
            argv.push("-e".to_string());
            argv.push(format!("{key}={value}"));
        }
        argv.push(self.id.clone());
        argv.push("bash".to_string());
        argv.push("-lc".to_string());
        argv.push(command.to_string());
        argv
    }
}

#[async_trait]
impl<C: ContainerCli + 'static> SandboxHandle for DockerSandbox<C> {
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
        let output = self.cli.run(&args(&["start", &self.id])).await?;
        if !output.status.success() {
            return Err(command_failed("start container", &output));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.state() == SandboxState::Stopped {
            return Ok(());
        }
        let output = self.cli.run(&args(&["stop", &self.id])).await?;
        if !output.status.success() {
            return Err(command_failed("stop container", &output));
        }
        Ok(())
    }

    async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        wait_ready_by_polling(self, timeout, Duration::from_secs(1)).await
    }

    async fn exec(&self, command: &str, opts: &ExecOptions) -> Result<ExecOutput> {
        let argv = self.exec_args(command, opts, false);
        let run = self.cli.run(&argv);
        let output = match opts.timeout {
            Some(timeout) if !timeout.is_zero() => {
                tokio::time::timeout(timeout, run).await.map_err(|_| {
                    anyhow::Error::from(
                        SandboxError::new(ErrorCode::Timeout, "exec")
                            .with_sandbox_id(self.id())
                            .with_context("timeout", format!("{}s", timeout.as_secs())),
                    )
                })??
            }
            _ => run.await?,
        };
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn exec_interactive(&self, command: &str, opts: &ExecOptions) -> Result<i32> {
        let argv = self.exec_args(command, opts, true);
        let status = self.cli.status(&argv).await?;
        Ok(status.code().unwrap_or(1))
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<()> {
        let local_str = local.to_string_lossy();
        let output = self
            .cli
            .run(&args(&["cp", &local_str, &format!("{}:{remote}", self.id)]))
            .await?;
        if !output.status.success() {
            return Err(command_failed("upload file", &output));
        }
        Ok(())
    }

    async fn download_file(&self, remote: &str, local: &Path) -> Result<()> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let local_str = local.to_string_lossy();
        let output = self
            .cli
            .run(&args(&["cp", &format!("{}:{remote}", self.id), &local_str]))
            .await?;
        if !output.status.success() {
            return Err(command_failed("download file", &output));
        }
        Ok(())
    }

    async fn get_preview_url(&self, _port: u16) -> Result<Option<String>> {
        Ok(None)
    }

    async fn refresh(&self) -> Result<()> {
        let output = self.cli.run(&args(&["inspect", &self.id])).await?;
        if !output.status.success() {
            return Err(command_failed("inspect container", &output));
        }
        let (state, labels) = parse_inspect(&output.stdout)?;
        #[allow(clippy::unwrap_used)]
        {
            *self.state.lock().unwrap() = state;
            *self.labels.lock().unwrap() = labels;
        }
        Ok(())
    }

    fn set_default_env(&self, env: BTreeMap<String, String>) {
        #[allow(clippy::unwrap_used)]
        let mut default_env = self.default_env.lock().unwrap();
        *default_env = env;
    }
}

// ── Volumes ───────────────────────────────────────────────────────────────────

struct DockerVolumes<C: ContainerCli> {
    cli: Arc<C>,
}

#[async_trait]
impl<C: ContainerCli + 'static> VolumeManager for DockerVolumes<C> {
    async fn get_or_create(&self, name: &str) -> Result<Volume> {
        let inspect = self.cli.run(&args(&["volume", "inspect", name])).await?;
        if !inspect.status.success() {
            let create = self.cli.run(&args(&["volume", "create", name])).await?;
            if !create.status.success() {
                return Err(SandboxError::new(ErrorCode::Volume, "create volume")
                    .with_context("volume", name.to_string())
                    .with_source(command_failed("create volume", &create))
                    .into());
            }
        }
        Ok(Volume {
            id: name.to_string(),
            name: name.to_string(),
            state: "ready".to_string(),
            size_gb: None,
        })
    }

    async fn wait_ready(&self, name: &str, _timeout: Duration) -> Result<Volume> {
        // Local volumes are usable as soon as they exist.
        self.get_or_create(name).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let output = self.cli.run(&args(&["volume", "rm", name])).await?;
        if !output.status.success() {
            return Err(command_failed("delete volume", &output));
        }
        Ok(())
    }
}

// ── Provider ──────────────────────────────────────────────────────────────────

pub struct DockerProvider<C: ContainerCli = DockerCli> {
    cli: Arc<C>,
    volumes: DockerVolumes<C>,
}

impl<C: ContainerCli> std::fmt::Debug for DockerProvider<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerProvider").finish_non_exhaustive()
    }
}

impl DockerProvider<DockerCli> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_cli(DockerCli)
    }
}

impl Default for DockerProvider<DockerCli> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ContainerCli + 'static> DockerProvider<C> {
    pub fn with_cli(cli: C) -> Self {
        let cli = Arc::new(cli);
        Self {
            volumes: DockerVolumes {
                cli: Arc::clone(&cli),
            },
            cli,
        }
    }

    fn handle(&self, id: &str, state: SandboxState, labels: BTreeMap<String, String>) -> Arc<dyn SandboxHandle> {
        Arc::new(DockerSandbox {
            cli: Arc::clone(&self.cli),
            id: id.to_string(),
            state: Mutex::new(state),
            labels: Mutex::new(labels),
            default_env: Mutex::new(BTreeMap::new()),
        })
    }
}

#[async_trait]
impl<C: ContainerCli + 'static> Provider for DockerProvider<C> {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn supports_feature(&self, feature: Feature) -> bool {
        matches!(feature, Feature::Volumes)
    }

    async fn create_sandbox(
        &self,
        request: &CreateSandboxRequest,
    ) -> Result<Arc<dyn SandboxHandle>> {
        // Reuse an existing container with this name if one is present.
        let inspect = self.cli.run(&args(&["inspect", &request.name])).await?;
        if inspect.status.success() {
            debug!(name = %request.name, "reusing existing container");
            let (state, labels) = parse_inspect(&inspect.stdout)?;
            let handle = self.handle(&request.name, state, labels);
            handle.start().await?;
            return Ok(handle);
        }

        for mount in &request.mounts {
            self.volumes.get_or_create(&mount.volume_id).await?;
        }

        let mut argv = args(&["run", "-d", "--name", &request.name]);
        for (key, value) in &request.labels {
            argv.push("--label".to_string());
            argv.push(format!("{key}={value}"));
        }
        for (key, value) in &request.env {
            argv.push("-e".to_string());
            argv.push(format!("{key}={value}"));
        }
        for mount in &request.mounts {
            let mut spec = format!("{}:{}", mount.volume_id, mount.mount_path);
            if mount.read_only {
                spec.push_str(":ro");
            }
            argv.push("-v".to_string());
            argv.push(spec);
        }
        argv.push(
            request
                .snapshot
                .clone()
                .unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
        );
        argv.extend(args(&["sleep", "infinity"]));

        let output = self.cli.run(&argv).await?;
        if !output.status.success() {
            return Err(anyhow::Error::from(
                SandboxError::new(ErrorCode::SandboxCreate, "create container")
                    .with_source(command_failed("docker run", &output)),
            ));
        }
        Ok(self.handle(&request.name, SandboxState::Pending, request.labels.clone()))
    }

    async fn get_sandbox(&self, id: &str) -> Result<Arc<dyn SandboxHandle>> {
        let output = self.cli.run(&args(&["inspect", id])).await?;
        if !output.status.success() {
            return Err(command_failed("inspect container", &output));
        }
        let (state, labels) = parse_inspect(&output.stdout)?;
        Ok(self.handle(id, state, labels))
    }

    async fn list_sandboxes(&self) -> Result<Vec<Arc<dyn SandboxHandle>>> {
        let output = self
            .cli
            .run(&args(&[
                "ps",
                "-a",
                "--filter",
                &format!("label={}", crate::sandbox::LABEL_PROVIDER),
                "--format",
                "{{.Names}}",
            ]))
            .await?;
        if !output.status.success() {
            return Err(command_failed("list containers", &output));
        }
        let mut handles = Vec::new();
        for name in String::from_utf8_lossy(&output.stdout).lines() {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            match self.get_sandbox(name).await {
                Ok(handle) => handles.push(handle),
                Err(err) => debug!(%name, %err, "skipping unreadable container"),
            }
        }
        Ok(handles)
    }

    async fn delete_sandbox(&self, id: &str) -> Result<()> {
        let output = self.cli.run(&args(&["rm", "-f", id])).await?;
        if !output.status.success() {
            return Err(command_failed("remove container", &output));
        }
        Ok(())
    }

    fn volumes(&self) -> Option<&dyn VolumeManager> {
        Some(&self.volumes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Cross-platform ExitStatus helper ─────────────────────────────────────

    #[cfg(unix)]
    fn exit_status(code: i32) -> std::process::ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        std::process::ExitStatus::from_raw(code << 8)
    }

    fn ok_output(stdout: &str) -> Output {
        Output {
            status: exit_status(0),
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        }
    }

    fn fail_output(stderr: &str) -> Output {
        Output {
            status: exit_status(1),
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    const RUNNING_INSPECT: &str = r#"[{
        "State": {"Status": "running"},
        "Config": {"Labels": {"amux.provider": "docker", "amux.agent": "claude"}}
    }]"#;

    /// Mock CLI: `(arg_substring, output)` pairs matched against the joined
    /// argv; calls are recorded for assertions.
    struct CliMock {
        responses: Vec<(String, Output)>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl CliMock {
        fn new(responses: Vec<(&str, Output)>) -> Self {
            Self {
                responses: responses
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Vec<String>> {
            #[allow(clippy::unwrap_used)]
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ContainerCli for CliMock {
        async fn run(&self, argv: &[String]) -> Result<Output> {
            #[allow(clippy::unwrap_used)]
            self.calls.lock().unwrap().push(argv.to_vec());
            let joined = argv.join(" ");
            for (key, output) in &self.responses {
                if joined.contains(key.as_str()) {
                    return Ok(Output {
                        status: output.status,
                        stdout: output.stdout.clone(),
                        stderr: output.stderr.clone(),
                    });
                }
            }
            Ok(fail_output("no mock response"))
        }

        async fn status(&self, _argv: &[String]) -> Result<std::process::ExitStatus> {
            Ok(exit_status(0))
        }
    }

    #[test]
    fn test_parse_inspect_running_container() {
        let (state, labels) = parse_inspect(RUNNING_INSPECT.as_bytes()).expect("parse");
        assert_eq!(state, SandboxState::Started);
        assert_eq!(labels.get("amux.agent").map(String::as_str), Some("claude"));
    }

    #[test]
    fn test_parse_inspect_state_mapping() {
        for (status, expected) in [
            ("created", SandboxState::Pending),
            ("exited", SandboxState::Stopped),
            ("paused", SandboxState::Stopped),
            ("dead", SandboxState::Error),
        ] {
            let json = format!(
                r#"[{{"State": {{"Status": "{status}"}}, "Config": {{"Labels": null}}}}]"#
            );
            let (state, labels) = parse_inspect(json.as_bytes()).expect("parse");
            assert_eq!(state, expected, "{status}");
            assert!(labels.is_empty());
        }
    }

    #[test]
    fn test_parse_inspect_empty_array_is_not_found() {
        let err = parse_inspect(b"[]").expect_err("empty");
        assert!(crate::error::is_not_found_error(&err));
    }

    #[test]
    fn test_command_failed_maps_missing_container_to_not_found() {
        let output = fail_output("Error: No such container: amux-x");
        let err = command_failed("inspect container", &output);
        assert!(crate::error::is_not_found_error(&err));
    }

    fn request(name: &str) -> CreateSandboxRequest {
        CreateSandboxRequest {
            name: name.to_string(),
            labels: BTreeMap::from([
                ("amux.provider".to_string(), "docker".to_string()),
            ]),
            env: BTreeMap::from([("FOO".to_string(), "bar".to_string())]),
            snapshot: None,
            mounts: vec![crate::config::VolumeMount {
                volume_id: "amux-persist".to_string(),
                mount_path: "/amux".to_string(),
                subpath: None,
                read_only: false,
            }],
            auto_stop_minutes: 30,
        }
    }

    #[tokio::test]
    async fn test_create_sandbox_runs_detached_with_labels_env_and_mounts() {
        let mock = CliMock::new(vec![
            ("volume inspect", ok_output("[]")),
            ("run -d", ok_output("abc123\n")),
        ]);
        let provider = DockerProvider::with_cli(mock);
        let handle = provider
            .create_sandbox(&request("amux-proj"))
            .await
            .expect("create");
        assert_eq!(handle.id(), "amux-proj");

        let calls = provider.cli.calls();
        let run_call = calls
            .iter()
            .find(|argv| argv.first().map(String::as_str) == Some("run"))
            .expect("docker run issued");
        let joined = run_call.join(" ");
        assert!(joined.contains("--name amux-proj"));
        assert!(joined.contains("--label amux.provider=docker"));
        assert!(joined.contains("-e FOO=bar"));
        assert!(joined.contains("-v amux-persist:/amux"));
        assert!(joined.ends_with("sleep infinity"));
        assert!(joined.contains(DEFAULT_IMAGE));
    }

    #[tokio::test]
    async fn test_create_sandbox_reuses_existing_container() {
        let mock = CliMock::new(vec![
            ("inspect amux-proj", ok_output(RUNNING_INSPECT)),
        ]);
        let provider = DockerProvider::with_cli(mock);
        let handle = provider
            .create_sandbox(&request("amux-proj"))
            .await
            .expect("reuse");
        assert_eq!(handle.state(), SandboxState::Started);
        // No `docker run` call was made.
        assert!(
            !provider
                .cli
                .calls()
                .iter()
                .any(|argv| argv.first().map(String::as_str) == Some("run"))
        );
    }

    #[tokio::test]
    async fn test_get_sandbox_missing_is_not_found() {
        let mock = CliMock::new(vec![(
            "inspect",
            fail_output("Error: No such object: ghost"),
        )]);
        let provider = DockerProvider::with_cli(mock);
        let err = provider.get_sandbox("ghost").await.expect_err("missing");
        assert!(crate::error::is_not_found_error(&err));
    }

    #[tokio::test]
    async fn test_exec_propagates_exit_code_and_streams() {
        let mock = CliMock::new(vec![(
            "exec",
            Output {
                status: exit_status(7),
                stdout: b"out".to_vec(),
                stderr: b"err".to_vec(),
            },
        )]);
        let provider = DockerProvider::with_cli(mock);
        let handle = provider.handle("box", SandboxState::Started, BTreeMap::new());
        let result = handle
            .exec("exit 7", &ExecOptions::default())
            .await
            .expect("exec");
        assert_eq!(result.exit_code, 7);
        assert_eq!(result.stdout, "out");
        assert_eq!(result.stderr, "err");
    }

    #[tokio::test]
    async fn test_exec_passes_cwd_env_and_wraps_in_bash() {
        let mock = CliMock::new(vec![("exec", ok_output(""))]);
        let provider = DockerProvider::with_cli(mock);
        let handle = provider.handle("box", SandboxState::Started, BTreeMap::new());
        handle.set_default_env(BTreeMap::from([(
            "BASE".to_string(),
            "1".to_string(),
        )]));
        let opts = ExecOptions {
            cwd: Some("/work".to_string()),
            env: BTreeMap::from([("EXTRA".to_string(), "2".to_string())]),
            ..ExecOptions::default()
        };
        handle.exec("echo hi", &opts).await.expect("exec");
        let calls = provider.cli.calls();
        let joined = calls[0].join(" ");
        assert!(joined.contains("-w /work"));
        assert!(joined.contains("-e BASE=1"));
        assert!(joined.contains("-e EXTRA=2"));
        assert!(joined.ends_with("box bash -lc echo hi"));
    }

    #[tokio::test]
    async fn test_list_sandboxes_filters_by_amux_label() {
        let mock = CliMock::new(vec![
            ("ps -a", ok_output("amux-a\namux-b\n")),
            ("inspect amux-a", ok_output(RUNNING_INSPECT)),
            ("inspect amux-b", ok_output(RUNNING_INSPECT)),
        ]);
        let provider = DockerProvider::with_cli(mock);
        let handles = provider.list_sandboxes().await.expect("list");
        assert_eq!(handles.len(), 2);
        let ps_call = &provider.cli.calls()[0];
        assert!(ps_call.join(" ").contains("label=amux.provider"));
    }

    #[tokio::test]
    async fn test_delete_sandbox_forces_removal() {
        let mock = CliMock::new(vec![("rm -f", ok_output(""))]);
        let provider = DockerProvider::with_cli(mock);
        provider.delete_sandbox("amux-x").await.expect("delete");
        assert_eq!(provider.cli.calls()[0], vec!["rm", "-f", "amux-x"]);
    }

    #[test]
    fn test_feature_bits_volumes_only() {
        let provider = DockerProvider::new();
        assert!(provider.supports_feature(Feature::Volumes));
        for unsupported in [
            Feature::Snapshots,
            Feature::PreviewUrls,
            Feature::SshAccess,
            Feature::Desktop,
            Feature::Checkpoints,
        ] {
            assert!(!provider.supports_feature(unsupported), "{unsupported:?}");
        }
        assert!(provider.ssh_access().is_none());
        assert!(provider.snapshots().is_none());
        assert!(provider.volumes().is_some());
    }

    #[tokio::test]
    async fn test_volume_get_or_create_creates_when_missing() {
        let mock = CliMock::new(vec![
            ("volume inspect", fail_output("no such volume")),
            ("volume create", ok_output("data\n")),
        ]);
        let provider = DockerProvider::with_cli(mock);
        let volume = provider
            .volumes()
            .expect("volumes")
            .get_or_create("data")
            .await
            .expect("create");
        assert_eq!(volume.name, "data");
        assert_eq!(volume.state, "ready");
    }
}
