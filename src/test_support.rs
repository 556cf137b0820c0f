//! Scripted sandbox doubles shared by unit tests.
//!
//! [`ScriptedHandle`] matches each exec command against `(substring,
//! response)` rules, records every call, and fails loudly on anything
//! unscripted so unexpected remote commands surface immediately.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::sandbox::{ExecOptions, ExecOutput, SandboxHandle, SandboxState};

/// A scripted response for one matching exec.
#[derive(Debug, Clone)]
pub struct Rule {
    pub needle: String,
    pub exit_code: i32,
    pub stdout: String,
}

/// Scripted [`SandboxHandle`] double.
#[derive(Debug)]
pub struct ScriptedHandle {
    id: String,
    state: Mutex<SandboxState>,
    rules: Mutex<Vec<Rule>>,
    /// Exit code for commands no rule matches; `None` makes them errors.
    pub default_exit: Option<i32>,
    pub execs: Mutex<Vec<String>>,
    pub uploads: Mutex<Vec<(String, Vec<u8>)>>,
    pub downloads: Mutex<Vec<String>>,
    /// Remote files served to `download_file`, keyed by remote path.
    pub remote_files: Mutex<BTreeMap<String, Vec<u8>>>,
    pub default_env: Mutex<BTreeMap<String, String>>,
}

impl ScriptedHandle {
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: Mutex::new(SandboxState::Started),
            rules: Mutex::new(Vec::new()),
            default_exit: Some(0),
            execs: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            downloads: Mutex::new(Vec::new()),
            remote_files: Mutex::new(BTreeMap::new()),
            default_env: Mutex::new(BTreeMap::new()),
        }
    }

    /// Respond to commands containing `needle` with `exit_code`/`stdout`.
    pub fn on(&self, needle: &str, exit_code: i32, stdout: &str) {
        #[allow(clippy::unwrap_used)]
        self.rules.lock().unwrap().push(Rule {
            needle: needle.to_string(),
            exit_code,
            stdout: stdout.to_string(),
        });
    }

    /// Pre-load a remote file served by `download_file`.
    pub fn put_remote_file(&self, path: &str, contents: &[u8]) {
        #[allow(clippy::unwrap_used)]
        self.remote_files
            .lock()
            .unwrap()
            .insert(path.to_string(), contents.to_vec());
    }

    #[must_use]
    pub fn exec_log(&self) -> Vec<String> {
        #[allow(clippy::unwrap_used)]
        self.execs.lock().unwrap().clone()
    }

    #[must_use]
    pub fn executed(&self, needle: &str) -> bool {
        self.exec_log().iter().any(|cmd| cmd.contains(needle))
    }

    #[must_use]
    pub fn exec_count(&self) -> usize {
        self.exec_log().len()
    }

    pub fn set_state(&self, state: SandboxState) {
        #[allow(clippy::unwrap_used)]
        let mut guard = self.state.lock().unwrap();
        *guard = state;
    }
}

#[async_trait]
impl SandboxHandle for ScriptedHandle {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn state(&self) -> SandboxState {
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();
        *state
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    async fn start(&self) -> Result<()> {
        self.set_state(SandboxState::Started);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.set_state(SandboxState::Stopped);
        Ok(())
    }

    async fn wait_ready(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn exec(&self, command: &str, _opts: &ExecOptions) -> Result<ExecOutput> {
        #[allow(clippy::unwrap_used)]
        self.execs.lock().unwrap().push(command.to_string());
        #[allow(clippy::unwrap_used)]
        let rules = self.rules.lock().unwrap().clone();
        for rule in &rules {
            if command.contains(rule.needle.as_str()) {
                return Ok(ExecOutput {
                    exit_code: rule.exit_code,
                    stdout: rule.stdout.clone(),
                    stderr: String::new(),
                });
            }
        }
        match self.default_exit {
            Some(code) => Ok(ExecOutput {
                exit_code: code,
                stdout: String::new(),
                stderr: String::new(),
            }),
            None => anyhow::bail!("unscripted command: {command}"),
        }
    }

    async fn exec_interactive(&self, command: &str, opts: &ExecOptions) -> Result<i32> {
        Ok(self.exec(command, opts).await?.exit_code)
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<()> {
        let bytes = std::fs::read(local)?;
        #[allow(clippy::unwrap_used)]
        self.uploads.lock().unwrap().push((remote.to_string(), bytes));
        Ok(())
    }

    async fn download_file(&self, remote: &str, local: &Path) -> Result<()> {
        #[allow(clippy::unwrap_used)]
        self.downloads.lock().unwrap().push(remote.to_string());
        #[allow(clippy::unwrap_used)]
        let files = self.remote_files.lock().unwrap();
        let Some(bytes) = files.get(remote) else {
            anyhow::bail!("no scripted remote file at {remote}");
        };
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(local, bytes)?;
        Ok(())
    }

    async fn get_preview_url(&self, _port: u16) -> Result<Option<String>> {
        Ok(None)
    }

    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    fn set_default_env(&self, env: BTreeMap<String, String>) {
        #[allow(clippy::unwrap_used)]
        let mut guard = self.default_env.lock().unwrap();
        *guard = env;
    }
}
