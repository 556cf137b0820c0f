//! The remote bootstrap shell program.
//!
//! One string, executed under `bash -lc`, that prepares the environment,
//! discovers the agent binary across the PATH variants installers use, and
//! finally `exec`s the agent — optionally wrapped in `script(1)` for TTY
//! emulation or session recording. User-controlled values are quoted with
//! [`crate::shell::quote`]; everything else is fixed template text.

use std::collections::BTreeMap;

use crate::agent::Agent;
use crate::shell::quote;

/// Fallback terminal when the sandbox lacks the caller's terminfo entry.
const FALLBACK_TERM: &str = "xterm-256color";

/// Bin directories prepended ahead of the login-shell PATH.
const KNOWN_BIN_DIRS: [&str; 4] = [
    "/usr/local/share/nvm/current/bin",
    "$HOME/.local/bin",
    "$HOME/.amp/bin",
    "$HOME/.factory/bin",
];

/// Everything the script builder needs to know about the session.
#[derive(Debug, Clone)]
pub struct BootstrapSpec {
    pub agent: Agent,
    /// Remote home directory, exported as `HOME` first thing.
    pub home: String,
    /// Workspace directory to `cd` into.
    pub workspace: String,
    pub env: BTreeMap<String, String>,
    pub args: Vec<String>,
    /// Pre-resolved agent binary path, tried before PATH discovery.
    pub command_path: Option<String>,
    /// Record the session via `script -f` into this sandbox-side file.
    pub record_path: Option<String>,
    /// TTY wrapping override; `None` applies the default (claude only).
    pub tty_wrap: Option<bool>,
    pub debug: bool,
}

impl BootstrapSpec {
    #[must_use]
    pub fn new(agent: Agent, home: impl Into<String>, workspace: impl Into<String>) -> Self {
        Self {
            agent,
            home: home.into(),
            workspace: workspace.into(),
            env: BTreeMap::new(),
            args: Vec::new(),
            command_path: None,
            record_path: None,
            tty_wrap: None,
            debug: false,
        }
    }

    fn wants_tty_wrap(&self) -> bool {
        self.tty_wrap.unwrap_or(self.agent == Agent::Claude)
    }
}

/// Build the bootstrap program for `spec`.
#[must_use]
pub fn build_script(spec: &BootstrapSpec) -> String {
    let command = spec.agent.command();
    let mut lines: Vec<String> = Vec::new();

    // 1. Environment baseline.
    lines.push(format!("export HOME={}", quote(&spec.home)));
    lines.push(format!(
        "if [ -z \"$TERM\" ] || ! infocmp \"$TERM\" >/dev/null 2>&1; then export TERM={FALLBACK_TERM}; fi"
    ));
    lines.push("unset CI".to_string());

    // 2. Caller environment.
    for (key, value) in &spec.env {
        if let Ok(export) = crate::shell::export_env(key, value) {
            lines.push(export);
        }
    }

    // 3. Terminal sanity and PATH discovery.
    lines.push("stty sane 2>/dev/null || true".to_string());
    lines.push(format!(
        "export PATH=\"{}:$PATH\"",
        KNOWN_BIN_DIRS.join(":")
    ));
    lines.push(
        "for amux_d in /usr/local/share/nvm/versions/node/*/bin; do [ -d \"$amux_d\" ] && PATH=\"$amux_d:$PATH\"; done"
            .to_string(),
    );

    // 4. Workspace and npm prefix.
    lines.push(format!("cd {}", quote(&spec.workspace)));
    lines.push(
        "if command -v npm >/dev/null 2>&1; then PATH=\"$(npm config get prefix)/bin:$PATH\"; fi"
            .to_string(),
    );

    if spec.debug {
        lines.push(format!(
            "echo \"AMUX_DEBUG: TERM=$TERM PATH=$PATH agent={command}\" >&2"
        ));
    }

    // 5. Binary resolution: pre-resolved path, PATH, node bin dir, then a
    // fixed fallback list.
    lines.push("AMUX_BIN=''".to_string());
    if let Some(resolved) = &spec.command_path {
        lines.push(format!(
            "if [ -x {path} ]; then AMUX_BIN={path}; fi",
            path = quote(resolved)
        ));
    }
    lines.push(format!(
        "if [ -z \"$AMUX_BIN\" ]; then AMUX_BIN=\"$(command -v {} 2>/dev/null || true)\"; fi",
        quote(command)
    ));
    lines.push(format!(
        "if [ -z \"$AMUX_BIN\" ] && command -v node >/dev/null 2>&1; then amux_nb=\"$(dirname \"$(command -v node)\")\"; [ -x \"$amux_nb/{command}\" ] && AMUX_BIN=\"$amux_nb/{command}\"; fi"
    ));
    let mut fallbacks: Vec<String> = spec
        .agent
        .native_binary_paths()
        .into_iter()
        .map(|rel| format!("$HOME/{rel}"))
        .collect();
    fallbacks.push(format!("/usr/local/bin/{command}"));
    fallbacks.push(format!("/usr/bin/{command}"));
    let candidates = fallbacks
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(" ");
    lines.push(format!(
        "if [ -z \"$AMUX_BIN\" ]; then for amux_c in {candidates}; do if [ -x \"$amux_c\" ]; then AMUX_BIN=\"$amux_c\"; break; fi; done; fi"
    ));

    // 6. Hard failure when nothing resolved.
    lines.push(format!(
        "if [ -z \"$AMUX_BIN\" ]; then echo {msg} >&2; exit 127; fi",
        msg = quote(&format!("{command} not found"))
    ));

    // 7. Assemble the command line and exec.
    let mut suffix = String::new();
    if spec.agent == Agent::Shell {
        suffix.push_str(" -i");
    }
    for arg in &spec.args {
        suffix.push(' ');
        suffix.push_str(&quote(arg));
    }
    lines.push(format!("AMUX_CMDLINE=\"$AMUX_BIN{suffix}\""));

    match &spec.record_path {
        Some(record) => {
            lines.push(format!(
                "if command -v script >/dev/null 2>&1; then exec script -q -f {record} -c \"$AMUX_CMDLINE\"; fi",
                record = quote(record)
            ));
            lines.push(format!("exec \"$AMUX_BIN\"{suffix}"));
        }
        None if spec.wants_tty_wrap() => {
            lines.push(
                "if command -v script >/dev/null 2>&1; then exec script -q -c \"$AMUX_CMDLINE\" /dev/null; fi"
                    .to_string(),
            );
            lines.push(format!("exec \"$AMUX_BIN\"{suffix}"));
        }
        None => {
            lines.push(format!("exec \"$AMUX_BIN\"{suffix}"));
        }
    }

    lines.join("\n")
}
