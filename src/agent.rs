//! CLI coding agents amux can install and run inside a sandbox.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A supported coding agent. `Shell` is the degenerate agent: a plain login
/// shell, always considered installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Agent {
    Claude,
    Codex,
    Opencode,
    Amp,
    Gemini,
    Droid,
    Shell,
}

/// One way to install an agent. Recipes are tried in order; the first step
/// that succeeds wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallStep {
    /// `curl -fsSL <url> | <shell>` — the agent's native installer.
    Curl { url: &'static str, shell: &'static str },
    /// `npm install -g <package>`.
    Npm { package: &'static str },
}

impl Agent {
    /// Every agent, `shell` last.
    #[must_use]
    pub fn all() -> [Agent; 7] {
        [
            Agent::Claude,
            Agent::Codex,
            Agent::Opencode,
            Agent::Amp,
            Agent::Gemini,
            Agent::Droid,
            Agent::Shell,
        ]
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Agent::Claude => "claude",
            Agent::Codex => "codex",
            Agent::Opencode => "opencode",
            Agent::Amp => "amp",
            Agent::Gemini => "gemini",
            Agent::Droid => "droid",
            Agent::Shell => "shell",
        }
    }

    /// The binary the bootstrap script ultimately resolves and execs.
    #[must_use]
    pub fn command(self) -> &'static str {
        match self {
            Agent::Shell => "bash",
            other => other.as_str(),
        }
    }

    /// Whether the installed binary keeps itself up to date. For these
    /// agents the install marker's existence alone proves freshness; for the
    /// rest the marker's age is checked against the 24 h TTL.
    #[must_use]
    pub fn auto_updates(self) -> bool {
        matches!(self, Agent::Claude | Agent::Amp | Agent::Droid)
    }

    /// Ordered install recipes. Empty for `shell`.
    #[must_use]
    pub fn install_steps(self) -> Vec<InstallStep> {
        match self {
            Agent::Claude => vec![InstallStep::Curl {
                url: "https://claude.ai/install.sh",
                shell: "bash",
            }],
            Agent::Codex => vec![InstallStep::Npm {
                package: "@openai/codex",
            }],
            Agent::Opencode => vec![
                InstallStep::Curl {
                    url: "https://opencode.ai/install",
                    shell: "bash",
                },
                InstallStep::Npm {
                    package: "opencode-ai",
                },
            ],
            Agent::Amp => vec![
                InstallStep::Curl {
                    url: "https://ampcode.com/install.sh",
                    shell: "bash",
                },
                InstallStep::Npm {
                    package: "@sourcegraph/amp",
                },
            ],
            Agent::Gemini => vec![InstallStep::Npm {
                package: "@google/gemini-cli",
            }],
            Agent::Droid => vec![InstallStep::Curl {
                url: "https://app.factory.ai/cli",
                shell: "sh",
            }],
            Agent::Shell => Vec::new(),
        }
    }

    /// Native install locations to probe before falling back to PATH,
    /// relative to `$HOME`.
    #[must_use]
    pub fn native_binary_paths(self) -> Vec<String> {
        let mut paths = vec![format!(".local/bin/{}", self.command())];
        match self {
            Agent::Amp => paths.push(".amp/bin/amp".to_string()),
            Agent::Droid => paths.push(".factory/bin/droid".to_string()),
            _ => {}
        }
        paths
    }

    /// File (relative to `$HOME`) whose presence means the agent is
    /// authenticated inside the sandbox.
    #[must_use]
    pub fn credential_file(self) -> Option<&'static str> {
        match self {
            Agent::Claude => Some(".claude/.credentials.json"),
            Agent::Codex => Some(".codex/auth.json"),
            Agent::Opencode => Some(".local/share/opencode/auth.json"),
            Agent::Amp => Some(".config/amp/settings.json"),
            Agent::Gemini => Some(".gemini/oauth_creds.json"),
            Agent::Droid => Some(".factory/auth.json"),
            Agent::Shell => None,
        }
    }

    /// Directories (relative to `$HOME`) the agent expects to exist before
    /// first run.
    #[must_use]
    pub fn home_dirs(self) -> Vec<&'static str> {
        match self {
            Agent::Claude => vec![".claude"],
            Agent::Codex => vec![".codex", ".config/codex"],
            Agent::Opencode => vec![".config/opencode", ".local/share/opencode"],
            Agent::Amp => vec![".amp", ".config/amp"],
            Agent::Gemini => vec![".gemini"],
            Agent::Droid => vec![".factory"],
            Agent::Shell => vec![],
        }
    }

    /// Agents whose TUIs require the local terminal in raw mode.
    #[must_use]
    pub fn wants_raw_mode(self) -> bool {
        matches!(
            self,
            Agent::Codex | Agent::Opencode | Agent::Amp | Agent::Gemini | Agent::Droid
        )
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Agent {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "claude" => Ok(Agent::Claude),
            "codex" => Ok(Agent::Codex),
            "opencode" => Ok(Agent::Opencode),
            "amp" => Ok(Agent::Amp),
            "gemini" => Ok(Agent::Gemini),
            "droid" => Ok(Agent::Droid),
            "shell" => Ok(Agent::Shell),
            other => Err(anyhow::anyhow!(
                "unknown agent '{other}' (expected one of: claude, codex, opencode, amp, gemini, droid, shell)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_round_trips_through_str() {
        for agent in Agent::all() {
            let parsed: Agent = agent.as_str().parse().expect("parse");
            assert_eq!(parsed, agent);
        }
    }

    #[test]
    fn test_agent_parse_is_case_insensitive() {
        assert_eq!("Claude".parse::<Agent>().expect("parse"), Agent::Claude);
        assert_eq!("GEMINI".parse::<Agent>().expect("parse"), Agent::Gemini);
    }

    #[test]
    fn test_unknown_agent_is_rejected_with_candidates() {
        let err = "cursor".parse::<Agent>().expect_err("unknown");
        assert!(err.to_string().contains("claude"));
    }

    #[test]
    fn test_shell_has_no_install_steps_or_credentials() {
        assert!(Agent::Shell.install_steps().is_empty());
        assert!(Agent::Shell.credential_file().is_none());
        assert_eq!(Agent::Shell.command(), "bash");
    }

    #[test]
    fn test_auto_update_classification() {
        assert!(Agent::Claude.auto_updates());
        assert!(Agent::Amp.auto_updates());
        assert!(Agent::Droid.auto_updates());
        assert!(!Agent::Codex.auto_updates());
        assert!(!Agent::Gemini.auto_updates());
        assert!(!Agent::Opencode.auto_updates());
    }

    #[test]
    fn test_npm_agents_install_via_npm() {
        assert!(matches!(
            Agent::Codex.install_steps().as_slice(),
            [InstallStep::Npm { package: "@openai/codex" }]
        ));
        assert!(matches!(
            Agent::Gemini.install_steps().as_slice(),
            [InstallStep::Npm { package: "@google/gemini-cli" }]
        ));
    }

    #[test]
    fn test_curl_first_npm_fallback_for_opencode_and_amp() {
        for agent in [Agent::Opencode, Agent::Amp] {
            let steps = agent.install_steps();
            assert_eq!(steps.len(), 2, "{agent}");
            assert!(matches!(steps[0], InstallStep::Curl { .. }));
            assert!(matches!(steps[1], InstallStep::Npm { .. }));
        }
    }

    #[test]
    fn test_native_paths_include_agent_specific_bins() {
        assert!(Agent::Amp
            .native_binary_paths()
            .contains(&".amp/bin/amp".to_string()));
        assert!(Agent::Droid
            .native_binary_paths()
            .contains(&".factory/bin/droid".to_string()));
        assert_eq!(
            Agent::Claude.native_binary_paths(),
            vec![".local/bin/claude".to_string()]
        );
    }

    #[test]
    fn test_raw_mode_agents() {
        assert!(!Agent::Claude.wants_raw_mode());
        assert!(!Agent::Shell.wants_raw_mode());
        for agent in [Agent::Codex, Agent::Opencode, Agent::Amp, Agent::Gemini, Agent::Droid] {
            assert!(agent.wants_raw_mode(), "{agent}");
        }
    }

    #[test]
    fn test_serde_uses_lowercase_names() {
        let json = serde_json::to_string(&Agent::Claude).expect("serialize");
        assert_eq!(json, "\"claude\"");
        let back: Agent = serde_json::from_str("\"droid\"").expect("deserialize");
        assert_eq!(back, Agent::Droid);
    }
}
