//! Sandbox configuration and environment-derived provider settings.
//!
//! Provider credentials are environment-first: every knob reads the
//! `AMUX_`-prefixed variable, then the provider's own conventional name.
//! Persisting configuration to disk is owned by the CLI layer, not here.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::agent::Agent;
use crate::error::{ErrorCode, SandboxError};

/// Mount point of the persistent volume inside every sandbox.
pub const PERSIST_MOUNT_PATH: &str = "/amux";

/// Default name of the persistent volume.
pub const DEFAULT_PERSIST_VOLUME: &str = "amux-persist";

/// Default auto-stop interval in minutes.
pub const DEFAULT_AUTO_STOP_MINUTES: u32 = 30;

/// A user-requested volume mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    #[serde(rename = "mountPath")]
    pub mount_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subpath: Option<String>,
    #[serde(default, rename = "readOnly")]
    pub read_only: bool,
}

/// A resolved mount: the provider-side volume id bound to a mount path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(rename = "mountPath")]
    pub mount_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subpath: Option<String>,
    #[serde(default, rename = "readOnly")]
    pub read_only: bool,
}

/// Everything the lifecycle controller needs to create (or recognize) a
/// sandbox for a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub agent: Agent,
    /// Project display name, used in labels.
    pub project: String,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    /// Minutes of idleness before the provider stops the sandbox;
    /// `0` means "use the default".
    #[serde(default, rename = "autoStopInterval")]
    pub auto_stop_minutes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    /// Environment pushed into the sandbox once at adoption time.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Name of the persistent volume; empty means the default.
    #[serde(default, rename = "persistVolume")]
    pub persist_volume: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            agent: Agent::Shell,
            project: String::new(),
            volumes: Vec::new(),
            auto_stop_minutes: 0,
            snapshot: None,
            env: BTreeMap::new(),
            persist_volume: String::new(),
        }
    }
}

impl SandboxConfig {
    /// Apply the lifecycle defaults: agent falls back to `shell` (already
    /// structural), auto-stop to 30 minutes, persist volume to its default
    /// name.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.auto_stop_minutes == 0 {
            self.auto_stop_minutes = DEFAULT_AUTO_STOP_MINUTES;
        }
        if self.persist_volume.is_empty() {
            self.persist_volume = DEFAULT_PERSIST_VOLUME.to_string();
        }
        self
    }

    /// The subset of the config that participates in the reuse hash.
    #[must_use]
    pub fn hash_inputs(&self) -> serde_json::Value {
        json!({
            "volumes": self.volumes,
            "autoStopInterval": self.auto_stop_minutes,
            "snapshot": self.snapshot,
        })
    }

    /// Reject user mounts that would shadow the persistent volume.
    ///
    /// # Errors
    ///
    /// Returns a `config` error when a mount path is `/amux`, sits under
    /// it, or contains shell metacharacters.
    pub fn validate_mounts(&self) -> Result<()> {
        for spec in &self.volumes {
            crate::shell::validate_path(&spec.mount_path)
                .with_context(|| format!("volume {}", spec.name))?;
            let path = spec.mount_path.trim_end_matches('/');
            if path == PERSIST_MOUNT_PATH
                || spec.mount_path.starts_with(&format!("{PERSIST_MOUNT_PATH}/"))
            {
                return Err(SandboxError::new(ErrorCode::Config, "validate volume mounts")
                    .with_context("mountPath", spec.mount_path.clone())
                    .with_suggestion(format!(
                        "{PERSIST_MOUNT_PATH} is reserved for amux; choose another mount path"
                    ))
                    .into());
            }
        }
        Ok(())
    }
}

/// Remote-API (Daytona) connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaytonaSettings {
    pub api_key: String,
    pub api_url: String,
    pub target: Option<String>,
}

/// Sprites connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpritesSettings {
    pub token: String,
    pub api_url: Option<String>,
}

/// All provider credentials found in the environment. A `None` provider
/// simply was not configured; the registry records it as unavailable.
#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    pub daytona: Option<DaytonaSettings>,
    pub sprites: Option<SpritesSettings>,
    /// Snapshot image override (`AMUX_SNAPSHOT_ID`).
    pub snapshot_id: Option<String>,
}

impl ProviderSettings {
    /// Read provider settings from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read provider settings through an arbitrary variable lookup. This is
    /// the seam tests use instead of mutating the process environment.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let first = |names: &[&str]| {
            names
                .iter()
                .find_map(|name| lookup(name))
                .filter(|v| !v.is_empty())
        };
        let daytona = first(&["AMUX_DAYTONA_API_KEY", "DAYTONA_API_KEY"]).map(|api_key| {
            DaytonaSettings {
                api_key,
                api_url: first(&["AMUX_DAYTONA_API_URL", "DAYTONA_API_URL"])
                    .unwrap_or_else(|| "https://app.daytona.io/api".to_string()),
                target: first(&["AMUX_DAYTONA_TARGET", "DAYTONA_TARGET"]),
            }
        });
        let sprites =
            first(&["AMUX_SPRITES_TOKEN", "SPRITES_TOKEN"]).map(|token| SpritesSettings {
                token,
                api_url: first(&["AMUX_SPRITES_API_URL", "SPRITES_API_URL"]),
            });
        Self {
            daytona,
            sprites,
            snapshot_id: first(&["AMUX_SNAPSHOT_ID"]),
        }
    }
}

/// The amux directory under the platform's user config root. Holds
/// `sandbox.json` and the legacy `computer.json`.
///
/// # Errors
///
/// Returns an error if the platform config directory cannot be determined.
pub fn amux_home() -> Result<PathBuf> {
    let base = dirs::config_dir().context("cannot determine user config directory")?;
    Ok(base.join("amux"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_applies_defaults() {
        let cfg = SandboxConfig::default().normalized();
        assert_eq!(cfg.agent, Agent::Shell);
        assert_eq!(cfg.auto_stop_minutes, DEFAULT_AUTO_STOP_MINUTES);
        assert_eq!(cfg.persist_volume, DEFAULT_PERSIST_VOLUME);
    }

    #[test]
    fn test_normalized_keeps_explicit_values() {
        let cfg = SandboxConfig {
            auto_stop_minutes: 90,
            persist_volume: "my-volume".to_string(),
            ..SandboxConfig::default()
        }
        .normalized();
        assert_eq!(cfg.auto_stop_minutes, 90);
        assert_eq!(cfg.persist_volume, "my-volume");
    }

    #[test]
    fn test_validate_mounts_accepts_ordinary_mounts() {
        let cfg = SandboxConfig {
            volumes: vec![VolumeSpec {
                name: "data".to_string(),
                mount_path: "/data".to_string(),
                subpath: None,
                read_only: false,
            }],
            ..SandboxConfig::default()
        };
        assert!(cfg.validate_mounts().is_ok());
    }

    #[test]
    fn test_validate_mounts_rejects_amux_and_children() {
        for path in ["/amux", "/amux/", "/amux/home", "/amux/deep/nest"] {
            let cfg = SandboxConfig {
                volumes: vec![VolumeSpec {
                    name: "bad".to_string(),
                    mount_path: path.to_string(),
                    subpath: None,
                    read_only: false,
                }],
                ..SandboxConfig::default()
            };
            let err = cfg.validate_mounts().expect_err(path);
            let structured = crate::error::get_sandbox_error(&err).expect("structured");
            assert_eq!(structured.code(), ErrorCode::Config);
        }
    }

    #[test]
    fn test_validate_mounts_allows_amux_prefixed_sibling() {
        // "/amux-data" is a sibling, not a child of /amux.
        let cfg = SandboxConfig {
            volumes: vec![VolumeSpec {
                name: "ok".to_string(),
                mount_path: "/amux-data".to_string(),
                subpath: None,
                read_only: false,
            }],
            ..SandboxConfig::default()
        };
        assert!(cfg.validate_mounts().is_ok());
    }

    #[test]
    fn test_validate_mounts_rejects_metacharacter_paths() {
        let cfg = SandboxConfig {
            volumes: vec![VolumeSpec {
                name: "evil".to_string(),
                mount_path: "/data;rm -rf /".to_string(),
                subpath: None,
                read_only: false,
            }],
            ..SandboxConfig::default()
        };
        assert!(cfg.validate_mounts().is_err());
    }

    #[test]
    fn test_hash_inputs_cover_reuse_relevant_fields_only() {
        let cfg = SandboxConfig {
            snapshot: Some("img-7".to_string()),
            auto_stop_minutes: 45,
            env: BTreeMap::from([("SECRET".to_string(), "x".to_string())]),
            ..SandboxConfig::default()
        };
        let inputs = cfg.hash_inputs();
        assert_eq!(inputs["autoStopInterval"], 45);
        assert_eq!(inputs["snapshot"], "img-7");
        // Env changes must not force a recreate.
        assert!(inputs.get("env").is_none());
    }

    #[test]
    fn test_volume_spec_serde_uses_camel_case() {
        let spec = VolumeSpec {
            name: "data".to_string(),
            mount_path: "/data".to_string(),
            subpath: Some("sub".to_string()),
            read_only: true,
        };
        let json = serde_json::to_value(&spec).expect("serialize");
        assert_eq!(json["mountPath"], "/data");
        assert_eq!(json["readOnly"], true);
    }
}

#[cfg(test)]
mod lookup_tests {
    use std::collections::HashMap;

    use super::*;

    fn settings_from(pairs: &[(&str, &str)]) -> ProviderSettings {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ProviderSettings::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn test_empty_environment_yields_no_providers() {
        let settings = settings_from(&[]);
        assert!(settings.daytona.is_none());
        assert!(settings.sprites.is_none());
        assert!(settings.snapshot_id.is_none());
    }

    #[test]
    fn test_amux_prefix_wins_over_plain_name() {
        let settings = settings_from(&[
            ("AMUX_DAYTONA_API_KEY", "amux-key"),
            ("DAYTONA_API_KEY", "plain-key"),
        ]);
        assert_eq!(
            settings.daytona.expect("daytona configured").api_key,
            "amux-key"
        );
    }

    #[test]
    fn test_plain_name_used_as_fallback() {
        let settings = settings_from(&[("DAYTONA_API_KEY", "plain-key")]);
        assert_eq!(settings.daytona.expect("daytona").api_key, "plain-key");
    }

    #[test]
    fn test_daytona_url_defaults_when_unset() {
        let settings = settings_from(&[("DAYTONA_API_KEY", "key")]);
        assert_eq!(
            settings.daytona.expect("daytona").api_url,
            "https://app.daytona.io/api"
        );
    }

    #[test]
    fn test_empty_values_are_treated_as_unset() {
        let settings = settings_from(&[("DAYTONA_API_KEY", "")]);
        assert!(settings.daytona.is_none());
    }

    #[test]
    fn test_reads_sprites_and_snapshot() {
        let settings = settings_from(&[
            ("SPRITES_TOKEN", "tok"),
            ("AMUX_SNAPSHOT_ID", "snap-1"),
        ]);
        assert_eq!(settings.sprites.expect("sprites").token, "tok");
        assert_eq!(settings.snapshot_id.as_deref(), Some("snap-1"));
    }
}
