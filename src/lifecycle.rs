//! Create-or-reuse orchestration for project sandboxes.
//!
//! One sandbox per (worktree, provider). Reuse is gated on the stored
//! config hash; a hash mismatch or an explicit `recreate` replaces the
//! sandbox. The persistent volume is mounted at `/amux` ahead of any user
//! mounts so credentials and caches survive recreation.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{PERSIST_MOUNT_PATH, SandboxConfig, VolumeMount};
use crate::error::{ErrorCode, SandboxError};
use crate::hash::{compute_config_hash, compute_worktree_id};
use crate::meta::{MetaStore, SandboxMeta};
use crate::provider::{CreateSandboxRequest, Feature, Provider};
use crate::retry::{RetryConfig, retry};
use crate::sandbox::{
    LABEL_AGENT, LABEL_CREATED_AT, LABEL_PROJECT, LABEL_PROVIDER, LABEL_WORKTREE_ID,
    SandboxHandle, SandboxState,
};

/// How long to wait for a sandbox to report `started`.
pub const READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Deterministic sandbox name for a worktree.
#[must_use]
pub fn sandbox_name(worktree_id: &str) -> String {
    format!("amux-{worktree_id}")
}

/// The labels amux guarantees on every sandbox it creates.
#[must_use]
pub fn build_labels(
    provider_name: &str,
    config: &SandboxConfig,
    worktree_id: &str,
    created_at: &str,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_PROVIDER.to_string(), provider_name.to_string()),
        (LABEL_AGENT.to_string(), config.agent.to_string()),
        (LABEL_WORKTREE_ID.to_string(), worktree_id.to_string()),
        (LABEL_PROJECT.to_string(), config.project.clone()),
        (LABEL_CREATED_AT.to_string(), created_at.to_string()),
    ])
}

/// Ensure a running sandbox for `cwd` on `provider`, creating, reusing, or
/// recreating as needed, and persist its metadata.
///
/// # Errors
///
/// Returns a structured error when validation, creation, or readiness
/// waiting fails.
pub async fn ensure_sandbox(
    provider: &Arc<dyn Provider>,
    cwd: &Path,
    config: SandboxConfig,
    recreate: bool,
    store: &MetaStore,
) -> Result<(Arc<dyn SandboxHandle>, SandboxMeta)> {
    let config = config.normalized();

    if !config.volumes.is_empty() && !provider.supports_feature(Feature::Volumes) {
        return Err(SandboxError::new(ErrorCode::Config, "ensure sandbox")
            .with_suggestion(format!(
                "Provider '{}' does not support volumes; remove the volume config",
                provider.name()
            ))
            .into());
    }
    config.validate_mounts()?;

    let worktree_id = compute_worktree_id(cwd)?;
    let config_hash = compute_config_hash(&config.hash_inputs())?;
    let prior = store.get(&worktree_id, provider.name());

    if let Some(meta) = &prior
        && !recreate
        && meta.config_hash == config_hash
    {
        match adopt_existing(provider, meta).await {
            Ok(Some(handle)) => {
                handle.set_default_env(config.env.clone());
                info!(sandbox = %meta.sandbox_id, "reusing existing sandbox");
                return Ok((handle, meta.clone()));
            }
            Ok(None) => debug!(sandbox = %meta.sandbox_id, "prior sandbox gone, recreating"),
            Err(err) => debug!(sandbox = %meta.sandbox_id, %err, "prior sandbox unreachable, recreating"),
        }
    }

    // Replace whatever was there; deletion failures are non-fatal because
    // the provider may have already reaped the sandbox.
    if let Some(meta) = &prior {
        if let Err(err) = provider.delete_sandbox(&meta.sandbox_id).await {
            debug!(sandbox = %meta.sandbox_id, %err, "ignoring delete failure");
        }
        store.remove(&meta.worktree_id).ok();
    }

    let mounts = resolve_mounts(provider, &config).await?;

    let created_at = Utc::now();
    let request = CreateSandboxRequest {
        name: sandbox_name(&worktree_id),
        labels: build_labels(
            provider.name(),
            &config,
            &worktree_id,
            &created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
        env: config.env.clone(),
        snapshot: config.snapshot.clone(),
        mounts,
        auto_stop_minutes: config.auto_stop_minutes,
    };

    // Transient provider failures (5xx, dropped connections) are worth a
    // few attempts before giving up on the create.
    let cancel = CancellationToken::new();
    let handle = retry(&RetryConfig::network(), &cancel, |_| {
        provider.create_sandbox(&request)
    })
    .await
    .context("creating sandbox")?;
    handle.wait_ready(READY_TIMEOUT).await?;
    handle.set_default_env(config.env.clone());

    let meta = SandboxMeta {
        sandbox_id: handle.id(),
        created_at,
        agent: config.agent,
        provider: provider.name().to_string(),
        worktree_id: worktree_id.clone(),
        project: config.project.clone(),
        config_hash,
    };
    store.put(&meta).context("persisting sandbox metadata")?;
    info!(sandbox = %meta.sandbox_id, provider = %meta.provider, "sandbox ready");
    Ok((handle, meta))
}

/// Try to adopt the previously recorded sandbox. `Ok(None)` means it no
/// longer exists; errors mean it exists but could not be brought up.
async fn adopt_existing(
    provider: &Arc<dyn Provider>,
    meta: &SandboxMeta,
) -> Result<Option<Arc<dyn SandboxHandle>>> {
    let handle = match provider.get_sandbox(&meta.sandbox_id).await {
        Ok(handle) => handle,
        Err(err) if crate::error::is_not_found_error(&err) => return Ok(None),
        Err(err) => return Err(err),
    };
    handle.refresh().await?;
    if handle.state() != SandboxState::Started {
        handle.start().await?;
        // Best effort: a slow start should not force a recreate.
        if let Err(err) = handle.wait_ready(READY_TIMEOUT).await {
            warn!(sandbox = %meta.sandbox_id, %err, "sandbox slow to start, adopting anyway");
        }
    }
    Ok(Some(handle))
}

/// Resolve the persistent-home mount plus any user mounts, in that order.
async fn resolve_mounts(
    provider: &Arc<dyn Provider>,
    config: &SandboxConfig,
) -> Result<Vec<VolumeMount>> {
    let Some(volumes) = provider.volumes() else {
        return Ok(Vec::new());
    };

    let mut mounts = Vec::with_capacity(config.volumes.len() + 1);
    let persist = volumes
        .wait_ready(&config.persist_volume, Duration::ZERO)
        .await
        .context("waiting for persistent volume")?;
    mounts.push(VolumeMount {
        volume_id: persist.id,
        mount_path: PERSIST_MOUNT_PATH.to_string(),
        subpath: None,
        read_only: false,
    });

    for spec in &config.volumes {
        let volume = volumes
            .wait_ready(&spec.name, Duration::ZERO)
            .await
            .with_context(|| format!("waiting for volume {}", spec.name))?;
        mounts.push(VolumeMount {
            volume_id: volume.id,
            mount_path: spec.mount_path.clone(),
            subpath: spec.subpath.clone(),
            read_only: spec.read_only,
        });
    }
    Ok(mounts)
}

/// Delete the sandbox recorded for `cwd` (if any) and drop its metadata.
///
/// # Errors
///
/// Returns an error when the provider deletion fails for a sandbox that
/// still exists.
pub async fn remove_sandbox(
    provider: &Arc<dyn Provider>,
    cwd: &Path,
    store: &MetaStore,
) -> Result<Option<String>> {
    let worktree_id = compute_worktree_id(cwd)?;
    let Some(meta) = store.get(&worktree_id, provider.name()) else {
        return Ok(None);
    };
    match provider.delete_sandbox(&meta.sandbox_id).await {
        Ok(()) => {}
        Err(err) if crate::error::is_not_found_error(&err) => {
            debug!(sandbox = %meta.sandbox_id, "sandbox already gone");
        }
        Err(err) => return Err(err),
    }
    store.remove(&worktree_id)?;
    Ok(Some(meta.sandbox_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;

    #[test]
    fn test_sandbox_name_embeds_worktree_id() {
        assert_eq!(sandbox_name("abcd1234abcd1234"), "amux-abcd1234abcd1234");
    }

    #[test]
    fn test_build_labels_covers_guaranteed_set() {
        let config = SandboxConfig {
            agent: Agent::Claude,
            project: "myproj".to_string(),
            ..SandboxConfig::default()
        };
        let labels = build_labels("daytona", &config, "wt123", "2026-08-01T12:00:00Z");
        assert_eq!(labels.get(LABEL_PROVIDER).map(String::as_str), Some("daytona"));
        assert_eq!(labels.get(LABEL_AGENT).map(String::as_str), Some("claude"));
        assert_eq!(labels.get(LABEL_WORKTREE_ID).map(String::as_str), Some("wt123"));
        assert_eq!(labels.get(LABEL_PROJECT).map(String::as_str), Some("myproj"));
        assert_eq!(
            labels.get(LABEL_CREATED_AT).map(String::as_str),
            Some("2026-08-01T12:00:00Z")
        );
        assert!(crate::sandbox::is_amux_owned(&labels));
    }
}
