//! Content-addressed identities: worktree IDs and config hashes.
//!
//! Both are the first 16 hex chars of a SHA-256. The config hash is taken
//! over a canonical JSON rendering in which map keys are recursively sorted
//! but array elements keep their given order — callers that want stable
//! hashes across runs must pass arrays in a stable order themselves.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex-encode the first 8 bytes (16 chars) of a SHA-256 over `input`.
fn short_sha256(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    digest[..8].iter().fold(String::with_capacity(16), |mut s, b| {
        use std::fmt::Write;
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// Stable identity of a project working directory: 16 hex chars of the
/// SHA-256 of its absolute path.
///
/// # Errors
///
/// Returns an error if the path cannot be made absolute.
pub fn compute_worktree_id(cwd: &Path) -> Result<String> {
    let abs = std::path::absolute(cwd)
        .with_context(|| format!("resolving absolute path of {}", cwd.display()))?;
    Ok(short_sha256(abs.to_string_lossy().as_bytes()))
}

/// Render `value` canonically: object keys sorted recursively, arrays kept
/// in order, no insignificant whitespace.
#[must_use]
pub fn stable_stringify(value: &Value) -> String {
    let mut out = String::new();
    write_stable(value, &mut out);
    out
}

fn write_stable(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(*key) {
                    write_stable(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_stable(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Hash the reuse-relevant part of a sandbox configuration: 16 hex chars of
/// the SHA-256 of its canonical rendering. Two configs differing only in map
/// key order hash identically; configs differing in array element order do
/// not.
///
/// # Errors
///
/// Returns an error if the config cannot be serialized.
pub fn compute_config_hash<T: serde::Serialize>(config: &T) -> Result<String> {
    let value = serde_json::to_value(config).context("serializing config for hashing")?;
    Ok(short_sha256(stable_stringify(&value).as_bytes()))
}
