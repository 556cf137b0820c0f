//! Structured error taxonomy for sandbox operations.
//!
//! Every fallible operation in the crate returns either a [`SandboxError`]
//! or an `anyhow::Error` wrapping one. The predicates at the bottom of this
//! module ([`is_retryable`], [`get_sandbox_error`], [`is_not_found_error`])
//! are the only supported ways to introspect an error chain.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Category of a sandbox failure. Drives user messages, suggestions, and
/// retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorCode {
    Unknown,
    SandboxCreate,
    SandboxStart,
    SandboxNotFound,
    Credentials,
    Sync,
    Agent,
    Ssh,
    Network,
    Config,
    Volume,
    Snapshot,
    Preflight,
    Timeout,
    Permission,
}

impl ErrorCode {
    /// Stable wire/name form, e.g. `sandbox_create`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Unknown => "unknown",
            ErrorCode::SandboxCreate => "sandbox_create",
            ErrorCode::SandboxStart => "sandbox_start",
            ErrorCode::SandboxNotFound => "sandbox_not_found",
            ErrorCode::Credentials => "credentials",
            ErrorCode::Sync => "sync",
            ErrorCode::Agent => "agent",
            ErrorCode::Ssh => "ssh",
            ErrorCode::Network => "network",
            ErrorCode::Config => "config",
            ErrorCode::Volume => "volume",
            ErrorCode::Snapshot => "snapshot",
            ErrorCode::Preflight => "preflight",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Permission => "permission",
        }
    }

    /// One-line human description used by [`SandboxError::user_message`].
    fn describe(self) -> &'static str {
        match self {
            ErrorCode::Unknown => "Something went wrong",
            ErrorCode::SandboxCreate => "Could not create the sandbox",
            ErrorCode::SandboxStart => "Could not start the sandbox",
            ErrorCode::SandboxNotFound => "The sandbox no longer exists",
            ErrorCode::Credentials => "Credential setup failed",
            ErrorCode::Sync => "Workspace sync failed",
            ErrorCode::Agent => "Agent setup failed",
            ErrorCode::Ssh => "SSH connection failed",
            ErrorCode::Network => "A network request failed",
            ErrorCode::Config => "Configuration is invalid",
            ErrorCode::Volume => "Volume operation failed",
            ErrorCode::Snapshot => "Snapshot operation failed",
            ErrorCode::Preflight => "Preflight checks failed",
            ErrorCode::Timeout => "The operation timed out",
            ErrorCode::Permission => "Permission denied",
        }
    }

    /// Default recovery suggestion, one per code.
    fn default_suggestion(self) -> &'static str {
        match self {
            ErrorCode::Unknown => "Re-run with AMUX_LOG_LEVEL=debug for details",
            ErrorCode::SandboxCreate => "Check your provider quota and API key, then retry",
            ErrorCode::SandboxStart => "Run 'amux up --recreate' to replace the sandbox",
            ErrorCode::SandboxNotFound => "Run 'amux up' to create a new sandbox",
            ErrorCode::Credentials => "Authenticate the agent inside the sandbox and retry",
            ErrorCode::Sync => "Retry; if it persists, run 'amux sync --full'",
            ErrorCode::Agent => "Run 'amux up' again to reinstall the agent",
            ErrorCode::Ssh => "Check that 'ssh' is installed and on your PATH",
            ErrorCode::Network => "Check your internet connection",
            ErrorCode::Config => "Fix the reported setting and retry",
            ErrorCode::Volume => "Check the provider's volume state, then retry",
            ErrorCode::Snapshot => "Verify the snapshot id (AMUX_SNAPSHOT_ID) exists",
            ErrorCode::Preflight => "Resolve the failing checks or set AMUX_SKIP_PREFLIGHT=1",
            ErrorCode::Timeout => "Retry; the provider may be slow right now",
            ErrorCode::Permission => "Check file and API permissions for the failing path",
        }
    }

    /// Whether errors of this code are transient by default.
    #[must_use]
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::Network | ErrorCode::Timeout | ErrorCode::Ssh
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sentinel for lookups that found nothing. [`is_not_found_error`] matches
/// this in addition to `ErrorCode::SandboxNotFound`.
#[derive(Debug, Error)]
#[error("not found")]
pub struct NotFound;

/// A structured sandbox error: what failed, where, and what to do about it.
pub struct SandboxError {
    code: ErrorCode,
    op: String,
    agent: Option<String>,
    sandbox_id: Option<String>,
    context: BTreeMap<String, String>,
    suggestion: Option<String>,
    retryable: bool,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl SandboxError {
    /// Create an error for `op` with the given code. Retryability defaults
    /// from the code.
    #[must_use]
    pub fn new(code: ErrorCode, op: impl Into<String>) -> Self {
        Self {
            code,
            op: op.into(),
            agent: None,
            sandbox_id: None,
            context: BTreeMap::new(),
            suggestion: None,
            retryable: code.default_retryable(),
            source: None,
        }
    }

    #[must_use]
    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    #[must_use]
    pub fn with_sandbox_id(mut self, id: impl Into<String>) -> Self {
        self.sandbox_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    #[must_use]
    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    #[must_use]
    pub fn op(&self) -> &str {
        &self.op
    }

    #[must_use]
    pub fn agent(&self) -> Option<&str> {
        self.agent.as_deref()
    }

    #[must_use]
    pub fn sandbox_id(&self) -> Option<&str> {
        self.sandbox_id.as_deref()
    }

    #[must_use]
    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    #[must_use]
    pub fn suggestion(&self) -> &str {
        self.suggestion
            .as_deref()
            .unwrap_or_else(|| self.code.default_suggestion())
    }

    /// Render the error for end users: description, detail, suggestion.
    #[must_use]
    pub fn user_message(&self) -> String {
        let mut msg = self.code.describe().to_string();
        if let Some(source) = &self.source {
            msg.push_str(&format!(": {source}"));
        }
        msg.push_str(&format!("\nSuggestion: {}", self.suggestion()));
        msg
    }
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} failed", self.code, self.op)?;
        if let Some(agent) = &self.agent {
            write!(f, " (agent: {agent})")?;
        }
        if let Some(id) = &self.sandbox_id {
            let short = if id.len() > 8 { &id[..8] } else { id.as_str() };
            write!(f, " (sandbox: {short})")?;
        }
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxError")
            .field("code", &self.code)
            .field("op", &self.op)
            .field("agent", &self.agent)
            .field("sandbox_id", &self.sandbox_id)
            .field("context", &self.context)
            .field("retryable", &self.retryable)
            .field("source", &self.source)
            .finish()
    }
}

impl std::error::Error for SandboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Append-only collector for operations that accumulate failures instead of
/// stopping at the first one (e.g. deleting several sandboxes).
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<anyhow::Error>,
}

impl MultiError {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: anyhow::Error) {
        self.errors.push(err);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Convert into a single error, or `Ok(())` when nothing was collected.
    ///
    /// # Errors
    ///
    /// Returns the rendered multi-error when at least one error was pushed.
    pub fn into_result(self) -> anyhow::Result<()> {
        if self.errors.is_empty() {
            return Ok(());
        }
        Err(anyhow::anyhow!("{self}"))
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} errors occurred:", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            write!(f, "  {}. {err}", i + 1)?;
            if i + 1 < self.errors.len() {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

/// Find the first [`SandboxError`] anywhere in an error chain.
#[must_use]
pub fn get_sandbox_error(err: &anyhow::Error) -> Option<&SandboxError> {
    err.chain().find_map(|e| e.downcast_ref::<SandboxError>())
}

/// Whether the chain carries a retryable [`SandboxError`]. Errors without a
/// structured entry are not retryable.
#[must_use]
pub fn is_retryable(err: &anyhow::Error) -> bool {
    get_sandbox_error(err).is_some_and(SandboxError::is_retryable)
}

/// Whether the chain denotes a missing sandbox: either a [`SandboxError`]
/// with `sandbox_not_found`, or the bare [`NotFound`] sentinel.
#[must_use]
pub fn is_not_found_error(err: &anyhow::Error) -> bool {
    err.chain().any(|e| {
        e.downcast_ref::<NotFound>().is_some()
            || e.downcast_ref::<SandboxError>()
                .is_some_and(|s| s.code() == ErrorCode::SandboxNotFound)
    })
}
