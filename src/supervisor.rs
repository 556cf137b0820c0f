//! Panic-safe supervision of long-lived worker tasks.
//!
//! Each worker runs as its own tokio task under a shared
//! [`CancellationToken`]. A panicking iteration is converted into an error
//! (`panic in <name>: <value>`) instead of tearing down the process, and the
//! restart policy decides whether the worker runs again after a delay that
//! doubles up to `max_backoff`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// When a worker iteration is run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Run once, never restart.
    Never,
    /// Restart only after an error (or panic).
    OnError,
    /// Restart after every return, error or not.
    Always,
}

/// Per-worker supervision options.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub policy: RestartPolicy,
    /// Maximum restarts; `0` means unlimited.
    pub max_restarts: u32,
    /// Initial restart delay; doubles per restart.
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            policy: RestartPolicy::OnError,
            max_restarts: 0,
            backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

type ErrorHandler = Arc<dyn Fn(&str, &anyhow::Error) + Send + Sync>;

/// Supervises a set of named workers sharing one cancellation scope.
pub struct Supervisor {
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    on_error: Option<ErrorHandler>,
}

impl Supervisor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            on_error: None,
        }
    }

    /// Install a handler invoked for every worker error, unless the
    /// supervisor has already been stopped.
    #[must_use]
    pub fn with_error_handler(
        mut self,
        handler: impl Fn(&str, &anyhow::Error) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Token cancelled by [`Supervisor::stop`]; workers receive a clone.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn a supervised worker. `factory` is invoked once per iteration
    /// with the shared cancellation token; panics inside the iteration are
    /// caught and treated as errors.
    pub fn start<F, Fut>(&self, name: impl Into<String>, factory: F, opts: WorkerOptions)
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let cancel = self.cancel.clone();
        let on_error = self.on_error.clone();

        let handle = tokio::spawn(async move {
            let mut restarts: u32 = 0;
            let mut delay = opts.backoff;
            loop {
                if cancel.is_cancelled() {
                    break;
                }

                // Run the iteration in its own task so a panic surfaces as
                // a JoinError instead of unwinding through the supervisor.
                let iteration = tokio::spawn(factory(cancel.clone()));
                let outcome: Result<()> = match iteration.await {
                    Ok(result) => result,
                    Err(join_err) if join_err.is_panic() => {
                        let payload = join_err.into_panic();
                        let value = payload
                            .downcast_ref::<&str>()
                            .map(ToString::to_string)
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic payload".to_string());
                        error!(worker = %name, %value, "worker panicked");
                        Err(anyhow!("panic in {name}: {value}"))
                    }
                    Err(_) => Err(anyhow!("worker {name} was aborted")),
                };

                let errored = match outcome {
                    Ok(()) => false,
                    Err(err) => {
                        if !cancel.is_cancelled()
                            && let Some(handler) = &on_error
                        {
                            handler(&name, &err);
                        }
                        true
                    }
                };

                let policy_permits = match opts.policy {
                    RestartPolicy::Never => false,
                    RestartPolicy::OnError => errored,
                    RestartPolicy::Always => true,
                };
                let budget_permits = opts.max_restarts == 0 || restarts < opts.max_restarts;
                if !policy_permits || !budget_permits || cancel.is_cancelled() {
                    break;
                }

                restarts += 1;
                debug!(worker = %name, restarts, ?delay, "restarting worker");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(opts.max_backoff);
            }
        });

        #[allow(clippy::unwrap_used)]
        self.handles.lock().unwrap().push(handle);
    }

    /// Cancel the shared token and wait for every worker to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = {
            #[allow(clippy::unwrap_used)]
            let mut guard = self.handles.lock().unwrap();
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
