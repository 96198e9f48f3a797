//! Supervisor for one persistent worker.
//!
//! All callers share a single worker through an exclusive async section.
//! Each call runs in a spawned task that owns the section guard, so a caller
//! that drops its future after dispatch does not leave a half-read response
//! on the channel: the task still resolves the exchange (and any restart)
//! before the next caller gets the worker.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::config::ExecutorConfig;
use crate::error::{Error, Result};
use crate::lifecycle::{Lifecycle, WorkerState};
use crate::process::WorkerHandle;
use crate::protocol::{RequestOptions, WorkRequest, WorkResponse};
use crate::restart::ExecutionCounter;

/// One call to [`Executor::execute`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionRequest {
    /// Fragment source text.
    pub code: String,
    /// Text presented to the fragment as standard input.
    pub input: Option<String>,
    /// Per-call timeout; the executor default applies when `None`.
    pub timeout: Option<Duration>,
    /// Overrides the executor's deep module cleanup setting for this call.
    pub cleanup_modules: Option<bool>,
}

impl ExecutionRequest {
    /// Create a request for a fragment.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }

    /// Set the fragment's standard input.
    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Set the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override deep module cleanup for this call.
    pub fn with_cleanup_modules(mut self, cleanup_modules: bool) -> Self {
        self.cleanup_modules = Some(cleanup_modules);
        self
    }
}

impl From<&str> for ExecutionRequest {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

impl From<String> for ExecutionRequest {
    fn from(code: String) -> Self {
        Self::new(code)
    }
}

/// A fault raised by the fragment itself. The worker stays healthy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FragmentError {
    /// Exception text.
    pub message: String,
    /// Formatted traceback, when the worker supplied one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl fmt::Display for FragmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for FragmentError {}

/// Outcome of a call that reached the worker and got an answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Captured standard output, trimmed.
    pub stdout: String,
    /// Captured standard error, trimmed.
    pub stderr: String,
    /// Names left in the fragment's scope.
    pub bindings: Map<String, Value>,
    /// The fragment's own failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FragmentError>,
    /// Per-executor sequence number of this call.
    pub seq: u64,
    /// Process that ran the fragment.
    pub worker_pid: u32,
    /// Wall time from dispatch to response.
    #[serde(skip)]
    pub elapsed: Duration,
}

impl ExecutionResult {
    fn from_response(response: WorkResponse, seq: u64, worker_pid: u32, elapsed: Duration) -> Self {
        let error = response.error.map(|message| FragmentError {
            message,
            traceback: response.traceback,
        });
        Self {
            stdout: response.stdout,
            stderr: response.stderr,
            bindings: response.bindings,
            error,
            seq,
            worker_pid,
            elapsed,
        }
    }

    /// Whether the fragment ran without raising.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Look up a binding by name.
    pub fn binding(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    /// Convert a fragment failure into an `Err`.
    pub fn into_result(self) -> std::result::Result<Self, FragmentError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }
}

/// Point-in-time view of an executor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorStats {
    /// Current lifecycle state.
    pub state: WorkerState,
    /// Completed calls on the current worker.
    pub executions_since_restart: u64,
    /// Completed calls over the executor's lifetime.
    pub total_executions: u64,
    /// Workers replaced after the first one started.
    pub restarts: u64,
    /// Execution budget per worker.
    pub max_executions: u64,
    /// Whether deep module cleanup is on by default.
    pub cleanup_modules: bool,
    /// Process id of the current worker, if one is running.
    pub worker_pid: Option<u32>,
    /// Time since the current worker was spawned.
    #[serde(skip)]
    pub worker_uptime: Option<Duration>,
}

/// Runs fragments on a persistent worker process.
///
/// Cheap to clone; clones share the same worker.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Mutex<Supervisor>>,
}

impl Executor {
    /// Create an executor. The worker is started on the first call or by
    /// [`start`](Self::start).
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Supervisor::new(config))),
        })
    }

    /// Create an executor configured from `WARMPY_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(ExecutorConfig::from_env()?)
    }

    /// Start the worker now instead of on the first call.
    pub async fn start(&self) -> Result<()> {
        let mut guard = self.inner.clone().lock_owned().await;
        tokio::spawn(async move { guard.ensure_worker().await })
            .await
            .map_err(task_failed)?
    }

    /// Run one fragment.
    ///
    /// A fragment that raises is still `Ok`, with
    /// [`ExecutionResult::error`] set. `Err` means the call itself failed:
    /// [`Error::Timeout`] and [`Error::Protocol`] replace the worker and fail
    /// only this call; [`Error::WorkerUnavailable`] persists until
    /// [`revive`](Self::revive).
    pub async fn execute(&self, request: impl Into<ExecutionRequest>) -> Result<ExecutionResult> {
        let request = request.into();
        let mut guard = self.inner.clone().lock_owned().await;
        tokio::spawn(async move { guard.execute(request).await })
            .await
            .map_err(task_failed)?
    }

    /// Snapshot of the executor's counters. Waits for any in-flight call.
    pub async fn stats(&self) -> ExecutorStats {
        self.inner.lock().await.stats()
    }

    /// Close the worker's stdin, give it the configured grace period to
    /// exit, then kill it. Later calls fail with
    /// [`Error::WorkerUnavailable`] until [`revive`](Self::revive).
    pub async fn shutdown(&self) {
        let mut guard = self.inner.clone().lock_owned().await;
        if let Err(e) = tokio::spawn(async move { guard.shutdown().await }).await {
            tracing::warn!("Shutdown did not complete: {}", e);
        }
    }

    /// Allow a dead executor to try starting a worker again on the next call.
    /// Returns `false` if the executor was not dead.
    pub async fn revive(&self) -> bool {
        let mut supervisor = self.inner.lock().await;
        if supervisor.lifecycle.state() != WorkerState::Dead {
            return false;
        }
        tracing::info!("Reviving executor");
        supervisor.lifecycle.advance(WorkerState::Starting);
        true
    }
}

fn task_failed(e: tokio::task::JoinError) -> Error {
    Error::Internal(format!("supervisor task ended abnormally: {}", e))
}

/// State guarded by the executor's exclusive section.
struct Supervisor {
    config: ExecutorConfig,
    worker: Option<WorkerHandle>,
    lifecycle: Lifecycle,
    counter: ExecutionCounter,
    next_seq: u64,
    total_executions: u64,
    restarts: u64,
}

impl Supervisor {
    fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            worker: None,
            lifecycle: Lifecycle::default(),
            counter: ExecutionCounter::default(),
            next_seq: 1,
            total_executions: 0,
            restarts: 0,
        }
    }

    async fn execute(&mut self, request: ExecutionRequest) -> Result<ExecutionResult> {
        self.ensure_worker().await?;

        let seq = self.next_seq;
        self.next_seq += 1;

        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        let options = RequestOptions {
            cleanup_modules: request
                .cleanup_modules
                .unwrap_or(self.config.cleanup_modules),
            collect_garbage: self.config.restart.gc_due(&self.counter),
        };
        let wire = WorkRequest::new(request.code)
            .with_seq(seq)
            .with_input(request.input)
            .with_options(options);

        let max_bytes = self.config.max_response_bytes;
        let worker = self
            .worker
            .as_mut()
            .ok_or_else(|| Error::Internal("no worker after startup".to_string()))?;
        let pid = worker.pid();

        self.lifecycle.advance(WorkerState::Executing);
        let start = Instant::now();
        let exchange = tokio::time::timeout(timeout, async {
            worker.send(&wire).await?;
            worker.recv(max_bytes).await
        })
        .await;
        let elapsed = start.elapsed();

        let response = match exchange {
            Ok(Ok(Some(response))) => response,
            Ok(Ok(None)) => {
                let err = Error::Protocol("worker closed its output".to_string());
                return Err(self.fail_call(seq, err).await);
            }
            Ok(Err(e)) => {
                let err = match e {
                    Error::Io(e) => Error::Protocol(format!("worker channel failed: {}", e)),
                    other => other,
                };
                return Err(self.fail_call(seq, err).await);
            }
            Err(_) => {
                tracing::warn!(seq, pid, ?timeout, "Execution timed out, killing worker");
                return Err(self.fail_call(seq, Error::Timeout(timeout)).await);
            }
        };

        if let Some(echoed) = response.seq
            && echoed != seq
        {
            let err = Error::Protocol(format!("expected response seq {}, got {}", seq, echoed));
            return Err(self.fail_call(seq, err).await);
        }

        self.counter.record();
        self.total_executions += 1;
        self.lifecycle.advance(WorkerState::Ready);

        tracing::debug!(
            seq,
            pid,
            elapsed_ms = elapsed.as_millis() as u64,
            executions = self.counter.count(),
            gc = options.collect_garbage,
            failed = response.error.is_some(),
            "Execution complete"
        );

        Ok(ExecutionResult::from_response(response, seq, pid, elapsed))
    }

    /// Replace the worker after a failed exchange and hand back the error
    /// for the caller.
    async fn fail_call(&mut self, seq: u64, err: Error) -> Error {
        if !matches!(err, Error::Timeout(_)) {
            tracing::warn!(seq, "Worker channel failed: {}", err);
        }
        let reason = err.to_string();
        if let Err(e) = self.replace_worker(&reason).await {
            tracing::debug!(seq, "Replacement after failed call unavailable: {}", e);
        }
        err
    }

    /// Make sure a ready worker with remaining budget is in place.
    async fn ensure_worker(&mut self) -> Result<()> {
        let state = self.lifecycle.state();
        if !state.is_available() {
            let reason = self.lifecycle.dead_reason().unwrap_or("worker is dead");
            return Err(Error::WorkerUnavailable(reason.to_string()));
        }
        match state {
            WorkerState::Starting => return self.start_first_worker().await,
            WorkerState::Executing | WorkerState::Restarting => {
                return self.replace_worker("previous call did not complete").await;
            }
            WorkerState::Ready | WorkerState::Dead => {}
        }

        if self.config.restart.restart_due(&self.counter) {
            tracing::debug!(
                executions = self.counter.count(),
                budget = self.config.restart.max_executions,
                "Execution budget reached"
            );
            return self.replace_worker("execution budget reached").await;
        }

        let alive = self.worker.as_mut().is_some_and(|w| w.is_alive());
        if !alive {
            tracing::warn!("Worker is no longer running");
            return self.replace_worker("worker exited").await;
        }
        Ok(())
    }

    async fn start_first_worker(&mut self) -> Result<()> {
        match WorkerHandle::start(&self.config.worker, self.config.startup_timeout).await {
            Ok(worker) => {
                tracing::info!(pid = worker.pid(), "Worker started");
                self.worker = Some(worker);
                self.counter.reset();
                self.lifecycle.advance(WorkerState::Ready);
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::error!("Worker failed to start: {}", reason);
                self.lifecycle.kill(reason.clone());
                Err(Error::WorkerUnavailable(reason))
            }
        }
    }

    /// Kill the current worker and start a replacement.
    async fn replace_worker(&mut self, reason: &str) -> Result<()> {
        if self.lifecycle.state() != WorkerState::Restarting {
            self.lifecycle.advance(WorkerState::Restarting);
        }

        let old_pid = match self.worker.take() {
            Some(mut old) => {
                old.kill().await;
                Some(old.pid())
            }
            None => None,
        };

        match WorkerHandle::start(&self.config.worker, self.config.startup_timeout).await {
            Ok(worker) => {
                tracing::info!(?old_pid, new_pid = worker.pid(), reason, "Worker restarted");
                self.worker = Some(worker);
                self.counter.reset();
                self.restarts += 1;
                self.lifecycle.advance(WorkerState::Ready);
                Ok(())
            }
            Err(e) => {
                let reason = format!("replacement worker failed: {}", e);
                tracing::error!(?old_pid, "{}", reason);
                self.lifecycle.kill(reason.clone());
                Err(Error::WorkerUnavailable(reason))
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            let pid = worker.pid();
            let status = worker.shutdown(self.config.shutdown_grace).await;
            tracing::info!(pid, ?status, "Worker shut down");
        }
        match self.lifecycle.state() {
            WorkerState::Dead => {}
            WorkerState::Starting | WorkerState::Ready => {
                self.lifecycle.kill("executor shut down")
            }
            WorkerState::Executing => {
                self.lifecycle.advance(WorkerState::Restarting);
                self.lifecycle.kill("executor shut down");
            }
            WorkerState::Restarting => self.lifecycle.kill("executor shut down"),
        }
    }

    fn stats(&self) -> ExecutorStats {
        let worker = self.worker.as_ref();
        ExecutorStats {
            state: self.lifecycle.state(),
            executions_since_restart: self.counter.count(),
            total_executions: self.total_executions,
            restarts: self.restarts,
            max_executions: self.config.restart.max_executions,
            cleanup_modules: self.config.cleanup_modules,
            worker_pid: worker.map(|w| w.pid()),
            worker_uptime: worker.map(|w| w.uptime()),
        }
    }
}
