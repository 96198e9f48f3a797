//! Worker process handle.
//!
//! Spawns a worker with piped stdio, waits for its readiness token, and
//! exchanges one JSON line per request. The worker's stderr is forwarded to
//! the tracing log; it never carries protocol traffic.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::config::{WORKER_PATH_ENV, WorkerSpec};
use crate::error::{Error, Result};
use crate::protocol::{WorkRequest, WorkResponse, is_ready_line};

/// File name of the worker executable.
pub const WORKER_BINARY: &str = if cfg!(windows) {
    "warmpy-worker.exe"
} else {
    "warmpy-worker"
};

/// Handle to a running worker process.
pub struct WorkerHandle {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    stdout: BufReader<ChildStdout>,
    pid: u32,
    ready: bool,
    started_at: Instant,
}

impl WorkerHandle {
    /// Spawn a worker and wait for its readiness token.
    ///
    /// The process is killed if it does not announce readiness within
    /// `startup_timeout`.
    pub async fn start(spec: &WorkerSpec, startup_timeout: Duration) -> Result<Self> {
        let mut handle = Self::spawn(spec)?;
        if let Err(e) = handle.handshake(startup_timeout).await {
            handle.kill().await;
            return Err(e);
        }
        Ok(handle)
    }

    /// Spawn a worker without waiting for readiness.
    pub fn spawn(spec: &WorkerSpec) -> Result<Self> {
        let program = match &spec.program {
            Some(program) => program.clone(),
            None => find_worker_binary()?,
        };

        let mut child = Command::new(&program)
            .args(spec.command_args())
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Startup(format!(
                    "failed to spawn worker process '{}': {}",
                    program.display(),
                    e
                ))
            })?;

        let pid = child
            .id()
            .ok_or_else(|| Error::Startup("worker exited immediately".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Startup("failed to get worker stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Startup("failed to get worker stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(pid, "worker stderr: {}", line.trim_end());
                }
            });
        }

        tracing::debug!(pid, program = %program.display(), "Spawned worker");

        Ok(Self {
            child,
            stdin: Some(BufWriter::new(stdin)),
            stdout: BufReader::new(stdout),
            pid,
            ready: false,
            started_at: Instant::now(),
        })
    }

    /// Wait for the readiness token, which must be the first line the
    /// worker writes.
    pub async fn handshake(&mut self, timeout: Duration) -> Result<()> {
        let mut line = String::new();
        let read = tokio::time::timeout(timeout, self.stdout.read_line(&mut line))
            .await
            .map_err(|_| Error::Startup(format!("no READY within {:?}", timeout)))?;

        match read {
            Ok(0) => Err(Error::Startup("worker exited before READY".to_string())),
            Ok(_) if is_ready_line(&line) => {
                self.ready = true;
                tracing::debug!(
                    pid = self.pid,
                    elapsed_ms = self.started_at.elapsed().as_millis() as u64,
                    "Worker ready"
                );
                Ok(())
            }
            Ok(_) => Err(Error::Startup(format!(
                "expected READY, got {:?}",
                line.trim_end()
            ))),
            Err(e) => Err(Error::Startup(format!("failed to read READY: {}", e))),
        }
    }

    /// Write one request line. Fails until the handshake has succeeded.
    pub async fn send(&mut self, request: &WorkRequest) -> Result<()> {
        if !self.ready {
            return Err(Error::Protocol("worker has not sent READY".to_string()));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Protocol("worker stdin is closed".to_string()))?;
        stdin.write_all(request.to_line()?.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Read one response line.
    ///
    /// Returns `Ok(None)` on a clean end of stream. Blank lines are skipped.
    /// A line longer than `max_bytes`, a final line without its newline, or a
    /// line that does not decode is a protocol error.
    pub async fn recv(&mut self, max_bytes: usize) -> Result<Option<WorkResponse>> {
        let limit = max_bytes as u64 + 1;
        let mut line = String::new();
        loop {
            line.clear();
            let n = (&mut self.stdout)
                .take(limit)
                .read_line(&mut line)
                .await
                .map_err(|e| Error::Protocol(format!("failed to read response: {}", e)))?;

            if n == 0 {
                return Ok(None);
            }
            if !line.ends_with('\n') {
                return Err(if n > max_bytes {
                    Error::Protocol(format!("response exceeds {} bytes", max_bytes))
                } else {
                    Error::Protocol("truncated response".to_string())
                });
            }
            if line.trim().is_empty() {
                continue;
            }
            return WorkResponse::from_line(&line)
                .map(Some)
                .map_err(|e| Error::Protocol(format!("malformed response: {}", e)));
        }
    }

    /// Whether the process is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Whether the readiness token has been received.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Process ID of the worker.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Time since the worker was spawned.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Kill the worker immediately and reap it.
    pub async fn kill(&mut self) {
        self.stdin = None;
        if let Err(e) = self.child.start_kill() {
            // Already exited.
            tracing::trace!(pid = self.pid, "kill: {}", e);
        }
        if let Err(e) = self.child.wait().await {
            tracing::warn!(pid = self.pid, "Failed to reap worker: {}", e);
        }
    }

    /// Close the worker's stdin and give it `grace` to exit on its own
    /// before killing it.
    pub async fn shutdown(mut self, grace: Duration) -> Option<ExitStatus> {
        self.stdin = None;
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(pid = self.pid, %status, "Worker exited");
                Some(status)
            }
            Ok(Err(e)) => {
                tracing::warn!(pid = self.pid, "Failed to wait for worker: {}", e);
                None
            }
            Err(_) => {
                tracing::debug!(pid = self.pid, "Worker ignored shutdown, killing");
                self.kill().await;
                None
            }
        }
    }
}

/// Locate the worker executable.
///
/// Search order:
/// 1. `WARMPY_WORKER_PATH`
/// 2. Next to the current executable (or its parent, for test binaries in `deps/`)
/// 3. System `PATH`
/// 4. `target/{debug,release}` relative to the crate manifest, for development
pub fn find_worker_binary() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Ok(exe_path) = std::env::current_exe() {
        for dir in exe_path.ancestors().skip(1).take(2) {
            let worker_path = dir.join(WORKER_BINARY);
            if worker_path.exists() {
                return Ok(worker_path);
            }
        }
    }

    if let Ok(path) = which::which(WORKER_BINARY) {
        return Ok(path);
    }

    if let Some(manifest_dir) = option_env!("CARGO_MANIFEST_DIR") {
        for profile in ["debug", "release"] {
            let path = PathBuf::from(manifest_dir)
                .join("..")
                .join("..")
                .join("target")
                .join(profile)
                .join(WORKER_BINARY);
            if path.exists() {
                return Ok(path.canonicalize().unwrap_or(path));
            }
        }
    }

    Err(Error::Startup(format!(
        "could not find {} binary. Set {} or ensure it's in PATH.",
        WORKER_BINARY, WORKER_PATH_ENV
    )))
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;

    /// Worker spec that runs a shell script in place of a real worker.
    pub(crate) fn sh(script: &str) -> WorkerSpec {
        WorkerSpec::program("sh").arg("-c").arg(script)
    }

    const STARTUP: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_start_and_exchange() {
        let spec = sh(r#"echo READY; while read l; do echo '{"seq":1,"stdout":"ok"}'; done"#);
        let mut worker = WorkerHandle::start(&spec, STARTUP).await.unwrap();
        assert!(worker.is_alive());
        assert!(worker.pid() > 0);

        worker.send(&WorkRequest::new("x").with_seq(1)).await.unwrap();
        let resp = worker.recv(1024).await.unwrap().unwrap();
        assert_eq!(resp.seq, Some(1));
        assert_eq!(resp.stdout, "ok");
    }

    #[tokio::test]
    async fn test_send_before_handshake_is_refused() {
        let mut worker = WorkerHandle::spawn(&sh("echo READY; cat")).unwrap();
        assert!(!worker.is_ready());
        let err = worker.send(&WorkRequest::new("x")).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        worker.handshake(STARTUP).await.unwrap();
        assert!(worker.is_ready());
        worker.send(&WorkRequest::new("x")).await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_token_fails_startup() {
        let err = WorkerHandle::start(&sh("echo NOPE; sleep 5"), STARTUP)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Startup(ref m) if m.contains("NOPE")), "{}", err);
    }

    #[tokio::test]
    async fn test_exit_before_ready_fails_startup() {
        let err = WorkerHandle::start(&sh("exit 3"), STARTUP)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Startup(_)));
    }

    #[tokio::test]
    async fn test_silent_worker_times_out() {
        let err = WorkerHandle::start(&sh("sleep 30"), Duration::from_millis(200))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("no READY"), "{}", err);
    }

    #[tokio::test]
    async fn test_missing_program_fails_startup() {
        let spec = WorkerSpec::program("/nonexistent/warmpy-worker");
        let err = WorkerHandle::start(&spec, STARTUP).await.err().unwrap();
        assert!(matches!(err, Error::Startup(_)));
    }

    #[tokio::test]
    async fn test_recv_eof_is_none() {
        let mut worker = WorkerHandle::start(&sh("echo READY; read l; exit 0"), STARTUP)
            .await
            .unwrap();
        worker.send(&WorkRequest::new("x")).await.unwrap();
        assert!(worker.recv(1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recv_rejects_garbage() {
        let mut worker = WorkerHandle::start(&sh("echo READY; read l; echo '{oops'"), STARTUP)
            .await
            .unwrap();
        worker.send(&WorkRequest::new("x")).await.unwrap();
        let err = worker.recv(1024).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(ref m) if m.contains("malformed")));
    }

    #[tokio::test]
    async fn test_recv_rejects_oversized_line() {
        let script = r#"echo READY; read l; printf '{"stdout":"%0400d"}\n' 0"#;
        let mut worker = WorkerHandle::start(&sh(script), STARTUP).await.unwrap();
        worker.send(&WorkRequest::new("x")).await.unwrap();
        let err = worker.recv(128).await.unwrap_err();
        assert!(err.to_string().contains("exceeds 128 bytes"), "{}", err);
    }

    #[tokio::test]
    async fn test_recv_rejects_truncated_line() {
        let script = r#"echo READY; read l; printf '{"stdout":'"#;
        let mut worker = WorkerHandle::start(&sh(script), STARTUP).await.unwrap();
        worker.send(&WorkRequest::new("x")).await.unwrap();
        let err = worker.recv(1024).await.unwrap_err();
        assert!(err.to_string().contains("truncated"), "{}", err);
    }

    #[tokio::test]
    async fn test_shutdown_closes_stdin() {
        let worker = WorkerHandle::start(&sh("echo READY; cat > /dev/null"), STARTUP)
            .await
            .unwrap();
        let status = worker.shutdown(Duration::from_secs(5)).await;
        assert!(status.unwrap().success());
    }

    #[tokio::test]
    async fn test_shutdown_kills_after_grace() {
        let worker = WorkerHandle::start(&sh("echo READY; exec sleep 30"), STARTUP)
            .await
            .unwrap();
        let start = Instant::now();
        let status = worker.shutdown(Duration::from_millis(200)).await;
        assert!(status.is_none());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_kill_stops_process() {
        let mut worker = WorkerHandle::start(&sh("echo READY; exec sleep 30"), STARTUP)
            .await
            .unwrap();
        worker.kill().await;
        assert!(!worker.is_alive());
    }
}
