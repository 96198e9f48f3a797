//! Executor configuration.
//!
//! Defaults match a long-running service: recycle every 1000 executions,
//! collect garbage every 100, 30 s per call. Every field can be overridden
//! from `WARMPY_*` environment variables via [`ExecutorConfig::from_env`].

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::restart::{DEFAULT_GC_INTERVAL, DEFAULT_MAX_EXECUTIONS, RestartPolicy};

/// Environment variable naming the worker binary.
pub const WORKER_PATH_ENV: &str = "WARMPY_WORKER_PATH";

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on the readiness handshake.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default grace period for a worker to exit after its stdin is closed.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Default cap on a single response line (64 MiB).
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024;

/// How to launch a worker process.
#[derive(Debug, Clone, Default)]
pub struct WorkerSpec {
    /// Worker executable. `None` searches for `warmpy-worker`.
    pub program: Option<PathBuf>,
    /// Extra arguments passed before the search-path arguments.
    pub args: Vec<String>,
    /// Directories appended to the worker's module search path at startup.
    pub search_paths: Vec<PathBuf>,
    /// Extra environment variables for the worker.
    pub env: Vec<(String, String)>,
}

impl WorkerSpec {
    /// Launch a specific executable.
    pub fn program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
            ..Self::default()
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append a module search path directory.
    pub fn search_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_paths.push(dir.into());
        self
    }

    /// Set an environment variable for the worker.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Full argument list: `args`, then one `--search-path DIR` per directory.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        for dir in &self.search_paths {
            args.push("--search-path".to_string());
            args.push(dir.to_string_lossy().into_owned());
        }
        args
    }
}

/// Configuration for an [`Executor`](crate::Executor).
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Worker launch settings.
    pub worker: WorkerSpec,
    /// Restart and garbage-collection cadence.
    pub restart: RestartPolicy,
    /// Evict modules imported by each fragment.
    pub cleanup_modules: bool,
    /// Timeout for calls that do not specify one.
    pub default_timeout: Duration,
    /// Bound on a worker's readiness handshake.
    pub startup_timeout: Duration,
    /// Time a worker gets to exit on shutdown before it is killed.
    pub shutdown_grace: Duration,
    /// Longest accepted response line.
    pub max_response_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker: WorkerSpec::default(),
            restart: RestartPolicy::default(),
            cleanup_modules: false,
            default_timeout: DEFAULT_TIMEOUT,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }
}

impl ExecutorConfig {
    /// Defaults overridden by `WARMPY_*` environment variables.
    ///
    /// - `WARMPY_WORKER_PATH` — worker executable
    /// - `WARMPY_MAX_EXECUTIONS` — restart budget
    /// - `WARMPY_GC_INTERVAL` — executions between GC passes (`0` disables)
    /// - `WARMPY_CLEANUP_MODULES` — `true`/`false`/`1`/`0`
    /// - `WARMPY_TIMEOUT_SECS` — default per-call timeout
    /// - `WARMPY_STARTUP_TIMEOUT_SECS` — handshake bound
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup(WORKER_PATH_ENV) {
            config.worker.program = Some(PathBuf::from(path));
        }
        if let Some(value) = lookup("WARMPY_MAX_EXECUTIONS") {
            config.restart.max_executions = parse_u64("WARMPY_MAX_EXECUTIONS", &value)?;
        }
        if let Some(value) = lookup("WARMPY_GC_INTERVAL") {
            let interval = parse_u64("WARMPY_GC_INTERVAL", &value)?;
            config.restart.gc_interval = (interval > 0).then_some(interval);
        }
        if let Some(value) = lookup("WARMPY_CLEANUP_MODULES") {
            config.cleanup_modules = parse_bool("WARMPY_CLEANUP_MODULES", &value)?;
        }
        if let Some(value) = lookup("WARMPY_TIMEOUT_SECS") {
            config.default_timeout = parse_secs("WARMPY_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = lookup("WARMPY_STARTUP_TIMEOUT_SECS") {
            config.startup_timeout = parse_secs("WARMPY_STARTUP_TIMEOUT_SECS", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Use a specific worker launch spec.
    pub fn with_worker(mut self, worker: WorkerSpec) -> Self {
        self.worker = worker;
        self
    }

    /// Set the restart budget.
    pub fn with_max_executions(mut self, max_executions: u64) -> Self {
        self.restart.max_executions = max_executions;
        self
    }

    /// Set the garbage-collection cadence.
    pub fn with_gc_interval(mut self, gc_interval: Option<u64>) -> Self {
        self.restart.gc_interval = gc_interval;
        self
    }

    /// Enable or disable deep module cleanup.
    pub fn with_cleanup_modules(mut self, cleanup_modules: bool) -> Self {
        self.cleanup_modules = cleanup_modules;
        self
    }

    /// Set the default per-call timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the readiness handshake bound.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Check the configuration for values the executor cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.restart.max_executions == 0 {
            return Err(Error::Config("max_executions must be at least 1".to_string()));
        }
        if self.default_timeout.is_zero() {
            return Err(Error::Config("default_timeout must be non-zero".to_string()));
        }
        if self.startup_timeout.is_zero() {
            return Err(Error::Config("startup_timeout must be non-zero".to_string()));
        }
        if self.max_response_bytes == 0 {
            return Err(Error::Config("max_response_bytes must be non-zero".to_string()));
        }
        Ok(())
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{}={:?}: {}", key, value, e)))
}

fn parse_secs(key: &str, value: &str) -> Result<Duration> {
    let secs: f64 = value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{}={:?}: {}", key, value, e)))?;
    Duration::try_from_secs_f64(secs)
        .map_err(|e| Error::Config(format!("{}={:?}: {}", key, value, e)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{}={:?}: expected a boolean", key, value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ExecutorConfig::default();
        assert_eq!(config.restart.max_executions, DEFAULT_MAX_EXECUTIONS);
        assert_eq!(config.restart.gc_interval, Some(DEFAULT_GC_INTERVAL));
        assert!(!config.cleanup_modules);
        assert_eq!(config.default_timeout, Duration::from_secs(30));
        config.validate().unwrap();
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = ExecutorConfig::from_lookup(lookup(&[
            ("WARMPY_WORKER_PATH", "/opt/warmpy-worker"),
            ("WARMPY_MAX_EXECUTIONS", "50"),
            ("WARMPY_GC_INTERVAL", "0"),
            ("WARMPY_CLEANUP_MODULES", "yes"),
            ("WARMPY_TIMEOUT_SECS", "2.5"),
        ]))
        .unwrap();

        assert_eq!(
            config.worker.program,
            Some(PathBuf::from("/opt/warmpy-worker"))
        );
        assert_eq!(config.restart.max_executions, 50);
        assert_eq!(config.restart.gc_interval, None);
        assert!(config.cleanup_modules);
        assert_eq!(config.default_timeout, Duration::from_millis(2500));
        assert_eq!(config.startup_timeout, DEFAULT_STARTUP_TIMEOUT);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = ExecutorConfig::from_lookup(lookup(&[("WARMPY_MAX_EXECUTIONS", "lots")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = ExecutorConfig::from_lookup(lookup(&[("WARMPY_CLEANUP_MODULES", "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains("WARMPY_CLEANUP_MODULES"));

        let err =
            ExecutorConfig::from_lookup(lookup(&[("WARMPY_TIMEOUT_SECS", "-1")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_zero_budget_is_invalid() {
        let config = ExecutorConfig::default().with_max_executions(0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let err =
            ExecutorConfig::from_lookup(lookup(&[("WARMPY_MAX_EXECUTIONS", "0")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_worker_spec_command_args() {
        let spec = WorkerSpec::program("/bin/warmpy-worker")
            .arg("-v")
            .search_path("/srv/lib")
            .search_path("/srv/vendor");
        assert_eq!(
            spec.command_args(),
            vec![
                "-v",
                "--search-path",
                "/srv/lib",
                "--search-path",
                "/srv/vendor"
            ]
        );
    }
}
