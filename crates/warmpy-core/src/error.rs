//! Error types for warmpy-core.

use std::time::Duration;

use thiserror::Error;

/// Result type for warmpy-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in warmpy-core.
///
/// A fragment's own failure is not an `Error`: it is returned inline in
/// [`ExecutionResult::error`](crate::ExecutionResult::error) and leaves the
/// worker healthy.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed, truncated or out-of-order record on the worker channel.
    /// The worker is presumed corrupted and has been replaced.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The worker did not answer within the call's time bound.
    /// The worker was killed and replaced.
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// A worker failed to reach readiness. The executor stays unavailable
    /// until it is revived.
    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// Worker process could not be started or did not send its readiness token.
    #[error("worker startup failed: {0}")]
    Startup(String),

    /// Invalid executor configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Failure inside the execution engine itself (not the fragment).
    #[error("engine error: {0}")]
    Engine(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The supervising task ended without resolving the call.
    #[error("executor task failed: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error means the worker was (or had to be) replaced.
    pub fn replaced_worker(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Timeout(_))
    }

    /// Short recovery hint for CLI output.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Timeout(_) => Some("raise the timeout with --timeout or check the fragment for infinite loops"),
            Self::WorkerUnavailable(_) | Self::Startup(_) => {
                Some("check that warmpy-worker is installed or set WARMPY_WORKER_PATH")
            }
            Self::Config(_) => Some("check WARMPY_* environment variables and CLI flags"),
            _ => None,
        }
    }

    /// Format the error together with its recovery hint, if any.
    pub fn with_hint(&self) -> String {
        match self.hint() {
            Some(hint) => format!("{}\n  hint: {}", self, hint),
            None => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replaced_worker_classification() {
        assert!(Error::Protocol("eof".into()).replaced_worker());
        assert!(Error::Timeout(Duration::from_secs(1)).replaced_worker());
        assert!(!Error::WorkerUnavailable("gone".into()).replaced_worker());
        assert!(!Error::Config("bad".into()).replaced_worker());
    }

    #[test]
    fn test_with_hint() {
        let err = Error::Timeout(Duration::from_millis(500));
        let text = err.with_hint();
        assert!(text.starts_with("execution timed out after 500ms"));
        assert!(text.contains("hint:"));

        let err = Error::Protocol("bad line".into());
        assert_eq!(err.with_hint(), "protocol error: bad line");
    }
}
