//! warmpy: run Python fragments on a warm, recycled worker process.
//!
//! A single long-lived `warmpy-worker` process runs every fragment, so the
//! interpreter start-up cost is paid once. Each fragment still gets:
//! - a fresh, empty binding scope
//! - its own captured stdout/stderr (and optional stdin)
//! - `sys.path` rolled back afterwards, and optionally `sys.modules`
//!
//! The worker is recycled after a fixed number of executions and replaced
//! whenever it times out or corrupts its output channel.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use warmpy::prelude::*;
//!
//! # async fn demo() -> warmpy::Result<()> {
//! let executor = Executor::new(ExecutorConfig::default())?;
//!
//! let result = executor.execute("x = 40 + 2").await?;
//! assert_eq!(result.binding("x"), Some(&serde_json::json!(42)));
//!
//! let result = executor.execute("print(x)").await?;
//! assert!(result.error.is_some()); // bindings do not leak between calls
//! # Ok(())
//! # }
//! ```

pub mod bench;

pub use warmpy_core::{
    Error, ExecutionRequest, ExecutionResult, Executor, ExecutorConfig, ExecutorStats,
    FragmentError, Result, WorkerSpec, WorkerState,
};

/// Protocol and worker-side building blocks, for custom workers.
pub mod core {
    pub use warmpy_core::*;
}

/// Common imports for executor users.
pub mod prelude {
    pub use warmpy_core::{
        ExecutionRequest, ExecutionResult, Executor, ExecutorConfig, FragmentError, WorkerSpec,
    };
}
