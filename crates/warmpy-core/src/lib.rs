//! Core of the warmpy persistent fragment executor.
//!
//! This crate provides:
//! - Line-delimited JSON wire protocol between supervisor and worker
//! - Worker-side request loop, generic over an interpreter [`Engine`]
//! - Snapshot/rollback of interpreter globals around each execution
//! - Execution-count driven worker recycling
//! - The async [`Executor`] that serializes callers onto one worker

pub mod config;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod process;
pub mod protocol;
pub mod reset;
pub mod restart;
pub mod worker;

pub use config::{ExecutorConfig, WorkerSpec};
pub use error::{Error, Result};
pub use executor::{ExecutionRequest, ExecutionResult, Executor, ExecutorStats, FragmentError};
pub use lifecycle::WorkerState;
pub use process::{WorkerHandle, find_worker_binary};
pub use protocol::{READY_TOKEN, RequestOptions, WorkRequest, WorkResponse};
pub use reset::{GlobalState, GlobalStateSnapshot, RollbackReport};
pub use restart::{ExecutionCounter, RestartPolicy};
pub use worker::{Engine, Execution, Fragment, LoopStats, run_worker_loop};
