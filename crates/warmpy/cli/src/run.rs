//! Run command implementation.
//!
//! Executes a single fragment and prints the result as JSON.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use warmpy_core::{ExecutionRequest, Executor};

use crate::WorkerArgs;

/// Flags of the `run` subcommand.
pub struct RunOptions {
    pub code: Option<String>,
    pub file: Option<PathBuf>,
    pub input: Option<String>,
    pub timeout: Option<f64>,
    pub cleanup_modules: bool,
}

/// Execute the run command.
///
/// Exits with status 1 when the fragment raised.
pub async fn execute(options: RunOptions, worker: &WorkerArgs) -> anyhow::Result<ExitCode> {
    let code = read_code(options.code, options.file.as_ref())?;

    let mut request = ExecutionRequest::new(code);
    if let Some(input) = options.input {
        request = request.with_input(input);
    }
    if let Some(secs) = options.timeout {
        let timeout = Duration::try_from_secs_f64(secs)
            .with_context(|| format!("invalid timeout: {}", secs))?;
        request = request.with_timeout(timeout);
    }
    if options.cleanup_modules {
        request = request.with_cleanup_modules(true);
    }

    let executor = Executor::new(worker.config()?)?;
    let outcome = executor.execute(request).await;
    executor.shutdown().await;
    let result = outcome?;

    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(if result.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Fragment source from the argument, a file, or stdin (in that order).
fn read_code(code: Option<String>, file: Option<&PathBuf>) -> anyhow::Result<String> {
    if let Some(code) = code {
        if code != "-" {
            return Ok(code);
        }
    } else if let Some(path) = file {
        return std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()));
    }

    let mut code = String::new();
    std::io::stdin()
        .read_to_string(&mut code)
        .context("failed to read fragment from stdin")?;
    Ok(code)
}
