//! Worker-side request loop.
//!
//! Runs inside the worker process. Announces readiness once, then answers
//! each request line with exactly one response line, in order, until end of
//! input. The interpreter is abstracted behind [`Engine`] so the loop and the
//! reset policy are independent of the embedded language.

use std::any::Any;
use std::io::{BufRead, Write};
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::protocol::{READY_TOKEN, WorkRequest, WorkResponse};
use crate::reset::{GlobalState, run_with_reset};

/// Error text for a request with nothing to run.
pub const NO_CODE_MESSAGE: &str = "No code provided";

/// Source text and input for one execution.
#[derive(Debug, Clone, Copy)]
pub struct Fragment<'a> {
    /// Code to run.
    pub code: &'a str,
    /// Text presented to the fragment as standard input.
    pub input: Option<&'a str>,
}

/// Outcome of running one fragment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Execution {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Names left in the fragment's scope.
    pub bindings: Map<String, Value>,
    /// The fragment's failure, if it raised.
    pub error: Option<String>,
    /// Formatted traceback for `error`.
    pub traceback: Option<String>,
}

impl Execution {
    /// An execution that failed before producing any output.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    fn into_response(self, seq: Option<u64>) -> WorkResponse {
        WorkResponse {
            seq,
            stdout: self.stdout,
            stderr: self.stderr,
            bindings: self.bindings,
            error: self.error,
            traceback: self.traceback,
        }
    }
}

/// An interpreter that runs fragments in fresh scopes.
///
/// Implementations must give every call an empty binding scope and must
/// capture the fragment's output instead of letting it reach the process's
/// stdout. Faults raised by the fragment belong in [`Execution::error`].
pub trait Engine: GlobalState {
    /// Run one fragment.
    fn run(&mut self, fragment: &Fragment<'_>) -> Execution;

    /// Force a full garbage-collection pass. Returns the number of objects
    /// reclaimed, if the engine reports it.
    fn collect_garbage(&mut self) -> Result<usize>;
}

/// Counters reported when the loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Requests answered.
    pub requests: u64,
    /// Requests whose fragment failed.
    pub failures: u64,
}

/// Serve requests from `reader` until end of input.
///
/// Writes the readiness token first. A line that is not a valid request
/// ends the loop with [`Error::Protocol`]; the supervisor replaces the worker.
pub fn run_worker_loop<E, R, W>(engine: &mut E, reader: &mut R, writer: &mut W) -> Result<LoopStats>
where
    E: Engine + ?Sized,
    R: BufRead,
    W: Write,
{
    writer.write_all(READY_TOKEN.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;

    let mut stats = LoopStats::default();
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            tracing::debug!(requests = stats.requests, "Input closed, worker exiting");
            return Ok(stats);
        }
        if line.trim().is_empty() {
            continue;
        }

        let request = WorkRequest::from_line(&line)
            .map_err(|e| Error::Protocol(format!("malformed request: {}", e)))?;

        let response = handle_request(engine, &request);
        stats.requests += 1;
        if response.is_error() {
            stats.failures += 1;
        }

        writer.write_all(response.to_line()?.as_bytes())?;
        writer.flush()?;
    }
}

/// Run one request under the reset policy and build its response.
pub fn handle_request<E: Engine + ?Sized>(engine: &mut E, request: &WorkRequest) -> WorkResponse {
    let (code, input) = match resolve_code(request) {
        Some(resolved) => resolved,
        None => {
            let mut response = WorkResponse::error(NO_CODE_MESSAGE);
            response.seq = request.seq;
            return response;
        }
    };

    let options = request.options();
    let fragment = Fragment { code, input };
    let start = Instant::now();

    let (outcome, report) = run_with_reset(engine, options.cleanup_modules, |engine| {
        panic::catch_unwind(AssertUnwindSafe(|| engine.run(&fragment)))
    });

    let execution = outcome.unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        tracing::error!(seq = ?request.seq, "Engine panicked: {}", message);
        Execution::failed(format!("engine panicked: {}", message))
    });

    if options.collect_garbage {
        match engine.collect_garbage() {
            Ok(collected) => tracing::debug!(collected, "Garbage collection pass"),
            Err(e) => tracing::warn!("Garbage collection failed: {}", e),
        }
    }

    tracing::debug!(
        seq = ?request.seq,
        elapsed_ms = start.elapsed().as_millis() as u64,
        failed = execution.error.is_some(),
        path_entries_removed = report.map(|r| r.path_entries_removed),
        modules_evicted = report.map(|r| r.modules_evicted),
        "Fragment executed"
    );

    execution.into_response(request.seq)
}

/// Pick the code to run: the request's `code`, or else a fenced block in its
/// `input`. Input that supplied the code is not also used as stdin.
fn resolve_code(request: &WorkRequest) -> Option<(&str, Option<&str>)> {
    if !request.code.trim().is_empty() {
        return Some((request.code.as_str(), request.input.as_deref()));
    }
    let code = extract_fenced_code(request.input.as_deref()?)?;
    Some((code, None))
}

/// Extract the first fenced code block from markdown-ish text.
///
/// Prefers a ```` ```python ```` fence, falls back to a bare ```` ``` ````
/// fence, and drops a one-word language tag on the opening line.
pub fn extract_fenced_code(text: &str) -> Option<&str> {
    let text = text.trim();
    let body = match text.split_once("```python") {
        Some((_, rest)) => rest,
        None => strip_language_tag(text.split_once("```")?.1),
    };
    let code = body.split_once("```").map_or(body, |(code, _)| code).trim();
    (!code.is_empty()).then_some(code)
}

fn strip_language_tag(body: &str) -> &str {
    match body.split_once('\n') {
        Some((tag, rest))
            if !tag.is_empty()
                && tag
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '+') =>
        {
            rest
        }
        _ => body,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
