//! Wire protocol between the supervisor and a worker process.
//!
//! Records are JSON-serialized and newline-delimited over the worker's
//! stdin (requests) and stdout (responses). Before reading its first request
//! the worker writes the bare [`READY_TOKEN`] line exactly once.
//!
//! ```text
//! worker  -> READY
//! parent  -> {"seq":1,"code":"x = 40 + 2"}
//! worker  -> {"seq":1,"stdout":"","bindings":{"x":42}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Readiness token written once by a worker before it accepts requests.
pub const READY_TOKEN: &str = "READY";

/// Request from parent to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRequest {
    /// Sequence number echoed back in the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Fragment source text.
    #[serde(default)]
    pub code: String,
    /// Auxiliary input, presented to the fragment as its standard input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    /// Per-request flags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<RequestOptions>,
}

/// Flags attached to a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    /// Evict module-registry entries imported by the fragment.
    #[serde(default)]
    pub cleanup_modules: bool,
    /// Run a full garbage-collection pass after the fragment.
    #[serde(default)]
    pub collect_garbage: bool,
}

/// Response from worker to parent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkResponse {
    /// Sequence number of the request this answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Captured standard output. Required on every response.
    pub stdout: String,
    /// Captured standard error.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    /// Resulting bindings of the fragment's scope.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub bindings: Map<String, Value>,
    /// Fragment failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Formatted traceback for `error`, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl WorkRequest {
    /// Create a request for a fragment.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            seq: None,
            code: code.into(),
            input: None,
            options: None,
        }
    }

    /// Set the sequence number.
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    /// Set the auxiliary input.
    pub fn with_input(mut self, input: Option<String>) -> Self {
        self.input = input;
        self
    }

    /// Set the request flags. Default flags are omitted from the wire.
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = (options != RequestOptions::default()).then_some(options);
        self
    }

    /// Flags for this request, defaulted when absent.
    pub fn options(&self) -> RequestOptions {
        self.options.unwrap_or_default()
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl WorkResponse {
    /// Create an error response with no captured output.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Whether the fragment failed.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

/// Whether `line` is the readiness token (surrounding whitespace ignored).
pub fn is_ready_line(line: &str) -> bool {
    line.trim() == READY_TOKEN
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let req = WorkRequest::new("x = 1")
            .with_seq(7)
            .with_options(RequestOptions {
                cleanup_modules: true,
                collect_garbage: false,
            });
        let line = req.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            value,
            json!({
                "seq": 7,
                "code": "x = 1",
                "options": {"cleanupModules": true, "collectGarbage": false}
            })
        );
    }

    #[test]
    fn test_default_options_are_omitted() {
        let req = WorkRequest::new("pass").with_options(RequestOptions::default());
        let line = req.to_line().unwrap();
        assert!(!line.contains("options"));
        assert!(!line.contains("input"));
        assert_eq!(req.options(), RequestOptions::default());
    }

    #[test]
    fn test_multiline_code_stays_on_one_line() {
        let req = WorkRequest::new("for i in range(3):\n    print(i)\n");
        let line = req.to_line().unwrap();
        assert_eq!(line.matches('\n').count(), 1);

        let parsed = WorkRequest::from_line(&line).unwrap();
        assert_eq!(parsed.code, "for i in range(3):\n    print(i)\n");
    }

    #[test]
    fn test_minimal_request_from_line() {
        let parsed = WorkRequest::from_line(r#"{"code": "print(1)"}"#).unwrap();
        assert_eq!(parsed.code, "print(1)");
        assert_eq!(parsed.seq, None);
        assert!(!parsed.options().cleanup_modules);
    }

    #[test]
    fn test_minimal_response_from_line() {
        let parsed = WorkResponse::from_line(r#"{"stdout": ""}"#).unwrap();
        assert_eq!(parsed, WorkResponse::default());
        assert!(!parsed.is_error());
    }

    #[test]
    fn test_response_ignores_unknown_fields() {
        let parsed =
            WorkResponse::from_line(r#"{"stdout": "hi", "locals": {}, "exit_code": 0}"#).unwrap();
        assert_eq!(parsed.stdout, "hi");
    }

    #[test]
    fn test_error_response_serialization() {
        let resp = WorkResponse::error("No code provided");
        let line = resp.to_line().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value, json!({"stdout": "", "error": "No code provided"}));
        assert!(WorkResponse::from_line(&line).unwrap().is_error());
    }

    #[test]
    fn test_malformed_line_is_rejected() {
        assert!(WorkRequest::from_line("not json").is_err());
        assert!(WorkResponse::from_line("{\"stdout\": ").is_err());
    }

    #[test]
    fn test_response_without_stdout_is_rejected() {
        assert!(WorkResponse::from_line(r#"{"seq": 1, "bindings": {"x": 1}}"#).is_err());
    }

    #[test]
    fn test_ready_line() {
        assert!(is_ready_line("READY\n"));
        assert!(is_ready_line("  READY \r\n"));
        assert!(!is_ready_line("READY!"));
        assert!(!is_ready_line(""));
    }
}
