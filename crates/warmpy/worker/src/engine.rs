//! Embedded CPython engine.
//!
//! Each call takes the GIL for the duration of one operation only, so
//! threads started by earlier fragments keep running between requests.

use std::ffi::CString;
use std::path::Path;

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyInt, PyList, PyModule, PyString};
use serde_json::{Map, Value};
use warmpy_core::{Engine, Error, Execution, Fragment, GlobalState, Result};

/// Runs fragments with `exec` semantics in a fresh dict per call.
pub struct PythonEngine {
    sys: Py<PyModule>,
    io: Py<PyModule>,
    json: Py<PyModule>,
    gc: Py<PyModule>,
    traceback: Py<PyModule>,
}

impl PythonEngine {
    /// Initialize the interpreter and import the modules the engine uses.
    pub fn new() -> Result<Self> {
        Python::with_gil(|py| -> PyResult<Self> {
            let import = |name: &str| py.import(name).map(Bound::unbind);
            Ok(Self {
                sys: import("sys")?,
                io: import("io")?,
                json: import("json")?,
                gc: import("gc")?,
                traceback: import("traceback")?,
            })
        })
        .map_err(engine_error)
    }

    /// Interpreter version string, for logging.
    pub fn version(&self) -> String {
        Python::with_gil(|py| py.version().to_string())
    }

    /// Append a directory to `sys.path`.
    pub fn append_search_path(&mut self, dir: &Path) -> Result<()> {
        Python::with_gil(|py| -> PyResult<()> {
            self.sys_path(py)?.append(dir.to_string_lossy().into_owned())
        })
        .map_err(engine_error)
    }

    fn sys_path<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyList>> {
        Ok(self.sys.bind(py).getattr("path")?.downcast_into::<PyList>()?)
    }

    fn sys_modules<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        Ok(self.sys.bind(py).getattr("modules")?.downcast_into::<PyDict>()?)
    }

    /// Run `fragment` with stdio redirected into string buffers.
    fn run_captured(&self, py: Python<'_>, fragment: &Fragment<'_>) -> PyResult<Execution> {
        let sys = self.sys.bind(py);
        let io = self.io.bind(py);

        let stdout = io.call_method0("StringIO")?;
        let stderr = io.call_method0("StringIO")?;
        let stdin = io.call_method1("StringIO", (fragment.input.unwrap_or(""),))?;

        let saved_stdout = sys.getattr("stdout")?;
        let saved_stderr = sys.getattr("stderr")?;
        let saved_stdin = sys.getattr("stdin")?;
        sys.setattr("stdout", &stdout)?;
        sys.setattr("stderr", &stderr)?;
        sys.setattr("stdin", &stdin)?;

        let scope = PyDict::new(py);
        let outcome = match CString::new(fragment.code) {
            Ok(code) => py.run(code.as_c_str(), Some(&scope), None),
            Err(_) => Err(PyValueError::new_err(
                "source code string cannot contain null bytes",
            )),
        };

        let restored = sys
            .setattr("stdout", saved_stdout)
            .and(sys.setattr("stderr", saved_stderr))
            .and(sys.setattr("stdin", saved_stdin));

        let mut execution = Execution {
            stdout: captured(&stdout)?,
            stderr: captured(&stderr)?,
            ..Execution::default()
        };
        restored?;

        match outcome {
            Ok(()) => execution.bindings = self.bindings(py, &scope)?,
            Err(err) => {
                execution.error = Some(describe_error(py, &err));
                execution.traceback = self.format_traceback(py, &err);
            }
        }
        Ok(execution)
    }

    /// Public names in `scope`, excluding dunders and modules.
    fn bindings(&self, py: Python<'_>, scope: &Bound<'_, PyDict>) -> PyResult<Map<String, Value>> {
        let dumps = self.json.bind(py).getattr("dumps")?;
        let kwargs = PyDict::new(py);
        kwargs.set_item("allow_nan", false)?;

        let mut bindings = Map::new();
        for (key, value) in scope.iter() {
            let Ok(name) = key.extract::<String>() else {
                continue;
            };
            if (name.starts_with("__") && name.ends_with("__")) || value.is_instance_of::<PyModule>() {
                continue;
            }

            bindings.insert(name, encode_binding(&dumps, &kwargs, &value));
        }
        Ok(bindings)
    }

    fn format_traceback(&self, py: Python<'_>, err: &PyErr) -> Option<String> {
        let lines = self
            .traceback
            .bind(py)
            .call_method1(
                "format_exception",
                (err.get_type(py), err.value(py), err.traceback(py)),
            )
            .ok()?;
        let text = PyString::new(py, "")
            .call_method1("join", (lines,))
            .ok()?
            .extract::<String>()
            .ok()?;
        Some(text.trim_end().to_string())
    }
}

/// JSON for values `json.dumps` accepts exactly, otherwise their text.
///
/// Integers wider than 64 bits would parse as `f64`, so they are sent as
/// their decimal string instead.
fn encode_binding(
    dumps: &Bound<'_, PyAny>,
    kwargs: &Bound<'_, PyDict>,
    value: &Bound<'_, PyAny>,
) -> Value {
    let encoded = dumps
        .call((value,), Some(kwargs))
        .and_then(|text| text.extract::<String>())
        .ok()
        .and_then(|text| serde_json::from_str::<Value>(&text).ok())
        .filter(|json| !(json.is_f64() && value.is_instance_of::<PyInt>()));
    if let Some(json) = encoded {
        return json;
    }

    let text = value
        .str()
        .or_else(|_| value.repr())
        .and_then(|text| text.extract::<String>());
    match text {
        Ok(text) => Value::String(text),
        Err(err) => {
            let type_name = value
                .get_type()
                .name()
                .map(|name| name.to_string())
                .unwrap_or_else(|_| "object".to_string());
            tracing::debug!(type_name, "Binding has no text form: {}", err);
            Value::String(format!("<unrepresentable {}>", type_name))
        }
    }
}

impl GlobalState for PythonEngine {
    fn search_path_len(&mut self) -> Result<usize> {
        Python::with_gil(|py| -> PyResult<usize> { Ok(self.sys_path(py)?.len()) })
            .map_err(engine_error)
    }

    fn pop_search_path(&mut self) -> Result<Option<String>> {
        Python::with_gil(|py| -> PyResult<Option<String>> {
            let path = self.sys_path(py)?;
            if path.is_empty() {
                return Ok(None);
            }
            let entry = path.call_method0("pop")?;
            Ok(Some(
                entry
                    .extract::<String>()
                    .unwrap_or_else(|_| entry.to_string()),
            ))
        })
        .map_err(engine_error)
    }

    fn module_names(&mut self) -> Result<Vec<String>> {
        Python::with_gil(|py| -> PyResult<Vec<String>> {
            Ok(self
                .sys_modules(py)?
                .keys()
                .iter()
                .filter_map(|key| key.extract::<String>().ok())
                .collect())
        })
        .map_err(engine_error)
    }

    fn evict_module(&mut self, name: &str) -> Result<bool> {
        Python::with_gil(|py| -> PyResult<bool> {
            let modules = self.sys_modules(py)?;
            if !modules.contains(name)? {
                return Ok(false);
            }
            modules.del_item(name)?;
            Ok(true)
        })
        .map_err(engine_error)
    }
}

impl Engine for PythonEngine {
    fn run(&mut self, fragment: &Fragment<'_>) -> Execution {
        Python::with_gil(|py| {
            self.run_captured(py, fragment).unwrap_or_else(|err| {
                tracing::error!("Engine failure: {}", err);
                Execution::failed(format!("engine error: {}", describe_error(py, &err)))
            })
        })
    }

    fn collect_garbage(&mut self) -> Result<usize> {
        Python::with_gil(|py| -> PyResult<usize> {
            self.gc.bind(py).call_method0("collect")?.extract::<usize>()
        })
        .map_err(engine_error)
    }
}

fn captured(buffer: &Bound<'_, PyAny>) -> PyResult<String> {
    let text: String = buffer.call_method0("getvalue")?.extract()?;
    Ok(text.trim().to_string())
}

/// `TypeName: message`, or just the type name when the message is empty.
fn describe_error(py: Python<'_>, err: &PyErr) -> String {
    let type_name = err
        .get_type(py)
        .name()
        .map(|name| name.to_string())
        .unwrap_or_else(|_| "Exception".to_string());
    let message = err.value(py).to_string();
    if message.is_empty() {
        type_name
    } else {
        format!("{}: {}", type_name, message)
    }
}

fn engine_error(err: PyErr) -> Error {
    Error::Engine(err.to_string())
}
