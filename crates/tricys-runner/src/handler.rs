use crate::dispatch::CancelToken;
use crate::error::{JobError, JobResult};
use crate::process::{interpreter_for, run_supervised};
use crate::rewrite::PortOverride;
use crate::table::ResultTable;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const CSV_SOURCE_HANDLER: &str = "tricys.handlers:csv_source";

/// Where a handler comes from, as configured.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerRef {
    /// Executable script; `function` is passed to it as `TRICYS_HANDLER_FUNCTION`.
    Script { path: PathBuf, function: String },
    /// A handler registered in-process under `module:function`.
    Module { module: String, function: String },
}

impl fmt::Display for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerRef::Script { path, function } => write!(f, "{}:{}", path.display(), function),
            HandlerRef::Module { module, function } => write!(f, "{}:{}", module, function),
        }
    }
}

/// User code that writes an override table and says which of its columns
/// feed which port.
///
/// Implementations receive the stage-1 table path, the path they must write
/// and the configured keyword parameters, and return the raw port mapping.
/// [`HandlerInvoker::invoke`] checks the returned value.
pub trait Handler: Send + Sync {
    fn call(&self, input: &Path, output: &Path, params: &Map<String, Value>) -> JobResult<Value>;
}

impl<F> Handler for F
where
    F: Fn(&Path, &Path, &Map<String, Value>) -> JobResult<Value> + Send + Sync,
{
    fn call(&self, input: &Path, output: &Path, params: &Map<String, Value>) -> JobResult<Value> {
        self(input, output, params)
    }
}

/// Runs a script handler as a child process.
///
/// The script gets `TRICYS_HANDLER_INPUT`, `TRICYS_HANDLER_OUTPUT`,
/// `TRICYS_HANDLER_PARAMS` (JSON object) and `TRICYS_HANDLER_FUNCTION`, and
/// prints the port mapping as JSON on its last stdout line.
pub struct ScriptHandler {
    path: PathBuf,
    function: String,
    timeout: Option<Duration>,
    cancel: Option<CancelToken>,
}

impl ScriptHandler {
    pub fn new(path: &Path, function: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            function: function.to_string(),
            timeout: None,
            cancel: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

impl Handler for ScriptHandler {
    fn call(&self, input: &Path, output: &Path, params: &Map<String, Value>) -> JobResult<Value> {
        let mut cmd = match interpreter_for(&self.path) {
            Some(interpreter) => {
                let mut c = Command::new(interpreter);
                c.arg(&self.path);
                c
            }
            None => Command::new(&self.path),
        };
        let work_dir = output.parent().unwrap_or(Path::new("."));
        cmd.current_dir(work_dir);
        cmd.env("TRICYS_HANDLER_INPUT", input);
        cmd.env("TRICYS_HANDLER_OUTPUT", output);
        cmd.env("TRICYS_HANDLER_PARAMS", Value::Object(params.clone()).to_string());
        cmd.env("TRICYS_HANDLER_FUNCTION", &self.function);

        let stem = output
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "handler".to_string());
        let outcome = run_supervised(
            cmd,
            &work_dir.join(format!("{}.handler", stem)),
            self.timeout,
            self.cancel.as_ref(),
        )
        .map_err(|e| JobError::HandlerResolution(format!("cannot start {}: {}", self.path.display(), e)))?;
        if outcome.cancelled {
            return Err(JobError::Cancelled);
        }
        if outcome.timed_out {
            return Err(JobError::HandlerExecution(format!(
                "{} timed out",
                self.path.display()
            )));
        }
        if !outcome.success() {
            return Err(JobError::HandlerExecution(format!(
                "{}:{} exited with {}: {}",
                self.path.display(),
                self.function,
                outcome.exit_label(),
                outcome.stderr_tail()
            )));
        }
        let line = outcome.last_stdout_line().ok_or_else(|| {
            JobError::HandlerContractViolation(format!("{} printed no port mapping", self.path.display()))
        })?;
        serde_json::from_str(line).map_err(|e| {
            JobError::HandlerContractViolation(format!(
                "{} returned non-JSON output '{}': {}",
                self.path.display(),
                line,
                e
            ))
        })
    }
}

/// Copies columns of an existing CSV into the output table.
///
/// Params: `source_path` (CSV file) and `ports`, an object mapping each port
/// to the source column names feeding its elements in order.
pub struct CsvSourceHandler;

impl Handler for CsvSourceHandler {
    fn call(&self, _input: &Path, output: &Path, params: &Map<String, Value>) -> JobResult<Value> {
        let exec = |msg: String| JobError::HandlerExecution(msg);
        let source = params
            .get("source_path")
            .and_then(Value::as_str)
            .ok_or_else(|| exec("csv_source needs a 'source_path' parameter".to_string()))?;
        let ports = params
            .get("ports")
            .and_then(Value::as_object)
            .ok_or_else(|| exec("csv_source needs a 'ports' object".to_string()))?;
        let table = ResultTable::read_csv(Path::new(source)).map_err(|e| exec(e.to_string()))?;

        let mut selected: Vec<String> = Vec::new();
        let mut mapping = Map::new();
        for (port, cols) in ports {
            let names: Vec<&str> = cols
                .as_array()
                .map(|a| a.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            if names.is_empty() {
                return Err(exec(format!("csv_source port '{}' lists no columns", port)));
            }
            let mut spec = vec!["1".to_string()];
            for name in names {
                let idx = match selected.iter().position(|s| s == name) {
                    Some(i) => i,
                    None => {
                        selected.push(name.to_string());
                        selected.len() - 1
                    }
                };
                spec.push((idx + 2).to_string());
            }
            mapping.insert(port.clone(), Value::String(format!("{{{}}}", spec.join(","))));
        }

        let missing: Vec<&str> = selected
            .iter()
            .filter(|c| table.column_index(c).is_none())
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(exec(format!(
                "{} is missing required columns: {}",
                source,
                missing.join(", ")
            )));
        }
        let mut out = ResultTable::new(selected.clone());
        let columns: Vec<Vec<Option<f64>>> = selected
            .iter()
            .map(|c| table.column(c).unwrap_or_default())
            .collect();
        for (row, time) in table.time.iter().enumerate() {
            out.push_row(*time, columns.iter().map(|c| c.get(row).copied().flatten()).collect());
        }
        out.write_csv(output).map_err(|e| exec(e.to_string()))?;
        Ok(Value::Object(mapping))
    }
}

/// Parses `{t, c1, c2, ...}`: 1-based column indices, time column first.
pub fn parse_column_spec(spec: &str) -> Result<Vec<u32>, String> {
    let inner = spec
        .trim()
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| format!("'{}' is not of the form {{t,y1,...}}", spec))?;
    let columns = inner
        .split(',')
        .map(|part| match part.trim().parse::<u32>() {
            Ok(v) if v >= 1 => Ok(v),
            _ => Err(format!("'{}' in '{}' is not a positive column index", part.trim(), spec)),
        })
        .collect::<Result<Vec<u32>, String>>()?;
    if columns.len() < 2 {
        return Err(format!("'{}' needs a time column and at least one data column", spec));
    }
    Ok(columns)
}

/// Resolves handler references and checks what they return.
#[derive(Clone)]
pub struct HandlerInvoker {
    registry: HashMap<String, Arc<dyn Handler>>,
    timeout: Option<Duration>,
}

impl Default for HandlerInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerInvoker {
    /// An invoker knowing the built-in handlers.
    pub fn new() -> Self {
        let mut invoker = Self {
            registry: HashMap::new(),
            timeout: None,
        };
        invoker.register(CSV_SOURCE_HANDLER, Arc::new(CsvSourceHandler));
        invoker
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Makes `handler` available as a `module:function` reference.
    pub fn register(&mut self, key: &str, handler: Arc<dyn Handler>) {
        self.registry.insert(key.to_string(), handler);
    }

    pub fn resolve(&self, handler: &HandlerRef, cancel: &CancelToken) -> JobResult<Arc<dyn Handler>> {
        match handler {
            HandlerRef::Module { module, function } => {
                let key = format!("{}:{}", module, function);
                self.registry
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| JobError::HandlerResolution(format!("no handler registered as '{}'", key)))
            }
            HandlerRef::Script { path, function } => {
                if !path.is_file() {
                    return Err(JobError::HandlerResolution(format!(
                        "handler script {} not found",
                        path.display()
                    )));
                }
                Ok(Arc::new(
                    ScriptHandler::new(path, function)
                        .with_timeout(self.timeout)
                        .with_cancel(cancel.clone()),
                ))
            }
        }
    }

    /// Calls the handler and returns one override per `required` port, in
    /// that order.
    pub fn invoke(
        &self,
        handler: &HandlerRef,
        input: &Path,
        output: &Path,
        params: &Map<String, Value>,
        required: &[String],
        cancel: &CancelToken,
    ) -> JobResult<Vec<PortOverride>> {
        let resolved = self.resolve(handler, cancel)?;
        info!(handler = %handler, input = %input.display(), "invoking handler");
        let returned = resolved.call(input, output, params)?;
        let overrides = check_mapping(handler, &returned, required)?;
        if !output.is_file() {
            return Err(JobError::HandlerContractViolation(format!(
                "{} did not write {}",
                handler,
                output.display()
            )));
        }
        debug!(handler = %handler, ports = overrides.len(), "handler returned port mapping");
        Ok(overrides)
    }
}

fn check_mapping(handler: &HandlerRef, returned: &Value, required: &[String]) -> JobResult<Vec<PortOverride>> {
    let violation = |msg: String| JobError::HandlerContractViolation(format!("{}: {}", handler, msg));
    let mapping = returned
        .as_object()
        .ok_or_else(|| violation(format!("expected a port mapping object, got {}", returned)))?;
    let mut parsed = Vec::with_capacity(mapping.len());
    for (port, spec) in mapping {
        let spec = spec
            .as_str()
            .ok_or_else(|| violation(format!("value for port '{}' must be a string", port)))?;
        let columns = parse_column_spec(spec).map_err(&violation)?;
        parsed.push(PortOverride {
            port: port.clone(),
            columns,
        });
    }
    let missing: Vec<&str> = required
        .iter()
        .filter(|p| !parsed.iter().any(|o| &o.port == *p))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(violation(format!("mapping is missing port(s): {}", missing.join(", "))));
    }
    Ok(required
        .iter()
        .filter_map(|p| parsed.iter().find(|o| &o.port == p).cloned())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;
    use std::fs;

    fn module(key: &str) -> HandlerRef {
        let (module, function) = key.split_once(':').expect("key");
        HandlerRef::Module {
            module: module.to_string(),
            function: function.to_string(),
        }
    }

    fn writes_and_returns(mapping: Value) -> Arc<dyn Handler> {
        Arc::new(move |_: &Path, output: &Path, _: &Map<String, Value>| -> JobResult<Value> {
            fs::write(output, "time,a\n0,1\n")?;
            Ok(mapping.clone())
        })
    }

    #[test]
    fn column_spec_grammar() {
        assert_eq!(parse_column_spec("{1,2,3}"), Ok(vec![1, 2, 3]));
        assert_eq!(parse_column_spec(" { 1, 4 } "), Ok(vec![1, 4]));
        assert!(parse_column_spec("{1}").is_err());
        assert!(parse_column_spec("{1,0}").is_err());
        assert!(parse_column_spec("1,2").is_err());
        assert!(parse_column_spec("{1,x}").is_err());
    }

    #[test]
    fn mapping_is_checked_against_required_ports() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut invoker = HandlerInvoker::new();
        invoker.register("plant:ok", writes_and_returns(json!({"extra": "{1,2}", "to_CL": "{1,2,3}"})));
        invoker.register("plant:partial", writes_and_returns(json!({"to_CL": "{1,2,3}"})));
        invoker.register("plant:bad", writes_and_returns(json!({"to_CL": "1,2,3", "to_TES": "{1,2}"})));
        invoker.register("plant:list", writes_and_returns(json!(["to_CL"])));
        let required = vec!["to_CL".to_string(), "to_TES".to_string()];
        let cancel = CancelToken::new();
        let out = dir.path().join("out.csv");
        let call = |key: &str, required: &[String]| {
            invoker.invoke(&module(key), Path::new("in.csv"), &out, &Map::new(), required, &cancel)
        };

        let ok = call("plant:ok", &required[..1]).expect("ok");
        assert_eq!(
            ok,
            vec![PortOverride {
                port: "to_CL".to_string(),
                columns: vec![1, 2, 3]
            }]
        );
        for key in ["plant:partial", "plant:bad", "plant:list"] {
            let err = call(key, &required).expect_err(key);
            assert_eq!(err.kind(), ErrorKind::HandlerContractViolation, "{}", key);
        }
        let err = call("plant:partial", &required).expect_err("partial");
        assert!(err.to_string().contains("to_TES"));
    }

    #[test]
    fn unknown_handlers_fail_resolution() {
        let invoker = HandlerInvoker::new();
        let cancel = CancelToken::new();
        let err = invoker
            .invoke(&module("nowhere:run"), Path::new("a"), Path::new("b"), &Map::new(), &[], &cancel)
            .expect_err("module");
        assert_eq!(err.kind(), ErrorKind::HandlerResolutionError);
        let script = HandlerRef::Script {
            path: PathBuf::from("/definitely/missing/handler.sh"),
            function: "run".to_string(),
        };
        let err = invoker
            .invoke(&script, Path::new("a"), Path::new("b"), &Map::new(), &[], &cancel)
            .expect_err("script");
        assert_eq!(err.kind(), ErrorKind::HandlerResolutionError);
    }

    #[test]
    fn csv_source_selects_columns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("div.csv");
        fs::write(&source, "time,div.to_CL[1],div.to_CL[2],other\n0,1,2,9\n1,3,4,9\n").expect("write");
        let params = json!({
            "source_path": source.to_string_lossy(),
            "ports": {"to_CL": ["div.to_CL[1]", "div.to_CL[2]"]}
        });
        let params = params.as_object().cloned().expect("object");
        let out = dir.path().join("div_outputs.csv");
        let overrides = HandlerInvoker::new()
            .invoke(
                &module(CSV_SOURCE_HANDLER),
                Path::new("unused.csv"),
                &out,
                &params,
                &["to_CL".to_string()],
                &CancelToken::new(),
            )
            .expect("invoke");
        assert_eq!(overrides[0].columns, vec![1, 2, 3]);
        let written = ResultTable::read_csv(&out).expect("read");
        assert_eq!(written.columns, vec!["div.to_CL[1]", "div.to_CL[2]"]);
        assert_eq!(written.column("div.to_CL[2]").expect("col"), vec![Some(2.0), Some(4.0)]);

        let mut missing = params.clone();
        missing.insert("ports".to_string(), json!({"to_CL": ["nope"]}));
        let err = CsvSourceHandler
            .call(Path::new("x"), &out, &missing)
            .expect_err("missing column");
        assert_eq!(err.kind(), ErrorKind::HandlerExecutionError);
    }

    #[cfg(unix)]
    #[test]
    fn script_handler_reports_mapping_and_failures() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ok = dir.path().join("ok.sh");
        fs::write(
            &ok,
            "printf 'time,y\\n0,%s\\n' \"$(echo \"$TRICYS_HANDLER_PARAMS\" | sed 's/.*\"k\":\\([0-9]*\\).*/\\1/')\" > \"$TRICYS_HANDLER_OUTPUT\"\n\
             echo progress\n\
             echo '{\"y\": \"{1,2}\"}'\n",
        )
        .expect("write");
        let raises = dir.path().join("raises.sh");
        fs::write(&raises, "echo 'ValueError: bad divertor data' >&2\nexit 1\n").expect("write");

        let invoker = HandlerInvoker::new();
        let cancel = CancelToken::new();
        let out = dir.path().join("div_outputs.csv");
        let params = json!({"k": 7}).as_object().cloned().expect("object");
        let script = |path: &Path| HandlerRef::Script {
            path: path.to_path_buf(),
            function: "run".to_string(),
        };
        let overrides = invoker
            .invoke(&script(&ok), Path::new("in.csv"), &out, &params, &["y".to_string()], &cancel)
            .expect("invoke");
        assert_eq!(overrides[0].columns, vec![1, 2]);
        let written = ResultTable::read_csv(&out).expect("read");
        assert_eq!(written.column("y").expect("col"), vec![Some(7.0)]);

        let err = invoker
            .invoke(&script(&raises), Path::new("in.csv"), &out, &params, &["y".to_string()], &cancel)
            .expect_err("raises");
        assert_eq!(err.kind(), ErrorKind::HandlerExecutionError);
        assert!(err.to_string().contains("bad divertor data"));
    }
}
