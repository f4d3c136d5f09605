use crate::config::EngineConfig;
use crate::error::{JobError, JobResult};
use crate::jobs::Assignment;
use crate::process::{resolve_command_local, run_supervised};
use crate::sweep::ParamValue;
use crate::table::ResultTable;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::debug;

/// Everything the engine needs for one simulation.
#[derive(Debug, Clone)]
pub struct SimulationRequest<'a> {
    pub workspace: &'a Path,
    pub package_path: &'a Path,
    pub model_name: &'a str,
    pub assignment: &'a Assignment,
    pub variable_filter: &'a str,
    pub stop_time: f64,
    pub step_size: f64,
    /// File stem for request and result files inside the workspace.
    pub label: &'a str,
}

/// Black-box physics solver. Implementations return the raw table; callers go
/// through [`run_simulation`] which cleans and checks it.
pub trait SimulationEngine: Send + Sync {
    fn run(&self, request: &SimulationRequest<'_>) -> JobResult<ResultTable>;
}

pub fn run_simulation(engine: &dyn SimulationEngine, request: &SimulationRequest<'_>) -> JobResult<ResultTable> {
    let mut table = engine.run(request)?;
    table.clean();
    if table.is_empty() {
        return Err(JobError::SimulationEngine(format!(
            "engine returned an empty result table for {}",
            request.label
        )));
    }
    Ok(table)
}

/// `name=value` in the engine's parameter-override syntax.
pub fn format_parameter_value(name: &str, value: &ParamValue) -> String {
    format!("{}={}", name, format_value(value))
}

fn format_value(value: &ParamValue) -> String {
    match value {
        ParamValue::Bool(b) => b.to_string(),
        ParamValue::Number(v) => format!("{}", v),
        ParamValue::Text(s) => format!("\"{}\"", s),
        ParamValue::List(items) => {
            let parts: Vec<String> = items.iter().map(format_value).collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}

/// Runs an external engine command per simulation.
///
/// The command is started in the workspace with `TRICYS_SIM_REQUEST` (JSON
/// request), `TRICYS_SIM_PARAMS` (one `name=value` per line) and
/// `TRICYS_SIM_RESULT` (CSV to write, `time` column first) in its environment.
pub struct CommandEngine {
    command: Vec<String>,
    env: BTreeMap<String, String>,
    timeout: Option<Duration>,
}

impl CommandEngine {
    pub fn new(config: &EngineConfig, base_dir: &Path, timeout: Option<Duration>) -> Self {
        Self {
            command: resolve_command_local(&config.command, base_dir),
            env: config.env.clone(),
            timeout,
        }
    }

    fn write_request(&self, request: &SimulationRequest<'_>, result_path: &Path) -> JobResult<(PathBuf, PathBuf)> {
        let parameters: Vec<String> = request
            .assignment
            .iter()
            .map(|(k, v)| format_parameter_value(k, v))
            .collect();
        let payload = json!({
            "schema_version": "sim_request_v1",
            "package_path": request.package_path.to_string_lossy(),
            "model_name": request.model_name,
            "parameters": parameters,
            "assignment": request.assignment,
            "variable_filter": request.variable_filter,
            "stop_time": request.stop_time,
            "step_size": request.step_size,
            "result_path": result_path.to_string_lossy(),
        });
        let request_path = request.workspace.join(format!("{}.request.json", request.label));
        let params_path = request.workspace.join(format!("{}.params", request.label));
        let bytes = serde_json::to_vec_pretty(&payload)
            .map_err(|e| JobError::SimulationEngine(format!("cannot encode request: {}", e)))?;
        fs::write(&request_path, bytes)?;
        let mut lines = parameters.join("\n");
        lines.push('\n');
        fs::write(&params_path, lines)?;
        Ok((request_path, params_path))
    }
}

impl SimulationEngine for CommandEngine {
    fn run(&self, request: &SimulationRequest<'_>) -> JobResult<ResultTable> {
        let result_path = request.workspace.join(format!("{}_results.csv", request.label));
        if result_path.exists() {
            fs::remove_file(&result_path)?;
        }
        let (request_path, params_path) = self.write_request(request, &result_path)?;

        let program = self
            .command
            .first()
            .ok_or_else(|| JobError::SimulationEngine("engine command is empty".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(&self.command[1..]);
        cmd.current_dir(request.workspace);
        cmd.envs(&self.env);
        cmd.env("TRICYS_SIM_REQUEST", &request_path);
        cmd.env("TRICYS_SIM_PARAMS", &params_path);
        cmd.env("TRICYS_SIM_RESULT", &result_path);
        cmd.env("TRICYS_MODEL_NAME", request.model_name);
        cmd.env("TRICYS_PACKAGE_PATH", request.package_path);
        cmd.env("TRICYS_VARIABLE_FILTER", request.variable_filter);
        cmd.env("TRICYS_STOP_TIME", request.stop_time.to_string());
        cmd.env("TRICYS_STEP_SIZE", request.step_size.to_string());

        debug!(label = request.label, model = request.model_name, "starting engine");
        let outcome = run_supervised(cmd, &request.workspace.join(request.label), self.timeout, None)
            .map_err(|e| JobError::SimulationEngine(format!("failed to start engine '{}': {}", program, e)))?;
        if outcome.timed_out {
            return Err(JobError::SimulationTimeout {
                seconds: self.timeout.map(|t| t.as_secs()).unwrap_or(0),
            });
        }
        if !outcome.success() {
            return Err(JobError::SimulationEngine(format!(
                "engine exited with {}: {}",
                outcome.exit_label(),
                outcome.stderr_tail()
            )));
        }
        if !result_path.is_file() {
            return Err(JobError::SimulationEngine(format!(
                "engine did not write {}",
                result_path.display()
            )));
        }
        ResultTable::read_csv(&result_path)
    }
}
