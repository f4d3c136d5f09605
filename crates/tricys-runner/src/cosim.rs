use crate::config::{CoSimConfig, HandlerConfig};
use crate::dispatch::{CancelToken, JobOutput, JobRunner, SimulationSettings};
use crate::engine::{run_simulation, SimulationEngine, SimulationRequest};
use crate::error::{JobError, JobResult};
use crate::handler::HandlerInvoker;
use crate::jobs::Job;
use crate::model::{Port, PortDirection};
use crate::rewrite::{apply_replacement, build_interceptor, submodel_ports, RewriteMode, RewriteTarget};
use crate::table::TIME_COLUMN;
use crate::workspace::{Workspace, WorkspaceManager};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Where a co-simulation job is in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CosimStage {
    Pending,
    Stage1Running,
    HandlerRunning,
    Rewriting,
    Stage2Running,
    Done,
    Failed,
}

impl CosimStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CosimStage::Pending => "PENDING",
            CosimStage::Stage1Running => "STAGE1_RUNNING",
            CosimStage::HandlerRunning => "HANDLER_RUNNING",
            CosimStage::Rewriting => "REWRITING",
            CosimStage::Stage2Running => "STAGE2_RUNNING",
            CosimStage::Done => "DONE",
            CosimStage::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CosimStage::Done | CosimStage::Failed)
    }
}

impl fmt::Display for CosimStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Progress {
    job_index: usize,
    stage: CosimStage,
}

impl Progress {
    fn new(job_index: usize) -> Self {
        Self {
            job_index,
            stage: CosimStage::Pending,
        }
    }

    fn enter(&mut self, stage: CosimStage) {
        self.stage = stage;
        info!(job_index = self.job_index, stage = %stage, "co-simulation stage");
    }

    fn fail(&mut self, err: &JobError) {
        warn!(
            job_index = self.job_index,
            stage = %self.stage,
            error_kind = err.kind().as_str(),
            error = %err,
            "co-simulation job failed"
        );
        self.stage = CosimStage::Failed;
    }

    /// Logs a failed job; a successful one must have reached `Done`.
    fn settle(&mut self, result: JobResult<JobOutput>) -> JobResult<JobOutput> {
        let result = match result {
            Ok(_) if self.stage != CosimStage::Done => Err(JobError::HandlerContractViolation(format!(
                "co-simulation of job {} returned while in stage {}",
                self.job_index, self.stage
            ))),
            other => other,
        };
        if let Err(err) = &result {
            self.fail(err);
        }
        result
    }
}

/// Two-stage co-simulation: simulate the untouched model for the handlers'
/// inputs, run the handlers, bake their outputs into the model and simulate
/// again.
pub struct CosimRunner {
    engine: Arc<dyn SimulationEngine>,
    workspaces: WorkspaceManager,
    settings: SimulationSettings,
    cosim: CoSimConfig,
    invoker: HandlerInvoker,
}

impl CosimRunner {
    pub fn new(
        engine: Arc<dyn SimulationEngine>,
        workspaces: WorkspaceManager,
        settings: SimulationSettings,
        cosim: CoSimConfig,
        invoker: HandlerInvoker,
    ) -> Self {
        Self {
            engine,
            workspaces,
            settings,
            cosim,
            invoker,
        }
    }

    fn run_stages(
        &self,
        ws: &Workspace,
        job: &Job,
        cancel: &CancelToken,
        progress: &mut Progress,
    ) -> JobResult<JobOutput> {
        if self.cosim.mode == RewriteMode::Replacement && !ws.is_isolated() {
            return Err(JobError::WorkspaceSetup(
                "replacement mode rewrites model files and needs a per-job workspace".to_string(),
            ));
        }
        let label = job.id();

        progress.enter(CosimStage::Stage1Running);
        let mut inputs = Vec::with_capacity(self.cosim.handlers.len());
        for h in &self.cosim.handlers {
            let ports = submodel_ports(&ws.package_path, &h.submodel_name)?;
            inputs.push(ports);
        }
        let filter = stage1_filter(self.cosim.handlers.iter().zip(&inputs));
        let stage1_label = format!("{}_stage1", label);
        let stage1 = run_simulation(
            self.engine.as_ref(),
            &SimulationRequest {
                workspace: &ws.root,
                package_path: &ws.package_path,
                model_name: &self.settings.model_name,
                assignment: &job.assignment,
                variable_filter: &filter,
                stop_time: self.settings.stop_time,
                step_size: self.settings.step_size,
                label: &stage1_label,
            },
        )?;

        let mut targets = Vec::with_capacity(self.cosim.handlers.len());
        for (h, ports) in self.cosim.handlers.iter().zip(&inputs) {
            if cancel.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            progress.enter(CosimStage::HandlerRunning);
            let prefix = format!("{}.", h.instance_name);
            let input_path = ws.root.join(format!("{}_inputs.csv", h.instance_name));
            stage1
                .select(|c| c.starts_with(&prefix))
                .write_csv(&input_path)?;
            let output_path = ws.root.join(format!("{}_outputs.csv", h.instance_name));
            let params = import_path_params(ws, &h.params)?;
            let required = required_ports(h, ports);
            let overrides = self
                .invoker
                .invoke(&h.handler, &input_path, &output_path, &params, &required, cancel)?;

            progress.enter(CosimStage::Rewriting);
            let target = RewriteTarget {
                submodel: h.submodel_name.clone(),
                instance: h.instance_name.clone(),
                csv_path: output_path,
                overrides,
            };
            if self.cosim.mode == RewriteMode::Replacement {
                apply_replacement(&ws.package_path, &target)?;
            }
            targets.push(target);
        }

        let (package_path, model_name) = match self.cosim.mode {
            RewriteMode::Interceptor => {
                let out = build_interceptor(&ws.package_path, &self.settings.model_name, &targets)?;
                (out.package_path, out.model_name)
            }
            RewriteMode::Replacement => (ws.package_path.clone(), self.settings.model_name.clone()),
        };

        progress.enter(CosimStage::Stage2Running);
        let table = run_simulation(
            self.engine.as_ref(),
            &SimulationRequest {
                workspace: &ws.root,
                package_path: &package_path,
                model_name: &model_name,
                assignment: &job.assignment,
                variable_filter: &self.settings.variable_filter,
                stop_time: self.settings.stop_time,
                step_size: self.settings.step_size,
                label: &label,
            },
        )?;
        progress.enter(CosimStage::Done);
        Ok(JobOutput::single(job.clone(), table))
    }
}

impl JobRunner for CosimRunner {
    fn run(&self, job: &Job, cancel: &CancelToken) -> JobResult<JobOutput> {
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        let mut progress = Progress::new(job.index);
        let ws = match self.workspaces.acquire(job) {
            Ok(ws) => ws,
            Err(err) => {
                progress.fail(&err);
                return Err(err);
            }
        };
        let result = self.run_stages(&ws, job, cancel, &mut progress);
        let result = progress.settle(result);
        self.workspaces.release(ws, self.settings.keep_temp_files);
        result
    }
}

/// `time` plus every input port of each handler's instance, as engine
/// filter patterns.
fn stage1_filter<'a>(handlers: impl Iterator<Item = (&'a HandlerConfig, &'a Vec<Port>)>) -> String {
    let mut parts = vec![TIME_COLUMN.to_string()];
    for (h, ports) in handlers {
        let instance = regex::escape(&h.instance_name);
        for port in ports.iter().filter(|p| p.direction == PortDirection::Input) {
            let name = regex::escape(&port.name);
            if !port.array {
                parts.push(format!("{}\\.{}", instance, name));
            } else if port.dim <= 9 {
                parts.push(format!("{}\\.{}\\[[1-{}]\\]", instance, name, port.dim));
            } else {
                parts.push(format!("{}\\.{}\\[\\d+\\]", instance, name));
            }
        }
    }
    parts.join("|")
}

fn required_ports(h: &HandlerConfig, ports: &[Port]) -> Vec<String> {
    match &h.output_ports {
        Some(names) => names.clone(),
        None => ports
            .iter()
            .filter(|p| p.direction == PortDirection::Output)
            .map(|p| p.name.clone())
            .collect(),
    }
}

/// Copies files named by `*_path` params into the workspace and points the
/// params at the copies.
fn import_path_params(ws: &Workspace, params: &Map<String, Value>) -> JobResult<Map<String, Value>> {
    let mut out = params.clone();
    for (key, value) in out.iter_mut() {
        if !key.ends_with("_path") {
            continue;
        }
        let Some(s) = value.as_str() else { continue };
        let file = PathBuf::from(s);
        if !file.is_file() || !ws.is_isolated() {
            continue;
        }
        let copied = ws.import_asset(&file)?;
        *value = Value::String(copied.to_string_lossy().to_string());
    }
    Ok(out)
}
