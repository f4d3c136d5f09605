pub mod aggregate;
pub mod config;
pub mod cosim;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod fsutil;
pub mod goal_seek;
pub mod handler;
pub mod jobs;
pub mod metrics;
pub mod model;
pub mod process;
pub mod rewrite;
pub mod sweep;
pub mod table;
pub mod workspace;

use crate::aggregate::{aggregate, write_goal_summary};
use crate::config::{config_from_value, RunLayout, SweepConfig};
use crate::cosim::CosimRunner;
use crate::dispatch::{
    CancelToken, Dispatcher, FailedJob, JobRunner, ProcessRunner, SimulationSettings, StandardRunner, Strategy,
    WorkerOutcome, WorkerRequest, WORKER_REQUEST_SCHEMA,
};
use crate::engine::{CommandEngine, SimulationEngine};
use crate::fsutil::{atomic_write_json_pretty, load_json_file, unique_path};
use crate::goal_seek::{GoalSeekRunner, GoalSpec};
use crate::handler::HandlerInvoker;
use crate::jobs::{GenerateOptions, Job, JobPlan};
use crate::rewrite::RewriteMode;
use crate::workspace::{IsolationPolicy, WorkspaceManager};
use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub use crate::config::{load_config, prepare_run_dir};
pub use crate::error::{ErrorKind, JobError, JobResult};

pub const SINGLE_RESULT_FILE: &str = "simulation_result.csv";
pub const SWEEP_RESULT_FILE: &str = "sweep_results.csv";
pub const GOAL_SUMMARY_FILE: &str = "goal_seek_summary.csv";

/// Knobs of one sweep execution that do not come from the config file.
#[derive(Clone, Default)]
pub struct SweepOptions {
    pub cancel: CancelToken,
    /// Executable accepting the `worker` subcommand. Without it, sweeps that
    /// would use worker processes run on threads instead.
    pub worker_program: Option<PathBuf>,
    /// Replaces the configured engine command. In-process engines cannot
    /// reach worker processes, so this also forces threads.
    pub engine: Option<Arc<dyn SimulationEngine>>,
}

#[derive(Debug, Clone)]
pub struct SweepReport {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub strategy: Strategy,
    pub total_jobs: usize,
    pub succeeded: usize,
    pub cancelled: usize,
    pub failed: Vec<FailedJob>,
    pub result_path: Option<PathBuf>,
    pub failed_jobs_path: PathBuf,
    pub goal_summary_path: Option<PathBuf>,
    pub warning: Option<String>,
}

impl SweepReport {
    pub fn to_json(&self) -> Value {
        json!({
            "run_id": self.run_id,
            "run_dir": self.run_dir.to_string_lossy(),
            "strategy": format!("{:?}", self.strategy),
            "total_jobs": self.total_jobs,
            "succeeded": self.succeeded,
            "failed": self.failed.len(),
            "cancelled": self.cancelled,
            "result_path": self.result_path.as_ref().map(|p| p.to_string_lossy().to_string()),
            "failed_jobs_path": self.failed_jobs_path.to_string_lossy(),
            "goal_summary_path": self.goal_summary_path.as_ref().map(|p| p.to_string_lossy().to_string()),
            "warning": self.warning,
        })
    }
}

/// What `describe` prints about a config without running anything.
#[derive(Debug, Clone)]
pub struct SweepSummary {
    pub model_name: String,
    pub package_path: PathBuf,
    pub total_jobs: usize,
    pub swept_parameters: Vec<String>,
    pub goals: Vec<String>,
    pub co_simulation: bool,
    pub rewrite_mode: Option<RewriteMode>,
    pub handlers: Vec<String>,
    pub strategy: Strategy,
    pub warning: Option<String>,
}

fn generate_plan(cfg: &SweepConfig) -> Result<JobPlan> {
    let opts = GenerateOptions {
        base_dir: cfg.base_dir.clone(),
        seed: cfg.seed,
        warning_threshold: cfg.job_warning_threshold,
    };
    Ok(jobs::generate(&cfg.parameters(), &opts)?)
}

pub fn describe_sweep(cfg: &SweepConfig) -> Result<SweepSummary> {
    let plan = generate_plan(cfg)?;
    let swept_parameters = plan
        .jobs
        .first()
        .map(|j| j.assignment.iter().map(|(k, _)| k.to_string()).collect())
        .unwrap_or_default();
    Ok(SweepSummary {
        model_name: cfg.model_name.clone(),
        package_path: cfg.package_path.clone(),
        total_jobs: plan.jobs.len(),
        swept_parameters,
        goals: plan.goals.iter().map(|g| g.name.clone()).collect(),
        co_simulation: cfg.is_co_simulation(),
        rewrite_mode: cfg.co_simulation.as_ref().map(|c| c.mode),
        handlers: cfg
            .co_simulation
            .as_ref()
            .map(|c| c.handlers.iter().map(|h| format!("{} -> {}", h.instance_name, h.handler)).collect())
            .unwrap_or_default(),
        strategy: Strategy::select(cfg.concurrent, cfg.is_co_simulation(), cfg.max_workers),
        warning: plan.warning,
    })
}

fn timeout(cfg: &SweepConfig) -> Option<Duration> {
    cfg.timeout_seconds.map(Duration::from_secs)
}

fn configured_engine(cfg: &SweepConfig) -> Result<Arc<dyn SimulationEngine>> {
    let engine = cfg
        .engine
        .as_ref()
        .ok_or_else(|| anyhow!("no simulation engine configured (set engine.command)"))?;
    if engine.command.is_empty() {
        return Err(anyhow!("engine.command must not be empty"));
    }
    Ok(Arc::new(CommandEngine::new(engine, &cfg.base_dir, timeout(cfg))))
}

/// The in-process pipeline for one job: a plain or co-simulation runner,
/// wrapped in goal seeking when the sweep declares goals.
pub fn build_runner(
    cfg: &SweepConfig,
    temp_root: &Path,
    policy: IsolationPolicy,
    goals: Vec<GoalSpec>,
    engine: Arc<dyn SimulationEngine>,
) -> Box<dyn JobRunner> {
    let workspaces = WorkspaceManager::new(policy, temp_root, &cfg.package_path);
    let settings = SimulationSettings {
        model_name: cfg.model_name.clone(),
        variable_filter: cfg.variable_filter.clone(),
        stop_time: cfg.stop_time,
        step_size: cfg.step_size,
        keep_temp_files: cfg.keep_temp_files,
    };
    let base: Box<dyn JobRunner> = match &cfg.co_simulation {
        Some(cosim) if cfg.is_co_simulation() => Box::new(CosimRunner::new(
            engine,
            workspaces,
            settings,
            cosim.clone(),
            HandlerInvoker::new().with_timeout(timeout(cfg)),
        )),
        _ => Box::new(StandardRunner::new(engine, workspaces, settings)),
    };
    if goals.is_empty() {
        base
    } else {
        Box::new(GoalSeekRunner::new(base, goals, cfg.stop_time))
    }
}

/// Expands the config into jobs, runs them and writes the run's result files.
pub fn run_sweep(cfg: &SweepConfig, layout: &RunLayout, opts: &SweepOptions) -> Result<SweepReport> {
    let plan = generate_plan(cfg)?;
    if let Some(w) = &plan.warning {
        warn!("{}", w);
    }
    execute(cfg, layout, plan.jobs, plan.goals, plan.warning, opts)
}

/// Re-runs the jobs listed in a previous run's `failed_jobs.json` with that
/// run's resolved config.
pub fn retry_failed(run_dir: &Path, opts: &SweepOptions) -> Result<SweepReport> {
    let cfg = load_run_config(run_dir)?;
    let layout = RunLayout::open(run_dir, &cfg)?;
    let failed_path = layout.failed_jobs_path();
    let text = fs::read_to_string(&failed_path)
        .with_context(|| format!("failed to read {}", failed_path.display()))?;
    let failed: Vec<FailedJob> = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse {}", failed_path.display()))?;
    let jobs: Vec<Job> = failed.iter().map(FailedJob::job).collect();
    info!(run_id = %layout.run_id, jobs = jobs.len(), "retrying failed jobs");
    if jobs.is_empty() {
        return Ok(SweepReport {
            run_id: layout.run_id.clone(),
            run_dir: layout.run_dir.clone(),
            strategy: Strategy::Sequential,
            total_jobs: 0,
            succeeded: 0,
            cancelled: 0,
            failed: Vec::new(),
            result_path: None,
            failed_jobs_path: failed_path,
            goal_summary_path: None,
            warning: None,
        });
    }
    let goals = generate_plan(&cfg)?.goals;
    execute(&cfg, &layout, jobs, goals, None, opts)
}

/// Rebuilds the config a run was started with.
pub fn load_run_config(run_dir: &Path) -> Result<SweepConfig> {
    let raw = load_json_file(&run_dir.join("resolved_config.json"))?;
    let manifest = load_json_file(&run_dir.join("manifest.json")).unwrap_or(Value::Null);
    let base_dir = manifest
        .get("base_dir")
        .and_then(Value::as_str)
        .map(PathBuf::from)
        .unwrap_or_else(|| run_dir.to_path_buf());
    config_from_value(raw, &base_dir)
}

fn execute(
    cfg: &SweepConfig,
    layout: &RunLayout,
    jobs: Vec<Job>,
    goals: Vec<GoalSpec>,
    warning: Option<String>,
    opts: &SweepOptions,
) -> Result<SweepReport> {
    let co_simulation = cfg.is_co_simulation();
    let mut strategy = Strategy::select(cfg.concurrent, co_simulation, cfg.max_workers);
    if let Strategy::Processes(n) = strategy {
        if opts.worker_program.is_none() || opts.engine.is_some() {
            warn!(workers = n, "worker processes unavailable, running co-simulation jobs on threads");
            strategy = Strategy::Threads(n);
        }
    }

    let runner: Box<dyn JobRunner> = match (strategy, &opts.worker_program) {
        (Strategy::Processes(_), Some(program)) => Box::new(
            ProcessRunner::new(program, &layout.resolved_config_path(), &cfg.base_dir, &layout.temp_dir)
                .with_goals(goals),
        ),
        _ => {
            let engine = match &opts.engine {
                Some(engine) => engine.clone(),
                None => configured_engine(cfg)?,
            };
            build_runner(cfg, &layout.temp_dir, strategy.isolation(co_simulation), goals, engine)
        }
    };

    let total_jobs = jobs.len();
    info!(
        run_id = %layout.run_id,
        jobs = total_jobs,
        co_simulation,
        workers = strategy.workers(),
        "starting sweep"
    );
    let ledger = Dispatcher::new(strategy).run(jobs, runner.as_ref(), &opts.cancel);

    let mut runs = Vec::new();
    let mut outcomes = Vec::new();
    for (job, output) in &ledger.succeeded {
        runs.extend(output.runs.iter().cloned());
        outcomes.extend(output.goals.iter().map(|g| (job.clone(), g.clone())));
    }

    let result_path = if runs.is_empty() {
        warn!("no job produced results, skipping aggregation");
        None
    } else {
        let name = if total_jobs == 1 && outcomes.is_empty() {
            SINGLE_RESULT_FILE
        } else {
            SWEEP_RESULT_FILE
        };
        let path = unique_path(&layout.results_dir, name);
        aggregate(&runs).write_csv(&path)?;
        info!(path = %path.display(), columns = runs.len(), "wrote aggregated results");
        Some(path)
    };

    let failed_jobs_path = layout.failed_jobs_path();
    atomic_write_json_pretty(&failed_jobs_path, &serde_json::to_value(&ledger.failed)?)?;

    let goal_summary_path = if outcomes.is_empty() {
        None
    } else {
        let path = unique_path(&layout.results_dir, GOAL_SUMMARY_FILE);
        write_goal_summary(&path, &outcomes)?;
        Some(path)
    };

    let report = SweepReport {
        run_id: layout.run_id.clone(),
        run_dir: layout.run_dir.clone(),
        strategy,
        total_jobs,
        succeeded: ledger.succeeded.len(),
        cancelled: ledger.cancelled(),
        failed: ledger.failed,
        result_path,
        failed_jobs_path,
        goal_summary_path,
        warning,
    };
    info!(
        run_id = %report.run_id,
        succeeded = report.succeeded,
        failed = report.failed.len(),
        cancelled = report.cancelled,
        "sweep finished"
    );
    Ok(report)
}

/// Body of the `worker` subcommand: runs one job from a request file and
/// records the outcome. Job failures are part of the outcome, not errors.
pub fn run_worker(request_path: &Path, outcome_path: &Path) -> Result<()> {
    let text = fs::read_to_string(request_path)
        .with_context(|| format!("failed to read worker request {}", request_path.display()))?;
    let request: WorkerRequest = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse worker request {}", request_path.display()))?;
    if request.schema_version != WORKER_REQUEST_SCHEMA {
        return Err(anyhow!(
            "unsupported worker request schema '{}'",
            request.schema_version
        ));
    }
    let raw = load_json_file(&request.config_path)?;
    let cfg = config_from_value(raw, &request.base_dir)?;
    let engine = configured_engine(&cfg)?;
    let runner = build_runner(&cfg, &request.temp_dir, IsolationPolicy::PerJob, request.goals, engine);
    let result = runner.run(&request.job, &CancelToken::new());
    let outcome = WorkerOutcome::from_result(result);
    atomic_write_json_pretty(outcome_path, &serde_json::to_value(&outcome)?)?;
    Ok(())
}
