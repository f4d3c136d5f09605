use crate::engine::{run_simulation, SimulationEngine, SimulationRequest};
use crate::error::{ErrorKind, JobError, JobResult};
use crate::fsutil::ensure_dir;
use crate::goal_seek::{GoalOutcome, GoalSpec};
use crate::jobs::{Assignment, Job};
use crate::process::run_supervised;
use crate::table::ResultTable;
use crate::workspace::{IsolationPolicy, WorkspaceManager};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

pub const WORKER_REQUEST_SCHEMA: &str = "tricys_worker_request_v1";

/// Shared stop flag. Jobs that have not started when it fires are recorded
/// as cancelled; running external processes are killed.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Tables produced by one job. Plain jobs produce one run; goal-seek jobs
/// add one run per bisection iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    pub runs: Vec<(Job, ResultTable)>,
    pub goals: Vec<GoalOutcome>,
}

impl JobOutput {
    pub fn single(job: Job, table: ResultTable) -> Self {
        Self {
            runs: vec![(job, table)],
            goals: Vec::new(),
        }
    }

    /// The table of the job's own run, before any goal-seek iterations.
    pub fn primary(&self) -> Option<&ResultTable> {
        self.runs.first().map(|(_, t)| t)
    }
}

/// Executes one job to completion.
pub trait JobRunner: Send + Sync {
    fn run(&self, job: &Job, cancel: &CancelToken) -> JobResult<JobOutput>;
}

impl<R: JobRunner + ?Sized> JobRunner for Box<R> {
    fn run(&self, job: &Job, cancel: &CancelToken) -> JobResult<JobOutput> {
        (**self).run(job, cancel)
    }
}

impl<R: JobRunner + ?Sized> JobRunner for Arc<R> {
    fn run(&self, job: &Job, cancel: &CancelToken) -> JobResult<JobOutput> {
        (**self).run(job, cancel)
    }
}

/// Settings shared by every simulation a runner starts.
#[derive(Debug, Clone)]
pub struct SimulationSettings {
    pub model_name: String,
    pub variable_filter: String,
    pub stop_time: f64,
    pub step_size: f64,
    pub keep_temp_files: bool,
}

/// One simulation per job in a workspace from `workspaces`.
pub struct StandardRunner {
    engine: Arc<dyn SimulationEngine>,
    workspaces: WorkspaceManager,
    settings: SimulationSettings,
}

impl StandardRunner {
    pub fn new(engine: Arc<dyn SimulationEngine>, workspaces: WorkspaceManager, settings: SimulationSettings) -> Self {
        Self {
            engine,
            workspaces,
            settings,
        }
    }
}

impl JobRunner for StandardRunner {
    fn run(&self, job: &Job, cancel: &CancelToken) -> JobResult<JobOutput> {
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        let workspace = self.workspaces.acquire(job)?;
        let label = job.id();
        let request = SimulationRequest {
            workspace: &workspace.root,
            package_path: &workspace.package_path,
            model_name: &self.settings.model_name,
            assignment: &job.assignment,
            variable_filter: &self.settings.variable_filter,
            stop_time: self.settings.stop_time,
            step_size: self.settings.step_size,
            label: &label,
        };
        let result = run_simulation(self.engine.as_ref(), &request);
        self.workspaces.release(workspace, self.settings.keep_temp_files);
        Ok(JobOutput::single(job.clone(), result?))
    }
}

/// How the dispatcher runs jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Sequential,
    /// A fixed pool of in-process threads.
    Threads(usize),
    /// One worker subprocess per job, at most `n` at a time.
    Processes(usize),
}

impl Strategy {
    /// Co-simulation jobs rewrite files and call user code, so they get
    /// process isolation when running concurrently.
    pub fn select(concurrent: bool, co_simulation: bool, max_workers: Option<usize>) -> Self {
        if !concurrent {
            return Strategy::Sequential;
        }
        let workers = max_workers.unwrap_or_else(default_workers).max(1);
        if co_simulation {
            Strategy::Processes(workers)
        } else {
            Strategy::Threads(workers)
        }
    }

    pub fn workers(&self) -> usize {
        match self {
            Strategy::Sequential => 1,
            Strategy::Threads(n) | Strategy::Processes(n) => *n,
        }
    }

    /// Sequential plain sweeps reuse one directory; everything else gets a
    /// private copy of the package per job.
    pub fn isolation(&self, co_simulation: bool) -> IsolationPolicy {
        match self {
            Strategy::Sequential if !co_simulation => IsolationPolicy::Shared,
            _ => IsolationPolicy::PerJob,
        }
    }
}

/// Half the available cores, at least one.
pub fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(1)
        .max(1)
}

/// A job that did not produce results, as written to `failed_jobs.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJob {
    pub job_index: usize,
    pub assignment: Assignment,
    pub error_kind: ErrorKind,
    pub message: String,
}

impl FailedJob {
    pub fn job(&self) -> Job {
        Job {
            index: self.job_index,
            assignment: self.assignment.clone(),
        }
    }
}

/// Per-job outcomes of a dispatch, ordered by job index.
#[derive(Debug, Default)]
pub struct Ledger {
    pub succeeded: Vec<(Job, JobOutput)>,
    pub failed: Vec<FailedJob>,
}

impl Ledger {
    fn record(&mut self, job: Job, result: JobResult<JobOutput>, total: usize) {
        match result {
            Ok(output) => {
                self.succeeded.push((job, output));
            }
            Err(err) => {
                warn!(
                    job_index = job.index,
                    error_kind = err.kind().as_str(),
                    error = %err,
                    "job failed"
                );
                self.failed.push(FailedJob {
                    job_index: job.index,
                    assignment: job.assignment,
                    error_kind: err.kind(),
                    message: err.to_string(),
                });
            }
        }
        let done = self.succeeded.len() + self.failed.len();
        info!(done, total, failed = self.failed.len(), "sweep progress");
    }

    fn finish(mut self) -> Self {
        self.succeeded.sort_by_key(|(job, _)| job.index);
        self.failed.sort_by_key(|f| f.job_index);
        self
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn cancelled(&self) -> usize {
        self.failed
            .iter()
            .filter(|f| f.error_kind == ErrorKind::Cancelled)
            .count()
    }
}

fn run_one(runner: &dyn JobRunner, job: &Job, cancel: &CancelToken) -> JobResult<JobOutput> {
    if cancel.is_cancelled() {
        return Err(JobError::Cancelled);
    }
    debug!(job_index = job.index, "job started");
    runner.run(job, cancel)
}

/// Runs every job exactly once and collects the outcomes. One failing job
/// never stops the others.
#[derive(Debug, Clone, Copy)]
pub struct Dispatcher {
    strategy: Strategy,
}

impl Dispatcher {
    pub fn new(strategy: Strategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn run(&self, jobs: Vec<Job>, runner: &dyn JobRunner, cancel: &CancelToken) -> Ledger {
        info!(jobs = jobs.len(), strategy = ?self.strategy, "dispatching jobs");
        let ledger = match self.strategy {
            Strategy::Sequential => run_sequential(jobs, runner, cancel),
            Strategy::Threads(n) | Strategy::Processes(n) => run_pooled(jobs, n, runner, cancel),
        };
        ledger.finish()
    }
}

fn run_sequential(jobs: Vec<Job>, runner: &dyn JobRunner, cancel: &CancelToken) -> Ledger {
    let total = jobs.len();
    let mut ledger = Ledger::default();
    for job in jobs {
        let result = run_one(runner, &job, cancel);
        ledger.record(job, result, total);
    }
    ledger
}

/// Jobs run on a rayon pool; results flow back over a channel to this
/// thread, which is the only writer of the ledger. Jobs are queued FIFO so
/// they start in generation order.
fn run_pooled(jobs: Vec<Job>, workers: usize, runner: &dyn JobRunner, cancel: &CancelToken) -> Ledger {
    let pool = match rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("tricys-job-{}", i))
        .build()
    {
        Ok(pool) => pool,
        Err(e) => {
            warn!(error = %e, "failed to build worker pool, running sequentially");
            return run_sequential(jobs, runner, cancel);
        }
    };

    let total = jobs.len();
    let mut ledger = Ledger::default();
    let (tx, rx) = mpsc::channel::<(Job, JobResult<JobOutput>)>();
    thread::scope(|scope| {
        scope.spawn(move || {
            pool.scope_fifo(|s| {
                for job in jobs {
                    let tx = tx.clone();
                    s.spawn_fifo(move |_| {
                        let result = run_one(runner, &job, cancel);
                        let _ = tx.send((job, result));
                    });
                }
            });
        });
        for (job, result) in rx {
            ledger.record(job, result, total);
        }
    });
    ledger
}

/// What a worker subprocess needs to rebuild the pipeline and run one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub schema_version: String,
    /// The run's `resolved_config.json`.
    pub config_path: PathBuf,
    pub base_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub job: Job,
    #[serde(default)]
    pub goals: Vec<GoalSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerOutcome {
    Succeeded { output: JobOutput },
    Failed { error_kind: ErrorKind, message: String },
}

impl WorkerOutcome {
    pub fn from_result(result: JobResult<JobOutput>) -> Self {
        match result {
            Ok(output) => WorkerOutcome::Succeeded { output },
            Err(err) => WorkerOutcome::Failed {
                error_kind: err.kind(),
                message: err.detail(),
            },
        }
    }

    pub fn into_result(self) -> JobResult<JobOutput> {
        match self {
            WorkerOutcome::Succeeded { output } => Ok(output),
            WorkerOutcome::Failed { error_kind, message } => Err(JobError::from_kind(error_kind, message)),
        }
    }
}

/// Runs each job in a fresh `<program> worker` subprocess. The request and
/// the outcome travel through JSON files under `<temp_dir>/workers`.
pub struct ProcessRunner {
    program: PathBuf,
    config_path: PathBuf,
    base_dir: PathBuf,
    temp_dir: PathBuf,
    goals: Vec<GoalSpec>,
}

impl ProcessRunner {
    pub fn new(program: &Path, config_path: &Path, base_dir: &Path, temp_dir: &Path) -> Self {
        Self {
            program: program.to_path_buf(),
            config_path: config_path.to_path_buf(),
            base_dir: base_dir.to_path_buf(),
            temp_dir: temp_dir.to_path_buf(),
            goals: Vec::new(),
        }
    }

    /// Goal searches the worker runs after each job's own simulation.
    pub fn with_goals(mut self, goals: Vec<GoalSpec>) -> Self {
        self.goals = goals;
        self
    }

    fn exchange_dir(&self) -> PathBuf {
        self.temp_dir.join("workers")
    }
}

impl JobRunner for ProcessRunner {
    fn run(&self, job: &Job, cancel: &CancelToken) -> JobResult<JobOutput> {
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        let dir = self.exchange_dir();
        ensure_dir(&dir)?;
        let request_path = dir.join(format!("{}.request.json", job.id()));
        let outcome_path = dir.join(format!("{}.outcome.json", job.id()));
        if outcome_path.exists() {
            fs::remove_file(&outcome_path)?;
        }
        let request = WorkerRequest {
            schema_version: WORKER_REQUEST_SCHEMA.to_string(),
            config_path: self.config_path.clone(),
            base_dir: self.base_dir.clone(),
            temp_dir: self.temp_dir.clone(),
            job: job.clone(),
            goals: self.goals.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&request)
            .map_err(|e| JobError::WorkspaceSetup(format!("cannot encode worker request: {}", e)))?;
        fs::write(&request_path, bytes)?;

        let mut cmd = Command::new(&self.program);
        cmd.arg("worker")
            .arg("--request")
            .arg(&request_path)
            .arg("--outcome")
            .arg(&outcome_path);
        let outcome = run_supervised(cmd, &dir.join(job.id()), None, Some(cancel)).map_err(|e| {
            JobError::WorkspaceSetup(format!(
                "failed to start worker '{}': {}",
                self.program.display(),
                e
            ))
        })?;
        if outcome.cancelled {
            return Err(JobError::Cancelled);
        }
        let text = match fs::read_to_string(&outcome_path) {
            Ok(text) => text,
            Err(_) => {
                return Err(JobError::SimulationEngine(format!(
                    "worker for {} exited with {} without reporting an outcome: {}",
                    job.id(),
                    outcome.exit_label(),
                    outcome.stderr_tail()
                )))
            }
        };
        let decoded: WorkerOutcome = serde_json::from_str(&text).map_err(|e| {
            JobError::SimulationEngine(format!("unreadable worker outcome {}: {}", outcome_path.display(), e))
        })?;
        decoded.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::ParamValue;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    fn jobs(n: usize) -> Vec<Job> {
        (0..n)
            .map(|i| Job {
                index: i,
                assignment: vec![("a.x".to_string(), ParamValue::Number(i as f64))]
                    .into_iter()
                    .collect(),
            })
            .collect()
    }

    fn table_for(job: &Job) -> ResultTable {
        let x = job.assignment.get("a.x").and_then(ParamValue::as_f64).unwrap_or(0.0);
        let mut t = ResultTable::new(vec!["a.y".to_string()]);
        t.push_row(0.0, vec![Some(x)]);
        t
    }

    /// Fails odd jobs and sleeps a little so completions interleave.
    struct OddFails;

    impl JobRunner for OddFails {
        fn run(&self, job: &Job, _cancel: &CancelToken) -> JobResult<JobOutput> {
            thread::sleep(Duration::from_millis(((7 - job.index % 7) * 3) as u64));
            if job.index % 2 == 1 {
                Err(JobError::SimulationEngine(format!("job {} diverged", job.index)))
            } else {
                Ok(JobOutput::single(job.clone(), table_for(job)))
            }
        }
    }

    #[test]
    fn failures_are_isolated_and_ledger_is_ordered() {
        for strategy in [Strategy::Sequential, Strategy::Threads(4)] {
            let ledger = Dispatcher::new(strategy).run(jobs(9), &OddFails, &CancelToken::new());
            assert_eq!(ledger.total(), 9);
            let ok: Vec<usize> = ledger.succeeded.iter().map(|(j, _)| j.index).collect();
            assert_eq!(ok, vec![0, 2, 4, 6, 8]);
            let failed: Vec<usize> = ledger.failed.iter().map(|f| f.job_index).collect();
            assert_eq!(failed, vec![1, 3, 5, 7]);
            assert!(ledger
                .failed
                .iter()
                .all(|f| f.error_kind == ErrorKind::SimulationEngineError));
            assert_eq!(ledger.failed[0].assignment.get("a.x"), Some(&ParamValue::Number(1.0)));
        }
    }

    struct Counting {
        active: AtomicUsize,
        peak: Mutex<usize>,
    }

    impl JobRunner for Counting {
        fn run(&self, job: &Job, _cancel: &CancelToken) -> JobResult<JobOutput> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            {
                let mut peak = self.peak.lock().expect("lock");
                *peak = (*peak).max(now);
            }
            thread::sleep(Duration::from_millis(20));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(JobOutput::single(job.clone(), table_for(job)))
        }
    }

    #[test]
    fn thread_pool_respects_worker_limit() {
        let runner = Counting {
            active: AtomicUsize::new(0),
            peak: Mutex::new(0),
        };
        let ledger = Dispatcher::new(Strategy::Threads(2)).run(jobs(8), &runner, &CancelToken::new());
        assert_eq!(ledger.succeeded.len(), 8);
        let peak = *runner.peak.lock().expect("lock");
        assert!(peak <= 2, "peak {}", peak);
    }

    struct CancelAfterFirst;

    impl JobRunner for CancelAfterFirst {
        fn run(&self, job: &Job, cancel: &CancelToken) -> JobResult<JobOutput> {
            cancel.cancel();
            Ok(JobOutput::single(job.clone(), table_for(job)))
        }
    }

    #[test]
    fn jobs_not_started_before_cancel_are_recorded_as_cancelled() {
        let ledger = Dispatcher::new(Strategy::Sequential).run(jobs(4), &CancelAfterFirst, &CancelToken::new());
        assert_eq!(ledger.succeeded.len(), 1);
        assert_eq!(ledger.cancelled(), 3);
        assert_eq!(ledger.total(), 4);
    }

    /// Records the order jobs start in and cancels the sweep once job
    /// `cancel_at` has run.
    struct StartOrder {
        started: Mutex<Vec<usize>>,
        cancel_at: Option<usize>,
    }

    impl StartOrder {
        fn new(cancel_at: Option<usize>) -> Self {
            Self {
                started: Mutex::new(Vec::new()),
                cancel_at,
            }
        }
    }

    impl JobRunner for StartOrder {
        fn run(&self, job: &Job, cancel: &CancelToken) -> JobResult<JobOutput> {
            self.started.lock().expect("lock").push(job.index);
            if self.cancel_at == Some(job.index) {
                cancel.cancel();
            }
            Ok(JobOutput::single(job.clone(), table_for(job)))
        }
    }

    #[test]
    fn pooled_jobs_start_in_generation_order() {
        let runner = StartOrder::new(None);
        let ledger = Dispatcher::new(Strategy::Threads(1)).run(jobs(6), &runner, &CancelToken::new());
        assert_eq!(ledger.succeeded.len(), 6);
        assert_eq!(*runner.started.lock().expect("lock"), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn pooled_cancel_skips_only_later_jobs() {
        let runner = StartOrder::new(Some(2));
        let ledger = Dispatcher::new(Strategy::Threads(1)).run(jobs(6), &runner, &CancelToken::new());
        assert_eq!(*runner.started.lock().expect("lock"), vec![0, 1, 2]);
        let ok: Vec<usize> = ledger.succeeded.iter().map(|(j, _)| j.index).collect();
        assert_eq!(ok, vec![0, 1, 2]);
        let cancelled: Vec<usize> = ledger
            .failed
            .iter()
            .filter(|f| f.error_kind == ErrorKind::Cancelled)
            .map(|f| f.job_index)
            .collect();
        assert_eq!(cancelled, vec![3, 4, 5]);
        assert_eq!(ledger.cancelled(), 3);
    }

    #[test]
    fn strategy_selection() {
        assert_eq!(Strategy::select(false, true, Some(8)), Strategy::Sequential);
        assert_eq!(Strategy::select(true, false, Some(3)), Strategy::Threads(3));
        assert_eq!(Strategy::select(true, true, Some(0)), Strategy::Processes(1));
        assert!(Strategy::select(true, false, None).workers() >= 1);
        assert_eq!(Strategy::Sequential.isolation(false), IsolationPolicy::Shared);
        assert_eq!(Strategy::Sequential.isolation(true), IsolationPolicy::PerJob);
        assert_eq!(Strategy::Threads(2).isolation(false), IsolationPolicy::PerJob);
    }

    #[test]
    fn worker_outcome_carries_error_kind() {
        let outcome = WorkerOutcome::from_result(Err(JobError::HandlerExecution("boom".to_string())));
        let text = serde_json::to_string(&outcome).expect("encode");
        assert!(text.contains("\"status\":\"failed\""));
        let back: WorkerOutcome = serde_json::from_str(&text).expect("decode");
        let err = back.into_result().expect_err("failed");
        assert_eq!(err.kind(), ErrorKind::HandlerExecutionError);
        assert_eq!(err.detail(), "boom");
    }

    #[cfg(unix)]
    #[test]
    fn process_runner_reports_missing_outcome() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = ProcessRunner::new(Path::new("/bin/true"), &dir.path().join("c.json"), dir.path(), dir.path());
        let err = runner.run(&jobs(1)[0], &CancelToken::new()).expect_err("no outcome");
        assert_eq!(err.kind(), ErrorKind::SimulationEngineError);
        assert!(err.to_string().contains("without reporting an outcome"));
    }
}
