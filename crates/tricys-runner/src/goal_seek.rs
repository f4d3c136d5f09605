use crate::dispatch::{CancelToken, JobOutput, JobRunner};
use crate::error::{JobError, JobResult};
use crate::jobs::Job;
use crate::metrics::{self, MetricKind};
use crate::sweep::ParamValue;
use crate::table::ResultTable;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_TOLERANCE: f64 = 0.001;
pub const DEFAULT_MAX_ITERATIONS: usize = 10;
pub const DEFAULT_SOURCE_COLUMN: &str = "sds.inventory";

#[derive(Error, Debug)]
pub enum GoalSeekError {
    #[error("optimization failed due to simulation failure at {parameter}={value}: {source}")]
    SimulationFailed {
        parameter: String,
        value: f64,
        #[source]
        source: JobError,
    },
    #[error("source column '{0}' not found in results")]
    MissingColumn(String),
}

impl From<GoalSeekError> for JobError {
    fn from(err: GoalSeekError) -> Self {
        match &err {
            GoalSeekError::SimulationFailed { source, .. } => {
                JobError::from_kind(source.kind(), err.to_string())
            }
            GoalSeekError::MissingColumn(_) => JobError::SimulationEngine(err.to_string()),
        }
    }
}

/// A structured `simulation_parameters` entry asking for the smallest value of
/// `parameter` whose metric stays under each target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalSpec {
    pub name: String,
    pub parameter: String,
    pub lower: f64,
    pub upper: f64,
    pub tolerance: f64,
    pub max_iterations: usize,
    pub metric: MetricKind,
    pub source_column: String,
    /// Empty means "bounded by the stop time only".
    pub targets: Vec<f64>,
}

impl GoalSpec {
    pub fn from_json(name: &str, value: &Value) -> JobResult<Self> {
        let raw = value.to_string();
        let invalid = |reason: String| JobError::invalid_spec(name, &raw, reason);

        if let Some(method) = value.get("method").and_then(Value::as_str) {
            if method != "bisection_search" && method != "bisection" {
                return Err(invalid(format!("unsupported goal-seek method '{}'", method)));
            }
        }
        let parameter = value
            .get("parameter_to_optimize")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing 'parameter_to_optimize'".to_string()))?
            .to_string();
        let range: Vec<f64> = value
            .get("search_range")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_f64).collect())
            .unwrap_or_default();
        let [lower, upper] = range[..] else {
            return Err(invalid("'search_range' must be [lower, upper]".to_string()));
        };
        if !(lower < upper) {
            return Err(invalid(format!(
                "search_range lower {} must be below upper {}",
                lower, upper
            )));
        }
        let tolerance = value
            .get("tolerance")
            .and_then(Value::as_f64)
            .unwrap_or(DEFAULT_TOLERANCE);
        if tolerance <= 0.0 {
            return Err(invalid("tolerance must be positive".to_string()));
        }
        let max_iterations = value
            .get("max_iterations")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_ITERATIONS);
        let metric = match value.get("metric_name").and_then(Value::as_str) {
            Some(m) => m.parse::<MetricKind>().map_err(invalid)?,
            None => MetricKind::TurningPointTime,
        };
        let source_column = value
            .get("source_column")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_SOURCE_COLUMN)
            .to_string();
        let targets = match value.get("metric_max_value") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_f64()
                        .ok_or_else(|| invalid("metric_max_value entries must be numbers".to_string()))
                })
                .collect::<JobResult<Vec<_>>>()?,
            Some(v) => vec![v
                .as_f64()
                .ok_or_else(|| invalid("metric_max_value must be a number".to_string()))?],
        };

        Ok(Self {
            name: name.to_string(),
            parameter,
            lower,
            upper,
            tolerance,
            max_iterations,
            metric,
            source_column,
            targets,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalOutcome {
    pub goal: String,
    pub parameter: String,
    pub metric: MetricKind,
    pub target: f64,
    pub best_value: Option<f64>,
    pub achieved_metric: Option<f64>,
    pub converged: bool,
    pub iterations: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BisectionState {
    pub lower: f64,
    pub upper: f64,
    pub mid: f64,
    pub iteration: usize,
    pub best: Option<(f64, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BisectionResult {
    pub best_value: Option<f64>,
    pub achieved_metric: Option<f64>,
    pub converged: bool,
    pub iterations: usize,
}

/// Bisection toward the smallest parameter value whose metric is finite and
/// at or below `target`. `eval` maps a parameter value to its metric.
///
/// The bound is inclusive: a metric equal to `target` counts as satisfied.
pub fn bisect<F>(
    lower: f64,
    upper: f64,
    tolerance: f64,
    max_iterations: usize,
    target: f64,
    mut eval: F,
) -> Result<BisectionResult, GoalSeekError>
where
    F: FnMut(f64, &BisectionState) -> Result<f64, GoalSeekError>,
{
    let mut state = BisectionState {
        lower,
        upper,
        mid: (lower + upper) / 2.0,
        iteration: 0,
        best: None,
    };
    let mut converged = false;
    while state.iteration < max_iterations {
        if state.upper - state.lower < tolerance {
            converged = true;
            break;
        }
        state.mid = (state.lower + state.upper) / 2.0;
        let metric = eval(state.mid, &state)?;
        state.iteration += 1;
        if metric.is_finite() && metric <= target {
            state.best = Some((state.mid, metric));
            state.upper = state.mid;
        } else {
            state.lower = state.mid;
        }
    }
    if !converged && state.upper - state.lower < tolerance {
        converged = true;
    }
    Ok(BisectionResult {
        best_value: state.best.map(|(v, _)| v),
        achieved_metric: state.best.map(|(_, m)| m),
        converged,
        iterations: state.iteration,
    })
}

/// Runs the bisection for one goal and one target, re-executing `template`
/// through `runner` with the optimised parameter overridden each iteration.
/// Every iteration's tables are returned alongside the outcome.
pub fn optimize<R: JobRunner + ?Sized>(
    runner: &R,
    template: &Job,
    goal: &GoalSpec,
    target: f64,
    cancel: &CancelToken,
) -> Result<(GoalOutcome, Vec<(Job, ResultTable)>), GoalSeekError> {
    let mut tables = Vec::new();
    info!(
        job_index = template.index,
        goal = %goal.name,
        parameter = %goal.parameter,
        lower = goal.lower,
        upper = goal.upper,
        target,
        "starting bisection search"
    );
    let result = bisect(
        goal.lower,
        goal.upper,
        goal.tolerance,
        goal.max_iterations,
        target,
        |mid, state| {
            let mut job = template.clone();
            job.assignment.set(&goal.parameter, ParamValue::Number(mid));
            let output = runner
                .run(&job, cancel)
                .map_err(|source| GoalSeekError::SimulationFailed {
                    parameter: goal.parameter.clone(),
                    value: mid,
                    source,
                })?;
            let metric = output
                .runs
                .last()
                .map(|(_, table)| metrics::evaluate(goal.metric, table, &goal.source_column))
                .unwrap_or(None)
                .ok_or_else(|| GoalSeekError::MissingColumn(goal.source_column.clone()))?;
            info!(
                job_index = template.index,
                iteration = state.iteration + 1,
                max_iterations = goal.max_iterations,
                value = mid,
                metric,
                "bisection iteration"
            );
            tables.extend(output.runs);
            Ok(metric)
        },
    )?;

    if result.best_value.is_none() {
        warn!(
            job_index = template.index,
            goal = %goal.name,
            target,
            "bisection search found no value meeting the target"
        );
    }
    let outcome = GoalOutcome {
        goal: goal.name.clone(),
        parameter: goal.parameter.clone(),
        metric: goal.metric,
        target,
        best_value: result.best_value,
        achieved_metric: result.achieved_metric,
        converged: result.converged,
        iterations: result.iterations,
    };
    Ok((outcome, tables))
}

/// Wraps a runner so each job also runs its goal searches after the plain
/// simulation. The dispatcher sees it as one job.
pub struct GoalSeekRunner<R> {
    inner: R,
    goals: Vec<GoalSpec>,
    stop_time: f64,
}

impl<R: JobRunner> GoalSeekRunner<R> {
    pub fn new(inner: R, goals: Vec<GoalSpec>, stop_time: f64) -> Self {
        Self {
            inner,
            goals,
            stop_time,
        }
    }
}

impl<R: JobRunner> JobRunner for GoalSeekRunner<R> {
    fn run(&self, job: &Job, cancel: &CancelToken) -> JobResult<JobOutput> {
        let mut output = self.inner.run(job, cancel)?;
        for goal in &self.goals {
            let targets = if goal.targets.is_empty() {
                vec![self.stop_time]
            } else {
                goal.targets.clone()
            };
            for target in targets {
                let bound = target.min(self.stop_time);
                let (mut outcome, tables) = optimize(&self.inner, job, goal, bound, cancel)?;
                outcome.target = target;
                output.runs.extend(tables);
                output.goals.push(outcome);
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::Assignment;
    use serde_json::json;

    /// Inventory grows linearly at a rate set by the breeding ratio, so the
    /// doubling time is 1752 / (TBR - 1) hours.
    struct LinearBreeder {
        stop_time: f64,
    }

    impl JobRunner for LinearBreeder {
        fn run(&self, job: &Job, _cancel: &CancelToken) -> JobResult<JobOutput> {
            let tbr = job
                .assignment
                .get("blanket.TBR")
                .and_then(ParamValue::as_f64)
                .unwrap_or(1.0);
            let mut table = ResultTable::new(vec!["sds.inventory".to_string()]);
            let mut t = 0.0;
            while t <= self.stop_time {
                table.push_row(t, vec![Some(1.0 + (tbr - 1.0) * t / 1752.0)]);
                t += 1.0;
            }
            Ok(JobOutput::single(job.clone(), table))
        }
    }

    fn goal() -> GoalSpec {
        GoalSpec::from_json(
            "Required_TBR",
            &json!({
                "method": "bisection_search",
                "parameter_to_optimize": "blanket.TBR",
                "search_range": [1.0, 1.5],
                "tolerance": 0.005,
                "max_iterations": 10,
                "metric_name": "doubling_time",
                "source_column": "sds.inventory",
                "metric_max_value": 8760
            }),
        )
        .expect("goal")
    }

    #[test]
    fn metric_equal_to_target_is_satisfied() {
        let result = bisect(0.0, 8.0, 0.01, 50, 4.0, |x, _| Ok(10.0 - x)).expect("bisect");
        assert_eq!(result.best_value, Some(6.0));
        assert_eq!(result.achieved_metric, Some(4.0));
        assert!(result.converged);
    }

    #[test]
    fn doubling_time_goal_converges_near_target() {
        let runner = LinearBreeder { stop_time: 20000.0 };
        let template = Job {
            index: 0,
            assignment: Assignment::new(),
        };
        let (outcome, tables) = optimize(&runner, &template, &goal(), 8760.0, &CancelToken::new())
            .expect("optimize");
        assert!(outcome.converged);
        assert!(outcome.iterations <= 10);
        let best = outcome.best_value.expect("best");
        assert!((1.2..=1.205).contains(&best), "best {}", best);
        let metric = outcome.achieved_metric.expect("metric");
        assert!((8500.0..=8760.0).contains(&metric), "metric {}", metric);
        assert_eq!(tables.len(), outcome.iterations);
    }

    #[test]
    fn exhausted_budget_reports_not_converged() {
        let result = bisect(0.0, 1.0, 1e-9, 3, 0.5, |mid, _| Ok(mid)).expect("bisect");
        assert!(!result.converged);
        assert_eq!(result.iterations, 3);
        assert_eq!(result.best_value, Some(0.125));
    }

    #[test]
    fn nan_metric_counts_as_not_satisfied() {
        let result = bisect(0.0, 1.0, 0.3, 10, 1.0, |_, _| Ok(f64::NAN)).expect("bisect");
        assert!(result.converged);
        assert_eq!(result.best_value, None);
    }

    struct Failing;

    impl JobRunner for Failing {
        fn run(&self, _job: &Job, _cancel: &CancelToken) -> JobResult<JobOutput> {
            Err(JobError::SimulationEngine("solver diverged".to_string()))
        }
    }

    #[test]
    fn failed_iteration_aborts_with_simulation_failure() {
        let template = Job {
            index: 3,
            assignment: Assignment::new(),
        };
        let err = optimize(&Failing, &template, &goal(), 8760.0, &CancelToken::new())
            .expect_err("must fail");
        assert!(err.to_string().contains("optimization failed due to simulation failure"));
        let job_err: JobError = err.into();
        assert_eq!(job_err.kind(), crate::error::ErrorKind::SimulationEngineError);
    }

    #[test]
    fn goal_runner_keeps_base_run_and_every_iteration() {
        let runner = GoalSeekRunner::new(LinearBreeder { stop_time: 20000.0 }, vec![goal()], 20000.0);
        let job = Job {
            index: 0,
            assignment: vec![("blanket.TBR".to_string(), ParamValue::Number(1.1))]
                .into_iter()
                .collect(),
        };
        let output = runner.run(&job, &CancelToken::new()).expect("run");
        assert_eq!(output.goals.len(), 1);
        assert_eq!(output.runs.len(), 1 + output.goals[0].iterations);
        assert_eq!(output.runs[0].0, job);
    }

    #[test]
    fn malformed_goal_specs_are_rejected() {
        let err = GoalSpec::from_json("g", &json!({"search_range": [1, 2]})).expect_err("missing param");
        assert!(err.to_string().contains("parameter_to_optimize"));
        let err = GoalSpec::from_json(
            "g",
            &json!({"parameter_to_optimize": "a.x", "search_range": [2, 1]}),
        )
        .expect_err("inverted range");
        assert!(err.to_string().contains("lower"));
    }
}
