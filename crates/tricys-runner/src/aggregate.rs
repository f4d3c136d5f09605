use crate::error::{JobError, JobResult};
use crate::goal_seek::GoalOutcome;
use crate::jobs::Job;
use crate::table::{format_cell, ResultTable};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::Path;

/// Merges per-job tables into one wide table.
///
/// Runs are ordered by job index and then by assignment, so the result does
/// not depend on the order the runs arrive in. Unless the sweep is a single
/// job with no parameters, each column `V` becomes `V&p1=v1&p2=v2`. Tables
/// are outer-joined on time; missing cells stay empty.
pub fn aggregate(runs: &[(Job, ResultTable)]) -> ResultTable {
    let mut ordered: Vec<&(Job, ResultTable)> = runs.iter().collect();
    ordered.sort_by(|a, b| {
        a.0.index
            .cmp(&b.0.index)
            .then_with(|| a.0.assignment.suffix().cmp(&b.0.assignment.suffix()))
    });
    let rename = !(ordered.len() == 1 && ordered[0].0.assignment.is_empty());

    let mut time: Vec<f64> = ordered
        .iter()
        .flat_map(|(_, t)| t.time.iter().copied())
        .filter(|t| !t.is_nan())
        .collect();
    time.sort_by(f64::total_cmp);
    time.dedup_by(|a, b| a.total_cmp(b) == Ordering::Equal);

    let mut columns = Vec::new();
    let mut seen = HashSet::new();
    let mut rows: Vec<Vec<Option<f64>>> = vec![Vec::new(); time.len()];
    for (job, table) in ordered {
        let suffix = job.assignment.suffix();
        for (ci, name) in table.columns.iter().enumerate() {
            let renamed = if rename {
                format!("{}{}", name, suffix)
            } else {
                name.clone()
            };
            if !seen.insert(renamed.clone()) {
                continue;
            }
            columns.push(renamed);
            let mut values = vec![None; time.len()];
            for (t, row) in table.time.iter().zip(&table.rows) {
                if let Ok(pos) = time.binary_search_by(|v| v.total_cmp(t)) {
                    if let Some(v) = row.get(ci).copied().flatten() {
                        values[pos] = Some(v);
                    }
                }
            }
            for (row, v) in rows.iter_mut().zip(values) {
                row.push(v);
            }
        }
    }

    ResultTable { columns, time, rows }
}

/// One line per goal outcome: the job's assignment followed by the search
/// result.
pub fn write_goal_summary(path: &Path, outcomes: &[(Job, GoalOutcome)]) -> JobResult<()> {
    let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
    writer
        .write_record([
            "job_index",
            "assignment",
            "goal",
            "parameter",
            "metric",
            "target",
            "best_value",
            "achieved_metric",
            "converged",
            "iterations",
        ])
        .map_err(csv_err)?;
    for (job, o) in outcomes {
        let assignment = job.assignment.suffix();
        writer
            .write_record([
                job.index.to_string(),
                assignment.trim_start_matches('&').to_string(),
                o.goal.clone(),
                o.parameter.clone(),
                o.metric.to_string(),
                format_cell(Some(o.target)),
                format_cell(o.best_value),
                format_cell(o.achieved_metric),
                o.converged.to_string(),
                o.iterations.to_string(),
            ])
            .map_err(csv_err)?;
    }
    writer.flush()?;
    Ok(())
}

fn csv_err(err: csv::Error) -> JobError {
    JobError::Io(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::Assignment;
    use crate::metrics::MetricKind;
    use crate::sweep::ParamValue;
    use proptest::prelude::*;

    fn job(index: usize, pairs: &[(&str, f64)]) -> Job {
        Job {
            index,
            assignment: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), ParamValue::Number(*v)))
                .collect(),
        }
    }

    fn table(points: &[(f64, f64)]) -> ResultTable {
        let mut t = ResultTable::new(vec!["a.y".to_string()]);
        for (time, v) in points {
            t.push_row(*time, vec![Some(*v)]);
        }
        t
    }

    #[test]
    fn single_unparameterised_job_keeps_column_names() {
        let runs = vec![(
            Job {
                index: 0,
                assignment: Assignment::new(),
            },
            table(&[(0.0, 1.0), (1.0, 2.0)]),
        )];
        let merged = aggregate(&runs);
        assert_eq!(merged.columns, vec!["a.y".to_string()]);
        assert_eq!(merged.time, vec![0.0, 1.0]);
    }

    #[test]
    fn swept_columns_are_renamed_and_outer_joined() {
        let runs = vec![
            (job(1, &[("a.x", 2.0), ("a.z", 10.0)]), table(&[(0.0, 2.0), (2.0, 4.0)])),
            (job(0, &[("a.x", 1.0), ("a.z", 10.0)]), table(&[(0.0, 1.0), (1.0, 1.5)])),
        ];
        let merged = aggregate(&runs);
        assert_eq!(
            merged.columns,
            vec!["a.y&a.x=1&a.z=10".to_string(), "a.y&a.x=2&a.z=10".to_string()]
        );
        assert_eq!(merged.time, vec![0.0, 1.0, 2.0]);
        assert_eq!(merged.rows[1], vec![Some(1.5), None]);
        assert_eq!(merged.rows[2], vec![None, Some(4.0)]);
    }

    #[test]
    fn a_single_swept_job_is_still_renamed() {
        let merged = aggregate(&[(job(0, &[("a.x", 3.0)]), table(&[(0.0, 3.0)]))]);
        assert_eq!(merged.columns, vec!["a.y&a.x=3".to_string()]);
    }

    #[test]
    fn goal_summary_lists_each_outcome() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("goal_seek_summary.csv");
        let outcome = GoalOutcome {
            goal: "Required_TBR".to_string(),
            parameter: "blanket.TBR".to_string(),
            metric: MetricKind::DoublingTime,
            target: 8760.0,
            best_value: Some(1.2),
            achieved_metric: Some(8750.0),
            converged: true,
            iterations: 7,
        };
        write_goal_summary(&path, &[(job(0, &[("plasma.fb", 0.06)]), outcome)]).expect("write");
        let text = std::fs::read_to_string(&path).expect("read");
        let mut lines = text.lines();
        assert!(lines.next().expect("header").starts_with("job_index,assignment,goal"));
        assert_eq!(
            lines.next().expect("row"),
            "0,plasma.fb=0.06,Required_TBR,blanket.TBR,doubling_time,8760,1.2,8750,true,7"
        );
    }

    proptest! {
        #[test]
        fn merge_does_not_depend_on_input_order(
            grids in prop::collection::vec(prop::collection::btree_set(0u32..20, 1..6), 1..5),
            rotate in 0usize..5,
        ) {
            let runs: Vec<(Job, ResultTable)> = grids
                .iter()
                .enumerate()
                .map(|(i, grid)| {
                    let points: Vec<(f64, f64)> = grid.iter().map(|t| (*t as f64, (i * 100) as f64 + *t as f64)).collect();
                    (job(i, &[("a.x", i as f64)]), table(&points))
                })
                .collect();
            let mut shuffled = runs.clone();
            shuffled.reverse();
            let len = shuffled.len();
            shuffled.rotate_left(rotate % len);
            prop_assert_eq!(aggregate(&runs), aggregate(&shuffled));
        }
    }
}
