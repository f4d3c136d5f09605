use crate::error::{JobError, JobResult};
use crate::goal_seek::GoalSpec;
use crate::sweep::{self, ExpandContext, Expansion, ParamValue};
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Key under `simulation_parameters` that loads one job per CSV row.
pub const JOB_FILE_KEY: &str = "file";

pub const DEFAULT_JOB_WARNING_THRESHOLD: usize = 2000;

/// Sweeps expanding to more jobs than this are rejected outright.
pub const MAX_JOBS: usize = 10_000_000;

/// Ordered parameter-path → value mapping. Order is declaration order and is
/// what column renaming and engine serialisation follow.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Assignment(Vec<(String, ParamValue)>);

impl Assignment {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn get(&self, path: &str) -> Option<&ParamValue> {
        self.0.iter().find(|(k, _)| k == path).map(|(_, v)| v)
    }

    /// Replaces the value in place, or appends a new entry.
    pub fn set(&mut self, path: &str, value: ParamValue) {
        match self.0.iter_mut().find(|(k, _)| k == path) {
            Some(slot) => slot.1 = value,
            None => self.0.push((path.to_string(), value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `&k1=v1&k2=v2` suffix used for aggregated column names.
    pub fn suffix(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("&{}={}", k, v))
            .collect()
    }
}

impl FromIterator<(String, ParamValue)> for Assignment {
    fn from_iter<T: IntoIterator<Item = (String, ParamValue)>>(iter: T) -> Self {
        let mut out = Assignment::new();
        for (k, v) in iter {
            out.set(&k, v);
        }
        out
    }
}

impl Serialize for Assignment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Assignment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Map::<String, Value>::deserialize(deserializer)?;
        raw.iter()
            .map(|(k, v)| {
                ParamValue::from_json(k, v)
                    .map(|pv| (k.clone(), pv))
                    .map_err(D::Error::custom)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub index: usize,
    pub assignment: Assignment,
}

impl Job {
    pub fn id(&self) -> String {
        format!("job_{}", self.index)
    }
}

#[derive(Debug, Clone)]
pub struct JobPlan {
    pub jobs: Vec<Job>,
    pub goals: Vec<GoalSpec>,
    pub warning: Option<String>,
}

pub struct GenerateOptions {
    pub base_dir: PathBuf,
    pub seed: Option<u64>,
    pub warning_threshold: usize,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            seed: None,
            warning_threshold: DEFAULT_JOB_WARNING_THRESHOLD,
        }
    }
}

enum Slot {
    Fixed(String, ParamValue),
    Cartesian(String, usize),
    Zipped(String, Vec<ParamValue>),
    Rows(usize),
}

enum Dimension {
    Values(Vec<ParamValue>),
    Rows(Vec<Vec<(String, ParamValue)>>),
}

impl Dimension {
    fn len(&self) -> usize {
        match self {
            Dimension::Values(v) => v.len(),
            Dimension::Rows(r) => r.len(),
        }
    }
}

/// Expands `simulation_parameters` into the ordered job list.
///
/// Plain sequences multiply as Cartesian factors, first-declared outermost.
/// Brace elements that expand to more than one value form a zipped group that
/// advances together with the job index instead of multiplying the count: with
/// no other swept factor the group alone sets the job count, otherwise its
/// length must equal the Cartesian count.
pub fn generate(params: &Map<String, Value>, opts: &GenerateOptions) -> JobResult<JobPlan> {
    let ctx = ExpandContext::new(&opts.base_dir, opts.seed);
    let mut slots = Vec::new();
    let mut dims: Vec<Dimension> = Vec::new();
    let mut goals = Vec::new();

    for (path, value) in params {
        if path == JOB_FILE_KEY {
            if let Value::String(file) = value {
                let rows = load_job_rows(file, &opts.base_dir)?;
                slots.push(Slot::Rows(dims.len()));
                dims.push(Dimension::Rows(rows));
                continue;
            }
        }
        if value.is_object() {
            goals.push(GoalSpec::from_json(path, value)?);
            continue;
        }
        match sweep::expand(path, value, &ctx)? {
            Expansion::Sequence(mut values) if values.len() == 1 => {
                slots.push(Slot::Fixed(path.clone(), values.remove(0)))
            }
            Expansion::Sequence(values) => {
                slots.push(Slot::Cartesian(path.clone(), dims.len()));
                dims.push(Dimension::Values(values));
            }
            Expansion::Array(elements) => {
                for (element_path, mut values) in elements {
                    if values.len() == 1 {
                        slots.push(Slot::Fixed(element_path, values.remove(0)));
                    } else {
                        slots.push(Slot::Zipped(element_path, values));
                    }
                }
            }
        }
    }

    let cartesian = dims
        .iter()
        .try_fold(1usize, |acc, d| acc.checked_mul(d.len()).filter(|n| *n <= MAX_JOBS))
        .ok_or_else(|| {
            JobError::invalid_spec(
                "simulation_parameters",
                &format!("{} swept dimensions", dims.len()),
                format!("sweep expands to more than {} jobs", MAX_JOBS),
            )
        })?;
    let zipped_len = zipped_length(&slots)?;
    let total = match zipped_len {
        None => cartesian,
        Some(len) if cartesian == 1 => len,
        Some(len) if len == cartesian => cartesian,
        Some(len) => {
            return Err(JobError::invalid_spec(
                "simulation_parameters",
                &format!("zipped length {}", len),
                format!(
                    "brace-expanded sequences of length {} cannot be zipped with {} Cartesian combinations",
                    len, cartesian
                ),
            ))
        }
    };

    let lengths: Vec<usize> = dims.iter().map(Dimension::len).collect();
    let mut jobs = Vec::with_capacity(total);
    for index in 0..total {
        let combo = decode_combination(if cartesian == 1 { 0 } else { index }, &lengths);
        let mut assignment = Assignment::new();
        for slot in &slots {
            match slot {
                Slot::Fixed(name, v) => assignment.set(name, v.clone()),
                Slot::Cartesian(name, d) => {
                    if let Dimension::Values(values) = &dims[*d] {
                        assignment.set(name, values[combo[*d]].clone());
                    }
                }
                Slot::Zipped(name, values) => assignment.set(name, values[index].clone()),
                Slot::Rows(d) => {
                    if let Dimension::Rows(rows) = &dims[*d] {
                        for (k, v) in &rows[combo[*d]] {
                            assignment.set(k, v.clone());
                        }
                    }
                }
            }
        }
        jobs.push(Job { index, assignment });
    }

    let warning = (total > opts.warning_threshold).then(|| {
        let msg = format!(
            "sweep expands to {} jobs, above the warning threshold of {}",
            total, opts.warning_threshold
        );
        warn!(jobs = total, threshold = opts.warning_threshold, "{}", msg);
        msg
    });
    info!(jobs = total, goals = goals.len(), "generated simulation jobs");

    Ok(JobPlan {
        jobs,
        goals,
        warning,
    })
}

fn zipped_length(slots: &[Slot]) -> JobResult<Option<usize>> {
    let mut len: Option<(usize, &str)> = None;
    for slot in slots {
        if let Slot::Zipped(name, values) = slot {
            match len {
                None => len = Some((values.len(), name)),
                Some((expected, first)) if expected != values.len() => {
                    return Err(JobError::invalid_spec(
                        name,
                        &format!("{} values", values.len()),
                        format!("zipped with '{}' which has {} values", first, expected),
                    ))
                }
                Some(_) => {}
            }
        }
    }
    Ok(len.map(|(l, _)| l))
}

/// Mixed-radix decode with the last dimension varying fastest.
fn decode_combination(mut index: usize, lengths: &[usize]) -> Vec<usize> {
    let mut combo = vec![0; lengths.len()];
    for (slot, len) in combo.iter_mut().zip(lengths).rev() {
        *slot = index % len;
        index /= len;
    }
    combo
}

fn load_job_rows(file: &str, base_dir: &Path) -> JobResult<Vec<Vec<(String, ParamValue)>>> {
    let path = if Path::new(file.trim()).is_absolute() {
        PathBuf::from(file.trim())
    } else {
        base_dir.join(file.trim())
    };
    let source_err = |reason: String| JobError::SweepDataSource {
        path: JOB_FILE_KEY.to_string(),
        reason,
    };
    let mut reader = csv::Reader::from_path(&path)
        .map_err(|e| source_err(format!("cannot open job file {}: {}", path.display(), e)))?;
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| source_err(format!("cannot read header of {}: {}", path.display(), e)))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| source_err(format!("malformed job row: {}", e)))?;
        let row = headers
            .iter()
            .zip(record.iter())
            .map(|(h, cell)| {
                let cell = cell.trim();
                let value = match cell.parse::<f64>() {
                    Ok(v) => ParamValue::Number(v),
                    Err(_) => ParamValue::Text(cell.to_string()),
                };
                (h.clone(), value)
            })
            .collect();
        rows.push(row);
    }
    if rows.is_empty() {
        return Err(JobError::invalid_spec(
            JOB_FILE_KEY,
            file,
            "job file has no rows",
        ));
    }
    info!(rows = rows.len(), file = %path.display(), "loaded jobs from CSV file");
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use proptest::prelude::*;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn pairs(job: &Job) -> Vec<(String, String)> {
        job.assignment
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn cartesian_product_is_outer_to_inner_in_declaration_order() {
        let plan = generate(
            &params(json!({"a.x": [1, 2], "a.y": [10, 20]})),
            &GenerateOptions::default(),
        )
        .expect("plan");
        let got: Vec<Vec<(String, String)>> = plan.jobs.iter().map(pairs).collect();
        let expect = |x: &str, y: &str| vec![("a.x".to_string(), x.to_string()), ("a.y".to_string(), y.to_string())];
        assert_eq!(
            got,
            vec![expect("1", "10"), expect("1", "20"), expect("2", "10"), expect("2", "20")]
        );
        assert_eq!(
            plan.jobs.iter().map(|j| j.index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
    }

    #[test]
    fn linspace_sweep_yields_three_jobs() {
        let plan = generate(
            &params(json!({"a.x": "linspace:0:10:3"})),
            &GenerateOptions::default(),
        )
        .expect("plan");
        let xs: Vec<f64> = plan
            .jobs
            .iter()
            .map(|j| j.assignment.get("a.x").and_then(ParamValue::as_f64).expect("x"))
            .collect();
        assert_eq!(xs, vec![0.0, 5.0, 10.0]);
    }

    #[test]
    fn zero_parameters_is_the_base_case() {
        let plan = generate(&Map::new(), &GenerateOptions::default()).expect("plan");
        assert_eq!(plan.jobs.len(), 1);
        assert!(plan.jobs[0].assignment.is_empty());
    }

    #[test]
    fn constants_ride_along_in_declaration_order() {
        let plan = generate(
            &params(json!({"blanket.TBR": 1.1, "a.x": [1, 2], "a.mode": "fast"})),
            &GenerateOptions::default(),
        )
        .expect("plan");
        assert_eq!(plan.jobs.len(), 2);
        let keys: Vec<&str> = plan.jobs[1].assignment.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["blanket.TBR", "a.x", "a.mode"]);
    }

    #[test]
    fn zipped_brace_group_does_not_multiply() {
        let plan = generate(
            &params(json!({"f.frac": "{0.1, [1,2,3]}"})),
            &GenerateOptions::default(),
        )
        .expect("plan");
        assert_eq!(plan.jobs.len(), 3);
        assert_eq!(
            pairs(&plan.jobs[2]),
            vec![
                ("f.frac[1]".to_string(), "0.1".to_string()),
                ("f.frac[2]".to_string(), "3".to_string())
            ]
        );

        let plan = generate(
            &params(json!({"a.x": [1, 2], "f.frac": "{[5,6], [7,8]}"})),
            &GenerateOptions::default(),
        )
        .expect("plan");
        assert_eq!(plan.jobs.len(), 2);
        assert_eq!(plan.jobs[1].assignment.get("f.frac[1]"), Some(&ParamValue::Number(6.0)));
        assert_eq!(plan.jobs[1].assignment.get("f.frac[2]"), Some(&ParamValue::Number(8.0)));
    }

    #[test]
    fn mismatched_zipped_lengths_are_rejected() {
        let err = generate(
            &params(json!({"f.frac": "{[1,2], [1,2,3]}"})),
            &GenerateOptions::default(),
        )
        .expect_err("must fail");
        assert_eq!(err.kind(), ErrorKind::InvalidSweepSpecification);

        let err = generate(
            &params(json!({"a.x": [1, 2, 3], "f.frac": "{[1,2], 4}"})),
            &GenerateOptions::default(),
        )
        .expect_err("must fail");
        assert_eq!(err.kind(), ErrorKind::InvalidSweepSpecification);
    }

    #[test]
    fn oversized_grids_are_rejected() {
        let too_many = params(json!({
            "a.x": "linspace:0:1:10000",
            "a.y": "linspace:0:1:10000",
        }));
        let err = generate(&too_many, &GenerateOptions::default()).expect_err("too many jobs");
        assert_eq!(err.kind(), ErrorKind::InvalidSweepSpecification);
        assert!(err.to_string().contains("more than 10000000 jobs"));

        let overflowing = params(json!({
            "a.a": "linspace:0:1:100000",
            "a.b": "linspace:0:1:100000",
            "a.c": "linspace:0:1:100000",
            "a.d": "linspace:0:1:100000",
            "a.e": "linspace:0:1:100000",
        }));
        let err = generate(&overflowing, &GenerateOptions::default()).expect_err("overflow");
        assert_eq!(err.kind(), ErrorKind::InvalidSweepSpecification);
    }

    #[test]
    fn job_file_rows_merge_with_constants() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("jobs.csv"), "a.x,a.y\n1,2\n3,4\n5,6\n").expect("write");
        let opts = GenerateOptions {
            base_dir: dir.path().to_path_buf(),
            ..GenerateOptions::default()
        };
        let plan = generate(&params(json!({"file": "jobs.csv", "a.z": 9})), &opts).expect("plan");
        assert_eq!(plan.jobs.len(), 3);
        assert_eq!(
            pairs(&plan.jobs[2]),
            vec![
                ("a.x".to_string(), "5".to_string()),
                ("a.y".to_string(), "6".to_string()),
                ("a.z".to_string(), "9".to_string())
            ]
        );
    }

    #[test]
    fn large_sweeps_warn_without_failing() {
        let opts = GenerateOptions {
            warning_threshold: 5,
            ..GenerateOptions::default()
        };
        let plan = generate(&params(json!({"a.x": "1:10:1"})), &opts).expect("plan");
        assert_eq!(plan.jobs.len(), 10);
        assert!(plan.warning.expect("warning").contains("10 jobs"));
    }

    #[test]
    fn goal_objects_are_split_out() {
        let plan = generate(
            &params(json!({
                "a.x": [1, 2],
                "Required_TBR": {
                    "parameter_to_optimize": "blanket.TBR",
                    "search_range": [1.0, 1.5],
                    "metric_name": "doubling_time",
                    "source_column": "sds.I[1]",
                    "metric_max_value": 8760
                }
            })),
            &GenerateOptions::default(),
        )
        .expect("plan");
        assert_eq!(plan.jobs.len(), 2);
        assert_eq!(plan.goals.len(), 1);
        assert_eq!(plan.goals[0].parameter, "blanket.TBR");
    }

    #[test]
    fn assignment_serialises_as_ordered_map() {
        let assignment: Assignment = vec![
            ("b".to_string(), ParamValue::Number(2.0)),
            ("a".to_string(), ParamValue::Text("x".into())),
        ]
        .into_iter()
        .collect();
        let text = serde_json::to_string(&assignment).expect("json");
        assert_eq!(text, r#"{"b":2.0,"a":"x"}"#);
        let back: Assignment = serde_json::from_str(&text).expect("parse");
        assert_eq!(back, assignment);
        assert_eq!(assignment.suffix(), "&b=2&a=x");
    }

    proptest! {
        #[test]
        fn job_count_is_product_of_lengths(lens in proptest::collection::vec(1usize..5, 0..4)) {
            let mut map = Map::new();
            for (i, len) in lens.iter().enumerate() {
                let values: Vec<Value> = (0..*len).map(|v| json!(v)).collect();
                map.insert(format!("p{}.v", i), Value::Array(values));
            }
            let plan = generate(&map, &GenerateOptions::default()).expect("plan");
            let expected: usize = lens.iter().product();
            prop_assert_eq!(plan.jobs.len(), expected);
            let mut seen = std::collections::HashSet::new();
            for job in &plan.jobs {
                prop_assert!(seen.insert(job.assignment.suffix()));
            }
        }
    }
}
