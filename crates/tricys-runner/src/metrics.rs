use crate::table::ResultTable;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Scalar metrics derived from one inventory column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    FinalValue,
    StartupInventory,
    TurningPointTime,
    DoublingTime,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::FinalValue => "final_value",
            MetricKind::StartupInventory => "startup_inventory",
            MetricKind::TurningPointTime => "turning_point_time",
            MetricKind::DoublingTime => "doubling_time",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "final_value" => Ok(MetricKind::FinalValue),
            "startup_inventory" => Ok(MetricKind::StartupInventory),
            "turning_point_time" | "self_sufficiency_time" => Ok(MetricKind::TurningPointTime),
            "doubling_time" => Ok(MetricKind::DoublingTime),
            other => Err(format!("unsupported metric '{}'", other)),
        }
    }
}

/// Evaluates `kind` over `column`. Returns `None` when the column is absent
/// and NaN when the metric is undefined for the series.
pub fn evaluate(kind: MetricKind, table: &ResultTable, column: &str) -> Option<f64> {
    let values = table.column(column)?;
    let (time, series): (Vec<f64>, Vec<f64>) = table
        .time
        .iter()
        .zip(values)
        .filter_map(|(t, v)| v.map(|v| (*t, v)))
        .unzip();
    Some(match kind {
        MetricKind::FinalValue => final_value(&series),
        MetricKind::StartupInventory => startup_inventory(&series),
        MetricKind::TurningPointTime => turning_point_time(&series, &time),
        MetricKind::DoublingTime => doubling_time(&series, &time),
    })
}

pub fn final_value(series: &[f64]) -> f64 {
    series.last().copied().unwrap_or(f64::NAN)
}

pub fn startup_inventory(series: &[f64]) -> f64 {
    match (series.first(), argmin(series)) {
        (Some(first), Some(i)) => first - series[i],
        _ => f64::NAN,
    }
}

/// Time of the inventory minimum. NaN when the smoothed trend still bottoms
/// out in the final 30% of the series, i.e. no turning point yet.
pub fn turning_point_time(series: &[f64], time: &[f64]) -> f64 {
    let n = series.len();
    if n == 0 || time.len() != n {
        return f64::NAN;
    }
    let window = ((n as f64 * 0.001) as usize).max(1);
    let smoothed = centered_mean(series, window);
    let Some(smooth_min) = argmin(&smoothed) else {
        return f64::NAN;
    };
    let tail = (n as f64 * 0.3) as usize;
    if smooth_min >= n - tail {
        return f64::NAN;
    }
    argmin(series).map(|i| time[i]).unwrap_or(f64::NAN)
}

/// First time, at or after the minimum, where the inventory reaches twice its
/// initial value.
pub fn doubling_time(series: &[f64], time: &[f64]) -> f64 {
    let (Some(first), Some(min_idx)) = (series.first(), argmin(series)) else {
        return f64::NAN;
    };
    let doubled = 2.0 * first;
    series
        .iter()
        .enumerate()
        .skip(min_idx)
        .find(|(_, v)| **v >= doubled)
        .and_then(|(i, _)| time.get(i).copied())
        .unwrap_or(f64::NAN)
}

fn argmin(series: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, v) in series.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        if best.map(|(_, b)| *v < b).unwrap_or(true) {
            best = Some((i, *v));
        }
    }
    best.map(|(i, _)| i)
}

fn centered_mean(series: &[f64], window: usize) -> Vec<f64> {
    let n = series.len();
    let before = window / 2;
    let after = (window - 1) / 2;
    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(before);
            let hi = (i + after).min(n - 1);
            let slice = &series[lo..=hi];
            slice.iter().sum::<f64>() / slice.len() as f64
        })
        .collect()
}
