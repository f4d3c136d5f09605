use crate::error::{JobError, JobResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const TIME_COLUMN: &str = "time";

/// Time-indexed numeric table produced by one simulation run.
///
/// `rows[i]` holds one value per entry in `columns`; `None` marks a gap (an
/// empty or non-numeric CSV cell, or a row missing after an outer join).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultTable {
    pub columns: Vec<String>,
    pub time: Vec<f64>,
    pub rows: Vec<Vec<Option<f64>>>,
}

impl ResultTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            time: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, time: f64, values: Vec<Option<f64>>) {
        self.time.push(time);
        self.rows.push(values);
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn column(&self, name: &str) -> Option<Vec<Option<f64>>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|r| r.get(idx).copied().flatten()).collect())
    }

    /// A copy holding `time` and the columns accepted by `keep`, in order.
    pub fn select<F: Fn(&str) -> bool>(&self, keep: F) -> ResultTable {
        let picked: Vec<usize> = (0..self.columns.len())
            .filter(|&i| keep(&self.columns[i]))
            .collect();
        ResultTable {
            columns: picked.iter().map(|&i| self.columns[i].clone()).collect(),
            time: self.time.clone(),
            rows: self
                .rows
                .iter()
                .map(|r| picked.iter().map(|&i| r.get(i).copied().flatten()).collect())
                .collect(),
        }
    }

    /// Drops rows whose time is NaN, collapses duplicate timestamps keeping the
    /// last occurrence, and sorts ascending by time.
    pub fn clean(&mut self) {
        let mut indexed: Vec<(usize, f64)> = self
            .time
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, t)| !t.is_nan())
            .collect();
        // stable: equal timestamps keep their original relative order
        indexed.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut keep: Vec<usize> = Vec::with_capacity(indexed.len());
        for (pos, (idx, t)) in indexed.iter().enumerate() {
            let next_same = indexed
                .get(pos + 1)
                .map(|(_, next)| next.total_cmp(t).is_eq())
                .unwrap_or(false);
            if !next_same {
                keep.push(*idx);
            }
        }

        let time = keep.iter().map(|&i| self.time[i]).collect();
        let rows = keep.iter().map(|&i| self.rows[i].clone()).collect();
        self.time = time;
        self.rows = rows;
    }

    pub fn read_csv(path: &Path) -> JobResult<Self> {
        let mut reader = csv::Reader::from_path(path).map_err(|e| {
            JobError::SimulationEngine(format!("cannot read result table {}: {}", path.display(), e))
        })?;
        let headers = reader
            .headers()
            .map_err(|e| JobError::SimulationEngine(format!("malformed result header: {}", e)))?
            .clone();
        let time_idx = headers
            .iter()
            .position(|h| h.trim() == TIME_COLUMN)
            .ok_or_else(|| {
                JobError::SimulationEngine(format!(
                    "result table {} has no '{}' column",
                    path.display(),
                    TIME_COLUMN
                ))
            })?;
        let columns: Vec<String> = headers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != time_idx)
            .map(|(_, h)| h.trim().to_string())
            .collect();

        let mut table = ResultTable::new(columns);
        for record in reader.records() {
            let record = record
                .map_err(|e| JobError::SimulationEngine(format!("malformed result row: {}", e)))?;
            let time = record
                .get(time_idx)
                .and_then(parse_cell)
                .unwrap_or(f64::NAN);
            let values = record
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != time_idx)
                .map(|(_, cell)| parse_cell(cell))
                .collect();
            table.push_row(time, values);
        }
        Ok(table)
    }

    pub fn write_csv(&self, path: &Path) -> JobResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path).map_err(csv_io)?;
        let mut header = vec![TIME_COLUMN.to_string()];
        header.extend(self.columns.iter().cloned());
        writer.write_record(&header).map_err(csv_io)?;
        for (t, row) in self.time.iter().zip(&self.rows) {
            let mut record = Vec::with_capacity(row.len() + 1);
            record.push(format_cell(Some(*t)));
            record.extend(row.iter().map(|v| format_cell(*v)));
            writer.write_record(&record).map_err(csv_io)?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn parse_cell(cell: &str) -> Option<f64> {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|v| !v.is_nan())
}

pub(crate) fn format_cell(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{}", v),
        None => String::new(),
    }
}

fn csv_io(err: csv::Error) -> JobError {
    JobError::Io(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
}
