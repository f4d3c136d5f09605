use crate::error::{JobError, JobResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Upper bound on the values one grammar string may expand to.
pub const MAX_SEQUENCE_LEN: usize = 1_000_000;

/// One concrete value assigned to a parameter path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<ParamValue>),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Number(v) => Some(*v),
            ParamValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn from_json(path: &str, value: &Value) -> JobResult<Self> {
        match value {
            Value::Bool(b) => Ok(ParamValue::Bool(*b)),
            Value::Number(n) => n
                .as_f64()
                .map(ParamValue::Number)
                .ok_or_else(|| JobError::invalid_spec(path, &n.to_string(), "number out of range")),
            Value::String(s) => Ok(ParamValue::Text(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(|v| ParamValue::from_json(path, v))
                .collect::<JobResult<Vec<_>>>()
                .map(ParamValue::List),
            other => Err(JobError::invalid_spec(
                path,
                &other.to_string(),
                "expected a scalar value",
            )),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Number(v) => write!(f, "{}", v),
            ParamValue::Text(s) => f.write_str(s),
            ParamValue::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "{{{}}}", parts.join(","))
            }
        }
    }
}

/// Result of expanding one declared parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Expansion {
    /// Ordered values for a Cartesian dimension.
    Sequence(Vec<ParamValue>),
    /// Brace expansion: one `(path[i], values)` entry per array element.
    Array(Vec<(String, Vec<ParamValue>)>),
}

#[derive(Debug, Clone, Default)]
pub struct ExpandContext {
    pub base_dir: PathBuf,
    pub seed: Option<u64>,
}

impl ExpandContext {
    pub fn new(base_dir: &Path, seed: Option<u64>) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
            seed,
        }
    }

    fn rng_for(&self, path: &str) -> StdRng {
        match self.seed {
            Some(seed) => {
                let digest = Sha256::digest(format!("{}:{}", seed, path).as_bytes());
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&digest[..8]);
                StdRng::seed_from_u64(u64::from_le_bytes(bytes))
            }
            None => StdRng::from_entropy(),
        }
    }
}

pub fn round8(v: f64) -> f64 {
    let r = (v * 1e8).round() / 1e8;
    if r == 0.0 {
        0.0
    } else {
        r
    }
}

/// Expands the declared value of `path` into its sweep values.
pub fn expand(path: &str, value: &Value, ctx: &ExpandContext) -> JobResult<Expansion> {
    let expansion = match value {
        Value::String(raw) if is_brace(raw) => Expansion::Array(expand_brace(path, raw, ctx)?),
        Value::String(raw) => Expansion::Sequence(expand_str(path, raw, ctx)?),
        Value::Array(items) => Expansion::Sequence(
            items
                .iter()
                .map(|v| ParamValue::from_json(path, v))
                .collect::<JobResult<Vec<_>>>()?,
        ),
        Value::Object(_) => {
            return Err(JobError::invalid_spec(
                path,
                &value.to_string(),
                "structured values are only accepted as goal-seek targets",
            ))
        }
        Value::Null => {
            return Err(JobError::invalid_spec(path, "null", "value must not be null"));
        }
        scalar => Expansion::Sequence(vec![ParamValue::from_json(path, scalar)?]),
    };
    match &expansion {
        Expansion::Sequence(values) if values.is_empty() => Err(JobError::invalid_spec(
            path,
            &value.to_string(),
            "expands to an empty sequence",
        )),
        Expansion::Array(elements) if elements.is_empty() => Err(JobError::invalid_spec(
            path,
            &value.to_string(),
            "brace expansion has no elements",
        )),
        _ => Ok(expansion),
    }
}

fn is_brace(raw: &str) -> bool {
    let t = raw.trim();
    t.starts_with('{') && t.ends_with('}')
}

/// Expands one compact grammar string into an ordered sequence.
pub fn expand_str(path: &str, raw: &str, ctx: &ExpandContext) -> JobResult<Vec<ParamValue>> {
    let text = raw.trim();
    let Some((prefix, args)) = text.split_once(':') else {
        return Ok(vec![literal(text)]);
    };
    let values = match prefix.trim().to_ascii_lowercase().as_str() {
        "linspace" => {
            let [start, stop, num] = numeric_args(path, raw, args)?;
            linspace(start, stop, count_arg(path, raw, num)?)
        }
        "log" => {
            let [start, stop, num] = numeric_args(path, raw, args)?;
            if start <= 0.0 || stop <= 0.0 {
                return Err(JobError::invalid_spec(
                    path,
                    raw,
                    "log bounds must be strictly positive",
                ));
            }
            logspace(start, stop, count_arg(path, raw, num)?)
        }
        "rand" => {
            let [low, high, count] = numeric_args(path, raw, args)?;
            if low > high {
                return Err(JobError::invalid_spec(path, raw, "rand min exceeds max"));
            }
            let count = count_arg(path, raw, count)?;
            let mut rng = ctx.rng_for(path);
            (0..count)
                .map(|_| {
                    if low == high {
                        low
                    } else {
                        round8(rng.gen_range(low..=high))
                    }
                })
                .collect()
        }
        "file" => return read_file_column(path, raw, args, &ctx.base_dir),
        _ if prefix.trim().parse::<f64>().is_ok() => {
            let [start, stop, step] = numeric_args(path, raw, text)?;
            if step <= 0.0 {
                return Err(JobError::invalid_spec(path, raw, "range step must be positive"));
            }
            if (stop - start) / step >= MAX_SEQUENCE_LEN as f64 {
                return Err(JobError::invalid_spec(
                    path,
                    raw,
                    format!("range has more than {} values", MAX_SEQUENCE_LEN),
                ));
            }
            arange(start, stop, step)
        }
        // Anything else with a colon is a literal such as a Modelica class path.
        other => {
            if looks_like_grammar_name(other) {
                warn!(path, value = text, prefix = other, "unknown sequence prefix, using the string as a literal");
            }
            return Ok(vec![ParamValue::Text(text.to_string())]);
        }
    };
    if values.is_empty() {
        return Err(JobError::invalid_spec(path, raw, "expands to an empty sequence"));
    }
    Ok(values.into_iter().map(ParamValue::Number).collect())
}

fn literal(text: &str) -> ParamValue {
    match text {
        "true" => ParamValue::Bool(true),
        "false" => ParamValue::Bool(false),
        _ => match text.parse::<f64>() {
            Ok(v) => ParamValue::Number(v),
            Err(_) => ParamValue::Text(text.to_string()),
        },
    }
}

fn numeric_args(path: &str, raw: &str, args: &str) -> JobResult<[f64; 3]> {
    let parts: Vec<&str> = args.split(':').collect();
    if parts.len() != 3 {
        return Err(JobError::invalid_spec(
            path,
            raw,
            format!("expected 3 ':'-separated numbers, found {}", parts.len()),
        ));
    }
    let mut out = [0.0; 3];
    for (slot, part) in out.iter_mut().zip(&parts) {
        *slot = part.trim().parse::<f64>().map_err(|_| {
            JobError::invalid_spec(path, raw, format!("'{}' is not a number", part.trim()))
        })?;
        if !slot.is_finite() {
            return Err(JobError::invalid_spec(path, raw, "bounds must be finite"));
        }
    }
    Ok(out)
}

fn count_arg(path: &str, raw: &str, num: f64) -> JobResult<usize> {
    if num < 1.0 || num.fract() != 0.0 {
        return Err(JobError::invalid_spec(
            path,
            raw,
            format!("count must be a positive integer, got {}", num),
        ));
    }
    if num > MAX_SEQUENCE_LEN as f64 {
        return Err(JobError::invalid_spec(
            path,
            raw,
            format!("count {} exceeds the limit of {}", num, MAX_SEQUENCE_LEN),
        ));
    }
    Ok(num as usize)
}

/// A bare word before the colon, as in a misspelt `linspace`. Drive letters,
/// class paths and handler references are not flagged.
fn looks_like_grammar_name(prefix: &str) -> bool {
    prefix.len() > 1 && prefix.chars().all(|c| c.is_ascii_alphabetic())
}

pub fn arange(start: f64, stop: f64, step: f64) -> Vec<f64> {
    let span = (stop + step / 2.0 - start) / step;
    if span <= 0.0 {
        return Vec::new();
    }
    let n = span.ceil() as usize;
    (0..n).map(|i| round8(start + i as f64 * step)).collect()
}

pub fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    if num == 1 {
        return vec![round8(start)];
    }
    let step = (stop - start) / (num - 1) as f64;
    (0..num)
        .map(|i| {
            if i == num - 1 {
                round8(stop)
            } else {
                round8(start + i as f64 * step)
            }
        })
        .collect()
}

pub fn logspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    let exps = linspace_raw(start.log10(), stop.log10(), num);
    let last = exps.len().saturating_sub(1);
    exps.into_iter()
        .enumerate()
        .map(|(i, e)| {
            if i == 0 {
                round8(start)
            } else if i == last {
                round8(stop)
            } else {
                round8(10f64.powf(e))
            }
        })
        .collect()
}

fn linspace_raw(start: f64, stop: f64, num: usize) -> Vec<f64> {
    if num == 1 {
        return vec![start];
    }
    let step = (stop - start) / (num - 1) as f64;
    (0..num).map(|i| start + i as f64 * step).collect()
}

fn read_file_column(path: &str, raw: &str, args: &str, base_dir: &Path) -> JobResult<Vec<ParamValue>> {
    // rsplit keeps drive letters such as C:\ inside the file part
    let Some((file_part, column)) = args.rsplit_once(':') else {
        return Err(JobError::invalid_spec(
            path,
            raw,
            "file grammar needs a column: file:path:column",
        ));
    };
    let file_part = file_part.trim();
    let column = column.trim();
    if file_part.is_empty() || column.is_empty() {
        return Err(JobError::invalid_spec(path, raw, "empty file path or column"));
    }
    let file = if Path::new(file_part).is_absolute() {
        PathBuf::from(file_part)
    } else {
        base_dir.join(file_part)
    };
    let source_err = |reason: String| JobError::SweepDataSource {
        path: path.to_string(),
        reason,
    };

    let mut reader = csv::Reader::from_path(&file)
        .map_err(|e| source_err(format!("cannot open {}: {}", file.display(), e)))?;
    let headers = reader
        .headers()
        .map_err(|e| source_err(format!("cannot read header of {}: {}", file.display(), e)))?
        .clone();
    let idx = headers
        .iter()
        .position(|h| h.trim() == column)
        .ok_or_else(|| source_err(format!("column '{}' not found in {}", column, file.display())))?;

    let mut cells = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| source_err(format!("malformed row: {}", e)))?;
        if let Some(cell) = record.get(idx).map(str::trim).filter(|c| !c.is_empty()) {
            cells.push(cell.to_string());
        }
    }
    if cells.is_empty() {
        return Err(JobError::invalid_spec(path, raw, "file column is empty"));
    }
    let numeric: Option<Vec<f64>> = cells.iter().map(|c| c.parse::<f64>().ok()).collect();
    Ok(match numeric {
        Some(values) => values.into_iter().map(ParamValue::Number).collect(),
        None => cells.into_iter().map(ParamValue::Text).collect(),
    })
}

fn expand_brace(path: &str, raw: &str, ctx: &ExpandContext) -> JobResult<Vec<(String, Vec<ParamValue>)>> {
    let trimmed = raw.trim();
    let inner = &trimmed[1..trimmed.len() - 1];
    let elements = split_top_level(inner)
        .map_err(|reason| JobError::invalid_spec(path, raw, reason))?;
    let mut out = Vec::with_capacity(elements.len());
    for (i, element) in elements.iter().enumerate() {
        let element_path = format!("{}[{}]", path, i + 1);
        let values = expand_brace_element(&element_path, element, ctx)?;
        if values.is_empty() {
            return Err(JobError::invalid_spec(&element_path, element, "expands to an empty sequence"));
        }
        out.push((element_path, values));
    }
    Ok(out)
}

fn expand_brace_element(path: &str, element: &str, ctx: &ExpandContext) -> JobResult<Vec<ParamValue>> {
    let e = element.trim();
    if e.is_empty() {
        return Err(JobError::invalid_spec(path, element, "empty brace element"));
    }
    if e.starts_with('[') && e.ends_with(']') {
        let items = split_top_level(&e[1..e.len() - 1])
            .map_err(|reason| JobError::invalid_spec(path, element, reason))?;
        return items
            .iter()
            .map(|item| {
                let item = unquote(item.trim());
                if item.is_empty() {
                    Err(JobError::invalid_spec(path, element, "empty list item"))
                } else {
                    Ok(literal(item))
                }
            })
            .collect();
    }
    expand_str(path, unquote(e), ctx)
}

fn unquote(s: &str) -> &str {
    let bytes = s.as_bytes();
    if bytes.len() >= 2
        && ((bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\'')
            || (bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"'))
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

/// Splits on commas that are outside brackets and quotes.
fn split_top_level(s: &str) -> Result<Vec<String>, String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for ch in s.chars() {
        match quote {
            Some(q) => {
                current.push(ch);
                if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    current.push(ch);
                }
                '[' | '{' => {
                    depth += 1;
                    current.push(ch);
                }
                ']' | '}' => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(format!("unbalanced '{}'", ch));
                    }
                    current.push(ch);
                }
                ',' if depth == 0 => parts.push(std::mem::take(&mut current).trim().to_string()),
                _ => current.push(ch),
            },
        }
    }
    if quote.is_some() {
        return Err("unterminated quote".to_string());
    }
    if depth != 0 {
        return Err("unbalanced brackets".to_string());
    }
    if !current.trim().is_empty() || !parts.is_empty() {
        parts.push(current.trim().to_string());
    }
    Ok(parts)
}
