use crate::fsutil::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir, json_digest, unique_path};
use crate::handler::HandlerRef;
use crate::jobs::DEFAULT_JOB_WARNING_THRESHOLD;
use crate::rewrite::RewriteMode;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const PATH_KEYS: &[&str] = &["package_path", "results_dir", "temp_dir", "log_dir", "run_root"];

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub submodel_name: String,
    pub instance_name: String,
    pub handler: HandlerRef,
    pub params: Map<String, Value>,
    /// Ports the handler overrides; all output ports of the submodel when absent.
    pub output_ports: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct CoSimConfig {
    pub mode: RewriteMode,
    pub handlers: Vec<HandlerConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub to_console: bool,
    pub log_count: usize,
}

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub raw: Value,
    pub base_dir: PathBuf,
    pub package_path: PathBuf,
    pub run_root: PathBuf,
    pub results_dir: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub model_name: String,
    pub stop_time: f64,
    pub step_size: f64,
    pub variable_filter: String,
    pub concurrent: bool,
    pub max_workers: Option<usize>,
    pub keep_temp_files: bool,
    pub timeout_seconds: Option<u64>,
    pub job_warning_threshold: usize,
    pub seed: Option<u64>,
    pub engine: Option<EngineConfig>,
    pub co_simulation: Option<CoSimConfig>,
    pub logging: LoggingConfig,
}

impl SweepConfig {
    pub fn parameters(&self) -> Map<String, Value> {
        self.raw
            .pointer("/simulation_parameters")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_co_simulation(&self) -> bool {
        self.co_simulation
            .as_ref()
            .map(|c| !c.handlers.is_empty())
            .unwrap_or(false)
    }
}

/// Reads a YAML or JSON config, resolves relative paths against its directory
/// and validates it.
pub fn load_config(path: &Path) -> Result<SweepConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    let mut json_value: Value = serde_json::to_value(yaml_value)?;
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .canonicalize()
        .unwrap_or_else(|_| PathBuf::from("."));
    resolve_relative_paths(&mut json_value, &base_dir, false);
    config_from_value(json_value, &base_dir)
}

pub fn config_from_value(json_value: Value, base_dir: &Path) -> Result<SweepConfig> {
    validate_required_fields(&json_value)?;
    let variable_filter = json_value
        .pointer("/simulation/variableFilter")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing /simulation/variableFilter"))?
        .to_string();
    validate_variable_filter(&variable_filter)?;

    let sim = json_value
        .pointer("/simulation")
        .ok_or_else(|| anyhow!("simulation section missing"))?;
    let model_name = sim
        .pointer("/model_name")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing /simulation/model_name"))?
        .to_string();
    let stop_time = number_at(sim, "/stop_time")?;
    let step_size = number_at(sim, "/step_size")?;
    if stop_time <= 0.0 || step_size <= 0.0 {
        return Err(anyhow!(
            "stop_time ({}) and step_size ({}) must be positive",
            stop_time,
            step_size
        ));
    }
    let max_workers = sim
        .pointer("/max_workers")
        .and_then(Value::as_u64)
        .map(|v| v as usize);
    if max_workers == Some(0) {
        return Err(anyhow!("simulation.max_workers must be at least 1"));
    }

    let package_path = json_value
        .pointer("/paths/package_path")
        .and_then(Value::as_str)
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("missing /paths/package_path"))?;
    let path_at = |pointer: &str| {
        json_value
            .pointer(pointer)
            .and_then(Value::as_str)
            .map(PathBuf::from)
    };

    Ok(SweepConfig {
        base_dir: base_dir.to_path_buf(),
        package_path,
        run_root: path_at("/paths/run_root").unwrap_or_else(|| base_dir.to_path_buf()),
        results_dir: path_at("/paths/results_dir"),
        temp_dir: path_at("/paths/temp_dir"),
        log_dir: path_at("/paths/log_dir"),
        model_name,
        stop_time,
        step_size,
        variable_filter,
        concurrent: sim.pointer("/concurrent").and_then(Value::as_bool).unwrap_or(false),
        max_workers,
        keep_temp_files: sim
            .pointer("/keep_temp_files")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        timeout_seconds: sim.pointer("/timeout_seconds").and_then(Value::as_u64),
        job_warning_threshold: sim
            .pointer("/job_warning_threshold")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_JOB_WARNING_THRESHOLD),
        seed: sim.pointer("/seed").and_then(Value::as_u64),
        engine: resolve_engine(&json_value)?,
        co_simulation: resolve_co_simulation(&json_value)?,
        logging: resolve_logging(&json_value),
        raw: json_value,
    })
}

fn number_at(section: &Value, pointer: &str) -> Result<f64> {
    section
        .pointer(pointer)
        .and_then(Value::as_f64)
        .ok_or_else(|| anyhow!("simulation{} must be a number", pointer.replace('/', ".")))
}

fn validate_required_fields(json_value: &Value) -> Result<()> {
    let required: &[&str] = &[
        "/paths/package_path",
        "/simulation/model_name",
        "/simulation/stop_time",
        "/simulation/step_size",
        "/simulation/variableFilter",
    ];
    let mut missing = Vec::new();
    for pointer in required {
        let is_missing = match json_value.pointer(pointer) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            _ => false,
        };
        if is_missing {
            missing.push(*pointer);
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "config missing required fields:\n{}",
            missing
                .iter()
                .map(|p| format!("  - {}", p))
                .collect::<Vec<_>>()
                .join("\n")
        ))
    }
}

/// Each `|`-separated entry is `time`, `inst.var`, `inst.var[N]` or
/// `inst.var[N-M]`.
pub fn validate_variable_filter(filter: &str) -> Result<()> {
    let entry = Regex::new(r"^time$|^[A-Za-z_]\w*(\.[A-Za-z_]\w*)+(\[\d+(-\d+)?\])?$")?;
    let bad: Vec<&str> = filter
        .split('|')
        .map(str::trim)
        .filter(|e| !entry.is_match(e))
        .collect();
    if bad.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "invalid variableFilter entries: {}",
            bad.iter()
                .map(|e| format!("'{}'", e))
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }
}

/// Rewrites relative path strings to absolute ones. Parameter values are left
/// alone since their keys are model paths, not files.
pub fn resolve_relative_paths(value: &mut Value, base_dir: &Path, inside_params: bool) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if !inside_params && (PATH_KEYS.contains(&key.as_str()) || key.ends_with("_path")) {
                    if let Value::String(s) = &mut *child {
                        let p = Path::new(s.as_str());
                        if !s.is_empty() && p.is_relative() {
                            *s = base_dir.join(p).to_string_lossy().to_string();
                        }
                        continue;
                    }
                }
                let nested_params = inside_params || key == "simulation_parameters";
                resolve_relative_paths(child, base_dir, nested_params);
            }
        }
        Value::Array(items) => {
            for item in items {
                resolve_relative_paths(item, base_dir, inside_params);
            }
        }
        _ => {}
    }
}

fn resolve_engine(json_value: &Value) -> Result<Option<EngineConfig>> {
    let Some(engine) = json_value.pointer("/engine") else {
        return Ok(None);
    };
    let command = match engine.pointer("/command") {
        Some(Value::Array(parts)) => parts
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("engine.command entries must be strings"))
            })
            .collect::<Result<Vec<_>>>()?,
        Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
        _ => return Err(anyhow!("engine.command missing")),
    };
    if command.is_empty() {
        return Err(anyhow!("engine.command must not be empty"));
    }
    let env = engine
        .pointer("/env")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), v)
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(Some(EngineConfig { command, env }))
}

fn resolve_co_simulation(json_value: &Value) -> Result<Option<CoSimConfig>> {
    let Some(section) = json_value.pointer("/co_simulation") else {
        return Ok(None);
    };
    let mode = match section.pointer("/mode").and_then(Value::as_str) {
        Some(m) => m.parse::<RewriteMode>().map_err(|e| anyhow!(e))?,
        None => RewriteMode::Interceptor,
    };
    let handlers = match section.pointer("/handlers") {
        Some(Value::Array(items)) => items.clone(),
        Some(obj @ Value::Object(_)) => vec![obj.clone()],
        _ => return Err(anyhow!("co_simulation.handlers missing")),
    };
    let handlers = handlers
        .iter()
        .enumerate()
        .map(|(i, h)| resolve_handler(i, h))
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(CoSimConfig { mode, handlers }))
}

fn resolve_handler(i: usize, h: &Value) -> Result<HandlerConfig> {
    let field = |name: &str| {
        h.pointer(&format!("/{}", name))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let submodel_name =
        field("submodel_name").ok_or_else(|| anyhow!("co_simulation.handlers[{}].submodel_name missing", i))?;
    let instance_name =
        field("instance_name").ok_or_else(|| anyhow!("co_simulation.handlers[{}].instance_name missing", i))?;
    let function = field("handler_function").unwrap_or_else(|| "run".to_string());
    let handler = match (field("handler_script_path"), field("handler_module")) {
        (Some(path), _) => HandlerRef::Script {
            path: PathBuf::from(path),
            function,
        },
        (None, Some(module)) => HandlerRef::Module { module, function },
        (None, None) => {
            return Err(anyhow!(
                "co_simulation.handlers[{}] needs handler_script_path or handler_module",
                i
            ))
        }
    };
    let params = h
        .pointer("/params")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let output_ports = h.pointer("/output_ports").and_then(Value::as_array).map(|a| {
        a.iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    });
    Ok(HandlerConfig {
        submodel_name,
        instance_name,
        handler,
        params,
        output_ports,
    })
}

fn resolve_logging(json_value: &Value) -> LoggingConfig {
    let logging = json_value.pointer("/logging");
    let get = |p: &str| logging.and_then(|l| l.pointer(p));
    LoggingConfig {
        level: get("/log_level")
            .and_then(Value::as_str)
            .unwrap_or("INFO")
            .to_string(),
        to_console: get("/log_to_console").and_then(Value::as_bool).unwrap_or(true),
        log_count: get("/log_count")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(5),
    }
}

/// Directories of one sweep execution.
#[derive(Debug, Clone)]
pub struct RunLayout {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub results_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl RunLayout {
    pub fn resolved_config_path(&self) -> PathBuf {
        self.run_dir.join("resolved_config.json")
    }

    pub fn failed_jobs_path(&self) -> PathBuf {
        self.results_dir.join("failed_jobs.json")
    }

    /// Re-opens the layout of an earlier run directory.
    pub fn open(run_dir: &Path, cfg: &SweepConfig) -> Result<Self> {
        if !run_dir.join("resolved_config.json").is_file() {
            return Err(anyhow!(
                "{} is not a run directory (resolved_config.json missing)",
                run_dir.display()
            ));
        }
        let run_id = run_dir
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("run")
            .to_string();
        Ok(layout_for(run_dir, run_id, cfg))
    }
}

fn layout_for(run_dir: &Path, run_id: String, cfg: &SweepConfig) -> RunLayout {
    RunLayout {
        run_id,
        run_dir: run_dir.to_path_buf(),
        temp_dir: cfg.temp_dir.clone().unwrap_or_else(|| run_dir.join("temp")),
        results_dir: cfg
            .results_dir
            .clone()
            .unwrap_or_else(|| run_dir.join("results")),
        log_dir: cfg.log_dir.clone().unwrap_or_else(|| run_dir.join("log")),
    }
}

/// Creates `run_<timestamp>` under the run root and records the resolved config.
pub fn prepare_run_dir(cfg: &SweepConfig) -> Result<RunLayout> {
    ensure_dir(&cfg.run_root)?;
    let name = format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S"));
    let run_dir = unique_path(&cfg.run_root, &name);
    let run_id = run_dir
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(&name)
        .to_string();
    let layout = layout_for(&run_dir, run_id, cfg);
    for dir in [&layout.run_dir, &layout.temp_dir, &layout.results_dir, &layout.log_dir] {
        ensure_dir(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }

    atomic_write_json_pretty(&layout.resolved_config_path(), &cfg.raw)?;
    atomic_write_bytes(
        &layout.run_dir.join("resolved_config.digest"),
        json_digest(&cfg.raw).as_bytes(),
    )?;
    let manifest = json!({
        "schema_version": "manifest_v1",
        "run_id": layout.run_id,
        "runner_version": env!("CARGO_PKG_VERSION"),
        "created_at": Utc::now().to_rfc3339(),
        "model_name": cfg.model_name,
        "base_dir": cfg.base_dir.to_string_lossy(),
        "co_simulation": cfg.is_co_simulation(),
    });
    atomic_write_json_pretty(&layout.run_dir.join("manifest.json"), &manifest)?;
    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("config.yaml");
        fs::write(&path, body).expect("write config");
        path
    }

    const BASE: &str = r#"
paths:
  package_path: models/Cycle.mo
simulation:
  model_name: Cycle.Plant
  stop_time: 100
  step_size: 1
  variableFilter: "time|sds.I[1-5]|blanket.TBR"
simulation_parameters:
  blanket.TBR: [1.05, 1.1]
  blanket.data_path: not/a/file
engine:
  command: ["sh", "engine.sh"]
co_simulation:
  mode: replacement
  handlers:
    - submodel_name: Cycle.DIV
      instance_name: div
      handler_script_path: handlers/div.sh
      handler_function: run
      params:
        source_path: data/div.csv
        factor: 2
"#;

    #[test]
    fn load_resolves_paths_and_sections() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&write_config(dir.path(), BASE)).expect("config");
        let base = dir.path().canonicalize().expect("canon");
        assert_eq!(cfg.package_path, base.join("models/Cycle.mo"));
        assert_eq!(cfg.run_root, base);
        assert_eq!(cfg.stop_time, 100.0);
        assert!(!cfg.concurrent);
        assert_eq!(cfg.job_warning_threshold, DEFAULT_JOB_WARNING_THRESHOLD);
        let cosim = cfg.co_simulation.as_ref().expect("cosim");
        assert_eq!(cosim.mode, RewriteMode::Replacement);
        let h = &cosim.handlers[0];
        assert_eq!(h.instance_name, "div");
        match &h.handler {
            HandlerRef::Script { path, function } => {
                assert_eq!(path, &base.join("handlers/div.sh"));
                assert_eq!(function, "run");
            }
            other => panic!("unexpected handler {:?}", other),
        }
        let source = base.join("data/div.csv").to_string_lossy().to_string();
        assert_eq!(
            h.params.get("source_path").and_then(Value::as_str),
            Some(source.as_str())
        );
        let params = cfg.parameters();
        assert_eq!(
            params.get("blanket.data_path").and_then(Value::as_str),
            Some("not/a/file")
        );
        let keys: Vec<&String> = params.keys().collect();
        assert_eq!(keys, vec!["blanket.TBR", "blanket.data_path"]);
    }

    #[test]
    fn missing_fields_are_reported_together() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(dir.path(), "simulation:\n  stop_time: 10\n");
        let err = load_config(&path).expect_err("must fail").to_string();
        assert!(err.contains("/paths/package_path"), "{}", err);
        assert!(err.contains("/simulation/model_name"), "{}", err);
        assert!(err.contains("/simulation/variableFilter"), "{}", err);
        assert!(!err.contains("/simulation/stop_time"), "{}", err);
    }

    #[test]
    fn variable_filter_grammar() {
        assert!(validate_variable_filter("time|sds.I[1]|a.b[2-4]|plant.sds.I").is_ok());
        let err = validate_variable_filter("time|sds|a.b[x]").expect_err("bad");
        assert!(err.to_string().contains("'sds'"));
        assert!(err.to_string().contains("'a.b[x]'"));
    }

    #[test]
    fn prepare_run_dir_writes_resolved_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&write_config(dir.path(), BASE)).expect("config");
        let layout = prepare_run_dir(&cfg).expect("layout");
        assert!(layout.run_id.starts_with("run_"));
        assert!(layout.temp_dir.is_dir());
        assert!(layout.results_dir.is_dir());
        assert!(layout.log_dir.is_dir());
        let resolved = crate::fsutil::load_json_file(&layout.resolved_config_path()).expect("json");
        assert_eq!(resolved.pointer("/simulation/model_name"), Some(&json!("Cycle.Plant")));
        assert!(layout.run_dir.join("manifest.json").is_file());

        let reopened = RunLayout::open(&layout.run_dir, &cfg).expect("open");
        assert_eq!(reopened.run_id, layout.run_id);
    }
}
