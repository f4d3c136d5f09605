use serde_json::Value;
use std::fs;
use std::path::Path;
use std::process::Command;

fn tricys(args: &[&str], cwd: &Path) -> (i32, Value) {
    let out = Command::new(env!("CARGO_BIN_EXE_tricys"))
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("spawn tricys");
    let stdout = String::from_utf8_lossy(&out.stdout);
    let last = stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or_else(|| panic!("no stdout; stderr: {}", String::from_utf8_lossy(&out.stderr)));
    let payload: Value = serde_json::from_str(last).expect("json payload");
    (out.status.code().unwrap_or(-1), payload)
}

fn write_package(dir: &Path) {
    let pkg = dir.join("Cycle");
    fs::create_dir_all(&pkg).expect("mkdir");
    fs::write(pkg.join("package.mo"), "package Cycle\nend Cycle;\n").expect("package.mo");
    fs::write(
        pkg.join("DIV.mo"),
        "within Cycle;\nmodel DIV\n  Modelica.Blocks.Interfaces.RealInput from_plasma;\n  Modelica.Blocks.Interfaces.RealOutput to_CL;\nequation\n  to_CL = from_plasma;\nend DIV;\n",
    )
    .expect("DIV.mo");
    fs::write(
        pkg.join("Plant.mo"),
        "within Cycle;\nmodel Plant\n  Cycle.Pulse plasma;\n  Cycle.DIV div;\n  Cycle.CL cl;\nequation\n  connect(plasma.y, div.from_plasma);\n  connect(div.to_CL, cl.from_DIV);\nend Plant;\n",
    )
    .expect("Plant.mo");
}

const IDENTITY_ENGINE: &str = r#"x=$(sed -n 's/^a\.x=//p' "$TRICYS_SIM_PARAMS")
y=$(sed -n 's/^a\.y=//p' "$TRICYS_SIM_PARAMS")
v=$((x + y))
printf 'time,a.out\n0,%s\n1,%s\n' "$v" "$v" > "$TRICYS_SIM_RESULT"
"#;

const SWEEP_CONFIG: &str = r#"paths:
  package_path: Cycle/package.mo
simulation:
  model_name: Cycle.Plant
  stop_time: 1
  step_size: 1
  variableFilter: "time|a.out"
engine:
  command: ["sh", "engine.sh"]
logging:
  log_to_console: false
simulation_parameters:
  a.x: [1, 2]
  a.y: [10, 20]
"#;

#[test]
fn describe_counts_linspace_jobs() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_package(dir.path());
    let config = SWEEP_CONFIG.replace(
        "  a.x: [1, 2]\n  a.y: [10, 20]\n",
        "  a.x: \"linspace:0:10:3\"\n",
    );
    fs::write(dir.path().join("sweep.yaml"), config).expect("config");
    let (code, payload) = tricys(&["describe", "sweep.yaml", "--json"], dir.path());
    assert_eq!(code, 0, "{}", payload);
    assert_eq!(payload["ok"], true);
    assert_eq!(payload["summary"]["total_jobs"], 3);
    assert_eq!(payload["summary"]["swept_parameters"][0], "a.x");
}

#[test]
fn invalid_config_reports_json_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(
        dir.path().join("bad.yaml"),
        "paths:\n  package_path: Cycle/package.mo\nsimulation:\n  stop_time: 1\n",
    )
    .expect("config");
    let (code, payload) = tricys(&["run", "bad.yaml", "--json"], dir.path());
    assert_eq!(code, 1);
    assert_eq!(payload["ok"], false);
    let message = payload["error"]["message"].as_str().expect("message");
    assert!(message.contains("/simulation/model_name"), "{}", message);
}

#[cfg(unix)]
#[test]
fn cartesian_sweep_writes_renamed_columns() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_package(dir.path());
    fs::write(dir.path().join("engine.sh"), IDENTITY_ENGINE).expect("engine");
    fs::write(dir.path().join("sweep.yaml"), SWEEP_CONFIG).expect("config");

    let (code, payload) = tricys(&["run", "sweep.yaml", "--json"], dir.path());
    assert_eq!(code, 0, "{}", payload);
    let report = &payload["report"];
    assert_eq!(report["total_jobs"], 4);
    assert_eq!(report["succeeded"], 4);
    assert_eq!(report["failed"], 0);

    let results = report["result_path"].as_str().expect("result path");
    assert!(results.ends_with("sweep_results.csv"));
    let text = fs::read_to_string(results).expect("results");
    let mut lines = text.lines();
    assert_eq!(
        lines.next().expect("header"),
        "time,a.out&a.x=1&a.y=10,a.out&a.x=1&a.y=20,a.out&a.x=2&a.y=10,a.out&a.x=2&a.y=20"
    );
    assert_eq!(lines.next().expect("row"), "0,11,21,12,22");

    let run_dir = Path::new(report["run_dir"].as_str().expect("run dir"));
    assert!(run_dir.join("resolved_config.json").is_file());
    assert!(payload["log_path"].as_str().expect("log").ends_with(".log"));
}

const COSIM_ENGINE: &str = r#"x=$(sed -n 's/^plasma\.fb=//p' "$TRICYS_SIM_PARAMS")
case "$TRICYS_VARIABLE_FILTER" in
  *from_plasma*)
    printf 'time,div.from_plasma\n0,%s\n1,%s\n' "$x" "$x" > "$TRICYS_SIM_RESULT"
    ;;
  *)
    v=-1
    pkg_dir=$(dirname "$TRICYS_PACKAGE_PATH")
    case "$TRICYS_MODEL_NAME" in
      *_Intercepted) [ -f "$pkg_dir/Plant_Intercepted.mo" ] && [ -f "$pkg_dir/DIV_Interceptor.mo" ] && v=$x ;;
    esac
    printf 'time,sds.inventory\n0,%s\n1,%s\n' "$v" "$v" > "$TRICYS_SIM_RESULT"
    ;;
esac
"#;

const RAISING_HANDLER: &str = r#"if grep -q ',2$' "$TRICYS_HANDLER_INPUT"; then
  echo "ValueError: pulse 2 rejected" >&2
  exit 1
fi
printf 'time,y\n0,5\n1,5\n' > "$TRICYS_HANDLER_OUTPUT"
echo '{"to_CL": "{1,2}"}'
"#;

const COSIM_CONFIG: &str = r#"paths:
  package_path: Cycle/package.mo
simulation:
  model_name: Cycle.Plant
  stop_time: 1
  step_size: 1
  variableFilter: "time|sds.inventory"
  concurrent: true
  max_workers: 2
engine:
  command: ["sh", "engine.sh"]
logging:
  log_to_console: false
simulation_parameters:
  plasma.fb: [1, 2, 3]
co_simulation:
  mode: interceptor
  handlers:
    - submodel_name: Cycle.DIV
      instance_name: div
      handler_script_path: handlers/div.sh
      handler_function: run
"#;

#[cfg(unix)]
#[test]
fn raising_handler_fails_only_its_job_in_the_process_pool() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_package(dir.path());
    fs::create_dir_all(dir.path().join("handlers")).expect("mkdir");
    fs::write(dir.path().join("handlers/div.sh"), RAISING_HANDLER).expect("handler");
    fs::write(dir.path().join("engine.sh"), COSIM_ENGINE).expect("engine");
    fs::write(dir.path().join("cosim.yaml"), COSIM_CONFIG).expect("config");

    let (code, payload) = tricys(&["run", "cosim.yaml", "--json"], dir.path());
    assert_eq!(code, 0, "{}", payload);
    let report = &payload["report"];
    assert_eq!(report["strategy"], "Processes(2)");
    assert_eq!(report["succeeded"], 2);
    assert_eq!(report["failed"], 1);

    let failed: Value = serde_json::from_str(
        &fs::read_to_string(report["failed_jobs_path"].as_str().expect("path")).expect("failed"),
    )
    .expect("json");
    assert_eq!(failed[0]["job_index"], 1);
    assert_eq!(failed[0]["error_kind"], "HandlerExecutionError");
    assert!(failed[0]["message"].as_str().expect("msg").contains("pulse 2 rejected"));

    let text = fs::read_to_string(report["result_path"].as_str().expect("results")).expect("read");
    let mut lines = text.lines();
    assert_eq!(
        lines.next().expect("header"),
        "time,sds.inventory&plasma.fb=1,sds.inventory&plasma.fb=3"
    );
    assert_eq!(lines.next().expect("row"), "0,1,3");

    // the user's package is never rewritten
    assert!(!dir.path().join("Cycle/Plant_Intercepted.mo").exists());
}

#[test]
fn restore_without_backup_is_a_no_op() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_package(dir.path());
    let (code, payload) = tricys(&["restore", "Cycle/DIV.mo", "--json"], dir.path());
    assert_eq!(code, 0, "{}", payload);
    assert_eq!(payload["restored"], false);
}
