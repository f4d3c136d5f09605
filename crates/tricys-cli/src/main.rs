mod logging;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use tricys_runner::config::RunLayout;
use tricys_runner::{SweepOptions, SweepReport, SweepSummary};

#[derive(Parser)]
#[command(name = "tricys", version, about = "Parameter sweeps and co-simulation for fuel-cycle models")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every job of a sweep config.
    Run {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Validate a config and show the job plan without simulating.
    Describe {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Re-run the failed jobs of an earlier run.
    Retry {
        #[arg(long)]
        run_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Undo a replacement-mode rewrite from its `.bak`.
    Restore {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        request: PathBuf,
        #[arg(long)]
        outcome: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn sweep_options() -> SweepOptions {
    SweepOptions {
        worker_program: std::env::current_exe().ok(),
        ..SweepOptions::default()
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run { config, json } => {
            let cfg = tricys_runner::load_config(&config)?;
            let layout = tricys_runner::prepare_run_dir(&cfg)?;
            let log_path = logging::init_run_logging(&layout.log_dir, &layout.run_id, &cfg.logging)?;
            let report = tricys_runner::run_sweep(&cfg, &layout, &sweep_options())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "report": report.to_json(),
                    "log_path": log_path.display().to_string(),
                })));
            }
            print_report(&report);
        }
        Commands::Describe { config, json } => {
            let cfg = tricys_runner::load_config(&config)?;
            let summary = tricys_runner::describe_sweep(&cfg)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary_to_json(&summary),
                })));
            }
            print_summary(&summary);
        }
        Commands::Retry { run_dir, json } => {
            let cfg = tricys_runner::load_run_config(&run_dir)?;
            let layout = RunLayout::open(&run_dir, &cfg)?;
            logging::init_run_logging(&layout.log_dir, &format!("{}_retry", layout.run_id), &cfg.logging)?;
            let report = tricys_runner::retry_failed(&run_dir, &sweep_options())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "retry",
                    "report": report.to_json(),
                })));
            }
            print_report(&report);
        }
        Commands::Restore { file, json } => {
            let restored = tricys_runner::rewrite::restore_backup(&file)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "restore",
                    "file": file.display().to_string(),
                    "restored": restored,
                })));
            }
            if restored {
                println!("restored: {}", file.display());
            } else {
                println!("no backup found for {}", file.display());
            }
        }
        Commands::Worker { request, outcome } => {
            logging::init_worker_logging();
            tricys_runner::run_worker(&request, &outcome)?;
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Retry { json, .. }
        | Commands::Restore { json, .. } => *json,
        Commands::Worker { .. } => false,
    }
}

fn summary_to_json(summary: &SweepSummary) -> Value {
    json!({
        "model_name": summary.model_name,
        "package_path": summary.package_path.display().to_string(),
        "total_jobs": summary.total_jobs,
        "swept_parameters": summary.swept_parameters,
        "goals": summary.goals,
        "co_simulation": summary.co_simulation,
        "rewrite_mode": summary.rewrite_mode.map(|m| m.to_string()),
        "handlers": summary.handlers,
        "strategy": format!("{:?}", summary.strategy),
        "warning": summary.warning,
    })
}

fn print_summary(summary: &SweepSummary) {
    println!("model: {}", summary.model_name);
    println!("package: {}", summary.package_path.display());
    println!("jobs: {}", summary.total_jobs);
    if !summary.swept_parameters.is_empty() {
        println!("parameters: {}", summary.swept_parameters.join(", "));
    }
    for goal in &summary.goals {
        println!("goal: {}", goal);
    }
    if let Some(mode) = summary.rewrite_mode {
        println!("co_simulation: {}", mode);
        for h in &summary.handlers {
            println!("  handler: {}", h);
        }
    }
    println!("strategy: {:?}", summary.strategy);
    if let Some(w) = &summary.warning {
        println!("warning: {}", w);
    }
}

fn print_report(report: &SweepReport) {
    println!("run_id: {}", report.run_id);
    println!("run_dir: {}", report.run_dir.display());
    println!(
        "jobs: {} succeeded, {} failed ({} cancelled) of {}",
        report.succeeded,
        report.failed.len(),
        report.cancelled,
        report.total_jobs
    );
    if let Some(p) = &report.result_path {
        println!("results: {}", p.display());
    }
    if let Some(p) = &report.goal_summary_path {
        println!("goal_seek_summary: {}", p.display());
    }
    for f in &report.failed {
        println!("failed: job_{} [{}] {}", f.job_index, f.error_kind, f.message);
    }
    if !report.failed.is_empty() {
        println!("failed_jobs: {}", report.failed_jobs_path.display());
    }
}
