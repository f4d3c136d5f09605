use anyhow::Result;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tricys_runner::config::LoggingConfig;

const LOG_PREFIX: &str = "simulation_";

/// Hands out writers sharing one open log file.
#[derive(Clone)]
struct LogWriterFactory {
    file: Arc<Mutex<File>>,
}

struct LogWriter {
    file: Arc<Mutex<File>>,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut file = self.file.lock().unwrap_or_else(|p| p.into_inner());
        file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut file = self.file.lock().unwrap_or_else(|p| p.into_inner());
        file.flush()
    }
}

impl<'a> MakeWriter<'a> for LogWriterFactory {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            file: self.file.clone(),
        }
    }
}

fn filter_for(level: &str) -> EnvFilter {
    let level = match level.to_ascii_lowercase().as_str() {
        "warning" => "warn".to_string(),
        "critical" | "fatal" => "error".to_string(),
        other => other.to_string(),
    };
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tricys={level},tricys_runner={level}")))
}

/// Deletes the oldest `simulation_*.log` files so that at most `keep` remain.
pub fn prune_old_logs(log_dir: &Path, keep: usize) -> std::io::Result<Vec<PathBuf>> {
    let mut logs: Vec<(std::time::SystemTime, PathBuf)> = fs::read_dir(log_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(LOG_PREFIX) && n.ends_with(".log"))
                .unwrap_or(false)
        })
        .filter_map(|p| {
            let modified = fs::metadata(&p).and_then(|m| m.modified()).ok()?;
            Some((modified, p))
        })
        .collect();
    logs.sort();
    let excess = logs.len().saturating_sub(keep);
    let mut removed = Vec::with_capacity(excess);
    for (_, path) in logs.into_iter().take(excess) {
        fs::remove_file(&path)?;
        removed.push(path);
    }
    Ok(removed)
}

/// JSON lines to `<log_dir>/simulation_<run_id>.log`, plus human-readable
/// lines on stderr when `to_console` is set.
pub fn init_run_logging(log_dir: &Path, run_id: &str, config: &LoggingConfig) -> Result<PathBuf> {
    fs::create_dir_all(log_dir)?;
    if let Err(e) = prune_old_logs(log_dir, config.log_count.saturating_sub(1)) {
        eprintln!("warning: failed to prune old logs: {}", e);
    }
    let log_path = log_dir.join(format!("{}{}.log", LOG_PREFIX, run_id));
    let file = OpenOptions::new().create(true).append(true).open(&log_path)?;
    let factory = LogWriterFactory {
        file: Arc::new(Mutex::new(file)),
    };

    let console = config.to_console.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });
    tracing_subscriber::registry()
        .with(filter_for(&config.level))
        .with(
            fmt::layer()
                .json()
                .with_writer(factory)
                .with_ansi(false)
                .with_target(true),
        )
        .with(console)
        .try_init()?;

    tracing::info!(log_path = %log_path.display(), run_id, "logging initialized");
    Ok(log_path)
}

/// Worker processes log to stderr only; the parent keeps that stream in the
/// job's exchange directory.
pub fn init_worker_logging() {
    let _ = tracing_subscriber::registry()
        .with(filter_for("warn"))
        .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false))
        .try_init();
}
