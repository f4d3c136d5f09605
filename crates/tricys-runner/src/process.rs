use crate::dispatch::CancelToken;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct ProcessOutcome {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.status.map(|s| s.success()).unwrap_or(false)
    }

    pub fn exit_label(&self) -> String {
        self.status
            .and_then(|s| s.code())
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string())
    }

    /// Last non-empty stderr line, for error messages.
    pub fn stderr_tail(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .trim()
            .to_string()
    }

    /// Last non-empty stdout line.
    pub fn last_stdout_line(&self) -> Option<&str> {
        self.stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
    }
}

/// Runs `cmd` to completion, killing it when `timeout` elapses or `cancel`
/// fires. Output goes to `<log_stem>.stdout.log` / `.stderr.log` so a stuck
/// grandchild holding a pipe cannot block the supervisor.
pub fn run_supervised(
    mut cmd: Command,
    log_stem: &Path,
    timeout: Option<Duration>,
    cancel: Option<&CancelToken>,
) -> std::io::Result<ProcessOutcome> {
    let stdout_path = with_suffix(log_stem, "stdout.log");
    let stderr_path = with_suffix(log_stem, "stderr.log");
    if let Some(parent) = stdout_path.parent() {
        fs::create_dir_all(parent)?;
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::from(fs::File::create(&stdout_path)?));
    cmd.stderr(Stdio::from(fs::File::create(&stderr_path)?));

    let mut child = cmd.spawn()?;
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break Some(status);
        }
        if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
            timed_out = true;
        } else if cancel.map(CancelToken::is_cancelled).unwrap_or(false) {
            cancelled = true;
        }
        if timed_out || cancelled {
            let _ = child.kill();
            let _ = child.wait();
            break None;
        }
        thread::sleep(POLL_INTERVAL);
    };

    Ok(ProcessOutcome {
        status,
        stdout: fs::read_to_string(&stdout_path).unwrap_or_default(),
        stderr: fs::read_to_string(&stderr_path).unwrap_or_default(),
        timed_out,
        cancelled,
    })
}

fn with_suffix(stem: &Path, suffix: &str) -> PathBuf {
    let name = stem
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "process".to_string());
    stem.with_file_name(format!("{}.{}", name, suffix))
}

pub fn command_part_looks_like_path(part: &str) -> bool {
    part.starts_with('.')
        || part.starts_with('/')
        || part.contains('/')
        || part.ends_with(".py")
        || part.ends_with(".sh")
        || part.ends_with(".js")
}

/// Resolves relative, path-like command parts against `base_dir`.
pub fn resolve_command_local(command: &[String], base_dir: &Path) -> Vec<String> {
    command
        .iter()
        .map(|part| {
            let p = Path::new(part);
            if p.is_relative() && command_part_looks_like_path(part) {
                normalize_path(&base_dir.join(p)).to_string_lossy().to_string()
            } else {
                part.clone()
            }
        })
        .collect()
}

pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Interpreter for a script path chosen by extension; `None` runs it directly.
pub fn interpreter_for(script: &Path) -> Option<&'static str> {
    match script.extension().and_then(|e| e.to_str()) {
        Some("py") => Some("python3"),
        Some("sh") => Some("sh"),
        Some("js") | Some("mjs") => Some("node"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_command_local_resolves_path_like_parts() {
        let root = PathBuf::from("/tmp/tricys_proj");
        let cmd = vec!["sh".to_string(), "./engine/run.sh".to_string(), "--fast".to_string()];
        let resolved = resolve_command_local(&cmd, &root);
        assert_eq!(resolved, vec!["sh", "/tmp/tricys_proj/engine/run.sh", "--fast"]);
    }

    #[test]
    fn interpreter_is_chosen_by_extension() {
        assert_eq!(interpreter_for(Path::new("h/div.py")), Some("python3"));
        assert_eq!(interpreter_for(Path::new("h/div.sh")), Some("sh"));
        assert_eq!(interpreter_for(Path::new("h/div")), None);
    }

    #[cfg(unix)]
    #[test]
    fn supervised_process_captures_output_and_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo hello; echo oops >&2");
        let out = run_supervised(cmd, &dir.path().join("echo"), None, None).expect("run");
        assert!(out.success());
        assert_eq!(out.last_stdout_line(), Some("hello"));
        assert_eq!(out.stderr_tail(), "oops");

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exec sleep 5");
        let started = Instant::now();
        let out = run_supervised(cmd, &dir.path().join("sleep"), Some(Duration::from_millis(200)), None)
            .expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn cancellation_kills_the_child() {
        let dir = tempfile::tempdir().expect("tempdir");
        let token = CancelToken::new();
        token.cancel();
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exec sleep 5");
        let out = run_supervised(cmd, &dir.path().join("cancel"), None, Some(&token)).expect("run");
        assert!(out.cancelled);
    }
}
