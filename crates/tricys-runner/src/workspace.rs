use crate::error::{JobError, JobResult};
use crate::fsutil::{copy_dir_filtered, ensure_dir};
use crate::jobs::Job;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const COPY_EXCLUDES: &[&str] = &[".git", "__pycache__", ".venv", "target"];

/// Whether jobs get their own copy of the model package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationPolicy {
    /// One directory reused by every job; the package is used in place.
    Shared,
    /// A fresh directory holding a private copy of the package per job.
    PerJob,
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    policy: IsolationPolicy,
    root: PathBuf,
    package_path: PathBuf,
    assets: Vec<PathBuf>,
}

impl WorkspaceManager {
    pub fn new(policy: IsolationPolicy, root: &Path, package_path: &Path) -> Self {
        Self {
            policy,
            root: root.to_path_buf(),
            package_path: package_path.to_path_buf(),
            assets: Vec::new(),
        }
    }

    /// Extra files or directories copied into every per-job workspace.
    pub fn with_assets(mut self, assets: Vec<PathBuf>) -> Self {
        self.assets = assets;
        self
    }

    pub fn policy(&self) -> IsolationPolicy {
        self.policy
    }

    pub fn acquire(&self, job: &Job) -> JobResult<Workspace> {
        match self.policy {
            IsolationPolicy::Shared => {
                let root = self.root.join("shared");
                ensure_dir(&root).map_err(|e| setup_err(&root, e))?;
                Ok(Workspace {
                    root,
                    package_path: self.package_path.clone(),
                    owned: false,
                    released: false,
                    job_index: job.index,
                })
            }
            IsolationPolicy::PerJob => self.acquire_isolated(job),
        }
    }

    fn acquire_isolated(&self, job: &Job) -> JobResult<Workspace> {
        ensure_dir(&self.root).map_err(|e| setup_err(&self.root, e))?;
        let root = create_unique_dir(&self.root, &job.id())?;
        // the guard removes the half-built directory if a copy fails
        let mut ws = Workspace {
            root,
            package_path: PathBuf::new(),
            owned: true,
            released: false,
            job_index: job.index,
        };
        ws.package_path = copy_package(&self.package_path, &ws.root)?;
        for asset in &self.assets {
            ws.import_file_or_dir(asset)?;
        }
        debug!(job_index = job.index, workspace = %ws.root.display(), "workspace acquired");
        Ok(ws)
    }

    /// Releases the workspace. Deletion failures are logged and swallowed.
    pub fn release(&self, mut workspace: Workspace, keep: bool) {
        if keep || !workspace.owned {
            workspace.released = true;
            return;
        }
        workspace.remove();
    }
}

/// A job's working directory. Dropping an unreleased, owned workspace removes it.
#[derive(Debug)]
pub struct Workspace {
    pub root: PathBuf,
    pub package_path: PathBuf,
    owned: bool,
    released: bool,
    job_index: usize,
}

impl Workspace {
    pub fn is_isolated(&self) -> bool {
        self.owned
    }

    /// Copies the directory holding `file` into `assets/` and returns the
    /// file's path inside the workspace. Siblings come along so relative
    /// references between assets keep working.
    pub fn import_asset(&self, file: &Path) -> JobResult<PathBuf> {
        let parent = file.parent().unwrap_or(Path::new("."));
        let name = file
            .file_name()
            .ok_or_else(|| JobError::WorkspaceSetup(format!("asset {} has no file name", file.display())))?;
        let dir_name = parent
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "root".into());
        let target_dir = self.root.join("assets").join(dir_name);
        if !target_dir.exists() {
            copy_dir_filtered(parent, &target_dir, COPY_EXCLUDES)
                .map_err(|e| setup_err(parent, e))?;
        }
        Ok(target_dir.join(name))
    }

    fn import_file_or_dir(&self, src: &Path) -> JobResult<PathBuf> {
        let name = src
            .file_name()
            .ok_or_else(|| JobError::WorkspaceSetup(format!("asset {} has no file name", src.display())))?;
        let target = self.root.join(name);
        if src.is_dir() {
            copy_dir_filtered(src, &target, COPY_EXCLUDES).map_err(|e| setup_err(src, e))?;
        } else {
            fs::copy(src, &target).map_err(|e| setup_err(src, e))?;
        }
        Ok(target)
    }

    fn remove(&mut self) {
        self.released = true;
        if let Err(e) = fs::remove_dir_all(&self.root) {
            warn!(
                job_index = self.job_index,
                workspace = %self.root.display(),
                error = %e,
                "failed to remove workspace"
            );
        } else {
            debug!(job_index = self.job_index, workspace = %self.root.display(), "workspace removed");
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.owned && !self.released {
            self.remove();
        }
    }
}

fn setup_err(path: &Path, err: std::io::Error) -> JobError {
    JobError::WorkspaceSetup(format!("{}: {}", path.display(), err))
}

fn create_unique_dir(parent: &Path, base: &str) -> JobResult<PathBuf> {
    for n in 0.. {
        let candidate = if n == 0 {
            parent.join(base)
        } else {
            parent.join(format!("{}_{}", base, n))
        };
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(setup_err(&candidate, e)),
        }
    }
    Err(JobError::WorkspaceSetup(format!(
        "no free workspace name under {}",
        parent.display()
    )))
}

/// Copies the model package into `dest` and returns the copied entry file.
/// A multi-file package (`package.mo` or a directory) is copied whole; a
/// single-file package is copied on its own.
fn copy_package(package_path: &Path, dest: &Path) -> JobResult<PathBuf> {
    let src_dir = if package_path.is_dir() {
        package_path.to_path_buf()
    } else if package_path.file_name().and_then(|n| n.to_str()) == Some("package.mo") {
        package_path.parent().unwrap_or(Path::new(".")).to_path_buf()
    } else {
        let name = package_path.file_name().ok_or_else(|| {
            JobError::WorkspaceSetup(format!("package path {} has no file name", package_path.display()))
        })?;
        let target = dest.join(name);
        fs::copy(package_path, &target).map_err(|e| setup_err(package_path, e))?;
        return Ok(target);
    };
    let dir_name = src_dir
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "package".into());
    let target_dir = dest.join(dir_name);
    copy_dir_filtered(&src_dir, &target_dir, COPY_EXCLUDES).map_err(|e| setup_err(&src_dir, e))?;
    Ok(target_dir.join("package.mo"))
}
