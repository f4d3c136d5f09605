use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn load_json_file(path: &Path) -> Result<Value> {
    let data = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

pub fn json_digest(value: &Value) -> String {
    sha256_bytes(&serde_json::to_vec(value).unwrap_or_default())
}

/// `dir/stem.ext`, or the first free `dir/stem_N.ext`.
pub fn unique_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() => (s, Some(e)),
        _ => (file_name, None),
    };
    (1..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{}_{}.{}", stem, n, ext)),
            None => dir.join(format!("{}_{}", stem, n)),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Recursive copy. Entries whose path relative to `src` starts with one of
/// `exclude` are skipped.
pub fn copy_dir_filtered(src: &Path, dst: &Path, exclude: &[&str]) -> std::io::Result<()> {
    let walker = walkdir::WalkDir::new(src).into_iter().filter_entry(|e| {
        let rel = e.path().strip_prefix(src).unwrap_or(e.path());
        if rel.as_os_str().is_empty() {
            return true;
        }
        !exclude.iter().any(|ex| rel.starts_with(ex))
    });
    ensure_dir(dst)?;
    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(src) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            // follows symlinks; broken links are skipped
            match fs::metadata(path) {
                Ok(meta) if meta.is_file() => {
                    fs::copy(path, &target)?;
                }
                Ok(meta) if meta.is_dir() => copy_dir_filtered(path, &target, &[])?,
                _ => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_path_appends_counter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = unique_path(dir.path(), "sweep_results.csv");
        assert_eq!(first, dir.path().join("sweep_results.csv"));
        fs::write(&first, "x").expect("write");
        let second = unique_path(dir.path(), "sweep_results.csv");
        assert_eq!(second, dir.path().join("sweep_results_1.csv"));
        fs::write(&second, "x").expect("write");
        assert_eq!(
            unique_path(dir.path(), "sweep_results.csv"),
            dir.path().join("sweep_results_2.csv")
        );
    }

    #[test]
    fn copy_dir_filtered_skips_excluded_entries() {
        let src = tempfile::tempdir().expect("src");
        let dst = tempfile::tempdir().expect("dst");
        fs::create_dir_all(src.path().join("Pkg/Sub")).expect("mkdir");
        fs::write(src.path().join("Pkg/package.mo"), "package Pkg end Pkg;").expect("write");
        fs::write(src.path().join("Pkg/Sub/A.mo"), "model A end A;").expect("write");
        fs::create_dir_all(src.path().join(".git")).expect("mkdir");
        fs::write(src.path().join(".git/HEAD"), "ref").expect("write");
        copy_dir_filtered(src.path(), dst.path(), &[".git"]).expect("copy");
        assert!(dst.path().join("Pkg/Sub/A.mo").is_file());
        assert!(!dst.path().join(".git").exists());
    }

    #[test]
    fn atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/out.json");
        atomic_write_json_pretty(&path, &serde_json::json!({"ok": true})).expect("write");
        atomic_write_bytes(&path, b"{}").expect("rewrite");
        assert_eq!(fs::read_to_string(&path).expect("read"), "{}");
        assert!(sha256_bytes(b"{}").starts_with("sha256:"));
    }
}
