//! Atomic file replacement (temp file in the same directory + fsync + rename).

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}

/// Replace `path` with `contents`. The temp file never survives, success or failure.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;

    let tmp_path = tmp_path_for(path);
    let result = write_and_rename(&tmp_path, path, contents);
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn write_and_rename(tmp_path: &Path, path: &Path, contents: &[u8]) -> Result<()> {
    let mut file =
        File::create(tmp_path).with_context(|| format!("create temp {}", tmp_path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("write temp {}", tmp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync temp {}", tmp_path.display()))?;
    drop(file);
    fs::rename(tmp_path, path).with_context(|| format!("replace {}", path.display()))
}

/// Pretty JSON with a trailing newline, written atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}
