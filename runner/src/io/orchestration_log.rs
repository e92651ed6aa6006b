//! Append-only orchestration log (`phased-orchestration.log`).
//!
//! One line per event: `<RFC3339> run=<id> phase=<name> <details>`. This is a
//! product artifact independent of `RUST_LOG`; write failures are swallowed.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use super::run_state::now_rfc3339;

/// Directory hint appended to failure context lines.
const FAILURE_ACTION: &str =
    "check .agents/rpi/ for phase artifacts, review .agents/council/ for verdicts";

#[derive(Debug, Clone)]
pub struct OrchestrationLog {
    path: PathBuf,
}

impl OrchestrationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event line. Never fails.
    pub fn log(&self, run_id: &str, phase: &str, details: &str) {
        let line = format_line(&now_rfc3339(), run_id, phase, details);
        if let Err(err) = self.append(&line) {
            warn!(err = %format!("{err:#}"), path = %self.path.display(), "orchestration log write failed");
        }
    }

    /// Record an error together with where to look for evidence.
    pub fn log_failure_context(&self, run_id: &str, phase: &str, err: &anyhow::Error) {
        self.log(
            run_id,
            phase,
            &format!("FAILURE_CONTEXT: {err:#} | action: {FAILURE_ACTION}"),
        );
    }

    fn append(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", self.path.display()))
    }
}

fn format_line(timestamp: &str, run_id: &str, phase: &str, details: &str) -> String {
    let run_id = if run_id.is_empty() { "-" } else { run_id };
    let details = details.replace('\n', " ");
    format!("{timestamp} run={run_id} phase={phase} {details}\n")
}
