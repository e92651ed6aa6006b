//! Canonical artifact paths under `.agents/rpi/`.

use std::path::{Path, PathBuf};

use crate::core::phase::Phase;

pub const STATE_FILE: &str = "phased-state.json";
pub const HEARTBEAT_FILE: &str = "heartbeat.txt";
pub const ORCHESTRATION_LOG_FILE: &str = "phased-orchestration.log";
pub const LIVE_STATUS_FILE: &str = "live-status.md";
pub const QUEUE_FILE: &str = "next-work.jsonl";
pub const CONFIG_FILE: &str = "config.toml";

/// All canonical paths within `.agents/rpi/` for a root directory.
///
/// The same layout is used for the original checkout (state, log, queue,
/// lease) and for a run's worktree (phase results, summaries, live status).
#[derive(Debug, Clone)]
pub struct RpiPaths {
    pub root: PathBuf,
    pub agents_dir: PathBuf,
    pub rpi_dir: PathBuf,
    pub council_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub state_path: PathBuf,
    pub log_path: PathBuf,
    pub live_status_path: PathBuf,
    pub queue_path: PathBuf,
    pub config_path: PathBuf,
}

impl RpiPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let agents_dir = root.join(".agents");
        let rpi_dir = agents_dir.join("rpi");
        Self {
            root: root.clone(),
            council_dir: agents_dir.join("council"),
            runs_dir: rpi_dir.join("runs"),
            state_path: rpi_dir.join(STATE_FILE),
            log_path: rpi_dir.join(ORCHESTRATION_LOG_FILE),
            live_status_path: rpi_dir.join(LIVE_STATUS_FILE),
            queue_path: rpi_dir.join(QUEUE_FILE),
            config_path: rpi_dir.join(CONFIG_FILE),
            agents_dir,
            rpi_dir,
        }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    pub fn registry_state_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(STATE_FILE)
    }

    pub fn heartbeat_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(HEARTBEAT_FILE)
    }

    pub fn phase_result_path(&self, phase: Phase) -> PathBuf {
        self.rpi_dir
            .join(format!("phase-{}-result.json", phase.number()))
    }

    pub fn phase_summary_path(&self, phase: Phase) -> PathBuf {
        self.rpi_dir
            .join(format!("phase-{}-summary.md", phase.number()))
    }

    pub fn phase_handoff_path(&self, phase: Phase) -> PathBuf {
        self.rpi_dir
            .join(format!("phase-{}-handoff.md", phase.number()))
    }
}

/// Resolve `path` against `base` unless it is already absolute.
pub fn resolve_against(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
