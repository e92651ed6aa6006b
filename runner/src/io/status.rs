//! Run status derived from the registry, heartbeats and terminal metadata.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::config::format_duration;
use super::paths::RpiPaths;
use super::run_state::{RunState, load_run_state, read_heartbeat, scan_registry};
use crate::core::phase::{ALL_PHASES, Phase};

/// A heartbeat younger than this marks a run as alive.
pub const HEARTBEAT_LIVE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// One run as shown by `rpi status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInfo {
    pub run_id: String,
    pub goal: String,
    pub phase: u32,
    pub phase_name: String,
    pub status: String,
    pub reason: String,
    pub epic_id: Option<String>,
    pub worktree: Option<PathBuf>,
    pub started_at: String,
    pub elapsed: Option<Duration>,
    pub is_active: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

fn worktree_missing(state: &RunState) -> bool {
    state
        .worktree_path
        .as_deref()
        .is_some_and(|path| !path.exists())
}

/// A run is alive when its worktree (if any) exists and its heartbeat is fresh.
pub fn determine_liveness(paths: &RpiPaths, state: &RunState, now: DateTime<Utc>) -> (bool, Option<DateTime<Utc>>) {
    let heartbeat = read_heartbeat(paths, &state.run_id);
    if worktree_missing(state) {
        return (false, heartbeat);
    }
    let fresh = heartbeat.is_some_and(|at| {
        now.signed_duration_since(at)
            .to_std()
            .map_or(true, |age| age < HEARTBEAT_LIVE_THRESHOLD)
    });
    (fresh, heartbeat)
}

/// Phase number at which a non-terminal run counts as finished.
pub fn completed_phase_number() -> u32 {
    ALL_PHASES.len() as u32
}

/// Terminal status, then `running`, `completed`, `stale` (worktree gone) or `unknown`.
pub fn classify_run_status(state: &RunState, is_active: bool) -> String {
    if let Some(status) = state.terminal_status {
        return status.as_str().to_string();
    }
    if is_active {
        return "running".to_string();
    }
    if state.phase >= completed_phase_number() {
        return "completed".to_string();
    }
    if worktree_missing(state) {
        return "stale".to_string();
    }
    "unknown".to_string()
}

pub fn classify_run_reason(state: &RunState, is_active: bool) -> String {
    if let Some(reason) = state.terminal_reason.as_deref().filter(|r| !r.is_empty()) {
        return reason.to_string();
    }
    if !is_active && worktree_missing(state) {
        return "worktree missing".to_string();
    }
    String::new()
}

pub fn display_phase_name(phase: u32) -> String {
    Phase::from_number(phase)
        .map(|p| p.name().to_string())
        .unwrap_or_else(|| format!("phase-{phase}"))
}

pub fn run_info(paths: &RpiPaths, state: &RunState, now: DateTime<Utc>) -> RunInfo {
    let (is_active, last_heartbeat) = determine_liveness(paths, state, now);
    let elapsed = DateTime::parse_from_rfc3339(&state.started_at)
        .ok()
        .and_then(|at| now.signed_duration_since(at.with_timezone(&Utc)).to_std().ok())
        .map(|d| Duration::from_secs(d.as_secs()));
    RunInfo {
        run_id: state.run_id.clone(),
        goal: state.goal.clone(),
        phase: state.phase,
        phase_name: display_phase_name(state.phase),
        status: classify_run_status(state, is_active),
        reason: classify_run_reason(state, is_active),
        epic_id: state.epic_id.clone(),
        worktree: state.worktree_path.clone(),
        started_at: state.started_at.clone(),
        elapsed,
        is_active,
        last_heartbeat,
    }
}

/// All registry runs under `root`, most recently started first.
pub fn collect_runs(root: &Path, now: DateTime<Utc>) -> Vec<RunInfo> {
    let paths = RpiPaths::new(root);
    let mut runs: Vec<RunInfo> = scan_registry(&paths)
        .iter()
        .map(|(_, state)| run_info(&paths, state, now))
        .collect();
    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    runs
}

/// The latest run: newest registry entry by start time, else the flat state file.
pub fn latest_run(root: &Path, now: DateTime<Utc>) -> Option<RunInfo> {
    if let Some(run) = collect_runs(root, now).into_iter().next() {
        return Some(run);
    }
    let paths = RpiPaths::new(root);
    let state = load_run_state(&paths.state_path).ok()?;
    if state.run_id.is_empty() {
        return None;
    }
    Some(run_info(&paths, &state, now))
}

/// Plain-text report for one run.
pub fn render_run(run: &RunInfo) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Run:       {}", run.run_id);
    let _ = writeln!(out, "Goal:      {}", run.goal);
    let _ = writeln!(out, "Phase:     {} ({})", run.phase, run.phase_name);
    let _ = writeln!(out, "Status:    {}", run.status);
    if !run.reason.is_empty() {
        let _ = writeln!(out, "Reason:    {}", run.reason);
    }
    if let Some(epic) = run.epic_id.as_deref().filter(|e| !e.is_empty()) {
        let _ = writeln!(out, "Epic:      {epic}");
    }
    if let Some(worktree) = &run.worktree {
        let _ = writeln!(out, "Worktree:  {}", worktree.display());
    }
    if let Some(elapsed) = run.elapsed {
        let _ = writeln!(out, "Elapsed:   {}", format_duration(elapsed));
    }
    let heartbeat = run
        .last_heartbeat
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    let _ = writeln!(out, "Heartbeat: {heartbeat}");
    out
}
