//! Persisted phased-run state and run heartbeats.
//!
//! The state is written to the flat path `.agents/rpi/phased-state.json` and
//! to the per-run registry `.agents/rpi/runs/<run-id>/phased-state.json`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::atomic::{write_atomic, write_json_atomic};
use super::config::PhasedOptions;
use super::paths::RpiPaths;
use crate::core::complexity::Complexity;
use crate::core::phase::TerminalStatus;

pub const SCHEMA_VERSION: u32 = 1;

/// Orchestrator state persisted between phase spawns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunState {
    pub schema_version: u32,
    pub goal: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<String>,
    pub phase: u32,
    pub start_phase: u32,
    pub cycle: u32,
    pub fast_path: bool,
    pub test_first: bool,
    pub swarm_first: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,
    /// Step name (`pre_mortem`, `vibe`, ...) to verdict.
    pub verdicts: BTreeMap<String, String>,
    /// `phase_<N>` to gate attempt count.
    pub attempts: BTreeMap<String, u32>,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orchestrator_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_status: Option<TerminalStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<String>,
    pub opts: PhasedOptions,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            goal: String::new(),
            epic_id: None,
            phase: 0,
            start_phase: 1,
            cycle: 1,
            fast_path: false,
            test_first: false,
            swarm_first: true,
            complexity: None,
            verdicts: BTreeMap::new(),
            attempts: BTreeMap::new(),
            started_at: String::new(),
            worktree_path: None,
            run_id: String::new(),
            orchestrator_pid: None,
            backend: None,
            terminal_status: None,
            terminal_reason: None,
            terminated_at: None,
            opts: PhasedOptions::default(),
        }
    }
}

impl RunState {
    /// Fresh state for a new run, stamped with the current time.
    pub fn new(goal: &str, start_phase: u32, opts: &PhasedOptions) -> Self {
        Self {
            goal: goal.to_string(),
            start_phase,
            fast_path: opts.fast_path,
            test_first: opts.test_first,
            swarm_first: opts.swarm_first,
            started_at: now_rfc3339(),
            opts: opts.clone(),
            ..Self::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_status.is_some()
    }

    /// Record a terminal status. Returns false (and changes nothing) when one is already set.
    pub fn mark_terminal(&mut self, status: TerminalStatus, reason: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.terminal_status = Some(status);
        self.terminal_reason = Some(reason.into());
        self.terminated_at = Some(now_rfc3339());
        true
    }

    pub fn attempts_for(&self, key: &str) -> u32 {
        self.attempts.get(key).copied().unwrap_or(0)
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Persist to the flat path (errors propagate) and the registry (errors are logged).
pub fn save_run_state(paths: &RpiPaths, state: &RunState) -> Result<()> {
    debug!(run_id = %state.run_id, phase = state.phase, "saving run state");
    write_json_atomic(&paths.state_path, state)
        .with_context(|| format!("write run state {}", paths.state_path.display()))?;
    if !state.run_id.is_empty() {
        let registry = paths.registry_state_path(&state.run_id);
        if let Err(err) = write_json_atomic(&registry, state) {
            warn!(err = %format!("{err:#}"), path = %registry.display(), "registry state write failed");
        }
    }
    Ok(())
}

pub fn load_run_state(path: &Path) -> Result<RunState> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run state {}", path.display()))?;
    let state: RunState = serde_json::from_str(&contents)
        .with_context(|| format!("parse run state {}", path.display()))?;
    Ok(state)
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Registry states paired with their file paths. Unreadable entries are skipped.
pub fn scan_registry(paths: &RpiPaths) -> Vec<(PathBuf, RunState)> {
    let Ok(entries) = fs::read_dir(&paths.runs_dir) else {
        return Vec::new();
    };
    let mut runs = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        if !entry.path().is_dir() {
            continue;
        }
        let state_path = entry.path().join(super::paths::STATE_FILE);
        match load_run_state(&state_path) {
            Ok(state) if !state.run_id.is_empty() => runs.push((state_path, state)),
            Ok(_) => {}
            Err(err) => debug!(err = %format!("{err:#}"), "skipping registry entry"),
        }
    }
    runs.sort_by(|a, b| a.0.cmp(&b.0));
    runs
}

/// Load the most recent state: the newest registry entry by modification time,
/// unless the flat file is newer.
pub fn load_latest_run_state(paths: &RpiPaths) -> Result<RunState> {
    let newest = scan_registry(paths)
        .into_iter()
        .filter_map(|(path, state)| modified(&path).map(|at| (at, state)))
        .max_by_key(|(at, _)| *at);
    let flat_modified = modified(&paths.state_path);

    match (newest, flat_modified) {
        (Some((registry_at, state)), Some(flat_at)) if registry_at >= flat_at => Ok(state),
        (Some((_, state)), None) => Ok(state),
        (_, Some(_)) => load_run_state(&paths.state_path),
        (None, None) => Err(anyhow!(
            "no run state found under {}",
            paths.rpi_dir.display()
        )),
    }
}

/// Stamp the run heartbeat. Best effort.
pub fn write_heartbeat(paths: &RpiPaths, run_id: &str) {
    if run_id.is_empty() {
        return;
    }
    let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
    let path = paths.heartbeat_path(run_id);
    if let Err(err) = write_atomic(&path, format!("{stamp}\n").as_bytes()) {
        warn!(err = %format!("{err:#}"), path = %path.display(), "heartbeat write failed");
    }
}

/// Last heartbeat, or `None` when missing or malformed.
pub fn read_heartbeat(paths: &RpiPaths, run_id: &str) -> Option<DateTime<Utc>> {
    if run_id.is_empty() {
        return None;
    }
    let raw = fs::read_to_string(paths.heartbeat_path(run_id)).ok()?;
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|at| at.with_timezone(&Utc))
}
