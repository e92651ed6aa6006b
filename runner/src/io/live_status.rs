//! `live-status.md`: a markdown progress table refreshed as phases run.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use chrono::Local;
use tracing::debug;

use super::atomic::write_atomic;
use super::config::format_duration;
use super::stream_events::{PhaseProgress, summarize_action, truncate_chars};
use crate::core::phase::{ALL_PHASES, Phase};

const FIELD_MAX: usize = 72;

/// Render the table; phases before `current` are done, after it pending.
pub fn render_live_status(phases: &[PhaseProgress], current: usize) -> String {
    let mut out = String::from("# Live Status\n\n");
    out.push_str("| Phase | Status | Elapsed | Tools | Tokens | Cost | Action | Retries | Last Error | Updated |\n");
    out.push_str("|-------|--------|---------|-------|--------|------|--------|---------|------------|---------|\n");
    for (idx, p) in phases.iter().enumerate() {
        let status = match idx.cmp(&current) {
            std::cmp::Ordering::Less => "done",
            std::cmp::Ordering::Equal => "running",
            std::cmp::Ordering::Greater => "pending",
        };
        let updated = p
            .last_update
            .map(|at| at.with_timezone(&Local).format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} | ${:.4} | {} | {} | {} | {} |\n",
            p.name,
            status,
            format_duration(p.elapsed),
            p.tool_count,
            p.tokens,
            p.cost_usd,
            normalize_field(&p.current_action),
            p.retry_count,
            normalize_field(&p.last_error),
            updated,
        ));
    }
    out
}

fn normalize_field(text: &str) -> String {
    let value = text.replace('|', "/");
    let value = value.trim();
    if value.is_empty() {
        return "-".to_string();
    }
    truncate_chars(value, FIELD_MAX)
}

pub fn write_live_status(path: &Path, phases: &[PhaseProgress], current: usize) -> Result<()> {
    write_atomic(path, render_live_status(phases, current).as_bytes())
}

/// Shared progress for all phases plus the status file it renders to.
///
/// Cloned into the stream executor; the phase runner uses it to record retries.
#[derive(Debug, Clone)]
pub struct LiveStatus {
    path: PathBuf,
    phases: Arc<Mutex<Vec<PhaseProgress>>>,
}

impl LiveStatus {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let phases = ALL_PHASES
            .iter()
            .map(|phase| PhaseProgress::named(phase.name()))
            .collect();
        Self {
            path: path.into(),
            phases: Arc::new(Mutex::new(phases)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the table with `phase` marked running.
    pub fn write(&self, phase: Phase) -> Result<()> {
        let phases = self
            .phases
            .lock()
            .map_err(|_| anyhow!("live status lock poisoned"))?;
        write_live_status(&self.path, &phases, index(phase))
    }

    /// Merge a progress snapshot from the stream into `phase` and rewrite the file.
    pub fn record_progress(&self, phase: Phase, progress: &PhaseProgress) {
        self.update(phase, |slot| {
            let name = std::mem::take(&mut slot.name);
            let retries = slot.retry_count;
            *slot = progress.clone();
            slot.name = name;
            slot.retry_count = retries.max(progress.retry_count);
        });
    }

    /// Record an action, retry count and last error for `phase`.
    pub fn record_attempt(&self, phase: Phase, action: &str, retries: u32, last_error: &str) {
        self.update(phase, |slot| {
            if !action.is_empty() {
                slot.current_action = summarize_action(action);
            }
            slot.retry_count = retries;
            slot.last_error = summarize_action(last_error);
            slot.last_update = Some(chrono::Utc::now());
        });
    }

    pub fn snapshot(&self, phase: Phase) -> Option<PhaseProgress> {
        self.phases.lock().ok()?.get(index(phase)).cloned()
    }

    fn update<F: FnOnce(&mut PhaseProgress)>(&self, phase: Phase, apply: F) {
        let Ok(mut phases) = self.phases.lock() else {
            return;
        };
        if let Some(slot) = phases.get_mut(index(phase)) {
            apply(slot);
        }
        if let Err(err) = write_live_status(&self.path, &phases, index(phase)) {
            debug!(err = %format!("{err:#}"), "could not write live status");
        }
    }
}

fn index(phase: Phase) -> usize {
    (phase.number() - 1) as usize
}
