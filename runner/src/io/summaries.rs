//! Fallback phase summaries and handoff detection.

use std::fs;

use tracing::{debug, warn};

use super::paths::RpiPaths;
use super::run_state::RunState;
use crate::core::phase::Phase;

/// Write a mechanical summary unless the session already wrote one.
///
/// Returns true when the fallback was written.
pub fn write_fallback_summary(paths: &RpiPaths, state: &RunState, phase: Phase) -> bool {
    let path = paths.phase_summary_path(phase);
    if path.exists() {
        println!("Phase {}: agent-written summary found", phase.number());
        return false;
    }
    println!("Phase {}: no agent summary found, writing fallback", phase.number());
    if let Err(err) = fs::create_dir_all(&paths.rpi_dir) {
        warn!(err = %err, "could not create rpi dir for summary");
        return false;
    }
    let summary = fallback_summary(state, phase);
    if let Err(err) = fs::write(&path, summary) {
        warn!(err = %err, path = %path.display(), "could not write phase summary");
        return false;
    }
    debug!(path = %path.display(), "fallback summary written");
    true
}

pub fn fallback_summary(state: &RunState, phase: Phase) -> String {
    let epic = state.epic_id.as_deref().unwrap_or_default();
    let verdict = |key: &str| state.verdicts.get(key).filter(|v| !v.is_empty());
    match phase {
        Phase::Discovery => {
            let mut summary = format!(
                "Discovery completed for goal: {}\nResearch: see .agents/research/ for findings.\n",
                state.goal
            );
            if !epic.is_empty() {
                summary.push_str(&format!("Plan: epic {epic}"));
                if state.fast_path {
                    summary.push_str(" (micro-epic, fast path)");
                }
                summary.push('\n');
            }
            if let Some(v) = verdict("pre_mortem") {
                summary.push_str(&format!(
                    "Pre-mortem verdict: {v}\nSee .agents/council/*pre-mortem*.md for details."
                ));
            }
            summary
        }
        Phase::Implementation => {
            format!("Crank completed for epic {epic}.\nCheck bd children {epic} for issue statuses.")
        }
        Phase::Validation => {
            let mut summary = String::new();
            if let Some(v) = verdict("vibe") {
                summary.push_str(&format!("Vibe verdict: {v}\nSee .agents/council/*vibe*.md for details.\n"));
            }
            if let Some(v) = verdict("post_mortem") {
                summary.push_str(&format!("Post-mortem verdict: {v}\n"));
            }
            summary.push_str(
                "See .agents/council/*post-mortem*.md and .agents/learnings/ for extracted knowledge.",
            );
            summary
        }
    }
}

/// The session wrote `phase-<N>-handoff.md`, signalling context degradation.
pub fn handoff_detected(paths: &RpiPaths, phase: Phase) -> bool {
    paths.phase_handoff_path(phase).exists()
}
