//! Phase prompts rendered from minijinja templates.
//!
//! Every prompt opens with the context discipline block and the summary
//! contract so both survive compaction, followed by prior-phase context
//! (phases 2 and 3) and the phase's skill invocation.

use std::fs;
use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use super::gates::Finding;
use super::paths::RpiPaths;
use super::run_state::RunState;
use super::stream_events::truncate_chars;
use crate::core::phase::Phase;

const DISCIPLINE_TEMPLATE: &str = include_str!("prompts/discipline.md");
const SUMMARY_TEMPLATE: &str = include_str!("prompts/summary_contract.md");
const DISCOVERY_TEMPLATE: &str = include_str!("prompts/discovery.md");
const IMPLEMENTATION_TEMPLATE: &str = include_str!("prompts/implementation.md");
const VALIDATION_TEMPLATE: &str = include_str!("prompts/validation.md");
const VALIDATION_RETRY_TEMPLATE: &str = include_str!("prompts/validation_retry.md");

/// Prior-phase summaries are capped at this many characters in the context block.
pub const SUMMARY_CONTEXT_MAX: usize = 2000;

const DISCOVERY_BUDGET: &str = "BUDGET: This session runs research + plan + pre-mortem. Research: limit to ~15 file reads, write findings to .agents/research/. Plan: write to .agents/plans/, focus on issue creation. Pre-mortem: invoke /council, read the verdict, done. If pre-mortem FAILs, re-plan and re-run pre-mortem within this session (max 3 attempts).";
const IMPLEMENTATION_BUDGET: &str = "BUDGET (CRITICAL): Crank is the highest-risk phase for context. /crank spawns workers internally. Do NOT re-read worker output into your context. Trust /crank to manage its waves. Read only the completion status.";
const VALIDATION_BUDGET: &str = "BUDGET: This session runs vibe + post-mortem. Vibe: invoke /council on recent changes, read the verdict. Post-mortem: invoke /council + /retro, read output files, write summary. Minimal context for both.";

static ENGINE: LazyLock<PromptEngine> = LazyLock::new(PromptEngine::new);

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("discipline", DISCIPLINE_TEMPLATE)
            .expect("discipline template should be valid");
        env.add_template("summary_contract", SUMMARY_TEMPLATE)
            .expect("summary contract template should be valid");
        env.add_template("discovery", DISCOVERY_TEMPLATE)
            .expect("discovery template should be valid");
        env.add_template("implementation", IMPLEMENTATION_TEMPLATE)
            .expect("implementation template should be valid");
        env.add_template("validation", VALIDATION_TEMPLATE)
            .expect("validation template should be valid");
        env.add_template("validation_retry", VALIDATION_RETRY_TEMPLATE)
            .expect("validation retry template should be valid");
        Self { env }
    }

    /// Discipline block and summary contract, in that order.
    fn render_preamble(&self, phase: Phase) -> Result<String> {
        let discipline = self.env.get_template("discipline")?.render(context! {
            phase_num => phase.number(),
            budget => budget_for(phase),
        })?;
        let summary = self
            .env
            .get_template("summary_contract")?
            .render(context! { phase_num => phase.number() })?;
        Ok(format!("{discipline}\n{summary}\n\n"))
    }

    fn render_body(&self, phase: Phase, state: &RunState) -> Result<String> {
        let template = self.env.get_template(phase.name())?;
        let rendered = template.render(context! {
            goal => state.goal.as_str(),
            epic_id => state.epic_id.as_deref().unwrap_or_default(),
            fast_path => state.fast_path,
            test_first => state.test_first,
            swarm_first => state.swarm_first,
        })?;
        Ok(rendered)
    }

    fn render_validation_retry(
        &self,
        state: &RunState,
        attempt: u32,
        max_retries: u32,
        findings: &[Finding],
    ) -> Result<String> {
        let rendered = self.env.get_template("validation_retry")?.render(context! {
            epic_id => state.epic_id.as_deref().unwrap_or_default(),
            test_first => state.test_first,
            attempt => attempt,
            max_retries => max_retries,
            findings => findings.iter().map(FindingContext::from).collect::<Vec<_>>(),
        })?;
        Ok(rendered)
    }
}

#[derive(Debug, Serialize)]
struct FindingContext<'a> {
    description: &'a str,
    fix: &'a str,
    reference: &'a str,
}

impl<'a> From<&'a Finding> for FindingContext<'a> {
    fn from(finding: &'a Finding) -> Self {
        Self {
            description: &finding.description,
            fix: &finding.fix,
            reference: &finding.reference,
        }
    }
}

fn budget_for(phase: Phase) -> &'static str {
    match phase {
        Phase::Discovery => DISCOVERY_BUDGET,
        Phase::Implementation => IMPLEMENTATION_BUDGET,
        Phase::Validation => VALIDATION_BUDGET,
    }
}

/// Full prompt for a fresh phase session.
///
/// `spawn_paths` is the layout of the directory the session runs in; prior
/// summaries are read from there.
pub fn build_phase_prompt(spawn_paths: &RpiPaths, phase: Phase, state: &RunState) -> Result<String> {
    let mut prompt = ENGINE.render_preamble(phase)?;
    if phase.number() >= 2 {
        let context_block = build_phase_context(spawn_paths, phase, state);
        if !context_block.is_empty() {
            prompt.push_str(&context_block);
            prompt.push_str("\n\n");
        }
    }
    prompt.push_str(&ENGINE.render_body(phase, state)?);
    Ok(prompt)
}

/// Prompt for a gate retry.
///
/// Validation retries re-crank the epic with the vibe findings. Phases
/// without a retry template get their normal prompt.
pub fn build_retry_prompt(
    spawn_paths: &RpiPaths,
    phase: Phase,
    state: &RunState,
    attempt: u32,
    max_retries: u32,
    findings: &[Finding],
) -> Result<String> {
    if phase != Phase::Validation {
        return build_phase_prompt(spawn_paths, phase, state);
    }
    let mut prompt = ENGINE.render_preamble(phase)?;
    prompt.push_str(&ENGINE.render_validation_retry(state, attempt, max_retries, findings)?);
    Ok(prompt)
}

/// Context block carried into phases 2 and 3: goal, gate verdicts and the
/// summaries written by earlier phases. Empty when there is nothing to carry.
pub fn build_phase_context(spawn_paths: &RpiPaths, phase: Phase, state: &RunState) -> String {
    let mut parts = Vec::new();
    if !state.goal.is_empty() {
        parts.push(format!("Goal: {}", state.goal));
    }
    for (key, verdict) in &state.verdicts {
        parts.push(format!("{} verdict: {verdict}", key.replace('_', "-")));
    }

    let mut summaries = Vec::new();
    for number in 1..phase.number() {
        let Some(prior) = Phase::from_number(number) else {
            continue;
        };
        let path = spawn_paths.phase_summary_path(prior);
        let Ok(content) = fs::read_to_string(&path) else {
            debug!(path = %path.display(), "no prior phase summary");
            continue;
        };
        let content = content.trim();
        if content.is_empty() {
            continue;
        }
        let content = if content.chars().count() > SUMMARY_CONTEXT_MAX {
            let kept: String = content.chars().take(SUMMARY_CONTEXT_MAX).collect();
            format!("{kept}...")
        } else {
            content.to_string()
        };
        summaries.push(format!("[Phase {number}: {}]\n{content}", prior.name()));
    }
    if !summaries.is_empty() {
        parts.push(summaries.join("\n\n"));
    }

    if parts.is_empty() {
        return String::new();
    }
    format!("--- RPI Context (from prior phases) ---\n{}", parts.join("\n"))
}

/// Single-line rendering of a prompt for logs and dry runs.
pub fn prompt_preview(prompt: &str, max: usize) -> String {
    truncate_chars(&prompt.split_whitespace().collect::<Vec<_>>().join(" "), max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::PhasedOptions;

    fn state(goal: &str) -> RunState {
        let mut state = RunState::new(goal, 1, &PhasedOptions::default());
        state.epic_id = Some("ag-42".to_string());
        state
    }

    /// Verifies the preamble order and the phase-specific handoff path.
    #[test]
    fn discovery_prompt_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RpiPaths::new(temp.path());
        let mut st = state("add rate limiting");
        st.swarm_first = false;

        let prompt = build_phase_prompt(&paths, Phase::Discovery, &st).expect("prompt");
        let discipline = prompt.find("CONTEXT DISCIPLINE").expect("discipline");
        let summary = prompt.find("PHASE SUMMARY CONTRACT").expect("summary");
        let body = prompt.find("Run these skills IN SEQUENCE").expect("body");
        assert!(discipline < summary && summary < body);
        assert!(prompt.contains("(phase 1 of 3)"));
        assert!(prompt.contains(".agents/rpi/phase-1-handoff.md"));
        assert!(prompt.contains(".agents/rpi/phase-1-summary.md"));
        assert!(prompt.contains("/research \"add rate limiting\" --auto"));
        assert!(prompt.contains("/pre-mortem\n"));
        assert!(!prompt.contains("SWARM-FIRST"));
        assert!(!prompt.contains("RPI Context"));
    }

    #[test]
    fn swarm_and_quick_flags_render() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RpiPaths::new(temp.path());
        let mut st = state("goal");
        st.swarm_first = true;
        st.fast_path = true;

        let prompt = build_phase_prompt(&paths, Phase::Discovery, &st).expect("prompt");
        assert!(prompt.contains("SWARM-FIRST EXECUTION CONTRACT:"));
        assert!(prompt.contains("Fallback direct command:\n/research"));
        assert!(prompt.contains("/pre-mortem --quick"));

        let prompt = build_phase_prompt(&paths, Phase::Validation, &st).expect("prompt");
        assert!(prompt.contains("/vibe --quick recent"));
        assert!(prompt.contains("/post-mortem --quick ag-42"));
    }

    /// Verifies implementation gets the context block and the crank command.
    #[test]
    fn implementation_prompt_carries_context() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RpiPaths::new(temp.path());
        fs::create_dir_all(&paths.rpi_dir).expect("mkdir");
        fs::write(paths.phase_summary_path(Phase::Discovery), "  planned 3 issues \n").expect("write");
        let mut st = state("goal");
        st.swarm_first = false;
        st.test_first = true;
        st.verdicts.insert("pre_mortem".to_string(), "WARN".to_string());

        let prompt = build_phase_prompt(&paths, Phase::Implementation, &st).expect("prompt");
        assert!(prompt.contains(
            "--- RPI Context (from prior phases) ---\nGoal: goal\npre-mortem verdict: WARN\n[Phase 1: discovery]\nplanned 3 issues\n\n/crank ag-42 --test-first"
        ));
    }

    #[test]
    fn long_summaries_are_capped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RpiPaths::new(temp.path());
        fs::create_dir_all(&paths.rpi_dir).expect("mkdir");
        fs::write(paths.phase_summary_path(Phase::Discovery), "x".repeat(2500)).expect("write");
        fs::write(paths.phase_summary_path(Phase::Implementation), "built it").expect("write");

        let block = build_phase_context(&paths, Phase::Validation, &state("g"));
        assert!(block.contains(&format!("{}...\n\n[Phase 2: implementation]\nbuilt it", "x".repeat(2000))));
    }

    #[test]
    fn empty_context_when_nothing_known() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RpiPaths::new(temp.path());
        assert_eq!(build_phase_context(&paths, Phase::Implementation, &state("")), "");
    }

    /// Verifies validation retries re-crank with findings; other phases reuse the normal prompt.
    #[test]
    fn retry_prompts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RpiPaths::new(temp.path());
        let st = state("goal");
        let findings = vec![Finding {
            description: "missing test".to_string(),
            fix: "add test".to_string(),
            reference: "src/lib.rs:10".to_string(),
        }];

        let retry = build_retry_prompt(&paths, Phase::Validation, &st, 2, 3, &findings).expect("retry");
        assert!(retry.starts_with("CONTEXT DISCIPLINE"));
        assert!(retry.contains("/crank ag-42\n\nVibe FAIL (attempt 2/3). Address these findings:\n"));
        assert!(retry.contains("FINDING: missing test | FIX: add test | REF: src/lib.rs:10\n"));
        assert!(!retry.contains("RPI Context"));

        let normal = build_phase_prompt(&paths, Phase::Discovery, &st).expect("prompt");
        let retry = build_retry_prompt(&paths, Phase::Discovery, &st, 1, 3, &findings).expect("retry");
        assert_eq!(normal, retry);
    }

    #[test]
    fn preview_is_single_line() {
        assert_eq!(prompt_preview("a\n\n b   c", 80), "a b c");
    }
}
