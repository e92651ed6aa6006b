//! Post-phase gates: council verdicts, epic discovery and crank completion.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::orchestration_log::OrchestrationLog;
use super::paths::RpiPaths;
use super::phase_result::validate_prior_phase_result;
use super::process::{DEFAULT_OUTPUT_LIMIT, run_command_with_timeout};
use super::run_state::RunState;
use crate::core::phase::Phase;

/// At most this many findings are carried into a retry prompt.
pub const MAX_FINDINGS: usize = 5;

const BD_TIMEOUT: Duration = Duration::from_secs(60);

static VERDICT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^## Council Verdict:\s*(PASS|WARN|FAIL)").expect("verdict regex should compile")
});
static FINDING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)FINDING:\s*(.+?)\s*\|\s*FIX:\s*(.+?)\s*\|\s*REF:\s*(.+?)$")
        .expect("finding regex should compile")
});
static NUMBERED_FINDING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\d+\.\s+\*\*(.+?)\*\*\s*[—–-]\s*(.+)$").expect("numbered finding regex should compile")
});
static ISSUE_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9]*-[a-z0-9][a-z0-9.]*$").expect("issue id regex should compile")
});

/// One actionable item from a council report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub description: String,
    pub fix: String,
    pub reference: String,
}

/// A gate check failed; the phase may be retried.
#[derive(Debug, Clone, Error)]
#[error("gate FAIL at phase {phase}: {verdict} (report: {report})")]
pub struct GateFailure {
    pub phase: u32,
    pub verdict: String,
    pub report: String,
    pub findings: Vec<Finding>,
}

/// Completion of an epic's children as reported by `bd children`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrankStatus {
    Done,
    Blocked,
    Partial,
}

impl CrankStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Done => "DONE",
            Self::Blocked => "BLOCKED",
            Self::Partial => "PARTIAL",
        }
    }
}

/// Evaluates the gate after a phase session exits successfully.
///
/// Returns a [`GateFailure`] (inside the `anyhow::Error`) when the phase may be
/// retried; any other error is fatal for the run. May update the epic, fast
/// path and verdicts recorded in `state`.
pub trait GateEvaluator {
    fn evaluate(
        &self,
        phase: Phase,
        spawn_paths: &RpiPaths,
        state: &mut RunState,
        log: &OrchestrationLog,
    ) -> Result<()>;
}

/// Gate backed by council reports under `.agents/council` and the `bd` CLI.
#[derive(Debug, Clone)]
pub struct CouncilGateEvaluator {
    bd_command: String,
}

impl CouncilGateEvaluator {
    pub fn new(bd_command: impl Into<String>) -> Self {
        Self {
            bd_command: bd_command.into(),
        }
    }

    fn discovery(&self, paths: &RpiPaths, state: &mut RunState, log: &OrchestrationLog) -> Result<()> {
        let epic_id = extract_epic_id(&self.bd_command)
            .context("discovery phase: could not extract epic ID (implementation needs this)")?;
        println!("Epic ID: {epic_id}");
        log.log(&state.run_id, "discovery", &format!("extracted epic: {epic_id}"));
        state.epic_id = Some(epic_id.clone());

        if !state.opts.fast_path {
            match detect_fast_path(&self.bd_command, &epic_id) {
                Ok(true) => {
                    state.fast_path = true;
                    println!("Micro-epic detected: using fast path (--quick for gates)");
                }
                Ok(false) => {}
                Err(err) => {
                    debug!(err = %format!("{err:#}"), "fast-path detection failed (continuing without)");
                }
            }
        }

        // The session retries pre-mortem internally, so a missing report is not fatal.
        let report = match find_latest_council_report(&paths.council_dir, "pre-mortem", None, Some(&epic_id)) {
            Ok(report) => report,
            Err(err) => {
                debug!(err = %format!("{err:#}"), "pre-mortem council report not found");
                return Ok(());
            }
        };
        let verdict = match extract_council_verdict(&report) {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "could not extract pre-mortem verdict");
                return Ok(());
            }
        };
        record_verdict(state, log, Phase::Discovery, "pre_mortem", &verdict, &report);
        if verdict == "FAIL" {
            return Err(gate_failure(Phase::Discovery, verdict, &report).into());
        }
        Ok(())
    }

    fn implementation(&self, paths: &RpiPaths, state: &mut RunState, log: &OrchestrationLog) -> Result<()> {
        if state.start_phase <= 1 {
            validate_prior_phase_result(paths, Phase::Discovery)
                .context("phase 2 prerequisite not met")?;
        }
        let Some(epic_id) = state.epic_id.clone().filter(|id| !id.is_empty()) else {
            return Ok(());
        };
        let status = match check_crank_completion(&self.bd_command, &epic_id) {
            Ok(status) => status,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "could not check crank completion (continuing to validation)");
                return Ok(());
            }
        };
        println!("Crank status: {}", status.as_str());
        log.log(&state.run_id, "implementation", &format!("crank status: {}", status.as_str()));
        match status {
            CrankStatus::Done => Ok(()),
            CrankStatus::Blocked | CrankStatus::Partial => Err(GateFailure {
                phase: Phase::Implementation.number(),
                verdict: status.as_str().to_string(),
                report: format!("bd children {epic_id}"),
                findings: Vec::new(),
            }
            .into()),
        }
    }

    fn validation(&self, paths: &RpiPaths, state: &mut RunState, log: &OrchestrationLog) -> Result<()> {
        if state.start_phase <= 2 {
            validate_prior_phase_result(paths, Phase::Implementation)
                .context("phase 3 prerequisite not met")?;
        }
        let epic_id = state.epic_id.clone();
        let report = find_latest_council_report(&paths.council_dir, "vibe", None, epic_id.as_deref())
            .context("validation phase: vibe report not found (phase may not have completed)")?;
        let verdict = extract_council_verdict(&report).with_context(|| {
            format!("validation phase: could not extract vibe verdict from {}", report.display())
        })?;
        record_verdict(state, log, Phase::Validation, "vibe", &verdict, &report);
        if verdict == "FAIL" {
            return Err(gate_failure(Phase::Validation, verdict, &report).into());
        }

        // Post-mortem verdict is informational.
        let pm = find_latest_council_report(&paths.council_dir, "post-mortem", None, epic_id.as_deref())
            .and_then(|pm_report| extract_council_verdict(&pm_report).map(|verdict| (pm_report, verdict)));
        if let Ok((pm_report, pm_verdict)) = pm {
            record_verdict(state, log, Phase::Validation, "post_mortem", &pm_verdict, &pm_report);
        }
        Ok(())
    }
}

impl GateEvaluator for CouncilGateEvaluator {
    #[instrument(skip_all, fields(phase = %phase))]
    fn evaluate(
        &self,
        phase: Phase,
        spawn_paths: &RpiPaths,
        state: &mut RunState,
        log: &OrchestrationLog,
    ) -> Result<()> {
        match phase {
            Phase::Discovery => self.discovery(spawn_paths, state, log),
            Phase::Implementation => self.implementation(spawn_paths, state, log),
            Phase::Validation => self.validation(spawn_paths, state, log),
        }
    }
}

fn record_verdict(
    state: &mut RunState,
    log: &OrchestrationLog,
    phase: Phase,
    key: &str,
    verdict: &str,
    report: &Path,
) {
    state.verdicts.insert(key.to_string(), verdict.to_string());
    let label = match key {
        "pre_mortem" => "Pre-mortem",
        "post_mortem" => "Post-mortem",
        _ => "Vibe",
    };
    println!("{label} verdict: {verdict}");
    log.log(
        &state.run_id,
        phase.name(),
        &format!("{} verdict: {verdict} report={}", key.replace('_', "-"), report.display()),
    );
}

fn gate_failure(phase: Phase, verdict: String, report: &Path) -> GateFailure {
    let findings = extract_council_findings(report, MAX_FINDINGS).unwrap_or_default();
    GateFailure {
        phase: phase.number(),
        verdict,
        report: report.display().to_string(),
        findings,
    }
}

/// Verdict line (`## Council Verdict: PASS|WARN|FAIL`) of a council report.
pub fn extract_council_verdict(report: &Path) -> Result<String> {
    let contents = fs::read_to_string(report).with_context(|| format!("read report {}", report.display()))?;
    VERDICT_RE
        .captures(&contents)
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| anyhow!("no verdict found in {}", report.display()))
}

/// Latest council report whose file name contains `pattern`.
///
/// Reports older than `not_before` are ignored. Reports naming the epic are
/// preferred over the rest; the lexically last name wins.
pub fn find_latest_council_report(
    council_dir: &Path,
    pattern: &str,
    not_before: Option<SystemTime>,
    epic_id: Option<&str>,
) -> Result<PathBuf> {
    let entries = fs::read_dir(council_dir)
        .with_context(|| format!("read council directory {}", council_dir.display()))?;
    let epic_id = epic_id.filter(|id| !id.is_empty());

    let mut matches = Vec::new();
    let mut epic_matches = Vec::new();
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.contains(pattern) || !name.ends_with(".md") {
            continue;
        }
        if let Some(cutoff) = not_before {
            let Ok(modified) = entry.metadata().and_then(|meta| meta.modified()) else {
                continue;
            };
            if modified < cutoff {
                continue;
            }
        }
        if epic_id.is_some_and(|id| name.contains(id)) {
            epic_matches.push(entry.path());
        }
        matches.push(entry.path());
    }

    let mut selected = if epic_matches.is_empty() { matches } else { epic_matches };
    selected.sort();
    selected
        .pop()
        .ok_or_else(|| anyhow!("no council report matching {pattern:?} found"))
}

/// Structured findings from a report, falling back to numbered bold items.
pub fn extract_council_findings(report: &Path, max: usize) -> Result<Vec<Finding>> {
    let contents = fs::read_to_string(report).with_context(|| format!("read report {}", report.display()))?;
    let mut findings: Vec<Finding> = FINDING_RE
        .captures_iter(&contents)
        .take(max)
        .map(|caps| Finding {
            description: caps[1].to_string(),
            fix: caps[2].to_string(),
            reference: caps[3].to_string(),
        })
        .collect();
    if findings.is_empty() {
        findings = NUMBERED_FINDING_RE
            .captures_iter(&contents)
            .take(max)
            .map(|caps| Finding {
                description: format!("{}: {}", &caps[1], &caps[2]),
                fix: "See council report".to_string(),
                reference: report.display().to_string(),
            })
            .collect();
    }
    Ok(findings)
}

/// Most recently created open epic, via `bd list` (JSON first, text fallback).
#[instrument(skip_all)]
pub fn extract_epic_id(bd_command: &str) -> Result<String> {
    match run_bd(bd_command, &["list", "--type", "epic", "--status", "open", "--json"]) {
        Ok(out) => match parse_latest_epic_id_from_json(&out) {
            Ok(epic_id) => return Ok(epic_id),
            Err(err) => debug!(err = %format!("{err:#}"), "could not parse bd JSON epic list (falling back to text)"),
        },
        Err(err) => debug!(err = %format!("{err:#}"), "bd list --json failed (falling back to text)"),
    }
    let out = run_bd(bd_command, &["list", "--type", "epic", "--status", "open"]).context("bd list")?;
    parse_latest_epic_id_from_text(&out)
}

#[derive(Debug, Deserialize)]
struct EpicEntry {
    #[serde(default)]
    id: String,
}

pub fn parse_latest_epic_id_from_json(data: &str) -> Result<String> {
    let entries: Vec<EpicEntry> = serde_json::from_str(data).context("parse bd list JSON")?;
    entries
        .iter()
        .rev()
        .map(|entry| entry.id.trim())
        .find(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("no epic found in bd list output"))
}

/// Last issue-like token among the first three fields of any line.
pub fn parse_latest_epic_id_from_text(output: &str) -> Result<String> {
    let mut latest = None;
    for line in output.lines() {
        let found = line
            .split_whitespace()
            .take(3)
            .map(|field| field.trim_matches(|c| matches!(c, '[' | ']' | '(' | ')')))
            .find(|token| ISSUE_ID_RE.is_match(token));
        if let Some(token) = found {
            latest = Some(token.to_string());
        }
    }
    latest.ok_or_else(|| anyhow!("no epic found in bd list output"))
}

pub fn detect_fast_path(bd_command: &str, epic_id: &str) -> Result<bool> {
    let out = run_bd(bd_command, &["children", epic_id]).context("bd children")?;
    Ok(parse_fast_path(&out))
}

/// Micro-epic: at most two children and none blocked.
pub fn parse_fast_path(output: &str) -> bool {
    let lines: Vec<&str> = output.lines().filter(|line| !line.trim().is_empty()).collect();
    let blocked = lines
        .iter()
        .any(|line| line.to_lowercase().contains("blocked"));
    lines.len() <= 2 && !blocked
}

pub fn check_crank_completion(bd_command: &str, epic_id: &str) -> Result<CrankStatus> {
    let out = run_bd(bd_command, &["children", epic_id]).context("bd children")?;
    Ok(parse_crank_completion(&out))
}

pub fn parse_crank_completion(output: &str) -> CrankStatus {
    let mut total = 0;
    let mut closed = 0;
    let mut blocked = 0;
    for line in output.lines().filter(|line| !line.trim().is_empty()) {
        total += 1;
        let lower = line.to_lowercase();
        if lower.contains("closed") || lower.contains('✓') {
            closed += 1;
        }
        if lower.contains("blocked") {
            blocked += 1;
        }
    }
    if total == 0 || closed == total {
        CrankStatus::Done
    } else if blocked > 0 {
        CrankStatus::Blocked
    } else {
        CrankStatus::Partial
    }
}

fn run_bd(bd_command: &str, args: &[&str]) -> Result<String> {
    let mut cmd = Command::new(bd_command);
    cmd.args(args);
    let out = run_command_with_timeout(cmd, BD_TIMEOUT, DEFAULT_OUTPUT_LIMIT)
        .with_context(|| format!("run {bd_command} {}", args.join(" ")))?;
    if out.timed_out {
        bail!("{bd_command} {} timed out", args.join(" "));
    }
    if !out.success() {
        bail!(
            "{bd_command} {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(out.stdout_text())
}
