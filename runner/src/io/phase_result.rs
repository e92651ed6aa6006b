//! Per-phase result artifacts (`phase-<N>-result.json`).
//!
//! A result is written once when a phase finishes and never rewritten. Later
//! phases read their predecessor's result back, schema-validated, to confirm
//! it completed.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::atomic::write_json_atomic;
use super::paths::RpiPaths;
use crate::core::phase::Phase;

const PHASE_RESULT_SCHEMA: &str = include_str!("../../schemas/phase_result.v1.schema.json");

static VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(PHASE_RESULT_SCHEMA).map_err(|e| e.to_string())?;
    validator_for(&schema).map_err(|e| e.to_string())
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub schema_version: u32,
    pub run_id: String,
    pub phase: u32,
    pub phase_name: String,
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub verdicts: BTreeMap<String, String>,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

impl PhaseResult {
    pub fn new(run_id: &str, phase: Phase, status: PhaseStatus, started_at: &str) -> Self {
        Self {
            schema_version: 1,
            run_id: run_id.to_string(),
            phase: phase.number(),
            phase_name: phase.name().to_string(),
            status,
            retries: 0,
            error: None,
            backend: None,
            artifacts: BTreeMap::new(),
            verdicts: BTreeMap::new(),
            started_at: started_at.to_string(),
            completed_at: None,
            duration_seconds: None,
        }
    }
}

fn validate_schema(value: &Value) -> Result<()> {
    let validator = VALIDATOR
        .as_ref()
        .map_err(|err| anyhow!("invalid phase result schema: {err}"))?;
    if validator.is_valid(value) {
        return Ok(());
    }
    let messages = validator
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect::<Vec<_>>();
    Err(anyhow!(
        "phase result schema validation failed: {}",
        messages.join("; ")
    ))
}

pub fn write_phase_result(paths: &RpiPaths, result: &PhaseResult) -> Result<()> {
    let phase = Phase::from_number(result.phase)
        .ok_or_else(|| anyhow!("invalid phase number {}", result.phase))?;
    let path = paths.phase_result_path(phase);
    write_json_atomic(&path, result)
        .with_context(|| format!("write phase result {}", path.display()))?;
    debug!(path = %path.display(), "phase result written");
    Ok(())
}

/// Read and schema-validate a phase result.
pub fn read_phase_result(path: &Path) -> Result<PhaseResult> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    validate_schema(&value)?;
    let result = serde_json::from_value(value)
        .with_context(|| format!("deserialize {}", path.display()))?;
    Ok(result)
}

/// Confirm that `expected` wrote a completed result.
pub fn validate_prior_phase_result(paths: &RpiPaths, expected: Phase) -> Result<()> {
    let path = paths.phase_result_path(expected);
    if !path.exists() {
        return Err(anyhow!(
            "prior phase {} result not found at {}",
            expected.number(),
            path.display()
        ));
    }
    let result = read_phase_result(&path)
        .map_err(|err| anyhow!("prior phase {} result is malformed: {err:#}", expected.number()))?;
    if result.status != PhaseStatus::Completed {
        return Err(anyhow!(
            "prior phase {} has status \"failed\" (expected \"completed\")",
            expected.number()
        ));
    }
    Ok(())
}

/// Remove summaries, handoffs and results left by a previous run.
pub fn clean_phase_artifacts(paths: &RpiPaths) {
    for phase in crate::core::phase::ALL_PHASES {
        for path in [
            paths.phase_summary_path(phase),
            paths.phase_handoff_path(phase),
            paths.phase_result_path(phase),
        ] {
            let _ = fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(phase: Phase) -> PhaseResult {
        let mut result = PhaseResult::new("abc123", phase, PhaseStatus::Completed, "2026-01-01T00:00:00Z");
        result.retries = 1;
        result.backend = Some("direct".to_string());
        result.verdicts.insert("vibe".to_string(), "PASS".to_string());
        result.completed_at = Some("2026-01-01T00:05:00Z".to_string());
        result.duration_seconds = Some(300.0);
        result
    }

    /// Verifies a written result reads back identical and passes the schema.
    #[test]
    fn written_result_reads_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RpiPaths::new(temp.path());
        let result = completed(Phase::Validation);

        write_phase_result(&paths, &result).expect("write");
        let loaded = read_phase_result(&paths.phase_result_path(Phase::Validation)).expect("read");
        assert_eq!(loaded, result);
    }

    #[test]
    fn empty_optionals_are_omitted() {
        let result = PhaseResult::new("r", Phase::Discovery, PhaseStatus::Failed, "t");
        let json = serde_json::to_value(&result).expect("json");
        for key in ["retries", "error", "backend", "artifacts", "verdicts", "completed_at", "duration_seconds"] {
            assert!(json.get(key).is_none(), "{key} should be omitted");
        }
    }

    /// Verifies prior-phase validation reports missing, malformed and failed results.
    #[test]
    fn prior_phase_validation_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RpiPaths::new(temp.path());

        let err = validate_prior_phase_result(&paths, Phase::Discovery).unwrap_err();
        assert!(err.to_string().starts_with("prior phase 1 result not found at"));

        fs::create_dir_all(&paths.rpi_dir).expect("mkdir");
        fs::write(paths.phase_result_path(Phase::Discovery), "{\"phase\": 1}").expect("write");
        let err = validate_prior_phase_result(&paths, Phase::Discovery).unwrap_err();
        assert!(err.to_string().starts_with("prior phase 1 result is malformed"));

        let failed = PhaseResult::new("r", Phase::Discovery, PhaseStatus::Failed, "t");
        write_phase_result(&paths, &failed).expect("write");
        let err = validate_prior_phase_result(&paths, Phase::Discovery).unwrap_err();
        assert_eq!(
            err.to_string(),
            "prior phase 1 has status \"failed\" (expected \"completed\")"
        );

        write_phase_result(&paths, &completed(Phase::Discovery)).expect("write");
        validate_prior_phase_result(&paths, Phase::Discovery).expect("completed");
    }

    #[test]
    fn clean_removes_prior_artifacts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RpiPaths::new(temp.path());
        fs::create_dir_all(&paths.rpi_dir).expect("mkdir");
        fs::write(paths.phase_summary_path(Phase::Discovery), "old").expect("write");
        fs::write(paths.phase_handoff_path(Phase::Validation), "old").expect("write");

        clean_phase_artifacts(&paths);

        assert!(!paths.phase_summary_path(Phase::Discovery).exists());
        assert!(!paths.phase_handoff_path(Phase::Validation).exists());
    }
}
