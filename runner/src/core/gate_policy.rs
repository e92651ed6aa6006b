//! Retry-versus-escalate policy applied after a phase gate fails.
//!
//! Pure: the caller supplies the mode, the failure and the attempt counter,
//! and receives a [`GateDecision`] that it logs and acts on.

use std::fmt;

use super::phase::Phase;

/// Environment variable selecting the policy mode.
pub const MEMRL_MODE_ENV: &str = "MEMRL_MODE";

/// Operating mode for the gate policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemrlMode {
    #[default]
    Off,
    /// Decisions are computed and logged but the legacy table is applied.
    Observe,
    Enforce,
}

impl MemrlMode {
    /// Parse a mode string; unknown values fall back to `Off`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "observe" => Self::Observe,
            "enforce" => Self::Enforce,
            _ => Self::Off,
        }
    }

    pub fn from_env() -> Self {
        std::env::var(MEMRL_MODE_ENV)
            .map(|raw| Self::parse(&raw))
            .unwrap_or_default()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Observe => "observe",
            Self::Enforce => "enforce",
        }
    }
}

/// Policy-relevant category of a gate failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureClass {
    PreMortemFail,
    CrankBlocked,
    CrankPartial,
    VibeFail,
    PhaseTimeout,
    PhaseStall,
    PhaseExitError,
    Unknown(String),
}

impl FailureClass {
    pub fn as_str(&self) -> &str {
        match self {
            Self::PreMortemFail => "pre_mortem_fail",
            Self::CrankBlocked => "crank_blocked",
            Self::CrankPartial => "crank_partial",
            Self::VibeFail => "vibe_fail",
            Self::PhaseTimeout => "phase_timeout",
            Self::PhaseStall => "phase_stall",
            Self::PhaseExitError => "phase_exit_error",
            Self::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a phase verdict to its failure class.
pub fn classify_failure(phase: Phase, verdict: &str) -> FailureClass {
    let verdict = verdict.trim().to_ascii_uppercase();
    match (phase, verdict.as_str()) {
        (Phase::Discovery, "FAIL") => FailureClass::PreMortemFail,
        (Phase::Implementation, "BLOCKED") => FailureClass::CrankBlocked,
        (Phase::Implementation, "PARTIAL") => FailureClass::CrankPartial,
        (Phase::Validation, "FAIL") => FailureClass::VibeFail,
        (_, "TIMEOUT") => FailureClass::PhaseTimeout,
        (_, "STALL") => FailureClass::PhaseStall,
        (_, "EXIT_ERROR") => FailureClass::PhaseExitError,
        _ => FailureClass::Unknown(verdict.to_ascii_lowercase()),
    }
}

/// Coarse position of an attempt relative to the retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptBucket {
    Initial,
    Middle,
    Final,
    Overflow,
}

impl AttemptBucket {
    pub fn of(attempt: u32, max_attempts: u32) -> Self {
        if max_attempts == 0 {
            return Self::Overflow;
        }
        if attempt <= 1 {
            return Self::Initial;
        }
        match attempt.cmp(&max_attempts) {
            std::cmp::Ordering::Less => Self::Middle,
            std::cmp::Ordering::Equal => Self::Final,
            std::cmp::Ordering::Greater => Self::Overflow,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Middle => "middle",
            Self::Final => "final",
            Self::Overflow => "overflow",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAction {
    Retry,
    Escalate,
}

impl GateAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Escalate => "escalate",
        }
    }
}

/// Which row of the decision table fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionRule {
    BlockedCrankEnforced,
    RetryBudgetExhausted,
    WithinBudget,
}

impl DecisionRule {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BlockedCrankEnforced => "enforce.crank_blocked",
            Self::RetryBudgetExhausted => "budget.exhausted",
            Self::WithinBudget => "budget.remaining",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub mode: MemrlMode,
    pub failure_class: FailureClass,
    pub bucket: AttemptBucket,
    pub action: GateAction,
    pub rule: DecisionRule,
}

impl GateDecision {
    /// Single-line rendering for the orchestration log.
    pub fn log_line(&self) -> String {
        format!(
            "memrl mode={} class={} bucket={} action={} rule={}",
            self.mode.as_str(),
            self.failure_class,
            self.bucket.as_str(),
            self.action.as_str(),
            self.rule.as_str()
        )
    }
}

/// Decide whether a failed gate is retried or escalated.
///
/// `attempt` is the counter after incrementing for the current failure.
pub fn decide(mode: MemrlMode, failure_class: FailureClass, attempt: u32, max_retries: u32) -> GateDecision {
    let bucket = AttemptBucket::of(attempt, max_retries);
    let (action, rule) = if mode == MemrlMode::Enforce && failure_class == FailureClass::CrankBlocked {
        (GateAction::Escalate, DecisionRule::BlockedCrankEnforced)
    } else if attempt >= max_retries {
        (GateAction::Escalate, DecisionRule::RetryBudgetExhausted)
    } else {
        (GateAction::Retry, DecisionRule::WithinBudget)
    };
    GateDecision {
        mode,
        failure_class,
        bucket,
        action,
        rule,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_mode_is_off() {
        assert_eq!(MemrlMode::parse("ENFORCE"), MemrlMode::Enforce);
        assert_eq!(MemrlMode::parse(" observe "), MemrlMode::Observe);
        assert_eq!(MemrlMode::parse("yolo"), MemrlMode::Off);
        assert_eq!(MemrlMode::parse(""), MemrlMode::Off);
    }

    #[test]
    fn enforce_escalates_blocked_crank_on_first_attempt() {
        let decision = decide(MemrlMode::Enforce, FailureClass::CrankBlocked, 1, 3);
        assert_eq!(decision.action, GateAction::Escalate);
        assert_eq!(decision.rule, DecisionRule::BlockedCrankEnforced);
    }

    #[test]
    fn off_mode_retries_blocked_crank_within_budget() {
        let decision = decide(MemrlMode::Off, FailureClass::CrankBlocked, 1, 3);
        assert_eq!(decision.action, GateAction::Retry);
    }

    #[test]
    fn escalates_once_attempt_reaches_max() {
        assert_eq!(decide(MemrlMode::Off, FailureClass::VibeFail, 1, 2).action, GateAction::Retry);
        let last = decide(MemrlMode::Off, FailureClass::VibeFail, 2, 2);
        assert_eq!(last.action, GateAction::Escalate);
        assert_eq!(last.bucket, AttemptBucket::Final);
    }

    #[test]
    fn classifies_by_phase_then_verdict() {
        assert_eq!(classify_failure(Phase::Discovery, "fail"), FailureClass::PreMortemFail);
        assert_eq!(classify_failure(Phase::Implementation, "PARTIAL"), FailureClass::CrankPartial);
        assert_eq!(classify_failure(Phase::Validation, "FAIL"), FailureClass::VibeFail);
        assert_eq!(classify_failure(Phase::Validation, "stall"), FailureClass::PhaseStall);
        assert_eq!(
            classify_failure(Phase::Discovery, "WARN"),
            FailureClass::Unknown("warn".to_string())
        );
    }

    #[test]
    fn buckets() {
        assert_eq!(AttemptBucket::of(1, 3), AttemptBucket::Initial);
        assert_eq!(AttemptBucket::of(2, 3), AttemptBucket::Middle);
        assert_eq!(AttemptBucket::of(3, 3), AttemptBucket::Final);
        assert_eq!(AttemptBucket::of(4, 3), AttemptBucket::Overflow);
        assert_eq!(AttemptBucket::of(1, 0), AttemptBucket::Overflow);
    }
}
