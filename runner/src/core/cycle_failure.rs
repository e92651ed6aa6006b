//! Infrastructure-versus-task classification for supervised cycle failures.
//!
//! The loop decides queue marking from [`FailureKind`] alone, by downcasting
//! to [`CycleFailure`]. Error text is never inspected.

use std::fmt;

use anyhow::Error;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The agent's work failed; the queue entry is marked failed.
    Task,
    /// The environment failed; the queue entry is left for a later cycle.
    Infrastructure,
    /// Misconfiguration no retry can fix; the loop stops and leaves the queue alone.
    Fatal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Infrastructure => "infrastructure",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cycle error annotated with its class and the stage that produced it.
#[derive(Debug, Error)]
#[error("{kind} failure during {stage}")]
pub struct CycleFailure {
    pub kind: FailureKind,
    pub stage: String,
    #[source]
    pub source: Error,
}

/// Wrap `err` as a cycle failure unless it already is one.
pub fn wrap_cycle_failure(kind: FailureKind, stage: &str, err: Error) -> Error {
    if err.downcast_ref::<CycleFailure>().is_some() {
        return err;
    }
    Error::new(CycleFailure {
        kind,
        stage: stage.to_string(),
        source: err,
    })
}

pub fn task_failure(stage: &str, err: Error) -> Error {
    wrap_cycle_failure(FailureKind::Task, stage, err)
}

pub fn infrastructure_failure(stage: &str, err: Error) -> Error {
    wrap_cycle_failure(FailureKind::Infrastructure, stage, err)
}

pub fn fatal_failure(stage: &str, err: Error) -> Error {
    wrap_cycle_failure(FailureKind::Fatal, stage, err)
}

/// Class of an arbitrary error; unwrapped errors count as task failures.
pub fn failure_kind(err: &Error) -> FailureKind {
    err.downcast_ref::<CycleFailure>()
        .map(|failure| failure.kind)
        .unwrap_or(FailureKind::Task)
}

pub fn is_infrastructure(err: &Error) -> bool {
    failure_kind(err) == FailureKind::Infrastructure
}

pub fn is_fatal(err: &Error) -> bool {
    failure_kind(err) == FailureKind::Fatal
}

/// Whether a failed cycle should mark its queue entry as failed.
pub fn should_mark_failed(err: &Error) -> bool {
    failure_kind(err) == FailureKind::Task
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn wrapping_twice_keeps_first_classification() {
        let err = infrastructure_failure("landing", anyhow!("push rejected"));
        let rewrapped = task_failure("phased", err);
        let failure = rewrapped.downcast_ref::<CycleFailure>().expect("cycle failure");
        assert_eq!(failure.kind, FailureKind::Infrastructure);
        assert_eq!(failure.stage, "landing");
    }

    #[test]
    fn unclassified_errors_are_task_failures() {
        let err = anyhow!("boom");
        assert_eq!(failure_kind(&err), FailureKind::Task);
        assert!(should_mark_failed(&err));
    }

    #[test]
    fn classification_survives_added_context() {
        let err = infrastructure_failure("cleanup", anyhow!("prune failed")).context("cycle 3");
        assert!(is_infrastructure(&err));
        assert!(!should_mark_failed(&err));
    }

    #[test]
    fn display_names_kind_and_stage() {
        let err = task_failure("gates", anyhow!("vibe FAIL"));
        assert_eq!(err.to_string(), "task failure during gates");
        assert_eq!(format!("{err:#}"), "task failure during gates: vibe FAIL");
    }

    /// Verifies the alternate form prints each cause once.
    #[test]
    fn alternate_display_does_not_repeat_causes() {
        let err = fatal_failure(
            "runtime preflight",
            anyhow!("not on PATH").context("runtime command \"claude\" unavailable"),
        );
        assert_eq!(
            format!("{err:#}"),
            "fatal failure during runtime preflight: runtime command \"claude\" unavailable: not on PATH"
        );
    }

    #[test]
    fn fatal_failures_are_never_marked() {
        let err = fatal_failure("runtime preflight", anyhow!("missing"));
        assert!(is_fatal(&err));
        assert!(!is_infrastructure(&err));
        assert!(!should_mark_failed(&err));
    }
}
