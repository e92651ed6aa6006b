//! End-to-end phased runs inside isolated worktrees.
//!
//! These tests drive `PhasedEngine::run` against a real git repository with a
//! scripted executor: worktree creation, merge-back on success, preservation
//! on failure, resume into a preserved worktree and the resulting status.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;
use chrono::Utc;
use rpi_runner::core::phase::{Phase, TerminalStatus};
use rpi_runner::io::config::PhasedOptions;
use rpi_runner::io::executor::PhaseExecutor;
use rpi_runner::io::git::Git;
use rpi_runner::io::paths::RpiPaths;
use rpi_runner::io::run_state::load_run_state;
use rpi_runner::io::status::latest_run;
use rpi_runner::phased::PhasedEngine;
use rpi_runner::test_support::{
    RecordingCheckpoints, ScriptedExecutor, ScriptedGateEvaluator, TestRepo,
};

/// Commits one file per phase in the directory it runs in.
#[derive(Default)]
struct CommittingExecutor {
    calls: AtomicU32,
}

impl PhaseExecutor for CommittingExecutor {
    fn name(&self) -> &'static str {
        "committing"
    }

    fn execute(&self, _prompt: &str, cwd: &Path, _run_id: &str, phase: Phase) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let name = format!("phase-{}.txt", phase.number());
        fs::write(cwd.join(&name), format!("{}\n", phase.name()))?;
        let git = Git::new(cwd);
        git.add_paths(&[name])?;
        git.commit_staged(&format!("feat: {}", phase.name()))?;
        Ok(())
    }
}

fn worktree_options() -> PhasedOptions {
    PhasedOptions {
        no_worktree: false,
        max_retries: 2,
        ..PhasedOptions::default()
    }
}

/// Verifies a successful run merges the worktree's commits back and removes it.
#[test]
fn successful_run_merges_and_removes_worktree() {
    let repo = TestRepo::new().expect("repo");
    let executor = CommittingExecutor::default();
    let gate = ScriptedGateEvaluator::passing();
    let checkpoints = RecordingCheckpoints::default();

    let state = PhasedEngine::new(&gate, &checkpoints)
        .with_executor(&executor)
        .run(repo.path(), Some("refactor the storage layer"), &worktree_options())
        .expect("run");

    assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    assert_eq!(state.terminal_status, Some(TerminalStatus::Completed));
    let worktree = state.worktree_path.clone().expect("worktree path");
    assert!(!worktree.exists(), "worktree should be removed after merge");
    for n in 1..=3 {
        assert!(repo.path().join(format!("phase-{n}.txt")).exists());
    }

    let paths = RpiPaths::new(repo.path());
    let saved = load_run_state(&paths.registry_state_path(&state.run_id)).expect("registry");
    assert_eq!(saved.terminal_status, Some(TerminalStatus::Completed));
    let status = latest_run(repo.path(), Utc::now()).expect("latest run");
    assert_eq!(status.run_id, state.run_id);
    assert_eq!(status.status, "completed");
}

/// Verifies a failed run keeps its worktree and a later resume finishes in it.
#[test]
fn failed_run_preserves_worktree_for_resume() {
    let repo = TestRepo::new().expect("repo");
    let gate = ScriptedGateEvaluator::passing();
    let checkpoints = RecordingCheckpoints::default();

    let failing = ScriptedExecutor::failing_at(2, "claude exited with code 1");
    let err = PhasedEngine::new(&gate, &checkpoints)
        .with_executor(&failing)
        .run(repo.path(), Some("add a cache layer"), &worktree_options())
        .unwrap_err();
    assert!(format!("{err:#}").contains("claude exited with code 1"));

    let paths = RpiPaths::new(repo.path());
    let failed = load_run_state(&paths.state_path).expect("flat state");
    assert_eq!(failed.terminal_status, Some(TerminalStatus::Failed));
    assert!(
        failed
            .terminal_reason
            .as_deref()
            .is_some_and(|reason| reason.starts_with("phase implementation: "))
    );
    let worktree = failed.worktree_path.clone().expect("worktree path");
    assert!(worktree.exists(), "failed runs keep their worktree");

    let resumed_executor = ScriptedExecutor::writing_file("resumed.txt");
    let opts = PhasedOptions {
        from: "implementation".to_string(),
        ..worktree_options()
    };
    let resumed = PhasedEngine::new(&gate, &checkpoints)
        .with_executor(&resumed_executor)
        .run(repo.path(), None, &opts)
        .expect("resume");

    assert_eq!(resumed.run_id, failed.run_id);
    assert_eq!(resumed.goal, "add a cache layer");
    assert_eq!(resumed.terminal_status, Some(TerminalStatus::Completed));
    assert_eq!(resumed_executor.calls(), 2);
    assert!(worktree.join("resumed.txt").exists());
    assert!(!repo.path().join("resumed.txt").exists());
}

#[test]
fn dry_run_creates_no_worktree() {
    let repo = TestRepo::new().expect("repo");
    let executor = ScriptedExecutor::succeeding();
    let gate = ScriptedGateEvaluator::passing();
    let checkpoints = RecordingCheckpoints::default();
    let opts = PhasedOptions {
        dry_run: true,
        ..worktree_options()
    };

    let state = PhasedEngine::new(&gate, &checkpoints)
        .with_executor(&executor)
        .run(repo.path(), Some("add a cache layer"), &opts)
        .expect("dry run");

    assert!(state.worktree_path.is_none());
    assert!(state.terminal_status.is_none());
    assert_eq!(executor.calls(), 0);
    assert!(checkpoints.steps().is_empty());
}
