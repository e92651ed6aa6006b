//! Supervisor loop scenarios over a real queue file and the phased engine.
//!
//! Each test wires `run_loop` to a `SupervisedCycle` backed by scripted
//! executors and gates, so queue selection, retries, failure classification
//! and queue marking are exercised together.

use std::fs;
use std::path::PathBuf;

use rpi_runner::core::queue::{QueueEntry, WorkItem};
use rpi_runner::io::config::{FailurePolicy, LandingPolicy, LoopConfig, PhasedOptions};
use rpi_runner::io::paths::RpiPaths;
use rpi_runner::looping::{LOOP_ID, LoopStop, run_loop};
use rpi_runner::phased::PhasedEngine;
use rpi_runner::supervisor::SupervisedCycle;
use rpi_runner::test_support::{
    RecordingCheckpoints, ScriptedExecutor, ScriptedGateEvaluator, TestRepo, gate_fail,
};

fn queue_line(title: &str, severity: &str) -> String {
    let entry = QueueEntry {
        source_epic: "ag-7".to_string(),
        timestamp: "2026-03-01T12:00:00Z".to_string(),
        items: vec![WorkItem {
            title: title.to_string(),
            kind: "tech-debt".to_string(),
            severity: severity.to_string(),
            source: "post-mortem".to_string(),
            ..WorkItem::default()
        }],
        ..QueueEntry::default()
    };
    serde_json::to_string(&entry).expect("serialize")
}

fn seed_queue(repo: &TestRepo, lines: &[String]) -> PathBuf {
    let paths = RpiPaths::new(repo.path());
    fs::create_dir_all(&paths.rpi_dir).expect("mkdir");
    fs::write(&paths.queue_path, format!("{}\n", lines.join("\n"))).expect("write queue");
    paths.queue_path
}

fn read_queue(path: &PathBuf) -> Vec<QueueEntry> {
    fs::read_to_string(path)
        .expect("read queue")
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("parse entry"))
        .collect()
}

fn loop_config(repo: &TestRepo) -> LoopConfig {
    LoopConfig {
        retry_backoff_secs: 0,
        kill_switch_path: repo.path().join(".agents/rpi/KILL"),
        ..LoopConfig::default()
    }
}

fn phased() -> PhasedOptions {
    PhasedOptions {
        no_worktree: true,
        max_retries: 2,
        ..PhasedOptions::default()
    }
}

/// Verifies a `[low, high]` queue runs the high item first and consumes both.
#[test]
fn queue_drains_highest_severity_first() {
    let repo = TestRepo::new().expect("repo");
    let queue = seed_queue(
        &repo,
        &[queue_line("tighten lint rules", "low"), queue_line("fix data race in cache", "high")],
    );
    let executor = ScriptedExecutor::succeeding();
    let gate = ScriptedGateEvaluator::passing();
    let checkpoints = RecordingCheckpoints::default();
    let cfg = loop_config(&repo);
    let opts = phased();
    let engine = PhasedEngine::new(&gate, &checkpoints).with_executor(&executor);
    let cycle = SupervisedCycle::new(&cfg, &opts, engine);

    let outcome = run_loop(repo.path(), None, &cfg, &cycle).expect("loop");

    assert_eq!(outcome.cycles_executed, 2);
    assert_eq!(outcome.stop, LoopStop::QueueEmpty);
    assert_eq!(executor.calls(), 6);
    let prompts = executor.prompts();
    assert!(prompts[0].1.contains("\"fix data race in cache\""));
    assert!(prompts[3].1.contains("\"tighten lint rules\""));
    for entry in read_queue(&queue) {
        assert!(entry.consumed);
        assert_eq!(entry.consumed_by.as_deref(), Some(LOOP_ID));
        assert!(entry.failed_at.is_none());
    }
}

/// Verifies an exhausted gate marks the entry failed and `continue` moves on.
#[test]
fn gate_escalation_marks_entry_failed_and_continues() {
    let repo = TestRepo::new().expect("repo");
    let queue = seed_queue(&repo, &[queue_line("broken", "high"), queue_line("fine", "medium")]);
    let executor = ScriptedExecutor::succeeding();
    let gate = ScriptedGateEvaluator::new(vec![gate_fail(1), gate_fail(1)]);
    let checkpoints = RecordingCheckpoints::default();
    let cfg = LoopConfig {
        failure_policy: FailurePolicy::Continue,
        ..loop_config(&repo)
    };
    let opts = phased();
    let engine = PhasedEngine::new(&gate, &checkpoints).with_executor(&executor);
    let cycle = SupervisedCycle::new(&cfg, &opts, engine);

    let outcome = run_loop(repo.path(), None, &cfg, &cycle).expect("loop");

    assert_eq!(outcome.cycles_executed, 2);
    assert_eq!(executor.calls(), 2 + 3);
    let entries = read_queue(&queue);
    assert!(entries[0].failed_at.is_some());
    assert!(!entries[0].consumed);
    assert!(entries[1].consumed);
}

/// Verifies `stop` returns the cycle error after marking the entry failed.
#[test]
fn executor_failure_stops_loop() {
    let repo = TestRepo::new().expect("repo");
    let queue = seed_queue(&repo, &[queue_line("crashes", "high"), queue_line("later", "low")]);
    let executor = ScriptedExecutor::failing_at(1, "claude exited with code 2");
    let gate = ScriptedGateEvaluator::passing();
    let checkpoints = RecordingCheckpoints::default();
    let cfg = loop_config(&repo);
    let opts = phased();
    let engine = PhasedEngine::new(&gate, &checkpoints).with_executor(&executor);
    let cycle = SupervisedCycle::new(&cfg, &opts, engine);

    let err = run_loop(repo.path(), None, &cfg, &cycle).unwrap_err();

    let text = format!("{err:#}");
    assert!(text.starts_with("task failure during phased engine"));
    assert!(text.contains("claude exited with code 2"));
    let entries = read_queue(&queue);
    assert!(entries[0].failed_at.is_some());
    assert!(!entries[1].consumed);
    assert!(entries[1].failed_at.is_none());
}

#[test]
fn explicit_goal_runs_once_without_queue() {
    let repo = TestRepo::new().expect("repo");
    let executor = ScriptedExecutor::succeeding();
    let gate = ScriptedGateEvaluator::passing();
    let checkpoints = RecordingCheckpoints::default();
    let cfg = LoopConfig {
        max_cycles: 5,
        ..loop_config(&repo)
    };
    let opts = phased();
    let engine = PhasedEngine::new(&gate, &checkpoints).with_executor(&executor);
    let cycle = SupervisedCycle::new(&cfg, &opts, engine);

    let outcome = run_loop(repo.path(), Some("add request tracing"), &cfg, &cycle).expect("loop");

    assert_eq!(outcome.stop, LoopStop::GoalCompleted);
    assert_eq!(outcome.cycles_executed, 1);
    assert_eq!(checkpoints.steps(), vec!["research", "implement", "validate"]);
}

/// Verifies a missing runtime binary stops the loop on the first cycle and
/// leaves every queue entry untouched, even under `continue`.
#[test]
fn missing_runtime_stops_loop_without_touching_queue() {
    let repo = TestRepo::new().expect("repo");
    let queue = seed_queue(&repo, &[queue_line("first", "high"), queue_line("second", "low")]);
    let before = fs::read_to_string(&queue).expect("read queue");
    let gate = ScriptedGateEvaluator::passing();
    let checkpoints = RecordingCheckpoints::default();
    let cfg = LoopConfig {
        failure_policy: FailurePolicy::Continue,
        cycle_retries: 1,
        ..loop_config(&repo)
    };
    let opts = PhasedOptions {
        runtime_command: "no-such-runtime-rpi".to_string(),
        ..phased()
    };
    let engine = PhasedEngine::new(&gate, &checkpoints);
    let cycle = SupervisedCycle::new(&cfg, &opts, engine);

    let err = run_loop(repo.path(), None, &cfg, &cycle).unwrap_err();

    let text = format!("{err:#}");
    assert!(text.starts_with("fatal failure during runtime preflight"));
    assert_eq!(text.matches("not found on PATH").count(), 1);
    assert_eq!(gate.calls(), 0);
    assert_eq!(fs::read_to_string(&queue).expect("read queue"), before);
}

/// Verifies a landing commit failure is an infrastructure failure: the entry
/// stays unconsumed and unfailed and the next cycle selects it again.
#[cfg(unix)]
#[test]
fn landing_failure_leaves_entry_for_next_cycle() {
    use std::os::unix::fs::PermissionsExt;

    let repo = TestRepo::new().expect("repo");
    let hook = repo.path().join(".git/hooks/pre-commit");
    fs::create_dir_all(hook.parent().expect("hooks dir")).expect("mkdir hooks");
    fs::write(&hook, "#!/bin/sh\necho 'commits are frozen' >&2\nexit 1\n").expect("write hook");
    fs::set_permissions(&hook, fs::Permissions::from_mode(0o755)).expect("chmod hook");
    let queue = seed_queue(&repo, &[queue_line("wire retry budget", "high")]);
    let executor = ScriptedExecutor::writing_file("agent.txt");
    let gate = ScriptedGateEvaluator::passing();
    let checkpoints = RecordingCheckpoints::default();
    let cfg = LoopConfig {
        max_cycles: 2,
        failure_policy: FailurePolicy::Continue,
        landing_policy: LandingPolicy::Commit,
        landing_lock_path: repo.path().join(".git/rpi-landing.lock"),
        ..loop_config(&repo)
    };
    let opts = phased();
    let engine = PhasedEngine::new(&gate, &checkpoints).with_executor(&executor);
    let cycle = SupervisedCycle::new(&cfg, &opts, engine);

    let outcome = run_loop(repo.path(), None, &cfg, &cycle).expect("loop");

    assert_eq!(outcome.stop, LoopStop::MaxCycles(2));
    assert_eq!(outcome.cycles_executed, 2);
    assert_eq!(executor.calls(), 6);
    let prompts = executor.prompts();
    assert!(prompts[0].1.contains("\"wire retry budget\""));
    assert!(prompts[3].1.contains("\"wire retry budget\""));
    let entries = read_queue(&queue);
    assert!(!entries[0].consumed);
    assert!(entries[0].failed_at.is_none());
    let head = repo.git_output(&["log", "-1", "--format=%s"]).expect("log");
    assert_eq!(head.trim(), "chore: init");
}
