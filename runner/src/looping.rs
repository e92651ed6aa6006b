//! Supervisor loop for `rpi loop`.
//!
//! Each cycle picks a goal (explicit, or the highest-severity queue item),
//! runs it through a [`CycleRunner`] with bounded retries and marks the queue
//! entry consumed or failed depending on the outcome. Fatal failures stop the
//! loop at once and leave the queue untouched.

use std::fs;
use std::path::Path;
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use tracing::{info, instrument, warn};

use crate::core::cycle_failure::{is_fatal, should_mark_failed};
use crate::core::queue::{QueueSelection, select_highest_severity};
use crate::io::config::{FailurePolicy, LoopConfig, format_duration};
use crate::io::lease::SupervisorLease;
use crate::io::paths::RpiPaths;
use crate::io::queue::{mark_consumed, mark_failed, read_entries};
use crate::io::worktree::generate_run_id;
use crate::signals::InterruptHook;
use crate::supervisor::CycleRunner;

/// Recorded as `consumed_by` on queue entries the loop completes.
pub const LOOP_ID: &str = "rpi-loop";

/// Reason why `run_loop` stopped without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// No explicit goal and nothing selectable in the queue.
    QueueEmpty,
    /// The explicit goal completed.
    GoalCompleted,
    MaxCycles(u32),
    KillSwitch,
    DryRun,
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    /// Cycles that actually ran the cycle runner.
    pub cycles_executed: u32,
    pub stop: LoopStop,
}

/// True when the kill-switch file exists. An empty path disables the switch.
pub fn kill_switch_set(path: &Path) -> Result<bool> {
    if path.as_os_str().is_empty() {
        return Ok(false);
    }
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => bail!("kill switch path is a directory: {}", path.display()),
        Ok(_) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("check kill switch {}", path.display())),
    }
}

/// Run cycles until the queue drains, the explicit goal completes, a limit is
/// reached or a failure stops the loop.
///
/// Errors are returned only under the `stop` failure policy (or for an
/// explicit goal), and for lease contention or an unreadable kill switch.
#[instrument(skip_all, fields(explicit = explicit_goal.is_some()))]
pub fn run_loop(
    cwd: &Path,
    explicit_goal: Option<&str>,
    cfg: &LoopConfig,
    runner: &dyn CycleRunner,
) -> Result<LoopOutcome> {
    let paths = RpiPaths::new(cwd);
    fs::create_dir_all(&paths.rpi_dir)
        .with_context(|| format!("create {}", paths.rpi_dir.display()))?;
    let explicit_goal = explicit_goal.map(str::trim).filter(|g| !g.is_empty());

    let lease = if cfg.lease && !cfg.dry_run {
        let run_id = generate_run_id();
        let lease = SupervisorLease::acquire(&cfg.lease_path, cfg.lease_ttl(), &run_id, cwd)?;
        println!("Supervisor lease acquired: {} (run={run_id})", lease.path().display());
        Some(lease)
    } else {
        None
    };

    let release_on_signal = lease.as_ref().map(|lease| {
        let release = lease.exit_releaser();
        InterruptHook::register(move |_signal| release())
    });

    let result = cycles(&paths, explicit_goal, cfg, runner);

    drop(release_on_signal);
    if let Some(lease) = lease
        && let Err(err) = lease.release()
    {
        warn!(err = %format!("{err:#}"), "could not release supervisor lease");
    }
    if let Ok(outcome) = &result {
        println!("\nRPI loop finished after {} cycle(s).", outcome.cycles_executed);
    }
    result
}

fn cycles(
    paths: &RpiPaths,
    explicit_goal: Option<&str>,
    cfg: &LoopConfig,
    runner: &dyn CycleRunner,
) -> Result<LoopOutcome> {
    let cwd = paths.root.as_path();
    let mut executed = 0u32;
    let mut cycle = 0u32;
    let stop = loop {
        cycle += 1;
        if cfg.max_cycles > 0 && cycle > cfg.max_cycles {
            println!("\nReached max cycles ({}). Stopping.", cfg.max_cycles);
            break LoopStop::MaxCycles(cfg.max_cycles);
        }
        if cycle > 1 && !cfg.cycle_delay().is_zero() {
            println!("\nSleeping {} before next cycle...", format_duration(cfg.cycle_delay()));
            thread::sleep(cfg.cycle_delay());
        }
        if kill_switch_set(&cfg.kill_switch_path)? {
            println!("Kill switch detected at {}. Stopping.", cfg.kill_switch_path.display());
            break LoopStop::KillSwitch;
        }

        println!("\n=== RPI Loop: Cycle {cycle} ===");

        let (goal, selection) = match explicit_goal {
            Some(goal) => (goal.to_string(), None),
            None => match select_from_queue(paths, &cfg.repo_filter) {
                Some(sel) => {
                    println!("From queue: {}", sel.item.title);
                    (sel.item.title.clone(), Some(sel))
                }
                None => {
                    println!("No unconsumed work in queue. Flywheel stable.");
                    break LoopStop::QueueEmpty;
                }
            },
        };

        if cfg.dry_run {
            println!("[dry-run] Would run phased engine for: {goal:?}");
            if explicit_goal.is_none() {
                println!("[dry-run] Queue not consumed in dry-run. Showing first cycle only.");
            }
            break LoopStop::DryRun;
        }

        println!("Running phased engine for: {goal:?}");
        executed += 1;
        let started = Instant::now();
        let result = run_with_retries(runner, cwd, &goal, cycle, cfg);
        let elapsed = format_duration(started.elapsed());

        match result {
            Ok(()) => {
                println!("Cycle {cycle} completed in {elapsed}");
                info!(cycle, "cycle completed");
                if let Some(sel) = &selection {
                    match mark_consumed(&paths.queue_path, sel.entry_index, LOOP_ID) {
                        Ok(()) => println!("Queue entry consumed: {:?}", sel.item.title),
                        Err(err) => {
                            warn!(err = %format!("{err:#}"), "could not mark queue entry consumed");
                        }
                    }
                }
                if explicit_goal.is_some() {
                    println!("Explicit goal completed.");
                    break LoopStop::GoalCompleted;
                }
            }
            Err(err) if is_fatal(&err) => {
                println!("Cycle {cycle} failed after {elapsed}: {err:#}");
                println!("Stopping loop: fatal failure, queue left unmodified.");
                return Err(err);
            }
            Err(err) => {
                println!("Cycle {cycle} failed after {elapsed}: {err:#}");
                if let Some(sel) = &selection {
                    record_failure(paths, sel, &err);
                }
                if cfg.failure_policy == FailurePolicy::Continue && explicit_goal.is_none() {
                    println!(
                        "Failure policy {:?}: continuing to next queue item.",
                        cfg.failure_policy.as_str()
                    );
                    continue;
                }
                println!("Stopping loop due to failure policy.");
                return Err(err);
            }
        }
    };

    Ok(LoopOutcome {
        cycles_executed: executed,
        stop,
    })
}

fn select_from_queue(paths: &RpiPaths, repo_filter: &str) -> Option<QueueSelection> {
    let entries = read_entries(&paths.queue_path).unwrap_or_else(|err| {
        warn!(err = %format!("{err:#}"), "could not read work queue");
        Vec::new()
    });
    select_highest_severity(&entries, repo_filter)
}

/// Run one cycle up to `1 + cycle_retries` times; the last error wins.
/// Fatal errors are returned without retrying.
fn run_with_retries(
    runner: &dyn CycleRunner,
    cwd: &Path,
    goal: &str,
    cycle: u32,
    cfg: &LoopConfig,
) -> Result<()> {
    let max_attempts = cfg.cycle_retries + 1;
    let mut attempt = 1;
    loop {
        let err = match runner.run_cycle(cwd, goal, cycle, attempt) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if attempt >= max_attempts || is_fatal(&err) {
            return Err(err);
        }
        println!("Cycle {cycle} attempt {attempt}/{max_attempts} failed: {err:#}");
        if !cfg.retry_backoff().is_zero() {
            println!("Retrying in {}...", format_duration(cfg.retry_backoff()));
            thread::sleep(cfg.retry_backoff());
        }
        attempt += 1;
    }
}

/// Task failures mark the entry failed; infrastructure failures leave it selectable.
fn record_failure(paths: &RpiPaths, sel: &QueueSelection, err: &anyhow::Error) {
    if !should_mark_failed(err) {
        println!("Queue entry left unmodified (transient infra failure): {:?}", sel.item.title);
        return;
    }
    match mark_failed(&paths.queue_path, sel.entry_index) {
        Ok(()) => println!(
            "Queue entry marked failed (set consumed=false to retry): {:?}",
            sel.item.title
        ),
        Err(err) => warn!(err = %format!("{err:#}"), "could not mark queue entry failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::queue::{QueueEntry, WorkItem};
    use crate::test_support::{CycleOutcome, ScriptedCycleRunner};

    fn entry(title: &str, severity: &str) -> String {
        let entry = QueueEntry {
            source_epic: "ag-1".to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            items: vec![WorkItem {
                title: title.to_string(),
                severity: severity.to_string(),
                ..WorkItem::default()
            }],
            ..QueueEntry::default()
        };
        serde_json::to_string(&entry).expect("serialize")
    }

    fn write_queue(root: &Path, lines: &[String]) -> RpiPaths {
        let paths = RpiPaths::new(root);
        fs::create_dir_all(&paths.rpi_dir).expect("mkdir");
        fs::write(&paths.queue_path, format!("{}\n", lines.join("\n"))).expect("write queue");
        paths
    }

    fn raw_entries(paths: &RpiPaths) -> Vec<QueueEntry> {
        fs::read_to_string(&paths.queue_path)
            .expect("read queue")
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).expect("parse"))
            .collect()
    }

    fn config(root: &Path) -> LoopConfig {
        LoopConfig {
            retry_backoff_secs: 0,
            kill_switch_path: root.join(".agents/rpi/KILL"),
            ..LoopConfig::default()
        }
    }

    #[test]
    fn kill_switch_states() {
        let temp = tempfile::tempdir().expect("tempdir");
        let kill = temp.path().join("KILL");
        assert!(!kill_switch_set(&kill).expect("missing"));
        assert!(!kill_switch_set(Path::new("")).expect("empty"));
        fs::write(&kill, "stop\n").expect("write");
        assert!(kill_switch_set(&kill).expect("present"));
        let err = kill_switch_set(temp.path()).unwrap_err();
        assert!(err.to_string().starts_with("kill switch path is a directory"));
    }

    /// Verifies the high-severity item runs first and both entries end
    /// consumed by the loop.
    #[test]
    fn drains_queue_by_severity() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = write_queue(temp.path(), &[entry("A", "low"), entry("B", "high")]);
        let runner = ScriptedCycleRunner::default();

        let outcome = run_loop(temp.path(), None, &config(temp.path()), &runner).expect("loop");

        assert_eq!(runner.goals(), vec!["B", "A"]);
        assert_eq!(outcome.cycles_executed, 2);
        assert_eq!(outcome.stop, LoopStop::QueueEmpty);
        for entry in raw_entries(&paths) {
            assert!(entry.consumed);
            assert_eq!(entry.consumed_by.as_deref(), Some(LOOP_ID));
            assert!(entry.consumed_at.is_some());
        }
    }

    /// Verifies infrastructure failures retry per cycle and never mark the entry.
    #[test]
    fn infrastructure_failure_leaves_entry_selectable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = write_queue(temp.path(), &[entry("flaky", "high")]);
        let outcomes = vec![CycleOutcome::Infrastructure("push rejected".to_string()); 4];
        let runner = ScriptedCycleRunner::new(outcomes);
        let cfg = LoopConfig {
            max_cycles: 2,
            cycle_retries: 1,
            failure_policy: FailurePolicy::Continue,
            ..config(temp.path())
        };

        let outcome = run_loop(temp.path(), None, &cfg, &runner).expect("loop");

        assert_eq!(runner.calls(), 4);
        assert_eq!(outcome.stop, LoopStop::MaxCycles(2));
        let entries = raw_entries(&paths);
        assert!(!entries[0].consumed);
        assert!(entries[0].failed_at.is_none());
    }

    /// Verifies a task failure under `stop` marks the entry failed and errors.
    #[test]
    fn task_failure_stops_and_marks_failed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = write_queue(temp.path(), &[entry("broken", "medium"), entry("next", "low")]);
        let runner = ScriptedCycleRunner::new(vec![CycleOutcome::Task("tests failed".to_string())]);

        let err = run_loop(temp.path(), None, &config(temp.path()), &runner).unwrap_err();

        assert!(format!("{err:#}").contains("tests failed"));
        assert_eq!(runner.goals(), vec!["broken"]);
        let entries = raw_entries(&paths);
        assert!(entries[0].failed_at.is_some());
        assert!(!entries[0].consumed);
        assert!(entries[1].failed_at.is_none());
    }

    #[test]
    fn continue_policy_moves_past_task_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = write_queue(temp.path(), &[entry("broken", "high"), entry("next", "low")]);
        let runner = ScriptedCycleRunner::new(vec![CycleOutcome::Task("boom".to_string())]);
        let cfg = LoopConfig {
            failure_policy: FailurePolicy::Continue,
            ..config(temp.path())
        };

        let outcome = run_loop(temp.path(), None, &cfg, &runner).expect("loop");

        assert_eq!(runner.goals(), vec!["broken", "next"]);
        assert_eq!(outcome.stop, LoopStop::QueueEmpty);
        let entries = raw_entries(&paths);
        assert!(entries[0].failed_at.is_some());
        assert!(entries[1].consumed);
    }

    /// Verifies a fatal failure is not retried, stops even under `continue`
    /// and leaves every entry untouched.
    #[test]
    fn fatal_failure_stops_without_marking() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = write_queue(temp.path(), &[entry("A", "high"), entry("B", "low")]);
        let runner = ScriptedCycleRunner::new(vec![CycleOutcome::Fatal("claude not on PATH".to_string())]);
        let cfg = LoopConfig {
            cycle_retries: 2,
            failure_policy: FailurePolicy::Continue,
            ..config(temp.path())
        };

        let err = run_loop(temp.path(), None, &cfg, &runner).unwrap_err();

        assert!(is_fatal(&err));
        assert_eq!(runner.goals(), vec!["A"]);
        for entry in raw_entries(&paths) {
            assert!(!entry.consumed);
            assert!(entry.failed_at.is_none());
        }
    }

    #[test]
    fn kill_switch_stops_before_cycle() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_queue(temp.path(), &[entry("A", "high")]);
        let cfg = config(temp.path());
        fs::write(&cfg.kill_switch_path, "").expect("kill");
        let runner = ScriptedCycleRunner::default();

        let outcome = run_loop(temp.path(), None, &cfg, &runner).expect("loop");

        assert_eq!(outcome.stop, LoopStop::KillSwitch);
        assert_eq!(runner.calls(), 0);
    }

    /// Verifies an explicit goal runs once and leaves the queue alone.
    #[test]
    fn explicit_goal_runs_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = write_queue(temp.path(), &[entry("queued", "high")]);
        let runner = ScriptedCycleRunner::default();

        let outcome =
            run_loop(temp.path(), Some("add retries"), &config(temp.path()), &runner).expect("loop");

        assert_eq!(outcome.stop, LoopStop::GoalCompleted);
        assert_eq!(runner.goals(), vec!["add retries"]);
        assert!(!raw_entries(&paths)[0].consumed);
    }

    #[test]
    fn dry_run_consumes_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = write_queue(temp.path(), &[entry("A", "high")]);
        let cfg = LoopConfig {
            dry_run: true,
            lease: true,
            lease_path: temp.path().join("lease.lock"),
            ..config(temp.path())
        };
        let runner = ScriptedCycleRunner::default();

        let outcome = run_loop(temp.path(), None, &cfg, &runner).expect("loop");

        assert_eq!(outcome.stop, LoopStop::DryRun);
        assert_eq!(runner.calls(), 0);
        assert!(!raw_entries(&paths)[0].consumed);
        assert!(!cfg.lease_path.exists());
    }

    #[test]
    fn lease_is_released_after_loop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = LoopConfig {
            lease: true,
            lease_path: temp.path().join(".agents/rpi/supervisor.lock"),
            ..config(temp.path())
        };
        let runner = ScriptedCycleRunner::default();

        let outcome = run_loop(temp.path(), None, &cfg, &runner).expect("loop");

        assert_eq!(outcome.stop, LoopStop::QueueEmpty);
        assert!(!cfg.lease_path.exists());
    }
}
