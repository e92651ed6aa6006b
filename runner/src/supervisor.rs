//! One supervised cycle: heal, run the phased engine, gate, land, clean up.

use std::path::Path;

use anyhow::Result;
use tracing::{instrument, warn};

use crate::core::cycle_failure::{fatal_failure, infrastructure_failure, task_failure};
use crate::io::cleanup::{CleanupOptions, execute_cleanup};
use crate::io::config::{LandingPolicy, LoopConfig, PhasedOptions};
use crate::io::executor::is_runtime_unavailable;
use crate::io::gate_scripts::run_supervisor_gates;
use crate::io::git::Git;
use crate::io::landing::{LandingRequest, LandingScope, run_landing};
use crate::io::worktree::{BranchAttachment, ensure_attached_branch};
use crate::phased::PhasedEngine;

/// Runs one attempt of one loop cycle for `goal`.
///
/// Errors should be [`CycleFailure`](crate::core::cycle_failure::CycleFailure)s
/// so the loop can tell task failures from infrastructure failures.
pub trait CycleRunner {
    fn run_cycle(&self, cwd: &Path, goal: &str, cycle: u32, attempt: u32) -> Result<()>;
}

/// The production cycle built on the phased engine and the loop policies.
pub struct SupervisedCycle<'a> {
    cfg: &'a LoopConfig,
    phased: &'a PhasedOptions,
    engine: PhasedEngine<'a>,
}

impl<'a> SupervisedCycle<'a> {
    pub fn new(cfg: &'a LoopConfig, phased: &'a PhasedOptions, engine: PhasedEngine<'a>) -> Self {
        let stale_after = cfg.auto_clean.then(|| cfg.auto_clean_stale_after());
        Self {
            cfg,
            phased,
            engine: engine.with_auto_clean(stale_after),
        }
    }

    fn heal_detached_head(&self, cwd: &Path) -> Result<()> {
        if !self.cfg.detached_heal {
            return Ok(());
        }
        let attachment = ensure_attached_branch(
            cwd,
            self.cfg.command_timeout(),
            &self.cfg.detached_branch_prefix,
        )
        .map_err(|err| infrastructure_failure("detached-head self-heal", err))?;
        if let BranchAttachment::Healed(branch) = attachment {
            println!("Detached HEAD detected. Switched to branch: {branch}");
        }
        Ok(())
    }

    fn run_stages(&self, cwd: &Path, goal: &str, cycle: u32, attempt: u32, scope: Option<&LandingScope>) -> Result<()> {
        self.engine.run(cwd, Some(goal), self.phased).map_err(|err| {
            if is_runtime_unavailable(&err) {
                fatal_failure("runtime preflight", err)
            } else {
                task_failure("phased engine", err)
            }
        })?;
        run_supervisor_gates(cwd, self.cfg).map_err(|err| task_failure("quality gates", err))?;
        let request = LandingRequest {
            cycle,
            attempt,
            goal,
            bd_command: &self.phased.bd_command,
        };
        run_landing(cwd, self.cfg, request, scope)
            .map_err(|err| infrastructure_failure("landing", err))
    }

    /// Supervisor cleanup after the cycle. A cleanup error only surfaces when
    /// the cycle itself succeeded.
    fn deferred_cleanup(&self, cwd: &Path, result: Result<()>) -> Result<()> {
        let opts = CleanupOptions {
            all: true,
            prune_worktrees: self.cfg.cleanup_prune_worktrees,
            prune_branches: self.cfg.cleanup_prune_branches,
            dry_run: self.cfg.dry_run,
            stale_after: self.cfg.auto_clean_stale_after(),
            ..CleanupOptions::default()
        };
        let Err(cleanup_err) = execute_cleanup(cwd, &opts) else {
            return result;
        };
        match result {
            Ok(()) => Err(infrastructure_failure("supervisor cleanup", cleanup_err)),
            Err(err) => {
                warn!(err = %format!("{cleanup_err:#}"), "supervisor cleanup after failure");
                Err(err)
            }
        }
    }
}

impl CycleRunner for SupervisedCycle<'_> {
    #[instrument(skip_all, fields(cycle, attempt))]
    fn run_cycle(&self, cwd: &Path, goal: &str, cycle: u32, attempt: u32) -> Result<()> {
        self.heal_detached_head(cwd)?;
        let scope = if self.cfg.landing_policy == LandingPolicy::Off {
            None
        } else {
            let git = Git::new(cwd).with_timeout(self.cfg.command_timeout());
            Some(
                LandingScope::capture(&git)
                    .map_err(|err| infrastructure_failure("capture landing scope", err))?,
            )
        };

        let result = self.run_stages(cwd, goal, cycle, attempt, scope.as_ref());
        if self.cfg.ensure_cleanup {
            return self.deferred_cleanup(cwd, result);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cycle_failure::{CycleFailure, FailureKind};
    use crate::core::gate_policy::MemrlMode;
    use crate::io::config::GatePolicy;
    use crate::test_support::{RecordingCheckpoints, ScriptedExecutor, ScriptedGateEvaluator, TestRepo};
    use std::fs;
    use std::path::PathBuf;

    fn phased() -> PhasedOptions {
        PhasedOptions {
            no_worktree: true,
            ..PhasedOptions::default()
        }
    }

    fn kind(err: &anyhow::Error) -> (FailureKind, String) {
        let failure = err.downcast_ref::<CycleFailure>().expect("cycle failure");
        (failure.kind, failure.stage.clone())
    }

    /// Verifies engine failures are task failures.
    #[test]
    fn engine_failure_is_task_failure() {
        let repo = TestRepo::new().expect("repo");
        let executor = ScriptedExecutor::failing_at(1, "boom");
        let gate = ScriptedGateEvaluator::passing();
        let checkpoints = RecordingCheckpoints::default();
        let cfg = LoopConfig::default();
        let opts = phased();
        let engine = PhasedEngine::new(&gate, &checkpoints)
            .with_executor(&executor)
            .with_memrl_mode(MemrlMode::Off);

        let err = SupervisedCycle::new(&cfg, &opts, engine)
            .run_cycle(repo.path(), "fix typo", 1, 1)
            .unwrap_err();
        assert_eq!(kind(&err), (FailureKind::Task, "phased engine".to_string()));
    }

    /// Verifies a missing runtime binary is fatal rather than a task failure.
    #[test]
    fn missing_runtime_is_fatal() {
        let repo = TestRepo::new().expect("repo");
        let gate = ScriptedGateEvaluator::passing();
        let checkpoints = RecordingCheckpoints::default();
        let cfg = LoopConfig::default();
        let opts = PhasedOptions {
            runtime_command: "no-such-runtime-rpi".to_string(),
            ..phased()
        };
        let engine = PhasedEngine::new(&gate, &checkpoints);

        let err = SupervisedCycle::new(&cfg, &opts, engine)
            .run_cycle(repo.path(), "fix typo", 1, 1)
            .unwrap_err();
        assert_eq!(kind(&err), (FailureKind::Fatal, "runtime preflight".to_string()));
        assert_eq!(gate.calls(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn required_gate_failure_is_task_failure() {
        let repo = TestRepo::new().expect("repo");
        fs::write(repo.path().join("fast.sh"), "exit 3\n").expect("write");
        let executor = ScriptedExecutor::succeeding();
        let gate = ScriptedGateEvaluator::passing();
        let checkpoints = RecordingCheckpoints::default();
        let cfg = LoopConfig {
            gate_policy: GatePolicy::Required,
            validate_fast_script: PathBuf::from("fast.sh"),
            security_gate_script: PathBuf::new(),
            ..LoopConfig::default()
        };
        let opts = phased();
        let engine = PhasedEngine::new(&gate, &checkpoints).with_executor(&executor);

        let err = SupervisedCycle::new(&cfg, &opts, engine)
            .run_cycle(repo.path(), "fix typo", 1, 1)
            .unwrap_err();
        assert_eq!(kind(&err), (FailureKind::Task, "quality gates".to_string()));
        assert_eq!(executor.calls(), 3);
    }

    /// Verifies the commit landing policy commits what the cycle produced.
    #[test]
    fn commit_landing_after_success() {
        let repo = TestRepo::new().expect("repo");
        let executor = ScriptedExecutor::writing_file("agent.txt");
        let gate = ScriptedGateEvaluator::passing();
        let checkpoints = RecordingCheckpoints::default();
        let cfg = LoopConfig {
            landing_policy: LandingPolicy::Commit,
            landing_commit_message: "feat: {{goal}} #{{cycle}}".to_string(),
            landing_lock_path: repo.path().join(".git/rpi-landing.lock"),
            ..LoopConfig::default()
        };
        let opts = phased();
        let engine = PhasedEngine::new(&gate, &checkpoints).with_executor(&executor);

        SupervisedCycle::new(&cfg, &opts, engine)
            .run_cycle(repo.path(), "add cache", 4, 1)
            .expect("cycle");
        let git = Git::new(repo.path());
        let log = repo.git_output(&["log", "-1", "--format=%s"]).expect("log");
        assert_eq!(log.trim(), "feat: add cache #4");
        assert!(!git.dirty_paths().expect("dirty").contains("agent.txt"));
        assert!(!cfg.landing_lock_path.exists());
    }
}
