//! Test doubles for the phased engine and the supervisor loop.
//!
//! Nothing here spawns an agent runtime: executors, gates and cycle runners
//! replay scripted outcomes and record what they were asked to do.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;

use crate::core::cycle_failure::{fatal_failure, infrastructure_failure, task_failure};
use crate::core::phase::Phase;
use crate::io::checkpoint::CheckpointRecorder;
use crate::io::executor::PhaseExecutor;
use crate::io::gates::{Finding, GateEvaluator, GateFailure};
use crate::io::orchestration_log::OrchestrationLog;
use crate::io::paths::RpiPaths;
use crate::io::run_state::RunState;
use crate::supervisor::CycleRunner;

/// A throwaway git repository with one commit on `main`.
pub struct TestRepo {
    _temp: TempDir,
    root: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let root = temp.path().join("repo");
        fs::create_dir_all(&root).context("create repo dir")?;
        let repo = Self { _temp: temp, root };
        repo.git(&["init", "-q", "-b", "main"])?;
        repo.git(&["config", "user.email", "test@example.com"])?;
        repo.git(&["config", "user.name", "test"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        fs::write(repo.root.join("README.md"), "hi\n").context("write README.md")?;
        repo.git(&["add", "-A"])?;
        repo.git(&["commit", "-q", "-m", "chore: init"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn git(&self, args: &[&str]) -> Result<()> {
        self.git_output(args).map(|_| ())
    }

    pub fn git_output(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Executor that succeeds except on one scripted call.
#[derive(Default)]
pub struct ScriptedExecutor {
    fail_at: Option<(usize, String)>,
    write_file: Option<String>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<(Phase, String)>>,
}

impl ScriptedExecutor {
    pub fn succeeding() -> Self {
        Self::default()
    }

    /// Fails the `call`-th execution (1-based) with `message`.
    pub fn failing_at(call: usize, message: &str) -> Self {
        Self {
            fail_at: Some((call, message.to_string())),
            ..Self::default()
        }
    }

    /// Writes `name` into the working directory on every call.
    pub fn writing_file(name: &str) -> Self {
        Self {
            write_file: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Phases and prompts in call order.
    pub fn prompts(&self) -> Vec<(Phase, String)> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl PhaseExecutor for ScriptedExecutor {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn execute(&self, prompt: &str, cwd: &Path, _run_id: &str, phase: Phase) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push((phase, prompt.to_string()));
        }
        if let Some((at, message)) = &self.fail_at
            && *at == call
        {
            return Err(anyhow!("{message}"));
        }
        if let Some(name) = &self.write_file {
            fs::write(cwd.join(name), format!("call {call}\n"))
                .with_context(|| format!("write {name}"))?;
        }
        Ok(())
    }
}

/// Gate that fails with queued failures in order, then passes.
#[derive(Default)]
pub struct ScriptedGateEvaluator {
    failures: Mutex<VecDeque<GateFailure>>,
    calls: AtomicUsize,
}

impl ScriptedGateEvaluator {
    pub fn passing() -> Self {
        Self::default()
    }

    pub fn new(failures: Vec<GateFailure>) -> Self {
        Self {
            failures: Mutex::new(failures.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl GateEvaluator for ScriptedGateEvaluator {
    fn evaluate(
        &self,
        phase: Phase,
        _spawn_paths: &RpiPaths,
        _state: &mut RunState,
        _log: &OrchestrationLog,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.failures.lock().ok().and_then(|mut queue| {
            let matches = queue.front().is_some_and(|f| f.phase == phase.number());
            if matches { queue.pop_front() } else { None }
        });
        match next {
            Some(failure) => Err(failure.into()),
            None => Ok(()),
        }
    }
}

/// A FAIL verdict for `phase` with one finding.
pub fn gate_fail(phase: u32) -> GateFailure {
    GateFailure {
        phase,
        verdict: "FAIL".to_string(),
        report: format!(".agents/council/phase-{phase}-report.md"),
        findings: vec![Finding {
            description: "missing error handling".to_string(),
            fix: "propagate the error".to_string(),
            reference: "src/lib.rs:1".to_string(),
        }],
    }
}

#[derive(Default)]
pub struct RecordingCheckpoints {
    steps: Mutex<Vec<String>>,
}

impl RecordingCheckpoints {
    pub fn steps(&self) -> Vec<String> {
        self.steps.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl CheckpointRecorder for RecordingCheckpoints {
    fn record(&self, step: &str) {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push(step.to_string());
        }
    }
}

/// Scripted result of one cycle attempt.
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Ok,
    Task(String),
    Infrastructure(String),
    Fatal(String),
}

/// Cycle runner replaying outcomes in order; succeeds once they run out.
#[derive(Default)]
pub struct ScriptedCycleRunner {
    outcomes: Mutex<VecDeque<CycleOutcome>>,
    goals: Mutex<Vec<String>>,
}

impl ScriptedCycleRunner {
    pub fn new(outcomes: Vec<CycleOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            goals: Mutex::new(Vec::new()),
        }
    }

    /// Goals of every attempt, in call order.
    pub fn goals(&self) -> Vec<String> {
        self.goals.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.goals().len()
    }
}

impl CycleRunner for ScriptedCycleRunner {
    fn run_cycle(&self, _cwd: &Path, goal: &str, _cycle: u32, _attempt: u32) -> Result<()> {
        if let Ok(mut goals) = self.goals.lock() {
            goals.push(goal.to_string());
        }
        let outcome = self
            .outcomes
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
            .unwrap_or(CycleOutcome::Ok);
        match outcome {
            CycleOutcome::Ok => Ok(()),
            CycleOutcome::Task(message) => Err(task_failure("phased engine", anyhow!("{message}"))),
            CycleOutcome::Infrastructure(message) => {
                Err(infrastructure_failure("landing", anyhow!("{message}")))
            }
            CycleOutcome::Fatal(message) => Err(fatal_failure("runtime preflight", anyhow!("{message}"))),
        }
    }
}
