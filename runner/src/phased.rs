//! The phased engine: discovery, implementation and validation sessions run
//! sequentially in an isolated worktree, each followed by a gate.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::complexity::{Complexity, classify_complexity};
use crate::core::gate_policy::{GateAction, MemrlMode, classify_failure, decide};
use crate::core::phase::{ALL_PHASES, Phase, TerminalStatus};
use crate::io::checkpoint::{CheckpointRecorder, RatchetCheckpointRecorder};
use crate::io::cleanup::{CleanupOptions, execute_cleanup};
use crate::io::config::{PhasedOptions, format_duration};
use crate::io::executor::{PhaseExecutor, build_executor, preflight_runtime};
use crate::io::gates::{CouncilGateEvaluator, GateEvaluator, GateFailure};
use crate::io::live_status::LiveStatus;
use crate::io::orchestration_log::OrchestrationLog;
use crate::io::paths::RpiPaths;
use crate::io::phase_result::{PhaseResult, PhaseStatus, clean_phase_artifacts, write_phase_result};
use crate::io::prompt::{build_phase_prompt, build_retry_prompt, prompt_preview};
use crate::io::run_state::{
    RunState, load_latest_run_state, load_run_state, now_rfc3339, save_run_state, write_heartbeat,
};
use crate::io::summaries::{handoff_detected, write_fallback_summary};
use crate::io::worktree::{
    CreatedWorktree, WORKTREE_TIMEOUT, create_worktree, finalize_worktree, generate_run_id,
};
use crate::signals::{InterruptHook, TerminalSlot};

const PROMPT_PREVIEW_CHARS: usize = 160;

/// Runs the phase lifecycle against pluggable executor, gate and checkpoint seams.
pub struct PhasedEngine<'a> {
    gate: &'a dyn GateEvaluator,
    checkpoints: &'a dyn CheckpointRecorder,
    executor: Option<&'a dyn PhaseExecutor>,
    memrl_mode: MemrlMode,
    auto_clean_stale_after: Option<Duration>,
}

/// Per-run paths and sinks shared by every phase.
struct RunContext<'r> {
    root_paths: RpiPaths,
    spawn_paths: RpiPaths,
    spawn_cwd: PathBuf,
    log: OrchestrationLog,
    live: LiveStatus,
    executor: &'r dyn PhaseExecutor,
    start: Phase,
}

impl<'a> PhasedEngine<'a> {
    pub fn new(gate: &'a dyn GateEvaluator, checkpoints: &'a dyn CheckpointRecorder) -> Self {
        Self {
            gate,
            checkpoints,
            executor: None,
            memrl_mode: MemrlMode::from_env(),
            auto_clean_stale_after: None,
        }
    }

    /// Use `executor` instead of selecting a backend from the options.
    pub fn with_executor(mut self, executor: &'a dyn PhaseExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_memrl_mode(mut self, mode: MemrlMode) -> Self {
        self.memrl_mode = mode;
        self
    }

    /// Clean stale runs older than `min_age` before starting.
    pub fn with_auto_clean(mut self, min_age: Option<Duration>) -> Self {
        self.auto_clean_stale_after = min_age;
        self
    }

    /// Run every phase from `opts.from` for `goal` rooted at `cwd`.
    ///
    /// Returns the final run state. Any failure leaves a `failed` terminal
    /// state behind before propagating.
    #[instrument(skip_all, fields(cwd = %cwd.display()))]
    pub fn run(&self, cwd: &Path, goal: Option<&str>, opts: &PhasedOptions) -> Result<RunState> {
        opts.validate()?;
        if self.executor.is_none() && !opts.dry_run {
            preflight_runtime(&opts.runtime_command)?;
        }
        if let Some(min_age) = self.auto_clean_stale_after {
            println!(
                "Auto-cleaning stale runs older than {} before starting",
                format_duration(min_age)
            );
            let cleanup = CleanupOptions {
                all: true,
                dry_run: opts.dry_run,
                stale_after: min_age,
                ..CleanupOptions::default()
            };
            if let Err(err) = execute_cleanup(cwd, &cleanup) {
                warn!(err = %format!("{err:#}"), "auto-clean of stale runs failed");
            }
        }

        let root_paths = RpiPaths::new(cwd);
        let (goal, start) = resolve_goal_and_start_phase(&root_paths, goal, &opts.from)?;
        let mut state = RunState::new(&goal, start.number(), opts);
        state.phase = start.number();
        let spawn_cwd = resume_state_if_needed(&root_paths, cwd, start, &goal, &mut state)?;
        state.complexity = Some(classify_complexity(&state.goal));

        let created = self.setup_worktree(cwd, opts, &mut state)?;
        let spawn_cwd = created
            .as_ref()
            .map_or(spawn_cwd, |created| created.path.clone());
        if state.run_id.is_empty() {
            state.run_id = generate_run_id();
        }
        state.orchestrator_pid = Some(std::process::id());

        let spawn_paths = RpiPaths::new(&spawn_cwd);
        for dir in [&root_paths.rpi_dir, &spawn_paths.rpi_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("create state directory {}", dir.display()))?;
        }
        if start == Phase::Discovery {
            clean_phase_artifacts(&spawn_paths);
        }
        let log = OrchestrationLog::new(&root_paths.log_path);
        let live = LiveStatus::new(&spawn_paths.live_status_path);

        println!("\n=== RPI Phased: {} ===", state.goal);
        println!("Starting from phase {} ({})", start.number(), start.name());
        println!("Monitor in a second terminal: rpi status");
        if let Some(complexity) = state.complexity {
            println!("Complexity: {}", complexity.as_str());
        }
        if opts.live_status {
            println!("Live phase status file: {}", live.path().display());
            if let Err(err) = live.write(start) {
                warn!(err = %format!("{err:#}"), "could not initialize live status");
            }
        }
        log.log(
            &state.run_id,
            "start",
            &format!("goal={:?} from={}", state.goal, opts.from),
        );

        let built;
        let executor: &dyn PhaseExecutor = match self.executor {
            Some(executor) => {
                println!("Executor backend: {} (provided by caller)", executor.name());
                executor
            }
            None => {
                let (executor, selection) = build_executor(opts, &live);
                println!("Executor backend: {} ({})", executor.name(), selection.reason);
                built = executor;
                built.as_ref()
            }
        };
        log.log(&state.run_id, "start", &format!("backend={}", executor.name()));
        state.backend = Some(executor.name().to_string());
        if let Err(err) = save_run_state(&root_paths, &state) {
            warn!(err = %format!("{err:#}"), "could not persist startup state");
        }
        write_heartbeat(&root_paths, &state.run_id);

        let slot = TerminalSlot::new();
        let hook = register_interrupt_hook(&root_paths, &state, &slot);
        let ctx = RunContext {
            root_paths,
            spawn_paths,
            spawn_cwd,
            log,
            live,
            executor,
            start,
        };

        let result = self.run_phase_loop(&ctx, &mut state, opts);
        drop(hook);
        let result = self.finish(&ctx, &mut state, &slot, opts, result);

        if let Some(created) = &created {
            let finalized = finalize_worktree(created, result.is_ok(), &ctx.log, WORKTREE_TIMEOUT);
            if let (Ok(_), Err(err)) = (&result, finalized) {
                return Err(err);
            }
        }
        result.map(|()| state)
    }

    fn setup_worktree(
        &self,
        cwd: &Path,
        opts: &PhasedOptions,
        state: &mut RunState,
    ) -> Result<Option<CreatedWorktree>> {
        if opts.no_worktree || opts.dry_run || state.worktree_path.is_some() {
            return Ok(None);
        }
        let created = create_worktree(cwd, WORKTREE_TIMEOUT).context("create worktree")?;
        println!("Worktree created: {} (detached)", created.path.display());
        state.worktree_path = Some(created.path.clone());
        state.run_id = created.run_id.clone();
        Ok(Some(created))
    }

    fn finish(
        &self,
        ctx: &RunContext<'_>,
        state: &mut RunState,
        slot: &TerminalSlot,
        opts: &PhasedOptions,
        result: Result<()>,
    ) -> Result<()> {
        if opts.dry_run {
            return result;
        }
        let (status, reason) = match &result {
            Ok(()) => (TerminalStatus::Completed, "all phases completed".to_string()),
            Err(err) => (TerminalStatus::Failed, format!("{err:#}")),
        };
        if slot.claim() {
            state.mark_terminal(status, reason);
            if let Err(err) = save_run_state(&ctx.root_paths, state) {
                warn!(err = %format!("{err:#}"), "could not persist terminal state");
            }
        }
        if result.is_ok() {
            write_final_report(state, &ctx.log);
        }
        result
    }

    fn run_phase_loop(&self, ctx: &RunContext<'_>, state: &mut RunState, opts: &PhasedOptions) -> Result<()> {
        for phase in ALL_PHASES.into_iter().filter(|p| *p >= ctx.start) {
            if phase == Phase::Validation
                && state.fast_path
                && state.complexity == Some(Complexity::Fast)
            {
                println!("\n--- Phase 3: validation (skipped, complexity: fast) ---");
                ctx.log.log(&state.run_id, phase.name(), "skipped: complexity fast");
                continue;
            }
            if let Err(err) = self.run_single_phase(ctx, state, phase, opts) {
                ctx.log.log(&state.run_id, phase.name(), &format!("FATAL: {err:#}"));
                ctx.log.log_failure_context(&state.run_id, phase.name(), &err);
                return Err(err.context(format!("phase {}", phase.name())));
            }
        }
        Ok(())
    }

    #[instrument(skip_all, fields(phase = phase.number(), run_id = %state.run_id))]
    fn run_single_phase(
        &self,
        ctx: &RunContext<'_>,
        state: &mut RunState,
        phase: Phase,
        opts: &PhasedOptions,
    ) -> Result<()> {
        let (number, name) = (phase.number(), phase.name());
        println!("\n--- Phase {number}: {name} ---");
        state.phase = number;
        if let Err(err) = save_run_state(&ctx.root_paths, state) {
            warn!(err = %format!("{err:#}"), "could not persist phase start state");
        }

        let prompt = build_phase_prompt(&ctx.spawn_paths, phase, state)
            .with_context(|| format!("build prompt for phase {number}"))?;
        ctx.log.log(&state.run_id, name, "started");
        let attempts = state.attempts_for(&phase.attempt_key());
        if opts.live_status {
            ctx.live.record_attempt(phase, "starting", attempts, "");
        }

        if opts.dry_run {
            println!(
                "[dry-run] Would spawn: {} -p '{}'",
                opts.runtime_command,
                prompt_preview(&prompt, PROMPT_PREVIEW_CHARS)
            );
            if !opts.no_worktree && phase == ctx.start {
                let base = ctx
                    .spawn_cwd
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_default();
                println!(
                    "[dry-run] Would create worktree: ../{base}-rpi-{}/ (detached)",
                    generate_run_id()
                );
            }
            ctx.log.log(&state.run_id, name, "dry-run");
            return Ok(());
        }

        println!(
            "Spawning: {} -p '{}'",
            opts.runtime_command,
            prompt_preview(&prompt, PROMPT_PREVIEW_CHARS)
        );
        let started_at = now_rfc3339();
        let started = Instant::now();
        write_heartbeat(&ctx.root_paths, &state.run_id);

        if let Err(err) = ctx
            .executor
            .execute(&prompt, &ctx.spawn_cwd, &state.run_id, phase)
        {
            if opts.live_status {
                ctx.live.record_attempt(phase, "failed", attempts, &format!("{err:#}"));
            }
            ctx.log.log(&state.run_id, name, &format!("FAILED: {err:#}"));
            let mut result = PhaseResult::new(&state.run_id, phase, PhaseStatus::Failed, &started_at);
            result.retries = attempts;
            result.error = Some(format!("{err:#}"));
            result.backend = Some(ctx.executor.name().to_string());
            result.completed_at = Some(now_rfc3339());
            if let Err(write_err) = write_phase_result(&ctx.spawn_paths, &result) {
                warn!(err = %format!("{write_err:#}"), "could not write failed phase result");
            }
            return Err(err.context(format!("phase {number} ({name}) failed")));
        }

        let elapsed = Duration::from_secs(started.elapsed().as_secs());
        println!("Phase {number} completed in {}", format_duration(elapsed));
        ctx.log.log(
            &state.run_id,
            name,
            &format!("completed in {}", format_duration(elapsed)),
        );
        if opts.live_status {
            ctx.live.record_attempt(phase, "completed", attempts, "");
        }

        let mut result = PhaseResult::new(&state.run_id, phase, PhaseStatus::Completed, &started_at);
        result.retries = attempts;
        result.backend = Some(ctx.executor.name().to_string());
        result.verdicts = state.verdicts.clone();
        result.completed_at = Some(now_rfc3339());
        result.duration_seconds = Some(started.elapsed().as_secs_f64());
        if let Err(err) = write_phase_result(&ctx.spawn_paths, &result) {
            warn!(err = %format!("{err:#}"), "could not write phase result");
        }
        write_heartbeat(&ctx.root_paths, &state.run_id);

        self.gate_with_retry(ctx, state, phase, opts)?;

        if handoff_detected(&ctx.spawn_paths, phase) {
            println!("Phase {number}: handoff detected, phase reported context degradation");
            ctx.log
                .log(&state.run_id, name, "HANDOFF detected: context degradation");
        }
        write_fallback_summary(&ctx.spawn_paths, state, phase);
        self.checkpoints.record(phase.checkpoint_step());
        if let Err(err) = save_run_state(&ctx.root_paths, state) {
            warn!(err = %format!("{err:#}"), "could not save state");
        }
        Ok(())
    }

    /// Evaluate the gate; on a [`GateFailure`] consult the retry policy and
    /// re-run the phase with the retry prompt until it passes or escalates.
    fn gate_with_retry(
        &self,
        ctx: &RunContext<'_>,
        state: &mut RunState,
        phase: Phase,
        opts: &PhasedOptions,
    ) -> Result<()> {
        let name = phase.name();
        let mut retried = false;
        loop {
            let err = match self.gate.evaluate(phase, &ctx.spawn_paths, state, &ctx.log) {
                Ok(()) => {
                    if retried && opts.live_status {
                        let attempts = state.attempts_for(&phase.attempt_key());
                        ctx.live.record_attempt(phase, "retry succeeded", attempts, "");
                    }
                    return Ok(());
                }
                Err(err) => err,
            };
            let Some(failure) = err.downcast_ref::<GateFailure>().cloned() else {
                return Err(err);
            };

            let attempt = {
                let counter = state.attempts.entry(phase.attempt_key()).or_insert(0);
                *counter += 1;
                *counter
            };
            let max = opts.max_retries;
            if opts.live_status {
                ctx.live.record_attempt(
                    phase,
                    &format!("retrying after {}", failure.verdict),
                    attempt,
                    "",
                );
            }
            let decision = decide(
                self.memrl_mode,
                classify_failure(phase, &failure.verdict),
                attempt,
                max,
            );
            ctx.log.log(&state.run_id, name, &decision.log_line());
            debug!(attempt, max, action = decision.action.as_str(), "gate retry decision");

            if decision.action == GateAction::Escalate {
                let msg = format!(
                    "{name} escalated (mode={}, action={}, rule={}, attempt={attempt}/{max}). Last report: {}. Manual intervention needed.",
                    decision.mode.as_str(),
                    decision.action.as_str(),
                    decision.rule.as_str(),
                    failure.report
                );
                println!("{msg}");
                if opts.live_status {
                    ctx.live
                        .record_attempt(phase, "failed after retries", attempt, &failure.report);
                }
                ctx.log.log(&state.run_id, name, &msg);
                return Err(err.context(format!(
                    "phase {} ({name}): gate failed after max retries",
                    phase.number()
                )));
            }

            println!("{name}: {} (attempt {attempt}/{max}), retrying", failure.verdict);
            ctx.log.log(
                &state.run_id,
                name,
                &format!(
                    "RETRY attempt {attempt}/{max} verdict={} report={}",
                    failure.verdict, failure.report
                ),
            );
            let prompt = build_retry_prompt(
                &ctx.spawn_paths,
                phase,
                state,
                attempt,
                max,
                &failure.findings,
            )
            .context("build retry prompt")?;
            if opts.live_status {
                ctx.live.record_attempt(phase, "running retry prompt", attempt, "");
            }
            if let Err(err) = ctx
                .executor
                .execute(&prompt, &ctx.spawn_cwd, &state.run_id, phase)
            {
                if opts.live_status {
                    ctx.live
                        .record_attempt(phase, "retry failed", attempt, &format!("{err:#}"));
                }
                return Err(err.context("retry failed"));
            }
            write_heartbeat(&ctx.root_paths, &state.run_id);
            retried = true;
        }
    }
}

/// Production wiring: council gates, `ao ratchet` checkpoints and a backend
/// selected from the options.
pub fn run_phased(
    cwd: &Path,
    goal: Option<&str>,
    opts: &PhasedOptions,
    auto_clean_stale_after: Option<Duration>,
) -> Result<RunState> {
    let gate = CouncilGateEvaluator::new(opts.bd_command.clone());
    let checkpoints = RatchetCheckpointRecorder::new(opts.ao_command.clone());
    PhasedEngine::new(&gate, &checkpoints)
        .with_auto_clean(auto_clean_stale_after)
        .run(cwd, goal, opts)
}

/// Goal and starting phase. Resuming past discovery may borrow the goal of
/// the latest run.
fn resolve_goal_and_start_phase(root_paths: &RpiPaths, goal: Option<&str>, from: &str) -> Result<(String, Phase)> {
    let start = Phase::from_name(from).ok_or_else(|| {
        anyhow!("unknown phase: {from:?} (valid: discovery, implementation, validation)")
    })?;
    let mut goal = goal.map(str::trim).unwrap_or_default().to_string();
    if start > Phase::Discovery
        && goal.is_empty()
        && let Ok(existing) = load_latest_run_state(root_paths)
        && existing.epic_id.as_deref().is_some_and(|epic| !epic.is_empty())
    {
        goal = existing.goal;
    }
    if goal.is_empty() && start == Phase::Discovery {
        bail!("goal is required (provide as argument)");
    }
    Ok((goal, start))
}

/// Carry epic, verdicts, attempts and worktree from the latest run when
/// resuming past discovery. Returns the directory phases run in.
fn resume_state_if_needed(
    root_paths: &RpiPaths,
    cwd: &Path,
    start: Phase,
    goal: &str,
    state: &mut RunState,
) -> Result<PathBuf> {
    if start == Phase::Discovery {
        return Ok(cwd.to_path_buf());
    }
    let Ok(existing) = load_latest_run_state(root_paths) else {
        return Ok(cwd.to_path_buf());
    };
    state.epic_id = existing.epic_id.clone();
    state.fast_path |= existing.fast_path;
    state.swarm_first |= existing.swarm_first;
    state.verdicts = existing.verdicts.clone();
    state.attempts = existing.attempts.clone();
    if goal.is_empty() {
        state.goal = existing.goal.clone();
    }

    let Some(worktree) = existing.worktree_path.filter(|_| !state.opts.no_worktree) else {
        return Ok(cwd.to_path_buf());
    };
    if !worktree.exists() {
        bail!(
            "worktree {} from previous run no longer exists (was it removed?)",
            worktree.display()
        );
    }
    state.worktree_path = Some(worktree.clone());
    state.run_id = existing.run_id;
    println!("Resuming in existing worktree: {}", worktree.display());
    Ok(worktree)
}

/// On SIGINT/SIGTERM, persist `interrupted` unless a terminal status was
/// already claimed.
fn register_interrupt_hook(root_paths: &RpiPaths, state: &RunState, slot: &Arc<TerminalSlot>) -> InterruptHook {
    let paths = root_paths.clone();
    let run_id = state.run_id.clone();
    let worktree = state.worktree_path.clone();
    let slot = Arc::clone(slot);
    InterruptHook::register(move |signal| {
        if let Some(worktree) = &worktree {
            eprintln!("\nInterrupted ({signal}). Worktree preserved at: {}", worktree.display());
        }
        persist_interrupt(&paths, &run_id, &slot, signal);
    })
}

/// Mark the run `interrupted` with `signal: <name>` if the slot is still free.
fn persist_interrupt(paths: &RpiPaths, run_id: &str, slot: &TerminalSlot, signal: &str) {
    if !slot.claim() {
        return;
    }
    let registry = paths.registry_state_path(run_id);
    match load_run_state(&registry) {
        Ok(mut state) => {
            state.mark_terminal(TerminalStatus::Interrupted, format!("signal: {signal}"));
            if let Err(err) = save_run_state(paths, &state) {
                warn!(err = %format!("{err:#}"), "could not persist interrupted state");
            }
        }
        Err(err) => warn!(err = %format!("{err:#}"), "could not load state on interrupt"),
    }
}

fn write_final_report(state: &RunState, log: &OrchestrationLog) {
    println!("\n=== RPI Phased Complete ===");
    println!("Goal: {}", state.goal);
    let epic = state.epic_id.as_deref().unwrap_or_default();
    if !epic.is_empty() {
        println!("Epic: {epic}");
    }
    let verdicts = state
        .verdicts
        .iter()
        .map(|(step, verdict)| format!("{step}={verdict}"))
        .collect::<Vec<_>>()
        .join(" ");
    println!("Verdicts: {verdicts}");
    log.log(
        &state.run_id,
        "complete",
        &format!("epic={epic} verdicts={verdicts}"),
    );
    info!(run_id = %state.run_id, "phased run complete");
}
