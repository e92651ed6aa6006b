//! `rpi`: phased RPI orchestration engine.
//!
//! `phased` runs one goal through discovery, implementation and validation.
//! `loop` feeds goals from `.agents/rpi/next-work.jsonl` (or one explicit goal)
//! through supervised cycles. `status` and `cleanup` inspect and repair the
//! run registry.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};

use rpi_runner::exit_codes;
use rpi_runner::io::checkpoint::RatchetCheckpointRecorder;
use rpi_runner::io::cleanup::{CleanupOptions, execute_cleanup};
use rpi_runner::io::config::{
    BdSyncPolicy, FailurePolicy, GatePolicy, LandingPolicy, LoopFlags, PhasedFlags, RpiConfig,
    load_config, parse_duration,
};
use rpi_runner::io::executor::preflight_runtime;
use rpi_runner::io::gates::CouncilGateEvaluator;
use rpi_runner::io::paths::RpiPaths;
use rpi_runner::io::status::{collect_runs, latest_run, render_run};
use rpi_runner::looping::run_loop;
use rpi_runner::phased::{PhasedEngine, run_phased};
use rpi_runner::supervisor::SupervisedCycle;
use rpi_runner::{logging, signals};

#[derive(Parser)]
#[command(name = "rpi", version, about = "Phased RPI orchestration engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run goals from the work queue (or one explicit goal) through supervised cycles.
    Loop(LoopArgs),
    /// Run one goal through discovery, implementation and validation.
    Phased(PhasedArgs),
    /// Show the latest run.
    Status {
        /// List every run in the registry, newest first.
        #[arg(long)]
        all: bool,
    },
    /// Mark stale runs and remove their worktrees.
    Cleanup(CleanupArgs),
}

#[derive(Args, Debug, Default)]
struct PhasedArgs {
    /// Goal for the run. Optional when resuming with `--from`.
    goal: Option<String>,
    /// Phase to start from (discovery, implementation, validation or an alias).
    #[arg(long)]
    from: Option<String>,
    /// Run in the current checkout instead of an isolated worktree.
    #[arg(long)]
    no_worktree: bool,
    /// Gate retries per phase.
    #[arg(long)]
    max_retries: Option<u32>,
    #[arg(long, value_parser = parse_duration)]
    phase_timeout: Option<Duration>,
    /// Stream executor: maximum silence between events.
    #[arg(long, value_parser = parse_duration)]
    stall_timeout: Option<Duration>,
    /// Executor backend: auto, direct or stream.
    #[arg(long)]
    runtime: Option<String>,
    /// Agent runtime command.
    #[arg(long = "runtime-cmd")]
    runtime_cmd: Option<String>,
    #[arg(long)]
    live_status: bool,
    /// Skip validation regardless of complexity.
    #[arg(long)]
    fast_path: bool,
    #[arg(long)]
    test_first: bool,
    #[arg(long)]
    no_swarm_first: bool,
    #[arg(long)]
    dry_run: bool,
}

impl PhasedArgs {
    fn flags(&self) -> PhasedFlags {
        PhasedFlags {
            from: self.from.clone(),
            no_worktree: self.no_worktree,
            max_retries: self.max_retries,
            phase_timeout: self.phase_timeout,
            stall_timeout: self.stall_timeout,
            runtime: self.runtime.clone(),
            runtime_command: self.runtime_cmd.clone(),
            live_status: self.live_status,
            fast_path: self.fast_path,
            test_first: self.test_first,
            no_swarm_first: self.no_swarm_first,
            dry_run: self.dry_run,
        }
    }
}

#[derive(Args, Debug, Default)]
struct LoopArgs {
    /// Run this goal once instead of reading the queue.
    goal: Option<String>,
    /// Stop after N cycles (0 = unbounded).
    #[arg(long)]
    max_cycles: Option<u32>,
    /// Only pick queue items targeting this repo.
    #[arg(long)]
    repo_filter: Option<String>,
    /// Apply autonomous supervisor defaults to every flag not set explicitly.
    #[arg(long)]
    supervisor: bool,
    #[arg(long, value_parser = FailurePolicy::from_str)]
    failure_policy: Option<FailurePolicy>,
    /// Extra attempts per cycle after a failure.
    #[arg(long)]
    cycle_retries: Option<u32>,
    #[arg(long, value_parser = parse_duration)]
    retry_backoff: Option<Duration>,
    #[arg(long, value_parser = parse_duration)]
    cycle_delay: Option<Duration>,
    /// Hold a single-flight supervisor lease.
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    lease: Option<bool>,
    #[arg(long)]
    lease_path: Option<PathBuf>,
    #[arg(long, value_parser = parse_duration)]
    lease_ttl: Option<Duration>,
    /// Switch a detached HEAD to a named branch before each cycle.
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    detached_heal: Option<bool>,
    #[arg(long)]
    detached_branch_prefix: Option<String>,
    /// Clean stale runs before each phased run.
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    auto_clean: Option<bool>,
    #[arg(long, value_parser = parse_duration)]
    auto_clean_stale_after: Option<Duration>,
    /// Run supervisor cleanup after every cycle.
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    ensure_cleanup: Option<bool>,
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    cleanup_prune_worktrees: Option<bool>,
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    cleanup_prune_branches: Option<bool>,
    #[arg(long, value_parser = GatePolicy::from_str)]
    gate_policy: Option<GatePolicy>,
    #[arg(long)]
    validate_fast_script: Option<PathBuf>,
    #[arg(long)]
    security_gate_script: Option<PathBuf>,
    #[arg(long, value_parser = LandingPolicy::from_str)]
    landing_policy: Option<LandingPolicy>,
    #[arg(long)]
    landing_branch: Option<String>,
    /// Commit message template ({{cycle}}, {{attempt}}, {{goal}}).
    #[arg(long)]
    landing_commit_message: Option<String>,
    #[arg(long, value_parser = BdSyncPolicy::from_str)]
    bd_sync_policy: Option<BdSyncPolicy>,
    /// Timeout for git, gate scripts and bd during a cycle.
    #[arg(long, value_parser = parse_duration)]
    command_timeout: Option<Duration>,
    #[arg(long)]
    kill_switch_path: Option<PathBuf>,
    #[arg(long)]
    dry_run: bool,
}

impl LoopArgs {
    fn flags(&self) -> LoopFlags {
        LoopFlags {
            max_cycles: self.max_cycles,
            repo_filter: self.repo_filter.clone(),
            supervisor: self.supervisor,
            failure_policy: self.failure_policy,
            cycle_retries: self.cycle_retries,
            retry_backoff: self.retry_backoff,
            cycle_delay: self.cycle_delay,
            lease: self.lease,
            lease_path: self.lease_path.clone(),
            lease_ttl: self.lease_ttl,
            detached_heal: self.detached_heal,
            detached_branch_prefix: self.detached_branch_prefix.clone(),
            auto_clean: self.auto_clean,
            auto_clean_stale_after: self.auto_clean_stale_after,
            ensure_cleanup: self.ensure_cleanup,
            cleanup_prune_worktrees: self.cleanup_prune_worktrees,
            cleanup_prune_branches: self.cleanup_prune_branches,
            gate_policy: self.gate_policy,
            validate_fast_script: self.validate_fast_script.clone(),
            security_gate_script: self.security_gate_script.clone(),
            landing_policy: self.landing_policy,
            landing_branch: self.landing_branch.clone(),
            landing_commit_message: self.landing_commit_message.clone(),
            bd_sync_policy: self.bd_sync_policy,
            command_timeout: self.command_timeout,
            kill_switch_path: self.kill_switch_path.clone(),
            dry_run: self.dry_run,
        }
    }
}

#[derive(Args, Debug, Default)]
struct CleanupArgs {
    /// Clean up a specific run by ID.
    #[arg(long)]
    run_id: Option<String>,
    /// Clean up all stale runs.
    #[arg(long)]
    all: bool,
    /// Run `git worktree prune` after cleanup.
    #[arg(long)]
    prune_worktrees: bool,
    /// Delete legacy RPI branches (rpi/*, codex/auto-rpi-*).
    #[arg(long)]
    prune_branches: bool,
    #[arg(long)]
    dry_run: bool,
    /// Only clean runs at least this old (0 disables age filtering).
    #[arg(long, value_parser = parse_duration, default_value = "0")]
    stale_after: Duration,
}

fn main() {
    logging::init();
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(exit_codes::FAILED);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().context("get working directory")?;
    let config = || load_config(&RpiPaths::new(&cwd).config_path);
    match cli.command {
        Command::Loop(args) => cmd_loop(&cwd, &args, config()?),
        Command::Phased(args) => cmd_phased(&cwd, &args, config()?),
        Command::Status { all } => cmd_status(&cwd, all),
        Command::Cleanup(args) => cmd_cleanup(&cwd, &args),
    }
}

fn cmd_phased(cwd: &Path, args: &PhasedArgs, cfg: RpiConfig) -> Result<()> {
    signals::install()?;
    let opts = cfg.phased.with_flags(&args.flags())?;
    run_phased(cwd, args.goal.as_deref(), &opts, None)?;
    Ok(())
}

fn cmd_loop(cwd: &Path, args: &LoopArgs, cfg: RpiConfig) -> Result<()> {
    signals::install()?;
    let loop_cfg = cfg.loop_cfg.with_flags(&args.flags(), cwd)?;
    let mut phased = cfg.phased;
    phased.dry_run |= loop_cfg.dry_run;
    if !phased.dry_run {
        preflight_runtime(&phased.runtime_command)?;
    }

    let gate = CouncilGateEvaluator::new(phased.bd_command.clone());
    let checkpoints = RatchetCheckpointRecorder::new(phased.ao_command.clone());
    let engine = PhasedEngine::new(&gate, &checkpoints);
    let cycle = SupervisedCycle::new(&loop_cfg, &phased, engine);
    run_loop(cwd, args.goal.as_deref(), &loop_cfg, &cycle)?;
    Ok(())
}

fn cmd_status(cwd: &Path, all: bool) -> Result<()> {
    let now = Utc::now();
    let runs = if all {
        collect_runs(cwd, now)
    } else {
        latest_run(cwd, now).into_iter().collect()
    };
    if runs.is_empty() {
        println!("No RPI runs found.");
        return Ok(());
    }
    let rendered: Vec<String> = runs.iter().map(render_run).collect();
    print!("{}", rendered.join("\n"));
    Ok(())
}

fn cmd_cleanup(cwd: &Path, args: &CleanupArgs) -> Result<()> {
    let opts = CleanupOptions {
        run_id: args.run_id.clone(),
        all: args.all,
        prune_worktrees: args.prune_worktrees,
        prune_branches: args.prune_branches,
        dry_run: args.dry_run,
        stale_after: args.stale_after,
    };
    execute_cleanup(cwd, &opts)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_phased_flags() {
        let cli = Cli::parse_from([
            "rpi",
            "phased",
            "add caching",
            "--from",
            "vibe",
            "--max-retries",
            "2",
            "--phase-timeout",
            "1h30m",
            "--runtime-cmd",
            "codex",
            "--no-worktree",
        ]);
        let Command::Phased(args) = cli.command else {
            panic!("expected phased");
        };
        let flags = args.flags();
        assert_eq!(args.goal.as_deref(), Some("add caching"));
        assert_eq!(flags.from.as_deref(), Some("vibe"));
        assert_eq!(flags.max_retries, Some(2));
        assert_eq!(flags.phase_timeout, Some(Duration::from_secs(5400)));
        assert_eq!(flags.runtime_command.as_deref(), Some("codex"));
        assert!(flags.no_worktree);
        assert!(!flags.no_swarm_first);
    }

    /// Verifies boolean loop flags distinguish "not passed" from explicit values.
    #[test]
    fn parse_loop_optional_bools() {
        let cli = Cli::parse_from([
            "rpi",
            "loop",
            "--supervisor",
            "--lease",
            "--ensure-cleanup=false",
            "--failure-policy",
            "stop",
            "--landing-policy",
            "sync-push",
        ]);
        let Command::Loop(args) = cli.command else {
            panic!("expected loop");
        };
        let flags = args.flags();
        assert!(flags.supervisor);
        assert_eq!(flags.lease, Some(true));
        assert_eq!(flags.ensure_cleanup, Some(false));
        assert_eq!(flags.auto_clean, None);
        assert_eq!(flags.failure_policy, Some(FailurePolicy::Stop));
        assert_eq!(flags.landing_policy, Some(LandingPolicy::SyncPush));
        assert!(args.goal.is_none());
    }

    #[test]
    fn invalid_policy_is_rejected() {
        let parsed = Cli::try_parse_from(["rpi", "loop", "--gate-policy", "sometimes"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn parse_cleanup() {
        let cli = Cli::parse_from(["rpi", "cleanup", "--all", "--stale-after", "2h"]);
        let Command::Cleanup(args) = cli.command else {
            panic!("expected cleanup");
        };
        assert!(args.all);
        assert_eq!(args.stale_after, Duration::from_secs(7200));
    }

    #[test]
    fn parse_status() {
        let cli = Cli::parse_from(["rpi", "status", "--all"]);
        assert!(matches!(cli.command, Command::Status { all: true }));
    }
}
