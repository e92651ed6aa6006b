//! Stale run detection and cleanup of orphaned worktrees and legacy branches.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use super::atomic::write_json_atomic;
use super::git::Git;
use super::paths::RpiPaths;
use super::run_state::{RunState, load_run_state, scan_registry};
use super::status::{completed_phase_number, determine_liveness};
use super::worktree::{WORKTREE_TIMEOUT, remove_worktree};
use crate::core::phase::TerminalStatus;

/// Branch patterns created by older runner layouts and detached-HEAD healing.
const LEGACY_BRANCH_PATTERNS: [&str; 2] = ["refs/heads/rpi/*", "refs/heads/codex/auto-rpi-*"];

/// A run eligible for cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleRun {
    pub run_id: String,
    pub root: PathBuf,
    pub state_path: PathBuf,
    pub worktree_path: Option<PathBuf>,
    pub reason: String,
    /// Set when the run already carries terminal metadata.
    pub terminal: Option<TerminalStatus>,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    pub run_id: Option<String>,
    pub all: bool,
    pub prune_worktrees: bool,
    pub prune_branches: bool,
    pub dry_run: bool,
    pub stale_after: Duration,
}

fn age_at(stamp: &str, now: DateTime<Utc>) -> Option<Duration> {
    let at = DateTime::parse_from_rfc3339(stamp).ok()?;
    Some(
        now.signed_duration_since(at.with_timezone(&Utc))
            .to_std()
            .unwrap_or(Duration::ZERO),
    )
}

fn existing_worktree(state: &RunState) -> Option<PathBuf> {
    state.worktree_path.clone().filter(|path| path.exists())
}

/// Runs under `root` older than `min_age` (inclusive) that are either terminal
/// but unfinished with their worktree still on disk, or non-terminal and dead.
pub fn find_stale_runs(root: &Path, min_age: Duration, now: DateTime<Utc>) -> Vec<StaleRun> {
    let paths = RpiPaths::new(root);
    let mut stale = Vec::new();
    for (state_path, state) in scan_registry(&paths) {
        if let Some(status) = state.terminal_status {
            if status == TerminalStatus::Completed {
                continue;
            }
            let Some(worktree) = existing_worktree(&state) else {
                continue;
            };
            let stamp = state.terminated_at.as_deref().unwrap_or(&state.started_at);
            if age_at(stamp, now).is_some_and(|age| age < min_age) {
                continue;
            }
            let reason = state
                .terminal_reason
                .clone()
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| format!("terminal status: {}", status.as_str()));
            stale.push(StaleRun {
                run_id: state.run_id.clone(),
                root: root.to_path_buf(),
                state_path,
                worktree_path: Some(worktree),
                reason,
                terminal: Some(status),
            });
            continue;
        }

        let (alive, _) = determine_liveness(&paths, &state, now);
        if alive || state.phase >= completed_phase_number() {
            continue;
        }
        let Some(age) = age_at(&state.started_at, now) else {
            debug!(run_id = %state.run_id, "skipping run with unparseable start time");
            continue;
        };
        if age < min_age {
            continue;
        }
        let worktree = existing_worktree(&state);
        let reason = if state.worktree_path.is_some() && worktree.is_none() {
            "worktree missing"
        } else {
            "no heartbeat"
        };
        stale.push(StaleRun {
            run_id: state.run_id.clone(),
            root: root.to_path_buf(),
            state_path,
            worktree_path: worktree,
            reason: reason.to_string(),
            terminal: None,
        });
    }
    stale
}

/// Record stale terminal metadata in the registry entry and, when it belongs to
/// the same run, the flat state file.
pub fn mark_run_stale(run: &StaleRun) -> Result<()> {
    let mut state = load_run_state(&run.state_path)?;
    state.mark_terminal(TerminalStatus::Stale, run.reason.clone());
    write_json_atomic(&run.state_path, &state)
        .with_context(|| format!("write run state {}", run.state_path.display()))?;

    let flat_path = RpiPaths::new(&run.root).state_path;
    if let Ok(mut flat) = load_run_state(&flat_path)
        && flat.run_id == run.run_id
    {
        flat.mark_terminal(TerminalStatus::Stale, run.reason.clone());
        write_json_atomic(&flat_path, &flat)
            .with_context(|| format!("write run state {}", flat_path.display()))?;
    }
    Ok(())
}

/// `cwd` plus every worktree root of its repository, deduplicated.
fn search_roots(cwd: &Path) -> Vec<PathBuf> {
    let mut seen = BTreeSet::new();
    let mut roots = Vec::new();
    let mut push = |path: PathBuf| {
        let key = fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
        if seen.insert(key) {
            roots.push(path);
        }
    };
    push(cwd.to_path_buf());
    match Git::new(cwd).with_timeout(WORKTREE_TIMEOUT).worktree_roots() {
        Ok(list) => list.into_iter().for_each(&mut push),
        Err(err) => debug!(err = %format!("{err:#}"), "worktree listing unavailable"),
    }
    roots
}

/// Clean up stale runs. With `run_id` only that run is considered; `all` widens
/// the legacy branch sweep.
#[instrument(skip_all, fields(dry_run = opts.dry_run))]
pub fn execute_cleanup(cwd: &Path, opts: &CleanupOptions) -> Result<Vec<StaleRun>> {
    let run_filter = opts.run_id.as_deref().filter(|id| !id.is_empty());
    if !opts.all && run_filter.is_none() {
        bail!("specify --all or --run-id <id>");
    }
    let now = Utc::now();
    let mut seen = BTreeSet::new();
    let mut stale: Vec<StaleRun> = search_roots(cwd)
        .iter()
        .flat_map(|root| find_stale_runs(root, opts.stale_after, now))
        .filter(|run| seen.insert(run.run_id.clone()))
        .collect();
    if let Some(run_id) = run_filter {
        stale.retain(|run| run.run_id == run_id);
    }

    if stale.is_empty() {
        println!("No stale runs found.");
    }
    for run in &stale {
        cleanup_run(run, opts.dry_run)?;
    }

    if opts.prune_worktrees {
        if opts.dry_run {
            println!("[dry-run] Would run: git worktree prune");
        } else {
            println!("Running: git worktree prune");
            if let Err(err) = Git::new(cwd).with_timeout(WORKTREE_TIMEOUT).worktree_prune() {
                warn!(err = %format!("{err:#}"), "git worktree prune failed");
            }
        }
    }
    if opts.prune_branches {
        prune_legacy_branches(cwd, opts)?;
    }
    Ok(stale)
}

fn cleanup_run(run: &StaleRun, dry_run: bool) -> Result<()> {
    if run.terminal.is_some() {
        if dry_run {
            println!("[dry-run] Would clean terminal run {} ({})", run.run_id, run.reason);
        } else {
            println!("Cleaning terminal run {} ({})", run.run_id, run.reason);
        }
    } else if dry_run {
        println!("[dry-run] Would mark run {} as stale (reason: {})", run.run_id, run.reason);
    } else {
        mark_run_stale(run).with_context(|| format!("mark run {} stale", run.run_id))?;
        println!("Marked run {} as stale (reason: {})", run.run_id, run.reason);
    }

    let Some(worktree) = &run.worktree_path else {
        return Ok(());
    };
    if dry_run {
        println!("[dry-run] Would remove worktree: {}", worktree.display());
        return Ok(());
    }
    match remove_worktree(&run.root, worktree, &run.run_id, WORKTREE_TIMEOUT) {
        Ok(()) => println!("Removed worktree: {}", worktree.display()),
        Err(err) => warn!(
            run_id = %run.run_id,
            err = %format!("{err:#}"),
            "could not remove worktree"
        ),
    }
    Ok(())
}

fn prune_legacy_branches(cwd: &Path, opts: &CleanupOptions) -> Result<()> {
    let git = Git::new(cwd).with_timeout(WORKTREE_TIMEOUT);
    let scoped;
    let patterns: Vec<&str> = match opts.run_id.as_deref().filter(|id| !id.is_empty()) {
        Some(run_id) if !opts.all => {
            scoped = format!("refs/heads/rpi/{run_id}");
            vec![scoped.as_str()]
        }
        _ => LEGACY_BRANCH_PATTERNS.to_vec(),
    };
    let branches = git.list_branches(&patterns).context("list legacy branches")?;
    if branches.is_empty() {
        println!("No legacy RPI branches found for cleanup.");
        return Ok(());
    }
    let active = git.checked_out_branches().unwrap_or_default();
    for branch in branches {
        if active.contains(&branch) {
            println!("Skipping active branch: {branch}");
            continue;
        }
        if opts.dry_run {
            println!("[dry-run] Would delete branch: {branch}");
            continue;
        }
        match git.delete_branch(&branch) {
            Ok(()) => println!("Deleted branch: {branch}"),
            Err(err) => warn!(branch = %branch, err = %format!("{err:#}"), "branch delete failed"),
        }
    }
    Ok(())
}
