//! Landing a successful cycle: commit owned changes, then optionally sync and push.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, instrument, warn};

use super::config::{BdSyncPolicy, DEFAULT_LANDING_COMMIT_MESSAGE, LandingPolicy, LoopConfig};
use super::git::Git;
use super::lease::SupervisorLease;
use super::process::{find_on_path, run_checked_inherited};
use super::worktree::generate_run_id;

/// Paths that were already dirty before the cycle ran. Only paths outside this
/// baseline are committed by landing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LandingScope {
    baseline: BTreeSet<String>,
}

impl LandingScope {
    pub fn capture(git: &Git) -> Result<Self> {
        Ok(Self {
            baseline: git.dirty_paths().context("collect landing scope")?,
        })
    }

    /// Currently dirty paths that are not part of the baseline, sorted.
    pub fn owned_paths(&self, git: &Git) -> Result<Vec<String>> {
        Ok(git
            .dirty_paths()
            .context("collect landing scope")?
            .into_iter()
            .filter(|path| !self.baseline.contains(path))
            .collect())
    }
}

/// Per-cycle inputs to landing.
#[derive(Debug, Clone, Copy)]
pub struct LandingRequest<'a> {
    pub cycle: u32,
    pub attempt: u32,
    pub goal: &'a str,
    pub bd_command: &'a str,
}

/// Substitute `{{cycle}}`, `{{attempt}}` and `{{goal}}` in a commit message template.
pub fn render_commit_message(template: &str, cycle: u32, attempt: u32, goal: &str) -> String {
    let template = template.trim();
    let template = if template.is_empty() {
        DEFAULT_LANDING_COMMIT_MESSAGE
    } else {
        template
    };
    template
        .replace("{{cycle}}", &cycle.to_string())
        .replace("{{attempt}}", &attempt.to_string())
        .replace("{{goal}}", goal)
}

/// Land the cycle according to the landing policy.
#[instrument(skip_all, fields(policy = %cfg.landing_policy, cycle = req.cycle))]
pub fn run_landing(cwd: &Path, cfg: &LoopConfig, req: LandingRequest<'_>, scope: Option<&LandingScope>) -> Result<()> {
    if cfg.landing_policy == LandingPolicy::Off {
        return Ok(());
    }
    let lock = acquire_landing_lock(cwd, cfg).context("landing lock acquisition failed")?;
    let result = land(cwd, cfg, req, scope);
    if let Some(lock) = lock
        && let Err(err) = lock.release()
    {
        warn!(err = %format!("{err:#}"), "could not release landing lock");
    }
    result
}

fn land(cwd: &Path, cfg: &LoopConfig, req: LandingRequest<'_>, scope: Option<&LandingScope>) -> Result<()> {
    let git = Git::new(cwd).with_timeout(cfg.command_timeout());
    let message = render_commit_message(&cfg.landing_commit_message, req.cycle, req.attempt, req.goal);
    let committed = commit_if_dirty(&git, &message, scope)?;
    if cfg.landing_policy == LandingPolicy::Commit {
        return Ok(());
    }
    if !committed {
        println!("Landing: no commit performed.");
        return Ok(());
    }
    sync_rebase_and_push(&git, cfg, req.bd_command)
}

fn acquire_landing_lock(cwd: &Path, cfg: &LoopConfig) -> Result<Option<SupervisorLease>> {
    if cfg.landing_lock_path.as_os_str().is_empty() {
        return Ok(None);
    }
    let run_id = format!("{}-run-{}", cfg.landing_policy, generate_run_id());
    SupervisorLease::acquire(&cfg.landing_lock_path, cfg.lease_ttl(), &run_id, cwd).map(Some)
}

/// Commit paths the cycle dirtied. Returns whether a commit was made.
pub fn commit_if_dirty(git: &Git, message: &str, scope: Option<&LandingScope>) -> Result<bool> {
    if !git.has_changes().context("git status failed")? {
        println!("Landing: no changes to commit.");
        return Ok(false);
    }
    let scope = scope.ok_or_else(|| anyhow!("landing scope missing for autonomous commit"))?;
    let owned = scope.owned_paths(git)?;
    if owned.is_empty() {
        println!("Landing: only pre-existing dirty paths detected; skipping autonomous commit.");
        return Ok(false);
    }
    git.add_paths(&owned).context("git add owned paths failed")?;
    let committed = git.commit_staged(message).context("git commit failed")?;
    debug!(paths = owned.len(), committed, "landing commit");
    Ok(committed)
}

/// Explicit branch, then `origin/HEAD`, then the current branch, then `main`.
pub fn resolve_landing_branch(git: &Git, explicit: &str) -> String {
    let explicit = explicit.trim();
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    if let Some(branch) = git.origin_default_branch() {
        return branch;
    }
    if let Ok(Some(branch)) = git.current_branch() {
        return branch;
    }
    "main".to_string()
}

fn sync_rebase_and_push(git: &Git, cfg: &LoopConfig, bd_command: &str) -> Result<()> {
    let target = resolve_landing_branch(git, &cfg.landing_branch);
    if let Err(err) = git.fetch("origin", &target) {
        return Err(recover_landing_failure(git, "fetch", err));
    }
    if let Err(err) = git.rebase(&format!("origin/{target}")) {
        return Err(recover_landing_failure(git, "rebase", err));
    }
    if should_run_bd_sync(git.workdir(), cfg.bd_sync_policy, bd_command)? {
        run_checked_inherited(git.workdir(), cfg.command_timeout(), bd_command, &["sync"])
            .context("bd sync failed")?;
    }
    git.push("origin", &format!("HEAD:{target}"))
        .context("landing push failed")?;
    println!("Landing: pushed to origin/{target}");
    Ok(())
}

fn recover_landing_failure(git: &Git, stage: &str, err: anyhow::Error) -> anyhow::Error {
    match git.rebase_abort() {
        Ok(()) => anyhow!("landing {stage} failed: {err:#} (state recovered)"),
        Err(recovery) => anyhow!("landing {stage} failed: {err:#} (state recovery failed: {recovery:#})"),
    }
}

/// `always` requires the bd CLI; `auto` needs the CLI and a `.beads` directory.
pub fn should_run_bd_sync(cwd: &Path, policy: BdSyncPolicy, bd_command: &str) -> Result<bool> {
    let command = if bd_command.trim().is_empty() { "bd" } else { bd_command.trim() };
    match policy {
        BdSyncPolicy::Never => Ok(false),
        BdSyncPolicy::Always => {
            if find_on_path(command).is_none() {
                bail!("bd-sync-policy=always but {command} CLI not found on PATH");
            }
            Ok(true)
        }
        BdSyncPolicy::Auto => Ok(find_on_path(command).is_some() && cwd.join(".beads").is_dir()),
    }
}
