//! Git adapter for the engine and the supervisor.
//!
//! Every call runs `git` as a subprocess under a timeout, so a wedged
//! repository cannot hang a supervised cycle.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use super::config::format_duration;
use super::process::{CommandOutput, DEFAULT_OUTPUT_LIMIT, run_command_with_timeout};

pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            timeout: DEFAULT_GIT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Repository top-level directory, or `None` outside a repository.
    pub fn toplevel(&self) -> Result<Option<PathBuf>> {
        let out = self.run(&["rev-parse", "--show-toplevel"])?;
        if out.timed_out {
            return Err(self.timeout_error(&["rev-parse", "--show-toplevel"]));
        }
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(PathBuf::from(out.stdout_text().trim())))
    }

    /// Current branch name, or `None` on detached HEAD.
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<Option<String>> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            debug!("detached HEAD detected");
            return Ok(None);
        }
        debug!(branch = %name, "current branch");
        Ok(Some(name))
    }

    pub fn head_commit(&self) -> Result<String> {
        Ok(self.run_capture(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// True when tracked files match HEAD (untracked files are ignored).
    pub fn tracked_clean(&self) -> Result<bool> {
        let args = ["diff-index", "--quiet", "HEAD"];
        let out = self.run(&args)?;
        if out.timed_out {
            return Err(self.timeout_error(&args));
        }
        Ok(out.status.success())
    }

    /// True when `git status --porcelain` reports anything.
    pub fn has_changes(&self) -> Result<bool> {
        Ok(!self.run_capture(&["status", "--porcelain"])?.trim().is_empty())
    }

    /// Paths changed against HEAD plus untracked, non-ignored paths.
    pub fn dirty_paths(&self) -> Result<BTreeSet<String>> {
        let tracked = self.run_capture(&["diff", "--name-only", "HEAD", "--"])?;
        let untracked = self.run_capture(&["ls-files", "--others", "--exclude-standard"])?;
        Ok(tracked
            .lines()
            .chain(untracked.lines())
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// Stage only the given paths, including deletions.
    pub fn add_paths(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add", "-A", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run_checked(&["diff", "--cached", "--name-only"])?;
        Ok(!out.stdout_text().trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// `git worktree add --detach <path> <commit>`. The raw output is returned
    /// so callers can classify collisions.
    pub fn worktree_add_detached(&self, path: &Path, commit: &str) -> Result<CommandOutput> {
        let path = path.to_string_lossy();
        self.run(&["worktree", "add", "--detach", &path, commit])
    }

    pub fn worktree_remove_force(&self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy();
        self.run_checked(&["worktree", "remove", &path, "--force"])?;
        Ok(())
    }

    pub fn worktree_prune(&self) -> Result<()> {
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    /// Root directories of every worktree of this repository.
    pub fn worktree_roots(&self) -> Result<Vec<PathBuf>> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        Ok(out
            .lines()
            .filter_map(|line| line.trim().strip_prefix("worktree "))
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    /// Branches checked out in any worktree of this repository.
    pub fn checked_out_branches(&self) -> Result<BTreeSet<String>> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_branches(&out))
    }

    /// Local branch names matching any of the `refs/heads/...` patterns.
    pub fn list_branches(&self, patterns: &[&str]) -> Result<Vec<String>> {
        let mut args = vec!["for-each-ref", "--format=%(refname:short)"];
        args.extend_from_slice(patterns);
        let out = self.run_capture(&args)?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    /// `git merge --no-ff -m <message> <source>`, returning raw output.
    pub fn merge_no_ff(&self, message: &str, source: &str) -> Result<CommandOutput> {
        self.run(&["merge", "--no-ff", "-m", message, source])
    }

    pub fn merge_abort(&self) {
        if let Err(err) = self.run(&["merge", "--abort"]) {
            warn!(err = %format!("{err:#}"), "git merge --abort failed");
        }
    }

    /// Files with unresolved merge conflicts.
    pub fn conflicted_files(&self) -> Vec<String> {
        self.run(&["diff", "--name-only", "--diff-filter=U"])
            .map(|out| {
                out.stdout_text()
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `git branch -f <branch> HEAD`, returning raw output.
    pub fn force_branch_at_head(&self, branch: &str) -> Result<CommandOutput> {
        self.run(&["branch", "-f", branch, "HEAD"])
    }

    /// `git switch <branch>`, returning raw output.
    pub fn switch(&self, branch: &str) -> Result<CommandOutput> {
        self.run(&["switch", branch])
    }

    /// Default branch advertised by `origin/HEAD`, without the remote prefix.
    pub fn origin_default_branch(&self) -> Option<String> {
        let out = self
            .run(&["symbolic-ref", "--quiet", "--short", "refs/remotes/origin/HEAD"])
            .ok()?;
        if !out.success() {
            return None;
        }
        let name = out.stdout_text().trim().to_string();
        let branch = name.strip_prefix("origin/").unwrap_or(&name).to_string();
        (!branch.is_empty()).then_some(branch)
    }

    pub fn fetch(&self, remote: &str, branch: &str) -> Result<()> {
        self.run_checked(&["fetch", remote, branch])?;
        Ok(())
    }

    pub fn rebase(&self, upstream: &str) -> Result<()> {
        self.run_checked(&["rebase", upstream])?;
        Ok(())
    }

    /// Abort an in-progress rebase. Having no rebase to abort is not an error.
    pub fn rebase_abort(&self) -> Result<()> {
        let out = self.run(&["rebase", "--abort"])?;
        if out.success() || no_rebase_in_progress(&out.combined_text()) {
            return Ok(());
        }
        Err(anyhow!(
            "git rebase --abort failed: {}",
            out.combined_text().trim()
        ))
    }

    pub fn push(&self, remote: &str, refspec: &str) -> Result<()> {
        self.run_checked(&["push", remote, refspec])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        Ok(self.run_checked(args)?.stdout_text())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args)?;
        if output.timed_out {
            return Err(self.timeout_error(args));
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        run_command_with_timeout(cmd, self.timeout, DEFAULT_OUTPUT_LIMIT)
    }

    fn timeout_error(&self, args: &[&str]) -> anyhow::Error {
        anyhow!(
            "git {} timed out after {}",
            args.first().copied().unwrap_or_default(),
            format_duration(self.timeout)
        )
    }
}

fn no_rebase_in_progress(output: &str) -> bool {
    let msg = output.trim().to_lowercase();
    msg.contains("no rebase in progress") || msg.contains("no rebase to abort")
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

/// Branch names from `git worktree list --porcelain` output.
fn parse_worktree_branches(porcelain: &str) -> BTreeSet<String> {
    porcelain
        .lines()
        .filter_map(|line| line.trim().strip_prefix("branch "))
        .map(|full| full.strip_prefix("refs/heads/").unwrap_or(full).to_string())
        .collect()
}
