//! Isolated sibling worktrees for phased runs.
//!
//! A run executes in `<parent>/<repo>-rpi-<run_id>`, a detached checkout of
//! the original HEAD. On success the worktree commit is merged back with
//! `--no-ff` and the worktree removed; on failure it is kept for inspection.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::git::Git;
use super::orchestration_log::OrchestrationLog;
use crate::core::cycle_failure::infrastructure_failure;

/// Timeout for individual git worktree operations.
pub const WORKTREE_TIMEOUT: Duration = Duration::from_secs(30);

const CREATE_ATTEMPTS: u32 = 3;
const CLEAN_WAIT_ATTEMPTS: u32 = 5;
const CLEAN_WAIT_DELAY: Duration = Duration::from_secs(2);
const RECOVERY_SUFFIX: &str = "-recovery";

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("detached HEAD: worktree requires a named branch")]
    DetachedHead,
    #[error("detached HEAD self-heal failed: {0}")]
    SelfHealFailed(String),
    #[error("not a git repository (run rpi phased from inside a git repo)")]
    NotGitRepo,
    #[error("unable to resolve HEAD commit for detached worktree creation")]
    ResolveHead,
    #[error("failed to create unique worktree path after 3 attempts")]
    Collision,
    #[error("merge source unavailable: missing worktree path and run ID")]
    MergeSourceUnavailable,
    #[error("original repo has uncommitted changes after 5 retries: commit or stash before merge")]
    RepoUnclean,
    #[error("worktree merge source commit is empty")]
    EmptyMergeSource,
}

/// Fresh 12-character lowercase hex run identifier.
pub fn generate_run_id() -> String {
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// `<parent>/<repo-basename>-rpi-<run_id>`.
pub fn worktree_path_for(repo_root: &Path, run_id: &str) -> PathBuf {
    let base = repo_root
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let parent = repo_root.parent().unwrap_or(repo_root);
    parent.join(format!("{base}-rpi-{run_id}"))
}

/// Repository top-level for `cwd`.
pub fn repo_root(cwd: &Path, timeout: Duration) -> Result<PathBuf> {
    Git::new(cwd)
        .with_timeout(timeout)
        .toplevel()?
        .ok_or_else(|| WorktreeError::NotGitRepo.into())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedWorktree {
    pub repo_root: PathBuf,
    pub path: PathBuf,
    pub run_id: String,
}

/// Create a detached sibling worktree at the current HEAD commit.
#[instrument(skip_all, fields(cwd = %cwd.display()))]
pub fn create_worktree(cwd: &Path, timeout: Duration) -> Result<CreatedWorktree> {
    let repo_root = repo_root(cwd, timeout)?;
    let git = Git::new(&repo_root).with_timeout(timeout);

    if let Ok(Some(branch)) = git.current_branch() {
        debug!(%branch, "creating detached worktree from current branch");
    }
    let commit = git
        .head_commit()
        .map_err(|err| anyhow!("git rev-parse HEAD: {err:#}"))?;
    if commit.is_empty() {
        return Err(WorktreeError::ResolveHead.into());
    }

    for attempt in 1..=CREATE_ATTEMPTS {
        let run_id = generate_run_id();
        let path = worktree_path_for(&repo_root, &run_id);
        let out = git.worktree_add_detached(&path, &commit)?;
        if out.success() {
            let rpi_dir = path.join(".agents").join("rpi");
            if let Err(err) = fs::create_dir_all(&rpi_dir) {
                warn!(err = %err, path = %rpi_dir.display(), "could not create .agents/rpi in worktree");
            }
            info!(path = %path.display(), %run_id, "worktree created");
            return Ok(CreatedWorktree {
                repo_root,
                path,
                run_id,
            });
        }
        let output = out.combined_text();
        if out.timed_out {
            return Err(anyhow!("git worktree add timed out after {}s", timeout.as_secs()));
        }
        if !output.contains("already exists") {
            return Err(anyhow!("git worktree add failed (output: {output})"));
        }
        debug!(path = %path.display(), attempt, "worktree path collision, retrying");
    }
    Err(WorktreeError::Collision.into())
}

/// Merge the worktree's HEAD into the original checkout.
#[instrument(skip_all, fields(run_id))]
pub fn merge_worktree(repo_root: &Path, worktree_path: Option<&Path>, run_id: &str, timeout: Duration) -> Result<()> {
    let git = Git::new(repo_root).with_timeout(timeout);
    wait_for_clean_repo(&git, CLEAN_WAIT_ATTEMPTS, CLEAN_WAIT_DELAY)?;

    let worktree_path = match worktree_path {
        Some(path) if !path.as_os_str().is_empty() => path.to_path_buf(),
        _ if !run_id.trim().is_empty() => worktree_path_for(repo_root, run_id),
        _ => return Err(WorktreeError::MergeSourceUnavailable.into()),
    };

    let source = Git::new(&worktree_path)
        .with_timeout(timeout)
        .head_commit()
        .map_err(|err| anyhow!("resolve worktree merge source: {err:#}"))?;
    if source.is_empty() {
        return Err(WorktreeError::EmptyMergeSource.into());
    }

    let message = if run_id.trim().is_empty() {
        "Merge rpi worktree (detached checkout)".to_string()
    } else {
        format!("Merge {run_id} (rpi worktree)")
    };
    let out = git.merge_no_ff(&message, &source)?;
    if out.success() {
        debug!(%source, "worktree merged");
        return Ok(());
    }
    if out.timed_out {
        return Err(anyhow!("git merge timed out after {}s", timeout.as_secs()));
    }

    let conflicts = git.conflicted_files();
    git.merge_abort();
    let short: String = source.chars().take(12).collect();
    if !conflicts.is_empty() {
        return Err(anyhow!(
            "merge conflict in {short}.\nConflicting files:\n{}\nResolve manually: cd {} && git merge {source}",
            conflicts.join("\n"),
            repo_root.display()
        ));
    }
    Err(anyhow!("git merge failed: {}", out.combined_text()))
}

fn wait_for_clean_repo(git: &Git, attempts: u32, delay: Duration) -> Result<()> {
    for attempt in 1..=attempts {
        if git.tracked_clean()? {
            return Ok(());
        }
        if attempt < attempts {
            debug!(attempt, attempts, "repo dirty, waiting before merge");
            thread::sleep(delay);
        }
    }
    Err(WorktreeError::RepoUnclean.into())
}

fn canonical_or_absolute(path: &Path) -> Result<PathBuf> {
    match fs::canonicalize(path) {
        Ok(path) => Ok(path),
        Err(_) => std::path::absolute(path)
            .with_context(|| format!("invalid worktree path {}", path.display())),
    }
}

fn run_id_from_path(repo_root: &Path, worktree_path: &Path) -> Option<String> {
    let base = worktree_path.file_name()?.to_string_lossy().to_string();
    let prefix = format!("{}-rpi-", repo_root.file_name()?.to_string_lossy());
    base.strip_prefix(&prefix)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Remove a run worktree. Refuses any path other than the run's sibling path.
#[instrument(skip_all, fields(run_id))]
pub fn remove_worktree(repo_root: &Path, worktree_path: &Path, run_id: &str, timeout: Duration) -> Result<()> {
    let abs_path = canonical_or_absolute(worktree_path)?;
    let root = fs::canonicalize(repo_root).unwrap_or_else(|_| repo_root.to_path_buf());
    let run_id = if run_id.trim().is_empty() {
        run_id_from_path(&root, &abs_path).ok_or_else(|| {
            anyhow!("invalid run id for worktree removal path {}", abs_path.display())
        })?
    } else {
        run_id.to_string()
    };
    let expected = worktree_path_for(&root, &run_id);
    if abs_path != expected {
        return Err(anyhow!(
            "refusing to remove {}: expected {} (path validation failed)",
            abs_path.display(),
            expected.display()
        ));
    }

    let git = Git::new(&root).with_timeout(timeout);
    if let Err(err) = git.worktree_remove_force(&abs_path) {
        debug!(err = %format!("{err:#}"), "git worktree remove failed; removing directory");
        if abs_path.exists() {
            fs::remove_dir_all(&abs_path)
                .with_context(|| format!("remove worktree directory {}", abs_path.display()))?;
        }
    }
    // Runs from older layouts created an `rpi/<id>` branch.
    let _ = git.delete_branch(&format!("rpi/{run_id}"));
    info!(path = %abs_path.display(), "worktree removed");
    Ok(())
}

/// Worktree teardown after a run: keep it on failure, merge and remove on success.
pub fn finalize_worktree(
    created: &CreatedWorktree,
    success: bool,
    log: &OrchestrationLog,
    timeout: Duration,
) -> Result<()> {
    let path = &created.path;
    if !success {
        eprintln!("Worktree preserved for debugging: {}", path.display());
        return Ok(());
    }
    if let Err(err) = merge_worktree(&created.repo_root, Some(path), &created.run_id, timeout) {
        eprintln!("Merge failed: {err:#}\nWorktree preserved at: {}", path.display());
        log.log_failure_context(&created.run_id, "merge", &err);
        return Err(infrastructure_failure(
            "worktree merge",
            err.context("worktree merge failed"),
        ));
    }
    if let Err(err) = remove_worktree(&created.repo_root, path, &created.run_id, timeout) {
        eprintln!(
            "Cleanup failed: {err:#}\nWorktree may require manual removal: {}",
            path.display()
        );
        log.log_failure_context(&created.run_id, "cleanup", &err);
        return Err(infrastructure_failure(
            "worktree cleanup",
            err.context("worktree cleanup failed"),
        ));
    }
    Ok(())
}

/// Result of [`ensure_attached_branch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchAttachment {
    /// HEAD was already on a branch.
    Attached(String),
    /// HEAD was detached and is now on the recovery branch.
    Healed(String),
    /// The recovery branch is checked out elsewhere; HEAD stays detached.
    StillDetached,
}

/// Recovery branch name for a prefix, e.g. `codex/auto-rpi-recovery`.
pub fn recovery_branch(prefix: &str) -> String {
    let prefix = prefix.trim();
    let prefix = if prefix.is_empty() {
        super::config::DEFAULT_DETACHED_BRANCH_PREFIX
    } else {
        prefix
    };
    format!("{}{RECOVERY_SUFFIX}", prefix.trim_end_matches('-'))
}

fn branch_busy_in_worktree(output: &str) -> bool {
    output.to_ascii_lowercase().contains("used by worktree")
}

/// Move a detached HEAD onto the recovery branch when that can be done safely.
#[instrument(skip_all, fields(repo = %repo_root.display()))]
pub fn ensure_attached_branch(repo_root: &Path, timeout: Duration, prefix: &str) -> Result<BranchAttachment> {
    let git = Git::new(repo_root).with_timeout(timeout);
    if let Some(branch) = git.current_branch()? {
        return Ok(BranchAttachment::Attached(branch));
    }

    let branch = recovery_branch(prefix);
    let created = git.force_branch_at_head(&branch)?;
    if !created.success() {
        let output = created.combined_text();
        if branch_busy_in_worktree(&output) {
            return Ok(BranchAttachment::StillDetached);
        }
        return Err(WorktreeError::SelfHealFailed(output).into());
    }

    let switched = git.switch(&branch)?;
    if !switched.success() {
        let output = switched.combined_text();
        if branch_busy_in_worktree(&output) {
            return Ok(BranchAttachment::StillDetached);
        }
        return Err(WorktreeError::SelfHealFailed(output).into());
    }
    info!(%branch, "detached HEAD healed");
    Ok(BranchAttachment::Healed(branch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn run_ids_are_twelve_hex_chars() {
        let id = generate_run_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(generate_run_id(), id);
    }

    #[test]
    fn sibling_path_layout() {
        assert_eq!(
            worktree_path_for(Path::new("/work/repo"), "abc123def456"),
            PathBuf::from("/work/repo-rpi-abc123def456")
        );
        assert_eq!(recovery_branch(""), "codex/auto-rpi-recovery");
        assert_eq!(recovery_branch("auto-"), "auto-recovery");
    }

    #[test]
    fn non_repo_is_typed_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = create_worktree(temp.path(), WORKTREE_TIMEOUT).unwrap_err();
        assert!(matches!(err.downcast_ref::<WorktreeError>(), Some(WorktreeError::NotGitRepo)));
    }

    /// Verifies create, commit in the worktree, merge back and remove.
    #[test]
    fn create_merge_remove_lifecycle() {
        let repo = TestRepo::new().expect("repo");
        let created = create_worktree(repo.path(), WORKTREE_TIMEOUT).expect("create");
        assert!(created.path.join(".agents/rpi").is_dir());
        assert!(created.path.ends_with(format!("repo-rpi-{}", created.run_id)));

        fs::write(created.path.join("feature.txt"), "work\n").expect("write");
        let wt = Git::new(&created.path);
        wt.add_all().expect("add");
        assert!(wt.commit_staged("feat: work").expect("commit"));

        let log = OrchestrationLog::new(repo.path().join(".agents/rpi/log"));
        finalize_worktree(&created, true, &log, WORKTREE_TIMEOUT).expect("finalize");

        assert!(repo.path().join("feature.txt").exists());
        assert!(!created.path.exists());
    }

    /// Verifies a failed run keeps its worktree.
    #[test]
    fn failure_preserves_worktree() {
        let repo = TestRepo::new().expect("repo");
        let created = create_worktree(repo.path(), WORKTREE_TIMEOUT).expect("create");
        let log = OrchestrationLog::new(repo.path().join(".agents/rpi/log"));
        finalize_worktree(&created, false, &log, WORKTREE_TIMEOUT).expect("finalize");
        assert!(created.path.exists());
    }

    #[test]
    fn removal_refuses_foreign_paths() {
        let repo = TestRepo::new().expect("repo");
        let err = remove_worktree(repo.path(), repo.path(), "abc123def456", WORKTREE_TIMEOUT).unwrap_err();
        assert!(err.to_string().starts_with("refusing to remove"));
        assert!(repo.path().exists());
    }

    #[test]
    fn dirty_repo_blocks_merge() {
        let repo = TestRepo::new().expect("repo");
        fs::write(repo.path().join("README.md"), "dirty\n").expect("write");
        let err = wait_for_clean_repo(&Git::new(repo.path()), 2, Duration::ZERO).unwrap_err();
        assert!(matches!(err.downcast_ref::<WorktreeError>(), Some(WorktreeError::RepoUnclean)));
    }

    /// Verifies a detached checkout is moved onto the recovery branch.
    #[test]
    fn detached_head_heals_to_recovery_branch() {
        let repo = TestRepo::new().expect("repo");
        assert!(matches!(
            ensure_attached_branch(repo.path(), WORKTREE_TIMEOUT, "auto").expect("attached"),
            BranchAttachment::Attached(_)
        ));

        repo.git(&["checkout", "--detach"]).expect("detach");
        assert_eq!(
            ensure_attached_branch(repo.path(), WORKTREE_TIMEOUT, "auto").expect("heal"),
            BranchAttachment::Healed("auto-recovery".to_string())
        );
        assert_eq!(
            Git::new(repo.path()).current_branch().expect("branch").as_deref(),
            Some("auto-recovery")
        );
    }
}
