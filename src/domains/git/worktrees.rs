use anyhow::{anyhow, Result};
use git2::{BranchType, Repository, WorktreeAddOptions, WorktreePruneOptions};
use std::path::Path;

use super::operations::is_valid_branch_name;
use crate::domains::repo;

/// Result of `setup_worktree`: the SHA the worktree starts at, and whether
/// the branch had to be created (start's rollback deletes only branches it
/// made itself).
pub struct WorktreeSetup {
    pub head_sha: String,
    pub branch_created: bool,
}

/// Create the branch (if absent) and check out a new worktree for it at the
/// given path. When the branch already exists (the resume path) it is
/// reused as-is so its history survives pause/resume cycles.
pub fn setup_worktree(
    repo_path: &Path,
    base_branch: &str,
    branch_name: &str,
    worktree_path: &Path,
) -> Result<WorktreeSetup> {
    if !is_valid_branch_name(branch_name) {
        return Err(anyhow!("invalid branch name: {branch_name}"));
    }

    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let repo = Repository::open(repo_path)?;

    let (branch, branch_created) = match repo.find_branch(branch_name, BranchType::Local) {
        Ok(existing) => {
            log::info!("reusing existing branch {branch_name}");
            (existing, false)
        }
        Err(_) => {
            let base_oid = repo
                .revparse_single(base_branch)
                .map_err(|e| anyhow!("base branch '{base_branch}' does not exist: {e}"))?
                .peel_to_commit()?
                .id();
            let base_commit = repo.find_commit(base_oid)?;
            log::info!("creating branch {branch_name} from {base_oid} ({base_branch})");
            (repo.branch(branch_name, &base_commit, false)?, true)
        }
    };

    let head_sha = branch
        .get()
        .target()
        .ok_or_else(|| anyhow!("branch {branch_name} has no target"))?
        .to_string();

    let branch_ref = branch.into_reference();
    let mut opts = WorktreeAddOptions::new();
    opts.reference(Some(&branch_ref));

    let worktree_name = worktree_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("worktree path has no final component"))?;
    repo.worktree(worktree_name, worktree_path, Some(&opts))?;

    log::info!("created worktree at {}", worktree_path.display());
    Ok(WorktreeSetup {
        head_sha,
        branch_created,
    })
}

/// Delete a local branch if it is not checked out anywhere. Best-effort
/// counterpart to `setup_worktree` for rollback and kill.
pub fn delete_branch(repo_path: &Path, branch_name: &str) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let mut branch = repo.find_branch(branch_name, BranchType::Local)?;
    branch.delete()?;
    Ok(())
}

/// Whether a local branch is currently checked out by the main working tree
/// or any registered worktree. Resume refuses to proceed in that case.
pub fn branch_checked_out_elsewhere(repo_path: &Path, branch_name: &str) -> Result<bool> {
    let repo = Repository::open(repo_path)?;
    let wanted = format!("refs/heads/{branch_name}");

    if let Ok(head) = repo.head() {
        if head.name() == Some(wanted.as_str()) {
            return Ok(true);
        }
    }

    for wt_name in repo.worktrees()?.iter().flatten() {
        let wt = match repo.find_worktree(wt_name) {
            Ok(wt) => wt,
            Err(_) => continue,
        };
        if let Ok(wt_repo) = Repository::open(wt.path()) {
            if let Ok(head) = wt_repo.head() {
                if head.name() == Some(wanted.as_str()) {
                    return Ok(true);
                }
            }
        }
    }

    Ok(false)
}

/// Remove a worktree from disk and from git's bookkeeping. The branch is
/// left untouched.
pub fn remove_worktree(repo_path: &Path, worktree_path: &Path) -> Result<()> {
    let repo = Repository::open(repo_path)?;

    // Compare canonicalized paths; on macOS the registered path may differ
    // from the caller's spelling (/tmp vs /private/tmp).
    let target = worktree_path
        .canonicalize()
        .unwrap_or_else(|_| worktree_path.to_path_buf());

    for wt_name in repo.worktrees()?.iter().flatten() {
        let wt = match repo.find_worktree(wt_name) {
            Ok(wt) => wt,
            Err(_) => continue,
        };
        let registered = wt
            .path()
            .canonicalize()
            .unwrap_or_else(|_| wt.path().to_path_buf());
        if registered != target && wt.path() != worktree_path {
            continue;
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)
                .map_err(|e| anyhow!("failed to remove worktree directory: {e}"))?;
        }
        if let Err(e) = wt.prune(Some(WorktreePruneOptions::new().valid(true).working_tree(true)))
        {
            log::warn!("failed to prune worktree from git registry: {e}");
        }
        return Ok(());
    }

    // Not registered with git; remove the directory if it still exists.
    if worktree_path.exists() {
        std::fs::remove_dir_all(worktree_path)?;
        return Ok(());
    }
    Err(anyhow!("worktree not found: {}", worktree_path.display()))
}

/// Drop bookkeeping for worktrees whose directories no longer exist.
/// Invoked on controller startup.
pub fn prune_worktrees(repo_path: &Path) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    for wt_name in repo.worktrees()?.iter().flatten() {
        if let Ok(wt) = repo.find_worktree(wt_name) {
            if wt.validate().is_err() {
                wt.prune(Some(&mut WorktreePruneOptions::new()))?;
            }
        }
    }
    Ok(())
}

/// Remove every worktree this controller created for the repository: all
/// entries living under `<state-dir>/worktrees/`. Used by `reset`.
pub fn cleanup_worktrees(repo_path: &Path) -> Result<()> {
    let worktrees_root = repo::worktrees_dir(repo_path)?;
    let repo = Repository::open(repo_path)?;

    for wt_name in repo.worktrees()?.iter().flatten() {
        let wt = match repo.find_worktree(wt_name) {
            Ok(wt) => wt,
            Err(_) => continue,
        };
        if wt.path().starts_with(&worktrees_root) {
            if wt.path().exists() {
                if let Err(e) = std::fs::remove_dir_all(wt.path()) {
                    log::warn!("failed to remove worktree {}: {e}", wt.path().display());
                }
            }
            if let Err(e) = wt.prune(Some(
                WorktreePruneOptions::new().valid(true).working_tree(true),
            )) {
                log::warn!("failed to prune worktree {wt_name}: {e}");
            }
        }
    }

    if worktrees_root.exists() {
        std::fs::remove_dir_all(&worktrees_root)?;
    }
    Ok(())
}
