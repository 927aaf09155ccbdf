use anyhow::{anyhow, Result};
use git2::{IndexAddOption, Repository, StatusOptions};
use std::path::Path;
use std::time::Duration;

use crate::domains::repo::STATE_DIR_NAME;
use crate::error::CoreError;

const PUSH_TIMEOUT: Duration = Duration::from_secs(30);

#[inline]
fn is_internal_tooling_path(path: &str) -> bool {
    path == STATE_DIR_NAME || path.starts_with(".claude-squad/")
}

/// Resolve a revision string (branch name, HEAD, SHA) to a commit hash.
pub fn get_commit_hash(repo_path: &Path, rev: &str) -> Result<String> {
    let repo = Repository::open(repo_path)?;
    let oid = repo.revparse_single(rev)?.peel_to_commit()?.id();
    Ok(oid.to_string())
}

pub fn has_uncommitted_changes(worktree_path: &Path) -> Result<bool> {
    let repo = Repository::open(worktree_path)?;

    let mut opts = StatusOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);
    let statuses = repo.statuses(Some(&mut opts))?;

    let dirty = statuses.iter().any(|entry| {
        entry
            .path()
            .map(|p| !is_internal_tooling_path(p))
            .unwrap_or(true)
    });
    Ok(dirty)
}

/// Stage everything and commit. A clean tree is a no-op, not an error, so
/// pause can always run this unconditionally.
pub fn commit_all_changes(worktree_path: &Path, message: &str) -> Result<()> {
    let repo = Repository::open(worktree_path)?;

    let mut index = repo.index()?;
    index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
    // Pick up deletions as well.
    index.update_all(["*"].iter(), None)?;
    index.write()?;
    let tree_id = index.write_tree()?;

    let parent_commit = match repo.head() {
        Ok(head) => {
            let oid = head.target().ok_or_else(|| anyhow!("HEAD has no target"))?;
            Some(repo.find_commit(oid)?)
        }
        Err(_) => None,
    };

    if let Some(ref parent) = parent_commit {
        if parent.tree_id() == tree_id {
            return Ok(());
        }
    }

    let tree = repo.find_tree(tree_id)?;
    let signature = repo.signature().map_err(|e| {
        anyhow!("failed to get signature from git config: {e}. Please configure git user.name and user.email")
    })?;

    let parents = match parent_commit {
        Some(ref parent) => vec![parent],
        None => vec![],
    };
    repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;

    Ok(())
}

/// Push a branch via the git CLI. Network operations go through the binary
/// rather than libgit2 so the user's credential helpers and ssh config apply.
pub async fn push_changes(
    worktree_path: &Path,
    remote: &str,
    branch: &str,
) -> std::result::Result<(), CoreError> {
    let command = format!("git push {remote} {branch}");
    let output = tokio::time::timeout(
        PUSH_TIMEOUT,
        tokio::process::Command::new("git")
            .current_dir(worktree_path)
            .args(["push", remote, branch])
            .output(),
    )
    .await
    .map_err(|_| CoreError::SubprocessTimeout {
        command: command.clone(),
    })?
    .map_err(CoreError::Io)?;

    if !output.status.success() {
        return Err(CoreError::SubprocessFailed {
            command,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

pub fn is_valid_branch_name(branch: &str) -> bool {
    if branch.is_empty() || branch.len() > 255 {
        return false;
    }
    if branch.starts_with('/') || branch.ends_with('/') || branch.contains("//") {
        return false;
    }
    if branch.contains("..") || branch.ends_with(".lock") {
        return false;
    }
    for part in branch.split('/') {
        if part.is_empty() || part.starts_with('.') || part.ends_with('.') {
            return false;
        }
    }
    branch
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '/' || c == '.')
}
