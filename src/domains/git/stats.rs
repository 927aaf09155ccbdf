use anyhow::{anyhow, Result};
use git2::{DiffOptions, Oid, Repository};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Diff of a worktree against the base commit recorded when the worktree was
/// created. Covers committed work, staged work, and untracked files alike.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub files_changed: usize,
    pub lines_added: usize,
    pub lines_removed: usize,
}

impl DiffStats {
    pub fn is_empty(&self) -> bool {
        self.files_changed == 0
    }
}

pub fn diff_stats(worktree_path: &Path, base_commit: &str) -> Result<DiffStats> {
    // Open the worktree repo directly; discovery could land on the parent
    // repository and report the wrong status.
    let repo = Repository::open(worktree_path)?;

    let base_oid = Oid::from_str(base_commit)
        .map_err(|e| anyhow!("invalid base commit '{base_commit}': {e}"))?;
    let base_tree = repo.find_commit(base_oid)?.tree()?;

    let mut opts = DiffOptions::new();
    opts.include_untracked(true)
        .recurse_untracked_dirs(true)
        .show_untracked_content(true);

    let diff = repo.diff_tree_to_workdir_with_index(Some(&base_tree), Some(&mut opts))?;
    let totals = diff.stats()?;

    Ok(DiffStats {
        files_changed: totals.files_changed(),
        lines_added: totals.insertions(),
        lines_removed: totals.deletions(),
    })
}
