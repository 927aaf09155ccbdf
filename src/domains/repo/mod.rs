use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

pub const STATE_DIR_NAME: &str = ".claude-squad";
pub const WORKTREES_DIR_NAME: &str = "worktrees";

/// Resolve symlinks and return the absolute canonical path to a repository.
/// The same repository accessed through different paths (e.g. symlinks)
/// always resolves to the same canonical path.
pub fn canonical_repo_path(path: &Path) -> Result<PathBuf> {
    fs::canonicalize(path)
        .with_context(|| format!("failed to resolve repository path: {}", path.display()))
}

/// Short hash (first 8 lowercase hex chars of SHA-256) of the canonical
/// repository path. Used to namespace tmux sessions and per-repo artifacts.
pub fn repo_hash(repo_path: &Path) -> Result<String> {
    let canonical = canonical_repo_path(repo_path)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    let hex = format!("{digest:x}");
    Ok(hex[..8].to_string())
}

pub fn is_git_repo(path: &Path) -> bool {
    git2::Repository::open(path).is_ok()
}

/// Per-repo state directory: `<repo>/.claude-squad/`.
/// Created on first use (0755) and seeded with a `.gitignore` ignoring all
/// contents so controller artifacts never show up in `git status`.
pub fn state_dir(repo_path: &Path) -> Result<PathBuf> {
    let canonical = canonical_repo_path(repo_path)?;
    let dir = canonical.join(STATE_DIR_NAME);

    fs::create_dir_all(&dir).with_context(|| {
        format!(
            "failed to create state directory {} (check write permissions)",
            dir.display()
        )
    })?;

    let gitignore = dir.join(".gitignore");
    if !gitignore.exists() {
        if let Err(e) = fs::write(&gitignore, "*\n") {
            log::warn!("failed to create .gitignore in state directory: {e}");
        }
    }

    Ok(dir)
}

/// Root directory for this repo's worktrees, inside the state directory.
pub fn worktrees_dir(repo_path: &Path) -> Result<PathBuf> {
    Ok(state_dir(repo_path)?.join(WORKTREES_DIR_NAME))
}

/// Sanitize a user-chosen title for use in session names and branch names:
/// whitespace is stripped, `.` becomes `_`. An empty result is rejected.
pub fn sanitize_title(title: &str) -> Result<String> {
    let sanitized: String = title
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == '.' { '_' } else { c })
        .collect();
    if sanitized.is_empty() {
        return Err(anyhow!("title '{title}' sanitizes to an empty string"));
    }
    Ok(sanitized)
}
