use std::path::PathBuf;
use thiserror::Error;

/// Errors the core distinguishes for callers. Recoverable kinds
/// (StoreCorrupt, SessionLost) are handled inside the core; everything else
/// surfaces to the UI with enough of a tag to decide display vs. retry.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("another cs instance is running in this repo (PID {pid})")]
    LockHeld { pid: String },
    #[error("repository not found: {0}")]
    RepoNotFound(PathBuf),
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),
    #[error("state file corrupted and backup unusable")]
    StoreCorrupt,
    #[error("{transition} failed at step '{step}': {source}")]
    TransitionFailed {
        transition: &'static str,
        step: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("tmux session '{0}' disappeared")]
    SessionLost(String),
    #[error("branch '{0}' is checked out elsewhere")]
    BranchConflict(String),
    #[error("command timed out: {command}")]
    SubprocessTimeout { command: String },
    #[error("command failed: {command}: {stderr}")]
    SubprocessFailed { command: String, stderr: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn transition(transition: &'static str, step: &'static str, source: anyhow::Error) -> Self {
        CoreError::TransitionFailed {
            transition,
            step,
            source,
        }
    }
}
