use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::domains::git::DiffStats;
use crate::domains::monitor::OutputMonitor;
use crate::domains::repo;
use crate::domains::tmux::TmuxSession;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// The assistant is producing output.
    Running,
    /// Output has settled; the assistant is waiting for the user.
    Ready,
    /// Session exists but nothing meaningful is on screen yet.
    Loading,
    /// Committed and torn down; only the branch and the record remain.
    Paused,
}

impl Status {
    pub fn as_str(&self) -> &str {
        match self {
            Status::Running => "running",
            Status::Ready => "ready",
            Status::Loading => "loading",
            Status::Paused => "paused",
        }
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Status::Running),
            "ready" => Ok(Status::Ready),
            "loading" => Ok(Status::Loading),
            "paused" => Ok(Status::Paused),
            _ => Err(format!("Invalid instance status: {s}")),
        }
    }
}

pub struct InstanceOptions<'a> {
    pub title: &'a str,
    pub program: &'a str,
    pub repo_path: &'a Path,
    pub branch_prefix: &'a str,
    pub auto_yes: bool,
}

/// One managed assistant: a worktree, a tmux session, a branch, and this
/// durable record. The runtime half (session handle, output monitor) never
/// touches disk.
#[derive(Debug)]
pub struct Instance {
    pub title: String,
    pub program: String,
    pub branch: String,
    pub worktree_path: PathBuf,
    pub base_commit: String,
    pub session_name: String,
    pub status: Status,
    pub auto_yes: bool,
    pub repo_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub diff_stats: DiffStats,

    pub(super) started: bool,
    pub(super) session: Option<TmuxSession>,
    pub(super) monitor: OutputMonitor,
}

/// Serialized mirror of `Instance`. The store treats the array of these as an
/// opaque blob; this module owns the element schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceData {
    pub title: String,
    pub program: String,
    pub branch: String,
    pub worktree_path: PathBuf,
    pub base_commit: String,
    pub session_name: String,
    pub status: Status,
    pub auto_yes: bool,
    pub repo_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub diff_stats: DiffStats,
}

impl Instance {
    /// A memory-only record; nothing exists on disk or in tmux until the
    /// first `start`.
    pub fn new(opts: InstanceOptions<'_>) -> Result<Instance> {
        let sanitized = repo::sanitize_title(opts.title)?;
        let repo_path = repo::canonical_repo_path(opts.repo_path)?;
        let hash = repo::repo_hash(&repo_path)?;
        let now = Utc::now();

        Ok(Instance {
            title: opts.title.to_string(),
            program: opts.program.to_string(),
            branch: format!("{}{sanitized}", opts.branch_prefix),
            worktree_path: PathBuf::new(),
            base_commit: String::new(),
            session_name: crate::domains::tmux::session_name_for(&hash, &sanitized),
            status: Status::Loading,
            auto_yes: opts.auto_yes,
            repo_path,
            created_at: now,
            updated_at: now,
            diff_stats: DiffStats::default(),
            started: false,
            session: None,
            monitor: OutputMonitor::new(),
        })
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn paused(&self) -> bool {
        self.status == Status::Paused
    }

    pub fn session(&self) -> Option<&TmuxSession> {
        self.session.as_ref()
    }

    pub(super) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// A fresh, unique worktree location for this title:
    /// `<state-dir>/worktrees/<sanitized-title>_<hex-timestamp>/`.
    pub(super) fn next_worktree_path(&self) -> Result<PathBuf> {
        let sanitized = repo::sanitize_title(&self.title)?;
        let stamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Ok(repo::worktrees_dir(&self.repo_path)?.join(format!("{sanitized}_{stamp:x}")))
    }

    pub fn to_data(&self) -> InstanceData {
        InstanceData {
            title: self.title.clone(),
            program: self.program.clone(),
            branch: self.branch.clone(),
            worktree_path: self.worktree_path.clone(),
            base_commit: self.base_commit.clone(),
            session_name: self.session_name.clone(),
            status: self.status,
            auto_yes: self.auto_yes,
            repo_path: self.repo_path.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            diff_stats: self.diff_stats.clone(),
        }
    }

    /// Rehydrate a stored record. Only started instances are ever persisted,
    /// so the result is marked started; the session handle is re-established
    /// by `start_from_storage`.
    pub fn from_data(data: InstanceData) -> Instance {
        Instance {
            title: data.title,
            program: data.program,
            branch: data.branch,
            worktree_path: data.worktree_path,
            base_commit: data.base_commit,
            session_name: data.session_name,
            status: data.status,
            auto_yes: data.auto_yes,
            repo_path: data.repo_path,
            created_at: data.created_at,
            updated_at: data.updated_at,
            diff_stats: data.diff_stats,
            started: true,
            session: None,
            monitor: OutputMonitor::new(),
        }
    }
}
