use anyhow::anyhow;
use chrono::Utc;

use super::entity::{Instance, Status};
use crate::domains::git;
use crate::domains::tmux::{self, TmuxSession};
use crate::error::CoreError;

type Result<T> = std::result::Result<T, CoreError>;

/// Lifecycle transitions. Each one runs its steps in a fixed order so a crash
/// between steps leaves a state `start_from_storage` can pick up again.
impl Instance {
    /// First start: create the worktree, start the session inside it, mark
    /// Running. A failure at step k rolls back steps 1..k-1 in reverse order.
    pub async fn start(&mut self, first_time: bool) -> Result<()> {
        if first_time {
            self.start_new().await
        } else {
            self.start_from_storage().await
        }
    }

    async fn start_new(&mut self) -> Result<()> {
        if self.started {
            return Err(CoreError::transition(
                "start",
                "validate",
                anyhow!("instance '{}' already started", self.title),
            ));
        }

        // Step 1: worktree (and possibly branch).
        let worktree_path = self
            .next_worktree_path()
            .map_err(|e| CoreError::transition("start", "create worktree", e))?;
        let setup = git::setup_worktree(&self.repo_path, "HEAD", &self.branch, &worktree_path)
            .map_err(|e| CoreError::transition("start", "create worktree", e))?;

        // Step 2: session.
        let session = match self.open_session() {
            Ok(s) => s,
            Err(e) => {
                self.rollback_worktree(&worktree_path, setup.branch_created);
                return Err(CoreError::transition("start", "start session", e));
            }
        };
        if let Err(e) = session.start(&worktree_path).await {
            self.rollback_worktree(&worktree_path, setup.branch_created);
            return Err(CoreError::transition("start", "start session", e.into()));
        }

        // Step 3: mark running. Persisting is the storage wrapper's job.
        self.worktree_path = worktree_path;
        self.base_commit = setup.head_sha;
        self.session = Some(session);
        self.status = Status::Running;
        self.started = true;
        self.touch();
        Ok(())
    }

    fn rollback_worktree(&self, worktree_path: &std::path::Path, branch_created: bool) {
        if let Err(e) = git::remove_worktree(&self.repo_path, worktree_path) {
            log::warn!("rollback: failed to remove worktree: {e}");
        }
        if branch_created {
            if let Err(e) = git::delete_branch(&self.repo_path, &self.branch) {
                log::warn!("rollback: failed to delete branch {}: {e}", self.branch);
            }
        }
    }

    /// Controller restart with an existing record: adopt what survived,
    /// recreate what did not, and keep the persisted status.
    async fn start_from_storage(&mut self) -> Result<()> {
        if self.paused() {
            // Nothing to re-establish; resume will rebuild worktree + session.
            return Ok(());
        }

        if !self.worktree_path.exists() {
            let worktree_path = self
                .next_worktree_path()
                .map_err(|e| CoreError::transition("load", "recreate worktree", e))?;
            // The preserved branch carries the work; the recorded base commit
            // is only the fallback when the branch itself is gone.
            git::setup_worktree(&self.repo_path, &self.base_commit, &self.branch, &worktree_path)
                .map_err(|e| CoreError::transition("load", "recreate worktree", e))?;
            self.worktree_path = worktree_path;
        }

        let session = self
            .open_session()
            .map_err(|e| CoreError::transition("load", "open session", e))?;
        if !session.restore().await? {
            session.start(&self.worktree_path).await?;
        }
        self.session = Some(session);
        self.touch();
        Ok(())
    }

    /// Commit everything, tear the session and worktree down, keep the
    /// branch. A failure surfaces with the step that broke; the steps that
    /// already ran are not undone.
    pub async fn pause(&mut self) -> Result<()> {
        if !self.started || self.paused() {
            return Err(CoreError::transition(
                "pause",
                "validate",
                anyhow!("instance '{}' is not running", self.title),
            ));
        }

        git::commit_all_changes(&self.worktree_path, &self.pause_commit_message())
            .map_err(|e| CoreError::transition("pause", "commit changes", e))?;

        if let Some(session) = self.session.as_mut() {
            session.detach_safely();
        }

        match self.session.take() {
            Some(mut session) => session.kill().await,
            None => tmux::kill_session(&self.session_name).await,
        }
        .map_err(|e| CoreError::transition("pause", "kill session", e.into()))?;

        git::remove_worktree(&self.repo_path, &self.worktree_path)
            .map_err(|e| CoreError::transition("pause", "remove worktree", e))?;

        self.worktree_path = std::path::PathBuf::new();
        self.status = Status::Paused;
        self.touch();
        Ok(())
    }

    fn pause_commit_message(&self) -> String {
        format!(
            "[claudesquad] pause '{}' at {}",
            self.title,
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        )
    }

    /// Inverse of pause: rebuild the worktree from the preserved branch and
    /// start a fresh session in it. Refuses when the branch is checked out
    /// elsewhere.
    pub async fn resume(&mut self) -> Result<()> {
        if !self.paused() {
            return Err(CoreError::transition(
                "resume",
                "validate",
                anyhow!("instance '{}' is not paused", self.title),
            ));
        }

        let conflicted = git::branch_checked_out_elsewhere(&self.repo_path, &self.branch)
            .map_err(|e| CoreError::transition("resume", "check branch", e))?;
        if conflicted {
            return Err(CoreError::BranchConflict(self.branch.clone()));
        }

        let worktree_path = self
            .next_worktree_path()
            .map_err(|e| CoreError::transition("resume", "create worktree", e))?;
        git::setup_worktree(&self.repo_path, &self.base_commit, &self.branch, &worktree_path)
            .map_err(|e| CoreError::transition("resume", "create worktree", e))?;

        let session = self
            .open_session()
            .map_err(|e| CoreError::transition("resume", "start session", e))?;
        if let Err(e) = session.start(&worktree_path).await {
            if let Err(e) = git::remove_worktree(&self.repo_path, &worktree_path) {
                log::warn!("resume rollback: failed to remove worktree: {e}");
            }
            return Err(CoreError::transition("resume", "start session", e.into()));
        }

        self.worktree_path = worktree_path;
        self.session = Some(session);
        self.status = Status::Running;
        self.touch();
        Ok(())
    }

    /// Best-effort teardown of everything: session, worktree, branch. Errors
    /// are accumulated and reported together; no step aborts the rest.
    /// Removing the record from the store is the storage wrapper's job.
    pub async fn kill(&mut self) -> Result<()> {
        let mut failures: Vec<String> = Vec::new();

        if let Some(mut session) = self.session.take() {
            session.detach_safely();
            if let Err(e) = session.kill().await {
                failures.push(format!("kill session: {e}"));
            }
        } else if self.started && !self.paused() {
            match tmux::has_session(&self.session_name).await {
                Ok(true) => {
                    if let Err(e) = tmux::kill_session(&self.session_name).await {
                        failures.push(format!("kill session: {e}"));
                    }
                }
                Ok(false) => {}
                Err(e) => failures.push(format!("query session: {e}")),
            }
        }

        if !self.worktree_path.as_os_str().is_empty() && self.worktree_path.exists() {
            if let Err(e) = git::remove_worktree(&self.repo_path, &self.worktree_path) {
                failures.push(format!("remove worktree: {e}"));
            }
        }

        if self.started {
            if let Err(e) = git::delete_branch(&self.repo_path, &self.branch) {
                failures.push(format!("delete branch: {e}"));
            }
        }

        self.started = false;
        self.touch();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CoreError::transition(
                "kill",
                "teardown",
                anyhow!(failures.join("; ")),
            ))
        }
    }

    /// Attach the user's terminal. Valid only while Running or Ready; the
    /// record itself does not change.
    pub async fn attach(&mut self) -> Result<()> {
        match self.status {
            Status::Running | Status::Ready => {}
            _ => {
                return Err(CoreError::transition(
                    "attach",
                    "validate",
                    anyhow!("instance '{}' is {}", self.title, self.status.as_str()),
                ))
            }
        }
        match self.session.as_mut() {
            Some(session) => session.attach().await,
            None => Err(CoreError::SessionLost(self.session_name.clone())),
        }
    }

    pub fn detach_safely(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.detach_safely();
        }
    }

    /// Sample the session output. Returns `(changed, has_prompt)`; a missing
    /// session comes back as `SessionLost`.
    pub async fn has_updated(&mut self) -> Result<(bool, bool)> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| CoreError::SessionLost(self.session_name.clone()))?;
        let captured = match session.capture(false).await {
            Ok(c) => c,
            Err(CoreError::SubprocessFailed { .. }) => {
                return Err(CoreError::SessionLost(self.session_name.clone()))
            }
            Err(e) => return Err(e),
        };
        Ok(self.monitor.has_updated(&captured))
    }

    /// Re-derive the instance status from the live session. A session that
    /// vanished while the instance was running is folded into the pause
    /// shape (work committed, worktree removed, branch kept) and reported as
    /// `SessionLost` so the caller can offer resume.
    pub async fn refresh_status(&mut self) -> Result<Status> {
        if !self.started || self.paused() {
            return Ok(self.status);
        }

        let alive = tmux::has_session(&self.session_name).await?;
        if !alive {
            log::warn!(
                "session {} disappeared; preserving work on branch {}",
                self.session_name,
                self.branch
            );
            self.session = None;
            if self.worktree_path.exists() {
                if let Err(e) =
                    git::commit_all_changes(&self.worktree_path, &self.pause_commit_message())
                {
                    log::warn!("failed to commit after session loss: {e}");
                }
                if let Err(e) = git::remove_worktree(&self.repo_path, &self.worktree_path) {
                    log::warn!("failed to remove worktree after session loss: {e}");
                }
            }
            self.worktree_path = std::path::PathBuf::new();
            self.status = Status::Paused;
            self.touch();
            return Err(CoreError::SessionLost(self.session_name.clone()));
        }

        let captured = match self.session.as_ref() {
            Some(session) => session.capture(false).await.unwrap_or_default(),
            None => String::new(),
        };
        self.monitor.has_updated(&captured);
        self.status = self.monitor.classify(true, &captured);
        Ok(self.status)
    }

    pub async fn update_diff_stats(&mut self) -> Result<()> {
        if self.base_commit.is_empty() || !self.worktree_path.exists() {
            return Ok(());
        }
        self.diff_stats = git::diff_stats(&self.worktree_path, &self.base_commit)
            .map_err(|e| CoreError::Io(std::io::Error::other(e.to_string())))?;
        Ok(())
    }

    pub async fn tap_enter(&self) -> Result<()> {
        match self.session.as_ref() {
            Some(session) => session.tap_enter().await,
            None => Err(CoreError::SessionLost(self.session_name.clone())),
        }
    }

    pub async fn send_keys(&self, text: &str) -> Result<()> {
        match self.session.as_ref() {
            Some(session) => session.send_keys(text).await,
            None => Err(CoreError::SessionLost(self.session_name.clone())),
        }
    }

    fn open_session(&self) -> anyhow::Result<TmuxSession> {
        TmuxSession::from_parts(&self.session_name, &self.program, &self.repo_path)
    }
}
