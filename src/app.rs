use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::Config;
use crate::daemon;
use crate::domains::git;
use crate::domains::instance::{Instance, InstanceOptions, Storage};
use crate::domains::lock::ProcessLock;
use crate::domains::repo;
use crate::domains::storage::State;
use crate::error::CoreError;

/// Cadence for status/diff refreshes while the controller idles. The
/// interactive UI collaborator drives its own preview ticks on top of this.
const METADATA_TICK: Duration = Duration::from_millis(500);

/// The per-repository controller: owns the process lock, the store, and every
/// instance coordinator for the repo. The interactive UI drives it through
/// the public methods; `run` is the headless loop used when no UI event is
/// pending.
#[derive(Debug)]
pub struct Controller {
    repo_path: PathBuf,
    config: Config,
    program: String,
    auto_yes: bool,
    storage: Storage<State>,
    instances: Vec<Instance>,
    _lock: ProcessLock,
}

impl Controller {
    /// Start up against the repository at `path`: verify it is a git repo,
    /// take the exclusive per-repo lock, stop any stale daemon, prune
    /// leftover worktrees, and re-adopt the stored instances.
    pub async fn new(
        path: &Path,
        program_override: Option<String>,
        auto_yes_flag: bool,
    ) -> std::result::Result<Controller, CoreError> {
        if !repo::is_git_repo(path) {
            return Err(CoreError::NotAGitRepo(path.to_path_buf()));
        }
        let repo_path = repo::canonical_repo_path(path)
            .map_err(|_| CoreError::RepoNotFound(path.to_path_buf()))?;

        let lock = ProcessLock::acquire(&repo_path)?;

        let config = crate::config::load_config();
        let program = program_override.unwrap_or_else(|| config.default_program.clone());
        let auto_yes = auto_yes_flag || config.auto_yes;

        // The daemon must never overlap a live controller.
        if let Err(e) = daemon::stop_daemon(&repo_path) {
            log::error!("failed to stop daemon: {e}");
        }

        if let Err(e) = git::prune_worktrees(&repo_path) {
            log::warn!("failed to prune worktrees: {e}");
        }

        let storage = Storage::new(State::load(&repo_path));
        let mut instances = storage
            .load_instances()
            .map_err(|e| CoreError::Io(std::io::Error::other(e.to_string())))?;
        for instance in &mut instances {
            if let Err(e) = instance.start(false).await {
                log::warn!("failed to adopt instance {}: {e}", instance.title);
            }
        }

        Ok(Controller {
            repo_path,
            config,
            program,
            auto_yes,
            storage,
            instances,
            _lock: lock,
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn auto_yes(&self) -> bool {
        self.auto_yes
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    /// Create and start a new instance, then persist the updated set.
    pub async fn create_instance(&mut self, title: &str) -> Result<()> {
        if self.instances.iter().any(|i| i.title == title) {
            return Err(anyhow!("an instance titled '{title}' already exists"));
        }

        let mut instance = Instance::new(InstanceOptions {
            title,
            program: &self.program,
            repo_path: &self.repo_path,
            branch_prefix: &self.config.branch_prefix,
            auto_yes: self.auto_yes,
        })?;
        instance.start(true).await?;
        self.instances.push(instance);
        self.persist()?;
        Ok(())
    }

    pub async fn pause_instance(&mut self, title: &str) -> Result<()> {
        self.with_instance(title)?.pause().await?;
        self.persist()
    }

    pub async fn resume_instance(&mut self, title: &str) -> Result<()> {
        self.with_instance(title)?.resume().await?;
        self.persist()
    }

    pub async fn kill_instance(&mut self, title: &str) -> Result<()> {
        let index = self.index_of(title)?;
        // Best-effort: the record goes away even if some teardown steps
        // complained, and the complaint is surfaced afterwards.
        let result = self.instances[index].kill().await;
        self.instances.remove(index);
        self.persist()?;
        result.map_err(Into::into)
    }

    pub async fn attach_instance(&mut self, title: &str) -> Result<()> {
        self.with_instance(title)?.attach().await?;
        Ok(())
    }

    /// One metadata pass over all instances: refresh status and diff stats,
    /// and honor auto-yes while the controller is the live driver.
    pub async fn tick(&mut self) {
        let auto_yes = self.auto_yes;
        for instance in &mut self.instances {
            if !instance.started() || instance.paused() {
                continue;
            }
            match instance.refresh_status().await {
                Ok(_) => {}
                Err(CoreError::SessionLost(name)) => {
                    log::warn!("session {name} lost; instance '{}' paused", instance.title);
                    continue;
                }
                Err(e) => {
                    log::debug!("status refresh failed for {}: {e}", instance.title);
                    continue;
                }
            }
            if auto_yes {
                if let Ok((_, true)) = instance.has_updated().await {
                    let _ = instance.tap_enter().await;
                }
            }
            if let Err(e) = instance.update_diff_stats().await {
                log::debug!("diff stats failed for {}: {e}", instance.title);
            }
        }
    }

    /// Headless driver loop: periodic metadata ticks until SIGINT, then a
    /// clean shutdown.
    pub async fn run(&mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(METADATA_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        self.shutdown()
    }

    /// Detach from everything and persist. Sessions keep running; that is
    /// the point of the multiplexer.
    pub fn shutdown(&mut self) -> Result<()> {
        for instance in &mut self.instances {
            instance.detach_safely();
        }
        self.persist()
    }

    fn persist(&mut self) -> Result<()> {
        let instances = std::mem::take(&mut self.instances);
        let result = self.storage.save_instances(&instances);
        self.instances = instances;
        result
    }

    fn index_of(&self, title: &str) -> Result<usize> {
        self.instances
            .iter()
            .position(|i| i.title == title)
            .ok_or_else(|| anyhow!("no instance titled '{title}'"))
    }

    fn with_instance(&mut self, title: &str) -> Result<&mut Instance> {
        let index = self.index_of(title)?;
        Ok(&mut self.instances[index])
    }
}

/// `cs reset`: wipe the store, this repo's sessions, its worktrees, and its
/// daemon. Each stage reports independently so one failure does not hide the
/// rest.
pub async fn reset(path: &Path) -> Result<()> {
    if !repo::is_git_repo(path) {
        return Err(CoreError::NotAGitRepo(path.to_path_buf()).into());
    }
    let repo_path = repo::canonical_repo_path(path)?;

    let mut storage = Storage::new(State::load(&repo_path));
    storage.delete_all_instances()?;
    println!("Storage has been reset successfully");

    let hash = repo::repo_hash(&repo_path)?;
    crate::domains::tmux::cleanup_sessions_by_prefix(&format!(
        "{}{hash}",
        crate::domains::tmux::TMUX_PREFIX
    ))
    .await?;
    println!("Tmux sessions have been cleaned up");

    git::cleanup_worktrees(&repo_path)?;
    println!("Worktrees have been cleaned up");

    daemon::stop_daemon(&repo_path)?;
    println!("daemon has been stopped");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::git::operations::tests_support::init_repo_with_commit;
    use tempfile::TempDir;

    #[tokio::test]
    async fn controller_refuses_non_git_directories() {
        let tmp = TempDir::new().unwrap();
        let err = Controller::new(tmp.path(), None, false).await.unwrap_err();
        assert!(matches!(err, CoreError::NotAGitRepo(_)));
    }

    #[tokio::test]
    async fn controller_starts_with_empty_instance_set() {
        let tmp = TempDir::new().unwrap();
        init_repo_with_commit(tmp.path());
        let controller = Controller::new(tmp.path(), None, false).await.unwrap();
        assert!(controller.instances().is_empty());
        assert!(tmp.path().join(".claude-squad").join("state.json").exists());
    }

    #[tokio::test]
    async fn lock_is_released_on_drop() {
        let tmp = TempDir::new().unwrap();
        init_repo_with_commit(tmp.path());
        {
            let _controller = Controller::new(tmp.path(), None, false).await.unwrap();
            assert!(tmp.path().join(".claude-squad").join("cs.lock").exists());
        }
        assert!(!tmp.path().join(".claude-squad").join("cs.lock").exists());
    }

    #[tokio::test]
    async fn program_override_beats_config_default() {
        let tmp = TempDir::new().unwrap();
        init_repo_with_commit(tmp.path());
        let controller = Controller::new(tmp.path(), Some("aider".into()), false)
            .await
            .unwrap();
        assert_eq!(controller.program, "aider");
    }

    #[tokio::test]
    async fn reset_on_fresh_repo_leaves_default_state() {
        let tmp = TempDir::new().unwrap();
        init_repo_with_commit(tmp.path());
        reset(tmp.path()).await.unwrap();

        let state = State::load(tmp.path());
        use crate::domains::storage::InstanceStorage;
        assert_eq!(state.get_instances(), serde_json::json!([]));
    }
}
