use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use crate::domains::repo;

pub const STATE_FILE_NAME: &str = "state.json";

/// Instance-blob capability of the store. The instances array is opaque here;
/// its element schema is owned by the instance coordinator.
pub trait InstanceStorage {
    fn save_instances(&mut self, instances: Value) -> Result<()>;
    fn get_instances(&self) -> Value;
    fn delete_all_instances(&mut self) -> Result<()>;
}

/// Application-level bits consumed by the UI collaborator.
pub trait AppState {
    fn help_screens_seen(&self) -> u32;
    fn set_help_screens_seen(&mut self, seen: u32) -> Result<()>;
}

pub trait StateManager: InstanceStorage + AppState {}
impl<T: InstanceStorage + AppState> StateManager for T {}

/// The per-repo state document. One JSON object, treated as a single
/// versioned blob; partial updates are not supported.
#[derive(Debug, Serialize, Deserialize)]
pub struct State {
    pub help_screens_seen: u32,
    #[serde(default = "empty_instances")]
    pub instances: Value,
    #[serde(skip)]
    repo_path: PathBuf,
}

fn empty_instances() -> Value {
    Value::Array(Vec::new())
}

impl State {
    fn default_for(repo_path: &Path) -> Self {
        State {
            help_screens_seen: 0,
            instances: empty_instances(),
            repo_path: repo_path.to_path_buf(),
        }
    }

    fn state_path(repo_path: &Path) -> Result<PathBuf> {
        Ok(repo::state_dir(repo_path)?.join(STATE_FILE_NAME))
    }

    /// Load the state document for a repository. A missing file yields the
    /// default document (which is persisted immediately). An unparsable
    /// primary is quarantined for forensics and the backup is adopted when it
    /// parses; otherwise a fresh default is returned and the loss is logged.
    pub fn load(repo_path: &Path) -> Self {
        let state_path = match Self::state_path(repo_path) {
            Ok(p) => p,
            Err(e) => {
                log::error!("failed to get state directory: {e}");
                return Self::default_for(repo_path);
            }
        };

        let data = match fs::read(&state_path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let state = Self::default_for(repo_path);
                if let Err(e) = state.save() {
                    log::warn!("failed to save default state: {e}");
                }
                return state;
            }
            Err(e) => {
                log::warn!("failed to read state file: {e}");
                return Self::default_for(repo_path);
            }
        };

        match serde_json::from_slice::<State>(&data) {
            Ok(mut state) => {
                state.repo_path = repo_path.to_path_buf();
                state
            }
            Err(e) => {
                log::error!("state file corrupted: {e}");
                Self::recover(repo_path, &state_path)
            }
        }
    }

    /// Corruption path: quarantine the primary, then try the backup.
    fn recover(repo_path: &Path, state_path: &Path) -> Self {
        let corrupted_path = state_path.with_file_name(format!(
            "{}.corrupted.{}",
            STATE_FILE_NAME,
            Utc::now().timestamp()
        ));
        match fs::rename(state_path, &corrupted_path) {
            Ok(()) => log::info!("corrupted state preserved at: {}", corrupted_path.display()),
            Err(e) => log::error!("failed to preserve corrupted state: {e}"),
        }

        let backup_path = backup_path(state_path);
        if let Ok(backup_data) = fs::read(&backup_path) {
            if let Ok(mut state) = serde_json::from_slice::<State>(&backup_data) {
                log::info!("restored state from backup");
                state.repo_path = repo_path.to_path_buf();
                // Re-establish the primary so the next load does not hit the
                // backup again.
                if let Err(e) = state.save() {
                    log::warn!("failed to rewrite primary from backup: {e}");
                }
                return state;
            }
            log::error!("backup file is also corrupted");
        }

        log::warn!("starting with fresh state - previous instances lost");
        Self::default_for(repo_path)
    }

    /// Persist the document. The existing primary is rotated to `.bak` before
    /// the new bytes are written, so at every instant at least one consistent
    /// copy exists on disk. On write failure the backup is restored over the
    /// primary.
    pub fn save(&self) -> Result<()> {
        let state_path = Self::state_path(&self.repo_path)?;
        let data = serde_json::to_vec_pretty(self).context("failed to serialize state")?;

        let backup = backup_path(&state_path);
        if state_path.exists() {
            if fs::rename(&state_path, &backup).is_err() {
                // Rename across the same directory should not fail, but fall
                // back to a copy so the rotation still happens.
                if let Ok(existing) = fs::read(&state_path) {
                    let _ = fs::write(&backup, existing);
                }
            }
        }

        if let Err(e) = fs::write(&state_path, &data) {
            if backup.exists() {
                let _ = fs::rename(&backup, &state_path);
            }
            return Err(e).context("failed to write state file");
        }

        Ok(())
    }
}

fn backup_path(state_path: &Path) -> PathBuf {
    state_path.with_file_name(format!("{STATE_FILE_NAME}.bak"))
}

impl InstanceStorage for State {
    fn save_instances(&mut self, instances: Value) -> Result<()> {
        self.instances = instances;
        self.save()
    }

    fn get_instances(&self) -> Value {
        self.instances.clone()
    }

    fn delete_all_instances(&mut self) -> Result<()> {
        self.instances = empty_instances();
        self.save()
    }
}

impl AppState for State {
    fn help_screens_seen(&self) -> u32 {
        self.help_screens_seen
    }

    fn set_help_screens_seen(&mut self, seen: u32) -> Result<()> {
        self.help_screens_seen = seen;
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn state_file(repo: &Path) -> PathBuf {
        repo.join(repo::STATE_DIR_NAME).join(STATE_FILE_NAME)
    }

    #[test]
    fn first_load_writes_default_document() {
        let tmp = TempDir::new().unwrap();
        let state = State::load(tmp.path());
        assert_eq!(state.help_screens_seen(), 0);
        assert_eq!(state.get_instances(), json!([]));
        assert!(state_file(tmp.path()).is_file());
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = TempDir::new().unwrap();
        let mut state = State::load(tmp.path());
        state
            .save_instances(json!([{"title": "t1", "status": "running"}]))
            .unwrap();
        state.set_help_screens_seen(0b101).unwrap();

        let reloaded = State::load(tmp.path());
        assert_eq!(reloaded.help_screens_seen(), 0b101);
        assert_eq!(reloaded.get_instances()[0]["title"], "t1");
    }

    #[test]
    fn save_rotates_primary_into_backup() {
        let tmp = TempDir::new().unwrap();
        let mut state = State::load(tmp.path());
        state.save_instances(json!(["first"])).unwrap();
        state.save_instances(json!(["second"])).unwrap();

        let backup = fs::read_to_string(
            state_file(tmp.path()).with_file_name(format!("{STATE_FILE_NAME}.bak")),
        )
        .unwrap();
        assert!(backup.contains("first"));
        let primary = fs::read_to_string(state_file(tmp.path())).unwrap();
        assert!(primary.contains("second"));
    }

    #[test]
    fn corrupt_primary_is_quarantined_and_backup_adopted() {
        let tmp = TempDir::new().unwrap();
        let mut state = State::load(tmp.path());
        state.save_instances(json!(["kept"])).unwrap();
        // A second save pushes the good document into the backup slot.
        state.save_instances(json!(["kept"])).unwrap();

        fs::write(state_file(tmp.path()), "{").unwrap();

        let recovered = State::load(tmp.path());
        assert_eq!(recovered.get_instances(), json!(["kept"]));

        let state_dir = tmp.path().join(repo::STATE_DIR_NAME);
        let quarantined: Vec<_> = fs::read_dir(&state_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("state.json.corrupted.")
            })
            .collect();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(fs::read_to_string(quarantined[0].path()).unwrap(), "{");
    }

    #[test]
    fn corrupt_primary_and_backup_falls_back_to_default() {
        let tmp = TempDir::new().unwrap();
        let state = State::load(tmp.path());
        state.save().unwrap();

        fs::write(state_file(tmp.path()), "{").unwrap();
        let backup = state_file(tmp.path()).with_file_name(format!("{STATE_FILE_NAME}.bak"));
        fs::write(&backup, "also not json").unwrap();

        let recovered = State::load(tmp.path());
        assert_eq!(recovered.get_instances(), json!([]));
        assert_eq!(recovered.help_screens_seen(), 0);
    }

    #[test]
    fn delete_all_instances_empties_the_array() {
        let tmp = TempDir::new().unwrap();
        let mut state = State::load(tmp.path());
        state.save_instances(json!(["a", "b"])).unwrap();
        state.delete_all_instances().unwrap();

        let reloaded = State::load(tmp.path());
        assert_eq!(reloaded.get_instances(), json!([]));
    }

    #[test]
    fn save_of_unchanged_instances_is_a_noop_on_content() {
        let tmp = TempDir::new().unwrap();
        let mut state = State::load(tmp.path());
        state.save_instances(json!([{"title": "t"}])).unwrap();

        let before = fs::read_to_string(state_file(tmp.path())).unwrap();
        let current = state.get_instances();
        state.save_instances(current).unwrap();
        let after = fs::read_to_string(state_file(tmp.path())).unwrap();
        assert_eq!(before, after);
    }
}
