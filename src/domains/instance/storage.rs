use anyhow::{anyhow, Context, Result};
use std::collections::HashSet;

use super::entity::{Instance, InstanceData};
use crate::domains::storage::StateManager;

/// Persists instances through the store's capability set. The coordinator is
/// the only writer of the instances blob; the store itself never interprets
/// it.
#[derive(Debug)]
pub struct Storage<S: StateManager> {
    state: S,
}

impl<S: StateManager> Storage<S> {
    pub fn new(state: S) -> Storage<S> {
        Storage { state }
    }

    pub fn load_instances(&self) -> Result<Vec<Instance>> {
        let raw = self.state.get_instances();
        let records: Vec<InstanceData> =
            serde_json::from_value(raw).context("failed to parse stored instances")?;
        Ok(records.into_iter().map(Instance::from_data).collect())
    }

    /// Persist all started instances. Unstarted (memory-only) records are
    /// skipped; duplicate titles are rejected to keep the `(repo, title)`
    /// uniqueness invariant.
    pub fn save_instances(&mut self, instances: &[Instance]) -> Result<()> {
        let mut titles: HashSet<&str> = HashSet::new();
        for instance in instances.iter().filter(|i| i.started()) {
            if !titles.insert(instance.title.as_str()) {
                return Err(anyhow!("duplicate instance title: {}", instance.title));
            }
        }

        let records: Vec<InstanceData> = instances
            .iter()
            .filter(|i| i.started())
            .map(Instance::to_data)
            .collect();
        self.state.save_instances(serde_json::to_value(records)?)
    }

    pub fn delete_all_instances(&mut self) -> Result<()> {
        self.state.delete_all_instances()
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::git::operations::tests_support::init_repo_with_commit;
    use crate::domains::instance::entity::{InstanceOptions, Status};
    use crate::domains::storage::{AppState, InstanceStorage, State};
    use serde_json::Value;
    use tempfile::TempDir;

    /// In-memory stand-in proving the coordinator depends only on the
    /// capability set, not on the on-disk store.
    #[derive(Default)]
    struct MemoryState {
        help_screens_seen: u32,
        instances: Option<Value>,
    }

    impl InstanceStorage for MemoryState {
        fn save_instances(&mut self, instances: Value) -> Result<()> {
            self.instances = Some(instances);
            Ok(())
        }

        fn get_instances(&self) -> Value {
            self.instances.clone().unwrap_or_else(|| Value::Array(vec![]))
        }

        fn delete_all_instances(&mut self) -> Result<()> {
            self.instances = None;
            Ok(())
        }
    }

    impl AppState for MemoryState {
        fn help_screens_seen(&self) -> u32 {
            self.help_screens_seen
        }

        fn set_help_screens_seen(&mut self, seen: u32) -> Result<()> {
            self.help_screens_seen = seen;
            Ok(())
        }
    }

    fn started_instance(repo: &std::path::Path, title: &str) -> Instance {
        let fresh = Instance::new(InstanceOptions {
            title,
            program: "claude",
            repo_path: repo,
            branch_prefix: "session/",
            auto_yes: false,
        })
        .unwrap();
        // Fake the started state without touching tmux.
        let mut data = fresh.to_data();
        data.status = Status::Ready;
        data.base_commit = "deadbeef".into();
        Instance::from_data(data)
    }

    #[test]
    fn round_trip_through_memory_store() {
        let tmp = TempDir::new().unwrap();
        init_repo_with_commit(tmp.path());

        let mut storage = Storage::new(MemoryState::default());
        let instances = vec![
            started_instance(tmp.path(), "t1"),
            started_instance(tmp.path(), "t2"),
        ];
        storage.save_instances(&instances).unwrap();

        let loaded = storage.load_instances().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].title, "t1");
        assert_eq!(loaded[1].base_commit, "deadbeef");
        assert!(loaded.iter().all(|i| i.started()));
    }

    #[test]
    fn unstarted_instances_are_not_persisted() {
        let tmp = TempDir::new().unwrap();
        init_repo_with_commit(tmp.path());

        let unstarted = Instance::new(InstanceOptions {
            title: "draft",
            program: "claude",
            repo_path: tmp.path(),
            branch_prefix: "session/",
            auto_yes: false,
        })
        .unwrap();

        let mut storage = Storage::new(MemoryState::default());
        storage.save_instances(&[unstarted]).unwrap();
        assert!(storage.load_instances().unwrap().is_empty());
    }

    #[test]
    fn duplicate_titles_are_rejected() {
        let tmp = TempDir::new().unwrap();
        init_repo_with_commit(tmp.path());

        let mut storage = Storage::new(MemoryState::default());
        let instances = vec![
            started_instance(tmp.path(), "same"),
            started_instance(tmp.path(), "same"),
        ];
        assert!(storage.save_instances(&instances).is_err());
    }

    #[test]
    fn disk_store_round_trips_instances() {
        let tmp = TempDir::new().unwrap();
        init_repo_with_commit(tmp.path());

        let mut storage = Storage::new(State::load(tmp.path()));
        storage
            .save_instances(&[started_instance(tmp.path(), "persisted")])
            .unwrap();

        let reopened = Storage::new(State::load(tmp.path()));
        let loaded = reopened.load_instances().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].title, "persisted");
    }
}
