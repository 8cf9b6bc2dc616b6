//! Persistent mapping of current deployments, with periodic autosave.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::domain::{CurrentState, DeploymentKey, ObjectStore, StateDocument, StateEntry};
use crate::Result;

/// Name of the state object under the configured prefix.
pub const STATE_OBJECT: &str = "state.json";

struct Shared {
    object_store: Arc<dyn ObjectStore>,
    data: RwLock<BTreeMap<DeploymentKey, CurrentState>>,
    saved_copy: Mutex<BTreeMap<DeploymentKey, CurrentState>>,
    stop: AtomicBool,
}

impl Shared {
    /// Upload the state if it changed since the last save. Returns whether a
    /// write happened.
    async fn save(&self) -> Result<bool> {
        let snapshot = self.data.read().clone();
        if *self.saved_copy.lock() == snapshot {
            return Ok(false);
        }
        debug!("Saving the deployment state");
        let document = StateDocument {
            deployments: snapshot
                .iter()
                .map(|(key, state)| StateEntry {
                    deployment: key.clone(),
                    current_state: state.clone(),
                })
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&document)?;
        self.object_store.put(STATE_OBJECT, bytes).await?;
        *self.saved_copy.lock() = snapshot;
        Ok(true)
    }
}

/// Mapping of `DeploymentKey` to `CurrentState`, backed by a remote object.
///
/// Mutations are in-memory; `save` uploads only when the content differs from
/// the last saved snapshot. With a non-zero autosave period, a background task
/// saves on a timer until `stop` is called. Save failures are logged and the
/// timer keeps running.
#[derive(Clone)]
pub struct CurrentStateStore {
    shared: Arc<Shared>,
}

impl CurrentStateStore {
    /// Deserialize the state from the object store. A missing object yields an
    /// empty store.
    pub async fn load(
        object_store: Arc<dyn ObjectStore>,
        autosave_period_secs: u64,
    ) -> Result<Self> {
        let mut data = BTreeMap::new();
        if let Some(bytes) = object_store.get(STATE_OBJECT).await? {
            let document: StateDocument = serde_json::from_slice(&bytes)?;
            for entry in document.deployments {
                data.insert(entry.deployment, entry.current_state);
            }
        }
        let store = Self {
            shared: Arc::new(Shared {
                object_store,
                saved_copy: Mutex::new(data.clone()),
                data: RwLock::new(data),
                stop: AtomicBool::new(false),
            }),
        };
        if autosave_period_secs > 0 {
            let shared = Arc::clone(&store.shared);
            tokio::spawn(async move {
                let period = Duration::from_secs(autosave_period_secs);
                loop {
                    tokio::time::sleep(period).await;
                    if shared.stop.load(Ordering::Relaxed) {
                        return;
                    }
                    if let Err(err) = shared.save().await {
                        warn!("Failed to save the deployment state: {err}");
                    }
                }
            });
        }
        Ok(store)
    }

    pub fn get(&self, key: &DeploymentKey) -> Option<CurrentState> {
        self.shared.data.read().get(key).cloned()
    }

    pub fn contains(&self, key: &DeploymentKey) -> bool {
        self.shared.data.read().contains_key(key)
    }

    pub fn insert(&self, key: DeploymentKey, state: CurrentState) {
        self.shared.data.write().insert(key, state);
    }

    pub fn remove(&self, key: &DeploymentKey) -> Option<CurrentState> {
        self.shared.data.write().remove(key)
    }

    /// Apply a closure to the record for `key`, if present.
    pub fn update<F>(&self, key: &DeploymentKey, mutate: F) -> bool
    where
        F: FnOnce(&mut CurrentState),
    {
        let mut data = self.shared.data.write();
        match data.get_mut(key) {
            Some(state) => {
                mutate(state);
                true
            }
            None => false,
        }
    }

    pub fn keys(&self) -> Vec<DeploymentKey> {
        self.shared.data.read().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> BTreeMap<DeploymentKey, CurrentState> {
        self.shared.data.read().clone()
    }

    pub fn len(&self) -> usize {
        self.shared.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.data.read().is_empty()
    }

    /// Force a save. Returns whether the state was actually written.
    pub async fn save(&self) -> Result<bool> {
        self.shared.save().await
    }

    /// Stop the autosave task, if any.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TargetState;
    use crate::infrastructure::LocalObjectStore;
    use serde_json::json;

    fn sample_state(hash: &str) -> CurrentState {
        let target = TargetState {
            variables: [("Name".to_string(), json!("demo"))].into(),
            variables_from_outputs: BTreeMap::new(),
            dependencies: vec![],
            module_hash: hash.to_string(),
        };
        CurrentState::from_target(
            &target,
            [("Arn".to_string(), json!("arn:demo"))].into(),
            "2024-01-01 00:00:00".to_string(),
        )
    }

    #[tokio::test]
    async fn test_load_missing_object_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let object_store = Arc::new(LocalObjectStore::new(dir.path()));
        let store = CurrentStateStore::load(object_store, 0).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let object_store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(dir.path()));

        let store = CurrentStateStore::load(Arc::clone(&object_store), 0)
            .await
            .unwrap();
        let key = DeploymentKey::new("vpc", "a1", "r1");
        store.insert(key.clone(), sample_state("h1"));
        assert!(store.save().await.unwrap());

        let reloaded = CurrentStateStore::load(object_store, 0).await.unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get(&key), store.get(&key));
    }

    #[tokio::test]
    async fn test_save_skips_when_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let object_store = Arc::new(LocalObjectStore::new(dir.path()));
        let store = CurrentStateStore::load(object_store, 0).await.unwrap();

        let key = DeploymentKey::new("vpc", "a1", "r1");
        store.insert(key.clone(), sample_state("h1"));
        assert!(store.save().await.unwrap());
        // No mutation since the last save.
        assert!(!store.save().await.unwrap());

        store.remove(&key);
        assert!(store.save().await.unwrap());
    }

    #[tokio::test]
    async fn test_update_mutates_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let object_store = Arc::new(LocalObjectStore::new(dir.path()));
        let store = CurrentStateStore::load(object_store, 0).await.unwrap();

        let key = DeploymentKey::new("vpc", "a1", "r1");
        store.insert(key.clone(), sample_state("h1"));
        assert!(store.update(&key, |state| state.module_hash = "h2".to_string()));
        assert_eq!(store.get(&key).unwrap().module_hash, "h2");

        let missing = DeploymentKey::new("vpc", "a2", "r1");
        assert!(!store.update(&missing, |_| {}));
    }

    #[tokio::test]
    async fn test_autosave_task_persists_changes() {
        let dir = tempfile::tempdir().unwrap();
        let object_store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(dir.path()));
        let store = CurrentStateStore::load(Arc::clone(&object_store), 1)
            .await
            .unwrap();

        let key = DeploymentKey::new("vpc", "a1", "r1");
        store.insert(key.clone(), sample_state("h1"));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        store.stop();

        let reloaded = CurrentStateStore::load(object_store, 0).await.unwrap();
        assert!(reloaded.contains(&key));
    }
}
