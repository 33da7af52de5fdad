//! In-process [`ConfigStore`] with version tokens and a `watch` change feed.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;

use super::{AddressPlan, AddressSpacePlan, ConfigStore, StoredObject};
use crate::error::StoreError;
use crate::model::AddressResource;

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<String, StoredObject>,
    next_version: u64,
    space_plans: Vec<AddressSpacePlan>,
    address_plans: Vec<AddressPlan>,
}

impl MemoryState {
    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    fn snapshot(&self) -> Vec<StoredObject> {
        self.objects.values().cloned().collect()
    }
}

pub struct MemoryStore {
    state: Mutex<MemoryState>,
    tx: watch::Sender<Vec<StoredObject>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Vec::new());
        Self {
            state: Mutex::new(MemoryState::default()),
            tx,
        }
    }

    /// Seed from resources. Each is stored under its `metadata.name`, or its
    /// address when unnamed.
    pub fn from_resources(resources: impl IntoIterator<Item = AddressResource>) -> Self {
        let store = Self::new();
        {
            let mut state = store.lock();
            for res in resources {
                let name = res
                    .metadata
                    .name
                    .clone()
                    .unwrap_or_else(|| res.spec.address.clone());
                let data = match serde_json::to_string(&res) {
                    Ok(d) => d,
                    Err(_) => continue,
                };
                let version = state.bump();
                state
                    .objects
                    .insert(name.clone(), StoredObject { name, version, data });
            }
            store.tx.send_replace(state.snapshot());
        }
        store
    }

    pub fn with_plans(self, space_plans: Vec<AddressSpacePlan>, address_plans: Vec<AddressPlan>) -> Self {
        {
            let mut state = self.lock();
            state.space_plans = space_plans;
            state.address_plans = address_plans;
        }
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A panic while holding the lock leaves the map consistent; keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &MemoryState) {
        self.tx.send_replace(state.snapshot());
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    fn watch(&self) -> watch::Receiver<Vec<StoredObject>> {
        self.tx.subscribe()
    }

    async fn list(&self) -> Result<Vec<StoredObject>, StoreError> {
        Ok(self.lock().snapshot())
    }

    async fn get(&self, name: &str) -> Result<Option<StoredObject>, StoreError> {
        Ok(self.lock().objects.get(name).cloned())
    }

    async fn create(&self, name: &str, data: String) -> Result<StoredObject, StoreError> {
        let mut state = self.lock();
        if state.objects.contains_key(name) {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }
        let obj = StoredObject {
            name: name.to_string(),
            version: state.bump(),
            data,
        };
        state.objects.insert(name.to_string(), obj.clone());
        self.publish(&state);
        Ok(obj)
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.objects.remove(name).is_none() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        self.publish(&state);
        Ok(())
    }

    async fn replace(
        &self,
        name: &str,
        expected_version: u64,
        data: String,
    ) -> Result<StoredObject, StoreError> {
        let mut state = self.lock();
        let found = match state.objects.get(name) {
            Some(obj) => obj.version,
            None => return Err(StoreError::NotFound(name.to_string())),
        };
        if found != expected_version {
            return Err(StoreError::Conflict {
                name: name.to_string(),
                expected: expected_version,
                found,
            });
        }
        let obj = StoredObject {
            name: name.to_string(),
            version: state.bump(),
            data,
        };
        state.objects.insert(name.to_string(), obj.clone());
        self.publish(&state);
        Ok(obj)
    }

    async fn address_space_plans(&self) -> Result<Vec<AddressSpacePlan>, StoreError> {
        Ok(self.lock().space_plans.clone())
    }

    async fn address_plans(&self) -> Result<Vec<AddressPlan>, StoreError> {
        Ok(self.lock().address_plans.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AddressDefinition;

    #[tokio::test]
    async fn test_replace_with_stale_version_conflicts() {
        let store = MemoryStore::new();
        let v1 = store.create("a", "1".into()).await.unwrap();
        store.replace("a", v1.version, "2".into()).await.unwrap();

        let err = store.replace("a", v1.version, "3".into()).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected, .. } if expected == v1.version));
        assert_eq!(store.get("a").await.unwrap().unwrap().data, "2");
    }

    #[tokio::test]
    async fn test_versions_increase_across_objects() {
        let store = MemoryStore::new();
        let a = store.create("a", "x".into()).await.unwrap();
        let b = store.create("b", "x".into()).await.unwrap();
        assert!(b.version > a.version);
    }

    #[tokio::test]
    async fn test_watch_sees_full_list_after_each_change() {
        let store = MemoryStore::new();
        let mut rx = store.watch();
        store.create("a", "x".into()).await.unwrap();
        store.create("b", "y".into()).await.unwrap();
        rx.changed().await.unwrap();
        let names: Vec<String> = rx.borrow_and_update().iter().map(|o| o.name.clone()).collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);

        store.delete("a").await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let store = MemoryStore::new();
        assert_eq!(store.delete("x").await.unwrap_err(), StoreError::NotFound("x".into()));
    }

    #[tokio::test]
    async fn test_from_resources_names_by_metadata_or_address() {
        let named = AddressResource::for_definition(&AddressDefinition::queue("q1"), "space");
        let mut unnamed = AddressResource::for_definition(&AddressDefinition::topic("t1"), "space");
        unnamed.metadata.name = None;

        let store = MemoryStore::from_resources(vec![named, unnamed]);
        let names: Vec<String> = store.list().await.unwrap().into_iter().map(|o| o.name).collect();
        assert_eq!(names, vec!["space.q1".to_string(), "t1".to_string()]);
        assert_eq!(store.watch().borrow().len(), 2);
    }
}
