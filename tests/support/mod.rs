//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use broker_reconciler::broker::{
    AddressDataIndex, BrokerAddress, BrokerManagement, RawConnection, RawConsumer, RawProducer,
    RawQueueStats, RawTopicStats,
};
use broker_reconciler::model::{AddressResource, AddressSettings, AddressType};
use broker_reconciler::store::{AddressPlan, AddressSpacePlan, ConfigStore, StoredObject};
use broker_reconciler::{AddressDefinition, BrokerError, MemoryStore, StoreError};

// ---------------------------------------------------------------------------
// FakeBroker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeState {
    addresses: BTreeMap<String, BrokerAddress>,
    subscription_topics: BTreeMap<String, String>,
    depths: BTreeMap<String, u64>,
    connectors: Vec<String>,
    connections: Vec<RawConnection>,
    producers: Vec<RawProducer>,
    consumers: Vec<RawConsumer>,
    failing: HashSet<String>,
    calls: Vec<String>,
    list_calls: usize,
    list_delay: Option<Duration>,
    closed: bool,
}

/// An in-memory broker that applies every management call to its own address
/// table and records mutating calls as `"operation:name"`.
#[derive(Default)]
pub struct FakeBroker {
    state: Mutex<FakeState>,
}

impl FakeBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn with_queue(self: Arc<Self>, name: &str) -> Arc<Self> {
        self.lock()
            .addresses
            .insert(name.into(), BrokerAddress::new(name, AddressType::Queue));
        self
    }

    pub fn with_topic(self: Arc<Self>, name: &str) -> Arc<Self> {
        self.lock()
            .addresses
            .insert(name.into(), BrokerAddress::new(name, AddressType::Topic));
        self
    }

    pub fn with_address(self: Arc<Self>, key: &str, address: BrokerAddress) -> Arc<Self> {
        self.lock().addresses.insert(key.into(), address);
        self
    }

    pub fn with_connectors(self: Arc<Self>, names: &[&str]) -> Arc<Self> {
        self.lock().connectors = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Make `op` fail. `key` is either `"operation"` or `"operation:name"`.
    pub fn fail(&self, key: &str) {
        self.lock().failing.insert(key.into());
    }

    pub fn recover(&self, key: &str) {
        self.lock().failing.remove(key);
    }

    pub fn set_list_delay(&self, delay: Duration) {
        self.lock().list_delay = Some(delay);
    }

    pub fn set_depth(&self, queue: &str, depth: u64) {
        self.lock().depths.insert(queue.into(), depth);
    }

    pub fn set_links(
        &self,
        connections: Vec<RawConnection>,
        producers: Vec<RawProducer>,
        consumers: Vec<RawConsumer>,
    ) {
        let mut s = self.lock();
        s.connections = connections;
        s.producers = producers;
        s.consumers = consumers;
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    pub fn address_names(&self) -> Vec<String> {
        self.lock().addresses.keys().cloned().collect()
    }

    pub fn connectors(&self) -> Vec<String> {
        self.lock().connectors.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Record a mutating call, failing it if it was marked to fail.
    fn call(&self, op: &str, name: &str) -> Result<(), BrokerError> {
        let mut s = self.lock();
        let key = format!("{op}:{name}");
        s.calls.push(key.clone());
        if s.failing.contains(op) || s.failing.contains(&key) {
            return Err(BrokerError::command(op, format!("injected failure for {name}")));
        }
        Ok(())
    }

    fn read(&self, op: &str) -> Result<(), BrokerError> {
        if self.lock().failing.contains(op) {
            return Err(BrokerError::command(op, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerManagement for FakeBroker {
    async fn list_addresses(&self) -> Result<BTreeMap<String, BrokerAddress>, BrokerError> {
        let delay = {
            let mut s = self.lock();
            s.list_calls += 1;
            s.list_delay
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        self.read("list_addresses")?;
        Ok(self.lock().addresses.clone())
    }

    async fn get_all_address_data(&self) -> Result<AddressDataIndex, BrokerError> {
        self.read("get_all_address_data")?;
        let s = self.lock();
        let queue = |name: &str, address: &str| RawQueueStats {
            name: name.into(),
            address: address.into(),
            messages: s.depths.get(name).copied().unwrap_or(0),
            ..Default::default()
        };
        let mut index = AddressDataIndex::default();
        for (name, a) in &s.addresses {
            match a.address_type {
                AddressType::Queue => index.insert_queue(queue(name, name)),
                AddressType::Topic => {
                    let subscriptions: Vec<RawQueueStats> = s
                        .subscription_topics
                        .iter()
                        .filter(|(_, topic)| *topic == name)
                        .map(|(sub, topic)| queue(sub, topic))
                        .collect();
                    index.insert_topic(RawTopicStats {
                        name: name.clone(),
                        subscription_count: subscriptions.len() as u64,
                        subscriptions,
                    });
                }
                AddressType::Subscription => {}
            }
        }
        Ok(index)
    }

    async fn list_connections_with_sessions(&self) -> Result<Vec<RawConnection>, BrokerError> {
        self.read("list_connections")?;
        Ok(self.lock().connections.clone())
    }

    async fn list_producers(&self) -> Result<Vec<RawProducer>, BrokerError> {
        self.read("list_producers")?;
        Ok(self.lock().producers.clone())
    }

    async fn list_consumers(&self) -> Result<Vec<RawConsumer>, BrokerError> {
        self.read("list_consumers")?;
        Ok(self.lock().consumers.clone())
    }

    async fn create_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.call("create_queue", name)?;
        self.lock()
            .addresses
            .insert(name.into(), BrokerAddress::new(name, AddressType::Queue));
        Ok(())
    }

    async fn destroy_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.call("destroy_queue", name)?;
        let mut s = self.lock();
        match s.addresses.get(name).map(|a| a.address_type) {
            Some(AddressType::Queue | AddressType::Subscription) => {
                s.addresses.remove(name);
                s.subscription_topics.remove(name);
                Ok(())
            }
            _ => Err(BrokerError::command("destroy_queue", format!("no queue {name}"))),
        }
    }

    async fn create_address(&self, name: &str, multicast: bool) -> Result<(), BrokerError> {
        self.call("create_address", name)?;
        let t = if multicast { AddressType::Topic } else { AddressType::Queue };
        self.lock().addresses.insert(name.into(), BrokerAddress::new(name, t));
        Ok(())
    }

    async fn delete_address(&self, name: &str) -> Result<(), BrokerError> {
        self.call("delete_address", name)?;
        match self.lock().addresses.remove(name) {
            Some(_) => Ok(()),
            None => Err(BrokerError::command("delete_address", format!("no address {name}"))),
        }
    }

    async fn delete_address_and_bindings(&self, name: &str) -> Result<(), BrokerError> {
        self.call("delete_address_and_bindings", name)?;
        let mut s = self.lock();
        s.addresses.remove(name);
        let bound: Vec<String> = s
            .subscription_topics
            .iter()
            .filter(|(_, topic)| *topic == name)
            .map(|(sub, _)| sub.clone())
            .collect();
        for sub in bound {
            s.addresses.remove(&sub);
            s.subscription_topics.remove(&sub);
        }
        Ok(())
    }

    async fn create_subscription(&self, name: &str, topic: &str) -> Result<(), BrokerError> {
        self.call("create_subscription", name)?;
        let mut s = self.lock();
        if s.addresses.get(topic).map(|a| a.address_type) != Some(AddressType::Topic) {
            return Err(BrokerError::command(
                "create_subscription",
                format!("topic {topic} does not exist"),
            ));
        }
        s.addresses
            .insert(name.into(), BrokerAddress::new(name, AddressType::Subscription));
        s.subscription_topics.insert(name.into(), topic.into());
        Ok(())
    }

    async fn add_address_settings(
        &self,
        name: &str,
        _settings: &AddressSettings,
    ) -> Result<(), BrokerError> {
        self.call("add_address_settings", name)
    }

    async fn remove_address_settings(&self, name: &str) -> Result<(), BrokerError> {
        self.call("remove_address_settings", name)
    }

    async fn get_connector_services(&self) -> Result<Vec<String>, BrokerError> {
        self.read("get_connector_services")?;
        Ok(self.lock().connectors.clone())
    }

    async fn create_connector_service(&self, name: &str) -> Result<(), BrokerError> {
        self.call("create_connector", name)?;
        self.lock().connectors.push(name.into());
        Ok(())
    }

    async fn destroy_connector_service(&self, name: &str) -> Result<(), BrokerError> {
        self.call("destroy_connector", name)?;
        self.lock().connectors.retain(|c| c != name);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.lock().closed = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ConflictingStore
// ---------------------------------------------------------------------------

/// A [`MemoryStore`] whose conditional writes can be made to conflict and
/// whose listing can be made to fail.
pub struct ConflictingStore {
    inner: MemoryStore,
    conflicts: Mutex<HashSet<String>>,
    replaces: Mutex<Vec<String>>,
    unavailable: AtomicBool,
}

impl ConflictingStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            conflicts: Mutex::new(HashSet::new()),
            replaces: Mutex::new(Vec::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    pub fn conflict_on(&self, name: &str) {
        self.conflicts.lock().unwrap().insert(name.into());
    }

    pub fn clear_conflicts(&self) {
        self.conflicts.lock().unwrap().clear();
    }

    /// Names passed to `replace`, conflicting or not.
    pub fn replaces(&self) -> Vec<String> {
        self.replaces.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConfigStore for ConflictingStore {
    fn watch(&self) -> watch::Receiver<Vec<StoredObject>> {
        self.inner.watch()
    }

    async fn list(&self) -> Result<Vec<StoredObject>, StoreError> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("injected outage".into()));
        }
        self.inner.list().await
    }

    async fn get(&self, name: &str) -> Result<Option<StoredObject>, StoreError> {
        self.inner.get(name).await
    }

    async fn create(&self, name: &str, data: String) -> Result<StoredObject, StoreError> {
        self.inner.create(name, data).await
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.inner.delete(name).await
    }

    async fn replace(
        &self,
        name: &str,
        expected_version: u64,
        data: String,
    ) -> Result<StoredObject, StoreError> {
        self.replaces.lock().unwrap().push(name.into());
        if self.conflicts.lock().unwrap().contains(name) {
            return Err(StoreError::Conflict {
                name: name.into(),
                expected: expected_version,
                found: expected_version + 1,
            });
        }
        self.inner.replace(name, expected_version, data).await
    }

    async fn address_space_plans(&self) -> Result<Vec<AddressSpacePlan>, StoreError> {
        self.inner.address_space_plans().await
    }

    async fn address_plans(&self) -> Result<Vec<AddressPlan>, StoreError> {
        self.inner.address_plans().await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub const SPACE: &str = "myspace";

pub fn seeded_store(definitions: &[AddressDefinition]) -> MemoryStore {
    MemoryStore::from_resources(
        definitions
            .iter()
            .map(|d| AddressResource::for_definition(d, SPACE)),
    )
}

/// Index of the first call equal to `call`.
pub fn position(calls: &[String], call: &str) -> usize {
    calls
        .iter()
        .position(|c| c == call)
        .unwrap_or_else(|| panic!("{call} not in {calls:?}"))
}
