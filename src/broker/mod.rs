//! # Broker management
//!
//! The narrow interface the reconciler drives the broker through, and the raw
//! shapes the broker reports. A concrete HTTP implementation lives in
//! [`jolokia`].

pub mod jolokia;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::BrokerError;
use crate::model::{AddressSettings, AddressType};

pub use jolokia::{JolokiaBroker, JolokiaBrokerBuilder, JolokiaConfig};

// ---------------------------------------------------------------------------
// Raw address listing
// ---------------------------------------------------------------------------

/// One entry of the broker's live address list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    /// `None` when the broker reported an entry without a name.
    pub name: Option<String>,
    pub address_type: AddressType,
    /// Auto-created, non-durable queue owned by a single client.
    pub temporary: bool,
    pub durable: bool,
    pub purge_on_no_consumers: bool,
}

impl BrokerAddress {
    pub fn new(name: impl Into<String>, address_type: AddressType) -> Self {
        Self {
            name: Some(name.into()),
            address_type,
            temporary: false,
            durable: true,
            purge_on_no_consumers: false,
        }
    }

    pub fn temporary(mut self) -> Self {
        self.temporary = true;
        self.durable = false;
        self
    }
}

// ---------------------------------------------------------------------------
// Raw telemetry
// ---------------------------------------------------------------------------

/// Counters for one broker queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawQueueStats {
    pub name: String,
    /// Address the queue is bound to.
    pub address: String,
    /// Messages currently held.
    pub messages: u64,
    /// Messages ever added.
    pub enqueued: u64,
    pub acknowledged: u64,
    pub expired: u64,
    pub killed: u64,
    /// Messages handed to consumers and not yet settled.
    pub delivered: u64,
    pub consumers: u64,
}

/// A multicast address and the subscription queues bound to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTopicStats {
    pub name: String,
    pub subscription_count: u64,
    pub subscriptions: Vec<RawQueueStats>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawAddressData {
    Queue(RawQueueStats),
    Topic(RawTopicStats),
}

/// Address-level statistics as returned by [`BrokerManagement::get_all_address_data`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressDataIndex {
    /// Address name to its statistics.
    pub index: BTreeMap<String, RawAddressData>,
    /// Queue name to the address that owns it.
    pub reverse_index: BTreeMap<String, String>,
}

impl AddressDataIndex {
    pub fn insert_queue(&mut self, queue: RawQueueStats) {
        self.reverse_index
            .insert(queue.name.clone(), queue.address.clone());
        self.index
            .insert(queue.address.clone(), RawAddressData::Queue(queue));
    }

    pub fn insert_topic(&mut self, topic: RawTopicStats) {
        for sub in &topic.subscriptions {
            self.reverse_index.insert(sub.name.clone(), topic.name.clone());
        }
        self.index
            .insert(topic.name.clone(), RawAddressData::Topic(topic));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawSession {
    pub principal: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawConnection {
    pub connection_id: String,
    pub client_address: String,
    pub sessions: Vec<RawSession>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawProducer {
    pub connection_id: String,
    pub destination: String,
    pub msg_sent: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawConsumer {
    pub consumer_id: String,
    pub connection_id: String,
    pub queue_name: String,
}

// ---------------------------------------------------------------------------
// BrokerManagement
// ---------------------------------------------------------------------------

/// Management operations on one broker.
///
/// Implementations own their transport and timeouts; every failure comes back
/// as a [`BrokerError`].
#[async_trait]
pub trait BrokerManagement: Send + Sync {
    /// Live addresses keyed by broker name.
    async fn list_addresses(&self) -> Result<BTreeMap<String, BrokerAddress>, BrokerError>;
    async fn get_all_address_data(&self) -> Result<AddressDataIndex, BrokerError>;
    async fn list_connections_with_sessions(&self) -> Result<Vec<RawConnection>, BrokerError>;
    async fn list_producers(&self) -> Result<Vec<RawProducer>, BrokerError>;
    async fn list_consumers(&self) -> Result<Vec<RawConsumer>, BrokerError>;

    async fn create_queue(&self, name: &str) -> Result<(), BrokerError>;
    async fn destroy_queue(&self, name: &str) -> Result<(), BrokerError>;
    async fn create_address(&self, name: &str, multicast: bool) -> Result<(), BrokerError>;
    async fn delete_address(&self, name: &str) -> Result<(), BrokerError>;
    async fn delete_address_and_bindings(&self, name: &str) -> Result<(), BrokerError>;
    async fn create_subscription(&self, name: &str, topic: &str) -> Result<(), BrokerError>;
    async fn add_address_settings(
        &self,
        name: &str,
        settings: &AddressSettings,
    ) -> Result<(), BrokerError>;
    async fn remove_address_settings(&self, name: &str) -> Result<(), BrokerError>;

    async fn get_connector_services(&self) -> Result<Vec<String>, BrokerError>;
    async fn create_connector_service(&self, name: &str) -> Result<(), BrokerError>;
    async fn destroy_connector_service(&self, name: &str) -> Result<(), BrokerError>;

    /// Release the management session. The default does nothing.
    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_maps_subscription_queues_to_their_topic() {
        let mut idx = AddressDataIndex::default();
        idx.insert_topic(RawTopicStats {
            name: "prices".into(),
            subscription_count: 2,
            subscriptions: vec![
                RawQueueStats { name: "sub-a".into(), address: "prices".into(), ..Default::default() },
                RawQueueStats { name: "sub-b".into(), address: "prices".into(), ..Default::default() },
            ],
        });
        idx.insert_queue(RawQueueStats { name: "orders".into(), address: "orders".into(), ..Default::default() });

        assert_eq!(idx.reverse_index.get("sub-a").map(String::as_str), Some("prices"));
        assert_eq!(idx.reverse_index.get("orders").map(String::as_str), Some("orders"));
        assert_eq!(idx.index.len(), 2);
    }

    #[test]
    fn test_temporary_queue_is_not_durable() {
        let a = BrokerAddress::new("tmp-1", AddressType::Queue).temporary();
        assert!(a.temporary);
        assert!(!a.durable);
    }
}
