//! HTTP management client for an Artemis broker's Jolokia endpoint.
//!
//! Every [`BrokerManagement`] operation becomes one or more Jolokia `exec` /
//! `read` requests against the broker MBean. Listing operations return JSON
//! encoded as a string inside the Jolokia envelope; those are decoded
//! leniently since counters arrive as numbers or numeric strings depending on
//! the broker version.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use tracing::debug;

use super::{
    AddressDataIndex, BrokerAddress, BrokerManagement, RawConnection, RawConsumer, RawProducer,
    RawQueueStats, RawSession, RawTopicStats,
};
use crate::error::BrokerError;
use crate::model::{AddressSettings, AddressType};

/// Page size used for every paged listing.
const PAGE_SIZE: u32 = 10_000;
/// Connector factory used for per-address outbound connectors.
const CONNECTOR_FACTORY: &str =
    "org.apache.activemq.artemis.integration.amqp.AMQPConnectorServiceFactory";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Connection settings for a [`JolokiaBroker`].
#[derive(Debug, Clone)]
pub struct JolokiaConfig {
    /// Jolokia endpoint (e.g. `http://127.0.0.1:8161/console/jolokia`).
    pub base_url: String,
    /// Broker name used in the MBean object name.
    pub broker_name: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// TCP connection timeout.
    pub connect_timeout: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl JolokiaConfig {
    /// Create a config with defaults.
    ///
    /// - broker_name: `localhost`
    /// - connect_timeout: 3 s
    /// - request_timeout: 10 s
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            broker_name: "localhost".into(),
            username: None,
            password: None,
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
        }
    }

    fn mbean(&self) -> String {
        format!("org.apache.activemq.artemis:broker=\"{}\"", self.broker_name)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Broker management over Jolokia. Build with [`JolokiaBroker::builder`].
pub struct JolokiaBroker {
    config: JolokiaConfig,
    mbean: String,
    client: reqwest::Client,
}

/// Envelope Jolokia wraps every response in. The HTTP status is 200 even
/// when the operation failed, so `status` has to be checked separately.
#[derive(Debug, Deserialize)]
struct JolokiaResponse {
    #[serde(default)]
    status: u16,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error: Option<String>,
}

impl JolokiaBroker {
    pub fn builder(base_url: impl Into<String>) -> JolokiaBrokerBuilder {
        JolokiaBrokerBuilder::new(base_url)
    }

    pub fn config(&self) -> &JolokiaConfig {
        &self.config
    }

    async fn send(&self, operation: &str, body: Value) -> Result<Value, BrokerError> {
        let url = self.config.base_url.clone();
        let mut req = self.client.post(&url).json(&body);
        if let Some(user) = &self.config.username {
            req = req.basic_auth(user, self.config.password.as_ref());
        }
        let resp = req.send().await.map_err(|e| BrokerError::Transport {
            url: url.clone(),
            detail: e.to_string(),
        })?;

        if !resp.status().is_success() {
            return Err(BrokerError::Http {
                status: resp.status().as_u16(),
                url,
            });
        }

        let envelope: JolokiaResponse = resp.json().await.map_err(|e| BrokerError::Decode {
            what: operation.to_string(),
            detail: e.to_string(),
        })?;
        if envelope.status != 200 {
            return Err(BrokerError::command(
                operation,
                envelope
                    .error
                    .unwrap_or_else(|| format!("status {}", envelope.status)),
            ));
        }
        Ok(envelope.value)
    }

    /// Invoke a broker operation. `operation` is the full Java signature.
    async fn exec(&self, operation: &str, arguments: Value) -> Result<Value, BrokerError> {
        debug!(operation, "jolokia exec");
        let body = json!({
            "type": "exec",
            "mbean": self.mbean,
            "operation": operation,
            "arguments": arguments,
        });
        self.send(operation, body).await
    }

    async fn read(&self, attribute: &str) -> Result<Value, BrokerError> {
        let body = json!({
            "type": "read",
            "mbean": self.mbean,
            "attribute": attribute,
        });
        self.send(attribute, body).await
    }

    /// Run a paged listing operation and decode its `data` array.
    async fn list<T: DeserializeOwned>(&self, operation: &str) -> Result<Vec<T>, BrokerError> {
        let value = self.exec(operation, json!(["", 1, PAGE_SIZE])).await?;
        decode_page(operation, &value)
    }

    async fn list_raw_queues(&self) -> Result<Vec<QueueEntry>, BrokerError> {
        self.list("listQueues(java.lang.String,int,int)").await
    }

    async fn list_sessions(&self, connection_id: &str) -> Result<Vec<RawSession>, BrokerError> {
        let op = "listSessions(java.lang.String)";
        let value = self.exec(op, json!([connection_id])).await?;
        let sessions: Vec<SessionEntry> = decode_embedded(op, &value)?;
        Ok(sessions
            .into_iter()
            .map(|s| RawSession { principal: s.principal })
            .collect())
    }

    async fn create_queue_on(
        &self,
        address: &str,
        routing: &str,
        name: &str,
        purge_on_no_consumers: bool,
    ) -> Result<(), BrokerError> {
        let op = "createQueue(java.lang.String,java.lang.String,java.lang.String,java.lang.String,boolean,int,boolean,boolean)";
        self.exec(
            op,
            json!([address, routing, name, Value::Null, true, -1, purge_on_no_consumers, true]),
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl BrokerManagement for JolokiaBroker {
    async fn list_addresses(&self) -> Result<BTreeMap<String, BrokerAddress>, BrokerError> {
        let (queues, addresses) = tokio::try_join!(
            self.list_raw_queues(),
            self.list::<AddressEntry>("listAddresses(java.lang.String,int,int)")
        )?;
        Ok(classify(&queues, &addresses))
    }

    async fn get_all_address_data(&self) -> Result<AddressDataIndex, BrokerError> {
        let (queues, addresses) = tokio::try_join!(
            self.list_raw_queues(),
            self.list::<AddressEntry>("listAddresses(java.lang.String,int,int)")
        )?;
        Ok(index_address_data(queues, &addresses))
    }

    async fn list_connections_with_sessions(&self) -> Result<Vec<RawConnection>, BrokerError> {
        let entries: Vec<ConnectionEntry> =
            self.list("listConnections(java.lang.String,int,int)").await?;
        let sessions = join_all(entries.iter().map(|c| self.list_sessions(&c.connection_id))).await;
        entries
            .into_iter()
            .zip(sessions)
            .map(|(c, sessions)| {
                sessions.map(|sessions| RawConnection {
                    connection_id: c.connection_id,
                    client_address: c.remote_address,
                    sessions,
                })
            })
            .collect()
    }

    async fn list_producers(&self) -> Result<Vec<RawProducer>, BrokerError> {
        let entries: Vec<ProducerEntry> =
            self.list("listProducers(java.lang.String,int,int)").await?;
        Ok(entries
            .into_iter()
            .map(|p| RawProducer {
                connection_id: p.connection_id,
                destination: p.destination,
                msg_sent: p.msg_sent,
            })
            .collect())
    }

    async fn list_consumers(&self) -> Result<Vec<RawConsumer>, BrokerError> {
        let entries: Vec<ConsumerEntry> =
            self.list("listConsumers(java.lang.String,int,int)").await?;
        Ok(entries
            .into_iter()
            .map(|c| RawConsumer {
                consumer_id: c.id,
                connection_id: c.connection_id,
                queue_name: c.queue,
            })
            .collect())
    }

    async fn create_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.create_queue_on(name, "ANYCAST", name, false).await
    }

    async fn destroy_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.exec("destroyQueue(java.lang.String,boolean)", json!([name, true]))
            .await
            .map(|_| ())
    }

    async fn create_address(&self, name: &str, multicast: bool) -> Result<(), BrokerError> {
        let routing = if multicast { "MULTICAST" } else { "ANYCAST" };
        self.exec(
            "createAddress(java.lang.String,java.lang.String)",
            json!([name, routing]),
        )
        .await
        .map(|_| ())
    }

    async fn delete_address(&self, name: &str) -> Result<(), BrokerError> {
        self.exec("deleteAddress(java.lang.String,boolean)", json!([name, false]))
            .await
            .map(|_| ())
    }

    async fn delete_address_and_bindings(&self, name: &str) -> Result<(), BrokerError> {
        // `force` removes every queue bound to the address.
        self.exec("deleteAddress(java.lang.String,boolean)", json!([name, true]))
            .await
            .map(|_| ())
    }

    async fn create_subscription(&self, name: &str, topic: &str) -> Result<(), BrokerError> {
        self.create_queue_on(topic, "MULTICAST", name, false).await
    }

    async fn add_address_settings(
        &self,
        name: &str,
        settings: &AddressSettings,
    ) -> Result<(), BrokerError> {
        let encoded = serde_json::to_string(settings).map_err(|e| BrokerError::Decode {
            what: "address settings".into(),
            detail: e.to_string(),
        })?;
        self.exec(
            "addAddressSettings(java.lang.String,java.lang.String)",
            json!([name, encoded]),
        )
        .await
        .map(|_| ())
    }

    async fn remove_address_settings(&self, name: &str) -> Result<(), BrokerError> {
        self.exec("removeAddressSettings(java.lang.String)", json!([name]))
            .await
            .map(|_| ())
    }

    async fn get_connector_services(&self) -> Result<Vec<String>, BrokerError> {
        let value = self.read("ConnectorServices").await?;
        serde_json::from_value(value).map_err(|e| BrokerError::Decode {
            what: "ConnectorServices".into(),
            detail: e.to_string(),
        })
    }

    async fn create_connector_service(&self, name: &str) -> Result<(), BrokerError> {
        self.exec(
            "createConnectorService(java.lang.String,java.lang.String,java.util.Map)",
            json!([name, CONNECTOR_FACTORY, { "address": name }]),
        )
        .await
        .map(|_| ())
    }

    async fn destroy_connector_service(&self, name: &str) -> Result<(), BrokerError> {
        self.exec("destroyConnectorService(java.lang.String)", json!([name]))
            .await
            .map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`JolokiaBroker`].
///
/// # Example
/// ```rust,ignore
/// let broker = JolokiaBroker::builder("http://127.0.0.1:8161/console/jolokia")
///     .broker_name("broker-0")
///     .credentials("admin", "admin")
///     .build()?;
/// ```
pub struct JolokiaBrokerBuilder {
    config: JolokiaConfig,
}

impl JolokiaBrokerBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            config: JolokiaConfig::new(base_url),
        }
    }

    pub fn broker_name(mut self, name: impl Into<String>) -> Self {
        self.config.broker_name = name.into();
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self.config.password = Some(password.into());
        self
    }

    /// Override the TCP connect timeout (default 3 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Override the per-request timeout (default 10 s).
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// # Errors
    /// [`BrokerError::Transport`] when the base URL is empty or the HTTP client
    /// cannot be constructed.
    pub fn build(self) -> Result<JolokiaBroker, BrokerError> {
        if self.config.base_url.trim().is_empty() {
            return Err(BrokerError::Transport {
                url: String::new(),
                detail: "base url is required".into(),
            });
        }
        let client = reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout)
            .build()
            .map_err(|e| BrokerError::Transport {
                url: self.config.base_url.clone(),
                detail: e.to_string(),
            })?;
        Ok(JolokiaBroker {
            mbean: self.config.mbean(),
            config: self.config,
            client,
        })
    }
}

// ---------------------------------------------------------------------------
// Listing payloads
// ---------------------------------------------------------------------------

/// Accept `7`, `"7"` or null/absent (as 0).
fn lenient_u64<'de, D: Deserializer<'de>>(de: D) -> Result<u64, D::Error> {
    let v = Value::deserialize(de)?;
    Ok(match v {
        Value::Number(n) => n.as_u64().unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

/// Accept `true`, `"true"` or null/absent (as false).
fn lenient_bool<'de, D: Deserializer<'de>>(de: D) -> Result<bool, D::Error> {
    let v = Value::deserialize(de)?;
    Ok(match v {
        Value::Bool(b) => b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    })
}

/// Accept a string or a number, rendering numbers as strings.
fn lenient_string<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    let v = Value::deserialize(de)?;
    Ok(match v {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    address: String,
    #[serde(default, deserialize_with = "lenient_string")]
    routing_type: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    durable: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    temporary: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    purge_on_no_consumers: bool,
    #[serde(default, deserialize_with = "lenient_u64")]
    message_count: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    messages_added: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    messages_acked: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    messages_expired: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    messages_killed: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    delivering_count: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    consumer_count: u64,
}

impl QueueEntry {
    fn is_multicast(&self) -> bool {
        self.routing_type.eq_ignore_ascii_case("MULTICAST")
    }

    fn stats(&self) -> RawQueueStats {
        RawQueueStats {
            name: self.name.clone().unwrap_or_default(),
            address: self.address.clone(),
            messages: self.message_count,
            enqueued: self.messages_added,
            acknowledged: self.messages_acked,
            expired: self.messages_expired,
            killed: self.messages_killed,
            delivered: self.delivering_count,
            consumers: self.consumer_count,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddressEntry {
    #[serde(default)]
    name: Option<String>,
    /// Rendered by the broker as e.g. `"{MULTICAST}"` or `"[ANYCAST, MULTICAST]"`.
    #[serde(default, deserialize_with = "lenient_string")]
    routing_types: String,
}

impl AddressEntry {
    fn is_multicast(&self) -> bool {
        self.routing_types.to_ascii_uppercase().contains("MULTICAST")
    }
}

#[derive(Debug, Deserialize)]
struct ConnectionEntry {
    #[serde(rename = "connectionID", deserialize_with = "lenient_string")]
    connection_id: String,
    #[serde(rename = "remoteAddress", default, deserialize_with = "lenient_string")]
    remote_address: String,
}

#[derive(Debug, Deserialize)]
struct SessionEntry {
    #[serde(default)]
    principal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProducerEntry {
    #[serde(rename = "connectionID", default, deserialize_with = "lenient_string")]
    connection_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    destination: String,
    #[serde(rename = "msgSent", default, deserialize_with = "lenient_u64")]
    msg_sent: u64,
}

#[derive(Debug, Deserialize)]
struct ConsumerEntry {
    #[serde(default, deserialize_with = "lenient_string")]
    id: String,
    #[serde(rename = "connectionID", default, deserialize_with = "lenient_string")]
    connection_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    queue: String,
}

/// Listing results are JSON text inside the Jolokia `value`.
fn decode_embedded<T: DeserializeOwned>(what: &str, value: &Value) -> Result<T, BrokerError> {
    let decoded = match value {
        Value::String(s) => serde_json::from_str(s),
        other => serde_json::from_value(other.clone()),
    };
    decoded.map_err(|e| BrokerError::Decode {
        what: what.to_string(),
        detail: e.to_string(),
    })
}

fn decode_page<T: DeserializeOwned>(what: &str, value: &Value) -> Result<Vec<T>, BrokerError> {
    #[derive(Deserialize)]
    struct Page<T> {
        #[serde(default = "Vec::new")]
        data: Vec<T>,
    }
    let page: Page<T> = decode_embedded(what, value)?;
    Ok(page.data)
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Classify broker queues and addresses:
///
/// | broker shape                                   | type         |
/// |------------------------------------------------|--------------|
/// | anycast queue named after its address          | queue        |
/// | multicast address                              | topic        |
/// | queue on a multicast address, different name   | subscription |
fn classify(queues: &[QueueEntry], addresses: &[AddressEntry]) -> BTreeMap<String, BrokerAddress> {
    let mut out = BTreeMap::new();

    for a in addresses.iter().filter(|a| a.is_multicast()) {
        if let Some(name) = &a.name {
            out.insert(name.clone(), BrokerAddress::new(name.clone(), AddressType::Topic));
        }
    }

    for q in queues {
        let address_type = if q.is_multicast() {
            if q.name.as_deref() == Some(q.address.as_str()) {
                continue;
            }
            AddressType::Subscription
        } else {
            AddressType::Queue
        };
        let key = q.name.clone().unwrap_or_else(|| q.address.clone());
        out.insert(
            key,
            BrokerAddress {
                name: q.name.clone(),
                address_type,
                temporary: q.temporary,
                durable: q.durable,
                purge_on_no_consumers: q.purge_on_no_consumers,
            },
        );
    }
    out
}

fn index_address_data(queues: Vec<QueueEntry>, addresses: &[AddressEntry]) -> AddressDataIndex {
    let mut topics: BTreeMap<String, RawTopicStats> = addresses
        .iter()
        .filter(|a| a.is_multicast())
        .filter_map(|a| a.name.clone())
        .map(|name| {
            let topic = RawTopicStats {
                name: name.clone(),
                ..Default::default()
            };
            (name, topic)
        })
        .collect();

    let mut index = AddressDataIndex::default();
    for q in queues {
        if q.name.is_none() {
            continue;
        }
        if q.is_multicast() {
            let topic = topics.entry(q.address.clone()).or_insert_with(|| RawTopicStats {
                name: q.address.clone(),
                ..Default::default()
            });
            topic.subscription_count += 1;
            topic.subscriptions.push(q.stats());
        } else {
            index.insert_queue(q.stats());
        }
    }
    for topic in topics.into_values() {
        index.insert_topic(topic);
    }
    index
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
