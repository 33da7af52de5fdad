//! Agent configuration, loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! usable config pointed at a local broker.
//!
//! ```toml
//! [broker]
//! url = "http://broker-0:8161/console/jolokia"
//! broker_name = "broker-0"
//!
//! [reconciler]
//! poll_interval_ms = 5000
//! container_group = "sharded-topic"
//!
//! [store]
//! address_space = "myspace"
//! seed_file = "addresses.json"
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::{JolokiaBroker, JolokiaBrokerBuilder};
use crate::error::{BrokerError, ConfigError};
use crate::model::AddressResource;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub url: String,
    pub broker_name: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8161/console/jolokia".into(),
            broker_name: "localhost".into(),
            username: None,
            password: None,
            connect_timeout_ms: 3_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl BrokerConfig {
    pub fn builder(&self) -> JolokiaBrokerBuilder {
        let mut b = JolokiaBroker::builder(self.url.clone())
            .broker_name(self.broker_name.clone())
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .request_timeout(Duration::from_millis(self.request_timeout_ms));
        if let Some(user) = &self.username {
            b = b.credentials(user.clone(), self.password.clone().unwrap_or_default());
        }
        b
    }

    pub fn connect(&self) -> Result<JolokiaBroker, BrokerError> {
        self.builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub poll_interval_ms: u64,
    /// Route-container group of the broker. `sharded-topic` brokers only
    /// manage subscriptions; all others manage queues and topics.
    pub container_group: Option<String>,
    pub reconcile_connectors: bool,
    /// Remove broker address-settings before deleting a stale address.
    pub remove_settings_on_delete: bool,
    /// Log every Nth call dropped because a cycle was already running.
    pub busy_log_every: u64,
    /// Minimum window between stats-retrieval count log lines.
    pub stats_log_window_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            container_group: None,
            reconcile_connectors: true,
            remove_settings_on_delete: false,
            busy_log_every: 10,
            stats_log_window_secs: 60,
        }
    }
}

impl ReconcilerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stats_log_window(&self) -> Duration {
        Duration::from_secs(self.stats_log_window_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub address_space: String,
    pub address_space_plan: Option<String>,
    /// JSON array of address resources loaded into the in-memory store.
    pub seed_file: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            address_space: "default".into(),
            address_space_plan: None,
            seed_file: None,
        }
    }
}

// ---------------------------------------------------------------------------
// AgentConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub broker: BrokerConfig,
    pub reconciler: ReconcilerConfig,
    pub store: StoreConfig,
}

impl AgentConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&contents, &path.display().to_string())
    }

    /// Parse and validate. `origin` only labels errors.
    pub fn from_toml(contents: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            detail: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconciler.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconciler.poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.reconciler.busy_log_every == 0 {
            return Err(ConfigError::Invalid(
                "reconciler.busy_log_every must be greater than zero".into(),
            ));
        }
        if self.store.address_space.trim().is_empty() {
            return Err(ConfigError::Invalid("store.address_space must not be empty".into()));
        }
        Ok(())
    }
}

/// Load a JSON array of address resources.
pub fn load_seed(path: impl AsRef<Path>) -> Result<Vec<AddressResource>, ConfigError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        detail: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
