//! Address reconciliation for a message broker.
//!
//! An [`AddressReconciler`] converges one broker's queues, topics, subscriptions
//! and connector services on a desired address set, then publishes normalised
//! telemetry. A [`ReadinessTracker`] follows the desired set in the
//! configuration store and writes each address's readiness back once the
//! telemetry shows it fully propagated. [`Agent`] wires the two together.

pub mod agent;
pub mod broker;
pub mod cli;
pub mod config;
pub mod diff;
pub mod error;
pub mod events;
pub mod model;
pub mod plans;
pub mod readiness;
pub mod reconciler;
pub mod stats;
pub mod store;

pub use agent::Agent;
pub use broker::{BrokerManagement, JolokiaBroker};
pub use config::AgentConfig;
pub use error::{BrokerError, ConfigError, StoreError};
pub use events::{EventBus, EventKind, ReconcilerEvent};
pub use model::{AddressDefinition, AddressType};
pub use readiness::ReadinessTracker;
pub use reconciler::{AddressReconciler, CycleOutcome};
pub use store::{ConfigStore, MemoryStore};
