//! Connector-service reconciliation.
//!
//! One outbound connector service per desired address. The broker's own
//! platform connectors are never touched.

use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{error, info};

use crate::broker::BrokerManagement;
use crate::diff::{string_changes, Changes};
use crate::model::DesiredAddressSet;

/// Connector services owned by the platform, not by any address.
pub const RESERVED_CONNECTORS: [&str; 2] = ["amqp-connector", "router-connector"];

pub fn is_reserved_connector(name: &str) -> bool {
    RESERVED_CONNECTORS.contains(&name)
}

/// Sorted address names: the connectors the desired set calls for.
pub fn desired_connectors(desired: &DesiredAddressSet) -> Vec<String> {
    // BTreeMap keys are already ordered.
    desired.keys().cloned().collect()
}

pub struct ConnectorReconciler {
    id: String,
    broker: Arc<dyn BrokerManagement>,
}

impl ConnectorReconciler {
    pub fn new(id: impl Into<String>, broker: Arc<dyn BrokerManagement>) -> Self {
        Self {
            id: id.into(),
            broker,
        }
    }

    /// Bring the broker's connector services in line with `desired`.
    ///
    /// Removed connectors are destroyed before any missing one is created.
    /// Returns the difference that was acted on, or `None` when nothing was
    /// out of line or the listing failed.
    pub async fn ensure(&self, desired: &[String]) -> Option<Changes<String>> {
        let listed = match self.broker.get_connector_services().await {
            Ok(l) => l,
            Err(e) => {
                error!(broker = %self.id, error = %e, "failed to retrieve connectors");
                return None;
            }
        };
        let actual: Vec<String> = listed
            .into_iter()
            .filter(|name| !is_reserved_connector(name))
            .collect();

        let Some(diff) = string_changes(&actual, desired) else {
            info!(broker = %self.id, "all connectors exist");
            return None;
        };
        info!(
            broker = %self.id,
            missing = diff.added.len(),
            removed = diff.removed.len(),
            changes = %diff.description,
            "reconciling connectors"
        );

        join_all(diff.removed.iter().map(|name| self.destroy(name))).await;
        join_all(diff.added.iter().map(|name| self.create(name))).await;
        Some(diff)
    }

    async fn destroy(&self, name: &str) {
        info!(broker = %self.id, connector = name, "deleting connector");
        match self.broker.destroy_connector_service(name).await {
            Ok(()) => info!(broker = %self.id, connector = name, "deleted connector"),
            Err(e) => error!(broker = %self.id, connector = name, error = %e, "failed to delete connector"),
        }
    }

    async fn create(&self, name: &str) {
        info!(broker = %self.id, connector = name, "creating connector");
        match self.broker.create_connector_service(name).await {
            Ok(()) => info!(broker = %self.id, connector = name, "created connector"),
            Err(e) => error!(broker = %self.id, connector = name, error = %e, "failed to create connector"),
        }
    }
}
