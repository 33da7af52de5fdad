//! # Event bus
//!
//! ## Responsibility
//! Carries lifecycle and per-address outcome events from the reconciler and
//! the agent to whoever registered interest. Subscribers pick the
//! [`EventKind`]s they want and only ever see those.
//!
//! ## Guarantees
//! - Non-blocking: [`EventBus::publish`] never waits on a subscriber
//! - Bounded: a subscriber more than [`EVENT_CHANNEL_CAP`] events behind
//!   skips ahead and the gap is logged
//! - Publishing with no subscribers is not an error

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::warn;

use crate::model::AddressDefinition;
use crate::stats::{AddressStats, ConnectionStats};

/// Broadcast channel capacity (number of events in flight).
pub const EVENT_CHANNEL_CAP: usize = 256;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcilerEvent {
    /// The agent is connected and has started its first cycle.
    Ready,
    /// Desired and actual addresses became equivalent. Edge-triggered.
    Synchronized,
    AddressCreated(AddressDefinition),
    AddressCreateFailed {
        address: AddressDefinition,
        error: String,
    },
    AddressDeleted {
        address: String,
    },
    AddressDeleteFailed {
        address: String,
        error: String,
    },
    AddressStatsRetrieved(Arc<BTreeMap<String, AddressStats>>),
    ConnectionStatsRetrieved(Arc<BTreeMap<String, ConnectionStats>>),
    /// Full set of desired definitions after a change.
    AddressesDefined(Arc<Vec<AddressDefinition>>),
    /// Definitions whose phase is neither `Pending` nor `Terminating`.
    AddressesReady(Arc<Vec<AddressDefinition>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ready,
    Synchronized,
    AddressCreated,
    AddressCreateFailed,
    AddressDeleted,
    AddressDeleteFailed,
    AddressStatsRetrieved,
    ConnectionStatsRetrieved,
    AddressesDefined,
    AddressesReady,
}

impl ReconcilerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ReconcilerEvent::Ready => EventKind::Ready,
            ReconcilerEvent::Synchronized => EventKind::Synchronized,
            ReconcilerEvent::AddressCreated(_) => EventKind::AddressCreated,
            ReconcilerEvent::AddressCreateFailed { .. } => EventKind::AddressCreateFailed,
            ReconcilerEvent::AddressDeleted { .. } => EventKind::AddressDeleted,
            ReconcilerEvent::AddressDeleteFailed { .. } => EventKind::AddressDeleteFailed,
            ReconcilerEvent::AddressStatsRetrieved(_) => EventKind::AddressStatsRetrieved,
            ReconcilerEvent::ConnectionStatsRetrieved(_) => EventKind::ConnectionStatsRetrieved,
            ReconcilerEvent::AddressesDefined(_) => EventKind::AddressesDefined,
            ReconcilerEvent::AddressesReady(_) => EventKind::AddressesReady,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Ready => "ready",
            EventKind::Synchronized => "synchronized",
            EventKind::AddressCreated => "address_create",
            EventKind::AddressCreateFailed => "address_failed_create",
            EventKind::AddressDeleted => "address_delete",
            EventKind::AddressDeleteFailed => "address_failed_delete",
            EventKind::AddressStatsRetrieved => "address_stats_retrieved",
            EventKind::ConnectionStatsRetrieved => "connection_stats_retrieved",
            EventKind::AddressesDefined => "addresses_defined",
            EventKind::AddressesReady => "addresses_ready",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Fan-out of [`ReconcilerEvent`]s. Clone freely; clones share one channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ReconcilerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAP);
        Self { tx }
    }

    pub fn publish(&self, event: ReconcilerEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    /// Receive every event kind.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            kinds: None,
        }
    }

    /// Receive only the listed kinds.
    pub fn subscribe_to(&self, kinds: &[EventKind]) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            kinds: Some(kinds.iter().copied().collect()),
        }
    }
}

/// A filtered view of the bus.
pub struct EventSubscription {
    rx: broadcast::Receiver<ReconcilerEvent>,
    kinds: Option<HashSet<EventKind>>,
}

impl EventSubscription {
    fn wants(&self, event: &ReconcilerEvent) -> bool {
        self.kinds
            .as_ref()
            .map_or(true, |k| k.contains(&event.kind()))
    }

    /// Next matching event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<ReconcilerEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged, skipping ahead");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event if one is already queued.
    pub fn try_recv(&mut self) -> Option<ReconcilerEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged, skipping ahead");
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain every matching event queued right now.
    pub fn drain(&mut self) -> Vec<ReconcilerEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
