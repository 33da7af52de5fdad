//! # Stage: Address reconciliation
//!
//! ## Responsibility
//! Drive one broker's address set towards the desired set held in the
//! configuration store. Each cycle lists the broker's addresses, deletes what
//! is stale, creates what is missing, reconciles connector services and then
//! publishes fresh telemetry.
//!
//! ## Guarantees
//! - At most one cycle in flight: overlapping triggers collapse into a single
//!   follow-up cycle run against the latest desired set
//! - Ordered: every delete is issued before any create, and all queues and
//!   topics are settled before any subscription is created
//! - Non-fatal: broker failures end in a log line or a per-address event and
//!   never abort the cycle for unrelated addresses
//! - `Synchronized` is published on the transition into convergence only

pub mod connectors;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerAddress, BrokerManagement};
use crate::config::ReconcilerConfig;
use crate::diff::difference;
use crate::error::BrokerError;
use crate::events::{EventBus, ReconcilerEvent};
use crate::model::{
    same_address, ActualAddressView, AddressDefinition, AddressKey, AddressType, DesiredAddressSet,
};
use crate::stats::{aggregate, BrokerLocalPropagation, BrokerTelemetry, PropagationSignal};

pub use connectors::{desired_connectors, ConnectorReconciler};

/// Addresses the broker creates for itself.
pub const INTERNAL_ADDRESSES: [&str; 3] = ["DLQ", "ExpiryQueue", "activemq.notifications"];

/// Container group whose brokers host only subscriptions.
pub const SHARDED_TOPIC_GROUP: &str = "sharded-topic";

pub fn is_internal_address(name: &str) -> bool {
    INTERNAL_ADDRESSES.contains(&name)
}

// ---------------------------------------------------------------------------
// Excluded types
// ---------------------------------------------------------------------------

/// Address types this reconciler instance leaves alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludedTypes(Vec<AddressType>);

impl ExcludedTypes {
    pub fn none() -> Self {
        Self(Vec::new())
    }

    pub fn of(types: &[AddressType]) -> Self {
        Self(types.to_vec())
    }

    /// `sharded-topic` brokers manage subscriptions only; any other named group
    /// manages queues and topics. No group means nothing is excluded.
    pub fn for_container_group(group: Option<&str>) -> Self {
        match group {
            None => Self::none(),
            Some(SHARDED_TOPIC_GROUP) => Self::of(&[AddressType::Queue, AddressType::Topic]),
            Some(_) => Self::of(&[AddressType::Subscription]),
        }
    }

    pub fn contains(&self, t: AddressType) -> bool {
        self.0.contains(&t)
    }
}

/// Reduce the broker's listing to the addresses this instance reconciles.
///
/// Drops broker-internal names, excluded types, temporary queues and entries
/// without a name.
pub fn translate(
    listed: &BTreeMap<String, BrokerAddress>,
    excluded: &ExcludedTypes,
) -> ActualAddressView {
    let mut out = ActualAddressView::new();
    for (key, a) in listed {
        if is_internal_address(key) || excluded.contains(a.address_type) {
            continue;
        }
        if a.address_type == AddressType::Queue && a.temporary {
            debug!(queue = %key, "ignoring temporary queue");
            continue;
        }
        match &a.name {
            Some(name) => {
                out.insert(key.clone(), AddressKey::new(name.clone(), a.address_type));
            }
            None => warn!(entry = %key, "skipping broker address with no name"),
        }
    }
    out
}

/// Reduce the desired set to the addresses this instance may create.
///
/// Definitions of an excluded type are dropped and logged, since the broker
/// listing never shows them either.
pub fn select_wanted(desired: &DesiredAddressSet, excluded: &ExcludedTypes) -> DesiredAddressSet {
    let mut out = DesiredAddressSet::new();
    for (key, d) in desired {
        if excluded.contains(d.address_type) {
            debug!(address = %d.address, kind = %d.address_type, "skipping desired address of excluded type");
            continue;
        }
        out.insert(key.clone(), d.clone());
    }
    out
}

// ---------------------------------------------------------------------------
// Cycle bookkeeping
// ---------------------------------------------------------------------------

/// What a call to [`AddressReconciler::reconcile`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// One or more cycles ran to completion.
    Completed,
    /// A cycle was already running; a follow-up has been queued.
    Busy,
    /// No desired set has been supplied yet.
    NoDesiredState,
}

/// Releases the in-flight flag even if the cycle future is dropped.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Cadence log for telemetry retrieval: the first retrieval, then a count per
/// window.
#[derive(Debug, Default)]
struct RetrievalLog {
    count: u64,
    window_start: Option<Instant>,
}

#[derive(Debug, PartialEq, Eq)]
enum RetrievalReport {
    First,
    Window { count: u64, secs: u64 },
}

impl RetrievalLog {
    fn record(&mut self, now: Instant, window: Duration) -> Option<RetrievalReport> {
        self.count += 1;
        let Some(start) = self.window_start else {
            self.window_start = Some(now);
            return Some(RetrievalReport::First);
        };
        let elapsed = now.saturating_duration_since(start);
        if elapsed < window {
            return None;
        }
        let report = RetrievalReport::Window {
            count: self.count,
            secs: elapsed.as_secs(),
        };
        self.count = 0;
        self.window_start = Some(now);
        Some(report)
    }
}

// ---------------------------------------------------------------------------
// AddressReconciler
// ---------------------------------------------------------------------------

pub struct AddressReconciler {
    id: String,
    broker: Arc<dyn BrokerManagement>,
    events: EventBus,
    config: ReconcilerConfig,
    excluded: ExcludedTypes,
    signal: Arc<dyn PropagationSignal>,
    connectors: ConnectorReconciler,
    desired: Mutex<Option<Arc<DesiredAddressSet>>>,
    in_progress: AtomicBool,
    pending: AtomicBool,
    busy_count: AtomicU64,
    synchronized: AtomicBool,
    retrievals: Mutex<RetrievalLog>,
    polling: Mutex<Option<JoinHandle<()>>>,
}

impl AddressReconciler {
    /// Excluded types come from `config.container_group`.
    pub fn new(
        id: impl Into<String>,
        broker: Arc<dyn BrokerManagement>,
        events: EventBus,
        config: ReconcilerConfig,
    ) -> Self {
        let id = id.into();
        let excluded = ExcludedTypes::for_container_group(config.container_group.as_deref());
        if excluded != ExcludedTypes::none() {
            info!(broker = %id, excluded = ?excluded, group = ?config.container_group, "excluding address types");
        }
        Self {
            connectors: ConnectorReconciler::new(id.clone(), Arc::clone(&broker)),
            id,
            broker,
            events,
            config,
            excluded,
            signal: Arc::new(BrokerLocalPropagation),
            desired: Mutex::new(None),
            in_progress: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            busy_count: AtomicU64::new(0),
            synchronized: AtomicBool::new(false),
            retrievals: Mutex::new(RetrievalLog::default()),
            polling: Mutex::new(None),
        }
    }

    pub fn with_excluded_types(mut self, excluded: ExcludedTypes) -> Self {
        self.excluded = excluded;
        self
    }

    pub fn with_propagation(mut self, signal: Arc<dyn PropagationSignal>) -> Self {
        self.signal = signal;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized.load(Ordering::Acquire)
    }

    /// Calls dropped since the last cycle started.
    pub fn busy_count(&self) -> u64 {
        self.busy_count.load(Ordering::Acquire)
    }

    pub fn desired(&self) -> Option<Arc<DesiredAddressSet>> {
        self.desired.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the desired set wholesale and reconcile against it.
    pub async fn set_desired(
        &self,
        addresses: impl IntoIterator<Item = AddressDefinition>,
    ) -> CycleOutcome {
        let set: DesiredAddressSet = addresses
            .into_iter()
            .map(|a| (a.address.clone(), a))
            .collect();
        *self.desired.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(set));
        self.reconcile().await
    }

    /// Run a reconciliation cycle unless one is already running.
    ///
    /// A call that finds a cycle in flight is dropped, counted, and leaves one
    /// follow-up queued; the running call then performs that follow-up with
    /// whatever desired set is current at the time.
    pub async fn reconcile(&self) -> CycleOutcome {
        if self.desired().is_none() {
            info!(broker = %self.id, "unable to check broker, no desired addresses defined");
            return CycleOutcome::NoDesiredState;
        }

        let mut ran = false;
        loop {
            if self
                .in_progress
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                if ran {
                    // The caller now holding the guard reads the latest set.
                    return CycleOutcome::Completed;
                }
                self.pending.store(true, Ordering::Release);
                let busy = self.busy_count.fetch_add(1, Ordering::AcqRel) + 1;
                if busy % self.config.busy_log_every.max(1) == 0 {
                    info!(broker = %self.id, busy, "unable to check broker, check already in progress");
                }
                return CycleOutcome::Busy;
            }

            ran = true;
            {
                let _guard = InFlight(&self.in_progress);
                loop {
                    self.pending.store(false, Ordering::Release);
                    self.busy_count.store(0, Ordering::Release);
                    if let Some(desired) = self.desired() {
                        self.run_cycle(&desired).await;
                    }
                    if !self.pending.load(Ordering::Acquire) {
                        break;
                    }
                    debug!(broker = %self.id, "running queued follow-up cycle");
                }
            }

            // A trigger may have landed between the last check and the guard
            // release. Pick it up unless another caller already has.
            if !self.pending.swap(false, Ordering::AcqRel) {
                return CycleOutcome::Completed;
            }
        }
    }

    async fn run_cycle(&self, desired: &DesiredAddressSet) {
        if self.sync_addresses(desired).await.is_ok() {
            // Absorb broker-side lag, e.g. a queue that was still visible while
            // being deleted. Never more than one extra pass.
            let _ = self.sync_addresses(desired).await;
        }
        if self.config.reconcile_connectors {
            self.connectors.ensure(&desired_connectors(desired)).await;
        }
        self.retrieve_stats().await;
    }

    // -----------------------------------------------------------------------
    // Address sync
    // -----------------------------------------------------------------------

    async fn sync_addresses(&self, desired: &DesiredAddressSet) -> Result<(), BrokerError> {
        let listed = match self.broker.list_addresses().await {
            Ok(l) => l,
            Err(e) => {
                error!(broker = %self.id, error = %e, "failed to retrieve addresses");
                return Err(e);
            }
        };
        let actual = translate(&listed, &self.excluded);
        let wanted = select_wanted(desired, &self.excluded);

        let stale: Vec<&AddressKey> = difference(&actual, &wanted, |a, d| same_address(a, d));
        let missing: Vec<&AddressDefinition> =
            difference(&wanted, &actual, |d, a| same_address(d, a));
        debug!(
            broker = %self.id,
            desired = wanted.len(),
            actual = actual.len(),
            stale = stale.len(),
            missing = missing.len(),
            "checking addresses"
        );
        self.set_sync_status(stale.len(), missing.len());

        join_all(stale.iter().map(|a| self.delete_address(a))).await;

        let (subscriptions, others): (Vec<&AddressDefinition>, Vec<&AddressDefinition>) = missing
            .into_iter()
            .partition(|d| d.address_type == AddressType::Subscription);
        join_all(others.into_iter().map(|d| self.create_address(d))).await;
        join_all(subscriptions.into_iter().map(|d| self.create_address(d))).await;
        Ok(())
    }

    fn set_sync_status(&self, stale: usize, missing: usize) {
        let converged = stale == 0 && missing == 0;
        let was = self.synchronized.swap(converged, Ordering::AcqRel);
        if was == converged {
            return;
        }
        if converged {
            info!(broker = %self.id, "addresses are synchronized");
            self.events.publish(ReconcilerEvent::Synchronized);
        } else {
            info!(broker = %self.id, to_delete = stale, to_create = missing, "addresses synchronizing");
        }
    }

    async fn delete_address(&self, a: &AddressKey) {
        if self.config.remove_settings_on_delete {
            match self.broker.remove_address_settings(&a.address).await {
                Ok(()) => info!(broker = %self.id, address = %a.address, "deleted address settings"),
                Err(e) => {
                    error!(broker = %self.id, address = %a.address, error = %e, "failed to delete address settings")
                }
            }
        }

        match a.address_type {
            AddressType::Queue => {
                info!(broker = %self.id, address = %a.address, "deleting queue");
                let Err(e) = self.broker.destroy_queue(&a.address).await else {
                    info!(broker = %self.id, address = %a.address, "deleted queue");
                    self.publish_deleted(a);
                    return;
                };
                error!(broker = %self.id, address = %a.address, error = %e, "failed to delete queue");
                match self.broker.delete_address(&a.address).await {
                    Ok(()) => {
                        info!(broker = %self.id, address = %a.address, "deleted anycast address");
                        self.publish_deleted(a);
                    }
                    Err(e) => {
                        error!(broker = %self.id, address = %a.address, error = %e, "failed to delete queue address");
                        self.publish_delete_failed(a, e);
                    }
                }
            }
            AddressType::Topic => {
                info!(broker = %self.id, address = %a.address, "deleting topic");
                match self.broker.delete_address_and_bindings(&a.address).await {
                    Ok(()) => {
                        info!(broker = %self.id, address = %a.address, "deleted topic");
                        self.publish_deleted(a);
                    }
                    Err(e) => {
                        error!(broker = %self.id, address = %a.address, error = %e, "failed to delete topic");
                        self.publish_delete_failed(a, e);
                    }
                }
            }
            AddressType::Subscription => {
                info!(broker = %self.id, address = %a.address, "deleting subscription");
                match self.broker.destroy_queue(&a.address).await {
                    Ok(()) => {
                        info!(broker = %self.id, address = %a.address, "deleted subscription");
                        self.publish_deleted(a);
                    }
                    Err(e) => {
                        error!(broker = %self.id, address = %a.address, error = %e, "failed to delete subscription");
                        self.publish_delete_failed(a, e);
                    }
                }
            }
        }
    }

    fn publish_deleted(&self, a: &AddressKey) {
        self.events.publish(ReconcilerEvent::AddressDeleted {
            address: a.address.clone(),
        });
    }

    fn publish_delete_failed(&self, a: &AddressKey, e: BrokerError) {
        self.events.publish(ReconcilerEvent::AddressDeleteFailed {
            address: a.address.clone(),
            error: e.to_string(),
        });
    }

    async fn create_address(&self, d: &AddressDefinition) {
        if let Some(settings) = &d.settings {
            info!(broker = %self.id, address = %d.address, settings = ?settings, "creating address settings");
            if let Err(e) = self.broker.add_address_settings(&d.address, settings).await {
                error!(broker = %self.id, address = %d.address, error = %e, "failed to create address settings");
            }
        }

        info!(broker = %self.id, address = %d.address, kind = %d.address_type, topic = ?d.topic, "creating address");
        let result = match d.address_type {
            AddressType::Queue => self.broker.create_queue(&d.address).await,
            AddressType::Topic => self.broker.create_address(&d.address, true).await,
            AddressType::Subscription => match &d.topic {
                Some(topic) => self.broker.create_subscription(&d.address, topic).await,
                None => Err(BrokerError::command(
                    "createSubscription",
                    format!("subscription {} has no topic", d.address),
                )),
            },
        };
        match result {
            Ok(()) => {
                info!(broker = %self.id, address = %d.address, kind = %d.address_type, "created address");
                self.events.publish(ReconcilerEvent::AddressCreated(d.clone()));
            }
            Err(e) => {
                error!(broker = %self.id, address = %d.address, kind = %d.address_type, error = %e, "failed to create address");
                self.events.publish(ReconcilerEvent::AddressCreateFailed {
                    address: d.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    // -----------------------------------------------------------------------
    // Telemetry
    // -----------------------------------------------------------------------

    async fn fetch_telemetry(&self) -> Result<BrokerTelemetry, BrokerError> {
        let (data, connections, producers, consumers) = tokio::try_join!(
            self.broker.get_all_address_data(),
            self.broker.list_connections_with_sessions(),
            self.broker.list_producers(),
            self.broker.list_consumers(),
        )?;
        Ok(aggregate(
            &data,
            &connections,
            &producers,
            &consumers,
            self.signal.as_ref(),
        ))
    }

    /// Fetch, normalise and publish broker telemetry. Failures are logged only.
    pub async fn retrieve_stats(&self) -> Option<BrokerTelemetry> {
        let telemetry = match self.fetch_telemetry().await {
            Ok(t) => t,
            Err(e) => {
                error!(broker = %self.id, error = %e, "error retrieving stats");
                return None;
            }
        };

        let report = self
            .retrievals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(Instant::now(), self.config.stats_log_window());
        match report {
            Some(RetrievalReport::First) => info!(broker = %self.id, "broker stats retrieved"),
            Some(RetrievalReport::Window { count, secs }) => {
                info!(broker = %self.id, count, secs, "broker stats retrieved over window")
            }
            None => {}
        }

        self.events.publish(ReconcilerEvent::AddressStatsRetrieved(Arc::new(
            telemetry.addresses.clone(),
        )));
        self.events.publish(ReconcilerEvent::ConnectionStatsRetrieved(Arc::new(
            telemetry.connections.clone(),
        )));
        Some(telemetry)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Reconcile every `interval`, first tick one interval from now. Replaces
    /// any polling already running.
    pub fn start_polling(self: &Arc<Self>, interval: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else { break };
                this.reconcile().await;
            }
        });
        if let Some(old) = self
            .polling
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle)
        {
            old.abort();
        }
    }

    pub fn is_polling(&self) -> bool {
        self.polling
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop polling and close the broker session.
    pub async fn close(&self) -> Result<(), BrokerError> {
        if let Some(handle) = self.polling.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        self.broker.close().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
