//! # Agent
//!
//! The loop that closes the feedback cycle between the configuration store and
//! the broker:
//!
//! ```text
//! ConfigStore ──watch──► ReadinessTracker ──addresses_defined──► AddressReconciler
//!      ▲                        ▲                                      │
//!      │                        └──────── address stats ◄──────────────┘
//!      └──── isReady / phase ◄──┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! let agent = Agent::new(store, broker, EventBus::new(), &config);
//! agent.run(async { let _ = tokio::signal::ctrl_c().await; }).await;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::broker::BrokerManagement;
use crate::config::AgentConfig;
use crate::events::{EventBus, EventKind, EventSubscription, ReconcilerEvent};
use crate::readiness::{ReadinessTracker, StatusWrite};
use crate::reconciler::{AddressReconciler, CycleOutcome};
use crate::store::{ConfigStore, StoredObject};

pub struct Agent {
    store: Arc<dyn ConfigStore>,
    reconciler: Arc<AddressReconciler>,
    tracker: ReadinessTracker,
    events: EventBus,
    poll_interval: Duration,
}

impl Agent {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        broker: Arc<dyn BrokerManagement>,
        events: EventBus,
        config: &AgentConfig,
    ) -> Self {
        let reconciler = AddressReconciler::new(
            config.broker.broker_name.clone(),
            broker,
            events.clone(),
            config.reconciler.clone(),
        );
        Self::with_reconciler(store, Arc::new(reconciler), events, config.reconciler.poll_interval())
    }

    /// Wire an already-built reconciler. It must publish on `events`.
    pub fn with_reconciler(
        store: Arc<dyn ConfigStore>,
        reconciler: Arc<AddressReconciler>,
        events: EventBus,
        poll_interval: Duration,
    ) -> Self {
        Self {
            tracker: ReadinessTracker::new(Arc::clone(&store)),
            store,
            reconciler,
            events,
            poll_interval,
        }
    }

    pub fn reconciler(&self) -> &Arc<AddressReconciler> {
        &self.reconciler
    }

    pub fn tracker(&self) -> &ReadinessTracker {
        &self.tracker
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Feed one store snapshot through the tracker and, if the desired set
    /// changed, into the reconciler.
    pub async fn apply_objects(&mut self, objects: &[StoredObject]) -> Option<CycleOutcome> {
        let update = self.tracker.on_desired_update(objects);
        if let Some(ready) = &update.ready {
            self.events
                .publish(ReconcilerEvent::AddressesReady(Arc::clone(ready)));
        }
        let defined = update.defined?;
        self.events
            .publish(ReconcilerEvent::AddressesDefined(Arc::clone(&defined)));
        Some(self.reconciler.set_desired(defined.iter().cloned()).await)
    }

    async fn apply_stats(&mut self, event: ReconcilerEvent) {
        let ReconcilerEvent::AddressStatsRetrieved(stats) = event else {
            return;
        };
        let writes = self.tracker.check_status(&stats).await;
        let failed = writes
            .iter()
            .filter(|(_, w)| matches!(w, StatusWrite::Failed(_)))
            .count();
        if failed > 0 {
            warn!(failed, total = writes.len(), "some status updates failed");
        }
    }

    fn stats_subscription(&self) -> EventSubscription {
        self.events.subscribe_to(&[EventKind::AddressStatsRetrieved])
    }

    /// Reconcile the store's current contents once and apply the resulting
    /// statistics to readiness.
    pub async fn run_once(&mut self) -> CycleOutcome {
        let mut stats = self.stats_subscription();
        let outcome = match self.store.list().await {
            Ok(objects) => match self.apply_objects(&objects).await {
                Some(outcome) => outcome,
                None => self.reconciler.reconcile().await,
            },
            Err(e) => {
                // An unreadable store says nothing about the desired set; keep
                // the last one.
                error!(error = %e, "failed to list address definitions");
                self.reconciler.reconcile().await
            }
        };
        if let Some(latest) = stats.drain().pop() {
            self.apply_stats(latest).await;
        }
        outcome
    }

    /// Run until `shutdown` resolves or the store's change feed closes.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut feed = self.store.watch();
        let mut stats = self.stats_subscription();

        info!(broker = %self.reconciler.id(), "agent ready");
        self.events.publish(ReconcilerEvent::Ready);

        let initial = feed.borrow_and_update().clone();
        self.apply_objects(&initial).await;
        self.reconciler.start_polling(self.poll_interval);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                changed = feed.changed() => {
                    if changed.is_err() {
                        warn!("configuration store feed closed");
                        break;
                    }
                    let objects = feed.borrow_and_update().clone();
                    debug!(objects = objects.len(), "address definitions updated");
                    self.apply_objects(&objects).await;
                }
                event = stats.recv() => match event {
                    Some(event) => self.apply_stats(event).await,
                    None => break,
                },
            }
        }

        if let Err(e) = self.reconciler.close().await {
            error!(error = %e, "failed to close broker session");
        }
    }
}
