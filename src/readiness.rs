//! # Stage: Readiness tracking
//!
//! ## Responsibility
//! Follow the desired address definitions held in the configuration store,
//! keep one [`ReadinessRecord`] per definition, and turn each poll's address
//! statistics into persisted `isReady` / `phase` transitions.
//!
//! ## Guarantees
//! - Records exist exactly for the definitions of the latest dispatched set
//! - A record turns ready only on `propagated == 100` and unready only on a
//!   later poll reporting anything else; no stats means no change
//! - Status writes are compare-and-swap; a conflicting write is left for the
//!   next poll to re-evaluate

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, error, info, warn};

use crate::diff::changes;
use crate::error::StoreError;
use crate::model::AddressDefinition;
use crate::stats::{AddressStats, FULLY_PROPAGATED};
use crate::store::{decode_resource, set_readiness, ConfigStore, StoredObject, UpdateOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessRecord {
    pub address: String,
    /// Store resource holding the definition.
    pub name: String,
    pub ready: bool,
}

/// Aggregates to dispatch after a store change. `None` means unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredUpdate {
    /// Full new set of definitions.
    pub defined: Option<Arc<Vec<AddressDefinition>>>,
    /// Definitions that are neither `Pending` nor `Terminating`.
    pub ready: Option<Arc<Vec<AddressDefinition>>>,
}

impl DesiredUpdate {
    pub fn is_empty(&self) -> bool {
        self.defined.is_none() && self.ready.is_none()
    }
}

/// Result of one status write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusWrite {
    Updated,
    Unchanged,
    Failed(StoreError),
}

fn same_definition(a: &AddressDefinition, b: &AddressDefinition) -> bool {
    a.address == b.address && a.address_type == b.address_type && a.allocated_to == b.allocated_to
}

fn same_definition_and_status(a: &AddressDefinition, b: &AddressDefinition) -> bool {
    same_definition(a, b) && a.status == b.status
}

fn by_address(a: &AddressDefinition, b: &AddressDefinition) -> std::cmp::Ordering {
    a.address.cmp(&b.address)
}

fn label(a: &AddressDefinition) -> String {
    a.address.clone()
}

/// Decode stored objects into definitions, skipping any that do not parse.
pub fn parse_definitions(objects: &[StoredObject]) -> Vec<AddressDefinition> {
    objects
        .iter()
        .filter_map(|obj| match decode_resource(&obj.name, &obj.data) {
            Ok(res) => Some(res.into_definition(&obj.name)),
            Err(e) => {
                warn!(object = %obj.name, error = %e, "skipping unparseable address definition");
                None
            }
        })
        .collect()
}

pub struct ReadinessTracker {
    store: Arc<dyn ConfigStore>,
    last_defined: Option<Vec<AddressDefinition>>,
    last_ready: Option<Vec<AddressDefinition>>,
    readiness: BTreeMap<String, ReadinessRecord>,
}

impl ReadinessTracker {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            store,
            last_defined: None,
            last_ready: None,
            readiness: BTreeMap::new(),
        }
    }

    pub fn record(&self, address: &str) -> Option<&ReadinessRecord> {
        self.readiness.get(address)
    }

    pub fn records(&self) -> impl Iterator<Item = &ReadinessRecord> {
        self.readiness.values()
    }

    /// Process a fresh object list from the store's change feed.
    ///
    /// Nothing is dispatched unless a definition was added, removed, or
    /// changed its type, allocation or status.
    pub fn on_desired_update(&mut self, objects: &[StoredObject]) -> DesiredUpdate {
        let defined = parse_definitions(objects);
        let diff = changes(
            self.last_defined.as_deref(),
            &defined,
            by_address,
            Some(same_definition_and_status),
            label,
        );
        self.last_defined = Some(defined.clone());

        let Some(diff) = diff else {
            debug!("address definitions unchanged");
            return DesiredUpdate::default();
        };

        for d in &diff.added {
            self.readiness
                .entry(d.address.clone())
                .or_insert_with(|| ReadinessRecord {
                    address: d.address.clone(),
                    name: d.name.clone(),
                    ready: false,
                });
        }
        for d in &diff.removed {
            self.readiness.remove(&d.address);
        }
        info!(changes = %diff.description, "addresses_defined");

        let ready: Vec<AddressDefinition> =
            defined.iter().filter(|d| d.is_routable()).cloned().collect();
        let ready_diff = changes(
            self.last_ready.as_deref(),
            &ready,
            by_address,
            Some(same_definition),
            label,
        );
        self.last_ready = Some(ready.clone());
        if let Some(rd) = &ready_diff {
            info!(changes = %rd.description, "addresses_ready");
        }

        DesiredUpdate {
            defined: Some(Arc::new(defined)),
            ready: ready_diff.map(|_| Arc::new(ready)),
        }
    }

    /// Apply one poll's statistics to every record.
    ///
    /// Status writes run concurrently. A record only changes once its write
    /// is confirmed as updated or already in place.
    pub async fn check_status(
        &mut self,
        stats: &BTreeMap<String, AddressStats>,
    ) -> Vec<(String, StatusWrite)> {
        let mut transitions: Vec<(String, String, bool)> = Vec::new();
        for record in self.readiness.values() {
            let Some(s) = stats.get(&record.address) else {
                debug!(address = %record.address, ready = record.ready, "no stats supplied");
                continue;
            };
            let propagated = s.propagated == FULLY_PROPAGATED;
            if !record.ready && propagated {
                info!(address = %record.address, "address is now ready");
                transitions.push((record.address.clone(), record.name.clone(), true));
            } else if record.ready && !propagated {
                info!(address = %record.address, propagated = s.propagated, "address is no longer ready");
                transitions.push((record.address.clone(), record.name.clone(), false));
            }
        }

        let store = self.store.as_ref();
        let writes = join_all(transitions.into_iter().map(|(address, name, ready)| async move {
            let result = set_readiness(store, &name, ready).await;
            (address, ready, result)
        }))
        .await;

        let mut out = Vec::with_capacity(writes.len());
        for (address, ready, result) in writes {
            let outcome = match result {
                Ok(UpdateOutcome::Updated(version)) => {
                    info!(address = %address, ready, version, "updated status");
                    StatusWrite::Updated
                }
                Ok(UpdateOutcome::Unchanged) => {
                    debug!(address = %address, ready, "status already up to date");
                    StatusWrite::Unchanged
                }
                Err(e) => {
                    error!(address = %address, ready, error = %e, "failed to update status");
                    out.push((address, StatusWrite::Failed(e)));
                    continue;
                }
            };
            if let Some(record) = self.readiness.get_mut(&address) {
                record.ready = ready;
            }
            out.push((address, outcome));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AddressResource, AddressStatus, Phase};
    use crate::store::MemoryStore;

    fn object(def: &AddressDefinition, version: u64) -> StoredObject {
        let mut res = AddressResource::for_definition(def, "space");
        res.status = Some(def.status.clone());
        StoredObject {
            name: res.metadata.name.clone().unwrap_or_default(),
            version,
            data: serde_json::to_string(&res).unwrap(),
        }
    }

    fn tracker() -> ReadinessTracker {
        ReadinessTracker::new(Arc::new(MemoryStore::new()))
    }

    fn active() -> AddressStatus {
        AddressStatus {
            is_ready: true,
            phase: Phase::Active,
            message: None,
        }
    }

    #[test]
    fn test_first_update_dispatches_defined_and_creates_records() {
        let mut t = tracker();
        let q = AddressDefinition::queue("q1");
        let update = t.on_desired_update(&[object(&q, 1)]);
        assert_eq!(update.defined.unwrap().len(), 1);
        assert_eq!(
            t.record("q1"),
            Some(&ReadinessRecord {
                address: "q1".into(),
                name: "space.q1".into(),
                ready: false
            })
        );
    }

    #[test]
    fn test_repeated_update_dispatches_nothing() {
        let mut t = tracker();
        let objs = vec![object(&AddressDefinition::queue("q1"), 1)];
        t.on_desired_update(&objs);
        assert!(t.on_desired_update(&objs).is_empty());
    }

    #[test]
    fn test_removed_definition_drops_its_record() {
        let mut t = tracker();
        let q1 = object(&AddressDefinition::queue("q1"), 1);
        let q2 = object(&AddressDefinition::queue("q2"), 2);
        t.on_desired_update(&[q1.clone(), q2]);
        let update = t.on_desired_update(&[q1]);
        assert!(update.defined.is_some());
        assert!(t.record("q2").is_none());
        assert_eq!(t.records().count(), 1);
    }

    #[test]
    fn test_status_change_redispatches_defined_but_ready_only_on_membership() {
        let mut t = tracker();
        let pending = AddressDefinition::queue("q1");
        let first = t.on_desired_update(&[object(&pending, 1)]);
        // Nothing routable yet, but the first snapshot is still a change.
        assert_eq!(first.ready.unwrap().len(), 0);

        let now_active = pending.clone().with_status(active());
        let second = t.on_desired_update(&[object(&now_active, 2)]);
        assert!(second.defined.is_some());
        assert_eq!(second.ready.unwrap().len(), 1);

        let mut with_message = active();
        with_message.message = Some("ok".into());
        let third = t.on_desired_update(&[object(&pending.with_status(with_message), 3)]);
        assert!(third.defined.is_some());
        assert!(third.ready.is_none());
    }

    #[test]
    fn test_unparseable_objects_are_skipped() {
        let mut t = tracker();
        let bad = StoredObject {
            name: "bad".into(),
            version: 1,
            data: "{".into(),
        };
        let update = t.on_desired_update(&[bad, object(&AddressDefinition::topic("t1"), 2)]);
        assert_eq!(update.defined.unwrap().len(), 1);
    }
}
