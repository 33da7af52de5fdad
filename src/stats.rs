//! Normalises raw broker telemetry into address and connection statistics.
//!
//! ## Responsibility
//! Translate the counters the broker reports per queue, topic, connection,
//! producer and consumer into the [`AddressStats`] / [`ConnectionStats`]
//! model consumed by the readiness tracker and exposed on the event bus.
//!
//! ## Mapping
//! | AddressStats field      | queue                             | topic (summed over subscriptions) |
//! |-------------------------|-----------------------------------|-----------------------------------|
//! | depth                   | messages                          | Σ messages                        |
//! | messages_in             | enqueued                          | Σ enqueued                        |
//! | messages_out            | acknowledged + expired + killed   | Σ (acknowledged + expired + killed) |
//! | receivers               | consumers                         | subscription_count                |
//! | senders                 | producers attached to the address | producers attached to the address |
//! | egress.accepted         | acknowledged                      | Σ acknowledged                    |
//! | egress.unsettled        | delivered                         | Σ delivered                       |
//! | egress.rejected         | killed                            | Σ killed                          |
//! | ingress.accepted        | enqueued                          | Σ enqueued                        |
//! | propagated              | [`PropagationSignal`]             | [`PropagationSignal`]             |
//!
//! Everything here is recomputed from scratch on every poll.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::broker::{
    AddressDataIndex, RawAddressData, RawConnection, RawConsumer, RawProducer, RawQueueStats,
    RawTopicStats,
};

/// `propagated` value meaning the address is routable end to end.
pub const FULLY_PROPAGATED: u8 = 100;

// ---------------------------------------------------------------------------
// Output model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProducerStats {
    pub connection_id: String,
    pub address: String,
    pub deliveries: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub name: String,
    pub connection_id: String,
    /// Owning address once resolved through the queue reverse index.
    pub address: String,
    /// Not reported by the broker yet; always zero.
    pub deliveries: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EgressOutcomes {
    pub accepted: u64,
    pub unsettled: u64,
    pub rejected: u64,
    pub links: Vec<ConsumerStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngressOutcomes {
    pub accepted: u64,
    pub links: Vec<ProducerStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Outcomes {
    pub egress: EgressOutcomes,
    pub ingress: IngressOutcomes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AddressStats {
    pub receivers: u64,
    pub senders: u64,
    pub depth: u64,
    pub messages_in: u64,
    pub messages_out: u64,
    /// 0..=100; see [`FULLY_PROPAGATED`].
    pub propagated: u8,
    pub outcomes: Outcomes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub id: String,
    pub host: String,
    pub user: String,
    pub senders: Vec<ProducerStats>,
    pub receivers: Vec<ConsumerStats>,
    pub messages_in: u64,
}

/// Address and connection statistics from one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerTelemetry {
    pub addresses: BTreeMap<String, AddressStats>,
    pub connections: BTreeMap<String, ConnectionStats>,
}

// ---------------------------------------------------------------------------
// Propagation signal
// ---------------------------------------------------------------------------

/// Source of the `propagated` readiness signal for an address.
pub trait PropagationSignal: Send + Sync {
    fn propagated(&self, address: &str, data: &RawAddressData) -> u8;
}

/// Reports every address the broker knows about as fully propagated.
///
/// This is the broker-proximate view: an address that exists on this broker
/// is routable here. A topology-aware signal can replace it.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrokerLocalPropagation;

impl PropagationSignal for BrokerLocalPropagation {
    fn propagated(&self, _address: &str, _data: &RawAddressData) -> u8 {
        FULLY_PROPAGATED
    }
}

// ---------------------------------------------------------------------------
// Address transforms
// ---------------------------------------------------------------------------

fn messages_out(q: &RawQueueStats) -> u64 {
    q.acknowledged
        .saturating_add(q.expired)
        .saturating_add(q.killed)
}

fn sum(subs: &[RawQueueStats], field: impl Fn(&RawQueueStats) -> u64) -> u64 {
    subs.iter().map(field).fold(0u64, u64::saturating_add)
}

/// Statistics for a single queue.
pub fn transform_queue_stats(queue: &RawQueueStats, propagated: u8) -> AddressStats {
    AddressStats {
        receivers: queue.consumers,
        senders: 0,
        depth: queue.messages,
        messages_in: queue.enqueued,
        messages_out: messages_out(queue),
        propagated,
        outcomes: Outcomes {
            egress: EgressOutcomes {
                accepted: queue.acknowledged,
                unsettled: queue.delivered,
                rejected: queue.killed,
                links: Vec::new(),
            },
            ingress: IngressOutcomes {
                accepted: queue.enqueued,
                links: Vec::new(),
            },
        },
    }
}

/// Statistics for a topic: every counter summed over its subscriptions.
pub fn transform_topic_stats(topic: &RawTopicStats, propagated: u8) -> AddressStats {
    let subs = &topic.subscriptions;
    AddressStats {
        receivers: topic.subscription_count,
        senders: 0,
        depth: sum(subs, |s| s.messages),
        messages_in: sum(subs, |s| s.enqueued),
        messages_out: sum(subs, messages_out),
        propagated,
        outcomes: Outcomes {
            egress: EgressOutcomes {
                accepted: sum(subs, |s| s.acknowledged),
                unsettled: sum(subs, |s| s.delivered),
                rejected: sum(subs, |s| s.killed),
                links: Vec::new(),
            },
            ingress: IngressOutcomes {
                accepted: sum(subs, |s| s.enqueued),
                links: Vec::new(),
            },
        },
    }
}

pub fn transform_address_stats(data: &RawAddressData, propagated: u8) -> AddressStats {
    match data {
        RawAddressData::Queue(q) => transform_queue_stats(q, propagated),
        RawAddressData::Topic(t) => transform_topic_stats(t, propagated),
    }
}

// ---------------------------------------------------------------------------
// Connection / link transforms
// ---------------------------------------------------------------------------

pub fn transform_connection_stats(raw: &RawConnection) -> ConnectionStats {
    ConnectionStats {
        id: raw.connection_id.clone(),
        host: raw.client_address.clone(),
        user: raw
            .sessions
            .first()
            .and_then(|s| s.principal.clone())
            .unwrap_or_default(),
        senders: Vec::new(),
        receivers: Vec::new(),
        messages_in: 0,
    }
}

pub fn transform_producer_stats(raw: &RawProducer) -> ProducerStats {
    ProducerStats {
        connection_id: raw.connection_id.clone(),
        address: raw.destination.clone(),
        deliveries: raw.msg_sent,
    }
}

/// Consumer record with its queue resolved to the owning address where known.
pub fn transform_consumer_stats(
    raw: &RawConsumer,
    reverse_index: &BTreeMap<String, String>,
) -> ConsumerStats {
    ConsumerStats {
        name: raw.consumer_id.clone(),
        connection_id: raw.connection_id.clone(),
        address: reverse_index
            .get(&raw.queue_name)
            .cloned()
            .unwrap_or_else(|| raw.queue_name.clone()),
        deliveries: 0,
    }
}

/// `true` for the platform's own agents: `agent` + any one character + one or
/// more of `[a-z0-9]`.
pub fn is_internal_principal(user: &str) -> bool {
    let Some(rest) = user.strip_prefix("agent") else {
        return false;
    };
    let mut chars = rest.chars();
    if chars.next().is_none() {
        return false;
    }
    let tail = chars.as_str();
    !tail.is_empty()
        && tail
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Build the full statistics model for one poll.
pub fn aggregate(
    data: &AddressDataIndex,
    connections: &[RawConnection],
    producers: &[RawProducer],
    consumers: &[RawConsumer],
    signal: &dyn PropagationSignal,
) -> BrokerTelemetry {
    let mut addresses: BTreeMap<String, AddressStats> = data
        .index
        .iter()
        .map(|(name, raw)| {
            (
                name.clone(),
                transform_address_stats(raw, signal.propagated(name, raw)),
            )
        })
        .collect();

    let mut conns: BTreeMap<String, ConnectionStats> = connections
        .iter()
        .map(transform_connection_stats)
        .filter(|c| !is_internal_principal(&c.user))
        .map(|c| (c.id.clone(), c))
        .collect();

    let senders: Vec<ProducerStats> = producers.iter().map(transform_producer_stats).collect();
    let receivers: Vec<ConsumerStats> = consumers
        .iter()
        .map(|c| transform_consumer_stats(c, &data.reverse_index))
        .collect();

    for s in &senders {
        if let Some(conn) = conns.get_mut(&s.connection_id) {
            conn.senders.push(s.clone());
        }
        if let Some(addr) = addresses.get_mut(&s.address) {
            addr.outcomes.ingress.links.push(s.clone());
            addr.senders = addr.outcomes.ingress.links.len() as u64;
        }
    }
    for r in &receivers {
        if let Some(conn) = conns.get_mut(&r.connection_id) {
            conn.receivers.push(r.clone());
        }
        if let Some(addr) = addresses.get_mut(&r.address) {
            addr.outcomes.egress.links.push(r.clone());
        }
    }

    for conn in conns.values_mut() {
        conn.messages_in = conn
            .senders
            .iter()
            .map(|s| s.deliveries)
            .fold(0u64, u64::saturating_add);
    }

    BrokerTelemetry {
        addresses,
        connections: conns,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::RawSession;
    use rstest::rstest;

    fn queue(name: &str, address: &str) -> RawQueueStats {
        RawQueueStats {
            name: name.into(),
            address: address.into(),
            ..Default::default()
        }
    }

    fn connection(id: &str, principal: Option<&str>) -> RawConnection {
        RawConnection {
            connection_id: id.into(),
            client_address: format!("10.0.0.1:{id}"),
            sessions: vec![RawSession {
                principal: principal.map(str::to_string),
            }],
        }
    }

    struct HalfPropagated;

    impl PropagationSignal for HalfPropagated {
        fn propagated(&self, _address: &str, _data: &RawAddressData) -> u8 {
            50
        }
    }

    // -----------------------------------------------------------------------
    // Queue / topic counters
    // -----------------------------------------------------------------------

    #[test]
    fn queue_counters_map_onto_address_stats() {
        let raw = RawQueueStats {
            messages: 10,
            enqueued: 10,
            acknowledged: 7,
            expired: 1,
            killed: 0,
            consumers: 2,
            delivered: 8,
            ..queue("q1", "q1")
        };
        let s = transform_queue_stats(&raw, FULLY_PROPAGATED);
        assert_eq!(s.depth, 10);
        assert_eq!(s.messages_in, 10);
        assert_eq!(s.messages_out, 8);
        assert_eq!(s.receivers, 2);
        assert_eq!(s.outcomes.egress.accepted, 7);
        assert_eq!(s.outcomes.egress.unsettled, 8);
        assert_eq!(s.outcomes.egress.rejected, 0);
        assert_eq!(s.outcomes.ingress.accepted, 10);
        assert_eq!(s.propagated, 100);
    }

    #[test]
    fn topic_counters_are_summed_over_subscriptions() {
        let a = RawQueueStats { messages: 2, enqueued: 5, acknowledged: 3, expired: 0, killed: 1, delivered: 1, ..queue("a", "t") };
        let b = RawQueueStats { messages: 1, enqueued: 4, acknowledged: 2, expired: 1, killed: 0, delivered: 2, ..queue("b", "t") };
        let topic = RawTopicStats {
            name: "t".into(),
            subscription_count: 2,
            subscriptions: vec![a, b],
        };
        let s = transform_topic_stats(&topic, FULLY_PROPAGATED);
        assert_eq!(s.receivers, 2);
        assert_eq!(s.depth, 3);
        assert_eq!(s.messages_in, 9);
        assert_eq!(s.messages_out, 7);
        assert_eq!(s.outcomes.egress.accepted, 5);
        assert_eq!(s.outcomes.egress.unsettled, 3);
        assert_eq!(s.outcomes.egress.rejected, 1);
        assert_eq!(s.outcomes.ingress.accepted, 9);
    }

    #[test]
    fn topic_without_subscriptions_is_all_zero() {
        let topic = RawTopicStats { name: "t".into(), subscription_count: 0, subscriptions: vec![] };
        let s = transform_topic_stats(&topic, FULLY_PROPAGATED);
        assert_eq!(s.depth, 0);
        assert_eq!(s.messages_in, 0);
        assert_eq!(s.receivers, 0);
    }

    #[test]
    fn saturating_counters_do_not_overflow() {
        let raw = RawQueueStats { acknowledged: u64::MAX, expired: 5, ..queue("q", "q") };
        assert_eq!(transform_queue_stats(&raw, 100).messages_out, u64::MAX);
    }

    // -----------------------------------------------------------------------
    // Internal principal detection
    // -----------------------------------------------------------------------

    #[rstest]
    #[case("agent.abc123", true)]
    #[case("agent-7", true)]
    #[case("agent.", false)]
    #[case("agent", false)]
    #[case("agent.ABC", false)]
    #[case("alice", false)]
    #[case("", false)]
    #[case("xagent.abc", false)]
    fn internal_principal_pattern(#[case] user: &str, #[case] expected: bool) {
        assert_eq!(is_internal_principal(user), expected);
    }

    // -----------------------------------------------------------------------
    // Aggregation
    // -----------------------------------------------------------------------

    fn sample_index() -> AddressDataIndex {
        let mut idx = AddressDataIndex::default();
        idx.insert_queue(RawQueueStats { consumers: 1, ..queue("orders", "orders") });
        idx.insert_topic(RawTopicStats {
            name: "prices".into(),
            subscription_count: 1,
            subscriptions: vec![queue("prices-sub", "prices")],
        });
        idx
    }

    #[test]
    fn aggregate_groups_links_by_connection_and_address() {
        let conns = vec![connection("c1", Some("alice")), connection("c2", Some("bob"))];
        let producers = vec![
            RawProducer { connection_id: "c1".into(), destination: "orders".into(), msg_sent: 4 },
            RawProducer { connection_id: "c1".into(), destination: "prices".into(), msg_sent: 6 },
        ];
        let consumers = vec![RawConsumer {
            consumer_id: "k1".into(),
            connection_id: "c2".into(),
            queue_name: "prices-sub".into(),
        }];

        let t = aggregate(&sample_index(), &conns, &producers, &consumers, &BrokerLocalPropagation);

        let c1 = &t.connections["c1"];
        assert_eq!(c1.senders.len(), 2);
        assert_eq!(c1.messages_in, 10);
        assert_eq!(c1.user, "alice");
        let c2 = &t.connections["c2"];
        assert_eq!(c2.receivers.len(), 1);
        assert_eq!(c2.receivers[0].address, "prices");
        assert_eq!(c2.messages_in, 0);

        let orders = &t.addresses["orders"];
        assert_eq!(orders.senders, 1);
        assert_eq!(orders.outcomes.ingress.links.len(), 1);
        let prices = &t.addresses["prices"];
        assert_eq!(prices.senders, 1);
        assert_eq!(prices.outcomes.egress.links.len(), 1);
    }

    #[test]
    fn aggregate_drops_internal_agent_connections() {
        let conns = vec![connection("c1", Some("agent.x1")), connection("c2", None)];
        let producers = vec![RawProducer { connection_id: "c1".into(), destination: "orders".into(), msg_sent: 1 }];
        let t = aggregate(&sample_index(), &conns, &producers, &[], &BrokerLocalPropagation);
        assert!(!t.connections.contains_key("c1"));
        assert_eq!(t.connections["c2"].user, "");
        // link still counts against the address even if its connection is hidden
        assert_eq!(t.addresses["orders"].senders, 1);
    }

    #[test]
    fn aggregate_uses_propagation_signal() {
        let t = aggregate(&sample_index(), &[], &[], &[], &HalfPropagated);
        assert!(t.addresses.values().all(|s| s.propagated == 50));
    }

    #[test]
    fn consumer_on_unknown_queue_keeps_queue_name() {
        let raw = RawConsumer { consumer_id: "k".into(), connection_id: "c".into(), queue_name: "gone".into() };
        let c = transform_consumer_stats(&raw, &BTreeMap::new());
        assert_eq!(c.address, "gone");
    }

    #[test]
    fn connection_without_sessions_has_empty_user() {
        let raw = RawConnection { connection_id: "c".into(), client_address: "h".into(), sessions: vec![] };
        assert_eq!(transform_connection_stats(&raw).user, "");
    }
}
