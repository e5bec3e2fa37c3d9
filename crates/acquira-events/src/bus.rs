use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

use acquira_core::constants::EVENT_PARTITIONS;
use acquira_core::error::GatewayError;

use crate::message::EventEnvelope;

pub const TOPIC_PAYMENT_EVENTS: &str = "payment-events";
pub const TOPIC_PAYMENT_EVENTS_DLQ: &str = "payment-events-dlq";

/// One record as it sits on a partition.
#[derive(Clone, Debug)]
pub struct StoredEvent {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub envelope: EventEnvelope,
}

struct PartitionState {
    log: Vec<StoredEvent>,
    /// group name -> live subscriber sender for this partition.
    subscribers: HashMap<String, mpsc::UnboundedSender<StoredEvent>>,
}

struct TopicState {
    partitions: Vec<PartitionState>,
}

impl TopicState {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions)
                .map(|_| PartitionState { log: Vec::new(), subscribers: HashMap::new() })
                .collect(),
        }
    }
}

/// In-process ordered event broker with Kafka-style semantics: named topics,
/// key-hashed partitions, append-only per-partition logs, consumer groups.
///
/// `set_available(false)` simulates a broker outage; publishes then fail
/// retryably, which is what drives the degradation buffer.
pub struct EventBus {
    inner: Mutex<BusInner>,
}

struct BusInner {
    topics: HashMap<String, TopicState>,
    partitions_per_topic: u32,
    published_ids: HashSet<String>,
    available: bool,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_partitions(EVENT_PARTITIONS)
    }

    pub fn with_partitions(partitions: u32) -> Self {
        let mut topics = HashMap::new();
        topics.insert(TOPIC_PAYMENT_EVENTS.to_string(), TopicState::new(partitions));
        topics.insert(TOPIC_PAYMENT_EVENTS_DLQ.to_string(), TopicState::new(partitions));
        Self {
            inner: Mutex::new(BusInner {
                topics,
                partitions_per_topic: partitions,
                published_ids: HashSet::new(),
                available: true,
            }),
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.inner.lock().expect("bus lock").partitions_per_topic
    }

    /// Fault injection: an unavailable bus rejects publishes retryably.
    pub fn set_available(&self, available: bool) {
        self.inner.lock().expect("bus lock").available = available;
    }

    /// Publish a validated envelope under `key` (the payment id). Duplicate
    /// event ids are acknowledged without re-appending, making the producer
    /// side idempotent.
    pub fn publish(
        &self,
        topic: &str,
        key: &str,
        envelope: &EventEnvelope,
    ) -> Result<(), GatewayError> {
        envelope.validate()?;

        let mut inner = self.inner.lock().expect("bus lock");
        if !inner.available {
            return Err(GatewayError::BrokerUnavailable);
        }
        // Dedup is per topic: the same envelope may legitimately appear on
        // the DLQ topic after failing on the main one.
        if !inner.published_ids.insert(format!("{topic}:{}", envelope.event_id)) {
            debug!(event_id = %envelope.event_id, "duplicate publish acknowledged");
            return Ok(());
        }

        let partitions = inner.partitions_per_topic;
        let partition = partition_for(key, partitions);
        let topic_state = inner
            .topics
            .get_mut(topic)
            .ok_or_else(|| GatewayError::Internal(format!("unknown topic {topic}")))?;
        let state = &mut topic_state.partitions[partition as usize];

        let stored = StoredEvent {
            topic: topic.to_string(),
            partition,
            offset: state.log.len() as u64,
            key: key.to_string(),
            envelope: envelope.clone(),
        };
        state.log.push(stored.clone());

        // Fan out to live group subscribers; a closed receiver just drops.
        state.subscribers.retain(|_, tx| tx.send(stored.clone()).is_ok());
        Ok(())
    }

    /// Join `group` on `topic`. Returns one ordered receiver per partition,
    /// pre-loaded with the partition's existing log (earliest offset).
    pub fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Vec<mpsc::UnboundedReceiver<StoredEvent>>, GatewayError> {
        let mut inner = self.inner.lock().expect("bus lock");
        let topic_state = inner
            .topics
            .get_mut(topic)
            .ok_or_else(|| GatewayError::Internal(format!("unknown topic {topic}")))?;

        let mut receivers = Vec::new();
        for state in &mut topic_state.partitions {
            let (tx, rx) = mpsc::unbounded_channel();
            for stored in &state.log {
                let _ = tx.send(stored.clone());
            }
            state.subscribers.insert(group.to_string(), tx);
            receivers.push(rx);
        }
        Ok(receivers)
    }

    /// Full log of one partition (operational inspection and tests).
    pub fn partition_log(&self, topic: &str, partition: u32) -> Vec<StoredEvent> {
        let inner = self.inner.lock().expect("bus lock");
        inner
            .topics
            .get(topic)
            .and_then(|t| t.partitions.get(partition as usize))
            .map(|p| p.log.clone())
            .unwrap_or_default()
    }

    /// Events for `key` across partitions, in publication order.
    pub fn events_for_key(&self, topic: &str, key: &str) -> Vec<StoredEvent> {
        let inner = self.inner.lock().expect("bus lock");
        let Some(topic_state) = inner.topics.get(topic) else {
            return Vec::new();
        };
        let partition = partition_for(key, inner.partitions_per_topic);
        topic_state.partitions[partition as usize]
            .log
            .iter()
            .filter(|e| e.key == key)
            .cloned()
            .collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// FNV-1a over the key: stable for the life of the broker, which is all
/// partition affinity needs.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in key.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x1000_0000_01b3);
    }
    (hash % partitions as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::EventPayload;

    fn envelope(payment_id: &str, event_type: &str) -> EventEnvelope {
        EventEnvelope::new(
            event_type,
            "req_1",
            "trc_1",
            1_700_000_000,
            EventPayload {
                payment_id: payment_id.to_string(),
                merchant_id: "mer_1".into(),
                amount: "10.00".into(),
                currency: "USD".into(),
                status: "AUTHORIZED".into(),
                psp_transaction_id: None,
                fraud_score: None,
                three_ds_status: None,
            },
        )
    }

    #[test]
    fn same_key_always_lands_on_same_partition() {
        let bus = EventBus::new();
        for i in 0..5 {
            bus.publish(TOPIC_PAYMENT_EVENTS, "pay_a", &envelope("pay_a", &format!("E{i}")))
                .unwrap();
        }
        let events = bus.events_for_key(TOPIC_PAYMENT_EVENTS, "pay_a");
        assert_eq!(events.len(), 5);
        let partitions: HashSet<u32> = events.iter().map(|e| e.partition).collect();
        assert_eq!(partitions.len(), 1);
        // Offsets (and hence observed order) follow publication order.
        let types: Vec<_> = events.iter().map(|e| e.envelope.event_type.clone()).collect();
        assert_eq!(types, vec!["E0", "E1", "E2", "E3", "E4"]);
    }

    #[test]
    fn duplicate_event_id_is_not_reappended() {
        let bus = EventBus::new();
        let env = envelope("pay_b", "PAYMENT_AUTHORIZED");
        bus.publish(TOPIC_PAYMENT_EVENTS, "pay_b", &env).unwrap();
        bus.publish(TOPIC_PAYMENT_EVENTS, "pay_b", &env).unwrap();
        assert_eq!(bus.events_for_key(TOPIC_PAYMENT_EVENTS, "pay_b").len(), 1);
    }

    #[test]
    fn invalid_envelope_is_rejected_before_publication() {
        let bus = EventBus::new();
        let mut env = envelope("pay_c", "PAYMENT_AUTHORIZED");
        env.payload.currency = "dollars".into();
        let err = bus.publish(TOPIC_PAYMENT_EVENTS, "pay_c", &env).unwrap_err();
        assert!(matches!(err, GatewayError::SchemaViolation(_)));
        assert!(bus.events_for_key(TOPIC_PAYMENT_EVENTS, "pay_c").is_empty());
    }

    #[test]
    fn unavailable_bus_fails_retryably() {
        let bus = EventBus::new();
        bus.set_available(false);
        let err = bus
            .publish(TOPIC_PAYMENT_EVENTS, "pay_d", &envelope("pay_d", "X"))
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn subscriber_receives_backlog_then_live_events() {
        let bus = EventBus::with_partitions(1);
        bus.publish(TOPIC_PAYMENT_EVENTS, "pay_e", &envelope("pay_e", "BACKLOG")).unwrap();

        let mut receivers = bus.subscribe(TOPIC_PAYMENT_EVENTS, "grp").unwrap();
        bus.publish(TOPIC_PAYMENT_EVENTS, "pay_e", &envelope("pay_e", "LIVE")).unwrap();

        let first = receivers[0].recv().await.unwrap();
        let second = receivers[0].recv().await.unwrap();
        assert_eq!(first.envelope.event_type, "BACKLOG");
        assert_eq!(second.envelope.event_type, "LIVE");
    }
}
