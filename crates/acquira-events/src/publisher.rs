use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use acquira_core::error::GatewayError;
use acquira_degrade::{DegradationController, Dependency};

use crate::bus::{EventBus, TOPIC_PAYMENT_EVENTS};
use crate::message::EventEnvelope;

/// Where a publish attempt ended up. Only `Published` gates downstream
/// effects (webhook enqueue); `Buffered` means the bus was down and the
/// envelope is parked with the degradation controller.
#[derive(Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    Buffered,
}

/// Idempotent producer with bounded retries and degradation buffering.
pub struct EventPublisher {
    bus: Arc<EventBus>,
    degrade: Arc<DegradationController>,
    publish_attempts: u32,
}

impl EventPublisher {
    pub fn new(bus: Arc<EventBus>, degrade: Arc<DegradationController>) -> Self {
        Self { bus, degrade, publish_attempts: 3 }
    }

    /// Publish to `payment-events`, keyed by payment id. Transient broker
    /// errors are retried; persistent unavailability buffers the event and
    /// marks the bus degraded.
    pub async fn publish(
        &self,
        key: &str,
        envelope: &EventEnvelope,
    ) -> Result<PublishOutcome, GatewayError> {
        let mut last_err = None;
        for attempt in 1..=self.publish_attempts {
            match self.bus.publish(TOPIC_PAYMENT_EVENTS, key, envelope) {
                Ok(()) => {
                    self.degrade.mark_healthy(Dependency::EventBus);
                    debug!(event_id = %envelope.event_id, key, "event published");
                    return Ok(PublishOutcome::Published);
                }
                Err(e) if e.is_retryable() => {
                    last_err = Some(e);
                    if attempt < self.publish_attempts {
                        tokio::time::sleep(Duration::from_millis(10 * attempt as u64)).await;
                    }
                }
                // Schema violations and the like are the caller's bug.
                Err(e) => return Err(e),
            }
        }

        let err = last_err.unwrap_or(GatewayError::BrokerUnavailable);
        warn!(event_id = %envelope.event_id, error = %err, "event bus down; buffering event");
        self.degrade.mark_degraded(Dependency::EventBus, &err.to_string());
        self.degrade
            .buffer_for_event_bus(TOPIC_PAYMENT_EVENTS, key, &envelope.to_json()?);
        Ok(PublishOutcome::Buffered)
    }

    /// Replay everything the controller buffered. Events that still cannot
    /// be published go back into the buffer. Returns how many made it out.
    pub async fn drain_buffered(&self) -> usize {
        let parked = self.degrade.drain_buffered();
        if parked.is_empty() {
            return 0;
        }
        let mut drained = 0;
        for event in parked {
            let envelope = match EventEnvelope::from_json(&event.payload) {
                Ok(env) => env,
                Err(e) => {
                    warn!(error = %e, "dropping undecodable buffered event");
                    continue;
                }
            };
            match self.bus.publish(&event.topic, &event.key, &envelope) {
                Ok(()) => drained += 1,
                Err(_) => {
                    self.degrade.buffer_for_event_bus(&event.topic, &event.key, &event.payload);
                }
            }
        }
        if drained > 0 {
            self.degrade.mark_healthy(Dependency::EventBus);
            debug!(drained, "buffered events replayed onto the bus");
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::EventPayload;

    fn envelope(payment_id: &str) -> EventEnvelope {
        EventEnvelope::new(
            "PAYMENT_AUTHORIZED",
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

    #[tokio::test]
    async fn publishes_when_bus_is_healthy() {
        let bus = Arc::new(EventBus::new());
        let publisher = EventPublisher::new(Arc::clone(&bus), Arc::new(DegradationController::new()));
        let outcome = publisher.publish("pay_a", &envelope("pay_a")).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Published);
        assert_eq!(bus.events_for_key(TOPIC_PAYMENT_EVENTS, "pay_a").len(), 1);
    }

    #[tokio::test]
    async fn outage_buffers_and_drain_replays() {
        let bus = Arc::new(EventBus::new());
        let degrade = Arc::new(DegradationController::new());
        let publisher = EventPublisher::new(Arc::clone(&bus), Arc::clone(&degrade));

        bus.set_available(false);
        let outcome = publisher.publish("pay_b", &envelope("pay_b")).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Buffered);
        assert!(degrade.is_degraded(Dependency::EventBus));
        assert_eq!(degrade.buffered_len(), 1);

        bus.set_available(true);
        assert_eq!(publisher.drain_buffered().await, 1);
        assert_eq!(degrade.buffered_len(), 0);
        assert!(!degrade.is_degraded(Dependency::EventBus));
        assert_eq!(bus.events_for_key(TOPIC_PAYMENT_EVENTS, "pay_b").len(), 1);
    }

    #[tokio::test]
    async fn drain_requeues_when_bus_still_down() {
        let bus = Arc::new(EventBus::new());
        let degrade = Arc::new(DegradationController::new());
        let publisher = EventPublisher::new(Arc::clone(&bus), Arc::clone(&degrade));

        bus.set_available(false);
        publisher.publish("pay_c", &envelope("pay_c")).await.unwrap();
        assert_eq!(publisher.drain_buffered().await, 0);
        assert_eq!(degrade.buffered_len(), 1);
    }
}
