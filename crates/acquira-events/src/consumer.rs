use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use acquira_core::constants::{EVENT_MAX_PROCESS_FAILURES, EVENT_PROCESSED_TTL_SECS};
use acquira_core::error::GatewayError;
use acquira_core::types::now_ts;
use acquira_store::GatewayDb;

use crate::bus::{EventBus, StoredEvent, TOPIC_PAYMENT_EVENTS_DLQ};
use crate::message::EventEnvelope;

/// What a consumer group does with each event. Handlers must be idempotent
/// at the business level; the pipeline already deduplicates event ids.
pub trait EventHandler: Send + Sync {
    fn handle(&self, envelope: &EventEnvelope) -> Result<(), GatewayError>;
}

impl<F> EventHandler for F
where
    F: Fn(&EventEnvelope) -> Result<(), GatewayError> + Send + Sync,
{
    fn handle(&self, envelope: &EventEnvelope) -> Result<(), GatewayError> {
        self(envelope)
    }
}

/// Spawn one worker per partition for `group` on `topic`.
///
/// Per record: check the `processed:{group}:{event_id}` marker — if present,
/// skip and ack; otherwise process, set the marker with TTL, ack. A record
/// failing [`EVENT_MAX_PROCESS_FAILURES`] times is forwarded to the event
/// DLQ topic. Workers drain the in-flight record before honoring shutdown.
pub fn spawn_consumer(
    bus: Arc<EventBus>,
    topic: &str,
    group: &str,
    db: Arc<GatewayDb>,
    handler: Arc<dyn EventHandler>,
    shutdown: watch::Receiver<bool>,
) -> Result<Vec<JoinHandle<()>>, GatewayError> {
    let receivers = bus.subscribe(topic, group)?;
    let mut handles = Vec::with_capacity(receivers.len());

    for (partition, mut rx) in receivers.into_iter().enumerate() {
        let bus = Arc::clone(&bus);
        let db = Arc::clone(&db);
        let handler = Arc::clone(&handler);
        let group = group.to_string();
        let mut shutdown = shutdown.clone();

        handles.push(tokio::spawn(async move {
            info!(group = %group, partition, "consumer worker started");
            loop {
                let stored = tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    stored = rx.recv() => match stored {
                        Some(s) => s,
                        None => break,
                    },
                };
                process_one(&bus, &db, handler.as_ref(), &group, &stored);
            }
            info!(group = %group, partition, "consumer worker stopped");
        }));
    }
    Ok(handles)
}

fn process_one(
    bus: &EventBus,
    db: &GatewayDb,
    handler: &dyn EventHandler,
    group: &str,
    stored: &StoredEvent,
) {
    let marker = format!("processed:{group}:{}", stored.envelope.event_id);
    let now = now_ts();

    match db.is_processed(&marker, now) {
        Ok(true) => {
            debug!(event_id = %stored.envelope.event_id, group, "duplicate event skipped");
            return;
        }
        Ok(false) => {}
        Err(e) => {
            error!(error = %e, "processed-marker read failed; skipping record");
            return;
        }
    }

    let mut failures = 0;
    loop {
        match handler.handle(&stored.envelope) {
            Ok(()) => {
                // Marker write is the ack: a replayed delivery after this
                // point is skipped above.
                if let Err(e) = db.mark_processed(&marker, now + EVENT_PROCESSED_TTL_SECS, now) {
                    error!(error = %e, "failed to mark event processed");
                }
                return;
            }
            Err(e) => {
                failures += 1;
                warn!(
                    event_id = %stored.envelope.event_id,
                    group,
                    failures,
                    error = %e,
                    "event processing failed"
                );
                if failures >= EVENT_MAX_PROCESS_FAILURES {
                    if let Err(e) =
                        bus.publish(TOPIC_PAYMENT_EVENTS_DLQ, &stored.key, &stored.envelope)
                    {
                        error!(error = %e, "failed to dead-letter event");
                    }
                    // Ack the poisoned record so the partition keeps moving.
                    let _ = db.mark_processed(&marker, now + EVENT_PROCESSED_TTL_SECS, now);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use crate::bus::TOPIC_PAYMENT_EVENTS;
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

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn events_are_processed_once_per_group() {
        let bus = Arc::new(EventBus::with_partitions(1));
        let db = Arc::new(GatewayDb::open_temporary().unwrap());
        let seen = Arc::new(AtomicU32::new(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let seen_in_handler = Arc::clone(&seen);
        let handler: Arc<dyn EventHandler> = Arc::new(move |_env: &EventEnvelope| {
            seen_in_handler.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let handles = spawn_consumer(
            Arc::clone(&bus), TOPIC_PAYMENT_EVENTS, "grp", Arc::clone(&db), handler, shutdown_rx,
        )
        .unwrap();

        let env = envelope("pay_a", "PAYMENT_AUTHORIZED");
        bus.publish(TOPIC_PAYMENT_EVENTS, "pay_a", &env).unwrap();
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        // A second subscription replaying the log must skip the processed id.
        let (shutdown_tx2, shutdown_rx2) = watch::channel(false);
        let seen_in_replay = Arc::clone(&seen);
        let replay_handler: Arc<dyn EventHandler> = Arc::new(move |_env: &EventEnvelope| {
            seen_in_replay.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let replay = spawn_consumer(
            Arc::clone(&bus), TOPIC_PAYMENT_EVENTS, "grp", Arc::clone(&db), replay_handler,
            shutdown_rx2,
        )
        .unwrap();
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1, "duplicate delivery must be skipped");

        let _ = shutdown_tx.send(true);
        let _ = shutdown_tx2.send(true);
        for h in handles.into_iter().chain(replay) {
            let _ = h.await;
        }
    }

    #[tokio::test]
    async fn per_key_order_is_preserved() {
        let bus = Arc::new(EventBus::new());
        let db = Arc::new(GatewayDb::open_temporary().unwrap());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let order_in_handler = Arc::clone(&order);
        let handler: Arc<dyn EventHandler> = Arc::new(move |env: &EventEnvelope| {
            order_in_handler.lock().unwrap().push(env.event_type.clone());
            Ok(())
        });
        let handles = spawn_consumer(
            Arc::clone(&bus), TOPIC_PAYMENT_EVENTS, "grp", db, handler, shutdown_rx,
        )
        .unwrap();

        for t in ["CREATED", "AUTHORIZED", "CAPTURED", "REFUNDED"] {
            bus.publish(TOPIC_PAYMENT_EVENTS, "pay_ordered", &envelope("pay_ordered", t)).unwrap();
        }
        settle().await;

        assert_eq!(
            *order.lock().unwrap(),
            vec!["CREATED", "AUTHORIZED", "CAPTURED", "REFUNDED"]
        );
        let _ = shutdown_tx.send(true);
        for h in handles {
            let _ = h.await;
        }
    }

    #[tokio::test]
    async fn poisoned_event_lands_in_dlq() {
        let bus = Arc::new(EventBus::with_partitions(1));
        let db = Arc::new(GatewayDb::open_temporary().unwrap());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handler: Arc<dyn EventHandler> = Arc::new(|_env: &EventEnvelope| {
            Err(GatewayError::Internal("handler bug".into()))
        });
        let handles = spawn_consumer(
            Arc::clone(&bus), TOPIC_PAYMENT_EVENTS, "grp", db, handler, shutdown_rx,
        )
        .unwrap();

        bus.publish(TOPIC_PAYMENT_EVENTS, "pay_poison", &envelope("pay_poison", "X")).unwrap();
        settle().await;

        let dlq = bus.events_for_key(TOPIC_PAYMENT_EVENTS_DLQ, "pay_poison");
        assert_eq!(dlq.len(), 1);
        let _ = shutdown_tx.send(true);
        for h in handles {
            let _ = h.await;
        }
    }
}
