use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use acquira_core::constants::{
    WEBHOOK_BASE_DELAY_SECS, WEBHOOK_CALL_TIMEOUT_SECS, WEBHOOK_MAX_ATTEMPTS,
    WEBHOOK_MAX_DELAY_SECS, WEBHOOK_SCHEDULER_TICK_SECS,
};
use acquira_core::error::GatewayError;
use acquira_core::records::{Merchant, WebhookDelivery, WebhookStatus};
use acquira_core::types::{now_ts, PaymentId, Timestamp};
use acquira_store::GatewayDb;

use crate::signature::sign_payload;

// ── Transport seam ───────────────────────────────────────────────────────────

/// One POST to a merchant endpoint. Separated from the service so tests can
/// script endpoint behavior without a live HTTP listener.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(
        &self,
        url: &str,
        body: &str,
        headers: &[(&str, String)],
    ) -> Result<(u16, String), String>;
}

/// reqwest-backed production transport.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(WEBHOOK_CALL_TIMEOUT_SECS))
            .build()
            .expect("reqwest client");
        Self { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        body: &str,
        headers: &[(&str, String)],
    ) -> Result<(u16, String), String> {
        let mut req = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .body(body.to_string());
        for (name, value) in headers {
            req = req.header(*name, value.as_str());
        }
        let resp = req.send().await.map_err(|e| e.to_string())?;
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Ok((status, body))
    }
}

// ── Delivery service ─────────────────────────────────────────────────────────

/// Signs, posts and retries merchant webhooks. Every attempt and final state
/// is persisted on the delivery row.
pub struct WebhookDeliveryService {
    db: Arc<GatewayDb>,
    transport: Arc<dyn WebhookTransport>,
}

impl WebhookDeliveryService {
    pub fn new(db: Arc<GatewayDb>, transport: Arc<dyn WebhookTransport>) -> Self {
        Self { db, transport }
    }

    /// Create a pending delivery for a merchant with a configured endpoint.
    /// Returns `None` when the merchant has no webhook URL.
    pub fn enqueue(
        &self,
        merchant: &Merchant,
        payment_id: &PaymentId,
        event_type: &str,
        payload_json: &str,
    ) -> Result<Option<WebhookDelivery>, GatewayError> {
        let (Some(url), Some(secret)) = (&merchant.webhook_url, &merchant.webhook_secret) else {
            return Ok(None);
        };
        let delivery = WebhookDelivery::new(
            merchant.id.clone(),
            payment_id.clone(),
            event_type.to_string(),
            url.clone(),
            payload_json.to_string(),
            sign_payload(secret, payload_json),
            WEBHOOK_MAX_ATTEMPTS,
            now_ts(),
        );
        self.db.put_delivery(&delivery)?;
        debug!(delivery_id = %delivery.id, merchant = %merchant.id, event_type, "webhook enqueued");
        Ok(Some(delivery))
    }

    /// Make one delivery attempt and persist the outcome. Success is any
    /// 2xx; anything else schedules the next retry or finalizes as FAILED.
    pub async fn attempt(&self, delivery: &mut WebhookDelivery) -> Result<(), GatewayError> {
        if delivery.status.is_terminal() {
            return Ok(());
        }
        delivery.attempt_count += 1;
        let headers = [
            ("X-Webhook-Signature", delivery.signature.clone()),
            ("X-Webhook-Event-Type", delivery.event_type.clone()),
            ("X-Webhook-Delivery-Id", delivery.id.clone()),
            ("X-Webhook-Attempt", delivery.attempt_count.to_string()),
        ];

        match self.transport.post(&delivery.url, &delivery.payload, &headers).await {
            Ok((status, body)) if (200..300).contains(&status) => {
                delivery.status = WebhookStatus::Delivered;
                delivery.http_status = Some(status);
                delivery.response_body = Some(truncate(&body));
                delivery.error_message = None;
                delivery.next_retry_at = None;
                delivery.delivered_at = Some(now_ts());
                info!(delivery_id = %delivery.id, status, "webhook delivered");
            }
            Ok((status, body)) => {
                delivery.http_status = Some(status);
                delivery.response_body = Some(truncate(&body));
                self.schedule_retry(delivery, &format!("endpoint returned {status}"));
            }
            Err(e) => {
                delivery.http_status = None;
                delivery.response_body = None;
                self.schedule_retry(delivery, &e);
            }
        }
        self.db.put_delivery(delivery)
    }

    /// Attempt every due pending delivery once. Returns how many were tried.
    pub async fn drain_due(&self, now: Timestamp) -> Result<usize, GatewayError> {
        let due = self.db.due_deliveries(now)?;
        let tried = due.len();
        for mut delivery in due {
            self.attempt(&mut delivery).await?;
        }
        Ok(tried)
    }

    /// Background retry loop at the configured cadence; exits on shutdown.
    pub async fn run_scheduler(&self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_secs(WEBHOOK_SCHEDULER_TICK_SECS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!("webhook retry scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {
                    match self.drain_due(now_ts()).await {
                        Ok(0) => {}
                        Ok(n) => debug!(count = n, "webhook retries drained"),
                        Err(e) => warn!(error = %e, "webhook drain failed"),
                    }
                }
            }
        }
        info!("webhook retry scheduler stopped");
    }

    /// `60 * 2^(attempt-1)` seconds, capped at one hour, up to max attempts.
    fn schedule_retry(&self, delivery: &mut WebhookDelivery, error: &str) {
        delivery.error_message = Some(error.to_string());
        if delivery.attempt_count >= delivery.max_attempts {
            delivery.status = WebhookStatus::Failed;
            delivery.next_retry_at = None;
            warn!(
                delivery_id = %delivery.id,
                attempts = delivery.attempt_count,
                error,
                "webhook delivery failed permanently"
            );
            return;
        }
        let exp = delivery.attempt_count.saturating_sub(1).min(16);
        let delay = (WEBHOOK_BASE_DELAY_SECS << exp).min(WEBHOOK_MAX_DELAY_SECS);
        delivery.next_retry_at = Some(now_ts() + delay);
        debug!(
            delivery_id = %delivery.id,
            attempt = delivery.attempt_count,
            retry_in_secs = delay,
            "webhook retry scheduled"
        );
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(1024).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use acquira_core::types::MerchantId;

    /// Scripted endpoint: pops one (status, body) or error per call.
    struct ScriptedTransport {
        outcomes: Mutex<VecDeque<Result<(u16, String), String>>>,
        calls: Mutex<Vec<Vec<(String, String)>>>,
    }

    impl ScriptedTransport {
        fn new(outcomes: Vec<Result<(u16, String), String>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl WebhookTransport for ScriptedTransport {
        async fn post(
            &self,
            _url: &str,
            _body: &str,
            headers: &[(&str, String)],
        ) -> Result<(u16, String), String> {
            self.calls.lock().unwrap().push(
                headers.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            );
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok((200, String::new())))
        }
    }

    fn merchant() -> Merchant {
        Merchant {
            id: MerchantId::new("mer_1"),
            name: "Test Shop".into(),
            api_key_hash: "x".into(),
            webhook_url: Some("https://shop.example/webhooks".into()),
            webhook_secret: Some("whsec_abc".into()),
            psp_priority: vec!["stripe".into()],
            created_at: 0,
        }
    }

    fn service(outcomes: Vec<Result<(u16, String), String>>) -> (WebhookDeliveryService, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new(outcomes));
        let db = Arc::new(GatewayDb::open_temporary().unwrap());
        (WebhookDeliveryService::new(db, Arc::clone(&transport) as Arc<dyn WebhookTransport>), transport)
    }

    #[tokio::test]
    async fn successful_delivery_is_terminal_and_signed() {
        let (svc, transport) = service(vec![Ok((200, "ok".into()))]);
        let mut delivery = svc
            .enqueue(&merchant(), &PaymentId::generate(), "PAYMENT_AUTHORIZED", r#"{"a":1}"#)
            .unwrap()
            .unwrap();
        svc.attempt(&mut delivery).await.unwrap();

        assert_eq!(delivery.status, WebhookStatus::Delivered);
        assert_eq!(delivery.http_status, Some(200));
        assert!(delivery.delivered_at.is_some());

        // Signature header verifies against the merchant secret.
        let calls = transport.calls.lock().unwrap();
        let headers = &calls[0];
        let sig = &headers.iter().find(|(k, _)| k == "X-Webhook-Signature").unwrap().1;
        assert!(crate::signature::verify_signature("whsec_abc", r#"{"a":1}"#, sig));
        assert!(headers.iter().any(|(k, v)| k == "X-Webhook-Attempt" && v == "1"));
    }

    #[tokio::test]
    async fn failure_schedules_exponential_backoff() {
        let (svc, _) = service(vec![
            Ok((500, "boom".into())),
            Err("connect refused".into()),
        ]);
        let mut delivery = svc
            .enqueue(&merchant(), &PaymentId::generate(), "PAYMENT_AUTHORIZED", "{}")
            .unwrap()
            .unwrap();

        svc.attempt(&mut delivery).await.unwrap();
        assert_eq!(delivery.status, WebhookStatus::Pending);
        let first_retry = delivery.next_retry_at.unwrap();
        assert!((59..=61).contains(&(first_retry - now_ts())));

        svc.attempt(&mut delivery).await.unwrap();
        let second_retry = delivery.next_retry_at.unwrap();
        assert!((119..=121).contains(&(second_retry - now_ts())));
        assert_eq!(delivery.error_message.as_deref(), Some("connect refused"));
    }

    #[tokio::test]
    async fn exhausted_attempts_finalize_as_failed() {
        let outcomes = (0..WEBHOOK_MAX_ATTEMPTS).map(|_| Ok((503, String::new()))).collect();
        let (svc, _) = service(outcomes);
        let mut delivery = svc
            .enqueue(&merchant(), &PaymentId::generate(), "PAYMENT_AUTHORIZED", "{}")
            .unwrap()
            .unwrap();

        for _ in 0..WEBHOOK_MAX_ATTEMPTS {
            svc.attempt(&mut delivery).await.unwrap();
        }
        assert_eq!(delivery.status, WebhookStatus::Failed);
        assert_eq!(delivery.attempt_count, WEBHOOK_MAX_ATTEMPTS);
        assert!(delivery.next_retry_at.is_none());

        // A further attempt on a terminal delivery is a no-op.
        svc.attempt(&mut delivery).await.unwrap();
        assert_eq!(delivery.attempt_count, WEBHOOK_MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn merchant_without_endpoint_enqueues_nothing() {
        let (svc, _) = service(vec![]);
        let mut m = merchant();
        m.webhook_url = None;
        let delivery = svc.enqueue(&m, &PaymentId::generate(), "X", "{}").unwrap();
        assert!(delivery.is_none());
    }

    #[tokio::test]
    async fn drain_processes_only_due_deliveries() {
        let (svc, _) = service(vec![Ok((200, String::new()))]);
        let mut delivery = svc
            .enqueue(&merchant(), &PaymentId::generate(), "PAYMENT_AUTHORIZED", "{}")
            .unwrap()
            .unwrap();
        // Push the retry into the future; nothing is due.
        delivery.next_retry_at = Some(now_ts() + 600);
        svc.db.put_delivery(&delivery).unwrap();
        assert_eq!(svc.drain_due(now_ts()).await.unwrap(), 0);

        // Once due, the drain delivers it.
        delivery.next_retry_at = Some(now_ts() - 1);
        svc.db.put_delivery(&delivery).unwrap();
        assert_eq!(svc.drain_due(now_ts()).await.unwrap(), 1);
        let stored = svc.db.get_delivery(&delivery.id).unwrap().unwrap();
        assert_eq!(stored.status, WebhookStatus::Delivered);
    }
}
