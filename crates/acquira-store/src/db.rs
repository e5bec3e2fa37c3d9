use std::path::Path;

use acquira_core::error::GatewayError;
use acquira_core::event::PaymentEvent;
use acquira_core::payment::{Payment, Refund};
use acquira_core::records::{
    CardTokenRecord, FraudAlert, IdempotencyEntry, Merchant, RetryTask, WebhookDelivery,
    WebhookStatus,
};
use acquira_core::types::{MerchantId, PaymentId, Timestamp};

/// Persistent gateway state backed by sled (pure-Rust, no C dependencies).
///
/// Named trees:
///   payments           — payment id utf8       → bincode(Payment)
///   payment_events     — payment id + seq be   → bincode(PaymentEvent)
///   refunds            — payment id + refund id→ bincode(Refund)
///   card_tokens        — token value utf8      → bincode(CardTokenRecord)
///   token_hash_index   — pan hash hex utf8     → token value bytes
///   merchants          — merchant id utf8      → bincode(Merchant)
///   idempotency        — key utf8              → bincode(IdempotencyEntry)
///   dlq                — transaction id utf8   → bincode(RetryTask)
///   webhook_deliveries — delivery id utf8      → bincode(WebhookDelivery)
///   processed          — marker key utf8       → expires_at i64 be
///   fraud_alerts       — payment id utf8       → bincode(FraudAlert)
///   meta               — utf8 key bytes        → raw bytes
pub struct GatewayDb {
    db: sled::Db,
    payments: sled::Tree,
    payment_events: sled::Tree,
    refunds: sled::Tree,
    card_tokens: sled::Tree,
    token_hash_index: sled::Tree,
    merchants: sled::Tree,
    idempotency: sled::Tree,
    dlq: sled::Tree,
    webhook_deliveries: sled::Tree,
    processed: sled::Tree,
    fraud_alerts: sled::Tree,
}

fn storage_err(e: impl std::fmt::Display) -> GatewayError {
    GatewayError::Storage(e.to_string())
}

fn ser_err(e: impl std::fmt::Display) -> GatewayError {
    GatewayError::Serialization(e.to_string())
}

impl GatewayDb {
    /// Open or create the gateway database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, GatewayError> {
        let db = sled::open(path).map_err(storage_err)?;
        let payments           = db.open_tree("payments").map_err(storage_err)?;
        let payment_events     = db.open_tree("payment_events").map_err(storage_err)?;
        let refunds            = db.open_tree("refunds").map_err(storage_err)?;
        let card_tokens        = db.open_tree("card_tokens").map_err(storage_err)?;
        let token_hash_index   = db.open_tree("token_hash_index").map_err(storage_err)?;
        let merchants          = db.open_tree("merchants").map_err(storage_err)?;
        let idempotency        = db.open_tree("idempotency").map_err(storage_err)?;
        let dlq                = db.open_tree("dlq").map_err(storage_err)?;
        let webhook_deliveries = db.open_tree("webhook_deliveries").map_err(storage_err)?;
        let processed          = db.open_tree("processed").map_err(storage_err)?;
        let fraud_alerts       = db.open_tree("fraud_alerts").map_err(storage_err)?;
        Ok(Self { db, payments, payment_events, refunds, card_tokens, token_hash_index,
                  merchants, idempotency, dlq, webhook_deliveries, processed, fraud_alerts })
    }

    /// Ephemeral in-memory database for tests.
    pub fn open_temporary() -> Result<Self, GatewayError> {
        let db = sled::Config::new().temporary(true).open().map_err(storage_err)?;
        let payments           = db.open_tree("payments").map_err(storage_err)?;
        let payment_events     = db.open_tree("payment_events").map_err(storage_err)?;
        let refunds            = db.open_tree("refunds").map_err(storage_err)?;
        let card_tokens        = db.open_tree("card_tokens").map_err(storage_err)?;
        let token_hash_index   = db.open_tree("token_hash_index").map_err(storage_err)?;
        let merchants          = db.open_tree("merchants").map_err(storage_err)?;
        let idempotency        = db.open_tree("idempotency").map_err(storage_err)?;
        let dlq                = db.open_tree("dlq").map_err(storage_err)?;
        let webhook_deliveries = db.open_tree("webhook_deliveries").map_err(storage_err)?;
        let processed          = db.open_tree("processed").map_err(storage_err)?;
        let fraud_alerts       = db.open_tree("fraud_alerts").map_err(storage_err)?;
        Ok(Self { db, payments, payment_events, refunds, card_tokens, token_hash_index,
                  merchants, idempotency, dlq, webhook_deliveries, processed, fraud_alerts })
    }

    // ── Payments ─────────────────────────────────────────────────────────────

    pub fn get_payment(&self, id: &PaymentId) -> Result<Option<Payment>, GatewayError> {
        match self.payments.get(id.as_str()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(ser_err)?)),
            None => Ok(None),
        }
    }

    pub fn put_payment(&self, payment: &Payment) -> Result<(), GatewayError> {
        let bytes = bincode::serialize(payment).map_err(ser_err)?;
        self.payments.insert(payment.id.as_str(), bytes).map_err(storage_err)?;
        Ok(())
    }

    /// Payments for one merchant, newest first, paged.
    pub fn list_payments(
        &self,
        merchant_id: &MerchantId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Payment>, GatewayError> {
        let mut all = Vec::new();
        for item in self.payments.iter() {
            let (_, bytes) = item.map_err(storage_err)?;
            let p: Payment = bincode::deserialize(&bytes).map_err(ser_err)?;
            if p.merchant_id == *merchant_id {
                all.push(p);
            }
        }
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all.into_iter().skip(offset).take(limit).collect())
    }

    pub fn count_payments(&self) -> u64 {
        self.payments.len() as u64
    }

    // ── Payment events (append-only) ─────────────────────────────────────────

    /// Append one audit event. The key embeds a monotonic sequence so a
    /// prefix scan returns events in append order.
    pub fn append_payment_event(&self, event: &PaymentEvent) -> Result<(), GatewayError> {
        let seq = self.db.generate_id().map_err(storage_err)?;
        let mut key = event.payment_id.as_str().as_bytes().to_vec();
        key.push(b'/');
        key.extend_from_slice(&seq.to_be_bytes());
        let bytes = bincode::serialize(event).map_err(ser_err)?;
        self.payment_events.insert(key, bytes).map_err(storage_err)?;
        Ok(())
    }

    /// All audit events for a payment, in append order.
    pub fn payment_events(&self, id: &PaymentId) -> Result<Vec<PaymentEvent>, GatewayError> {
        let mut prefix = id.as_str().as_bytes().to_vec();
        prefix.push(b'/');
        let mut out = Vec::new();
        for item in self.payment_events.scan_prefix(&prefix) {
            let (_, bytes) = item.map_err(storage_err)?;
            out.push(bincode::deserialize(&bytes).map_err(ser_err)?);
        }
        Ok(out)
    }

    // ── Refunds ──────────────────────────────────────────────────────────────

    pub fn put_refund(&self, refund: &Refund) -> Result<(), GatewayError> {
        let mut key = refund.payment_id.as_str().as_bytes().to_vec();
        key.push(b'/');
        key.extend_from_slice(refund.id.as_bytes());
        let bytes = bincode::serialize(refund).map_err(ser_err)?;
        self.refunds.insert(key, bytes).map_err(storage_err)?;
        Ok(())
    }

    pub fn refunds_for_payment(&self, id: &PaymentId) -> Result<Vec<Refund>, GatewayError> {
        let mut prefix = id.as_str().as_bytes().to_vec();
        prefix.push(b'/');
        let mut out = Vec::new();
        for item in self.refunds.scan_prefix(&prefix) {
            let (_, bytes) = item.map_err(storage_err)?;
            out.push(bincode::deserialize(&bytes).map_err(ser_err)?);
        }
        Ok(out)
    }

    // ── Card tokens ──────────────────────────────────────────────────────────

    pub fn get_token(&self, token: &str) -> Result<Option<CardTokenRecord>, GatewayError> {
        match self.card_tokens.get(token).map_err(storage_err)? {
            // Empty value = reservation marker from an interrupted tokenize.
            Some(bytes) if bytes.is_empty() => Ok(None),
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(ser_err)?)),
            None => Ok(None),
        }
    }

    pub fn put_token(&self, record: &CardTokenRecord) -> Result<(), GatewayError> {
        let bytes = bincode::serialize(record).map_err(ser_err)?;
        self.card_tokens.insert(record.token.as_str(), bytes).map_err(storage_err)?;
        self.token_hash_index
            .insert(record.pan_hash.as_str(), record.token.as_bytes())
            .map_err(storage_err)?;
        Ok(())
    }

    /// Reserve a token value if unused. Returns false when the value is
    /// already taken (collision; caller regenerates).
    pub fn reserve_token(&self, token: &str) -> Result<bool, GatewayError> {
        let outcome = self
            .card_tokens
            .compare_and_swap(token, None as Option<&[u8]>, Some(b"".as_ref()))
            .map_err(storage_err)?;
        Ok(outcome.is_ok())
    }

    pub fn find_token_by_hash(&self, pan_hash: &str) -> Result<Option<CardTokenRecord>, GatewayError> {
        match self.token_hash_index.get(pan_hash).map_err(storage_err)? {
            Some(token_bytes) => {
                let token = String::from_utf8(token_bytes.to_vec())
                    .map_err(|_| GatewayError::Storage("corrupt token index".into()))?;
                self.get_token(&token)
            }
            None => Ok(None),
        }
    }

    // ── Merchants ────────────────────────────────────────────────────────────

    pub fn get_merchant(&self, id: &MerchantId) -> Result<Option<Merchant>, GatewayError> {
        match self.merchants.get(id.as_str()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(ser_err)?)),
            None => Ok(None),
        }
    }

    pub fn put_merchant(&self, merchant: &Merchant) -> Result<(), GatewayError> {
        let bytes = bincode::serialize(merchant).map_err(ser_err)?;
        self.merchants.insert(merchant.id.as_str(), bytes).map_err(storage_err)?;
        Ok(())
    }

    // ── Idempotency ──────────────────────────────────────────────────────────

    pub fn get_idempotency(&self, key: &str) -> Result<Option<IdempotencyEntry>, GatewayError> {
        match self.idempotency.get(key).map_err(storage_err)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(ser_err)?)),
            None => Ok(None),
        }
    }

    pub fn put_idempotency(&self, entry: &IdempotencyEntry) -> Result<(), GatewayError> {
        let bytes = bincode::serialize(entry).map_err(ser_err)?;
        self.idempotency.insert(entry.key.as_str(), bytes).map_err(storage_err)?;
        Ok(())
    }

    /// Atomic set-if-matches on an idempotency row: the foundation of the
    /// distributed lock. `expected == None` means "only if absent".
    pub fn cas_idempotency(
        &self,
        key: &str,
        expected: Option<&IdempotencyEntry>,
        new: &IdempotencyEntry,
    ) -> Result<bool, GatewayError> {
        let expected_bytes = expected
            .map(|e| bincode::serialize(e).map_err(ser_err))
            .transpose()?;
        let new_bytes = bincode::serialize(new).map_err(ser_err)?;
        let outcome = self
            .idempotency
            .compare_and_swap(key, expected_bytes, Some(new_bytes))
            .map_err(storage_err)?;
        Ok(outcome.is_ok())
    }

    pub fn remove_idempotency(&self, key: &str) -> Result<(), GatewayError> {
        self.idempotency.remove(key).map_err(storage_err)?;
        Ok(())
    }

    // ── Dead-letter queue ────────────────────────────────────────────────────

    pub fn push_dead_letter(&self, task: &RetryTask) -> Result<(), GatewayError> {
        let bytes = bincode::serialize(task).map_err(ser_err)?;
        self.dlq.insert(task.transaction_id.as_str(), bytes).map_err(storage_err)?;
        Ok(())
    }

    pub fn get_dead_letter(&self, transaction_id: &str) -> Result<Option<RetryTask>, GatewayError> {
        match self.dlq.get(transaction_id).map_err(storage_err)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(ser_err)?)),
            None => Ok(None),
        }
    }

    pub fn dead_letters(&self, limit: usize) -> Result<Vec<RetryTask>, GatewayError> {
        let mut out = Vec::new();
        for item in self.dlq.iter() {
            let (_, bytes) = item.map_err(storage_err)?;
            out.push(bincode::deserialize(&bytes).map_err(ser_err)?);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    pub fn count_dead_letters(&self) -> u64 {
        self.dlq.len() as u64
    }

    // ── Webhook deliveries ───────────────────────────────────────────────────

    pub fn get_delivery(&self, id: &str) -> Result<Option<WebhookDelivery>, GatewayError> {
        match self.webhook_deliveries.get(id).map_err(storage_err)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(ser_err)?)),
            None => Ok(None),
        }
    }

    pub fn put_delivery(&self, delivery: &WebhookDelivery) -> Result<(), GatewayError> {
        let bytes = bincode::serialize(delivery).map_err(ser_err)?;
        self.webhook_deliveries.insert(delivery.id.as_str(), bytes).map_err(storage_err)?;
        Ok(())
    }

    /// Pending deliveries whose `next_retry_at` has passed.
    pub fn due_deliveries(&self, now: Timestamp) -> Result<Vec<WebhookDelivery>, GatewayError> {
        let mut out = Vec::new();
        for item in self.webhook_deliveries.iter() {
            let (_, bytes) = item.map_err(storage_err)?;
            let d: WebhookDelivery = bincode::deserialize(&bytes).map_err(ser_err)?;
            if d.status == WebhookStatus::Pending && d.next_retry_at.map(|t| t <= now).unwrap_or(false)
            {
                out.push(d);
            }
        }
        out.sort_by_key(|d| d.next_retry_at);
        Ok(out)
    }

    pub fn deliveries_for_payment(&self, id: &PaymentId) -> Result<Vec<WebhookDelivery>, GatewayError> {
        let mut out = Vec::new();
        for item in self.webhook_deliveries.iter() {
            let (_, bytes) = item.map_err(storage_err)?;
            let d: WebhookDelivery = bincode::deserialize(&bytes).map_err(ser_err)?;
            if d.payment_id == *id {
                out.push(d);
            }
        }
        out.sort_by_key(|d| d.created_at);
        Ok(out)
    }

    // ── Processed markers (consumer idempotency) ─────────────────────────────

    /// Mark `marker` processed until `expires_at`. Returns false if a live
    /// marker already existed (duplicate delivery).
    pub fn mark_processed(&self, marker: &str, expires_at: Timestamp, now: Timestamp) -> Result<bool, GatewayError> {
        let new_bytes = expires_at.to_be_bytes().to_vec();
        loop {
            let current = self.processed.get(marker).map_err(storage_err)?;
            if let Some(bytes) = &current {
                let existing = decode_ts(bytes)?;
                if existing > now {
                    return Ok(false);
                }
            }
            let outcome = self
                .processed
                .compare_and_swap(marker, current, Some(new_bytes.clone()))
                .map_err(storage_err)?;
            if outcome.is_ok() {
                return Ok(true);
            }
            // Raced with another consumer; re-read and retry.
        }
    }

    pub fn is_processed(&self, marker: &str, now: Timestamp) -> Result<bool, GatewayError> {
        match self.processed.get(marker).map_err(storage_err)? {
            Some(bytes) => Ok(decode_ts(&bytes)? > now),
            None => Ok(false),
        }
    }

    // ── Fraud alerts ─────────────────────────────────────────────────────────

    pub fn put_fraud_alert(&self, alert: &FraudAlert) -> Result<(), GatewayError> {
        let bytes = bincode::serialize(alert).map_err(ser_err)?;
        self.fraud_alerts
            .insert(alert.payment_id.as_str(), bytes)
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn get_fraud_alert(&self, id: &PaymentId) -> Result<Option<FraudAlert>, GatewayError> {
        match self.fraud_alerts.get(id.as_str()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(ser_err)?)),
            None => Ok(None),
        }
    }

    pub fn clear_fraud_alert(&self, id: &PaymentId) -> Result<(), GatewayError> {
        self.fraud_alerts.remove(id.as_str()).map_err(storage_err)?;
        Ok(())
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<(), GatewayError> {
        self.db.flush().map_err(storage_err)?;
        Ok(())
    }
}

fn decode_ts(bytes: &[u8]) -> Result<Timestamp, GatewayError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| GatewayError::Storage("corrupt processed marker".into()))?;
    Ok(Timestamp::from_be_bytes(arr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use acquira_core::event::PaymentEventKind;
    use acquira_core::money::{Amount, Currency};
    use acquira_core::payment::{BillingAddress, PaymentStatus};

    fn sample_payment() -> Payment {
        Payment::new(
            MerchantId::new("mer_1"),
            Amount::parse("42.00").unwrap(),
            Currency::USD,
            BillingAddress::default(),
            1_700_000_000,
        )
    }

    #[test]
    fn payment_round_trip() {
        let db = GatewayDb::open_temporary().unwrap();
        let p = sample_payment();
        db.put_payment(&p).unwrap();
        let got = db.get_payment(&p.id).unwrap().unwrap();
        assert_eq!(got.id, p.id);
        assert_eq!(got.amount, p.amount);
        assert_eq!(got.status, PaymentStatus::Pending);
    }

    #[test]
    fn events_scan_in_append_order() {
        let db = GatewayDb::open_temporary().unwrap();
        let p = sample_payment();
        for kind in [PaymentEventKind::Created, PaymentEventKind::Authorized, PaymentEventKind::Captured] {
            let evt = PaymentEvent::record(
                p.id.clone(), kind, PaymentStatus::Pending, p.amount, p.currency, 0,
            );
            db.append_payment_event(&evt).unwrap();
        }
        let events = db.payment_events(&p.id).unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![PaymentEventKind::Created, PaymentEventKind::Authorized, PaymentEventKind::Captured]
        );
    }

    #[test]
    fn idempotency_cas_only_succeeds_once_from_absent() {
        let db = GatewayDb::open_temporary().unwrap();
        let entry = IdempotencyEntry {
            key: "k1".into(),
            lock_owner: Some("a".into()),
            lock_expires_at: Some(100),
            response_json: None,
            request_fingerprint: None,
            created_at: 0,
            expires_at: 1_000,
        };
        assert!(db.cas_idempotency("k1", None, &entry).unwrap());
        assert!(!db.cas_idempotency("k1", None, &entry).unwrap());
    }

    #[test]
    fn processed_marker_dedups_until_expiry() {
        let db = GatewayDb::open_temporary().unwrap();
        assert!(db.mark_processed("grp:evt_1", 100, 50).unwrap());
        assert!(!db.mark_processed("grp:evt_1", 200, 60).unwrap());
        assert!(db.is_processed("grp:evt_1", 60).unwrap());
        // After expiry the marker can be re-taken.
        assert!(db.mark_processed("grp:evt_1", 300, 150).unwrap());
    }

    #[test]
    fn token_hash_index_lookup() {
        let db = GatewayDb::open_temporary().unwrap();
        let rec = CardTokenRecord {
            token_id: acquira_core::types::TokenId::generate(),
            token: "9123456789010366".into(),
            pan_hash: "abcd".into(),
            encrypted_pan: vec![1, 2, 3],
            nonce: [0u8; 12],
            key_version: 1,
            brand: "VISA".into(),
            last_four: "0366".into(),
            active: true,
            created_at: 0,
            expires_at: i64::MAX,
        };
        db.put_token(&rec).unwrap();
        let found = db.find_token_by_hash("abcd").unwrap().unwrap();
        assert_eq!(found.token, rec.token);
        assert!(db.find_token_by_hash("ffff").unwrap().is_none());
    }
}
