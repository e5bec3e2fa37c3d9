use serde::{Deserialize, Serialize};

use crate::money::{Amount, Currency};
use crate::types::{new_prefixed_id, MerchantId, PaymentId, Timestamp, TokenId};

// ── Merchant ─────────────────────────────────────────────────────────────────

/// Merchant onboarding record. The API key is stored hashed; PSP names are
/// listed in ascending priority order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Merchant {
    pub id: MerchantId,
    pub name: String,
    pub api_key_hash: String,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub psp_priority: Vec<String>,
    pub created_at: Timestamp,
}

// ── CardTokenRecord ──────────────────────────────────────────────────────────

/// Vault row for one format-preserving card token.
///
/// The PAN appears only as AES-256-GCM ciphertext plus a SHA-256 lookup hash;
/// the token value itself carries no recoverable card data.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CardTokenRecord {
    pub token_id: TokenId,
    /// The format-preserving surrogate handed to callers.
    pub token: String,
    /// Hex SHA-256 of the PAN, used for dedup lookup.
    pub pan_hash: String,
    pub encrypted_pan: Vec<u8>,
    pub nonce: [u8; 12],
    pub key_version: u32,
    pub brand: String,
    pub last_four: String,
    pub active: bool,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
}

// ── IdempotencyEntry ─────────────────────────────────────────────────────────

/// One idempotency-store row: an optional short-lived lock and an optional
/// cached JSON response. Entry TTL is 24 h; the lock TTL is seconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyEntry {
    pub key: String,
    pub lock_owner: Option<String>,
    pub lock_expires_at: Option<Timestamp>,
    pub response_json: Option<String>,
    /// Hash of the request payload, so key reuse with a different body is
    /// detectable as a conflict.
    pub request_fingerprint: Option<String>,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
}

// ── RetryTask (DLQ row) ──────────────────────────────────────────────────────

/// A transaction whose retries were exhausted (or blocked by an OPEN
/// circuit), parked for manual replay.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryTask {
    pub transaction_id: String,
    pub psp_name: String,
    pub payload: Vec<u8>,
    pub attempt_count: u32,
    pub last_error: String,
    pub created_at: Timestamp,
}

// ── WebhookDelivery ──────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookStatus {
    Pending,
    Delivered,
    Failed,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Pending => "PENDING",
            WebhookStatus::Delivered => "DELIVERED",
            WebhookStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WebhookStatus::Pending)
    }
}

/// One outbound merchant notification and its delivery history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: String,
    pub merchant_id: MerchantId,
    pub payment_id: PaymentId,
    pub event_type: String,
    pub url: String,
    pub payload: String,
    /// base64(HMAC-SHA256(secret, payload)).
    pub signature: String,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub status: WebhookStatus,
    pub next_retry_at: Option<Timestamp>,
    pub http_status: Option<u16>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
    pub delivered_at: Option<Timestamp>,
}

impl WebhookDelivery {
    pub fn new(
        merchant_id: MerchantId,
        payment_id: PaymentId,
        event_type: String,
        url: String,
        payload: String,
        signature: String,
        max_attempts: u32,
        now: Timestamp,
    ) -> Self {
        Self {
            id: new_prefixed_id("whd_"),
            merchant_id,
            payment_id,
            event_type,
            url,
            payload,
            signature,
            attempt_count: 0,
            max_attempts,
            status: WebhookStatus::Pending,
            next_retry_at: Some(now),
            http_status: None,
            response_body: None,
            error_message: None,
            created_at: now,
            delivered_at: None,
        }
    }
}

// ── FraudAlert ───────────────────────────────────────────────────────────────

/// Alert raised when a payment scores REVIEW or BLOCK; cleared by saga
/// compensation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FraudAlert {
    pub payment_id: PaymentId,
    pub score: f64,
    pub decision: String,
    pub triggered_rules: Vec<String>,
    pub created_at: Timestamp,
}

// ── ExchangeRate ─────────────────────────────────────────────────────────────

/// Cached conversion rate at scale 6 (micros).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub from: Currency,
    pub to: Currency,
    pub rate_micros: u64,
    pub provider: String,
    pub fetched_at: Timestamp,
}

impl ExchangeRate {
    /// Convert `amount` minor units using this rate, rounding half-up at
    /// scale 2. Integer arithmetic throughout.
    pub fn convert(&self, amount: Amount) -> Amount {
        let minor = amount.minor_units() as i128;
        let scaled = minor * self.rate_micros as i128;
        let scale = crate::constants::FX_RATE_SCALE as i128;
        let rounded = (scaled + scale / 2).div_euclid(scale);
        Amount::from_minor(rounded as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_rounds_half_up() {
        let rate = ExchangeRate {
            from: Currency::USD,
            to: Currency::EUR,
            rate_micros: 925_000, // 0.925000
            provider: "fixed".into(),
            fetched_at: 0,
        };
        // 10.01 * 0.925 = 9.25925 -> 9.26
        assert_eq!(rate.convert(Amount::parse("10.01").unwrap()).to_string(), "9.26");
        // 10.00 * 0.925 = 9.25 exactly
        assert_eq!(rate.convert(Amount::parse("10.00").unwrap()).to_string(), "9.25");
        // half-up at the midpoint: 1.00 * 0.005 = 0.005 -> 0.01
        let tiny = ExchangeRate { rate_micros: 5_000, ..rate.clone() };
        assert_eq!(tiny.convert(Amount::parse("1.00").unwrap()).to_string(), "0.01");
    }
}
