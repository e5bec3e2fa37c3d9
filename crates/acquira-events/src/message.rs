use serde::{Deserialize, Serialize};

use acquira_core::error::GatewayError;
use acquira_core::money::{Amount, Currency};
use acquira_core::types::{ts_to_rfc3339, EventId, Timestamp};

/// Business payload of a payment lifecycle event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventPayload {
    pub payment_id: String,
    pub merchant_id: String,
    pub amount: String,
    pub currency: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub psp_transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fraud_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub three_ds_status: Option<String>,
}

/// The on-bus message shape. Everything published must pass
/// [`EventEnvelope::validate`] first.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    pub event_type: String,
    /// RFC-3339 UTC.
    pub timestamp: String,
    pub correlation_id: String,
    pub trace_id: String,
    pub payload: EventPayload,
}

impl EventEnvelope {
    pub fn new(
        event_type: &str,
        correlation_id: &str,
        trace_id: &str,
        created_at: Timestamp,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_id: EventId::generate().0,
            event_type: event_type.to_string(),
            timestamp: ts_to_rfc3339(created_at),
            correlation_id: correlation_id.to_string(),
            trace_id: trace_id.to_string(),
            payload,
        }
    }

    /// Field-by-field schema check: id shape, timestamp format, ISO currency,
    /// decimal amount, score range. Rejected envelopes never reach the bus.
    pub fn validate(&self) -> Result<(), GatewayError> {
        let fail = |msg: &str| Err(GatewayError::SchemaViolation(msg.to_string()));

        if EventId::parse(&self.event_id).is_none() {
            return fail("event_id must be evt_ + 24 base62 characters");
        }
        if self.event_type.is_empty() {
            return fail("event_type is required");
        }
        if chrono::DateTime::parse_from_rfc3339(&self.timestamp).is_err() {
            return fail("timestamp must be RFC-3339");
        }
        if self.correlation_id.is_empty() || self.trace_id.is_empty() {
            return fail("correlation_id and trace_id are required");
        }
        if self.payload.payment_id.is_empty() {
            return fail("payload.payment_id is required");
        }
        if self.payload.merchant_id.is_empty() {
            return fail("payload.merchant_id is required");
        }
        if Amount::parse(&self.payload.amount).is_err() {
            return fail("payload.amount must be a scale-2 decimal string");
        }
        if Currency::parse(&self.payload.currency).is_err() {
            return fail("payload.currency must be ISO-4217 alphabetic");
        }
        if self.payload.status.is_empty() {
            return fail("payload.status is required");
        }
        if let Some(score) = self.payload.fraud_score {
            if !(0.0..=1.0).contains(&score) {
                return fail("payload.fraud_score must lie in [0,1]");
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, GatewayError> {
        serde_json::to_string(self).map_err(|e| GatewayError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(json).map_err(|e| GatewayError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> EventPayload {
        EventPayload {
            payment_id: "pay_abcdefghijklmnopqrstuvwx".into(),
            merchant_id: "mer_1".into(),
            amount: "100.00".into(),
            currency: "USD".into(),
            status: "AUTHORIZED".into(),
            psp_transaction_id: Some("stripe_x".into()),
            fraud_score: Some(0.12),
            three_ds_status: None,
        }
    }

    fn envelope() -> EventEnvelope {
        EventEnvelope::new("PAYMENT_AUTHORIZED", "req_1", "trc_1", 1_700_000_000, payload())
    }

    #[test]
    fn well_formed_envelope_validates() {
        envelope().validate().unwrap();
    }

    #[test]
    fn json_round_trip_preserves_fields() {
        let env = envelope();
        let json = env.to_json().unwrap();
        let back = EventEnvelope::from_json(&json).unwrap();
        assert_eq!(back.event_id, env.event_id);
        assert_eq!(back.payload.amount, "100.00");
        back.validate().unwrap();
    }

    #[test]
    fn schema_violations_are_rejected() {
        let mut bad = envelope();
        bad.event_id = "not-an-id".into();
        assert!(bad.validate().is_err());

        let mut bad = envelope();
        bad.timestamp = "yesterday".into();
        assert!(bad.validate().is_err());

        let mut bad = envelope();
        bad.payload.currency = "usd".into();
        assert!(bad.validate().is_err());

        let mut bad = envelope();
        bad.payload.fraud_score = Some(1.5);
        assert!(bad.validate().is_err());

        let mut bad = envelope();
        bad.payload.amount = "12.345".into();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn absent_optional_fields_are_omitted_from_json() {
        let mut env = envelope();
        env.payload.psp_transaction_id = None;
        env.payload.fraud_score = None;
        let json = env.to_json().unwrap();
        assert!(!json.contains("psp_transaction_id"));
        assert!(!json.contains("fraud_score"));
    }
}
