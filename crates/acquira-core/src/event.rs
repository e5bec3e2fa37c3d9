use serde::{Deserialize, Serialize};

use crate::money::{Amount, Currency};
use crate::payment::PaymentStatus;
use crate::types::{EventId, PaymentId, Timestamp};

/// Audit event kinds. Lifecycle kinds mirror the FSM; the saga kinds record
/// orchestration boundaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentEventKind {
    Created,
    Authorized,
    Declined,
    Captured,
    Cancelled,
    Refunded,
    Failed,
    SagaStarted,
    SagaCompensated,
}

impl PaymentEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentEventKind::Created => "PAYMENT_CREATED",
            PaymentEventKind::Authorized => "PAYMENT_AUTHORIZED",
            PaymentEventKind::Declined => "PAYMENT_DECLINED",
            PaymentEventKind::Captured => "PAYMENT_CAPTURED",
            PaymentEventKind::Cancelled => "PAYMENT_CANCELLED",
            PaymentEventKind::Refunded => "PAYMENT_REFUNDED",
            PaymentEventKind::Failed => "PAYMENT_FAILED",
            PaymentEventKind::SagaStarted => "SAGA_STARTED",
            PaymentEventKind::SagaCompensated => "SAGA_COMPENSATED",
        }
    }
}

impl std::fmt::Display for PaymentEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable audit record, append-only. Events point at the payment; the
/// payment never points back (the per-payment view is reconstructed by
/// query).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub id: EventId,
    pub payment_id: PaymentId,
    pub kind: PaymentEventKind,
    pub state_after: PaymentStatus,
    pub amount: Amount,
    pub currency: Currency,
    pub created_at: Timestamp,
}

impl PaymentEvent {
    pub fn record(
        payment_id: PaymentId,
        kind: PaymentEventKind,
        state_after: PaymentStatus,
        amount: Amount,
        currency: Currency,
        now: Timestamp,
    ) -> Self {
        Self {
            id: EventId::generate(),
            payment_id,
            kind,
            state_after,
            amount,
            currency,
            created_at: now,
        }
    }
}
