use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::money::{Amount, Currency};
use crate::types::{MerchantId, PaymentId, Timestamp, TokenId};

// ── Status FSM ───────────────────────────────────────────────────────────────

/// Payment lifecycle states.
///
/// ```text
/// Pending -> Authorized            (saga success)
/// Pending -> Failed                (saga failed at the PSP step)
/// Pending -> Cancelled             (compensation before the PSP step)
/// Authorized -> Captured           (capture)
/// Authorized -> Cancelled          (void)
/// Captured -> RefundedPartial      (partial refund; repeatable)
/// Captured | RefundedPartial -> Refunded   (cumulative refund == captured)
/// ```
/// Terminal: Failed, Cancelled, Refunded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Authorized,
    Captured,
    RefundedPartial,
    Refunded,
    Cancelled,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Authorized => "AUTHORIZED",
            PaymentStatus::Captured => "CAPTURED",
            PaymentStatus::RefundedPartial => "REFUNDED_PARTIAL",
            PaymentStatus::Refunded => "REFUNDED",
            PaymentStatus::Cancelled => "CANCELLED",
            PaymentStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Failed | PaymentStatus::Cancelled | PaymentStatus::Refunded
        )
    }

    fn can_transition_to(&self, to: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, to),
            (Pending, Authorized)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Authorized, Captured)
                | (Authorized, Cancelled)
                | (Captured, RefundedPartial)
                | (Captured, Refunded)
                | (RefundedPartial, RefundedPartial)
                | (RefundedPartial, Refunded)
        )
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Risk outcomes carried on the aggregate ───────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FraudDecision {
    Clean,
    Review,
    Block,
}

impl FraudDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            FraudDecision::Clean => "CLEAN",
            FraudDecision::Review => "REVIEW",
            FraudDecision::Block => "BLOCK",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreeDsStatus {
    NotEnrolled,
    Authenticated,
    Failed,
}

impl ThreeDsStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreeDsStatus::NotEnrolled => "NOT_ENROLLED",
            ThreeDsStatus::Authenticated => "AUTHENTICATED",
            ThreeDsStatus::Failed => "FAILED",
        }
    }
}

// ── Billing address ──────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingAddress {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    /// ISO-3166-1 alpha-2.
    pub country: String,
}

// ── Payment aggregate ────────────────────────────────────────────────────────

/// The primary aggregate. Mutated only inside the saga's single writer; all
/// state changes go through the transition methods below so the FSM cannot
/// be bypassed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub merchant_id: MerchantId,
    pub amount: Amount,
    pub currency: Currency,
    pub status: PaymentStatus,

    pub card_token_id: Option<TokenId>,
    pub card_last_four: String,
    pub card_brand: String,

    pub psp_name: Option<String>,
    pub psp_transaction_id: Option<String>,

    pub fraud_score: Option<f64>,
    pub fraud_decision: Option<FraudDecision>,

    pub three_ds_status: Option<ThreeDsStatus>,
    pub three_ds_cavv: Option<String>,
    pub three_ds_eci: Option<String>,
    pub three_ds_xid: Option<String>,

    pub description: Option<String>,
    pub reference_id: Option<String>,
    pub billing: BillingAddress,

    pub captured_amount: Amount,
    pub refunded_amount: Amount,
    pub failure_reason: Option<String>,

    pub created_at: Timestamp,
    pub authorized_at: Option<Timestamp>,
    pub captured_at: Option<Timestamp>,
}

impl Payment {
    pub fn new(
        merchant_id: MerchantId,
        amount: Amount,
        currency: Currency,
        billing: BillingAddress,
        now: Timestamp,
    ) -> Self {
        Self {
            id: PaymentId::generate(),
            merchant_id,
            amount,
            currency,
            status: PaymentStatus::Pending,
            card_token_id: None,
            card_last_four: String::new(),
            card_brand: String::new(),
            psp_name: None,
            psp_transaction_id: None,
            fraud_score: None,
            fraud_decision: None,
            three_ds_status: None,
            three_ds_cavv: None,
            three_ds_eci: None,
            three_ds_xid: None,
            description: None,
            reference_id: None,
            billing,
            captured_amount: Amount::ZERO,
            refunded_amount: Amount::ZERO,
            failure_reason: None,
            created_at: now,
            authorized_at: None,
            captured_at: None,
        }
    }

    fn transition(&mut self, to: PaymentStatus) -> Result<(), GatewayError> {
        if !self.status.can_transition_to(to) {
            return Err(GatewayError::IllegalTransition {
                from: self.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// Saga success: attach the PSP authorization and move to AUTHORIZED.
    pub fn authorize(
        &mut self,
        psp_name: &str,
        psp_transaction_id: &str,
        now: Timestamp,
    ) -> Result<(), GatewayError> {
        self.transition(PaymentStatus::Authorized)?;
        self.psp_name = Some(psp_name.to_string());
        self.psp_transaction_id = Some(psp_transaction_id.to_string());
        self.authorized_at = Some(now);
        Ok(())
    }

    /// Saga failure at the PSP step.
    pub fn fail(&mut self, reason: &str) -> Result<(), GatewayError> {
        self.transition(PaymentStatus::Failed)?;
        self.failure_reason = Some(reason.to_string());
        Ok(())
    }

    /// Compensation (pre-PSP rejection) or merchant void.
    pub fn cancel(&mut self, reason: Option<&str>) -> Result<(), GatewayError> {
        self.transition(PaymentStatus::Cancelled)?;
        if let Some(r) = reason {
            self.failure_reason = Some(r.to_string());
        }
        Ok(())
    }

    /// Capture up to the authorized amount.
    pub fn capture(&mut self, amount: Amount, now: Timestamp) -> Result<(), GatewayError> {
        if !amount.is_positive() {
            return Err(GatewayError::InvalidAmount(amount.to_string()));
        }
        if amount > self.amount {
            return Err(GatewayError::CaptureExceedsAuthorized {
                requested: amount.to_string(),
                authorized: self.amount.to_string(),
            });
        }
        self.transition(PaymentStatus::Captured)?;
        self.captured_amount = amount;
        self.captured_at = Some(now);
        Ok(())
    }

    /// Apply one refund; moves to REFUNDED once cumulative refunds reach the
    /// captured amount, REFUNDED_PARTIAL otherwise.
    pub fn refund(&mut self, amount: Amount) -> Result<PaymentStatus, GatewayError> {
        if !amount.is_positive() {
            return Err(GatewayError::InvalidAmount(amount.to_string()));
        }
        let refundable = self.captured_amount.checked_sub(self.refunded_amount)?;
        if amount > refundable {
            return Err(GatewayError::RefundExceedsCaptured {
                requested: amount.to_string(),
                refundable: refundable.to_string(),
            });
        }
        let new_total = self.refunded_amount.checked_add(amount)?;
        let to = if new_total == self.captured_amount {
            PaymentStatus::Refunded
        } else {
            PaymentStatus::RefundedPartial
        };
        self.transition(to)?;
        self.refunded_amount = new_total;
        Ok(to)
    }

    /// Double-entry check: refunds never exceed captured, captured never
    /// exceeds authorized, and the net remainder is non-negative to the cent.
    pub fn ledger_check(&self) -> bool {
        self.captured_amount <= self.amount
            && self.refunded_amount <= self.captured_amount
            && self
                .captured_amount
                .checked_sub(self.refunded_amount)
                .map(|net| net >= Amount::ZERO)
                .unwrap_or(false)
    }
}

// ── Refund record ────────────────────────────────────────────────────────────

/// One refund row: `ref_` id plus amount, kept so partial refund history is
/// auditable independently of the aggregate's cumulative counter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Refund {
    pub id: String,
    pub payment_id: PaymentId,
    pub amount: Amount,
    pub currency: Currency,
    pub psp_refund_id: Option<String>,
    pub created_at: Timestamp,
}

impl Refund {
    pub fn new(payment_id: PaymentId, amount: Amount, currency: Currency, now: Timestamp) -> Self {
        Self {
            id: crate::types::new_prefixed_id("ref_"),
            payment_id,
            amount,
            currency,
            psp_refund_id: None,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payment(amount: &str) -> Payment {
        Payment::new(
            MerchantId::new("mer_test"),
            Amount::parse(amount).unwrap(),
            Currency::USD,
            BillingAddress::default(),
            1_700_000_000,
        )
    }

    #[test]
    fn happy_path_fsm() {
        let mut p = payment("100.00");
        p.authorize("stripe", "stripe_abc", 1_700_000_100).unwrap();
        assert_eq!(p.status, PaymentStatus::Authorized);
        p.capture(Amount::parse("100.00").unwrap(), 1_700_000_200).unwrap();
        assert_eq!(p.status, PaymentStatus::Captured);
        assert_eq!(p.refund(Amount::parse("40.00").unwrap()).unwrap(), PaymentStatus::RefundedPartial);
        assert_eq!(p.refund(Amount::parse("60.00").unwrap()).unwrap(), PaymentStatus::Refunded);
        assert!(p.status.is_terminal());
        assert!(p.ledger_check());
    }

    #[test]
    fn refund_cannot_exceed_captured() {
        let mut p = payment("50.00");
        p.authorize("adyen", "adyen_x", 0).unwrap();
        p.capture(Amount::parse("50.00").unwrap(), 0).unwrap();
        p.refund(Amount::parse("30.00").unwrap()).unwrap();
        let err = p.refund(Amount::parse("30.00").unwrap()).unwrap_err();
        assert!(matches!(err, GatewayError::RefundExceedsCaptured { .. }));
        assert!(p.ledger_check());
    }

    #[test]
    fn capture_cannot_exceed_authorized() {
        let mut p = payment("10.00");
        p.authorize("stripe", "stripe_x", 0).unwrap();
        let err = p.capture(Amount::parse("10.01").unwrap(), 0).unwrap_err();
        assert!(matches!(err, GatewayError::CaptureExceedsAuthorized { .. }));
    }

    #[test]
    fn illegal_transitions_are_conflicts() {
        let mut p = payment("10.00");
        assert!(p.capture(Amount::parse("10.00").unwrap(), 0).is_err());
        p.fail("psp exhausted").unwrap();
        let err = p.authorize("stripe", "stripe_x", 0).unwrap_err();
        assert!(matches!(err, GatewayError::IllegalTransition { .. }));
    }

    #[test]
    fn void_from_authorized() {
        let mut p = payment("25.00");
        p.authorize("stripe", "stripe_v", 0).unwrap();
        p.cancel(None).unwrap();
        assert_eq!(p.status, PaymentStatus::Cancelled);
    }
}
