use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use acquira_core::card::{CardExpiry, Pan};
use acquira_core::context::RequestContext;
use acquira_core::error::{ErrorKind, GatewayError};
use acquira_core::event::{PaymentEvent, PaymentEventKind};
use acquira_core::money::{Amount, Currency};
use acquira_core::payment::{Payment, Refund};
use acquira_core::records::Merchant;
use acquira_core::types::{now_ts, MerchantId, PaymentId, Timestamp};
use acquira_degrade::DegradationController;
use acquira_events::{EventPublisher, PublishOutcome};
use acquira_idempotency::{request_fingerprint, IdempotencyStore, LockOutcome};
use acquira_risk::{FraudEngine, ThreeDsService};
use acquira_router::PspRouter;
use acquira_store::GatewayDb;
use acquira_token::TokenVault;
use acquira_webhook::WebhookDeliveryService;

use crate::authorize::{
    authorization_steps, lifecycle_envelope, AuthorizationContext, AuthorizeArgs,
};
use crate::executor::SagaExecutor;

// ── Shared component bundle ──────────────────────────────────────────────────

/// Every collaborator the sagas and operations need, built once at service
/// start and shared by reference.
pub struct GatewayCore {
    pub db: Arc<GatewayDb>,
    pub vault: Arc<TokenVault>,
    pub fraud: Arc<FraudEngine>,
    pub threeds: Arc<ThreeDsService>,
    pub router: Arc<PspRouter>,
    pub publisher: Arc<EventPublisher>,
    pub webhooks: Arc<WebhookDeliveryService>,
    pub degrade: Arc<DegradationController>,
}

// ── Views ────────────────────────────────────────────────────────────────────

/// The merchant-visible projection of a payment. Never contains a PAN.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentView {
    pub payment_id: String,
    pub status: String,
    pub amount: String,
    pub currency: String,
    pub card_last_four: String,
    pub card_brand: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub psp_transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fraud_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub three_ds_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
    pub captured_amount: String,
    pub refunded_amount: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorized_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<Timestamp>,
}

impl From<&Payment> for PaymentView {
    fn from(p: &Payment) -> Self {
        Self {
            payment_id: p.id.as_str().to_string(),
            status: p.status.as_str().to_string(),
            amount: p.amount.to_string(),
            currency: p.currency.as_str().to_string(),
            card_last_four: p.card_last_four.clone(),
            card_brand: p.card_brand.clone(),
            psp_transaction_id: p.psp_transaction_id.clone(),
            fraud_score: p.fraud_score,
            three_ds_status: p.three_ds_status.map(|s| s.as_str().to_string()),
            description: p.description.clone(),
            reference_id: p.reference_id.clone(),
            captured_amount: p.captured_amount.to_string(),
            refunded_amount: p.refunded_amount.to_string(),
            failure_reason: p.failure_reason.clone(),
            created_at: p.created_at,
            authorized_at: p.authorized_at,
            captured_at: p.captured_at,
        }
    }
}

/// Authorization result as cached by the idempotency layer: an identical
/// retry replays exactly these bytes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "outcome")]
pub enum AuthorizeOutcome {
    Approved { payment: PaymentView },
    Declined { payment_id: String, code: String, message: String },
}

/// Refund operation result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefundResult {
    pub refund_id: String,
    pub amount: String,
    pub payment: PaymentView,
}

// ── Gateway service ──────────────────────────────────────────────────────────

/// Entry point for all merchant payment operations. Wraps every mutation in
/// the idempotency layer and drives the authorization saga.
pub struct PaymentGateway {
    core: Arc<GatewayCore>,
    idempotency: IdempotencyStore,
}

impl PaymentGateway {
    pub fn new(core: Arc<GatewayCore>) -> Self {
        let idempotency = IdempotencyStore::new(Arc::clone(&core.db));
        Self { core, idempotency }
    }

    pub fn core(&self) -> &Arc<GatewayCore> {
        &self.core
    }

    // ── Authorization ────────────────────────────────────────────────────────

    pub async fn authorize(&self, args: AuthorizeArgs) -> Result<AuthorizeOutcome, GatewayError> {
        if args.idempotency_key.is_empty() {
            return Err(GatewayError::MissingIdempotencyKey);
        }
        let merchant = self.merchant(&args.merchant_id)?;

        let amount = Amount::parse(&args.amount)?;
        if !amount.is_positive() {
            return Err(GatewayError::InvalidAmount(args.amount.clone()));
        }
        let currency = Currency::parse(&args.currency)?;
        let pan = Pan::parse(&args.card.number)?;
        let expiry = CardExpiry::parse(args.card.exp_month, args.card.exp_year, now_ts())?;
        validate_country(&args.billing.country)?;

        let payload = serde_json::to_string(&args)
            .map_err(|e| GatewayError::Serialization(e.to_string()))?;
        let fingerprint = request_fingerprint(&payload);
        let idem_key = format!("auth:{}:{}", merchant.id, args.idempotency_key);

        match self.idempotency.acquire_lock(&idem_key, &fingerprint).await? {
            LockOutcome::CachedResult(json) => {
                info!(key = %idem_key, "idempotent replay served from cache");
                return serde_json::from_str(&json)
                    .map_err(|e| GatewayError::Serialization(e.to_string()));
            }
            LockOutcome::Acquired => {}
        }

        let mut request = RequestContext::new(merchant.id.clone());
        request.client_ip = args.client_ip.clone();
        request.device_fingerprint = args.device_fingerprint.clone();

        let mut payment =
            Payment::new(merchant.id.clone(), amount, currency, args.billing.clone(), now_ts());
        payment.description = args.description.clone();
        payment.reference_id = args.reference_id.clone();

        let ctx = AuthorizationContext::new(
            Arc::clone(&self.core),
            request,
            merchant,
            payment,
            pan,
            expiry,
            args.card.cvv.clone(),
            args.browser.clone(),
            args.ip_country.clone(),
        );

        // Detached so that compensation still completes if the caller goes
        // away mid-request.
        let saga = tokio::spawn(async move {
            let mut ctx = ctx;
            let executor = SagaExecutor::new("payment_authorization", authorization_steps());
            let result = executor.run(&mut ctx).await;
            (ctx, result)
        });
        let (ctx, result) = saga
            .await
            .map_err(|e| GatewayError::Internal(format!("saga task failed: {e}")))?;

        if result.needs_manual_review() {
            error!(
                payment = %ctx.payment.id,
                failed_compensations = ?result.failed_compensations,
                "saga compensations failed; manual review required"
            );
        }

        if result.success {
            let outcome = AuthorizeOutcome::Approved { payment: PaymentView::from(&ctx.payment) };
            self.cache_outcome(&idem_key, &outcome, &fingerprint)?;
            return Ok(outcome);
        }

        let err = result.failure.unwrap_or_else(|| GatewayError::Internal("saga failed".into()));
        if err.kind() == ErrorKind::Declined {
            // Business rejections are cached: the idempotent retry must see
            // the same decline, not a second execution.
            let (code, message) = decline_code(&err);
            let outcome = AuthorizeOutcome::Declined {
                payment_id: ctx.payment.id.as_str().to_string(),
                code,
                message,
            };
            self.cache_outcome(&idem_key, &outcome, &fingerprint)?;
            return Ok(outcome);
        }

        // Transient and internal failures release the lock so a retry can
        // run fresh.
        self.idempotency.release_lock(&idem_key)?;
        Err(err)
    }

    // ── Capture ──────────────────────────────────────────────────────────────

    pub async fn capture(
        &self,
        merchant_id: &str,
        payment_id: &str,
        idempotency_key: &str,
        amount: Option<String>,
    ) -> Result<PaymentView, GatewayError> {
        if idempotency_key.is_empty() {
            return Err(GatewayError::MissingIdempotencyKey);
        }
        let merchant = self.merchant(merchant_id)?;
        let idem_key = format!("capture:{}:{}", merchant.id, idempotency_key);
        let fingerprint = request_fingerprint(&format!("capture:{payment_id}:{amount:?}"));

        match self.idempotency.acquire_lock(&idem_key, &fingerprint).await? {
            LockOutcome::CachedResult(json) => {
                return serde_json::from_str(&json)
                    .map_err(|e| GatewayError::Serialization(e.to_string()));
            }
            LockOutcome::Acquired => {}
        }

        let result = self.capture_inner(&merchant, payment_id, amount).await;
        self.finish_single_op(&idem_key, &fingerprint, result)
    }

    async fn capture_inner(
        &self,
        merchant: &Merchant,
        payment_id: &str,
        amount: Option<String>,
    ) -> Result<PaymentView, GatewayError> {
        let mut payment = self.owned_payment(merchant, payment_id)?;
        let amount = match amount {
            Some(s) => Amount::parse(&s)?,
            None => payment.amount,
        };

        let (psp_name, psp_txn) = psp_reference(&payment)?;
        payment.capture(amount, now_ts())?;
        self.core.router.capture(&psp_name, &psp_txn, amount, payment.currency).await?;

        self.core.db.put_payment(&payment)?;
        self.emit_lifecycle(&payment, PaymentEventKind::Captured, merchant).await;
        Ok(PaymentView::from(&payment))
    }

    // ── Void ─────────────────────────────────────────────────────────────────

    pub async fn void(
        &self,
        merchant_id: &str,
        payment_id: &str,
        idempotency_key: &str,
    ) -> Result<PaymentView, GatewayError> {
        if idempotency_key.is_empty() {
            return Err(GatewayError::MissingIdempotencyKey);
        }
        let merchant = self.merchant(merchant_id)?;
        let idem_key = format!("void:{}:{}", merchant.id, idempotency_key);
        let fingerprint = request_fingerprint(&format!("void:{payment_id}"));

        match self.idempotency.acquire_lock(&idem_key, &fingerprint).await? {
            LockOutcome::CachedResult(json) => {
                return serde_json::from_str(&json)
                    .map_err(|e| GatewayError::Serialization(e.to_string()));
            }
            LockOutcome::Acquired => {}
        }

        let result = self.void_inner(&merchant, payment_id).await;
        self.finish_single_op(&idem_key, &fingerprint, result)
    }

    async fn void_inner(
        &self,
        merchant: &Merchant,
        payment_id: &str,
    ) -> Result<PaymentView, GatewayError> {
        let mut payment = self.owned_payment(merchant, payment_id)?;
        let (psp_name, psp_txn) = psp_reference(&payment)?;

        payment.cancel(Some("voided by merchant"))?;
        self.core.router.void(&psp_name, &psp_txn).await?;

        self.core.db.put_payment(&payment)?;
        self.emit_lifecycle(&payment, PaymentEventKind::Cancelled, merchant).await;
        Ok(PaymentView::from(&payment))
    }

    // ── Refund ───────────────────────────────────────────────────────────────

    pub async fn refund(
        &self,
        merchant_id: &str,
        payment_id: &str,
        idempotency_key: &str,
        amount: Option<String>,
    ) -> Result<RefundResult, GatewayError> {
        if idempotency_key.is_empty() {
            return Err(GatewayError::MissingIdempotencyKey);
        }
        let merchant = self.merchant(merchant_id)?;
        let idem_key = format!("refund:{}:{}", merchant.id, idempotency_key);
        let fingerprint = request_fingerprint(&format!("refund:{payment_id}:{amount:?}"));

        match self.idempotency.acquire_lock(&idem_key, &fingerprint).await? {
            LockOutcome::CachedResult(json) => {
                return serde_json::from_str(&json)
                    .map_err(|e| GatewayError::Serialization(e.to_string()));
            }
            LockOutcome::Acquired => {}
        }

        let result = self.refund_inner(&merchant, payment_id, amount).await;
        self.finish_single_op(&idem_key, &fingerprint, result)
    }

    async fn refund_inner(
        &self,
        merchant: &Merchant,
        payment_id: &str,
        amount: Option<String>,
    ) -> Result<RefundResult, GatewayError> {
        let mut payment = self.owned_payment(merchant, payment_id)?;
        let remaining = payment.captured_amount.checked_sub(payment.refunded_amount)?;
        let amount = match amount {
            Some(s) => Amount::parse(&s)?,
            None => remaining,
        };

        let (psp_name, psp_txn) = psp_reference(&payment)?;
        let new_status = payment.refund(amount)?;
        let psp_refund_id =
            self.core.router.refund(&psp_name, &psp_txn, amount, payment.currency).await?;

        let mut refund = Refund::new(payment.id.clone(), amount, payment.currency, now_ts());
        refund.psp_refund_id = Some(psp_refund_id);
        self.core.db.put_refund(&refund)?;
        self.core.db.put_payment(&payment)?;

        debug_assert!(payment.ledger_check());
        self.emit_lifecycle(&payment, PaymentEventKind::Refunded, merchant).await;
        info!(
            payment = %payment.id,
            refund = %refund.id,
            amount = %amount,
            status = new_status.as_str(),
            "refund applied"
        );
        Ok(RefundResult {
            refund_id: refund.id.clone(),
            amount: amount.to_string(),
            payment: PaymentView::from(&payment),
        })
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn get_payment(&self, merchant_id: &str, payment_id: &str) -> Result<PaymentView, GatewayError> {
        let merchant = self.merchant(merchant_id)?;
        let payment = self.owned_payment(&merchant, payment_id)?;
        Ok(PaymentView::from(&payment))
    }

    pub fn list_payments(
        &self,
        merchant_id: &str,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<PaymentView>, GatewayError> {
        let merchant = self.merchant(merchant_id)?;
        let limit = limit.min(acquira_core::constants::MAX_PAGE_LIMIT) as usize;
        let payments = self.core.db.list_payments(&merchant.id, offset as usize, limit)?;
        Ok(payments.iter().map(PaymentView::from).collect())
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn merchant(&self, merchant_id: &str) -> Result<Merchant, GatewayError> {
        self.core
            .db
            .get_merchant(&MerchantId::new(merchant_id))?
            .ok_or_else(|| GatewayError::MerchantNotFound(merchant_id.to_string()))
    }

    /// Fetch a payment and verify the caller owns it. Unknown and foreign
    /// payments are indistinguishable.
    fn owned_payment(&self, merchant: &Merchant, payment_id: &str) -> Result<Payment, GatewayError> {
        let id = PaymentId::parse(payment_id)
            .ok_or_else(|| GatewayError::PaymentNotFound(payment_id.to_string()))?;
        let payment = self
            .core
            .db
            .get_payment(&id)?
            .ok_or_else(|| GatewayError::PaymentNotFound(payment_id.to_string()))?;
        if payment.merchant_id != merchant.id {
            return Err(GatewayError::PaymentNotFound(payment_id.to_string()));
        }
        Ok(payment)
    }

    fn cache_outcome<T: Serialize>(
        &self,
        idem_key: &str,
        outcome: &T,
        fingerprint: &str,
    ) -> Result<(), GatewayError> {
        let json = serde_json::to_string(outcome)
            .map_err(|e| GatewayError::Serialization(e.to_string()))?;
        self.idempotency.store_result(idem_key, &json, fingerprint)
    }

    /// Cache successful single-op results; release the lock on failure so a
    /// retry can run.
    fn finish_single_op<T: Serialize>(
        &self,
        idem_key: &str,
        fingerprint: &str,
        result: Result<T, GatewayError>,
    ) -> Result<T, GatewayError> {
        match result {
            Ok(value) => {
                self.cache_outcome(idem_key, &value, fingerprint)?;
                Ok(value)
            }
            Err(e) => {
                self.idempotency.release_lock(idem_key)?;
                Err(e)
            }
        }
    }

    /// Append the audit row, publish the bus event and (when publication
    /// succeeded) enqueue + first-attempt the merchant webhook. Failures here
    /// are logged, not surfaced: the state change has already committed.
    async fn emit_lifecycle(&self, payment: &Payment, kind: PaymentEventKind, merchant: &Merchant) {
        let audit = PaymentEvent::record(
            payment.id.clone(),
            kind,
            payment.status,
            payment.amount,
            payment.currency,
            now_ts(),
        );
        if let Err(e) = self.core.db.append_payment_event(&audit) {
            error!(payment = %payment.id, error = %e, "failed to append audit event");
        }

        let request = RequestContext::new(merchant.id.clone());
        let envelope = lifecycle_envelope(payment, &request, kind);
        match self.core.publisher.publish(payment.id.as_str(), &envelope).await {
            Ok(PublishOutcome::Published) => {
                match self.core.webhooks.enqueue(
                    merchant,
                    &payment.id,
                    envelope.event_type.as_str(),
                    &envelope.to_json().unwrap_or_default(),
                ) {
                    Ok(Some(mut delivery)) => {
                        if let Err(e) = self.core.webhooks.attempt(&mut delivery).await {
                            warn!(delivery = %delivery.id, error = %e, "webhook attempt failed");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(payment = %payment.id, error = %e, "webhook enqueue failed"),
                }
            }
            Ok(PublishOutcome::Buffered) => {
                warn!(payment = %payment.id, "event buffered; webhook deferred until replay");
            }
            Err(e) => error!(payment = %payment.id, error = %e, "event publish rejected"),
        }
    }
}

fn validate_country(country: &str) -> Result<(), GatewayError> {
    if country.len() != 2 || !country.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(GatewayError::InvalidField {
            field: "billing.country".into(),
            reason: "must be ISO-3166-1 alpha-2".into(),
        });
    }
    Ok(())
}

fn psp_reference(payment: &Payment) -> Result<(String, String), GatewayError> {
    match (&payment.psp_name, &payment.psp_transaction_id) {
        (Some(name), Some(txn)) => Ok((name.clone(), txn.clone())),
        _ => Err(GatewayError::IllegalTransition {
            from: payment.status.as_str().to_string(),
            to: "PSP operation without authorization".to_string(),
        }),
    }
}

fn decline_code(err: &GatewayError) -> (String, String) {
    match err {
        GatewayError::Declined { code, message } => (code.clone(), message.clone()),
        GatewayError::BlacklistHit(code) => (code.clone(), err.to_string()),
        GatewayError::VelocityLimitExceeded(scope) => {
            ("VELOCITY_LIMIT_EXCEEDED".to_string(), format!("velocity limit exceeded for {scope}"))
        }
        other => ("DECLINED".to_string(), other.to_string()),
    }
}
