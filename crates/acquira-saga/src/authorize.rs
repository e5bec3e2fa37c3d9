use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use acquira_core::card::{CardExpiry, Pan};
use acquira_core::context::RequestContext;
use acquira_core::error::GatewayError;
use acquira_core::event::{PaymentEvent, PaymentEventKind};
use acquira_core::payment::{BillingAddress, FraudDecision, Payment, ThreeDsStatus};
use acquira_core::records::{CardTokenRecord, FraudAlert, Merchant};
use acquira_core::types::now_ts;
use acquira_events::{EventEnvelope, EventPayload, PublishOutcome};
use acquira_risk::{BrowserInfo, FraudAssessment, FraudInput, ThreeDsOutcome};
use acquira_router::{AuthorizationRequest, PspAuthorization};

use crate::executor::{SagaContext, SagaStep};
use crate::service::GatewayCore;

// ── Request surface ──────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
pub struct CardDetails {
    pub number: String,
    pub exp_month: u8,
    pub exp_year: u16,
    pub cvv: String,
}

impl fmt::Debug for CardDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last4 = if self.number.len() >= 4 { &self.number[self.number.len() - 4..] } else { "" };
        write!(f, "CardDetails(**** {last4}, {:02}/{})", self.exp_month, self.exp_year)
    }
}

/// Everything the merchant sends to authorize a payment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthorizeArgs {
    pub merchant_id: String,
    pub idempotency_key: String,
    /// Decimal string, scale 2.
    pub amount: String,
    /// ISO-4217 alphabetic.
    pub currency: String,
    pub card: CardDetails,
    pub billing: BillingAddress,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub client_ip: Option<String>,
    #[serde(default)]
    pub ip_country: Option<String>,
    #[serde(default)]
    pub device_fingerprint: Option<String>,
    #[serde(default)]
    pub browser: BrowserInfo,
}

// ── Saga context ─────────────────────────────────────────────────────────────

/// Mutable state threaded through the authorization saga. The payment inside
/// is the aggregate's single writer for the whole request.
pub struct AuthorizationContext {
    pub core: Arc<GatewayCore>,
    pub request: RequestContext,
    pub merchant: Merchant,
    pub payment: Payment,
    pub browser: BrowserInfo,
    pub ip_country: Option<String>,

    /// Raw card data; consumed (and dropped) by the tokenize step.
    card: Option<(Pan, CardExpiry, String)>,

    pub token: Option<CardTokenRecord>,
    pub first_time_card: bool,
    pub assessment: Option<FraudAssessment>,
    pub three_ds_required: bool,
    pub psp_auth: Option<PspAuthorization>,

    failed_step: Option<String>,
    failure_reason: Option<String>,
}

impl AuthorizationContext {
    pub fn new(
        core: Arc<GatewayCore>,
        request: RequestContext,
        merchant: Merchant,
        payment: Payment,
        pan: Pan,
        expiry: CardExpiry,
        cvv: String,
        browser: BrowserInfo,
        ip_country: Option<String>,
    ) -> Self {
        Self {
            core,
            request,
            merchant,
            payment,
            browser,
            ip_country,
            card: Some((pan, expiry, cvv)),
            token: None,
            first_time_card: false,
            assessment: None,
            three_ds_required: false,
            psp_auth: None,
            failed_step: None,
            failure_reason: None,
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    fn audit(&self, kind: PaymentEventKind) -> Result<(), GatewayError> {
        let event = PaymentEvent::record(
            self.payment.id.clone(),
            kind,
            self.payment.status,
            self.payment.amount,
            self.payment.currency,
            now_ts(),
        );
        self.core.db.append_payment_event(&event)
    }
}

impl SagaContext for AuthorizationContext {
    fn record_failure(&mut self, step: &str, reason: &str) {
        self.failed_step = Some(step.to_string());
        self.failure_reason = Some(reason.to_string());
    }
}

/// The ordered authorization steps.
pub fn authorization_steps() -> Vec<Box<dyn SagaStep<AuthorizationContext>>> {
    vec![
        Box::new(CreatePaymentRecord),
        Box::new(TokenizeCard),
        Box::new(FraudDetection),
        Box::new(ThreeDSecure),
        Box::new(PspAuthorize),
        Box::new(FinalizePayment),
    ]
}

// ── Step 1: record ───────────────────────────────────────────────────────────

struct CreatePaymentRecord;

#[async_trait]
impl SagaStep<AuthorizationContext> for CreatePaymentRecord {
    fn name(&self) -> &'static str {
        "create_payment_record"
    }

    async fn execute(&self, ctx: &mut AuthorizationContext) -> Result<(), GatewayError> {
        ctx.core.db.put_payment(&ctx.payment)?;
        ctx.audit(PaymentEventKind::SagaStarted)?;
        debug!(payment = %ctx.payment.id, "payment record created");
        Ok(())
    }

    /// Terminal-state the payment: FAILED when the PSP step failed, CANCELLED
    /// for any earlier rejection.
    async fn compensate(&self, ctx: &mut AuthorizationContext) -> Result<(), GatewayError> {
        let reason = ctx.failure_reason.clone().unwrap_or_else(|| "saga aborted".into());
        if ctx.failed_step.as_deref() == Some("psp_authorize") {
            ctx.payment.fail(&reason)?;
        } else {
            ctx.payment.cancel(Some(&reason))?;
        }
        ctx.core.db.put_payment(&ctx.payment)?;
        ctx.audit(PaymentEventKind::SagaCompensated)?;
        Ok(())
    }
}

// ── Step 2: tokenize ─────────────────────────────────────────────────────────

struct TokenizeCard;

#[async_trait]
impl SagaStep<AuthorizationContext> for TokenizeCard {
    fn name(&self) -> &'static str {
        "tokenize_card"
    }

    async fn execute(&self, ctx: &mut AuthorizationContext) -> Result<(), GatewayError> {
        let (pan, expiry, cvv) = ctx
            .card
            .take()
            .ok_or_else(|| GatewayError::Internal("card data already consumed".into()))?;

        ctx.first_time_card = !ctx.core.vault.has_live_token(&pan)?;
        let record = ctx.core.vault.tokenize(&pan, expiry, &cvv)?;

        ctx.payment.card_token_id = Some(record.token_id.clone());
        ctx.payment.card_last_four = record.last_four.clone();
        ctx.payment.card_brand = record.brand.clone();
        ctx.token = Some(record);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut AuthorizationContext) -> Result<(), GatewayError> {
        if let Some(token) = &ctx.token {
            ctx.core.vault.revoke_token(&token.token)?;
        }
        Ok(())
    }
}

// ── Step 3: fraud ────────────────────────────────────────────────────────────

struct FraudDetection;

#[async_trait]
impl SagaStep<AuthorizationContext> for FraudDetection {
    fn name(&self) -> &'static str {
        "fraud_detection"
    }

    async fn execute(&self, ctx: &mut AuthorizationContext) -> Result<(), GatewayError> {
        let token = ctx
            .token
            .as_ref()
            .ok_or_else(|| GatewayError::Internal("fraud step before tokenize".into()))?;

        let input = FraudInput {
            payment_id: ctx.payment.id.as_str().to_string(),
            merchant_id: ctx.merchant.id.as_str().to_string(),
            amount: ctx.payment.amount,
            card_hash: token.pan_hash.clone(),
            client_ip: ctx.request.client_ip.clone(),
            device_fingerprint: ctx.request.device_fingerprint.clone(),
            billing_country: ctx.payment.billing.country.clone(),
            ip_country: ctx.ip_country.clone(),
            first_time_card: ctx.first_time_card,
        };
        let assessment = ctx.core.fraud.evaluate(&input).await?;

        ctx.payment.fraud_score = Some(assessment.score);
        ctx.payment.fraud_decision = Some(assessment.decision);
        ctx.three_ds_required = assessment.require_3ds;

        if assessment.decision != FraudDecision::Clean {
            ctx.core.db.put_fraud_alert(&FraudAlert {
                payment_id: ctx.payment.id.clone(),
                score: assessment.score,
                decision: assessment.decision.as_str().to_string(),
                triggered_rules: assessment.triggered_rules.clone(),
                created_at: now_ts(),
            })?;
        }

        if assessment.decision == FraudDecision::Block {
            let err = if assessment.triggered_rules.iter().any(|r| r == "BLACKLIST_HIT") {
                GatewayError::BlacklistHit("BLACKLIST_HIT".into())
            } else {
                GatewayError::Declined {
                    code: "FRAUD_SCORE_BLOCK".into(),
                    message: format!("fraud score {:.2} at or above block threshold", assessment.score),
                }
            };
            ctx.assessment = Some(assessment);
            return Err(err);
        }
        ctx.assessment = Some(assessment);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut AuthorizationContext) -> Result<(), GatewayError> {
        ctx.core.db.clear_fraud_alert(&ctx.payment.id)
    }
}

// ── Step 4: 3-D Secure ───────────────────────────────────────────────────────

struct ThreeDSecure;

#[async_trait]
impl SagaStep<AuthorizationContext> for ThreeDSecure {
    fn name(&self) -> &'static str {
        "three_d_secure"
    }

    async fn execute(&self, ctx: &mut AuthorizationContext) -> Result<(), GatewayError> {
        if !ctx.three_ds_required {
            ctx.payment.three_ds_status = Some(ThreeDsStatus::NotEnrolled);
            return Ok(());
        }

        let outcome = ctx
            .core
            .threeds
            .initiate(ctx.payment.id.as_str(), ctx.payment.amount, &ctx.browser)
            .await;

        match outcome {
            ThreeDsOutcome::Frictionless(data) => {
                ctx.payment.three_ds_status = Some(ThreeDsStatus::Authenticated);
                ctx.payment.three_ds_cavv = Some(data.cavv);
                ctx.payment.three_ds_eci = Some(data.eci);
                ctx.payment.three_ds_xid = Some(data.xid);
                Ok(())
            }
            ThreeDsOutcome::NotEnrolled { fallback } => {
                // Fallback: no authentication data, merchant retains
                // liability; the payment still proceeds.
                if fallback {
                    debug!(payment = %ctx.payment.id, "3-DS fallback: NOT_ENROLLED");
                }
                ctx.payment.three_ds_status = Some(ThreeDsStatus::NotEnrolled);
                Ok(())
            }
            ThreeDsOutcome::ChallengeRequired { session_id, redirect_url } => {
                ctx.payment.three_ds_status = Some(ThreeDsStatus::Failed);
                Err(GatewayError::Declined {
                    code: "AUTHENTICATION_REQUIRED".into(),
                    message: format!(
                        "challenge required: complete session {session_id} at {redirect_url}"
                    ),
                })
            }
            ThreeDsOutcome::Failed { reason } => {
                ctx.payment.three_ds_status = Some(ThreeDsStatus::Failed);
                Err(GatewayError::Declined { code: "3DS_FAILED".into(), message: reason })
            }
            ThreeDsOutcome::Timeout => {
                ctx.payment.three_ds_status = Some(ThreeDsStatus::Failed);
                Err(GatewayError::Declined {
                    code: "3DS_TIMEOUT".into(),
                    message: "authentication session expired".into(),
                })
            }
        }
    }

    async fn compensate(&self, ctx: &mut AuthorizationContext) -> Result<(), GatewayError> {
        ctx.core.threeds.invalidate_sessions_for(ctx.payment.id.as_str());
        Ok(())
    }
}

// ── Step 5: PSP authorize ────────────────────────────────────────────────────

struct PspAuthorize;

#[async_trait]
impl SagaStep<AuthorizationContext> for PspAuthorize {
    fn name(&self) -> &'static str {
        "psp_authorize"
    }

    async fn execute(&self, ctx: &mut AuthorizationContext) -> Result<(), GatewayError> {
        let token = ctx
            .token
            .as_ref()
            .ok_or_else(|| GatewayError::Internal("psp step before tokenize".into()))?;

        let req = AuthorizationRequest {
            transaction_id: ctx.payment.id.as_str().to_string(),
            token: token.token.clone(),
            amount: ctx.payment.amount,
            currency: ctx.payment.currency,
            cavv: ctx.payment.three_ds_cavv.clone(),
            eci: ctx.payment.three_ds_eci.clone(),
        };
        let auth = ctx.core.router.authorize(&ctx.merchant.psp_priority, &req).await?;

        ctx.payment.authorize(&auth.psp_name, &auth.psp_transaction_id, now_ts())?;
        ctx.psp_auth = Some(auth);
        Ok(())
    }

    /// Void the authorization we obtained, if any.
    async fn compensate(&self, ctx: &mut AuthorizationContext) -> Result<(), GatewayError> {
        if let Some(auth) = &ctx.psp_auth {
            ctx.core.router.void(&auth.psp_name, &auth.psp_transaction_id).await?;
        }
        Ok(())
    }
}

// ── Step 6: finalize ─────────────────────────────────────────────────────────

struct FinalizePayment;

#[async_trait]
impl SagaStep<AuthorizationContext> for FinalizePayment {
    fn name(&self) -> &'static str {
        "finalize_payment"
    }

    async fn execute(&self, ctx: &mut AuthorizationContext) -> Result<(), GatewayError> {
        ctx.core.db.put_payment(&ctx.payment)?;
        ctx.audit(PaymentEventKind::Authorized)?;

        let envelope = lifecycle_envelope(&ctx.payment, &ctx.request, PaymentEventKind::Authorized);
        let outcome = ctx.core.publisher.publish(ctx.payment.id.as_str(), &envelope).await?;

        // Webhook enqueue is gated on successful publication.
        if outcome == PublishOutcome::Published {
            if let Some(mut delivery) = ctx.core.webhooks.enqueue(
                &ctx.merchant,
                &ctx.payment.id,
                envelope.event_type.as_str(),
                &envelope.to_json()?,
            )? {
                // First attempt inline; retries belong to the scheduler.
                ctx.core.webhooks.attempt(&mut delivery).await?;
            }
        }
        Ok(())
    }

    async fn compensate(&self, _ctx: &mut AuthorizationContext) -> Result<(), GatewayError> {
        // Nothing to undo: earlier compensations rewrite state and the event
        // log is append-only.
        Ok(())
    }
}

/// Bus envelope for a payment lifecycle transition.
pub fn lifecycle_envelope(
    payment: &Payment,
    request: &RequestContext,
    kind: PaymentEventKind,
) -> EventEnvelope {
    EventEnvelope::new(
        kind.as_str(),
        &request.correlation_id,
        &request.trace_id,
        now_ts(),
        EventPayload {
            payment_id: payment.id.as_str().to_string(),
            merchant_id: payment.merchant_id.as_str().to_string(),
            amount: payment.amount.to_string(),
            currency: payment.currency.as_str().to_string(),
            status: payment.status.as_str().to_string(),
            psp_transaction_id: payment.psp_transaction_id.clone(),
            fraud_score: payment.fraud_score,
            three_ds_status: payment.three_ds_status.map(|s| s.as_str().to_string()),
        },
    )
}
