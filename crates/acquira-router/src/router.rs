use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use acquira_core::constants::PSP_CALL_TIMEOUT_SECS;
use acquira_core::error::{ErrorKind, GatewayError};
use acquira_core::money::{Amount, Currency};
use acquira_core::types::now_ts;
use acquira_retry::{BackoffPolicy, BreakerRegistry, DeadLetterQueue};

use crate::client::{AuthorizationRequest, PspAuthorization, PspClient};

/// Priority router over the configured PSPs.
///
/// Authorization walks the merchant's priority list, wrapping each provider
/// call in the retry engine. Declines return immediately (an issuer decision
/// is not a provider failure); retryable and terminal provider errors advance
/// to the next PSP. Follow-up operations route back to the provider that
/// issued the original authorization.
pub struct PspRouter {
    clients: HashMap<String, Arc<dyn PspClient>>,
    breakers: Arc<BreakerRegistry>,
    backoff: BackoffPolicy,
    dlq: DeadLetterQueue,
    call_timeout: Duration,
}

impl PspRouter {
    pub fn new(
        clients: Vec<Arc<dyn PspClient>>,
        breakers: Arc<BreakerRegistry>,
        backoff: BackoffPolicy,
        dlq: DeadLetterQueue,
    ) -> Self {
        let clients = clients
            .into_iter()
            .map(|c| (c.name().to_string(), c))
            .collect();
        Self { clients, breakers, backoff, dlq, call_timeout: Duration::from_secs(PSP_CALL_TIMEOUT_SECS) }
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Authorize against the first available PSP in `priority` order.
    pub async fn authorize(
        &self,
        priority: &[String],
        req: &AuthorizationRequest,
    ) -> Result<PspAuthorization, GatewayError> {
        let mut last_err: Option<GatewayError> = None;
        // (psp, attempts, error) of the most recent exhausted retry run; only
        // parked if no later provider rescues the payment.
        let mut exhausted: Option<(String, u32, String)> = None;

        for psp_name in priority {
            let Some(client) = self.clients.get(psp_name) else {
                warn!(psp = %psp_name, "configured PSP has no client; skipping");
                continue;
            };
            if !self.breakers.call_permitted(psp_name, now_ts()) {
                debug!(psp = %psp_name, "circuit open; skipping PSP");
                last_err = Some(GatewayError::CircuitOpen(psp_name.clone()));
                continue;
            }

            let mut attempt: u32 = 1;
            loop {
                if !self.breakers.call_permitted(psp_name, now_ts()) {
                    last_err = Some(GatewayError::CircuitOpen(psp_name.clone()));
                    break;
                }

                let err = match tokio::time::timeout(self.call_timeout, client.authorize(req)).await
                {
                    Ok(Ok(auth)) => {
                        self.breakers.record_success(psp_name, now_ts());
                        info!(
                            psp = %psp_name,
                            transaction = %req.transaction_id,
                            psp_txn = %auth.psp_transaction_id,
                            "authorization approved"
                        );
                        return Ok(auth);
                    }
                    Ok(Err(e)) => e,
                    Err(_) => GatewayError::Timeout(psp_name.clone()),
                };

                match err.kind() {
                    // The provider answered; the issuer said no. Not retried
                    // here or at any other PSP.
                    ErrorKind::Declined => {
                        self.breakers.record_success(psp_name, now_ts());
                        info!(psp = %psp_name, transaction = %req.transaction_id, "issuer decline");
                        return Err(err);
                    }
                    ErrorKind::TerminalProvider => {
                        self.breakers.record_failure(psp_name, now_ts());
                        warn!(psp = %psp_name, error = %err, "terminal provider error; failing over");
                        last_err = Some(err);
                        break;
                    }
                    ErrorKind::Transient => {
                        self.breakers.record_failure(psp_name, now_ts());
                        if self.backoff.attempts_exhausted(attempt) {
                            warn!(
                                psp = %psp_name,
                                attempts = attempt,
                                error = %err,
                                "retries exhausted; failing over"
                            );
                            exhausted = Some((psp_name.clone(), attempt, err.to_string()));
                            last_err = Some(err);
                            break;
                        }
                        tokio::time::sleep(self.backoff.delay_with_jitter(attempt)).await;
                        attempt += 1;
                        last_err = Some(err);
                    }
                    _ => return Err(err),
                }
            }
        }

        if let Some((psp, attempts, error)) = exhausted {
            let payload = bincode::serialize(req)
                .map_err(|e| GatewayError::Serialization(e.to_string()))?;
            self.dlq.park(&req.transaction_id, &psp, payload, attempts, &error)?;
        }
        Err(last_err.unwrap_or(GatewayError::NoPspAvailable))
    }

    /// Capture against the PSP that authorized the payment.
    pub async fn capture(
        &self,
        psp_name: &str,
        psp_transaction_id: &str,
        amount: Amount,
        currency: Currency,
    ) -> Result<String, GatewayError> {
        let client = self.client(psp_name)?;
        self.execute_with_retries(psp_name, "capture", || {
            let client = Arc::clone(&client);
            let id = psp_transaction_id.to_string();
            async move { client.capture(&id, amount, currency).await }
        })
        .await
    }

    /// Void against the authorizing PSP.
    pub async fn void(&self, psp_name: &str, psp_transaction_id: &str) -> Result<(), GatewayError> {
        let client = self.client(psp_name)?;
        self.execute_with_retries(psp_name, "void", || {
            let client = Arc::clone(&client);
            let id = psp_transaction_id.to_string();
            async move { client.void(&id).await }
        })
        .await
    }

    /// Refund against the authorizing PSP. Returns the provider refund id.
    pub async fn refund(
        &self,
        psp_name: &str,
        psp_transaction_id: &str,
        amount: Amount,
        currency: Currency,
    ) -> Result<String, GatewayError> {
        let client = self.client(psp_name)?;
        self.execute_with_retries(psp_name, "refund", || {
            let client = Arc::clone(&client);
            let id = psp_transaction_id.to_string();
            async move { client.refund(&id, amount, currency).await }
        })
        .await
    }

    fn client(&self, psp_name: &str) -> Result<Arc<dyn PspClient>, GatewayError> {
        self.clients
            .get(psp_name)
            .cloned()
            .ok_or_else(|| GatewayError::Internal(format!("no client for PSP {psp_name}")))
    }

    /// Single-PSP retry loop shared by the follow-up operations.
    async fn execute_with_retries<T, F, Fut>(
        &self,
        psp_name: &str,
        op: &str,
        f: F,
    ) -> Result<T, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt: u32 = 1;
        loop {
            if !self.breakers.call_permitted(psp_name, now_ts()) {
                return Err(GatewayError::CircuitOpen(psp_name.to_string()));
            }
            let err = match tokio::time::timeout(self.call_timeout, f()).await {
                Ok(Ok(value)) => {
                    self.breakers.record_success(psp_name, now_ts());
                    return Ok(value);
                }
                Ok(Err(e)) => e,
                Err(_) => GatewayError::Timeout(psp_name.to_string()),
            };
            match err.kind() {
                ErrorKind::Transient => {
                    self.breakers.record_failure(psp_name, now_ts());
                    if self.backoff.attempts_exhausted(attempt) {
                        warn!(psp = psp_name, op, attempts = attempt, "retries exhausted");
                        return Err(err);
                    }
                    tokio::time::sleep(self.backoff.delay_with_jitter(attempt)).await;
                    attempt += 1;
                }
                ErrorKind::Declined => {
                    self.breakers.record_success(psp_name, now_ts());
                    return Err(err);
                }
                _ => {
                    self.breakers.record_failure(psp_name, now_ts());
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acquira_store::GatewayDb;

    use crate::sandbox::{SandboxPsp, ScriptedPsp};

    fn fast_backoff(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy { initial_delay_ms: 1, multiplier: 1.0, max_delay_ms: 2, max_attempts }
    }

    fn router_with(clients: Vec<Arc<dyn PspClient>>, max_attempts: u32) -> PspRouter {
        let db = Arc::new(GatewayDb::open_temporary().unwrap());
        PspRouter::new(
            clients,
            Arc::new(BreakerRegistry::default()),
            fast_backoff(max_attempts),
            DeadLetterQueue::new(db),
        )
    }

    fn request(amount: &str) -> AuthorizationRequest {
        AuthorizationRequest {
            transaction_id: "pay_router_test_000000000001".into(),
            token: "9532015112830366".into(),
            amount: Amount::parse(amount).unwrap(),
            currency: Currency::USD,
            cavv: None,
            eci: None,
        }
    }

    #[tokio::test]
    async fn failover_to_second_psp_on_retryable_error() {
        let stripe = Arc::new(ScriptedPsp::new("stripe").retryable("503"));
        let adyen = Arc::new(ScriptedPsp::new("adyen").approve());
        let router = router_with(
            vec![Arc::clone(&stripe) as Arc<dyn PspClient>, Arc::clone(&adyen) as Arc<dyn PspClient>],
            1,
        );

        let auth = router
            .authorize(&["stripe".into(), "adyen".into()], &request("20.00"))
            .await
            .unwrap();
        assert!(auth.psp_transaction_id.starts_with("adyen_"));
        assert_eq!(stripe.call_count(), 1);
        assert_eq!(adyen.call_count(), 1);
    }

    #[tokio::test]
    async fn decline_is_not_retried_across_psps() {
        let stripe = Arc::new(ScriptedPsp::new("stripe").decline("card_declined"));
        let adyen = Arc::new(ScriptedPsp::new("adyen").approve());
        let router = router_with(
            vec![Arc::clone(&stripe) as Arc<dyn PspClient>, Arc::clone(&adyen) as Arc<dyn PspClient>],
            3,
        );

        let err = router
            .authorize(&["stripe".into(), "adyen".into()], &request("20.00"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Declined);
        assert_eq!(adyen.call_count(), 0, "decline must not fail over");
    }

    #[tokio::test]
    async fn retryable_errors_are_retried_with_backoff() {
        let stripe = Arc::new(ScriptedPsp::new("stripe").retryable("a").retryable("b").approve());
        let router = router_with(vec![Arc::clone(&stripe) as Arc<dyn PspClient>], 5);

        let auth = router.authorize(&["stripe".into()], &request("20.00")).await.unwrap();
        assert!(auth.psp_transaction_id.starts_with("stripe_"));
        assert_eq!(stripe.call_count(), 3);
    }

    #[tokio::test]
    async fn circuit_open_skips_psp_entirely() {
        let stripe = Arc::new(ScriptedPsp::new("stripe"));
        let adyen = Arc::new(ScriptedPsp::new("adyen").approve());
        let router = router_with(
            vec![Arc::clone(&stripe) as Arc<dyn PspClient>, Arc::clone(&adyen) as Arc<dyn PspClient>],
            1,
        );
        // Trip stripe's breaker directly.
        for _ in 0..5 {
            router.breakers().record_failure("stripe", now_ts());
        }

        let auth = router
            .authorize(&["stripe".into(), "adyen".into()], &request("20.00"))
            .await
            .unwrap();
        assert!(auth.psp_transaction_id.starts_with("adyen_"));
        assert_eq!(stripe.call_count(), 0, "OPEN circuit must short-circuit the call");
    }

    #[tokio::test]
    async fn exhaustion_parks_task_in_dlq_once() {
        let stripe = Arc::new(
            ScriptedPsp::new("stripe").retryable("down").retryable("down").retryable("down"),
        );
        let db = Arc::new(GatewayDb::open_temporary().unwrap());
        let router = PspRouter::new(
            vec![Arc::clone(&stripe) as Arc<dyn PspClient>],
            Arc::new(BreakerRegistry::default()),
            fast_backoff(3),
            DeadLetterQueue::new(Arc::clone(&db)),
        );

        let err = router.authorize(&["stripe".into()], &request("20.00")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(stripe.call_count(), 3);

        let dlq = DeadLetterQueue::new(db);
        assert_eq!(dlq.len(), 1);
        let task = dlq.get("pay_router_test_000000000001").unwrap().unwrap();
        assert_eq!(task.attempt_count, 3);
        assert_eq!(task.psp_name, "stripe");
        assert!(!task.last_error.is_empty());
    }

    #[tokio::test]
    async fn all_psps_unavailable_yields_no_psp_error() {
        let router = router_with(vec![], 1);
        let err = router.authorize(&["stripe".into()], &request("20.00")).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoPspAvailable));
    }

    #[tokio::test]
    async fn sandbox_magic_values_drive_outcomes() {
        let stripe = Arc::new(SandboxPsp::new("stripe"));
        let router = router_with(vec![stripe as Arc<dyn PspClient>], 1);

        let mut declined = request("20.00");
        declined.token = "9532015112830002".into();
        let err = router.authorize(&["stripe".into()], &declined).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Declined);

        let ok = router.authorize(&["stripe".into()], &request("20.00")).await.unwrap();
        assert!(ok.psp_transaction_id.starts_with("stripe_"));
    }

    #[tokio::test]
    async fn follow_up_operations_route_to_original_psp() {
        let stripe = Arc::new(SandboxPsp::new("stripe"));
        let adyen = Arc::new(SandboxPsp::new("adyen"));
        let router = router_with(
            vec![stripe as Arc<dyn PspClient>, adyen as Arc<dyn PspClient>],
            1,
        );

        let auth = router.authorize(&["adyen".into()], &request("20.00")).await.unwrap();
        let cap = router
            .capture("adyen", &auth.psp_transaction_id, Amount::parse("20.00").unwrap(), Currency::USD)
            .await
            .unwrap();
        assert!(cap.starts_with("adyen_cap_"));
        // The wrong PSP does not recognize the transaction.
        let err = router
            .capture("stripe", &auth.psp_transaction_id, Amount::parse("20.00").unwrap(), Currency::USD)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TerminalProvider);
    }
}
