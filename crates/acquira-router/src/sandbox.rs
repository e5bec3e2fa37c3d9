use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use acquira_core::error::GatewayError;
use acquira_core::money::{Amount, Currency};
use acquira_core::types::new_prefixed_id;

use crate::client::{AuthorizationRequest, PspAuthorization, PspClient};

// ── SandboxPsp ───────────────────────────────────────────────────────────────

/// Acquirer-sandbox style provider: behavior is driven by magic values in the
/// request, the way real PSP test environments work.
///
///   token ending "0002"  -> issuer decline (terminal for the payment)
///   token ending "0119"  -> retryable processor error on every attempt
///   amount in `retryable_amounts` -> retryable error (failover exercise)
///   anything else        -> approved, transaction id `{name}_` + base62
pub struct SandboxPsp {
    name: String,
    retryable_amounts: Vec<Amount>,
}

impl SandboxPsp {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), retryable_amounts: Vec::new() }
    }

    /// Make this sandbox fail retryably for the given amount.
    pub fn with_retryable_amount(mut self, amount: Amount) -> Self {
        self.retryable_amounts.push(amount);
        self
    }

    fn txn_id(&self) -> String {
        new_prefixed_id(&format!("{}_", self.name))
    }
}

#[async_trait]
impl PspClient for SandboxPsp {
    fn name(&self) -> &str {
        &self.name
    }

    async fn authorize(&self, req: &AuthorizationRequest) -> Result<PspAuthorization, GatewayError> {
        if req.token.ends_with("0002") {
            return Err(GatewayError::Declined {
                code: "card_declined".into(),
                message: "issuer declined: do not honor".into(),
            });
        }
        if req.token.ends_with("0119") {
            return Err(GatewayError::Transport(format!("{}: processor unavailable", self.name)));
        }
        if self.retryable_amounts.contains(&req.amount) {
            return Err(GatewayError::Transport(format!("{}: gateway timeout", self.name)));
        }
        Ok(PspAuthorization { psp_name: self.name.clone(), psp_transaction_id: self.txn_id() })
    }

    async fn capture(
        &self,
        psp_transaction_id: &str,
        _amount: Amount,
        _currency: Currency,
    ) -> Result<String, GatewayError> {
        if !psp_transaction_id.starts_with(&self.name) {
            return Err(GatewayError::ProviderTerminal("unknown transaction".into()));
        }
        Ok(new_prefixed_id(&format!("{}_cap_", self.name)))
    }

    async fn void(&self, psp_transaction_id: &str) -> Result<(), GatewayError> {
        if !psp_transaction_id.starts_with(&self.name) {
            return Err(GatewayError::ProviderTerminal("unknown transaction".into()));
        }
        Ok(())
    }

    async fn refund(
        &self,
        psp_transaction_id: &str,
        _amount: Amount,
        _currency: Currency,
    ) -> Result<String, GatewayError> {
        if !psp_transaction_id.starts_with(&self.name) {
            return Err(GatewayError::ProviderTerminal("unknown transaction".into()));
        }
        Ok(new_prefixed_id(&format!("{}_ref_", self.name)))
    }
}

// ── ScriptedPsp ──────────────────────────────────────────────────────────────

enum ScriptStep {
    Approve,
    Decline(String),
    Retryable(String),
    Terminal(String),
}

/// Deterministic provider for tests: plays back a scripted sequence of
/// outcomes and counts the calls it received.
pub struct ScriptedPsp {
    name: String,
    script: Mutex<VecDeque<ScriptStep>>,
    calls: Mutex<u32>,
}

impl ScriptedPsp {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), script: Mutex::new(VecDeque::new()), calls: Mutex::new(0) }
    }

    pub fn approve(self) -> Self {
        self.push(ScriptStep::Approve)
    }

    pub fn decline(self, code: &str) -> Self {
        self.push(ScriptStep::Decline(code.to_string()))
    }

    pub fn retryable(self, message: &str) -> Self {
        self.push(ScriptStep::Retryable(message.to_string()))
    }

    pub fn terminal(self, message: &str) -> Self {
        self.push(ScriptStep::Terminal(message.to_string()))
    }

    fn push(self, step: ScriptStep) -> Self {
        self.script.lock().expect("script lock").push_back(step);
        self
    }

    pub fn call_count(&self) -> u32 {
        *self.calls.lock().expect("call counter")
    }

    fn next_outcome(&self) -> Result<(), GatewayError> {
        *self.calls.lock().expect("call counter") += 1;
        // An exhausted script keeps approving.
        match self.script.lock().expect("script lock").pop_front() {
            None | Some(ScriptStep::Approve) => Ok(()),
            Some(ScriptStep::Decline(code)) => Err(GatewayError::Declined {
                code,
                message: "scripted decline".into(),
            }),
            Some(ScriptStep::Retryable(m)) => Err(GatewayError::Transport(m)),
            Some(ScriptStep::Terminal(m)) => Err(GatewayError::ProviderTerminal(m)),
        }
    }
}

#[async_trait]
impl PspClient for ScriptedPsp {
    fn name(&self) -> &str {
        &self.name
    }

    async fn authorize(&self, _req: &AuthorizationRequest) -> Result<PspAuthorization, GatewayError> {
        self.next_outcome().map(|_| PspAuthorization {
            psp_name: self.name.clone(),
            psp_transaction_id: new_prefixed_id(&format!("{}_", self.name)),
        })
    }

    async fn capture(
        &self,
        _psp_transaction_id: &str,
        _amount: Amount,
        _currency: Currency,
    ) -> Result<String, GatewayError> {
        self.next_outcome().map(|_| new_prefixed_id(&format!("{}_cap_", self.name)))
    }

    async fn void(&self, _psp_transaction_id: &str) -> Result<(), GatewayError> {
        self.next_outcome()
    }

    async fn refund(
        &self,
        _psp_transaction_id: &str,
        _amount: Amount,
        _currency: Currency,
    ) -> Result<String, GatewayError> {
        self.next_outcome().map(|_| new_prefixed_id(&format!("{}_ref_", self.name)))
    }
}
