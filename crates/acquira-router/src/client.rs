use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use acquira_core::error::GatewayError;
use acquira_core::money::{Amount, Currency};

/// What a PSP needs to authorize a payment. Carries the vault token, never
/// the PAN; 3-DS artifacts ride along when authentication happened.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub transaction_id: String,
    pub token: String,
    pub amount: Amount,
    pub currency: Currency,
    pub cavv: Option<String>,
    pub eci: Option<String>,
}

/// A successful authorization at one provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PspAuthorization {
    pub psp_name: String,
    pub psp_transaction_id: String,
}

/// Minimal provider interface. Implementations classify their failures
/// through `GatewayError`: `Declined` for issuer decisions, `Transport` /
/// `Timeout` for retryable conditions, `ProviderTerminal` for permanent
/// provider-side rejections.
#[async_trait]
pub trait PspClient: Send + Sync {
    fn name(&self) -> &str;

    async fn authorize(&self, req: &AuthorizationRequest) -> Result<PspAuthorization, GatewayError>;

    /// Capture a previously authorized transaction. Returns the capture id.
    async fn capture(
        &self,
        psp_transaction_id: &str,
        amount: Amount,
        currency: Currency,
    ) -> Result<String, GatewayError>;

    async fn void(&self, psp_transaction_id: &str) -> Result<(), GatewayError>;

    /// Refund a captured transaction. Returns the provider refund id.
    async fn refund(
        &self,
        psp_transaction_id: &str,
        amount: Amount,
        currency: Currency,
    ) -> Result<String, GatewayError>;
}
