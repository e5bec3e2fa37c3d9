use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;

use acquira_saga::{AuthorizeArgs, PaymentView};
use acquira_saga::service::RefundResult;

use crate::types::{
    RpcConversion, RpcDeadLetter, RpcHealth, RpcPaymentEvent, RpcThreeDsStatus,
};

/// Acquira gateway JSON-RPC 2.0 API definition.
///
/// All method names are prefixed with "acquira_" via `namespace = "acquira"`.
/// Mutating methods authenticate with the merchant API key and require an
/// idempotency key inside their arguments.
#[rpc(server, namespace = "acquira")]
pub trait AcquiraApi {
    /// Run the full authorization saga. A duplicate idempotency key with an
    /// identical payload replays the original response byte-for-byte; a
    /// decline surfaces as error code -32022 with the payment id in `data`.
    #[method(name = "authorizePayment")]
    async fn authorize_payment(&self, api_key: String, args: AuthorizeArgs)
        -> RpcResult<PaymentView>;

    /// Capture an authorized payment, in full or for a partial `amount`.
    #[method(name = "capturePayment")]
    async fn capture_payment(
        &self,
        api_key: String,
        merchant_id: String,
        payment_id: String,
        idempotency_key: String,
        amount: Option<String>,
    ) -> RpcResult<PaymentView>;

    /// Void an authorized (uncaptured) payment.
    #[method(name = "voidPayment")]
    async fn void_payment(
        &self,
        api_key: String,
        merchant_id: String,
        payment_id: String,
        idempotency_key: String,
    ) -> RpcResult<PaymentView>;

    /// Refund a captured payment; `amount` omitted means "everything
    /// refundable". Partial refunds may repeat until fully refunded.
    #[method(name = "refundPayment")]
    async fn refund_payment(
        &self,
        api_key: String,
        merchant_id: String,
        payment_id: String,
        idempotency_key: String,
        amount: Option<String>,
    ) -> RpcResult<RefundResult>;

    /// Fetch one payment.
    #[method(name = "getPayment")]
    async fn get_payment(
        &self,
        api_key: String,
        merchant_id: String,
        payment_id: String,
    ) -> RpcResult<PaymentView>;

    /// List the merchant's payments, newest first (limit capped at 200).
    #[method(name = "listPayments")]
    async fn list_payments(
        &self,
        api_key: String,
        merchant_id: String,
        offset: u32,
        limit: u32,
    ) -> RpcResult<Vec<PaymentView>>;

    /// Append-only audit trail for one payment.
    #[method(name = "getPaymentEvents")]
    async fn get_payment_events(
        &self,
        api_key: String,
        merchant_id: String,
        payment_id: String,
    ) -> RpcResult<Vec<RpcPaymentEvent>>;

    /// Poll a 3-DS challenge session.
    #[method(name = "getThreeDsStatus")]
    async fn get_three_ds_status(&self, session_id: String) -> RpcResult<RpcThreeDsStatus>;

    /// ACS callback: complete a pending challenge.
    #[method(name = "completeThreeDsChallenge")]
    async fn complete_three_ds_challenge(
        &self,
        session_id: String,
        passed: bool,
    ) -> RpcResult<RpcThreeDsStatus>;

    /// Convert an amount between currencies using the cached rate feed.
    #[method(name = "convertAmount")]
    async fn convert_amount(
        &self,
        amount: String,
        from: String,
        to: String,
    ) -> RpcResult<RpcConversion>;

    /// Degradation mode, impaired dependencies and circuit states.
    #[method(name = "getHealth")]
    async fn get_health(&self) -> RpcResult<RpcHealth>;

    /// Operational view of dead-lettered transactions.
    #[method(name = "getDeadLetters")]
    async fn get_dead_letters(&self, limit: u32) -> RpcResult<Vec<RpcDeadLetter>>;
}
