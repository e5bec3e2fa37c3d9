use std::net::SocketAddr;
use std::sync::Arc;

use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObject;
use sha2::{Digest, Sha256};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use acquira_core::error::{ErrorKind, GatewayError};
use acquira_core::money::{Amount, Currency};
use acquira_core::records::Merchant;
use acquira_core::types::{MerchantId, PaymentId};
use acquira_fx::CurrencyConverter;
use acquira_risk::{SessionStatus, ThreeDsOutcome};
use acquira_saga::service::RefundResult;
use acquira_saga::{AuthorizeArgs, AuthorizeOutcome, PaymentGateway, PaymentView};

use crate::api::AcquiraApiServer;
use crate::types::{
    RpcConversion, RpcDeadLetter, RpcHealth, RpcImpairedDependency, RpcPaymentEvent,
    RpcThreeDsStatus, CODE_AUTH, CODE_CONFLICT, CODE_DECLINED, CODE_INTERNAL, CODE_NOT_FOUND,
    CODE_RATE_LIMITED, CODE_VALIDATION,
};

fn rpc_err(code: i32, msg: impl Into<String>) -> ErrorObject<'static> {
    ErrorObject::owned(code, msg.into(), None::<()>)
}

/// Map a gateway error onto the documented JSON-RPC code space.
fn map_err(e: GatewayError) -> ErrorObject<'static> {
    let code = match e.kind() {
        ErrorKind::Validation => CODE_VALIDATION,
        ErrorKind::Auth => CODE_AUTH,
        ErrorKind::NotFound => CODE_NOT_FOUND,
        ErrorKind::Conflict => CODE_CONFLICT,
        ErrorKind::Declined => CODE_DECLINED,
        ErrorKind::RateLimited => CODE_RATE_LIMITED,
        ErrorKind::Transient | ErrorKind::TerminalProvider | ErrorKind::Internal => CODE_INTERNAL,
    };
    rpc_err(code, e.to_string())
}

fn declined_err(payment_id: String, code: String, message: String) -> ErrorObject<'static> {
    ErrorObject::owned(
        CODE_DECLINED,
        format!("{code}: {message}"),
        Some(serde_json::json!({ "payment_id": payment_id, "code": code })),
    )
}

/// Shared state behind the RPC server.
pub struct RpcServerState {
    pub gateway: Arc<PaymentGateway>,
    pub converter: Arc<CurrencyConverter>,
}

/// The RPC server implementation.
pub struct RpcServer {
    state: Arc<RpcServerState>,
}

impl RpcServer {
    pub fn new(state: Arc<RpcServerState>) -> Self {
        Self { state }
    }

    /// Start the JSON-RPC server on `addr` with permissive CORS headers.
    /// Returns a handle to stop it.
    pub async fn start(self, addr: SocketAddr) -> anyhow::Result<ServerHandle> {
        let cors = CorsLayer::new()
            .allow_methods(Any)
            .allow_origin(Any)
            .allow_headers(Any);

        let server = Server::builder()
            .set_http_middleware(tower::ServiceBuilder::new().layer(cors))
            .build(addr)
            .await?;

        let module = self.into_rpc();
        let handle = server.start(module);
        info!(%addr, "RPC server started");
        Ok(handle)
    }

    /// Verify the caller's API key against the merchant record.
    fn authenticate(&self, merchant_id: &str, api_key: &str) -> Result<Merchant, ErrorObject<'static>> {
        let merchant = self
            .state
            .gateway
            .core()
            .db
            .get_merchant(&MerchantId::new(merchant_id))
            .map_err(map_err)?
            .ok_or_else(|| rpc_err(CODE_AUTH, "unknown merchant or bad credentials"))?;
        let presented = hex::encode(Sha256::digest(api_key.as_bytes()));
        if presented != merchant.api_key_hash {
            return Err(rpc_err(CODE_AUTH, "unknown merchant or bad credentials"));
        }
        Ok(merchant)
    }
}

fn session_status_str(status: &SessionStatus) -> &'static str {
    match status {
        SessionStatus::Pending => "PENDING",
        SessionStatus::Authenticated(_) => "AUTHENTICATED",
        SessionStatus::Failed => "FAILED",
        SessionStatus::Expired => "EXPIRED",
    }
}

#[async_trait]
impl AcquiraApiServer for RpcServer {
    async fn authorize_payment(
        &self,
        api_key: String,
        args: AuthorizeArgs,
    ) -> RpcResult<PaymentView> {
        self.authenticate(&args.merchant_id, &api_key)?;
        match self.state.gateway.authorize(args).await {
            Ok(AuthorizeOutcome::Approved { payment }) => Ok(payment),
            Ok(AuthorizeOutcome::Declined { payment_id, code, message }) => {
                Err(declined_err(payment_id, code, message))
            }
            Err(e) => Err(map_err(e)),
        }
    }

    async fn capture_payment(
        &self,
        api_key: String,
        merchant_id: String,
        payment_id: String,
        idempotency_key: String,
        amount: Option<String>,
    ) -> RpcResult<PaymentView> {
        self.authenticate(&merchant_id, &api_key)?;
        self.state
            .gateway
            .capture(&merchant_id, &payment_id, &idempotency_key, amount)
            .await
            .map_err(map_err)
    }

    async fn void_payment(
        &self,
        api_key: String,
        merchant_id: String,
        payment_id: String,
        idempotency_key: String,
    ) -> RpcResult<PaymentView> {
        self.authenticate(&merchant_id, &api_key)?;
        self.state
            .gateway
            .void(&merchant_id, &payment_id, &idempotency_key)
            .await
            .map_err(map_err)
    }

    async fn refund_payment(
        &self,
        api_key: String,
        merchant_id: String,
        payment_id: String,
        idempotency_key: String,
        amount: Option<String>,
    ) -> RpcResult<RefundResult> {
        self.authenticate(&merchant_id, &api_key)?;
        self.state
            .gateway
            .refund(&merchant_id, &payment_id, &idempotency_key, amount)
            .await
            .map_err(map_err)
    }

    async fn get_payment(
        &self,
        api_key: String,
        merchant_id: String,
        payment_id: String,
    ) -> RpcResult<PaymentView> {
        self.authenticate(&merchant_id, &api_key)?;
        self.state.gateway.get_payment(&merchant_id, &payment_id).map_err(map_err)
    }

    async fn list_payments(
        &self,
        api_key: String,
        merchant_id: String,
        offset: u32,
        limit: u32,
    ) -> RpcResult<Vec<PaymentView>> {
        self.authenticate(&merchant_id, &api_key)?;
        self.state.gateway.list_payments(&merchant_id, offset, limit).map_err(map_err)
    }

    async fn get_payment_events(
        &self,
        api_key: String,
        merchant_id: String,
        payment_id: String,
    ) -> RpcResult<Vec<RpcPaymentEvent>> {
        self.authenticate(&merchant_id, &api_key)?;
        // Ownership check rides on the payment fetch.
        self.state.gateway.get_payment(&merchant_id, &payment_id).map_err(map_err)?;
        let id = PaymentId::parse(&payment_id)
            .ok_or_else(|| rpc_err(CODE_NOT_FOUND, "payment not found"))?;
        let events = self.state.gateway.core().db.payment_events(&id).map_err(map_err)?;
        Ok(events
            .into_iter()
            .map(|e| RpcPaymentEvent {
                event_id: e.id.as_str().to_string(),
                kind: e.kind.as_str().to_string(),
                state_after: e.state_after.as_str().to_string(),
                amount: e.amount.to_string(),
                currency: e.currency.as_str().to_string(),
                created_at: e.created_at,
            })
            .collect())
    }

    async fn get_three_ds_status(&self, session_id: String) -> RpcResult<RpcThreeDsStatus> {
        let status = self
            .state
            .gateway
            .core()
            .threeds
            .session_status(&session_id)
            .map_err(map_err)?;
        Ok(RpcThreeDsStatus { session_id, status: session_status_str(&status).to_string() })
    }

    async fn complete_three_ds_challenge(
        &self,
        session_id: String,
        passed: bool,
    ) -> RpcResult<RpcThreeDsStatus> {
        let outcome = self
            .state
            .gateway
            .core()
            .threeds
            .complete_challenge(&session_id, passed)
            .map_err(map_err)?;
        let status = match outcome {
            ThreeDsOutcome::Frictionless(_) => "AUTHENTICATED",
            ThreeDsOutcome::Failed { .. } => "FAILED",
            ThreeDsOutcome::Timeout => "EXPIRED",
            _ => "PENDING",
        };
        Ok(RpcThreeDsStatus { session_id, status: status.to_string() })
    }

    async fn convert_amount(
        &self,
        amount: String,
        from: String,
        to: String,
    ) -> RpcResult<RpcConversion> {
        let amount = Amount::parse(&amount).map_err(map_err)?;
        let from = Currency::parse(&from).map_err(map_err)?;
        let to = Currency::parse(&to).map_err(map_err)?;
        let (converted, rate) = self.state.converter.convert(amount, from, to).await.map_err(map_err)?;
        Ok(RpcConversion {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
            rate: format!("{}.{:06}", rate.rate_micros / 1_000_000, rate.rate_micros % 1_000_000),
            amount: amount.to_string(),
            converted: converted.to_string(),
            provider: rate.provider,
        })
    }

    async fn get_health(&self) -> RpcResult<RpcHealth> {
        let core = self.state.gateway.core();
        let report = core.degrade.report();
        Ok(RpcHealth {
            mode: report.mode.as_str().to_string(),
            impaired: report
                .impaired
                .into_iter()
                .map(|(dependency, health)| RpcImpairedDependency {
                    dependency,
                    reason: health.reason,
                    since: health.since,
                })
                .collect(),
            buffered_events: report.buffered_events,
            circuits: core.router.breakers().snapshot(),
            dead_letters: core.db.count_dead_letters(),
        })
    }

    async fn get_dead_letters(&self, limit: u32) -> RpcResult<Vec<RpcDeadLetter>> {
        let tasks = self
            .state
            .gateway
            .core()
            .db
            .dead_letters(limit.min(acquira_core::constants::MAX_PAGE_LIMIT) as usize)
            .map_err(map_err)?;
        Ok(tasks
            .into_iter()
            .map(|t| RpcDeadLetter {
                transaction_id: t.transaction_id,
                psp_name: t.psp_name,
                attempt_count: t.attempt_count,
                last_error: t.last_error,
                created_at: t.created_at,
            })
            .collect())
    }
}
