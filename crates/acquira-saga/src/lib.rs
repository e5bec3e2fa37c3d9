//! Saga orchestration for payment authorization, plus the single-step
//! capture / void / refund operations. The generic executor runs ordered
//! compensable steps; the authorization saga wires tokenization, fraud,
//! 3-D Secure, PSP routing and event publication together.

pub mod authorize;
pub mod executor;
pub mod service;

pub use authorize::{AuthorizationContext, AuthorizeArgs, CardDetails};
pub use executor::{SagaContext, SagaExecutor, SagaResult, SagaStep};
pub use service::{AuthorizeOutcome, PaymentGateway, PaymentView};
