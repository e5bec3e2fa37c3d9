pub mod card;
pub mod constants;
pub mod context;
pub mod error;
pub mod event;
pub mod money;
pub mod payment;
pub mod records;
pub mod types;

pub use card::{CardBrand, CardExpiry, Pan};
pub use constants::*;
pub use context::RequestContext;
pub use error::{ErrorKind, GatewayError};
pub use event::{PaymentEvent, PaymentEventKind};
pub use money::{Amount, Currency};
pub use payment::{
    BillingAddress, FraudDecision, Payment, PaymentStatus, Refund, ThreeDsStatus,
};
pub use records::{
    CardTokenRecord, ExchangeRate, FraudAlert, IdempotencyEntry, Merchant, RetryTask,
    WebhookDelivery, WebhookStatus,
};
pub use types::*;
