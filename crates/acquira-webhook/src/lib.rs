//! Webhook delivery: HMAC-SHA256-signed merchant notifications with
//! exponential backoff retries and a background drain scheduler.

pub mod delivery;
pub mod signature;

pub use delivery::{HttpTransport, WebhookDeliveryService, WebhookTransport};
pub use signature::{sign_payload, verify_signature};
