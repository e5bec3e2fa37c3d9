//! Merchant-facing JSON-RPC 2.0 surface. The REST/TLS/rate-limit middleware
//! of a production deployment terminates elsewhere; these methods carry the
//! boundary contracts (authentication, idempotency keys, typed error codes).

pub mod api;
pub mod server;
pub mod types;

pub use api::AcquiraApiServer;
pub use server::{RpcServer, RpcServerState};
