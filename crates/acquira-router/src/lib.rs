//! PSP routing: priority-ordered selection among payment service providers
//! with retry, circuit breaking and failover. Declines are issuer decisions
//! and are never retried across providers.

pub mod client;
pub mod router;
pub mod sandbox;

pub use client::{AuthorizationRequest, PspAuthorization, PspClient};
pub use router::PspRouter;
pub use sandbox::{SandboxPsp, ScriptedPsp};
