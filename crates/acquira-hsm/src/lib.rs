//! In-process HSM boundary: versioned AES-256-GCM keys with rotation and an
//! immutable audit trail. Raw key bytes never cross this crate's API.

pub mod audit;
pub mod service;

pub use audit::{AuditEntry, KeyOp};
pub use service::{EncryptedBlob, HsmKeyService, KeyInfo, AES_256_GCM};
