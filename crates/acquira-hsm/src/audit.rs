use serde::{Deserialize, Serialize};

use acquira_core::types::Timestamp;

/// Operation kinds recorded in the audit trail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyOp {
    Generate,
    Encrypt,
    Decrypt,
    Rotate,
    Inspect,
}

impl KeyOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyOp::Generate => "GENERATE",
            KeyOp::Encrypt => "ENCRYPT",
            KeyOp::Decrypt => "DECRYPT",
            KeyOp::Rotate => "ROTATE",
            KeyOp::Inspect => "INSPECT",
        }
    }
}

/// One immutable audit record. Carries metadata only; key material and
/// plaintext never appear here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub op: KeyOp,
    pub key_id: String,
    pub version: Option<u32>,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: Timestamp,
}
