use serde::{Deserialize, Serialize};

use acquira_core::types::Timestamp;
use acquira_retry::CircuitSnapshot;

/// JSON-RPC error codes, one per error kind.
pub const CODE_VALIDATION: i32 = -32001;
pub const CODE_AUTH: i32 = -32002;
pub const CODE_NOT_FOUND: i32 = -32004;
pub const CODE_CONFLICT: i32 = -32009;
pub const CODE_DECLINED: i32 = -32022;
pub const CODE_RATE_LIMITED: i32 = -32029;
pub const CODE_INTERNAL: i32 = -32603;

/// One audit-trail row for a payment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcPaymentEvent {
    pub event_id: String,
    pub kind: String,
    pub state_after: String,
    pub amount: String,
    pub currency: String,
    pub created_at: Timestamp,
}

/// Operational health: degradation mode plus per-PSP circuit states.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcHealth {
    pub mode: String,
    pub impaired: Vec<RpcImpairedDependency>,
    pub buffered_events: usize,
    pub circuits: Vec<CircuitSnapshot>,
    pub dead_letters: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcImpairedDependency {
    pub dependency: String,
    pub reason: Option<String>,
    pub since: Timestamp,
}

/// One parked DLQ task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcDeadLetter {
    pub transaction_id: String,
    pub psp_name: String,
    pub attempt_count: u32,
    pub last_error: String,
    pub created_at: Timestamp,
}

/// Currency conversion result. The rate is reported at scale 6.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcConversion {
    pub from: String,
    pub to: String,
    pub rate: String,
    pub amount: String,
    pub converted: String,
    pub provider: String,
}

/// 3-DS session poll response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcThreeDsStatus {
    pub session_id: String,
    pub status: String,
}
