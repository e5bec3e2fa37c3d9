use serde::{Deserialize, Serialize};

use crate::types::{new_prefixed_id, MerchantId};

/// Per-request context threaded explicitly through all core calls (no
/// thread-local logger state). The logging adapter reads identifiers from
/// here; sensitive card fields never enter the context.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestContext {
    pub request_id: String,
    pub correlation_id: String,
    pub trace_id: String,
    pub merchant_id: MerchantId,
    pub client_ip: Option<String>,
    pub device_fingerprint: Option<String>,
}

impl RequestContext {
    pub fn new(merchant_id: MerchantId) -> Self {
        let request_id = new_prefixed_id("req_");
        Self {
            correlation_id: request_id.clone(),
            trace_id: new_prefixed_id("trc_"),
            request_id,
            merchant_id,
            client_ip: None,
            device_fingerprint: None,
        }
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    pub fn with_device(mut self, fingerprint: impl Into<String>) -> Self {
        self.device_fingerprint = Some(fingerprint.into());
        self
    }
}
