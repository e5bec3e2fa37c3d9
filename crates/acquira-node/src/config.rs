use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use acquira_core::records::Merchant;
use acquira_core::types::{now_ts, MerchantId};

/// One onboarded merchant as configured. The API key is given in clear in
/// the params file and stored hashed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MerchantParams {
    pub id: String,
    pub name: String,
    pub api_key: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    /// PSP names in ascending priority order.
    pub psp_priority: Vec<String>,
}

impl MerchantParams {
    pub fn to_record(&self) -> Merchant {
        Merchant {
            id: MerchantId::new(&self.id),
            name: self.name.clone(),
            api_key_hash: hex::encode(Sha256::digest(self.api_key.as_bytes())),
            webhook_url: self.webhook_url.clone(),
            webhook_secret: self.webhook_secret.clone(),
            psp_priority: self.psp_priority.clone(),
            created_at: now_ts(),
        }
    }
}

/// One sandbox PSP to instantiate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PspParams {
    pub name: String,
    /// Amounts (decimal strings) this PSP fails retryably, for failover
    /// rehearsal.
    #[serde(default)]
    pub retryable_amounts: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BlacklistParams {
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub card_hashes: Vec<String>,
}

/// Full gateway configuration loaded from a JSON params file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayParams {
    pub merchants: Vec<MerchantParams>,
    pub psps: Vec<PspParams>,
    #[serde(default)]
    pub blacklist: BlacklistParams,
    /// ISO-3166-1 alpha-2 -> base risk in [0,1].
    #[serde(default)]
    pub country_risk: HashMap<String, f64>,
}

impl GatewayParams {
    /// Development defaults: one merchant, two sandbox PSPs, a seeded
    /// blacklist entry and a small country-risk list. Not for production.
    pub fn development() -> Self {
        let mut country_risk = HashMap::new();
        country_risk.insert("KP".to_string(), 0.9);
        country_risk.insert("IR".to_string(), 0.8);
        Self {
            merchants: vec![MerchantParams {
                id: "mer_dev".into(),
                name: "Development Merchant".into(),
                api_key: "dev_secret_key".into(),
                webhook_url: None,
                webhook_secret: None,
                psp_priority: vec!["stripe".into(), "adyen".into()],
            }],
            psps: vec![
                PspParams { name: "stripe".into(), retryable_amounts: vec!["13.00".into()] },
                PspParams { name: "adyen".into(), retryable_amounts: vec![] },
            ],
            blacklist: BlacklistParams { ips: vec!["41.0.0.1".into()], ..Default::default() },
            country_risk,
        }
    }
}
