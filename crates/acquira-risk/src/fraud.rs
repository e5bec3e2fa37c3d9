use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use acquira_core::constants::{
    FRAUD_BLOCK_THRESHOLD, FRAUD_REVIEW_THRESHOLD, RISK_CALL_TIMEOUT_SECS,
    VELOCITY_CARD_PER_HOUR, VELOCITY_IP_PER_HOUR, VELOCITY_MERCHANT_PER_MINUTE,
};
use acquira_core::error::GatewayError;
use acquira_core::money::Amount;
use acquira_core::payment::FraudDecision;
use acquira_core::types::{now_ts, Timestamp};
use acquira_degrade::{DegradationController, Dependency};

// ── Input / output ───────────────────────────────────────────────────────────

/// Everything the fraud capability may inspect. Carries the PAN hash, never
/// the PAN.
#[derive(Clone, Debug)]
pub struct FraudInput {
    pub payment_id: String,
    pub merchant_id: String,
    pub amount: Amount,
    pub card_hash: String,
    pub client_ip: Option<String>,
    pub device_fingerprint: Option<String>,
    pub billing_country: String,
    pub ip_country: Option<String>,
    pub first_time_card: bool,
}

#[derive(Clone, Debug)]
pub struct FraudAssessment {
    pub score: f64,
    pub decision: FraudDecision,
    pub triggered_rules: Vec<String>,
    pub require_3ds: bool,
    /// True when the pluggable scorer was unreachable and the rule-based
    /// fallback produced the score.
    pub fallback: bool,
}

// ── Pluggable scorer ─────────────────────────────────────────────────────────

/// The ML scorer seam. The real model lives elsewhere; anything implementing
/// this can be plugged in via configuration.
#[async_trait]
pub trait FraudScorer: Send + Sync {
    async fn score(&self, input: &FraudInput) -> Result<f64, GatewayError>;
}

/// Deterministic stand-in used as the default scorer.
pub struct HeuristicScorer;

#[async_trait]
impl FraudScorer for HeuristicScorer {
    async fn score(&self, input: &FraudInput) -> Result<f64, GatewayError> {
        Ok(rule_based_score(input))
    }
}

/// Always returns the same score. Test helper.
pub struct FixedScorer(pub f64);

#[async_trait]
impl FraudScorer for FixedScorer {
    async fn score(&self, _input: &FraudInput) -> Result<f64, GatewayError> {
        Ok(self.0)
    }
}

/// Always unreachable. Exercises the fallback path in tests.
pub struct FailingScorer;

#[async_trait]
impl FraudScorer for FailingScorer {
    async fn score(&self, _input: &FraudInput) -> Result<f64, GatewayError> {
        Err(GatewayError::Transport("scorer unreachable".into()))
    }
}

/// Deterministic rule-based score: amount band, international mismatch,
/// first-time card. Used by the fallback and by [`HeuristicScorer`].
fn rule_based_score(input: &FraudInput) -> f64 {
    let mut score: f64 = 0.1;
    let minor = input.amount.minor_units();
    if minor >= 100_000 {
        score += 0.3;
    } else if minor >= 50_000 {
        score += 0.2;
    }
    if let Some(ip_country) = &input.ip_country {
        if !ip_country.eq_ignore_ascii_case(&input.billing_country) {
            score += 0.2;
        }
    }
    if input.first_time_card {
        score += 0.1;
    }
    score.clamp(0.0, 1.0)
}

// ── Blacklist ────────────────────────────────────────────────────────────────

/// IP / device / card-hash denylist, consulted before anything else.
#[derive(Default)]
pub struct Blacklist {
    ips: RwLock<HashSet<String>>,
    devices: RwLock<HashSet<String>>,
    card_hashes: RwLock<HashSet<String>>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ip(&self, ip: &str) {
        self.ips.write().expect("blacklist lock").insert(ip.to_string());
    }

    pub fn add_device(&self, device: &str) {
        self.devices.write().expect("blacklist lock").insert(device.to_string());
    }

    pub fn add_card_hash(&self, hash: &str) {
        self.card_hashes.write().expect("blacklist lock").insert(hash.to_string());
    }

    fn hit(&self, input: &FraudInput) -> Option<&'static str> {
        if let Some(ip) = &input.client_ip {
            if self.ips.read().expect("blacklist lock").contains(ip) {
                return Some("ip");
            }
        }
        if let Some(device) = &input.device_fingerprint {
            if self.devices.read().expect("blacklist lock").contains(device) {
                return Some("device");
            }
        }
        if self.card_hashes.read().expect("blacklist lock").contains(&input.card_hash) {
            return Some("card");
        }
        None
    }
}

// ── Sliding-window velocity ──────────────────────────────────────────────────

/// True sliding-window counter: per-key timestamp deques pruned on insert,
/// immune to the over-counting that naive TTL increments suffer under clock
/// skew.
struct VelocityTracker {
    windows: Mutex<HashMap<String, VecDeque<Timestamp>>>,
}

impl VelocityTracker {
    fn new() -> Self {
        Self { windows: Mutex::new(HashMap::new()) }
    }

    /// Record one hit for `key` and return the count within `window_secs`.
    fn record(&self, key: &str, now: Timestamp, window_secs: i64) -> usize {
        let mut windows = self.windows.lock().expect("velocity lock");
        let deque = windows.entry(key.to_string()).or_default();
        while deque.front().map(|t| now - t >= window_secs).unwrap_or(false) {
            deque.pop_front();
        }
        deque.push_back(now);
        deque.len()
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// The fraud capability: blacklist, velocity, geolocation and the pluggable
/// scorer, combined as `0.6*ml + 0.3*geo + 0.1*rules`, clamped to [0,1].
pub struct FraudEngine {
    scorer: Arc<dyn FraudScorer>,
    blacklist: Arc<Blacklist>,
    velocity: VelocityTracker,
    /// Country -> base risk in [0,1].
    country_risk: HashMap<String, f64>,
    degrade: Arc<DegradationController>,
}

impl FraudEngine {
    pub fn new(
        scorer: Arc<dyn FraudScorer>,
        blacklist: Arc<Blacklist>,
        country_risk: HashMap<String, f64>,
        degrade: Arc<DegradationController>,
    ) -> Self {
        Self { scorer, blacklist, velocity: VelocityTracker::new(), country_risk, degrade }
    }

    /// Score and decide. A blacklist hit blocks immediately with score 1.0;
    /// a velocity breach raises `VelocityLimitExceeded`.
    pub async fn evaluate(&self, input: &FraudInput) -> Result<FraudAssessment, GatewayError> {
        if let Some(kind) = self.blacklist.hit(input) {
            warn!(payment = %input.payment_id, kind, "blacklist hit");
            return Ok(FraudAssessment {
                score: 1.0,
                decision: FraudDecision::Block,
                triggered_rules: vec!["BLACKLIST_HIT".into()],
                require_3ds: true,
                fallback: false,
            });
        }

        self.check_velocity(input)?;

        let mut rules: Vec<String> = Vec::new();
        let geo = self.geo_risk(input, &mut rules);

        let (ml, fallback) = match tokio::time::timeout(
            Duration::from_secs(RISK_CALL_TIMEOUT_SECS),
            self.scorer.score(input),
        )
        .await
        {
            Ok(Ok(score)) => {
                self.degrade.mark_healthy(Dependency::FraudScorer);
                (score.clamp(0.0, 1.0), false)
            }
            Ok(Err(e)) => {
                self.degrade.mark_degraded(Dependency::FraudScorer, &e.to_string());
                rules.push("SCORER_FALLBACK".into());
                (rule_based_score(input), true)
            }
            Err(_) => {
                self.degrade.mark_degraded(Dependency::FraudScorer, "scorer timeout");
                rules.push("SCORER_FALLBACK".into());
                (rule_based_score(input), true)
            }
        };

        if input.amount.minor_units() >= 100_000 {
            rules.push("HIGH_AMOUNT".into());
        }
        if input.first_time_card {
            rules.push("FIRST_TIME_CARD".into());
        }

        let rule_component = (rules.len() as f64 / 10.0).min(1.0);
        let score = (0.6 * ml + 0.3 * geo + 0.1 * rule_component).clamp(0.0, 1.0);

        let decision = if score >= FRAUD_BLOCK_THRESHOLD {
            FraudDecision::Block
        } else if score >= FRAUD_REVIEW_THRESHOLD {
            FraudDecision::Review
        } else {
            FraudDecision::Clean
        };

        debug!(
            payment = %input.payment_id,
            score,
            decision = decision.as_str(),
            fallback,
            "fraud evaluated"
        );
        Ok(FraudAssessment {
            score,
            decision,
            triggered_rules: rules,
            require_3ds: decision != FraudDecision::Clean,
            fallback,
        })
    }

    fn check_velocity(&self, input: &FraudInput) -> Result<(), GatewayError> {
        let now = now_ts();
        if self.velocity.record(&format!("card:{}", input.card_hash), now, 3600)
            > VELOCITY_CARD_PER_HOUR
        {
            return Err(GatewayError::VelocityLimitExceeded("card".into()));
        }
        if let Some(ip) = &input.client_ip {
            if self.velocity.record(&format!("ip:{ip}"), now, 3600) > VELOCITY_IP_PER_HOUR {
                return Err(GatewayError::VelocityLimitExceeded("ip".into()));
            }
        }
        if self.velocity.record(&format!("merchant:{}", input.merchant_id), now, 60)
            > VELOCITY_MERCHANT_PER_MINUTE
        {
            return Err(GatewayError::VelocityLimitExceeded("merchant".into()));
        }
        Ok(())
    }

    /// Country-risk-list score combined with an IP/billing mismatch bump.
    fn geo_risk(&self, input: &FraudInput, rules: &mut Vec<String>) -> f64 {
        let mut geo = self
            .country_risk
            .get(&input.billing_country.to_uppercase())
            .copied()
            .unwrap_or(0.0);
        if let Some(ip_country) = &input.ip_country {
            if !ip_country.eq_ignore_ascii_case(&input.billing_country) {
                rules.push("GEO_MISMATCH".into());
                geo += 0.5;
            }
        }
        geo.clamp(0.0, 1.0)
    }
}
