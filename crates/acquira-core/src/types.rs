use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unix timestamp (seconds, UTC).
pub type Timestamp = i64;

/// Length of the random base62 suffix carried by every public identifier.
pub const ID_SUFFIX_LEN: usize = 24;

/// Generate `prefix` + 24 base62 characters from the OS RNG.
///
/// `Alphanumeric` samples uniformly over [A-Za-z0-9], which is exactly the
/// base62 alphabet.
pub fn new_prefixed_id(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{prefix}{suffix}")
}

/// Current wall-clock time as a Unix timestamp.
pub fn now_ts() -> Timestamp {
    chrono::Utc::now().timestamp()
}

/// Render a Unix timestamp as RFC-3339 UTC (used in event envelopes).
pub fn ts_to_rfc3339(ts: Timestamp) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

// ── PaymentId ────────────────────────────────────────────────────────────────

/// Public payment identifier: `pay_` + 24 base62 characters (28 total).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PaymentId(pub String);

impl PaymentId {
    pub fn generate() -> Self {
        Self(new_prefixed_id("pay_"))
    }

    pub fn parse(s: &str) -> Option<Self> {
        is_prefixed_id(s, "pay_").then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PaymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PaymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PaymentId({})", self.0)
    }
}

// ── EventId ──────────────────────────────────────────────────────────────────

/// Event identifier: `evt_` + 24 base62 characters.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    pub fn generate() -> Self {
        Self(new_prefixed_id("evt_"))
    }

    pub fn parse(s: &str) -> Option<Self> {
        is_prefixed_id(s, "evt_").then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.0)
    }
}

// ── TokenId ──────────────────────────────────────────────────────────────────

/// Card-token record identifier: `tok_` + 24 base62 characters.
///
/// This names the vault row, not the format-preserving token value itself.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenId(pub String);

impl TokenId {
    pub fn generate() -> Self {
        Self(new_prefixed_id("tok_"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenId({})", self.0)
    }
}

// ── MerchantId ───────────────────────────────────────────────────────────────

/// Opaque merchant identifier assigned at onboarding.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MerchantId(pub String);

impl MerchantId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MerchantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for MerchantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MerchantId({})", self.0)
    }
}

fn is_prefixed_id(s: &str, prefix: &str) -> bool {
    s.len() == prefix.len() + ID_SUFFIX_LEN
        && s.starts_with(prefix)
        && s[prefix.len()..].bytes().all(|b| b.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_ids_have_expected_shape() {
        let id = PaymentId::generate();
        assert_eq!(id.as_str().len(), 28);
        assert!(id.as_str().starts_with("pay_"));
        assert!(PaymentId::parse(id.as_str()).is_some());
    }

    #[test]
    fn parse_rejects_malformed_ids() {
        assert!(PaymentId::parse("pay_short").is_none());
        assert!(PaymentId::parse("evt_abcdefghijklmnopqrstuvwx").is_none());
        assert!(PaymentId::parse("pay_abcdefghijklmnopqrst-vwx").is_none());
    }

    #[test]
    fn generated_ids_are_distinct() {
        let a = EventId::generate();
        let b = EventId::generate();
        assert_ne!(a, b);
    }
}
