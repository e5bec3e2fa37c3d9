use thiserror::Error;

/// Coarse classification of an error, used for transport mapping and for the
/// retry engine. Kinds, not exceptions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Auth,
    Conflict,
    NotFound,
    RateLimited,
    Transient,
    TerminalProvider,
    Declined,
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    // ── Validation ───────────────────────────────────────────────────────────
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid currency: {0}")]
    InvalidCurrency(String),

    #[error("invalid card: {0}")]
    InvalidCard(String),

    #[error("invalid expiry: {0}")]
    InvalidExpiry(String),

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("idempotency key is required")]
    MissingIdempotencyKey,

    // ── AuthN / AuthZ ────────────────────────────────────────────────────────
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("merchant {0} is not permitted to perform this operation")]
    Forbidden(String),

    // ── Conflict ─────────────────────────────────────────────────────────────
    #[error("illegal payment transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("idempotency key reused with a different payload")]
    IdempotencyPayloadMismatch,

    #[error("a request with this idempotency key is already in flight")]
    IdempotencyInFlight,

    #[error("capture amount {requested} exceeds authorized {authorized}")]
    CaptureExceedsAuthorized { requested: String, authorized: String },

    #[error("refund amount {requested} exceeds refundable {refundable}")]
    RefundExceedsCaptured { requested: String, refundable: String },

    // ── NotFound ─────────────────────────────────────────────────────────────
    #[error("payment not found: {0}")]
    PaymentNotFound(String),

    #[error("card token not found or inactive")]
    TokenNotFound,

    #[error("merchant not found: {0}")]
    MerchantNotFound(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    // ── Rate limiting ────────────────────────────────────────────────────────
    #[error("rate limit exceeded; retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    // ── Transient (retryable) ────────────────────────────────────────────────
    #[error("deadline exceeded calling {0}")]
    Timeout(String),

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("event broker unavailable")]
    BrokerUnavailable,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no PSP available for merchant")]
    NoPspAvailable,

    #[error("no exchange rate available for {from}->{to}")]
    RateUnavailable { from: String, to: String },

    // ── Provider terminal ────────────────────────────────────────────────────
    #[error("provider rejected the request: {0}")]
    ProviderTerminal(String),

    // ── Issuer decline ───────────────────────────────────────────────────────
    #[error("payment declined: {code}")]
    Declined { code: String, message: String },

    // ── Risk ─────────────────────────────────────────────────────────────────
    #[error("blocked by blacklist: {0}")]
    BlacklistHit(String),

    #[error("velocity limit exceeded for {0}")]
    VelocityLimitExceeded(String),

    // ── Crypto / HSM ─────────────────────────────────────────────────────────
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("key already exists: {0}")]
    KeyExists(String),

    #[error("invalid key version {version} for key {key_id}")]
    InvalidKeyVersion { key_id: String, version: u32 },

    #[error("decryption failed")]
    DecryptionFailed,

    // ── Tokenization ─────────────────────────────────────────────────────────
    #[error("token space exhausted after bounded retries")]
    TokenSpaceExhausted,

    #[error("token is expired")]
    TokenExpired,

    #[error("token is revoked")]
    TokenRevoked,

    #[error("malformed token")]
    MalformedToken,

    // ── Events ───────────────────────────────────────────────────────────────
    #[error("event schema violation: {0}")]
    SchemaViolation(String),

    // ── Serialization / storage ──────────────────────────────────────────────
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),

    // ── General ──────────────────────────────────────────────────────────────
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        use GatewayError::*;
        match self {
            InvalidAmount(_) | InvalidCurrency(_) | InvalidCard(_) | InvalidExpiry(_)
            | InvalidField { .. } | MissingIdempotencyKey | MalformedToken => ErrorKind::Validation,

            Unauthenticated | Forbidden(_) => ErrorKind::Auth,

            IllegalTransition { .. }
            | IdempotencyPayloadMismatch
            | IdempotencyInFlight
            | CaptureExceedsAuthorized { .. }
            | RefundExceedsCaptured { .. }
            | KeyExists(_) => ErrorKind::Conflict,

            PaymentNotFound(_) | TokenNotFound | MerchantNotFound(_) | KeyNotFound(_) => {
                ErrorKind::NotFound
            }

            RateLimited { .. } => ErrorKind::RateLimited,

            Timeout(_) | CircuitOpen(_) | BrokerUnavailable | Transport(_) | NoPspAvailable
            | RateUnavailable { .. } => ErrorKind::Transient,

            ProviderTerminal(_) => ErrorKind::TerminalProvider,

            Declined { .. } | BlacklistHit(_) | VelocityLimitExceeded(_) => ErrorKind::Declined,

            UnsupportedAlgorithm(_) | InvalidKeyVersion { .. } | DecryptionFailed
            | TokenExpired | TokenRevoked | TokenSpaceExhausted | SchemaViolation(_)
            | Serialization(_) | Storage(_) | Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(GatewayError::Timeout("psp".into()).is_retryable());
        assert!(GatewayError::CircuitOpen("stripe".into()).is_retryable());
        assert!(GatewayError::BrokerUnavailable.is_retryable());
    }

    #[test]
    fn declines_and_validation_are_not_retryable() {
        let declined = GatewayError::Declined { code: "card_declined".into(), message: "do not honor".into() };
        assert!(!declined.is_retryable());
        assert_eq!(declined.kind(), ErrorKind::Declined);
        assert!(!GatewayError::InvalidCard("x".into()).is_retryable());
        let term = GatewayError::ProviderTerminal("bad request".into());
        assert_eq!(term.kind(), ErrorKind::TerminalProvider);
        assert!(!term.is_retryable());
    }
}
