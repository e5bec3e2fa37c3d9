//! ─── Gateway protocol constants ─────────────────────────────────────────────
//!
//! Defaults for retry, circuit breaking, idempotency, risk thresholds, event
//! delivery and webhook pacing. Anything operationally tunable lives in the
//! node's `GatewayParams`; these are the contract-level defaults.

// ── Card validation ──────────────────────────────────────────────────────────

/// Minimum / maximum PAN length in digits.
pub const PAN_MIN_LEN: usize = 13;
pub const PAN_MAX_LEN: usize = 19;

/// Card expiry may be at most this many calendar years in the future.
pub const EXPIRY_MAX_YEARS_AHEAD: i32 = 10;

// ── Retry engine ─────────────────────────────────────────────────────────────

/// First backoff delay.
pub const RETRY_INITIAL_DELAY_MS: u64 = 1_000;

/// Exponential multiplier between attempts.
pub const RETRY_MULTIPLIER: f64 = 2.0;

/// Backoff ceiling.
pub const RETRY_MAX_DELAY_MS: u64 = 60_000;

/// Attempts before a task is exhausted and dead-lettered.
pub const RETRY_MAX_ATTEMPTS: u32 = 5;

/// Jitter band applied multiplicatively to each delay.
pub const RETRY_JITTER_MIN: f64 = 0.8;
pub const RETRY_JITTER_MAX: f64 = 1.2;

// ── Circuit breaker ──────────────────────────────────────────────────────────

/// Consecutive failures that trip CLOSED -> OPEN.
pub const BREAKER_FAILURE_THRESHOLD: u32 = 5;

/// Consecutive successes that close HALF_OPEN -> CLOSED.
pub const BREAKER_SUCCESS_THRESHOLD: u32 = 3;

/// Seconds an OPEN circuit waits before probing HALF_OPEN.
pub const BREAKER_OPEN_TIMEOUT_SECS: i64 = 30;

// ── Idempotency ──────────────────────────────────────────────────────────────

/// Cached results live for 24 hours.
pub const IDEMPOTENCY_ENTRY_TTL_SECS: i64 = 24 * 3600;

/// Lock TTL; exceeds any plausible saga duration.
pub const IDEMPOTENCY_LOCK_TTL_SECS: i64 = 30;

/// Lock acquisition: retries at the given cadence, abandoning early if a
/// cached result appears.
pub const IDEMPOTENCY_LOCK_RETRIES: u32 = 10;
pub const IDEMPOTENCY_LOCK_RETRY_DELAY_MS: u64 = 100;

// ── Tokenization ─────────────────────────────────────────────────────────────

/// Bounded collision retries when generating a format-preserving token.
pub const TOKEN_MAX_COLLISION_RETRIES: u32 = 16;

// ── Fraud thresholds ─────────────────────────────────────────────────────────

/// Score at or above which the decision is BLOCK.
pub const FRAUD_BLOCK_THRESHOLD: f64 = 0.75;

/// Score at or above which the decision is REVIEW (and 3-DS is required).
pub const FRAUD_REVIEW_THRESHOLD: f64 = 0.50;

/// Sliding-window velocity limits.
pub const VELOCITY_CARD_PER_HOUR: usize = 10;
pub const VELOCITY_IP_PER_HOUR: usize = 20;
pub const VELOCITY_MERCHANT_PER_MINUTE: usize = 100;

// ── 3-D Secure ───────────────────────────────────────────────────────────────

/// Authentication sessions expire after ten minutes.
pub const THREE_DS_SESSION_TTL_SECS: i64 = 600;

/// Amounts at or above this (minor units) always take the challenge flow.
pub const THREE_DS_CHALLENGE_FLOOR_MINOR: i64 = 25_000;

// ── Event pipeline ───────────────────────────────────────────────────────────

/// Partition count for `payment-events`.
pub const EVENT_PARTITIONS: u32 = 3;

/// Consumer idempotency markers outlive producer retries and topic retention.
pub const EVENT_PROCESSED_TTL_SECS: i64 = 7 * 24 * 3600;

/// Processing failures before a message is moved to the event DLQ.
pub const EVENT_MAX_PROCESS_FAILURES: u32 = 3;

/// Degradation buffer capacity (drop-oldest on overflow).
pub const EVENT_BUFFER_CAPACITY: usize = 10_000;

// ── Webhooks ─────────────────────────────────────────────────────────────────

/// Retry delay: `WEBHOOK_BASE_DELAY_SECS * 2^(attempt-1)`, capped.
pub const WEBHOOK_BASE_DELAY_SECS: i64 = 60;
pub const WEBHOOK_MAX_DELAY_SECS: i64 = 3_600;
pub const WEBHOOK_MAX_ATTEMPTS: u32 = 5;

/// Background scheduler drains pending retries at this cadence.
pub const WEBHOOK_SCHEDULER_TICK_SECS: u64 = 60;

// ── Currency conversion ──────────────────────────────────────────────────────

/// Cached exchange rates are fresh for one hour.
pub const FX_CACHE_TTL_SECS: i64 = 3_600;

/// Exchange rates carry six fractional digits.
pub const FX_RATE_SCALE: u64 = 1_000_000;

// ── External call deadlines ──────────────────────────────────────────────────

pub const PSP_CALL_TIMEOUT_SECS: u64 = 10;
pub const RISK_CALL_TIMEOUT_SECS: u64 = 5;
pub const WEBHOOK_CALL_TIMEOUT_SECS: u64 = 15;

// ── Query surface ────────────────────────────────────────────────────────────

/// Pagination cap for list queries.
pub const MAX_PAGE_LIMIT: u32 = 200;
