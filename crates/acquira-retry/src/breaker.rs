use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use acquira_core::constants::{
    BREAKER_FAILURE_THRESHOLD, BREAKER_OPEN_TIMEOUT_SECS, BREAKER_SUCCESS_THRESHOLD,
};
use acquira_core::types::Timestamp;

/// Circuit states.
///
/// ```text
/// CLOSED -> OPEN        consecutive_failures >= failure_threshold
/// OPEN -> HALF_OPEN     open_timeout elapsed since opened_at
/// HALF_OPEN -> CLOSED   consecutive_successes >= success_threshold
/// HALF_OPEN -> OPEN     any failure
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Clone, Debug)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_secs: i64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: BREAKER_FAILURE_THRESHOLD,
            success_threshold: BREAKER_SUCCESS_THRESHOLD,
            open_timeout_secs: BREAKER_OPEN_TIMEOUT_SECS,
        }
    }
}

/// Read-only view of one breaker, for health reporting.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub opened_at: Option<Timestamp>,
}

struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Timestamp>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
        }
    }

    /// Effective state at `now`; performs the time-based OPEN -> HALF_OPEN
    /// transition. The opened_at timestamp is authoritative.
    fn tick(&mut self, now: Timestamp, open_timeout: i64) -> CircuitState {
        if self.state == CircuitState::Open {
            let opened = self.opened_at.unwrap_or(now);
            if now - opened >= open_timeout {
                self.state = CircuitState::HalfOpen;
                self.consecutive_successes = 0;
            }
        }
        self.state
    }
}

/// Per-PSP circuit breakers behind a single registry lock, so state
/// transitions observed from concurrent callers are linearizable per PSP.
///
/// Process-local and authoritative for a single-instance deployment; a
/// multi-instance fleet would mirror this into a shared store.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self { config, breakers: Mutex::new(HashMap::new()) }
    }

    /// May a call to `name` proceed at `now`? OPEN blocks; HALF_OPEN admits
    /// probe traffic.
    pub fn call_permitted(&self, name: &str, now: Timestamp) -> bool {
        let mut map = self.breakers.lock().expect("breaker lock");
        let breaker = map.entry(name.to_string()).or_insert_with(Breaker::new);
        breaker.tick(now, self.config.open_timeout_secs) != CircuitState::Open
    }

    /// Success resets the failure streak in any state and closes a
    /// HALF_OPEN circuit once the success threshold is met.
    pub fn record_success(&self, name: &str, now: Timestamp) {
        let mut map = self.breakers.lock().expect("breaker lock");
        let breaker = map.entry(name.to_string()).or_insert_with(Breaker::new);
        breaker.tick(now, self.config.open_timeout_secs);
        breaker.consecutive_failures = 0;
        match breaker.state {
            CircuitState::HalfOpen => {
                breaker.consecutive_successes += 1;
                if breaker.consecutive_successes >= self.config.success_threshold {
                    info!(psp = name, "circuit closed after successful probes");
                    breaker.state = CircuitState::Closed;
                    breaker.opened_at = None;
                    breaker.consecutive_successes = 0;
                }
            }
            CircuitState::Closed => {
                breaker.consecutive_successes = breaker.consecutive_successes.saturating_add(1);
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, name: &str, now: Timestamp) {
        let mut map = self.breakers.lock().expect("breaker lock");
        let breaker = map.entry(name.to_string()).or_insert_with(Breaker::new);
        breaker.tick(now, self.config.open_timeout_secs);
        breaker.consecutive_successes = 0;
        match breaker.state {
            CircuitState::Closed => {
                breaker.consecutive_failures += 1;
                if breaker.consecutive_failures >= self.config.failure_threshold {
                    warn!(psp = name, failures = breaker.consecutive_failures, "circuit opened");
                    breaker.state = CircuitState::Open;
                    breaker.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                warn!(psp = name, "probe failed; circuit re-opened");
                breaker.state = CircuitState::Open;
                breaker.opened_at = Some(now);
                breaker.consecutive_failures += 1;
            }
            CircuitState::Open => {
                breaker.consecutive_failures += 1;
            }
        }
    }

    pub fn state(&self, name: &str, now: Timestamp) -> CircuitState {
        let mut map = self.breakers.lock().expect("breaker lock");
        let breaker = map.entry(name.to_string()).or_insert_with(Breaker::new);
        breaker.tick(now, self.config.open_timeout_secs)
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let map = self.breakers.lock().expect("breaker lock");
        let mut out: Vec<CircuitSnapshot> = map
            .iter()
            .map(|(name, b)| CircuitSnapshot {
                name: name.clone(),
                state: b.state,
                consecutive_failures: b.consecutive_failures,
                consecutive_successes: b.consecutive_successes,
                opened_at: b.opened_at,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> BreakerRegistry {
        BreakerRegistry::default()
    }

    #[test]
    fn opens_after_exactly_threshold_failures() {
        let reg = registry();
        for i in 0..4 {
            reg.record_failure("stripe", i);
            assert_eq!(reg.state("stripe", i), CircuitState::Closed, "failure {i}");
        }
        reg.record_failure("stripe", 4);
        assert_eq!(reg.state("stripe", 4), CircuitState::Open);
        assert!(!reg.call_permitted("stripe", 5));
    }

    #[test]
    fn success_resets_failure_streak_in_closed() {
        let reg = registry();
        for i in 0..4 {
            reg.record_failure("adyen", i);
        }
        reg.record_success("adyen", 4);
        for i in 5..9 {
            reg.record_failure("adyen", i);
            assert_eq!(reg.state("adyen", i), CircuitState::Closed);
        }
    }

    #[test]
    fn open_half_open_closed_cycle() {
        let reg = registry();
        for i in 0..5 {
            reg.record_failure("stripe", i);
        }
        assert_eq!(reg.state("stripe", 10), CircuitState::Open);

        // Before the timeout the circuit still blocks.
        assert!(!reg.call_permitted("stripe", 4 + 29));
        // After the timeout it admits probes.
        assert!(reg.call_permitted("stripe", 4 + 30));
        assert_eq!(reg.state("stripe", 4 + 30), CircuitState::HalfOpen);

        reg.record_success("stripe", 35);
        reg.record_success("stripe", 36);
        assert_eq!(reg.state("stripe", 36), CircuitState::HalfOpen);
        reg.record_success("stripe", 37);
        assert_eq!(reg.state("stripe", 37), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let reg = registry();
        for i in 0..5 {
            reg.record_failure("stripe", i);
        }
        assert_eq!(reg.state("stripe", 40), CircuitState::HalfOpen);
        reg.record_failure("stripe", 41);
        assert_eq!(reg.state("stripe", 41), CircuitState::Open);
        // The re-open timestamp is fresh: still blocked 29 s later.
        assert!(!reg.call_permitted("stripe", 41 + 29));
        assert!(reg.call_permitted("stripe", 41 + 30));
    }

    #[test]
    fn breakers_are_independent_per_psp() {
        let reg = registry();
        for i in 0..5 {
            reg.record_failure("stripe", i);
        }
        assert_eq!(reg.state("stripe", 5), CircuitState::Open);
        assert_eq!(reg.state("adyen", 5), CircuitState::Closed);
        assert!(reg.call_permitted("adyen", 5));
    }
}
