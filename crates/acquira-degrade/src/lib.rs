//! Graceful-degradation controller: per-dependency health, fallback gating,
//! and a bounded buffer that absorbs events while the bus is down.
//!
//! The saga and the event pipeline consult this controller before every
//! optional external call, so degraded modes take over transparently.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use acquira_core::constants::EVENT_BUFFER_CAPACITY;
use acquira_core::error::GatewayError;
use acquira_core::types::{now_ts, Timestamp};

// ── Dependencies & health ────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dependency {
    FraudScorer,
    ThreeDs,
    Cache,
    EventBus,
    FxProvider,
}

impl Dependency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dependency::FraudScorer => "fraud-scorer",
            Dependency::ThreeDs => "three-ds",
            Dependency::Cache => "cache",
            Dependency::EventBus => "event-bus",
            Dependency::FxProvider => "fx-provider",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub healthy: bool,
    pub reason: Option<String>,
    pub since: Timestamp,
}

/// Top-level operating mode: >2 impaired dependencies is severe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayMode {
    Normal,
    Degraded,
    SeverelyDegraded,
}

impl GatewayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayMode::Normal => "NORMAL",
            GatewayMode::Degraded => "DEGRADED",
            GatewayMode::SeverelyDegraded => "SEVERELY_DEGRADED",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthReport {
    pub mode: GatewayMode,
    pub impaired: Vec<(String, DependencyHealth)>,
    pub buffered_events: usize,
}

/// One event parked while the bus was unavailable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BufferedEvent {
    pub topic: String,
    pub key: String,
    pub payload: String,
    pub buffered_at: Timestamp,
}

// ── Controller ───────────────────────────────────────────────────────────────

pub struct DegradationController {
    states: Mutex<HashMap<Dependency, DependencyHealth>>,
    buffer: Mutex<VecDeque<BufferedEvent>>,
    buffer_capacity: usize,
}

impl DegradationController {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            buffer: Mutex::new(VecDeque::new()),
            buffer_capacity: EVENT_BUFFER_CAPACITY,
        }
    }

    #[cfg(test)]
    fn with_capacity(capacity: usize) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            buffer: Mutex::new(VecDeque::new()),
            buffer_capacity: capacity,
        }
    }

    pub fn mark_degraded(&self, dep: Dependency, reason: &str) {
        let mut states = self.states.lock().expect("state lock");
        let entry = states.entry(dep).or_insert_with(|| DependencyHealth {
            healthy: true,
            reason: None,
            since: now_ts(),
        });
        if entry.healthy {
            warn!(dependency = dep.as_str(), reason, "dependency degraded");
            entry.healthy = false;
            entry.since = now_ts();
        }
        entry.reason = Some(reason.to_string());
    }

    pub fn mark_healthy(&self, dep: Dependency) {
        let mut states = self.states.lock().expect("state lock");
        let entry = states.entry(dep).or_insert_with(|| DependencyHealth {
            healthy: true,
            reason: None,
            since: now_ts(),
        });
        if !entry.healthy {
            info!(dependency = dep.as_str(), "dependency recovered");
            entry.healthy = true;
            entry.reason = None;
            entry.since = now_ts();
        }
    }

    pub fn is_degraded(&self, dep: Dependency) -> bool {
        self.states
            .lock()
            .expect("state lock")
            .get(&dep)
            .map(|h| !h.healthy)
            .unwrap_or(false)
    }

    pub fn mode(&self) -> GatewayMode {
        let impaired = self
            .states
            .lock()
            .expect("state lock")
            .values()
            .filter(|h| !h.healthy)
            .count();
        match impaired {
            0 => GatewayMode::Normal,
            1..=2 => GatewayMode::Degraded,
            _ => GatewayMode::SeverelyDegraded,
        }
    }

    pub fn report(&self) -> HealthReport {
        let impaired = self
            .states
            .lock()
            .expect("state lock")
            .iter()
            .filter(|(_, h)| !h.healthy)
            .map(|(d, h)| (d.as_str().to_string(), h.clone()))
            .collect();
        HealthReport {
            mode: self.mode(),
            impaired,
            buffered_events: self.buffer.lock().expect("buffer lock").len(),
        }
    }

    /// Serve `cached` while the cache is healthy; fall back to the supplier
    /// (typically a DB read) otherwise, or when there is nothing cached.
    pub fn cache_fallback<T>(
        &self,
        cached: Option<T>,
        supplier: impl FnOnce() -> Result<T, GatewayError>,
    ) -> Result<T, GatewayError> {
        if !self.is_degraded(Dependency::Cache) {
            if let Some(value) = cached {
                return Ok(value);
            }
        }
        supplier()
    }

    // ── Event buffer ─────────────────────────────────────────────────────────

    /// Park an event while the bus is down. Drop-oldest on overflow.
    pub fn buffer_for_event_bus(&self, topic: &str, key: &str, payload: &str) {
        let mut buffer = self.buffer.lock().expect("buffer lock");
        if buffer.len() >= self.buffer_capacity {
            let dropped = buffer.pop_front();
            if let Some(d) = dropped {
                warn!(topic = %d.topic, key = %d.key, "event buffer full; dropped oldest");
            }
        }
        buffer.push_back(BufferedEvent {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.to_string(),
            buffered_at: now_ts(),
        });
    }

    /// Take everything buffered, oldest first.
    pub fn drain_buffered(&self) -> Vec<BufferedEvent> {
        self.buffer.lock().expect("buffer lock").drain(..).collect()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().expect("buffer lock").len()
    }
}

impl Default for DegradationController {
    fn default() -> Self {
        Self::new()
    }
}
