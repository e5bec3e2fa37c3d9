use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use rand::RngCore;
use tracing::{debug, warn};

use acquira_core::constants::{
    RISK_CALL_TIMEOUT_SECS, THREE_DS_CHALLENGE_FLOOR_MINOR, THREE_DS_SESSION_TTL_SECS,
};
use acquira_core::error::GatewayError;
use acquira_core::money::Amount;
use acquira_core::types::{new_prefixed_id, now_ts, Timestamp};
use acquira_degrade::{DegradationController, Dependency};

// ── Wire types ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct BrowserInfo {
    pub user_agent: String,
    pub language: String,
    /// False for embedded/headless callers that cannot render a challenge.
    pub supports_challenge: bool,
}

/// Authentication artifacts issued on success.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticationData {
    pub cavv: String,
    pub eci: String,
    pub xid: String,
}

/// Outcome of `initiate` or of completing a challenge.
#[derive(Clone, Debug)]
pub enum ThreeDsOutcome {
    /// Authenticated without user interaction.
    Frictionless(AuthenticationData),
    /// The shopper must complete a challenge at `redirect_url`.
    ChallengeRequired { session_id: String, redirect_url: String },
    Failed { reason: String },
    Timeout,
    /// Card or ACS not participating; no authentication data, merchant
    /// retains liability. `fallback` marks degraded-mode answers.
    NotEnrolled { fallback: bool },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    Authenticated(AuthenticationData),
    Failed,
    Expired,
}

// ── ACS seam ─────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub enum AcsDecision {
    Frictionless,
    Challenge,
    NotEnrolled,
}

/// The issuer-side Access Control Server, pluggable like the fraud scorer.
#[async_trait]
pub trait AcsProvider: Send + Sync {
    async fn decide(
        &self,
        transaction_id: &str,
        amount: Amount,
        browser: &BrowserInfo,
    ) -> Result<AcsDecision, GatewayError>;
}

/// Deterministic stand-in: frictionless below the challenge floor, challenge
/// at or above it.
pub struct SandboxAcs;

#[async_trait]
impl AcsProvider for SandboxAcs {
    async fn decide(
        &self,
        _transaction_id: &str,
        amount: Amount,
        browser: &BrowserInfo,
    ) -> Result<AcsDecision, GatewayError> {
        if amount.minor_units() >= THREE_DS_CHALLENGE_FLOOR_MINOR {
            if browser.supports_challenge {
                Ok(AcsDecision::Challenge)
            } else {
                Ok(AcsDecision::NotEnrolled)
            }
        } else {
            Ok(AcsDecision::Frictionless)
        }
    }
}

/// Always unreachable; exercises the fallback. Test helper.
pub struct UnreachableAcs;

#[async_trait]
impl AcsProvider for UnreachableAcs {
    async fn decide(
        &self,
        _transaction_id: &str,
        _amount: Amount,
        _browser: &BrowserInfo,
    ) -> Result<AcsDecision, GatewayError> {
        Err(GatewayError::Transport("acs unreachable".into()))
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

struct Session {
    transaction_id: String,
    state: SessionStatus,
    expires_at: Timestamp,
}

// ── Service ──────────────────────────────────────────────────────────────────

/// 3-D Secure orchestration: frictionless vs challenge decisioning, session
/// bookkeeping for the browser round-trip, and degradation fallback.
pub struct ThreeDsService {
    acs: Arc<dyn AcsProvider>,
    sessions: Mutex<HashMap<String, Session>>,
    degrade: Arc<DegradationController>,
}

impl ThreeDsService {
    pub fn new(acs: Arc<dyn AcsProvider>, degrade: Arc<DegradationController>) -> Self {
        Self { acs, sessions: Mutex::new(HashMap::new()), degrade }
    }

    /// Start authentication for a transaction.
    pub async fn initiate(
        &self,
        transaction_id: &str,
        amount: Amount,
        browser: &BrowserInfo,
    ) -> ThreeDsOutcome {
        if self.degrade.is_degraded(Dependency::ThreeDs) {
            return ThreeDsOutcome::NotEnrolled { fallback: true };
        }

        let decision = match tokio::time::timeout(
            Duration::from_secs(RISK_CALL_TIMEOUT_SECS),
            self.acs.decide(transaction_id, amount, browser),
        )
        .await
        {
            Ok(Ok(d)) => {
                self.degrade.mark_healthy(Dependency::ThreeDs);
                d
            }
            Ok(Err(e)) => {
                warn!(transaction = transaction_id, error = %e, "ACS unreachable; 3-DS fallback");
                self.degrade.mark_degraded(Dependency::ThreeDs, &e.to_string());
                return ThreeDsOutcome::NotEnrolled { fallback: true };
            }
            Err(_) => {
                warn!(transaction = transaction_id, "ACS timeout; 3-DS fallback");
                self.degrade.mark_degraded(Dependency::ThreeDs, "acs timeout");
                return ThreeDsOutcome::NotEnrolled { fallback: true };
            }
        };

        match decision {
            AcsDecision::Frictionless => {
                let data = issue_authentication();
                debug!(transaction = transaction_id, "frictionless authentication");
                ThreeDsOutcome::Frictionless(data)
            }
            AcsDecision::Challenge => {
                let session_id = new_prefixed_id("tds_");
                let redirect_url = format!("https://acs.acquira.dev/challenge/{session_id}");
                self.sessions.lock().expect("session lock").insert(
                    session_id.clone(),
                    Session {
                        transaction_id: transaction_id.to_string(),
                        state: SessionStatus::Pending,
                        expires_at: now_ts() + THREE_DS_SESSION_TTL_SECS,
                    },
                );
                debug!(transaction = transaction_id, session = %session_id, "challenge required");
                ThreeDsOutcome::ChallengeRequired { session_id, redirect_url }
            }
            AcsDecision::NotEnrolled => ThreeDsOutcome::NotEnrolled { fallback: false },
        }
    }

    /// Status poll for the browser round-trip.
    pub fn session_status(&self, session_id: &str) -> Result<SessionStatus, GatewayError> {
        let mut sessions = self.sessions.lock().expect("session lock");
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| GatewayError::InvalidField {
                field: "session_id".into(),
                reason: "unknown 3-DS session".into(),
            })?;
        if session.expires_at <= now_ts() && session.state == SessionStatus::Pending {
            session.state = SessionStatus::Expired;
        }
        Ok(session.state.clone())
    }

    /// Challenge callback: the ACS reports whether the shopper passed.
    pub fn complete_challenge(
        &self,
        session_id: &str,
        passed: bool,
    ) -> Result<ThreeDsOutcome, GatewayError> {
        let mut sessions = self.sessions.lock().expect("session lock");
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| GatewayError::InvalidField {
                field: "session_id".into(),
                reason: "unknown 3-DS session".into(),
            })?;

        if session.expires_at <= now_ts() {
            session.state = SessionStatus::Expired;
            return Ok(ThreeDsOutcome::Timeout);
        }
        if session.state != SessionStatus::Pending {
            return Err(GatewayError::InvalidField {
                field: "session_id".into(),
                reason: "3-DS session already completed".into(),
            });
        }

        if passed {
            let data = issue_authentication();
            session.state = SessionStatus::Authenticated(data.clone());
            debug!(transaction = %session.transaction_id, session = session_id, "challenge passed");
            Ok(ThreeDsOutcome::Frictionless(data))
        } else {
            session.state = SessionStatus::Failed;
            Ok(ThreeDsOutcome::Failed { reason: "challenge failed".into() })
        }
    }

    /// Compensation hook: invalidate any session opened for a transaction.
    pub fn invalidate_sessions_for(&self, transaction_id: &str) {
        let mut sessions = self.sessions.lock().expect("session lock");
        sessions.retain(|_, s| s.transaction_id != transaction_id);
    }
}

/// Fresh CAVV/ECI/XID set. CAVV is 20 random bytes base64-encoded; ECI 05 is
/// "authenticated" for both major schemes' mapping here.
fn issue_authentication() -> AuthenticationData {
    let mut cavv_bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut cavv_bytes);
    AuthenticationData {
        cavv: base64::engine::general_purpose::STANDARD.encode(cavv_bytes),
        eci: "05".to_string(),
        xid: new_prefixed_id("xid_"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn browser() -> BrowserInfo {
        BrowserInfo {
            user_agent: "Mozilla/5.0".into(),
            language: "en-US".into(),
            supports_challenge: true,
        }
    }

    fn service() -> ThreeDsService {
        ThreeDsService::new(Arc::new(SandboxAcs), Arc::new(DegradationController::new()))
    }

    #[tokio::test]
    async fn small_amounts_are_frictionless() {
        let svc = service();
        match svc.initiate("pay_1", Amount::parse("20.00").unwrap(), &browser()).await {
            ThreeDsOutcome::Frictionless(data) => {
                assert!(!data.cavv.is_empty());
                assert_eq!(data.eci, "05");
                assert!(data.xid.starts_with("xid_"));
            }
            other => panic!("expected frictionless, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn large_amounts_require_challenge_and_complete() {
        let svc = service();
        let (session_id, redirect) =
            match svc.initiate("pay_2", Amount::parse("400.00").unwrap(), &browser()).await {
                ThreeDsOutcome::ChallengeRequired { session_id, redirect_url } => {
                    (session_id, redirect_url)
                }
                other => panic!("expected challenge, got {other:?}"),
            };
        assert!(redirect.contains(&session_id));
        assert_eq!(svc.session_status(&session_id).unwrap(), SessionStatus::Pending);

        match svc.complete_challenge(&session_id, true).unwrap() {
            ThreeDsOutcome::Frictionless(data) => assert_eq!(data.eci, "05"),
            other => panic!("expected authentication, got {other:?}"),
        }
        assert!(matches!(
            svc.session_status(&session_id).unwrap(),
            SessionStatus::Authenticated(_)
        ));
        // A second completion attempt is rejected.
        assert!(svc.complete_challenge(&session_id, true).is_err());
    }

    #[tokio::test]
    async fn failed_challenge_is_recorded() {
        let svc = service();
        let session_id =
            match svc.initiate("pay_3", Amount::parse("400.00").unwrap(), &browser()).await {
                ThreeDsOutcome::ChallengeRequired { session_id, .. } => session_id,
                other => panic!("expected challenge, got {other:?}"),
            };
        match svc.complete_challenge(&session_id, false).unwrap() {
            ThreeDsOutcome::Failed { .. } => {}
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(svc.session_status(&session_id).unwrap(), SessionStatus::Failed);
    }

    #[tokio::test]
    async fn acs_outage_falls_back_to_not_enrolled() {
        let degrade = Arc::new(DegradationController::new());
        let svc = ThreeDsService::new(Arc::new(UnreachableAcs), Arc::clone(&degrade));
        match svc.initiate("pay_4", Amount::parse("20.00").unwrap(), &browser()).await {
            ThreeDsOutcome::NotEnrolled { fallback } => assert!(fallback),
            other => panic!("expected fallback, got {other:?}"),
        }
        assert!(degrade.is_degraded(Dependency::ThreeDs));
    }

    #[tokio::test]
    async fn headless_caller_above_floor_is_not_enrolled() {
        let svc = service();
        let mut b = browser();
        b.supports_challenge = false;
        match svc.initiate("pay_5", Amount::parse("400.00").unwrap(), &b).await {
            ThreeDsOutcome::NotEnrolled { fallback } => assert!(!fallback),
            other => panic!("expected not enrolled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn compensation_invalidates_sessions() {
        let svc = service();
        let session_id =
            match svc.initiate("pay_6", Amount::parse("400.00").unwrap(), &browser()).await {
                ThreeDsOutcome::ChallengeRequired { session_id, .. } => session_id,
                other => panic!("expected challenge, got {other:?}"),
            };
        svc.invalidate_sessions_for("pay_6");
        assert!(svc.session_status(&session_id).is_err());
    }
}
