//! Risk capabilities: fraud scoring (blacklist, velocity, geolocation, a
//! pluggable scorer) and 3-D Secure authentication, each with a
//! deterministic fallback driven by the degradation controller.

pub mod fraud;
pub mod threeds;

pub use fraud::{
    Blacklist, FailingScorer, FixedScorer, FraudAssessment, FraudEngine, FraudInput, FraudScorer,
    HeuristicScorer,
};
pub use threeds::{
    AcsDecision, AcsProvider, AuthenticationData, BrowserInfo, SandboxAcs, SessionStatus,
    ThreeDsOutcome, ThreeDsService, UnreachableAcs,
};
