//! Services layer for the security engine.
//!
//! Each component owns one concern and receives its collaborators through
//! its constructor. [`crate::SecurityEngine`] wires them together.

pub mod access_control;
pub mod anomaly;
pub mod audit;
pub mod authentication;
pub mod clock;
pub mod credentials;
pub mod error;
pub mod jwt;
pub mod lockout;
pub mod orchestrator;
pub mod password;
pub mod rate_limit;
pub mod redis;
pub mod revocation;

pub use access_control::AccessControlEvaluator;
pub use anomaly::{AnomalyAssessment, AnomalyDetector, AnomalyFactors, AnomalyObservation};
pub use audit::{AuditSink, MemoryAuditSink, TracingAuditSink};
pub use authentication::Authenticator;
pub use clock::{Clock, ManualClock, SystemClock};
pub use credentials::{CredentialStore, InMemoryCredentialStore};
pub use error::{SecurityError, StoreError};
pub use jwt::{token_digest, TokenManager};
pub use lockout::LockoutManager;
pub use orchestrator::SecurityOrchestrator;
pub use password::{PasswordManager, PasswordViolation};
pub use rate_limit::{
    CounterStore, InMemoryCounterStore, RateDecision, RateLimitKey, RateLimiter, WindowDecision,
};
pub use self::redis::RedisService;
pub use revocation::{InMemoryRevocationStore, RevocationStore};
