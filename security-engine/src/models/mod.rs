pub mod access_rule;
pub mod credential;
pub mod lockout;
pub mod request;
pub mod revocation;
pub mod security_event;
pub mod token;

pub use access_rule::{
    AccessContext, AccessControlRule, AccessDecision, AccessSubject, RuleConditions, RuleEffect,
    TimeWindow,
};
pub use credential::Credential;
pub use lockout::{AccountLockout, LockoutStatus, LoginAttempt};
pub use request::{Denial, ReasonCode, SecurityRequest, Verdict};
pub use revocation::RevocationEntry;
pub use security_event::{SecurityEvent, SecurityEventType, Severity};
pub use token::{SubjectClaims, TokenClaims, TokenPair, TokenPurpose};
