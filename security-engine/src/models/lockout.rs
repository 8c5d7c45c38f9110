//! Login attempt and account lockout models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// One credential check, successful or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginAttempt {
    pub username: String,
    pub ip: IpAddr,
    pub attempted_at: DateTime<Utc>,
    pub success: bool,
    pub failure_reason: Option<String>,
}

/// A lock placed on an account after repeated failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountLockout {
    pub username: String,
    pub reason: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub unlocked_by: Option<String>,
    pub unlock_reason: Option<String>,
    pub unlocked_at: Option<DateTime<Utc>>,
}

impl AccountLockout {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.unlocked_at.is_none() && now < self.expires_at
    }
}

/// Answer to "may this username attempt a login right now?"
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockoutStatus {
    pub locked: bool,
    pub reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl LockoutStatus {
    pub fn unlocked() -> Self {
        Self {
            locked: false,
            reason: None,
            expires_at: None,
        }
    }

    pub fn from_lockout(lockout: &AccountLockout) -> Self {
        Self {
            locked: true,
            reason: Some(lockout.reason.clone()),
            expires_at: Some(lockout.expires_at),
        }
    }
}
