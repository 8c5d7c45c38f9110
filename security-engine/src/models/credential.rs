//! Credential model - stored password material for a subject.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Credential record owned by the credential store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub subject_id: String,
    pub username: String,
    pub email: String,
    pub role: String,
    /// PHC-encoded hash; carries its own algorithm and parameters.
    pub password_hash: String,
    /// Prior hashes, most recent first, bounded by the password policy.
    #[serde(default)]
    pub password_history: Vec<String>,
    pub password_changed_at: DateTime<Utc>,
    #[serde(default)]
    pub email_verified: bool,
}

impl Credential {
    pub fn new(
        subject_id: impl Into<String>,
        username: impl Into<String>,
        email: impl Into<String>,
        role: impl Into<String>,
        password_hash: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            username: username.into(),
            email: email.into(),
            role: role.into(),
            password_hash,
            password_history: Vec::new(),
            password_changed_at: now,
            email_verified: false,
        }
    }

    /// Replace the current hash, pushing the old one onto the bounded history.
    pub fn rotate_password(&mut self, new_hash: String, history_size: usize, now: DateTime<Utc>) {
        let previous = std::mem::replace(&mut self.password_hash, new_hash);
        self.password_history.insert(0, previous);
        self.password_history.truncate(history_size);
        self.password_changed_at = now;
    }
}
