//! Revocation entry - a token invalidated before its natural expiry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationEntry {
    /// Hex SHA-256 of the compact token.
    pub digest: String,
    pub revoked_at: DateTime<Utc>,
    pub reason: Option<String>,
    /// The token's own expiry; the entry is useless after this.
    pub expires_at: DateTime<Utc>,
}

impl RevocationEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
