//! Token model - claims carried inside signed tokens.

use serde::{Deserialize, Serialize};

use super::Credential;

/// What a token may be used for. One signing key serves every purpose, so
/// the validator compares this claim against what the caller expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenPurpose {
    Access,
    Refresh,
    PasswordReset,
    EmailVerification,
}

impl TokenPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenPurpose::Access => "access",
            TokenPurpose::Refresh => "refresh",
            TokenPurpose::PasswordReset => "password_reset",
            TokenPurpose::EmailVerification => "email_verification",
        }
    }

    /// One-shot purposes are consumed on use and never refreshed.
    pub fn is_refreshable(&self) -> bool {
        matches!(self, TokenPurpose::Access | TokenPurpose::Refresh)
    }
}

impl std::fmt::Display for TokenPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity fields copied into every token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectClaims {
    pub subject_id: String,
    pub username: String,
    pub email: String,
    pub role: String,
}

impl From<&Credential> for SubjectClaims {
    fn from(c: &Credential) -> Self {
        Self {
            subject_id: c.subject_id.clone(),
            username: c.username.clone(),
            email: c.email.clone(),
            role: c.role.clone(),
        }
    }
}

impl From<&TokenClaims> for SubjectClaims {
    fn from(c: &TokenClaims) -> Self {
        Self {
            subject_id: c.sub.clone(),
            username: c.username.clone(),
            email: c.email.clone(),
            role: c.role.clone(),
        }
    }
}

/// Claims for every token class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject (user ID)
    pub sub: String,
    pub username: String,
    pub email: String,
    pub role: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Not before (Unix timestamp)
    pub nbf: i64,
    /// Expiration time (Unix timestamp, exclusive)
    pub exp: i64,
    /// Issuer
    pub iss: String,
    pub purpose: TokenPurpose,
    /// Token ID, unique per issuance
    pub jti: String,
}

/// Token pair returned after a successful login.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}
