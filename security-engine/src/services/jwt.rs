use chrono::Duration;
use jsonwebtoken::{
    decode, decode_header, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header,
    Validation,
};
use service_core::retry::{retry_async, RetryConfig};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use super::clock::Clock;
use super::error::SecurityError;
use super::revocation::RevocationStore;
use crate::config::TokenConfig;
use crate::models::{RevocationEntry, SubjectClaims, TokenClaims, TokenPair, TokenPurpose};

/// Hex SHA-256 of the compact token. Revocations are keyed by this, never by the token.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Issues, validates, refreshes and revokes HS256 tokens.
pub struct TokenManager {
    config: TokenConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    clock: Arc<dyn Clock>,
    revocations: Arc<dyn RevocationStore>,
    retry: RetryConfig,
}

impl TokenManager {
    pub fn new(
        config: TokenConfig,
        clock: Arc<dyn Clock>,
        revocations: Arc<dyn RevocationStore>,
        retry: RetryConfig,
    ) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.expose());
        let decoding_key = DecodingKey::from_secret(config.secret.expose());

        // Time claims are checked against the injected clock, not the system one.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.leeway = 0;
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "nbf", "iss", "sub"]);

        tracing::info!(issuer = %config.issuer, "Token manager initialized with HS256");

        Self {
            config,
            encoding_key,
            decoding_key,
            validation,
            clock,
            revocations,
            retry,
        }
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    pub fn issue(
        &self,
        subject: &SubjectClaims,
        purpose: TokenPurpose,
        ttl: Duration,
    ) -> Result<String, SecurityError> {
        let now = self.clock.now();
        let claims = TokenClaims {
            sub: subject.subject_id.clone(),
            username: subject.username.clone(),
            email: subject.email.clone(),
            role: subject.role.clone(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: (now + ttl).timestamp(),
            iss: self.config.issuer.clone(),
            purpose,
            jti: Uuid::new_v4().to_string(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| SecurityError::Internal(format!("Failed to encode token: {}", e)))
    }

    /// Issue with the configured TTL for `purpose`.
    pub fn issue_for(
        &self,
        subject: &SubjectClaims,
        purpose: TokenPurpose,
    ) -> Result<String, SecurityError> {
        self.issue(subject, purpose, self.config.ttl_for(purpose))
    }

    pub fn issue_pair(&self, subject: &SubjectClaims) -> Result<TokenPair, SecurityError> {
        Ok(TokenPair {
            access_token: self.issue_for(subject, TokenPurpose::Access)?,
            refresh_token: self.issue_for(subject, TokenPurpose::Refresh)?,
            token_type: "Bearer".to_string(),
            expires_in: self.config.access_ttl_seconds,
        })
    }

    /// Signature and shape only.
    fn decode_verified(&self, token: &str) -> Result<TokenClaims, SecurityError> {
        let header = decode_header(token).map_err(|_| SecurityError::MalformedToken)?;
        if header.alg != Algorithm::HS256 {
            return Err(SecurityError::InvalidSignature);
        }

        decode::<TokenClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature
                | ErrorKind::InvalidAlgorithm
                | ErrorKind::InvalidAlgorithmName
                | ErrorKind::InvalidIssuer => SecurityError::InvalidSignature,
                ErrorKind::ExpiredSignature => SecurityError::TokenExpired,
                ErrorKind::ImmatureSignature => SecurityError::TokenNotYetValid,
                _ => SecurityError::MalformedToken,
            })
    }

    /// Signature, validity window, revocation and purpose, in that order.
    async fn verify_unexpired(&self, token: &str) -> Result<TokenClaims, SecurityError> {
        let claims = self.decode_verified(token)?;

        let now = self.clock.now();
        let ts = now.timestamp();
        if ts < claims.nbf {
            return Err(SecurityError::TokenNotYetValid);
        }
        if ts >= claims.exp {
            return Err(SecurityError::TokenExpired);
        }

        let digest = token_digest(token);
        let revoked = retry_async(&self.retry, "revocation.is_revoked", || {
            self.revocations.is_revoked(&digest, now)
        })
        .await?;
        if revoked {
            return Err(SecurityError::TokenRevoked);
        }

        Ok(claims)
    }

    pub async fn validate(
        &self,
        token: &str,
        expected: TokenPurpose,
    ) -> Result<TokenClaims, SecurityError> {
        let claims = self.verify_unexpired(token).await?;

        if claims.purpose != expected {
            return Err(SecurityError::TokenPurposeMismatch {
                expected,
                actual: claims.purpose,
            });
        }

        Ok(claims)
    }

    /// Exchange a token close to expiry for a fresh one of the same purpose.
    /// The old token is revoked.
    pub async fn refresh(&self, token: &str) -> Result<String, SecurityError> {
        let claims = self.verify_unexpired(token).await?;

        if !claims.purpose.is_refreshable() {
            return Err(SecurityError::NotEligibleForRefresh);
        }

        let remaining = claims.exp - self.clock.now().timestamp();
        if remaining > self.config.refresh_window_seconds {
            return Err(SecurityError::NotEligibleForRefresh);
        }

        self.claim(token, "refreshed").await?;
        let fresh = self.issue_for(&SubjectClaims::from(&claims), claims.purpose)?;

        tracing::info!(subject = %claims.sub, purpose = %claims.purpose, "Token refreshed");
        Ok(fresh)
    }

    /// Validate a single-use token and claim it in one step.
    pub async fn consume(
        &self,
        token: &str,
        expected: TokenPurpose,
        reason: &str,
    ) -> Result<TokenClaims, SecurityError> {
        let claims = self.validate(token, expected).await?;
        self.claim(token, reason).await?;
        Ok(claims)
    }

    /// Revoke as the claim on a single-use token. Only the caller whose
    /// revocation inserted the entry may go on; everyone else gets `TokenRevoked`.
    pub async fn claim(&self, token: &str, reason: &str) -> Result<(), SecurityError> {
        if self.revoke(token, Some(reason)).await? {
            Ok(())
        } else {
            tracing::warn!(reason, "Single-use token redeemed twice");
            Err(SecurityError::TokenRevoked)
        }
    }

    /// Idempotent. Returns whether this call inserted the entry.
    pub async fn revoke(&self, token: &str, reason: Option<&str>) -> Result<bool, SecurityError> {
        let now = self.clock.now();

        // Entries live as long as the token could; unverifiable tokens get the longest TTL.
        let expires_at = match self.decode_verified(token) {
            Ok(claims) => chrono::DateTime::from_timestamp(claims.exp, 0)
                .unwrap_or_else(|| now + self.config.longest_ttl()),
            Err(_) => now + self.config.longest_ttl(),
        };

        let entry = RevocationEntry {
            digest: token_digest(token),
            revoked_at: now,
            reason: reason.map(str::to_string),
            expires_at,
        };

        let inserted = retry_async(&self.retry, "revocation.revoke", || {
            self.revocations.revoke(entry.clone())
        })
        .await?;

        tracing::info!(
            reason = reason.unwrap_or("unspecified"),
            newly_revoked = inserted,
            "Token revoked"
        );
        Ok(inserted)
    }

    pub async fn is_revoked(&self, token: &str) -> Result<bool, SecurityError> {
        let digest = token_digest(token);
        let now = self.clock.now();
        let revoked = retry_async(&self.retry, "revocation.is_revoked", || {
            self.revocations.is_revoked(&digest, now)
        })
        .await?;
        Ok(revoked)
    }

    pub async fn purge_revocations(&self) -> Result<usize, SecurityError> {
        let purged = self.revocations.purge_expired(self.clock.now()).await?;
        if purged > 0 {
            tracing::debug!(purged, "Purged expired revocations");
        }
        Ok(purged)
    }
}
