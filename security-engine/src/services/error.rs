use chrono::{DateTime, Utc};
use service_core::error::AppError;
use service_core::retry::Retryable;
use thiserror::Error;

use crate::models::{Denial, ReasonCode, TokenPurpose};
use crate::services::password::PasswordViolation;

/// Failures of a backing store (credentials, audit, counters, revocations).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The record a write targets does not exist. A caller bug, not an outage.
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Redis(e) => {
                e.is_io_error() || e.is_timeout() || e.is_connection_dropped()
                    || e.is_connection_refusal()
            }
            StoreError::NotFound(_) | StoreError::Serialization(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum SecurityError {
    #[error("Malformed token")]
    MalformedToken,

    #[error("Invalid token signature")]
    InvalidSignature,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token not yet valid")]
    TokenNotYetValid,

    #[error("Token revoked")]
    TokenRevoked,

    #[error("Token purpose mismatch: expected {expected}, got {actual}")]
    TokenPurposeMismatch {
        expected: TokenPurpose,
        actual: TokenPurpose,
    },

    #[error("Token not eligible for refresh")]
    NotEligibleForRefresh,

    #[error("Account locked until {until}")]
    AccountLocked { until: DateTime<Utc> },

    #[error("Rate limited")]
    RateLimited { retry_after_seconds: Option<u64> },

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Password policy violation: {}", format_violations(.0))]
    PolicyViolation(Vec<PasswordViolation>),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_violations(violations: &[PasswordViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<StoreError> for SecurityError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => SecurityError::Internal(err.to_string()),
            other => SecurityError::StoreUnavailable(other.to_string()),
        }
    }
}

impl Retryable for SecurityError {
    fn is_retryable(&self) -> bool {
        matches!(self, SecurityError::StoreUnavailable(_))
    }
}

impl SecurityError {
    /// Stable machine-readable code. Internal only: token kinds stay distinct here.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SecurityError::MalformedToken => "malformed_token",
            SecurityError::InvalidSignature => "invalid_signature",
            SecurityError::TokenExpired => "token_expired",
            SecurityError::TokenNotYetValid => "token_not_yet_valid",
            SecurityError::TokenRevoked => "token_revoked",
            SecurityError::TokenPurposeMismatch { .. } => "token_purpose_mismatch",
            SecurityError::NotEligibleForRefresh => "not_eligible_for_refresh",
            SecurityError::AccountLocked { .. } => "account_locked",
            SecurityError::RateLimited { .. } => "rate_limited",
            SecurityError::AccessDenied(_) => "access_denied",
            SecurityError::PolicyViolation(_) => "policy_violation",
            SecurityError::InvalidCredentials => "invalid_credentials",
            SecurityError::StoreUnavailable(_) => "store_unavailable",
            SecurityError::Internal(_) => "internal_error",
        }
    }

    pub fn is_token_error(&self) -> bool {
        matches!(
            self,
            SecurityError::MalformedToken
                | SecurityError::InvalidSignature
                | SecurityError::TokenExpired
                | SecurityError::TokenNotYetValid
                | SecurityError::TokenRevoked
                | SecurityError::TokenPurposeMismatch { .. }
                | SecurityError::NotEligibleForRefresh
        )
    }

    /// What crosses the trust boundary. Authentication failures collapse into
    /// one message so callers cannot learn token state or account existence.
    pub fn public_message(&self) -> String {
        match self {
            e if e.is_token_error() => "Invalid or expired token".to_string(),
            SecurityError::InvalidCredentials => "Invalid credentials".to_string(),
            SecurityError::AccountLocked { .. } => {
                "Account temporarily locked. Please try again later.".to_string()
            }
            SecurityError::RateLimited { .. } => {
                "Too many requests. Please try again later.".to_string()
            }
            SecurityError::AccessDenied(_) => "Access denied".to_string(),
            SecurityError::PolicyViolation(violations) => format!(
                "Password does not meet policy: {}",
                format_violations(violations)
            ),
            SecurityError::StoreUnavailable(_) | SecurityError::Internal(_) => {
                "Service unavailable".to_string()
            }
            _ => "Request rejected".to_string(),
        }
    }

    /// Verdict-level denial for pipeline failures.
    pub fn to_denial(&self, now: DateTime<Utc>) -> Denial {
        match self {
            e if e.is_token_error() => Denial::new(ReasonCode::InvalidToken, e.public_message()),
            SecurityError::InvalidCredentials => {
                Denial::new(ReasonCode::InvalidToken, self.public_message())
            }
            SecurityError::AccountLocked { until } => {
                let wait = (*until - now).num_seconds().max(0) as u64;
                Denial::new(ReasonCode::AccountLocked, self.public_message())
                    .retry_after(Some(wait))
            }
            SecurityError::RateLimited {
                retry_after_seconds,
            } => Denial::new(ReasonCode::RateLimited, self.public_message())
                .retry_after(*retry_after_seconds),
            SecurityError::AccessDenied(_) | SecurityError::PolicyViolation(_) => {
                Denial::new(ReasonCode::AccessDenied, self.public_message())
            }
            _ => Denial::new(ReasonCode::ServiceUnavailable, self.public_message()),
        }
    }
}

impl From<SecurityError> for AppError {
    fn from(err: SecurityError) -> Self {
        let message = err.public_message();
        match err {
            e if e.is_token_error() => AppError::Unauthorized(anyhow::anyhow!(message)),
            SecurityError::InvalidCredentials => AppError::Unauthorized(anyhow::anyhow!(message)),
            SecurityError::AccountLocked { .. } => AppError::Locked(message, None),
            SecurityError::RateLimited {
                retry_after_seconds,
            } => AppError::TooManyRequests(message, retry_after_seconds),
            SecurityError::AccessDenied(_) => AppError::Forbidden(anyhow::anyhow!(message)),
            SecurityError::PolicyViolation(_) => AppError::BadRequest(anyhow::anyhow!(message)),
            SecurityError::StoreUnavailable(detail) => AppError::ServiceUnavailable(detail),
            SecurityError::Internal(detail) => AppError::InternalError(anyhow::anyhow!(detail)),
            // Remaining variants are token errors, handled by the first arm.
            other => AppError::Unauthorized(anyhow::anyhow!(other.public_message())),
        }
    }
}

impl From<Denial> for AppError {
    fn from(denial: Denial) -> Self {
        match denial.code {
            ReasonCode::InvalidToken => AppError::Unauthorized(anyhow::anyhow!(denial.message)),
            ReasonCode::AccessDenied | ReasonCode::AnomalyBlocked => {
                AppError::Forbidden(anyhow::anyhow!(denial.message))
            }
            ReasonCode::AccountLocked => AppError::Locked(denial.message, denial.retry_after),
            ReasonCode::RateLimited => {
                AppError::TooManyRequests(denial.message, denial.retry_after)
            }
            ReasonCode::ServiceUnavailable => AppError::ServiceUnavailable(denial.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_token_errors_share_public_message() {
        let messages: Vec<String> = [
            SecurityError::MalformedToken,
            SecurityError::InvalidSignature,
            SecurityError::TokenExpired,
            SecurityError::TokenRevoked,
        ]
        .iter()
        .map(|e| e.public_message())
        .collect();

        assert!(messages.iter().all(|m| m == &messages[0]));
    }

    #[test]
    fn test_reason_codes_stay_specific_internally() {
        assert_eq!(SecurityError::TokenRevoked.reason_code(), "token_revoked");
        assert_eq!(SecurityError::TokenExpired.reason_code(), "token_expired");
    }

    #[test]
    fn test_only_store_errors_are_retryable() {
        assert!(SecurityError::StoreUnavailable("down".into()).is_retryable());
        assert!(!SecurityError::TokenExpired.is_retryable());
        assert!(!SecurityError::AccessDenied("no".into()).is_retryable());
        assert!(StoreError::Unavailable("down".into()).is_retryable());
    }

    #[test]
    fn test_missing_record_is_not_an_outage() {
        let err = StoreError::NotFound("no credential for subject 7".into());
        assert!(!err.is_retryable());

        let err = SecurityError::from(err);
        assert!(matches!(err, SecurityError::Internal(_)));
        assert!(!err.is_retryable());
        assert_eq!(AppError::from(err).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_denial_statuses() {
        let now = Utc::now();
        assert_eq!(
            SecurityError::TokenRevoked.to_denial(now).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            SecurityError::AccessDenied("x".into()).to_denial(now).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            SecurityError::AccountLocked {
                until: now + chrono::Duration::seconds(30)
            }
            .to_denial(now),
            Denial::new(
                ReasonCode::AccountLocked,
                "Account temporarily locked. Please try again later."
            )
            .retry_after(Some(30))
        );
        assert_eq!(
            SecurityError::StoreUnavailable("redis".into())
                .to_denial(now)
                .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_conversion_to_app_error() {
        let app: AppError = SecurityError::RateLimited {
            retry_after_seconds: Some(5),
        }
        .into();
        assert_eq!(app.status(), StatusCode::TOO_MANY_REQUESTS);

        let app: AppError = SecurityError::InvalidCredentials.into();
        assert_eq!(app.status(), StatusCode::UNAUTHORIZED);
    }
}
