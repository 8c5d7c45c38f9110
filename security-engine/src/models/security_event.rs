//! Security event model - write-once records handed to the audit sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::SecurityRequest;

/// Security event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    AccessGranted,
    AccessDenied,
    InvalidTokenUsage,
    RateLimited,
    AccountLocked,
    AccountUnlocked,
    LoginSucceeded,
    LoginFailed,
    Logout,
    TokenRefreshed,
    PasswordChanged,
    PasswordResetRequested,
    PasswordReset,
    EmailVerified,
    AnomalyDetected,
    RequestAborted,
}

impl SecurityEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventType::AccessGranted => "access_granted",
            SecurityEventType::AccessDenied => "access_denied",
            SecurityEventType::InvalidTokenUsage => "invalid_token_usage",
            SecurityEventType::RateLimited => "rate_limited",
            SecurityEventType::AccountLocked => "account_locked",
            SecurityEventType::AccountUnlocked => "account_unlocked",
            SecurityEventType::LoginSucceeded => "login_succeeded",
            SecurityEventType::LoginFailed => "login_failed",
            SecurityEventType::Logout => "logout",
            SecurityEventType::TokenRefreshed => "token_refreshed",
            SecurityEventType::PasswordChanged => "password_changed",
            SecurityEventType::PasswordResetRequested => "password_reset_requested",
            SecurityEventType::PasswordReset => "password_reset",
            SecurityEventType::EmailVerified => "email_verified",
            SecurityEventType::AnomalyDetected => "anomaly_detected",
            SecurityEventType::RequestAborted => "request_aborted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    fn base_risk(&self) -> f64 {
        match self {
            Severity::Info => 0.1,
            Severity::Warning => 0.5,
            Severity::Critical => 0.9,
        }
    }
}

/// Security audit log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: String,
    pub subject_id: Option<String>,
    pub event_type: SecurityEventType,
    pub severity: Severity,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub resource: Option<String>,
    pub action: Option<String>,
    /// Specific cause, kept for audit even when the caller saw a generic reason.
    pub details: String,
    pub risk_score: f64,
    pub anomaly_score: f64,
    pub blocked: bool,
    pub created_at: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn new(
        event_type: SecurityEventType,
        severity: Severity,
        details: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            subject_id: None,
            event_type,
            severity,
            ip: None,
            user_agent: None,
            resource: None,
            action: None,
            details: details.into(),
            risk_score: severity.base_risk(),
            anomaly_score: 0.0,
            blocked: false,
            created_at,
        }
    }

    /// Event describing the outcome of a pipeline request.
    pub fn for_request(
        event_type: SecurityEventType,
        severity: Severity,
        request: &SecurityRequest,
        details: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut event = Self::new(event_type, severity, details, created_at);
        event.ip = Some(request.ip.to_string());
        event.user_agent = request.user_agent.clone();
        event.resource = Some(request.resource.clone());
        event.action = Some(request.action.clone());
        event
    }

    pub fn subject(mut self, subject_id: Option<String>) -> Self {
        self.subject_id = subject_id;
        self
    }

    pub fn ip(mut self, ip: impl ToString) -> Self {
        self.ip = Some(ip.to_string());
        self
    }

    pub fn blocked(mut self, blocked: bool) -> Self {
        self.blocked = blocked;
        self
    }

    /// Risk never drops below what the severity implies.
    pub fn anomaly(mut self, score: f64) -> Self {
        self.anomaly_score = score;
        self.risk_score = self.severity.base_risk().max(score);
        self
    }
}
