//! Pipeline input and output: the request as the engine sees it and the verdict.

use axum::http::StatusCode;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;

use super::TokenClaims;

/// Everything the pipeline needs to know about one inbound request.
#[derive(Debug, Clone)]
pub struct SecurityRequest {
    pub ip: IpAddr,
    pub user_agent: Option<String>,
    pub bearer_token: Option<String>,
    /// Set when the request is itself a login for this username.
    pub username: Option<String>,
    pub resource: String,
    pub action: String,
    pub location: Option<String>,
    pub device: Option<String>,
    pub session: HashMap<String, String>,
}

impl SecurityRequest {
    pub fn new(ip: IpAddr, resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            ip,
            user_agent: None,
            bearer_token: None,
            username: None,
            resource: resource.into(),
            action: action.into(),
            location: None,
            device: None,
            session: HashMap::new(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn with_session_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.session.insert(key.into(), value.into());
        self
    }
}

/// Stable reason codes exposed across the trust boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    InvalidToken,
    AccessDenied,
    AccountLocked,
    RateLimited,
    AnomalyBlocked,
    ServiceUnavailable,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::InvalidToken => "invalid_token",
            ReasonCode::AccessDenied => "access_denied",
            ReasonCode::AccountLocked => "account_locked",
            ReasonCode::RateLimited => "rate_limited",
            ReasonCode::AnomalyBlocked => "anomaly_blocked",
            ReasonCode::ServiceUnavailable => "service_unavailable",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ReasonCode::InvalidToken => StatusCode::UNAUTHORIZED,
            ReasonCode::AccessDenied | ReasonCode::AnomalyBlocked => StatusCode::FORBIDDEN,
            ReasonCode::AccountLocked => StatusCode::LOCKED,
            ReasonCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ReasonCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// A denial as the HTTP layer sees it. `message` is already generic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub code: ReasonCode,
    pub message: String,
    pub retry_after: Option<u64>,
}

impl Denial {
    pub fn new(code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn retry_after(mut self, seconds: Option<u64>) -> Self {
        self.retry_after = seconds;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.code.status()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Allow {
        claims: Option<TokenClaims>,
        anomaly_score: f64,
        /// Anomalous but not blocked.
        flagged: bool,
    },
    Deny(Denial),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow { .. })
    }

    pub fn denial(&self) -> Option<&Denial> {
        match self {
            Verdict::Deny(denial) => Some(denial),
            Verdict::Allow { .. } => None,
        }
    }
}
