use service_core::retry::{retry_async, RetryConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::access_control::AccessControlEvaluator;
use super::anomaly::{AnomalyDetector, AnomalyObservation};
use super::audit::AuditSink;
use super::clock::Clock;
use super::error::SecurityError;
use super::jwt::TokenManager;
use super::lockout::LockoutManager;
use super::rate_limit::{RateLimitKey, RateLimiter};
use crate::models::{
    AccessContext, AccessSubject, Denial, ReasonCode, SecurityEvent, SecurityEventType,
    SecurityRequest, Severity, TokenClaims, TokenPurpose, Verdict,
};

/// A terminal outcome and the one event that records it.
struct Outcome {
    verdict: Verdict,
    event: SecurityEvent,
}

/// Runs every check for one request, in a fixed order, and fails closed.
///
/// Order: IP rate limit, token, lockout, subject rate limit, access control,
/// anomaly. The first failing check decides the verdict. Exactly one
/// [`SecurityEvent`] is emitted per evaluated request.
pub struct SecurityOrchestrator {
    tokens: Arc<TokenManager>,
    lockout: Arc<LockoutManager>,
    rate_limiter: Arc<RateLimiter>,
    anomaly: Arc<AnomalyDetector>,
    access: Arc<AccessControlEvaluator>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
    check_timeout: Duration,
}

impl SecurityOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tokens: Arc<TokenManager>,
        lockout: Arc<LockoutManager>,
        rate_limiter: Arc<RateLimiter>,
        anomaly: Arc<AnomalyDetector>,
        access: Arc<AccessControlEvaluator>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        retry: RetryConfig,
        check_timeout: Duration,
    ) -> Self {
        Self {
            tokens,
            lockout,
            rate_limiter,
            anomaly,
            access,
            audit,
            clock,
            retry,
            check_timeout,
        }
    }

    /// Evaluate with no caller-side cancellation.
    pub async fn check(&self, request: &SecurityRequest) -> Verdict {
        self.evaluate(request, &CancellationToken::new()).await
    }

    /// Cancellation or an exceeded check budget deny with 503; they never allow.
    #[instrument(skip_all, fields(ip = %request.ip, resource = %request.resource, action = %request.action))]
    pub async fn evaluate(&self, request: &SecurityRequest, cancel: &CancellationToken) -> Verdict {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => self.aborted(request, "request cancelled"),
            result = tokio::time::timeout(self.check_timeout, self.run_pipeline(request)) => {
                match result {
                    Ok(outcome) => outcome,
                    Err(_) => self.aborted(request, "security checks timed out"),
                }
            }
        };

        let Outcome { verdict, event } = outcome;
        match retry_async(&self.retry, "audit.record", || self.audit.record(&event)).await {
            Ok(()) => verdict,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    event_type = event.event_type.as_str(),
                    "Audit sink unavailable, denying"
                );
                Verdict::Deny(
                    SecurityError::StoreUnavailable(e.to_string()).to_denial(self.clock.now()),
                )
            }
        }
    }

    fn aborted(&self, request: &SecurityRequest, details: &str) -> Outcome {
        tracing::warn!(details, "Security pipeline aborted");
        let now = self.clock.now();
        Outcome {
            verdict: Verdict::Deny(Denial::new(
                ReasonCode::ServiceUnavailable,
                "Service unavailable",
            )),
            event: SecurityEvent::for_request(
                SecurityEventType::RequestAborted,
                Severity::Critical,
                request,
                details,
                now,
            )
            .blocked(true),
        }
    }

    /// Deny outcome for a failed check. The event keeps the specific cause.
    fn denied(
        &self,
        request: &SecurityRequest,
        event_type: SecurityEventType,
        error: SecurityError,
        subject: Option<String>,
        details: String,
    ) -> Outcome {
        let now = self.clock.now();
        let severity = match error {
            SecurityError::StoreUnavailable(_) | SecurityError::Internal(_) => Severity::Critical,
            _ => Severity::Warning,
        };
        Outcome {
            verdict: Verdict::Deny(error.to_denial(now)),
            event: SecurityEvent::for_request(event_type, severity, request, details, now)
                .subject(subject)
                .blocked(true),
        }
    }

    fn infrastructure_failure(
        &self,
        request: &SecurityRequest,
        error: SecurityError,
        subject: Option<String>,
    ) -> Outcome {
        let details = format!("{}: {}", error.reason_code(), error);
        self.denied(request, SecurityEventType::RequestAborted, error, subject, details)
    }

    async fn rate_limited(
        &self,
        request: &SecurityRequest,
        key: RateLimitKey,
        subject: Option<&str>,
    ) -> Option<Outcome> {
        let subject = subject.map(str::to_string);
        match self.rate_limiter.check(&key).await {
            Ok(decision) if decision.allowed => None,
            Ok(decision) => Some(self.denied(
                request,
                SecurityEventType::RateLimited,
                SecurityError::RateLimited {
                    retry_after_seconds: decision.retry_after,
                },
                subject,
                format!("{:?} exceeded {} requests", key, decision.limit),
            )),
            Err(e) => Some(self.infrastructure_failure(request, e, subject)),
        }
    }

    async fn run_pipeline(&self, request: &SecurityRequest) -> Outcome {
        // 1. IP rate limit
        if let Some(outcome) = self
            .rate_limited(request, RateLimitKey::Ip(request.ip), None)
            .await
        {
            return outcome;
        }

        // 2. Token
        let claims: Option<TokenClaims> = match &request.bearer_token {
            None => None,
            Some(token) => match self.tokens.validate(token, TokenPurpose::Access).await {
                Ok(claims) => Some(claims),
                Err(e @ SecurityError::StoreUnavailable(_)) => {
                    return self.infrastructure_failure(request, e, None)
                }
                Err(e) => {
                    let details = format!("{}: {}", e.reason_code(), e);
                    return self.denied(
                        request,
                        SecurityEventType::InvalidTokenUsage,
                        e,
                        None,
                        details,
                    );
                }
            },
        };
        let subject_id = claims.as_ref().map(|c| c.sub.clone());

        // 3. Lockout, only when this request authenticates a username
        if let Some(username) = &request.username {
            let status = self.lockout.check_lockout(username);
            if let (true, Some(until)) = (status.locked, status.expires_at) {
                return self.denied(
                    request,
                    SecurityEventType::AccountLocked,
                    SecurityError::AccountLocked { until },
                    subject_id,
                    format!("login attempt for locked account {}", username),
                );
            }
        }

        // 4. Subject rate limit
        if let Some(id) = &subject_id {
            if let Some(outcome) = self
                .rate_limited(request, RateLimitKey::Subject(id.clone()), Some(id))
                .await
            {
                return outcome;
            }
        }

        // 5. Access control
        let subject = claims
            .as_ref()
            .map(AccessSubject::from)
            .unwrap_or_else(AccessSubject::anonymous);
        let now = self.clock.now();
        let context = AccessContext {
            at: now,
            location: request.location.clone(),
            device: request.device.clone(),
            session: request.session.clone(),
        };
        let decision = self
            .access
            .check(&subject, &request.resource, &request.action, &context);
        if !decision.allowed {
            return self.denied(
                request,
                SecurityEventType::AccessDenied,
                SecurityError::AccessDenied(decision.reason.clone()),
                subject_id,
                decision.reason,
            );
        }

        // 6. Anomaly, for known subjects
        let assessment = subject_id.as_ref().map(|id| {
            self.anomaly.observe(&AnomalyObservation {
                subject_id: id.clone(),
                event_type: SecurityEventType::AccessGranted,
                resource: request.resource.clone(),
                action: request.action.clone(),
                ip: request.ip,
                user_agent: request.user_agent.clone(),
            })
        });
        let score = assessment.map(|a| a.score).unwrap_or(0.0);
        let anomalous = assessment.is_some_and(|a| a.is_anomaly);

        if anomalous && self.anomaly.auto_block() {
            return Outcome {
                verdict: Verdict::Deny(Denial::new(ReasonCode::AnomalyBlocked, "Access denied")),
                event: SecurityEvent::for_request(
                    SecurityEventType::AnomalyDetected,
                    Severity::Critical,
                    request,
                    format!("blocked: anomaly score {:.2}", score),
                    now,
                )
                .subject(subject_id)
                .anomaly(score)
                .blocked(true),
            };
        }

        let event = if anomalous {
            SecurityEvent::for_request(
                SecurityEventType::AnomalyDetected,
                Severity::Warning,
                request,
                format!("flagged: anomaly score {:.2}; {}", score, decision.reason),
                now,
            )
        } else {
            SecurityEvent::for_request(
                SecurityEventType::AccessGranted,
                Severity::Info,
                request,
                decision.reason,
                now,
            )
        };

        Outcome {
            verdict: Verdict::Allow {
                claims,
                anomaly_score: score,
                flagged: anomalous,
            },
            event: event.subject(subject_id).anomaly(score),
        }
    }
}
