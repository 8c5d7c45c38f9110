mod common;

use axum::http::StatusCode;
use chrono::Duration;
use common::{DownAuditSink, DownCounterStore, Overrides, SlowCounterStore, TestEngine};
use security_engine::models::{
    ReasonCode, SecurityEventType, SecurityRequest, Severity, Verdict,
};
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn read(resource: &str) -> SecurityRequest {
    SecurityRequest::new(ip("10.0.0.1"), resource, "read")
}

fn denial_code(verdict: &Verdict) -> ReasonCode {
    verdict.denial().expect("expected a denial").code
}

#[tokio::test]
async fn test_anonymous_request_follows_rules() {
    let app = TestEngine::spawn();

    let verdict = app.engine.orchestrator.check(&read("/posts")).await;
    assert!(verdict.is_allowed());

    let verdict = app.engine.orchestrator.check(&read("/admin/dashboard")).await;
    assert_eq!(denial_code(&verdict), ReasonCode::AccessDenied);
    assert_eq!(verdict.denial().unwrap().status(), StatusCode::FORBIDDEN);

    let verdict = app.engine.orchestrator.check(&read("/billing")).await;
    assert_eq!(denial_code(&verdict), ReasonCode::AccessDenied);

    let events = app.events();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].event_type, SecurityEventType::AccessGranted);
    assert_eq!(events[1].event_type, SecurityEventType::AccessDenied);
    assert!(events[1].details.contains("admin-deny"));
    assert!(events[1].blocked);
}

#[tokio::test]
async fn test_valid_token_then_revoked_token() {
    let app = TestEngine::spawn();
    let editor = app.add_user("42", "alice", "editor");
    let token = app.access_token(&editor);

    let verdict = app
        .engine
        .orchestrator
        .check(&read("/posts").with_token(token.clone()))
        .await;
    match verdict {
        Verdict::Allow { claims, .. } => assert_eq!(claims.unwrap().sub, "42"),
        other => panic!("expected allow, got {:?}", other),
    }

    assert!(app.engine.tokens.revoke(&token, Some("logout")).await.unwrap());

    let verdict = app
        .engine
        .orchestrator
        .check(&read("/posts").with_token(token))
        .await;
    assert_eq!(denial_code(&verdict), ReasonCode::InvalidToken);
    assert_eq!(verdict.denial().unwrap().status(), StatusCode::UNAUTHORIZED);

    let last = app.events().pop().unwrap();
    assert_eq!(last.event_type, SecurityEventType::InvalidTokenUsage);
    assert!(last.details.contains("token_revoked"), "{}", last.details);
}

#[tokio::test]
async fn test_token_error_message_does_not_leak_cause() {
    let app = TestEngine::spawn();
    let editor = app.add_user("42", "alice", "editor");
    let token = app.access_token(&editor);

    app.advance(Duration::hours(1));
    let expired = app
        .engine
        .orchestrator
        .check(&read("/posts").with_token(token))
        .await;
    let garbage = app
        .engine
        .orchestrator
        .check(&read("/posts").with_token("not-a-token"))
        .await;

    assert_eq!(
        expired.denial().unwrap().message,
        garbage.denial().unwrap().message
    );
}

#[tokio::test]
async fn test_role_decides_admin_access() {
    let app = TestEngine::spawn();
    let editor = app.add_user("42", "alice", "editor");
    let admin = app.add_user("7", "root", "admin");

    let verdict = app
        .engine
        .orchestrator
        .check(&read("/admin/dashboard").with_token(app.access_token(&editor)))
        .await;
    assert_eq!(denial_code(&verdict), ReasonCode::AccessDenied);

    let verdict = app
        .engine
        .orchestrator
        .check(&read("/admin/dashboard").with_token(app.access_token(&admin)))
        .await;
    assert!(verdict.is_allowed());
}

#[tokio::test]
async fn test_ip_rate_limit_rolls_over() {
    let app = TestEngine::spawn();

    for i in 0..5 {
        let verdict = app.engine.orchestrator.check(&read("/posts")).await;
        assert!(verdict.is_allowed(), "request {}", i);
    }

    let verdict = app.engine.orchestrator.check(&read("/posts")).await;
    let denial = verdict.denial().expect("sixth request is limited");
    assert_eq!(denial.code, ReasonCode::RateLimited);
    assert_eq!(denial.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(denial.retry_after.is_some_and(|s| s > 0 && s <= 60));

    // Another client is unaffected
    let other = SecurityRequest::new(ip("10.0.0.2"), "/posts", "read");
    assert!(app.engine.orchestrator.check(&other).await.is_allowed());

    app.advance(Duration::seconds(61));
    assert!(app.engine.orchestrator.check(&read("/posts")).await.is_allowed());

    let limited: Vec<_> = app
        .events()
        .into_iter()
        .filter(|e| e.event_type == SecurityEventType::RateLimited)
        .collect();
    assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn test_subject_rate_limit_applies_across_addresses() {
    let app = TestEngine::spawn();
    let editor = app.add_user("42", "alice", "editor");
    let token = app.access_token(&editor);

    for i in 0..3 {
        let request = SecurityRequest::new(ip(&format!("10.0.1.{}", i)), "/posts", "read")
            .with_token(token.clone());
        assert!(app.engine.orchestrator.check(&request).await.is_allowed());
    }

    let request = SecurityRequest::new(ip("10.0.1.9"), "/posts", "read").with_token(token);
    let verdict = app.engine.orchestrator.check(&request).await;
    assert_eq!(denial_code(&verdict), ReasonCode::RateLimited);

    let last = app.events().pop().unwrap();
    assert_eq!(last.subject_id.as_deref(), Some("42"));
}

#[tokio::test]
async fn test_locked_account_is_refused_with_423() {
    let app = TestEngine::spawn();
    for _ in 0..5 {
        app.engine
            .lockout
            .record_attempt("alice", ip("10.0.0.1"), false, Some("bad password"));
    }

    let verdict = app
        .engine
        .orchestrator
        .check(&read("/posts").with_username("alice"))
        .await;
    let denial = verdict.denial().expect("locked");
    assert_eq!(denial.code, ReasonCode::AccountLocked);
    assert_eq!(denial.status(), StatusCode::LOCKED);
    assert_eq!(denial.retry_after, Some(15 * 60));

    // Other usernames are not affected
    let verdict = app
        .engine
        .orchestrator
        .check(&read("/posts").with_username("bob"))
        .await;
    assert!(verdict.is_allowed());
}

#[tokio::test]
async fn test_exactly_one_event_per_request() {
    let app = TestEngine::spawn();
    let editor = app.add_user("42", "alice", "editor");
    let token = app.access_token(&editor);

    let requests = vec![
        read("/posts"),
        read("/admin/users"),
        read("/posts").with_token(token.clone()),
        read("/posts").with_token("garbage"),
        read("/admin/users").with_token(token),
    ];
    for request in &requests {
        app.engine.orchestrator.check(request).await;
    }

    assert_eq!(app.events().len(), requests.len());
}

#[tokio::test]
async fn test_slow_store_times_out_closed() {
    let app = TestEngine::spawn_with(Overrides {
        counters: Some(Arc::new(SlowCounterStore)),
        ..Overrides::default()
    });

    let verdict = app.engine.orchestrator.check(&read("/posts")).await;
    let denial = verdict.denial().expect("timeout denies");
    assert_eq!(denial.code, ReasonCode::ServiceUnavailable);
    assert_eq!(denial.status(), StatusCode::SERVICE_UNAVAILABLE);

    let events = app.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, SecurityEventType::RequestAborted);
    assert_eq!(events[0].severity, Severity::Critical);
}

#[tokio::test]
async fn test_cancelled_request_is_denied() {
    let app = TestEngine::spawn();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let verdict = app
        .engine
        .orchestrator
        .evaluate(&read("/posts"), &cancel)
        .await;
    assert_eq!(denial_code(&verdict), ReasonCode::ServiceUnavailable);
    assert_eq!(
        app.events()[0].event_type,
        SecurityEventType::RequestAborted
    );
}

#[tokio::test]
async fn test_unavailable_counter_store_fails_closed() {
    let app = TestEngine::spawn_with(Overrides {
        counters: Some(Arc::new(DownCounterStore)),
        ..Overrides::default()
    });

    let verdict = app.engine.orchestrator.check(&read("/posts")).await;
    assert_eq!(denial_code(&verdict), ReasonCode::ServiceUnavailable);

    let events = app.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].severity, Severity::Critical);
    assert!(events[0].details.contains("store_unavailable"), "{}", events[0].details);
}

#[tokio::test]
async fn test_unrecordable_decision_is_denied() {
    let app = TestEngine::spawn_with(Overrides {
        audit: Some(Arc::new(DownAuditSink)),
        ..Overrides::default()
    });

    let verdict = app.engine.orchestrator.check(&read("/posts")).await;
    assert_eq!(denial_code(&verdict), ReasonCode::ServiceUnavailable);
}

mod anomaly {
    use super::*;
    use security_engine::models::Credential;

    /// One read a day at 09:00 from the usual machine, for twelve days.
    async fn train(app: &TestEngine, credential: &Credential) {
        for _ in 0..12 {
            let request = read("/posts")
                .with_token(app.access_token(credential))
                .with_user_agent("Firefox");
            assert!(app.engine.orchestrator.check(&request).await.is_allowed());
            app.advance(Duration::days(1));
        }
        // 03:00, never seen before
        app.advance(Duration::hours(18));
    }

    fn unusual(token: String) -> SecurityRequest {
        SecurityRequest::new(ip("203.0.113.9"), "/posts/export", "delete")
            .with_token(token)
            .with_user_agent("curl/8.0")
    }

    #[tokio::test]
    async fn test_anomaly_is_flagged_but_allowed() {
        let app = TestEngine::spawn();
        let editor = app.add_user("42", "alice", "editor");
        train(&app, &editor).await;

        let verdict = app
            .engine
            .orchestrator
            .check(&unusual(app.access_token(&editor)))
            .await;
        match verdict {
            Verdict::Allow {
                anomaly_score,
                flagged,
                ..
            } => {
                assert!(flagged);
                assert!(anomaly_score >= 0.7, "score {}", anomaly_score);
            }
            other => panic!("expected allow, got {:?}", other),
        }

        let last = app.events().pop().unwrap();
        assert_eq!(last.event_type, SecurityEventType::AnomalyDetected);
        assert_eq!(last.severity, Severity::Warning);
        assert!(!last.blocked);
    }

    #[tokio::test]
    async fn test_anomaly_is_blocked_when_auto_block_is_on() {
        let mut config = common::test_config();
        config.anomaly.auto_block = true;
        let app = TestEngine::spawn_with(Overrides {
            config,
            ..Overrides::default()
        });
        let editor = app.add_user("42", "alice", "editor");
        train(&app, &editor).await;

        let verdict = app
            .engine
            .orchestrator
            .check(&unusual(app.access_token(&editor)))
            .await;
        assert_eq!(denial_code(&verdict), ReasonCode::AnomalyBlocked);
        assert_eq!(verdict.denial().unwrap().status(), StatusCode::FORBIDDEN);

        let last = app.events().pop().unwrap();
        assert_eq!(last.severity, Severity::Critical);
        assert!(last.blocked);
    }

    #[tokio::test]
    async fn test_learning_mode_never_blocks() {
        let mut config = common::test_config();
        config.anomaly.auto_block = true;
        let app = TestEngine::spawn_with(Overrides {
            config,
            ..Overrides::default()
        });
        let editor = app.add_user("42", "alice", "editor");

        let first = read("/posts").with_token(app.access_token(&editor));
        assert!(app.engine.orchestrator.check(&first).await.is_allowed());

        let verdict = app
            .engine
            .orchestrator
            .check(&unusual(app.access_token(&editor)))
            .await;
        assert!(verdict.is_allowed());
    }
}
