//! Shared setup for security engine integration tests.
//!
//! Builds an engine on in-memory stores with a manual clock, a capturing
//! audit sink and cheap Argon2 parameters.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use security_engine::{
    config::{EngineConfig, LockoutConfig, RateLimitConfig},
    models::{AccessControlRule, Credential, RuleConditions, RuleEffect, SecurityEvent},
    services::{
        AuditSink, CounterStore, CredentialStore, InMemoryCounterStore, InMemoryCredentialStore,
        InMemoryRevocationStore, ManualClock, MemoryAuditSink, RevocationStore, StoreError,
        WindowDecision,
    },
    EngineStores, SecurityEngine,
};
use security_engine::models::RevocationEntry;
use std::net::IpAddr;
use std::sync::Arc;

pub const PASSWORD: &str = "Tr0ub4dor&3!long";

/// The one reverse proxy the test engine believes.
pub const PROXY: &str = "10.0.0.2";

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap()
}

pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::with_secret("integration-test-signing-secret-0123456789");
    config.password.argon_memory_kib = 64;
    config.password.argon_iterations = 1;
    config.lockout = LockoutConfig {
        threshold: 5,
        window_seconds: 60,
        duration_seconds: 15 * 60,
        ..LockoutConfig::default()
    };
    config.rate_limit = RateLimitConfig {
        ip_limit: 5,
        ip_window_seconds: 60,
        subject_limit: 3,
        subject_window_seconds: 60,
    };
    config.anomaly.learning_period_hours = 24;
    config.anomaly.min_observations = 10;
    config.orchestrator.check_timeout_ms = 200;
    config.retry.max_retries = 1;
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 2;
    config.http.trusted_proxies = vec![PROXY.parse::<IpAddr>().unwrap()];
    config
}

/// Posts are open to everyone, admin pages to admins, the rest is default-deny.
pub fn test_rules() -> Vec<AccessControlRule> {
    vec![
        AccessControlRule::new("admin-allow", "/admin/*", "*", RuleEffect::Allow, 20)
            .with_conditions(RuleConditions {
                roles: Some(vec!["admin".to_string()]),
                ..RuleConditions::default()
            }),
        AccessControlRule::new("admin-deny", "/admin/*", "*", RuleEffect::Deny, 10),
        AccessControlRule::new("posts", "/posts*", "*", RuleEffect::Allow, 5),
    ]
}

pub struct TestEngine {
    pub engine: Arc<SecurityEngine>,
    pub clock: Arc<ManualClock>,
    pub audit: Arc<MemoryAuditSink>,
    pub credentials: Arc<InMemoryCredentialStore>,
}

pub struct Overrides {
    pub config: EngineConfig,
    pub counters: Option<Arc<dyn CounterStore>>,
    pub revocations: Option<Arc<dyn RevocationStore>>,
    pub audit: Option<Arc<dyn AuditSink>>,
    pub rules: Option<Vec<AccessControlRule>>,
}

impl Default for Overrides {
    fn default() -> Self {
        Self {
            config: test_config(),
            counters: None,
            revocations: None,
            audit: None,
            rules: None,
        }
    }
}

impl TestEngine {
    pub fn spawn() -> Self {
        Self::spawn_with(Overrides::default())
    }

    pub fn spawn_with(overrides: Overrides) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let audit = Arc::new(MemoryAuditSink::new());
        let credentials = Arc::new(InMemoryCredentialStore::new());

        let stores = EngineStores {
            revocations: overrides.revocations.unwrap_or_else(|| {
                Arc::new(InMemoryRevocationStore::new()) as Arc<dyn RevocationStore>
            }),
            counters: overrides
                .counters
                .unwrap_or_else(|| Arc::new(InMemoryCounterStore::new()) as Arc<dyn CounterStore>),
            credentials: credentials.clone() as Arc<dyn CredentialStore>,
            audit: overrides
                .audit
                .unwrap_or_else(|| audit.clone() as Arc<dyn AuditSink>),
        };

        let rules = overrides.rules.unwrap_or_else(test_rules);
        let engine = SecurityEngine::build(overrides.config, clock.clone(), stores, rules)
            .expect("Failed to build engine");

        Self {
            engine: Arc::new(engine),
            clock,
            audit,
            credentials,
        }
    }

    /// Store a user whose password is [`PASSWORD`].
    pub fn add_user(&self, subject_id: &str, username: &str, role: &str) -> Credential {
        let hash = self
            .engine
            .passwords
            .hash(PASSWORD)
            .expect("Failed to hash password");
        let credential = Credential::new(
            subject_id,
            username,
            format!("{}@example.com", username),
            role,
            hash,
            start_time(),
        );
        self.credentials.insert(credential.clone());
        credential
    }

    pub fn access_token(&self, credential: &Credential) -> String {
        self.engine
            .tokens
            .issue_pair(&credential.into())
            .expect("Failed to issue tokens")
            .access_token
    }

    pub fn events(&self) -> Vec<SecurityEvent> {
        self.audit.events()
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }
}

/// Counter store that never answers within the check budget.
pub struct SlowCounterStore;

#[async_trait]
impl CounterStore for SlowCounterStore {
    async fn record_hit(
        &self,
        _key: &str,
        _limit: u32,
        _window: Duration,
        _now: DateTime<Utc>,
    ) -> Result<WindowDecision, StoreError> {
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        Ok(WindowDecision {
            allowed: true,
            count: 1,
            retry_after: None,
        })
    }
}

/// Counter store whose backend is down.
pub struct DownCounterStore;

#[async_trait]
impl CounterStore for DownCounterStore {
    async fn record_hit(
        &self,
        _key: &str,
        _limit: u32,
        _window: Duration,
        _now: DateTime<Utc>,
    ) -> Result<WindowDecision, StoreError> {
        Err(StoreError::Unavailable("counter backend offline".to_string()))
    }
}

/// Revocation store that yields to the scheduler on every call, as a
/// networked store would.
#[derive(Default)]
pub struct YieldingRevocationStore {
    inner: InMemoryRevocationStore,
}

#[async_trait]
impl RevocationStore for YieldingRevocationStore {
    async fn revoke(&self, entry: RevocationEntry) -> Result<bool, StoreError> {
        tokio::task::yield_now().await;
        self.inner.revoke(entry).await
    }

    async fn is_revoked(&self, digest: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        tokio::task::yield_now().await;
        self.inner.is_revoked(digest, now).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.inner.purge_expired(now).await
    }
}

/// Audit sink that refuses every event.
pub struct DownAuditSink;

#[async_trait]
impl AuditSink for DownAuditSink {
    async fn record(&self, _event: &SecurityEvent) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("audit backend offline".to_string()))
    }
}
