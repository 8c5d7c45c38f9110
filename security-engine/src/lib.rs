pub mod config;
pub mod middleware;
pub mod models;
pub mod services;

use service_core::axum::{middleware::from_fn_with_state, Router};
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::middleware::{forward_auth_middleware, security_middleware};
use crate::models::AccessControlRule;
use crate::services::{
    AccessControlEvaluator, AnomalyDetector, AuditSink, Authenticator, Clock, CounterStore,
    CredentialStore, InMemoryCounterStore, InMemoryRevocationStore, LockoutManager,
    PasswordManager, RateLimiter, RedisService, RevocationStore, SecurityError,
    SecurityOrchestrator, SystemClock, TokenManager,
};

/// Backends the engine persists through.
#[derive(Clone)]
pub struct EngineStores {
    pub revocations: Arc<dyn RevocationStore>,
    pub counters: Arc<dyn CounterStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub audit: Arc<dyn AuditSink>,
}

impl EngineStores {
    /// Process-local revocations and counters.
    pub fn in_memory(credentials: Arc<dyn CredentialStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            revocations: Arc::new(InMemoryRevocationStore::new()),
            counters: Arc::new(InMemoryCounterStore::new()),
            credentials,
            audit,
        }
    }
}

/// Every component of the engine, built once at startup and shared by `Arc`.
pub struct SecurityEngine {
    pub config: EngineConfig,
    pub clock: Arc<dyn Clock>,
    pub passwords: Arc<PasswordManager>,
    pub tokens: Arc<TokenManager>,
    pub lockout: Arc<LockoutManager>,
    pub rate_limiter: Arc<RateLimiter>,
    pub anomaly: Arc<AnomalyDetector>,
    pub access: Arc<AccessControlEvaluator>,
    pub audit: Arc<dyn AuditSink>,
    pub authenticator: Arc<Authenticator>,
    pub orchestrator: Arc<SecurityOrchestrator>,
    redis: Option<Arc<RedisService>>,
}

/// What one maintenance pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub revocations: usize,
    pub rate_windows: usize,
    pub lockouts: usize,
    pub baselines: usize,
}

impl SecurityEngine {
    pub fn build(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        stores: EngineStores,
        rules: Vec<AccessControlRule>,
    ) -> Result<Self, AppError> {
        config.ensure_valid()?;
        let retry = config.retry.to_retry_config();

        let passwords = Arc::new(PasswordManager::new(config.password.clone()));
        let tokens = Arc::new(TokenManager::new(
            config.token.clone(),
            clock.clone(),
            stores.revocations,
            retry.clone(),
        ));
        let lockout = Arc::new(LockoutManager::new(config.lockout.clone(), clock.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit.clone(),
            stores.counters,
            clock.clone(),
            retry.clone(),
        ));
        let anomaly = Arc::new(AnomalyDetector::new(config.anomaly.clone(), clock.clone()));
        let access = Arc::new(AccessControlEvaluator::new(rules));

        let authenticator = Arc::new(Authenticator::new(
            passwords.clone(),
            tokens.clone(),
            lockout.clone(),
            stores.credentials,
            stores.audit.clone(),
            clock.clone(),
            retry.clone(),
        )?);
        let orchestrator = Arc::new(SecurityOrchestrator::new(
            tokens.clone(),
            lockout.clone(),
            rate_limiter.clone(),
            anomaly.clone(),
            access.clone(),
            stores.audit.clone(),
            clock.clone(),
            retry,
            Duration::from_millis(config.orchestrator.check_timeout_ms),
        ));

        tracing::info!(
            environment = ?config.environment,
            rules = access.rules().len(),
            "Security engine initialized"
        );

        Ok(Self {
            config,
            clock,
            passwords,
            tokens,
            lockout,
            rate_limiter,
            anomaly,
            access,
            audit: stores.audit,
            authenticator,
            orchestrator,
            redis: None,
        })
    }

    /// Builds on Redis when `config.redis` is set, otherwise on in-memory stores.
    pub async fn connect(
        config: EngineConfig,
        credentials: Arc<dyn CredentialStore>,
        audit: Arc<dyn AuditSink>,
        rules: Vec<AccessControlRule>,
    ) -> Result<Self, AppError> {
        let Some(redis_config) = &config.redis else {
            tracing::warn!("REDIS_URL not set, revocations and counters are process-local");
            let stores = EngineStores::in_memory(credentials, audit);
            return Self::build(config, Arc::new(SystemClock), stores, rules);
        };

        let redis = Arc::new(RedisService::new(redis_config).await?);
        let stores = EngineStores {
            revocations: redis.clone(),
            counters: redis.clone(),
            credentials,
            audit,
        };
        let mut engine = Self::build(config, Arc::new(SystemClock), stores, rules)?;
        engine.redis = Some(redis);
        Ok(engine)
    }

    /// Reachability of the shared store. Always fine on in-memory stores.
    pub async fn health(&self) -> Result<(), SecurityError> {
        if let Some(redis) = &self.redis {
            redis.health_check().await?;
        }
        Ok(())
    }

    /// One sweep over the state that only grows on its own.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport, SecurityError> {
        let lockouts = self.lockout.purge_idle();
        let baselines = self.anomaly.purge_idle();
        let revocations = self.tokens.purge_revocations().await?;
        let rate_windows = self.rate_limiter.purge_expired().await?;

        Ok(MaintenanceReport {
            revocations,
            rate_windows,
            lockouts,
            baselines,
        })
    }

    /// Runs [`Self::run_maintenance`] every `maintenance.interval_seconds`
    /// until `shutdown` fires.
    pub fn spawn_maintenance(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let period = Duration::from_secs(self.config.maintenance.interval_seconds);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => match engine.run_maintenance().await {
                        Ok(report) => tracing::debug!(?report, "Maintenance pass complete"),
                        Err(e) => tracing::warn!(error = %e, "Maintenance pass failed"),
                    },
                }
            }
            tracing::info!("Maintenance task stopped");
        })
    }
}

/// Puts every route of `router` behind the security pipeline.
pub fn protect(router: Router, engine: Arc<SecurityEngine>) -> Router {
    router.layer(from_fn_with_state(engine, security_middleware))
}

/// Like [`protect`], for a forward-auth endpoint: a trusted proxy names the
/// request to authorize in `x-forwarded-uri` and `x-forwarded-method`.
pub fn protect_forward_auth(router: Router, engine: Arc<SecurityEngine>) -> Router {
    router.layer(from_fn_with_state(engine, forward_auth_middleware))
}
