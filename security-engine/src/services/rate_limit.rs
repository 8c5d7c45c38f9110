use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use service_core::retry::{retry_async, RetryConfig};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;

use super::clock::Clock;
use super::error::{SecurityError, StoreError};
use crate::config::RateLimitConfig;

/// Outcome of recording one hit against a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    pub allowed: bool,
    /// Hits inside the window after this call.
    pub count: u32,
    /// Seconds until the oldest hit leaves the window. Set only when rejected.
    pub retry_after: Option<u64>,
}

/// Sliding-log counters. Implementations must make the check-and-record atomic per key.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Record a hit unless `limit` hits already sit inside the trailing
    /// `window`. A rejected hit is not recorded.
    async fn record_hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowDecision, StoreError>;

    /// Drop counters with no hit left inside their window. Stores whose keys
    /// expire on their own keep the default.
    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(0)
    }
}

struct HitLog {
    hits: VecDeque<DateTime<Utc>>,
    window: Duration,
}

impl HitLog {
    fn is_drained(&self, now: DateTime<Utc>) -> bool {
        self.hits.back().is_none_or(|last| *last <= now - self.window)
    }
}

/// Process-local counters, locked per key.
#[derive(Default)]
pub struct InMemoryCounterStore {
    windows: DashMap<String, HitLog>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn record_hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowDecision, StoreError> {
        let mut log = self.windows.entry(key.to_string()).or_insert_with(|| HitLog {
            hits: VecDeque::new(),
            window,
        });
        log.window = window;
        let hits = &mut log.hits;
        let horizon = now - window;
        while hits.front().is_some_and(|t| *t <= horizon) {
            hits.pop_front();
        }

        if (hits.len() as u32) < limit {
            hits.push_back(now);
            return Ok(WindowDecision {
                allowed: true,
                count: hits.len() as u32,
                retry_after: None,
            });
        }

        let retry_after = hits
            .front()
            .map(|oldest| seconds_until(*oldest + window, now))
            .unwrap_or(1);

        Ok(WindowDecision {
            allowed: false,
            count: hits.len() as u32,
            retry_after: Some(retry_after),
        })
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let before = self.windows.len();
        self.windows.retain(|_, log| !log.is_drained(now));
        Ok(before.saturating_sub(self.windows.len()))
    }
}

/// Whole seconds until `at`, rounded up, never below one.
pub(crate) fn seconds_until(at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (at - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000).max(1)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitKey {
    Ip(IpAddr),
    Subject(String),
}

impl RateLimitKey {
    fn storage_key(&self) -> String {
        match self {
            RateLimitKey::Ip(ip) => format!("ratelimit:ip:{}", ip),
            RateLimitKey::Subject(id) => format!("ratelimit:subject:{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub count: u32,
    pub limit: u32,
    pub retry_after: Option<u64>,
}

/// Per-IP and per-subject request limits over a pluggable counter store.
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
}

impl RateLimiter {
    pub fn new(
        config: RateLimitConfig,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            config,
            store,
            clock,
            retry,
        }
    }

    fn limits_for(&self, key: &RateLimitKey) -> (u32, Duration) {
        match key {
            RateLimitKey::Ip(_) => (
                self.config.ip_limit,
                Duration::seconds(self.config.ip_window_seconds as i64),
            ),
            RateLimitKey::Subject(_) => (
                self.config.subject_limit,
                Duration::seconds(self.config.subject_window_seconds as i64),
            ),
        }
    }

    pub async fn check(&self, key: &RateLimitKey) -> Result<RateDecision, SecurityError> {
        let (limit, window) = self.limits_for(key);
        let storage_key = key.storage_key();
        let now = self.clock.now();

        let decision = retry_async(&self.retry, "rate_limit.record_hit", || {
            self.store.record_hit(&storage_key, limit, window, now)
        })
        .await?;

        if !decision.allowed {
            tracing::debug!(
                key = %storage_key,
                count = decision.count,
                limit,
                "Rate limit exceeded"
            );
        }

        Ok(RateDecision {
            allowed: decision.allowed,
            count: decision.count,
            limit,
            retry_after: decision.retry_after,
        })
    }

    pub async fn purge_expired(&self) -> Result<usize, SecurityError> {
        let purged = self.store.purge_expired(self.clock.now()).await?;
        if purged > 0 {
            tracing::debug!(purged, "Purged idle rate limit windows");
        }
        Ok(purged)
    }

    /// Store failures deny.
    pub async fn allow(&self, key: &RateLimitKey) -> bool {
        match self.check(key).await {
            Ok(decision) => decision.allowed,
            Err(e) => {
                tracing::error!(error = %e, "Rate limit check failed, denying");
                false
            }
        }
    }
}
