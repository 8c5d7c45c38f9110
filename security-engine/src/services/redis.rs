use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::{aio::ConnectionManager, Client, Script};

use super::error::StoreError;
use super::rate_limit::{CounterStore, WindowDecision};
use super::revocation::RevocationStore;
use crate::config::RedisConfig;
use crate::models::RevocationEntry;

/// Trims the window, then adds the hit only if room remains.
/// KEYS[1] sorted set; ARGV: now_ms, window_ms, limit, member.
/// Returns {allowed, count, oldest_ms}.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)

if count < limit then
    redis.call('ZADD', key, now, ARGV[4])
    redis.call('PEXPIRE', key, window)
    return {1, count + 1, 0}
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
return {0, count, tonumber(oldest[2])}
"#;

/// Shared backing store for deployments with more than one replica.
#[derive(Clone)]
pub struct RedisService {
    _client: Client,
    manager: ConnectionManager,
    sliding_window: Script,
}

impl RedisService {
    pub async fn new(config: &RedisConfig) -> Result<Self, anyhow::Error> {
        tracing::info!("Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        // ConnectionManager reconnects on its own
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
            sliding_window: Script::new(SLIDING_WINDOW_SCRIPT),
        })
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await?;
        Ok(())
    }
}

fn revocation_key(digest: &str) -> String {
    format!("revoked:{}", digest)
}

#[async_trait]
impl RevocationStore for RedisService {
    async fn revoke(&self, entry: RevocationEntry) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        // Redis needs a positive TTL; an already-expired token still gets a short entry.
        let ttl = (entry.expires_at - entry.revoked_at).num_seconds().max(1);
        let payload = serde_json::to_string(&entry)?;

        let inserted: Option<String> = redis::cmd("SET")
            .arg(revocation_key(&entry.digest))
            .arg(payload)
            .arg("NX")
            .arg("EX")
            .arg(ttl)
            .query_async(&mut conn)
            .await?;

        Ok(inserted.is_some())
    }

    async fn is_revoked(&self, digest: &str, _now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(revocation_key(digest))
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    /// Redis expires entries itself.
    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(0)
    }
}

#[async_trait]
impl CounterStore for RedisService {
    async fn record_hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowDecision, StoreError> {
        let mut conn = self.manager.clone();
        let now_ms = now.timestamp_millis();
        let window_ms = window.num_milliseconds();
        let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4());

        let (allowed, count, oldest_ms): (i64, i64, i64) = self
            .sliding_window
            .key(key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        let retry_after = if allowed == 1 {
            None
        } else {
            let wait_ms = (oldest_ms + window_ms - now_ms).max(0) as u64;
            Some(wait_ms.div_ceil(1000).max(1))
        };

        Ok(WindowDecision {
            allowed: allowed == 1,
            count: count.max(0) as u32,
            retry_after,
        })
    }
}
