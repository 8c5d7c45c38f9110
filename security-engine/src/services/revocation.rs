use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::error::StoreError;
use crate::models::RevocationEntry;

/// Set of revoked token digests.
#[async_trait]
pub trait RevocationStore: Send + Sync {
    /// Insert the entry. Returns false when the digest was already revoked.
    async fn revoke(&self, entry: RevocationEntry) -> Result<bool, StoreError>;

    /// Whether the digest is revoked. Entries past their horizon may be
    /// reported as not revoked; the token itself has expired by then.
    async fn is_revoked(&self, digest: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Drop entries whose token has expired. Returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Process-local revocation set.
#[derive(Default)]
pub struct InMemoryRevocationStore {
    entries: DashMap<String, RevocationEntry>,
}

impl InMemoryRevocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl RevocationStore for InMemoryRevocationStore {
    async fn revoke(&self, entry: RevocationEntry) -> Result<bool, StoreError> {
        match self.entries.entry(entry.digest.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(true)
            }
        }
    }

    async fn is_revoked(&self, digest: &str, _now: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(self.entries.contains_key(digest))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        Ok(before.saturating_sub(self.entries.len()))
    }
}

/// In-memory set that yields to the scheduler on every call, the way a
/// networked store would.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct YieldingRevocationStore {
    inner: InMemoryRevocationStore,
}

#[cfg(test)]
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
