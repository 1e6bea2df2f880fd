use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use leasehold::error::StoreError;
use leasehold::store::LeaseStore;

/// Internal entry representing a held lease.
#[derive(Debug, Clone)]
struct LeaseEntry {
    holder: String,
    expires_at: Instant,
}

impl LeaseEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-memory [`LeaseStore`] backed by a [`DashMap`].
///
/// Each primitive runs under the map's shard lock for the key, which makes it
/// atomic with respect to every other call on the same key. Expiry is lazy
/// and measured with [`tokio::time::Instant`], so paused-time tests control
/// it with `tokio::time::advance`.
///
/// Clones share the same underlying map, which lets tests model several
/// processes talking to one store.
#[derive(Debug, Clone, Default)]
pub struct MemoryLeaseStore {
    leases: Arc<DashMap<String, LeaseEntry>>,
}

impl MemoryLeaseStore {
    /// Create a new, empty in-memory lease store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The token currently holding `key`, if the lease is live.
    pub fn holder(&self, key: &str) -> Option<String> {
        self.leases
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.holder.clone())
    }

    /// Remaining lease time on `key`, if the lease is live.
    pub fn remaining(&self, key: &str) -> Option<Duration> {
        self.leases
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.expires_at - Instant::now())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let fresh = LeaseEntry {
            holder: value.to_owned(),
            expires_at: Instant::now() + ttl,
        };

        match self.leases.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(fresh);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn compare_and_set_ttl(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let Some(mut entry) = self.leases.get_mut(key) else {
            return Ok(false);
        };

        if entry.is_expired() || entry.holder != expected {
            return Ok(false);
        }

        entry.expires_at = Instant::now() + ttl;
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let removed = self
            .leases
            .remove_if(key, |_, entry| !entry.is_expired() && entry.holder == expected);

        // Evict a stale entry regardless of who wrote it.
        self.leases.remove_if(key, |_, entry| entry.is_expired());

        Ok(removed.is_some())
    }
}
