//! Redis-backed lease storage.
//!
//! [`RedisLeaseStore`] implements each [`LeaseStore`] primitive as a single
//! Lua script, so the comparison and the mutation happen in one atomic step
//! on the server:
//!
//! - **Acquire**: `SET key token NX PX ttl`. The TTL is applied in the same
//!   command as the write, so a crash can never leave a lease without expiry.
//! - **Renew**: `GET` + `PEXPIRE` only when the stored token matches.
//! - **Release**: `GET` + `DEL` only when the stored token matches.
//!
//! # Guarantees
//!
//! Against a single Redis instance this gives full mutual exclusion for as
//! long as renewals keep up. Replication is asynchronous, so during a
//! Sentinel or Cluster failover a freshly written lease can be lost and a
//! second holder may acquire the same key. Quorum acquisition across several
//! instances is out of scope.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use leasehold::LeaseLock;
//! use leasehold_redis::{RedisConfig, RedisLeaseStore};
//!
//! let store = RedisLeaseStore::new(&RedisConfig::new("redis://localhost:6379"))?;
//! let lock = LeaseLock::new(Arc::new(store), "job:42", Duration::from_secs(30))?;
//! lock.with_lock(|| async { reindex().await }).await?;
//! ```

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, PoolError, Runtime};
use redis::{RedisError, Script};

use leasehold::error::StoreError;
use leasehold::store::LeaseStore;

use crate::config::RedisConfig;
use crate::scripts;

/// Redis-backed implementation of [`LeaseStore`].
///
/// Scripts are compiled once and invoked with `EVALSHA`, falling back to
/// `EVAL` when the server has not cached them yet.
pub struct RedisLeaseStore {
    pool: Pool,
    prefix: String,
    timeout: Duration,
    acquire: Script,
    renew: Script,
    release: Script,
}

impl RedisLeaseStore {
    /// Create a new `RedisLeaseStore` from the provided configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the pool cannot be created.
    pub fn new(config: &RedisConfig) -> Result<Self, StoreError> {
        let cfg = Config::from_url(&config.url);
        let pool = cfg
            .builder()
            .map(|b| {
                b.max_size(config.pool_size)
                    .wait_timeout(Some(config.connection_timeout))
                    .runtime(Runtime::Tokio1)
                    .build()
            })
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            prefix: config.prefix.clone(),
            timeout: config.connection_timeout,
            acquire: Script::new(scripts::LEASE_ACQUIRE),
            renew: Script::new(scripts::LEASE_RENEW),
            release: Script::new(scripts::LEASE_RELEASE),
        })
    }

    /// Build the full Redis key for a lease.
    fn lease_key(&self, key: &str) -> String {
        format!("{}:lease:{}", self.prefix, key)
    }

    /// Obtain a connection from the pool.
    async fn conn(&self) -> Result<deadpool_redis::Connection, StoreError> {
        self.pool.get().await.map_err(|e| match e {
            PoolError::Timeout(_) => StoreError::Timeout(self.timeout),
            other => StoreError::Connection(other.to_string()),
        })
    }
}

/// TTL in whole milliseconds, never zero: `PX 0` is rejected by Redis.
fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

/// Timed-out I/O also counts as an I/O error, so it is checked first.
fn map_redis_error(e: &RedisError, timeout: Duration) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout(timeout)
    } else if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Backend(e.to_string())
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let redis_key = self.lease_key(key);
        let mut conn = self.conn().await?;

        let result: i64 = self
            .acquire
            .key(&redis_key)
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(&e, self.timeout))?;

        Ok(result == 1)
    }

    async fn compare_and_set_ttl(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let redis_key = self.lease_key(key);
        let mut conn = self.conn().await?;

        let result: i64 = self
            .renew
            .key(&redis_key)
            .arg(expected)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(&e, self.timeout))?;

        Ok(result == 1)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let redis_key = self.lease_key(key);
        let mut conn = self.conn().await?;

        let result: i64 = self
            .release
            .key(&redis_key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(&e, self.timeout))?;

        Ok(result == 1)
    }
}
