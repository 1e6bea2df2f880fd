use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use leasehold::LeaseStore;
use leasehold_redis::{RedisConfig, RedisLeaseStore};

use crate::config::StoreConfig;

/// Construct a [`LeaseStore`] from configuration.
///
/// Only backends that several processes can share are accepted: an
/// in-process store would hand every invocation its own lease.
pub fn create_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn LeaseStore>> {
    match config.backend.as_str() {
        "redis" => create_redis(config),
        "memory" => bail!(
            "the memory backend only excludes callers within one process; \
             use `redis` for the CLI"
        ),
        other => bail!("unsupported store backend: {other}"),
    }
}

fn create_redis(config: &StoreConfig) -> anyhow::Result<Arc<dyn LeaseStore>> {
    let defaults = RedisConfig::default();
    let redis_config = RedisConfig {
        url: config.url.clone().unwrap_or(defaults.url),
        prefix: config.prefix.clone().unwrap_or(defaults.prefix),
        pool_size: config.pool_size.unwrap_or(defaults.pool_size),
        connection_timeout: config
            .connection_timeout_ms
            .map_or(defaults.connection_timeout, Duration::from_millis),
    };
    let store = RedisLeaseStore::new(&redis_config)
        .map_err(|e| anyhow::anyhow!("redis store: {e}"))?;
    Ok(Arc::new(store))
}
