use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// The three atomic single-key primitives a lease lock needs from its store.
///
/// Each method must execute as one atomic server-side operation. A client-side
/// read followed by a write is not an acceptable implementation: it can renew
/// or delete a key that another holder acquired in between.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Set `key` to `value` with the given TTL, only if `key` does not exist.
    ///
    /// Returns `true` if this call wrote the key.
    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Reset the TTL of `key` to `ttl` if its current value equals `expected`.
    ///
    /// Returns `true` if the value matched and the TTL was refreshed.
    async fn compare_and_set_ttl(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Delete `key` if its current value equals `expected`.
    ///
    /// Returns `true` if the value matched and the key was deleted.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;
}
