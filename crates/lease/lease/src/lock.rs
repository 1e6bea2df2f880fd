//! Lease-based mutual exclusion.
//!
//! A [`LeaseLock`] names a resource, a store and a lease duration. Each
//! acquisition writes a fresh [`HolderToken`] under the key with the lease as
//! TTL; renewal and release only act when the stored value still equals that
//! token. If the holder crashes, the key simply expires.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use leasehold::LeaseLock;
//!
//! let lock = LeaseLock::new(store, "job:42", Duration::from_secs(2))?;
//! let rows = lock
//!     .with_lock(|| async { rebuild_index().await })
//!     .await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::{GuardedError, LockError};
use crate::renewal::{ActiveLease, RenewalTask, renewal_interval};
use crate::store::LeaseStore;
use crate::token::{HolderToken, default_instance};

/// Lifecycle of one acquisition attempt, as seen by its caller.
///
/// The store never records this; it only holds the current token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Idle,
    Acquiring,
    Held,
    Releasing,
    Released,
    /// Acquisition did not succeed (contention or store failure).
    Failed,
    /// Renewal found the lease expired or owned by someone else.
    Lost,
}

fn transition(key: &str, from: LockState, to: LockState) {
    trace!(key, ?from, ?to, "lock state transition");
}

/// A named, TTL-bounded lock over a [`LeaseStore`].
///
/// The lock itself is stateless and cheap to clone; every acquisition produces
/// its own [`HeldLease`] with its own token.
#[derive(Clone)]
pub struct LeaseLock {
    store: Arc<dyn LeaseStore>,
    key: String,
    lease: Duration,
    instance: String,
}

impl std::fmt::Debug for LeaseLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseLock")
            .field("key", &self.key)
            .field("lease", &self.lease)
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

impl LeaseLock {
    /// Create a lock on `key` with the given lease duration.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::InvalidKey`] for an empty key and
    /// [`LockError::InvalidLease`] for a lease shorter than one millisecond.
    pub fn new(
        store: Arc<dyn LeaseStore>,
        key: impl Into<String>,
        lease: Duration,
    ) -> Result<Self, LockError> {
        let key = key.into();
        if key.is_empty() {
            return Err(LockError::InvalidKey);
        }
        if lease.as_millis() == 0 {
            return Err(LockError::InvalidLease(lease));
        }
        Ok(Self {
            store,
            key,
            lease,
            instance: default_instance().to_owned(),
        })
    }

    /// Use `instance` as the holder identity embedded in generated tokens.
    #[must_use]
    pub fn with_holder(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    pub fn renewal_interval(&self) -> Duration {
        renewal_interval(self.lease)
    }

    /// Single acquisition attempt. Returns the new token, or `None` if
    /// another holder owns the key. Never waits or retries.
    pub async fn try_acquire(&self) -> Result<Option<HolderToken>, LockError> {
        let token = HolderToken::generate(&self.instance);
        let acquired = self
            .store
            .set_if_absent_with_ttl(&self.key, token.as_str(), self.lease)
            .await?;

        if acquired {
            info!(key = %self.key, token = %token, lease = ?self.lease, "lease acquired");
            Ok(Some(token))
        } else {
            debug!(key = %self.key, "lease held by another owner");
            Ok(None)
        }
    }

    /// Extend the lease if `token` still owns it. `Ok(false)` means the lease
    /// was lost.
    pub async fn renew(&self, token: &HolderToken) -> Result<bool, LockError> {
        Ok(self
            .store
            .compare_and_set_ttl(&self.key, token.as_str(), self.lease)
            .await?)
    }

    /// Delete the key if `token` still owns it.
    ///
    /// Idempotent: releasing an expired, already released or foreign-owned
    /// lease is not an error and never touches the other holder's key.
    pub async fn release(&self, token: &HolderToken) -> Result<(), LockError> {
        release_token(self.store.as_ref(), &self.key, token).await
    }

    /// Acquire the lease and start renewing it in the background.
    ///
    /// # Errors
    ///
    /// [`LockError::Unavailable`] when another holder owns the key,
    /// [`LockError::Store`] when the store cannot be reached.
    pub async fn acquire(&self) -> Result<HeldLease, LockError> {
        transition(&self.key, LockState::Idle, LockState::Acquiring);
        let requested_at = Instant::now();

        let token = match self.try_acquire().await {
            Ok(Some(token)) => token,
            Ok(None) => {
                transition(&self.key, LockState::Acquiring, LockState::Failed);
                return Err(LockError::Unavailable(self.key.clone()));
            }
            Err(e) => {
                transition(&self.key, LockState::Acquiring, LockState::Failed);
                return Err(e);
            }
        };

        let (lost_tx, lost_rx) = watch::channel(false);
        let lease = Arc::new(ActiveLease {
            store: Arc::clone(&self.store),
            key: self.key.clone(),
            token,
            duration: self.lease,
            lost_tx,
        });
        let renewal = RenewalTask::spawn(Arc::clone(&lease), requested_at);
        transition(&self.key, LockState::Acquiring, LockState::Held);

        Ok(HeldLease {
            lease,
            lost_rx,
            renewal: Some(renewal),
            state: LockState::Held,
        })
    }

    /// Run `f` while holding the lease.
    ///
    /// Fails fast with [`LockError::Unavailable`] if the key is held. Once
    /// acquired, the lease is renewed in the background until `f` returns;
    /// renewal is then stopped and the key released. `f`'s own error takes
    /// precedence; otherwise a lease lost while `f` ran is reported as
    /// [`LockError::Lost`] since exclusivity may not have held for all of
    /// `f`'s work. Release failures are logged, never returned.
    ///
    /// If `f` panics, the [`HeldLease`] drop path stops renewal and schedules
    /// the release.
    pub async fn with_lock<F, Fut, T, E>(&self, f: F) -> Result<T, GuardedError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let held = self.acquire().await?;
        let outcome = f().await;

        let lost = match held.release().await {
            Ok(()) => false,
            Err(LockError::Lost(_)) => true,
            Err(e) => {
                warn!(
                    key = %self.key,
                    error = %e,
                    "failed to release lease after critical section"
                );
                false
            }
        };

        match outcome {
            Err(e) => {
                if lost {
                    warn!(key = %self.key, "critical section failed after its lease was lost");
                }
                Err(GuardedError::Task(e))
            }
            Ok(_) if lost => Err(LockError::Lost(self.key.clone()).into()),
            Ok(value) => Ok(value),
        }
    }
}

async fn release_token(
    store: &dyn LeaseStore,
    key: &str,
    token: &HolderToken,
) -> Result<(), LockError> {
    if store.compare_and_delete(key, token.as_str()).await? {
        info!(key, token = %token, "lease released");
    } else {
        debug!(key, token = %token, "lease already expired or owned by another holder");
    }
    Ok(())
}

/// One successful acquisition: the token, the renewal task, and the loss
/// signal.
///
/// Prefer [`release`](Self::release). Dropping the handle aborts renewal and,
/// when a Tokio runtime is available and the lease is not known to be lost,
/// schedules an ownership-checked release in the background.
pub struct HeldLease {
    lease: Arc<ActiveLease>,
    lost_rx: watch::Receiver<bool>,
    renewal: Option<RenewalTask>,
    state: LockState,
}

impl std::fmt::Debug for HeldLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeldLease")
            .field("key", &self.lease.key)
            .field("token", &self.lease.token)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl HeldLease {
    pub fn key(&self) -> &str {
        &self.lease.key
    }

    pub fn token(&self) -> &HolderToken {
        &self.lease.token
    }

    pub fn lease(&self) -> Duration {
        self.lease.duration
    }

    pub fn state(&self) -> LockState {
        if self.state == LockState::Held && self.is_lost() {
            LockState::Lost
        } else {
            self.state
        }
    }

    /// Whether renewal has observed the lease as lost.
    pub fn is_lost(&self) -> bool {
        *self.lost_rx.borrow()
    }

    /// Resolves once renewal observes the lease as lost. Pending forever
    /// while the lease is healthy.
    pub async fn lost(&self) {
        let mut rx = self.lost_rx.clone();
        // The sender lives in `self.lease`, so it cannot close while we wait.
        let _ = rx.wait_for(|lost| *lost).await;
    }

    /// Stop renewal, wait for it, then release the key if still owned.
    ///
    /// # Errors
    ///
    /// [`LockError::Lost`] if the lease had been lost (no release is
    /// attempted), [`LockError::Store`] if the release round-trip failed.
    pub async fn release(mut self) -> Result<(), LockError> {
        transition(&self.lease.key, self.state, LockState::Releasing);
        self.state = LockState::Releasing;

        if let Some(renewal) = self.renewal.take() {
            if !renewal.stop().await {
                self.lease.mark_lost("renewal task ended abnormally");
            }
        }

        if self.lease.is_lost() {
            transition(&self.lease.key, LockState::Releasing, LockState::Lost);
            self.state = LockState::Lost;
            return Err(LockError::Lost(self.lease.key.clone()));
        }

        let result =
            release_token(self.lease.store.as_ref(), &self.lease.key, &self.lease.token).await;
        transition(&self.lease.key, LockState::Releasing, LockState::Released);
        self.state = LockState::Released;
        result
    }
}

impl Drop for HeldLease {
    fn drop(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }

        // A release cancelled midway leaves the state at `Releasing`.
        if matches!(self.state, LockState::Released | LockState::Lost) || self.lease.is_lost() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let lease = Arc::clone(&self.lease);
                runtime.spawn(async move {
                    let result =
                        release_token(lease.store.as_ref(), &lease.key, &lease.token).await;
                    if let Err(e) = result {
                        warn!(key = %lease.key, error = %e, "background lease release failed");
                    }
                });
            }
            Err(_) => {
                warn!(
                    key = %self.lease.key,
                    "lease dropped outside a runtime; it will expire after its TTL"
                );
            }
        }
    }
}
