use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::store::LeaseStore;

/// Run the full lease store conformance test suite.
///
/// Call this from your backend's test module with a fresh store instance.
/// The TTL expiry check sleeps with `tokio::time::sleep`, so in-process
/// backends can run it under paused time.
///
/// # Errors
///
/// Returns an error if the backend fails a request.
pub async fn run_store_conformance_tests(store: &dyn LeaseStore) -> Result<(), StoreError> {
    test_set_if_absent(store).await?;
    test_compare_and_set_ttl(store).await?;
    test_compare_and_delete(store).await?;
    test_delete_then_reacquire(store).await?;
    test_ttl_expiry(store).await?;
    test_renewal_extends_ttl(store).await?;
    Ok(())
}

async fn test_set_if_absent(store: &dyn LeaseStore) -> Result<(), StoreError> {
    let ttl = Duration::from_secs(10);
    let created = store.set_if_absent_with_ttl("conf-sia", "t1", ttl).await?;
    assert!(created, "set_if_absent on a missing key should write");

    let created = store.set_if_absent_with_ttl("conf-sia", "t2", ttl).await?;
    assert!(!created, "set_if_absent on a held key should not write");

    // The original holder still owns the key.
    assert!(store.compare_and_delete("conf-sia", "t1").await?);
    Ok(())
}

async fn test_compare_and_set_ttl(store: &dyn LeaseStore) -> Result<(), StoreError> {
    let ttl = Duration::from_secs(10);
    assert!(
        !store.compare_and_set_ttl("conf-cas", "t1", ttl).await?,
        "compare_and_set_ttl on a missing key should report not owned"
    );

    store.set_if_absent_with_ttl("conf-cas", "t1", ttl).await?;
    assert!(store.compare_and_set_ttl("conf-cas", "t1", ttl).await?);
    assert!(
        !store.compare_and_set_ttl("conf-cas", "intruder", ttl).await?,
        "compare_and_set_ttl with a foreign token should report not owned"
    );

    store.compare_and_delete("conf-cas", "t1").await?;
    Ok(())
}

async fn test_compare_and_delete(store: &dyn LeaseStore) -> Result<(), StoreError> {
    let ttl = Duration::from_secs(10);
    store.set_if_absent_with_ttl("conf-cad", "t1", ttl).await?;

    assert!(
        !store.compare_and_delete("conf-cad", "intruder").await?,
        "compare_and_delete with a foreign token should not delete"
    );
    assert!(
        !store.set_if_absent_with_ttl("conf-cad", "t2", ttl).await?,
        "key should survive a foreign delete"
    );

    assert!(store.compare_and_delete("conf-cad", "t1").await?);
    assert!(
        !store.compare_and_delete("conf-cad", "t1").await?,
        "second delete should be a no-op"
    );
    Ok(())
}

async fn test_delete_then_reacquire(store: &dyn LeaseStore) -> Result<(), StoreError> {
    let ttl = Duration::from_secs(10);
    store.set_if_absent_with_ttl("conf-reacq", "t1", ttl).await?;
    store.compare_and_delete("conf-reacq", "t1").await?;

    assert!(store.set_if_absent_with_ttl("conf-reacq", "t2", ttl).await?);
    assert!(
        !store.compare_and_set_ttl("conf-reacq", "t1", ttl).await?,
        "stale token must not renew the new holder's lease"
    );
    assert!(store.compare_and_delete("conf-reacq", "t2").await?);
    Ok(())
}

async fn test_ttl_expiry(store: &dyn LeaseStore) -> Result<(), StoreError> {
    store
        .set_if_absent_with_ttl("conf-ttl", "t1", Duration::from_millis(100))
        .await?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(
        !store
            .compare_and_set_ttl("conf-ttl", "t1", Duration::from_secs(10))
            .await?,
        "an expired lease must not be renewable"
    );
    assert!(
        store
            .set_if_absent_with_ttl("conf-ttl", "t2", Duration::from_secs(10))
            .await?,
        "an expired key should be acquirable"
    );
    store.compare_and_delete("conf-ttl", "t2").await?;
    Ok(())
}

async fn test_renewal_extends_ttl(store: &dyn LeaseStore) -> Result<(), StoreError> {
    store
        .set_if_absent_with_ttl("conf-extend", "t1", Duration::from_millis(200))
        .await?;
    assert!(
        store
            .compare_and_set_ttl("conf-extend", "t1", Duration::from_secs(10))
            .await?
    );
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(
        !store
            .set_if_absent_with_ttl("conf-extend", "t2", Duration::from_secs(10))
            .await?,
        "a renewed lease should outlive its original TTL"
    );
    store.compare_and_delete("conf-extend", "t1").await?;
    Ok(())
}

/// A [`LeaseStore`] wrapper that can be switched into a failing state.
///
/// While failing, every call returns [`StoreError::Connection`] without
/// reaching the inner store. While hanging, every call stays pending
/// forever, like a request lost in a network partition. Useful for testing
/// how renewal rides out outages.
pub struct FlakyStore {
    inner: Arc<dyn LeaseStore>,
    failing: AtomicBool,
    hanging: AtomicBool,
    acquire_calls: AtomicUsize,
    renew_calls: AtomicUsize,
    release_calls: AtomicUsize,
}

impl FlakyStore {
    /// Wrap `inner`. The wrapper starts healthy.
    pub fn new(inner: Arc<dyn LeaseStore>) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
            hanging: AtomicBool::new(false),
            acquire_calls: AtomicUsize::new(0),
            renew_calls: AtomicUsize::new(0),
            release_calls: AtomicUsize::new(0),
        }
    }

    /// Start or stop failing every request.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Start or stop leaving every new request pending forever.
    pub fn set_hanging(&self, hanging: bool) {
        self.hanging.store(hanging, Ordering::SeqCst);
    }

    pub fn acquire_calls(&self) -> usize {
        self.acquire_calls.load(Ordering::SeqCst)
    }

    pub fn renew_calls(&self) -> usize {
        self.renew_calls.load(Ordering::SeqCst)
    }

    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }

    async fn check(&self) -> Result<(), StoreError> {
        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Connection("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LeaseStore for FlakyStore {
    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.acquire_calls.fetch_add(1, Ordering::SeqCst);
        self.check().await?;
        self.inner.set_if_absent_with_ttl(key, value, ttl).await
    }

    async fn compare_and_set_ttl(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.renew_calls.fetch_add(1, Ordering::SeqCst);
        self.check().await?;
        self.inner.compare_and_set_ttl(key, expected, ttl).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        self.check().await?;
        self.inner.compare_and_delete(key, expected).await
    }
}
