//! Behavior of `LeaseLock` against the in-memory store, under paused time.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use leasehold::testing::FlakyStore;
use leasehold::{GuardedError, LeaseLock, LeaseStore, LockError, LockState};
use leasehold_memory::MemoryLeaseStore;
use tokio::time::{Instant, sleep, sleep_until};

fn lock_on(store: &MemoryLeaseStore, key: &str, lease: Duration) -> LeaseLock {
    LeaseLock::new(Arc::new(store.clone()), key, lease).expect("valid lock parameters")
}

fn flaky(store: &MemoryLeaseStore) -> Arc<FlakyStore> {
    Arc::new(FlakyStore::new(Arc::new(store.clone())))
}

/// Let spawned tasks (background releases, aborted renewals) run.
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn at_most_one_critical_section_runs_at_a_time() {
    let store = MemoryLeaseStore::new();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let lock = lock_on(&store, "exclusive", Duration::from_secs(2));
        let in_flight = Arc::clone(&in_flight);
        let max_in_flight = Arc::clone(&max_in_flight);
        let completed = Arc::clone(&completed);

        handles.push(tokio::spawn(async move {
            loop {
                let result = lock
                    .with_lock(|| async {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_in_flight.fetch_max(now, Ordering::SeqCst);
                        sleep(Duration::from_millis(300)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, Infallible>(())
                    })
                    .await;

                match result {
                    Ok(()) => break,
                    Err(e) if e.is_unavailable() => sleep(Duration::from_millis(50)).await,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            completed.fetch_add(1, Ordering::SeqCst);
        }));
    }

    for h in handles {
        h.await.expect("task should not panic");
    }

    assert_eq!(completed.load(Ordering::SeqCst), 8);
    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn crashed_holder_expires_within_one_lease() {
    let store = MemoryLeaseStore::new();
    let lease = Duration::from_secs(2);
    let crashed = lock_on(&store, "crash", lease);
    let survivor = lock_on(&store, "crash", lease);

    // A holder that acquired and then stopped doing anything at all.
    let stale = crashed.try_acquire().await.unwrap().expect("acquired");
    assert!(survivor.try_acquire().await.unwrap().is_none());

    tokio::time::advance(lease).await;

    let fresh = survivor
        .try_acquire()
        .await
        .unwrap()
        .expect("expired lease should be acquirable");
    assert_ne!(fresh, stale);
}

#[tokio::test(start_paused = true)]
async fn renewal_keeps_ownership_past_the_original_ttl() {
    let store = MemoryLeaseStore::new();
    let lease = Duration::from_secs(2);
    let holder = lock_on(&store, "renewed", lease);
    let rival = lock_on(&store, "renewed", lease);

    let result = holder
        .with_lock(|| async {
            // Three renewal intervals, probing every half interval.
            for _ in 0..6 {
                sleep(Duration::from_millis(500)).await;
                let attempt = rival.try_acquire().await.expect("memory store");
                assert!(attempt.is_none(), "rival acquired a renewed lease");
            }
            Ok::<_, Infallible>("done")
        })
        .await;

    assert_eq!(result.unwrap(), "done");
    assert!(store.holder("renewed").is_none(), "released after return");
}

#[tokio::test(start_paused = true)]
async fn release_is_idempotent_and_never_touches_other_holders() {
    let store = MemoryLeaseStore::new();
    let lease = Duration::from_secs(1);
    let lock = lock_on(&store, "idem", lease);

    let first = lock.try_acquire().await.unwrap().expect("acquired");
    lock.release(&first).await.expect("first release");
    lock.release(&first).await.expect("second release is a no-op");

    let second = lock.try_acquire().await.unwrap().expect("reacquired");
    tokio::time::advance(lease).await;
    lock.release(&second).await.expect("release after expiry");

    let third = lock.try_acquire().await.unwrap().expect("acquired again");
    lock.release(&first).await.expect("stale release");
    lock.release(&second).await.expect("stale release");
    assert_eq!(store.holder("idem").as_deref(), Some(third.as_str()));
}

#[tokio::test(start_paused = true)]
async fn foreign_token_cannot_renew_or_release() {
    let store = MemoryLeaseStore::new();
    let lock = lock_on(&store, "owned", Duration::from_secs(2));

    let owner = lock.try_acquire().await.unwrap().expect("acquired");
    let intruder = leasehold::HolderToken::generate("intruder");

    assert!(!lock.renew(&intruder).await.unwrap());
    lock.release(&intruder).await.unwrap();
    assert_eq!(store.holder("owned").as_deref(), Some(owner.as_str()));

    assert!(lock.renew(&owner).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn job_42_timeline() {
    let store = MemoryLeaseStore::new();
    let counted = flaky(&store);
    let lease = Duration::from_secs(2);
    let start = Instant::now();

    let holder_a = LeaseLock::new(counted.clone(), "job:42", lease).unwrap();
    let holder_b = lock_on(&store, "job:42", lease);
    assert_eq!(holder_a.renewal_interval(), Duration::from_secs(1));

    let a = tokio::spawn(async move {
        holder_a
            .with_lock(|| async {
                sleep(Duration::from_millis(2500)).await;
                Ok::<_, Infallible>(())
            })
            .await
    });

    sleep_until(start + Duration::from_millis(100)).await;
    let t1 = store.holder("job:42").expect("A holds the lease");
    assert!(holder_b.try_acquire().await.unwrap().is_none());

    // Past the original TTL: only A's renewals keep the key alive.
    sleep_until(start + Duration::from_millis(2400)).await;
    assert!(holder_b.try_acquire().await.unwrap().is_none());
    assert_eq!(counted.renew_calls(), 2, "renewals at t=1s and t=2s");

    a.await.unwrap().expect("A's critical section succeeds");
    assert!(store.holder("job:42").is_none(), "A released at t=2.5s");

    sleep_until(start + Duration::from_millis(3100)).await;
    let t2 = holder_b
        .try_acquire()
        .await
        .unwrap()
        .expect("B acquires after release");
    assert_ne!(t2.as_str(), t1);
}

#[tokio::test(start_paused = true)]
async fn short_store_outage_does_not_lose_the_lease() {
    let store = MemoryLeaseStore::new();
    let flaky = flaky(&store);
    let lock = LeaseLock::new(flaky.clone(), "blip", Duration::from_secs(2)).unwrap();
    let start = Instant::now();

    let outage = {
        let flaky = Arc::clone(&flaky);
        tokio::spawn(async move {
            sleep_until(start + Duration::from_millis(900)).await;
            flaky.set_failing(true);
            sleep_until(start + Duration::from_millis(1400)).await;
            flaky.set_failing(false);
        })
    };

    let result = lock
        .with_lock(|| async {
            sleep(Duration::from_secs(3)).await;
            Ok::<_, Infallible>(())
        })
        .await;
    outage.await.unwrap();

    assert!(result.is_ok(), "a sub-lease outage is ridden out: {result:?}");
    assert!(flaky.renew_calls() >= 4, "failed renewals are retried");
    assert!(store.holder("blip").is_none());
}

#[tokio::test(start_paused = true)]
async fn outage_longer_than_the_lease_reports_loss() {
    let store = MemoryLeaseStore::new();
    let flaky = flaky(&store);
    let lock = LeaseLock::new(flaky.clone(), "outage", Duration::from_secs(2)).unwrap();
    let start = Instant::now();

    let held = lock.acquire().await.unwrap();
    flaky.set_failing(true);

    held.lost().await;
    assert_eq!(Instant::now() - start, Duration::from_secs(2));
    assert!(held.is_lost());
    assert_eq!(held.state(), LockState::Lost);

    let err = held.release().await.unwrap_err();
    assert!(err.is_lost());
    assert_eq!(flaky.release_calls(), 0, "release skipped once lost");
}

#[tokio::test(start_paused = true)]
async fn hung_renewal_is_cut_off_at_the_lease_boundary() {
    let store = MemoryLeaseStore::new();
    let flaky = flaky(&store);
    let lock = LeaseLock::new(flaky.clone(), "partition", Duration::from_secs(2)).unwrap();
    let start = Instant::now();

    let held = lock.acquire().await.unwrap();
    flaky.set_hanging(true);

    held.lost().await;
    assert_eq!(Instant::now() - start, Duration::from_secs(2));
    assert_eq!(flaky.renew_calls(), 1, "the one renewal never returned");
    assert_eq!(held.state(), LockState::Lost);

    let err = held.release().await.unwrap_err();
    assert!(err.is_lost());
    assert_eq!(Instant::now() - start, Duration::from_secs(2));
    assert_eq!(flaky.release_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_release_still_frees_the_key() {
    let store = MemoryLeaseStore::new();
    let lock = lock_on(&store, "cancelled", Duration::from_secs(30));
    let held = lock.acquire().await.unwrap();

    // Poll the release once, then drop it while it waits for renewal to stop.
    let release = held.release();
    tokio::select! {
        biased;
        _ = release => panic!("release should still be waiting on the renewal task"),
        () = std::future::ready(()) => {}
    }

    settle().await;
    assert!(store.holder("cancelled").is_none());
}

#[tokio::test(start_paused = true)]
async fn with_lock_reports_loss_after_the_section_completes() {
    let store = MemoryLeaseStore::new();
    let flaky = flaky(&store);
    let lock = LeaseLock::new(flaky.clone(), "lost", Duration::from_secs(2)).unwrap();

    let ran_to_end = Arc::new(AtomicUsize::new(0));
    let result = lock
        .with_lock(|| {
            let ran_to_end = Arc::clone(&ran_to_end);
            let flaky = Arc::clone(&flaky);
            async move {
                flaky.set_failing(true);
                sleep(Duration::from_secs(5)).await;
                ran_to_end.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(())
            }
        })
        .await;

    assert_eq!(ran_to_end.load(Ordering::SeqCst), 1);
    assert!(matches!(
        result,
        Err(GuardedError::Lock(LockError::Lost(ref key))) if key == "lost"
    ));
}

#[tokio::test(start_paused = true)]
async fn stolen_lease_is_detected_and_left_alone() {
    let store = MemoryLeaseStore::new();
    let lease = Duration::from_secs(2);
    let lock = lock_on(&store, "stolen", lease);

    let held = lock.acquire().await.unwrap();
    let original = held.token().clone();

    // Simulate the key expiring and a new holder taking it over.
    assert!(
        store
            .compare_and_delete("stolen", original.as_str())
            .await
            .unwrap()
    );
    assert!(
        store
            .set_if_absent_with_ttl("stolen", "usurper", Duration::from_secs(60))
            .await
            .unwrap()
    );

    held.lost().await;
    assert!(held.release().await.unwrap_err().is_lost());
    assert_eq!(store.holder("stolen").as_deref(), Some("usurper"));
}

#[tokio::test(start_paused = true)]
async fn task_error_is_returned_and_key_released() {
    let store = MemoryLeaseStore::new();
    let lock = lock_on(&store, "failing", Duration::from_secs(2));

    let result = lock
        .with_lock(|| async { Err::<(), _>("disk full") })
        .await;

    assert_eq!(result.unwrap_err().into_task(), Some("disk full"));
    assert!(store.holder("failing").is_none());
}

#[tokio::test(start_paused = true)]
async fn store_failure_on_acquire_skips_the_section() {
    let store = MemoryLeaseStore::new();
    let flaky = flaky(&store);
    flaky.set_failing(true);
    let lock = LeaseLock::new(flaky.clone(), "down", Duration::from_secs(2)).unwrap();

    let mut ran = false;
    let result = lock
        .with_lock(|| {
            ran = true;
            async { Ok::<_, Infallible>(()) }
        })
        .await;

    assert!(!ran);
    assert!(matches!(
        result,
        Err(GuardedError::Lock(LockError::Store(_)))
    ));
    assert_eq!(flaky.acquire_calls(), 1, "no automatic retry");
}

#[tokio::test(start_paused = true)]
async fn renewal_stops_once_released() {
    let store = MemoryLeaseStore::new();
    let flaky = flaky(&store);
    let lock = LeaseLock::new(flaky.clone(), "stop", Duration::from_secs(2)).unwrap();

    let held = lock.acquire().await.unwrap();
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(held.state(), LockState::Held);
    held.release().await.unwrap();

    let renewals = flaky.renew_calls();
    sleep(Duration::from_secs(10)).await;
    assert_eq!(flaky.renew_calls(), renewals);
    assert!(store.holder("stop").is_none());
}

#[tokio::test(start_paused = true)]
async fn dropped_lease_stops_renewing_and_frees_the_key() {
    let store = MemoryLeaseStore::new();
    let flaky = flaky(&store);
    let lock = LeaseLock::new(flaky.clone(), "dropped", Duration::from_secs(2)).unwrap();

    let held = lock.acquire().await.unwrap();
    drop(held);
    settle().await;

    assert!(store.holder("dropped").is_none());
    sleep(Duration::from_secs(10)).await;
    assert_eq!(flaky.renew_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn panicking_section_still_releases() {
    let store = MemoryLeaseStore::new();
    let lock = lock_on(&store, "panic", Duration::from_secs(2));

    async fn explode() -> Result<(), Infallible> {
        sleep(Duration::from_millis(100)).await;
        panic!("critical section blew up");
    }

    let handle = tokio::spawn(async move { lock.with_lock(explode).await });

    let err = handle.await.unwrap_err();
    assert!(err.is_panic());
    settle().await;
    assert!(store.holder("panic").is_none());
}

#[tokio::test(start_paused = true)]
async fn each_acquisition_gets_a_fresh_token() {
    let store = MemoryLeaseStore::new();
    let lock = lock_on(&store, "fresh", Duration::from_secs(2)).with_holder("worker-7");

    let first = lock.acquire().await.unwrap();
    let first_token = first.token().clone();
    first.release().await.unwrap();

    let second = lock.acquire().await.unwrap();
    assert_ne!(second.token(), &first_token);
    assert!(second.token().as_str().starts_with("worker-7:"));
    second.release().await.unwrap();
}
