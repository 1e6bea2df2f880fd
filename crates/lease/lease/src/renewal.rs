//! Background lease renewal.
//!
//! One task per held lease refreshes the TTL every half lease through the
//! store's atomic `compare_and_set_ttl`. Failed attempts are retried at a
//! quarter of that cadence until a full lease has passed without a confirmed
//! renewal, at which point the lease counts as lost. The task is the only
//! renewer of its token and is always stopped and joined (or aborted on drop)
//! before the owning handle goes away.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, error, warn};

use crate::store::LeaseStore;
use crate::token::HolderToken;

/// Immutable identity of one held lease, shared by the handle and its
/// renewal task. `lost_tx` is the one-way loss signal.
pub(crate) struct ActiveLease {
    pub(crate) store: Arc<dyn LeaseStore>,
    pub(crate) key: String,
    pub(crate) token: HolderToken,
    pub(crate) duration: Duration,
    pub(crate) lost_tx: watch::Sender<bool>,
}

impl ActiveLease {
    pub(crate) fn mark_lost(&self, reason: &str) {
        if !self.lost_tx.send_replace(true) {
            error!(key = %self.key, token = %self.token, reason, "lease lost");
        }
    }

    pub(crate) fn is_lost(&self) -> bool {
        *self.lost_tx.borrow()
    }
}

/// Renewal cadence for a lease: always half the lease.
pub(crate) fn renewal_interval(lease: Duration) -> Duration {
    lease / 2
}

/// Handle to a running renewal loop.
pub(crate) struct RenewalTask {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl RenewalTask {
    /// Start renewing `lease`. `confirmed_at` is the instant the acquisition
    /// request was sent, the earliest the store could have started the TTL.
    pub(crate) fn spawn(lease: Arc<ActiveLease>, confirmed_at: Instant) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(run(lease, confirmed_at, shutdown_rx));
        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Signal the loop to stop and wait until it has.
    ///
    /// A renewal already in flight is allowed to finish; no new renewal starts
    /// after the signal. Returns `false` if the loop ended abnormally.
    pub(crate) async fn stop(self) -> bool {
        // A closed channel means the loop already exited after observing loss.
        let _ = self.shutdown_tx.send(()).await;
        match self.handle.await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "lease renewal task did not finish cleanly");
                false
            }
        }
    }

    /// Stop the loop without waiting. Used from `Drop`, where awaiting is not
    /// possible.
    pub(crate) fn abort(self) {
        self.handle.abort();
    }
}

async fn run(
    lease: Arc<ActiveLease>,
    mut confirmed_at: Instant,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let period = renewal_interval(lease.duration);
    let mut next_attempt = confirmed_at + period;

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                debug!(key = %lease.key, "lease renewal stopped");
                return;
            }
            () = sleep_until(next_attempt) => {}
        }

        let now = Instant::now();
        let deadline = confirmed_at + lease.duration;
        if now >= deadline {
            lease.mark_lost("no renewal confirmed within the lease duration");
            return;
        }

        let renewal = lease
            .store
            .compare_and_set_ttl(&lease.key, lease.token.as_str(), lease.duration);
        match timeout(deadline - now, renewal).await {
            Ok(Ok(true)) => {
                confirmed_at = now;
                next_attempt = now + period;
                debug!(key = %lease.key, "lease renewed");
                continue;
            }
            Ok(Ok(false)) => {
                lease.mark_lost("stored value no longer matches this holder's token");
                return;
            }
            Ok(Err(e)) => {
                warn!(key = %lease.key, error = %e, "lease renewal failed, retrying");
            }
            Err(_) => {
                warn!(key = %lease.key, "lease renewal timed out, retrying");
            }
        }

        let now = Instant::now();
        if now >= confirmed_at + lease.duration {
            lease.mark_lost("no renewal confirmed within the lease duration");
            return;
        }
        next_attempt = now + retry_delay(period);
    }
}

/// Delay before retrying a failed renewal. Several retries fit between the
/// missed tick and the lease deadline.
fn retry_delay(period: Duration) -> Duration {
    period / 4
}
