//! RAII guards for the acceptance path.
//!
//! [`LockGuard`] wraps a [`LockLease`]; [`ReservationGuard`] wraps a ledger
//! unit that has not yet been handed to the queue.

use crate::metrics::IssuanceMetrics;
use flashcoupon_core::ledger::QuantityLedger;
use flashcoupon_core::lock::{DistributedMutex, LockError, LockLease};
use flashcoupon_core::{AttemptId, PolicyId};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Holds a policy lock and releases it on every exit path.
///
/// Call [`LockGuard::release`] on the normal path. If the guard is dropped
/// instead (early return, panic, or the owning future being cancelled), the
/// release runs on a spawned task.
pub struct LockGuard {
    mutex: Arc<dyn DistributedMutex>,
    lease: Option<LockLease>,
}

impl LockGuard {
    /// Acquire `key`, recording the wait in `issuance_lock_wait_seconds`.
    ///
    /// # Errors
    ///
    /// Propagates [`LockError`] from the backend.
    pub async fn acquire(
        mutex: Arc<dyn DistributedMutex>,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<Self, LockError> {
        let started = Instant::now();
        let result = mutex.acquire(key, wait, lease).await;
        IssuanceMetrics::record_lock_wait(started.elapsed());

        let lease = result?;
        tracing::trace!(key, "Lock acquired");
        Ok(Self {
            mutex,
            lease: Some(lease),
        })
    }

    /// Key of the held lock.
    #[must_use]
    pub fn key(&self) -> &str {
        self.lease.as_ref().map_or("", LockLease::key)
    }

    /// Release the lock now.
    ///
    /// Returns `true` if this guard still held the lock. A `false` result
    /// (lease expired before release) or a backend failure is logged, never
    /// returned as an error.
    pub async fn release(mut self) -> bool {
        let Some(lease) = self.lease.take() else {
            return false;
        };
        release_lease(self.mutex.as_ref(), &lease).await
    }
}

async fn release_lease(mutex: &dyn DistributedMutex, lease: &LockLease) -> bool {
    let held = lease.held_for();
    IssuanceMetrics::record_critical_section(held);
    if lease.is_expired() {
        tracing::warn!(
            key = lease.key(),
            held_ms = u64::try_from(held.as_millis()).unwrap_or(u64::MAX),
            lease_ms = u64::try_from(lease.lease().as_millis()).unwrap_or(u64::MAX),
            "Critical section outlived its lock lease"
        );
    }

    match mutex.release(lease).await {
        Ok(true) => true,
        Ok(false) => {
            tracing::warn!(key = lease.key(), "Lock was no longer held at release");
            false
        }
        Err(e) => {
            tracing::warn!(key = lease.key(), error = %e, "Lock release failed; lease will expire");
            false
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        let mutex = Arc::clone(&self.mutex);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    release_lease(mutex.as_ref(), &lease).await;
                });
            }
            Err(_) => {
                tracing::warn!(key = lease.key(), "No runtime to release lock; lease will expire");
            }
        }
    }
}

/// A reserved ledger unit that is given back unless it is kept.
///
/// Dropping an armed guard (the owning future was cancelled, or an early
/// return skipped both [`ReservationGuard::keep`] and
/// [`ReservationGuard::compensate`]) spawns the compensation.
pub struct ReservationGuard {
    ledger: Arc<dyn QuantityLedger>,
    policy_id: PolicyId,
    attempt_id: AttemptId,
    armed: bool,
}

impl ReservationGuard {
    /// Guard the unit reserved for `attempt_id`.
    #[must_use]
    pub fn new(ledger: Arc<dyn QuantityLedger>, policy_id: PolicyId, attempt_id: AttemptId) -> Self {
        Self {
            ledger,
            policy_id,
            attempt_id,
            armed: true,
        }
    }

    /// Attempt the guarded unit belongs to.
    #[must_use]
    pub const fn attempt_id(&self) -> AttemptId {
        self.attempt_id
    }

    /// The unit now belongs to someone else (queued message or in-flight
    /// insert); never compensate it from here.
    pub fn keep(mut self) {
        self.armed = false;
    }

    /// Give the unit back now.
    pub async fn compensate(mut self) {
        self.armed = false;
        compensate_reservation(self.ledger.as_ref(), self.policy_id, self.attempt_id).await;
    }
}

/// Return one unit for `attempt_id`, logging instead of failing.
pub(crate) async fn compensate_reservation(
    ledger: &dyn QuantityLedger,
    policy_id: PolicyId,
    attempt_id: AttemptId,
) {
    match ledger.compensate(policy_id, attempt_id).await {
        Ok(true) => {
            tracing::debug!(policy_id = %policy_id, attempt_id = %attempt_id, "Reservation compensated");
        }
        Ok(false) => {
            tracing::warn!(attempt_id = %attempt_id, "Reservation was already compensated");
        }
        Err(e) => {
            tracing::error!(
                attempt_id = %attempt_id,
                error = %e,
                "Compensation failed; one unit is lost until the ledger is resynchronised"
            );
        }
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let (policy_id, attempt_id) = (self.policy_id, self.attempt_id);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::error!(
                attempt_id = %attempt_id,
                "No runtime to compensate abandoned reservation; resync the ledger"
            );
            return;
        };
        let ledger = Arc::clone(&self.ledger);
        tracing::warn!(attempt_id = %attempt_id, "Reservation abandoned before enqueue; compensating");
        handle.spawn(async move {
            compensate_reservation(ledger.as_ref(), policy_id, attempt_id).await;
        });
    }
}
