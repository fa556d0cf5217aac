//! Redis-backed distributed mutex.
//!
//! # Algorithm
//!
//! 1. `SET key token NX PX lease` succeeds only if nobody holds the key
//! 2. On failure, sleep one poll interval and retry until the wait runs out
//! 3. Release runs a compare-and-delete script: the key is deleted only if it
//!    still holds our token
//!
//! The lease makes a crashed holder's lock expire on its own. The token makes
//! a holder whose lease already expired unable to delete its successor's lock.
//!
//! If an `acquire` future is dropped while a `SET` is in flight, the command
//! may still have succeeded on the server. A drop guard then spawns a
//! compare-and-delete for the token so the orphaned lock does not have to
//! wait out its lease.

use flashcoupon_core::lock::{DistributedMutex, LockError, LockLease};
use redis::aio::ConnectionManager;
use redis::Script;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;

const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Lease-based lock on Redis.
#[derive(Clone)]
pub struct RedisMutex {
    conn_manager: ConnectionManager,
    release: Script,
    poll_interval: Duration,
}

impl RedisMutex {
    /// Create a mutex on an existing connection.
    #[must_use]
    pub fn new(conn_manager: ConnectionManager) -> Self {
        Self {
            conn_manager,
            release: Script::new(RELEASE_SCRIPT),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Delay between acquisition attempts while the key is held (default 25ms).
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn try_set(&self, lease: &LockLease) -> Result<bool, LockError> {
        let mut conn = self.conn_manager.clone();
        #[allow(clippy::cast_possible_truncation)] // Leases are seconds, far below u64::MAX ms
        let lease_ms = (lease.lease().as_millis() as u64).max(1);

        let reply: Option<String> = redis::cmd("SET")
            .arg(lease.key())
            .arg(lease.token())
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(format!("SET NX failed for '{}': {e}", lease.key())))?;
        Ok(reply.is_some())
    }

    async fn delete_if_owner(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut conn = self.conn_manager.clone();
        let deleted: i64 = self
            .release
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(format!("release failed for '{key}': {e}")))?;
        Ok(deleted == 1)
    }
}

/// Cleans up a `SET NX` whose outcome was never observed.
struct InFlightAcquire {
    mutex: RedisMutex,
    key: String,
    token: String,
    armed: bool,
}

impl InFlightAcquire {
    const fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InFlightAcquire {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = %self.key, "No runtime to clean up abandoned lock acquisition");
            return;
        };
        let mutex = self.mutex.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            match mutex.delete_if_owner(&key, &token).await {
                Ok(true) => tracing::debug!(key = %key, "Removed lock left by a cancelled acquire"),
                Ok(false) => {}
                Err(e) => tracing::warn!(key = %key, error = %e, "Cleanup of cancelled acquire failed"),
            }
        });
    }
}

impl DistributedMutex for RedisMutex {
    fn acquire<'a>(
        &'a self,
        key: &'a str,
        wait: Duration,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<LockLease, LockError>> + Send + 'a>> {
        Box::pin(async move {
            let started = Instant::now();
            let deadline = started + wait;

            loop {
                let candidate = LockLease::new(key, lease);
                let mut in_flight = InFlightAcquire {
                    mutex: self.clone(),
                    key: key.to_string(),
                    token: candidate.token().to_string(),
                    armed: true,
                };
                let acquired = self.try_set(&candidate).await;
                in_flight.disarm();

                if acquired? {
                    tracing::debug!(key, waited = ?started.elapsed(), "Lock acquired");
                    return Ok(candidate);
                }

                let now = Instant::now();
                if now >= deadline {
                    return Err(LockError::Timeout {
                        key: key.to_string(),
                        waited: now - started,
                    });
                }
                tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
            }
        })
    }

    fn release<'a>(
        &'a self,
        lease: &'a LockLease,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LockError>> + Send + 'a>> {
        Box::pin(async move {
            let released = self.delete_if_owner(lease.key(), lease.token()).await?;
            if !released {
                tracing::warn!(
                    key = lease.key(),
                    held_for = ?lease.held_for(),
                    "Lock was no longer held by this lease"
                );
            }
            Ok(released)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: These tests require a running Redis instance
    // Run with: docker run -d -p 6379:6379 redis:7-alpine

    #[allow(clippy::unwrap_used)]
    async fn mutex() -> RedisMutex {
        RedisMutex::new(crate::connect("redis://127.0.0.1:6379").await.unwrap())
    }

    fn key() -> String {
        format!("coupon:lock:test:{}", flashcoupon_core::PolicyId::new())
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    #[allow(clippy::unwrap_used)]
    async fn second_acquirer_times_out() {
        let mutex = mutex().await;
        let key = key();
        let held = mutex
            .acquire(&key, Duration::from_millis(100), Duration::from_secs(5))
            .await
            .unwrap();

        let err = mutex
            .acquire(&key, Duration::from_millis(100), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));

        assert!(mutex.release(&held).await.unwrap());
        let again = mutex
            .acquire(&key, Duration::from_millis(100), Duration::from_secs(5))
            .await
            .unwrap();
        mutex.release(&again).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    #[allow(clippy::unwrap_used)]
    async fn expired_lease_cannot_release_successor() {
        let mutex = mutex().await;
        let key = key();
        let stale = mutex
            .acquire(&key, Duration::from_millis(100), Duration::from_millis(50))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let current = mutex
            .acquire(&key, Duration::from_millis(100), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!mutex.release(&stale).await.unwrap());
        assert!(mutex.release(&current).await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    #[allow(clippy::unwrap_used)]
    async fn waiter_gets_lock_after_release() {
        let mutex = mutex().await;
        let key = key();
        let held = mutex
            .acquire(&key, Duration::from_millis(100), Duration::from_secs(5))
            .await
            .unwrap();

        let waiter = {
            let mutex = mutex.clone();
            let key = key.clone();
            tokio::spawn(async move {
                mutex
                    .acquire(&key, Duration::from_secs(2), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        mutex.release(&held).await.unwrap();

        let lease = waiter.await.unwrap().unwrap();
        assert!(mutex.release(&lease).await.unwrap());
    }
}
