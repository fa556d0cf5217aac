//! In-memory Distributed Mutex.
//!
//! Waiting and lease expiry run on tokio time, so tests can use
//! `tokio::time::pause()` to drive timeouts deterministically.

use flashcoupon_core::lock::{DistributedMutex, LockError, LockLease};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
struct Holder {
    token: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    holders: Mutex<HashMap<String, Holder>>,
    released: Notify,
    unavailable: AtomicBool,
    acquisitions: AtomicU64,
    timeouts: AtomicU64,
}

/// Lock table shared by all clones.
#[derive(Clone, Debug, Default)]
pub struct InMemoryMutex {
    inner: Arc<Inner>,
}

impl InMemoryMutex {
    /// Create an empty lock table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`LockError::Backend`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Returns `true` if `key` is held by a lease that has not expired
    #[must_use]
    pub fn is_held(&self, key: &str) -> bool {
        let holders = self.inner.holders.lock().unwrap();
        holders
            .get(key)
            .is_some_and(|h| h.expires_at > Instant::now())
    }

    /// Keys currently held by unexpired leases
    #[must_use]
    pub fn held_keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.inner
            .holders
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, h)| h.expires_at > now)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Number of successful acquisitions
    #[must_use]
    pub fn acquisitions(&self) -> u64 {
        self.inner.acquisitions.load(Ordering::SeqCst)
    }

    /// Number of acquisitions that timed out
    #[must_use]
    pub fn timeouts(&self) -> u64 {
        self.inner.timeouts.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), LockError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            Err(LockError::Backend("lock backend unavailable".into()))
        } else {
            Ok(())
        }
    }

    /// Take the lock if free. Otherwise return when the current holder's
    /// lease runs out.
    fn try_take(&self, key: &str, lease: Duration) -> Result<LockLease, Instant> {
        let now = Instant::now();
        let mut holders = self.inner.holders.lock().unwrap();
        if let Some(holder) = holders.get(key) {
            if holder.expires_at > now {
                return Err(holder.expires_at);
            }
        }
        let granted = LockLease::new(key, lease);
        holders.insert(
            key.to_string(),
            Holder {
                token: granted.token().to_string(),
                expires_at: now + lease,
            },
        );
        Ok(granted)
    }
}

impl DistributedMutex for InMemoryMutex {
    fn acquire<'a>(
        &'a self,
        key: &'a str,
        wait: Duration,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<LockLease, LockError>> + Send + 'a>> {
        Box::pin(async move {
            self.check_available()?;
            let started = Instant::now();
            let deadline = started + wait;

            loop {
                // Register interest before checking so a release between the
                // check and the await is not missed.
                let released = self.inner.released.notified();
                tokio::pin!(released);
                released.as_mut().enable();

                match self.try_take(key, lease) {
                    Ok(granted) => {
                        self.inner.acquisitions.fetch_add(1, Ordering::SeqCst);
                        return Ok(granted);
                    }
                    Err(expires_at) => {
                        if Instant::now() >= deadline {
                            self.inner.timeouts.fetch_add(1, Ordering::SeqCst);
                            return Err(LockError::Timeout {
                                key: key.to_string(),
                                waited: started.elapsed(),
                            });
                        }
                        tokio::select! {
                            () = &mut released => {}
                            () = tokio::time::sleep_until(expires_at.min(deadline)) => {}
                        }
                    }
                }
            }
        })
    }

    fn release<'a>(
        &'a self,
        lease: &'a LockLease,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LockError>> + Send + 'a>> {
        Box::pin(async move {
            self.check_available()?;
            let released = {
                let mut holders = self.inner.holders.lock().unwrap();
                match holders.get(lease.key()) {
                    Some(holder) if holder.token == lease.token() => {
                        let live = holder.expires_at > Instant::now();
                        holders.remove(lease.key());
                        live
                    }
                    _ => false,
                }
            };
            self.inner.released.notify_waiters();
            Ok(released)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(100);
    const LEASE: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn second_acquire_times_out_while_held() {
        let mutex = InMemoryMutex::new();
        let first = mutex.acquire("k", WAIT, LEASE).await.unwrap();

        let err = mutex.acquire("k", WAIT, LEASE).await.unwrap_err();
        assert!(matches!(err, LockError::Timeout { ref key, .. } if key == "k"));

        assert!(mutex.release(&first).await.unwrap());
        assert!(mutex.acquire("k", WAIT, LEASE).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_is_woken_by_release() {
        let mutex = InMemoryMutex::new();
        let first = mutex.acquire("k", WAIT, LEASE).await.unwrap();

        let waiter = {
            let mutex = mutex.clone();
            tokio::spawn(async move { mutex.acquire("k", Duration::from_secs(1), LEASE).await })
        };
        tokio::task::yield_now().await;
        mutex.release(&first).await.unwrap();

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_taken_over_and_stale_release_is_noop() {
        let mutex = InMemoryMutex::new();
        let stale = mutex.acquire("k", WAIT, Duration::from_millis(50)).await.unwrap();

        tokio::time::advance(Duration::from_millis(60)).await;
        let successor = mutex.acquire("k", WAIT, LEASE).await.unwrap();

        assert!(!mutex.release(&stale).await.unwrap());
        assert!(mutex.is_held("k"));
        assert!(mutex.release(&successor).await.unwrap());
        assert!(!mutex.release(&successor).await.unwrap());
        assert!(mutex.held_keys().is_empty());
    }
}
