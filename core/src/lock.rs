//! Distributed Mutex abstraction.
//!
//! A lease-based exclusive lock shared by every service instance. Each
//! successful [`DistributedMutex::acquire`] returns a [`LockLease`] holding a
//! unique owner token. [`DistributedMutex::release`] only deletes the lock if
//! the token still matches, so a holder whose lease expired can never release
//! the lock of its successor.
//!
//! Acquire is bounded by a wait timeout. Running out of time is reported as
//! [`LockError::Timeout`], which the engine surfaces as a retryable
//! contention rejection.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by mutex backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Lock was not acquired within the wait window.
    #[error("Timed out after {waited:?} waiting for lock '{key}'")]
    Timeout {
        /// Lock key
        key: String,
        /// How long the caller waited
        waited: Duration,
    },

    /// Backend failure (connection, script error).
    #[error("Lock backend error: {0}")]
    Backend(String),
}

/// Proof of holding a lock.
#[derive(Clone, PartialEq, Eq)]
pub struct LockLease {
    key: String,
    token: String,
    lease: Duration,
    acquired_at: Instant,
}

impl LockLease {
    /// Create a lease with a fresh random owner token.
    #[must_use]
    pub fn new(key: impl Into<String>, lease: Duration) -> Self {
        Self {
            key: key.into(),
            token: Uuid::new_v4().to_string(),
            lease,
            acquired_at: Instant::now(),
        }
    }

    /// Lock key
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Owner token stored alongside the lock
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Lease duration granted at acquisition
    #[must_use]
    pub const fn lease(&self) -> Duration {
        self.lease
    }

    /// Time spent holding the lock so far
    #[must_use]
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Returns `true` once the lease has run out and the backend may hand the
    /// lock to someone else.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.held_for() >= self.lease
    }
}

impl fmt::Debug for LockLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockLease")
            .field("key", &self.key)
            .field("lease", &self.lease)
            .field("held_for", &self.held_for())
            .finish_non_exhaustive()
    }
}

/// Lease-based exclusive lock keyed by string.
pub trait DistributedMutex: Send + Sync {
    /// Acquire `key`, waiting at most `wait`. The lock auto-expires after
    /// `lease` if never released.
    ///
    /// Dropping the returned future before it resolves must not leave the
    /// lock held.
    ///
    /// # Errors
    ///
    /// - [`LockError::Timeout`] if the lock stayed busy for the whole wait
    /// - [`LockError::Backend`] if the backend is unreachable
    fn acquire<'a>(
        &'a self,
        key: &'a str,
        wait: Duration,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<LockLease, LockError>> + Send + 'a>>;

    /// Release a lease.
    ///
    /// Returns `false` when the lock was no longer held by this lease
    /// (expired, or already released). That case is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Backend`] if the backend is unreachable.
    fn release<'a>(
        &'a self,
        lease: &'a LockLease,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LockError>> + Send + 'a>>;
}
