//! Tunables for the acceptance path and the fulfillment workers.

use crate::retry::RetryPolicy;
use flashcoupon_core::queue::CONSUMER_GROUP;
use std::time::Duration;
use thiserror::Error;

/// Invalid tunable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid setting '{name}': {reason}")]
pub struct SettingsError {
    /// Setting name
    pub name: &'static str,
    /// What is wrong with it
    pub reason: String,
}

/// Acceptance path tunables.
///
/// `lock_lease` must exceed the worst-case time spent inside the policy lock
/// (ledger round trip plus enqueue, including `enqueue_retry`).
#[derive(Debug, Clone, PartialEq)]
pub struct IssuanceSettings {
    /// How long to wait for the policy lock before rejecting with contention
    pub lock_wait: Duration,
    /// Lease after which a crashed holder's lock expires
    pub lock_lease: Duration,
    /// Retry policy for publishing the issuance message
    pub enqueue_retry: RetryPolicy,
    /// Retry policy for the synchronous insert of the direct path
    pub persist_retry: RetryPolicy,
}

impl Default for IssuanceSettings {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_secs(3),
            lock_lease: Duration::from_secs(5),
            enqueue_retry: RetryPolicy::builder()
                .max_retries(2)
                .initial_delay(Duration::from_millis(20))
                .max_delay(Duration::from_millis(200))
                .build(),
            persist_retry: RetryPolicy::default(),
        }
    }
}

impl IssuanceSettings {
    /// Set lock wait and lease.
    #[must_use]
    pub const fn with_lock(mut self, wait: Duration, lease: Duration) -> Self {
        self.lock_wait = wait;
        self.lock_lease = lease;
        self
    }

    /// Set the enqueue retry policy.
    #[must_use]
    pub fn with_enqueue_retry(mut self, policy: RetryPolicy) -> Self {
        self.enqueue_retry = policy;
        self
    }

    /// Set the direct-path persist retry policy.
    #[must_use]
    pub fn with_persist_retry(mut self, policy: RetryPolicy) -> Self {
        self.persist_retry = policy;
        self
    }

    /// Check the tunables are usable.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError`] if the wait or the lease is zero, or if the
    /// enqueue retries alone could outlast the lease.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.lock_wait.is_zero() {
            return Err(SettingsError {
                name: "lock_wait",
                reason: "must be greater than zero".into(),
            });
        }
        if self.lock_lease.is_zero() {
            return Err(SettingsError {
                name: "lock_lease",
                reason: "must be greater than zero".into(),
            });
        }
        let worst_backoff: Duration = (0..self.enqueue_retry.max_retries)
            .map(|attempt| self.enqueue_retry.delay_for_attempt(attempt))
            .sum();
        if worst_backoff >= self.lock_lease {
            return Err(SettingsError {
                name: "enqueue_retry",
                reason: format!(
                    "backoff of {worst_backoff:?} can outlast the {:?} lock lease",
                    self.lock_lease
                ),
            });
        }
        Ok(())
    }
}

/// Fulfillment worker tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct FulfillmentSettings {
    /// Number of consumers in the pool
    pub workers: usize,
    /// Consumer group joined by every worker
    pub consumer_group: String,
    /// In-process retry before a transient failure is handed back to the queue
    pub persist_retry: RetryPolicy,
}

impl Default for FulfillmentSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            consumer_group: CONSUMER_GROUP.to_string(),
            persist_retry: RetryPolicy::default(),
        }
    }
}

impl FulfillmentSettings {
    /// Set the pool size.
    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the consumer group.
    #[must_use]
    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    /// Set the persist retry policy.
    #[must_use]
    pub fn with_persist_retry(mut self, policy: RetryPolicy) -> Self {
        self.persist_retry = policy;
        self
    }

    /// Check the tunables are usable.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError`] for an empty pool or a blank group.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.workers == 0 {
            return Err(SettingsError {
                name: "workers",
                reason: "pool needs at least one worker".into(),
            });
        }
        if self.consumer_group.trim().is_empty() {
            return Err(SettingsError {
                name: "consumer_group",
                reason: "must not be blank".into(),
            });
        }
        Ok(())
    }
}
