//! Fulfillment workers: turn queued reservations into durable coupons.
//!
//! For every delivery the worker:
//!
//! 1. Re-reads the policy from the store. A policy that no longer exists is a
//!    definitive failure.
//! 2. Checks the message's `requested_at` against the validity window.
//! 3. Inserts the coupon keyed by `(policy_id, owner_id, attempt_id)`, so a
//!    redelivered message finds the existing row instead of creating another.
//! 4. Acks only after the insert succeeded (or found the duplicate). A
//!    duplicate is re-read by attempt and written back to the state cache,
//!    since the first delivery may have crashed between insert and cache
//!    write.
//!
//! Transient failures are retried in-process, then the delivery is nacked
//! for redelivery, without touching the ledger. Definitive failures
//! compensate the reservation (once per attempt) and ack.

use crate::environment::Environment;
use crate::metrics::FulfillmentMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use crate::settings::{FulfillmentSettings, SettingsError};
use flashcoupon_core::Coupon;
use flashcoupon_core::queue::{Delivery, DeliveryStream, IssuanceMessage, IssuanceQueue, QueueError};
use flashcoupon_core::store::{PersistOutcome, StoreError};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// What the worker decided for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Coupon written; ack.
    Persisted,
    /// Coupon already existed for this attempt; ack.
    Duplicate,
    /// Definitive failure, reservation returned to the ledger; ack.
    Compensated,
    /// Transient failure; nack so the queue redelivers.
    Redeliver,
}

impl Disposition {
    /// Returns `true` if the delivery should be acknowledged.
    #[must_use]
    pub const fn should_ack(&self) -> bool {
        !matches!(self, Self::Redeliver)
    }
}

/// Processes issuance messages.
#[derive(Clone)]
pub struct FulfillmentWorker {
    env: Environment,
    retry: RetryPolicy,
}

impl FulfillmentWorker {
    /// Create a worker.
    #[must_use]
    pub fn new(env: Environment, settings: &FulfillmentSettings) -> Self {
        Self {
            env,
            retry: settings.persist_retry.clone(),
        }
    }

    /// Decide and apply the outcome of one message, without acknowledging.
    #[tracing::instrument(
        skip_all,
        fields(policy_id = %message.policy_id, attempt_id = %message.attempt_id),
        name = "fulfill"
    )]
    pub async fn fulfill(&self, message: &IssuanceMessage) -> Disposition {
        let policy = retry_with_predicate(
            &self.retry,
            "load_policy",
            || self.env.policies.get_policy(message.policy_id),
            StoreError::is_retryable,
        )
        .await;

        let policy = match policy {
            Ok(Some(policy)) => policy,
            Ok(None) => return self.discard(message, "policy no longer exists").await,
            Err(StoreError::Rejected(reason)) => return self.discard(message, &reason).await,
            Err(e) => {
                tracing::warn!(error = %e, "Policy lookup failed; requesting redelivery");
                return Disposition::Redeliver;
            }
        };

        if !policy.is_within_window(message.requested_at) {
            return self
                .discard(message, "request falls outside the validity window")
                .await;
        }

        let coupon = Coupon::issue(
            &policy,
            message.owner_id.clone(),
            message.attempt_id,
            self.env.clock.now(),
        );
        let persisted = retry_with_predicate(
            &self.retry,
            "insert_coupon",
            || self.env.coupons.insert_idempotent(&coupon),
            StoreError::is_retryable,
        )
        .await;

        match persisted {
            Ok(PersistOutcome::Created) => {
                self.env.cache_coupon(&coupon).await;
                FulfillmentMetrics::record_persisted();
                tracing::info!(coupon_id = %coupon.id, "Coupon persisted");
                Disposition::Persisted
            }
            Ok(PersistOutcome::AlreadyExists) => {
                FulfillmentMetrics::record_duplicate();
                self.recache_existing(message).await;
                Disposition::Duplicate
            }
            Err(StoreError::Rejected(reason)) => self.discard(message, &reason).await,
            Err(e @ StoreError::Unavailable(_)) => {
                tracing::warn!(error = %e, "Coupon insert failed; requesting redelivery");
                Disposition::Redeliver
            }
        }
    }

    /// Fulfill a delivery and ack or nack it.
    pub async fn process(&self, delivery: Delivery) -> Disposition {
        if delivery.is_redelivery() {
            tracing::debug!(
                attempt_id = %delivery.message.attempt_id,
                delivery_count = delivery.delivery_count,
                "Processing redelivered message"
            );
        }

        let disposition = self.fulfill(&delivery.message).await;
        let attempt_id = delivery.message.attempt_id;
        let acknowledged = if disposition.should_ack() {
            delivery.ack().await
        } else {
            FulfillmentMetrics::record_redelivered();
            delivery.nack().await
        };
        if let Err(e) = acknowledged {
            tracing::warn!(attempt_id = %attempt_id, error = %e, "Acknowledgement failed");
        }
        disposition
    }

    /// Consume `deliveries` until the stream ends or `shutdown` flips.
    ///
    /// A delivery already being processed is finished before returning.
    pub async fn run(self, mut deliveries: DeliveryStream, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = deliveries.next() => match next {
                    None => break,
                    Some(Ok(delivery)) => {
                        self.process(delivery).await;
                    }
                    Some(Err(QueueError::Decode(reason))) => {
                        FulfillmentMetrics::record_malformed();
                        tracing::warn!(reason = %reason, "Dropped malformed issuance message");
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Issuance queue error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        tracing::info!("Fulfillment worker stopped");
    }

    /// Best effort: a miss here is repaired by the next cache-aside read.
    async fn recache_existing(&self, message: &IssuanceMessage) {
        let existing = self
            .env
            .coupons
            .find_by_attempt(message.policy_id, &message.owner_id, message.attempt_id)
            .await;
        match existing {
            Ok(Some(coupon)) => {
                self.env.cache_coupon(&coupon).await;
                tracing::info!(coupon_id = %coupon.id, "Coupon already persisted for this attempt");
            }
            Ok(None) => {
                tracing::warn!("Insert reported a duplicate but no coupon was found for this attempt");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not reload duplicate coupon; cache left to fill on read");
            }
        }
    }

    async fn discard(&self, message: &IssuanceMessage, reason: &str) -> Disposition {
        match self
            .env
            .ledger
            .compensate(message.policy_id, message.attempt_id)
            .await
        {
            Ok(applied) => {
                if applied {
                    FulfillmentMetrics::record_compensated();
                }
                tracing::error!(reason, applied, "Issuance discarded; reservation compensated");
                Disposition::Compensated
            }
            Err(e) => {
                tracing::warn!(reason, error = %e, "Compensation failed; requesting redelivery");
                Disposition::Redeliver
            }
        }
    }
}

/// N competing workers in one consumer group.
pub struct WorkerPool {
    worker: FulfillmentWorker,
    queue: Arc<dyn IssuanceQueue>,
    settings: FulfillmentSettings,
}

impl WorkerPool {
    /// Create a pool.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError`] if `settings` fail validation.
    pub fn new(env: Environment, settings: FulfillmentSettings) -> Result<Self, SettingsError> {
        settings.validate()?;
        Ok(Self {
            worker: FulfillmentWorker::new(env.clone(), &settings),
            queue: env.queue,
            settings,
        })
    }

    /// Subscribe every worker and spawn them.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if a subscription fails; workers already
    /// started are told to stop.
    pub async fn start(self) -> Result<WorkerPoolHandle, QueueError> {
        let (shutdown, signal) = watch::channel(false);
        let mut tasks = Vec::with_capacity(self.settings.workers);

        for index in 0..self.settings.workers {
            let deliveries = match self.queue.subscribe(&self.settings.consumer_group).await {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    let _ = shutdown.send(true);
                    return Err(e);
                }
            };
            let span = tracing::info_span!("fulfillment_worker", index);
            tasks.push(tokio::spawn(
                self.worker.clone().run(deliveries, signal.clone()).instrument(span),
            ));
        }

        tracing::info!(
            workers = self.settings.workers,
            group = %self.settings.consumer_group,
            "Fulfillment worker pool started"
        );
        Ok(WorkerPoolHandle { shutdown, tasks })
    }
}

/// Running pool.
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerPoolHandle {
    /// Number of running worker tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }

    /// Returns `true` if every worker has stopped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop all workers, waiting up to `timeout` for in-flight messages.
    ///
    /// Returns `false` if some workers had to be aborted. Their in-flight
    /// deliveries stay unacknowledged and will be redelivered.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        let _ = self.shutdown.send(true);
        let aborts: Vec<_> = self.tasks.iter().map(JoinHandle::abort_handle).collect();

        if tokio::time::timeout(timeout, futures::future::join_all(self.tasks))
            .await
            .is_ok()
        {
            tracing::info!("Fulfillment workers stopped");
            true
        } else {
            tracing::error!(?timeout, "Fulfillment workers did not stop in time; aborting");
            for abort in aborts {
                abort.abort();
            }
            false
        }
    }
}
