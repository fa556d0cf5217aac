//! Coupon issuance: the acceptance path and its fallbacks.
//!
//! # Queued path (production)
//!
//! ```text
//! lock(policy) ─► policy lookup ─► window check ─► ledger.reserve ─► queue.publish ─► unlock
//!                                                      │ exhausted          │ failed
//!                                                      ▼                    ▼
//!                                                  Exhausted       compensate(attempt)
//! ```
//!
//! The lock wraps only the ledger mutation and the enqueue. Durable
//! persistence happens later in the fulfillment workers.
//!
//! # Direct path
//!
//! Same critical section, but the lock is released after the reservation and
//! the coupon is persisted synchronously. An insert the store rejected
//! compensates the reservation once. A transient failure leaves the unit
//! reserved, since the row may have committed before the reply was lost; the
//! next [`IssuanceService::resync_ledger`] settles it.
//!
//! # Degraded path
//!
//! Bypasses the ledger and the lock entirely and relies on a count-bounded
//! insert in the coupon store. Use [`IssuanceService::resync_ledger`] before
//! switching back.

use crate::environment::Environment;
use crate::guard::{LockGuard, ReservationGuard, compensate_reservation};
use crate::metrics::IssuanceMetrics;
use crate::retry::retry_with_predicate;
use crate::settings::{IssuanceSettings, SettingsError};
use chrono::{DateTime, Utc};
use flashcoupon_core::ledger::Reservation;
use flashcoupon_core::lock::LockError;
use flashcoupon_core::queue::{IssuanceMessage, QueueError};
use flashcoupon_core::store::{BoundedPersistOutcome, StoreError};
use flashcoupon_core::{
    AttemptId, Coupon, CouponCode, CouponError, CouponId, CouponPolicy, CouponStatus, OwnerId,
    PolicyId, Result,
};
use std::sync::Arc;

/// Lock key guarding a policy's ledger entry.
#[must_use]
pub fn lock_key(policy_id: PolicyId) -> String {
    format!("coupon:lock:{policy_id}")
}

/// A reservation that was taken and handed to the fulfillment queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    /// Policy the unit was reserved from
    pub policy_id: PolicyId,
    /// Idempotency key carried by the queued message
    pub attempt_id: AttemptId,
    /// Units left after this reservation
    pub remaining: i64,
}

/// Summary of a coupon issued synchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCoupon {
    /// New coupon id
    pub coupon_id: CouponId,
    /// Redeemable code
    pub code: CouponCode,
    /// Status at issuance (always `Available`)
    pub status: CouponStatus,
}

impl From<&Coupon> for IssuedCoupon {
    fn from(coupon: &Coupon) -> Self {
        Self {
            coupon_id: coupon.id,
            code: coupon.code.clone(),
            status: coupon.status,
        }
    }
}

/// Entry point for issuance requests.
#[derive(Clone)]
pub struct IssuanceService {
    env: Environment,
    settings: IssuanceSettings,
}

impl IssuanceService {
    /// Create the service.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError`] if `settings` fail validation.
    pub fn new(env: Environment, settings: IssuanceSettings) -> std::result::Result<Self, SettingsError> {
        settings.validate()?;
        Ok(Self { env, settings })
    }

    /// Active tunables.
    #[must_use]
    pub const fn settings(&self) -> &IssuanceSettings {
        &self.settings
    }

    /// Reserve one unit and enqueue its fulfillment.
    ///
    /// # Errors
    ///
    /// - [`CouponError::Contention`] if the policy lock stayed busy
    /// - [`CouponError::PolicyNotFound`] for an unknown policy
    /// - [`CouponError::IssuanceWindowClosed`] outside the validity window
    /// - [`CouponError::Exhausted`] when sold out
    /// - [`CouponError::TransientInfra`] when a backend is down (a reservation
    ///   whose enqueue failed has been compensated)
    #[tracing::instrument(skip_all, fields(policy_id = %policy_id), name = "request_issue")]
    pub async fn request_issue(&self, policy_id: PolicyId, owner_id: OwnerId) -> Result<Accepted> {
        let guard = self.lock(policy_id).await?;
        let outcome = self.reserve_and_enqueue(policy_id, owner_id).await;
        guard.release().await;
        outcome
    }

    /// Reserve one unit and persist the coupon before returning.
    ///
    /// # Errors
    ///
    /// Same as [`IssuanceService::request_issue`], plus
    /// [`CouponError::Rejected`] if the store refused the coupon. A
    /// [`CouponError::TransientInfra`] from the insert leaves the unit
    /// reserved.
    #[tracing::instrument(skip_all, fields(policy_id = %policy_id), name = "issue_direct")]
    pub async fn issue_direct(&self, policy_id: PolicyId, owner_id: OwnerId) -> Result<IssuedCoupon> {
        let attempt_id = AttemptId::new();
        let guard = self.lock(policy_id).await?;
        let now = self.env.clock.now();
        let reserved = self
            .reserve(policy_id, now)
            .await
            .map(|(policy, _)| (policy, self.hold(policy_id, attempt_id)));
        guard.release().await;
        let (policy, reservation) = reserved?;

        // From here the insert may commit without us seeing the reply, so the
        // unit is only returned on a definitive rejection.
        reservation.keep();
        let coupon = Coupon::issue(&policy, owner_id, attempt_id, now);
        let persisted = retry_with_predicate(
            &self.settings.persist_retry,
            "insert_coupon",
            || self.env.coupons.insert_idempotent(&coupon),
            StoreError::is_retryable,
        )
        .await;

        if let Err(e) = persisted {
            if e.is_retryable() {
                tracing::error!(
                    attempt_id = %attempt_id,
                    error = %e,
                    "Direct insert outcome unknown; unit stays reserved until resync"
                );
            } else {
                tracing::error!(
                    attempt_id = %attempt_id,
                    error = %e,
                    "Direct insert rejected; compensating reservation"
                );
                compensate_reservation(self.env.ledger.as_ref(), policy_id, attempt_id).await;
            }
            return Err(e.into());
        }

        self.env.cache_coupon(&coupon).await;
        IssuanceMetrics::record_accepted("direct");
        tracing::info!(coupon_id = %coupon.id, "Coupon issued");
        Ok(IssuedCoupon::from(&coupon))
    }

    /// Issue without the ledger or the lock, bounded by the coupon store.
    ///
    /// # Errors
    ///
    /// - [`CouponError::PolicyNotFound`] for an unknown policy
    /// - [`CouponError::IssuanceWindowClosed`] outside the validity window
    /// - [`CouponError::Exhausted`] when the store already holds
    ///   `total_quantity` coupons
    /// - [`CouponError::TransientInfra`] when the store is down
    #[tracing::instrument(skip_all, fields(policy_id = %policy_id), name = "issue_degraded")]
    pub async fn issue_degraded(&self, policy_id: PolicyId, owner_id: OwnerId) -> Result<IssuedCoupon> {
        let policy = self
            .env
            .policies
            .get_policy(policy_id)
            .await?
            .ok_or(CouponError::PolicyNotFound(policy_id))?;
        let now = self.env.clock.now();
        check_window(&policy, now)?;

        let coupon = Coupon::issue(&policy, owner_id, AttemptId::new(), now);
        match self.env.coupons.insert_within_quantity(&coupon).await? {
            BoundedPersistOutcome::Created | BoundedPersistOutcome::AlreadyExists => {
                self.env.cache_coupon(&coupon).await;
                IssuanceMetrics::record_accepted("degraded");
                tracing::warn!(coupon_id = %coupon.id, "Coupon issued without the quantity ledger");
                Ok(IssuedCoupon::from(&coupon))
            }
            BoundedPersistOutcome::QuantityExhausted => {
                IssuanceMetrics::record_exhausted();
                Err(CouponError::Exhausted(policy_id))
            }
        }
    }

    /// Reseed the ledger from the coupon store: `total_quantity - persisted`.
    ///
    /// Messages still in the queue are not counted, so only run this once the
    /// fulfillment queue has drained (typically after running degraded).
    ///
    /// # Errors
    ///
    /// - [`CouponError::Contention`] if the policy lock stayed busy
    /// - [`CouponError::PolicyNotFound`] for an unknown policy
    /// - [`CouponError::TransientInfra`] when a backend is down
    #[tracing::instrument(skip_all, fields(policy_id = %policy_id), name = "resync_ledger")]
    pub async fn resync_ledger(&self, policy_id: PolicyId) -> Result<i64> {
        let guard = self.lock(policy_id).await?;
        let outcome = async {
            let policy = self
                .env
                .policies
                .get_policy(policy_id)
                .await?
                .ok_or(CouponError::PolicyNotFound(policy_id))?;
            let issued = self.env.coupons.count_by_policy(policy_id).await?;
            let remaining = u64::from(policy.total_quantity).saturating_sub(issued);
            let remaining = u32::try_from(remaining).unwrap_or(policy.total_quantity);

            self.env.ledger.seed(policy_id, remaining).await?;
            tracing::info!(issued, remaining, "Quantity ledger resynchronised");
            Ok::<_, CouponError>(i64::from(remaining))
        }
        .await;
        guard.release().await;
        outcome
    }

    /// Remaining units according to the ledger.
    ///
    /// # Errors
    ///
    /// - [`CouponError::PolicyNotFound`] if the ledger has no entry
    /// - [`CouponError::TransientInfra`] when the ledger is down
    pub async fn remaining(&self, policy_id: PolicyId) -> Result<i64> {
        self.env
            .ledger
            .remaining(policy_id)
            .await?
            .ok_or(CouponError::PolicyNotFound(policy_id))
    }

    async fn lock(&self, policy_id: PolicyId) -> Result<LockGuard> {
        LockGuard::acquire(
            Arc::clone(&self.env.mutex),
            &lock_key(policy_id),
            self.settings.lock_wait,
            self.settings.lock_lease,
        )
        .await
        .map_err(|e| {
            if matches!(e, LockError::Timeout { .. }) {
                IssuanceMetrics::record_contention();
                tracing::info!(error = %e, "Issuance rejected: lock contention");
            }
            CouponError::from(e)
        })
    }

    /// Window check and ledger reservation. Must run under the policy lock.
    async fn reserve(&self, policy_id: PolicyId, now: DateTime<Utc>) -> Result<(CouponPolicy, i64)> {
        let policy = self.env.cached_policy(policy_id).await?;
        check_window(&policy, now)?;

        match self.env.ledger.reserve(policy_id).await? {
            Reservation::Reserved { remaining } => Ok((policy, remaining)),
            Reservation::Exhausted => {
                IssuanceMetrics::record_exhausted();
                tracing::info!("Issuance rejected: policy sold out");
                Err(CouponError::Exhausted(policy_id))
            }
        }
    }

    fn hold(&self, policy_id: PolicyId, attempt_id: AttemptId) -> ReservationGuard {
        ReservationGuard::new(Arc::clone(&self.env.ledger), policy_id, attempt_id)
    }

    async fn reserve_and_enqueue(&self, policy_id: PolicyId, owner_id: OwnerId) -> Result<Accepted> {
        let now = self.env.clock.now();
        let (_, remaining) = self.reserve(policy_id, now).await?;
        let reservation = self.hold(policy_id, AttemptId::new());

        let message = IssuanceMessage {
            policy_id,
            owner_id,
            requested_at: now,
            attempt_id: reservation.attempt_id(),
        };
        let published = retry_with_predicate(
            &self.settings.enqueue_retry,
            "enqueue",
            || self.env.queue.publish(&message),
            |e| !matches!(e, QueueError::Decode(_)),
        )
        .await;

        if let Err(e) = published {
            IssuanceMetrics::record_enqueue_failure();
            tracing::error!(
                attempt_id = %message.attempt_id,
                error = %e,
                "Enqueue failed; compensating reservation"
            );
            reservation.compensate().await;
            return Err(e.into());
        }
        reservation.keep();

        IssuanceMetrics::record_accepted("queued");
        tracing::info!(attempt_id = %message.attempt_id, remaining, "Issuance accepted");
        Ok(Accepted {
            policy_id,
            attempt_id: message.attempt_id,
            remaining,
        })
    }
}

fn check_window(policy: &CouponPolicy, now: DateTime<Utc>) -> Result<()> {
    policy.ensure_issuable_at(now).inspect_err(|_| {
        IssuanceMetrics::record_window_closed();
        tracing::info!(policy_id = %policy.id, "Issuance rejected: outside validity window");
    })
}
