//! Durable storage for policies and coupons.

use crate::coupon::{Coupon, CouponStatus};
use crate::policy::CouponPolicy;
use crate::types::{AttemptId, CouponId, OwnerId, PolicyId};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors returned by durable stores.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Store momentarily unreachable; the operation may be retried.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Store refused the write (constraint violation, missing parent row).
    /// Retrying the same write will fail again.
    #[error("Store rejected operation: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Returns `true` for failures worth retrying.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Result of an idempotent coupon insert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Row written.
    Created,
    /// A coupon for the same `(policy, owner, attempt)` already exists.
    AlreadyExists,
}

/// Result of a quantity-bounded coupon insert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundedPersistOutcome {
    /// Row written.
    Created,
    /// A coupon for the same `(policy, owner, attempt)` already exists.
    AlreadyExists,
    /// The policy already has `total_quantity` coupons.
    QuantityExhausted,
}

/// Policy Store.
pub trait PolicyStore: Send + Sync {
    /// Persist a new policy.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Rejected`] if a policy with the same id exists
    /// - [`StoreError::Unavailable`] on connectivity failures
    fn insert_policy<'a>(
        &'a self,
        policy: &'a CouponPolicy,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    /// Load a policy, `None` if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on connectivity failures.
    fn get_policy(
        &self,
        policy_id: PolicyId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CouponPolicy>, StoreError>> + Send + '_>>;
}

/// Coupon persistence.
pub trait CouponRepository: Send + Sync {
    /// Insert a coupon unless one with the same `(policy_id, owner_id,
    /// attempt_id)` already exists.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Rejected`] if the policy no longer exists
    /// - [`StoreError::Unavailable`] on connectivity failures
    fn insert_idempotent<'a>(
        &'a self,
        coupon: &'a Coupon,
    ) -> Pin<Box<dyn Future<Output = Result<PersistOutcome, StoreError>> + Send + 'a>>;

    /// Insert a coupon only while the policy has fewer than
    /// `total_quantity` coupons. The count and insert run under an exclusive
    /// read of the policy row.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Rejected`] if the policy does not exist
    /// - [`StoreError::Unavailable`] on connectivity failures
    fn insert_within_quantity<'a>(
        &'a self,
        coupon: &'a Coupon,
    ) -> Pin<Box<dyn Future<Output = Result<BoundedPersistOutcome, StoreError>> + Send + 'a>>;

    /// Load a coupon by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on connectivity failures.
    fn find_coupon(
        &self,
        coupon_id: CouponId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Coupon>, StoreError>> + Send + '_>>;

    /// Load the coupon written for one issuance attempt.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on connectivity failures.
    fn find_by_attempt<'a>(
        &'a self,
        policy_id: PolicyId,
        owner_id: &'a OwnerId,
        attempt_id: AttemptId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Coupon>, StoreError>> + Send + 'a>>;

    /// Write `coupon`'s status, order and use time if the stored status is
    /// still `expected`.
    ///
    /// Returns `false` when the stored status differs (someone else won).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on connectivity failures.
    fn save_transition<'a>(
        &'a self,
        coupon: &'a Coupon,
        expected: CouponStatus,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>>;

    /// Number of coupons persisted for a policy.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on connectivity failures.
    fn count_by_policy(
        &self,
        policy_id: PolicyId,
    ) -> Pin<Box<dyn Future<Output = Result<u64, StoreError>> + Send + '_>>;
}
