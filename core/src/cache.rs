//! State Cache abstraction.
//!
//! Best-effort: callers log and count failures but never fail an operation
//! because the cache is down.

use crate::coupon::Coupon;
use crate::policy::CouponPolicy;
use crate::types::{CouponId, PolicyId};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Cache backend failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("State cache error: {0}")]
pub struct CacheError(pub String);

/// Read-through cache of coupon and policy snapshots.
pub trait StateCache: Send + Sync {
    /// Store the latest snapshot of a coupon.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the backend is unreachable.
    fn put_coupon<'a>(
        &'a self,
        coupon: &'a Coupon,
    ) -> Pin<Box<dyn Future<Output = Result<(), CacheError>> + Send + 'a>>;

    /// Cached coupon snapshot, `None` on a miss.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the backend is unreachable.
    fn get_coupon(
        &self,
        coupon_id: CouponId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Coupon>, CacheError>> + Send + '_>>;

    /// Store a policy snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the backend is unreachable.
    fn put_policy<'a>(
        &'a self,
        policy: &'a CouponPolicy,
    ) -> Pin<Box<dyn Future<Output = Result<(), CacheError>> + Send + 'a>>;

    /// Cached policy snapshot, `None` on a miss.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the backend is unreachable.
    fn get_policy(
        &self,
        policy_id: PolicyId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CouponPolicy>, CacheError>> + Send + '_>>;
}
