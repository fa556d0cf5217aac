//! Backends injected into the services.

use crate::metrics::CacheMetrics;
use flashcoupon_core::cache::StateCache;
use flashcoupon_core::environment::{Clock, SystemClock};
use flashcoupon_core::ledger::QuantityLedger;
use flashcoupon_core::lock::DistributedMutex;
use flashcoupon_core::queue::IssuanceQueue;
use flashcoupon_core::store::{CouponRepository, PolicyStore};
use flashcoupon_core::{Coupon, CouponError, CouponPolicy, PolicyId, Result};
use std::sync::Arc;

/// Every collaborator the engine talks to, behind trait objects.
///
/// Cloning is cheap; all clones share the same backends.
#[derive(Clone)]
pub struct Environment {
    /// Remaining-quantity counters
    pub ledger: Arc<dyn QuantityLedger>,
    /// Per-policy lock
    pub mutex: Arc<dyn DistributedMutex>,
    /// Acceptance → fulfillment channel
    pub queue: Arc<dyn IssuanceQueue>,
    /// Durable policies
    pub policies: Arc<dyn PolicyStore>,
    /// Durable coupons
    pub coupons: Arc<dyn CouponRepository>,
    /// Snapshot cache
    pub cache: Arc<dyn StateCache>,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

impl Environment {
    /// Assemble an environment using the system clock.
    #[must_use]
    pub fn new(
        ledger: Arc<dyn QuantityLedger>,
        mutex: Arc<dyn DistributedMutex>,
        queue: Arc<dyn IssuanceQueue>,
        policies: Arc<dyn PolicyStore>,
        coupons: Arc<dyn CouponRepository>,
        cache: Arc<dyn StateCache>,
    ) -> Self {
        Self {
            ledger,
            mutex,
            queue,
            policies,
            coupons,
            cache,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Policy by id, cache first.
    ///
    /// A cache miss or failure falls through to the policy store; the result
    /// is written back to the cache.
    pub(crate) async fn cached_policy(&self, policy_id: PolicyId) -> Result<CouponPolicy> {
        match self.cache.get_policy(policy_id).await {
            Ok(Some(policy)) => return Ok(policy),
            Ok(None) => {}
            Err(e) => {
                CacheMetrics::record_error("get_policy");
                tracing::warn!(policy_id = %policy_id, error = %e, "Policy cache read failed");
            }
        }

        let policy = self
            .policies
            .get_policy(policy_id)
            .await?
            .ok_or(CouponError::PolicyNotFound(policy_id))?;
        self.cache_policy(&policy).await;
        Ok(policy)
    }

    /// Best-effort policy cache write.
    pub(crate) async fn cache_policy(&self, policy: &CouponPolicy) {
        if let Err(e) = self.cache.put_policy(policy).await {
            CacheMetrics::record_error("put_policy");
            tracing::warn!(policy_id = %policy.id, error = %e, "Policy cache write failed");
        }
    }

    /// Best-effort coupon cache write.
    pub(crate) async fn cache_coupon(&self, coupon: &Coupon) {
        if let Err(e) = self.cache.put_coupon(coupon).await {
            CacheMetrics::record_error("put_coupon");
            tracing::warn!(coupon_id = %coupon.id, error = %e, "Coupon cache write failed");
        }
    }
}
