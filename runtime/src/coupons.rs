//! Owner-scoped coupon reads and state transitions.

use crate::environment::Environment;
use crate::metrics::{CacheMetrics, CouponMetrics};
use flashcoupon_core::{Coupon, CouponError, CouponId, CouponStatus, OrderId, OwnerId, Result};

/// Use, cancel and read coupons on behalf of their owner.
///
/// A coupon owned by someone else is reported as
/// [`CouponError::CouponNotFound`] so callers cannot probe other owners' ids.
#[derive(Clone)]
pub struct CouponService {
    env: Environment,
}

impl CouponService {
    /// Create the service.
    #[must_use]
    pub const fn new(env: Environment) -> Self {
        Self { env }
    }

    /// Read a coupon, cache first.
    ///
    /// # Errors
    ///
    /// - [`CouponError::CouponNotFound`] if missing or owned by someone else
    /// - [`CouponError::TransientInfra`] when the store is down
    pub async fn get(&self, coupon_id: CouponId, owner_id: &OwnerId) -> Result<Coupon> {
        let cached = match self.env.cache.get_coupon(coupon_id).await {
            Ok(found) => found,
            Err(e) => {
                CacheMetrics::record_error("get_coupon");
                tracing::warn!(coupon_id = %coupon_id, error = %e, "Coupon cache read failed");
                None
            }
        };

        let coupon = match cached {
            Some(coupon) => coupon,
            None => {
                let coupon = self.load(coupon_id).await?;
                self.env.cache_coupon(&coupon).await;
                coupon
            }
        };
        owned_by(coupon, owner_id)
    }

    /// Apply a coupon to an order.
    ///
    /// # Errors
    ///
    /// - [`CouponError::CouponNotFound`] if missing or owned by someone else
    /// - [`CouponError::TerminalState`], [`CouponError::AlreadyUsed`] or
    ///   [`CouponError::Expired`] from the state machine
    /// - [`CouponError::ConcurrentModification`] if another transition won
    /// - [`CouponError::TransientInfra`] when the store is down
    #[tracing::instrument(skip_all, fields(coupon_id = %coupon_id, order_id = %order_id), name = "use_coupon")]
    pub async fn use_coupon(
        &self,
        coupon_id: CouponId,
        owner_id: &OwnerId,
        order_id: OrderId,
    ) -> Result<Coupon> {
        let mut coupon = owned_by(self.load(coupon_id).await?, owner_id)?;
        let previous = coupon.status;
        coupon.mark_used(order_id, self.env.clock.now())?;
        self.commit(coupon, previous).await
    }

    /// Revert a use.
    ///
    /// # Errors
    ///
    /// - [`CouponError::CouponNotFound`] if missing or owned by someone else
    /// - [`CouponError::TerminalState`] or [`CouponError::NotUsed`] from the
    ///   state machine
    /// - [`CouponError::ConcurrentModification`] if another transition won
    /// - [`CouponError::TransientInfra`] when the store is down
    #[tracing::instrument(skip_all, fields(coupon_id = %coupon_id), name = "cancel_coupon")]
    pub async fn cancel(&self, coupon_id: CouponId, owner_id: &OwnerId) -> Result<Coupon> {
        let mut coupon = owned_by(self.load(coupon_id).await?, owner_id)?;
        let previous = coupon.status;
        coupon.cancel()?;
        self.commit(coupon, previous).await
    }

    async fn load(&self, coupon_id: CouponId) -> Result<Coupon> {
        self.env
            .coupons
            .find_coupon(coupon_id)
            .await?
            .ok_or(CouponError::CouponNotFound(coupon_id))
    }

    async fn commit(&self, coupon: Coupon, previous: CouponStatus) -> Result<Coupon> {
        if !self.env.coupons.save_transition(&coupon, previous).await? {
            tracing::info!("Transition lost a concurrent race");
            return Err(CouponError::ConcurrentModification(coupon.id));
        }

        CouponMetrics::record_transition(coupon.status.as_str());
        self.env.cache_coupon(&coupon).await;
        tracing::info!(from = %previous, to = %coupon.status, "Coupon transitioned");
        Ok(coupon)
    }
}

fn owned_by(coupon: Coupon, owner_id: &OwnerId) -> Result<Coupon> {
    if &coupon.owner_id == owner_id {
        Ok(coupon)
    } else {
        Err(CouponError::CouponNotFound(coupon.id))
    }
}
