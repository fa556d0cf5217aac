//! Key layout.
//!
//! | Key | Value |
//! |---|---|
//! | `coupon:quantity:{policyId}` | remaining units (integer) |
//! | `coupon:compensated:{policyId}:{attemptId}` | marker, one per compensated attempt |
//! | `coupon:state:{couponId}` | coupon JSON |
//! | `coupon:policy:{policyId}` | policy JSON |
//!
//! Lock keys are chosen by the caller (`coupon:lock:{policyId}`).

use flashcoupon_core::{AttemptId, CouponId, PolicyId};

/// Ledger counter for a policy.
#[must_use]
pub fn quantity(policy_id: PolicyId) -> String {
    format!("coupon:quantity:{policy_id}")
}

/// Marker recording that an attempt was compensated.
#[must_use]
pub fn compensated(policy_id: PolicyId, attempt_id: AttemptId) -> String {
    format!("coupon:compensated:{policy_id}:{attempt_id}")
}

/// Cached coupon snapshot.
#[must_use]
pub fn coupon_state(coupon_id: CouponId) -> String {
    format!("coupon:state:{coupon_id}")
}

/// Cached policy snapshot.
#[must_use]
pub fn policy(policy_id: PolicyId) -> String {
    format!("coupon:policy:{policy_id}")
}
