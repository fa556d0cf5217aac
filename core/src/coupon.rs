//! Issued coupons and their lifecycle.
//!
//! ```text
//!              mark_used(order)            cancel()
//!  Available ───────────────────► Used ───────────────► Cancelled (terminal)
//! ```
//!
//! Transitions are pure in-memory mutations; persisting them is the caller's
//! job (see `CouponRepository::save_transition`).

use crate::error::CouponError;
use crate::policy::CouponPolicy;
use crate::types::{AttemptId, CouponCode, CouponId, OrderId, OwnerId, PolicyId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a coupon.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CouponStatus {
    /// Issued and not yet used
    Available,
    /// Applied to an order
    Used,
    /// Use was reverted; terminal
    Cancelled,
}

impl CouponStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Used => "USED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Parse status from its database string.
    ///
    /// # Errors
    ///
    /// Returns [`CouponError::Validation`] if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, CouponError> {
        match s {
            "AVAILABLE" => Ok(Self::Available),
            "USED" => Ok(Self::Used),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(CouponError::Validation(format!("Invalid coupon status: {s}"))),
        }
    }

    /// Returns `true` for states with no outgoing transition.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl fmt::Display for CouponStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An issued coupon.
///
/// The validity window is copied from the policy at issuance so expiry can be
/// evaluated without another policy lookup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coupon {
    /// Coupon identifier
    pub id: CouponId,
    /// Policy the coupon was issued from
    pub policy_id: PolicyId,
    /// Owner the coupon was issued to
    pub owner_id: OwnerId,
    /// Issuance attempt that produced this coupon (idempotency key)
    pub attempt_id: AttemptId,
    /// Unique redeemable code
    pub code: CouponCode,
    /// Current lifecycle state
    pub status: CouponStatus,
    /// Order the coupon is applied to (only while `Used`)
    pub order_id: Option<OrderId>,
    /// When the coupon was used (only while `Used`)
    pub used_at: Option<DateTime<Utc>>,
    /// Start of validity (inclusive)
    pub valid_from: DateTime<Utc>,
    /// End of validity (inclusive)
    pub valid_until: DateTime<Utc>,
    /// Issuance time
    pub created_at: DateTime<Utc>,
}

impl Coupon {
    /// Create a fresh `Available` coupon for a reserved attempt.
    #[must_use]
    pub fn issue(
        policy: &CouponPolicy,
        owner_id: OwnerId,
        attempt_id: AttemptId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CouponId::new(),
            policy_id: policy.id,
            owner_id,
            attempt_id,
            code: CouponCode::generate(),
            status: CouponStatus::Available,
            order_id: None,
            used_at: None,
            valid_from: policy.valid_from,
            valid_until: policy.valid_until,
            created_at: now,
        }
    }

    /// Returns `true` if `at` is outside the coupon's validity window.
    #[must_use]
    pub fn is_expired_at(&self, at: DateTime<Utc>) -> bool {
        at < self.valid_from || at > self.valid_until
    }

    /// Apply the coupon to an order.
    ///
    /// # Errors
    ///
    /// - [`CouponError::TerminalState`] if the coupon is cancelled
    /// - [`CouponError::AlreadyUsed`] if the coupon is already used
    /// - [`CouponError::Expired`] if `now` is outside the validity window
    pub fn mark_used(&mut self, order_id: OrderId, now: DateTime<Utc>) -> Result<(), CouponError> {
        match self.status {
            CouponStatus::Cancelled => return Err(CouponError::TerminalState(self.id)),
            CouponStatus::Used => return Err(CouponError::AlreadyUsed(self.id)),
            CouponStatus::Available => {}
        }
        if self.is_expired_at(now) {
            return Err(CouponError::Expired(self.id));
        }

        self.status = CouponStatus::Used;
        self.order_id = Some(order_id);
        self.used_at = Some(now);
        Ok(())
    }

    /// Revert a use.
    ///
    /// # Errors
    ///
    /// - [`CouponError::TerminalState`] if the coupon is already cancelled
    /// - [`CouponError::NotUsed`] if the coupon was never used
    pub fn cancel(&mut self) -> Result<(), CouponError> {
        match self.status {
            CouponStatus::Cancelled => Err(CouponError::TerminalState(self.id)),
            CouponStatus::Available => Err(CouponError::NotUsed(self.id)),
            CouponStatus::Used => {
                self.status = CouponStatus::Cancelled;
                self.order_id = None;
                self.used_at = None;
                Ok(())
            }
        }
    }
}
