//! Coupon policy: what is offered, how many, and when.

use crate::error::CouponError;
use crate::types::PolicyId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Discount terms of a policy.
///
/// Carried through issuance unchanged; the engine never evaluates it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Discount {
    /// Fixed amount off the order total.
    FixedAmount(u32),
    /// Percentage off the order total (1-100).
    Percentage(u8),
}

/// A coupon offer with a bounded quantity and a validity window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponPolicy {
    /// Policy identifier
    pub id: PolicyId,
    /// Display name
    pub name: String,
    /// Discount terms
    pub discount: Discount,
    /// Minimum order amount the coupon applies to
    pub minimum_order_amount: u32,
    /// Cap on the discount granted
    pub maximum_discount_amount: u32,
    /// Total issuable quantity (always positive)
    pub total_quantity: u32,
    /// Start of the validity window (inclusive)
    pub valid_from: DateTime<Utc>,
    /// End of the validity window (inclusive)
    pub valid_until: DateTime<Utc>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl CouponPolicy {
    /// Build a new policy, validating quantity and window.
    ///
    /// # Errors
    ///
    /// Returns [`CouponError::Validation`] when the name is blank, the
    /// quantity is zero, the window is inverted, or a percentage discount is
    /// outside 1-100.
    pub fn new(
        name: impl Into<String>,
        discount: Discount,
        total_quantity: u32,
        valid_from: DateTime<Utc>,
        valid_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Self, CouponError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CouponError::Validation("policy name is required".into()));
        }
        if total_quantity == 0 {
            return Err(CouponError::Validation("total quantity must be at least 1".into()));
        }
        if valid_until < valid_from {
            return Err(CouponError::Validation(
                "validity window ends before it starts".into(),
            ));
        }
        if let Discount::Percentage(p) = discount {
            if p == 0 || p > 100 {
                return Err(CouponError::Validation(format!(
                    "percentage discount must be within 1-100, got {p}"
                )));
            }
        }

        Ok(Self {
            id: PolicyId::new(),
            name,
            discount,
            minimum_order_amount: 0,
            maximum_discount_amount: u32::MAX,
            total_quantity,
            valid_from,
            valid_until,
            created_at: now,
            updated_at: now,
        })
    }

    /// Set order amount bounds.
    #[must_use]
    pub const fn with_order_bounds(mut self, minimum_order_amount: u32, maximum_discount_amount: u32) -> Self {
        self.minimum_order_amount = minimum_order_amount;
        self.maximum_discount_amount = maximum_discount_amount;
        self
    }

    /// Returns `true` if `at` falls inside `[valid_from, valid_until]`.
    #[must_use]
    pub fn is_within_window(&self, at: DateTime<Utc>) -> bool {
        at >= self.valid_from && at <= self.valid_until
    }

    /// Fail with [`CouponError::IssuanceWindowClosed`] outside the window.
    ///
    /// # Errors
    ///
    /// Returns [`CouponError::IssuanceWindowClosed`] if `at` is outside the window.
    pub fn ensure_issuable_at(&self, at: DateTime<Utc>) -> Result<(), CouponError> {
        if self.is_within_window(at) {
            Ok(())
        } else {
            Err(CouponError::IssuanceWindowClosed(self.id))
        }
    }
}
