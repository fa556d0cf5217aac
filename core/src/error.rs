//! Error taxonomy for coupon issuance and coupon state changes.

use crate::ledger::LedgerError;
use crate::lock::LockError;
use crate::queue::QueueError;
use crate::store::StoreError;
use crate::types::{CouponId, PolicyId};
use thiserror::Error;

/// Result type alias for coupon operations.
pub type Result<T> = std::result::Result<T, CouponError>;

/// Coarse classification of a [`CouponError`].
///
/// Callers (an HTTP gateway, a client SDK) branch on the kind rather than on
/// individual variants to decide on retries and status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed request; never retried.
    Validation,
    /// Unknown policy or coupon.
    NotFound,
    /// State conflict (already used, not used, terminal, outside window).
    Conflict,
    /// Inventory exhausted for the policy.
    Exhausted,
    /// Lock not acquired within the wait window; retry with backoff.
    Contention,
    /// Backend momentarily unavailable.
    TransientInfra,
}

/// Comprehensive error taxonomy for the issuance engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CouponError {
    // ═══════════════════════════════════════════════════════════
    // Validation
    // ═══════════════════════════════════════════════════════════

    /// Request failed validation.
    #[error("Invalid request: {0}")]
    Validation(String),

    // ═══════════════════════════════════════════════════════════
    // Not found
    // ═══════════════════════════════════════════════════════════

    /// Policy does not exist (or was never seeded into the ledger).
    #[error("Coupon policy not found: {0}")]
    PolicyNotFound(PolicyId),

    /// Coupon does not exist or is not owned by the caller.
    #[error("Coupon not found: {0}")]
    CouponNotFound(CouponId),

    // ═══════════════════════════════════════════════════════════
    // Conflicts
    // ═══════════════════════════════════════════════════════════

    /// Coupon has already been used.
    #[error("Coupon {0} has already been used")]
    AlreadyUsed(CouponId),

    /// Only used coupons can be cancelled.
    #[error("Coupon {0} has not been used and cannot be cancelled")]
    NotUsed(CouponId),

    /// Coupon is cancelled; cancelled is terminal.
    #[error("Coupon {0} is cancelled and accepts no further transitions")]
    TerminalState(CouponId),

    /// Coupon is outside its validity window.
    #[error("Coupon {0} is outside its validity window")]
    Expired(CouponId),

    /// Issuance attempted outside the policy's validity window.
    #[error("Coupon issuance for policy {0} is not available during this period")]
    IssuanceWindowClosed(PolicyId),

    /// Another transition on the same coupon won the race.
    #[error("Coupon {0} was modified concurrently")]
    ConcurrentModification(CouponId),

    /// Durable store refused the write for a non-retryable reason.
    #[error("Request rejected by store: {0}")]
    Rejected(String),

    // ═══════════════════════════════════════════════════════════
    // Capacity and backpressure
    // ═══════════════════════════════════════════════════════════

    /// Every coupon of the policy has been reserved.
    #[error("All coupons for policy {0} have been issued")]
    Exhausted(PolicyId),

    /// Per-policy lock was not acquired within the wait window.
    #[error("Too many coupon issuance requests for '{key}'; please retry later")]
    Contention {
        /// Lock key that could not be acquired
        key: String,
    },

    // ═══════════════════════════════════════════════════════════
    // Infrastructure
    // ═══════════════════════════════════════════════════════════

    /// Queue, cache or store momentarily unavailable.
    #[error("Infrastructure temporarily unavailable: {0}")]
    TransientInfra(String),
}

impl CouponError {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::PolicyNotFound(_) | Self::CouponNotFound(_) => ErrorKind::NotFound,
            Self::AlreadyUsed(_)
            | Self::NotUsed(_)
            | Self::TerminalState(_)
            | Self::Expired(_)
            | Self::IssuanceWindowClosed(_)
            | Self::ConcurrentModification(_)
            | Self::Rejected(_) => ErrorKind::Conflict,
            Self::Exhausted(_) => ErrorKind::Exhausted,
            Self::Contention { .. } => ErrorKind::Contention,
            Self::TransientInfra(_) => ErrorKind::TransientInfra,
        }
    }

    /// Returns `true` if retrying the same request may succeed.
    ///
    /// # Examples
    ///
    /// ```
    /// use flashcoupon_core::{CouponError, PolicyId};
    ///
    /// assert!(CouponError::Contention { key: "coupon:lock:1".into() }.is_retryable());
    /// assert!(!CouponError::Exhausted(PolicyId::new()).is_retryable());
    /// ```
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Contention | ErrorKind::TransientInfra)
    }

    /// HTTP-equivalent status code for an external gateway.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::PolicyNotFound(_) | Self::CouponNotFound(_) => 404,
            Self::Expired(_) | Self::IssuanceWindowClosed(_) | Self::Rejected(_) => 422,
            Self::AlreadyUsed(_)
            | Self::NotUsed(_)
            | Self::TerminalState(_)
            | Self::ConcurrentModification(_)
            | Self::Exhausted(_) => 409,
            Self::Contention { .. } => 429,
            Self::TransientInfra(_) => 503,
        }
    }
}

impl From<LockError> for CouponError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout { key, .. } => Self::Contention { key },
            LockError::Backend(reason) => Self::TransientInfra(format!("lock backend: {reason}")),
        }
    }
}

impl From<LedgerError> for CouponError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotSeeded(policy_id) => Self::PolicyNotFound(policy_id),
            LedgerError::Backend(reason) => Self::TransientInfra(format!("quantity ledger: {reason}")),
        }
    }
}

impl From<QueueError> for CouponError {
    fn from(err: QueueError) -> Self {
        Self::TransientInfra(format!("issuance queue: {err}"))
    }
}

impl From<StoreError> for CouponError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => Self::TransientInfra(format!("store: {reason}")),
            StoreError::Rejected(reason) => Self::Rejected(reason),
        }
    }
}
