//! Quantity Ledger abstraction.
//!
//! The ledger holds the remaining issuable quantity of every policy in a
//! store shared by all service instances. It is mutated only through atomic
//! operations:
//!
//! - [`QuantityLedger::reserve`] decrements by one. If the decrement drives the
//!   counter below zero, the same atomic step increments it back and reports
//!   [`Reservation::Exhausted`]. Callers never observe a negative value.
//! - [`QuantityLedger::compensate`] returns one unit for a reservation that
//!   could not be fulfilled. It is keyed by [`AttemptId`] and applies at most
//!   once per attempt, so a redelivered failure cannot inflate the inventory.
//!
//! # Implementations
//!
//! - `InMemoryQuantityLedger` (flashcoupon-testing)
//! - `RedisQuantityLedger` (flashcoupon-redis)

use crate::types::{AttemptId, PolicyId};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors returned by ledger backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// No ledger entry exists for the policy.
    #[error("Quantity ledger has no entry for policy {0}")]
    NotSeeded(PolicyId),

    /// Backend failure (connection, script error).
    #[error("Quantity ledger backend error: {0}")]
    Backend(String),
}

/// Outcome of a single reservation attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reservation {
    /// One unit reserved; `remaining` is the count left after this reservation.
    Reserved {
        /// Units still available
        remaining: i64,
    },
    /// Nothing left. The counter has already been restored.
    Exhausted,
}

impl Reservation {
    /// Returns `true` if a unit was reserved.
    #[must_use]
    pub const fn is_reserved(&self) -> bool {
        matches!(self, Self::Reserved { .. })
    }
}

/// Atomic per-policy remaining-quantity counter.
pub trait QuantityLedger: Send + Sync {
    /// Create or overwrite the entry for a policy.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Backend`] if the backend is unreachable.
    fn seed(
        &self,
        policy_id: PolicyId,
        quantity: u32,
    ) -> Pin<Box<dyn Future<Output = Result<(), LedgerError>> + Send + '_>>;

    /// Atomically take one unit.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::NotSeeded`] if the policy has no entry
    /// - [`LedgerError::Backend`] if the backend is unreachable
    fn reserve(
        &self,
        policy_id: PolicyId,
    ) -> Pin<Box<dyn Future<Output = Result<Reservation, LedgerError>> + Send + '_>>;

    /// Give back the unit taken by `attempt_id`.
    ///
    /// Returns `true` if the increment was applied, `false` if this attempt
    /// had already been compensated.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Backend`] if the backend is unreachable.
    fn compensate(
        &self,
        policy_id: PolicyId,
        attempt_id: AttemptId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LedgerError>> + Send + '_>>;

    /// Read the current remaining count, `None` if the policy is unseeded.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Backend`] if the backend is unreachable.
    fn remaining(
        &self,
        policy_id: PolicyId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<i64>, LedgerError>> + Send + '_>>;
}
