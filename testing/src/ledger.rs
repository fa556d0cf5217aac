//! In-memory Quantity Ledger.

use flashcoupon_core::ledger::{LedgerError, QuantityLedger, Reservation};
use flashcoupon_core::types::{AttemptId, PolicyId};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct LedgerState {
    remaining: HashMap<PolicyId, i64>,
    compensated: HashSet<(PolicyId, AttemptId)>,
}

/// Ledger backed by a `HashMap` behind a mutex.
///
/// The decrement and the restoring increment of an exhausted reservation
/// happen under the same lock, matching the single-script behaviour of the
/// Redis ledger.
#[derive(Clone, Debug, Default)]
pub struct InMemoryQuantityLedger {
    state: Arc<Mutex<LedgerState>>,
    unavailable: Arc<AtomicBool>,
    reserve_calls: Arc<AtomicU64>,
    compensations: Arc<AtomicU64>,
}

impl InMemoryQuantityLedger {
    /// Create an empty ledger
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`LedgerError::Backend`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Current value without going through the async trait
    #[must_use]
    pub fn peek(&self, policy_id: PolicyId) -> Option<i64> {
        self.state.lock().unwrap().remaining.get(&policy_id).copied()
    }

    /// Number of `reserve` calls seen
    #[must_use]
    pub fn reserve_calls(&self) -> u64 {
        self.reserve_calls.load(Ordering::SeqCst)
    }

    /// Number of compensations actually applied
    #[must_use]
    pub fn compensations(&self) -> u64 {
        self.compensations.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), LedgerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(LedgerError::Backend("ledger unavailable".into()))
        } else {
            Ok(())
        }
    }
}

impl QuantityLedger for InMemoryQuantityLedger {
    fn seed(
        &self,
        policy_id: PolicyId,
        quantity: u32,
    ) -> Pin<Box<dyn Future<Output = Result<(), LedgerError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            self.state
                .lock()
                .unwrap()
                .remaining
                .insert(policy_id, i64::from(quantity));
            Ok(())
        })
    }

    fn reserve(
        &self,
        policy_id: PolicyId,
    ) -> Pin<Box<dyn Future<Output = Result<Reservation, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            self.reserve_calls.fetch_add(1, Ordering::SeqCst);

            let mut state = self.state.lock().unwrap();
            let counter = state
                .remaining
                .get_mut(&policy_id)
                .ok_or(LedgerError::NotSeeded(policy_id))?;
            *counter -= 1;
            if *counter < 0 {
                *counter += 1;
                return Ok(Reservation::Exhausted);
            }
            Ok(Reservation::Reserved { remaining: *counter })
        })
    }

    fn compensate(
        &self,
        policy_id: PolicyId,
        attempt_id: AttemptId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            let mut state = self.state.lock().unwrap();
            if !state.compensated.insert((policy_id, attempt_id)) {
                return Ok(false);
            }
            *state.remaining.entry(policy_id).or_insert(0) += 1;
            self.compensations.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        })
    }

    fn remaining(
        &self,
        policy_id: PolicyId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<i64>, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.peek(policy_id))
        })
    }
}
