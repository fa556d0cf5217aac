//! In-memory policy store and coupon repository.

use flashcoupon_core::coupon::{Coupon, CouponStatus};
use flashcoupon_core::policy::CouponPolicy;
use flashcoupon_core::store::{
    BoundedPersistOutcome, CouponRepository, PersistOutcome, PolicyStore, StoreError,
};
use flashcoupon_core::types::{AttemptId, CouponId, OwnerId, PolicyId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Policy store backed by a `HashMap`.
#[derive(Clone, Debug, Default)]
pub struct InMemoryPolicyStore {
    policies: Arc<RwLock<HashMap<PolicyId, CouponPolicy>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryPolicyStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`StoreError::Unavailable`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Remove a policy, simulating deletion by the policy administration
    pub fn remove(&self, policy_id: PolicyId) -> Option<CouponPolicy> {
        self.policies.write().unwrap().remove(&policy_id)
    }

    /// Synchronous lookup for assertions
    #[must_use]
    pub fn peek(&self, policy_id: PolicyId) -> Option<CouponPolicy> {
        self.policies.read().unwrap().get(&policy_id).cloned()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("policy store unavailable".into()))
        } else {
            Ok(())
        }
    }
}

impl PolicyStore for InMemoryPolicyStore {
    fn insert_policy<'a>(
        &'a self,
        policy: &'a CouponPolicy,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            self.check_available()?;
            let mut policies = self.policies.write().unwrap();
            if policies.contains_key(&policy.id) {
                return Err(StoreError::Rejected(format!("policy {} already exists", policy.id)));
            }
            policies.insert(policy.id, policy.clone());
            Ok(())
        })
    }

    fn get_policy(
        &self,
        policy_id: PolicyId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CouponPolicy>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.peek(policy_id))
        })
    }
}

#[derive(Debug, Default)]
struct CouponTable {
    rows: HashMap<CouponId, Coupon>,
    by_attempt: HashMap<(PolicyId, OwnerId, AttemptId), CouponId>,
}

/// Coupon repository backed by a `HashMap`.
///
/// Holds a handle to the policy store to enforce the policy foreign key and
/// the quantity bound of [`CouponRepository::insert_within_quantity`].
#[derive(Clone, Debug)]
pub struct InMemoryCouponRepository {
    policies: InMemoryPolicyStore,
    table: Arc<Mutex<CouponTable>>,
    unavailable: Arc<AtomicBool>,
    transient_failures: Arc<AtomicU32>,
}

impl InMemoryCouponRepository {
    /// Create an empty repository referencing `policies`
    #[must_use]
    pub fn new(policies: InMemoryPolicyStore) -> Self {
        Self {
            policies,
            table: Arc::new(Mutex::new(CouponTable::default())),
            unavailable: Arc::new(AtomicBool::new(false)),
            transient_failures: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Make every operation fail with [`StoreError::Unavailable`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `count` inserts with [`StoreError::Unavailable`]
    pub fn fail_next_inserts(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Number of stored coupons for a policy
    #[must_use]
    pub fn count(&self, policy_id: PolicyId) -> usize {
        self.table
            .lock()
            .unwrap()
            .rows
            .values()
            .filter(|c| c.policy_id == policy_id)
            .count()
    }

    /// All stored coupons
    #[must_use]
    pub fn all(&self) -> Vec<Coupon> {
        self.table.lock().unwrap().rows.values().cloned().collect()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("coupon store unavailable".into()));
        }
        Ok(())
    }

    fn check_insert(&self) -> Result<(), StoreError> {
        self.check_available()?;
        let injected = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected transient failure".into()));
        }
        Ok(())
    }

    fn insert_locked(table: &mut CouponTable, coupon: &Coupon) -> Result<PersistOutcome, StoreError> {
        let key = (coupon.policy_id, coupon.owner_id.clone(), coupon.attempt_id);
        if table.by_attempt.contains_key(&key) {
            return Ok(PersistOutcome::AlreadyExists);
        }
        if table.rows.values().any(|c| c.code == coupon.code) {
            return Err(StoreError::Rejected(format!("duplicate coupon code {}", coupon.code)));
        }
        table.by_attempt.insert(key, coupon.id);
        table.rows.insert(coupon.id, coupon.clone());
        Ok(PersistOutcome::Created)
    }
}

impl CouponRepository for InMemoryCouponRepository {
    fn insert_idempotent<'a>(
        &'a self,
        coupon: &'a Coupon,
    ) -> Pin<Box<dyn Future<Output = Result<PersistOutcome, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            self.check_insert()?;
            if self.policies.peek(coupon.policy_id).is_none() {
                return Err(StoreError::Rejected(format!(
                    "policy {} does not exist",
                    coupon.policy_id
                )));
            }
            let mut table = self.table.lock().unwrap();
            Self::insert_locked(&mut table, coupon)
        })
    }

    fn insert_within_quantity<'a>(
        &'a self,
        coupon: &'a Coupon,
    ) -> Pin<Box<dyn Future<Output = Result<BoundedPersistOutcome, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            self.check_insert()?;
            let Some(policy) = self.policies.peek(coupon.policy_id) else {
                return Err(StoreError::Rejected(format!(
                    "policy {} does not exist",
                    coupon.policy_id
                )));
            };

            // The table lock stands in for the row lock on the policy.
            let mut table = self.table.lock().unwrap();
            let key = (coupon.policy_id, coupon.owner_id.clone(), coupon.attempt_id);
            if table.by_attempt.contains_key(&key) {
                return Ok(BoundedPersistOutcome::AlreadyExists);
            }
            let issued = table
                .rows
                .values()
                .filter(|c| c.policy_id == coupon.policy_id)
                .count();
            if issued >= policy.total_quantity as usize {
                return Ok(BoundedPersistOutcome::QuantityExhausted);
            }
            Self::insert_locked(&mut table, coupon).map(|_| BoundedPersistOutcome::Created)
        })
    }

    fn find_coupon(
        &self,
        coupon_id: CouponId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Coupon>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.table.lock().unwrap().rows.get(&coupon_id).cloned())
        })
    }

    fn find_by_attempt<'a>(
        &'a self,
        policy_id: PolicyId,
        owner_id: &'a OwnerId,
        attempt_id: AttemptId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Coupon>, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            self.check_available()?;
            let table = self.table.lock().unwrap();
            let key = (policy_id, owner_id.clone(), attempt_id);
            Ok(table
                .by_attempt
                .get(&key)
                .and_then(|id| table.rows.get(id))
                .cloned())
        })
    }

    fn save_transition<'a>(
        &'a self,
        coupon: &'a Coupon,
        expected: CouponStatus,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            self.check_available()?;
            let mut table = self.table.lock().unwrap();
            match table.rows.get_mut(&coupon.id) {
                Some(stored) if stored.status == expected => {
                    stored.status = coupon.status;
                    stored.order_id = coupon.order_id;
                    stored.used_at = coupon.used_at;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn count_by_policy(
        &self,
        policy_id: PolicyId,
    ) -> Pin<Box<dyn Future<Output = Result<u64, StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.count(policy_id) as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use flashcoupon_core::policy::Discount;

    fn setup(quantity: u32) -> (InMemoryCouponRepository, CouponPolicy) {
        let now = Utc::now();
        let policy = CouponPolicy::new(
            "test",
            Discount::FixedAmount(500),
            quantity,
            now - Duration::hours(1),
            now + Duration::hours(1),
            now,
        )
        .unwrap();
        let policies = InMemoryPolicyStore::new();
        policies.policies.write().unwrap().insert(policy.id, policy.clone());
        (InMemoryCouponRepository::new(policies), policy)
    }

    fn coupon(policy: &CouponPolicy) -> Coupon {
        Coupon::issue(policy, OwnerId::new("owner").unwrap(), AttemptId::new(), Utc::now())
    }

    #[tokio::test]
    async fn idempotent_insert_ignores_same_attempt() {
        let (repo, policy) = setup(5);
        let first = coupon(&policy);
        let mut replay = coupon(&policy);
        replay.attempt_id = first.attempt_id;

        assert_eq!(repo.insert_idempotent(&first).await.unwrap(), PersistOutcome::Created);
        assert_eq!(repo.insert_idempotent(&replay).await.unwrap(), PersistOutcome::AlreadyExists);
        assert_eq!(repo.count(policy.id), 1);
    }

    #[tokio::test]
    async fn find_by_attempt_returns_the_first_write() {
        let (repo, policy) = setup(5);
        let first = coupon(&policy);
        repo.insert_idempotent(&first).await.unwrap();

        let found = repo
            .find_by_attempt(policy.id, &first.owner_id, first.attempt_id)
            .await
            .unwrap();
        assert_eq!(found, Some(first.clone()));
        assert_eq!(
            repo.find_by_attempt(policy.id, &first.owner_id, AttemptId::new())
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn bounded_insert_stops_at_total_quantity() {
        let (repo, policy) = setup(1);
        assert_eq!(
            repo.insert_within_quantity(&coupon(&policy)).await.unwrap(),
            BoundedPersistOutcome::Created
        );
        assert_eq!(
            repo.insert_within_quantity(&coupon(&policy)).await.unwrap(),
            BoundedPersistOutcome::QuantityExhausted
        );
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let (repo, policy) = setup(1);
        let mut c = coupon(&policy);
        repo.insert_idempotent(&c).await.unwrap();

        c.mark_used(flashcoupon_core::OrderId::new(7).unwrap(), Utc::now()).unwrap();
        assert!(repo.save_transition(&c, CouponStatus::Available).await.unwrap());
        assert!(!repo.save_transition(&c, CouponStatus::Available).await.unwrap());
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let (repo, policy) = setup(1);
        repo.fail_next_inserts(1);
        let c = coupon(&policy);
        assert!(matches!(repo.insert_idempotent(&c).await, Err(StoreError::Unavailable(_))));
        assert_eq!(repo.insert_idempotent(&c).await.unwrap(), PersistOutcome::Created);
    }
}
