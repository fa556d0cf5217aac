//! In-memory State Cache.

use flashcoupon_core::cache::{CacheError, StateCache};
use flashcoupon_core::coupon::Coupon;
use flashcoupon_core::policy::CouponPolicy;
use flashcoupon_core::types::{CouponId, PolicyId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Snapshot cache with an outage switch.
#[derive(Clone, Debug, Default)]
pub struct InMemoryStateCache {
    coupons: Arc<RwLock<HashMap<CouponId, Coupon>>>,
    policies: Arc<RwLock<HashMap<PolicyId, CouponPolicy>>>,
    unavailable: Arc<AtomicBool>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl InMemoryStateCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`CacheError`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Cached coupon, bypassing the outage switch
    #[must_use]
    pub fn peek_coupon(&self, coupon_id: CouponId) -> Option<Coupon> {
        self.coupons.read().unwrap().get(&coupon_id).cloned()
    }

    /// Cached policy, bypassing the outage switch
    #[must_use]
    pub fn peek_policy(&self, policy_id: PolicyId) -> Option<CouponPolicy> {
        self.policies.read().unwrap().get(&policy_id).cloned()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.coupons.write().unwrap().clear();
        self.policies.write().unwrap().clear();
    }

    /// Number of reads answered from the cache
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::SeqCst)
    }

    /// Number of reads that missed
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(CacheError("cache unavailable".into()))
        } else {
            Ok(())
        }
    }

    fn record<T>(&self, found: Option<T>) -> Option<T> {
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::SeqCst);
        found
    }
}

impl StateCache for InMemoryStateCache {
    fn put_coupon<'a>(
        &'a self,
        coupon: &'a Coupon,
    ) -> Pin<Box<dyn Future<Output = Result<(), CacheError>> + Send + 'a>> {
        Box::pin(async move {
            self.check_available()?;
            self.coupons.write().unwrap().insert(coupon.id, coupon.clone());
            Ok(())
        })
    }

    fn get_coupon(
        &self,
        coupon_id: CouponId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Coupon>, CacheError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.record(self.peek_coupon(coupon_id)))
        })
    }

    fn put_policy<'a>(
        &'a self,
        policy: &'a CouponPolicy,
    ) -> Pin<Box<dyn Future<Output = Result<(), CacheError>> + Send + 'a>> {
        Box::pin(async move {
            self.check_available()?;
            self.policies.write().unwrap().insert(policy.id, policy.clone());
            Ok(())
        })
    }

    fn get_policy(
        &self,
        policy_id: PolicyId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CouponPolicy>, CacheError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.record(self.peek_policy(policy_id)))
        })
    }
}
