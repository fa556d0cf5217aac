//! Shared wiring for runtime integration tests.

#![allow(clippy::expect_used, clippy::unwrap_used, dead_code)] // Test code can use unwrap/expect

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use flashcoupon_core::{CouponPolicy, Discount, OwnerId, PolicyId};
use flashcoupon_runtime::retry::RetryPolicy;
use flashcoupon_runtime::{
    CouponService, Environment, FulfillmentSettings, FulfillmentWorker, IssuanceService,
    IssuanceSettings, PolicyRegistry,
};
use flashcoupon_testing::{
    InMemoryCouponRepository, InMemoryIssuanceQueue, InMemoryMutex, InMemoryPolicyStore,
    InMemoryQuantityLedger, InMemoryStateCache, ManualClock, test_clock,
};
use flashcoupon_core::environment::Clock;
use std::sync::Arc;
use std::time::Duration;

/// Consumer group used by the tests.
pub const GROUP: &str = "coupon-service";

/// In-memory backends plus handles to inspect them.
pub struct Harness {
    pub env: Environment,
    pub ledger: InMemoryQuantityLedger,
    pub mutex: InMemoryMutex,
    pub queue: InMemoryIssuanceQueue,
    pub policies: InMemoryPolicyStore,
    pub coupons: InMemoryCouponRepository,
    pub cache: InMemoryStateCache,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new() -> Self {
        let ledger = InMemoryQuantityLedger::new();
        let mutex = InMemoryMutex::new();
        let queue = InMemoryIssuanceQueue::new();
        let policies = InMemoryPolicyStore::new();
        let coupons = InMemoryCouponRepository::new(policies.clone());
        let cache = InMemoryStateCache::new();
        let clock = ManualClock::new(test_clock().now());

        let env = Environment::new(
            Arc::new(ledger.clone()),
            Arc::new(mutex.clone()),
            Arc::new(queue.clone()),
            Arc::new(policies.clone()),
            Arc::new(coupons.clone()),
            Arc::new(cache.clone()),
        )
        .with_clock(Arc::new(clock.clone()));

        Self {
            env,
            ledger,
            mutex,
            queue,
            policies,
            coupons,
            cache,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Policy valid from one hour ago until one hour from now.
    pub fn policy(&self, quantity: u32) -> CouponPolicy {
        let now = self.now();
        CouponPolicy::new(
            "Flash sale",
            Discount::Percentage(20),
            quantity,
            now - ChronoDuration::hours(1),
            now + ChronoDuration::hours(1),
            now,
        )
        .unwrap()
    }

    /// Register a policy of `quantity` and return its id.
    pub async fn register(&self, quantity: u32) -> PolicyId {
        let policy = self.policy(quantity);
        PolicyRegistry::new(self.env.clone())
            .register(policy)
            .await
            .unwrap()
            .id
    }

    pub fn issuance(&self) -> IssuanceService {
        self.issuance_with(fast_issuance())
    }

    pub fn issuance_with(&self, settings: IssuanceSettings) -> IssuanceService {
        IssuanceService::new(self.env.clone(), settings).unwrap()
    }

    pub fn worker(&self) -> FulfillmentWorker {
        FulfillmentWorker::new(self.env.clone(), &fast_fulfillment())
    }

    pub fn coupon_service(&self) -> CouponService {
        CouponService::new(self.env.clone())
    }
}

pub fn owner(name: &str) -> OwnerId {
    OwnerId::new(name).unwrap()
}

pub fn fast_retry(max_retries: usize) -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(max_retries)
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .jitter(false)
        .build()
}

pub fn fast_issuance() -> IssuanceSettings {
    IssuanceSettings::default()
        .with_enqueue_retry(fast_retry(1))
        .with_persist_retry(fast_retry(1))
}

pub fn fast_fulfillment() -> FulfillmentSettings {
    FulfillmentSettings::default()
        .with_workers(2)
        .with_consumer_group(GROUP)
        .with_persist_retry(fast_retry(2))
}
