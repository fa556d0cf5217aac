//! # Flashcoupon Testing
//!
//! In-memory implementations of every backend trait in `flashcoupon-core`,
//! plus clocks and small helpers for tests.
//!
//! Every in-memory backend is cheap to clone (clones share state) and carries
//! fault-injection switches so tests can simulate outages:
//!
//! - [`InMemoryQuantityLedger`]: atomic counter map
//! - [`InMemoryMutex`]: lease-based lock with real wait/expiry on tokio time
//! - [`InMemoryIssuanceQueue`]: competing-consumer queue with redelivery
//! - [`InMemoryPolicyStore`] / [`InMemoryCouponRepository`]: durable stores
//! - [`InMemoryStateCache`]: coupon/policy snapshot cache
//!
//! ## Example
//!
//! ```ignore
//! use flashcoupon_testing::{InMemoryQuantityLedger, test_clock};
//!
//! #[tokio::test]
//! async fn reserves_until_empty() {
//!     let ledger = InMemoryQuantityLedger::new();
//!     ledger.seed(policy_id, 1).await.unwrap();
//!     assert!(ledger.reserve(policy_id).await.unwrap().is_reserved());
//! }
//! ```

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap on poisoned locks
#![allow(clippy::missing_panics_doc)]

pub mod cache;
pub mod ledger;
pub mod lock;
pub mod queue;
pub mod store;

pub use cache::InMemoryStateCache;
pub use ledger::InMemoryQuantityLedger;
pub use lock::InMemoryMutex;
pub use queue::InMemoryIssuanceQueue;
pub use store::{InMemoryCouponRepository, InMemoryPolicyStore};

use chrono::{DateTime, Utc};
use flashcoupon_core::environment::Clock;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use flashcoupon_testing::mocks::FixedClock;
    /// use flashcoupon_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can hand one clone to a service
    /// and advance it from the outside.
    ///
    /// ```
    /// use flashcoupon_testing::mocks::ManualClock;
    /// use flashcoupon_core::environment::Clock;
    /// use chrono::{Duration, Utc};
    ///
    /// let start = Utc::now();
    /// let clock = ManualClock::new(start);
    /// clock.advance(Duration::hours(2));
    /// assert_eq!(clock.now(), start + Duration::hours(2));
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock starting at `time`
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap();
            *time += by;
        }

        /// Jump to an absolute time
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap() = to;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Test helpers.
pub mod helpers {
    /// Install a fmt subscriber that honours `RUST_LOG`, once per process.
    ///
    /// Safe to call from every test; later calls are no-ops.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

// Re-export commonly used items
pub use helpers::init_test_tracing;
pub use mocks::{FixedClock, ManualClock, test_clock};
