//! # Flashcoupon Core
//!
//! Domain types and backend abstractions for the flash coupon issuance engine.
//!
//! The engine hands out coupons from a fixed-size pool to many concurrent
//! requesters without ever issuing more than the policy's total quantity.
//!
//! ## Core Concepts
//!
//! - **Policy**: total issuable quantity plus a validity window ([`policy`])
//! - **Coupon**: an issued coupon and its `Available → Used → Cancelled`
//!   state machine ([`coupon`])
//! - **Quantity Ledger**: externally addressable atomic counter of remaining
//!   inventory per policy ([`ledger`])
//! - **Distributed Mutex**: per-policy lease-based lock around the ledger
//!   mutation ([`lock`])
//! - **Issuance Queue**: at-least-once channel between acceptance and durable
//!   fulfillment ([`queue`])
//! - **Stores**: durable policy and coupon storage ([`store`])
//! - **State Cache**: best-effort read cache ([`cache`])
//!
//! ## Architecture
//!
//! ```text
//! request ──► lock(policy) ──► window check ──► ledger.reserve ──► queue.publish ──► unlock
//!                                                                       │
//!                                                                       ▼
//!                        cache.put ◄── repository.insert_idempotent ◄── worker
//! ```
//!
//! Every backend is a trait so that production implementations (Redis,
//! Redpanda, `PostgreSQL`) and in-memory test implementations are
//! interchangeable behind `Arc<dyn Trait>`.

pub mod cache;
pub mod coupon;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod policy;
pub mod queue;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use coupon::{Coupon, CouponStatus};
pub use error::{CouponError, ErrorKind, Result};
pub use policy::{CouponPolicy, Discount};
pub use types::{AttemptId, CouponCode, CouponId, OrderId, OwnerId, PolicyId};

/// Environment module - time abstraction injected into the services.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use flashcoupon_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock implementation used in production.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
