//! # Flashcoupon Runtime
//!
//! Services of the flash coupon issuance engine, written against the
//! backend traits of `flashcoupon-core`.
//!
//! ## Core Components
//!
//! - [`IssuanceService`]: acceptance path (lock → window → reserve →
//!   enqueue → unlock), plus the direct and degraded fallbacks and ledger
//!   resynchronisation
//! - [`FulfillmentWorker`] / [`WorkerPool`]: consume the issuance queue and
//!   persist coupons idempotently
//! - [`CouponService`]: owner-scoped reads and use/cancel transitions
//! - [`PolicyRegistry`]: register a policy and seed its ledger
//! - [`LockGuard`]: releases the policy lock on every exit path
//! - [`ReservationGuard`]: returns a reserved unit if the request is dropped
//!   before its enqueue
//!
//! ## Example
//!
//! ```ignore
//! use flashcoupon_runtime::{Environment, IssuanceService, IssuanceSettings};
//!
//! let env = Environment::new(ledger, mutex, queue, policies, coupons, cache);
//! let issuance = IssuanceService::new(env.clone(), IssuanceSettings::default())?;
//!
//! let accepted = issuance.request_issue(policy_id, owner_id).await?;
//! println!("reserved, {} left", accepted.remaining);
//! ```

/// Backends injected into the services
pub mod environment;

/// Owner-scoped coupon reads and transitions
pub mod coupons;

/// Lock lease guard
pub mod guard;

/// Acceptance path and fallbacks
pub mod issuance;

/// Prometheus metrics for observability
pub mod metrics;

/// Policy registration
pub mod registry;

/// Retry logic with exponential backoff
pub mod retry;

/// Tunables
pub mod settings;

/// Fulfillment workers
pub mod worker;

pub use coupons::CouponService;
pub use environment::Environment;
pub use guard::{LockGuard, ReservationGuard};
pub use issuance::{Accepted, IssuanceService, IssuedCoupon, lock_key};
pub use registry::PolicyRegistry;
pub use settings::{FulfillmentSettings, IssuanceSettings, SettingsError};
pub use worker::{Disposition, FulfillmentWorker, WorkerPool, WorkerPoolHandle};
