//! Redis backends for the flash coupon issuance engine.
//!
//! # Components
//!
//! - [`RedisQuantityLedger`]: remaining-quantity counters, reserved and
//!   compensated through Lua scripts so each operation is a single atomic
//!   step on the server
//! - [`RedisMutex`]: lease-based lock (`SET NX PX` + compare-and-delete)
//! - [`RedisStateCache`]: JSON snapshots of coupons and policies with a TTL
//!
//! All three wrap a [`ConnectionManager`], which reconnects transparently and
//! is cheap to clone. Open it once with [`connect`] and share it:
//!
//! ```no_run
//! use flashcoupon_redis::{RedisMutex, RedisQuantityLedger, RedisStateCache, connect};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let conn = connect("redis://127.0.0.1:6379").await?;
//! let ledger = RedisQuantityLedger::new(conn.clone());
//! let mutex = RedisMutex::new(conn.clone());
//! let cache = RedisStateCache::new(conn, Duration::from_secs(3600));
//! # Ok(())
//! # }
//! ```

use redis::aio::ConnectionManager;
use redis::{Client, RedisError};

pub mod cache;
pub mod keys;
pub mod ledger;
pub mod lock;

pub use cache::RedisStateCache;
pub use ledger::RedisQuantityLedger;
pub use lock::RedisMutex;

/// Open a managed connection to `redis_url`.
///
/// # Errors
///
/// Returns [`RedisError`] if the URL is invalid or the server is unreachable.
pub async fn connect(redis_url: &str) -> Result<ConnectionManager, RedisError> {
    let client = Client::open(redis_url)?;
    let manager = ConnectionManager::new(client).await?;
    tracing::info!("Connected to Redis");
    Ok(manager)
}
