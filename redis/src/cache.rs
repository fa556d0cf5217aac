//! Redis-backed state cache.
//!
//! Snapshots are stored as JSON under `coupon:state:{couponId}` and
//! `coupon:policy:{policyId}` with a TTL, so entries for coupons nobody reads
//! any more eventually fall out.

use crate::keys;
use flashcoupon_core::cache::{CacheError, StateCache};
use flashcoupon_core::{Coupon, CouponId, CouponPolicy, PolicyId};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Coupon and policy snapshots with a time-to-live.
#[derive(Clone)]
pub struct RedisStateCache {
    conn_manager: ConnectionManager,
    ttl: Duration,
}

impl RedisStateCache {
    /// Create a cache whose entries expire after `ttl`.
    #[must_use]
    pub const fn new(conn_manager: ConnectionManager, ttl: Duration) -> Self {
        Self { conn_manager, ttl }
    }

    /// Entry time-to-live.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn put<T: Serialize + Sync>(&self, key: String, value: &T) -> Result<(), CacheError> {
        let json = serde_json::to_string(value)
            .map_err(|e| CacheError(format!("failed to encode {key}: {e}")))?;
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .set_ex(&key, json, self.ttl.as_secs().max(1))
            .await
            .map_err(|e| CacheError(format!("SET {key} failed: {e}")))?;
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, key: String) -> Result<Option<T>, CacheError> {
        let mut conn = self.conn_manager.clone();
        let json: Option<String> = conn
            .get(&key)
            .await
            .map_err(|e| CacheError(format!("GET {key} failed: {e}")))?;

        match json {
            None => Ok(None),
            Some(json) => match serde_json::from_str(&json) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    // Stale layout from an older release; treat as a miss.
                    tracing::warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                    Ok(None)
                }
            },
        }
    }
}

impl StateCache for RedisStateCache {
    fn put_coupon<'a>(
        &'a self,
        coupon: &'a Coupon,
    ) -> Pin<Box<dyn Future<Output = Result<(), CacheError>> + Send + 'a>> {
        Box::pin(self.put(keys::coupon_state(coupon.id), coupon))
    }

    fn get_coupon(
        &self,
        coupon_id: CouponId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Coupon>, CacheError>> + Send + '_>> {
        Box::pin(self.get(keys::coupon_state(coupon_id)))
    }

    fn put_policy<'a>(
        &'a self,
        policy: &'a CouponPolicy,
    ) -> Pin<Box<dyn Future<Output = Result<(), CacheError>> + Send + 'a>> {
        Box::pin(self.put(keys::policy(policy.id), policy))
    }

    fn get_policy(
        &self,
        policy_id: PolicyId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CouponPolicy>, CacheError>> + Send + '_>> {
        Box::pin(self.get(keys::policy(policy_id)))
    }
}
