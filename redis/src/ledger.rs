//! Redis-backed quantity ledger.
//!
//! # Scripts
//!
//! `reserve` decrements and, if the counter went negative, increments it back
//! in the same script. No other client can observe or act on the negative
//! value, so the exhausted path never races with a concurrent reservation.
//!
//! `compensate` sets a per-attempt marker with `SET NX` and only increments
//! when the marker was newly created, so retrying a compensation for the same
//! attempt is harmless.

use crate::keys;
use flashcoupon_core::ledger::{LedgerError, QuantityLedger, Reservation};
use flashcoupon_core::{AttemptId, PolicyId};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

const RESERVE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return false
end
local remaining = redis.call('DECR', KEYS[1])
if remaining < 0 then
    redis.call('INCR', KEYS[1])
    return -1
end
return remaining
";

const COMPENSATE_SCRIPT: &str = r"
if redis.call('SET', KEYS[2], '1', 'NX', 'EX', ARGV[1]) then
    redis.call('INCR', KEYS[1])
    return 1
end
return 0
";

/// Compensation markers outlive any plausible redelivery window.
const DEFAULT_MARKER_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Quantity ledger stored as one integer key per policy.
#[derive(Clone)]
pub struct RedisQuantityLedger {
    conn_manager: ConnectionManager,
    reserve: Script,
    compensate: Script,
    marker_ttl: Duration,
}

impl RedisQuantityLedger {
    /// Create a ledger on an existing connection.
    #[must_use]
    pub fn new(conn_manager: ConnectionManager) -> Self {
        Self {
            conn_manager,
            reserve: Script::new(RESERVE_SCRIPT),
            compensate: Script::new(COMPENSATE_SCRIPT),
            marker_ttl: DEFAULT_MARKER_TTL,
        }
    }

    /// How long a compensation marker is kept (default 7 days).
    #[must_use]
    pub const fn with_marker_ttl(mut self, ttl: Duration) -> Self {
        self.marker_ttl = ttl;
        self
    }
}

fn backend(operation: &str, e: &redis::RedisError) -> LedgerError {
    LedgerError::Backend(format!("{operation} failed: {e}"))
}

impl QuantityLedger for RedisQuantityLedger {
    fn seed(
        &self,
        policy_id: PolicyId,
        quantity: u32,
    ) -> Pin<Box<dyn Future<Output = Result<(), LedgerError>> + Send + '_>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let _: () = conn
                .set(keys::quantity(policy_id), quantity)
                .await
                .map_err(|e| backend("seed", &e))?;

            tracing::info!(policy_id = %policy_id, quantity, "Seeded quantity ledger");
            Ok(())
        })
    }

    fn reserve(
        &self,
        policy_id: PolicyId,
    ) -> Pin<Box<dyn Future<Output = Result<Reservation, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let reply: Option<i64> = self
                .reserve
                .key(keys::quantity(policy_id))
                .invoke_async(&mut conn)
                .await
                .map_err(|e| backend("reserve", &e))?;

            match reply {
                None => Err(LedgerError::NotSeeded(policy_id)),
                Some(remaining) if remaining < 0 => Ok(Reservation::Exhausted),
                Some(remaining) => Ok(Reservation::Reserved { remaining }),
            }
        })
    }

    fn compensate(
        &self,
        policy_id: PolicyId,
        attempt_id: AttemptId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let applied: i64 = self
                .compensate
                .key(keys::quantity(policy_id))
                .key(keys::compensated(policy_id, attempt_id))
                .arg(self.marker_ttl.as_secs().max(1))
                .invoke_async(&mut conn)
                .await
                .map_err(|e| backend("compensate", &e))?;

            if applied == 1 {
                tracing::debug!(policy_id = %policy_id, attempt_id = %attempt_id, "Compensated reservation");
            }
            Ok(applied == 1)
        })
    }

    fn remaining(
        &self,
        policy_id: PolicyId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<i64>, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            conn.get(keys::quantity(policy_id))
                .await
                .map_err(|e| backend("remaining", &e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    // Note: These tests require a running Redis instance
    // Run with: docker run -d -p 6379:6379 redis:7-alpine

    #[allow(clippy::unwrap_used)]
    async fn ledger() -> RedisQuantityLedger {
        RedisQuantityLedger::new(crate::connect("redis://127.0.0.1:6379").await.unwrap())
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    #[allow(clippy::unwrap_used)]
    async fn reserve_stops_at_zero() {
        let ledger = ledger().await;
        let policy_id = PolicyId::new();
        ledger.seed(policy_id, 2).await.unwrap();

        assert_eq!(
            ledger.reserve(policy_id).await.unwrap(),
            Reservation::Reserved { remaining: 1 }
        );
        assert_eq!(
            ledger.reserve(policy_id).await.unwrap(),
            Reservation::Reserved { remaining: 0 }
        );
        assert_eq!(ledger.reserve(policy_id).await.unwrap(), Reservation::Exhausted);
        assert_eq!(ledger.remaining(policy_id).await.unwrap(), Some(0));
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    #[allow(clippy::unwrap_used)]
    async fn unseeded_policy_is_reported() {
        let ledger = ledger().await;
        let policy_id = PolicyId::new();

        assert_eq!(
            ledger.reserve(policy_id).await.unwrap_err(),
            LedgerError::NotSeeded(policy_id)
        );
        assert_eq!(ledger.remaining(policy_id).await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    #[allow(clippy::unwrap_used)]
    async fn compensation_is_applied_once_per_attempt() {
        let ledger = ledger().await;
        let policy_id = PolicyId::new();
        let attempt_id = AttemptId::new();
        ledger.seed(policy_id, 1).await.unwrap();
        ledger.reserve(policy_id).await.unwrap();

        assert!(ledger.compensate(policy_id, attempt_id).await.unwrap());
        assert!(!ledger.compensate(policy_id, attempt_id).await.unwrap());
        assert_eq!(ledger.remaining(policy_id).await.unwrap(), Some(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore] // Requires Redis running
    #[allow(clippy::unwrap_used)]
    async fn concurrent_reservations_never_oversell() {
        let ledger = Arc::new(ledger().await);
        let policy_id = PolicyId::new();
        ledger.seed(policy_id, 20).await.unwrap();

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                tokio::spawn(async move { ledger.reserve(policy_id).await.unwrap() })
            })
            .collect();

        let mut reserved = 0;
        for handle in handles {
            if handle.await.unwrap().is_reserved() {
                reserved += 1;
            }
        }
        assert_eq!(reserved, 20);
        assert_eq!(ledger.remaining(policy_id).await.unwrap(), Some(0));
    }
}
