//! Infrastructure setup.
//!
//! Connects every backend named in [`Config`] and assembles the runtime
//! [`Environment`]. One Redis connection manager is shared by the ledger, the
//! mutex and the cache.

use crate::config::Config;
use anyhow::Context;
use flashcoupon_postgres::{PostgresCouponRepository, PostgresPolicyStore};
use flashcoupon_redis::{RedisMutex, RedisQuantityLedger, RedisStateCache};
use flashcoupon_redpanda::RedpandaIssuanceQueue;
use flashcoupon_runtime::{
    CouponService, Environment, IssuanceService, PolicyRegistry, WorkerPool,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Connected backends and the services built on them.
#[derive(Clone)]
pub struct Resources {
    /// Backends shared by every service
    pub env: Environment,
    /// Acceptance path
    pub issuance: IssuanceService,
    /// Policy registration
    pub registry: PolicyRegistry,
    /// Owner-scoped coupon operations
    pub coupons: CouponService,
}

impl Resources {
    /// Connect every backend and build the services.
    ///
    /// # Errors
    ///
    /// Returns an error if a backend is unreachable, migrations fail or the
    /// configured tunables are invalid.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        info!("Connecting to PostgreSQL...");
        let pool = flashcoupon_postgres::connect(&config.postgres.url, config.postgres.max_connections)
            .await
            .context("failed to connect to PostgreSQL")?;
        if config.postgres.run_migrations {
            flashcoupon_postgres::migrate(&pool)
                .await
                .context("failed to run migrations")?;
        }
        info!("PostgreSQL connected");

        info!("Connecting to Redis...");
        let redis = flashcoupon_redis::connect(&config.redis.url)
            .await
            .context("failed to connect to Redis")?;
        info!("Redis connected");

        info!("Creating Redpanda issuance queue...");
        let queue = RedpandaIssuanceQueue::builder()
            .brokers(&config.redpanda.brokers)
            .topic(&config.redpanda.topic)
            .buffer_size(config.redpanda.buffer_size)
            .auto_offset_reset(&config.redpanda.auto_offset_reset)
            .session_timeout(Duration::from_millis(config.redpanda.session_timeout_ms))
            .build()
            .context("failed to create issuance queue")?;
        info!(brokers = %config.redpanda.brokers, topic = %config.redpanda.topic, "Issuance queue ready");

        let ledger = RedisQuantityLedger::new(redis.clone())
            .with_marker_ttl(Duration::from_secs(config.redis.compensation_marker_ttl));
        let env = Environment::new(
            Arc::new(ledger),
            Arc::new(RedisMutex::new(redis.clone())),
            Arc::new(queue),
            Arc::new(PostgresPolicyStore::new(pool.clone())),
            Arc::new(PostgresCouponRepository::new(pool)),
            Arc::new(RedisStateCache::new(redis, config.cache_ttl())),
        );

        let issuance = IssuanceService::new(env.clone(), config.issuance_settings())
            .context("invalid issuance settings")?;

        Ok(Self {
            registry: PolicyRegistry::new(env.clone()),
            coupons: CouponService::new(env.clone()),
            issuance,
            env,
        })
    }

    /// Build the fulfillment worker pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker settings are invalid.
    pub fn worker_pool(&self, config: &Config) -> anyhow::Result<WorkerPool> {
        WorkerPool::new(self.env.clone(), config.fulfillment_settings())
            .context("invalid worker settings")
    }
}
