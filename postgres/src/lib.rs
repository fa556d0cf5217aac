//! `PostgreSQL` persistence for flashcoupon.
//!
//! Provides the durable half of the issuance pipeline:
//!
//! - [`PostgresPolicyStore`]: coupon policies, the source of truth for
//!   quantity and validity windows
//! - [`PostgresCouponRepository`]: issued coupons with an idempotent insert
//!   keyed by `(policy_id, owner_id, attempt_id)`, a quantity-bounded insert
//!   for the degraded path, and compare-and-set status transitions
//!
//! # Schema
//!
//! Migrations live in `postgres/migrations` and are embedded with
//! `sqlx::migrate!`. Run them once at startup with [`migrate`].
//!
//! # Example
//!
//! ```no_run
//! use flashcoupon_postgres::{PostgresCouponRepository, PostgresPolicyStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = flashcoupon_postgres::connect("postgres://localhost/coupons", 10).await?;
//! flashcoupon_postgres::migrate(&pool).await?;
//!
//! let policies = PostgresPolicyStore::new(pool.clone());
//! let coupons = PostgresCouponRepository::new(pool);
//! # Ok(())
//! # }
//! ```

mod coupons;
mod policies;

pub use coupons::PostgresCouponRepository;
pub use policies::PostgresPolicyStore;

use flashcoupon_core::store::StoreError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`StoreError::Unavailable`] if the database cannot be reached.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
        .map_err(|e| StoreError::Unavailable(format!("Failed to connect to PostgreSQL: {e}")))
}

/// Apply the embedded schema migrations.
///
/// # Errors
///
/// Returns [`StoreError::Unavailable`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Unavailable(format!("Migration failed: {e}")))?;
    tracing::info!("Database migrations applied");
    Ok(())
}

/// Classify a database error.
///
/// Constraint violations and undecodable rows will fail the same way on
/// retry; everything else (I/O, pool exhaustion, serialization conflicts) is
/// reported as transient.
pub(crate) fn classify(context: &str, error: sqlx::Error) -> StoreError {
    match &error {
        sqlx::Error::Database(db)
            if db.is_unique_violation() || db.is_foreign_key_violation() || db.is_check_violation() =>
        {
            metrics::counter!("store_constraint_violations_total").increment(1);
            StoreError::Rejected(format!("{context}: {error}"))
        }
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. } => StoreError::Rejected(format!("{context}: {error}")),
        _ => StoreError::Unavailable(format!("{context}: {error}")),
    }
}

/// Error for a column value that doesn't fit the domain type.
pub(crate) fn corrupt(column: &str, detail: impl std::fmt::Display) -> StoreError {
    StoreError::Rejected(format!("Invalid value in column '{column}': {detail}"))
}

/// Widen an amount for a `BIGINT` column.
pub(crate) fn to_db(value: u32) -> i64 {
    i64::from(value)
}

/// Narrow a `BIGINT` column back into an amount.
pub(crate) fn from_db(column: &str, value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|e| corrupt(column, e))
}
