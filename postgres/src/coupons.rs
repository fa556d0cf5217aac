//! Coupon repository backed by the `coupons` table.
//!
//! The `(policy_id, owner_id, attempt_id)` unique constraint makes inserts
//! idempotent: a redelivered issuance message hits `ON CONFLICT DO NOTHING`
//! and is reported as [`PersistOutcome::AlreadyExists`].
//!
//! [`CouponRepository::insert_within_quantity`] is the fallback used when the
//! ledger is unreachable. It locks the policy row with `SELECT ... FOR UPDATE`
//! so concurrent bounded inserts for one policy serialize on the count.

use crate::{classify, corrupt};
use flashcoupon_core::store::{BoundedPersistOutcome, CouponRepository, PersistOutcome, StoreError};
use flashcoupon_core::{
    AttemptId, Coupon, CouponCode, CouponId, CouponStatus, OrderId, OwnerId, PolicyId,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::future::Future;
use std::pin::Pin;

const INSERT_COUPON: &str = r"
    INSERT INTO coupons (
        id, policy_id, owner_id, attempt_id, code, status,
        order_id, used_at, valid_from, valid_until, created_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
    ON CONFLICT (policy_id, owner_id, attempt_id) DO NOTHING
";

/// `PostgreSQL` implementation of [`CouponRepository`].
#[derive(Clone, Debug)]
pub struct PostgresCouponRepository {
    pool: PgPool,
}

impl PostgresCouponRepository {
    /// Create a repository on an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn insert_query(coupon: &Coupon) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments> {
        sqlx::query(INSERT_COUPON)
            .bind(coupon.id.as_uuid())
            .bind(coupon.policy_id.as_uuid())
            .bind(coupon.owner_id.as_str())
            .bind(coupon.attempt_id.as_uuid())
            .bind(coupon.code.as_str())
            .bind(coupon.status.as_str())
            .bind(coupon.order_id.map(|o| o.value()))
            .bind(coupon.used_at)
            .bind(coupon.valid_from)
            .bind(coupon.valid_until)
            .bind(coupon.created_at)
    }

    async fn bounded_insert(
        tx: &mut Transaction<'_, Postgres>,
        coupon: &Coupon,
    ) -> Result<BoundedPersistOutcome, StoreError> {
        let total: Option<i64> = sqlx::query_scalar(
            r"
            SELECT total_quantity
            FROM coupon_policies
            WHERE id = $1
            FOR UPDATE
            ",
        )
        .bind(coupon.policy_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| classify("Failed to lock policy", e))?;

        let Some(total) = total else {
            return Err(StoreError::Rejected(format!(
                "policy {} does not exist",
                coupon.policy_id
            )));
        };

        let exists: bool = sqlx::query_scalar(
            r"
            SELECT EXISTS (
                SELECT 1 FROM coupons
                WHERE policy_id = $1 AND owner_id = $2 AND attempt_id = $3
            )
            ",
        )
        .bind(coupon.policy_id.as_uuid())
        .bind(coupon.owner_id.as_str())
        .bind(coupon.attempt_id.as_uuid())
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| classify("Failed to check attempt", e))?;
        if exists {
            return Ok(BoundedPersistOutcome::AlreadyExists);
        }

        let issued: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM coupons WHERE policy_id = $1")
            .bind(coupon.policy_id.as_uuid())
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| classify("Failed to count coupons", e))?;
        if issued >= total {
            return Ok(BoundedPersistOutcome::QuantityExhausted);
        }

        Self::insert_query(coupon)
            .execute(&mut **tx)
            .await
            .map_err(|e| classify("Failed to insert coupon", e))?;
        Ok(BoundedPersistOutcome::Created)
    }

    fn row_to_coupon(row: &PgRow) -> Result<Coupon, StoreError> {
        let decode = |e: sqlx::Error| classify("decode coupon row", e);

        let owner: String = row.try_get("owner_id").map_err(decode)?;
        let status: String = row.try_get("status").map_err(decode)?;
        let order_id = row
            .try_get::<Option<i64>, _>("order_id")
            .map_err(decode)?
            .map(OrderId::new)
            .transpose()
            .map_err(|e| corrupt("order_id", e))?;

        Ok(Coupon {
            id: CouponId::from_uuid(row.try_get("id").map_err(decode)?),
            policy_id: PolicyId::from_uuid(row.try_get("policy_id").map_err(decode)?),
            owner_id: OwnerId::new(owner).map_err(|e| corrupt("owner_id", e))?,
            attempt_id: AttemptId::from_uuid(row.try_get("attempt_id").map_err(decode)?),
            code: CouponCode::from_string(row.try_get("code").map_err(decode)?),
            status: CouponStatus::parse(&status).map_err(|e| corrupt("status", e))?,
            order_id,
            used_at: row.try_get("used_at").map_err(decode)?,
            valid_from: row.try_get("valid_from").map_err(decode)?,
            valid_until: row.try_get("valid_until").map_err(decode)?,
            created_at: row.try_get("created_at").map_err(decode)?,
        })
    }
}

impl CouponRepository for PostgresCouponRepository {
    fn insert_idempotent<'a>(
        &'a self,
        coupon: &'a Coupon,
    ) -> Pin<Box<dyn Future<Output = Result<PersistOutcome, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let result = Self::insert_query(coupon)
                .execute(&self.pool)
                .await
                .map_err(|e| classify("Failed to insert coupon", e))?;

            if result.rows_affected() == 1 {
                tracing::debug!(coupon_id = %coupon.id, policy_id = %coupon.policy_id, "Coupon stored");
                Ok(PersistOutcome::Created)
            } else {
                tracing::debug!(
                    attempt_id = %coupon.attempt_id,
                    policy_id = %coupon.policy_id,
                    "Coupon for attempt already stored"
                );
                Ok(PersistOutcome::AlreadyExists)
            }
        })
    }

    fn insert_within_quantity<'a>(
        &'a self,
        coupon: &'a Coupon,
    ) -> Pin<Box<dyn Future<Output = Result<BoundedPersistOutcome, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| classify("Failed to start transaction", e))?;

            let outcome = match Self::bounded_insert(&mut tx, coupon).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let _ = tx.rollback().await;
                    return Err(e);
                }
            };

            tx.commit()
                .await
                .map_err(|e| classify("Failed to commit transaction", e))?;

            tracing::debug!(policy_id = %coupon.policy_id, outcome = ?outcome, "Bounded insert finished");
            Ok(outcome)
        })
    }

    fn find_coupon(
        &self,
        coupon_id: CouponId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Coupon>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT
                    id, policy_id, owner_id, attempt_id, code, status,
                    order_id, used_at, valid_from, valid_until, created_at
                FROM coupons
                WHERE id = $1
                ",
            )
            .bind(coupon_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify("Failed to load coupon", e))?;

            row.as_ref().map(Self::row_to_coupon).transpose()
        })
    }

    fn find_by_attempt<'a>(
        &'a self,
        policy_id: PolicyId,
        owner_id: &'a OwnerId,
        attempt_id: AttemptId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Coupon>, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT
                    id, policy_id, owner_id, attempt_id, code, status,
                    order_id, used_at, valid_from, valid_until, created_at
                FROM coupons
                WHERE policy_id = $1 AND owner_id = $2 AND attempt_id = $3
                ",
            )
            .bind(policy_id.as_uuid())
            .bind(owner_id.as_str())
            .bind(attempt_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify("Failed to load coupon by attempt", e))?;

            row.as_ref().map(Self::row_to_coupon).transpose()
        })
    }

    fn save_transition<'a>(
        &'a self,
        coupon: &'a Coupon,
        expected: CouponStatus,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE coupons
                SET status = $2, order_id = $3, used_at = $4
                WHERE id = $1 AND status = $5
                ",
            )
            .bind(coupon.id.as_uuid())
            .bind(coupon.status.as_str())
            .bind(coupon.order_id.map(|o| o.value()))
            .bind(coupon.used_at)
            .bind(expected.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| classify("Failed to update coupon status", e))?;

            let applied = result.rows_affected() == 1;
            if !applied {
                tracing::debug!(
                    coupon_id = %coupon.id,
                    expected = %expected,
                    "Status changed concurrently; transition not applied"
                );
            }
            Ok(applied)
        })
    }

    fn count_by_policy(
        &self,
        policy_id: PolicyId,
    ) -> Pin<Box<dyn Future<Output = Result<u64, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM coupons WHERE policy_id = $1")
                .bind(policy_id.as_uuid())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| classify("Failed to count coupons", e))?;

            u64::try_from(count).map_err(|e| corrupt("count", e))
        })
    }
}
