//! Policy store backed by the `coupon_policies` table.

use crate::{classify, corrupt, from_db, to_db};
use flashcoupon_core::store::{PolicyStore, StoreError};
use flashcoupon_core::{CouponPolicy, Discount, PolicyId};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

/// `PostgreSQL` implementation of [`PolicyStore`].
#[derive(Clone, Debug)]
pub struct PostgresPolicyStore {
    pool: PgPool,
}

impl PostgresPolicyStore {
    /// Create a store on an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_policy(row: &PgRow) -> Result<CouponPolicy, StoreError> {
        let decode = |e: sqlx::Error| classify("decode policy row", e);

        let discount_type: String = row.try_get("discount_type").map_err(decode)?;
        let discount_value: i64 = row.try_get("discount_value").map_err(decode)?;
        let discount = match discount_type.as_str() {
            "FIXED_AMOUNT" => Discount::FixedAmount(from_db("discount_value", discount_value)?),
            "PERCENTAGE" => Discount::Percentage(
                u8::try_from(discount_value).map_err(|e| corrupt("discount_value", e))?,
            ),
            other => return Err(corrupt("discount_type", other)),
        };

        Ok(CouponPolicy {
            id: PolicyId::from_uuid(row.try_get("id").map_err(decode)?),
            name: row.try_get("name").map_err(decode)?,
            discount,
            minimum_order_amount: from_db(
                "minimum_order_amount",
                row.try_get("minimum_order_amount").map_err(decode)?,
            )?,
            maximum_discount_amount: from_db(
                "maximum_discount_amount",
                row.try_get("maximum_discount_amount").map_err(decode)?,
            )?,
            total_quantity: from_db("total_quantity", row.try_get("total_quantity").map_err(decode)?)?,
            valid_from: row.try_get("valid_from").map_err(decode)?,
            valid_until: row.try_get("valid_until").map_err(decode)?,
            created_at: row.try_get("created_at").map_err(decode)?,
            updated_at: row.try_get("updated_at").map_err(decode)?,
        })
    }
}

fn discount_columns(discount: Discount) -> (&'static str, i64) {
    match discount {
        Discount::FixedAmount(amount) => ("FIXED_AMOUNT", to_db(amount)),
        Discount::Percentage(percent) => ("PERCENTAGE", i64::from(percent)),
    }
}

impl PolicyStore for PostgresPolicyStore {
    fn insert_policy<'a>(
        &'a self,
        policy: &'a CouponPolicy,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let (discount_type, discount_value) = discount_columns(policy.discount);
            sqlx::query(
                r"
                INSERT INTO coupon_policies (
                    id, name, discount_type, discount_value,
                    minimum_order_amount, maximum_discount_amount, total_quantity,
                    valid_from, valid_until, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ",
            )
            .bind(policy.id.as_uuid())
            .bind(&policy.name)
            .bind(discount_type)
            .bind(discount_value)
            .bind(to_db(policy.minimum_order_amount))
            .bind(to_db(policy.maximum_discount_amount))
            .bind(to_db(policy.total_quantity))
            .bind(policy.valid_from)
            .bind(policy.valid_until)
            .bind(policy.created_at)
            .bind(policy.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| classify("Failed to insert policy", e))?;

            tracing::info!(
                policy_id = %policy.id,
                total_quantity = policy.total_quantity,
                "Policy stored"
            );
            Ok(())
        })
    }

    fn get_policy(
        &self,
        policy_id: PolicyId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CouponPolicy>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT
                    id, name, discount_type, discount_value,
                    minimum_order_amount, maximum_discount_amount, total_quantity,
                    valid_from, valid_until, created_at, updated_at
                FROM coupon_policies
                WHERE id = $1
                ",
            )
            .bind(policy_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify("Failed to load policy", e))?;

            row.as_ref().map(Self::row_to_policy).transpose()
        })
    }
}
