//! Policy registration.

use crate::environment::Environment;
use flashcoupon_core::{CouponPolicy, PolicyId, Result};

/// Makes new policies issuable.
#[derive(Clone)]
pub struct PolicyRegistry {
    env: Environment,
}

impl PolicyRegistry {
    /// Create the registry.
    #[must_use]
    pub const fn new(env: Environment) -> Self {
        Self { env }
    }

    /// Persist `policy`, seed its ledger entry to `total_quantity` and cache it.
    ///
    /// If seeding fails after the policy was stored, the error is returned
    /// and the ledger can be seeded later with `IssuanceService::resync_ledger`.
    ///
    /// # Errors
    ///
    /// - [`flashcoupon_core::CouponError::Rejected`] if the policy already exists
    /// - [`flashcoupon_core::CouponError::TransientInfra`] when the store or
    ///   ledger is down
    #[tracing::instrument(skip_all, fields(policy_id = %policy.id), name = "register_policy")]
    pub async fn register(&self, policy: CouponPolicy) -> Result<CouponPolicy> {
        self.env.policies.insert_policy(&policy).await?;
        self.env.ledger.seed(policy.id, policy.total_quantity).await?;
        self.env.cache_policy(&policy).await;

        tracing::info!(
            total_quantity = policy.total_quantity,
            valid_from = %policy.valid_from,
            valid_until = %policy.valid_until,
            "Coupon policy registered"
        );
        Ok(policy)
    }

    /// Policy by id, cache first.
    ///
    /// # Errors
    ///
    /// - [`flashcoupon_core::CouponError::PolicyNotFound`] for an unknown policy
    /// - [`flashcoupon_core::CouponError::TransientInfra`] when the store is down
    pub async fn get(&self, policy_id: PolicyId) -> Result<CouponPolicy> {
        self.env.cached_policy(policy_id).await
    }
}
