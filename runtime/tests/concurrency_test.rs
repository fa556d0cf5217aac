//! No oversell under concurrency, with and without the policy lock.
//!
//! Run with: `cargo test -p flashcoupon-runtime --test concurrency_test`

#![allow(clippy::expect_used, clippy::unwrap_used)] // Test code can use unwrap/expect

mod common;

use common::{GROUP, Harness, fast_fulfillment, owner};
use flashcoupon_core::ledger::{QuantityLedger, Reservation};
use flashcoupon_core::{CouponError, PolicyId};
use flashcoupon_runtime::WorkerPool;
use flashcoupon_testing::InMemoryQuantityLedger;
use futures::future::join_all;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ledger_alone_never_goes_negative() {
    let ledger = Arc::new(InMemoryQuantityLedger::new());
    let policy_id = PolicyId::new();
    ledger.seed(policy_id, 50).await.unwrap();

    let handles: Vec<_> = (0..500)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move { ledger.reserve(policy_id).await.unwrap() })
        })
        .collect();
    let outcomes: Vec<Reservation> = join_all(handles).await.into_iter().map(Result::unwrap).collect();

    assert_eq!(outcomes.iter().filter(|r| r.is_reserved()).count(), 50);
    assert_eq!(ledger.peek(policy_id), Some(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn accepted_requests_become_exactly_that_many_coupons() {
    let h = Harness::new();
    let policy_id = h.register(30).await;
    let issuance = h.issuance();

    let handles: Vec<_> = (0..120)
        .map(|i| {
            let issuance = issuance.clone();
            tokio::spawn(async move { issuance.request_issue(policy_id, owner(&format!("u{i}"))).await })
        })
        .collect();
    let results: Vec<_> = join_all(handles).await.into_iter().map(Result::unwrap).collect();
    let accepted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(accepted, 30);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, CouponError::Exhausted(_))));

    h.queue.close();
    let handle = WorkerPool::new(h.env.clone(), fast_fulfillment().with_workers(4))
        .unwrap()
        .start()
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), async {
        while !handle.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(h.coupons.count(policy_id), 30);
    assert!(h.queue.is_drained(GROUP));
    assert_eq!(h.ledger.peek(policy_id), Some(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn degraded_path_respects_quantity_under_concurrency() {
    let h = Harness::new();
    let policy_id = h.register(10).await;
    let issuance = h.issuance();

    let handles: Vec<_> = (0..60)
        .map(|i| {
            let issuance = issuance.clone();
            tokio::spawn(async move { issuance.issue_degraded(policy_id, owner(&format!("u{i}"))).await })
        })
        .collect();
    let results: Vec<_> = join_all(handles).await.into_iter().map(Result::unwrap).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 10);
    assert_eq!(h.coupons.count(policy_id), 10);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn accepted_is_min_of_quantity_and_attempts(quantity in 1u32..20, attempts in 0usize..40) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();

        let (accepted, remaining) = runtime.block_on(async {
            let h = Harness::new();
            let policy_id = h.register(quantity).await;
            let issuance = h.issuance();

            let handles: Vec<_> = (0..attempts)
                .map(|i| {
                    let issuance = issuance.clone();
                    tokio::spawn(async move {
                        issuance.request_issue(policy_id, owner(&format!("u{i}"))).await
                    })
                })
                .collect();
            let accepted = join_all(handles)
                .await
                .into_iter()
                .filter(|r| matches!(r, Ok(Ok(_))))
                .count();
            (accepted, h.ledger.peek(policy_id).unwrap())
        });

        prop_assert_eq!(accepted, attempts.min(quantity as usize));
        prop_assert!(remaining >= 0);
        prop_assert_eq!(remaining, i64::from(quantity) - accepted as i64);
    }
}
