//! Acceptance path: lock, window, reservation and enqueue.
//!
//! Run with: `cargo test -p flashcoupon-runtime --test issuance_test`

#![allow(clippy::expect_used, clippy::unwrap_used)] // Test code can use unwrap/expect

mod common;

use chrono::Duration as ChronoDuration;
use common::{Harness, fast_issuance, owner};
use flashcoupon_core::lock::DistributedMutex;
use flashcoupon_core::{CouponError, CouponStatus, ErrorKind, PolicyId};
use flashcoupon_runtime::retry::RetryPolicy;
use flashcoupon_runtime::{IssuanceSettings, PolicyRegistry, lock_key};
use futures::future::join_all;
use std::time::Duration;

#[tokio::test]
async fn scenario_a_two_requests_for_the_last_coupon() {
    let h = Harness::new();
    let policy_id = h.register(1).await;
    let issuance = h.issuance();

    let (first, second) = tokio::join!(
        issuance.request_issue(policy_id, owner("alice")),
        issuance.request_issue(policy_id, owner("bob")),
    );

    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|r| matches!(r, Err(CouponError::Exhausted(id)) if *id == policy_id))
            .count(),
        1
    );
    assert_eq!(h.ledger.peek(policy_id), Some(0));
    assert_eq!(h.queue.published().len(), 1);
}

#[tokio::test]
async fn scenario_b_hundred_and_first_request_is_exhausted() {
    let h = Harness::new();
    let policy_id = h.register(100).await;
    let issuance = h.issuance();

    for i in 0..100_i64 {
        let accepted = issuance
            .request_issue(policy_id, owner(&format!("user-{i}")))
            .await
            .unwrap();
        assert_eq!(accepted.remaining, 99 - i);
    }

    let err = issuance
        .request_issue(policy_id, owner("late"))
        .await
        .unwrap_err();
    assert_eq!(err, CouponError::Exhausted(policy_id));
    assert_eq!(err.kind(), ErrorKind::Exhausted);
    assert_eq!(h.ledger.peek(policy_id), Some(0));
}

#[tokio::test]
async fn scenario_c_contention_then_retry_succeeds() {
    let h = Harness::new();
    let policy_id = h.register(5).await;
    let issuance = h.issuance_with(
        fast_issuance().with_lock(Duration::from_millis(50), Duration::from_secs(5)),
    );

    let held = h
        .mutex
        .acquire(&lock_key(policy_id), Duration::from_millis(10), Duration::from_secs(5))
        .await
        .unwrap();

    let err = issuance
        .request_issue(policy_id, owner("alice"))
        .await
        .unwrap_err();
    assert_eq!(err, CouponError::Contention { key: lock_key(policy_id) });
    assert!(err.is_retryable());
    assert_eq!(err.status_code(), 429);
    assert_eq!(h.ledger.peek(policy_id), Some(5));

    h.mutex.release(&held).await.unwrap();
    let accepted = issuance.request_issue(policy_id, owner("alice")).await.unwrap();
    assert_eq!(accepted.remaining, 4);
}

#[tokio::test]
async fn concurrent_requests_never_exceed_quantity() {
    let h = Harness::new();
    let quantity = 25;
    let attempts = 200;
    let policy_id = h.register(quantity).await;
    let issuance = h.issuance();

    let handles: Vec<_> = (0..attempts)
        .map(|i| {
            let issuance = issuance.clone();
            tokio::spawn(async move { issuance.request_issue(policy_id, owner(&format!("u{i}"))).await })
        })
        .collect();
    let results: Vec<_> = join_all(handles).await.into_iter().map(Result::unwrap).collect();

    let accepted = results.iter().filter(|r| r.is_ok()).count();
    let exhausted = results
        .iter()
        .filter(|r| matches!(r, Err(CouponError::Exhausted(_))))
        .count();
    assert_eq!(accepted, quantity as usize);
    assert_eq!(exhausted, attempts - quantity as usize);
    assert_eq!(h.ledger.peek(policy_id), Some(0));
    assert_eq!(h.queue.published().len(), quantity as usize);
    assert!(h.mutex.held_keys().is_empty());
}

#[tokio::test]
async fn issuance_outside_window_fails_regardless_of_stock() {
    let h = Harness::new();
    let policy_id = h.register(10).await;
    let issuance = h.issuance();

    h.clock.advance(ChronoDuration::hours(2));
    let err = issuance
        .request_issue(policy_id, owner("alice"))
        .await
        .unwrap_err();
    assert_eq!(err, CouponError::IssuanceWindowClosed(policy_id));

    let err = issuance
        .issue_direct(policy_id, owner("alice"))
        .await
        .unwrap_err();
    assert_eq!(err, CouponError::IssuanceWindowClosed(policy_id));

    let err = issuance
        .issue_degraded(policy_id, owner("alice"))
        .await
        .unwrap_err();
    assert_eq!(err, CouponError::IssuanceWindowClosed(policy_id));

    assert_eq!(h.ledger.peek(policy_id), Some(10));
    assert!(h.queue.published().is_empty());
}

#[tokio::test]
async fn window_bounds_are_inclusive() {
    let h = Harness::new();
    let policy = h.policy(2);
    let policy_id = policy.id;
    let valid_until = policy.valid_until;
    PolicyRegistry::new(h.env.clone()).register(policy).await.unwrap();

    h.clock.set(valid_until);
    assert!(h.issuance().request_issue(policy_id, owner("alice")).await.is_ok());
}

#[tokio::test]
async fn unknown_policy_is_not_found() {
    let h = Harness::new();
    let missing = PolicyId::new();
    let err = h
        .issuance()
        .request_issue(missing, owner("alice"))
        .await
        .unwrap_err();
    assert_eq!(err, CouponError::PolicyNotFound(missing));
    assert!(h.mutex.held_keys().is_empty());
}

#[tokio::test]
async fn failed_enqueue_compensates_exactly_once() {
    let h = Harness::new();
    let policy_id = h.register(3).await;
    h.queue.set_fail_publish(true);

    let err = h
        .issuance()
        .request_issue(policy_id, owner("alice"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransientInfra);
    assert_eq!(err.status_code(), 503);

    // Initial publish plus one retry.
    assert_eq!(h.queue.publish_attempts(), 2);
    assert_eq!(h.ledger.compensations(), 1);
    assert_eq!(h.ledger.peek(policy_id), Some(3));
    assert!(h.mutex.held_keys().is_empty());
}

#[tokio::test]
async fn ledger_outage_is_transient_and_releases_lock() {
    let h = Harness::new();
    let policy_id = h.register(3).await;
    h.ledger.set_unavailable(true);

    let err = h
        .issuance()
        .request_issue(policy_id, owner("alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, CouponError::TransientInfra(_)));
    assert!(h.mutex.held_keys().is_empty());
}

#[tokio::test]
async fn lock_backend_outage_is_transient() {
    let h = Harness::new();
    let policy_id = h.register(3).await;
    h.mutex.set_unavailable(true);

    let err = h
        .issuance()
        .request_issue(policy_id, owner("alice"))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.kind(), ErrorKind::TransientInfra);
    assert_eq!(h.ledger.peek(policy_id), Some(3));
}

#[tokio::test]
async fn cancelled_request_leaves_no_lock_behind() {
    let h = Harness::new();
    let policy_id = h.register(3).await;
    let issuance = h.issuance();

    // Keep the lock busy so the request is parked waiting for it.
    let held = h
        .mutex
        .acquire(&lock_key(policy_id), Duration::from_millis(10), Duration::from_secs(5))
        .await
        .unwrap();
    let pending = tokio::spawn({
        let issuance = issuance.clone();
        async move { issuance.request_issue(policy_id, owner("alice")).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    pending.abort();
    assert!(pending.await.unwrap_err().is_cancelled());

    h.mutex.release(&held).await.unwrap();
    assert!(h.mutex.held_keys().is_empty());
    assert!(issuance.request_issue(policy_id, owner("bob")).await.is_ok());
}

#[tokio::test]
async fn request_cancelled_during_enqueue_backoff_returns_the_unit() {
    let h = Harness::new();
    let policy_id = h.register(1).await;
    h.queue.set_fail_publish(true);
    let issuance = h.issuance_with(
        IssuanceSettings::default().with_enqueue_retry(
            RetryPolicy::builder()
                .max_retries(1)
                .initial_delay(Duration::from_millis(200))
                .max_delay(Duration::from_millis(200))
                .jitter(false)
                .build(),
        ),
    );

    // The first publish fails and the request parks in the retry backoff,
    // holding a reservation.
    let timed_out = tokio::time::timeout(
        Duration::from_millis(50),
        issuance.request_issue(policy_id, owner("alice")),
    )
    .await;
    assert!(timed_out.is_err());
    assert_eq!(h.queue.publish_attempts(), 1);

    for _ in 0..100 {
        if h.ledger.compensations() == 1 && h.mutex.held_keys().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(h.ledger.compensations(), 1);
    assert_eq!(h.ledger.peek(policy_id), Some(1));
    assert!(h.queue.published().is_empty());
    assert!(h.mutex.held_keys().is_empty());

    h.queue.set_fail_publish(false);
    let accepted = issuance.request_issue(policy_id, owner("bob")).await.unwrap();
    assert_eq!(accepted.remaining, 0);
}

#[tokio::test]
async fn direct_issue_persists_synchronously() {
    let h = Harness::new();
    let policy_id = h.register(1).await;
    let issuance = h.issuance();

    let issued = issuance.issue_direct(policy_id, owner("alice")).await.unwrap();
    assert_eq!(issued.status, CouponStatus::Available);
    assert_eq!(issued.code.as_str().len(), 12);
    assert_eq!(h.coupons.count(policy_id), 1);
    assert!(h.cache.peek_coupon(issued.coupon_id).is_some());
    assert!(h.queue.published().is_empty());

    let err = issuance.issue_direct(policy_id, owner("bob")).await.unwrap_err();
    assert_eq!(err, CouponError::Exhausted(policy_id));
}

#[tokio::test]
async fn direct_issue_compensates_rejected_insert() {
    let h = Harness::new();
    let policy_id = h.register(2).await;
    // Still cached, so the reservation goes through; the insert hits the
    // missing foreign key.
    h.policies.remove(policy_id);

    let err = h
        .issuance()
        .issue_direct(policy_id, owner("alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, CouponError::Rejected(_)), "got {err:?}");
    assert_eq!(h.ledger.compensations(), 1);
    assert_eq!(h.ledger.peek(policy_id), Some(2));
}

#[tokio::test]
async fn direct_issue_keeps_reservation_when_insert_outcome_is_unknown() {
    let h = Harness::new();
    let policy_id = h.register(2).await;
    // Initial insert plus one retry, both transient.
    h.coupons.fail_next_inserts(2);

    let err = h
        .issuance()
        .issue_direct(policy_id, owner("alice"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransientInfra);
    assert_eq!(h.ledger.compensations(), 0);
    assert_eq!(h.ledger.peek(policy_id), Some(1));
    assert!(h.mutex.held_keys().is_empty());

    // Resync settles the unit from what actually reached the store.
    assert_eq!(h.issuance().resync_ledger(policy_id).await.unwrap(), 2);
}

#[tokio::test]
async fn degraded_issue_is_bounded_by_the_store() {
    let h = Harness::new();
    let policy_id = h.register(2).await;
    let issuance = h.issuance();

    issuance.issue_degraded(policy_id, owner("a")).await.unwrap();
    issuance.issue_degraded(policy_id, owner("b")).await.unwrap();
    let err = issuance.issue_degraded(policy_id, owner("c")).await.unwrap_err();
    assert_eq!(err, CouponError::Exhausted(policy_id));
    assert_eq!(h.coupons.count(policy_id), 2);

    // The ledger was bypassed and still reports full stock.
    assert_eq!(h.ledger.peek(policy_id), Some(2));
}

#[tokio::test]
async fn resync_reseeds_from_persisted_count() {
    let h = Harness::new();
    let policy_id = h.register(5).await;
    let issuance = h.issuance();

    issuance.issue_degraded(policy_id, owner("a")).await.unwrap();
    issuance.issue_degraded(policy_id, owner("b")).await.unwrap();

    assert_eq!(issuance.resync_ledger(policy_id).await.unwrap(), 3);
    assert_eq!(issuance.remaining(policy_id).await.unwrap(), 3);
    assert!(h.mutex.held_keys().is_empty());
}

#[tokio::test]
async fn registration_seeds_ledger_and_cache() {
    let h = Harness::new();
    let policy_id = h.register(7).await;

    assert_eq!(h.ledger.peek(policy_id), Some(7));
    assert!(h.policies.peek(policy_id).is_some());
    assert!(h.cache.peek_policy(policy_id).is_some());

    let again = PolicyRegistry::new(h.env.clone())
        .register(h.policies.peek(policy_id).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(again, CouponError::Rejected(_)));
}

#[tokio::test]
async fn policy_reads_fall_back_to_store_when_cache_is_down() {
    let h = Harness::new();
    let policy_id = h.register(2).await;
    h.cache.set_unavailable(true);

    let accepted = h.issuance().request_issue(policy_id, owner("alice")).await.unwrap();
    assert_eq!(accepted.remaining, 1);

    let policy = PolicyRegistry::new(h.env.clone()).get(policy_id).await.unwrap();
    assert_eq!(policy.id, policy_id);
}

#[tokio::test]
async fn policy_cache_miss_repopulates_cache() {
    let h = Harness::new();
    let policy_id = h.register(2).await;
    h.cache.clear();

    PolicyRegistry::new(h.env.clone()).get(policy_id).await.unwrap();
    assert!(h.cache.peek_policy(policy_id).is_some());
}
