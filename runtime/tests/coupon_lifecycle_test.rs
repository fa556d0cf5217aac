//! Coupon reads and use/cancel transitions.
//!
//! Run with: `cargo test -p flashcoupon-runtime --test coupon_lifecycle_test`

#![allow(clippy::expect_used, clippy::unwrap_used)] // Test code can use unwrap/expect

mod common;

use chrono::Duration as ChronoDuration;
use common::{Harness, owner};
use flashcoupon_core::{CouponError, CouponId, CouponStatus, ErrorKind, OrderId};

async fn issued(h: &Harness, owner_name: &str) -> CouponId {
    let policy_id = h.register(5).await;
    h.issuance()
        .issue_direct(policy_id, owner(owner_name))
        .await
        .unwrap()
        .coupon_id
}

fn order(id: i64) -> OrderId {
    OrderId::new(id).unwrap()
}

#[tokio::test]
async fn use_then_cancel_then_terminal() {
    let h = Harness::new();
    let coupon_id = issued(&h, "alice").await;
    let alice = owner("alice");
    let coupons = h.coupon_service();

    let used = coupons.use_coupon(coupon_id, &alice, order(7)).await.unwrap();
    assert_eq!(used.status, CouponStatus::Used);
    assert_eq!(used.order_id, Some(order(7)));
    assert_eq!(used.used_at, Some(h.now()));

    let err = coupons.use_coupon(coupon_id, &alice, order(8)).await.unwrap_err();
    assert_eq!(err, CouponError::AlreadyUsed(coupon_id));

    let cancelled = coupons.cancel(coupon_id, &alice).await.unwrap();
    assert_eq!(cancelled.status, CouponStatus::Cancelled);
    assert_eq!(cancelled.order_id, None);
    assert_eq!(cancelled.used_at, None);

    let err = coupons.use_coupon(coupon_id, &alice, order(9)).await.unwrap_err();
    assert_eq!(err, CouponError::TerminalState(coupon_id));
    let err = coupons.cancel(coupon_id, &alice).await.unwrap_err();
    assert_eq!(err, CouponError::TerminalState(coupon_id));
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let read = coupons.get(coupon_id, &alice).await.unwrap();
    assert_eq!(read.status, CouponStatus::Cancelled);
}

#[tokio::test]
async fn cancelling_an_unused_coupon_fails() {
    let h = Harness::new();
    let coupon_id = issued(&h, "alice").await;

    let err = h
        .coupon_service()
        .cancel(coupon_id, &owner("alice"))
        .await
        .unwrap_err();
    assert_eq!(err, CouponError::NotUsed(coupon_id));
}

#[tokio::test]
async fn other_owners_see_not_found() {
    let h = Harness::new();
    let coupon_id = issued(&h, "alice").await;
    let mallory = owner("mallory");
    let coupons = h.coupon_service();

    assert_eq!(
        coupons.get(coupon_id, &mallory).await.unwrap_err(),
        CouponError::CouponNotFound(coupon_id)
    );
    assert_eq!(
        coupons.use_coupon(coupon_id, &mallory, order(1)).await.unwrap_err(),
        CouponError::CouponNotFound(coupon_id)
    );
    assert_eq!(
        coupons.cancel(coupon_id, &mallory).await.unwrap_err(),
        CouponError::CouponNotFound(coupon_id)
    );

    let stored = h.coupons.all();
    assert_eq!(stored[0].status, CouponStatus::Available);
}

#[tokio::test]
async fn unknown_coupon_is_not_found() {
    let h = Harness::new();
    let missing = CouponId::new();
    let err = h
        .coupon_service()
        .get(missing, &owner("alice"))
        .await
        .unwrap_err();
    assert_eq!(err, CouponError::CouponNotFound(missing));
    assert_eq!(err.status_code(), 404);
}

#[tokio::test]
async fn expired_coupon_cannot_be_used() {
    let h = Harness::new();
    let coupon_id = issued(&h, "alice").await;
    h.clock.advance(ChronoDuration::hours(2));

    let err = h
        .coupon_service()
        .use_coupon(coupon_id, &owner("alice"), order(7))
        .await
        .unwrap_err();
    assert_eq!(err, CouponError::Expired(coupon_id));
    assert_eq!(h.coupons.all()[0].status, CouponStatus::Available);
}

#[tokio::test]
async fn transitions_refresh_the_cache() {
    let h = Harness::new();
    let coupon_id = issued(&h, "alice").await;
    let alice = owner("alice");

    h.coupon_service()
        .use_coupon(coupon_id, &alice, order(7))
        .await
        .unwrap();
    assert_eq!(h.cache.peek_coupon(coupon_id).unwrap().status, CouponStatus::Used);
}

#[tokio::test]
async fn reads_repopulate_an_empty_cache() {
    let h = Harness::new();
    let coupon_id = issued(&h, "alice").await;
    h.cache.clear();

    h.coupon_service().get(coupon_id, &owner("alice")).await.unwrap();
    assert!(h.cache.peek_coupon(coupon_id).is_some());
    assert_eq!(h.cache.misses(), 1);
}

#[tokio::test]
async fn cache_outage_does_not_change_outcomes() {
    let h = Harness::new();
    let coupon_id = issued(&h, "alice").await;
    let alice = owner("alice");
    let coupons = h.coupon_service();
    h.cache.set_unavailable(true);

    assert_eq!(
        coupons.get(coupon_id, &alice).await.unwrap().status,
        CouponStatus::Available
    );
    assert_eq!(
        coupons.use_coupon(coupon_id, &alice, order(7)).await.unwrap().status,
        CouponStatus::Used
    );
    assert_eq!(
        coupons.cancel(coupon_id, &alice).await.unwrap().status,
        CouponStatus::Cancelled
    );
}

#[tokio::test]
async fn store_outage_is_transient() {
    let h = Harness::new();
    let coupon_id = issued(&h, "alice").await;
    h.coupons.set_unavailable(true);

    let err = h
        .coupon_service()
        .use_coupon(coupon_id, &owner("alice"), order(7))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn concurrent_uses_apply_once() {
    let h = Harness::new();
    let coupon_id = issued(&h, "alice").await;
    let alice = owner("alice");

    let handles: Vec<_> = (1..=8)
        .map(|i| {
            let coupons = h.coupon_service();
            let alice = alice.clone();
            tokio::spawn(async move { coupons.use_coupon(coupon_id, &alice, order(i)).await })
        })
        .collect();
    let results: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| matches!(
        e,
        CouponError::AlreadyUsed(_) | CouponError::ConcurrentModification(_)
    )));

    let winner = results.into_iter().find_map(Result::ok).unwrap();
    let stored = h.coupons.all().pop().unwrap();
    assert_eq!(stored.order_id, winner.order_id);
}
