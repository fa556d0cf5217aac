//! Fulfillment: idempotent persistence, redelivery and compensation.
//!
//! Run with: `cargo test -p flashcoupon-runtime --test fulfillment_test`

#![allow(clippy::expect_used, clippy::unwrap_used)] // Test code can use unwrap/expect

mod common;

use chrono::Duration as ChronoDuration;
use common::{GROUP, Harness, fast_fulfillment, owner};
use flashcoupon_core::queue::{IssuanceMessage, IssuanceQueue};
use flashcoupon_core::{AttemptId, CouponStatus};
use flashcoupon_runtime::{Disposition, WorkerPool};
use futures::StreamExt;
use std::time::Duration;

async fn accepted_message(h: &Harness, quantity: u32) -> IssuanceMessage {
    let policy_id = h.register(quantity).await;
    h.issuance().request_issue(policy_id, owner("alice")).await.unwrap();
    h.queue.published().pop().unwrap()
}

#[tokio::test]
async fn persists_and_caches_coupon() {
    let h = Harness::new();
    let message = accepted_message(&h, 3).await;

    assert_eq!(h.worker().fulfill(&message).await, Disposition::Persisted);

    let stored = h.coupons.all();
    assert_eq!(stored.len(), 1);
    let coupon = &stored[0];
    assert_eq!(coupon.policy_id, message.policy_id);
    assert_eq!(coupon.owner_id, message.owner_id);
    assert_eq!(coupon.attempt_id, message.attempt_id);
    assert_eq!(coupon.status, CouponStatus::Available);
    assert!(h.cache.peek_coupon(coupon.id).is_some());
}

#[tokio::test]
async fn redelivered_message_does_not_duplicate() {
    let h = Harness::new();
    let message = accepted_message(&h, 3).await;
    let worker = h.worker();

    assert_eq!(worker.fulfill(&message).await, Disposition::Persisted);
    assert_eq!(worker.fulfill(&message).await, Disposition::Duplicate);
    assert_eq!(h.coupons.count(message.policy_id), 1);
    assert_eq!(h.ledger.peek(message.policy_id), Some(2));
}

#[tokio::test]
async fn duplicate_delivery_recaches_existing_coupon() {
    let h = Harness::new();
    let message = accepted_message(&h, 3).await;
    let worker = h.worker();

    assert_eq!(worker.fulfill(&message).await, Disposition::Persisted);
    let coupon_id = h.coupons.all()[0].id;
    // The first delivery died after its insert, before the cache write.
    h.cache.clear();

    assert_eq!(worker.fulfill(&message).await, Disposition::Duplicate);
    let cached = h.cache.peek_coupon(coupon_id).unwrap();
    assert_eq!(cached.attempt_id, message.attempt_id);
}

#[tokio::test]
async fn transient_insert_failure_is_retried_in_process() {
    let h = Harness::new();
    let message = accepted_message(&h, 3).await;
    h.coupons.fail_next_inserts(2);

    assert_eq!(h.worker().fulfill(&message).await, Disposition::Persisted);
    assert_eq!(h.coupons.count(message.policy_id), 1);
}

#[tokio::test]
async fn persistent_outage_requests_redelivery_without_compensating() {
    let h = Harness::new();
    let message = accepted_message(&h, 3).await;
    h.coupons.set_unavailable(true);

    let disposition = h.worker().fulfill(&message).await;
    assert_eq!(disposition, Disposition::Redeliver);
    assert!(!disposition.should_ack());
    assert_eq!(h.ledger.compensations(), 0);
    assert_eq!(h.ledger.peek(message.policy_id), Some(2));

    h.coupons.set_unavailable(false);
    assert_eq!(h.worker().fulfill(&message).await, Disposition::Persisted);
}

#[tokio::test]
async fn policy_store_outage_requests_redelivery() {
    let h = Harness::new();
    let message = accepted_message(&h, 3).await;
    h.policies.set_unavailable(true);

    assert_eq!(h.worker().fulfill(&message).await, Disposition::Redeliver);
    assert_eq!(h.ledger.compensations(), 0);
}

#[tokio::test]
async fn deleted_policy_compensates_exactly_once() {
    let h = Harness::new();
    let message = accepted_message(&h, 3).await;
    h.policies.remove(message.policy_id);
    let worker = h.worker();

    assert_eq!(worker.fulfill(&message).await, Disposition::Compensated);
    assert_eq!(worker.fulfill(&message).await, Disposition::Compensated);

    assert_eq!(h.ledger.compensations(), 1);
    assert_eq!(h.ledger.peek(message.policy_id), Some(3));
    assert_eq!(h.coupons.count(message.policy_id), 0);
}

#[tokio::test]
async fn request_outside_window_is_compensated() {
    let h = Harness::new();
    let mut message = accepted_message(&h, 3).await;
    message.requested_at += ChronoDuration::days(1);

    assert_eq!(h.worker().fulfill(&message).await, Disposition::Compensated);
    assert_eq!(h.ledger.peek(message.policy_id), Some(3));
    assert_eq!(h.coupons.count(message.policy_id), 0);
}

#[tokio::test]
async fn window_is_judged_at_request_time_not_processing_time() {
    let h = Harness::new();
    let message = accepted_message(&h, 3).await;

    // The worker runs after the window closed, but the request was accepted inside it.
    h.clock.advance(ChronoDuration::hours(3));
    assert_eq!(h.worker().fulfill(&message).await, Disposition::Persisted);
}

#[tokio::test]
async fn ledger_outage_during_compensation_requests_redelivery() {
    let h = Harness::new();
    let message = accepted_message(&h, 3).await;
    h.policies.remove(message.policy_id);
    h.ledger.set_unavailable(true);

    assert_eq!(h.worker().fulfill(&message).await, Disposition::Redeliver);

    h.ledger.set_unavailable(false);
    assert_eq!(h.worker().fulfill(&message).await, Disposition::Compensated);
    assert_eq!(h.ledger.compensations(), 1);
}

#[tokio::test]
async fn process_acks_success_and_nacks_transient_failures() {
    let h = Harness::new();
    accepted_message(&h, 3).await;
    let worker = h.worker();
    let mut deliveries = h.queue.subscribe(GROUP).await.unwrap();

    h.coupons.set_unavailable(true);
    let delivery = deliveries.next().await.unwrap().unwrap();
    assert_eq!(worker.process(delivery).await, Disposition::Redeliver);
    assert_eq!(h.queue.nacked(GROUP), 1);

    h.coupons.set_unavailable(false);
    let delivery = deliveries.next().await.unwrap().unwrap();
    assert!(delivery.is_redelivery());
    assert_eq!(delivery.delivery_count, 2);
    assert_eq!(worker.process(delivery).await, Disposition::Persisted);
    assert_eq!(h.queue.acked(GROUP), 1);
    assert!(h.queue.is_drained(GROUP));
}

#[tokio::test]
async fn pool_drains_queue_end_to_end() {
    let h = Harness::new();
    let policy_id = h.register(10).await;
    let issuance = h.issuance();
    for i in 0..10 {
        issuance.request_issue(policy_id, owner(&format!("u{i}"))).await.unwrap();
    }
    h.queue.close();

    let pool = WorkerPool::new(h.env.clone(), fast_fulfillment()).unwrap();
    let handle = pool.start().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while !handle.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(handle.shutdown(Duration::from_secs(1)).await);

    assert_eq!(h.coupons.count(policy_id), 10);
    assert!(h.queue.is_drained(GROUP));
    assert_eq!(h.queue.acked(GROUP), 10);
}

#[tokio::test]
async fn pool_skips_malformed_payloads() {
    let h = Harness::new();
    let message = accepted_message(&h, 3).await;
    h.queue.publish_raw(b"{not json".to_vec());
    h.queue.close();

    let handle = WorkerPool::new(h.env.clone(), fast_fulfillment().with_workers(1))
        .unwrap()
        .start()
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !handle.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(h.coupons.count(message.policy_id), 1);
    assert!(h.queue.is_drained(GROUP));
}

#[tokio::test]
async fn pool_shutdown_stops_idle_workers() {
    let h = Harness::new();
    let handle = WorkerPool::new(h.env.clone(), fast_fulfillment())
        .unwrap()
        .start()
        .await
        .unwrap();
    assert_eq!(handle.len(), 2);

    assert!(handle.shutdown(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn invalid_pool_settings_are_rejected() {
    let h = Harness::new();
    assert!(WorkerPool::new(h.env.clone(), fast_fulfillment().with_workers(0)).is_err());
    assert!(WorkerPool::new(h.env.clone(), fast_fulfillment().with_consumer_group("  ")).is_err());
}

#[tokio::test]
async fn unknown_attempt_for_known_policy_is_persisted() {
    let h = Harness::new();
    let policy_id = h.register(3).await;
    let message = IssuanceMessage {
        policy_id,
        owner_id: owner("bob"),
        requested_at: h.now(),
        attempt_id: AttemptId::new(),
    };

    assert_eq!(h.worker().fulfill(&message).await, Disposition::Persisted);
}
