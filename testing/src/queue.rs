//! In-memory Issuance Queue.
//!
//! Messages are stored as JSON payloads so that publish and delivery
//! exercise the same encoding as the broker-backed queue. Each consumer group
//! gets every message published to the topic, including those published
//! before the group first subscribed. Within a group, subscribers compete for
//! deliveries. A delivery that is nacked or dropped goes back to the front of
//! its group's queue with an incremented delivery count.

use flashcoupon_core::queue::{
    Acknowledger, Delivery, DeliveryStream, IssuanceMessage, IssuanceQueue, QueueError,
    ISSUANCE_TOPIC,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Clone, Debug)]
struct Envelope {
    payload: Vec<u8>,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    pending: VecDeque<Envelope>,
    in_flight: usize,
    acked: u64,
    nacked: u64,
}

#[derive(Debug, Default)]
struct Inner {
    log: Mutex<Vec<Vec<u8>>>,
    groups: Mutex<HashMap<String, GroupState>>,
    available: Notify,
    closed: AtomicBool,
    fail_publish: AtomicBool,
    publish_attempts: AtomicU64,
}

impl Inner {
    fn requeue(&self, group: &str, mut envelope: Envelope) {
        envelope.delivery_count += 1;
        {
            let mut groups = self.groups.lock().unwrap();
            let state = groups.entry(group.to_string()).or_default();
            state.in_flight = state.in_flight.saturating_sub(1);
            state.nacked += 1;
            state.pending.push_front(envelope);
        }
        self.available.notify_waiters();
    }

    fn settle(&self, group: &str) {
        let mut groups = self.groups.lock().unwrap();
        let state = groups.entry(group.to_string()).or_default();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.acked += 1;
    }
}

/// Topic with per-group delivery queues, shared by all clones.
#[derive(Clone, Debug, Default)]
pub struct InMemoryIssuanceQueue {
    inner: Arc<Inner>,
}

impl InMemoryIssuanceQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `publish` fail with [`QueueError::Publish`]
    pub fn set_fail_publish(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Publish bytes that may not be a valid message.
    pub fn publish_raw(&self, payload: Vec<u8>) {
        self.append(payload);
    }

    /// End every open subscription stream once its backlog is drained
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.available.notify_waiters();
    }

    /// Decoded copy of every successfully published message
    #[must_use]
    pub fn published(&self) -> Vec<IssuanceMessage> {
        self.inner
            .log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|p| IssuanceMessage::from_json(p).ok())
            .collect()
    }

    /// Number of `publish` calls, including failed ones
    #[must_use]
    pub fn publish_attempts(&self) -> u64 {
        self.inner.publish_attempts.load(Ordering::SeqCst)
    }

    /// Messages waiting for delivery in `group`
    #[must_use]
    pub fn pending(&self, group: &str) -> usize {
        self.inner
            .groups
            .lock()
            .unwrap()
            .get(group)
            .map_or(0, |g| g.pending.len())
    }

    /// Delivered but not yet acked or nacked in `group`
    #[must_use]
    pub fn in_flight(&self, group: &str) -> usize {
        self.inner
            .groups
            .lock()
            .unwrap()
            .get(group)
            .map_or(0, |g| g.in_flight)
    }

    /// Acked deliveries in `group`
    #[must_use]
    pub fn acked(&self, group: &str) -> u64 {
        self.inner
            .groups
            .lock()
            .unwrap()
            .get(group)
            .map_or(0, |g| g.acked)
    }

    /// Nacked or dropped deliveries in `group`
    #[must_use]
    pub fn nacked(&self, group: &str) -> u64 {
        self.inner
            .groups
            .lock()
            .unwrap()
            .get(group)
            .map_or(0, |g| g.nacked)
    }

    /// Returns `true` when `group` has nothing pending or in flight
    #[must_use]
    pub fn is_drained(&self, group: &str) -> bool {
        self.pending(group) == 0 && self.in_flight(group) == 0
    }

    fn append(&self, payload: Vec<u8>) {
        {
            let mut log = self.inner.log.lock().unwrap();
            let mut groups = self.inner.groups.lock().unwrap();
            for state in groups.values_mut() {
                state.pending.push_back(Envelope {
                    payload: payload.clone(),
                    delivery_count: 1,
                });
            }
            log.push(payload);
        }
        self.inner.available.notify_waiters();
    }

    fn join(&self, group: &str) {
        let log = self.inner.log.lock().unwrap();
        let mut groups = self.inner.groups.lock().unwrap();
        groups.entry(group.to_string()).or_insert_with(|| GroupState {
            pending: log
                .iter()
                .map(|payload| Envelope {
                    payload: payload.clone(),
                    delivery_count: 1,
                })
                .collect(),
            ..GroupState::default()
        });
    }

    fn take(&self, group: &str) -> Option<Envelope> {
        let mut groups = self.inner.groups.lock().unwrap();
        let state = groups.get_mut(group)?;
        let envelope = state.pending.pop_front()?;
        state.in_flight += 1;
        Some(envelope)
    }
}

struct InMemoryAcker {
    inner: Arc<Inner>,
    group: String,
    envelope: Option<Envelope>,
}

impl Acknowledger for InMemoryAcker {
    fn ack(mut self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send>> {
        if self.envelope.take().is_some() {
            self.inner.settle(&self.group);
        }
        Box::pin(async { Ok(()) })
    }

    fn nack(mut self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send>> {
        if let Some(envelope) = self.envelope.take() {
            self.inner.requeue(&self.group, envelope);
        }
        Box::pin(async { Ok(()) })
    }
}

impl Drop for InMemoryAcker {
    fn drop(&mut self) {
        if let Some(envelope) = self.envelope.take() {
            self.inner.requeue(&self.group, envelope);
        }
    }
}

impl IssuanceQueue for InMemoryIssuanceQueue {
    fn publish<'a>(
        &'a self,
        message: &'a IssuanceMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + 'a>> {
        Box::pin(async move {
            self.inner.publish_attempts.fetch_add(1, Ordering::SeqCst);
            if self.inner.fail_publish.load(Ordering::SeqCst) {
                return Err(QueueError::Publish {
                    topic: ISSUANCE_TOPIC.to_string(),
                    reason: "broker unavailable".into(),
                });
            }
            self.append(message.to_json()?);
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        group: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, QueueError>> + Send + 'a>> {
        Box::pin(async move {
            self.join(group);
            let queue = self.clone();
            let group = group.to_string();

            let stream = async_stream::stream! {
                loop {
                    let available = queue.inner.available.notified();
                    tokio::pin!(available);
                    available.as_mut().enable();

                    if let Some(envelope) = queue.take(&group) {
                        match IssuanceMessage::from_json(&envelope.payload) {
                            Ok(message) => {
                                let delivery_count = envelope.delivery_count;
                                let acker = InMemoryAcker {
                                    inner: Arc::clone(&queue.inner),
                                    group: group.clone(),
                                    envelope: Some(envelope),
                                };
                                yield Ok(Delivery::new(message, delivery_count, Box::new(acker)));
                            }
                            Err(e) => {
                                // Poison payloads are committed, never redelivered.
                                queue.inner.settle(&group);
                                yield Err(e);
                            }
                        }
                        continue;
                    }

                    if queue.inner.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    available.await;
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}
