//! Redpanda issuance queue for the flash coupon issuance engine.
//!
//! Implements [`IssuanceQueue`] on top of rdkafka, so it works with Redpanda
//! or any other Kafka-compatible broker.
//!
//! # Architecture
//!
//! ```text
//! IssuanceService ──publish(key = policyId)──► coupon-issue-requests
//!                                                      │
//!                                        consumer group "coupon-service"
//!                                          ┌───────────┴───────────┐
//!                                          ▼                       ▼
//!                                   consumer task             consumer task
//!                                          │ Delivery              │
//!                                          ▼                       ▼
//!                                   FulfillmentWorker        FulfillmentWorker
//!                                          │ ack / nack
//!                                          ▼
//!                                 commit offset / seek back
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once** with manual offset commits:
//! - Each subscription owns one consumer and hands out one delivery at a time
//! - `ack` commits the message offset
//! - `nack` (or dropping the delivery) seeks the partition back to the
//!   message, so it is delivered again with an incremented delivery count
//! - If the process dies before `ack`, the group rebalances and the message is
//!   redelivered to another member
//! - Payloads that do not decode are committed and surfaced as
//!   [`QueueError::Decode`]; they are never redelivered
//!
//! # Example
//!
//! ```no_run
//! use flashcoupon_redpanda::RedpandaIssuanceQueue;
//! use flashcoupon_core::queue::{CONSUMER_GROUP, IssuanceQueue};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = RedpandaIssuanceQueue::new("localhost:9092")?;
//!
//! let mut deliveries = queue.subscribe(CONSUMER_GROUP).await?;
//! while let Some(delivery) = deliveries.next().await {
//!     let delivery = delivery?;
//!     println!("attempt {}", delivery.message.attempt_id);
//!     delivery.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

use flashcoupon_core::queue::{
    Acknowledger, Delivery, DeliveryStream, ISSUANCE_TOPIC, IssuanceMessage, IssuanceQueue,
    QueueError,
};
use rdkafka::Offset;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Issuance queue on a Kafka-compatible broker.
///
/// # Configuration
///
/// - **Brokers**: bootstrap servers (required)
/// - **Topic**: defaults to [`ISSUANCE_TOPIC`]
/// - **Producer acks**: defaults to `"all"`; an accepted request must not be
///   lost by a single broker failure
/// - **Offset reset**: defaults to `"earliest"` so a new group picks up the
///   backlog
///
/// # Example
///
/// ```no_run
/// use flashcoupon_redpanda::RedpandaIssuanceQueue;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let queue = RedpandaIssuanceQueue::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .compression("lz4")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaIssuanceQueue {
    /// Kafka producer for publishing messages
    producer: FutureProducer,
    /// Broker addresses (for creating consumers)
    brokers: String,
    /// Topic carrying issuance messages
    topic: String,
    /// Producer and seek timeout
    timeout: Duration,
    /// Delivery buffer between the consumer task and the worker
    buffer_size: usize,
    /// Auto offset reset policy
    auto_offset_reset: String,
    /// Consumer session timeout
    session_timeout: Duration,
}

impl RedpandaIssuanceQueue {
    /// Create a queue with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Transport`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, QueueError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder.
    #[must_use]
    pub fn builder() -> RedpandaIssuanceQueueBuilder {
        RedpandaIssuanceQueueBuilder::default()
    }

    /// Broker addresses.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Topic messages are published to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Builder for a [`RedpandaIssuanceQueue`].
#[derive(Default)]
pub struct RedpandaIssuanceQueueBuilder {
    brokers: Option<String>,
    topic: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
    session_timeout: Option<Duration>,
}

impl RedpandaIssuanceQueueBuilder {
    /// Set the broker addresses (comma separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the topic.
    ///
    /// Default: `coupon-issue-requests`
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set the producer acknowledgment mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"all"`
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`, `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set how many deliveries may wait between a consumer and its worker.
    ///
    /// Values below 1 are raised to 1. Default: 1
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Set where a new consumer group starts reading:
    /// `"earliest"`, `"latest"` or `"error"`.
    ///
    /// Default: `"earliest"`
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set the consumer session timeout.
    ///
    /// Default: 6 seconds
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Build the [`RedpandaIssuanceQueue`].
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Transport`] if brokers are not set or the
    /// producer cannot be created.
    pub fn build(self) -> Result<RedpandaIssuanceQueue, QueueError> {
        let brokers = self
            .brokers
            .ok_or_else(|| QueueError::Transport("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.unwrap_or_else(|| "all".to_string());
        let compression = self.compression.unwrap_or_else(|| "none".to_string());
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", &acks)
            .set("compression.type", &compression)
            .create()
            .map_err(|e| QueueError::Transport(format!("Failed to create producer: {e}")))?;

        let queue = RedpandaIssuanceQueue {
            producer,
            brokers,
            topic: self.topic.unwrap_or_else(|| ISSUANCE_TOPIC.to_string()),
            timeout,
            buffer_size: self.buffer_size.unwrap_or(1),
            auto_offset_reset: self.auto_offset_reset.unwrap_or_else(|| "earliest".to_string()),
            session_timeout: self.session_timeout.unwrap_or(Duration::from_secs(6)),
        };

        tracing::info!(
            brokers = %queue.brokers,
            topic = %queue.topic,
            acks = %acks,
            compression = %compression,
            auto_offset_reset = %queue.auto_offset_reset,
            "RedpandaIssuanceQueue created"
        );
        Ok(queue)
    }
}

/// What the worker decided for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Nack,
}

struct Settle {
    settlement: Settlement,
    done: oneshot::Sender<Result<(), QueueError>>,
}

/// Hands the worker's decision back to the consumer task.
struct KafkaAcker {
    settle: oneshot::Sender<Settle>,
}

impl KafkaAcker {
    fn send(self, settlement: Settlement) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send>> {
        let (done, outcome) = oneshot::channel();
        let sent = self.settle.send(Settle { settlement, done });
        Box::pin(async move {
            if sent.is_err() {
                return Err(QueueError::Acknowledge("consumer is gone".to_string()));
            }
            outcome
                .await
                .map_err(|_| QueueError::Acknowledge("consumer stopped before settling".to_string()))?
        })
    }
}

impl Acknowledger for KafkaAcker {
    fn ack(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send>> {
        (*self).send(Settlement::Ack)
    }

    fn nack(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send>> {
        (*self).send(Settlement::Nack)
    }
}

/// Tracks how many times the message at the head of a partition was handed out.
#[derive(Default)]
struct Redeliveries {
    last: Option<(i32, i64, u32)>,
}

impl Redeliveries {
    fn count(&mut self, partition: i32, offset: i64) -> u32 {
        let count = match self.last {
            Some((p, o, n)) if p == partition && o == offset => n + 1,
            _ => 1,
        };
        self.last = Some((partition, offset, count));
        count
    }
}

fn seek_back(consumer: &StreamConsumer, message: &BorrowedMessage<'_>, timeout: Duration) -> Result<(), QueueError> {
    consumer
        .seek(
            message.topic(),
            message.partition(),
            Offset::Offset(message.offset()),
            Timeout::After(timeout),
        )
        .map_err(|e| QueueError::Acknowledge(format!("Failed to seek back for redelivery: {e}")))
}

fn commit(consumer: &StreamConsumer, message: &BorrowedMessage<'_>) -> Result<(), QueueError> {
    consumer
        .commit_message(message, CommitMode::Async)
        .map_err(|e| QueueError::Acknowledge(format!("Failed to commit offset: {e}")))
}

impl IssuanceQueue for RedpandaIssuanceQueue {
    fn publish<'a>(
        &'a self,
        message: &'a IssuanceMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + 'a>> {
        Box::pin(async move {
            let payload = message.to_json()?;
            let key = message.partition_key();
            let record = FutureRecord::to(&self.topic).payload(&payload).key(&key);

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %self.topic,
                        partition,
                        offset,
                        attempt_id = %message.attempt_id,
                        "Issuance message published"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %self.topic,
                        error = %kafka_error,
                        "Failed to publish issuance message"
                    );
                    Err(QueueError::Publish {
                        topic: self.topic.clone(),
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }

    #[allow(clippy::too_many_lines)] // One consumer loop with manual commit and seek-back
    fn subscribe<'a>(
        &'a self,
        group: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, QueueError>> + Send + 'a>> {
        Box::pin(async move {
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", group)
                .set("enable.auto.commit", "false") // Manual commit for at-least-once
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", self.session_timeout.as_millis().to_string())
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| QueueError::Subscribe(format!("Failed to create consumer: {e}")))?;

            consumer.subscribe(&[self.topic.as_str()]).map_err(|e| {
                QueueError::Subscribe(format!("Failed to subscribe to {}: {e}", self.topic))
            })?;

            tracing::info!(
                topic = %self.topic,
                group = %group,
                manual_commit = true,
                "Subscribed to issuance topic"
            );

            let (tx, rx) = mpsc::channel(self.buffer_size);
            let seek_timeout = self.timeout;

            tokio::spawn(async move {
                use futures::StreamExt;

                let mut stream = consumer.stream();
                let mut redeliveries = Redeliveries::default();

                while let Some(next) = stream.next().await {
                    let message = match next {
                        Ok(message) => message,
                        Err(e) => {
                            let err = QueueError::Transport(format!("Failed to receive message: {e}"));
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                            continue;
                        }
                    };

                    let decoded = message
                        .payload()
                        .ok_or_else(|| QueueError::Decode("Message has no payload".to_string()))
                        .and_then(IssuanceMessage::from_json);

                    let issuance = match decoded {
                        Ok(issuance) => issuance,
                        Err(e) => {
                            // Poison message: commit so it is never redelivered.
                            if let Err(commit_err) = commit(&consumer, &message) {
                                tracing::warn!(error = %commit_err, "Failed to commit undecodable message");
                            }
                            if tx.send(Err(e)).await.is_err() {
                                break;
                            }
                            continue;
                        }
                    };

                    let delivery_count = redeliveries.count(message.partition(), message.offset());
                    let (settle_tx, settle_rx) = oneshot::channel();
                    let acker = KafkaAcker { settle: settle_tx };
                    let delivery = Delivery::new(issuance, delivery_count, Box::new(acker));

                    if tx.send(Ok(delivery)).await.is_err() {
                        tracing::debug!("Delivery receiver dropped, exiting consumer task");
                        break;
                    }

                    match settle_rx.await {
                        Ok(Settle { settlement: Settlement::Ack, done }) => {
                            let result = commit(&consumer, &message);
                            if let Err(e) = &result {
                                tracing::warn!(
                                    partition = message.partition(),
                                    offset = message.offset(),
                                    error = %e,
                                    "Commit failed (message may be redelivered)"
                                );
                            }
                            let _ = done.send(result);
                        }
                        Ok(Settle { settlement: Settlement::Nack, done }) => {
                            let _ = done.send(seek_back(&consumer, &message, seek_timeout));
                        }
                        Err(_) => {
                            // Delivery dropped without a decision.
                            if let Err(e) = seek_back(&consumer, &message, seek_timeout) {
                                tracing::warn!(error = %e, "Failed to rewind dropped delivery");
                            }
                        }
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}
