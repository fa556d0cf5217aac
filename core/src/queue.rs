//! Issuance Queue abstraction.
//!
//! Carries accepted-but-not-yet-persisted issuance requests from the
//! acceptance path to the fulfillment workers.
//!
//! # Delivery Semantics
//!
//! - **At-least-once**: a message is redelivered until a consumer acks it
//! - **Competing consumers**: within one consumer group each delivery goes to
//!   exactly one subscriber
//! - **No ordering guarantee**: persistence is idempotent on `attempt_id`, so
//!   order does not matter for correctness
//!
//! Every [`Delivery`] carries an [`Acknowledger`]. Calling `ack` commits the
//! message; `nack` (or dropping the handle) makes it eligible for redelivery.
//!
//! # Example
//!
//! ```rust,ignore
//! use futures::StreamExt;
//!
//! let mut deliveries = queue.subscribe("coupon-service").await?;
//! while let Some(delivery) = deliveries.next().await {
//!     let delivery = delivery?;
//!     match fulfill(&delivery.message).await {
//!         Ok(()) => delivery.ack().await?,
//!         Err(_) => delivery.nack().await?,
//!     }
//! }
//! ```

use crate::types::{AttemptId, OwnerId, PolicyId};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Default topic for issuance requests.
pub const ISSUANCE_TOPIC: &str = "coupon-issue-requests";

/// Default consumer group of the fulfillment workers.
pub const CONSUMER_GROUP: &str = "coupon-service";

/// Errors that can occur during queue operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Failed to publish a message
    #[error("Publish failed for topic '{topic}': {reason}")]
    Publish {
        /// Target topic
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe
    #[error("Subscription failed: {0}")]
    Subscribe(String),

    /// Payload could not be decoded
    #[error("Malformed issuance message: {0}")]
    Decode(String),

    /// Commit or redelivery request failed
    #[error("Acknowledgement failed: {0}")]
    Acknowledge(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Transient request to fulfill one reserved unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuanceMessage {
    /// Policy the unit was reserved from
    pub policy_id: PolicyId,
    /// Owner the coupon is issued to
    pub owner_id: OwnerId,
    /// When the request was accepted
    pub requested_at: DateTime<Utc>,
    /// Idempotency key of the reservation
    pub attempt_id: AttemptId,
}

impl IssuanceMessage {
    /// Encode as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Decode`] if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, QueueError> {
        serde_json::to_vec(self).map_err(|e| QueueError::Decode(e.to_string()))
    }

    /// Decode from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Decode`] for malformed payloads.
    pub fn from_json(payload: &[u8]) -> Result<Self, QueueError> {
        serde_json::from_slice(payload).map_err(|e| QueueError::Decode(e.to_string()))
    }

    /// Partition key: messages of one policy share a partition.
    #[must_use]
    pub fn partition_key(&self) -> String {
        self.policy_id.to_string()
    }
}

/// Acknowledgement handle of one delivery.
pub trait Acknowledger: Send {
    /// Mark the delivery as processed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Acknowledge`] if the commit failed; the message
    /// may then be redelivered.
    fn ack(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send>>;

    /// Request redelivery.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Acknowledge`] if the request failed.
    fn nack(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send>>;
}

/// One delivered message and its acknowledgement handle.
pub struct Delivery {
    /// Decoded message
    pub message: IssuanceMessage,
    /// How many times this message has been delivered (1 on first delivery)
    pub delivery_count: u32,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Pair a message with its acknowledgement handle.
    #[must_use]
    pub fn new(message: IssuanceMessage, delivery_count: u32, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            message,
            delivery_count,
            acker,
        }
    }

    /// Returns `true` if the message was delivered before.
    #[must_use]
    pub const fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }

    /// Acknowledge the message.
    ///
    /// # Errors
    ///
    /// See [`Acknowledger::ack`].
    pub async fn ack(self) -> Result<(), QueueError> {
        self.acker.ack().await
    }

    /// Request redelivery.
    ///
    /// # Errors
    ///
    /// See [`Acknowledger::nack`].
    pub async fn nack(self) -> Result<(), QueueError> {
        self.acker.nack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("delivery_count", &self.delivery_count)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from a subscription.
///
/// Stream-level errors (for example a payload that could not be decoded) are
/// yielded as `Err`; the stream continues afterwards.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, QueueError>> + Send>>;

/// At-least-once channel for issuance messages.
pub trait IssuanceQueue: Send + Sync {
    /// Publish a message.
    ///
    /// Resolves once the broker has accepted the message durably.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Publish`] if the broker rejected or timed out.
    fn publish<'a>(
        &'a self,
        message: &'a IssuanceMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + 'a>>;

    /// Join consumer `group` and stream deliveries.
    ///
    /// Subscribers of the same group compete for messages.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Subscribe`] if the subscription could not be set up.
    fn subscribe<'a>(
        &'a self,
        group: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, QueueError>> + Send + 'a>>;
}
