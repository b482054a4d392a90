//! Broker Port (Driver and Driven)
//!
//! Message source, settlement channel and publishing interface of the
//! message broker. Deliveries are settled manually: every delivery handed
//! out must be acked or nacked exactly once.

use std::collections::BTreeMap;

use async_trait::async_trait;

/// Broker-assigned delivery tag, unique per connection.
pub type DeliveryTag = u64;

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Tag used to settle this delivery.
    pub tag: DeliveryTag,
    /// Raw message body.
    pub body: Vec<u8>,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Whether the broker has delivered this message before.
    pub redelivered: bool,
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Target exchange.
    pub exchange: String,
    /// Routing key.
    pub routing_key: String,
    /// Message body.
    pub body: Vec<u8>,
    /// Message headers.
    pub headers: BTreeMap<String, String>,
}

/// Broker interaction error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The connection or channel is closed.
    #[error("broker channel closed")]
    Closed,

    /// No such exchange is declared.
    #[error("unknown exchange: {exchange}")]
    UnknownExchange {
        /// Exchange name.
        exchange: String,
    },

    /// The delivery tag is not outstanding on this channel.
    #[error("unknown delivery tag: {tag}")]
    UnknownDeliveryTag {
        /// Tag that was settled.
        tag: DeliveryTag,
    },

    /// Publishing failed.
    #[error("publish to {exchange} failed: {message}")]
    PublishFailed {
        /// Target exchange.
        exchange: String,
        /// Failure description.
        message: String,
    },
}

/// Settlement and publishing side of a consumer channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Acknowledge a delivery.
    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Negatively acknowledge a delivery, optionally asking for requeue.
    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError>;

    /// Publish a message on this channel.
    async fn publish(&self, message: OutboundMessage) -> Result<(), BrokerError>;
}

/// Stream of deliveries for one consumer.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Wait for the next delivery. `None` once the source is closed and
    /// drained.
    ///
    /// Must be cancel-safe: dropping the future never loses a message.
    async fn next_delivery(&self) -> Option<Delivery>;

    /// Consumer tag, for logs.
    fn consumer_tag(&self) -> &str;
}

/// Queue depth probe, used for scaling and health.
pub trait QueueDepth: Send + Sync {
    /// Messages waiting to be delivered.
    fn backlog(&self) -> usize;

    /// Messages delivered but not yet settled.
    fn unacked(&self) -> usize;
}

/// Connection able to open consumers.
#[async_trait]
pub trait BrokerConnection: QueueDepth + 'static {
    /// Consumer type handed to workers.
    type Consumer: MessageSource + DeliveryChannel + 'static;

    /// Open a consumer with the given prefetch limit.
    async fn open_consumer(&self, prefetch: u16) -> Result<Self::Consumer, BrokerError>;
}
