//! The message broker collaborator.
//!
//! Sessions never talk to a concrete broker client. They use the [`Broker`] trait, which mirrors
//! the handful of topic-exchange operations they need. [`MemoryBroker`] is an in-process
//! implementation with AMQP topic semantics that backs the tests and the demo binary.

pub mod error;
pub mod memory;
pub mod topic;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bon::Builder;
use bytes::Bytes;
use tokio::sync::mpsc;

pub use self::error::BrokerError;
pub use self::memory::{MemoryBroker, MemoryConnection};

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Name of a broker queue. Anonymous queues get a broker-assigned name.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueueName(Arc<str>);

impl QueueName {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Handle of a consumer registration, needed to cancel it.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConsumerTag(Arc<str>);

impl ConsumerTag {
    pub fn new(tag: impl Into<Arc<str>>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Broker-assigned identifier of one delivery, used to acknowledge or reject it.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub fn new(tag: u64) -> Self {
        Self(tag)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Declared content type of a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentType {
    Json,
    Other(String),
    Unspecified,
}

impl ContentType {
    /// Interpret a content type header value.
    pub fn from_header(header: Option<&str>) -> Self {
        match header {
            Some(JSON_CONTENT_TYPE) => ContentType::Json,
            Some(other) => ContentType::Other(other.to_string()),
            None => ContentType::Unspecified,
        }
    }

    pub fn as_header(&self) -> Option<&str> {
        match self {
            ContentType::Json => Some(JSON_CONTENT_TYPE),
            ContentType::Other(other) => Some(other),
            ContentType::Unspecified => None,
        }
    }

    pub fn is_json(&self) -> bool {
        matches!(self, ContentType::Json)
    }
}

/// Options for [`Broker::declare_queue`].
#[derive(Debug, Clone, Copy, Default, Builder)]
pub struct QueueOptions {
    /// Usable only by the declaring connection and deleted when that connection closes.
    #[builder(default)]
    pub exclusive: bool,

    /// Only check that the queue exists; never create it.
    #[builder(default)]
    pub passive: bool,
}

/// A message delivered to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: DeliveryTag,
    pub exchange: String,
    pub routing_key: String,
    pub content_type: ContentType,
    pub body: Bytes,
    /// Set when the message was rejected with requeue and delivered again.
    pub redelivered: bool,
}

/// Receiving side of a consumer registration. The broker pushes every delivery for the queue
/// into it until the consumer is cancelled or the queue is deleted.
pub type DeliverySink = mpsc::UnboundedSender<Delivery>;

/// The operations a topic-exchange broker must offer.
///
/// Every operation completes asynchronously. Callers sequence dependent operations by awaiting
/// them in order.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a queue. An empty `name` asks the broker to generate one.
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<QueueName, BrokerError>;

    async fn bind_queue(
        &self,
        queue: &QueueName,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError>;

    async fn unbind_queue(
        &self,
        queue: &QueueName,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError>;

    /// Delete a queue, dropping its bindings, consumers and pending messages.
    async fn delete_queue(&self, queue: &QueueName) -> Result<(), BrokerError>;

    /// Start consuming `queue`. Resolves once the broker confirmed the registration.
    ///
    /// A queue may have several consumers; each message goes to one of them, in turn.
    async fn consume(
        &self,
        queue: &QueueName,
        sink: DeliverySink,
    ) -> Result<ConsumerTag, BrokerError>;

    async fn cancel(&self, consumer: &ConsumerTag) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content_type: ContentType,
        body: Bytes,
    ) -> Result<(), BrokerError>;

    /// Positively acknowledge a delivery, removing it from the queue.
    async fn ack(&self, queue: &QueueName, delivery: DeliveryTag) -> Result<(), BrokerError>;

    async fn reject(
        &self,
        queue: &QueueName,
        delivery: DeliveryTag,
        requeue: bool,
    ) -> Result<(), BrokerError>;
}
