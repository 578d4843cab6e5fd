//! Event bus for async delivery between services.
//!
//! This module contains:
//! - `Broker` / `Link` traits: the transport seam (dial, declare, publish, consume)
//! - `ConnectionManager`: the single physical link, retry and re-dial
//! - `Publisher` / `Consumer`: configured endpoints of the pipeline
//! - `Worker` trait: domain logic invoked per delivery
//! - Implementations: AMQP (RabbitMQ), in-memory

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod connection;
pub mod consumer;
pub mod envelope;
pub mod memory;
pub mod publisher;
pub mod worker;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use connection::{ConnectionManager, ConnectionState, LinkHandle, RetryPolicy};
pub use consumer::{Consumer, ConsumerConfig};
pub use envelope::{Envelope, CONTENT_TYPE_JSON};
pub use memory::MemoryBroker;
pub use publisher::{PublishError, Publisher, PublisherConfig};
pub use worker::{DeliveryOutcome, Worker, WorkerError};

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Topology declaration failed: {0}")]
    Topology(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Acknowledgement failed: {0}")]
    Settle(String),

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Connection manager is closing")]
    Closed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Consumer '{0}' already started")]
    AlreadyStarted(String),
}

impl BusError {
    /// Whether the error came from the link itself (as opposed to a
    /// rejected declaration, a nacked publish or bad configuration).
    pub fn is_link_failure(&self) -> bool {
        matches!(self, BusError::Connection(_) | BusError::NotConnected)
    }
}

// ============================================================================
// Transport traits
// ============================================================================

/// Declaration of a durable queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name.
    pub name: String,
    /// Exchange that receives rejected messages, if any.
    pub dead_letter_exchange: Option<String>,
}

/// A message as it arrives from the broker, before decoding.
pub struct Delivery {
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Whether the broker has delivered this message before.
    pub redelivered: bool,
    /// Message type property, if present.
    pub type_name: Option<String>,
    /// Correlation id property, if present.
    pub correlation_id: Option<String>,
    /// Message id property, if present.
    pub message_id: Option<String>,
    /// String-valued headers (trace context, custom metadata).
    pub headers: BTreeMap<String, String>,
    /// Raw message body.
    pub payload: bytes::Bytes,
    /// Settles the delivery with the broker.
    pub acker: Box<dyn Acker>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("type_name", &self.type_name)
            .field("message_id", &self.message_id)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Settles one delivery. Exactly one method is called per delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    /// Processed successfully, remove from the queue.
    async fn ack(&self) -> Result<()>;
    /// Transient failure, put back for redelivery.
    async fn requeue(&self) -> Result<()>;
    /// Poison message, drop or dead-letter, never redeliver.
    async fn reject(&self) -> Result<()>;
}

/// Stream of deliveries for one subscription. Ends when the link drops.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// One live connection to the broker.
///
/// Implementations:
/// - `AmqpLink`: RabbitMQ via lapin
/// - `MemoryLink`: in-process broker for tests and local runs
#[async_trait]
pub trait Link: Send + Sync {
    /// Whether the link is still usable.
    fn is_connected(&self) -> bool;

    /// Resolves once the link is lost or closed.
    async fn closed(&self);

    /// Declare a durable topic exchange. Idempotent.
    async fn declare_exchange(&self, exchange: &str) -> Result<()>;

    /// Declare a durable queue. Idempotent.
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()>;

    /// Bind a queue to an exchange on a binding key. Idempotent.
    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()>;

    /// Publish a persistent message and wait for the broker to accept it.
    async fn publish(&self, exchange: &str, envelope: &Envelope) -> Result<()>;

    /// Start a subscription with manual acknowledgement.
    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16)
        -> Result<DeliveryStream>;

    /// Close the link.
    async fn close(&self) -> Result<()>;
}

/// Dials new links. Owned by the `ConnectionManager`.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Human-readable target for logs (credentials stripped).
    fn describe(&self) -> String;

    /// Open one new link.
    async fn dial(&self) -> Result<Arc<dyn Link>>;
}

// ============================================================================
// Routing
// ============================================================================

/// Check if a routing key matches a topic binding pattern.
///
/// Matching rules (AMQP topic exchange):
/// - words are separated by `.`
/// - `*` matches exactly one word
/// - `#` matches zero or more words
/// - an empty key (or pattern) has zero words
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    match_words(&words(pattern), &words(routing_key))
}

fn words(key: &str) -> Vec<&str> {
    if key.is_empty() {
        Vec::new()
    } else {
        key.split('.').collect()
    }
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

/// Strip credentials from a broker URL before logging it.
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests;
