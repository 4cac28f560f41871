//! Queue gateway abstraction shared by the producer and the consumer.
//!
//! The [`QueueGateway`] owns the topology contract so both sides always agree
//! on it:
//!
//! ```text
//!  publish ─► [orders] ──reject(requeue=false)──► (orders.dlx, fanout) ─► [orders.dead-letter]
//!               │
//!               └─► consumer (prefetch N, manual ack)
//! ```
//!
//! - `orders`: durable, not exclusive, not auto-deleted, declared with
//!   `x-dead-letter-exchange = orders.dlx`
//! - `orders.dlx`: durable fan-out exchange
//! - `orders.dead-letter`: durable queue bound to `orders.dlx` with an empty
//!   routing key
//!
//! Declarations are idempotent. Declaring an existing entity with different
//! parameters fails with [`QueueError::TopologyMismatch`], which callers treat
//! as a fatal configuration error.
//!
//! # Delivery handles
//!
//! Each [`Delivery`] carries its own [`Acknowledger`]. [`Delivery::ack`] and
//! [`Delivery::reject`] consume the delivery, so only the task that owns a
//! message can settle it, and only once.
//!
//! # Implementations
//!
//! - `AmqpGateway` in `order-ingest-amqp` (RabbitMQ via lapin)
//! - `InMemoryBroker` in `order-ingest-testing`

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Default primary queue name.
pub const ORDERS_QUEUE: &str = "orders";
/// Default dead-letter exchange name.
pub const DEAD_LETTER_EXCHANGE: &str = "orders.dlx";
/// Default dead-letter queue name.
pub const DEAD_LETTER_QUEUE: &str = "orders.dead-letter";

/// Errors that can occur during queue operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The broker could not be reached or refused the connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An entity exists with parameters different from the declared ones.
    #[error("Topology mismatch for '{name}': {reason}")]
    TopologyMismatch {
        /// Queue or exchange name.
        name: String,
        /// Broker explanation.
        reason: String,
    },

    /// A message could not be published or was not confirmed.
    #[error("Publish failed for queue '{queue}': {reason}")]
    PublishFailed {
        /// Target queue.
        queue: String,
        /// The reason for failure.
        reason: String,
    },

    /// The consumer could not be registered.
    #[error("Consume failed: {0}")]
    ConsumeFailed(String),

    /// An established connection or channel dropped.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// An ack or reject could not be delivered to the broker.
    #[error("Acknowledge failed for delivery {delivery_tag}: {reason}")]
    AcknowledgeFailed {
        /// Broker delivery tag.
        delivery_tag: u64,
        /// The reason for failure.
        reason: String,
    },

    /// The gateway or session was closed.
    #[error("Queue closed")]
    Closed,
}

impl QueueError {
    /// Errors that reconnecting cannot fix.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::TopologyMismatch { .. })
    }
}

/// Names of the queue, dead-letter exchange and dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    /// Primary work queue.
    pub queue: String,
    /// Fan-out exchange receiving rejected messages.
    pub dead_letter_exchange: String,
    /// Queue retaining dead-lettered messages.
    pub dead_letter_queue: String,
}

impl Default for QueueTopology {
    fn default() -> Self {
        Self {
            queue: ORDERS_QUEUE.to_string(),
            dead_letter_exchange: DEAD_LETTER_EXCHANGE.to_string(),
            dead_letter_queue: DEAD_LETTER_QUEUE.to_string(),
        }
    }
}

/// Settles one delivery with the broker.
///
/// Implementations are bound to a single delivery; they are only reachable
/// through the owning [`Delivery`].
pub trait Acknowledger: Send + Sync {
    /// Removes the message from the queue.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::AcknowledgeFailed`] if the channel is gone.
    fn ack(&self) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>>;

    /// Rejects the message without requeue, routing it to the dead-letter exchange.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::AcknowledgeFailed`] if the channel is gone.
    fn reject(&self) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>>;
}

/// A message handed to the consumer, together with its settlement handle.
pub struct Delivery {
    tag: u64,
    body: Vec<u8>,
    redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Wraps a broker delivery.
    pub fn new(
        tag: u64,
        body: Vec<u8>,
        redelivered: bool,
        acker: impl Acknowledger + 'static,
    ) -> Self {
        Self {
            tag,
            body,
            redelivered,
            acker: Box::new(acker),
        }
    }

    /// Broker delivery tag.
    #[must_use]
    pub const fn tag(&self) -> u64 {
        self.tag
    }

    /// Raw message body.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Whether the broker has delivered this message before.
    #[must_use]
    pub const fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Acknowledges the message.
    ///
    /// # Errors
    ///
    /// Propagates the acknowledger's failure.
    pub async fn ack(self) -> Result<(), QueueError> {
        self.acker.ack().await
    }

    /// Rejects the message without requeue (dead-letters it).
    ///
    /// # Errors
    ///
    /// Propagates the acknowledger's failure.
    pub async fn reject(self) -> Result<(), QueueError> {
        self.acker.reject().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// A live consumer registration on one connection.
///
/// Dropping a session without [`close`](QueueSession::close) abandons the
/// connection; unacknowledged messages are then redelivered by the broker.
pub trait QueueSession: Send {
    /// Waits for the next delivery.
    ///
    /// Returns `None` when the broker ends the consumer, `Some(Err(_))` when the
    /// connection is lost. Either way the session is finished.
    fn next_delivery(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Option<Result<Delivery, QueueError>>> + Send + '_>>;

    /// Closes the channel and the connection.
    ///
    /// # Errors
    ///
    /// Returns the broker error if closing fails; the session is gone either way.
    fn close(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send>>;
}

/// Durable point-to-point queue with a dead-letter path.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so the gateway can be shared as
/// `Arc<dyn QueueGateway>` between the HTTP surface and the consumer task.
pub trait QueueGateway: Send + Sync {
    /// The topology this gateway declares.
    fn topology(&self) -> &QueueTopology;

    /// Declares the dead-letter exchange, dead-letter queue, binding and primary queue.
    ///
    /// # Errors
    ///
    /// [`QueueError::TopologyMismatch`] if an entity exists with other
    /// parameters, [`QueueError::ConnectionFailed`] if the broker is unreachable.
    fn declare_topology(&self) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>>;

    /// Publishes `body` to the primary queue as a persistent message.
    ///
    /// Resolves once the broker has taken responsibility for the message.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::PublishFailed`] or a connection error; the
    /// message must be considered not sent.
    fn publish(&self, body: Vec<u8>)
    -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>>;

    /// Opens a connection, declares the topology, sets the prefetch count and
    /// starts consuming the primary queue with manual acknowledgement.
    ///
    /// # Errors
    ///
    /// Connection, topology and consume errors.
    fn consume(
        &self,
        prefetch: u16,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn QueueSession>, QueueError>> + Send + '_>>;
}
