//! Broker transport boundary.
//!
//! Pure I/O: publish, consume, ack and nack. No business logic lives behind
//! this trait.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_core::Stream;
use tokio::sync::oneshot;

use crate::Result;

/// The default (nameless) exchange; routes to the queue named by the
/// routing key.
pub const DEFAULT_EXCHANGE: &str = "";

/// Message headers.
pub type Headers = BTreeMap<String, String>;

/// A message to hand to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: Headers,
}

impl OutboundMessage {
    /// Creates a message for an exchange and routing key.
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            body: body.into(),
            headers: Headers::new(),
        }
    }

    /// Creates a message addressed straight to a queue through the default
    /// exchange.
    pub fn to_queue(queue: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self::new(DEFAULT_EXCHANGE, queue, body)
    }

    /// Replaces all headers.
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Sets a single header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Outcome of handing a message to the broker.
#[derive(Debug)]
pub enum PublishConfirm {
    /// The channel is not in confirm mode; the publish is fire-and-forget.
    Unconfirmed,

    /// Resolves to `true` on broker ack and `false` on nack.
    Pending(oneshot::Receiver<bool>),
}

/// Options for starting a consumer.
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    /// Maximum unacknowledged deliveries outstanding. `0` means unlimited.
    pub prefetch: u16,
    pub consumer_tag: String,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            prefetch: 1,
            consumer_tag: String::new(),
        }
    }
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send {
    async fn ack(self: Box<Self>) -> Result<()>;
    async fn nack(self: Box<Self>, requeue: bool) -> Result<()>;
}

/// A message received from a queue.
///
/// Consumed by `ack` or `nack`, so a delivery is settled at most once.
pub struct Delivery {
    pub body: Vec<u8>,
    pub headers: Headers,
    pub exchange: String,
    pub routing_key: String,
    /// True if the broker handed this message out before.
    pub redelivered: bool,
    pub delivery_tag: u64,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Creates a delivery settled through `acker`.
    pub fn new(
        body: Vec<u8>,
        headers: Headers,
        exchange: String,
        routing_key: String,
        redelivered: bool,
        delivery_tag: u64,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            body,
            headers,
            exchange,
            routing_key,
            redelivered,
            delivery_tag,
            acker,
        }
    }

    /// Returns a header value.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Removes the message from the queue.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Rejects the message, optionally putting it back on the queue.
    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// A stream of deliveries from one consumer.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// Core trait for broker transports.
///
/// One transport is shared by the publisher and consumer roles of a
/// process.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hands a message to the broker.
    ///
    /// Errors are immediate transport failures; broker confirmation, if any,
    /// arrives through the returned [`PublishConfirm`].
    async fn publish(&self, message: OutboundMessage) -> Result<PublishConfirm>;

    /// Starts consuming a queue.
    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream>;

    /// Returns true if publishes are confirmed by the broker.
    fn supports_confirms(&self) -> bool;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn publish(&self, message: OutboundMessage) -> Result<PublishConfirm> {
        (**self).publish(message).await
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream> {
        (**self).consume(queue, options).await
    }

    fn supports_confirms(&self) -> bool {
        (**self).supports_confirms()
    }
}
