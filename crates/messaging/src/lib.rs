//! Messaging for the SMS dispatcher.
//!
//! This crate provides:
//! - [`Transport`], the broker boundary (publish, consume, ack/nack)
//! - [`InMemoryBroker`], a topic-routing broker used in tests and local runs
//! - [`EventPublisher`], mapping SMS events to exchanges and routing keys
//! - [`ReliableConsumer`], bounded in-process retry with dead-lettering

pub mod error;
pub mod memory;
pub mod pipeline;
pub mod publisher;
pub mod transport;

pub use error::{PublishError, Result, TransportError};
pub use memory::{ConfirmMode, InMemoryBroker, QueuedMessage};
pub use pipeline::{
    ATTEMPTS_HEADER, DeliveryOutcome, DrainOutcome, HandlerError, HandlerFn, LAST_ERROR_HEADER,
    MessageHandler, ORIGINAL_QUEUE_HEADER, ReliableConsumer, RetryPolicy, SubscribeOptions,
    Subscription, handler_fn,
};
pub use publisher::{
    BILLING_REFUNDED_ROUTING_KEY, BILLING_REQUESTED_ROUTING_KEY, BrokerEventPublisher,
    EventPublisher, PublisherConfig, Route, TOPIC_EXCHANGE, route_for,
};
pub use transport::{
    Acknowledger, ConsumeOptions, DEFAULT_EXCHANGE, Delivery, DeliveryStream, Headers,
    OutboundMessage, PublishConfirm, Transport,
};
