//! Outbound event publication.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::{DomainEvent, SmsEvent};

use crate::PublishError;
use crate::transport::{OutboundMessage, PublishConfirm, Transport};

/// Exchange all SMS events are published to.
pub const TOPIC_EXCHANGE: &str = "amq.topic";

/// Routing key of `BillingRequested`.
pub const BILLING_REQUESTED_ROUTING_KEY: &str = "sms.billing.requested";

/// Routing key of `BillingRefunded`.
pub const BILLING_REFUNDED_ROUTING_KEY: &str = "sms.billing.refunded";

/// Where an event is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub exchange: &'static str,
    pub routing_key: &'static str,
}

/// Looks up the fixed route of an event.
///
/// `SmsBillingCompleted` is only ever consumed, so it has no route.
pub fn route_for(event: &SmsEvent) -> Result<Route, PublishError> {
    match event {
        SmsEvent::RequestSmsBilling(_) => Ok(Route {
            exchange: TOPIC_EXCHANGE,
            routing_key: BILLING_REQUESTED_ROUTING_KEY,
        }),
        SmsEvent::RequestBillingRefund(_) => Ok(Route {
            exchange: TOPIC_EXCHANGE,
            routing_key: BILLING_REFUNDED_ROUTING_KEY,
        }),
        SmsEvent::SmsBillingCompleted(_) => {
            Err(PublishError::UnknownEventType(event.event_type()))
        }
    }
}

/// Publishes SMS events to the broker.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Routes, serializes and publishes an event.
    ///
    /// Returns once the broker confirmed the publish, or immediately after
    /// handing it over when the transport has no confirms.
    async fn publish_event(&self, event: &SmsEvent) -> Result<(), PublishError>;
}

#[async_trait]
impl<T: EventPublisher + ?Sized> EventPublisher for Arc<T> {
    async fn publish_event(&self, event: &SmsEvent) -> Result<(), PublishError> {
        (**self).publish_event(event).await
    }
}

/// Configuration for [`BrokerEventPublisher`].
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// How long to wait for a broker confirm.
    pub confirm_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            confirm_timeout: Duration::from_secs(5),
        }
    }
}

/// [`EventPublisher`] on top of a [`Transport`].
#[derive(Clone)]
pub struct BrokerEventPublisher<T> {
    transport: T,
    config: PublisherConfig,
}

impl<T: Transport> BrokerEventPublisher<T> {
    /// Creates a publisher with the default configuration.
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, PublisherConfig::default())
    }

    /// Creates a publisher with a custom configuration.
    pub fn with_config(transport: T, config: PublisherConfig) -> Self {
        Self { transport, config }
    }

    /// Returns the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns true if publishes wait for a broker confirm.
    ///
    /// Without confirms a publish succeeds once the transport accepts it.
    pub fn confirms_enabled(&self) -> bool {
        self.transport.supports_confirms()
    }

    async fn publish_routed(&self, event: &SmsEvent) -> Result<(), PublishError> {
        let route = route_for(event)?;
        let body = event.to_wire()?;

        let message = OutboundMessage::new(route.exchange, route.routing_key, body)
            .with_header("content-type", "application/json")
            .with_header("event-type", event.event_type());

        let confirm = self.transport.publish(message).await?;
        await_confirm(confirm, route.routing_key, self.config.confirm_timeout).await
    }
}

#[async_trait]
impl<T: Transport> EventPublisher for BrokerEventPublisher<T> {
    #[tracing::instrument(skip(self, event), fields(event_type = event.event_type(), aggregate_id = %event.aggregate_id()))]
    async fn publish_event(&self, event: &SmsEvent) -> Result<(), PublishError> {
        let event_type = event.event_type();
        match self.publish_routed(event).await {
            Ok(()) => {
                metrics::counter!("events_published_total", "event_type" => event_type)
                    .increment(1);
                tracing::debug!("event published");
                Ok(())
            }
            Err(e) => {
                metrics::counter!("event_publish_failures_total", "event_type" => event_type)
                    .increment(1);
                tracing::warn!(error = %e, "event publish failed");
                Err(e)
            }
        }
    }
}

/// Waits for a broker confirm, bounded by `timeout`.
pub(crate) async fn await_confirm(
    confirm: PublishConfirm,
    routing_key: &str,
    timeout: Duration,
) -> Result<(), PublishError> {
    let receiver = match confirm {
        PublishConfirm::Unconfirmed => return Ok(()),
        PublishConfirm::Pending(receiver) => receiver,
    };

    match tokio::time::timeout(timeout, receiver).await {
        Ok(Ok(true)) => Ok(()),
        Ok(Ok(false)) => Err(PublishError::Nacked {
            routing_key: routing_key.to_string(),
        }),
        // The channel went away before answering.
        Ok(Err(_)) => Err(PublishError::Transport(crate::TransportError::Closed)),
        Err(_) => Err(PublishError::Timeout {
            routing_key: routing_key.to_string(),
            timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConfirmMode, InMemoryBroker, TransportError};
    use common::{SmsId, TransactionId, UserId};
    use domain::SmsBillingCompleted;

    fn billing_requested() -> SmsEvent {
        SmsEvent::billing_requested(UserId::new("1"), SmsId::new(), 1)
    }

    #[test]
    fn test_routing_table() {
        assert_eq!(
            route_for(&billing_requested()).unwrap(),
            Route {
                exchange: "amq.topic",
                routing_key: "sms.billing.requested"
            }
        );
        assert_eq!(
            route_for(&SmsEvent::billing_refund(TransactionId::new("t")))
                .unwrap()
                .routing_key,
            "sms.billing.refunded"
        );
    }

    #[tokio::test]
    async fn test_inbound_event_has_no_route() {
        let broker = InMemoryBroker::new();
        let publisher = BrokerEventPublisher::new(broker.clone());
        let completed = SmsEvent::SmsBillingCompleted(SmsBillingCompleted {
            user_id: UserId::new("1"),
            sms_id: SmsId::new(),
            amount: 1,
            transaction_id: TransactionId::new("txn-1"),
            timestamp: chrono::Utc::now(),
        });

        let err = publisher.publish_event(&completed).await.unwrap_err();
        assert!(matches!(err, PublishError::UnknownEventType("BillingCompleted")));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_publish_sends_wire_payload() {
        let broker = InMemoryBroker::new();
        let publisher = BrokerEventPublisher::new(broker.clone());
        let event = billing_requested();

        publisher.publish_event(&event).await.unwrap();

        let published = broker.published_to(BILLING_REQUESTED_ROUTING_KEY);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, "amq.topic");
        assert_eq!(published[0].body, event.to_wire().unwrap());
        assert_eq!(
            published[0].headers.get("event-type").map(String::as_str),
            Some("BillingRequested")
        );
    }

    #[tokio::test]
    async fn test_broker_nack_fails_publish() {
        let broker = InMemoryBroker::new();
        broker.set_confirm_mode(ConfirmMode::Nack);
        let publisher = BrokerEventPublisher::new(broker);

        let err = publisher
            .publish_event(&billing_requested())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Nacked { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_confirm_times_out() {
        let broker = InMemoryBroker::new();
        broker.set_confirm_mode(ConfirmMode::Never);
        let publisher = BrokerEventPublisher::with_config(
            broker,
            PublisherConfig {
                confirm_timeout: Duration::from_secs(5),
            },
        );

        let err = publisher
            .publish_event(&billing_requested())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PublishError::Timeout { timeout, .. } if timeout == Duration::from_secs(5)
        ));
    }

    #[tokio::test]
    async fn test_without_confirms_publish_is_fire_and_forget() {
        let broker = InMemoryBroker::new();
        broker.set_confirm_mode(ConfirmMode::Disabled);
        let publisher = BrokerEventPublisher::new(broker.clone());
        assert!(!publisher.confirms_enabled());

        publisher.publish_event(&billing_requested()).await.unwrap();
        assert_eq!(broker.published().len(), 1);
    }

    #[test]
    fn test_confirms_follow_transport() {
        let broker = InMemoryBroker::new();
        let publisher = BrokerEventPublisher::new(broker.clone());
        assert!(publisher.confirms_enabled());

        broker.set_confirm_mode(ConfirmMode::Nack);
        assert!(publisher.confirms_enabled());

        broker.set_confirm_mode(ConfirmMode::Disabled);
        assert!(!publisher.confirms_enabled());
    }

    #[tokio::test]
    async fn test_transport_error_is_surfaced() {
        let broker = InMemoryBroker::new();
        broker.fail_publishes_to(BILLING_REFUNDED_ROUTING_KEY);
        let publisher = BrokerEventPublisher::new(broker);

        let err = publisher
            .publish_event(&SmsEvent::billing_refund(TransactionId::new("t")))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PublishError::Transport(TransportError::PublishRejected(_))
        ));
    }
}
