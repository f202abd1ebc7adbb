//! Reliable consumption pipeline.
//!
//! Wraps a raw delivery stream with bounded in-process retry and
//! dead-lettering. A handler is attempted up to `max_attempts` times per
//! delivery; after that the message moves to `<queue>.dlq` and leaves the
//! main queue. Handler errors never escape the pipeline, they only decide
//! how the delivery is settled.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::publisher::await_confirm;
use crate::transport::{ConsumeOptions, Delivery, DeliveryStream, OutboundMessage, Transport};
use crate::{PublishError, Result};

/// Header carrying the attempt count on dead-lettered messages.
pub const ATTEMPTS_HEADER: &str = "attempts";

/// Header carrying the last handler error on dead-lettered messages.
pub const LAST_ERROR_HEADER: &str = "x-last-error";

/// Header carrying the queue a dead-lettered message came from.
pub const ORIGINAL_QUEUE_HEADER: &str = "x-original-queue";

/// Error type returned by message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes one message body.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, body: &[u8]) -> std::result::Result<(), HandlerError>;
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn handle(&self, body: &[u8]) -> std::result::Result<(), HandlerError> {
        (**self).handle(body).await
    }
}

/// Adapts an async closure into a [`MessageHandler`].
pub struct HandlerFn<F>(F);

/// Wraps `f` as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, body: &[u8]) -> std::result::Result<(), HandlerError> {
        (self.0)(body.to_vec()).await
    }
}

/// Bounded retry with linear backoff.
///
/// The delay before retry `n` (1-based, counting failed attempts) is
/// `n * base_delay`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total handler attempts per delivery. Values below 1 count as 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Returns the delay after the `attempt`-th failure.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt).min(self.max_delay)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The handler succeeded and the delivery was acked.
    Acked,
    /// Attempts ran out; the message went to the DLQ and the original was
    /// acked.
    DeadLettered,
    /// The message was handed back to the broker for redelivery.
    Requeued,
}

/// Options for a subscription.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Maximum unacknowledged deliveries. `1` forces strictly sequential
    /// consumption.
    pub prefetch: u16,
    pub consumer_tag: String,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            prefetch: 1,
            consumer_tag: String::new(),
        }
    }
}

/// Result of shutting a subscription down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The worker finished its in-flight delivery and stopped.
    Drained,
    /// The drain timeout elapsed and the worker was aborted.
    Aborted,
}

/// Consumes queues with bounded retry and dead-lettering.
#[derive(Clone)]
pub struct ReliableConsumer<T> {
    transport: T,
    policy: RetryPolicy,
    confirm_timeout: Duration,
}

impl<T: Transport + Clone + 'static> ReliableConsumer<T> {
    /// Creates a consumer with the given retry policy.
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            confirm_timeout: Duration::from_secs(5),
        }
    }

    /// Sets how long a DLQ publish may wait for a broker confirm.
    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    /// Returns the retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Starts one worker consuming `queue`.
    ///
    /// Failing to start consuming is returned here. Once running, the
    /// worker stops taking deliveries when `shutdown` (or the returned
    /// subscription) is cancelled; a delivery already in progress runs to
    /// completion, retries included.
    #[tracing::instrument(skip(self, handler, shutdown))]
    pub async fn subscribe<H>(
        &self,
        queue: &str,
        options: SubscribeOptions,
        handler: H,
        shutdown: CancellationToken,
    ) -> Result<Subscription>
    where
        H: MessageHandler + 'static,
    {
        let stream = self
            .transport
            .consume(
                queue,
                ConsumeOptions {
                    prefetch: options.prefetch,
                    consumer_tag: options.consumer_tag,
                },
            )
            .await?;

        let token = shutdown.child_token();
        let task = tokio::spawn(self.clone().run(
            queue.to_string(),
            stream,
            Arc::new(handler),
            token.clone(),
        ));

        tracing::info!(prefetch = options.prefetch, "subscribed");
        Ok(Subscription {
            queue: queue.to_string(),
            token,
            task,
        })
    }

    async fn run(
        self,
        queue: String,
        mut stream: DeliveryStream,
        handler: Arc<dyn MessageHandler>,
        token: CancellationToken,
    ) {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = stream.next() => next,
            };

            match delivery {
                Some(delivery) => {
                    self.handle_delivery(&queue, delivery, handler.as_ref())
                        .await;
                }
                None => {
                    tracing::warn!(%queue, "delivery stream ended");
                    break;
                }
            }
        }
        tracing::info!(%queue, "consumer stopped");
    }

    /// Runs the handler against one delivery and settles it.
    #[tracing::instrument(
        skip(self, delivery, handler),
        fields(delivery_tag = delivery.delivery_tag, redelivered = delivery.redelivered)
    )]
    pub async fn handle_delivery(
        &self,
        queue: &str,
        delivery: Delivery,
        handler: &dyn MessageHandler,
    ) -> DeliveryOutcome {
        let started = Instant::now();
        let max_attempts = self.policy.attempts();
        metrics::counter!("messages_consumed_total", "queue" => queue.to_string()).increment(1);

        let mut last_error = String::new();
        let mut attempt = 0;
        while attempt < max_attempts {
            attempt += 1;
            match handler.handle(&delivery.body).await {
                Ok(()) => {
                    metrics::histogram!("message_processing_seconds", "queue" => queue.to_string())
                        .record(started.elapsed().as_secs_f64());
                    return self.ack(queue, delivery, attempt).await;
                }
                Err(e) => {
                    metrics::counter!("message_handler_failures_total", "queue" => queue.to_string())
                        .increment(1);
                    tracing::warn!(attempt, max_attempts, error = %e, "handler failed");
                    last_error = e.to_string();

                    if attempt < max_attempts {
                        let delay = self.policy.delay_for(attempt);
                        tracing::debug!(?delay, "retrying after delay");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        metrics::histogram!("message_processing_seconds", "queue" => queue.to_string())
            .record(started.elapsed().as_secs_f64());
        self.dead_letter(queue, delivery, attempt, &last_error)
            .await
    }

    async fn ack(&self, queue: &str, delivery: Delivery, attempts: u32) -> DeliveryOutcome {
        match delivery.ack().await {
            Ok(()) => {
                metrics::counter!("messages_acked_total", "queue" => queue.to_string()).increment(1);
                tracing::debug!(attempts, "delivery acked");
                DeliveryOutcome::Acked
            }
            Err(e) => {
                // The broker redelivers whatever it did not see acked.
                tracing::error!(error = %e, "ack failed");
                DeliveryOutcome::Requeued
            }
        }
    }

    async fn dead_letter(
        &self,
        queue: &str,
        delivery: Delivery,
        attempts: u32,
        last_error: &str,
    ) -> DeliveryOutcome {
        let dlq = format!("{queue}.dlq");

        let mut headers = delivery.headers.clone();
        headers.insert(ATTEMPTS_HEADER.to_string(), attempts.to_string());
        headers.insert(LAST_ERROR_HEADER.to_string(), last_error.to_string());
        headers.insert(ORIGINAL_QUEUE_HEADER.to_string(), queue.to_string());
        let message = OutboundMessage::to_queue(dlq.as_str(), delivery.body.clone())
            .with_headers(headers);

        match self.publish_confirmed(message, &dlq).await {
            Ok(()) => {
                if let Err(e) = delivery.ack().await {
                    // Already on the DLQ; a redelivery will be dead-lettered again.
                    tracing::error!(error = %e, "ack after dead-lettering failed");
                }
                metrics::counter!("messages_dead_lettered_total", "queue" => queue.to_string())
                    .increment(1);
                tracing::error!(attempts, %dlq, error = last_error, "message dead-lettered");
                DeliveryOutcome::DeadLettered
            }
            Err(e) => {
                tracing::error!(%dlq, error = %e, "dead-letter publish failed, requeueing");
                if let Err(e) = delivery.nack(true).await {
                    tracing::error!(error = %e, "nack failed");
                }
                metrics::counter!("messages_requeued_total", "queue" => queue.to_string())
                    .increment(1);
                DeliveryOutcome::Requeued
            }
        }
    }

    async fn publish_confirmed(
        &self,
        message: OutboundMessage,
        dlq: &str,
    ) -> std::result::Result<(), PublishError> {
        let confirm = self.transport.publish(message).await?;
        await_confirm(confirm, dlq, self.confirm_timeout).await
    }
}

/// Handle to a running queue worker.
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Returns the consumed queue.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Returns true once the worker has stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops taking new deliveries without waiting.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Stops the worker, letting the in-flight delivery settle for up to
    /// `drain_timeout`. `Duration::ZERO` aborts immediately.
    #[tracing::instrument(skip(self), fields(queue = %self.queue))]
    pub async fn shutdown(mut self, drain_timeout: Duration) -> DrainOutcome {
        self.token.cancel();

        if self.task.is_finished() {
            return DrainOutcome::Drained;
        }

        if !drain_timeout.is_zero()
            && tokio::time::timeout(drain_timeout, &mut self.task)
                .await
                .is_ok()
        {
            tracing::info!("subscription drained");
            return DrainOutcome::Drained;
        }

        self.task.abort();
        tracing::warn!(?drain_timeout, "drain timed out, worker aborted");
        DrainOutcome::Aborted
    }
}
