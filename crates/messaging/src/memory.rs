//! In-memory topic broker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, oneshot};

use crate::transport::{
    Acknowledger, ConsumeOptions, DEFAULT_EXCHANGE, Delivery, DeliveryStream, Headers,
    OutboundMessage, PublishConfirm, Transport,
};
use crate::{Result, TransportError};

/// The topic exchange every broker starts with.
const BUILTIN_TOPIC_EXCHANGE: &str = "amq.topic";

/// How the broker answers publisher confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmMode {
    /// Confirms are off; publishes are fire-and-forget.
    Disabled,
    /// Every accepted publish is acked.
    #[default]
    Ack,
    /// Every publish is nacked and dropped.
    Nack,
    /// Confirms never arrive.
    Never,
}

/// A message sitting in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub body: Vec<u8>,
    pub headers: Headers,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
}

impl QueuedMessage {
    /// Returns a header value.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// In-memory broker with topic exchanges and durable FIFO queues.
///
/// Routing follows AMQP topic rules: `*` matches one word, `#` matches zero
/// or more. The default exchange `""` routes to the queue named by the
/// routing key and rejects the publish if that queue does not exist.
/// Unacked deliveries hold a prefetch permit until settled; a delivery
/// dropped without settling goes back to the head of its queue.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    next_tag: AtomicU64,
}

struct BrokerState {
    queues: HashMap<String, QueueState>,
    bindings: HashMap<String, Vec<Binding>>,
    unacked: HashMap<u64, Unacked>,
    published: Vec<OutboundMessage>,
    failing_routing_keys: HashSet<String>,
    confirm_mode: ConfirmMode,
    // Held so `ConfirmMode::Never` receivers stay pending.
    unanswered_confirms: Vec<oneshot::Sender<bool>>,
    closed: bool,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<QueuedMessage>,
    notify: Arc<Notify>,
}

struct Binding {
    pattern: String,
    queue: String,
}

struct Unacked {
    queue: String,
    message: QueuedMessage,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Creates a broker with the built-in `amq.topic` exchange.
    pub fn new() -> Self {
        let mut bindings = HashMap::new();
        bindings.insert(BUILTIN_TOPIC_EXCHANGE.to_string(), Vec::new());

        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState {
                    queues: HashMap::new(),
                    bindings,
                    unacked: HashMap::new(),
                    published: Vec::new(),
                    failing_routing_keys: HashSet::new(),
                    confirm_mode: ConfirmMode::default(),
                    unanswered_confirms: Vec::new(),
                    closed: false,
                }),
                next_tag: AtomicU64::new(1),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.lock()
    }

    /// Declares a queue. Declaring an existing queue is a no-op.
    pub fn declare_queue(&self, queue: &str) {
        self.lock().queues.entry(queue.to_string()).or_default();
    }

    /// Declares a topic exchange. Declaring an existing exchange is a no-op.
    pub fn declare_exchange(&self, exchange: &str) {
        self.lock().bindings.entry(exchange.to_string()).or_default();
    }

    /// Binds a queue to an exchange with a topic pattern, declaring both.
    pub fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) {
        let mut state = self.lock();
        state.queues.entry(queue.to_string()).or_default();
        state
            .bindings
            .entry(exchange.to_string())
            .or_default()
            .push(Binding {
                pattern: pattern.to_string(),
                queue: queue.to_string(),
            });
    }

    /// Sets how publisher confirms are answered.
    pub fn set_confirm_mode(&self, mode: ConfirmMode) {
        self.lock().confirm_mode = mode;
    }

    /// Makes every publish with this routing key fail immediately.
    pub fn fail_publishes_to(&self, routing_key: &str) {
        self.lock()
            .failing_routing_keys
            .insert(routing_key.to_string());
    }

    /// Stops injecting publish failures.
    pub fn clear_publish_failures(&self) {
        self.lock().failing_routing_keys.clear();
    }

    /// Closes the broker. Every consumer stream ends.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        for queue in state.queues.values() {
            queue.notify.notify_waiters();
        }
    }

    /// Returns every accepted publish in order.
    pub fn published(&self) -> Vec<OutboundMessage> {
        self.lock().published.clone()
    }

    /// Returns accepted publishes with the given routing key.
    pub fn published_to(&self, routing_key: &str) -> Vec<OutboundMessage> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.routing_key == routing_key)
            .cloned()
            .collect()
    }

    /// Returns the number of messages ready for delivery.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Returns the number of delivered but unsettled messages.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .unacked
            .values()
            .filter(|u| u.queue == queue)
            .count()
    }

    /// Removes and returns every ready message on a queue.
    pub fn take_ready(&self, queue: &str) -> Vec<QueuedMessage> {
        self.lock()
            .queues
            .get_mut(queue)
            .map(|q| q.ready.drain(..).collect())
            .unwrap_or_default()
    }
}

impl BrokerInner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.lock();
        let unacked = state
            .unacked
            .remove(&tag)
            .ok_or(TransportError::UnknownDeliveryTag(tag))?;

        if requeue && let Some(queue) = state.queues.get_mut(&unacked.queue) {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.ready.push_front(message);
            queue.notify.notify_waiters();
        }
        Ok(())
    }
}

impl BrokerState {
    /// Resolves the queues a message routes to.
    fn route(&self, message: &OutboundMessage) -> Result<Vec<String>> {
        if message.exchange == DEFAULT_EXCHANGE {
            if self.queues.contains_key(&message.routing_key) {
                return Ok(vec![message.routing_key.clone()]);
            }
            return Err(TransportError::QueueNotFound(message.routing_key.clone()));
        }

        let bindings = self
            .bindings
            .get(&message.exchange)
            .ok_or_else(|| TransportError::ExchangeNotFound(message.exchange.clone()))?;

        let mut queues: Vec<String> = Vec::new();
        for binding in bindings {
            if topic_matches(&binding.pattern, &message.routing_key)
                && !queues.contains(&binding.queue)
            {
                queues.push(binding.queue.clone());
            }
        }
        Ok(queues)
    }

    fn enqueue(&mut self, queue: &str, message: &OutboundMessage) {
        if let Some(state) = self.queues.get_mut(queue) {
            state.ready.push_back(QueuedMessage {
                body: message.body.clone(),
                headers: message.headers.clone(),
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: false,
            });
            state.notify.notify_waiters();
        }
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn publish(&self, message: OutboundMessage) -> Result<PublishConfirm> {
        let mut state = self.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.failing_routing_keys.contains(&message.routing_key) {
            return Err(TransportError::PublishRejected(message.routing_key));
        }

        let queues = state.route(&message)?;

        let mode = state.confirm_mode;
        if mode == ConfirmMode::Nack {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(false);
            return Ok(PublishConfirm::Pending(rx));
        }

        for queue in &queues {
            state.enqueue(queue, &message);
        }
        state.published.push(message);

        match mode {
            ConfirmMode::Disabled => Ok(PublishConfirm::Unconfirmed),
            ConfirmMode::Ack => {
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(true);
                Ok(PublishConfirm::Pending(rx))
            }
            ConfirmMode::Never | ConfirmMode::Nack => {
                let (tx, rx) = oneshot::channel();
                state.unanswered_confirms.push(tx);
                Ok(PublishConfirm::Pending(rx))
            }
        }
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream> {
        let notify = {
            let state = self.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            state
                .queues
                .get(queue)
                .map(|q| q.notify.clone())
                .ok_or_else(|| TransportError::QueueNotFound(queue.to_string()))?
        };

        let permits = match options.prefetch {
            0 => Semaphore::MAX_PERMITS,
            n => usize::from(n),
        };

        let consumer = Consumer {
            broker: self.clone(),
            queue: queue.to_string(),
            notify,
            prefetch: Arc::new(Semaphore::new(permits)),
        };

        Ok(Box::pin(stream::unfold(consumer, |consumer| async move {
            let delivery = consumer.next_delivery().await?;
            Some((delivery, consumer))
        })))
    }

    fn supports_confirms(&self) -> bool {
        self.lock().confirm_mode != ConfirmMode::Disabled
    }
}

struct Consumer {
    broker: InMemoryBroker,
    queue: String,
    notify: Arc<Notify>,
    prefetch: Arc<Semaphore>,
}

impl Consumer {
    async fn next_delivery(&self) -> Option<Delivery> {
        let permit = self.prefetch.clone().acquire_owned().await.ok()?;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a publish in between is not missed.
            notified.as_mut().enable();

            {
                let mut state = self.broker.lock();
                if state.closed {
                    return None;
                }
                let message = state
                    .queues
                    .get_mut(&self.queue)
                    .and_then(|q| q.ready.pop_front());

                if let Some(message) = message {
                    let tag = self.broker.inner.next_tag.fetch_add(1, Ordering::Relaxed);
                    state.unacked.insert(
                        tag,
                        Unacked {
                            queue: self.queue.clone(),
                            message: message.clone(),
                        },
                    );

                    let acker = InMemoryAcker {
                        broker: self.broker.inner.clone(),
                        tag,
                        settled: false,
                        _permit: permit,
                    };
                    return Some(Delivery::new(
                        message.body,
                        message.headers,
                        message.exchange,
                        message.routing_key,
                        message.redelivered,
                        tag,
                        Box::new(acker),
                    ));
                }
            }

            notified.await;
        }
    }
}

struct InMemoryAcker {
    broker: Arc<BrokerInner>,
    tag: u64,
    settled: bool,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(mut self: Box<Self>) -> Result<()> {
        self.settled = true;
        self.broker.settle(self.tag, false)
    }

    async fn nack(mut self: Box<Self>, requeue: bool) -> Result<()> {
        self.settled = true;
        self.broker.settle(self.tag, requeue)
    }
}

impl Drop for InMemoryAcker {
    fn drop(&mut self) {
        if !self.settled {
            // Same as a channel closing with the delivery outstanding.
            let _ = self.broker.settle(self.tag, true);
        }
    }
}

/// Matches an AMQP topic pattern against a routing key.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}
