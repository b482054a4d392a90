//! In-Memory Broker
//!
//! Process-local broker with AMQP-style semantics: topic and direct
//! exchanges routed through [`BrokerTopology`], manual acknowledgment,
//! per-consumer prefetch credit and requeue-to-front on nack.
//!
//! Cloning the broker shares the same queues.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use super::topology::BrokerTopology;
use crate::application::ports::{
    BrokerConnection, BrokerError, Delivery, DeliveryChannel, DeliveryTag, MessageSource,
    OutboundMessage, QueueDepth,
};

/// A message sitting in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Exchange it was published to.
    pub exchange: String,
    /// Routing key it was published with.
    pub routing_key: String,
    /// Body.
    pub body: Vec<u8>,
    /// Headers.
    pub headers: BTreeMap<String, String>,
    /// Whether it has been delivered before.
    pub redelivered: bool,
}

/// Counters since the broker was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Messages accepted by `publish` or `enqueue`.
    pub published: u64,
    /// Published messages no binding matched.
    pub unroutable: u64,
    /// Deliveries handed to consumers.
    pub delivered: u64,
    /// Deliveries acknowledged.
    pub acked: u64,
    /// Deliveries nacked with requeue.
    pub requeued: u64,
    /// Deliveries nacked without requeue.
    pub discarded: u64,
}

struct Unacked {
    consumer: u64,
    queue: String,
    message: QueuedMessage,
    _credit: OwnedSemaphorePermit,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<QueuedMessage>>,
    unacked: HashMap<DeliveryTag, Unacked>,
    next_tag: DeliveryTag,
    closed: bool,
    stats: BrokerStats,
}

struct Shared {
    topology: BrokerTopology,
    state: Mutex<State>,
    available: Notify,
    next_consumer: AtomicU64,
}

impl Shared {
    fn wake(&self) {
        self.available.notify_waiters();
    }

    fn publish(&self, message: OutboundMessage) -> Result<usize, BrokerError> {
        let queues = self
            .topology
            .route(&message.exchange, &message.routing_key)?;

        let mut state = self.state.lock();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        state.stats.published += 1;
        if queues.is_empty() {
            state.stats.unroutable += 1;
            debug!(
                exchange = %message.exchange,
                routing_key = %message.routing_key,
                "Unroutable message dropped"
            );
            return Ok(0);
        }

        let queued = QueuedMessage {
            exchange: message.exchange,
            routing_key: message.routing_key,
            body: message.body,
            headers: message.headers,
            redelivered: false,
        };
        for queue in &queues {
            state
                .queues
                .entry((*queue).to_string())
                .or_default()
                .push_back(queued.clone());
        }
        drop(state);

        self.wake();
        Ok(queues.len())
    }
}

/// Shared in-process broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("consumer_queue", &self.shared.topology.consumer_queue())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl InMemoryBroker {
    /// Create a broker with the given topology and empty queues.
    #[must_use]
    pub fn new(topology: BrokerTopology) -> Self {
        let mut state = State::default();
        for queue in topology.queues() {
            state.queues.insert(queue.to_string(), VecDeque::new());
        }
        Self {
            shared: Arc::new(Shared {
                topology,
                state: Mutex::new(state),
                available: Notify::new(),
                next_consumer: AtomicU64::new(1),
            }),
        }
    }

    /// Declared topology.
    #[must_use]
    pub fn topology(&self) -> &BrokerTopology {
        &self.shared.topology
    }

    /// Publish to an exchange. Returns the number of queues it reached.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::UnknownExchange`] or [`BrokerError::Closed`].
    pub fn publish(&self, message: OutboundMessage) -> Result<usize, BrokerError> {
        self.shared.publish(message)
    }

    /// Put a body directly on the consumer queue, bypassing exchanges.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Closed`] if the broker is closed.
    pub fn enqueue(&self, body: impl Into<Vec<u8>>) -> Result<(), BrokerError> {
        let queue = self.shared.topology.consumer_queue().to_string();
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        state.stats.published += 1;
        state.queues.entry(queue).or_default().push_back(QueuedMessage {
            exchange: String::new(),
            routing_key: self.shared.topology.consumer_queue().to_string(),
            body: body.into(),
            headers: BTreeMap::new(),
            redelivered: false,
        });
        drop(state);

        self.shared.wake();
        Ok(())
    }

    /// Stop accepting publishes. Consumers drain what is queued, then
    /// their sources end.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.wake();
        debug!("In-memory broker closed");
    }

    /// Counters.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        self.shared.state.lock().stats
    }

    /// Messages waiting in the dead-letter queue.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<QueuedMessage> {
        self.queued(self.shared.topology.dead_letter_queue())
    }

    /// Messages waiting in a queue.
    #[must_use]
    pub fn queued(&self, queue: &str) -> Vec<QueuedMessage> {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether the consumer queue is empty and nothing is awaiting
    /// settlement.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.backlog() == 0 && self.unacked() == 0
    }
}

impl QueueDepth for InMemoryBroker {
    fn backlog(&self) -> usize {
        let state = self.shared.state.lock();
        state
            .queues
            .get(self.shared.topology.consumer_queue())
            .map_or(0, VecDeque::len)
    }

    fn unacked(&self) -> usize {
        self.shared.state.lock().unacked.len()
    }
}

#[async_trait]
impl BrokerConnection for InMemoryBroker {
    type Consumer = InMemoryConsumer;

    async fn open_consumer(&self, prefetch: u16) -> Result<InMemoryConsumer, BrokerError> {
        if self.shared.state.lock().closed {
            return Err(BrokerError::Closed);
        }
        let id = self.shared.next_consumer.fetch_add(1, Ordering::Relaxed);
        let consumer = InMemoryConsumer {
            id,
            tag: format!("persister-{}", uuid::Uuid::new_v4()),
            queue: self.shared.topology.consumer_queue().to_string(),
            credit: Arc::new(Semaphore::new(usize::from(prefetch.max(1)))),
            shared: Arc::clone(&self.shared),
        };
        debug!(consumer_tag = %consumer.tag, prefetch, "Consumer opened");
        Ok(consumer)
    }
}

// =============================================================================
// Consumer
// =============================================================================

/// One consumer on the persister queue.
pub struct InMemoryConsumer {
    id: u64,
    tag: String,
    queue: String,
    credit: Arc<Semaphore>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for InMemoryConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryConsumer")
            .field("tag", &self.tag)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl InMemoryConsumer {
    fn take_unacked(&self, state: &mut State, tag: DeliveryTag) -> Result<Unacked, BrokerError> {
        match state.unacked.get(&tag) {
            Some(entry) if entry.consumer == self.id => {}
            _ => return Err(BrokerError::UnknownDeliveryTag { tag }),
        }
        state
            .unacked
            .remove(&tag)
            .ok_or(BrokerError::UnknownDeliveryTag { tag })
    }
}

#[async_trait]
impl MessageSource for InMemoryConsumer {
    async fn next_delivery(&self) -> Option<Delivery> {
        let credit = Arc::clone(&self.credit).acquire_owned().await.ok()?;

        loop {
            let available = self.shared.available.notified();
            tokio::pin!(available);
            available.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                let next = state.queues.get_mut(&self.queue).and_then(VecDeque::pop_front);
                if let Some(message) = next {
                    state.next_tag += 1;
                    let tag = state.next_tag;
                    state.stats.delivered += 1;
                    let delivery = Delivery {
                        tag,
                        body: message.body.clone(),
                        exchange: message.exchange.clone(),
                        routing_key: message.routing_key.clone(),
                        redelivered: message.redelivered,
                    };
                    state.unacked.insert(
                        tag,
                        Unacked {
                            consumer: self.id,
                            queue: self.queue.clone(),
                            message,
                            _credit: credit,
                        },
                    );
                    trace!(consumer_tag = %self.tag, delivery_tag = tag, "Delivered");
                    return Some(delivery);
                }
                if state.closed {
                    return None;
                }
            }

            available.await;
        }
    }

    fn consumer_tag(&self) -> &str {
        &self.tag
    }
}

#[async_trait]
impl DeliveryChannel for InMemoryConsumer {
    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        let mut state = self.shared.state.lock();
        self.take_unacked(&mut state, tag)?;
        state.stats.acked += 1;
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.shared.state.lock();
        let entry = self.take_unacked(&mut state, tag)?;
        if requeue {
            state.stats.requeued += 1;
            let mut message = entry.message;
            message.redelivered = true;
            state.queues.entry(entry.queue).or_default().push_front(message);
            drop(state);
            self.shared.wake();
        } else {
            state.stats.discarded += 1;
        }
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        let exchange = message.exchange.clone();
        match self.shared.publish(message)? {
            0 => Err(BrokerError::PublishFailed {
                exchange,
                message: "no queue bound for routing key".to_string(),
            }),
            _ => Ok(()),
        }
    }
}
