//! Testing utilities for the bridge.
//!
//! Provides [`MemoryBroker`], an in-memory implementation of the broker
//! collaborator traits: direct-exchange routing, per-queue ready/unacked
//! bookkeeping, consumer dispatch honoring prefetch, broker-initiated
//! cancellation via [`delete_queue`](MemoryBroker::delete_queue), and
//! failure injection for connection establishment. Deliveries are pushed to
//! registered handlers in publish order, which keeps tests deterministic.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::broker::{BrokerChannel, BrokerConnection, BrokerConnector, ConsumerHandler};
use crate::error::BridgeError;
use crate::message::{Delivery, MessageProperties};
use crate::topology::{
    BindingSpecification, ExchangeSpecification, QueueDeclareOk, QueueSpecification,
};

/// One message at rest in a queue.
#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
}

/// A delivery awaiting settlement on some channel.
#[derive(Debug, Clone)]
struct UnackedEntry {
    queue: String,
    consumer_tag: String,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    consumer_tags: Vec<String>,
    /// Re-entrancy guard for the dispatch loop.
    dispatching: bool,
}

struct ConsumerState {
    queue: String,
    auto_ack: bool,
    handler: Arc<dyn ConsumerHandler>,
    channel: Arc<ChannelCore>,
}

/// Channel-scoped broker state.
struct ChannelCore {
    open: AtomicBool,
    prefetch: Mutex<Option<u16>>,
    confirm_mode: AtomicBool,
    next_delivery_tag: AtomicU64,
    unacked: Mutex<HashMap<u64, UnackedEntry>>,
}

impl ChannelCore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
            prefetch: Mutex::new(None),
            confirm_mode: AtomicBool::new(false),
            next_delivery_tag: AtomicU64::new(1),
            unacked: Mutex::new(HashMap::new()),
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn unacked_for(&self, consumer_tag: &str) -> usize {
        self.unacked
            .lock()
            .values()
            .filter(|entry| entry.consumer_tag == consumer_tag)
            .count()
    }
}

struct BrokerInner {
    connect_attempts: AtomicU64,
    fail_connects: Arc<AtomicBool>,
    next_consumer_id: AtomicU64,
    next_queue_id: AtomicU64,
    queues: Mutex<HashMap<String, QueueState>>,
    exchanges: Mutex<HashMap<String, ExchangeSpecification>>,
    bindings: Mutex<Vec<BindingSpecification>>,
    consumers: Mutex<HashMap<String, ConsumerState>>,
    channels: Mutex<Vec<Arc<ChannelCore>>>,
}

impl BrokerInner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            connect_attempts: AtomicU64::new(0),
            fail_connects: Arc::new(AtomicBool::new(false)),
            next_consumer_id: AtomicU64::new(1),
            next_queue_id: AtomicU64::new(1),
            queues: Mutex::new(HashMap::new()),
            exchanges: Mutex::new(HashMap::new()),
            bindings: Mutex::new(Vec::new()),
            consumers: Mutex::new(HashMap::new()),
            channels: Mutex::new(Vec::new()),
        })
    }

    /// Routes one message to its destination queues.
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, BridgeError> {
        if exchange.is_empty() {
            // Default exchange: routing key names the queue. Unroutable
            // messages are silently discarded, as without `mandatory`.
            return Ok(if self.queues.lock().contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }
        if !self.exchanges.lock().contains_key(exchange) {
            return Err(BridgeError::BrokerOperationFailed(format!(
                "no exchange '{exchange}'"
            )));
        }
        let queues = self.queues.lock();
        Ok(self
            .bindings
            .lock()
            .iter()
            .filter(|b| b.exchange == exchange && b.routing_key == routing_key)
            .filter(|b| queues.contains_key(&b.queue))
            .map(|b| b.queue.clone())
            .collect())
    }

    /// Picks the next (handler, delivery) pair for `queue`, or `None` when
    /// no ready message can be delivered right now.
    fn next_step(&self, queue: &str) -> Option<(Arc<dyn ConsumerHandler>, Delivery)> {
        let mut queues = self.queues.lock();
        let consumers = self.consumers.lock();
        let q = queues.get_mut(queue)?;
        if q.ready.is_empty() {
            return None;
        }

        // Drop registrations whose channel has gone away.
        q.consumer_tags
            .retain(|tag| consumers.get(tag).is_some_and(|c| c.channel.is_open()));

        let tag = q
            .consumer_tags
            .iter()
            .find(|tag| {
                let consumer = &consumers[*tag];
                if consumer.auto_ack {
                    return true;
                }
                match *consumer.channel.prefetch.lock() {
                    Some(limit) if limit > 0 => consumer.channel.unacked_for(tag) < limit as usize,
                    _ => true,
                }
            })?
            .clone();
        let consumer = &consumers[&tag];

        let message = q.ready.pop_front()?;
        let delivery_tag = consumer
            .channel
            .next_delivery_tag
            .fetch_add(1, Ordering::Relaxed);
        if !consumer.auto_ack {
            consumer.channel.unacked.lock().insert(
                delivery_tag,
                UnackedEntry {
                    queue: queue.to_string(),
                    consumer_tag: tag.clone(),
                    message: message.clone(),
                },
            );
        }
        let delivery = Delivery {
            consumer_tag: tag.clone(),
            delivery_tag,
            exchange: message.exchange,
            routing_key: message.routing_key,
            redelivered: message.redelivered,
            properties: message.properties,
            body: message.body,
        };
        Some((Arc::clone(&consumer.handler), delivery))
    }

    fn has_deliverable(&self, queue: &str) -> bool {
        let queues = self.queues.lock();
        let consumers = self.consumers.lock();
        let Some(q) = queues.get(queue) else {
            return false;
        };
        !q.ready.is_empty()
            && q.consumer_tags.iter().any(|tag| {
                consumers.get(tag).is_some_and(|c| {
                    c.channel.is_open()
                        && (c.auto_ack
                            || match *c.channel.prefetch.lock() {
                                Some(limit) if limit > 0 => {
                                    c.channel.unacked_for(tag) < limit as usize
                                }
                                _ => true,
                            })
                })
            })
    }

    /// Delivers ready messages to consumers until the queue drains or every
    /// consumer is at capacity. Re-entrant calls (an ack issued inside a
    /// delivery callback) return immediately; the active loop picks the
    /// freed capacity up on its next pass.
    async fn dispatch(self: &Arc<Self>, queue: &str) {
        loop {
            {
                let mut queues = self.queues.lock();
                let Some(q) = queues.get_mut(queue) else {
                    return;
                };
                if q.dispatching {
                    return;
                }
                q.dispatching = true;
            }

            while let Some((handler, delivery)) = self.next_step(queue) {
                handler.on_delivery(delivery).await;
            }

            if let Some(q) = self.queues.lock().get_mut(queue) {
                q.dispatching = false;
            }
            if !self.has_deliverable(queue) {
                return;
            }
        }
    }

    /// Closes a channel: removes its consumers and requeues its unacked
    /// deliveries in tag order.
    async fn close_channel(self: &Arc<Self>, core: &Arc<ChannelCore>) {
        if !core.open.swap(false, Ordering::AcqRel) {
            return;
        }

        let orphan_tags: Vec<String> = {
            let mut consumers = self.consumers.lock();
            let tags: Vec<String> = consumers
                .iter()
                .filter(|(_, c)| Arc::ptr_eq(&c.channel, core))
                .map(|(tag, _)| tag.clone())
                .collect();
            for tag in &tags {
                consumers.remove(tag);
            }
            tags
        };
        {
            let mut queues = self.queues.lock();
            for q in queues.values_mut() {
                q.consumer_tags.retain(|tag| !orphan_tags.contains(tag));
            }
        }

        let mut unacked: Vec<(u64, UnackedEntry)> = core.unacked.lock().drain().collect();
        unacked.sort_by_key(|(tag, _)| *tag);
        let mut touched = Vec::new();
        {
            let mut queues = self.queues.lock();
            for (_, entry) in unacked.into_iter().rev() {
                if let Some(q) = queues.get_mut(&entry.queue) {
                    let mut message = entry.message;
                    message.redelivered = true;
                    q.ready.push_front(message);
                    if !touched.contains(&entry.queue) {
                        touched.push(entry.queue);
                    }
                }
            }
        }
        for queue in touched {
            self.dispatch(&queue).await;
        }
    }
}

// ── Trait implementations ──

struct MemoryConnector {
    inner: Arc<BrokerInner>,
}

#[async_trait]
impl BrokerConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BridgeError> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_connects.load(Ordering::SeqCst) {
            return Err(BridgeError::ConnectionFailed("injected failure".into()));
        }
        Ok(Arc::new(MemoryConnection {
            inner: Arc::clone(&self.inner),
            open: AtomicBool::new(true),
            channels: Mutex::new(Vec::new()),
        }))
    }
}

struct MemoryConnection {
    inner: Arc<BrokerInner>,
    open: AtomicBool,
    channels: Mutex<Vec<Arc<ChannelCore>>>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BridgeError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(BridgeError::ChannelClosed);
        }
        let core = ChannelCore::new();
        self.channels.lock().push(Arc::clone(&core));
        self.inner.channels.lock().push(Arc::clone(&core));
        Ok(Arc::new(MemoryChannel {
            inner: Arc::clone(&self.inner),
            core,
        }))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), BridgeError> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let channels: Vec<Arc<ChannelCore>> = self.channels.lock().drain(..).collect();
        for core in channels {
            self.inner.close_channel(&core).await;
        }
        Ok(())
    }
}

struct MemoryChannel {
    inner: Arc<BrokerInner>,
    core: Arc<ChannelCore>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BridgeError> {
        if self.core.is_open() {
            Ok(())
        } else {
            Err(BridgeError::ChannelClosed)
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn basic_consume(
        &self,
        queue: &str,
        auto_ack: bool,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<String, BridgeError> {
        self.ensure_open()?;
        if !self.inner.queues.lock().contains_key(queue) {
            return Err(BridgeError::BrokerOperationFailed(format!(
                "no queue '{queue}'"
            )));
        }
        let tag = format!(
            "ctag-{}",
            self.inner.next_consumer_id.fetch_add(1, Ordering::Relaxed)
        );
        self.inner.consumers.lock().insert(
            tag.clone(),
            ConsumerState {
                queue: queue.to_string(),
                auto_ack,
                handler,
                channel: Arc::clone(&self.core),
            },
        );
        if let Some(q) = self.inner.queues.lock().get_mut(queue) {
            q.consumer_tags.push(tag.clone());
        }
        self.inner.dispatch(queue).await;
        Ok(tag)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BridgeError> {
        self.ensure_open()?;
        let removed = self.inner.consumers.lock().remove(consumer_tag);
        if let Some(consumer) = removed {
            if let Some(q) = self.inner.queues.lock().get_mut(&consumer.queue) {
                q.consumer_tags.retain(|tag| tag != consumer_tag);
            }
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: &MessageProperties,
        body: &[u8],
    ) -> Result<(), BridgeError> {
        self.ensure_open()?;
        let destinations = self.inner.route(exchange, routing_key)?;
        for queue in &destinations {
            if let Some(q) = self.inner.queues.lock().get_mut(queue) {
                q.ready.push_back(StoredMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    properties: properties.clone(),
                    body: body.to_vec(),
                    redelivered: false,
                });
            }
        }
        for queue in destinations {
            self.inner.dispatch(&queue).await;
        }
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BridgeError> {
        self.ensure_open()?;
        let entry = self.core.unacked.lock().remove(&delivery_tag);
        if let Some(entry) = entry {
            self.inner.dispatch(&entry.queue).await;
        }
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BridgeError> {
        self.ensure_open()?;
        let entry = self.core.unacked.lock().remove(&delivery_tag);
        if let Some(entry) = entry {
            if requeue {
                if let Some(q) = self.inner.queues.lock().get_mut(&entry.queue) {
                    let mut message = entry.message;
                    message.redelivered = true;
                    q.ready.push_front(message);
                }
            }
            self.inner.dispatch(&entry.queue).await;
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BridgeError> {
        self.ensure_open()?;
        *self.core.prefetch.lock() = Some(prefetch_count);
        Ok(())
    }

    async fn exchange_declare(&self, spec: &ExchangeSpecification) -> Result<(), BridgeError> {
        self.ensure_open()?;
        if spec.name.is_empty() {
            return Err(BridgeError::BrokerOperationFailed(
                "cannot declare the default exchange".into(),
            ));
        }
        self.inner
            .exchanges
            .lock()
            .insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    async fn queue_declare(
        &self,
        spec: &QueueSpecification,
    ) -> Result<QueueDeclareOk, BridgeError> {
        self.ensure_open()?;
        let name = if spec.name.is_empty() {
            format!(
                "amq.gen-{}",
                self.inner.next_queue_id.fetch_add(1, Ordering::Relaxed)
            )
        } else {
            spec.name.clone()
        };
        let mut queues = self.inner.queues.lock();
        let q = queues.entry(name.clone()).or_default();
        Ok(QueueDeclareOk {
            queue: name,
            message_count: q.ready.len() as u64,
            consumer_count: q.consumer_tags.len() as u32,
        })
    }

    async fn queue_bind(&self, spec: &BindingSpecification) -> Result<(), BridgeError> {
        self.ensure_open()?;
        if !self.inner.exchanges.lock().contains_key(&spec.exchange) {
            return Err(BridgeError::BrokerOperationFailed(format!(
                "no exchange '{}'",
                spec.exchange
            )));
        }
        if !self.inner.queues.lock().contains_key(&spec.queue) {
            return Err(BridgeError::BrokerOperationFailed(format!(
                "no queue '{}'",
                spec.queue
            )));
        }
        self.inner.bindings.lock().push(spec.clone());
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), BridgeError> {
        self.ensure_open()?;
        self.core.confirm_mode.store(true, Ordering::Release);
        Ok(())
    }

    async fn wait_for_confirms(&self) -> Result<bool, BridgeError> {
        self.ensure_open()?;
        if !self.core.confirm_mode.load(Ordering::Acquire) {
            return Err(BridgeError::BrokerOperationFailed(
                "confirms not enabled on this channel".into(),
            ));
        }
        // Publishes are applied synchronously, so everything published is
        // already confirmed.
        Ok(true)
    }

    fn is_open(&self) -> bool {
        self.core.is_open()
    }

    async fn close(&self) -> Result<(), BridgeError> {
        self.inner.close_channel(&self.core).await;
        Ok(())
    }
}

// ── Public test surface ──

/// In-memory broker implementing the collaborator traits.
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,

    /// When `true`, every connect attempt fails with `ConnectionFailed`.
    pub fail_connects: Arc<AtomicBool>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        let inner = BrokerInner::new();
        let fail_connects = Arc::clone(&inner.fail_connects);
        Self {
            inner,
            fail_connects,
        }
    }

    /// Returns a connector handle for `Receiver::new` / `Sender::new`.
    #[must_use]
    pub fn connector(&self) -> Arc<dyn BrokerConnector> {
        Arc::new(MemoryConnector {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Connects immediately, for test fixtures that need a raw connection.
    ///
    /// # Panics
    ///
    /// Panics if connect-failure injection is active.
    pub async fn connect_now(&self) -> Arc<dyn BrokerConnection> {
        self.connector().connect().await.expect("connect")
    }

    /// Number of connect attempts observed so far.
    #[must_use]
    pub fn connect_attempts(&self) -> u64 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Messages ready (undelivered) in `queue`.
    #[must_use]
    pub fn ready_count(&self, queue: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Deliveries of `queue` awaiting settlement across all channels.
    #[must_use]
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner
            .channels
            .lock()
            .iter()
            .map(|core| {
                core.unacked
                    .lock()
                    .values()
                    .filter(|entry| entry.queue == queue)
                    .count()
            })
            .sum()
    }

    /// Returns `true` if a consumer with this tag is registered.
    #[must_use]
    pub fn has_consumer(&self, consumer_tag: &str) -> bool {
        self.inner.consumers.lock().contains_key(consumer_tag)
    }

    /// Number of currently open channels.
    #[must_use]
    pub fn open_channel_count(&self) -> usize {
        self.inner
            .channels
            .lock()
            .iter()
            .filter(|core| core.is_open())
            .count()
    }

    /// Prefetch limit of the channel backing a consumer, if set.
    #[must_use]
    pub fn prefetch_for_consumer(&self, consumer_tag: &str) -> Option<u16> {
        let consumers = self.inner.consumers.lock();
        let consumer = consumers.get(consumer_tag)?;
        let prefetch = *consumer.channel.prefetch.lock();
        prefetch
    }

    /// Returns `true` if the exchange exists (a passive declare).
    #[must_use]
    pub fn has_exchange(&self, name: &str) -> bool {
        self.inner.exchanges.lock().contains_key(name)
    }

    /// Returns `true` if the queue exists (a passive declare).
    #[must_use]
    pub fn has_queue(&self, name: &str) -> bool {
        self.inner.queues.lock().contains_key(name)
    }

    /// Deletes a queue, revoking its consumers through their cancel
    /// callbacks. This is the broker-initiated termination path.
    pub async fn delete_queue(&self, queue: &str) {
        let tags: Vec<String> = self
            .inner
            .queues
            .lock()
            .get(queue)
            .map(|q| q.consumer_tags.clone())
            .unwrap_or_default();

        let mut revoked = Vec::new();
        {
            let mut consumers = self.inner.consumers.lock();
            for tag in tags {
                if let Some(consumer) = consumers.remove(&tag) {
                    revoked.push((tag, consumer.handler));
                }
            }
        }
        self.inner.queues.lock().remove(queue);
        for (tag, handler) in revoked {
            handler.on_cancel(&tag).await;
        }
    }

    /// Yields until in-flight dispatch work settles.
    ///
    /// Dispatch runs synchronously inside publish/ack calls, so a few
    /// scheduler yields are enough for callbacks spawned during teardown.
    pub async fn wait_for_idle(&self) {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("queues", &self.inner.queues.lock().len())
            .field("consumers", &self.inner.consumers.lock().len())
            .field("open_channels", &self.open_channel_count())
            .finish()
    }
}
