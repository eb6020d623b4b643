//! Broker-to-stream bridging.
//!
//! [`Receiver`] adapts broker-pushed deliveries into pull-compatible
//! [`DeliveryStream`]s. Three consumption modes share one adapter:
//!
//! - **No-ack**: the broker settles at delivery time; the stream carries
//!   plain [`Delivery`] values.
//! - **Auto-ack**: the broker requires explicit settlement; the adapter
//!   acks each delivery right after wrapping it and re-exposes it as a
//!   plain [`Delivery`]. At-most-once: a caller failure after receipt
//!   still loses the message.
//! - **Manual-ack**: the stream carries [`AcknowledgableDelivery`] so the
//!   caller controls ack/nack timing, enabling batched or delayed
//!   settlement.
//!
//! Deliveries arrive on the broker client's I/O tasks; emission never
//! blocks them. The configured [`OverflowStrategy`] decides what happens
//! when the subscriber falls behind. Teardown from any origin (subscriber
//! disposal, broker-initiated cancel, an error) converges on one
//! idempotent state machine that cancels the consumer and closes the
//! channel exactly once.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::{BrokerChannel, BrokerConnector, ConsumerHandler};
use crate::connection::ConnectionCell;
use crate::error::BridgeError;
use crate::message::{AcknowledgableDelivery, Delivery};
use crate::metrics::{ReceiverMetrics, ReceiverMetricsSnapshot};
use crate::options::{ConsumeOptions, EmitHook, EmitterState, OverflowStrategy, StopCondition};

// ── Teardown state machine ──

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Exactly-once teardown of one consumer registration and its channel.
///
/// Triggered from three independent origins (subscriber disposal, broker
/// cancel, emit error); the open → closing → closed transition guarantees
/// the broker-side cancel and channel close run once regardless of which
/// origin fires first. Teardown failures are reported as warnings and never
/// escape the disposal path.
struct TeardownGuard {
    state: AtomicU8,
    channel: Arc<dyn BrokerChannel>,
    consumer_tag: Mutex<Option<String>>,
}

impl TeardownGuard {
    fn new(channel: Arc<dyn BrokerChannel>) -> Self {
        Self {
            state: AtomicU8::new(STATE_OPEN),
            channel,
            consumer_tag: Mutex::new(None),
        }
    }

    fn set_consumer_tag(&self, tag: String) {
        *self.consumer_tag.lock() = Some(tag);
    }

    async fn teardown(&self) {
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let tag = self.consumer_tag.lock().take();
        if let Some(tag) = tag {
            if self.channel.is_open() {
                if let Err(err) = self.channel.basic_cancel(&tag).await {
                    warn!(
                        consumer_tag = %tag,
                        error = %BridgeError::TeardownFailed(err.to_string()),
                        "failed to cancel consumer during teardown"
                    );
                }
            }
        }
        if self.channel.is_open() {
            if let Err(err) = self.channel.close().await {
                warn!(
                    error = %BridgeError::TeardownFailed(err.to_string()),
                    "failed to close channel during teardown"
                );
            }
        }
        self.state.store(STATE_CLOSED, Ordering::Release);
    }

    /// Best-effort teardown from a non-async context (stream drop).
    fn spawn_teardown(self: &Arc<Self>) {
        if self.state.load(Ordering::Acquire) != STATE_OPEN {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let guard = Arc::clone(self);
            handle.spawn(async move { guard.teardown().await });
        } else {
            warn!("delivery stream dropped outside a runtime; channel teardown skipped");
        }
    }
}

// ── Emitter ──

enum EmitterTx<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

enum EmitterRx<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

impl<T> EmitterRx<T> {
    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        match self {
            EmitterRx::Bounded(rx) => rx.poll_recv(cx),
            EmitterRx::Unbounded(rx) => rx.poll_recv(cx),
        }
    }
}

/// Outcome of one emission attempt.
enum EmitOutcome {
    /// The delivery entered the stream buffer.
    Emitted,
    /// The delivery was discarded (drop strategy, or stream already
    /// terminated).
    Dropped,
    /// The buffer was full under the error strategy; the stream is now
    /// terminating.
    Overflowed,
}

/// Push side of one delivery stream, applying the overflow policy between
/// the broker callback task and the subscriber.
struct Emitter<T> {
    tx: Mutex<Option<EmitterTx<T>>>,
    strategy: OverflowStrategy,
    emitted: AtomicU64,
    dropped: AtomicU64,
    terminal: Arc<Mutex<Option<BridgeError>>>,
    metrics: Arc<ReceiverMetrics>,
}

impl<T> Emitter<T> {
    fn new(
        strategy: OverflowStrategy,
        capacity: usize,
        metrics: Arc<ReceiverMetrics>,
    ) -> (Arc<Self>, EmitterRx<T>, Arc<Mutex<Option<BridgeError>>>) {
        let (tx, rx) = match strategy {
            OverflowStrategy::Buffer => {
                let (tx, rx) = mpsc::unbounded_channel();
                (EmitterTx::Unbounded(tx), EmitterRx::Unbounded(rx))
            }
            OverflowStrategy::Drop | OverflowStrategy::Error => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (EmitterTx::Bounded(tx), EmitterRx::Bounded(rx))
            }
        };
        let terminal = Arc::new(Mutex::new(None));
        let emitter = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            strategy,
            emitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            terminal: Arc::clone(&terminal),
            metrics,
        });
        (emitter, rx, terminal)
    }

    fn state(&self) -> EmitterState {
        EmitterState {
            emitted: self.emitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Emits one item without blocking the caller.
    fn emit(&self, item: T) -> EmitOutcome {
        let mut tx = self.tx.lock();
        let Some(sender) = tx.as_ref() else {
            return EmitOutcome::Dropped;
        };
        match sender {
            EmitterTx::Unbounded(sender) => {
                if sender.send(item).is_err() {
                    *tx = None;
                    return EmitOutcome::Dropped;
                }
            }
            EmitterTx::Bounded(sender) => match sender.try_send(item) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if self.strategy == OverflowStrategy::Error {
                        *self.terminal.lock() = Some(BridgeError::Overflowed);
                        self.metrics.record_stream_error();
                        *tx = None;
                        return EmitOutcome::Overflowed;
                    }
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    self.metrics.record_dropped();
                    debug!("subscriber behind, delivery dropped");
                    return EmitOutcome::Dropped;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    *tx = None;
                    return EmitOutcome::Dropped;
                }
            },
        }
        self.emitted.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_emitted();
        EmitOutcome::Emitted
    }

    /// Completes the stream cleanly.
    fn complete(&self) {
        *self.tx.lock() = None;
    }

    /// Terminates the stream with an error as its final signal.
    fn fail(&self, err: BridgeError) {
        *self.terminal.lock() = Some(err);
        self.metrics.record_stream_error();
        *self.tx.lock() = None;
    }
}

// ── Consumer bridges ──

/// Shared emission step: hook, emit, stop condition, error convergence.
///
/// The stop condition is evaluated against the state the stream will have
/// once the current delivery is emitted, so "stop after N" predicates see
/// `emitted == N` for the Nth delivery.
async fn emit_delivery<T>(
    emitter: &Emitter<T>,
    guard: &Arc<TeardownGuard>,
    hook: Option<&EmitHook>,
    stop: Option<&StopCondition>,
    raw: &Delivery,
    item: T,
) {
    let state = emitter.state();
    if let Some(hook) = hook {
        if !hook.as_ref()(&state, raw) {
            return;
        }
    }

    let stop_requested = stop.is_some_and(|stop| {
        let after = EmitterState {
            emitted: state.emitted + 1,
            ..state
        };
        stop.as_ref()(&after, raw)
    });

    match emitter.emit(item) {
        EmitOutcome::Emitted => {
            if stop_requested {
                emitter.complete();
                guard.teardown().await;
            }
        }
        EmitOutcome::Dropped => {}
        EmitOutcome::Overflowed => guard.teardown().await,
    }
}

/// Handler for the no-ack and auto-ack modes (plain `Delivery` items).
struct PlainBridge {
    emitter: Arc<Emitter<Delivery>>,
    guard: Arc<TeardownGuard>,
    hook: Option<EmitHook>,
    stop: Option<StopCondition>,
    /// In auto-ack mode, the channel to settle each delivery on before
    /// emission.
    ack_channel: Option<Arc<dyn BrokerChannel>>,
    metrics: Arc<ReceiverMetrics>,
}

#[async_trait]
impl ConsumerHandler for PlainBridge {
    async fn on_delivery(&self, delivery: Delivery) {
        if let Some(channel) = &self.ack_channel {
            // Settle before exposing; a subscriber failure after this
            // point loses the message.
            if let Err(err) = channel.basic_ack(delivery.delivery_tag).await {
                self.emitter
                    .fail(BridgeError::BrokerOperationFailed(err.to_string()));
                self.guard.teardown().await;
                return;
            }
            self.metrics.record_auto_ack();
        }
        let raw = delivery.clone();
        emit_delivery(
            &self.emitter,
            &self.guard,
            self.hook.as_ref(),
            self.stop.as_ref(),
            &raw,
            delivery,
        )
        .await;
    }

    async fn on_cancel(&self, consumer_tag: &str) {
        info!(consumer_tag, "consumer cancelled by broker");
        self.emitter.complete();
        self.guard.teardown().await;
    }
}

/// Handler for the manual-ack mode (`AcknowledgableDelivery` items).
struct ManualBridge {
    emitter: Arc<Emitter<AcknowledgableDelivery>>,
    guard: Arc<TeardownGuard>,
    hook: Option<EmitHook>,
    stop: Option<StopCondition>,
    channel: Arc<dyn BrokerChannel>,
}

#[async_trait]
impl ConsumerHandler for ManualBridge {
    async fn on_delivery(&self, delivery: Delivery) {
        let raw = delivery.clone();
        let ackable = AcknowledgableDelivery::new(delivery, Arc::clone(&self.channel));
        emit_delivery(
            &self.emitter,
            &self.guard,
            self.hook.as_ref(),
            self.stop.as_ref(),
            &raw,
            ackable,
        )
        .await;
    }

    async fn on_cancel(&self, consumer_tag: &str) {
        info!(consumer_tag, "consumer cancelled by broker");
        self.emitter.complete();
        self.guard.teardown().await;
    }
}

// ── Delivery stream ──

/// Pull-compatible stream of broker deliveries.
///
/// Yields `Ok(item)` per delivery; terminates with a single `Err(..)` on a
/// mid-stream failure, or ends cleanly on broker-initiated cancellation and
/// stop conditions. Dropping the stream tears the consumer and channel down
/// best-effort in the background; [`dispose`](Self::dispose) does the same
/// deterministically.
pub struct DeliveryStream<T> {
    rx: EmitterRx<T>,
    terminal: Arc<Mutex<Option<BridgeError>>>,
    guard: Arc<TeardownGuard>,
    consumer_tag: String,
    finished: bool,
}

impl<T> DeliveryStream<T> {
    /// Returns the broker-assigned consumer tag of this subscription.
    #[must_use]
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Cancels the broker consumer and closes the channel, waiting for the
    /// teardown requests to be issued. Idempotent: disposal after
    /// completion, error, or a previous disposal is a no-op.
    pub async fn dispose(self) {
        self.guard.teardown().await;
    }
}

impl<T> Stream for DeliveryStream<T> {
    type Item = Result<T, BridgeError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(item)) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(None) => {
                this.finished = true;
                match this.terminal.lock().take() {
                    Some(err) => Poll::Ready(Some(Err(err))),
                    None => Poll::Ready(None),
                }
            }
        }
    }
}

impl<T> Drop for DeliveryStream<T> {
    fn drop(&mut self) {
        self.guard.spawn_teardown();
    }
}

impl<T> std::fmt::Debug for DeliveryStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryStream")
            .field("consumer_tag", &self.consumer_tag)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

// ── Receiver ──

/// Bridge from broker deliveries to asynchronous streams.
///
/// Lazily establishes one shared connection on first use; every consume
/// call opens its own exclusively-owned channel.
pub struct Receiver {
    cell: ConnectionCell,
    metrics: Arc<ReceiverMetrics>,
}

impl Receiver {
    /// Creates a receiver over the given broker connector. No connection
    /// is established until the first consume call.
    #[must_use]
    pub fn new(connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            cell: ConnectionCell::new(connector),
            metrics: Arc::new(ReceiverMetrics::new()),
        }
    }

    /// Consumes `queue` in no-ack mode: the broker settles each delivery
    /// at delivery time. Default overflow strategy:
    /// [`OverflowStrategy::Drop`].
    ///
    /// # Errors
    ///
    /// Fails the subscription immediately if the connection, channel, or
    /// consumer registration cannot be established.
    pub async fn consume_no_ack(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream<Delivery>, BridgeError> {
        let channel = self.open_channel().await?;
        let strategy = options.overflow_or(OverflowStrategy::Drop);
        let (emitter, rx, terminal) = Emitter::new(
            strategy,
            options.buffer_capacity_or_default(),
            Arc::clone(&self.metrics),
        );
        let guard = Arc::new(TeardownGuard::new(Arc::clone(&channel)));
        let handler = Arc::new(PlainBridge {
            emitter,
            guard: Arc::clone(&guard),
            hook: options.emit_hook_fn().cloned(),
            stop: options.stop_condition_fn().cloned(),
            ack_channel: None,
            metrics: Arc::clone(&self.metrics),
        });

        let tag = self
            .register(queue, &channel, true, handler, &guard, strategy)
            .await?;
        Ok(DeliveryStream {
            rx,
            terminal,
            guard,
            consumer_tag: tag,
            finished: false,
        })
    }

    /// Consumes `queue` in auto-ack mode: each delivery is acknowledged by
    /// the adapter right after it is wrapped, then exposed as a plain
    /// [`Delivery`]. At-most-once: a caller failure after receipt loses the
    /// already-settled message. Default overflow strategy:
    /// [`OverflowStrategy::Buffer`].
    ///
    /// # Errors
    ///
    /// Fails the subscription immediately if the connection, channel, or
    /// consumer registration cannot be established.
    pub async fn consume_auto_ack(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream<Delivery>, BridgeError> {
        let channel = self.open_channel().await?;
        self.apply_qos(&channel, &options).await?;
        let strategy = options.overflow_or(OverflowStrategy::Buffer);
        let (emitter, rx, terminal) = Emitter::new(
            strategy,
            options.buffer_capacity_or_default(),
            Arc::clone(&self.metrics),
        );
        let guard = Arc::new(TeardownGuard::new(Arc::clone(&channel)));
        let handler = Arc::new(PlainBridge {
            emitter,
            guard: Arc::clone(&guard),
            hook: options.emit_hook_fn().cloned(),
            stop: options.stop_condition_fn().cloned(),
            ack_channel: Some(Arc::clone(&channel)),
            metrics: Arc::clone(&self.metrics),
        });

        let tag = self
            .register(queue, &channel, false, handler, &guard, strategy)
            .await?;
        Ok(DeliveryStream {
            rx,
            terminal,
            guard,
            consumer_tag: tag,
            finished: false,
        })
    }

    /// Consumes `queue` in manual-ack mode: the stream carries
    /// [`AcknowledgableDelivery`] and the caller controls settlement
    /// timing. Default overflow strategy: [`OverflowStrategy::Buffer`].
    ///
    /// # Errors
    ///
    /// Fails the subscription immediately if the connection, channel, or
    /// consumer registration cannot be established.
    pub async fn consume_manual_ack(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream<AcknowledgableDelivery>, BridgeError> {
        let channel = self.open_channel().await?;
        self.apply_qos(&channel, &options).await?;
        let strategy = options.overflow_or(OverflowStrategy::Buffer);
        let (emitter, rx, terminal) = Emitter::new(
            strategy,
            options.buffer_capacity_or_default(),
            Arc::clone(&self.metrics),
        );
        let guard = Arc::new(TeardownGuard::new(Arc::clone(&channel)));
        let handler = Arc::new(ManualBridge {
            emitter,
            guard: Arc::clone(&guard),
            hook: options.emit_hook_fn().cloned(),
            stop: options.stop_condition_fn().cloned(),
            channel: Arc::clone(&channel),
        });

        let tag = self
            .register(queue, &channel, false, handler, &guard, strategy)
            .await?;
        Ok(DeliveryStream {
            rx,
            terminal,
            guard,
            consumer_tag: tag,
            finished: false,
        })
    }

    /// Returns a snapshot of the delivery-side counters.
    #[must_use]
    pub fn metrics(&self) -> ReceiverMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Releases the shared connection. Idempotent; outstanding streams keep
    /// their own channels and tear them down through their own disposal
    /// path.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::TeardownFailed`] if the connection close
    /// handshake fails.
    pub async fn close(&self) -> Result<(), BridgeError> {
        self.cell.close().await
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BridgeError> {
        let connection = self.cell.connection().await?;
        connection.create_channel().await
    }

    async fn apply_qos(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        options: &ConsumeOptions,
    ) -> Result<(), BridgeError> {
        let prefetch = options.prefetch_count();
        if prefetch != 0 {
            if let Err(err) = channel.basic_qos(prefetch).await {
                let _ = channel.close().await;
                return Err(err);
            }
        }
        Ok(())
    }

    async fn register(
        &self,
        queue: &str,
        channel: &Arc<dyn BrokerChannel>,
        auto_ack: bool,
        handler: Arc<dyn ConsumerHandler>,
        guard: &Arc<TeardownGuard>,
        strategy: OverflowStrategy,
    ) -> Result<String, BridgeError> {
        match channel.basic_consume(queue, auto_ack, handler).await {
            Ok(tag) => {
                guard.set_consumer_tag(tag.clone());
                info!(consumer_tag = %tag, queue, %strategy, "consumer registered");
                Ok(tag)
            }
            Err(err) => {
                let _ = channel.close().await;
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::OutboundMessage;
    use crate::testing::MemoryBroker;
    use crate::topology::QueueSpecification;
    use futures::StreamExt;
    use std::time::Duration;

    async fn broker_with_queue(queue: &str) -> MemoryBroker {
        let broker = MemoryBroker::new();
        let connection = broker.connect_now().await;
        let channel = connection.create_channel().await.unwrap();
        channel
            .queue_declare(&QueueSpecification::queue(queue))
            .await
            .unwrap();
        channel.close().await.unwrap();
        broker
    }

    async fn publish(broker: &MemoryBroker, queue: &str, n: usize) {
        let connection = broker.connect_now().await;
        let channel = connection.create_channel().await.unwrap();
        for i in 0..n {
            let msg = OutboundMessage::new("", queue, format!("m{i}").into_bytes());
            channel
                .basic_publish(&msg.exchange, &msg.routing_key, &msg.properties, &msg.body)
                .await
                .unwrap();
        }
        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_ack_receives_before_and_after_registration() {
        let broker = broker_with_queue("q").await;
        publish(&broker, "q", 5).await;

        let receiver = Receiver::new(broker.connector());
        let mut stream = receiver
            .consume_no_ack("q", ConsumeOptions::new())
            .await
            .unwrap();

        publish(&broker, "q", 5).await;

        let mut seen = Vec::new();
        for _ in 0..10 {
            let item = tokio::time::timeout(Duration::from_secs(1), stream.next())
                .await
                .expect("delivery within timeout")
                .expect("stream open")
                .expect("no error");
            seen.push(String::from_utf8(item.body).unwrap());
        }
        assert_eq!(seen.len(), 10);
        // Emission order equals delivery order within one registration.
        assert_eq!(seen[0], "m0");
        assert_eq!(seen[4], "m4");

        stream.dispose().await;
        assert_eq!(broker.ready_count("q"), 0);
        assert_eq!(broker.unacked_count("q"), 0);
    }

    #[tokio::test]
    async fn test_manual_ack_settles_with_broker() {
        let broker = broker_with_queue("q").await;
        publish(&broker, "q", 3).await;

        let receiver = Receiver::new(broker.connector());
        let mut stream = receiver
            .consume_manual_ack("q", ConsumeOptions::new())
            .await
            .unwrap();

        for _ in 0..3 {
            let ackable = tokio::time::timeout(Duration::from_secs(1), stream.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            ackable.ack().await.unwrap();
        }
        // All settled: nothing unacked, nothing ready.
        assert_eq!(broker.unacked_count("q"), 0);
        assert_eq!(broker.ready_count("q"), 0);
        stream.dispose().await;
    }

    #[tokio::test]
    async fn test_auto_ack_drains_unacked_without_caller_action() {
        let broker = broker_with_queue("q").await;
        publish(&broker, "q", 4).await;

        let receiver = Receiver::new(broker.connector());
        let mut stream = receiver
            .consume_auto_ack("q", ConsumeOptions::new())
            .await
            .unwrap();

        for i in 0..4 {
            let delivery = tokio::time::timeout(Duration::from_secs(1), stream.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(delivery.body, format!("m{i}").into_bytes());
        }
        assert_eq!(broker.unacked_count("q"), 0);
        assert_eq!(receiver.metrics().auto_acks, 4);
        stream.dispose().await;
    }

    #[tokio::test]
    async fn test_broker_cancel_completes_cleanly() {
        let broker = broker_with_queue("q").await;
        let receiver = Receiver::new(broker.connector());
        let mut stream = receiver
            .consume_no_ack("q", ConsumeOptions::new())
            .await
            .unwrap();

        // Deleting the queue revokes the consumer: clean completion, not an
        // error.
        broker.delete_queue("q").await;
        let end = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_dispose_cancels_consumer_and_closes_channel() {
        let broker = broker_with_queue("q").await;
        let receiver = Receiver::new(broker.connector());
        let stream = receiver
            .consume_no_ack("q", ConsumeOptions::new())
            .await
            .unwrap();
        let tag = stream.consumer_tag().to_string();
        assert!(broker.has_consumer(&tag));

        stream.dispose().await;
        assert!(!broker.has_consumer(&tag));
        assert_eq!(broker.open_channel_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_condition_completes_stream() {
        let broker = broker_with_queue("q").await;
        publish(&broker, "q", 10).await;

        let receiver = Receiver::new(broker.connector());
        let stream = receiver
            .consume_no_ack(
                "q",
                ConsumeOptions::new().stop_condition(|state, _| state.emitted >= 3),
            )
            .await
            .unwrap();

        let items: Vec<_> = tokio::time::timeout(Duration::from_secs(1), stream.collect::<Vec<_>>())
            .await
            .unwrap();
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn test_emit_hook_filters_deliveries() {
        let broker = broker_with_queue("q").await;
        publish(&broker, "q", 6).await;

        let receiver = Receiver::new(broker.connector());
        let mut stream = receiver
            .consume_no_ack(
                "q",
                // Keep only even-numbered bodies.
                ConsumeOptions::new().emit_hook(|_, d| {
                    let n: u32 = String::from_utf8_lossy(&d.body)[1..].parse().unwrap();
                    n % 2 == 0
                }),
            )
            .await
            .unwrap();

        for expected in ["m0", "m2", "m4"] {
            let item = tokio::time::timeout(Duration::from_secs(1), stream.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(item.body, expected.as_bytes());
        }
        stream.dispose().await;
    }

    #[tokio::test]
    async fn test_error_strategy_overflow_terminates_stream() {
        let broker = broker_with_queue("q").await;
        let receiver = Receiver::new(broker.connector());
        let mut stream = receiver
            .consume_no_ack(
                "q",
                ConsumeOptions::new()
                    .overflow_strategy(OverflowStrategy::Error)
                    .buffer_capacity(2),
            )
            .await
            .unwrap();

        // Fill the buffer without consuming; the third delivery overflows.
        publish(&broker, "q", 3).await;
        broker.wait_for_idle().await;

        let mut items = Vec::new();
        while let Some(item) = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
        {
            items.push(item);
        }
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(items[1].is_ok());
        assert!(matches!(items[2], Err(BridgeError::Overflowed)));
    }

    #[tokio::test]
    async fn test_drop_strategy_discards_silently() {
        let broker = broker_with_queue("q").await;
        let receiver = Receiver::new(broker.connector());
        let mut stream = receiver
            .consume_no_ack("q", ConsumeOptions::new().buffer_capacity(2))
            .await
            .unwrap();

        publish(&broker, "q", 10).await;
        broker.wait_for_idle().await;

        // Exactly the buffered two arrive; the rest were dropped, and the
        // stream stays alive.
        for _ in 0..2 {
            let item = tokio::time::timeout(Duration::from_secs(1), stream.next())
                .await
                .unwrap()
                .unwrap();
            assert!(item.is_ok());
        }
        assert_eq!(receiver.metrics().deliveries_dropped, 8);

        publish(&broker, "q", 1).await;
        let item = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert!(item.is_ok());
        stream.dispose().await;
    }

    #[tokio::test]
    async fn test_prefetch_applied_in_manual_mode() {
        let broker = broker_with_queue("q").await;
        let receiver = Receiver::new(broker.connector());
        let stream = receiver
            .consume_manual_ack("q", ConsumeOptions::new().prefetch(7))
            .await
            .unwrap();
        assert_eq!(broker.prefetch_for_consumer(stream.consumer_tag()), Some(7));
        stream.dispose().await;
    }

    #[tokio::test]
    async fn test_setup_failure_fails_subscription() {
        let broker = MemoryBroker::new();
        broker
            .fail_connects
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let receiver = Receiver::new(broker.connector());
        let err = receiver
            .consume_no_ack("q", ConsumeOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn test_consume_unknown_queue_fails() {
        let broker = MemoryBroker::new();
        let receiver = Receiver::new(broker.connector());
        let err = receiver
            .consume_no_ack("missing", ConsumeOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::BrokerOperationFailed(_)));
        // The half-opened channel was closed on the failure path.
        assert_eq!(broker.open_channel_count(), 0);
    }

    #[tokio::test]
    async fn test_receiver_close_is_idempotent() {
        let broker = broker_with_queue("q").await;
        let receiver = Receiver::new(broker.connector());
        let _ = receiver.consume_no_ack("q", ConsumeOptions::new()).await;
        receiver.close().await.unwrap();
        receiver.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_double_dispose_is_noop() {
        let broker = broker_with_queue("q").await;
        let receiver = Receiver::new(broker.connector());
        let stream = receiver
            .consume_no_ack("q", ConsumeOptions::new())
            .await
            .unwrap();
        let guard = Arc::clone(&stream.guard);
        stream.dispose().await;
        // Second teardown on the same guard must be a no-op.
        guard.teardown().await;
        assert_eq!(broker.open_channel_count(), 0);
    }
}
