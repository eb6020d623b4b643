//! Stream-to-broker publishing and topology declaration.
//!
//! [`Sender`] turns a stream of [`OutboundMessage`]s into sequenced publish
//! calls on one dedicated channel, and exposes the declare/bind operations
//! used to establish topology before either flow starts. Like the receiver
//! side, it lazily establishes one shared connection on first use.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tracing::{debug, info};

use crate::broker::{BrokerChannel, BrokerConnector};
use crate::connection::ConnectionCell;
use crate::error::BridgeError;
use crate::message::OutboundMessage;
use crate::metrics::{SenderMetrics, SenderMetricsSnapshot};
use crate::options::SendOptions;
use crate::topology::{
    BindingSpecification, ExchangeSpecification, QueueDeclareOk, QueueSpecification,
};

/// Bridge from asynchronous streams to broker publish calls.
pub struct Sender {
    cell: ConnectionCell,
    metrics: Arc<SenderMetrics>,
}

impl Sender {
    /// Creates a sender over the given broker connector. No connection is
    /// established until the first operation.
    #[must_use]
    pub fn new(connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            cell: ConnectionCell::new(connector),
            metrics: Arc::new(SenderMetrics::new()),
        }
    }

    /// Publishes every message of `messages`, in arrival order, on one
    /// dedicated channel. Fire-and-forget: completes when the input stream
    /// completes.
    ///
    /// # Errors
    ///
    /// Fails immediately if the connection or channel cannot be
    /// established; otherwise propagates the first publish error, closing
    /// the channel either way.
    pub async fn send<S>(&self, messages: S) -> Result<(), BridgeError>
    where
        S: Stream<Item = OutboundMessage> + Send,
    {
        self.send_with_options(messages, SendOptions::new()).await
    }

    /// Publishes every message of `messages` with the given options.
    ///
    /// With [`SendOptions::confirmed`] the channel is put in
    /// publisher-confirm mode and completion additionally waits for the
    /// broker to confirm everything published.
    ///
    /// # Errors
    ///
    /// Propagates connection, channel, publish, and confirm errors; a
    /// negative confirm surfaces as [`BridgeError::BrokerOperationFailed`].
    pub async fn send_with_options<S>(
        &self,
        messages: S,
        options: SendOptions,
    ) -> Result<(), BridgeError>
    where
        S: Stream<Item = OutboundMessage> + Send,
    {
        self.send_results(messages.map(Ok), options).await
    }

    /// Publishes a fallible stream: an `Err` item propagates to the
    /// returned completion and closes the channel, mirroring an upstream
    /// stream error.
    ///
    /// # Errors
    ///
    /// Propagates the first upstream or publish error.
    pub async fn send_results<S>(&self, messages: S, options: SendOptions) -> Result<(), BridgeError>
    where
        S: Stream<Item = Result<OutboundMessage, BridgeError>> + Send,
    {
        let channel = self.open_channel().await?;
        if options.confirm {
            if let Err(err) = channel.confirm_select().await {
                let _ = channel.close().await;
                return Err(err);
            }
        }

        let result = self.publish_all(&channel, messages, options).await;
        let _ = channel.close().await;
        result
    }

    async fn publish_all<S>(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        messages: S,
        options: SendOptions,
    ) -> Result<(), BridgeError>
    where
        S: Stream<Item = Result<OutboundMessage, BridgeError>> + Send,
    {
        futures::pin_mut!(messages);
        let mut published: u64 = 0;
        while let Some(message) = messages.next().await {
            let message = message?;
            if let Err(err) = channel
                .basic_publish(
                    &message.exchange,
                    &message.routing_key,
                    &message.properties,
                    &message.body,
                )
                .await
            {
                self.metrics.record_publish_error();
                return Err(err);
            }
            self.metrics.record_published();
            published += 1;
        }

        if options.confirm && !channel.wait_for_confirms().await? {
            return Err(BridgeError::BrokerOperationFailed(
                "broker negatively confirmed published messages".into(),
            ));
        }
        debug!(published, confirm = options.confirm, "publish stream completed");
        Ok(())
    }

    /// Declares an exchange on a short-lived channel.
    ///
    /// # Errors
    ///
    /// Propagates connection and declare errors.
    pub async fn declare_exchange(&self, spec: &ExchangeSpecification) -> Result<(), BridgeError> {
        let channel = self.open_channel().await?;
        let result = channel.exchange_declare(spec).await;
        let _ = channel.close().await;
        self.metrics.record_declare_attempt();
        if result.is_ok() {
            info!(exchange = %spec.name, kind = %spec.kind, "exchange declared");
        }
        result
    }

    /// Declares a queue on a short-lived channel, returning the broker's
    /// acknowledgement.
    ///
    /// # Errors
    ///
    /// Propagates connection and declare errors.
    pub async fn declare_queue(
        &self,
        spec: &QueueSpecification,
    ) -> Result<QueueDeclareOk, BridgeError> {
        let channel = self.open_channel().await?;
        let result = channel.queue_declare(spec).await;
        let _ = channel.close().await;
        self.metrics.record_declare_attempt();
        if let Ok(ok) = &result {
            info!(queue = %ok.queue, "queue declared");
        }
        result
    }

    /// Binds a queue to an exchange on a short-lived channel.
    ///
    /// # Errors
    ///
    /// Propagates connection and bind errors.
    pub async fn bind(&self, spec: &BindingSpecification) -> Result<(), BridgeError> {
        let channel = self.open_channel().await?;
        let result = channel.queue_bind(spec).await;
        let _ = channel.close().await;
        self.metrics.record_declare_attempt();
        if result.is_ok() {
            info!(
                exchange = %spec.exchange,
                queue = %spec.queue,
                routing_key = %spec.routing_key,
                "binding created"
            );
        }
        result
    }

    /// Returns a snapshot of the publish-side counters.
    #[must_use]
    pub fn metrics(&self) -> SenderMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Releases the shared connection. Idempotent.
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
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender").finish_non_exhaustive()
    }
}
