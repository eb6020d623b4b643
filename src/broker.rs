//! Broker client collaborator traits.
//!
//! The bridge never implements the wire protocol. It sequences and adapts an
//! external broker client described by these traits: connect, open channels,
//! declare topology, publish, register consumers, settle deliveries, close.
//!
//! Implementations are expected to invoke [`ConsumerHandler`] callbacks from
//! their own I/O tasks; the bridge guarantees those callbacks never block on
//! subscriber progress.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BridgeError;
use crate::message::{Delivery, MessageProperties};
use crate::topology::{BindingSpecification, ExchangeSpecification, QueueDeclareOk, QueueSpecification};

/// Callbacks registered with a broker consumer.
///
/// `on_delivery` receives each message the broker pushes for the
/// registration; `on_cancel` fires when the broker revokes the consumer
/// (for example because the queue was deleted).
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Called for each delivery pushed by the broker.
    async fn on_delivery(&self, delivery: Delivery);

    /// Called when the broker cancels the consumer registration.
    async fn on_cancel(&self, consumer_tag: &str);
}

/// Factory for broker connections.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Establishes a new connection to the broker.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ConnectionFailed`] if the broker is
    /// unreachable or refuses the connection.
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BridgeError>;
}

/// An established broker connection.
///
/// Read-only after establishment: the bridge only uses it to open new
/// channels and, eventually, to close it.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a new channel on this connection.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::BrokerOperationFailed`] if the channel cannot
    /// be opened, or [`BridgeError::ChannelClosed`] if the connection is
    /// already closed.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BridgeError>;

    /// Returns `true` while the connection is open.
    fn is_open(&self) -> bool;

    /// Closes the connection.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::TeardownFailed`] if the close handshake fails.
    async fn close(&self) -> Result<(), BridgeError>;
}

impl std::fmt::Debug for dyn BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BrokerConnection")
    }
}

/// One broker channel.
///
/// Exclusively owned by a single consume stream, publishing sink, or
/// short-lived declare operation; never shared between two logical
/// operations.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Registers a consumer on `queue`, returning its consumer tag.
    ///
    /// With `auto_ack` the broker considers each delivery settled at
    /// delivery time; otherwise deliveries stay unacknowledged until
    /// [`basic_ack`](Self::basic_ack) / [`basic_nack`](Self::basic_nack).
    async fn basic_consume(
        &self,
        queue: &str,
        auto_ack: bool,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<String, BridgeError>;

    /// Cancels a consumer registration.
    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BridgeError>;

    /// Publishes one message.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: &MessageProperties,
        body: &[u8],
    ) -> Result<(), BridgeError>;

    /// Positively acknowledges a delivery tag.
    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BridgeError>;

    /// Negatively acknowledges a delivery tag, optionally requeueing.
    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BridgeError>;

    /// Limits the number of unacknowledged deliveries pushed to consumers
    /// on this channel. `0` means unlimited.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BridgeError>;

    /// Declares an exchange.
    async fn exchange_declare(&self, spec: &ExchangeSpecification) -> Result<(), BridgeError>;

    /// Declares a queue.
    async fn queue_declare(&self, spec: &QueueSpecification) -> Result<QueueDeclareOk, BridgeError>;

    /// Binds a queue to an exchange.
    async fn queue_bind(&self, spec: &BindingSpecification) -> Result<(), BridgeError>;

    /// Puts the channel in publisher-confirm mode.
    async fn confirm_select(&self) -> Result<(), BridgeError>;

    /// Waits until all messages published since
    /// [`confirm_select`](Self::confirm_select) are confirmed.
    ///
    /// Returns `false` if the broker negatively confirmed any of them.
    async fn wait_for_confirms(&self) -> Result<bool, BridgeError>;

    /// Returns `true` while the channel is open.
    fn is_open(&self) -> bool;

    /// Closes the channel.
    async fn close(&self) -> Result<(), BridgeError>;
}
