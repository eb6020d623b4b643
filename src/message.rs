//! Message value types.
//!
//! Defines the values flowing through the bridge:
//! - [`Delivery`]: one message pushed by the broker to a consumer
//! - [`AcknowledgableDelivery`]: a delivery decorated with settle capability
//! - [`OutboundMessage`]: one message to publish through the sink
//! - [`MessageProperties`]: optional AMQP message metadata

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::broker::BrokerChannel;
use crate::error::BridgeError;

/// Optional metadata attached to a message.
///
/// A deliberately small subset of the AMQP basic-properties table; the
/// bridge forwards it opaquely and never interprets it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// MIME content type of the body.
    pub content_type: Option<String>,

    /// Application correlation identifier.
    pub correlation_id: Option<String>,

    /// Reply-to queue for request/response patterns.
    pub reply_to: Option<String>,

    /// Application-assigned message identifier.
    pub message_id: Option<String>,

    /// Delivery mode (1 = transient, 2 = persistent).
    pub delivery_mode: Option<u8>,
}

/// One message instance pushed by the broker to a registered consumer.
///
/// Immutable and passed by value through the stream. The delivery tag is
/// only meaningful while the channel that produced it is open.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Tag of the consumer registration that received this delivery.
    pub consumer_tag: String,

    /// Channel-scoped tag identifying this delivery for ack/nack.
    pub delivery_tag: u64,

    /// Exchange the message was published to.
    pub exchange: String,

    /// Routing key the message was published with.
    pub routing_key: String,

    /// Whether the broker has delivered this message before.
    pub redelivered: bool,

    /// Message metadata.
    pub properties: MessageProperties,

    /// Message body bytes.
    pub body: Vec<u8>,
}

/// A [`Delivery`] bound to the channel that produced it, exposing explicit
/// acknowledgement.
///
/// At most one of [`ack`](Self::ack) / [`nack`](Self::nack) takes effect per
/// delivery; a second settle attempt is a no-op returning `Ok(())`, so
/// batched settlement loops never fail on an already-settled message.
/// Settling after the originating channel has closed fails with
/// [`BridgeError::ChannelClosed`].
pub struct AcknowledgableDelivery {
    delivery: Delivery,
    channel: Arc<dyn BrokerChannel>,
    settled: AtomicBool,
}

impl AcknowledgableDelivery {
    /// Binds a delivery to its originating channel.
    #[must_use]
    pub fn new(delivery: Delivery, channel: Arc<dyn BrokerChannel>) -> Self {
        Self {
            delivery,
            channel,
            settled: AtomicBool::new(false),
        }
    }

    /// Returns the wrapped delivery.
    #[must_use]
    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// Unwraps into the plain delivery, discarding the settle capability.
    #[must_use]
    pub fn into_delivery(self) -> Delivery {
        self.delivery
    }

    /// Returns `true` if this delivery has already been acked or nacked.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Sends a positive acknowledgement for this delivery's tag.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ChannelClosed`] if the originating channel is
    /// no longer open.
    pub async fn ack(&self) -> Result<(), BridgeError> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if !self.channel.is_open() {
            return Err(BridgeError::ChannelClosed);
        }
        self.channel.basic_ack(self.delivery.delivery_tag).await
    }

    /// Sends a negative acknowledgement for this delivery's tag.
    ///
    /// `requeue` asks the broker to put the message back on the queue
    /// instead of discarding it.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ChannelClosed`] if the originating channel is
    /// no longer open.
    pub async fn nack(&self, requeue: bool) -> Result<(), BridgeError> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if !self.channel.is_open() {
            return Err(BridgeError::ChannelClosed);
        }
        self.channel
            .basic_nack(self.delivery.delivery_tag, requeue)
            .await
    }
}

impl fmt::Debug for AcknowledgableDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcknowledgableDelivery")
            .field("delivery_tag", &self.delivery.delivery_tag)
            .field("routing_key", &self.delivery.routing_key)
            .field("settled", &self.is_settled())
            .finish_non_exhaustive()
    }
}

/// One message to publish through the outbound sink.
///
/// Created by the caller and consumed exactly once.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Destination exchange; empty string selects the default exchange.
    pub exchange: String,

    /// Routing key; with the default exchange this is the queue name.
    pub routing_key: String,

    /// Message metadata.
    pub properties: MessageProperties,

    /// Message body bytes.
    pub body: Vec<u8>,
}

impl OutboundMessage {
    /// Creates an outbound message without properties.
    #[must_use]
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            properties: MessageProperties::default(),
            body: body.into(),
        }
    }

    /// Attaches properties to the message.
    #[must_use]
    pub fn with_properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }
}
