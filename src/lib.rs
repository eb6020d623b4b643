//! # `rabbit-flux`
//!
//! Backpressure-aware async stream bridge over a callback-based AMQP-style
//! broker client.
//!
//! The broker client pushes deliveries through callbacks and settles them
//! with explicit acknowledgements; async consumers want pull-based,
//! cancellable [`Stream`](futures::Stream)s. This crate adapts between the
//! two:
//!
//! - [`receiver`] - broker deliveries to streams, in no-ack, auto-ack, and
//!   manual-ack modes, with per-stream overflow strategies
//! - [`sender`] - streams of outbound messages to sequenced publish calls,
//!   plus topology declaration (exchanges, queues, bindings)
//! - [`connection`] - the lazy, memoized connection shared by both sides
//! - [`broker`] - the traits an actual broker client implements
//! - [`testing`] - an in-memory broker for deterministic tests
//!
//! ## Architecture
//!
//! ```text
//! broker callbacks                       subscriber
//!   on_delivery(d) --> Emitter(overflow) --> DeliveryStream::poll_next()
//!   on_cancel(tag) --> clean completion
//!                      TeardownGuard: cancel consumer + close channel, once
//! ```
//!
//! Each consume stream and each publishing sink exclusively owns one broker
//! channel; a `Receiver`/`Sender` pair shares at most one connection each,
//! established on first use.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Common test patterns that are acceptable
#![cfg_attr(
    test,
    allow(
        clippy::field_reassign_with_default,
        clippy::manual_let_else,
        clippy::needless_return,
        clippy::unreadable_literal,
        clippy::cast_possible_truncation,
        clippy::no_effect_underscore_binding,
        unused_mut
    )
)]

/// Bridge error types.
pub mod error;

/// Broker client collaborator traits.
pub mod broker;

/// Message value types (deliveries, outbound messages, properties).
pub mod message;

/// Topology resource specifications.
pub mod topology;

/// Per-subscription and per-send configuration.
pub mod options;

/// Lazy, memoized connection supervision.
pub mod connection;

/// Bridge metrics types.
pub mod metrics;

/// Broker-to-stream consumption.
pub mod receiver;

/// Stream-to-broker publishing and topology declaration.
pub mod sender;

/// Testing utilities (in-memory broker).
pub mod testing;

pub use error::BridgeError;
pub use message::{AcknowledgableDelivery, Delivery, MessageProperties, OutboundMessage};
pub use options::{ConsumeOptions, OverflowStrategy, SendOptions};
pub use receiver::{DeliveryStream, Receiver};
pub use sender::Sender;
