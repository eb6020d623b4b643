//! Bridge error types.
//!
//! Provides the unified error taxonomy for all bridge operations:
//! connection establishment, channel operations, publishing, topology
//! declaration, and stream teardown.

use thiserror::Error;

/// Errors that can occur while bridging broker operations into streams.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// Failed to establish the broker connection.
    ///
    /// The failure is memoized by the connection supervisor: every pending
    /// and future caller of the same `Receiver`/`Sender` observes the same
    /// error. No retry is attempted internally.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// An operation was attempted on a channel that is no longer open,
    /// including a late `ack`/`nack` after the originating channel closed.
    #[error("channel closed")]
    ChannelClosed,

    /// A declare, bind, publish, or consume request was rejected by the
    /// broker.
    #[error("broker operation failed: {0}")]
    BrokerOperationFailed(String),

    /// An error occurred while cancelling a consumer or closing a channel
    /// during stream disposal.
    ///
    /// Never propagated out of the disposal path; reported via
    /// `tracing::warn!` so that disposal always completes logically.
    #[error("teardown failed: {0}")]
    TeardownFailed(String),

    /// The subscriber fell behind a bounded delivery buffer while the
    /// [`Error`](crate::options::OverflowStrategy::Error) overflow strategy
    /// was selected. Terminal for the stream that produced it.
    #[error("delivery buffer overflowed")]
    Overflowed,
}

impl BridgeError {
    /// Returns `true` if the error is terminal for the connection as a
    /// whole rather than for one channel or stream.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, BridgeError::ConnectionFailed(_))
    }
}
