//! Bridge metrics types.
//!
//! Provides metrics reporting for the bridge:
//! - `ReceiverMetrics`: delivery-side counters shared by all streams of one
//!   `Receiver`
//! - `SenderMetrics`: publish-side counters of one `Sender`

use std::sync::atomic::{AtomicU64, Ordering};

/// Delivery-side counters.
///
/// Maintained by every stream a `Receiver` produces; snapshots are exposed
/// through `Receiver::metrics()`.
#[derive(Debug, Default)]
pub struct ReceiverMetrics {
    /// Deliveries emitted into streams.
    pub deliveries_emitted: AtomicU64,

    /// Deliveries discarded by the drop overflow strategy.
    pub deliveries_dropped: AtomicU64,

    /// Positive acknowledgements sent on behalf of auto-ack streams.
    pub auto_acks: AtomicU64,

    /// Streams terminated by an error.
    pub stream_errors: AtomicU64,
}

impl ReceiverMetrics {
    /// Creates zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one emitted delivery.
    pub fn record_emitted(&self) {
        self.deliveries_emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one dropped delivery.
    pub fn record_dropped(&self) {
        self.deliveries_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one automatic acknowledgement.
    pub fn record_auto_ack(&self) {
        self.auto_acks.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one stream error.
    pub fn record_stream_error(&self) {
        self.stream_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ReceiverMetricsSnapshot {
        ReceiverMetricsSnapshot {
            deliveries_emitted: self.deliveries_emitted.load(Ordering::Relaxed),
            deliveries_dropped: self.deliveries_dropped.load(Ordering::Relaxed),
            auto_acks: self.auto_acks.load(Ordering::Relaxed),
            stream_errors: self.stream_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`ReceiverMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverMetricsSnapshot {
    /// Deliveries emitted into streams.
    pub deliveries_emitted: u64,

    /// Deliveries discarded by the drop overflow strategy.
    pub deliveries_dropped: u64,

    /// Positive acknowledgements sent on behalf of auto-ack streams.
    pub auto_acks: u64,

    /// Streams terminated by an error.
    pub stream_errors: u64,
}

/// Publish-side counters.
#[derive(Debug, Default)]
pub struct SenderMetrics {
    /// Messages published through sinks.
    pub messages_published: AtomicU64,

    /// Publish calls rejected by the broker.
    pub publish_errors: AtomicU64,

    /// Declare and bind operations attempted, successful or not.
    pub declare_attempts: AtomicU64,
}

impl SenderMetrics {
    /// Creates zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one published message.
    pub fn record_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one failed publish.
    pub fn record_publish_error(&self) {
        self.publish_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one declare or bind attempt.
    pub fn record_declare_attempt(&self) {
        self.declare_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> SenderMetricsSnapshot {
        SenderMetricsSnapshot {
            messages_published: self.messages_published.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            declare_attempts: self.declare_attempts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`SenderMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderMetricsSnapshot {
    /// Messages published through sinks.
    pub messages_published: u64,

    /// Publish calls rejected by the broker.
    pub publish_errors: u64,

    /// Declare and bind operations attempted, successful or not.
    pub declare_attempts: u64,
}
