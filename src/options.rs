//! Per-subscription and per-send configuration.
//!
//! [`ConsumeOptions`] selects the overflow strategy, prefetch limit, and the
//! optional emission hooks for one consume stream. [`SendOptions`] selects
//! fire-and-forget or confirmed delivery for one publishing sink.
//!
//! The emission hooks are pure functions of the running emitter counters and
//! the current delivery. They never see stream internals: the pre-emit hook
//! gates whether a delivery enters the stream, and the stop condition
//! requests clean completion after a delivery has been emitted.

use std::fmt;
use std::sync::Arc;

use crate::message::Delivery;

/// Strategy applied when the broker delivers faster than the subscriber
/// consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowStrategy {
    /// Discard new deliveries silently while the buffer is full.
    ///
    /// Default for no-ack consumption, where a dropped message was already
    /// settled by the broker and nothing leaks.
    Drop,

    /// Queue deliveries without bound.
    ///
    /// Default for manual-ack and auto-ack consumption: dropping a delivery
    /// that still needs settlement would leak an unacknowledged message.
    #[default]
    Buffer,

    /// Terminate the stream with [`BridgeError::Overflowed`] when the
    /// buffer fills.
    ///
    /// [`BridgeError::Overflowed`]: crate::error::BridgeError::Overflowed
    Error,
}

impl fmt::Display for OverflowStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverflowStrategy::Drop => write!(f, "drop"),
            OverflowStrategy::Buffer => write!(f, "buffer"),
            OverflowStrategy::Error => write!(f, "error"),
        }
    }
}

/// Read-only snapshot of one emitter's progress, passed to the emission
/// hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmitterState {
    /// Deliveries emitted into the stream so far.
    pub emitted: u64,

    /// Deliveries discarded by the [`Drop`](OverflowStrategy::Drop)
    /// strategy so far.
    pub dropped: u64,
}

/// Decides whether a delivery is emitted into the stream.
pub type EmitHook = Arc<dyn Fn(&EmitterState, &Delivery) -> bool + Send + Sync>;

/// Decides whether the stream completes cleanly after a delivery.
pub type StopCondition = Arc<dyn Fn(&EmitterState, &Delivery) -> bool + Send + Sync>;

/// Configuration for one consume subscription.
///
/// Read-only once the subscription starts; cloning is cheap (hooks are
/// shared behind `Arc`).
#[derive(Clone, Default)]
pub struct ConsumeOptions {
    overflow: Option<OverflowStrategy>,
    prefetch: u16,
    buffer_capacity: Option<usize>,
    emit_hook: Option<EmitHook>,
    stop_condition: Option<StopCondition>,
}

impl ConsumeOptions {
    /// Capacity used by the bounded strategies when none is configured.
    pub const DEFAULT_BUFFER_CAPACITY: usize = 256;

    /// Creates options with per-mode defaults left in place.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the overflow strategy for this subscription.
    #[must_use]
    pub fn overflow_strategy(mut self, strategy: OverflowStrategy) -> Self {
        self.overflow = Some(strategy);
        self
    }

    /// Sets the prefetch (QoS) limit. `0` leaves it unset.
    ///
    /// Applied only in manual-ack and auto-ack modes, where the broker
    /// tracks unacknowledged deliveries.
    #[must_use]
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Sets the buffer capacity used by the `Drop` and `Error` strategies.
    #[must_use]
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = Some(capacity);
        self
    }

    /// Installs a pre-emit hook gating each delivery.
    #[must_use]
    pub fn emit_hook(
        mut self,
        hook: impl Fn(&EmitterState, &Delivery) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.emit_hook = Some(Arc::new(hook));
        self
    }

    /// Installs a stop condition requesting clean completion.
    #[must_use]
    pub fn stop_condition(
        mut self,
        stop: impl Fn(&EmitterState, &Delivery) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.stop_condition = Some(Arc::new(stop));
        self
    }

    /// Returns the configured strategy, or `default` when unset.
    #[must_use]
    pub fn overflow_or(&self, default: OverflowStrategy) -> OverflowStrategy {
        self.overflow.unwrap_or(default)
    }

    /// Returns the prefetch limit (`0` = unset).
    #[must_use]
    pub fn prefetch_count(&self) -> u16 {
        self.prefetch
    }

    /// Returns the bounded-buffer capacity.
    #[must_use]
    pub fn buffer_capacity_or_default(&self) -> usize {
        self.buffer_capacity.unwrap_or(Self::DEFAULT_BUFFER_CAPACITY)
    }

    /// Returns the pre-emit hook, if any.
    #[must_use]
    pub fn emit_hook_fn(&self) -> Option<&EmitHook> {
        self.emit_hook.as_ref()
    }

    /// Returns the stop condition, if any.
    #[must_use]
    pub fn stop_condition_fn(&self) -> Option<&StopCondition> {
        self.stop_condition.as_ref()
    }
}

impl fmt::Debug for ConsumeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumeOptions")
            .field("overflow", &self.overflow)
            .field("prefetch", &self.prefetch)
            .field("buffer_capacity", &self.buffer_capacity)
            .field("emit_hook", &self.emit_hook.is_some())
            .field("stop_condition", &self.stop_condition.is_some())
            .finish()
    }
}

/// Configuration for one publishing sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Put the channel in publisher-confirm mode and wait for all
    /// confirmations before completing. Defaults to fire-and-forget.
    pub confirm: bool,
}

impl SendOptions {
    /// Fire-and-forget publishing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Confirmed publishing: completion waits for broker confirms.
    #[must_use]
    pub fn confirmed() -> Self {
        Self { confirm: true }
    }
}
