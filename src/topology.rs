//! Topology resource specifications.
//!
//! Immutable descriptors consumed once by a declare or bind operation:
//! - [`ExchangeSpecification`] — exchange declaration
//! - [`QueueSpecification`] — queue declaration
//! - [`BindingSpecification`] — queue-to-exchange binding
//!
//! Each carries broker defaults matching a plain `exchangeDeclare` /
//! `queueDeclare` / `queueBind`; the builder methods override individual
//! fields. Specifications are not retained after the declare call returns.

/// Specification of an exchange to declare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpecification {
    /// Exchange name.
    pub name: String,

    /// Exchange type (`direct`, `fanout`, `topic`, `headers`).
    pub kind: String,

    /// Survive broker restart.
    pub durable: bool,

    /// Delete when no longer used.
    pub auto_delete: bool,
}

impl ExchangeSpecification {
    /// Creates a direct, non-durable exchange specification.
    #[must_use]
    pub fn exchange(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: "direct".into(),
            durable: false,
            auto_delete: false,
        }
    }

    /// Sets the exchange type.
    #[must_use]
    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Sets the durable flag.
    #[must_use]
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Sets the auto-delete flag.
    #[must_use]
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }
}

/// Specification of a queue to declare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpecification {
    /// Queue name.
    pub name: String,

    /// Survive broker restart.
    pub durable: bool,

    /// Restrict to the declaring connection.
    pub exclusive: bool,

    /// Delete when the last consumer unsubscribes.
    pub auto_delete: bool,
}

impl QueueSpecification {
    /// Creates a non-durable, non-exclusive queue specification.
    #[must_use]
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Sets the durable flag.
    #[must_use]
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Sets the exclusive flag.
    #[must_use]
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Sets the auto-delete flag.
    #[must_use]
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }
}

/// Specification of a queue-to-exchange binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpecification {
    /// Source exchange.
    pub exchange: String,

    /// Destination queue.
    pub queue: String,

    /// Routing key to bind with.
    pub routing_key: String,
}

impl BindingSpecification {
    /// Creates an empty binding to fill in with the builder methods.
    #[must_use]
    pub fn binding() -> Self {
        Self {
            exchange: String::new(),
            queue: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the source exchange.
    #[must_use]
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    /// Sets the destination queue.
    #[must_use]
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Sets the routing key.
    #[must_use]
    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }
}

/// Broker acknowledgement of a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclareOk {
    /// Declared queue name (server-generated when requested empty).
    pub queue: String,

    /// Messages ready in the queue at declare time.
    pub message_count: u64,

    /// Consumers registered on the queue at declare time.
    pub consumer_count: u32,
}
