//--------------------------------------------------------------------------------------------------
// STRUCTS & TRAITS
//--------------------------------------------------------------------------------------------------
// | Name            | Description                                          | Key Methods        |
// |-----------------|------------------------------------------------------|--------------------|
// | Delivery        | Message handed to a consumer                         | event_type         |
// | OutboundMessage | Message handed to the broker by a publisher          | new                |
// | Transport       | One connection + one channel to the broker           | publish, ack, nack |
// | Connector       | Factory for transports (connect-from-scratch)        | connect            |
//--------------------------------------------------------------------------------------------------

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::RabbitMQError;
use crate::topology::{Binding, ExchangeSpec, QueueSpec};

/// Reserved header that selects the handler for a message
pub const EVENT_TYPE_HEADER: &str = "event_type";
/// Number of times a message was republished after a handler failure
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// A message delivered to a consumer, decoupled from the client library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    /// Queue the consumer that received the message is attached to
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Delivery {
    /// The `event_type` header when present, otherwise the routing key.
    pub fn event_type(&self) -> &str {
        self.headers
            .get(EVENT_TYPE_HEADER)
            .map(String::as_str)
            .unwrap_or(&self.routing_key)
    }

    /// Value of the retry-count header; missing or garbled values count as zero.
    pub fn retry_count(&self) -> u32 {
        self.headers
            .get(RETRY_COUNT_HEADER)
            .and_then(|count| count.parse().ok())
            .unwrap_or(0)
    }
}

/// A message to publish. `mandatory` asks the broker to return it when no
/// queue is bound for the routing key instead of dropping it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub mandatory: bool,
    pub message_id: Option<String>,
}

impl OutboundMessage {
    pub fn new(exchange: &str, routing_key: &str, body: Vec<u8>) -> Self {
        Self {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            headers: HashMap::new(),
            body,
            mandatory: true,
            message_id: None,
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_message_id(mut self, message_id: &str) -> Self {
        self.message_id = Some(message_id.to_owned());
        self
    }
}

/// One live connection and its single channel.
///
/// A transport is never repaired: on any connection fault the owner drops it
/// and asks its [`Connector`] for a new one.
#[async_trait]
pub trait Transport: Send {
    /// Idempotent: redeclaring with matching properties is a no-op
    async fn declare_exchange(&mut self, exchange: &ExchangeSpec) -> Result<(), RabbitMQError>;

    async fn declare_queue(&mut self, queue: &QueueSpec) -> Result<(), RabbitMQError>;

    async fn bind_queue(&mut self, binding: &Binding) -> Result<(), RabbitMQError>;

    /// Per-consumer limit of unacknowledged deliveries
    async fn set_prefetch(&mut self, prefetch_count: u16) -> Result<(), RabbitMQError>;

    /// Starts a manual-ack consumer on `queue`, returning its consumer tag
    async fn consume(&mut self, queue: &str) -> Result<String, RabbitMQError>;

    /// Waits for the next delivery of any consumer on this channel.
    ///
    /// Returns `ConnectionLost` once the channel or connection goes away.
    async fn next_delivery(&mut self) -> Result<Delivery, RabbitMQError>;

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), RabbitMQError>;

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), RabbitMQError>;

    /// Publishes and waits until the broker has taken responsibility for the
    /// message. A returned mandatory message is reported as `Undeliverable`.
    async fn publish(&mut self, message: OutboundMessage) -> Result<(), RabbitMQError>;

    fn is_open(&self) -> bool;

    /// Closes channel then connection; tolerant of already-closed resources
    async fn close(&mut self) -> Result<(), RabbitMQError>;
}

/// Opens fresh transports. Shared by reference with the connection manager.
#[async_trait]
pub trait Connector: Send + Sync {
    type Transport: Transport + 'static;

    async fn connect(&self) -> Result<Self::Transport, RabbitMQError>;

    /// Address used in log lines; must not contain credentials
    fn address(&self) -> String;
}
