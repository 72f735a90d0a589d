//! Event bus client for RabbitMQ.
//!
//! Services publish domain events to a direct exchange and consume them from
//! durable queues. Every consumed queue gets a dead-letter exchange and queue,
//! so messages that can never be processed are parked instead of looping.
//!
//! ## Layout
//!
//! - [`EventPublisher`] publishes JSON events with confirms and mandatory routing
//! - [`EventSubscriber`] consumes with prefetch 1, manual acks and automatic
//!   reconnection with capped exponential backoff
//! - [`HandlerRegistry`] maps event types to [`EventHandler`]s
//! - [`Transport`] / [`Connector`] abstract the broker; [`AmqpConnector`]
//!   talks to RabbitMQ, [`InMemoryBroker`] stands in for it in tests

pub mod amqp;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod memory;
pub mod publisher;
pub mod registry;
pub mod subscriber;
pub mod topology;
pub mod transport;

pub use amqp::{AmqpConnector, AmqpTransport};
pub use config::{BrokerConfig, ReconnectPolicy, RedeliveryPolicy, RetryConfig};
pub use connection::ConnectionManager;
pub use dispatch::{DeadLetterReason, Disposition, dispatch};
pub use error::{HandlerError, RabbitMQError};
pub use memory::{InMemoryBroker, InMemoryConnector, InMemoryTransport};
pub use publisher::EventPublisher;
pub use registry::{EventHandler, HandlerRegistry};
pub use subscriber::{Backoff, EventSubscriber, SubscriberState, Transition};
pub use topology::{Binding, ExchangeKind, ExchangeSpec, QueueSpec, QueueTopology};
pub use transport::{Connector, Delivery, OutboundMessage, Transport};
