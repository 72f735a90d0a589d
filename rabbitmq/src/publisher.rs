use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::connection::ConnectionManager;
use crate::error::RabbitMQError;
use crate::topology::ExchangeSpec;
use crate::transport::{Connector, OutboundMessage, Transport};

/// Publishes domain events to one exchange.
///
/// ## Failure handling
///
/// - Construction connects with retry and fails with `ConnectionError` once
///   every attempt is exhausted.
/// - A publish that hits a broken channel or connection reconnects (with
///   retry) and is attempted exactly once more; a second failure is returned.
/// - `Undeliverable` (no queue bound for the routing key) and serialization
///   errors are returned immediately.
///
/// ## Cleanup
///
/// `close()` MUST be called for a graceful shutdown; it is idempotent.
pub struct EventPublisher<C: Connector> {
    exchange: ExchangeSpec,
    connection: ConnectionManager<C>,
    closed: bool,
}

impl<C: Connector> EventPublisher<C> {
    /// Connects and declares `exchange`.
    ///
    /// # Errors
    /// Returns `ConnectionError` if the broker stays unreachable for every attempt
    pub async fn connect(
        connector: C,
        exchange: ExchangeSpec,
        retry: RetryConfig,
    ) -> Result<Self, RabbitMQError> {
        let mut connection = ConnectionManager::new(connector, vec![exchange.clone()], retry);
        connection.connect_with_retry().await?;

        Ok(Self {
            exchange,
            connection,
            closed: false,
        })
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange.name
    }

    /// Publishes `body` as UTF-8 JSON with `headers` as message headers.
    ///
    /// The message is published `mandatory`: if the broker cannot route it the
    /// call fails with `RabbitMQError::Undeliverable` instead of the message
    /// silently disappearing.
    pub async fn publish_event<B: Serialize + ?Sized>(
        &mut self,
        body: &B,
        headers: &HashMap<String, String>,
        routing_key: &str,
    ) -> Result<(), RabbitMQError> {
        if self.closed {
            return Err(RabbitMQError::Closed);
        }

        let content = serde_json::to_vec(body)?;
        let message = OutboundMessage::new(&self.exchange.name, routing_key, content)
            .with_headers(headers.clone())
            .with_message_id(&Uuid::new_v4().to_string());

        match self.try_publish(message.clone()).await {
            Err(err) if err.is_connection_fault() => {
                warn!("Failed to publish message due to {}. Attempting to reconnect...", err);
                self.connection.connect_with_retry().await?;
                self.try_publish(message).await?;
            }
            result => result?,
        }

        debug!(
            "Published event to {} with routing key {} and headers {:?}",
            self.exchange.name, routing_key, headers
        );
        Ok(())
    }

    async fn try_publish(&mut self, message: OutboundMessage) -> Result<(), RabbitMQError> {
        self.connection.transport_mut()?.publish(message).await
    }

    /// Closes channel then connection. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.connection.disconnect().await;
        info!("Connection to RabbitMQ closed.");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::memory::InMemoryBroker;
    use crate::topology::QueueTopology;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            attempts: 3,
            delay: Duration::from_millis(1),
        }
    }

    async fn broker_with_queue() -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        let mut transport = broker.connector().connect().await.unwrap();
        let topology = QueueTopology::new("event_bus", "buyer_deletion", "buyer_deletion");
        transport.declare_exchange(&ExchangeSpec::direct("event_bus")).await.unwrap();
        transport.declare_queue(&topology.primary_queue_spec()).await.unwrap();
        transport.bind_queue(&topology.primary_binding()).await.unwrap();
        broker
    }

    fn event_headers() -> HashMap<String, String> {
        HashMap::from([("event_type".to_owned(), "buyer_deletion".to_owned())])
    }

    #[tokio::test]
    async fn publishes_json_body_with_headers() {
        let broker = broker_with_queue().await;
        let mut publisher = EventPublisher::connect(
            broker.connector(),
            ExchangeSpec::direct("event_bus"),
            fast_retry(),
        )
        .await
        .unwrap();

        publisher
            .publish_event(&json!({"user_id": "u1"}), &event_headers(), "buyer_deletion")
            .await
            .unwrap();

        let messages = broker.messages("buyer_deletion");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, br#"{"user_id":"u1"}"#);
        assert_eq!(
            messages[0].headers.get("event_type").map(String::as_str),
            Some("buyer_deletion")
        );
    }

    #[tokio::test]
    async fn reconnects_once_on_broken_channel() {
        let broker = broker_with_queue().await;
        let mut publisher = EventPublisher::connect(
            broker.connector(),
            ExchangeSpec::direct("event_bus"),
            fast_retry(),
        )
        .await
        .unwrap();

        broker.drop_connections();
        publisher
            .publish_event(&json!({"user_id": "u1"}), &event_headers(), "buyer_deletion")
            .await
            .unwrap();

        assert_eq!(broker.connect_attempts(), 3);
        assert_eq!(broker.queue_len("buyer_deletion"), 1);
    }

    #[tokio::test]
    async fn second_failure_propagates() {
        let broker = broker_with_queue().await;
        let mut publisher = EventPublisher::connect(
            broker.connector(),
            ExchangeSpec::direct("event_bus"),
            fast_retry(),
        )
        .await
        .unwrap();

        broker.fail_next_publishes(2);
        let err = publisher
            .publish_event(&json!({"user_id": "u1"}), &event_headers(), "buyer_deletion")
            .await
            .unwrap_err();

        assert!(matches!(err, RabbitMQError::PublishError(_)));
        assert_eq!(broker.queue_len("buyer_deletion"), 0);
    }

    #[tokio::test]
    async fn unroutable_event_is_reported_not_retried() {
        let broker = broker_with_queue().await;
        let mut publisher = EventPublisher::connect(
            broker.connector(),
            ExchangeSpec::direct("event_bus"),
            fast_retry(),
        )
        .await
        .unwrap();
        let attempts = broker.connect_attempts();

        let err = publisher
            .publish_event(&json!({"user_id": "u1"}), &event_headers(), "seller_deletion")
            .await
            .unwrap_err();

        assert!(matches!(err, RabbitMQError::Undeliverable { .. }));
        assert_eq!(broker.connect_attempts(), attempts);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_publishing() {
        let broker = broker_with_queue().await;
        let mut publisher = EventPublisher::connect(
            broker.connector(),
            ExchangeSpec::direct("event_bus"),
            fast_retry(),
        )
        .await
        .unwrap();

        publisher.close().await;
        publisher.close().await;

        assert!(publisher.is_closed());
        let err = publisher
            .publish_event(&json!({}), &HashMap::new(), "buyer_deletion")
            .await
            .unwrap_err();
        assert!(matches!(err, RabbitMQError::Closed));
    }

    #[tokio::test]
    async fn construction_fails_when_broker_unreachable() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(u32::MAX);

        let result = EventPublisher::connect(
            broker.connector(),
            ExchangeSpec::direct("event_bus"),
            fast_retry(),
        )
        .await;

        assert!(matches!(result, Err(RabbitMQError::ConnectionError(_))));
        assert_eq!(broker.connect_attempts(), 3);
    }
}
