/// Error types for RabbitMQ operations
#[derive(Debug, thiserror::Error)]
pub enum RabbitMQError {
    /// Error establishing connection
    #[error("Connection error: {0}")]
    ConnectionError(String),
    /// The broker connection dropped while it was in use
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    /// Error opening a channel
    #[error("Error while opening a rabbitmq channel: {0}")]
    OpenChannelError(String),
    /// Error declaring a queue
    #[error("Error while declaring a queue: {0}")]
    QueueDeclarationError(String),
    /// Error declaring an exchange
    #[error("Error while declaring a exchange: {0}")]
    ExchangeDeclarationError(String),
    /// Error starting to consume from a subscription
    #[error("Error while starting to consume from a subscription: {0}")]
    SubscriptionError(String),
    /// Error binding a queue to an exchange
    #[error("Error while binding a queue to exchange: {0}")]
    QueueBindingError(String),
    /// Error closing a channel
    #[error("Error while closing a channel: {0}")]
    CloseChannelError(String),
    /// Error publishing a message
    #[error("Error while publishing a message: {0}")]
    PublishError(String),
    /// The broker returned a `mandatory` message because no queue was bound for it
    #[error("Message to exchange '{exchange}' with routing key '{routing_key}' was returned: {reply_code} {reply_text}")]
    Undeliverable {
        exchange: String,
        routing_key: String,
        reply_code: u16,
        reply_text: String,
    },
    /// The event body could not be encoded as JSON
    #[error("Error while serializing event body: {0}")]
    SerializationError(#[from] serde_json::Error),
    /// Error while acknowledging a message failed
    #[error("Error while acknowledging a message: {0}")]
    AckMessageError(String),
    /// Operation attempted on a publisher or subscriber after `close()`
    #[error("Publisher or subscriber was closed")]
    Closed,
    /// Operation attempted while no connection is established
    #[error("Not connected to the broker")]
    NotConnected,
}

impl RabbitMQError {
    /// Broker-level faults that are recovered by rebuilding the connection.
    ///
    /// Covers both "channel in the wrong state" and "connection unusable" conditions.
    /// Declaration, serialization and return errors are not faults of the
    /// connection itself and are excluded.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            RabbitMQError::ConnectionError(_)
                | RabbitMQError::ConnectionLost(_)
                | RabbitMQError::OpenChannelError(_)
                | RabbitMQError::PublishError(_)
                | RabbitMQError::AckMessageError(_)
                | RabbitMQError::CloseChannelError(_)
                | RabbitMQError::NotConnected
        )
    }
}

/// Error raised by an [`EventHandler`](crate::EventHandler) while processing an event.
///
/// Any handler error leads to the message being requeued (or retried per the
/// configured [`RedeliveryPolicy`](crate::RedeliveryPolicy)).
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Failed to process the event
    #[error("Failed to process event: {0}")]
    Processing(String),
    /// Any other failure from business logic
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_faults_are_classified() {
        assert!(RabbitMQError::ConnectionLost("eof".into()).is_connection_fault());
        assert!(RabbitMQError::PublishError("channel closed".into()).is_connection_fault());
        assert!(RabbitMQError::NotConnected.is_connection_fault());

        assert!(!RabbitMQError::Closed.is_connection_fault());
        assert!(!RabbitMQError::QueueDeclarationError("mismatch".into()).is_connection_fault());
        assert!(
            !RabbitMQError::Undeliverable {
                exchange: "event_bus".into(),
                routing_key: "nowhere".into(),
                reply_code: 312,
                reply_text: "NO_ROUTE".into(),
            }
            .is_connection_fault()
        );
    }
}
