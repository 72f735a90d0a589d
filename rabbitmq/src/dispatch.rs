use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::config::RedeliveryPolicy;
use crate::registry::HandlerRegistry;
use crate::transport::Delivery;

/// Why a message is moved to the dead-letter queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// Body is not UTF-8 JSON; retrying could only loop forever
    Undecodable(String),
    /// No handler is registered for the event type
    UnknownEventType(String),
    /// Handler kept failing and the redelivery policy gave up
    RetriesExhausted { attempts: u32 },
}

/// What the consumer tells the broker about a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Handler succeeded: `ack`
    Ack,
    /// Handler failed: `nack(requeue = true)`
    Requeue,
    /// `nack(requeue = false)`, routed to the DLQ by the queue arguments
    DeadLetter(DeadLetterReason),
    /// Handler failed under a capped policy: republish with the retry count
    /// header set to `attempt`, then `ack` the original
    Retry { attempt: u32 },
}

/// Runs the dispatch algorithm for one delivery.
///
/// 1. Resolve the event type (header, else routing key).
/// 2. Decode the body as JSON, dead-lettering on failure.
/// 3. Look the handler up, dead-lettering unknown event types.
/// 4. Invoke it: success acks, an error or a panic requeues (or retries /
///    dead-letters under [`RedeliveryPolicy::DeadLetterAfter`]).
pub async fn dispatch(
    registry: &HandlerRegistry,
    delivery: &Delivery,
    policy: RedeliveryPolicy,
) -> Disposition {
    let event_type = delivery.event_type();

    let event_body: Value = match serde_json::from_slice(&delivery.body) {
        Ok(body) => body,
        Err(err) => {
            error!(
                "Failed to decode message body for event type {}: {} (raw body: {})",
                event_type,
                err,
                String::from_utf8_lossy(&delivery.body)
            );
            return Disposition::DeadLetter(DeadLetterReason::Undecodable(err.to_string()));
        }
    };
    debug!("Received event: {} with body: {}", event_type, event_body);

    let Some(handler) = registry.get(event_type) else {
        warn!("No handler registered for event type: {}", event_type);
        return Disposition::DeadLetter(DeadLetterReason::UnknownEventType(event_type.to_owned()));
    };

    let outcome = AssertUnwindSafe(handler.handle(&event_body))
        .catch_unwind()
        .await;

    let failure = match outcome {
        Ok(Ok(())) => return Disposition::Ack,
        Ok(Err(err)) => err.to_string(),
        Err(panic) => panic_message(panic.as_ref()),
    };
    error!("Error processing {} event: {}", event_type, failure);

    match policy {
        RedeliveryPolicy::Unbounded => Disposition::Requeue,
        RedeliveryPolicy::DeadLetterAfter(max_deliveries) => {
            let attempts = delivery.retry_count().saturating_add(1);
            if attempts >= max_deliveries {
                warn!(
                    "Giving up on {} event after {} failed deliveries",
                    event_type, attempts
                );
                Disposition::DeadLetter(DeadLetterReason::RetriesExhausted { attempts })
            } else {
                Disposition::Retry { attempt: attempts }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", message)
    } else {
        "handler panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::HandlerError;
    use crate::registry::EventHandler;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for Counting {
        async fn handle(&self, _event_body: &Value) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        async fn handle(&self, _event_body: &Value) -> Result<(), HandlerError> {
            Err(HandlerError::Processing("database unavailable".into()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl EventHandler for Panicking {
        async fn handle(&self, _event_body: &Value) -> Result<(), HandlerError> {
            panic!("user_id missing");
        }
    }

    fn delivery(routing_key: &str, headers: &[(&str, &str)], body: &[u8]) -> Delivery {
        Delivery {
            delivery_tag: 7,
            queue: "buyer_deletion".into(),
            exchange: "event_bus".into(),
            routing_key: routing_key.into(),
            redelivered: false,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            body: body.to_vec(),
        }
    }

    fn registry_with(event_type: &str, handler: Arc<dyn EventHandler>) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register(event_type, handler);
        registry
    }

    #[tokio::test]
    async fn successful_handler_acks() {
        let handler = Arc::new(Counting::default());
        let registry = registry_with("buyer_deletion", handler.clone());
        let message = delivery("buyer_deletion", &[], br#"{"user_id":"u1"}"#);

        let disposition = dispatch(&registry, &message, RedeliveryPolicy::Unbounded).await;

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn header_selects_handler_over_routing_key() {
        let handler = Arc::new(Counting::default());
        let registry = registry_with("user_deleted", handler.clone());
        let message = delivery("buyer_deletion", &[("event_type", "user_deleted")], b"{}");

        assert_eq!(
            dispatch(&registry, &message, RedeliveryPolicy::Unbounded).await,
            Disposition::Ack
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_body_is_dead_lettered_without_calling_handler() {
        let handler = Arc::new(Counting::default());
        let registry = registry_with("buyer_deletion", handler.clone());
        let message = delivery("buyer_deletion", &[], b"{not json");

        let disposition = dispatch(&registry, &message, RedeliveryPolicy::Unbounded).await;

        assert!(matches!(
            disposition,
            Disposition::DeadLetter(DeadLetterReason::Undecodable(_))
        ));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_event_type_is_dead_lettered() {
        let registry = registry_with("buyer_deletion", Arc::new(Counting::default()));
        let message = delivery("buyer_deletion", &[("event_type", "auction_closed")], b"{}");

        assert_eq!(
            dispatch(&registry, &message, RedeliveryPolicy::Unbounded).await,
            Disposition::DeadLetter(DeadLetterReason::UnknownEventType("auction_closed".into()))
        );
    }

    #[tokio::test]
    async fn handler_error_requeues() {
        let registry = registry_with("buyer_deletion", Arc::new(Failing));
        let message = delivery("buyer_deletion", &[], b"{}");

        assert_eq!(
            dispatch(&registry, &message, RedeliveryPolicy::Unbounded).await,
            Disposition::Requeue
        );
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        let registry = registry_with("buyer_deletion", Arc::new(Panicking));
        let message = delivery("buyer_deletion", &[], b"{}");

        assert_eq!(
            dispatch(&registry, &message, RedeliveryPolicy::Unbounded).await,
            Disposition::Requeue
        );
    }

    #[tokio::test]
    async fn capped_policy_retries_then_dead_letters() {
        let registry = registry_with("buyer_deletion", Arc::new(Failing));
        let policy = RedeliveryPolicy::DeadLetterAfter(3);

        let first = delivery("buyer_deletion", &[], b"{}");
        assert_eq!(
            dispatch(&registry, &first, policy).await,
            Disposition::Retry { attempt: 1 }
        );

        let second = delivery("buyer_deletion", &[("x-retry-count", "1")], b"{}");
        assert_eq!(
            dispatch(&registry, &second, policy).await,
            Disposition::Retry { attempt: 2 }
        );

        let third = delivery("buyer_deletion", &[("x-retry-count", "2")], b"{}");
        assert_eq!(
            dispatch(&registry, &third, policy).await,
            Disposition::DeadLetter(DeadLetterReason::RetriesExhausted { attempts: 3 })
        );
    }

    #[tokio::test]
    async fn saturated_retry_count_dead_letters() {
        let registry = registry_with("buyer_deletion", Arc::new(Failing));
        let message = delivery("buyer_deletion", &[("x-retry-count", "4294967295")], b"{}");

        assert_eq!(
            dispatch(&registry, &message, RedeliveryPolicy::DeadLetterAfter(3)).await,
            Disposition::DeadLetter(DeadLetterReason::RetriesExhausted { attempts: u32::MAX })
        );
    }
}
