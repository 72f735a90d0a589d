//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Long-running consumer: declares the dead-letter topology, consumes with
// prefetch 1 and manual acks, dispatches to registered handlers and survives
// broker restarts through a reconnect loop with capped exponential backoff.
//
// | Component          | Description                                             |
// |--------------------|---------------------------------------------------------|
// | SubscriberState    | Disconnected / Connecting / Consuming / Stopped         |
// | Transition         | Events driving the state machine                        |
// | Backoff            | 5s, 10s, 20s, 40s, 60s, 60s, ... between reconnects     |
// | EventSubscriber    | Owns the connection, registry and consume loop          |
//--------------------------------------------------------------------------------------------------

use std::sync::Arc;
use std::time::Duration;

use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ReconnectPolicy, RedeliveryPolicy, RetryConfig};
use crate::connection::ConnectionManager;
use crate::dispatch::{Disposition, dispatch};
use crate::error::RabbitMQError;
use crate::registry::{EventHandler, HandlerRegistry};
use crate::topology::{ExchangeSpec, QueueTopology};
use crate::transport::{
    Connector, Delivery, EVENT_TYPE_HEADER, OutboundMessage, RETRY_COUNT_HEADER, Transport,
};

/// Only one unacknowledged message per consumer
pub const PREFETCH_COUNT: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Disconnected,
    Connecting,
    Consuming,
    /// Terminal, entered only on an explicit stop
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    BackoffElapsed,
    Connected,
    ConnectFailed,
    ConnectionLost,
    StopRequested,
}

impl SubscriberState {
    /// Transition function of the consume loop. Unexpected transitions leave
    /// the state unchanged.
    pub fn on(self, transition: Transition) -> SubscriberState {
        use SubscriberState::*;

        match (self, transition) {
            (Stopped, _) => Stopped,
            (_, Transition::StopRequested) => Stopped,
            (Disconnected, Transition::BackoffElapsed) => Connecting,
            (Connecting, Transition::Connected) => Consuming,
            (Connecting, Transition::ConnectFailed) => Disconnected,
            (Consuming, Transition::ConnectionLost) => Disconnected,
            (state, _) => state,
        }
    }
}

/// Reconnect delay: starts at the initial delay and doubles after every
/// failed attempt up to the ceiling. Reset once a connection succeeds.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            current: policy.initial_delay,
        }
    }

    pub fn delay(&self) -> Duration {
        self.current
    }

    pub fn escalate(&mut self) {
        self.current = (self.current * 2).min(self.policy.max_delay);
    }

    pub fn reset(&mut self) {
        self.current = self.policy.initial_delay;
    }
}

/// Consumes events from the bus and hands them to registered handlers.
///
/// ## Lifecycle
///
/// 1. `connect`: fails fatally if the broker is unreachable at startup
/// 2. `register_handler` / `subscribe_events`: setup, before `start`
/// 3. `start`: runs until the stop token is cancelled; connection loss is
///    never returned to the caller, the loop reconnects and resumes
/// 4. `cleanup`: always executed when `start` returns
///
/// The registry must not change once `start` runs; `start` borrows the
/// subscriber mutably for its whole duration.
pub struct EventSubscriber<C: Connector> {
    exchange: ExchangeSpec,
    connection: ConnectionManager<C>,
    registry: HandlerRegistry,
    subscriptions: Vec<QueueTopology>,
    state: SubscriberState,
    backoff: Backoff,
    redelivery: RedeliveryPolicy,
    stop: CancellationToken,
}

impl<C: Connector> EventSubscriber<C> {
    /// Connects to the broker and declares the primary direct exchange.
    ///
    /// # Errors
    /// `ConnectionError` once every attempt of `retry` failed
    pub async fn connect(
        connector: C,
        exchange_name: &str,
        retry: RetryConfig,
    ) -> Result<Self, RabbitMQError> {
        let exchange = ExchangeSpec::direct(exchange_name);
        let mut connection = ConnectionManager::new(connector, vec![exchange.clone()], retry);
        connection.connect_with_retry().await?;

        Ok(Self {
            exchange,
            connection,
            registry: HandlerRegistry::new(),
            subscriptions: Vec::new(),
            state: SubscriberState::Consuming,
            backoff: Backoff::new(ReconnectPolicy::default()),
            redelivery: RedeliveryPolicy::default(),
            stop: CancellationToken::new(),
        })
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.backoff = Backoff::new(policy);
        self
    }

    pub fn with_redelivery_policy(mut self, policy: RedeliveryPolicy) -> Self {
        self.redelivery = policy;
        self
    }

    pub fn state(&self) -> SubscriberState {
        self.state
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Token that stops the consume loop when cancelled
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn register_handler(&mut self, event_type: &str, handler: Arc<dyn EventHandler>) {
        self.registry.register(event_type, handler);
    }

    /// Declares the queue topology and starts consuming from `queue_name`.
    ///
    /// The subscription is remembered and replayed after every reconnect.
    pub async fn subscribe_events(
        &mut self,
        queue_name: &str,
        routing_key: &str,
    ) -> Result<(), RabbitMQError> {
        let topology = QueueTopology::new(&self.exchange.name, queue_name, routing_key);

        let transport = self.connection.transport_mut()?;
        consume_queue(transport, &topology).await?;
        info!(
            "Subscribed to queue {} with routing key {} on {}",
            queue_name, routing_key, self.exchange.name
        );

        if !self.subscriptions.contains(&topology) {
            self.subscriptions.push(topology);
        }
        Ok(())
    }

    /// Runs the consume loop until stopped, then cleans up.
    pub async fn start(&mut self) -> Result<(), RabbitMQError> {
        if self.state == SubscriberState::Stopped {
            return Err(RabbitMQError::Closed);
        }
        if !self.connection.is_connected() {
            self.state = SubscriberState::Disconnected;
        }

        info!(
            "Subscriber started on {} with handlers for {:?}",
            self.exchange.name,
            self.registry.event_types()
        );

        let stop = self.stop.clone();
        while self.state != SubscriberState::Stopped {
            if stop.is_cancelled() {
                self.apply(Transition::StopRequested);
                break;
            }

            match self.state {
                SubscriberState::Disconnected => {
                    let delay = self.backoff.delay();
                    info!("Reconnecting to {} in {:?}", self.connection.connector().address(), delay);
                    select! {
                        _ = stop.cancelled() => self.apply(Transition::StopRequested),
                        _ = time::sleep(delay) => self.apply(Transition::BackoffElapsed),
                    }
                }
                SubscriberState::Connecting => match self.establish().await {
                    Ok(()) => {
                        info!("Reconnected to RabbitMQ; resuming consumption");
                        self.backoff.reset();
                        self.apply(Transition::Connected);
                    }
                    Err(err) => {
                        if err.is_connection_fault() {
                            warn!("Reconnect attempt failed: {}", err);
                        } else {
                            error!("Failed to restore subscriptions after reconnect: {}", err);
                        }
                        self.connection.disconnect().await;
                        self.backoff.escalate();
                        self.apply(Transition::ConnectFailed);
                    }
                },
                SubscriberState::Consuming => {
                    let next = match self.connection.transport_mut() {
                        Ok(transport) => select! {
                            biased;
                            _ = stop.cancelled() => None,
                            delivery = transport.next_delivery() => Some(delivery),
                        },
                        Err(err) => Some(Err(err)),
                    };

                    match next {
                        None => self.apply(Transition::StopRequested),
                        Some(Ok(delivery)) => {
                            if let Err(err) = self.process(delivery).await {
                                self.lose_connection(err).await;
                            }
                        }
                        Some(Err(err)) => self.lose_connection(err).await,
                    }
                }
                SubscriberState::Stopped => break,
            }
        }

        info!("Subscriber stopped.");
        self.cleanup().await;
        Ok(())
    }

    /// Closes channel and connection; tolerant of already-closed resources
    pub async fn cleanup(&mut self) {
        self.connection.disconnect().await;
        info!("Connection to RabbitMQ closed.");
    }

    fn apply(&mut self, transition: Transition) {
        let next = self.state.on(transition);
        if next != self.state {
            debug!("subscriber {:?} -> {:?} on {:?}", self.state, next, transition);
        }
        self.state = next;
    }

    async fn lose_connection(&mut self, err: RabbitMQError) {
        warn!("Connection to RabbitMQ lost: {}", err);
        self.connection.disconnect().await;
        self.apply(Transition::ConnectionLost);
    }

    /// One connection attempt followed by replaying every subscription
    async fn establish(&mut self) -> Result<(), RabbitMQError> {
        self.connection.connect().await?;

        let transport = self.connection.transport_mut()?;
        for topology in &self.subscriptions {
            consume_queue(transport, topology).await?;
        }
        Ok(())
    }

    async fn process(&mut self, delivery: Delivery) -> Result<(), RabbitMQError> {
        let disposition = dispatch(&self.registry, &delivery, self.redelivery).await;
        let transport = self.connection.transport_mut()?;
        let tag = delivery.delivery_tag;

        match disposition {
            Disposition::Ack => {
                transport.ack(tag).await?;
                debug!("Message {} acknowledged.", tag);
            }
            Disposition::Requeue => {
                transport.nack(tag, true).await?;
                debug!("Message {} requeued.", tag);
            }
            Disposition::DeadLetter(reason) => {
                transport.nack(tag, false).await?;
                warn!("Message {} dead-lettered: {:?}", tag, reason);
            }
            Disposition::Retry { attempt } => {
                transport.publish(retry_message(&delivery, attempt)).await?;
                transport.ack(tag).await?;
                debug!("Message {} republished for attempt {}", tag, attempt + 1);
            }
        }
        Ok(())
    }
}

/// Declares DLX, DLQ and the primary queue with their bindings, then starts a
/// manual-ack consumer with prefetch 1.
async fn consume_queue<T: Transport>(
    transport: &mut T,
    topology: &QueueTopology,
) -> Result<(), RabbitMQError> {
    transport
        .declare_exchange(&topology.dead_letter_exchange_spec())
        .await?;
    transport
        .declare_queue(&topology.dead_letter_queue_spec())
        .await?;
    transport.bind_queue(&topology.dead_letter_binding()).await?;

    transport.declare_queue(&topology.primary_queue_spec()).await?;
    transport.bind_queue(&topology.primary_binding()).await?;

    transport.set_prefetch(PREFETCH_COUNT).await?;
    let consumer_tag = transport.consume(&topology.queue).await?;
    debug!("consumer {} registered on {}", consumer_tag, topology.queue);
    Ok(())
}

/// Copy of `delivery` addressed straight to its queue through the default
/// exchange, so other queues bound to the same routing key do not see it again.
fn retry_message(delivery: &Delivery, attempt: u32) -> OutboundMessage {
    let mut headers = delivery.headers.clone();
    headers
        .entry(EVENT_TYPE_HEADER.to_owned())
        .or_insert_with(|| delivery.routing_key.clone());
    headers.insert(RETRY_COUNT_HEADER.to_owned(), attempt.to_string());

    let mut message = OutboundMessage::new("", &delivery.queue, delivery.body.clone())
        .with_headers(headers);
    message.mandatory = false;
    message
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn backoff_doubles_up_to_ceiling() {
        let mut backoff = Backoff::new(ReconnectPolicy::default());
        let mut delays = Vec::new();
        for _ in 0..8 {
            delays.push(backoff.delay().as_secs());
            backoff.escalate();
        }
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60, 60, 60]);

        backoff.reset();
        assert_eq!(backoff.delay(), Duration::from_secs(5));
    }

    #[test]
    fn state_machine_cycles_through_reconnect() {
        let state = SubscriberState::Consuming
            .on(Transition::ConnectionLost)
            .on(Transition::BackoffElapsed);
        assert_eq!(state, SubscriberState::Connecting);

        let state = state.on(Transition::ConnectFailed);
        assert_eq!(state, SubscriberState::Disconnected);

        let state = state
            .on(Transition::BackoffElapsed)
            .on(Transition::Connected);
        assert_eq!(state, SubscriberState::Consuming);
    }

    #[test]
    fn stop_is_terminal_from_every_state() {
        for state in [
            SubscriberState::Disconnected,
            SubscriberState::Connecting,
            SubscriberState::Consuming,
        ] {
            let stopped = state.on(Transition::StopRequested);
            assert_eq!(stopped, SubscriberState::Stopped);
            assert_eq!(stopped.on(Transition::Connected), SubscriberState::Stopped);
            assert_eq!(stopped.on(Transition::BackoffElapsed), SubscriberState::Stopped);
        }
    }

    #[test]
    fn unexpected_transitions_are_ignored() {
        assert_eq!(
            SubscriberState::Consuming.on(Transition::Connected),
            SubscriberState::Consuming
        );
        assert_eq!(
            SubscriberState::Disconnected.on(Transition::ConnectionLost),
            SubscriberState::Disconnected
        );
    }

    #[test]
    fn retry_message_targets_own_queue_and_pins_event_type() {
        let delivery = Delivery {
            delivery_tag: 3,
            queue: "buyer_deletion".into(),
            exchange: "event_bus".into(),
            routing_key: "buyer_deletion".into(),
            redelivered: false,
            headers: HashMap::new(),
            body: br#"{"user_id":"u1"}"#.to_vec(),
        };

        let message = retry_message(&delivery, 2);

        assert_eq!(message.exchange, "");
        assert_eq!(message.routing_key, "buyer_deletion");
        assert!(!message.mandatory);
        assert_eq!(message.headers.get("event_type").map(String::as_str), Some("buyer_deletion"));
        assert_eq!(message.headers.get("x-retry-count").map(String::as_str), Some("2"));
        assert_eq!(message.body, delivery.body);
    }
}
