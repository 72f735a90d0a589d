//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// In-process broker implementing the transport traits. It models the parts of
// RabbitMQ the event bus relies on: direct / fanout routing, durable queues,
// manual acknowledgment with prefetch, dead-lettering through queue arguments,
// mandatory returns and redelivery after connection loss. Fault injection
// hooks let tests drive the reconnect paths without a live broker.
//
// | Component          | Description                                          |
// |--------------------|------------------------------------------------------|
// | InMemoryBroker     | Shared broker state + inspection / fault hooks       |
// | InMemoryConnector  | Connector handing out transports on the broker       |
// | InMemoryTransport  | Transport bound to one simulated connection          |
// | StoredMessage      | A message sitting in (or taken from) a queue         |
//--------------------------------------------------------------------------------------------------

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::RabbitMQError;
use crate::topology::{Binding, ExchangeKind, ExchangeSpec, QueueSpec};
use crate::transport::{Connector, Delivery, OutboundMessage, Transport};

const NO_ROUTE: u16 = 312;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub exchange: String,
    pub routing_key: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

/// A `basic.nack` observed by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NackRecord {
    pub queue: String,
    pub message: StoredMessage,
    pub requeue: bool,
}

struct Unacked {
    connection_id: u64,
    queue: String,
    message: StoredMessage,
}

struct MemoryQueue {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<Binding>,
    unacked: HashMap<u64, Unacked>,
    live_connections: Vec<u64>,
    next_connection_id: u64,
    next_delivery_tag: u64,
    fail_connects: u32,
    fail_publishes: u32,
    connect_attempts: u32,
    acked: Vec<StoredMessage>,
    nacked: Vec<NackRecord>,
}

impl BrokerState {
    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        // Default exchange: every queue is bound under its own name
        if exchange.is_empty() {
            return self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default();
        }

        let kind = match self.exchanges.get(exchange) {
            Some(spec) => spec.kind,
            None => return Vec::new(),
        };

        self.bindings
            .iter()
            .filter(|binding| binding.exchange == exchange)
            .filter(|binding| match kind {
                ExchangeKind::Fanout => true,
                // Topic patterns are matched literally
                ExchangeKind::Direct | ExchangeKind::Topic => binding.routing_key == routing_key,
            })
            .map(|binding| binding.queue.clone())
            .collect()
    }

    fn enqueue(&mut self, queues: &[String], message: &StoredMessage) {
        for name in queues {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(message.clone());
            }
        }
    }

    fn requeue_front(&mut self, queue: &str, mut message: StoredMessage) {
        message.redelivered = true;
        if let Some(queue) = self.queues.get_mut(queue) {
            queue.ready.push_front(message);
        }
    }

    /// Routes a rejected message through the queue's dead-letter arguments
    fn dead_letter(&mut self, queue: &str, message: StoredMessage) {
        let arguments = match self.queues.get(queue) {
            Some(queue) => queue.spec.arguments.clone(),
            None => return,
        };
        let Some(exchange) = arguments.dead_letter_exchange else {
            debug!("dropping rejected message from {} (no dead-letter exchange)", queue);
            return;
        };
        let routing_key = arguments
            .dead_letter_routing_key
            .unwrap_or_else(|| message.routing_key.clone());

        let targets = self.route(&exchange, &routing_key);
        let dead = StoredMessage {
            exchange,
            routing_key,
            redelivered: false,
            ..message
        };
        self.enqueue(&targets, &dead);
    }

    /// Returns every unacked message of a connection to the head of its queue
    fn release_connection(&mut self, connection_id: u64) {
        self.live_connections.retain(|id| *id != connection_id);

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.connection_id == connection_id)
            .map(|(tag, _)| *tag)
            .collect();
        // Newest first so push_front restores the original order
        tags.sort_unstable_by(|a, b| b.cmp(a));

        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue_front(&unacked.queue, unacked.message);
            }
        }
    }

    fn in_flight(&self, connection_id: u64, queue: &str) -> usize {
        self.unacked
            .values()
            .filter(|unacked| unacked.connection_id == connection_id && unacked.queue == queue)
            .count()
    }
}

/// Handle to an in-process broker. Clones share the same state.
///
/// Every ack and nack is kept for inspection and never pruned, so the broker
/// is meant for tests and short-lived runs only.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    changed: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> InMemoryConnector {
        InMemoryConnector {
            broker: self.clone(),
        }
    }

    /// The next `count` connection attempts fail with a connection error
    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().fail_connects = count;
    }

    /// The next `count` publishes fail as if the channel were broken
    pub fn fail_next_publishes(&self, count: u32) {
        self.state.lock().fail_publishes = count;
    }

    /// Simulates a broker restart / network partition: every open transport
    /// becomes unusable and unacked messages go back to their queues.
    pub fn drop_connections(&self) {
        let mut state = self.state.lock();
        let connections = state.live_connections.clone();
        for connection_id in connections {
            state.release_connection(connection_id);
        }
        drop(state);
        self.changed.notify_waiters();
    }

    /// Publishes raw bytes as an external producer would
    pub fn inject(&self, exchange: &str, routing_key: &str, headers: &[(&str, &str)], body: &[u8]) {
        let mut state = self.state.lock();
        let message = StoredMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: body.to_vec(),
            redelivered: false,
        };
        let targets = state.route(exchange, routing_key);
        state.enqueue(&targets, &message);
        drop(state);
        self.changed.notify_waiters();
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    pub fn live_connections(&self) -> usize {
        self.state.lock().live_connections.len()
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.state.lock().exchanges.get(name).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<QueueSpec> {
        self.state.lock().queues.get(name).map(|queue| queue.spec.clone())
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.state.lock().bindings.clone()
    }

    /// Messages ready for delivery (not counting unacked ones)
    pub fn queue_len(&self, name: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(name)
            .map(|queue| queue.ready.len())
            .unwrap_or(0)
    }

    pub fn messages(&self, name: &str) -> Vec<StoredMessage> {
        self.state
            .lock()
            .queues
            .get(name)
            .map(|queue| queue.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn unacked_len(&self, name: &str) -> usize {
        self.state
            .lock()
            .unacked
            .values()
            .filter(|unacked| unacked.queue == name)
            .count()
    }

    pub fn acked(&self) -> Vec<StoredMessage> {
        self.state.lock().acked.clone()
    }

    pub fn nacked(&self) -> Vec<NackRecord> {
        self.state.lock().nacked.clone()
    }
}

#[derive(Clone)]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
}

impl InMemoryConnector {
    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    type Transport = InMemoryTransport;

    async fn connect(&self) -> Result<InMemoryTransport, RabbitMQError> {
        let mut state = self.broker.state.lock();
        state.connect_attempts += 1;

        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(RabbitMQError::ConnectionError("connection refused".to_owned()));
        }

        state.next_connection_id += 1;
        let connection_id = state.next_connection_id;
        state.live_connections.push(connection_id);

        Ok(InMemoryTransport {
            broker: self.broker.clone(),
            connection_id,
            consumers: Vec::new(),
            prefetch: 0,
        })
    }

    fn address(&self) -> String {
        "in-memory".to_owned()
    }
}

/// Transport bound to one simulated connection/channel pair
pub struct InMemoryTransport {
    broker: InMemoryBroker,
    connection_id: u64,
    consumers: Vec<String>,
    prefetch: u16,
}

impl InMemoryTransport {
    fn check_live(&self, state: &BrokerState) -> Result<(), RabbitMQError> {
        if state.live_connections.contains(&self.connection_id) {
            Ok(())
        } else {
            Err(RabbitMQError::ConnectionLost("connection reset by broker".to_owned()))
        }
    }

    fn try_take(&self) -> Result<Option<Delivery>, RabbitMQError> {
        let mut state = self.broker.state.lock();
        self.check_live(&state)?;

        for queue in &self.consumers {
            if self.prefetch > 0 && state.in_flight(self.connection_id, queue) >= self.prefetch as usize {
                continue;
            }
            let Some(message) = state.queues.get_mut(queue).and_then(|q| q.ready.pop_front()) else {
                continue;
            };

            state.next_delivery_tag += 1;
            let delivery_tag = state.next_delivery_tag;
            let delivery = Delivery {
                delivery_tag,
                queue: queue.clone(),
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                headers: message.headers.clone(),
                body: message.body.clone(),
            };
            state.unacked.insert(
                delivery_tag,
                Unacked {
                    connection_id: self.connection_id,
                    queue: queue.clone(),
                    message,
                },
            );
            return Ok(Some(delivery));
        }

        Ok(None)
    }

    fn take_unacked(&self, delivery_tag: u64) -> Result<Unacked, RabbitMQError> {
        let mut state = self.broker.state.lock();
        self.check_live(&state)?;

        match state.unacked.get(&delivery_tag) {
            Some(unacked) if unacked.connection_id == self.connection_id => {}
            _ => {
                return Err(RabbitMQError::AckMessageError(format!(
                    "unknown delivery tag {}",
                    delivery_tag
                )));
            }
        }
        state
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| RabbitMQError::AckMessageError(format!("unknown delivery tag {}", delivery_tag)))
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn declare_exchange(&mut self, exchange: &ExchangeSpec) -> Result<(), RabbitMQError> {
        let mut state = self.broker.state.lock();
        self.check_live(&state)?;

        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing != exchange => Err(RabbitMQError::ExchangeDeclarationError(
                format!("PRECONDITION_FAILED - inequivalent arg for exchange '{}'", exchange.name),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&mut self, queue: &QueueSpec) -> Result<(), RabbitMQError> {
        let mut state = self.broker.state.lock();
        self.check_live(&state)?;

        match state.queues.get(&queue.name) {
            Some(existing) if existing.spec != *queue => Err(RabbitMQError::QueueDeclarationError(
                format!("PRECONDITION_FAILED - inequivalent arg for queue '{}'", queue.name),
            )),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    queue.name.clone(),
                    MemoryQueue {
                        spec: queue.clone(),
                        ready: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&mut self, binding: &Binding) -> Result<(), RabbitMQError> {
        let mut state = self.broker.state.lock();
        self.check_live(&state)?;

        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(RabbitMQError::QueueBindingError(format!(
                "NOT_FOUND - no exchange '{}'",
                binding.exchange
            )));
        }
        if !state.queues.contains_key(&binding.queue) {
            return Err(RabbitMQError::QueueBindingError(format!(
                "NOT_FOUND - no queue '{}'",
                binding.queue
            )));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn set_prefetch(&mut self, prefetch_count: u16) -> Result<(), RabbitMQError> {
        self.check_live(&self.broker.state.lock())?;
        self.prefetch = prefetch_count;
        Ok(())
    }

    async fn consume(&mut self, queue: &str) -> Result<String, RabbitMQError> {
        let state = self.broker.state.lock();
        self.check_live(&state)?;

        if !state.queues.contains_key(queue) {
            return Err(RabbitMQError::SubscriptionError(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        drop(state);

        self.consumers.push(queue.to_owned());
        Ok(format!("{}-consumer-{}", queue, self.connection_id))
    }

    async fn next_delivery(&mut self) -> Result<Delivery, RabbitMQError> {
        let changed = self.broker.changed.clone();
        loop {
            let notified = changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take()? {
                return Ok(delivery);
            }
            notified.await;
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), RabbitMQError> {
        let unacked = self.take_unacked(delivery_tag)?;
        self.broker.state.lock().acked.push(unacked.message);
        self.broker.changed.notify_waiters();
        Ok(())
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), RabbitMQError> {
        let unacked = self.take_unacked(delivery_tag)?;
        let mut state = self.broker.state.lock();
        state.nacked.push(NackRecord {
            queue: unacked.queue.clone(),
            message: unacked.message.clone(),
            requeue,
        });
        if requeue {
            state.requeue_front(&unacked.queue, unacked.message);
        } else {
            state.dead_letter(&unacked.queue, unacked.message);
        }
        drop(state);
        self.broker.changed.notify_waiters();
        Ok(())
    }

    async fn publish(&mut self, message: OutboundMessage) -> Result<(), RabbitMQError> {
        let mut state = self.broker.state.lock();
        self.check_live(&state)?;

        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            return Err(RabbitMQError::PublishError("channel is in the wrong state".to_owned()));
        }
        if !message.exchange.is_empty() && !state.exchanges.contains_key(&message.exchange) {
            return Err(RabbitMQError::PublishError(format!(
                "NOT_FOUND - no exchange '{}'",
                message.exchange
            )));
        }

        let targets = state.route(&message.exchange, &message.routing_key);
        if targets.is_empty() && message.mandatory {
            return Err(RabbitMQError::Undeliverable {
                exchange: message.exchange,
                routing_key: message.routing_key,
                reply_code: NO_ROUTE,
                reply_text: "NO_ROUTE".to_owned(),
            });
        }

        let stored = StoredMessage {
            exchange: message.exchange,
            routing_key: message.routing_key,
            headers: message.headers,
            body: message.body,
            redelivered: false,
        };
        state.enqueue(&targets, &stored);
        drop(state);
        self.broker.changed.notify_waiters();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.check_live(&self.broker.state.lock()).is_ok()
    }

    async fn close(&mut self) -> Result<(), RabbitMQError> {
        self.broker.state.lock().release_connection(self.connection_id);
        self.broker.changed.notify_waiters();
        Ok(())
    }
}
