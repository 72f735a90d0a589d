//--------------------------------------------------------------------------------------------------
// STRUCTS & ENUMS
//--------------------------------------------------------------------------------------------------
// | Name            | Description                                              | Key Methods    |
// |-----------------|----------------------------------------------------------|----------------|
// | ExchangeKind    | AMQP exchange type                                       | as_str         |
// | ExchangeSpec    | Exchange declaration                                     | direct         |
// | QueueSpec       | Queue declaration with TTL / dead-letter arguments       | durable        |
// | Binding         | Queue to exchange binding                                |                |
// | QueueTopology   | Primary queue + DLX + DLQ derived from naming convention | new, elements  |
//--------------------------------------------------------------------------------------------------

use std::fmt;
use std::time::Duration;

/// Suffix appended to the exchange name for the dead-letter exchange
pub const DLX_SUFFIX: &str = "-dlx";
/// Suffix appended to queue names and routing keys for dead-letter queues
pub const DLQ_SUFFIX: &str = "-dlq";
/// Time a message may wait in a primary queue before it expires into the DLQ
pub const PRIMARY_QUEUE_TTL: Duration = Duration::from_millis(86_400_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeSpec {
    /// Durable, non auto-deleted direct exchange (the shape of `event_bus`)
    pub fn direct(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            durable: true,
            auto_delete: false,
        }
    }

    pub fn with_kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Arguments carried by a queue declaration (`x-*` arguments on the wire)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    pub message_ttl: Option<Duration>,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub arguments: QueueArguments,
}

impl QueueSpec {
    pub fn durable(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            durable: true,
            auto_delete: false,
            arguments: QueueArguments::default(),
        }
    }

    pub fn with_arguments(mut self, arguments: QueueArguments) -> Self {
        self.arguments = arguments;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl Binding {
    pub fn new(queue: &str, exchange: &str, routing_key: &str) -> Self {
        Self {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        }
    }
}

/// Full topology of one subscription.
///
/// Every primary queue gets a matching `-dlq` queue bound to the `-dlx`
/// exchange with routing key `<routing_key>-dlq`; the primary queue's
/// arguments point rejected and expired messages there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl QueueTopology {
    pub fn new(exchange: &str, queue: &str, routing_key: &str) -> Self {
        Self {
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
            routing_key: routing_key.to_owned(),
        }
    }

    pub fn dead_letter_exchange(&self) -> String {
        format!("{}{}", self.exchange, DLX_SUFFIX)
    }

    pub fn dead_letter_queue(&self) -> String {
        format!("{}{}", self.queue, DLQ_SUFFIX)
    }

    pub fn dead_letter_routing_key(&self) -> String {
        format!("{}{}", self.routing_key, DLQ_SUFFIX)
    }

    pub fn dead_letter_exchange_spec(&self) -> ExchangeSpec {
        ExchangeSpec::direct(&self.dead_letter_exchange())
    }

    pub fn primary_queue_spec(&self) -> QueueSpec {
        QueueSpec::durable(&self.queue).with_arguments(QueueArguments {
            message_ttl: Some(PRIMARY_QUEUE_TTL),
            dead_letter_exchange: Some(self.dead_letter_exchange()),
            dead_letter_routing_key: Some(self.dead_letter_routing_key()),
        })
    }

    pub fn dead_letter_queue_spec(&self) -> QueueSpec {
        QueueSpec::durable(&self.dead_letter_queue())
    }

    pub fn primary_binding(&self) -> Binding {
        Binding::new(&self.queue, &self.exchange, &self.routing_key)
    }

    pub fn dead_letter_binding(&self) -> Binding {
        Binding::new(
            &self.dead_letter_queue(),
            &self.dead_letter_exchange(),
            &self.dead_letter_routing_key(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_letter_names_follow_convention() {
        let topology = QueueTopology::new("event_bus", "buyer_deletion", "buyer_deletion");

        assert_eq!(topology.dead_letter_exchange(), "event_bus-dlx");
        assert_eq!(topology.dead_letter_queue(), "buyer_deletion-dlq");
        assert_eq!(topology.dead_letter_routing_key(), "buyer_deletion-dlq");
    }

    #[test]
    fn primary_queue_points_at_dead_letter_topology() {
        let topology = QueueTopology::new("event_bus", "auction_users", "user_deleted");
        let queue = topology.primary_queue_spec();

        assert_eq!(queue.name, "auction_users");
        assert!(queue.durable);
        assert!(!queue.auto_delete);
        assert_eq!(queue.arguments.message_ttl, Some(Duration::from_millis(86_400_000)));
        assert_eq!(queue.arguments.dead_letter_exchange.as_deref(), Some("event_bus-dlx"));
        assert_eq!(queue.arguments.dead_letter_routing_key.as_deref(), Some("user_deleted-dlq"));

        let dlq_binding = topology.dead_letter_binding();
        assert_eq!(dlq_binding.queue, "auction_users-dlq");
        assert_eq!(dlq_binding.exchange, "event_bus-dlx");
        assert_eq!(dlq_binding.routing_key, "user_deleted-dlq");

        let dlx = topology.dead_letter_exchange_spec();
        assert_eq!(dlx.kind, ExchangeKind::Direct);
        assert!(dlx.durable);
    }
}
