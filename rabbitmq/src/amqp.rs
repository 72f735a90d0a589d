//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// AMQP 0-9-1 transport backed by `amqprs`.
//
// | Component                | Description                                                  |
// |--------------------------|--------------------------------------------------------------|
// | AmqpConnector            | Opens connection + channel, registers callbacks, confirms    |
// | AmqpTransport            | Transport over one amqprs channel                            |
// | RabbitConnectionCallback | Tracks blocked / closed connection state                     |
// | RabbitChannelCallback    | Forwards confirms and basic.return to the transport          |
//--------------------------------------------------------------------------------------------------

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use amqprs::{
    Ack, BasicProperties, Cancel, Close, CloseChannel, FieldTable, FieldValue, Nack, Return,
    ShortStr,
    callbacks::{ChannelCallback, ConnectionCallback},
    channel::{
        BasicAckArguments, BasicConsumeArguments, BasicNackArguments, BasicPublishArguments,
        BasicQosArguments, Channel, ConfirmSelectArguments, ConsumerMessage,
        ExchangeDeclareArguments, QueueBindArguments, QueueDeclareArguments,
    },
    connection::{Connection, OpenConnectionArguments},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
    select,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::error::RabbitMQError;
use crate::topology::{Binding, ExchangeSpec, QueueSpec};
use crate::transport::{Connector, Delivery, OutboundMessage, Transport};

const CONTENT_TYPE_JSON: &str = "application/json";
const PERSISTENT_DELIVERY_MODE: u8 = 2;
const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);

/// Connector for a real RabbitMQ broker
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    config: BrokerConfig,
    confirm_timeout: Duration,
}

impl AmqpConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
        }
    }

    /// How long `publish` waits for the broker's confirm before failing
    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    type Transport = AmqpTransport;

    async fn connect(&self) -> Result<AmqpTransport, RabbitMQError> {
        let state = Arc::new(ConnectionState::default());

        let connection = open_rabbit_connection(&self.config, state.clone()).await?;

        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let channel = match open_rabbit_channel(&connection, signals_tx, state.clone()).await {
            Ok(channel) => channel,
            Err(err) => {
                let _ = connection.close().await;
                return Err(err);
            }
        };

        let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();

        Ok(AmqpTransport {
            connection,
            channel,
            state,
            signals: signals_rx,
            deliveries_tx,
            deliveries_rx,
            publish_seq: 0,
            confirm_timeout: self.confirm_timeout,
            blocked_connection_timeout: self.config.blocked_connection_timeout,
        })
    }

    fn address(&self) -> String {
        self.config.display_address()
    }
}

/// Connection-wide state shared with the amqprs callbacks
#[derive(Default)]
struct ConnectionState {
    blocked_since: Mutex<Option<Instant>>,
    lost: CancellationToken,
}

impl ConnectionState {
    fn mark_lost(&self) {
        self.lost.cancel();
    }

    fn blocked_for(&self) -> Option<Duration> {
        self.blocked_since.lock().as_ref().map(|since| since.elapsed())
    }
}

/// Outcome of a publish as reported by the channel callback
#[derive(Debug)]
enum ChannelSignal {
    Returned {
        exchange: String,
        routing_key: String,
        reply_code: u16,
        reply_text: String,
    },
    Confirmed { delivery_tag: u64 },
    Rejected { delivery_tag: u64 },
}

/// Transport over a single amqprs channel with publisher confirms enabled
pub struct AmqpTransport {
    connection: Connection,
    channel: Channel,
    state: Arc<ConnectionState>,
    signals: UnboundedReceiver<ChannelSignal>,
    deliveries_tx: UnboundedSender<(String, ConsumerMessage)>,
    deliveries_rx: UnboundedReceiver<(String, ConsumerMessage)>,
    publish_seq: u64,
    confirm_timeout: Duration,
    blocked_connection_timeout: Duration,
}

impl AmqpTransport {
    fn ensure_open(&self) -> Result<(), RabbitMQError> {
        if self.state.lost.is_cancelled() || !self.connection.is_open() {
            return Err(RabbitMQError::ConnectionLost("connection is closed".to_owned()));
        }
        if !self.channel.is_open() {
            return Err(RabbitMQError::ConnectionLost("channel is closed".to_owned()));
        }
        Ok(())
    }

    async fn wait_for_confirm(&mut self, message: &OutboundMessage) -> Result<(), RabbitMQError> {
        let seq = self.publish_seq;
        let mut returned: Option<RabbitMQError> = None;
        let deadline = time::sleep(self.confirm_timeout);
        tokio::pin!(deadline);

        loop {
            select! {
                _ = &mut deadline => {
                    return Err(RabbitMQError::PublishError(format!(
                        "no confirm from broker within {:?}",
                        self.confirm_timeout
                    )));
                }
                _ = self.state.lost.cancelled() => {
                    return Err(RabbitMQError::ConnectionLost(
                        "connection closed while waiting for publish confirm".to_owned(),
                    ));
                }
                signal = self.signals.recv() => match signal {
                    Some(ChannelSignal::Returned { exchange, routing_key, reply_code, reply_text }) => {
                        warn!(
                            "message to {} with routing key {} returned: {} {}",
                            exchange, routing_key, reply_code, reply_text
                        );
                        returned = Some(RabbitMQError::Undeliverable {
                            exchange,
                            routing_key,
                            reply_code,
                            reply_text,
                        });
                    }
                    // One publish is in flight at a time, so any confirm at or
                    // past our sequence number covers it.
                    Some(ChannelSignal::Confirmed { delivery_tag }) => {
                        if delivery_tag >= seq {
                            return match returned {
                                Some(err) => Err(err),
                                None => Ok(()),
                            };
                        }
                        debug!("ignoring stale confirm {} (waiting for {})", delivery_tag, seq);
                    }
                    Some(ChannelSignal::Rejected { delivery_tag }) if delivery_tag >= seq => {
                        return Err(RabbitMQError::PublishError(format!(
                            "broker rejected message for routing key {}",
                            message.routing_key
                        )));
                    }
                    Some(ChannelSignal::Rejected { .. }) => {}
                    None => {
                        return Err(RabbitMQError::ConnectionLost(
                            "channel callback dropped".to_owned(),
                        ));
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn declare_exchange(&mut self, exchange: &ExchangeSpec) -> Result<(), RabbitMQError> {
        let args = ExchangeDeclareArguments::new(&exchange.name, exchange.kind.as_str())
            .durable(exchange.durable)
            .auto_delete(exchange.auto_delete)
            .finish();

        self.channel
            .exchange_declare(args)
            .await
            .map_err(|err| RabbitMQError::ExchangeDeclarationError(err.to_string()))
    }

    async fn declare_queue(&mut self, queue: &QueueSpec) -> Result<(), RabbitMQError> {
        let args = QueueDeclareArguments::new(&queue.name)
            .durable(queue.durable)
            .auto_delete(queue.auto_delete)
            .arguments(queue_arguments_table(queue))
            .finish();

        self.channel
            .queue_declare(args)
            .await
            .map_err(|err| RabbitMQError::QueueDeclarationError(err.to_string()))?;

        Ok(())
    }

    async fn bind_queue(&mut self, binding: &Binding) -> Result<(), RabbitMQError> {
        let args = QueueBindArguments::new(&binding.queue, &binding.exchange, &binding.routing_key);

        self.channel
            .queue_bind(args)
            .await
            .map_err(|err| RabbitMQError::QueueBindingError(err.to_string()))
    }

    async fn set_prefetch(&mut self, prefetch_count: u16) -> Result<(), RabbitMQError> {
        self.channel
            .basic_qos(BasicQosArguments::new(0, prefetch_count, false))
            .await
            .map_err(|err| RabbitMQError::SubscriptionError(err.to_string()))
    }

    async fn consume(&mut self, queue: &str) -> Result<String, RabbitMQError> {
        let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());
        let args = BasicConsumeArguments::new(queue, &consumer_tag)
            .auto_ack(false)
            .finish();

        let (ctag, mut rx) = self
            .channel
            .basic_consume_rx(args)
            .await
            .map_err(|err| RabbitMQError::SubscriptionError(err.to_string()))?;

        // All consumers of this channel feed one stream; a consumer stream
        // ending means the channel is gone.
        let merged = self.deliveries_tx.clone();
        let state = self.state.clone();
        let tag = ctag.clone();
        let queue = queue.to_owned();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if merged.send((queue.clone(), message)).is_err() {
                    return;
                }
            }
            debug!("consumer {} stream ended", tag);
            state.mark_lost();
        });

        Ok(ctag)
    }

    async fn next_delivery(&mut self) -> Result<Delivery, RabbitMQError> {
        loop {
            let message = select! {
                biased;
                _ = self.state.lost.cancelled() => {
                    return Err(RabbitMQError::ConnectionLost("broker connection closed".to_owned()));
                }
                message = self.deliveries_rx.recv() => message,
            };

            match message.and_then(|(queue, message)| into_delivery(queue, message)) {
                Some(delivery) => return Ok(delivery),
                None => debug!("skipping consumer message without delivery info"),
            }
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), RabbitMQError> {
        self.channel
            .basic_ack(BasicAckArguments::new(delivery_tag, false))
            .await
            .map_err(|err| RabbitMQError::AckMessageError(err.to_string()))
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), RabbitMQError> {
        self.channel
            .basic_nack(BasicNackArguments::new(delivery_tag, false, requeue))
            .await
            .map_err(|err| RabbitMQError::AckMessageError(err.to_string()))
    }

    async fn publish(&mut self, message: OutboundMessage) -> Result<(), RabbitMQError> {
        self.ensure_open()?;

        if let Some(blocked_for) = self.state.blocked_for() {
            if blocked_for > self.blocked_connection_timeout {
                return Err(RabbitMQError::ConnectionError(format!(
                    "connection blocked by broker for {:?}",
                    blocked_for
                )));
            }
        }

        let args = BasicPublishArguments::new(&message.exchange, &message.routing_key)
            .mandatory(message.mandatory)
            .finish();

        let mut props = BasicProperties::default();
        props
            .with_content_type(CONTENT_TYPE_JSON)
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_headers(headers_table(&message.headers));
        if let Some(message_id) = &message.message_id {
            props.with_message_id(message_id);
        }

        self.channel
            .basic_publish(props, message.body.clone(), args)
            .await
            .map_err(|err| RabbitMQError::PublishError(err.to_string()))?;
        self.publish_seq += 1;

        self.wait_for_confirm(&message).await
    }

    fn is_open(&self) -> bool {
        self.ensure_open().is_ok()
    }

    async fn close(&mut self) -> Result<(), RabbitMQError> {
        let mut result = Ok(());

        if self.channel.is_open() {
            if let Err(err) = self.channel.clone().close().await {
                result = Err(RabbitMQError::CloseChannelError(err.to_string()));
            }
        }
        if self.connection.is_open() {
            if let Err(err) = self.connection.clone().close().await {
                result = Err(RabbitMQError::CloseChannelError(err.to_string()));
            }
        }
        self.state.mark_lost();

        result
    }
}

fn into_delivery(queue: String, message: ConsumerMessage) -> Option<Delivery> {
    let deliver = message.deliver?;
    let headers = message
        .basic_properties
        .as_ref()
        .and_then(|props| props.headers())
        .map(header_map)
        .unwrap_or_default();

    Some(Delivery {
        delivery_tag: deliver.delivery_tag(),
        queue,
        exchange: deliver.exchange().to_owned(),
        routing_key: deliver.routing_key().to_owned(),
        redelivered: deliver.redelivered(),
        headers,
        body: message.content.unwrap_or_default(),
    })
}

/// String view of AMQP headers; non-textual values other than integers are dropped
fn header_map(table: &FieldTable) -> HashMap<String, String> {
    table
        .as_ref()
        .iter()
        .filter_map(|(name, value)| {
            let value = match value {
                FieldValue::S(text) => String::from(text.clone()),
                FieldValue::I(number) => number.to_string(),
                FieldValue::i(number) => number.to_string(),
                FieldValue::l(number) => number.to_string(),
                FieldValue::t(flag) => flag.to_string(),
                _ => return None,
            };
            Some((String::from(name.clone()), value))
        })
        .collect()
}

fn headers_table(headers: &HashMap<String, String>) -> FieldTable {
    let mut table = FieldTable::new();
    for (name, value) in headers {
        match ShortStr::try_from(name.as_str()) {
            Ok(key) => {
                table.insert(key, value.clone().into());
            }
            Err(_) => warn!("dropping header with name longer than 255 bytes: {}", name),
        }
    }
    table
}

fn queue_arguments_table(queue: &QueueSpec) -> FieldTable {
    let mut table = FieldTable::new();
    let arguments = &queue.arguments;

    if let Some(ttl) = arguments.message_ttl {
        let ttl_ms = i32::try_from(ttl.as_millis()).unwrap_or(i32::MAX);
        insert_argument(&mut table, "x-message-ttl", FieldValue::I(ttl_ms));
    }
    if let Some(exchange) = &arguments.dead_letter_exchange {
        insert_argument(&mut table, "x-dead-letter-exchange", exchange.clone().into());
    }
    if let Some(routing_key) = &arguments.dead_letter_routing_key {
        insert_argument(&mut table, "x-dead-letter-routing-key", routing_key.clone().into());
    }

    table
}

fn insert_argument(table: &mut FieldTable, name: &'static str, value: FieldValue) {
    // Static argument names are well below the 255 byte short string limit
    if let Ok(key) = ShortStr::try_from(name) {
        table.insert(key, value);
    }
}

async fn open_rabbit_connection(
    config: &BrokerConfig,
    state: Arc<ConnectionState>,
) -> Result<Connection, RabbitMQError> {
    info!("Attempting to open RabbitMQ connection to: {}", config.display_address());

    let heartbeat = u16::try_from(config.heartbeat.as_secs()).unwrap_or(u16::MAX);
    let mut open_conn_args = OpenConnectionArguments::new(
        &config.host,
        config.port,
        &config.username,
        &config.password,
    );
    open_conn_args
        .virtual_host(&config.virtual_host)
        .heartbeat(heartbeat);
    if let Some(name) = &config.connection_name {
        open_conn_args.connection_name(name);
    }

    let conn = match Connection::open(&open_conn_args.finish()).await {
        Ok(conn) => conn,
        Err(err) => {
            error!("Failed to connect to RabbitMQ: {}", err);
            return Err(RabbitMQError::ConnectionError(err.to_string()));
        }
    };

    if let Err(err) = conn.register_callback(RabbitConnectionCallback { state }).await {
        error!("Failed to register connection callback: {}", err);
        return Err(RabbitMQError::ConnectionError(err.to_string()));
    }

    info!("RabbitMQ connection established successfully");
    Ok(conn)
}

async fn open_rabbit_channel(
    conn: &Connection,
    signals: UnboundedSender<ChannelSignal>,
    state: Arc<ConnectionState>,
) -> Result<Channel, RabbitMQError> {
    let rabbit_channel = conn
        .open_channel(None)
        .await
        .map_err(|err| RabbitMQError::OpenChannelError(err.to_string()))?;

    rabbit_channel
        .register_callback(RabbitChannelCallback { signals, state })
        .await
        .map_err(|err| RabbitMQError::OpenChannelError(err.to_string()))?;

    rabbit_channel
        .confirm_select(ConfirmSelectArguments::default())
        .await
        .map_err(|err| RabbitMQError::OpenChannelError(err.to_string()))?;

    debug!("RabbitMQ channel {} opened", rabbit_channel.channel_id());
    Ok(rabbit_channel)
}

struct RabbitConnectionCallback {
    state: Arc<ConnectionState>,
}

#[async_trait]
impl ConnectionCallback for RabbitConnectionCallback {
    async fn close(
        &mut self,
        _connection: &Connection,
        close: Close,
    ) -> Result<(), amqprs::error::Error> {
        warn!("connection closed by broker {:?}", close);
        self.state.mark_lost();
        Ok(())
    }

    async fn blocked(&mut self, _connection: &Connection, reason: String) {
        warn!("connection blocked {:?}", reason);
        *self.state.blocked_since.lock() = Some(Instant::now());
    }

    async fn unblocked(&mut self, _connection: &Connection) {
        info!("connection unblocked");
        *self.state.blocked_since.lock() = None;
    }

    async fn secret_updated(&mut self, _connection: &Connection) {
        debug!("connection secret updated");
    }
}

struct RabbitChannelCallback {
    signals: UnboundedSender<ChannelSignal>,
    state: Arc<ConnectionState>,
}

#[async_trait]
impl ChannelCallback for RabbitChannelCallback {
    async fn close(
        &mut self,
        _channel: &Channel,
        close: CloseChannel,
    ) -> Result<(), amqprs::error::Error> {
        warn!("channel closed by broker {:?}", close);
        self.state.mark_lost();
        Ok(())
    }

    async fn cancel(
        &mut self,
        _channel: &Channel,
        cancel: Cancel,
    ) -> Result<(), amqprs::error::Error> {
        // Consumer cancelled by the broker (e.g. queue deleted)
        warn!("consumer cancelled by broker {:?}", cancel);
        self.state.mark_lost();
        Ok(())
    }

    async fn flow(
        &mut self,
        _channel: &Channel,
        active: bool,
    ) -> Result<bool, amqprs::error::Error> {
        debug!("channel flow {:?}", active);
        Ok(true)
    }

    async fn publish_ack(&mut self, _channel: &Channel, ack: Ack) {
        let _ = self.signals.send(ChannelSignal::Confirmed {
            delivery_tag: ack.delivery_tag(),
        });
    }

    async fn publish_nack(&mut self, _channel: &Channel, nack: Nack) {
        let _ = self.signals.send(ChannelSignal::Rejected {
            delivery_tag: nack.delivery_tag(),
        });
    }

    async fn publish_return(
        &mut self,
        _channel: &Channel,
        ret: Return,
        _props: BasicProperties,
        _content: Vec<u8>,
    ) {
        let _ = self.signals.send(ChannelSignal::Returned {
            exchange: ret.exchange().to_owned(),
            routing_key: ret.routing_key().to_owned(),
            reply_code: ret.reply_code(),
            reply_text: ret.reply_text().to_owned(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::QueueTopology;

    #[test]
    fn headers_survive_table_conversion() {
        let headers = HashMap::from([
            ("event_type".to_owned(), "buyer_deletion".to_owned()),
            ("x-retry-count".to_owned(), "2".to_owned()),
        ]);

        let table = headers_table(&headers);
        assert_eq!(header_map(&table), headers);
    }

    #[test]
    fn overlong_header_names_are_dropped() {
        let headers = HashMap::from([("h".repeat(300), "value".to_owned())]);
        assert!(header_map(&headers_table(&headers)).is_empty());
    }

    #[test]
    fn primary_queue_arguments_carry_ttl_and_dead_letter_routing() {
        let topology = QueueTopology::new("event_bus", "buyer_deletion", "buyer_deletion");
        let table = queue_arguments_table(&topology.primary_queue_spec());
        let arguments = header_map(&table);

        assert_eq!(arguments.get("x-message-ttl").map(String::as_str), Some("86400000"));
        assert_eq!(
            arguments.get("x-dead-letter-exchange").map(String::as_str),
            Some("event_bus-dlx")
        );
        assert_eq!(
            arguments.get("x-dead-letter-routing-key").map(String::as_str),
            Some("buyer_deletion-dlq")
        );
    }

    #[test]
    fn dead_letter_queue_has_no_arguments() {
        let topology = QueueTopology::new("event_bus", "buyer_deletion", "buyer_deletion");
        let table = queue_arguments_table(&topology.dead_letter_queue_spec());
        assert!(header_map(&table).is_empty());
    }
}
