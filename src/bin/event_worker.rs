use std::sync::Arc;

use anyhow::Context;
use auction_events::{
    BUYER_DELETION, Config, InMemoryAuctionStore, LoggingHandler, UserDeletedHandler,
};
use clap::Parser;
use rabbitmq::{AmqpConnector, BrokerConfig, EventSubscriber, RetryConfig};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Consumes auction service events from the event bus")]
struct Args {
    /// Queue to consume user deletions from
    #[arg(short, long, default_value = BUYER_DELETION)]
    queue: String,

    /// Routing key the queue is bound with
    #[arg(short, long, default_value = BUYER_DELETION)]
    routing_key: String,

    /// Extra event types to log without processing
    #[arg(short, long)]
    log_event: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = Config::try_from_env()?;

    info!("Connecting to RabbitMQ at: {}", config.broker.display_address());
    let connector = AmqpConnector::new(
        config
            .broker
            .clone()
            .with_blocked_connection_timeout(BrokerConfig::SUBSCRIBER_BLOCKED_TIMEOUT),
    );
    let mut subscriber = EventSubscriber::connect(connector, &config.exchange, RetryConfig::default())
        .await
        .context("failed to connect to the event bus")?
        .with_redelivery_policy(config.redelivery);

    let store = Arc::new(InMemoryAuctionStore::new());
    subscriber.register_handler(BUYER_DELETION, Arc::new(UserDeletedHandler::new(store)));
    for event_type in &args.log_event {
        subscriber.register_handler(event_type, Arc::new(LoggingHandler::new(event_type)));
    }

    subscriber
        .subscribe_events(&args.queue, &args.routing_key)
        .await
        .with_context(|| format!("failed to subscribe to queue {}", args.queue))?;

    let stop = subscriber.stop_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(err) => error!("Failed to listen for shutdown signal: {}", err),
        }
        stop.cancel();
    });

    info!("Waiting for events on {} queue...", args.queue);
    subscriber.start().await?;

    Ok(())
}
