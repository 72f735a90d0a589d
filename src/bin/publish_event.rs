use std::collections::HashMap;

use anyhow::Context;
use auction_events::Config;
use clap::Parser;
use rabbitmq::transport::EVENT_TYPE_HEADER;
use rabbitmq::{AmqpConnector, EventPublisher, ExchangeSpec, RetryConfig};
use serde_json::Value;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Publishes a single event to the event bus")]
struct Args {
    /// Routing key to publish with
    #[arg(short, long)]
    routing_key: String,

    /// Value of the event_type header (defaults to the routing key)
    #[arg(short, long)]
    event_type: Option<String>,

    /// JSON event body
    #[arg(short, long)]
    body: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let body: Value = serde_json::from_str(&args.body).context("event body must be valid JSON")?;
    let config = Config::try_from_env()?;

    let mut publisher = EventPublisher::connect(
        AmqpConnector::new(config.broker),
        ExchangeSpec::direct(&config.exchange),
        RetryConfig::default(),
    )
    .await
    .context("failed to connect to the event bus")?;

    let event_type = args.event_type.unwrap_or_else(|| args.routing_key.clone());
    let headers = HashMap::from([(EVENT_TYPE_HEADER.to_string(), event_type)]);

    let result = publisher.publish_event(&body, &headers, &args.routing_key).await;
    publisher.close().await;
    result.with_context(|| format!("failed to publish event with routing key {}", args.routing_key))?;

    info!("Published event to {} with routing key {}", config.exchange, args.routing_key);
    Ok(())
}
