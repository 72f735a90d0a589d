use std::env;

use dotenv::dotenv;
use rabbitmq::{BrokerConfig, RedeliveryPolicy};
use tracing::info;

const RABBITMQ_HOST: &str = "RABBITMQ_HOST";
const RABBITMQ_PORT: &str = "RABBITMQ_PORT";
const RABBITMQ_DEFAULT_USER: &str = "RABBITMQ_DEFAULT_USER";
const RABBITMQ_DEFAULT_PASS: &str = "RABBITMQ_DEFAULT_PASS";
const RABBITMQ_VHOST: &str = "RABBITMQ_VHOST";
const EVENT_BUS_EXCHANGE: &str = "EVENT_BUS_EXCHANGE";
const EVENT_MAX_DELIVERIES: &str = "EVENT_MAX_DELIVERIES";

pub const DEFAULT_EXCHANGE: &str = "event_bus";
const CONNECTION_NAME: &str = "auction-events";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value '{value}' for environment variable {name}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerConfig,
    pub exchange: String,
    pub redelivery: RedeliveryPolicy,
}

impl Config {
    pub fn try_from_env() -> Result<Config, ConfigError> {
        // Load .env file
        dotenv().ok();

        Self::try_from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from any variable source
    pub fn try_from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Config, ConfigError> {
        let required = |name: &'static str| lookup(name).ok_or(ConfigError::Missing(name));

        let host = required(RABBITMQ_HOST)?;
        let port_str = required(RABBITMQ_PORT)?;
        let port = port_str
            .trim()
            .parse::<u16>()
            .map_err(|_| ConfigError::Invalid {
                name: RABBITMQ_PORT,
                value: port_str.clone(),
            })?;
        let username = required(RABBITMQ_DEFAULT_USER)?;
        let password = required(RABBITMQ_DEFAULT_PASS)?;

        let mut broker = BrokerConfig::new(host.trim(), port, &username, &password)
            .with_connection_name(CONNECTION_NAME);
        if let Some(vhost) = lookup(RABBITMQ_VHOST) {
            broker = broker.with_virtual_host(vhost.trim());
        }

        let exchange = lookup(EVENT_BUS_EXCHANGE).unwrap_or_else(|| DEFAULT_EXCHANGE.to_string());

        let redelivery = match lookup(EVENT_MAX_DELIVERIES) {
            None => RedeliveryPolicy::Unbounded,
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(max) if max > 0 => RedeliveryPolicy::DeadLetterAfter(max),
                _ => {
                    return Err(ConfigError::Invalid {
                        name: EVENT_MAX_DELIVERIES,
                        value: raw,
                    });
                }
            },
        };

        info!(
            "Loaded event bus config: broker {} exchange {} redelivery {:?}",
            broker.display_address(),
            exchange,
            redelivery
        );

        Ok(Config {
            broker,
            exchange,
            redelivery,
        })
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            broker: BrokerConfig::new("localhost", 5672, "guest", "guest")
                .with_connection_name(CONNECTION_NAME),
            exchange: DEFAULT_EXCHANGE.to_string(),
            redelivery: RedeliveryPolicy::Unbounded,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let vars: HashMap<&str, &str> = vars.iter().copied().collect();
        move |name: &str| vars.get(name).map(|value| value.to_string())
    }

    const BASE: [(&str, &str); 4] = [
        ("RABBITMQ_HOST", "rabbitmq"),
        ("RABBITMQ_PORT", "5672"),
        ("RABBITMQ_DEFAULT_USER", "auction"),
        ("RABBITMQ_DEFAULT_PASS", "secret"),
    ];

    #[test]
    fn reads_broker_settings_with_defaults() {
        let config = Config::try_from_lookup(lookup_from(&BASE)).unwrap();

        assert_eq!(config.broker.host, "rabbitmq");
        assert_eq!(config.broker.port, 5672);
        assert_eq!(config.broker.username, "auction");
        assert_eq!(config.broker.virtual_host, "/");
        assert_eq!(config.exchange, "event_bus");
        assert_eq!(config.redelivery, RedeliveryPolicy::Unbounded);
    }

    #[test]
    fn optional_settings_override_defaults() {
        let mut vars = BASE.to_vec();
        vars.push(("RABBITMQ_VHOST", "auctions"));
        vars.push(("EVENT_BUS_EXCHANGE", "staging_bus"));
        vars.push(("EVENT_MAX_DELIVERIES", "5"));

        let config = Config::try_from_lookup(lookup_from(&vars)).unwrap();

        assert_eq!(config.broker.virtual_host, "auctions");
        assert_eq!(config.exchange, "staging_bus");
        assert_eq!(config.redelivery, RedeliveryPolicy::DeadLetterAfter(5));
    }

    #[test]
    fn missing_host_is_reported() {
        let err = Config::try_from_lookup(lookup_from(&BASE[1..])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("RABBITMQ_HOST"));
        assert_eq!(err.to_string(), "failed to load environment variable RABBITMQ_HOST");
    }

    #[test]
    fn garbled_numbers_are_rejected() {
        let mut vars = BASE.to_vec();
        vars[1] = ("RABBITMQ_PORT", "amqp");
        assert!(matches!(
            Config::try_from_lookup(lookup_from(&vars)),
            Err(ConfigError::Invalid { name: "RABBITMQ_PORT", .. })
        ));

        let mut vars = BASE.to_vec();
        vars.push(("EVENT_MAX_DELIVERIES", "0"));
        assert!(matches!(
            Config::try_from_lookup(lookup_from(&vars)),
            Err(ConfigError::Invalid { name: "EVENT_MAX_DELIVERIES", .. })
        ));
    }
}
