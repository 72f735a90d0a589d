use std::time::Duration;

/// Connection parameters for the broker.
///
/// The core never reads environment state; the embedding application builds
/// this value and hands it to a [`Connector`](crate::Connector).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub virtual_host: String,
    /// Heartbeat negotiated with the broker
    pub heartbeat: Duration,
    /// How long the broker may keep the connection blocked (resource alarm)
    /// before publishing on it is treated as a connection failure
    pub blocked_connection_timeout: Duration,
    /// Name shown in the broker management UI
    pub connection_name: Option<String>,
}

impl BrokerConfig {
    pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(600);
    pub const PUBLISHER_BLOCKED_TIMEOUT: Duration = Duration::from_secs(300);
    pub const SUBSCRIBER_BLOCKED_TIMEOUT: Duration = Duration::from_secs(600);

    pub fn new(host: &str, port: u16, username: &str, password: &str) -> Self {
        Self {
            host: host.to_owned(),
            port,
            username: username.to_owned(),
            password: password.to_owned(),
            virtual_host: "/".to_owned(),
            heartbeat: Self::DEFAULT_HEARTBEAT,
            blocked_connection_timeout: Self::PUBLISHER_BLOCKED_TIMEOUT,
            connection_name: None,
        }
    }

    pub fn with_virtual_host(mut self, virtual_host: &str) -> Self {
        self.virtual_host = virtual_host.to_owned();
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_blocked_connection_timeout(mut self, timeout: Duration) -> Self {
        self.blocked_connection_timeout = timeout;
        self
    }

    pub fn with_connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_owned());
        self
    }

    /// `host:port/vhost`, safe to log (no credentials)
    pub fn display_address(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.virtual_host)
    }
}

/// Connect-with-retry policy used at construction and by the publisher's
/// reconnect cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(5),
        }
    }
}

/// Capped exponential backoff applied by the subscriber between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// What happens to a message whose handler keeps failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedeliveryPolicy {
    /// `nack(requeue = true)` on every failure, with no limit.
    #[default]
    Unbounded,
    /// Republish with an incremented `x-retry-count` header until the count
    /// reaches the given number of deliveries, then dead-letter the message.
    DeadLetterAfter(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_client() {
        let config = BrokerConfig::new("localhost", 5672, "guest", "guest");
        assert_eq!(config.heartbeat, Duration::from_secs(600));
        assert_eq!(config.blocked_connection_timeout, Duration::from_secs(300));
        assert_eq!(config.virtual_host, "/");

        let retry = RetryConfig::default();
        assert_eq!(retry.attempts, 5);
        assert_eq!(retry.delay, Duration::from_secs(5));

        let reconnect = ReconnectPolicy::default();
        assert_eq!(reconnect.initial_delay, Duration::from_secs(5));
        assert_eq!(reconnect.max_delay, Duration::from_secs(60));

        assert_eq!(RedeliveryPolicy::default(), RedeliveryPolicy::Unbounded);
    }

    #[test]
    fn display_address_hides_credentials() {
        let config = BrokerConfig::new("rabbit", 5673, "admin", "s3cret").with_virtual_host("/auctions");
        let address = config.display_address();
        assert_eq!(address, "rabbit:5673/auctions");
        assert!(!address.contains("s3cret"));
    }
}
