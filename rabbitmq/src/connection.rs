use tokio::time;
use tracing::{debug, error, info, warn};

use crate::config::RetryConfig;
use crate::error::RabbitMQError;
use crate::topology::ExchangeSpec;
use crate::transport::{Connector, Transport};

/// Owns the broker connection/channel pair of one publisher or subscriber.
///
/// The pair is never shared and never repaired: any fault tears it down and
/// the next `connect_with_retry` builds a fresh one, redeclaring the
/// requested exchanges.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    exchanges: Vec<ExchangeSpec>,
    retry: RetryConfig,
    transport: Option<C::Transport>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, exchanges: Vec<ExchangeSpec>, retry: RetryConfig) -> Self {
        Self {
            connector,
            exchanges,
            retry,
            transport: None,
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn exchanges(&self) -> &[ExchangeSpec] {
        &self.exchanges
    }

    pub fn is_connected(&self) -> bool {
        self.transport
            .as_ref()
            .map(|transport| transport.is_open())
            .unwrap_or(false)
    }

    /// Single connection attempt: open, then declare every requested exchange
    pub async fn connect(&mut self) -> Result<(), RabbitMQError> {
        self.disconnect().await;

        let mut transport = self.connector.connect().await?;
        for exchange in &self.exchanges {
            if let Err(err) = transport.declare_exchange(exchange).await {
                let _ = transport.close().await;
                return Err(err);
            }
            debug!("declared {} exchange {}", exchange.kind, exchange.name);
        }

        self.transport = Some(transport);
        Ok(())
    }

    /// Up to `retry.attempts` connection attempts, `retry.delay` apart.
    ///
    /// # Errors
    /// `ConnectionError` once every attempt failed; declaration errors are
    /// returned immediately since retrying cannot fix them.
    pub async fn connect_with_retry(&mut self) -> Result<(), RabbitMQError> {
        let address = self.connector.address();

        for attempt in 1..=self.retry.attempts {
            match self.connect().await {
                Ok(()) => {
                    info!("Connected to RabbitMQ at {}", address);
                    return Ok(());
                }
                Err(err) if err.is_connection_fault() => {
                    warn!(
                        "Connection attempt {} of {} to {} failed: {}",
                        attempt, self.retry.attempts, address, err
                    );
                    if attempt < self.retry.attempts {
                        time::sleep(self.retry.delay).await;
                    }
                }
                Err(err) => {
                    error!("Failed to set up connection to {}: {}", address, err);
                    return Err(err);
                }
            }
        }

        Err(RabbitMQError::ConnectionError(format!(
            "failed to connect to {} after {} attempts",
            address, self.retry.attempts
        )))
    }

    pub fn transport_mut(&mut self) -> Result<&mut C::Transport, RabbitMQError> {
        self.transport.as_mut().ok_or(RabbitMQError::NotConnected)
    }

    /// Best-effort teardown; secondary errors are logged and swallowed
    pub async fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(err) = transport.close().await {
                debug!("ignoring error while closing connection: {}", err);
            }
        }
    }
}
