use std::sync::Arc;

use async_trait::async_trait;
use rabbitmq::{EventHandler, HandlerError};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::auctions::AuctionStore;
use crate::events::UserDeleted;

/// Cleans up the auctions of a user removed by the accounts service.
///
/// Non-draft auctions are kept for history with status `Deleted`; drafts are
/// removed outright. Running it twice for the same user changes nothing.
pub struct UserDeletedHandler<S> {
    store: Arc<S>,
}

impl<S: AuctionStore> UserDeletedHandler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: AuctionStore + 'static> EventHandler for UserDeletedHandler<S> {
    async fn handle(&self, event_body: &Value) -> Result<(), HandlerError> {
        // An event without a user id matches no auctions
        let event = match UserDeleted::deserialize(event_body) {
            Ok(event) => event,
            Err(err) => {
                warn!("Ignoring user deleted event {}: {}", event_body, err);
                return Ok(());
            }
        };
        info!("Handling user deleted event for user {}", event.user_id);

        let deleted = self
            .store
            .mark_deleted_except_drafts(&event.user_id)
            .await
            .map_err(anyhow::Error::from)?;
        let removed = self
            .store
            .delete_drafts(&event.user_id)
            .await
            .map_err(anyhow::Error::from)?;

        debug!(
            "User {}: {} auctions marked deleted, {} drafts removed",
            event.user_id, deleted, removed
        );
        Ok(())
    }
}

/// Logs every event it receives under a name, for wiring checks
pub struct LoggingHandler {
    name: String,
}

impl LoggingHandler {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event_body: &Value) -> Result<(), HandlerError> {
        info!("Handler '{}' has received event: {}", self.name, event_body);
        Ok(())
    }
}
