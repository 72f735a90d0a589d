//--------------------------------------------------------------------------------------------------
// STRUCTS & TRAITS
//--------------------------------------------------------------------------------------------------
// | Name            | Description                                       | Key Methods       |
// |-----------------|---------------------------------------------------|-------------------|
// | EventHandler    | Business logic for one or more event types        | handle            |
// | HandlerRegistry | Event type -> handler mapping (one per type)      | register, get     |
//--------------------------------------------------------------------------------------------------

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::HandlerError;

/// Event handler trait for processing decoded event bodies.
///
/// A message is acknowledged only after `handle` returns `Ok`, so the same
/// body can arrive more than once (e.g. the process dies between the handler
/// returning and the ack reaching the broker). Implementations must be
/// idempotent with respect to repeated delivery.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event_body: &Value) -> Result<(), HandlerError>;
}

/// Maps event-type strings to their handler.
///
/// Populated during setup, before the subscriber starts consuming.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `event_type`. A second registration for the
    /// same type replaces the first one; the replaced handler is returned.
    pub fn register(
        &mut self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Option<Arc<dyn EventHandler>> {
        let previous = self.handlers.insert(event_type.to_owned(), handler);
        if previous.is_some() {
            warn!(
                "Handler for event type '{}' registered twice; the last registration wins",
                event_type
            );
        } else {
            debug!("Registered handler for event type: {}", event_type);
        }
        previous
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(event_type).cloned()
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
