use std::collections::HashMap;

use rabbitmq::transport::EVENT_TYPE_HEADER;
use serde::{Deserialize, Serialize};

/// Published by the accounts service when a user account is removed.
/// Used as event type, routing key and queue name.
pub const BUYER_DELETION: &str = "buyer_deletion";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDeleted {
    pub user_id: String,
}

pub fn user_deleted_headers() -> HashMap<String, String> {
    HashMap::from([(EVENT_TYPE_HEADER.to_string(), BUYER_DELETION.to_string())])
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn user_deleted_wire_format() {
        let event = UserDeleted {
            user_id: "4f1c".to_string(),
        };
        assert_eq!(serde_json::to_value(&event).unwrap(), json!({"user_id": "4f1c"}));
        assert_eq!(
            user_deleted_headers().get("event_type").map(String::as_str),
            Some("buyer_deletion")
        );
    }
}
