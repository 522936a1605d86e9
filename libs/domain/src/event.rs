//! Server events consumed from the platform event bus

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::ServerId;
use crate::value::Value;

/// A typed event emitted by a managed game server.
///
/// `data` carries an arbitrary nested payload (chat message fields, player
/// identity, connection info, ...) and is always a map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEvent {
    /// Event type, e.g. `chat_message`, `player_connected`
    #[serde(rename = "type")]
    pub event_type: String,

    /// The server this event originated from
    pub server_id: ServerId,

    /// Arbitrary nested event payload
    #[serde(default = "Value::empty_map")]
    pub data: Value,
}

impl ServerEvent {
    /// Create a new event with a map payload
    #[must_use]
    pub fn new(event_type: impl Into<String>, server_id: ServerId, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            server_id,
            data,
        }
    }

    /// The view trigger conditions are evaluated against: the event payload
    /// exposed under the `trigger_event` root.
    #[must_use]
    pub fn payload_view(&self) -> Value {
        let mut root = BTreeMap::new();
        root.insert("trigger_event".to_string(), self.data.clone());
        Value::Map(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_view_exposes_trigger_event_root() {
        let event = ServerEvent::new(
            "chat_message",
            ServerId::new(),
            Value::from_json(serde_json::json!({ "message": "hello" })),
        );
        let view = event.payload_view();
        assert_eq!(
            view.resolve_path("trigger_event.message"),
            Some(&Value::String("hello".to_string()))
        );
    }

    #[test]
    fn test_deserialize_wire_shape() {
        let event: ServerEvent = serde_json::from_str(
            r#"{"type":"player_connected","server_id":"8d3f7a8e-4a1c-4c6f-9d3e-2b1a0c9d8e7f","data":{"steam_id":"765"}}"#,
        )
        .unwrap();
        assert_eq!(event.event_type, "player_connected");
        assert_eq!(
            event.data.resolve_path("steam_id"),
            Some(&Value::String("765".to_string()))
        );
    }
}
