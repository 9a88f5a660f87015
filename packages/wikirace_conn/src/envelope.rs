//! Wire envelope: the JSON unit exchanged with the game server.
//!
//! ```json
//! { "command": "return_settings", "payload": { ... }, "error_message": "" }
//! ```
//!
//! An absent or empty `error_message` means success. The server places a few
//! fields outside the payload (`notify_id` carries `client_id` at top level),
//! so unknown top-level keys are kept in `extra` rather than discarded.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub command: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// Build an outbound envelope. Requests never carry `error_message`.
    pub fn request(command: &str, payload: Value) -> Self {
        Self {
            command: command.to_string(),
            payload,
            error_message: None,
            extra: Map::new(),
        }
    }

    /// True when the server flagged this envelope as a failure.
    pub fn is_error(&self) -> bool {
        self.error_text().is_some()
    }

    /// The non-empty error text, if any.
    pub fn error_text(&self) -> Option<&str> {
        self.error_message.as_deref().filter(|m| !m.is_empty())
    }

    /// Client id assigned by the server. Looked up at top level first, then
    /// inside the payload.
    pub fn client_id(&self) -> Option<&str> {
        self.extra
            .get("client_id")
            .and_then(Value::as_str)
            .or_else(|| self.payload.get("client_id").and_then(Value::as_str))
            .filter(|id| !id.is_empty())
    }

    /// Deserialize the payload into a concrete type.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
