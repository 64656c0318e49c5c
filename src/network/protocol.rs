//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! One JSON object per text frame, tagged by its `type` field.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Welcome text sent with the `connection` envelope.
pub const WELCOME_MESSAGE: &str = "Connected to AI Companion WebSocket server";

/// Error text and close reason for rejected connections.
pub const AUTH_FAILED_MESSAGE: &str = "Authentication failed";

/// `command_result` text when a skin change was handed off.
pub const SKIN_UPDATED_MESSAGE: &str = "Skin updated successfully";

/// `command_result` text when a skin change could not be handed off.
pub const SKIN_FAILED_MESSAGE: &str =
    "Failed to update skin, companion not found or error occurred";

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Liveness check.
    Ping,
    /// Command for the simulation.
    Command(CommandMessage),
}

/// A `command` envelope: the command name plus its remaining fields.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandMessage {
    /// Command name.
    pub command: String,
    /// Command-specific fields, `type` and `command` excluded.
    pub fields: Map<String, Value>,
}

impl CommandMessage {
    /// A field's value if present and a string.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

/// Inbound parse failures. None of them close the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame is not valid JSON.
    #[error("invalid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    /// Frame is JSON but not an object.
    #[error("message must be a JSON object")]
    NotAnObject,
    /// A required string field is absent.
    #[error("missing string field `{0}`")]
    MissingField(&'static str),
    /// `type` names no known message.
    #[error("Unknown message type: {0}")]
    UnknownType(String),
}

impl ProtocolError {
    /// Text for the `error` envelope sent back to the client.
    pub fn client_message(&self) -> String {
        match self {
            ProtocolError::UnknownType(_) => self.to_string(),
            _ => format!("Error processing message: {}", self),
        }
    }
}

impl ClientMessage {
    /// Parse one inbound text frame.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        let Value::Object(mut fields) = serde_json::from_str::<Value>(s)? else {
            return Err(ProtocolError::NotAnObject);
        };

        let kind = match fields.remove("type") {
            Some(Value::String(kind)) => kind,
            _ => return Err(ProtocolError::MissingField("type")),
        };

        match kind.as_str() {
            "ping" => Ok(ClientMessage::Ping),
            "command" => {
                let command = match fields.remove("command") {
                    Some(Value::String(command)) => command,
                    _ => return Err(ProtocolError::MissingField("command")),
                };
                Ok(ClientMessage::Command(CommandMessage { command, fields }))
            }
            _ => Err(ProtocolError::UnknownType(kind)),
        }
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection accepted.
    Connection {
        /// Identity assigned to this client.
        #[serde(rename = "clientId")]
        client_id: String,
        /// Welcome text.
        message: String,
    },

    /// Ping response.
    Pong {
        /// Server time, epoch milliseconds.
        timestamp: i64,
    },

    /// Outcome of a command the server handles directly.
    CommandResult {
        /// Command name, echoed.
        command: String,
        /// Whether the command was accepted for execution.
        success: bool,
        /// Human-readable outcome.
        message: String,
    },

    /// Command received but not handled here.
    CommandAck {
        /// Command name, echoed.
        command: String,
        /// Always `received`.
        status: AckStatus,
    },

    /// Error message.
    Error {
        /// Human-readable description.
        message: String,
    },
}

/// `command_ack` status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// The server accepted the frame; nothing more is promised.
    Received,
}

impl ServerMessage {
    /// Welcome envelope for a freshly authenticated client.
    pub fn connection(client_id: impl ToString) -> Self {
        ServerMessage::Connection {
            client_id: client_id.to_string(),
            message: WELCOME_MESSAGE.to_string(),
        }
    }

    /// Pong stamped with the current server time.
    pub fn pong_now() -> Self {
        ServerMessage::Pong {
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Command result.
    pub fn command_result(command: impl Into<String>, success: bool, message: impl Into<String>) -> Self {
        ServerMessage::CommandResult {
            command: command.into(),
            success,
            message: message.into(),
        }
    }

    /// Acknowledgment for a command without a dedicated handler.
    pub fn command_ack(command: impl Into<String>) -> Self {
        ServerMessage::CommandAck {
            command: command.into(),
            status: AckStatus::Received,
        }
    }

    /// Error envelope.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_value(msg: &ServerMessage) -> Value {
        serde_json::from_str(&msg.to_json().unwrap()).unwrap()
    }

    #[test]
    fn test_parse_ping() {
        assert_eq!(ClientMessage::from_json(r#"{"type":"ping"}"#).unwrap(), ClientMessage::Ping);
    }

    #[test]
    fn test_parse_skin_command() {
        let msg = ClientMessage::from_json(
            r#"{"type":"command","command":"skin","companionId":"e1","skinType":"custom","skinPath":"/x.png"}"#,
        )
        .unwrap();

        let ClientMessage::Command(cmd) = msg else {
            panic!("Wrong message type");
        };
        assert_eq!(cmd.command, "skin");
        assert_eq!(cmd.str_field("companionId"), Some("e1"));
        assert_eq!(cmd.str_field("skinType"), Some("custom"));
        assert_eq!(cmd.str_field("skinPath"), Some("/x.png"));
        assert!(!cmd.fields.contains_key("type"));
        assert!(!cmd.fields.contains_key("command"));
    }

    #[test]
    fn test_parse_failures() {
        assert!(matches!(
            ClientMessage::from_json("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            ClientMessage::from_json("[1,2]"),
            Err(ProtocolError::NotAnObject)
        ));
        assert!(matches!(
            ClientMessage::from_json(r#"{"command":"skin"}"#),
            Err(ProtocolError::MissingField("type"))
        ));
        assert!(matches!(
            ClientMessage::from_json(r#"{"type":7}"#),
            Err(ProtocolError::MissingField("type"))
        ));
        assert!(matches!(
            ClientMessage::from_json(r#"{"type":"command"}"#),
            Err(ProtocolError::MissingField("command"))
        ));
    }

    #[test]
    fn test_unknown_type_named_in_error() {
        let err = ClientMessage::from_json(r#"{"type":"dance"}"#).unwrap_err();
        assert_eq!(err.client_message(), "Unknown message type: dance");

        let err = ClientMessage::from_json("{").unwrap_err();
        assert!(err.client_message().starts_with("Error processing message: "));
    }

    #[test]
    fn test_non_string_fields_read_as_absent() {
        let msg = ClientMessage::from_json(
            r#"{"type":"command","command":"skin","companionId":5,"skinType":null}"#,
        )
        .unwrap();

        let ClientMessage::Command(cmd) = msg else {
            panic!("Wrong message type");
        };
        assert_eq!(cmd.str_field("companionId"), None);
        assert_eq!(cmd.str_field("skinType"), None);
        assert_eq!(cmd.str_field("skinPath"), None);
    }

    #[test]
    fn test_outbound_shapes() {
        assert_eq!(
            as_value(&ServerMessage::connection("abc")),
            json!({"type": "connection", "clientId": "abc", "message": WELCOME_MESSAGE})
        );
        assert_eq!(
            as_value(&ServerMessage::Pong { timestamp: 42 }),
            json!({"type": "pong", "timestamp": 42})
        );
        assert_eq!(
            as_value(&ServerMessage::command_result("skin", true, SKIN_UPDATED_MESSAGE)),
            json!({"type": "command_result", "command": "skin", "success": true, "message": SKIN_UPDATED_MESSAGE})
        );
        assert_eq!(
            as_value(&ServerMessage::command_ack("foo")),
            json!({"type": "command_ack", "command": "foo", "status": "received"})
        );
        assert_eq!(
            as_value(&ServerMessage::error("boom")),
            json!({"type": "error", "message": "boom"})
        );
    }

    #[test]
    fn test_pong_uses_current_time() {
        let before = Utc::now().timestamp_millis();
        let ServerMessage::Pong { timestamp } = ServerMessage::pong_now() else {
            panic!("Wrong message type");
        };
        assert!(timestamp >= before);
    }
}
