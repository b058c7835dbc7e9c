//! Message types for the Courier protocol.
//!
//! A [`Message`] is the only unit of wire exchange. Its `toID` selects the
//! destination class: a session id, the main room or the server itself.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Routing alias meaning "broadcast to everyone".
pub const MAIN_ROOM_ID: &str = "mainRoom";

/// Synthetic sender/recipient for control messages.
pub const SERVER_ID: &str = "server";

/// Message type identifiers.
///
/// Unknown strings survive decoding as [`MessageType::Other`] so that a
/// client speaking a newer dialect is not disconnected for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum MessageType {
    /// Direct message to one session.
    Request,
    /// Main room chat message.
    Message,
    /// Identity announcement or nickname registration.
    Registration,
    /// Error reply from the server.
    Error,
    /// A session registered.
    NewUser,
    /// A session left.
    GoneUser,
    /// Any other type string, kept verbatim.
    Other(String),
}

impl MessageType {
    /// Get the wire name of this type.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Request => "request",
            MessageType::Message => "message",
            MessageType::Registration => "registration",
            MessageType::Error => "error",
            MessageType::NewUser => "newUser",
            MessageType::GoneUser => "goneUser",
            MessageType::Other(other) => other,
        }
    }
}

impl Default for MessageType {
    fn default() -> Self {
        MessageType::Other(String::new())
    }
}

impl From<MessageType> for String {
    fn from(mt: MessageType) -> String {
        match mt {
            MessageType::Other(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "request" => MessageType::Request,
            "message" => MessageType::Message,
            "registration" => MessageType::Registration,
            "error" => MessageType::Error,
            "newUser" => MessageType::NewUser,
            "goneUser" => MessageType::GoneUser,
            _ => MessageType::Other(value),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decode `null` the same as an absent field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A protocol message.
///
/// Absent and `null` fields decode as empty strings; emptiness is judged by
/// the router's validation, not by the decoder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Message {
    /// Identity of the sender.
    #[serde(rename = "fromID", deserialize_with = "null_as_default")]
    pub from_id: String,
    /// Destination: a session id, `mainRoom` or `server`.
    #[serde(rename = "toID", deserialize_with = "null_as_default")]
    pub to_id: String,
    /// Message type.
    #[serde(rename = "messageType", deserialize_with = "null_as_default")]
    pub message_type: MessageType,
    /// Opaque payload.
    #[serde(deserialize_with = "null_as_default")]
    pub body: String,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(
        from_id: impl Into<String>,
        to_id: impl Into<String>,
        message_type: MessageType,
        body: impl Into<String>,
    ) -> Self {
        Self {
            from_id: from_id.into(),
            to_id: to_id.into(),
            message_type,
            body: body.into(),
        }
    }

    /// The identity announcement sent to a client right after it connects.
    #[must_use]
    pub fn registration(id: &str) -> Self {
        Self::new(SERVER_ID, id, MessageType::Registration, id)
    }

    /// An error reply from the server.
    #[must_use]
    pub fn error(to_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(SERVER_ID, to_id, MessageType::Error, body)
    }

    /// A presence notice about `subject` addressed to `to_id`.
    #[must_use]
    pub fn presence(kind: MessageType, to_id: impl Into<String>, subject: impl Into<String>) -> Self {
        Self::new(SERVER_ID, to_id, kind, subject)
    }

    /// A main room chat message.
    #[must_use]
    pub fn main_room(from_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(from_id, MAIN_ROOM_ID, MessageType::Message, body)
    }

    /// Check if this message is addressed to the main room.
    #[must_use]
    pub fn is_for_main_room(&self) -> bool {
        self.to_id == MAIN_ROOM_ID
    }

    /// Check if this message is addressed to the server.
    #[must_use]
    pub fn is_for_server(&self) -> bool {
        self.to_id == SERVER_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_wire_names() {
        assert_eq!(String::from(MessageType::NewUser), "newUser");
        assert_eq!(MessageType::from("goneUser".to_string()), MessageType::GoneUser);
        assert_eq!(
            MessageType::from("typing".to_string()),
            MessageType::Other("typing".into())
        );
        assert_eq!(MessageType::default().as_str(), "");
    }

    #[test]
    fn test_registration_announcement() {
        let msg = Message::registration("c0ffee");
        assert_eq!(msg.from_id, SERVER_ID);
        assert_eq!(msg.to_id, "c0ffee");
        assert_eq!(msg.message_type, MessageType::Registration);
        assert_eq!(msg.body, "c0ffee");
    }

    #[test]
    fn test_wire_field_names() {
        let msg = Message::main_room("a", "hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "fromID": "a",
                "toID": "mainRoom",
                "messageType": "message",
                "body": "hi"
            })
        );
    }

    #[test]
    fn test_missing_fields_default_to_empty() {
        let msg: Message = serde_json::from_str(r#"{"toID": "server"}"#).unwrap();
        assert!(msg.from_id.is_empty());
        assert!(msg.body.is_empty());
        assert!(msg.is_for_server());
        assert_eq!(msg.message_type, MessageType::default());
    }

    #[test]
    fn test_null_fields_default_to_empty() {
        let msg: Message = serde_json::from_str(
            r#"{"fromID": "a", "toID": null, "messageType": null, "body": null}"#,
        )
        .unwrap();
        assert_eq!(msg.from_id, "a");
        assert!(msg.to_id.is_empty());
        assert!(msg.body.is_empty());
        assert_eq!(msg.message_type, MessageType::default());
    }
}
