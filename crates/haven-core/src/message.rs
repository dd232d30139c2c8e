use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who authored a chat message, from the local user's point of view.
///
/// `Ai` covers every counterparty: the assistant in AI rooms and the
/// therapist in peer rooms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Ai,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Audio,
}

/// A chat message as presented to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub content: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub is_read: bool,
}

impl Message {
    /// A text message with a fresh session-unique id.
    pub fn text(content: impl Into<String>, sender: Sender, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            sender,
            timestamp,
            kind: MessageType::Text,
            // Our own messages are read by definition.
            is_read: sender == Sender::User,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let now = Utc::now();
        let a = Message::text("hi", Sender::User, now);
        let b = Message::text("hi", Sender::User, now);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn serializes_with_wire_field_names() {
        let ts = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let msg = Message::text("hello", Sender::Ai, ts).with_id("m1");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["id"], "m1");
        assert_eq!(json["sender"], "ai");
        assert_eq!(json["type"], "text");
        assert_eq!(json["isRead"], false);
        assert_eq!(json["timestamp"], "2024-05-01T10:00:00Z");
    }
}
