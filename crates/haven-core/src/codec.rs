//! Wire format for the chat socket.
//!
//! Inbound frames are JSON objects told apart by shape:
//!
//! | shape | category |
//! |---|---|
//! | `{"type": "peer-id-broadcast", "data": {...}}` | signaling |
//! | `{"type": "typing", "data": {...}}` | typing indicator |
//! | `{"type": <other>}` | control |
//! | `{"vina": ...}` | assistant / counterparty reply |
//! | `{"content", "sender", "timestamp"}` | unified peer chat frame |
//! | `{"human": ...}` | echo of the local user's own message |

use std::sync::LazyLock;

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::errors::HavenError;
use crate::message::{Message, Sender};

pub const PEER_ID_BROADCAST: &str = "peer-id-broadcast";
pub const TYPING: &str = "typing";

static BOLD_STARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*(.+?)\*\*").expect("bold pattern"));
static BOLD_UNDERSCORES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__(.+?)__").expect("bold pattern"));
static ITALIC_STARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*([^*\n]+)\*").expect("italic pattern"));
static ITALIC_UNDERSCORES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b_([^_\n]+)_\b").expect("italic pattern"));
static ASSISTANT_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*vina\s*:\s*").expect("label pattern"));

/// Which outgoing chat shape a room expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    /// One-to-one chat with the assistant: `{"human": ...}`.
    Assistant,
    /// Chat between two people: `{"content": ...}`.
    Peer,
}

/// A counterparty's call-capable identifier, announced over the chat socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAnnouncement {
    pub peer_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingData {
    user_id: String,
    is_typing: bool,
}

/// An inbound frame after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedFrame {
    Chat(Message),
    Typing { user_id: String, is_typing: bool },
    PeerAnnouncement(PeerAnnouncement),
    Control { kind: String, payload: Value },
}

#[derive(Debug, Clone)]
pub struct MessageCodec {
    user_id: String,
    mode: ChatMode,
}

impl MessageCodec {
    pub fn new(user_id: impl Into<String>, mode: ChatMode) -> Self {
        Self {
            user_id: user_id.into(),
            mode,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn mode(&self) -> ChatMode {
        self.mode
    }

    pub fn parse(&self, raw: &str) -> Result<ClassifiedFrame, HavenError> {
        self.parse_at(raw, Utc::now())
    }

    /// Classify `raw`, using `now` for frames that carry no timestamp.
    pub fn parse_at(&self, raw: &str, now: DateTime<Utc>) -> Result<ClassifiedFrame, HavenError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| HavenError::Protocol(format!("invalid json: {e}")))?;
        let Value::Object(obj) = value else {
            return Err(HavenError::Protocol("frame is not an object".into()));
        };

        // Chat frames may carry their own `type` ("text", "audio"), so only
        // the signaling kinds win over the chat shapes below.
        let kind = obj.get("type").and_then(Value::as_str);
        if let Some(kind @ (PEER_ID_BROADCAST | TYPING)) = kind {
            return Self::parse_typed(kind, &obj);
        }

        if let Some(text) = obj.get("vina").and_then(Value::as_str) {
            let content = clean_assistant_reply(text);
            if content.is_empty() {
                return Err(HavenError::Protocol("empty assistant reply".into()));
            }
            let timestamp = timestamp_of(obj.get("timestamp"), now);
            return Ok(ClassifiedFrame::Chat(with_frame_id(
                Message::text(content, Sender::Ai, timestamp),
                &obj,
            )));
        }

        if let (Some(content), Some(sender)) = (
            obj.get("content").and_then(Value::as_str),
            obj.get("sender").and_then(id_string),
        ) {
            let sender = if sender == self.user_id {
                Sender::User
            } else {
                Sender::Ai
            };
            let timestamp = timestamp_of(obj.get("timestamp"), now);
            return Ok(ClassifiedFrame::Chat(with_frame_id(
                Message::text(content.trim(), sender, timestamp),
                &obj,
            )));
        }

        if let Some(text) = obj.get("human").and_then(Value::as_str) {
            let timestamp = timestamp_of(obj.get("timestamp"), now);
            return Ok(ClassifiedFrame::Chat(with_frame_id(
                Message::text(text.trim(), Sender::User, timestamp),
                &obj,
            )));
        }

        if let Some(kind) = kind {
            return Self::parse_typed(kind, &obj);
        }

        let keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        Err(HavenError::Protocol(format!("unrecognized frame shape: {keys:?}")))
    }

    fn parse_typed(kind: &str, obj: &Map<String, Value>) -> Result<ClassifiedFrame, HavenError> {
        let data = obj.get("data").cloned().unwrap_or(Value::Null);
        match kind {
            PEER_ID_BROADCAST => {
                let announcement: PeerAnnouncement = serde_json::from_value(data)
                    .map_err(|e| HavenError::Protocol(format!("bad {PEER_ID_BROADCAST}: {e}")))?;
                Ok(ClassifiedFrame::PeerAnnouncement(announcement))
            }
            TYPING => {
                let typing: TypingData = serde_json::from_value(data)
                    .map_err(|e| HavenError::Protocol(format!("bad {TYPING}: {e}")))?;
                Ok(ClassifiedFrame::Typing {
                    user_id: typing.user_id,
                    is_typing: typing.is_typing,
                })
            }
            other => Ok(ClassifiedFrame::Control {
                kind: other.to_string(),
                payload: Value::Object(obj.clone()),
            }),
        }
    }

    /// Outgoing chat text in the shape this room expects.
    pub fn serialize_chat(&self, content: &str) -> String {
        match self.mode {
            ChatMode::Assistant => json!({ "human": content }),
            ChatMode::Peer => json!({ "content": content }),
        }
        .to_string()
    }

    pub fn serialize_peer_announcement(&self, peer_id: &str, now: DateTime<Utc>) -> String {
        let data = PeerAnnouncement {
            peer_id: peer_id.to_string(),
            user_id: self.user_id.clone(),
            timestamp: Some(now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
        };
        json!({ "type": PEER_ID_BROADCAST, "data": data }).to_string()
    }

    pub fn serialize_typing(&self, is_typing: bool) -> String {
        let data = TypingData {
            user_id: self.user_id.clone(),
            is_typing,
        };
        json!({ "type": TYPING, "data": data }).to_string()
    }
}

/// Strip markdown emphasis and the leading "Vina:" label from an assistant reply.
pub fn clean_assistant_reply(text: &str) -> String {
    let text = BOLD_STARS.replace_all(text, "$1");
    let text = BOLD_UNDERSCORES.replace_all(&text, "$1");
    let text = ITALIC_STARS.replace_all(&text, "$1");
    let text = ITALIC_UNDERSCORES.replace_all(&text, "$1");
    let text = ASSISTANT_LABEL.replace(&text, "");
    text.trim().to_string()
}

fn with_frame_id(message: Message, obj: &Map<String, Value>) -> Message {
    match obj.get("id").and_then(id_string) {
        Some(id) if !id.is_empty() => message.with_id(id),
        _ => message,
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Frame timestamps are ISO-8601 strings; some producers send epoch millis.
fn timestamp_of(value: Option<&Value>, now: DateTime<Utc>) -> DateTime<Utc> {
    match value {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|e| {
                tracing::debug!("unparseable frame timestamp {s:?}: {e}");
                now
            }),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or(now),
        _ => now,
    }
}
