use chrono::Duration;

use crate::message::Message;

/// Default window within which identical content counts as a redelivery.
pub const DEFAULT_DEDUP_WINDOW_MS: i64 = 1_000;

/// Ordered, de-duplicated chat history for the current session.
///
/// The transport may hand back the sender's own message as an echo, so an
/// incoming entry is dropped when an existing one has the same content and a
/// timestamp inside the dedup window. Entries are kept sorted by timestamp;
/// arrival order only breaks ties.
#[derive(Debug, Clone)]
pub struct MessageStore {
    messages: Vec<Message>,
    window: Duration,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::with_window_ms(DEFAULT_DEDUP_WINDOW_MS)
    }

    pub fn with_window_ms(window_ms: i64) -> Self {
        Self {
            messages: Vec::new(),
            window: Duration::milliseconds(window_ms),
        }
    }

    /// Insert a message. Returns `false` when it was dropped as a duplicate.
    pub fn add(&mut self, message: Message) -> bool {
        if self.is_duplicate(&message) {
            tracing::debug!("dropping duplicate message id={}", message.id);
            return false;
        }
        self.messages.push(message);
        // `sort_by_key` is stable, so equal timestamps keep arrival order.
        self.messages.sort_by_key(|m| m.timestamp);
        true
    }

    fn is_duplicate(&self, incoming: &Message) -> bool {
        self.messages.iter().any(|m| {
            m.id == incoming.id
                || (m.content == incoming.content
                    && (m.timestamp - incoming.timestamp).abs() <= self.window)
        })
    }

    pub fn all(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}
