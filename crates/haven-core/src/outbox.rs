use std::collections::VecDeque;

/// A serialized chat frame waiting for the socket to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Id of the [`crate::message::Message`] this frame carries.
    pub message_id: String,
    pub payload: String,
}

/// Outcome of a single [`Outbox::flush`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub requeued: usize,
}

/// FIFO buffer for messages composed while disconnected.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: VecDeque<QueuedMessage>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, message: QueuedMessage) {
        self.queue.push_back(message);
    }

    /// Hand every queued message to `send` in enqueue order.
    ///
    /// Every message is attempted once. The ones `send` rejects go back to
    /// the front of the queue, still in their original relative order.
    pub fn flush<E>(&mut self, mut send: impl FnMut(&QueuedMessage) -> Result<(), E>) -> FlushReport {
        let pending: Vec<QueuedMessage> = self.queue.drain(..).collect();
        let mut failed = Vec::new();
        let mut report = FlushReport::default();

        for message in pending {
            match send(&message) {
                Ok(()) => report.sent += 1,
                Err(_) => failed.push(message),
            }
        }

        report.requeued = failed.len();
        for message in failed.into_iter().rev() {
            self.queue.push_front(message);
        }
        report
    }

    pub fn size(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(id: &str) -> QueuedMessage {
        QueuedMessage {
            message_id: id.to_string(),
            payload: format!(r#"{{"human":"{id}"}}"#),
        }
    }

    #[test]
    fn flush_sends_in_enqueue_order() {
        let mut outbox = Outbox::new();
        for id in ["a", "b", "c"] {
            outbox.enqueue(queued(id));
        }

        let mut sent = Vec::new();
        let report = outbox.flush(|m| {
            sent.push(m.message_id.clone());
            Ok::<(), ()>(())
        });

        assert_eq!(sent, ["a", "b", "c"]);
        assert_eq!(report, FlushReport { sent: 3, requeued: 0 });
        assert_eq!(outbox.size(), 0);
    }

    #[test]
    fn failed_sends_return_to_front_in_order() {
        let mut outbox = Outbox::new();
        for id in ["a", "b", "c", "d"] {
            outbox.enqueue(queued(id));
        }

        let report = outbox.flush(|m| {
            if m.message_id == "b" || m.message_id == "d" {
                Err("socket gone")
            } else {
                Ok(())
            }
        });
        assert_eq!(report, FlushReport { sent: 2, requeued: 2 });

        // Composed after the failed flush; must stay behind the retries.
        outbox.enqueue(queued("e"));

        let mut sent = Vec::new();
        outbox.flush(|m| {
            sent.push(m.message_id.clone());
            Ok::<(), ()>(())
        });
        assert_eq!(sent, ["b", "d", "e"]);
    }

    #[test]
    fn flush_on_empty_queue_is_noop() {
        let mut outbox = Outbox::new();
        let report = outbox.flush(|_| Ok::<(), ()>(()));
        assert_eq!(report, FlushReport::default());
        assert!(outbox.is_empty());
    }
}
