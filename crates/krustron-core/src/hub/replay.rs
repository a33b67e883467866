use std::collections::VecDeque;
use std::sync::Arc;

use super::message::Message;

/// Fixed-capacity history of the most recent broadcasts, oldest first.
///
/// Global across channels. A capacity of zero disables replay.
#[derive(Debug)]
pub struct ReplayBuffer {
    messages: VecDeque<Arc<Message>>,
    capacity: usize,
}

impl ReplayBuffer {
    /// Create an empty buffer holding at most `capacity` messages.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a message, evicting the oldest one when full.
    pub fn push(&mut self, message: Arc<Message>) {
        if self.capacity == 0 {
            return;
        }
        if self.messages.len() == self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    /// Buffered messages in broadcast order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Message>> {
        self.messages.iter()
    }

    /// Number of buffered messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop all buffered messages.
    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::MessageType;

    fn numbered(n: usize) -> Arc<Message> {
        Arc::new(Message::new(
            MessageType::ClusterStatus,
            serde_json::json!({ "n": n }),
        ))
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut buffer = ReplayBuffer::new(3);
        for n in 0..10 {
            buffer.push(numbered(n));
            assert!(buffer.len() <= 3);
        }
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_keeps_most_recent_in_order() {
        let capacity = 4;
        let mut buffer = ReplayBuffer::new(capacity);
        for n in 0..=capacity {
            buffer.push(numbered(n));
        }

        let kept: Vec<u64> = buffer
            .iter()
            .map(|m| m.data["n"].as_u64().unwrap())
            .collect();
        assert_eq!(kept, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_zero_capacity_disables_replay() {
        let mut buffer = ReplayBuffer::new(0);
        buffer.push(numbered(1));
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 0);
    }

    #[test]
    fn test_clear() {
        let mut buffer = ReplayBuffer::new(2);
        buffer.push(numbered(1));
        buffer.clear();
        assert!(buffer.is_empty());
    }
}
