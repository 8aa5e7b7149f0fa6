//! Outbound batch buffer.

use tidepool_protocol::{BatchEnvelope, BroadcastEnvelope};

/// Collects rate-limited messages until they are sent as one batch.
#[derive(Debug, Clone)]
pub struct BatchBuffer {
    messages: Vec<BroadcastEnvelope>,
    size: usize,
}

impl BatchBuffer {
    /// Creates a buffer that is full at `size` messages.
    pub fn new(size: usize) -> Self {
        Self {
            messages: Vec::with_capacity(size),
            size: size.max(1),
        }
    }

    /// Adds a message. Returns true once the buffer is full.
    pub fn push(&mut self, message: BroadcastEnvelope) -> bool {
        self.messages.push(message);
        self.is_full()
    }

    /// Returns true if the buffer reached its size.
    pub fn is_full(&self) -> bool {
        self.messages.len() >= self.size
    }

    /// Returns the number of buffered messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drains the buffer into one envelope, or `None` if empty.
    pub fn take(&mut self, timestamp: impl Into<String>) -> Option<BatchEnvelope> {
        if self.messages.is_empty() {
            return None;
        }
        Some(BatchEnvelope::new(std::mem::take(&mut self.messages), timestamp))
    }
}
