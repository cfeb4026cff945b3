// Channel Queue
// Ordered pending items for one channel

use std::collections::VecDeque;

use crate::models::QueueItem;

/// FIFO of pending items. Items leave only from the front or all at once.
#[derive(Debug, Default)]
pub struct ChannelQueue {
    items: VecDeque<QueueItem>,
}

impl ChannelQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail; returns the 1-based position in the queue
    pub fn enqueue(&mut self, item: QueueItem) -> usize {
        self.items.push_back(item);
        self.items.len()
    }

    pub fn dequeue_front(&mut self) -> Option<QueueItem> {
        self.items.pop_front()
    }

    /// Read-only enumeration in playback order. Restartable: call again for a fresh pass.
    pub fn peek_all(&self) -> impl Iterator<Item = &QueueItem> + '_ {
        self.items.iter()
    }

    /// Remove every pending item, returning them in playback order
    pub fn clear(&mut self) -> Vec<QueueItem> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
