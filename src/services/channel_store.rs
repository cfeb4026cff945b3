// Channel Store
// Per-channel playback state, created lazily on first use

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

use crate::models::{ChannelId, QueueItem};
use crate::services::{ChannelQueue, ProcessSlot};

/// Everything the coordinator tracks for one channel.
/// `now_playing` is set exactly while `process` holds a running encoder.
#[derive(Default)]
pub struct ChannelState {
    pub queue: ChannelQueue,
    pub process: ProcessSlot,
    pub now_playing: Option<QueueItem>,
}

impl ChannelState {
    pub fn is_playing(&self) -> bool {
        self.process.is_running()
    }
}

pub type SharedChannel = Arc<Mutex<ChannelState>>;

/// Channel map. The outer lock is held only for lookup and insert,
/// so work on one channel never waits on another.
#[derive(Default)]
pub struct ChannelStore {
    channels: RwLock<HashMap<ChannelId, SharedChannel>>,
}

impl ChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the channel's state, creating it on first use
    pub fn entry(&self, channel: &ChannelId) -> SharedChannel {
        if let Some(existing) = self.get(channel) {
            return existing;
        }

        let mut channels = self.channels.write().unwrap_or_else(|e| {
            log::warn!("Channel store lock poisoned (entry), recovering: {e}");
            e.into_inner()
        });
        Arc::clone(channels.entry(channel.clone()).or_default())
    }

    pub fn get(&self, channel: &ChannelId) -> Option<SharedChannel> {
        let channels = self.channels.read().unwrap_or_else(|e| {
            log::warn!("Channel store lock poisoned (get), recovering: {e}");
            e.into_inner()
        });
        channels.get(channel).cloned()
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        let channels = self.channels.read().unwrap_or_else(|e| {
            log::warn!("Channel store lock poisoned (list), recovering: {e}");
            e.into_inner()
        });
        channels.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_is_created_once() {
        let store = ChannelStore::new();
        let channel = ChannelId::from("1");

        assert!(store.get(&channel).is_none());
        let first = store.entry(&channel);
        let second = store.entry(&channel);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.channel_ids(), vec![channel]);
    }

    #[tokio::test]
    async fn test_channels_lock_independently() {
        let store = ChannelStore::new();
        let a = store.entry(&ChannelId::from("a"));
        let b = store.entry(&ChannelId::from("b"));

        let held = a.lock().await;
        assert!(b.try_lock().is_ok());
        assert!(!held.is_playing());
    }
}
