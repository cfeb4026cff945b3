// Destination Resolver
// Maps a channel to its outbound RTMP destination from the bound stream key

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::models::{ChannelId, Destination};

/// Key-value binding store for per-channel stream keys
pub trait KeyStore: Send + Sync {
    fn get(&self, channel: &ChannelId) -> Option<String>;
    fn set(&self, channel: &ChannelId, key: String);
}

/// Process-lifetime key store. Bindings are lost on restart.
#[derive(Default)]
pub struct InMemoryKeyStore {
    keys: RwLock<HashMap<ChannelId, String>>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for InMemoryKeyStore {
    fn get(&self, channel: &ChannelId) -> Option<String> {
        let keys = self.keys.read().unwrap_or_else(|e| {
            log::warn!("Key store lock poisoned (get), recovering: {e}");
            e.into_inner()
        });
        keys.get(channel).cloned()
    }

    fn set(&self, channel: &ChannelId, key: String) {
        let mut keys = self.keys.write().unwrap_or_else(|e| {
            log::warn!("Key store lock poisoned (set), recovering: {e}");
            e.into_inner()
        });
        keys.insert(channel.clone(), key);
    }
}

/// Stateless lookup over the current key bindings
#[derive(Clone)]
pub struct DestinationResolver {
    base_url: String,
    keys: Arc<dyn KeyStore>,
}

impl DestinationResolver {
    pub fn new(base_url: impl Into<String>, keys: Arc<dyn KeyStore>) -> Self {
        Self {
            base_url: base_url.into(),
            keys,
        }
    }

    /// Bind (or overwrite) the stream key for a channel
    pub fn bind(&self, channel: &ChannelId, key: &str) -> Result<(), String> {
        let key = key.trim();
        if key.is_empty() {
            return Err("Stream key must not be empty".to_string());
        }
        self.keys.set(channel, key.to_string());
        log::info!("Stream key bound for channel {channel}");
        Ok(())
    }

    /// Resolve the destination from the latest binding. `None` = not configured.
    pub fn resolve(&self, channel: &ChannelId) -> Option<Destination> {
        let key = self.keys.get(channel)?;
        Some(Destination::new(&self.base_url, &Self::resolve_stream_key(&key)))
    }

    /// Resolve stream key - supports ${ENV_VAR} syntax
    fn resolve_stream_key(key: &str) -> String {
        if key.starts_with("${") && key.ends_with('}') && key.len() > 3 {
            let var_name = &key[2..key.len() - 1];
            match std::env::var(var_name) {
                Ok(value) => {
                    log::debug!("Resolved stream key from environment variable");
                    value
                }
                Err(_) => {
                    log::warn!("Environment variable not found for stream key, check your configuration");
                    key.to_string()
                }
            }
        } else {
            key.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> DestinationResolver {
        DestinationResolver::new("rtmps://dc5-1.rtmp.t.me/s/", Arc::new(InMemoryKeyStore::new()))
    }

    #[test]
    fn test_unbound_channel_is_not_configured() {
        assert!(resolver().resolve(&ChannelId::from("1")).is_none());
    }

    #[test]
    fn test_rebind_takes_effect_on_next_resolve() {
        let resolver = resolver();
        let channel = ChannelId::from("1");
        resolver.bind(&channel, "first").unwrap();
        let before = resolver.resolve(&channel).unwrap();
        resolver.bind(&channel, "second").unwrap();
        let after = resolver.resolve(&channel).unwrap();

        assert_eq!(before.as_url(), "rtmps://dc5-1.rtmp.t.me/s/first");
        assert_eq!(after.as_url(), "rtmps://dc5-1.rtmp.t.me/s/second");
    }

    #[test]
    fn test_channels_are_independent() {
        let resolver = resolver();
        resolver.bind(&ChannelId::from("1"), "one").unwrap();
        assert!(resolver.resolve(&ChannelId::from("2")).is_none());
    }

    #[test]
    fn test_rejects_empty_key() {
        let resolver = resolver();
        let channel = ChannelId::from("1");
        assert!(resolver.bind(&channel, "   ").is_err());
        assert!(resolver.resolve(&channel).is_none());
    }

    #[test]
    fn test_env_var_key() {
        std::env::set_var("QUEUECAST_TEST_STREAM_KEY", "from-env");
        let resolver = resolver();
        let channel = ChannelId::from("env");
        resolver.bind(&channel, "${QUEUECAST_TEST_STREAM_KEY}").unwrap();
        assert_eq!(
            resolver.resolve(&channel).unwrap().as_url(),
            "rtmps://dc5-1.rtmp.t.me/s/from-env"
        );
    }
}
