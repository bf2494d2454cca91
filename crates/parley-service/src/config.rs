//! Service configuration and its hot-swappable handle.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Tunables of the conversation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Default page size for message reads.
    #[serde(default = "default_message_page_size")]
    pub message_page_size: usize,

    /// Default page size for conversation list reads.
    #[serde(default = "default_conversation_page_size")]
    pub conversation_page_size: usize,

    /// Messages kept in the cache per conversation.
    #[serde(default = "default_message_cache")]
    pub message_cache: usize,

    /// Conversations kept in each user's cached list.
    #[serde(default = "default_conversation_cache")]
    pub conversation_cache: usize,

    /// Lifetime of conversations created as expiring, in seconds.
    #[serde(default = "default_expiry_secs")]
    pub default_expiry_secs: u64,

    /// Pending background units before new ones are dropped.
    #[serde(default = "default_task_queue_capacity")]
    pub task_queue_capacity: usize,

    /// Characters of message text included in push previews.
    #[serde(default = "default_preview_length")]
    pub preview_length: usize,
}

fn default_message_page_size() -> usize {
    20
}

fn default_conversation_page_size() -> usize {
    20
}

fn default_message_cache() -> usize {
    100
}

fn default_conversation_cache() -> usize {
    100
}

fn default_expiry_secs() -> u64 {
    24 * 60 * 60
}

fn default_task_queue_capacity() -> usize {
    4096
}

fn default_preview_length() -> usize {
    100
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            message_page_size: default_message_page_size(),
            conversation_page_size: default_conversation_page_size(),
            message_cache: default_message_cache(),
            conversation_cache: default_conversation_cache(),
            default_expiry_secs: default_expiry_secs(),
            task_queue_capacity: default_task_queue_capacity(),
            preview_length: default_preview_length(),
        }
    }
}

impl ServiceConfig {
    #[must_use]
    pub fn default_expiry(&self) -> Duration {
        Duration::from_secs(self.default_expiry_secs)
    }
}

/// Shared, atomically replaceable configuration.
///
/// Readers take a snapshot per request; a reload swaps the whole value.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<ArcSwap<ServiceConfig>>,
}

impl ConfigHandle {
    #[must_use]
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    /// Current configuration snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ServiceConfig> {
        self.inner.load_full()
    }

    /// Replace the configuration.
    pub fn store(&self, config: ServiceConfig) {
        self.inner.store(Arc::new(config));
        tracing::info!("service configuration reloaded");
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(ServiceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ServiceConfig = toml::from_str("message_cache = 7").unwrap();
        assert_eq!(config.message_cache, 7);
        assert_eq!(config.message_page_size, 20);
        assert_eq!(config.default_expiry(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_snapshot_survives_reload() {
        let handle = ConfigHandle::default();
        let before = handle.snapshot();

        handle.store(ServiceConfig {
            preview_length: 10,
            ..ServiceConfig::default()
        });

        assert_eq!(before.preview_length, 100);
        assert_eq!(handle.snapshot().preview_length, 10);
    }
}
