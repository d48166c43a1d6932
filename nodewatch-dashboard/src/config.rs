//! Dashboard configuration.
//!
//! Starts from [`FeedConfig::default`] and applies environment overrides.

use nodewatch_core::client::FeedConfig;

/// Overrides the feed URL.
pub const ENV_FEED_URL: &str = "NODEWATCH_FEED_URL";
/// Overrides the channel topic.
pub const ENV_TOPIC: &str = "NODEWATCH_TOPIC";

#[derive(Debug, Clone, Default)]
pub struct DashboardConfig {
    pub feed: FeedConfig,
}

impl DashboardConfig {
    /// Defaults plus whatever the process environment overrides.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values are ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = var(ENV_FEED_URL) {
            config.feed.url = url;
        }
        if let Some(topic) = var(ENV_TOPIC) {
            config.feed.topic = topic;
        }
        config
    }
}
