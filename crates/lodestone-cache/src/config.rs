//! Ambient revalidation configuration.

use std::time::Duration;

/// Knobs controlling when a cached key is revalidated without an explicit
/// request: background polling, ambient focus/reconnect signals, and the
/// window within which duplicate revalidations are collapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Re-run the request on this interval. `None` disables polling.
    pub poll_interval: Option<Duration>,
    /// Revalidate when the host application regains focus.
    pub revalidate_on_focus: bool,
    /// Revalidate when the host application regains connectivity.
    pub revalidate_on_reconnect: bool,
    /// Collapse revalidations that arrive within this window of a
    /// completed one.
    pub dedup_window: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            poll_interval: None,
            revalidate_on_focus: true,
            revalidate_on_reconnect: true,
            dedup_window: Duration::from_secs(2),
        }
    }
}

impl CacheConfig {
    /// Configuration with every ambient trigger disabled.
    ///
    /// Used whenever a key is backed by a live subscription: the push
    /// channel already guarantees freshness, and an ambient revalidation
    /// would needlessly restart it.
    pub fn for_listen_mode() -> Self {
        Self {
            poll_interval: None,
            revalidate_on_focus: false,
            revalidate_on_reconnect: false,
            dedup_window: Duration::ZERO,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }
}
