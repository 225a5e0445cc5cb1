//! Ambient signal hub.
//!
//! The host application feeds focus and reconnect notifications into the
//! hub; revalidation tasks subscribe and react per their [`CacheConfig`].

use tokio::sync::broadcast;
use tracing::trace;

use crate::config::CacheConfig;

const SIGNAL_CHANNEL_CAPACITY: usize = 64;

/// An ambient event from the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The application regained focus.
    Focus,
    /// Network connectivity was restored.
    Reconnect,
}

impl Signal {
    /// Whether this signal should trigger a revalidation under the given
    /// configuration.
    pub fn triggers(self, config: &CacheConfig) -> bool {
        match self {
            Signal::Focus => config.revalidate_on_focus,
            Signal::Reconnect => config.revalidate_on_reconnect,
        }
    }
}

/// Broadcast hub for ambient signals.
#[derive(Debug)]
pub struct SignalHub {
    tx: broadcast::Sender<Signal>,
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Deliver a signal to all subscribers.
    pub fn emit(&self, signal: Signal) {
        if self.tx.send(signal).is_err() {
            trace!(?signal, "no subscribers for ambient signal");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.tx.subscribe()
    }
}
