//! Cache invalidation signals

use tokio::sync::broadcast;
use tracing::debug;

/// Notified once per terminal operation so app listings can be refreshed
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, app_id: &str);
}

/// Broadcasts the id of every app whose cached view went stale
pub struct BroadcastInvalidator {
    sender: broadcast::Sender<String>,
}

impl BroadcastInvalidator {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastInvalidator {
    fn default() -> Self {
        Self::new(64)
    }
}

impl CacheInvalidator for BroadcastInvalidator {
    fn invalidate(&self, app_id: &str) {
        // No receivers is fine
        let receivers = self.sender.send(app_id.to_string()).unwrap_or(0);
        debug!(app_id, receivers, "Invalidated app caches");
    }
}
