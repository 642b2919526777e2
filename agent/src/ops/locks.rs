//! Per-app advisory locks

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Serializes operations touching the same app
#[derive(Default)]
pub struct AppLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held for the whole execution of one operation
pub struct AppLockGuard {
    _guard: OwnedMutexGuard<()>,
}

impl AppLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other operation holds `app_id`
    pub async fn acquire(&self, app_id: &str) -> AppLockGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Drop locks nobody holds or waits for
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(app_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        AppLockGuard {
            _guard: lock.lock_owned().await,
        }
    }

    /// Whether an operation currently holds `app_id`
    pub fn is_locked(&self, app_id: &str) -> bool {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .get(app_id)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }
}
