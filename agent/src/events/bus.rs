//! In-process publish/subscribe keyed by operation id
//!
//! Every published event replaces the cached latest event of its operation,
//! so a client connecting mid-operation can render the current state before
//! attaching to the live stream.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::mpsc;
use tracing::debug;

use crate::models::operation::StoreOperationEvent;

type Handler = Arc<dyn Fn(&StoreOperationEvent) + Send + Sync>;

struct BusState {
    subscribers: HashMap<String, Vec<(u64, Handler)>>,
    latest: HashMap<String, StoreOperationEvent>,
    next_subscriber_id: u64,
    capacity: usize,
}

/// Event bus owned by one orchestrator instance
#[derive(Clone)]
pub struct EventBus {
    state: Arc<RwLock<BusState>>,
}

impl EventBus {
    /// Create an event bus caching the latest event of at most `capacity` operations
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(BusState {
                subscribers: HashMap::new(),
                latest: HashMap::new(),
                next_subscriber_id: 0,
                capacity: capacity.max(1),
            })),
        }
    }

    /// Deliver `event` to every subscriber of its operation and cache it
    pub fn publish(&self, event: StoreOperationEvent) {
        let handlers: Vec<Handler> = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());

            if !state.latest.contains_key(&event.operation_id) && state.latest.len() >= state.capacity {
                // Evict the operation whose latest event is the oldest
                if let Some(oldest) = state
                    .latest
                    .iter()
                    .min_by_key(|(_, e)| e.timestamp)
                    .map(|(id, _)| id.clone())
                {
                    state.latest.remove(&oldest);
                }
            }
            state.latest.insert(event.operation_id.clone(), event.clone());

            state
                .subscribers
                .get(&event.operation_id)
                .map(|subs| subs.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };

        if handlers.is_empty() {
            debug!(operation_id = %event.operation_id, "No subscribers listening to event");
        }

        // Handlers run outside the lock so they may subscribe or unsubscribe
        for handler in handlers {
            handler(&event);
        }
    }

    /// Register `handler` for events of `operation_id`.
    ///
    /// The handler stays registered until the returned [`Subscription`] is
    /// dropped or explicitly unsubscribed.
    pub fn subscribe<F>(&self, operation_id: &str, handler: F) -> Subscription
    where
        F: Fn(&StoreOperationEvent) + Send + Sync + 'static,
    {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        self.subscribe_locked(&mut state, operation_id, Arc::new(handler))
    }

    fn subscribe_locked(
        &self,
        state: &mut BusState,
        operation_id: &str,
        handler: Handler,
    ) -> Subscription {
        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        state
            .subscribers
            .entry(operation_id.to_string())
            .or_default()
            .push((id, handler));

        Subscription {
            state: Arc::downgrade(&self.state),
            operation_id: operation_id.to_string(),
            id,
            active: true,
        }
    }

    /// Latest event published for `operation_id`
    pub fn get_latest(&self, operation_id: &str) -> Option<StoreOperationEvent> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.latest.get(operation_id).cloned()
    }

    /// Snapshot the latest event and attach a channel to the live stream.
    ///
    /// Both happen under one lock, so no event is missed or duplicated
    /// between the snapshot and the first live event.
    pub fn watch(&self, operation_id: &str) -> OperationWatch {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let snapshot = state.latest.get(operation_id).cloned();
        let subscription = self.subscribe_locked(
            &mut state,
            operation_id,
            Arc::new(move |event: &StoreOperationEvent| {
                let _ = tx.send(event.clone());
            }),
        );

        OperationWatch {
            snapshot,
            receiver: rx,
            _subscription: subscription,
        }
    }

    /// Number of handlers registered for `operation_id`
    pub fn subscriber_count(&self, operation_id: &str) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.subscribers.get(operation_id).map(Vec::len).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Registration handle returned by [`EventBus::subscribe`]
pub struct Subscription {
    state: Weak<RwLock<BusState>>,
    operation_id: String,
    id: u64,
    active: bool,
}

impl Subscription {
    /// Stop receiving events
    pub fn unsubscribe(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;

        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = state.subscribers.get_mut(&self.operation_id) {
            subs.retain(|(id, _)| *id != self.id);
            if subs.is_empty() {
                state.subscribers.remove(&self.operation_id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Snapshot-then-stream view of one operation
pub struct OperationWatch {
    /// Latest event at the time the watch was created
    pub snapshot: Option<StoreOperationEvent>,
    receiver: mpsc::UnboundedReceiver<StoreOperationEvent>,
    _subscription: Subscription,
}

impl OperationWatch {
    /// Next live event
    pub async fn recv(&mut self) -> Option<StoreOperationEvent> {
        self.receiver.recv().await
    }

    /// Next live event if one is already buffered
    pub fn try_recv(&mut self) -> Option<StoreOperationEvent> {
        self.receiver.try_recv().ok()
    }
}
