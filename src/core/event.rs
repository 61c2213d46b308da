//! # Change Notification Bus
//!
//! The one channel the rendering layer listens on. The registry emits
//! structural/prop changes, the runtime emits navigation changes; both go
//! through the same [`EventBus`].
//!
//! Listeners are called synchronously, after every internal lock has been
//! released, so a listener may freely read the registry or runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::runtime::{RestrictionNotice, TransitionFlags};

/// Everything an observer can be told about.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowEvent {
    NodeRegistered { id: String },
    NodeUpdated { id: String },
    /// A subtree went away. Ids are deepest first.
    NodesUnregistered { ids: Vec<String> },
    ActiveChanged { parent_id: String, child_id: Option<String> },
    FlagsChanged { parent_id: String, flags: TransitionFlags },
    RootSwitched { previous: Option<String>, current: String },
    /// A transition was refused by a restriction; surface to the user.
    Restricted { notice: RestrictionNotice },
    /// Ephemeral state of these child ids was purged.
    StatePurged { ids: Vec<String> },
}

type Listener = Arc<dyn Fn(&FlowEvent) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. The returned [`Subscription`] unsubscribes on drop;
    /// call [`Subscription::detach`] to keep the listener for the bus lifetime.
    pub fn subscribe<F>(self: &Arc<Self>, callback: F) -> Subscription
    where
        F: Fn(&FlowEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(callback)));
        Subscription {
            id,
            bus: Arc::downgrade(self),
            detached: false,
        }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn emit(&self, event: FlowEvent) {
        // Snapshot so listeners can subscribe/unsubscribe while being called
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(&event);
        }
    }
}

/// Handle returned by [`EventBus::subscribe`].
pub struct Subscription {
    id: u64,
    bus: std::sync::Weak<EventBus>,
    detached: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(mut self) {
        self.remove();
    }

    /// Keep the listener alive after this handle is dropped.
    pub fn detach(mut self) {
        self.detached = true;
    }

    fn remove(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}
