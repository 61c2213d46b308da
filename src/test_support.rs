//! Test utilities shared across the crate.
//!
//! This module is only compiled during tests (`#[cfg(test)]`).

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::event::{FlowEvent, Subscription};
use crate::core::history::History;
use crate::core::node::NodeSpec;
use crate::core::registry::Registry;
use crate::runtime::{Runtime, RuntimeSettings};
use crate::storage::{MemoryStorage, StorageAdapter, StorageError};
use crate::store::StateStore;

/// `Shop` pack with a `Home` parent holding `Feed`, `Cart` and `Deals`.
pub fn shop_registry() -> Arc<Registry> {
    let registry = Arc::new(Registry::new());
    registry.register_node(NodeSpec::pack("Shop")).unwrap();
    registry.register_node(NodeSpec::parent("Shop", "Home")).unwrap();
    for name in ["Feed", "Cart", "Deals"] {
        registry
            .register_node(NodeSpec::child("Shop.Home", name))
            .unwrap();
    }
    registry
}

/// A runtime over [`shop_registry`] with in-memory storage and default
/// settings.
pub fn shop_runtime() -> Runtime {
    let storage = Arc::new(MemoryStorage::new());
    Runtime::new(
        shop_registry(),
        Arc::new(History::new(storage.clone(), 50)),
        Arc::new(StateStore::new(storage)),
        RuntimeSettings::default(),
    )
}

/// Records every event published while the subscription lives.
pub fn collect_events(runtime: &Runtime) -> (Subscription, Arc<Mutex<Vec<FlowEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let sub = runtime.subscribe(move |e| sink.lock().push(e.clone()));
    (sub, events)
}

/// A backend that is never there: every call fails.
pub struct FailingStorage;

#[async_trait]
impl StorageAdapter for FailingStorage {
    fn name(&self) -> &str {
        "failing"
    }

    async fn get_item(&self, _key: &str) -> Result<Option<String>, StorageError> {
        Err(StorageError::Unavailable("offline".into()))
    }

    async fn set_item(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("offline".into()))
    }

    async fn remove_item(&self, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("offline".into()))
    }
}
