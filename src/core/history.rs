//! # Navigation History
//!
//! Per-parent back/forward stacks of visited children.
//!
//! The back stack of a scope is persisted under `history_<parentId>` as a
//! JSON array of [`HistoryEntry`]. Scopes load lazily on first touch and every
//! push/pop writes through. The forward stack only ever lives in memory and is
//! cleared by a new push, like browser history.
//!
//! The top of a back stack is the entry of the child currently shown, so
//! "going back" means popping the top and restoring the one below it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::node::NodeId;
use crate::storage::{StorageAdapter, quarantine};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub child_id: NodeId,
    pub child_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_position: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_state: Option<Value>,
}

impl HistoryEntry {
    pub fn new(child_id: impl Into<String>, child_name: impl Into<String>) -> Self {
        Self {
            child_id: child_id.into(),
            child_name: child_name.into(),
            timestamp: Utc::now(),
            params: None,
            scroll_position: None,
            component_state: None,
        }
    }

    pub fn with_params(mut self, params: Option<Value>) -> Self {
        self.params = params;
        self
    }
}

#[derive(Default)]
struct Scope {
    back: Vec<HistoryEntry>,
    forward: Vec<HistoryEntry>,
}

pub struct History {
    storage: Arc<dyn StorageAdapter>,
    limit: usize,
    scopes: Mutex<HashMap<NodeId, Scope>>,
    component_states: Mutex<HashMap<NodeId, Value>>,
    /// Every child id that has ever been pushed or loaded.
    tracked: Mutex<HashSet<NodeId>>,
}

fn storage_key(parent_id: &str) -> String {
    format!("history_{}", parent_id)
}

impl History {
    pub fn new(storage: Arc<dyn StorageAdapter>, limit: usize) -> Self {
        Self {
            storage,
            limit: limit.max(1),
            scopes: Mutex::new(HashMap::new()),
            component_states: Mutex::new(HashMap::new()),
            tracked: Mutex::new(HashSet::new()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Loads a scope's back stack on first access. Unreadable records are
    /// quarantined and the scope starts empty.
    async fn ensure_loaded(&self, parent_id: &str) {
        if self.scopes.lock().contains_key(parent_id) {
            return;
        }

        let key = storage_key(parent_id);
        let back = match self.storage.get_item(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<HistoryEntry>>(&raw) {
                Ok(mut entries) => {
                    if entries.len() > self.limit {
                        entries.drain(..entries.len() - self.limit);
                    }
                    debug!("Loaded {} history entries for {}", entries.len(), parent_id);
                    entries
                }
                Err(e) => {
                    warn!("Unreadable history for {}: {}", parent_id, e);
                    quarantine(self.storage.as_ref(), &key, &raw).await;
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Failed to load history for {}: {}", parent_id, e);
                Vec::new()
            }
        };

        {
            let mut tracked = self.tracked.lock();
            for entry in &back {
                tracked.insert(entry.child_id.clone());
            }
        }

        // Another caller may have loaded the scope while we were reading
        self.scopes
            .lock()
            .entry(parent_id.to_string())
            .or_insert(Scope {
                back,
                forward: Vec::new(),
            });
    }

    async fn persist(&self, parent_id: &str, back: Vec<HistoryEntry>) {
        let key = storage_key(parent_id);
        let result = if back.is_empty() {
            self.storage.remove_item(&key).await
        } else {
            match serde_json::to_string(&back) {
                Ok(json) => self.storage.set_item(&key, &json).await,
                Err(e) => {
                    warn!("Failed to serialize history for {}: {}", parent_id, e);
                    return;
                }
            }
        };
        if let Err(e) = result {
            warn!("Failed to persist history for {}: {}", parent_id, e);
        }
    }

    /// Pushes an entry, evicting the oldest beyond the limit. Clears the
    /// forward stack.
    pub async fn push(&self, parent_id: &str, entry: HistoryEntry) {
        self.ensure_loaded(parent_id).await;
        self.tracked.lock().insert(entry.child_id.clone());

        let back = {
            let mut scopes = self.scopes.lock();
            let scope = scopes.entry(parent_id.to_string()).or_default();
            scope.back.push(entry);
            if scope.back.len() > self.limit {
                let overflow = scope.back.len() - self.limit;
                scope.back.drain(..overflow);
            }
            scope.forward.clear();
            scope.back.clone()
        };
        self.persist(parent_id, back).await;
    }

    /// Pops the top of the back stack onto the forward stack.
    pub async fn pop(&self, parent_id: &str) -> Option<HistoryEntry> {
        self.ensure_loaded(parent_id).await;

        let (popped, back) = {
            let mut scopes = self.scopes.lock();
            let scope = scopes.get_mut(parent_id)?;
            let popped = scope.back.pop()?;
            scope.forward.push(popped.clone());
            (popped, scope.back.clone())
        };
        self.persist(parent_id, back).await;
        Some(popped)
    }

    pub async fn peek(&self, parent_id: &str) -> Option<HistoryEntry> {
        self.ensure_loaded(parent_id).await;
        self.scopes
            .lock()
            .get(parent_id)
            .and_then(|s| s.back.last().cloned())
    }

    /// Redo: moves the most recently popped entry back onto the back stack.
    pub async fn pop_forward(&self, parent_id: &str) -> Option<HistoryEntry> {
        self.ensure_loaded(parent_id).await;

        let (entry, back) = {
            let mut scopes = self.scopes.lock();
            let scope = scopes.get_mut(parent_id)?;
            let entry = scope.forward.pop()?;
            scope.back.push(entry.clone());
            (entry, scope.back.clone())
        };
        self.persist(parent_id, back).await;
        Some(entry)
    }

    /// Swaps the top entry (pushes if the stack is empty). Leaves the
    /// forward stack alone.
    pub async fn replace_top(&self, parent_id: &str, entry: HistoryEntry) {
        self.ensure_loaded(parent_id).await;
        self.tracked.lock().insert(entry.child_id.clone());

        let back = {
            let mut scopes = self.scopes.lock();
            let scope = scopes.entry(parent_id.to_string()).or_default();
            match scope.back.last_mut() {
                Some(top) => *top = entry,
                None => scope.back.push(entry),
            }
            scope.back.clone()
        };
        self.persist(parent_id, back).await;
    }

    /// Back stack, oldest first.
    pub async fn entries(&self, parent_id: &str) -> Vec<HistoryEntry> {
        self.ensure_loaded(parent_id).await;
        self.scopes
            .lock()
            .get(parent_id)
            .map(|s| s.back.clone())
            .unwrap_or_default()
    }

    /// True when there is an entry below the current one.
    pub async fn can_go_back(&self, parent_id: &str) -> bool {
        self.ensure_loaded(parent_id).await;
        self.scopes
            .lock()
            .get(parent_id)
            .is_some_and(|s| s.back.len() > 1)
    }

    pub async fn can_go_forward(&self, parent_id: &str) -> bool {
        self.scopes
            .lock()
            .get(parent_id)
            .is_some_and(|s| !s.forward.is_empty())
    }

    /// Empties both stacks of a scope and drops its persisted record.
    pub async fn clear_scope(&self, parent_id: &str) {
        self.scopes
            .lock()
            .insert(parent_id.to_string(), Scope::default());
        if let Err(e) = self.storage.remove_item(&storage_key(parent_id)).await {
            warn!("Failed to remove history for {}: {}", parent_id, e);
        }
    }

    /// Drops in-memory scopes of parents that went away. Their persisted
    /// records stay, so a remounted parent gets its back stack again.
    pub fn forget_scopes(&self, parent_ids: &[NodeId]) {
        let mut scopes = self.scopes.lock();
        for id in parent_ids {
            scopes.remove(id);
        }
    }

    pub fn save_component_state(&self, child_id: &str, state: Value) {
        self.tracked.lock().insert(child_id.to_string());
        self.component_states
            .lock()
            .insert(child_id.to_string(), state);
    }

    pub fn restore_component_state(&self, child_id: &str) -> Option<Value> {
        self.component_states.lock().get(child_id).cloned()
    }

    /// Ids no longer referenced by any back or forward stack. Their
    /// component state is dropped and they stop being tracked; the caller
    /// purges whatever else it keeps for them.
    pub fn cleanup_orphaned_states(&self) -> Vec<NodeId> {
        let referenced: HashSet<NodeId> = {
            let scopes = self.scopes.lock();
            scopes
                .values()
                .flat_map(|s| s.back.iter().chain(s.forward.iter()))
                .map(|e| e.child_id.clone())
                .collect()
        };

        let mut orphans: Vec<NodeId> = {
            let mut tracked = self.tracked.lock();
            let orphans: Vec<NodeId> = tracked
                .iter()
                .filter(|id| !referenced.contains(*id))
                .cloned()
                .collect();
            for id in &orphans {
                tracked.remove(id);
            }
            orphans
        };
        orphans.sort();

        let mut states = self.component_states.lock();
        for id in &orphans {
            states.remove(id);
        }
        if !orphans.is_empty() {
            debug!("History orphans: {:?}", orphans);
        }
        orphans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn history(limit: usize) -> (History, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        (History::new(storage.clone(), limit), storage)
    }

    #[tokio::test]
    async fn test_push_pop_peek() {
        let (history, _) = history(10);
        history.push("P", HistoryEntry::new("P.A", "A")).await;
        history.push("P", HistoryEntry::new("P.B", "B")).await;

        assert_eq!(history.peek("P").await.unwrap().child_id, "P.B");
        assert!(history.can_go_back("P").await);

        let popped = history.pop("P").await.unwrap();
        assert_eq!(popped.child_id, "P.B");
        assert_eq!(history.peek("P").await.unwrap().child_id, "P.A");
        assert!(!history.can_go_back("P").await);
        assert!(history.can_go_forward("P").await);
    }

    #[tokio::test]
    async fn test_push_evicts_oldest_and_clears_forward() {
        let (history, _) = history(2);
        for name in ["A", "B", "C"] {
            history
                .push("P", HistoryEntry::new(format!("P.{name}"), name))
                .await;
        }
        let ids: Vec<String> = history
            .entries("P")
            .await
            .into_iter()
            .map(|e| e.child_id)
            .collect();
        assert_eq!(ids, vec!["P.B", "P.C"]);

        history.pop("P").await;
        assert!(history.can_go_forward("P").await);
        history.push("P", HistoryEntry::new("P.D", "D")).await;
        assert!(!history.can_go_forward("P").await);
    }

    #[tokio::test]
    async fn test_pop_forward_redoes() {
        let (history, _) = history(10);
        history.push("P", HistoryEntry::new("P.A", "A")).await;
        history.push("P", HistoryEntry::new("P.B", "B")).await;
        history.pop("P").await;

        let redone = history.pop_forward("P").await.unwrap();
        assert_eq!(redone.child_id, "P.B");
        assert_eq!(history.peek("P").await.unwrap().child_id, "P.B");
        assert!(history.pop_forward("P").await.is_none());
    }

    #[tokio::test]
    async fn test_back_stack_persists_and_reloads() {
        let (history, storage) = history(10);
        history
            .push(
                "P",
                HistoryEntry::new("P.A", "A").with_params(Some(json!({"id": 7}))),
            )
            .await;

        let raw = storage.get_item("history_P").await.unwrap().unwrap();
        assert!(raw.contains("\"childId\":\"P.A\""));

        let reloaded = History::new(storage.clone(), 10);
        let top = reloaded.peek("P").await.unwrap();
        assert_eq!(top.child_name, "A");
        assert_eq!(top.params, Some(json!({"id": 7})));
    }

    #[tokio::test]
    async fn test_corrupt_record_is_quarantined() {
        let (history, storage) = history(10);
        storage.set_item("history_P", "{oops").await.unwrap();

        assert!(history.peek("P").await.is_none());
        assert_eq!(storage.get_item("history_P").await.unwrap(), None);
        assert!(storage.keys().iter().any(|k| k.starts_with("history_P.corrupt-")));
    }

    #[tokio::test]
    async fn test_replace_top_keeps_depth() {
        let (history, _) = history(10);
        history.push("T", HistoryEntry::new("T.One", "One")).await;
        history.replace_top("T", HistoryEntry::new("T.Two", "Two")).await;
        let entries = history.entries("T").await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].child_id, "T.Two");
    }

    #[tokio::test]
    async fn test_clear_scope_removes_record() {
        let (history, storage) = history(10);
        history.push("P", HistoryEntry::new("P.A", "A")).await;
        history.clear_scope("P").await;
        assert!(history.entries("P").await.is_empty());
        assert_eq!(storage.get_item("history_P").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cleanup_reports_unreferenced_ids() {
        let (history, _) = history(10);
        history.push("P", HistoryEntry::new("P.A", "A")).await;
        history.push("Q", HistoryEntry::new("Q.X", "X")).await;
        history.save_component_state("Q.X", json!({"scroll": 120}));

        assert!(history.cleanup_orphaned_states().is_empty());

        history.clear_scope("Q").await;
        assert_eq!(history.cleanup_orphaned_states(), vec!["Q.X".to_string()]);
        assert_eq!(history.restore_component_state("Q.X"), None);
        // Already reported once
        assert!(history.cleanup_orphaned_states().is_empty());
    }

    #[tokio::test]
    async fn test_component_state_independent_of_bound() {
        let (history, _) = history(1);
        history.save_component_state("P.A", json!({"draft": "hi"}));
        history.push("P", HistoryEntry::new("P.A", "A")).await;
        history.push("P", HistoryEntry::new("P.B", "B")).await;
        assert_eq!(
            history.restore_component_state("P.A"),
            Some(json!({"draft": "hi"}))
        );
    }
}
