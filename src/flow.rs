//! # Flow context
//!
//! The one object an application root owns. It wires storage, registry,
//! history, store and runtime together, and fills in state namespaces from
//! what the user is looking at when a caller does not name one.
//!
//! Several contexts can coexist; nothing here is global.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde_json::Value;

use crate::core::config::ResolvedConfig;
use crate::core::event::{FlowEvent, Subscription};
use crate::core::history::History;
use crate::core::node::{Node, NodeId, NodePatch, NodeSpec};
use crate::core::registry::{HierarchyIssue, Registry, StructuralError};
use crate::debug::{self, DebugNode};
use crate::runtime::{Focus, OpenOptions, Runtime, RuntimeSettings, TransitionFlags};
use crate::storage::{MemoryStorage, StorageAdapter, build_storage};
use crate::store::{BatchOp, Namespace, Permission, SetOptions, StateError, StateRead, StateStore};

/// Where a state call lands. Empty means "infer from focus".
#[derive(Debug, Clone, Default)]
pub struct StateScope {
    pub parent_id: Option<NodeId>,
    pub child_id: Option<NodeId>,
    pub requester: Option<NodeId>,
}

impl StateScope {
    pub fn inferred() -> Self {
        Self::default()
    }

    pub fn parent(id: impl Into<String>) -> Self {
        Self {
            parent_id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn child(id: impl Into<String>) -> Self {
        Self {
            child_id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn requester(mut self, id: impl Into<String>) -> Self {
        self.requester = Some(id.into());
        self
    }
}

pub struct Flow {
    config: ResolvedConfig,
    storage: Arc<dyn StorageAdapter>,
    runtime: Runtime,
}

impl Flow {
    /// Builds a context with the storage backend the config asks for.
    pub fn new(config: ResolvedConfig) -> Self {
        let storage = build_storage(&config);
        Self::with_storage(config, storage)
    }

    pub fn with_storage(config: ResolvedConfig, storage: Arc<dyn StorageAdapter>) -> Self {
        let registry = Arc::new(Registry::new());
        let history = Arc::new(History::new(storage.clone(), config.history_limit));
        let store = Arc::new(StateStore::new(storage.clone()));
        let runtime = Runtime::new(registry, history, store, RuntimeSettings::from(&config));
        debug!("Flow context ready (storage: {})", storage.name());
        Self {
            config,
            storage,
            runtime,
        }
    }

    pub fn in_memory() -> Self {
        Self::with_storage(ResolvedConfig::default(), Arc::new(MemoryStorage::new()))
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn StorageAdapter> {
        &self.storage
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.runtime.registry()
    }

    pub fn history(&self) -> &Arc<History> {
        self.runtime.history()
    }

    pub fn store(&self) -> &Arc<StateStore> {
        self.runtime.store()
    }

    // ------------------------------------------------------------------------
    // Registration and observation
    // ------------------------------------------------------------------------

    pub fn register_node(&self, spec: NodeSpec) -> Result<NodeId, StructuralError> {
        self.registry().register_node(spec)
    }

    pub fn unregister_node(&self, id: &str) -> Vec<NodeId> {
        self.registry().unregister_node(id)
    }

    pub fn update_node_props(&self, id: &str, patch: NodePatch) -> Result<(), StructuralError> {
        self.registry().update_node_props(id, patch)
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&FlowEvent) + Send + Sync + 'static,
    {
        self.runtime.subscribe(callback)
    }

    pub fn get_active(&self, parent_id: &str) -> Option<Node> {
        self.runtime.get_active(parent_id)
    }

    pub fn get_flags(&self, parent_id: &str) -> TransitionFlags {
        self.runtime.get_flags(parent_id)
    }

    pub fn get_active_root(&self) -> Option<NodeId> {
        self.runtime.get_active_root()
    }

    pub fn focus(&self) -> Option<Focus> {
        self.runtime.focus()
    }

    // ------------------------------------------------------------------------
    // Navigation
    // ------------------------------------------------------------------------

    pub async fn open(&self, parent_id: &str, child: &str) -> bool {
        self.runtime.open(parent_id, child, None, OpenOptions::new()).await
    }

    pub async fn open_with(&self, parent_id: &str, child: &str, opener: Option<&str>, opts: OpenOptions) -> bool {
        self.runtime.open(parent_id, child, opener, opts).await
    }

    pub async fn close(&self, parent_id: &str) -> bool {
        self.runtime.close(parent_id).await
    }

    pub async fn next(&self, parent_id: &str) -> bool {
        self.runtime.next(parent_id, OpenOptions::new()).await
    }

    pub async fn prev(&self, parent_id: &str) -> bool {
        self.runtime.prev(parent_id, OpenOptions::new()).await
    }

    pub async fn go_to(&self, parent_id: &str, segments: &[&str]) -> bool {
        self.runtime.go_to(parent_id, segments).await
    }

    pub fn switch_root(&self, root_id: &str) -> bool {
        self.runtime.switch_root(root_id)
    }

    pub async fn open_tab(&self, tab_parent_id: &str, name: &str) -> bool {
        self.runtime.open_tab(tab_parent_id, name).await
    }

    pub async fn close_tab(&self, tab_parent_id: &str) -> bool {
        self.runtime.close_tab(tab_parent_id).await
    }

    pub async fn open_drawer(&self, drawer_id: &str, name: Option<&str>) -> bool {
        self.runtime.open_drawer(drawer_id, name).await
    }

    pub async fn close_drawer(&self, drawer_id: &str) -> bool {
        self.runtime.close_drawer(drawer_id).await
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    /// Explicit child, else explicit parent, else the focused parent, else
    /// the root scope. Also returns the requester to read with: the explicit
    /// one, or the focused child when the namespace was inferred.
    pub fn resolve_scope(&self, scope: &StateScope) -> (Namespace, Option<NodeId>) {
        if let Some(child) = &scope.child_id {
            return (Namespace::child(child.clone()), scope.requester.clone());
        }
        if let Some(parent) = &scope.parent_id {
            return (Namespace::parent(parent.clone()), scope.requester.clone());
        }
        match self.runtime.focus() {
            Some(focus) => (
                Namespace::parent(focus.parent_id),
                scope.requester.clone().or(Some(focus.child_id)),
            ),
            None => (Namespace::root(), scope.requester.clone()),
        }
    }

    pub async fn set(&self, key: &str, value: Value, scope: &StateScope, options: SetOptions) -> Result<(), StateError> {
        let (ns, _) = self.resolve_scope(scope);
        self.store().set(&ns, key, value, options).await
    }

    /// Whether `requester` is registered directly under the parent that
    /// owns `ns`. Such children read the parent's secure values.
    fn lives_in(&self, ns: &Namespace, requester: &str) -> bool {
        matches!(ns, Namespace::Parent(_))
            && self
                .registry()
                .get_node(requester)
                .is_some_and(|n| n.parent_id.as_deref() == Some(ns.owner()))
    }

    pub async fn get(&self, key: &str, scope: &StateScope) -> StateRead {
        let (ns, requester) = self.resolve_scope(scope);
        match requester.as_deref() {
            Some(child) if self.lives_in(&ns, child) => self.store().get_in_scope(&ns, key, child).await,
            requester => self.store().get(&ns, key, requester).await,
        }
    }

    pub async fn take(&self, key: &str, scope: &StateScope) -> StateRead {
        let (ns, requester) = self.resolve_scope(scope);
        match requester.as_deref() {
            Some(child) if self.lives_in(&ns, child) => self.store().take_in_scope(&ns, key, child).await,
            requester => self.store().take(&ns, key, requester).await,
        }
    }

    /// Ephemeral value of a child: the scope's child, else the focused one.
    pub async fn keep(&self, key: &str, value: Value, scope: &StateScope) -> Result<(), StateError> {
        let ns = match (&scope.child_id, self.runtime.focus()) {
            (Some(child), _) => Namespace::child(child.clone()),
            (None, Some(focus)) => Namespace::child(focus.child_id),
            (None, None) => Namespace::root(),
        };
        self.store()
            .set(&ns, key, value, SetOptions::new().temporary())
            .await
    }

    /// Hands `value` to `target` alone.
    pub async fn send(&self, key: &str, value: Value, target: &str, scope: &StateScope) -> Result<(), StateError> {
        let (ns, _) = self.resolve_scope(scope);
        let options = SetOptions::new().permission(Permission::single(target));
        self.store().set(&ns, key, value, options).await
    }

    pub async fn share(
        &self,
        key: &str,
        value: Value,
        with: Vec<NodeId>,
        ttl: Option<Duration>,
        scope: &StateScope,
    ) -> Result<(), StateError> {
        let (ns, _) = self.resolve_scope(scope);
        let mut permission = Permission::shared(with);
        permission.ttl = ttl;
        self.store()
            .set(&ns, key, value, SetOptions::new().persist().permission(permission))
            .await
    }

    pub async fn remove(&self, key: &str, scope: &StateScope) -> Option<Value> {
        let (ns, _) = self.resolve_scope(scope);
        self.store().remove(&ns, key).await
    }

    pub async fn clear(&self, scope: &StateScope, keep_permanent: bool) {
        let (ns, _) = self.resolve_scope(scope);
        self.store().clear(&ns, keep_permanent).await
    }

    pub async fn batch(&self, ops: Vec<BatchOp>, scope: &StateScope) -> Result<(), StateError> {
        let (ns, _) = self.resolve_scope(scope);
        self.store().batch(&ns, ops).await
    }

    pub async fn suggest(&self, prefix: &str, scope: &StateScope) -> Vec<String> {
        let (ns, requester) = self.resolve_scope(scope);
        self.store().suggest(&ns, prefix, requester.as_deref()).await
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    pub fn debug_tree(&self) -> Vec<DebugNode> {
        debug::debug_tree(&self.runtime)
    }

    pub fn print_tree(&self) -> String {
        debug::print_tree(&self.runtime)
    }

    pub fn validate_hierarchy(&self) -> Vec<HierarchyIssue> {
        debug::validate_hierarchy(&self.runtime)
    }

    pub fn state_registry_snapshot(&self) -> Value {
        debug::state_registry_snapshot(&self.runtime)
    }
}
