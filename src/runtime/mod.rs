//! # Navigation Runtime
//!
//! The state machine behind every navigation verb.
//!
//! ```text
//! verb ──► resolve target (Registry)
//!            │
//!            ▼
//!      lock parent ──► restriction check (enter target, leave current)
//!            │
//!            ▼
//!      onSwitching(current) ──► onOpen(target)      each timeout-bounded
//!            │
//!            ▼
//!      commit stack + active child ──► History ──► FlowEvent
//! ```
//!
//! Nothing is mutated until every check and hook has passed. A parent that
//! is mid-transition refuses further verbs until the transition ends.
//!
//! Transient state (active child, stack, flags per parent, the active root)
//! lives here and is rebuilt each process. History and the state store are
//! injected so this module never reaches back into them on its own.

pub mod hooks;
pub mod restriction;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

pub use hooks::{HookOutcome, run_at_end, run_hook};
pub use restriction::{Crossing, DEFAULT_RESTRICTION_TITLE, RestrictionNotice};

use crate::core::config::ResolvedConfig;
use crate::core::event::{EventBus, FlowEvent, Subscription};
use crate::core::history::{History, HistoryEntry};
use crate::core::node::{AtEnd, AtEndContext, AtEndDecision, Direction, DragEvent, Node, NodeId, NodeKind, OpenContext};
use crate::core::registry::Registry;
use crate::store::StateStore;

// ============================================================================
// Public types
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransitionFlags {
    pub opening: bool,
    pub switching: bool,
    pub dragging: bool,
    pub animating: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Opening,
    Switching,
    Dragging,
    Animating,
}

impl TransitionFlags {
    fn set(&mut self, flag: Flag, on: bool) {
        match flag {
            Flag::Opening => self.opening = on,
            Flag::Switching => self.switching = on,
            Flag::Dragging => self.dragging = on,
            Flag::Animating => self.animating = on,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Replace the top of the stack instead of pushing.
    pub replace: bool,
    /// Handed to `onOpen` and stored on the history entry.
    pub params: Option<Value>,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(mut self) -> Self {
        self.replace = true;
        self
    }

    pub fn params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub hook_timeout: Duration,
    pub root_switch_grace: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self::from(&ResolvedConfig::default())
    }
}

impl From<&ResolvedConfig> for RuntimeSettings {
    fn from(config: &ResolvedConfig) -> Self {
        Self {
            hook_timeout: config.hook_timeout,
            root_switch_grace: config.root_switch_grace,
        }
    }
}

/// Where the user is looking: the deepest parent with an active child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Focus {
    pub parent_id: NodeId,
    pub child_id: NodeId,
}

// ============================================================================
// Internal state
// ============================================================================

#[derive(Debug, Default)]
struct ParentState {
    active: Option<NodeId>,
    stack: Vec<NodeId>,
    flags: TransitionFlags,
    locked: bool,
}

#[derive(Debug, Default)]
struct RuntimeState {
    parents: HashMap<NodeId, ParentState>,
    active_root: Option<NodeId>,
    last_notice: Option<RestrictionNotice>,
}

impl RuntimeState {
    /// Drops removed nodes from every stack. Returns parents whose active
    /// child changed as a result.
    fn prune(&mut self, removed: &[NodeId]) -> Vec<(NodeId, Option<NodeId>)> {
        for id in removed {
            self.parents.remove(id);
        }
        if self
            .active_root
            .as_ref()
            .is_some_and(|root| removed.contains(root))
        {
            self.active_root = None;
        }

        let mut changed = Vec::new();
        for (parent_id, ps) in self.parents.iter_mut() {
            ps.stack.retain(|id| !removed.contains(id));
            if ps.active.as_ref().is_some_and(|a| removed.contains(a)) {
                ps.active = ps.stack.last().cloned();
                changed.push((parent_id.clone(), ps.active.clone()));
            }
        }
        changed.sort();
        changed
    }
}

/// Holds a parent's `locked` flag for the length of one transition.
struct ParentGuard {
    state: Arc<Mutex<RuntimeState>>,
    parent_id: NodeId,
}

impl Drop for ParentGuard {
    fn drop(&mut self) {
        if let Some(ps) = self.state.lock().parents.get_mut(&self.parent_id) {
            ps.locked = false;
        }
    }
}

/// How a successful transition changes the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Commit {
    Push,
    Replace,
    /// Clear the stack, then push.
    Reset,
    /// Pop back onto the entry below.
    Pop,
}

// ============================================================================
// Runtime
// ============================================================================

struct Inner {
    registry: Arc<Registry>,
    history: Arc<History>,
    store: Arc<StateStore>,
    settings: RuntimeSettings,
    state: Arc<Mutex<RuntimeState>>,
    _pruner: Subscription,
}

#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Runtime {
    pub fn new(
        registry: Arc<Registry>,
        history: Arc<History>,
        store: Arc<StateStore>,
        settings: RuntimeSettings,
    ) -> Self {
        let state = Arc::new(Mutex::new(RuntimeState::default()));
        let pruner = Self::watch_unregistrations(&registry, &history, &state);
        Self {
            inner: Arc::new(Inner {
                registry,
                history,
                store,
                settings,
                state,
                _pruner: pruner,
            }),
        }
    }

    /// Keeps active children valid when subtrees go away.
    fn watch_unregistrations(
        registry: &Arc<Registry>,
        history: &Arc<History>,
        state: &Arc<Mutex<RuntimeState>>,
    ) -> Subscription {
        let state: Weak<Mutex<RuntimeState>> = Arc::downgrade(state);
        let bus: Weak<EventBus> = Arc::downgrade(&registry.bus());
        let history = history.clone();
        registry.subscribe(move |event| {
            let FlowEvent::NodesUnregistered { ids } = event else {
                return;
            };
            let Some(state) = state.upgrade() else {
                return;
            };
            let changed = state.lock().prune(ids);
            history.forget_scopes(ids);
            if let Some(bus) = bus.upgrade() {
                for (parent_id, child_id) in changed {
                    bus.emit(FlowEvent::ActiveChanged { parent_id, child_id });
                }
            }
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn history(&self) -> &Arc<History> {
        &self.inner.history
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.inner.store
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.inner.settings
    }

    fn emit(&self, event: FlowEvent) {
        self.inner.registry.bus().emit(event);
    }

    // ------------------------------------------------------------------------
    // Read contract for the rendering layer
    // ------------------------------------------------------------------------

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&FlowEvent) + Send + Sync + 'static,
    {
        self.inner.registry.subscribe(callback)
    }

    pub fn get_active_id(&self, parent_id: &str) -> Option<NodeId> {
        self.inner
            .state
            .lock()
            .parents
            .get(parent_id)
            .and_then(|ps| ps.active.clone())
    }

    pub fn get_active(&self, parent_id: &str) -> Option<Node> {
        let id = self.get_active_id(parent_id)?;
        self.inner.registry.get_node(&id)
    }

    pub fn get_flags(&self, parent_id: &str) -> TransitionFlags {
        self.inner
            .state
            .lock()
            .parents
            .get(parent_id)
            .map(|ps| ps.flags)
            .unwrap_or_default()
    }

    pub fn get_active_root(&self) -> Option<NodeId> {
        self.inner.state.lock().active_root.clone()
    }

    pub fn stack(&self, parent_id: &str) -> Vec<NodeId> {
        self.inner
            .state
            .lock()
            .parents
            .get(parent_id)
            .map(|ps| ps.stack.clone())
            .unwrap_or_default()
    }

    /// Parents the runtime holds state for, sorted.
    pub fn tracked_parents(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.inner.state.lock().parents.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_locked(&self, parent_id: &str) -> bool {
        self.inner
            .state
            .lock()
            .parents
            .get(parent_id)
            .is_some_and(|ps| ps.locked)
    }

    pub fn last_restriction(&self) -> Option<RestrictionNotice> {
        self.inner.state.lock().last_notice.clone()
    }

    /// Descends from the active root through active children to the deepest
    /// parent that has one.
    pub fn focus(&self) -> Option<Focus> {
        let state = self.inner.state.lock();
        let mut parent_id = state.active_root.clone()?;
        let mut child_id = state.parents.get(&parent_id)?.active.clone()?;
        // Bounded by the number of parents, so a corrupt map cannot spin
        for _ in 0..=state.parents.len() {
            match state.parents.get(&child_id).and_then(|ps| ps.active.clone()) {
                Some(grandchild) => {
                    parent_id = std::mem::replace(&mut child_id, grandchild);
                }
                None => break,
            }
        }
        Some(Focus {
            parent_id,
            child_id,
        })
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn try_lock(&self, parent_id: &str) -> Option<ParentGuard> {
        let mut state = self.inner.state.lock();
        let ps = state.parents.entry(parent_id.to_string()).or_default();
        if ps.locked {
            debug!("{} is mid-transition, refusing", parent_id);
            return None;
        }
        ps.locked = true;
        Some(ParentGuard {
            state: self.inner.state.clone(),
            parent_id: parent_id.to_string(),
        })
    }

    fn update_flags(&self, parent_id: &str, f: impl FnOnce(&mut TransitionFlags)) {
        let changed = {
            let mut state = self.inner.state.lock();
            let ps = state.parents.entry(parent_id.to_string()).or_default();
            let before = ps.flags;
            f(&mut ps.flags);
            (ps.flags != before).then_some(ps.flags)
        };
        if let Some(flags) = changed {
            self.emit(FlowEvent::FlagsChanged {
                parent_id: parent_id.to_string(),
                flags,
            });
        }
    }

    fn clear_transition_flags(&self, parent_id: &str) {
        self.update_flags(parent_id, |f| {
            f.opening = false;
            f.switching = false;
        });
    }

    fn surface(&self, notice: RestrictionNotice) {
        info!("Restricted by {}: {}", notice.node_id, notice.message);
        self.inner.state.lock().last_notice = Some(notice.clone());
        self.emit(FlowEvent::Restricted { notice });
    }

    /// Child by name, then by constructed id, then by raw id.
    fn resolve_child(&self, parent_id: &str, child: &str) -> Option<Node> {
        let registry = &self.inner.registry;
        registry
            .get_child_by_name(parent_id, child)
            .or_else(|| registry.get_node(&format!("{}.{}", parent_id, child)))
            .or_else(|| registry.get_node(child))
    }

    /// Runs the full check/hook/commit contract for moving `parent_id` to
    /// `target`.
    #[allow(clippy::too_many_arguments)]
    async fn transition(
        &self,
        parent_id: &str,
        target: &Node,
        opener: Option<&str>,
        direction: Direction,
        params: Option<Value>,
        restored: Option<HistoryEntry>,
        commit: Commit,
    ) -> bool {
        let Some(guard) = self.try_lock(parent_id) else {
            return false;
        };
        let registry = &self.inner.registry;
        let current = self.get_active_id(parent_id);

        if let Some(notice) = restriction::check(registry, &target.id, Crossing::Entering) {
            self.surface(notice);
            return false;
        }
        if let Some(current_id) = current.as_deref()
            && current_id != target.id
            && let Some(notice) = restriction::check(registry, current_id, Crossing::Leaving)
        {
            self.surface(notice);
            return false;
        }

        self.update_flags(parent_id, |f| {
            f.opening = true;
            f.switching = current.is_some();
        });

        let timeout = self.inner.settings.hook_timeout;
        let outgoing = current
            .as_deref()
            .and_then(|id| registry.get_node(id))
            .and_then(|node| {
                let hook = node.hooks()?.on_switching.clone()?;
                Some((node.id, hook))
            });
        if let Some((node_id, hook)) = outgoing {
            let outcome = run_hook(&hook, direction, timeout, "onSwitching", &node_id).await;
            if !outcome.allows() {
                debug!("{} declined leaving ({:?})", node_id, outcome);
                self.clear_transition_flags(parent_id);
                return false;
            }
        }

        if let Some(hook) = target.hooks().and_then(|h| h.on_open.clone()) {
            let ctx = OpenContext {
                parent_id: parent_id.to_string(),
                child_id: target.id.clone(),
                opener: opener.map(str::to_string),
                direction,
                params: params.clone(),
                restored,
            };
            let outcome = run_hook(&hook, ctx, timeout, "onOpen", &target.id).await;
            if !outcome.allows() {
                debug!("{} declined opening ({:?})", target.id, outcome);
                self.clear_transition_flags(parent_id);
                return false;
            }
        }

        // Hooks may have raced an unmount
        if !registry.contains(&target.id) || !registry.contains(parent_id) {
            warn!("{} went away during its transition", target.id);
            self.clear_transition_flags(parent_id);
            return false;
        }

        {
            let mut state = self.inner.state.lock();
            let ps = state.parents.entry(parent_id.to_string()).or_default();
            match commit {
                Commit::Push => {
                    ps.stack.push(target.id.clone());
                    let limit = self.inner.history.limit().max(1);
                    if ps.stack.len() > limit {
                        let overflow = ps.stack.len() - limit;
                        ps.stack.drain(..overflow);
                    }
                }
                Commit::Replace => {
                    ps.stack.pop();
                    ps.stack.push(target.id.clone());
                }
                Commit::Reset => {
                    ps.stack.clear();
                    ps.stack.push(target.id.clone());
                }
                Commit::Pop => {
                    ps.stack.pop();
                    if ps.stack.last() != Some(&target.id) {
                        ps.stack.push(target.id.clone());
                    }
                }
            }
            ps.active = Some(target.id.clone());
            ps.flags.opening = false;
            ps.flags.switching = false;
        }

        let history = &self.inner.history;
        match commit {
            Commit::Push => {
                history
                    .push(parent_id, HistoryEntry::new(&target.id, &target.name).with_params(params))
                    .await
            }
            Commit::Replace => {
                history
                    .replace_top(parent_id, HistoryEntry::new(&target.id, &target.name).with_params(params))
                    .await
            }
            Commit::Reset => {
                history.clear_scope(parent_id).await;
                history
                    .push(parent_id, HistoryEntry::new(&target.id, &target.name).with_params(params))
                    .await
            }
            Commit::Pop => {
                history.pop(parent_id).await;
            }
        }

        drop(guard);

        debug!("{} -> {} ({:?})", parent_id, target.id, commit);
        self.emit(FlowEvent::ActiveChanged {
            parent_id: parent_id.to_string(),
            child_id: Some(target.id.clone()),
        });
        self.emit(FlowEvent::FlagsChanged {
            parent_id: parent_id.to_string(),
            flags: self.get_flags(parent_id),
        });
        true
    }

    fn first_open_child(&self, parent_id: &str, range: std::ops::Range<usize>) -> Option<Node> {
        let children = self.inner.registry.get_children(parent_id);
        children
            .into_iter()
            .enumerate()
            .filter(|(i, _)| range.contains(i))
            .map(|(_, n)| n)
            .find(|n| n.restricted_in().is_none())
    }

    // ------------------------------------------------------------------------
    // Verbs
    // ------------------------------------------------------------------------

    /// Makes `child` the active child of `parent_id`.
    ///
    /// `child` is a name under the parent, a path relative to it, or a raw
    /// id. A node that belongs to another parent is opened there instead,
    /// switching the active root if it lives in another pack.
    pub async fn open(&self, parent_id: &str, child: &str, opener: Option<&str>, opts: OpenOptions) -> bool {
        if !self.inner.registry.contains(parent_id) {
            warn!("open: unknown parent {}", parent_id);
            return false;
        }
        let Some(target) = self.resolve_child(parent_id, child) else {
            warn!("open: {} has no child {}", parent_id, child);
            return false;
        };
        let Some(owner_id) = target.parent_id.clone() else {
            warn!("open: {} is a pack, use switch_root", target.id);
            return false;
        };

        if owner_id != parent_id {
            debug!("open: {} belongs to {}, redirecting", target.id, owner_id);
            if let Some(pack) = self.inner.registry.nearest_of_kind(&owner_id, NodeKind::Pack)
                && self.get_active_root().as_deref() != Some(pack.id.as_str())
            {
                self.switch_root(&pack.id);
            }
        }

        if self.is_locked(&owner_id) {
            debug!("open: {} is mid-transition", owner_id);
            return false;
        }
        if !opts.replace && self.get_active_id(&owner_id).as_deref() == Some(target.id.as_str()) {
            return true;
        }
        let commit = if opts.replace && !self.stack(&owner_id).is_empty() {
            Commit::Replace
        } else {
            Commit::Push
        };
        self.transition(&owner_id, &target, opener, Direction::Forward, opts.params, None, commit)
            .await
    }

    /// Closes whatever is open in `parent_id`. Returns false when nothing
    /// was open or leaving is restricted.
    pub async fn close(&self, parent_id: &str) -> bool {
        let Some(guard) = self.try_lock(parent_id) else {
            return false;
        };
        let (current, stack) = {
            let state = self.inner.state.lock();
            match state.parents.get(parent_id) {
                Some(ps) => (ps.active.clone(), ps.stack.clone()),
                None => (None, Vec::new()),
            }
        };
        if current.is_none() && stack.is_empty() {
            return false;
        }
        let registry = &self.inner.registry;
        if let Some(current_id) = current.as_deref()
            && let Some(notice) = restriction::check(registry, current_id, Crossing::Leaving)
        {
            self.surface(notice);
            return false;
        }

        self.update_flags(parent_id, |f| f.switching = true);
        let mut seen: Vec<&str> = Vec::new();
        for id in stack.iter().rev() {
            if seen.contains(&id.as_str()) {
                continue;
            }
            seen.push(id);
            let hook = registry
                .get_node(id)
                .and_then(|n| n.hooks().and_then(|h| h.on_close.clone()));
            if let Some(hook) = hook {
                let outcome = run_hook(&hook, (), self.inner.settings.hook_timeout, "onClose", id).await;
                if !outcome.allows() {
                    debug!("onClose of {} ignored: {:?}", id, outcome);
                }
            }
        }

        {
            let mut state = self.inner.state.lock();
            if let Some(ps) = state.parents.get_mut(parent_id) {
                ps.stack.clear();
                ps.active = None;
                ps.flags.switching = false;
                ps.flags.opening = false;
            }
        }
        self.inner.history.clear_scope(parent_id).await;
        drop(guard);

        debug!("Closed {}", parent_id);
        self.emit(FlowEvent::ActiveChanged {
            parent_id: parent_id.to_string(),
            child_id: None,
        });
        self.emit(FlowEvent::FlagsChanged {
            parent_id: parent_id.to_string(),
            flags: self.get_flags(parent_id),
        });
        true
    }

    fn next_boxed<'a>(&'a self, parent_id: &'a str, opts: OpenOptions) -> BoxFuture<'a, bool> {
        Box::pin(self.next(parent_id, opts))
    }

    /// Moves to the next unrestricted sibling, applying the at-end policy
    /// past the last one. A policy's answer is final; the runtime wraps
    /// around to the first unrestricted sibling only when the policy
    /// declines or none is set.
    pub async fn next(&self, parent_id: &str, opts: OpenOptions) -> bool {
        let registry = &self.inner.registry;
        let Some(parent) = registry.get_node(parent_id) else {
            warn!("next: unknown parent {}", parent_id);
            return false;
        };
        let children = registry.get_children(parent_id);
        if children.is_empty() {
            return false;
        }
        let current = self.get_active_id(parent_id);
        let index = current
            .as_deref()
            .and_then(|id| children.iter().position(|c| c.id == id));

        let Some(index) = index else {
            let Some(first) = self.first_open_child(parent_id, 0..children.len()) else {
                return false;
            };
            return self
                .transition(parent_id, &first, None, Direction::Forward, opts.params, None, Commit::Push)
                .await;
        };

        if let Some(candidate) = self.first_open_child(parent_id, index + 1..children.len()) {
            return self
                .transition(parent_id, &candidate, None, Direction::Forward, opts.params, None, Commit::Push)
                .await;
        }

        let decision = match parent.props.at_end().cloned() {
            None => AtEndDecision::Decline,
            Some(AtEnd::Parent) => match parent.parent_id.as_deref() {
                Some(grandparent) => return self.next_boxed(grandparent, opts).await,
                None => AtEndDecision::Decline,
            },
            Some(AtEnd::First) => {
                let Some(first) = self.first_open_child(parent_id, 0..children.len()) else {
                    return false;
                };
                return self
                    .transition(parent_id, &first, None, Direction::Forward, opts.params, None, Commit::Reset)
                    .await;
            }
            Some(AtEnd::Element(name)) => AtEndDecision::Open(name),
            Some(AtEnd::Custom(handler)) => {
                let ctx = AtEndContext {
                    parent_id: parent_id.to_string(),
                    current_child_id: current.clone(),
                    sibling_count: children.len(),
                };
                run_at_end(&handler, ctx, self.inner.settings.hook_timeout).await
            }
        };

        debug!("next: {} at end -> {:?}", parent_id, decision);
        match decision {
            AtEndDecision::Decline => {}
            AtEndDecision::Handled(result) => return result,
            AtEndDecision::Open(name) => return self.open(parent_id, &name, None, opts).await,
            AtEndDecision::Close => return self.close(parent_id).await,
            AtEndDecision::Unregister => {
                if !self.close(parent_id).await {
                    return false;
                }
                self.inner.registry.unregister_node(parent_id);
                return true;
            }
        }

        match self.first_open_child(parent_id, 0..index) {
            Some(first) => {
                self.transition(parent_id, &first, None, Direction::Forward, opts.params, None, Commit::Push)
                    .await
            }
            None => false,
        }
    }

    fn prev_boxed<'a>(&'a self, parent_id: &'a str, opts: OpenOptions) -> BoxFuture<'a, bool> {
        Box::pin(self.prev(parent_id, opts))
    }

    /// Steps back within `parent_id`, or bubbles to its own parent once
    /// there is nothing left to go back to. Returns false at the true root,
    /// where the host decides.
    pub async fn prev(&self, parent_id: &str, opts: OpenOptions) -> bool {
        let stack = self.stack(parent_id);
        if stack.len() >= 2 {
            let target_id = &stack[stack.len() - 2];
            let Some(target) = self.inner.registry.get_node(target_id) else {
                return false;
            };
            let restored = {
                let entries = self.inner.history.entries(parent_id).await;
                entries
                    .iter()
                    .rev()
                    .nth(1)
                    .filter(|e| e.child_id == target.id)
                    .cloned()
            };
            let params = opts.params.or_else(|| restored.as_ref().and_then(|e| e.params.clone()));
            return self
                .transition(parent_id, &target, None, Direction::Backward, params, restored, Commit::Pop)
                .await;
        }

        match self.inner.registry.get_node(parent_id).and_then(|n| n.parent_id) {
            Some(grandparent) => self.prev_boxed(&grandparent, opts).await,
            None => false,
        }
    }

    /// Opens a dotted path, relative to `parent_id` or absolute, activating
    /// every level on the way that is not active yet.
    pub async fn go_to(&self, parent_id: &str, segments: &[&str]) -> bool {
        let path = segments.join(".");
        if path.is_empty() {
            return false;
        }
        let registry = &self.inner.registry;
        let relative = format!("{}.{}", parent_id, path);
        let target = registry.get_node(&relative).or_else(|| registry.get_node(&path));
        let Some(target) = target else {
            warn!("go_to: nothing at {} from {}", path, parent_id);
            return false;
        };

        // Root first, then every (parent, child) pair downwards
        let mut chain = registry.get_parent_chain(&target.id);
        chain.reverse();
        let Some(root) = chain.first() else {
            warn!("go_to: {} is a pack, use switch_root", target.id);
            return false;
        };
        if root.kind == NodeKind::Pack && self.get_active_root().as_deref() != Some(root.id.as_str()) {
            self.switch_root(&root.id);
        }
        chain.push(target);

        for pair in chain.windows(2) {
            let (parent, child) = (&pair[0], &pair[1]);
            if self.get_active_id(&parent.id).as_deref() == Some(child.id.as_str()) {
                continue;
            }
            let ok = self
                .transition(&parent.id, child, None, Direction::Forward, None, None, Commit::Push)
                .await;
            if !ok {
                return false;
            }
        }
        true
    }

    /// Points the active root at the pack enclosing `root_id`. After the
    /// grace delay, state orphaned by the switch is purged in the background.
    pub fn switch_root(&self, root_id: &str) -> bool {
        let Some(pack) = self.inner.registry.nearest_of_kind(root_id, NodeKind::Pack) else {
            warn!("switch_root: no pack encloses {}", root_id);
            return false;
        };
        let previous = {
            let mut state = self.inner.state.lock();
            if state.active_root.as_deref() == Some(pack.id.as_str()) {
                return true;
            }
            state.active_root.replace(pack.id.clone())
        };

        info!("Active root {:?} -> {}", previous, pack.id);
        self.emit(FlowEvent::RootSwitched {
            previous,
            current: pack.id,
        });

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let runtime = self.clone();
                let grace = self.inner.settings.root_switch_grace;
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    runtime.purge_orphans().await;
                });
            }
            Err(_) => warn!("No async runtime, skipping orphan cleanup"),
        }
        true
    }

    /// Purges temporary and scoped state of child ids no longer referenced
    /// by any history stack. Permanent keys are never touched.
    pub async fn purge_orphans(&self) -> Vec<NodeId> {
        let in_use: Vec<NodeId> = {
            let state = self.inner.state.lock();
            state
                .parents
                .values()
                .flat_map(|ps| ps.stack.iter().chain(ps.active.iter()))
                .cloned()
                .collect()
        };
        let orphans: Vec<NodeId> = self
            .inner
            .history
            .cleanup_orphaned_states()
            .into_iter()
            .filter(|id| !in_use.contains(id))
            .collect();

        for id in &orphans {
            self.inner.store.purge_ephemeral(id).await;
        }
        if !orphans.is_empty() {
            info!("Purged ephemeral state of {} orphaned node(s)", orphans.len());
            self.emit(FlowEvent::StatePurged { ids: orphans.clone() });
        }
        orphans
    }

    fn require_kind(&self, parent_id: &str, kind: NodeKind, verb: &str) -> bool {
        match self.inner.registry.get_node(parent_id) {
            Some(node) if node.kind == kind => true,
            Some(node) => {
                warn!("{}: {} is a {}, not a {}", verb, parent_id, node.kind.label(), kind.label());
                false
            }
            None => {
                warn!("{}: unknown node {}", verb, parent_id);
                false
            }
        }
    }

    /// Switches tabs. Tab switches replace the top of the stack.
    pub async fn open_tab(&self, tab_parent_id: &str, name: &str) -> bool {
        if !self.require_kind(tab_parent_id, NodeKind::TabParent, "open_tab") {
            return false;
        }
        self.open(tab_parent_id, name, None, OpenOptions::new().replace()).await
    }

    pub async fn close_tab(&self, tab_parent_id: &str) -> bool {
        self.require_kind(tab_parent_id, NodeKind::TabParent, "close_tab") && self.close(tab_parent_id).await
    }

    /// Opens a drawer on `name`, or on its initial (else first unrestricted)
    /// child.
    pub async fn open_drawer(&self, drawer_id: &str, name: Option<&str>) -> bool {
        if !self.require_kind(drawer_id, NodeKind::DrawerParent, "open_drawer") {
            return false;
        }
        let target = match name {
            Some(name) => name.to_string(),
            None => {
                let initial = self
                    .inner
                    .registry
                    .get_node(drawer_id)
                    .and_then(|n| n.props.initial().map(str::to_string));
                let fallback = || {
                    let count = self.inner.registry.get_children(drawer_id).len();
                    self.first_open_child(drawer_id, 0..count).map(|n| n.name)
                };
                match initial.or_else(fallback) {
                    Some(name) => name,
                    None => return false,
                }
            }
        };
        self.open(drawer_id, &target, None, OpenOptions::new()).await
    }

    pub async fn close_drawer(&self, drawer_id: &str) -> bool {
        self.require_kind(drawer_id, NodeKind::DrawerParent, "close_drawer") && self.close(drawer_id).await
    }

    /// Lets the rendering layer report animation state.
    pub fn set_flag(&self, parent_id: &str, flag: Flag, on: bool) {
        self.update_flags(parent_id, |f| f.set(flag, on));
    }

    /// Feeds gesture progress to the active child's `onDrag`.
    pub fn report_drag(&self, parent_id: &str, event: DragEvent) {
        self.update_flags(parent_id, |f| f.dragging = !event.released);
        let handler = self
            .get_active(parent_id)
            .and_then(|n| n.hooks().and_then(|h| h.on_drag.clone()));
        if let Some(handler) = handler {
            handler.call(&event);
        }
    }
}
