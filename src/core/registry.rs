//! # Node Registry
//!
//! Owns every registered node. Dotted ids are the public address, but
//! internally nodes sit in an arena of slots indexed by [`Handle`], and each
//! slot keeps a name→handle index of its children, so lookups never parse or
//! concatenate strings.
//!
//! ```text
//! Registry
//! ├── arena: RwLock<Arena>
//! │   ├── slots: Vec<Option<Slot>>     // node + parent handle + children
//! │   ├── free: Vec<usize>             // reusable slot indices
//! │   └── by_id: HashMap<NodeId, Handle>
//! └── bus: Arc<EventBus>               // the one notification channel
//! ```
//!
//! Every mutation emits a [`FlowEvent`] after the arena lock is released.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::RwLock;

use crate::core::event::{EventBus, FlowEvent, Subscription};
use crate::core::node::{Node, NodeId, NodeKind, NodePatch, NodeSpec};

// ============================================================================
// Error Type
// ============================================================================

/// Registration failures. Always returned to the caller; the registry is
/// left exactly as it was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuralError {
    DuplicateSiblingName { parent_id: NodeId, name: String },
    MissingParent { id: NodeId, parent_id: Option<NodeId> },
    /// Only packs may be parentless, and packs may not have a parent.
    UnexpectedParent { id: NodeId, parent_id: NodeId },
    Cycle { id: NodeId, parent_id: NodeId },
    KindMismatch { id: NodeId, kind: NodeKind },
    InvalidName { name: String },
    UnknownNode { id: NodeId },
}

impl fmt::Display for StructuralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StructuralError::DuplicateSiblingName { parent_id, name } => {
                write!(f, "{parent_id} already has a child named {name:?}")
            }
            StructuralError::MissingParent { id, parent_id: Some(p) } => {
                write!(f, "{id}: parent {p} is not registered")
            }
            StructuralError::MissingParent { id, parent_id: None } => {
                write!(f, "{id}: only packs may be registered without a parent")
            }
            StructuralError::UnexpectedParent { id, parent_id } => {
                write!(f, "{id}: a pack cannot live under {parent_id}")
            }
            StructuralError::Cycle { id, parent_id } => {
                write!(f, "{id}: moving under {parent_id} would create a cycle")
            }
            StructuralError::KindMismatch { id, kind } => {
                write!(f, "{id}: props do not fit a {} node", kind.label())
            }
            StructuralError::InvalidName { name } => {
                write!(f, "invalid node name {name:?} (empty or contains '.')")
            }
            StructuralError::UnknownNode { id } => write!(f, "no node registered as {id}"),
        }
    }
}

impl std::error::Error for StructuralError {}

/// Problems found by hierarchy validation. Registration prevents the
/// structural ones, so finding one means the arena was corrupted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HierarchyIssue {
    Orphan { id: NodeId, parent_id: NodeId },
    DuplicateName { parent_id: NodeId, name: String },
    Cycle { id: NodeId },
    DanglingIndex { id: NodeId },
    /// Runtime state points at a node that is not a live child of the parent.
    StaleActive { parent_id: NodeId, child_id: NodeId },
}

impl fmt::Display for HierarchyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HierarchyIssue::Orphan { id, parent_id } => {
                write!(f, "orphan: {id} points at missing parent {parent_id}")
            }
            HierarchyIssue::DuplicateName { parent_id, name } => {
                write!(f, "duplicate: {parent_id} has several children named {name:?}")
            }
            HierarchyIssue::Cycle { id } => write!(f, "cycle: {id} is its own ancestor"),
            HierarchyIssue::DanglingIndex { id } => {
                write!(f, "index: {id} resolves to an empty slot")
            }
            HierarchyIssue::StaleActive { parent_id, child_id } => {
                write!(f, "stale: {parent_id} shows {child_id}, which is not its child")
            }
        }
    }
}

// ============================================================================
// Arena
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(usize);

struct Slot {
    node: Node,
    parent: Option<Handle>,
    children: Vec<Handle>,
    by_name: HashMap<String, Handle>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    by_id: HashMap<NodeId, Handle>,
}

impl Arena {
    fn slot(&self, h: Handle) -> Option<&Slot> {
        self.slots.get(h.0).and_then(|s| s.as_ref())
    }

    fn slot_mut(&mut self, h: Handle) -> Option<&mut Slot> {
        self.slots.get_mut(h.0).and_then(|s| s.as_mut())
    }

    fn lookup(&self, id: &str) -> Option<(Handle, &Slot)> {
        let h = *self.by_id.get(id)?;
        self.slot(h).map(|s| (h, s))
    }

    fn insert(&mut self, slot: Slot) -> Handle {
        match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(slot);
                Handle(i)
            }
            None => {
                self.slots.push(Some(slot));
                Handle(self.slots.len() - 1)
            }
        }
    }

    /// True if `candidate` is `node` or lies below it.
    fn is_within(&self, candidate: Handle, node: Handle) -> bool {
        let mut cursor = Some(candidate);
        while let Some(h) = cursor {
            if h == node {
                return true;
            }
            cursor = self.slot(h).and_then(|s| s.parent);
        }
        false
    }

    fn detach(&mut self, h: Handle) {
        let Some((parent, name)) = self.slot(h).map(|s| (s.parent, s.node.name.clone())) else {
            return;
        };
        if let Some(parent) = parent.and_then(|p| self.slot_mut(p)) {
            parent.children.retain(|c| *c != h);
            if parent.by_name.get(&name) == Some(&h) {
                parent.by_name.remove(&name);
            }
        }
    }

    /// Puts `h` back into its parent's name index, keeping its position.
    fn reindex(&mut self, h: Handle, parent: Handle) {
        let Some(name) = self.slot(h).map(|s| s.node.name.clone()) else {
            return;
        };
        if let Some(p) = self.slot_mut(parent) {
            p.by_name.retain(|_, v| *v != h);
            p.by_name.insert(name, h);
        }
    }

    fn attach(&mut self, h: Handle, parent: Handle) {
        let Some(name) = self.slot(h).map(|s| s.node.name.clone()) else {
            return;
        };
        if let Some(p) = self.slot_mut(parent) {
            p.children.push(h);
            p.by_name.insert(name, h);
        }
        if let Some(s) = self.slot_mut(h) {
            s.parent = Some(parent);
        }
    }

    /// Post-order walk: deepest descendants first, `h` last.
    fn subtree(&self, h: Handle, out: &mut Vec<Handle>) {
        if let Some(slot) = self.slot(h) {
            for child in &slot.children {
                self.subtree(*child, out);
            }
            out.push(h);
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

pub struct Registry {
    arena: RwLock<Arena>,
    bus: Arc<EventBus>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            arena: RwLock::new(Arena::default()),
            bus: Arc::new(EventBus::new()),
        }
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&FlowEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(callback)
    }

    /// Inserts a node, or refreshes it if the id is already registered.
    pub fn register_node(&self, spec: NodeSpec) -> Result<NodeId, StructuralError> {
        if spec.name.is_empty() || spec.name.contains('.') {
            return Err(StructuralError::InvalidName { name: spec.name });
        }
        let id = spec.resolved_id();
        if !spec.props.matches(spec.kind) {
            return Err(StructuralError::KindMismatch { id, kind: spec.kind });
        }
        match (&spec.parent_id, spec.kind) {
            (Some(parent_id), NodeKind::Pack) => {
                return Err(StructuralError::UnexpectedParent {
                    id,
                    parent_id: parent_id.clone(),
                });
            }
            (None, kind) if kind != NodeKind::Pack => {
                return Err(StructuralError::MissingParent { id, parent_id: None });
            }
            _ => {}
        }

        let event = {
            let mut arena = self.arena.write();

            let parent = match &spec.parent_id {
                Some(parent_id) => match arena.by_id.get(parent_id) {
                    Some(h) => Some(*h),
                    None => {
                        return Err(StructuralError::MissingParent {
                            id,
                            parent_id: Some(parent_id.clone()),
                        });
                    }
                },
                None => None,
            };

            let existing = arena.by_id.get(&id).copied();

            // A different node under the same parent may not share the name
            if let Some(p) = parent
                && let Some(other) = arena.slot(p).and_then(|s| s.by_name.get(&spec.name))
                && Some(*other) != existing
            {
                return Err(StructuralError::DuplicateSiblingName {
                    parent_id: spec.parent_id.clone().unwrap_or_default(),
                    name: spec.name,
                });
            }

            match existing {
                Some(h) => {
                    let kind = arena.slot(h).map(|s| s.node.kind);
                    if kind != Some(spec.kind) {
                        return Err(StructuralError::KindMismatch { id, kind: spec.kind });
                    }
                    if let Some(p) = parent
                        && arena.is_within(p, h)
                    {
                        return Err(StructuralError::Cycle {
                            id,
                            parent_id: spec.parent_id.clone().unwrap_or_default(),
                        });
                    }

                    // Same parent keeps the sibling position
                    let moved = arena.slot(h).map(|s| s.parent) != Some(parent);
                    if moved {
                        arena.detach(h);
                    }
                    if let Some(slot) = arena.slot_mut(h) {
                        slot.node.name = spec.name;
                        slot.node.parent_id = spec.parent_id;
                        slot.node.props.refresh(spec.props);
                        if moved {
                            slot.parent = None;
                        }
                    }
                    match parent {
                        Some(p) if moved => arena.attach(h, p),
                        Some(p) => arena.reindex(h, p),
                        None => {}
                    }
                    debug!("Refreshed node {}", id);
                    FlowEvent::NodeUpdated { id: id.clone() }
                }
                None => {
                    let node = Node {
                        id: id.clone(),
                        name: spec.name,
                        kind: spec.kind,
                        parent_id: spec.parent_id,
                        props: spec.props,
                    };
                    let h = arena.insert(Slot {
                        node,
                        parent: None,
                        children: Vec::new(),
                        by_name: HashMap::new(),
                    });
                    arena.by_id.insert(id.clone(), h);
                    if let Some(p) = parent {
                        arena.attach(h, p);
                    }
                    debug!("Registered {} node {}", spec.kind.label(), id);
                    FlowEvent::NodeRegistered { id: id.clone() }
                }
            }
        };

        self.bus.emit(event);
        Ok(id)
    }

    /// Removes a node and its whole subtree. Returns the removed ids,
    /// deepest first; empty if the id was unknown.
    pub fn unregister_node(&self, id: &str) -> Vec<NodeId> {
        let removed = {
            let mut arena = self.arena.write();
            let Some(h) = arena.by_id.get(id).copied() else {
                return Vec::new();
            };
            arena.detach(h);

            let mut handles = Vec::new();
            arena.subtree(h, &mut handles);

            let mut removed = Vec::with_capacity(handles.len());
            for h in handles {
                if let Some(slot) = arena.slots[h.0].take() {
                    arena.by_id.remove(&slot.node.id);
                    arena.free.push(h.0);
                    removed.push(slot.node.id);
                }
            }
            removed
        };

        debug!("Unregistered {} node(s) under {}", removed.len(), id);
        self.bus.emit(FlowEvent::NodesUnregistered {
            ids: removed.clone(),
        });
        removed
    }

    /// Shallow-merges a patch into a node's props.
    pub fn update_node_props(&self, id: &str, patch: NodePatch) -> Result<(), StructuralError> {
        {
            let mut arena = self.arena.write();
            let Some(h) = arena.by_id.get(id).copied() else {
                return Err(StructuralError::UnknownNode { id: id.to_string() });
            };
            match arena.slot_mut(h) {
                Some(slot) => patch.apply(&mut slot.node.props),
                None => {
                    warn!("Registry index points at an empty slot for {}", id);
                    return Err(StructuralError::UnknownNode { id: id.to_string() });
                }
            }
        }
        self.bus.emit(FlowEvent::NodeUpdated { id: id.to_string() });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn contains(&self, id: &str) -> bool {
        self.arena.read().by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.arena.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_node(&self, id: &str) -> Option<Node> {
        self.arena.read().lookup(id).map(|(_, s)| s.node.clone())
    }

    /// Children in registration order.
    pub fn get_children(&self, id: &str) -> Vec<Node> {
        let arena = self.arena.read();
        let Some((_, slot)) = arena.lookup(id) else {
            return Vec::new();
        };
        slot.children
            .iter()
            .filter_map(|h| arena.slot(*h).map(|s| s.node.clone()))
            .collect()
    }

    pub fn child_ids(&self, id: &str) -> Vec<NodeId> {
        let arena = self.arena.read();
        let Some((_, slot)) = arena.lookup(id) else {
            return Vec::new();
        };
        slot.children
            .iter()
            .filter_map(|h| arena.slot(*h).map(|s| s.node.id.clone()))
            .collect()
    }

    pub fn get_child_by_name(&self, parent_id: &str, name: &str) -> Option<Node> {
        let arena = self.arena.read();
        let (_, parent) = arena.lookup(parent_id)?;
        let h = parent.by_name.get(name)?;
        arena.slot(*h).map(|s| s.node.clone())
    }

    /// Ancestors of `id`, nearest first, ending at the root.
    pub fn get_parent_chain(&self, id: &str) -> Vec<Node> {
        let arena = self.arena.read();
        let mut chain = Vec::new();
        let mut cursor = arena.lookup(id).and_then(|(_, s)| s.parent);
        while let Some(h) = cursor {
            let Some(slot) = arena.slot(h) else { break };
            chain.push(slot.node.clone());
            cursor = slot.parent;
        }
        chain
    }

    /// Nearest node of `kind` starting at `id` itself.
    pub fn nearest_of_kind(&self, id: &str, kind: NodeKind) -> Option<Node> {
        let arena = self.arena.read();
        let mut cursor = arena.by_id.get(id).copied();
        while let Some(h) = cursor {
            let slot = arena.slot(h)?;
            if slot.node.kind == kind {
                return Some(slot.node.clone());
            }
            cursor = slot.parent;
        }
        None
    }

    /// Position of a node among its siblings.
    pub fn sibling_index(&self, id: &str) -> Option<usize> {
        let arena = self.arena.read();
        let (h, slot) = arena.lookup(id)?;
        let parent = arena.slot(slot.parent?)?;
        parent.children.iter().position(|c| *c == h)
    }

    /// True if `id` is `ancestor` or lies below it.
    pub fn is_within(&self, id: &str, ancestor: &str) -> bool {
        let arena = self.arena.read();
        match (arena.by_id.get(id), arena.by_id.get(ancestor)) {
            (Some(a), Some(b)) => arena.is_within(*a, *b),
            _ => false,
        }
    }

    /// Parentless nodes (packs), in registration order of their slots.
    pub fn roots(&self) -> Vec<Node> {
        let arena = self.arena.read();
        arena
            .slots
            .iter()
            .flatten()
            .filter(|s| s.parent.is_none())
            .map(|s| s.node.clone())
            .collect()
    }

    /// Cycle/orphan/duplicate-name audit of the arena.
    pub fn validate(&self) -> Vec<HierarchyIssue> {
        let arena = self.arena.read();
        let mut issues = Vec::new();

        for (id, h) in &arena.by_id {
            if arena.slot(*h).is_none() {
                issues.push(HierarchyIssue::DanglingIndex { id: id.clone() });
            }
        }

        let limit = arena.slots.len() + 1;
        for slot in arena.slots.iter().flatten() {
            let node = &slot.node;
            if let Some(parent_id) = &node.parent_id
                && !arena.by_id.contains_key(parent_id)
            {
                issues.push(HierarchyIssue::Orphan {
                    id: node.id.clone(),
                    parent_id: parent_id.clone(),
                });
            }

            let mut steps = 0;
            let mut cursor = slot.parent;
            while let Some(h) = cursor {
                steps += 1;
                if steps > limit {
                    issues.push(HierarchyIssue::Cycle { id: node.id.clone() });
                    break;
                }
                cursor = arena.slot(h).and_then(|s| s.parent);
            }

            let mut seen: HashMap<&str, usize> = HashMap::new();
            for c in &slot.children {
                if let Some(child) = arena.slot(*c) {
                    *seen.entry(child.node.name.as_str()).or_default() += 1;
                }
            }
            let mut dups: Vec<&str> = seen
                .into_iter()
                .filter(|(_, n)| *n > 1)
                .map(|(name, _)| name)
                .collect();
            dups.sort();
            for name in dups {
                issues.push(HierarchyIssue::DuplicateName {
                    parent_id: node.id.clone(),
                    name: name.to_string(),
                });
            }
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::{NodeProps, Restriction};
    use parking_lot::Mutex;

    fn shop() -> Registry {
        let registry = Registry::new();
        registry.register_node(NodeSpec::pack("Shop")).unwrap();
        registry.register_node(NodeSpec::parent("Shop", "Home")).unwrap();
        registry.register_node(NodeSpec::child("Shop.Home", "Feed")).unwrap();
        registry.register_node(NodeSpec::child("Shop.Home", "Cart")).unwrap();
        registry
    }

    #[test]
    fn test_register_builds_dotted_ids_and_order() {
        let registry = shop();
        let children: Vec<String> = registry
            .get_children("Shop.Home")
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(children, vec!["Shop.Home.Feed", "Shop.Home.Cart"]);
        assert_eq!(registry.sibling_index("Shop.Home.Cart"), Some(1));
    }

    #[test]
    fn test_duplicate_sibling_name_rejected_and_registry_unchanged() {
        let registry = shop();
        let before = registry.len();

        let err = registry
            .register_node(NodeSpec::child("Shop.Home", "Cart").with_id("other-cart"))
            .unwrap_err();
        assert_eq!(
            err,
            StructuralError::DuplicateSiblingName {
                parent_id: "Shop.Home".into(),
                name: "Cart".into()
            }
        );
        assert_eq!(registry.len(), before);
        assert!(!registry.contains("other-cart"));
    }

    #[test]
    fn test_missing_parent_rejected() {
        let registry = Registry::new();
        let err = registry
            .register_node(NodeSpec::child("Nowhere", "A"))
            .unwrap_err();
        assert!(matches!(err, StructuralError::MissingParent { parent_id: Some(_), .. }));

        let err = registry
            .register_node(NodeSpec::new(NodeKind::Parent, None, "Loose"))
            .unwrap_err();
        assert!(matches!(err, StructuralError::MissingParent { parent_id: None, .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_invalid_name_and_kind_mismatch() {
        let registry = shop();
        assert!(matches!(
            registry.register_node(NodeSpec::child("Shop.Home", "a.b")),
            Err(StructuralError::InvalidName { .. })
        ));
        let spec = NodeSpec::child("Shop.Home", "Odd")
            .with_props(NodeProps::default_for(NodeKind::Pack));
        assert!(matches!(
            registry.register_node(spec),
            Err(StructuralError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_reregister_refreshes_props() {
        let registry = shop();
        registry
            .register_node(NodeSpec::child("Shop.Home", "Cart").title("Basket"))
            .unwrap();
        let cart = registry.get_node("Shop.Home.Cart").unwrap();
        assert_eq!(cart.title(), "Basket");
        assert_eq!(registry.get_children("Shop.Home").len(), 2);
        assert_eq!(registry.sibling_index("Shop.Home.Cart"), Some(1));
        registry
            .register_node(NodeSpec::child("Shop.Home", "Feed").title("Latest"))
            .unwrap();
        assert_eq!(registry.sibling_index("Shop.Home.Feed"), Some(0));
    }

    #[test]
    fn test_reparent_into_own_subtree_is_a_cycle() {
        let registry = shop();
        registry
            .register_node(NodeSpec::parent("Shop.Home.Cart", "Steps"))
            .unwrap();
        let err = registry
            .register_node(NodeSpec::parent("Shop.Home.Cart.Steps", "Home").with_id("Shop.Home"))
            .unwrap_err();
        assert!(matches!(err, StructuralError::Cycle { .. }));
        assert_eq!(
            registry.get_node("Shop.Home").unwrap().parent_id.as_deref(),
            Some("Shop")
        );
    }

    #[test]
    fn test_unregister_cascades() {
        let registry = shop();
        let removed = registry.unregister_node("Shop.Home");
        assert_eq!(removed.last().map(String::as_str), Some("Shop.Home"));
        assert_eq!(removed.len(), 3);
        assert!(!registry.contains("Shop.Home.Cart"));
        assert!(registry.get_children("Shop").is_empty());
        assert!(registry.unregister_node("Shop.Home").is_empty());
    }

    #[test]
    fn test_slot_reuse_after_unregister() {
        let registry = shop();
        registry.unregister_node("Shop.Home.Feed");
        registry.register_node(NodeSpec::child("Shop.Home", "Deals")).unwrap();
        let names: Vec<String> = registry
            .get_children("Shop.Home")
            .into_iter()
            .map(|n| n.name)
            .collect();
        assert_eq!(names, vec!["Cart", "Deals"]);
    }

    #[test]
    fn test_parent_chain_and_nearest_kind() {
        let registry = shop();
        registry
            .register_node(NodeSpec::modal("Shop.Home.Cart", "Confirm"))
            .unwrap();
        registry
            .register_node(NodeSpec::child("Shop.Home.Cart.Confirm", "Ok"))
            .unwrap();

        let chain: Vec<String> = registry
            .get_parent_chain("Shop.Home.Cart.Confirm.Ok")
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(
            chain,
            vec!["Shop.Home.Cart.Confirm", "Shop.Home.Cart", "Shop.Home", "Shop"]
        );
        assert_eq!(
            registry
                .nearest_of_kind("Shop.Home.Cart.Confirm.Ok", NodeKind::Pack)
                .map(|n| n.id),
            Some("Shop".to_string())
        );
        assert_eq!(
            registry
                .nearest_of_kind("Shop.Home.Cart.Confirm.Ok", NodeKind::Modal)
                .map(|n| n.id),
            Some("Shop.Home.Cart.Confirm".to_string())
        );
    }

    #[test]
    fn test_update_props_notifies() {
        let registry = shop();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = registry.subscribe(move |e| sink.lock().push(e.clone()));

        registry
            .update_node_props(
                "Shop.Home.Cart",
                NodePatch::new().restricted_in(Some(Restriction::message("Empty cart"))),
            )
            .unwrap();
        assert!(registry.get_node("Shop.Home.Cart").unwrap().restricted_in().is_some());
        assert_eq!(
            seen.lock().as_slice(),
            &[FlowEvent::NodeUpdated { id: "Shop.Home.Cart".into() }]
        );

        assert!(matches!(
            registry.update_node_props("Nope", NodePatch::new()),
            Err(StructuralError::UnknownNode { .. })
        ));
    }

    #[test]
    fn test_validate_clean_tree() {
        assert!(shop().validate().is_empty());
    }
}
