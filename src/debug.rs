//! # Introspection
//!
//! Read-only views over a running flow for tooling and tests: a structured
//! tree, a printable tree, a hierarchy audit and a snapshot of runtime and
//! store state.

use std::fmt::Write;

use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::core::node::{Node, NodeId, NodeKind};
use crate::core::registry::HierarchyIssue;
use crate::runtime::{Runtime, TransitionFlags};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugNode {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub title: String,
    pub active: bool,
    pub restricted_in: bool,
    pub restricted_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<TransitionFlags>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stack: Vec<NodeId>,
    pub children: Vec<DebugNode>,
}

fn build(runtime: &Runtime, node: Node, active: bool) -> DebugNode {
    let registry = runtime.registry();
    let active_child = runtime.get_active_id(&node.id);
    let children = registry
        .get_children(&node.id)
        .into_iter()
        .map(|child| {
            let is_active = active_child.as_deref() == Some(child.id.as_str());
            build(runtime, child, is_active)
        })
        .collect();
    let is_parent = node.kind != NodeKind::Child || runtime.get_active_id(&node.id).is_some();
    DebugNode {
        title: node.title().to_string(),
        restricted_in: node.restricted_in().is_some(),
        restricted_out: node.restricted_out().is_some(),
        flags: is_parent.then(|| runtime.get_flags(&node.id)),
        stack: runtime.stack(&node.id),
        active,
        children,
        id: node.id,
        name: node.name,
        kind: node.kind,
    }
}

/// One tree per registered root.
pub fn debug_tree(runtime: &Runtime) -> Vec<DebugNode> {
    let root = runtime.get_active_root();
    runtime
        .registry()
        .roots()
        .into_iter()
        .map(|node| {
            let is_root = root.as_deref() == Some(node.id.as_str());
            build(runtime, node, is_root)
        })
        .collect()
}

fn print_node(out: &mut String, node: &DebugNode, prefix: &str, last: bool, top: bool) {
    let branch = match (top, last) {
        (true, _) => "",
        (false, true) => "└── ",
        (false, false) => "├── ",
    };
    let mut marks = String::new();
    if node.active {
        marks.push_str(" *");
    }
    if node.restricted_in {
        marks.push_str(" [no-in]");
    }
    if node.restricted_out {
        marks.push_str(" [no-out]");
    }
    let _ = writeln!(out, "{}{}{} ({}){}", prefix, branch, node.name, node.kind.label(), marks);

    let child_prefix = match (top, last) {
        (true, _) => prefix.to_string(),
        (false, true) => format!("{prefix}    "),
        (false, false) => format!("{prefix}│   "),
    };
    for (i, child) in node.children.iter().enumerate() {
        print_node(out, child, &child_prefix, i + 1 == node.children.len(), false);
    }
}

/// Box-drawn tree. `*` marks the active root and active children.
pub fn print_tree(runtime: &Runtime) -> String {
    let mut out = String::new();
    for tree in debug_tree(runtime) {
        print_node(&mut out, &tree, "", true, true);
    }
    out
}

/// Registry audit plus a check that every active child is a live child of
/// its parent.
pub fn validate_hierarchy(runtime: &Runtime) -> Vec<HierarchyIssue> {
    let registry = runtime.registry();
    let mut issues = registry.validate();
    for parent_id in runtime.tracked_parents() {
        let Some(child_id) = runtime.get_active_id(&parent_id) else {
            continue;
        };
        let live = registry
            .get_node(&child_id)
            .is_some_and(|n| n.parent_id.as_deref() == Some(parent_id.as_str()));
        if !live {
            issues.push(HierarchyIssue::StaleActive { parent_id, child_id });
        }
    }
    issues
}

/// Runtime state per parent plus the store's snapshot.
pub fn state_registry_snapshot(runtime: &Runtime) -> Value {
    let mut parents = Map::new();
    for parent_id in runtime.tracked_parents() {
        parents.insert(
            parent_id.clone(),
            json!({
                "active": runtime.get_active_id(&parent_id),
                "stack": runtime.stack(&parent_id),
                "flags": runtime.get_flags(&parent_id),
            }),
        );
    }
    json!({
        "activeRoot": runtime.get_active_root(),
        "parents": parents,
        "state": runtime.store().snapshot(),
    })
}
