//! Universal restriction check.
//!
//! Before a node is entered or left, its pack, its parent, the node itself
//! and its enclosing modal are inspected in that order. The first declared
//! restriction wins.

use serde::Serialize;

use crate::core::node::{Node, NodeId, NodeKind, Restriction};
use crate::core::registry::Registry;

pub const DEFAULT_RESTRICTION_TITLE: &str = "Not available";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crossing {
    Entering,
    Leaving,
}

/// A refused transition, ready to show to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestrictionNotice {
    pub title: String,
    pub message: String,
    /// The node whose restriction fired.
    pub node_id: NodeId,
}

impl RestrictionNotice {
    pub fn from_restriction(restriction: &Restriction, node_id: &str) -> Self {
        let (title, message) = match restriction {
            Restriction::Message(message) => (None, message.clone()),
            Restriction::Detailed { title, message } => (title.clone(), message.clone()),
        };
        Self {
            title: title.unwrap_or_else(|| DEFAULT_RESTRICTION_TITLE.to_string()),
            message,
            node_id: node_id.to_string(),
        }
    }
}

fn restriction_of(node: &Node, crossing: Crossing) -> Option<&Restriction> {
    match crossing {
        Crossing::Entering => node.restricted_in(),
        Crossing::Leaving => node.restricted_out(),
    }
}

/// Returns the first restriction blocking `crossing` into or out of `node_id`.
pub fn check(registry: &Registry, node_id: &str, crossing: Crossing) -> Option<RestrictionNotice> {
    let node = registry.get_node(node_id)?;
    let parent_id = node.parent_id.as_deref()?;

    let pack = registry.nearest_of_kind(parent_id, NodeKind::Pack);
    let parent = registry.get_node(parent_id);
    let modal = registry.nearest_of_kind(parent_id, NodeKind::Modal);

    let mut seen: Vec<NodeId> = Vec::with_capacity(4);
    for level in [pack, parent, Some(node), modal].into_iter().flatten() {
        if seen.contains(&level.id) {
            continue;
        }
        if let Some(restriction) = restriction_of(&level, crossing) {
            return Some(RestrictionNotice::from_restriction(restriction, &level.id));
        }
        seen.push(level.id);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::NodeSpec;

    fn registry() -> Registry {
        let registry = Registry::new();
        registry.register_node(NodeSpec::pack("App")).unwrap();
        registry.register_node(NodeSpec::parent("App", "Home")).unwrap();
        registry.register_node(NodeSpec::child("App.Home", "Feed")).unwrap();
        registry
            .register_node(NodeSpec::modal("App.Home.Feed", "Sheet"))
            .unwrap();
        registry
            .register_node(NodeSpec::child("App.Home.Feed.Sheet", "Step"))
            .unwrap();
        registry
    }

    #[test]
    fn test_no_restriction_allows() {
        assert_eq!(check(&registry(), "App.Home.Feed", Crossing::Entering), None);
    }

    #[test]
    fn test_string_shorthand_gets_default_title() {
        let registry = registry();
        registry
            .register_node(
                NodeSpec::child("App.Home", "Feed").restricted_in(Restriction::message("Log in first")),
            )
            .unwrap();
        let notice = check(&registry, "App.Home.Feed", Crossing::Entering).unwrap();
        assert_eq!(notice.title, DEFAULT_RESTRICTION_TITLE);
        assert_eq!(notice.message, "Log in first");
        assert_eq!(check(&registry, "App.Home.Feed", Crossing::Leaving), None);
    }

    #[test]
    fn test_pack_wins_over_node() {
        let registry = registry();
        registry
            .register_node(NodeSpec::pack("App").restricted_in(Restriction::detailed("Offline", "Reconnect")))
            .unwrap();
        registry
            .register_node(NodeSpec::child("App.Home", "Feed").restricted_in(Restriction::message("node")))
            .unwrap();
        let notice = check(&registry, "App.Home.Feed", Crossing::Entering).unwrap();
        assert_eq!(notice.title, "Offline");
        assert_eq!(notice.node_id, "App");
    }

    #[test]
    fn test_enclosing_modal_checked() {
        let registry = registry();
        registry
            .register_node(
                NodeSpec::modal("App.Home.Feed", "Sheet").restricted_out(Restriction::message("Finish first")),
            )
            .unwrap();
        let notice = check(&registry, "App.Home.Feed.Sheet.Step", Crossing::Leaving).unwrap();
        assert_eq!(notice.node_id, "App.Home.Feed.Sheet");
    }
}
