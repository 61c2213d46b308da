//! # Blueprints
//!
//! A node tree described in TOML, registered in one go:
//!
//! ```toml
//! root = "Shop"
//!
//! [[pack]]
//! name = "Shop"
//! initial = "Home"
//!
//! [[pack.nodes]]
//! kind = "parent"
//! name = "Home"
//! at_end = "first"
//!
//! [[pack.nodes.nodes]]
//! name = "Feed"
//! ```
//!
//! Top-level entries default to packs, nested ones to children. Hooks are
//! code and cannot be expressed here.

use std::fmt;
use std::fs;
use std::path::Path;

use log::{debug, info};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::core::node::{AtEnd, NodeId, NodeKind, NodeSpec, Restriction};
use crate::core::registry::{Registry, StructuralError};

#[derive(Debug)]
pub enum BlueprintError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Structural(StructuralError),
    /// `root` names no top-level pack.
    UnknownRoot(String),
}

impl fmt::Display for BlueprintError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlueprintError::Io(e) => write!(f, "blueprint I/O error: {e}"),
            BlueprintError::Parse(e) => write!(f, "blueprint parse error: {e}"),
            BlueprintError::Structural(e) => write!(f, "blueprint rejected: {e}"),
            BlueprintError::UnknownRoot(name) => write!(f, "blueprint root '{name}' is not a pack"),
        }
    }
}

impl std::error::Error for BlueprintError {}

impl From<StructuralError> for BlueprintError {
    fn from(e: StructuralError) -> Self {
        BlueprintError::Structural(e)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AtEndSpec {
    Parent,
    First,
    Element(String),
}

impl From<AtEndSpec> for AtEnd {
    fn from(spec: AtEndSpec) -> Self {
        match spec {
            AtEndSpec::Parent => AtEnd::Parent,
            AtEndSpec::First => AtEnd::First,
            AtEndSpec::Element(name) => AtEnd::Element(name),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlueprintNode {
    pub name: String,
    pub kind: Option<NodeKind>,
    pub id: Option<NodeId>,
    pub title: Option<String>,
    pub icon: Option<String>,
    pub initial: Option<String>,
    pub at_end: Option<AtEndSpec>,
    pub restricted_in: Option<Restriction>,
    pub restricted_out: Option<Restriction>,
    #[serde(default)]
    pub extras: Map<String, Value>,
    #[serde(default)]
    pub nodes: Vec<BlueprintNode>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Blueprint {
    /// Pack to switch to once registered.
    pub root: Option<String>,
    #[serde(default, rename = "pack")]
    pub packs: Vec<BlueprintNode>,
}

impl Blueprint {
    pub fn parse(contents: &str) -> Result<Self, BlueprintError> {
        let blueprint: Blueprint = toml::from_str(contents).map_err(BlueprintError::Parse)?;
        if let Some(root) = &blueprint.root
            && !blueprint.packs.iter().any(|p| &p.name == root)
        {
            return Err(BlueprintError::UnknownRoot(root.clone()));
        }
        Ok(blueprint)
    }

    pub fn load(path: &Path) -> Result<Self, BlueprintError> {
        let contents = fs::read_to_string(path).map_err(BlueprintError::Io)?;
        let blueprint = Self::parse(&contents)?;
        info!("Loaded blueprint from {}", path.display());
        Ok(blueprint)
    }

    /// Registers every node, parents before children. Returns the ids in
    /// registration order. Stops at the first structural error; nodes
    /// registered before it stay registered.
    pub fn apply(&self, registry: &Registry) -> Result<Vec<NodeId>, BlueprintError> {
        let mut ids = Vec::new();
        for pack in &self.packs {
            register(registry, pack, None, &mut ids)?;
        }
        debug!("Blueprint registered {} nodes", ids.len());
        Ok(ids)
    }
}

fn register(
    registry: &Registry,
    node: &BlueprintNode,
    parent_id: Option<&str>,
    ids: &mut Vec<NodeId>,
) -> Result<(), BlueprintError> {
    let default_kind = if parent_id.is_some() { NodeKind::Child } else { NodeKind::Pack };
    let mut spec = NodeSpec::new(node.kind.unwrap_or(default_kind), parent_id, node.name.clone());
    if let Some(id) = &node.id {
        spec = spec.with_id(id.clone());
    }
    if let Some(title) = &node.title {
        spec = spec.title(title.clone());
    }
    if let Some(icon) = &node.icon {
        spec = spec.icon(icon.clone());
    }
    if let Some(initial) = &node.initial {
        spec = spec.initial(initial.clone());
    }
    if let Some(policy) = &node.at_end {
        spec = spec.at_end(policy.clone().into());
    }
    if let Some(r) = &node.restricted_in {
        spec = spec.restricted_in(r.clone());
    }
    if let Some(r) = &node.restricted_out {
        spec = spec.restricted_out(r.clone());
    }
    for (key, value) in &node.extras {
        spec = spec.extra(key.clone(), value.clone());
    }

    let id = registry.register_node(spec)?;
    ids.push(id.clone());
    for child in &node.nodes {
        register(registry, child, Some(&id), ids)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio_test::assert_err;

    const SHOP: &str = r#"
root = "Shop"

[[pack]]
name = "Shop"
initial = "Home"

[[pack.nodes]]
kind = "parent"
name = "Home"
at_end = { element = "Feed" }

[[pack.nodes.nodes]]
name = "Feed"
title = "For you"

[[pack.nodes.nodes]]
name = "Cart"
restricted_in = { title = "Sign in", message = "Log in to see your cart" }
extras = { badge = 3 }
"#;

    #[test]
    fn test_parse_and_apply() {
        let blueprint = Blueprint::parse(SHOP).unwrap();
        assert_eq!(blueprint.root.as_deref(), Some("Shop"));

        let registry = Registry::new();
        let ids = blueprint.apply(&registry).unwrap();
        assert_eq!(ids, vec!["Shop", "Shop.Home", "Shop.Home.Feed", "Shop.Home.Cart"]);

        let home = registry.get_node("Shop.Home").unwrap();
        assert_eq!(home.kind, NodeKind::Parent);
        assert!(matches!(home.props.at_end(), Some(AtEnd::Element(n)) if n == "Feed"));

        let feed = registry.get_node("Shop.Home.Feed").unwrap();
        assert_eq!(feed.kind, NodeKind::Child);
        assert_eq!(feed.title(), "For you");

        let cart = registry.get_node("Shop.Home.Cart").unwrap();
        assert_eq!(
            cart.restricted_in(),
            Some(&Restriction::detailed("Sign in", "Log in to see your cart"))
        );
        assert_eq!(cart.props.common().extras.get("badge"), Some(&Value::from(3)));
    }

    #[test]
    fn test_unknown_root_rejected() {
        let err = assert_err!(Blueprint::parse("root = \"Nope\"\n[[pack]]\nname = \"Shop\"\n"));
        assert!(matches!(err, BlueprintError::UnknownRoot(n) if n == "Nope"));
    }

    #[test]
    fn test_duplicate_siblings_surface_structural_error() {
        let toml = r#"
[[pack]]
name = "P"
[[pack.nodes]]
kind = "parent"
name = "A"
[[pack.nodes]]
kind = "parent"
name = "A"
"#;
        // second "A" refreshes the same id rather than clashing
        let registry = Registry::new();
        Blueprint::parse(toml).unwrap().apply(&registry).unwrap();
        assert_eq!(registry.get_children("P").len(), 1);

        let toml = r#"
[[pack]]
name = "P"
[[pack.nodes]]
kind = "parent"
name = "A"
[[pack.nodes]]
kind = "parent"
name = "A"
id = "other"
"#;
        let registry = Registry::new();
        let err = assert_err!(Blueprint::parse(toml).unwrap().apply(&registry));
        assert!(matches!(err, BlueprintError::Structural(StructuralError::DuplicateSiblingName { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SHOP.as_bytes()).unwrap();
        let blueprint = Blueprint::load(file.path()).unwrap();
        assert_eq!(blueprint.packs.len(), 1);

        let missing = Blueprint::load(Path::new("/definitely/not/here.toml"));
        assert!(matches!(missing, Err(BlueprintError::Io(_))));
    }
}
