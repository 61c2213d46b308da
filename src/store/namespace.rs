//! Namespaces and dot-path helpers.

use std::fmt;

use serde_json::{Map, Value};

use crate::core::node::NodeId;

/// Used when nothing is focused and the caller named no scope.
pub const ROOT_SCOPE: &str = "__root__";

/// A partition of the store, scoped to one parent or one child.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    Parent(NodeId),
    Child(NodeId),
}

impl Namespace {
    pub fn parent(id: impl Into<String>) -> Self {
        Namespace::Parent(id.into())
    }

    pub fn child(id: impl Into<String>) -> Self {
        Namespace::Child(id.into())
    }

    pub fn root() -> Self {
        Namespace::Parent(ROOT_SCOPE.to_string())
    }

    /// The node id the namespace belongs to; the default owner of its keys.
    pub fn owner(&self) -> &str {
        match self {
            Namespace::Parent(id) | Namespace::Child(id) => id,
        }
    }

    pub fn storage_key(&self) -> String {
        format!("flow:{}", self)
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.strip_prefix("flow:").unwrap_or(s);
        if let Some(id) = s.strip_prefix("parent::") {
            return (!id.is_empty()).then(|| Namespace::parent(id));
        }
        if let Some(id) = s.strip_prefix("child::") {
            return (!id.is_empty()).then(|| Namespace::child(id));
        }
        None
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Parent(id) => write!(f, "parent::{}", id),
            Namespace::Child(id) => write!(f, "child::{}", id),
        }
    }
}

/// Keys are dot paths of non-empty segments; `__` prefixes are reserved for
/// the record's internal buckets.
pub(crate) fn valid_key(key: &str) -> bool {
    !key.is_empty() && !key.starts_with("__") && key.split('.').all(|seg| !seg.is_empty())
}

pub(crate) fn get_path<'a>(root: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    let mut segments = key.split('.');
    let mut current = root.get(segments.next()?)?;
    for seg in segments {
        current = current.as_object()?.get(seg)?;
    }
    Some(current)
}

/// Writes `value` at `key`, turning any non-object on the way into an object.
pub(crate) fn set_path(root: &mut Map<String, Value>, key: &str, value: Value) {
    let segments: Vec<&str> = key.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut current = root;
    for seg in parents {
        let slot = current
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        let Value::Object(next) = slot else {
            return;
        };
        current = next;
    }
    current.insert(last.to_string(), value);
}

/// Removes the value at `key` and prunes objects left empty by it.
pub(crate) fn remove_path(root: &mut Map<String, Value>, key: &str) -> Option<Value> {
    match key.split_once('.') {
        None => root.remove(key),
        Some((head, rest)) => {
            let child = root.get_mut(head)?.as_object_mut()?;
            let removed = remove_path(child, rest);
            if removed.is_some() && child.is_empty() {
                root.remove(head);
            }
            removed
        }
    }
}

/// Flattens nested objects into their leaf dot paths.
pub(crate) fn leaf_paths(root: &Map<String, Value>) -> Vec<String> {
    fn walk(prefix: &str, map: &Map<String, Value>, out: &mut Vec<String>) {
        for (k, v) in map {
            let path = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{prefix}.{k}")
            };
            match v {
                Value::Object(inner) if !inner.is_empty() => walk(&path, inner, out),
                _ => out.push(path),
            }
        }
    }
    let mut out = Vec::new();
    walk("", root, &mut out);
    out
}
