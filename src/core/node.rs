//! # Nodes
//!
//! A node is anything navigable: a pack (top-level root), a parent (page,
//! modal, tab parent, drawer parent) or a child. Nodes are addressed by a
//! dotted id, `<parentId>.<name>` unless registered with an explicit id.
//!
//! Props are typed per kind so the fields the runtime inspects (restriction
//! flags, lifecycle hooks, at-end policy) never go through a string-keyed
//! bag. Caller data that the runtime does not care about lives in `extras`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::history::HistoryEntry;

pub type NodeId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Pack,
    Parent,
    Modal,
    TabParent,
    DrawerParent,
    Child,
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Pack => "pack",
            NodeKind::Parent => "parent",
            NodeKind::Modal => "modal",
            NodeKind::TabParent => "tabs",
            NodeKind::DrawerParent => "drawer",
            NodeKind::Child => "child",
        }
    }

    /// Parent-like kinds share [`ParentProps`].
    pub fn is_parent_like(&self) -> bool {
        matches!(
            self,
            NodeKind::Parent | NodeKind::Modal | NodeKind::TabParent | NodeKind::DrawerParent
        )
    }
}

// ============================================================================
// Restrictions
// ============================================================================

/// A declared block on entering or leaving a node.
///
/// In config files either a bare message string or `{ title, message }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Restriction {
    Message(String),
    Detailed {
        #[serde(default)]
        title: Option<String>,
        message: String,
    },
}

impl Restriction {
    pub fn message(message: impl Into<String>) -> Self {
        Restriction::Message(message.into())
    }

    pub fn detailed(title: impl Into<String>, message: impl Into<String>) -> Self {
        Restriction::Detailed {
            title: Some(title.into()),
            message: message.into(),
        }
    }
}

// ============================================================================
// Lifecycle hooks
// ============================================================================

/// Error a hook can return instead of a verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookError(pub String);

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for HookError {}

impl From<&str> for HookError {
    fn from(s: &str) -> Self {
        HookError(s.to_string())
    }
}

impl From<String> for HookError {
    fn from(s: String) -> Self {
        HookError(s)
    }
}

pub type HookFuture = BoxFuture<'static, Result<bool, HookError>>;

/// An async lifecycle callback. `Ok(true)` lets the transition go ahead.
pub struct Hook<A> {
    f: Arc<dyn Fn(A) -> HookFuture + Send + Sync>,
}

impl<A: 'static> Hook<A> {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, HookError>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |arg: A| -> HookFuture { Box::pin(f(arg)) }),
        }
    }

    /// A hook that answers immediately.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(A) -> bool + Send + Sync + 'static,
    {
        Self::new(move |arg| std::future::ready(Ok(f(arg))))
    }

    pub fn call(&self, arg: A) -> HookFuture {
        (self.f)(arg)
    }
}

impl<A> Clone for Hook<A> {
    fn clone(&self) -> Self {
        Self { f: self.f.clone() }
    }
}

impl<A> fmt::Debug for Hook<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Hook(..)")
    }
}

/// Which way a transition moves through a parent's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
}

/// Handed to `on_open` of the child being entered.
#[derive(Debug, Clone)]
pub struct OpenContext {
    pub parent_id: NodeId,
    pub child_id: NodeId,
    pub opener: Option<NodeId>,
    pub direction: Direction,
    pub params: Option<Value>,
    /// History entry being restored when moving back.
    pub restored: Option<HistoryEntry>,
}

/// Gesture progress reported by the rendering layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DragEvent {
    /// 0.0 (at rest) to 1.0 (fully dragged away).
    pub progress: f64,
    pub released: bool,
}

/// Synchronous drag callback; drags are far too frequent for a timeout race.
#[derive(Clone)]
pub struct DragHandler(Arc<dyn Fn(&DragEvent) + Send + Sync>);

impl DragHandler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&DragEvent) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, event: &DragEvent) {
        (self.0)(event)
    }
}

impl fmt::Debug for DragHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DragHandler(..)")
    }
}

#[derive(Debug, Clone, Default)]
pub struct LifecycleHooks {
    pub on_open: Option<Hook<OpenContext>>,
    pub on_switching: Option<Hook<Direction>>,
    pub on_close: Option<Hook<()>>,
    pub on_drag: Option<DragHandler>,
}

// ============================================================================
// At-end policy
// ============================================================================

/// What `next` does once it runs past the last child.
#[derive(Debug, Clone)]
pub enum AtEnd {
    /// Advance this parent within its own parent.
    Parent,
    /// Reset the stack and start over from the first child.
    First,
    /// Jump to the named child.
    Element(String),
    /// Ask the caller.
    Custom(AtEndHandler),
}

#[derive(Debug, Clone)]
pub struct AtEndContext {
    pub parent_id: NodeId,
    pub current_child_id: Option<NodeId>,
    pub sibling_count: usize,
}

/// Answer of a custom at-end handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtEndDecision {
    /// Let the runtime wrap around.
    Decline,
    /// The handler did the navigation itself; report this result.
    Handled(bool),
    /// Open this child (name or id).
    Open(String),
    /// Close the parent.
    Close,
    /// Close the parent and unregister its subtree.
    Unregister,
}

#[derive(Clone)]
pub struct AtEndHandler(Arc<dyn Fn(AtEndContext) -> BoxFuture<'static, AtEndDecision> + Send + Sync>);

impl AtEndHandler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(AtEndContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AtEndDecision> + Send + 'static,
    {
        Self(Arc::new(move |ctx: AtEndContext| -> BoxFuture<'static, AtEndDecision> {
            Box::pin(f(ctx))
        }))
    }

    pub fn call(&self, ctx: AtEndContext) -> BoxFuture<'static, AtEndDecision> {
        (self.0)(ctx)
    }
}

impl fmt::Debug for AtEndHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AtEndHandler(..)")
    }
}

// ============================================================================
// Props
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct CommonProps {
    pub title: Option<String>,
    pub icon: Option<String>,
    pub restricted_in: Option<Restriction>,
    pub restricted_out: Option<Restriction>,
    pub extras: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct PackProps {
    pub common: CommonProps,
    pub initial_parent: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ParentProps {
    pub common: CommonProps,
    pub hooks: LifecycleHooks,
    pub at_end: Option<AtEnd>,
    pub initial_child: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ChildProps {
    pub common: CommonProps,
    pub hooks: LifecycleHooks,
}

#[derive(Debug, Clone)]
pub enum NodeProps {
    Pack(PackProps),
    Parent(ParentProps),
    Child(ChildProps),
}

impl NodeProps {
    pub fn default_for(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Pack => NodeProps::Pack(PackProps::default()),
            NodeKind::Child => NodeProps::Child(ChildProps::default()),
            _ => NodeProps::Parent(ParentProps::default()),
        }
    }

    pub fn matches(&self, kind: NodeKind) -> bool {
        match self {
            NodeProps::Pack(_) => kind == NodeKind::Pack,
            NodeProps::Parent(_) => kind.is_parent_like(),
            NodeProps::Child(_) => kind == NodeKind::Child,
        }
    }

    pub fn common(&self) -> &CommonProps {
        match self {
            NodeProps::Pack(p) => &p.common,
            NodeProps::Parent(p) => &p.common,
            NodeProps::Child(p) => &p.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut CommonProps {
        match self {
            NodeProps::Pack(p) => &mut p.common,
            NodeProps::Parent(p) => &mut p.common,
            NodeProps::Child(p) => &mut p.common,
        }
    }

    /// Packs have no lifecycle of their own.
    pub fn hooks(&self) -> Option<&LifecycleHooks> {
        match self {
            NodeProps::Pack(_) => None,
            NodeProps::Parent(p) => Some(&p.hooks),
            NodeProps::Child(p) => Some(&p.hooks),
        }
    }

    pub fn hooks_mut(&mut self) -> Option<&mut LifecycleHooks> {
        match self {
            NodeProps::Pack(_) => None,
            NodeProps::Parent(p) => Some(&mut p.hooks),
            NodeProps::Child(p) => Some(&mut p.hooks),
        }
    }

    pub fn at_end(&self) -> Option<&AtEnd> {
        match self {
            NodeProps::Parent(p) => p.at_end.as_ref(),
            _ => None,
        }
    }

    /// Child (or parent, for packs) to show when opened without a target.
    pub fn initial(&self) -> Option<&str> {
        match self {
            NodeProps::Pack(p) => p.initial_parent.as_deref(),
            NodeProps::Parent(p) => p.initial_child.as_deref(),
            NodeProps::Child(_) => None,
        }
    }

    /// Refresh from a re-registration: new props win, extras are merged.
    pub(crate) fn refresh(&mut self, mut incoming: NodeProps) {
        let mut extras = std::mem::take(&mut self.common_mut().extras);
        for (k, v) in std::mem::take(&mut incoming.common_mut().extras) {
            extras.insert(k, v);
        }
        incoming.common_mut().extras = extras;
        *self = incoming;
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub parent_id: Option<NodeId>,
    pub props: NodeProps,
}

impl Node {
    pub fn title(&self) -> &str {
        self.props.common().title.as_deref().unwrap_or(&self.name)
    }

    pub fn restricted_in(&self) -> Option<&Restriction> {
        self.props.common().restricted_in.as_ref()
    }

    pub fn restricted_out(&self) -> Option<&Restriction> {
        self.props.common().restricted_out.as_ref()
    }

    pub fn hooks(&self) -> Option<&LifecycleHooks> {
        self.props.hooks()
    }
}

// ============================================================================
// Registration spec
// ============================================================================

/// What a mounting component hands to [`Registry::register_node`](crate::core::registry::Registry::register_node).
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub name: String,
    pub kind: NodeKind,
    pub parent_id: Option<NodeId>,
    pub id: Option<NodeId>,
    pub props: NodeProps,
}

impl NodeSpec {
    pub fn new(kind: NodeKind, parent_id: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            parent_id: parent_id.map(str::to_string),
            id: None,
            props: NodeProps::default_for(kind),
        }
    }

    pub fn pack(name: impl Into<String>) -> Self {
        Self::new(NodeKind::Pack, None, name)
    }

    pub fn parent(parent_id: &str, name: impl Into<String>) -> Self {
        Self::new(NodeKind::Parent, Some(parent_id), name)
    }

    pub fn modal(parent_id: &str, name: impl Into<String>) -> Self {
        Self::new(NodeKind::Modal, Some(parent_id), name)
    }

    pub fn tabs(parent_id: &str, name: impl Into<String>) -> Self {
        Self::new(NodeKind::TabParent, Some(parent_id), name)
    }

    pub fn drawer(parent_id: &str, name: impl Into<String>) -> Self {
        Self::new(NodeKind::DrawerParent, Some(parent_id), name)
    }

    pub fn child(parent_id: &str, name: impl Into<String>) -> Self {
        Self::new(NodeKind::Child, Some(parent_id), name)
    }

    /// The id this spec registers under.
    pub fn resolved_id(&self) -> NodeId {
        match (&self.id, &self.parent_id) {
            (Some(id), _) => id.clone(),
            (None, Some(parent)) => format!("{}.{}", parent, self.name),
            (None, None) => self.name.clone(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_props(mut self, props: NodeProps) -> Self {
        self.props = props;
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.props.common_mut().title = Some(title.into());
        self
    }

    pub fn icon(mut self, icon: impl Into<String>) -> Self {
        self.props.common_mut().icon = Some(icon.into());
        self
    }

    pub fn restricted_in(mut self, restriction: Restriction) -> Self {
        self.props.common_mut().restricted_in = Some(restriction);
        self
    }

    pub fn restricted_out(mut self, restriction: Restriction) -> Self {
        self.props.common_mut().restricted_out = Some(restriction);
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.props.common_mut().extras.insert(key.into(), value);
        self
    }

    pub fn on_open(mut self, hook: Hook<OpenContext>) -> Self {
        if let Some(hooks) = self.props.hooks_mut() {
            hooks.on_open = Some(hook);
        }
        self
    }

    pub fn on_switching(mut self, hook: Hook<Direction>) -> Self {
        if let Some(hooks) = self.props.hooks_mut() {
            hooks.on_switching = Some(hook);
        }
        self
    }

    pub fn on_close(mut self, hook: Hook<()>) -> Self {
        if let Some(hooks) = self.props.hooks_mut() {
            hooks.on_close = Some(hook);
        }
        self
    }

    pub fn on_drag(mut self, handler: DragHandler) -> Self {
        if let Some(hooks) = self.props.hooks_mut() {
            hooks.on_drag = Some(handler);
        }
        self
    }

    pub fn at_end(mut self, policy: AtEnd) -> Self {
        if let NodeProps::Parent(p) = &mut self.props {
            p.at_end = Some(policy);
        }
        self
    }

    pub fn initial(mut self, name: impl Into<String>) -> Self {
        match &mut self.props {
            NodeProps::Pack(p) => p.initial_parent = Some(name.into()),
            NodeProps::Parent(p) => p.initial_child = Some(name.into()),
            NodeProps::Child(_) => {}
        }
        self
    }
}

// ============================================================================
// Shallow prop updates
// ============================================================================

/// Partial update for [`Registry::update_node_props`](crate::core::registry::Registry::update_node_props).
/// Outer `None` leaves a field alone; `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct NodePatch {
    pub title: Option<Option<String>>,
    pub icon: Option<Option<String>>,
    pub restricted_in: Option<Option<Restriction>>,
    pub restricted_out: Option<Option<Restriction>>,
    pub at_end: Option<Option<AtEnd>>,
    pub extras: Map<String, Value>,
}

impl NodePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: Option<&str>) -> Self {
        self.title = Some(title.map(str::to_string));
        self
    }

    pub fn restricted_in(mut self, restriction: Option<Restriction>) -> Self {
        self.restricted_in = Some(restriction);
        self
    }

    pub fn restricted_out(mut self, restriction: Option<Restriction>) -> Self {
        self.restricted_out = Some(restriction);
        self
    }

    pub fn at_end(mut self, policy: Option<AtEnd>) -> Self {
        self.at_end = Some(policy);
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extras.insert(key.into(), value);
        self
    }

    pub(crate) fn apply(self, props: &mut NodeProps) {
        let common = props.common_mut();
        if let Some(title) = self.title {
            common.title = title;
        }
        if let Some(icon) = self.icon {
            common.icon = icon;
        }
        if let Some(r) = self.restricted_in {
            common.restricted_in = r;
        }
        if let Some(r) = self.restricted_out {
            common.restricted_out = r;
        }
        for (k, v) in self.extras {
            common.extras.insert(k, v);
        }
        if let (Some(policy), NodeProps::Parent(p)) = (self.at_end, props) {
            p.at_end = policy;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolved_id_is_dotted_path() {
        assert_eq!(NodeSpec::pack("Shop").resolved_id(), "Shop");
        assert_eq!(NodeSpec::parent("Shop", "Home").resolved_id(), "Shop.Home");
        assert_eq!(
            NodeSpec::child("Shop.Home", "Cart").with_id("cart").resolved_id(),
            "cart"
        );
    }

    #[test]
    fn test_props_match_kind() {
        assert!(NodeProps::default_for(NodeKind::Modal).matches(NodeKind::TabParent));
        assert!(!NodeProps::default_for(NodeKind::Child).matches(NodeKind::Parent));
        assert!(!NodeProps::default_for(NodeKind::Pack).matches(NodeKind::Child));
    }

    #[test]
    fn test_restriction_deserializes_both_shapes() {
        let short: Restriction = serde_json::from_value(json!("Log in first")).unwrap();
        assert_eq!(short, Restriction::message("Log in first"));

        let long: Restriction =
            serde_json::from_value(json!({"title": "Hold on", "message": "Unsaved"})).unwrap();
        assert_eq!(long, Restriction::detailed("Hold on", "Unsaved"));
    }

    #[test]
    fn test_refresh_merges_extras() {
        let mut props = NodeSpec::child("P", "A")
            .extra("badge", json!(3))
            .extra("color", json!("red"))
            .props;
        let incoming = NodeSpec::child("P", "A")
            .title("Alpha")
            .extra("badge", json!(4))
            .props;
        props.refresh(incoming);

        assert_eq!(props.common().title.as_deref(), Some("Alpha"));
        assert_eq!(props.common().extras["badge"], json!(4));
        assert_eq!(props.common().extras["color"], json!("red"));
    }

    #[test]
    fn test_patch_clears_and_sets() {
        let mut props = NodeSpec::parent("Shop", "Home")
            .title("Home")
            .restricted_in(Restriction::message("no"))
            .props;
        NodePatch::new()
            .title(None)
            .restricted_in(None)
            .at_end(Some(AtEnd::First))
            .extra("k", json!(true))
            .apply(&mut props);

        assert!(props.common().title.is_none());
        assert!(props.common().restricted_in.is_none());
        assert!(matches!(props.at_end(), Some(AtEnd::First)));
        assert_eq!(props.common().extras["k"], json!(true));
    }

    #[tokio::test]
    async fn test_sync_hook_answers() {
        let hook: Hook<Direction> = Hook::sync(|d| d == Direction::Forward);
        assert_eq!(hook.call(Direction::Forward).await, Ok(true));
        assert_eq!(hook.call(Direction::Backward).await, Ok(false));
    }
}
