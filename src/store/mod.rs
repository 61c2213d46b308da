//! # Scoped State Store
//!
//! A keyed value store partitioned by [`Namespace`]. Each namespace keeps:
//!
//! ```text
//! flow:parent::Home
//! ├── <base object>        // dot-path keys nest here
//! ├── __categories         // category -> keys
//! ├── __secure             // flat, never suggested, redacted in snapshots
//! ├── __temp               // flat, memory only
//! ├── __scoped             // single-target deliveries (value + permission)
//! ├── __shared             // permission records on base values
//! └── __meta               // per-key timestamps, size, bucket, persist flag
//! ```
//!
//! Namespaces load lazily from the storage adapter and every mutation writes
//! through. Only keys written with `persist` reach storage. Storage failures
//! are logged and never surface to callers.

pub mod namespace;
pub mod permission;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub use namespace::{Namespace, ROOT_SCOPE};
pub use permission::{Permission, PermissionMode, PermissionRecord};

use crate::core::node::NodeId;
use crate::storage::{StorageAdapter, quarantine};
use namespace::{get_path, leaf_paths, remove_path, set_path, valid_key};

const REDACTED: &str = "[secure]";

// ============================================================================
// Public types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    InvalidKey(String),
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::InvalidKey(key) => write!(f, "invalid state key {:?}", key),
        }
    }
}

impl std::error::Error for StateError {}

/// Outcome of a read.
#[derive(Debug, Clone, PartialEq)]
pub enum StateRead {
    Value(Value),
    Missing,
    Denied,
}

impl StateRead {
    pub fn value(self) -> Option<Value> {
        match self {
            StateRead::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, StateRead::Denied)
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, StateRead::Missing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Base,
    Secure,
    Temp,
    Scoped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMeta {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Serialized size of the value in bytes.
    pub size: usize,
    pub bucket: Bucket,
    pub persist: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub persist: bool,
    pub permission: Option<Permission>,
    pub category: Option<String>,
    pub secure: bool,
    /// Memory only; implies `persist = false`.
    pub temporary: bool,
    /// Defaults to the namespace's own id.
    pub owner: Option<NodeId>,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn persist(mut self) -> Self {
        self.persist = true;
        self
    }

    pub fn permission(mut self, permission: Permission) -> Self {
        self.permission = Some(permission);
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    pub fn temporary(mut self) -> Self {
        self.temporary = true;
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

#[derive(Debug, Clone)]
pub enum BatchOp {
    Set {
        key: String,
        value: Value,
        options: SetOptions,
    },
    Remove {
        key: String,
    },
}

// ============================================================================
// Namespace record
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ScopedDelivery {
    value: Value,
    permission: PermissionRecord,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct NamespaceData {
    #[serde(flatten)]
    values: Map<String, Value>,
    #[serde(rename = "__categories", default, skip_serializing_if = "BTreeMap::is_empty")]
    categories: BTreeMap<String, BTreeSet<String>>,
    #[serde(rename = "__secure", default, skip_serializing_if = "Map::is_empty")]
    secure: Map<String, Value>,
    #[serde(rename = "__temp", default, skip_serializing_if = "Map::is_empty")]
    temp: Map<String, Value>,
    #[serde(rename = "__scoped", default, skip_serializing_if = "BTreeMap::is_empty")]
    scoped: BTreeMap<String, ScopedDelivery>,
    #[serde(rename = "__shared", default, skip_serializing_if = "BTreeMap::is_empty")]
    shared: BTreeMap<String, PermissionRecord>,
    #[serde(rename = "__meta", default, skip_serializing_if = "BTreeMap::is_empty")]
    meta: BTreeMap<String, EntryMeta>,
}

impl NamespaceData {
    fn is_empty(&self) -> bool {
        self.values.is_empty()
            && self.secure.is_empty()
            && self.temp.is_empty()
            && self.scoped.is_empty()
    }

    /// Which bucket holds `key`, falling back to the base object for nested
    /// reads of composite values.
    fn bucket_of(&self, key: &str) -> Option<Bucket> {
        if let Some(meta) = self.meta.get(key) {
            return Some(meta.bucket);
        }
        if self.temp.contains_key(key) {
            Some(Bucket::Temp)
        } else if self.secure.contains_key(key) {
            Some(Bucket::Secure)
        } else if self.scoped.contains_key(key) {
            Some(Bucket::Scoped)
        } else if get_path(&self.values, key).is_some() {
            Some(Bucket::Base)
        } else {
            None
        }
    }

    /// The permission gating `key`: its own record, the nearest record on an
    /// enclosing path, or the record of a scoped delivery.
    fn permission_for(&self, key: &str) -> Option<(String, &PermissionRecord)> {
        if let Some(delivery) = self.scoped.get(key) {
            return Some((key.to_string(), &delivery.permission));
        }
        let mut path = key;
        loop {
            if let Some(record) = self.shared.get(path) {
                return Some((path.to_string(), record));
            }
            match path.rsplit_once('.') {
                Some((head, _)) => path = head,
                None => return None,
            }
        }
    }

    fn read(&self, key: &str) -> Option<Value> {
        match self.bucket_of(key)? {
            Bucket::Base => get_path(&self.values, key).cloned(),
            Bucket::Secure => self.secure.get(key).cloned(),
            Bucket::Temp => self.temp.get(key).cloned(),
            Bucket::Scoped => self.scoped.get(key).map(|d| d.value.clone()),
        }
    }

    fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = match self.bucket_of(key)? {
            Bucket::Base => remove_path(&mut self.values, key),
            Bucket::Secure => self.secure.remove(key),
            Bucket::Temp => self.temp.remove(key),
            Bucket::Scoped => self.scoped.remove(key).map(|d| d.value),
        };
        self.shared.remove(key);
        self.meta.remove(key);
        // Nested keys go with their composite value
        let nested = format!("{key}.");
        self.meta.retain(|k, _| !k.starts_with(&nested));
        self.shared.retain(|k, _| !k.starts_with(&nested));
        for keys in self.categories.values_mut() {
            keys.retain(|k| k != key && !k.starts_with(&nested));
        }
        self.categories.retain(|_, keys| !keys.is_empty());
        removed
    }

    fn write(&mut self, owner: &str, key: &str, value: Value, options: SetOptions, now: DateTime<Utc>) {
        let previous = self.meta.get(key).map(|m| m.created_at);
        // A key lives in exactly one bucket
        if self.bucket_of(key).is_some() {
            self.remove(key);
        }

        let size = serde_json::to_string(&value).map(|s| s.len()).unwrap_or(0);
        let persist = options.persist && !options.temporary;
        let owner = options.owner.as_deref().unwrap_or(owner);
        let record = options.permission.map(|p| p.into_record(owner, now));

        let bucket = match record {
            _ if options.temporary => {
                self.temp.insert(key.to_string(), value);
                Bucket::Temp
            }
            Some(permission) if permission.mode == PermissionMode::Single => {
                self.scoped
                    .insert(key.to_string(), ScopedDelivery { value, permission });
                Bucket::Scoped
            }
            _ if options.secure => {
                self.secure.insert(key.to_string(), value);
                Bucket::Secure
            }
            Some(permission) => {
                set_path(&mut self.values, key, value);
                self.shared.insert(key.to_string(), permission);
                Bucket::Base
            }
            None => {
                set_path(&mut self.values, key, value);
                Bucket::Base
            }
        };

        if let Some(category) = &options.category {
            self.categories
                .entry(category.clone())
                .or_default()
                .insert(key.to_string());
        }
        self.meta.insert(
            key.to_string(),
            EntryMeta {
                created_at: previous.unwrap_or(now),
                updated_at: now,
                size,
                bucket,
                persist,
                category: options.category,
            },
        );
    }

    /// The slice of this namespace that goes to storage.
    fn persisted(&self) -> NamespaceData {
        let mut out = NamespaceData::default();
        for (key, meta) in &self.meta {
            if !meta.persist {
                continue;
            }
            match meta.bucket {
                Bucket::Base => {
                    if let Some(v) = get_path(&self.values, key) {
                        set_path(&mut out.values, key, v.clone());
                    }
                    if let Some(record) = self.shared.get(key) {
                        out.shared.insert(key.clone(), record.clone());
                    }
                }
                Bucket::Secure => {
                    if let Some(v) = self.secure.get(key) {
                        out.secure.insert(key.clone(), v.clone());
                    }
                }
                Bucket::Scoped => {
                    if let Some(d) = self.scoped.get(key) {
                        out.scoped.insert(key.clone(), d.clone());
                    }
                }
                Bucket::Temp => continue,
            }
            if let Some(category) = &meta.category {
                out.categories
                    .entry(category.clone())
                    .or_default()
                    .insert(key.clone());
            }
            out.meta.insert(key.clone(), meta.clone());
        }
        out
    }

    fn visible_keys(&self) -> Vec<String> {
        let mut keys: BTreeSet<String> = leaf_paths(&self.values).into_iter().collect();
        keys.extend(self.meta.iter().filter(|(_, m)| m.bucket == Bucket::Base).map(|(k, _)| k.clone()));
        keys.extend(self.temp.keys().cloned());
        keys.extend(self.scoped.keys().cloned());
        keys.into_iter().collect()
    }
}

// ============================================================================
// Store
// ============================================================================

pub struct StateStore {
    storage: Arc<dyn StorageAdapter>,
    namespaces: Mutex<HashMap<Namespace, NamespaceData>>,
}

impl StateStore {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            storage,
            namespaces: Mutex::new(HashMap::new()),
        }
    }

    async fn ensure_loaded(&self, ns: &Namespace) {
        if self.namespaces.lock().contains_key(ns) {
            return;
        }
        let key = ns.storage_key();
        let data = match self.storage.get_item(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<NamespaceData>(&raw) {
                Ok(data) => {
                    debug!("Loaded {} state key(s) for {}", data.meta.len(), ns);
                    data
                }
                Err(e) => {
                    warn!("Unreadable state for {}: {}", ns, e);
                    quarantine(self.storage.as_ref(), &key, &raw).await;
                    NamespaceData::default()
                }
            },
            Ok(None) => NamespaceData::default(),
            Err(e) => {
                warn!("Failed to load state for {}: {}", ns, e);
                NamespaceData::default()
            }
        };
        self.namespaces.lock().entry(ns.clone()).or_insert(data);
    }

    async fn write_through(&self, ns: &Namespace) {
        let persisted = {
            let namespaces = self.namespaces.lock();
            match namespaces.get(ns) {
                Some(data) => data.persisted(),
                None => NamespaceData::default(),
            }
        };
        let key = ns.storage_key();
        let result = if persisted.is_empty() {
            self.storage.remove_item(&key).await
        } else {
            match serde_json::to_string(&persisted) {
                Ok(json) => self.storage.set_item(&key, &json).await,
                Err(e) => {
                    warn!("Failed to serialize state for {}: {}", ns, e);
                    return;
                }
            }
        };
        if let Err(e) = result {
            warn!("Failed to persist state for {}: {}", ns, e);
        }
    }

    /// Writes a value. Temporary writes skip storage entirely.
    pub async fn set(
        &self,
        ns: &Namespace,
        key: &str,
        value: Value,
        options: SetOptions,
    ) -> Result<(), StateError> {
        if !valid_key(key) {
            return Err(StateError::InvalidKey(key.to_string()));
        }
        self.ensure_loaded(ns).await;
        let temporary = options.temporary;
        let replaced_persisted = {
            let mut namespaces = self.namespaces.lock();
            let data = namespaces.entry(ns.clone()).or_default();
            let was = data.meta.get(key).is_some_and(|m| m.persist);
            data.write(ns.owner(), key, value, options, Utc::now());
            was
        };
        if !temporary || replaced_persisted {
            self.write_through(ns).await;
        }
        Ok(())
    }

    /// Reads a value. `requester: None` reads with owner rights.
    pub async fn get(&self, ns: &Namespace, key: &str, requester: Option<&str>) -> StateRead {
        self.read(ns, key, requester, false).await
    }

    /// Reads as `child_id`, a child living directly under the namespace's
    /// parent. Permissions still apply; secure values are visible.
    pub async fn get_in_scope(&self, ns: &Namespace, key: &str, child_id: &str) -> StateRead {
        self.read(ns, key, Some(child_id), true).await
    }

    async fn read(&self, ns: &Namespace, key: &str, requester: Option<&str>, member: bool) -> StateRead {
        self.ensure_loaded(ns).await;
        let now = Utc::now();

        let (read, evicted) = {
            let mut namespaces = self.namespaces.lock();
            let Some(data) = namespaces.get_mut(ns) else {
                return StateRead::Missing;
            };
            let gate = data
                .permission_for(key)
                .map(|(path, record)| (path, record.is_expired(now), record.allows_opt(requester)));

            match gate {
                Some((path, true, _)) => {
                    debug!("State {} in {} expired", path, ns);
                    data.remove(&path);
                    (StateRead::Missing, true)
                }
                Some((_, false, false)) => (StateRead::Denied, false),
                _ => {
                    let secure_denied = !member
                        && requester.is_some_and(|r| r != ns.owner())
                        && data.bucket_of(key) == Some(Bucket::Secure);
                    if secure_denied {
                        (StateRead::Denied, false)
                    } else {
                        match data.read(key) {
                            Some(v) => (StateRead::Value(v), false),
                            None => (StateRead::Missing, false),
                        }
                    }
                }
            }
        };

        if evicted {
            self.write_through(ns).await;
        }
        read
    }

    /// Get then delete: a one-shot hand-off. Denied reads leave the value.
    pub async fn take(&self, ns: &Namespace, key: &str, requester: Option<&str>) -> StateRead {
        let read = self.get(ns, key, requester).await;
        self.consume(ns, key, read).await
    }

    /// [`take`](Self::take) with [`get_in_scope`](Self::get_in_scope) rights.
    pub async fn take_in_scope(&self, ns: &Namespace, key: &str, child_id: &str) -> StateRead {
        let read = self.get_in_scope(ns, key, child_id).await;
        self.consume(ns, key, read).await
    }

    async fn consume(&self, ns: &Namespace, key: &str, read: StateRead) -> StateRead {
        if matches!(read, StateRead::Value(_)) {
            self.remove(ns, key).await;
        }
        read
    }

    /// Ephemeral child-scoped value; never persisted, purged with the child.
    pub async fn keep(&self, child_id: &str, key: &str, value: Value) -> Result<(), StateError> {
        self.set(&Namespace::child(child_id), key, value, SetOptions::new().temporary())
            .await
    }

    /// Parent value readable only by `target` (and the owner).
    pub async fn send(
        &self,
        parent_id: &str,
        key: &str,
        value: Value,
        target: &str,
        persist: bool,
    ) -> Result<(), StateError> {
        let mut options = SetOptions::new().permission(Permission::single(target));
        options.persist = persist;
        self.set(&Namespace::parent(parent_id), key, value, options).await
    }

    /// Parent value readable by every id in `with` (and the owner).
    pub async fn share(
        &self,
        parent_id: &str,
        key: &str,
        value: Value,
        with: Vec<NodeId>,
        ttl: Option<std::time::Duration>,
    ) -> Result<(), StateError> {
        let mut permission = Permission::shared(with);
        permission.ttl = ttl;
        self.set(
            &Namespace::parent(parent_id),
            key,
            value,
            SetOptions::new().persist().permission(permission),
        )
        .await
    }

    pub async fn remove(&self, ns: &Namespace, key: &str) -> Option<Value> {
        self.ensure_loaded(ns).await;
        let removed = {
            let mut namespaces = self.namespaces.lock();
            let Some(data) = namespaces.get_mut(ns) else {
                return None;
            };
            data.remove(key)
        };
        // Nested paths carry no meta of their own; the stored record may
        // still hold them under a persisted ancestor.
        if removed.is_some() {
            self.write_through(ns).await;
        }
        removed
    }

    /// Drops a namespace. With `keep_permanent`, persisted keys survive.
    pub async fn clear(&self, ns: &Namespace, keep_permanent: bool) {
        self.ensure_loaded(ns).await;
        {
            let mut namespaces = self.namespaces.lock();
            if keep_permanent {
                if let Some(data) = namespaces.get_mut(ns) {
                    *data = data.persisted();
                }
            } else {
                namespaces.insert(ns.clone(), NamespaceData::default());
            }
        }
        self.write_through(ns).await;
    }

    /// Applies every op in memory, then writes through once.
    pub async fn batch(&self, ns: &Namespace, ops: Vec<BatchOp>) -> Result<(), StateError> {
        for op in &ops {
            let key = match op {
                BatchOp::Set { key, .. } | BatchOp::Remove { key } => key,
            };
            if !valid_key(key) {
                return Err(StateError::InvalidKey(key.clone()));
            }
        }
        self.ensure_loaded(ns).await;
        {
            let now = Utc::now();
            let mut namespaces = self.namespaces.lock();
            let data = namespaces.entry(ns.clone()).or_default();
            for op in ops {
                match op {
                    BatchOp::Set { key, value, options } => {
                        data.write(ns.owner(), &key, value, options, now)
                    }
                    BatchOp::Remove { key } => {
                        data.remove(&key);
                    }
                }
            }
        }
        self.write_through(ns).await;
        Ok(())
    }

    /// All values of a category, keyed by state key. Owner view.
    pub async fn category(&self, ns: &Namespace, name: &str) -> BTreeMap<String, Value> {
        self.ensure_loaded(ns).await;
        let namespaces = self.namespaces.lock();
        let Some(data) = namespaces.get(ns) else {
            return BTreeMap::new();
        };
        data.categories
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(|k| data.read(k).map(|v| (k.clone(), v)))
            .collect()
    }

    /// Keys starting with `prefix` that `requester` could read. Secure keys
    /// never show up.
    pub async fn suggest(&self, ns: &Namespace, prefix: &str, requester: Option<&str>) -> Vec<String> {
        self.ensure_loaded(ns).await;
        let now = Utc::now();
        let namespaces = self.namespaces.lock();
        let Some(data) = namespaces.get(ns) else {
            return Vec::new();
        };
        data.visible_keys()
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .filter(|k| match data.permission_for(k) {
                Some((_, record)) => !record.is_expired(now) && record.allows_opt(requester),
                None => true,
            })
            .collect()
    }

    /// Drops the temporary and scoped data of a child, plus every delivery
    /// addressed to it in loaded namespaces. Returns how many values went.
    pub async fn purge_ephemeral(&self, child_id: &str) -> usize {
        let child_ns = Namespace::child(child_id);
        let mut touched = Vec::new();
        let mut count = 0;
        {
            let mut namespaces = self.namespaces.lock();
            for (ns, data) in namespaces.iter_mut() {
                let mut doomed: Vec<String> = data
                    .scoped
                    .iter()
                    .filter(|(_, d)| d.permission.single_target.as_deref() == Some(child_id))
                    .map(|(k, _)| k.clone())
                    .collect();
                if *ns == child_ns {
                    doomed.extend(data.temp.keys().cloned());
                    doomed.extend(data.scoped.keys().cloned());
                }
                doomed.sort();
                doomed.dedup();
                if doomed.is_empty() {
                    continue;
                }
                let persisted = doomed
                    .iter()
                    .any(|k| data.meta.get(k).is_some_and(|m| m.persist));
                for key in &doomed {
                    data.remove(key);
                }
                count += doomed.len();
                if persisted {
                    touched.push(ns.clone());
                }
            }
        }
        for ns in &touched {
            self.write_through(ns).await;
        }
        if count > 0 {
            debug!("Purged {} ephemeral value(s) of {}", count, child_id);
        }
        count
    }

    /// Forgets the in-memory copy; the next access reloads from storage.
    pub fn reload(&self, ns: &Namespace) {
        self.namespaces.lock().remove(ns);
    }

    pub fn loaded_namespaces(&self) -> Vec<Namespace> {
        let mut out: Vec<Namespace> = self.namespaces.lock().keys().cloned().collect();
        out.sort();
        out
    }

    pub fn metadata(&self, ns: &Namespace, key: &str) -> Option<EntryMeta> {
        self.namespaces.lock().get(ns)?.meta.get(key).cloned()
    }

    /// JSON view of every loaded namespace. Secure values are redacted.
    pub fn snapshot(&self) -> Value {
        let namespaces = self.namespaces.lock();
        let mut ordered: Vec<(&Namespace, &NamespaceData)> = namespaces.iter().collect();
        ordered.sort_by(|a, b| a.0.cmp(b.0));

        let mut out = Map::new();
        for (ns, data) in ordered {
            let secure: Map<String, Value> = data
                .secure
                .keys()
                .map(|k| (k.clone(), Value::String(REDACTED.to_string())))
                .collect();
            let scoped: Map<String, Value> = data
                .scoped
                .iter()
                .map(|(k, d)| {
                    (
                        k.clone(),
                        json!({"value": d.value, "target": d.permission.single_target}),
                    )
                })
                .collect();
            out.insert(
                ns.to_string(),
                json!({
                    "values": data.values,
                    "secure": secure,
                    "temp": data.temp,
                    "scoped": scoped,
                    "shared": data.shared,
                    "categories": data.categories,
                    "meta": data.meta,
                }),
            );
        }
        Value::Object(out)
    }
}

impl PermissionRecord {
    fn allows_opt(&self, requester: Option<&str>) -> bool {
        requester.is_none_or(|r| self.allows(r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::time::Duration;

    fn store() -> (StateStore, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        (StateStore::new(storage.clone()), storage)
    }

    #[tokio::test]
    async fn test_persisted_value_survives_reload() {
        let (store, _) = store();
        let home = Namespace::parent("Home");
        store
            .set(&home, "cart.items", json!([1, 2]), SetOptions::new().persist())
            .await
            .unwrap();

        store.reload(&home);
        assert_eq!(
            store.get(&home, "cart.items", None).await,
            StateRead::Value(json!([1, 2]))
        );
        assert_eq!(
            store.get(&home, "cart", None).await,
            StateRead::Value(json!({"items": [1, 2]}))
        );
    }

    #[tokio::test]
    async fn test_nested_remove_reaches_storage() {
        let (store, _) = store();
        let home = Namespace::parent("Home");
        store
            .set(&home, "cart", json!({"items": [1, 2], "total": 3}), SetOptions::new().persist())
            .await
            .unwrap();
        store
            .set(&home, "coupon", json!({"code": "X", "pct": 5}), SetOptions::new().persist())
            .await
            .unwrap();

        assert_eq!(store.remove(&home, "cart.items").await, Some(json!([1, 2])));
        assert_eq!(store.take(&home, "coupon.code", None).await.value(), Some(json!("X")));

        store.reload(&home);
        assert_eq!(store.get(&home, "cart", None).await.value(), Some(json!({"total": 3})));
        assert_eq!(store.get(&home, "coupon", None).await.value(), Some(json!({"pct": 5})));
    }

    #[tokio::test]
    async fn test_member_reads_secure_but_not_foreign_deliveries() {
        let (store, _) = store();
        let ns = Namespace::parent("Auth");
        store
            .set(&ns, "pin", json!("0000"), SetOptions::new().secure())
            .await
            .unwrap();
        store
            .set(&ns, "otp", json!(42), SetOptions::new().permission(Permission::single("Auth.Sms")))
            .await
            .unwrap();

        assert_eq!(store.get_in_scope(&ns, "pin", "Auth.Login").await.value(), Some(json!("0000")));
        assert!(store.get(&ns, "pin", Some("Auth.Login")).await.is_denied());
        assert!(store.get_in_scope(&ns, "otp", "Auth.Login").await.is_denied());
        assert_eq!(store.take_in_scope(&ns, "otp", "Auth.Sms").await.value(), Some(json!(42)));
        assert!(store.get(&ns, "otp", None).await.is_missing());
    }

    #[tokio::test]
    async fn test_unpersisted_value_lost_on_reload() {
        let (store, storage) = store();
        let home = Namespace::parent("Home");
        store.set(&home, "draft", json!("hi"), SetOptions::new()).await.unwrap();
        assert!(storage.is_empty());

        store.reload(&home);
        assert!(store.get(&home, "draft", None).await.is_missing());
    }

    #[tokio::test]
    async fn test_send_denies_other_requesters() {
        let (store, _) = store();
        let home = Namespace::parent("Home");
        store
            .send("Home", "cart.items", json!([1, 2]), "Home.Checkout", true)
            .await
            .unwrap();

        assert!(store.get(&home, "cart.items", Some("Home.Other")).await.is_denied());
        assert_eq!(
            store.get(&home, "cart.items", Some("Home.Checkout")).await,
            StateRead::Value(json!([1, 2]))
        );
        assert_eq!(
            store.get(&home, "cart.items", None).await.value(),
            Some(json!([1, 2]))
        );
    }

    #[tokio::test]
    async fn test_shared_record_gates_nested_reads() {
        let (store, _) = store();
        let home = Namespace::parent("Home");
        store
            .share("Home", "profile", json!({"name": "Ada"}), vec!["Home.Settings".into()], None)
            .await
            .unwrap();

        assert!(store.get(&home, "profile.name", Some("Home.Feed")).await.is_denied());
        assert_eq!(
            store.get(&home, "profile.name", Some("Home.Settings")).await.value(),
            Some(json!("Ada"))
        );
    }

    #[tokio::test]
    async fn test_expired_entry_is_evicted() {
        let (store, storage) = store();
        let home = Namespace::parent("Home");
        store
            .share("Home", "code", json!(1234), vec!["X".into()], Some(Duration::ZERO))
            .await
            .unwrap();

        assert!(store.get(&home, "code", Some("X")).await.is_missing());
        assert!(store.metadata(&home, "code").is_none());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_take_consumes_once() {
        let (store, _) = store();
        let ns = Namespace::parent("P");
        store.set(&ns, "token", json!("t"), SetOptions::new()).await.unwrap();
        assert_eq!(store.take(&ns, "token", None).await.value(), Some(json!("t")));
        assert!(store.take(&ns, "token", None).await.is_missing());
    }

    #[tokio::test]
    async fn test_take_denied_keeps_value() {
        let (store, _) = store();
        let ns = Namespace::parent("P");
        store.send("P", "gift", json!(1), "P.A", false).await.unwrap();
        assert!(store.take(&ns, "gift", Some("P.B")).await.is_denied());
        assert_eq!(store.take(&ns, "gift", Some("P.A")).await.value(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_keep_is_never_persisted() {
        let (store, storage) = store();
        store.keep("P.A", "scroll", json!(300)).await.unwrap();
        assert!(storage.is_empty());
        assert_eq!(
            store.get(&Namespace::child("P.A"), "scroll", None).await.value(),
            Some(json!(300))
        );
    }

    #[tokio::test]
    async fn test_purge_ephemeral_spares_permanent_keys() {
        let (store, _) = store();
        let child = Namespace::child("P.A");
        store.keep("P.A", "scroll", json!(1)).await.unwrap();
        store
            .set(&child, "prefs", json!({"dark": true}), SetOptions::new().persist())
            .await
            .unwrap();
        store.send("P", "hand", json!("off"), "P.A", false).await.unwrap();

        assert_eq!(store.purge_ephemeral("P.A").await, 2);
        assert!(store.get(&child, "scroll", None).await.is_missing());
        assert!(store.get(&Namespace::parent("P"), "hand", None).await.is_missing());
        assert_eq!(
            store.get(&child, "prefs", None).await.value(),
            Some(json!({"dark": true}))
        );
    }

    #[tokio::test]
    async fn test_secure_values_hidden_from_others() {
        let (store, storage) = store();
        let ns = Namespace::parent("Auth");
        store
            .set(&ns, "pin", json!("0000"), SetOptions::new().secure().persist())
            .await
            .unwrap();
        store.set(&ns, "pinHint", json!("year"), SetOptions::new()).await.unwrap();

        assert!(store.get(&ns, "pin", Some("Auth.Other")).await.is_denied());
        assert_eq!(store.get(&ns, "pin", Some("Auth")).await.value(), Some(json!("0000")));
        assert_eq!(store.suggest(&ns, "pin", None).await, vec!["pinHint".to_string()]);

        let snapshot = store.snapshot();
        assert_eq!(snapshot["parent::Auth"]["secure"]["pin"], json!(REDACTED));

        let raw = storage.get_item("flow:parent::Auth").await.unwrap().unwrap();
        assert!(raw.contains("__secure"));
    }

    #[tokio::test]
    async fn test_categories_and_batch() {
        let (store, storage) = store();
        let ns = Namespace::parent("Shop");
        store
            .batch(
                &ns,
                vec![
                    BatchOp::Set {
                        key: "filters.color".into(),
                        value: json!("red"),
                        options: SetOptions::new().persist().category("filters"),
                    },
                    BatchOp::Set {
                        key: "filters.size".into(),
                        value: json!("M"),
                        options: SetOptions::new().persist().category("filters"),
                    },
                    BatchOp::Set {
                        key: "sort".into(),
                        value: json!("price"),
                        options: SetOptions::new(),
                    },
                    BatchOp::Remove { key: "sort".into() },
                ],
            )
            .await
            .unwrap();

        let filters = store.category(&ns, "filters").await;
        assert_eq!(filters.len(), 2);
        assert_eq!(filters["filters.size"], json!("M"));
        assert!(store.get(&ns, "sort", None).await.is_missing());

        let raw: Value =
            serde_json::from_str(&storage.get_item("flow:parent::Shop").await.unwrap().unwrap())
                .unwrap();
        assert_eq!(raw["filters"]["color"], json!("red"));
        assert!(raw["__categories"]["filters"].is_array());
    }

    #[tokio::test]
    async fn test_batch_rejects_invalid_key_without_applying() {
        let (store, _) = store();
        let ns = Namespace::parent("Shop");
        let result = store
            .batch(
                &ns,
                vec![
                    BatchOp::Set {
                        key: "ok".into(),
                        value: json!(1),
                        options: SetOptions::new(),
                    },
                    BatchOp::Remove { key: "".into() },
                ],
            )
            .await;
        assert_eq!(result, Err(StateError::InvalidKey(String::new())));
        assert!(store.get(&ns, "ok", None).await.is_missing());
    }

    #[tokio::test]
    async fn test_clear_keep_permanent() {
        let (store, _) = store();
        let ns = Namespace::parent("P");
        store.set(&ns, "a", json!(1), SetOptions::new().persist()).await.unwrap();
        store.set(&ns, "b", json!(2), SetOptions::new()).await.unwrap();

        store.clear(&ns, true).await;
        assert_eq!(store.get(&ns, "a", None).await.value(), Some(json!(1)));
        assert!(store.get(&ns, "b", None).await.is_missing());

        store.clear(&ns, false).await;
        store.reload(&ns);
        assert!(store.get(&ns, "a", None).await.is_missing());
    }

    #[tokio::test]
    async fn test_corrupt_namespace_is_quarantined() {
        let (store, storage) = store();
        storage.set_item("flow:parent::P", "[not an object").await.unwrap();
        let ns = Namespace::parent("P");
        assert!(store.get(&ns, "a", None).await.is_missing());
        assert!(storage.keys().iter().any(|k| k.starts_with("flow:parent::P.corrupt-")));
    }

    #[tokio::test]
    async fn test_overwrite_moves_bucket_and_keeps_created_at() {
        let (store, _) = store();
        let ns = Namespace::parent("P");
        store.set(&ns, "k", json!(1), SetOptions::new()).await.unwrap();
        let created = store.metadata(&ns, "k").unwrap().created_at;

        store.send("P", "k", json!(2), "P.A", false).await.unwrap();
        let meta = store.metadata(&ns, "k").unwrap();
        assert_eq!(meta.bucket, Bucket::Scoped);
        assert_eq!(meta.created_at, created);
        assert_eq!(store.get(&ns, "k", None).await.value(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_invalid_key_rejected() {
        let (store, _) = store();
        let ns = Namespace::parent("P");
        assert!(matches!(
            store.set(&ns, "__meta", json!(1), SetOptions::new()).await,
            Err(StateError::InvalidKey(_))
        ));
    }
}
