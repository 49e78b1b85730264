// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Scoped storage.
//
// A view of one nested object inside a root entry, addressed by its path.
// Scopes form a tree: each node holds its parent through an adapter, and
// every operation ends up as a single transaction on the root queue.
//
// Each write is one queued WRITE that reads the scope object, changes a
// copy, and writes the whole object back through the parent chain. Two
// scopes writing different leaves of the same root entry therefore never
// lose each other's changes.

use std::future::Future;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use nestkv_container::{ChangeType, Result, StorageError};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::adapter::{ScopeParent, ScopedStorageAdapter};
use crate::event::{ChangeEvent, LazySnapshot};
use crate::root::RootStorage;
use crate::snapshot::SnapshotStream;
use crate::strategy::{state_initializer, InitializerStrategy};

pub(crate) struct ScopeNode {
    me: Weak<ScopeNode>,
    adapter: ScopedStorageAdapter,
    changes: broadcast::Sender<ChangeEvent>,
}

impl ScopeNode {
    fn path_label(&self) -> String {
        self.adapter.path().join(".")
    }

    async fn object(&self) -> Result<Option<Map<String, Value>>> {
        Ok(match self.adapter.get_item().await? {
            Some(Value::Object(object)) => Some(object),
            _ => None,
        })
    }

    fn emit(&self, change_type: ChangeType, key: &str, value: Option<Value>) {
        let source = self.me.clone();
        let snapshot = LazySnapshot::new(move || {
            let source = source.clone();
            async move {
                let node = source
                    .upgrade()
                    .ok_or_else(|| StorageError::SourceDropped("scope".to_string()))?;
                let all = ScopedStorage { node }.get_all().await?;
                Ok(Value::Object(all.unwrap_or_default()))
            }
        });
        let _ = self
            .changes
            .send(ChangeEvent::new(change_type, key, value, snapshot));
    }

    /// Merge this scope's default into storage, creating missing
    /// intermediate objects along the path.
    async fn seed(&self, strategy: InitializerStrategy) -> Result<()> {
        let Some((top, rest)) = self.adapter.path().split_first() else {
            return Ok(());
        };
        let container = self.adapter.root().current_container()?;
        let current = container.get_item(top).await?;
        let seeded = merge_at(current, rest, self.adapter.initial_state(), &strategy);
        container.set_item(top, seeded).await
    }
}

fn merge_at(
    current: Option<Value>,
    path: &[String],
    default: Value,
    strategy: &InitializerStrategy,
) -> Value {
    match path.split_first() {
        None => {
            let existing = current.filter(Value::is_object).unwrap_or(Value::Null);
            strategy.merge(default, existing)
        }
        Some((key, deeper)) => {
            let mut object = match current {
                Some(Value::Object(object)) => object,
                _ => Map::new(),
            };
            let child = object.remove(key);
            object.insert(key.clone(), merge_at(child, deeper, default, strategy));
            Value::Object(object)
        }
    }
}

#[async_trait]
impl ScopeParent for ScopeNode {
    fn root(&self) -> &RootStorage {
        self.adapter.root()
    }

    async fn read_child(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.object().await?.and_then(|mut object| object.remove(key)))
    }

    async fn write_child(&self, key: &str, value: Value) -> Result<()> {
        let Some(mut object) = self.object().await? else {
            warn!(path = %self.path_label(), key, "scope object missing; write dropped");
            return Ok(());
        };
        object.insert(key.to_string(), value.clone());
        self.adapter.set_item(Value::Object(object)).await?;
        self.emit(ChangeType::Update, key, Some(value));
        Ok(())
    }

    fn child_initial_state(&self, key: &str) -> Option<Value> {
        self.adapter.initial_state().get(key).cloned()
    }
}

/// Storage scoped to one nested object.
///
/// Every operation waits until the scope is initialized (its object exists
/// in the root snapshot), then runs as one transaction on the root queue.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use nestkv::{MemoryContainer, RootStorage};
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let root = RootStorage::new();
/// root.set_container(Arc::new(MemoryContainer::new())).await.unwrap();
///
/// let blorg = root.scope_with("blorg", || json!({"resource": {"value": 1}}));
/// let resource = blorg.scope("resource");
/// resource.set_item("value", json!(2)).await.unwrap();
///
/// assert_eq!(
///     root.get_item("blorg").await.unwrap(),
///     Some(json!({"resource": {"value": 2}}))
/// );
/// # });
/// ```
#[derive(Clone)]
pub struct ScopedStorage {
    node: Arc<ScopeNode>,
}

impl ScopedStorage {
    pub(crate) fn top_level(root: RootStorage, key: &str) -> Self {
        let snapshots = root.snapshots().child(key);
        Self::under(Arc::new(root), key, snapshots)
    }

    fn under(parent: Arc<dyn ScopeParent>, key: &str, snapshots: SnapshotStream) -> Self {
        let (changes, _) = broadcast::channel(parent.root().config().channel_capacity());
        let adapter = ScopedStorageAdapter::new(parent, key, snapshots);
        let node = Arc::new_cyclic(|me| ScopeNode {
            me: me.clone(),
            adapter,
            changes,
        });
        Self { node }
    }

    /// A scope over the object at `key` inside this one.
    pub fn scope(&self, key: &str) -> ScopedStorage {
        let snapshots = self.node.adapter.snapshots().child(key);
        let parent: Arc<dyn ScopeParent> = self.node.clone();
        Self::under(parent, key, snapshots)
    }

    pub fn root(&self) -> &RootStorage {
        self.node.adapter.root()
    }

    pub fn adapter(&self) -> &ScopedStorageAdapter {
        &self.node.adapter
    }

    pub fn path(&self) -> &[String] {
        self.node.adapter.path()
    }

    // -- Initialization -----------------------------------------------------

    /// Seed this scope with `initializer` merged into what is already stored,
    /// using the root's strategy. Resolves once the scope is initialized.
    pub async fn initialize<F>(&self, initializer: F) -> Result<()>
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        let strategy = self.root().strategy();
        self.initialize_with_strategy(initializer, strategy).await
    }

    /// Like [`ScopedStorage::initialize`] with an explicit strategy.
    ///
    /// Missing or non-object intermediate path segments are replaced with
    /// empty objects; only this scope's own key is merged. The initializer
    /// also becomes this scope's default for [`ScopedStorage::clear`].
    pub async fn initialize_with_strategy<F>(
        &self,
        initializer: F,
        strategy: InitializerStrategy,
    ) -> Result<()>
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.node.adapter.set_initializer(state_initializer(initializer));

        let root = self.root();
        root.ready().await?;
        let node = Arc::clone(&self.node);
        root.queue()
            .queue_write(move || async move { node.seed(strategy).await })
            .await?;
        debug!(path = %self.node.path_label(), "scope seeded");

        self.node.adapter.when_initialized().await
    }

    pub fn is_initialized(&self) -> bool {
        self.node.adapter.is_initialized()
    }

    pub async fn when_initialized(&self) -> Result<()> {
        self.node.adapter.when_initialized().await
    }

    /// Default value of this scope, as [`ScopedStorage::clear`] writes it.
    pub fn initial_state(&self) -> Value {
        self.node.adapter.initial_state()
    }

    // -- Data operations ----------------------------------------------------

    async fn read<T, F, Fut>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<ScopeNode>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.node.adapter.when_initialized().await?;
        let node = Arc::clone(&self.node);
        self.root().queue().queue_read(move || op(node)).await
    }

    async fn write<T, F, Fut>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<ScopeNode>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.node.adapter.when_initialized().await?;
        let node = Arc::clone(&self.node);
        self.root().queue().queue_write(move || op(node)).await
    }

    pub async fn get_item(&self, key: &str) -> Result<Option<Value>> {
        let key = key.to_string();
        self.read(move |node| async move {
            Ok(node.object().await?.and_then(|mut object| object.remove(&key)))
        })
        .await
    }

    pub async fn set_item(&self, key: &str, value: Value) -> Result<()> {
        let key = key.to_string();
        self.write(move |node| async move { node.write_child(&key, value).await })
            .await
    }

    /// Set several fields with a single write. One `Update` event is
    /// published per field.
    pub async fn set_items(&self, values: Map<String, Value>) -> Result<()> {
        self.write(move |node| async move {
            let Some(mut object) = node.object().await? else {
                warn!(path = %node.path_label(), "scope object missing; write dropped");
                return Ok(());
            };
            object.extend(values.clone());
            node.adapter.set_item(Value::Object(object)).await?;
            for (key, value) in values {
                node.emit(ChangeType::Update, &key, Some(value));
            }
            Ok(())
        })
        .await
    }

    pub async fn remove_item(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.write(move |node| async move {
            let Some(mut object) = node.object().await? else {
                return Ok(());
            };
            object.remove(&key);
            node.adapter.set_item(Value::Object(object)).await?;
            node.emit(ChangeType::Delete, &key, None);
            Ok(())
        })
        .await
    }

    /// Reset the scope to its initial state (not to an empty object).
    pub async fn clear(&self) -> Result<()> {
        self.write(|node| async move {
            node.adapter.set_item(node.adapter.initial_state()).await?;
            node.emit(ChangeType::Cleared, "", None);
            Ok(())
        })
        .await
    }

    /// The whole scope object, or `None` when nothing object-valued is
    /// stored at this scope's path.
    pub async fn get_all(&self) -> Result<Option<Map<String, Value>>> {
        self.read(|node| async move { node.object().await }).await
    }

    pub async fn has_item(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.read(move |node| async move {
            Ok(node
                .object()
                .await?
                .is_some_and(|object| object.contains_key(&key)))
        })
        .await
    }

    // -- Streams ------------------------------------------------------------

    /// Changes made through this scope or any of its descendants. A write
    /// to a child scope shows up here as an `Update` of the child's key.
    pub fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.node.changes.subscribe()
    }

    /// Snapshots of this scope's object, replaying the latest one.
    pub fn snapshots(&self) -> SnapshotStream {
        self.node.adapter.snapshots()
    }

    /// The most recently published object, or an empty object before the
    /// scope is initialized.
    pub fn last_snapshot(&self) -> Arc<Value> {
        self.node
            .adapter
            .snapshots()
            .latest()
            .unwrap_or_else(|| Arc::new(Value::Object(Map::new())))
    }
}

impl std::fmt::Debug for ScopedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedStorage")
            .field("path", &self.path())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nestkv_container::MemoryContainer;
    use serde_json::json;
    use std::time::Duration;

    async fn root() -> RootStorage {
        let root = RootStorage::new();
        root.set_container(Arc::new(MemoryContainer::new()))
            .await
            .unwrap();
        root
    }

    async fn recv(events: &mut broadcast::Receiver<ChangeEvent>) -> ChangeEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_merge_at_creates_intermediate_objects() {
        let strategy = InitializerStrategy::existing_wins();
        let merged = merge_at(
            Some(json!({"keep": 1, "mid": 5})),
            &["mid".to_string(), "leaf".to_string()],
            json!({"v": 1}),
            &strategy,
        );
        assert_eq!(merged, json!({"keep": 1, "mid": {"leaf": {"v": 1}}}));
    }

    #[test]
    fn test_merge_at_terminal_uses_strategy() {
        let existing = Some(json!({"resource": {"value": 123}}));
        let path = ["resource".to_string()];

        let merged = merge_at(
            existing.clone(),
            &path,
            json!({"value": 555}),
            &InitializerStrategy::existing_wins(),
        );
        assert_eq!(merged, json!({"resource": {"value": 123}}));

        let merged = merge_at(
            existing,
            &path,
            json!({"value": 555}),
            &InitializerStrategy::defaults_win(),
        );
        assert_eq!(merged, json!({"resource": {"value": 555}}));
    }

    #[tokio::test]
    async fn test_scoped_crud() {
        let root = root().await;
        let scope = root.scope("settings");
        scope.initialize(|| json!({"theme": "light"})).await.unwrap();

        assert_eq!(scope.get_item("theme").await.unwrap(), Some(json!("light")));
        scope.set_item("theme", json!("dark")).await.unwrap();
        assert_eq!(
            root.get_item("settings").await.unwrap(),
            Some(json!({"theme": "dark"}))
        );

        assert!(scope.has_item("theme").await.unwrap());
        scope.remove_item("theme").await.unwrap();
        assert!(!scope.has_item("theme").await.unwrap());
        assert_eq!(scope.get_item("theme").await.unwrap(), None);
        assert_eq!(scope.get_all().await.unwrap(), Some(Map::new()));
    }

    #[tokio::test]
    async fn test_reads_of_removed_scope_are_absent() {
        let root = root().await;
        let scope = root.scope("s");
        scope.initialize(|| json!({"a": 1})).await.unwrap();

        root.remove_item("s").await.unwrap();

        assert_eq!(scope.get_all().await.unwrap(), None);
        assert_eq!(scope.get_item("a").await.unwrap(), None);
        assert!(!scope.has_item("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_resets_to_initializer() {
        let root = root().await;
        let scope = root.scope("settings");
        scope.initialize(|| json!({"theme": "light"})).await.unwrap();
        scope.set_item("font", json!(14)).await.unwrap();

        let mut events = scope.changes();
        scope.clear().await.unwrap();

        assert_eq!(
            scope.get_all().await.unwrap().map(Value::Object),
            Some(json!({"theme": "light"}))
        );
        let event = recv(&mut events).await;
        assert_eq!(event.change_type, ChangeType::Cleared);
        assert_eq!(event.key, "");
    }

    #[tokio::test]
    async fn test_events_carry_scope_snapshot() {
        let root = root().await;
        let scope = root.scope("s");
        scope.initialize(|| json!({})).await.unwrap();

        let mut events = scope.changes();
        scope.set_item("a", json!(1)).await.unwrap();

        let event = recv(&mut events).await;
        assert_eq!(event.change_type, ChangeType::Update);
        assert_eq!(event.key, "a");
        assert_eq!(event.value, Some(json!(1)));
        let first = event.snapshot().await.unwrap();
        let second = event.snapshot().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*first, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_child_writes_notify_ancestors() {
        let root = root().await;
        let parent = root.scope_with("p", || json!({"child": {}}));
        let child = parent.scope("child");

        child.when_initialized().await.unwrap();
        let mut parent_events = parent.changes();
        let mut child_events = child.changes();

        child.set_item("leaf", json!(true)).await.unwrap();

        let event = recv(&mut child_events).await;
        assert_eq!(event.key, "leaf");

        let event = recv(&mut parent_events).await;
        assert_eq!(event.change_type, ChangeType::Update);
        assert_eq!(event.key, "child");
        assert_eq!(event.value, Some(json!({"leaf": true})));
    }

    #[tokio::test]
    async fn test_nested_initial_state_comes_from_parent() {
        let root = root().await;
        let parent = root.scope_with("p", || json!({"child": {"v": 1}}));
        let child = parent.scope("child");
        assert_eq!(child.initial_state(), json!({"v": 1}));

        child.when_initialized().await.unwrap();
        child.set_item("v", json!(2)).await.unwrap();
        child.clear().await.unwrap();
        assert_eq!(child.get_item("v").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_last_snapshot() {
        let root = root().await;
        let scope = root.scope("s");
        assert_eq!(*scope.last_snapshot(), json!({}));
        assert!(!scope.is_initialized());

        scope.initialize(|| json!({"n": 1})).await.unwrap();
        assert!(scope.is_initialized());
        assert_eq!(*scope.last_snapshot(), json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_deep_initialize_creates_path() {
        let root = root().await;
        let deep = root.scope("a").scope("b").scope("c");
        deep.initialize(|| json!({"v": 1})).await.unwrap();

        assert_eq!(
            root.get_item("a").await.unwrap(),
            Some(json!({"b": {"c": {"v": 1}}}))
        );
        assert_eq!(deep.path(), ["a", "b", "c"].map(String::from));
    }
}
