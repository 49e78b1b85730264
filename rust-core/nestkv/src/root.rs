// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Root storage.
//
// Owns the active container, the transaction queue every read and write
// passes through, the registry of top-level state initializers and the
// change/snapshot channels that scopes build on.
//
// # Flow
//
// 1. Data operations wait until a container is set, then queue a READ
//    (get/has/get_all) or WRITE (set/remove/clear) that resolves the
//    container at run time.
// 2. The container reports each change through the relay registered by
//    `set_container`; the relay republishes it on the root change channel.
// 3. A background task turns every change into a fresh full snapshot,
//    publishes it, and re-seeds registered keys that are missing or not an
//    object.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock, Weak};

use nestkv_container::{on_change, ChangeType, Result, StorageContainer, StorageError};
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::event::{ChangeEvent, LazySnapshot};
use crate::queue::TransactionQueue;
use crate::scoped::ScopedStorage;
use crate::snapshot::SnapshotStream;
use crate::strategy::{state_initializer, InitializerStrategy, StateInitializer};

type ContainerSlot = Option<Arc<dyn StorageContainer>>;

struct RootInner {
    config: StorageConfig,
    queue: TransactionQueue,
    container: watch::Sender<ContainerSlot>,
    changes: broadcast::Sender<ChangeEvent>,
    snapshot: watch::Sender<Option<Arc<Value>>>,
    initializers: RwLock<HashMap<String, StateInitializer>>,
    strategy: RwLock<InitializerStrategy>,
}

/// Top-level storage in front of a swappable container.
///
/// Cheap to clone; clones share the container, queue and channels.
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
/// root.set_item("settings", json!({"theme": "dark"})).await.unwrap();
/// let settings = root.get_item("settings").await.unwrap().unwrap();
/// assert_eq!(settings["theme"], "dark");
/// # });
/// ```
#[derive(Clone)]
pub struct RootStorage {
    inner: Arc<RootInner>,
}

impl RootStorage {
    /// Create a root storage with the default configuration.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new() -> Self {
        Self::with_config(StorageConfig::default())
    }

    /// Create a root storage from `config`. No container is set yet; data
    /// operations wait until [`RootStorage::set_container`] completes.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn with_config(config: StorageConfig) -> Self {
        let (changes, events) = broadcast::channel(config.channel_capacity());
        let strategy = InitializerStrategy::from(config.merge_strategy);
        let inner = Arc::new(RootInner {
            queue: TransactionQueue::new(),
            container: watch::channel(None).0,
            changes,
            snapshot: watch::channel(None).0,
            initializers: RwLock::new(HashMap::new()),
            strategy: RwLock::new(strategy),
            config,
        });

        tokio::spawn(run_snapshot_task(Arc::downgrade(&inner), events));
        Self { inner }
    }

    /// A new, independent root storage with the same configuration, using
    /// `container`.
    pub async fn with_container(&self, container: Arc<dyn StorageContainer>) -> Result<RootStorage> {
        let storage = RootStorage::with_config(self.inner.config.clone());
        storage.set_container(container).await?;
        Ok(storage)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    /// The queue serializing every operation of this root and its scopes.
    pub fn queue(&self) -> &TransactionQueue {
        &self.inner.queue
    }

    // -- Container lifecycle ------------------------------------------------

    /// Redirect storage to `container`.
    ///
    /// Runs as a WRITE, so no reader observes the swap half done: the
    /// previous container is detached, the change relay is registered on
    /// the new one, it is attached, becomes visible, and a
    /// `ContainerChange` event is published.
    pub async fn set_container(&self, container: Arc<dyn StorageContainer>) -> Result<()> {
        let root = self.clone();
        self.inner
            .queue
            .queue_write(move || async move { root.swap_container(container).await })
            .await
    }

    async fn swap_container(&self, container: Arc<dyn StorageContainer>) -> Result<()> {
        let previous = self.inner.container.borrow().as_ref().map(Arc::clone);
        if let Some(previous) = previous {
            // A detached container is never served again, even if the new
            // one fails to attach; operations wait for the next swap.
            self.inner.container.send_replace(None);
            previous.detach().await?;
            debug!(container = previous.name(), "detached previous container");
        }

        let relay = Arc::downgrade(&self.inner);
        container.register_on_change(on_change(move |change_type, key, value| {
            let relay = relay.clone();
            async move {
                if let Some(inner) = relay.upgrade() {
                    RootStorage { inner }.publish(change_type, key, value);
                }
            }
        }));

        container.attach().await?;
        debug!(container = container.name(), "attached container");

        self.inner.container.send_replace(Some(container));
        self.publish(ChangeType::ContainerChange, String::new(), None);
        Ok(())
    }

    /// The active container, once one is set.
    pub async fn container(&self) -> Result<Arc<dyn StorageContainer>> {
        self.ready().await?;
        self.current_container()
    }

    /// Wait until a container has been set.
    pub(crate) async fn ready(&self) -> Result<()> {
        let mut slot = self.inner.container.subscribe();
        slot.wait_for(Option::is_some)
            .await
            .map(|_| ())
            .map_err(|_| StorageError::Closed)
    }

    /// The active container without waiting. Only meaningful inside a
    /// queued transaction issued after [`RootStorage::ready`].
    pub(crate) fn current_container(&self) -> Result<Arc<dyn StorageContainer>> {
        self.inner
            .container
            .borrow()
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| StorageError::Detached("root".to_string()))
    }

    /// Copy every entry of `src` into `dest` through `queue`.
    pub async fn copy_container(
        src: Arc<dyn StorageContainer>,
        dest: Arc<dyn StorageContainer>,
        queue: &TransactionQueue,
    ) -> Result<()> {
        transfer(src, dest, queue, false).await
    }

    /// Like [`RootStorage::copy_container`], but `dest` is cleared first.
    pub async fn clone_container(
        src: Arc<dyn StorageContainer>,
        dest: Arc<dyn StorageContainer>,
        queue: &TransactionQueue,
    ) -> Result<()> {
        transfer(src, dest, queue, true).await
    }

    // -- Data operations ----------------------------------------------------

    async fn read<T, F, Fut>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn StorageContainer>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.ready().await?;
        let root = self.clone();
        self.inner
            .queue
            .queue_read(move || async move { op(root.current_container()?).await })
            .await
    }

    async fn write<T, F, Fut>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn StorageContainer>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.ready().await?;
        let root = self.clone();
        self.inner
            .queue
            .queue_write(move || async move { op(root.current_container()?).await })
            .await
    }

    pub async fn get_item(&self, key: &str) -> Result<Option<Value>> {
        let key = key.to_string();
        self.read(move |container| async move { container.get_item(&key).await })
            .await
    }

    pub async fn set_item(&self, key: &str, value: Value) -> Result<()> {
        let key = key.to_string();
        self.write(move |container| async move { container.set_item(&key, value).await })
            .await
    }

    pub async fn remove_item(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.write(move |container| async move { container.remove_item(&key).await })
            .await
    }

    /// Remove every entry. Registered keys are re-seeded by their
    /// initializers once the resulting snapshot is published.
    pub async fn clear(&self) -> Result<()> {
        self.write(|container| async move { container.clear().await })
            .await
    }

    pub async fn get_all(&self) -> Result<Map<String, Value>> {
        self.read(|container| async move { container.get_all().await })
            .await
    }

    pub async fn has_item(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.read(move |container| async move { container.has_item(&key).await })
            .await
    }

    // -- Initializers -------------------------------------------------------

    /// Register the default value of the top-level `key` and reconcile what
    /// is stored there with it right away.
    ///
    /// The merged value is written with the active [`InitializerStrategy`].
    /// Afterwards the key is re-seeded whenever a snapshot shows it missing
    /// or not an object. Scopes consult the registry on demand, so they see
    /// the new initializer immediately.
    pub async fn register_state_initializer<F>(&self, key: &str, initializer: F) -> Result<()>
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        let initializer = state_initializer(initializer);
        self.insert_initializer(key, Arc::clone(&initializer));
        self.reconcile(key.to_string(), initializer).await
    }

    /// Replace the merge strategy used by this root and all of its scopes.
    ///
    /// Scopes initialized before the call keep what was written with the
    /// previous strategy.
    pub fn set_initializer_strategy(&self, strategy: InitializerStrategy) {
        *self
            .inner
            .strategy
            .write()
            .unwrap_or_else(|e| e.into_inner()) = strategy;
    }

    pub(crate) fn strategy(&self) -> InitializerStrategy {
        self.inner
            .strategy
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn initializer(&self, key: &str) -> Option<StateInitializer> {
        self.inner
            .initializers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn insert_initializer(&self, key: &str, initializer: StateInitializer) {
        self.inner
            .initializers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), initializer);
        debug!(key, "registered state initializer");
    }

    async fn reconcile(&self, key: String, initializer: StateInitializer) -> Result<()> {
        let strategy = self.strategy();
        self.write(move |container| async move {
            let existing = container
                .get_item(&key)
                .await?
                .filter(Value::is_object)
                .unwrap_or(Value::Null);
            let merged = strategy.merge(initializer(), existing);
            container.set_item(&key, merged).await
        })
        .await
    }

    /// Write defaults for registered keys missing from `snapshot`.
    async fn heal(&self, snapshot: &Value) {
        let missing: Vec<(String, StateInitializer)> = self
            .inner
            .initializers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(key, _)| !snapshot.get(key.as_str()).is_some_and(Value::is_object))
            .map(|(key, init)| (key.clone(), Arc::clone(init)))
            .collect();

        for (key, initializer) in missing {
            let default = initializer();
            if !default.is_object() {
                warn!(key = %key, "state initializer did not produce an object; not seeding");
                continue;
            }

            let target = key.clone();
            let seeded = self
                .write(move |container| async move {
                    // Re-check under the write: another writer may have won.
                    match container.get_item(&target).await? {
                        Some(Value::Object(_)) => Ok(false),
                        _ => container.set_item(&target, default).await.map(|()| true),
                    }
                })
                .await;

            match seeded {
                Ok(true) => debug!(key = %key, "seeded missing state"),
                Ok(false) => {}
                Err(e) => warn!(key = %key, error = %e, "failed to seed missing state"),
            }
        }
    }

    // -- Scopes -------------------------------------------------------------

    /// A scope over the object stored at the top-level `key`.
    ///
    /// Operations on the scope wait until that object exists.
    pub fn scope(&self, key: &str) -> ScopedStorage {
        ScopedStorage::top_level(self.clone(), key)
    }

    /// A scope over `key`, registering `initializer` as its state
    /// initializer. Reconciliation runs in the background once a container
    /// is set; operations on the scope wait for it.
    pub fn scope_with<F>(&self, key: &str, initializer: F) -> ScopedStorage
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        let initializer = state_initializer(initializer);
        self.insert_initializer(key, Arc::clone(&initializer));

        let root = self.clone();
        let owned = key.to_string();
        tokio::spawn(async move {
            if let Err(e) = root.reconcile(owned.clone(), initializer).await {
                warn!(key = %owned, error = %e, "failed to initialize scope");
            }
        });

        self.scope(key)
    }

    // -- Streams ------------------------------------------------------------

    /// Subscribe to change events. Only events published after the call are
    /// received.
    pub fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.changes.subscribe()
    }

    /// Subscribe to full snapshots, replaying the latest one.
    pub fn snapshots(&self) -> SnapshotStream {
        SnapshotStream::new(self.inner.snapshot.subscribe(), Vec::<String>::new().into())
    }

    fn publish(&self, change_type: ChangeType, key: String, value: Option<Value>) {
        let source = Arc::downgrade(&self.inner);
        let snapshot = LazySnapshot::new(move || {
            let source = source.clone();
            async move {
                let inner = source
                    .upgrade()
                    .ok_or_else(|| StorageError::SourceDropped("root".to_string()))?;
                RootStorage { inner }.get_all().await.map(Value::Object)
            }
        });
        // No subscribers is fine.
        let _ = self
            .inner
            .changes
            .send(ChangeEvent::new(change_type, key, value, snapshot));
    }

    async fn refresh(&self, snapshot: Arc<Value>) {
        self.inner.snapshot.send_replace(Some(Arc::clone(&snapshot)));
        self.heal(&snapshot).await;
    }
}

impl Default for RootStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RootStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let container = self
            .inner
            .container
            .borrow()
            .as_ref()
            .map(|c| c.name().to_string());
        f.debug_struct("RootStorage")
            .field("container", &container)
            .field("config", &self.inner.config)
            .finish()
    }
}

async fn transfer(
    src: Arc<dyn StorageContainer>,
    dest: Arc<dyn StorageContainer>,
    queue: &TransactionQueue,
    clear_first: bool,
) -> Result<()> {
    let entries = queue
        .queue_read(move || async move { src.get_all().await })
        .await?;
    queue
        .queue_write(move || async move {
            if clear_first {
                dest.clear().await?;
            }
            for (key, value) in entries {
                dest.set_item(&key, value).await?;
            }
            Ok(())
        })
        .await
}

/// Republish a fresh snapshot after every change.
///
/// Holds only a weak reference so the root can be dropped; the loop ends
/// when the change channel closes.
async fn run_snapshot_task(root: Weak<RootInner>, mut events: broadcast::Receiver<ChangeEvent>) {
    loop {
        let mut latest = match events.recv().await {
            Ok(event) => Some(event),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "snapshot task lagged behind changes");
                None
            }
            Err(RecvError::Closed) => break,
        };

        // Only the newest pending change matters for the snapshot.
        loop {
            match events.try_recv() {
                Ok(event) => latest = Some(event),
                Err(TryRecvError::Lagged(_)) => latest = None,
                Err(_) => break,
            }
        }

        let Some(inner) = root.upgrade() else {
            break;
        };
        let storage = RootStorage { inner };

        let snapshot = match latest {
            Some(event) => event.snapshot().await,
            None => storage.get_all().await.map(|all| Arc::new(Value::Object(all))),
        };
        match snapshot {
            Ok(snapshot) => storage.refresh(snapshot).await,
            Err(e) => warn!(error = %e, "failed to compute snapshot"),
        }
    }
    debug!("snapshot task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use nestkv_container::MemoryContainer;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    async fn attached() -> RootStorage {
        let root = RootStorage::new();
        root.set_container(Arc::new(MemoryContainer::new()))
            .await
            .unwrap();
        root
    }

    async fn next_of(
        events: &mut broadcast::Receiver<ChangeEvent>,
        change_type: ChangeType,
    ) -> ChangeEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                if event.change_type == change_type {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_crud() {
        let root = attached().await;

        assert_eq!(root.get_item("a").await.unwrap(), None);
        root.set_item("a", json!({"x": [1, 2]})).await.unwrap();
        assert_eq!(root.get_item("a").await.unwrap(), Some(json!({"x": [1, 2]})));
        assert!(root.has_item("a").await.unwrap());

        root.set_item("b", json!(2)).await.unwrap();
        assert_eq!(
            Value::Object(root.get_all().await.unwrap()),
            json!({"a": {"x": [1, 2]}, "b": 2})
        );

        root.remove_item("a").await.unwrap();
        assert!(!root.has_item("a").await.unwrap());

        root.clear().await.unwrap();
        assert!(root.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_operations_wait_for_container() {
        let root = RootStorage::new();
        let reader = root.clone();
        let pending = tokio::spawn(async move { reader.get_item("k").await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        root.set_container(Arc::new(MemoryContainer::with_entries([(
            "k".to_string(),
            json!("v"),
        )])))
        .await
        .unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), Some(json!("v")));
    }

    #[tokio::test]
    async fn test_changes_relay_container_events() {
        let root = attached().await;
        let mut events = root.changes();

        root.set_item("k", json!(1)).await.unwrap();
        let event = next_of(&mut events, ChangeType::Update).await;
        assert_eq!(event.key, "k");
        assert_eq!(event.value, Some(json!(1)));
        assert_eq!(*event.snapshot().await.unwrap(), json!({"k": 1}));

        root.remove_item("k").await.unwrap();
        let event = next_of(&mut events, ChangeType::Delete).await;
        assert_eq!(event.key, "k");
        assert_eq!(event.value, None);
    }

    #[tokio::test]
    async fn test_set_container_detaches_previous() {
        let root = RootStorage::new();
        let first = Arc::new(MemoryContainer::with_entries([(
            "x".to_string(),
            json!(1),
        )]));
        root.set_container(first.clone()).await.unwrap();
        assert!(Arc::ptr_eq(
            &root.container().await.unwrap(),
            &(first.clone() as Arc<dyn StorageContainer>)
        ));

        let second: Arc<dyn StorageContainer> = Arc::new(MemoryContainer::new());
        let mut events = root.changes();
        root.set_container(Arc::clone(&second)).await.unwrap();

        assert!(Arc::ptr_eq(&root.container().await.unwrap(), &second));
        assert!(root.get_all().await.unwrap().is_empty());

        let event = next_of(&mut events, ChangeType::ContainerChange).await;
        assert_eq!(event.key, "");
        assert_eq!(*event.snapshot().await.unwrap(), json!({}));
    }

    /// Memory container that counts lifecycle calls and refuses reads
    /// while it is not attached.
    struct TrackedContainer {
        inner: MemoryContainer,
        id: i64,
        fail_attach: bool,
        attached: AtomicBool,
        attaches: AtomicUsize,
        detaches: AtomicUsize,
    }

    impl TrackedContainer {
        fn new(id: i64) -> Arc<Self> {
            Self::build(id, false)
        }

        fn failing() -> Arc<Self> {
            Self::build(-1, true)
        }

        fn build(id: i64, fail_attach: bool) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryContainer::with_entries([("id".to_string(), json!(id))]),
                id,
                fail_attach,
                attached: AtomicBool::new(false),
                attaches: AtomicUsize::new(0),
                detaches: AtomicUsize::new(0),
            })
        }

        fn check_attached(&self) -> Result<()> {
            if self.attached.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(StorageError::Detached(format!("tracked-{}", self.id)))
            }
        }
    }

    #[async_trait::async_trait]
    impl StorageContainer for TrackedContainer {
        fn register_on_change(&self, handler: nestkv_container::OnChangeHandler) {
            self.inner.register_on_change(handler);
        }

        async fn attach(&self) -> Result<()> {
            if self.fail_attach {
                return Err(StorageError::BackendUnavailable("refused".to_string()));
            }
            self.inner.attach().await?;
            self.attaches.fetch_add(1, Ordering::SeqCst);
            self.attached.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn detach(&self) -> Result<()> {
            self.attached.store(false, Ordering::SeqCst);
            self.detaches.fetch_add(1, Ordering::SeqCst);
            self.inner.detach().await
        }

        async fn get_item(&self, key: &str) -> Result<Option<Value>> {
            self.check_attached()?;
            self.inner.get_item(key).await
        }

        async fn set_item(&self, key: &str, value: Value) -> Result<()> {
            self.check_attached()?;
            self.inner.set_item(key, value).await
        }

        async fn remove_item(&self, key: &str) -> Result<()> {
            self.check_attached()?;
            self.inner.remove_item(key).await
        }

        async fn clear(&self) -> Result<()> {
            self.check_attached()?;
            self.inner.clear().await
        }

        async fn get_all(&self) -> Result<Map<String, Value>> {
            self.check_attached()?;
            self.inner.get_all().await
        }

        async fn has_item(&self, key: &str) -> Result<bool> {
            self.check_attached()?;
            self.inner.has_item(key).await
        }

        fn name(&self) -> &str {
            "tracked"
        }
    }

    #[tokio::test]
    async fn test_failed_attach_never_serves_detached_container() {
        let root = RootStorage::new();
        let first = TrackedContainer::new(1);
        root.set_container(first.clone()).await.unwrap();
        assert_eq!(root.get_item("id").await.unwrap(), Some(json!(1)));

        let err = root
            .set_container(TrackedContainer::failing())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::BackendUnavailable(_)));
        assert_eq!(first.detaches.load(Ordering::SeqCst), 1);

        // Reads wait for a usable container instead of hitting the old one.
        let reader = root.clone();
        let pending = tokio::spawn(async move { reader.get_item("id").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        root.set_container(TrackedContainer::new(2)).await.unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), Some(json!(2)));
        assert_eq!(first.detaches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_swaps_and_reads_serialize() {
        let root = RootStorage::new();
        let containers: Vec<Arc<TrackedContainer>> = (0..20).map(TrackedContainer::new).collect();
        root.set_container(containers[0].clone()).await.unwrap();

        let mut tasks = Vec::new();
        for container in containers.iter().skip(1) {
            let swapper = root.clone();
            let container = Arc::clone(container);
            tasks.push(tokio::spawn(async move {
                swapper.set_container(container).await.map(|_| None)
            }));
            for _ in 0..5 {
                let reader = root.clone();
                tasks.push(tokio::spawn(async move { reader.get_item("id").await }));
            }
        }

        for task in tasks {
            // A read served mid-swap would fail with `Detached`.
            if let Some(id) = task.await.unwrap().unwrap() {
                assert!(id.as_i64().is_some_and(|id| (0..20).contains(&id)));
            }
        }

        let active = root.container().await.unwrap();
        let mut attached = 0;
        for container in &containers {
            assert_eq!(container.attaches.load(Ordering::SeqCst), 1);
            if container.attached.load(Ordering::SeqCst) {
                attached += 1;
                assert_eq!(container.detaches.load(Ordering::SeqCst), 0);
                assert_eq!(active.get_item("id").await.unwrap(), Some(json!(container.id)));
            } else {
                assert_eq!(container.detaches.load(Ordering::SeqCst), 1);
            }
        }
        assert_eq!(attached, 1);
    }

    #[tokio::test]
    async fn test_snapshots_follow_changes() {
        let root = attached().await;
        let mut snapshots = root.snapshots();

        root.set_item("k", json!({"v": 1})).await.unwrap();
        let snapshot = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = snapshots.next().await.unwrap();
                if snapshot.get("k").is_some() {
                    return snapshot;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(*snapshot, json!({"k": {"v": 1}}));
    }

    #[tokio::test]
    async fn test_register_initializer_merges_existing() {
        let root = RootStorage::new();
        root.set_container(Arc::new(MemoryContainer::with_entries([(
            "prefs".to_string(),
            json!({"theme": "dark"}),
        )])))
        .await
        .unwrap();

        root.register_state_initializer("prefs", || json!({"theme": "light", "size": 12}))
            .await
            .unwrap();

        assert_eq!(
            root.get_item("prefs").await.unwrap(),
            Some(json!({"theme": "dark", "size": 12}))
        );
    }

    #[tokio::test]
    async fn test_registered_keys_self_heal() {
        let root = attached().await;
        root.register_state_initializer("prefs", || json!({"size": 12}))
            .await
            .unwrap();

        root.set_item("prefs", json!("garbage")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while root.get_item("prefs").await.unwrap() != Some(json!({"size": 12})) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_copy_and_clone_containers() {
        let queue = TransactionQueue::new();
        let src: Arc<dyn StorageContainer> = Arc::new(MemoryContainer::with_entries([
            ("a".to_string(), json!(1)),
            ("b".to_string(), json!({"c": 2})),
        ]));
        let dest: Arc<dyn StorageContainer> = Arc::new(MemoryContainer::with_entries([(
            "stale".to_string(),
            json!(true),
        )]));

        RootStorage::copy_container(Arc::clone(&src), Arc::clone(&dest), &queue)
            .await
            .unwrap();
        assert_eq!(
            Value::Object(dest.get_all().await.unwrap()),
            json!({"a": 1, "b": {"c": 2}, "stale": true})
        );

        RootStorage::clone_container(Arc::clone(&src), Arc::clone(&dest), &queue)
            .await
            .unwrap();
        assert_eq!(
            Value::Object(dest.get_all().await.unwrap()),
            json!({"a": 1, "b": {"c": 2}})
        );
    }

    #[tokio::test]
    async fn test_with_container_is_independent() {
        let root = attached().await;
        root.set_item("a", json!(1)).await.unwrap();

        let other = root
            .with_container(Arc::new(MemoryContainer::new()))
            .await
            .unwrap();
        assert_eq!(other.get_item("a").await.unwrap(), None);
        assert_eq!(other.config(), root.config());
    }
}
