// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Scoped storage adapter.
//
// Binds one nested key to its parent node (the root or another scope). The
// parent supplies the getter and setter for the key's value; the root's
// snapshot channel, viewed through the key's path, supplies the snapshot
// stream and the initialized flag.
//
// Getter and setter are unqueued: they are only called from inside a
// transaction already running on the root queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use nestkv_container::Result;
use serde_json::{Map, Value};

use crate::root::RootStorage;
use crate::snapshot::SnapshotStream;
use crate::strategy::StateInitializer;

/// A node scopes can be created under.
#[async_trait]
pub(crate) trait ScopeParent: Send + Sync {
    fn root(&self) -> &RootStorage;

    /// Value stored under `key` in this node.
    async fn read_child(&self, key: &str) -> Result<Option<Value>>;

    /// Replace the value stored under `key` in this node.
    async fn write_child(&self, key: &str, value: Value) -> Result<()>;

    /// Default value of the child at `key`, if this node knows one.
    fn child_initial_state(&self, key: &str) -> Option<Value>;
}

#[async_trait]
impl ScopeParent for RootStorage {
    fn root(&self) -> &RootStorage {
        self
    }

    async fn read_child(&self, key: &str) -> Result<Option<Value>> {
        self.current_container()?.get_item(key).await
    }

    async fn write_child(&self, key: &str, value: Value) -> Result<()> {
        self.current_container()?.set_item(key, value).await
    }

    fn child_initial_state(&self, key: &str) -> Option<Value> {
        self.initializer(key).map(|initializer| initializer())
    }
}

/// Bridge between a scope and its parent.
pub struct ScopedStorageAdapter {
    parent: Arc<dyn ScopeParent>,
    key: String,
    snapshots: SnapshotStream,
    opened: AtomicBool,
    initializer: RwLock<Option<StateInitializer>>,
}

impl ScopedStorageAdapter {
    pub(crate) fn new(parent: Arc<dyn ScopeParent>, key: &str, snapshots: SnapshotStream) -> Self {
        Self {
            parent,
            key: key.to_string(),
            snapshots,
            opened: AtomicBool::new(false),
            initializer: RwLock::new(None),
        }
    }

    /// Key of this scope within its parent.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Keys from the root down to this scope.
    pub fn path(&self) -> &[String] {
        self.snapshots.path()
    }

    pub(crate) fn root(&self) -> &RootStorage {
        self.parent.root()
    }

    pub(crate) async fn get_item(&self) -> Result<Option<Value>> {
        self.parent.read_child(&self.key).await
    }

    pub(crate) async fn set_item(&self, value: Value) -> Result<()> {
        self.parent.write_child(&self.key, value).await
    }

    /// Snapshots of this scope. Silent until the scope is initialized.
    pub fn snapshots(&self) -> SnapshotStream {
        self.snapshots.clone()
    }

    /// Whether the parent's latest snapshot holds an object at this key.
    /// Goes back to `false` if that object disappears.
    pub fn is_initialized(&self) -> bool {
        self.snapshots.is_initialized()
    }

    /// Resolves the first time the scope is initialized and immediately on
    /// every call after that, even if the object later disappears.
    pub async fn when_initialized(&self) -> Result<()> {
        if self.opened.load(Ordering::Acquire) {
            return Ok(());
        }
        self.snapshots.wait_initialized().await?;
        self.opened.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn set_initializer(&self, initializer: StateInitializer) {
        *self
            .initializer
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(initializer);
    }

    /// Default value of this scope: its own initializer, else the parent's
    /// default at this key, else an empty object.
    pub fn initial_state(&self) -> Value {
        let own = self
            .initializer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        own.map(|initializer| initializer())
            .or_else(|| self.parent.child_initial_state(&self.key))
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(Map::new()))
    }
}

impl std::fmt::Debug for ScopedStorageAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedStorageAdapter")
            .field("path", &self.path())
            .field("opened", &self.opened.load(Ordering::Relaxed))
            .finish()
    }
}
