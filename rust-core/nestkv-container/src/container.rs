// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core storage container contract for NestKV.
//
// A container is a flat key -> JSON value map with an attach/detach
// lifecycle. Every mutating call reports itself through the registered
// on-change handler so the storage layer above can republish it. Containers
// are expected to be thread-safe (`Send + Sync`) and fully asynchronous.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StorageError;

/// The kind of change a container (or a scope above it) reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    /// A key was written.
    Update,
    /// A key was removed.
    Delete,
    /// Every key was removed.
    Cleared,
    /// The storage switched to a different container.
    ContainerChange,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeType::Update => "UPDATE",
            ChangeType::Delete => "DELETE",
            ChangeType::Cleared => "CLEARED",
            ChangeType::ContainerChange => "CONTAINER_CHANGE",
        };
        f.write_str(name)
    }
}

/// Callback invoked by a container after each mutation: `(type, key, value)`.
///
/// `value` is `None` for deletes and clears. The container awaits the
/// returned future before its own mutating call resolves.
pub type OnChangeHandler =
    Arc<dyn Fn(ChangeType, String, Option<Value>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as an [`OnChangeHandler`].
pub fn on_change<F, Fut>(handler: F) -> OnChangeHandler
where
    F: Fn(ChangeType, String, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |change_type, key, value| Box::pin(handler(change_type, key, value)))
}

/// A pluggable key-value storage container.
///
/// Values are JSON documents; keys are unique strings with no ordering
/// guarantee. Missing keys read as `Ok(None)`, never as an error.
///
/// Lifecycle: a container is created by the caller, `attach()`ed before any
/// data operation, and `detach()`ed when it is replaced. A detached
/// container is never reused.
#[async_trait]
pub trait StorageContainer: Send + Sync {
    /// Install the handler notified after every mutation. Replaces any
    /// previously registered handler.
    fn register_on_change(&self, handler: OnChangeHandler);

    /// Acquire whatever resources the container needs. Must complete before
    /// any data operation.
    async fn attach(&self) -> Result<(), StorageError>;

    /// Release the container's resources. The container is unusable after.
    async fn detach(&self) -> Result<(), StorageError>;

    /// Retrieve the value stored at `key`.
    async fn get_item(&self, key: &str) -> Result<Option<Value>, StorageError>;

    /// Store `value` at `key` and report `(Update, key, Some(value))`.
    async fn set_item(&self, key: &str, value: Value) -> Result<(), StorageError>;

    /// Remove `key` and report `(Delete, key, None)`.
    async fn remove_item(&self, key: &str) -> Result<(), StorageError>;

    /// Remove every key and report `(Cleared, "", None)`.
    async fn clear(&self) -> Result<(), StorageError>;

    /// Return every stored entry.
    async fn get_all(&self) -> Result<Map<String, Value>, StorageError>;

    /// Check whether `key` exists without retrieving its value.
    async fn has_item(&self, key: &str) -> Result<bool, StorageError>;

    /// A human-readable name for this container, used in logging and errors.
    fn name(&self) -> &str;
}

/// Holder for a container's registered [`OnChangeHandler`].
///
/// Containers embed one of these and call [`ChangeRelay::notify`] after each
/// mutation. The handler is cloned out of the lock before it is awaited.
#[derive(Default)]
pub struct ChangeRelay {
    handler: RwLock<Option<OnChangeHandler>>,
}

impl ChangeRelay {
    /// Create a relay with no handler registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the registered handler.
    pub fn register(&self, handler: OnChangeHandler) {
        let mut slot = self.handler.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(handler);
    }

    /// Report a change to the registered handler, if any.
    pub async fn notify(&self, change_type: ChangeType, key: &str, value: Option<Value>) {
        let handler = self
            .handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(handler) = handler {
            handler(change_type, key.to_string(), value).await;
        }
    }
}

impl fmt::Debug for ChangeRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered = self
            .handler
            .read()
            .map(|slot| slot.is_some())
            .unwrap_or(false);
        f.debug_struct("ChangeRelay")
            .field("registered", &registered)
            .finish()
    }
}
