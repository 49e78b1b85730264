// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Change events published by root and scoped storage.
//
// Every event carries a lazily computed snapshot of the node that emitted
// it. The snapshot is resolved at most once per event, however many
// subscribers ask for it, and every caller receives the same `Arc`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use nestkv_container::{ChangeType, Result};
use serde_json::Value;
use tokio::sync::OnceCell;

type SnapshotSource = Box<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Compute-once cell around a snapshot-producing call.
pub struct LazySnapshot {
    cell: OnceCell<Arc<Value>>,
    source: SnapshotSource,
}

impl LazySnapshot {
    /// Defer the snapshot to `source`, called on first access.
    ///
    /// If the call fails, the error is returned and the next access retries.
    pub fn new<F, Fut>(source: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            cell: OnceCell::new(),
            source: Box::new(move || source().boxed()),
        }
    }

    /// Resolve the snapshot, computing it on first call.
    pub async fn get(&self) -> Result<Arc<Value>> {
        let value = self
            .cell
            .get_or_try_init(|| async { (self.source)().await.map(Arc::new) })
            .await?;
        Ok(Arc::clone(value))
    }

    /// Whether the snapshot has been computed already.
    pub fn is_resolved(&self) -> bool {
        self.cell.initialized()
    }
}

impl fmt::Debug for LazySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazySnapshot")
            .field("value", &self.cell.get())
            .finish()
    }
}

/// A change to a root or scoped storage node.
///
/// For `Update` the `value` is the new value at `key`; `Delete`, `Cleared`
/// and `ContainerChange` carry `None`, and the latter two use an empty key.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub change_type: ChangeType,
    pub key: String,
    pub value: Option<Value>,
    snapshot: Arc<LazySnapshot>,
}

impl ChangeEvent {
    pub fn new(
        change_type: ChangeType,
        key: impl Into<String>,
        value: Option<Value>,
        snapshot: LazySnapshot,
    ) -> Self {
        Self {
            change_type,
            key: key.into(),
            value,
            snapshot: Arc::new(snapshot),
        }
    }

    /// Full state of the emitting node. Memoized per event: clones of this
    /// event share the cell, and repeated calls return the same `Arc`.
    pub async fn snapshot(&self) -> Result<Arc<Value>> {
        self.snapshot.get().await
    }
}
