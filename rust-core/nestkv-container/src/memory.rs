// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// In-memory storage container for NestKV.
//
// Uses a `BTreeMap` wrapped in a tokio `RwLock` for thread-safe key-value
// storage. Intended for testing, development, and state that does not need
// to outlive the process.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::container::{ChangeRelay, ChangeType, OnChangeHandler, StorageContainer};
use crate::error::StorageError;

/// An in-memory storage container backed by a sorted `BTreeMap`.
///
/// All data lives in process memory and is lost on drop. Clones share both
/// the data and the registered change handler.
///
/// # Example
///
/// ```rust
/// use nestkv_container::memory::MemoryContainer;
/// use nestkv_container::container::StorageContainer;
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let container = MemoryContainer::new();
/// container.attach().await.unwrap();
/// container.set_item("hello", json!("world")).await.unwrap();
/// let val = container.get_item("hello").await.unwrap();
/// assert_eq!(val, Some(json!("world")));
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryContainer {
    /// The underlying sorted map, protected by a read-write lock.
    data: Arc<RwLock<BTreeMap<String, Value>>>,
    /// Change handler shared between clones.
    relay: Arc<ChangeRelay>,
}

impl MemoryContainer {
    /// Create a new, empty in-memory container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a container pre-populated with `entries`. No change events are
    /// reported for the seed data.
    pub fn with_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let data = entries.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Self {
            data: Arc::new(RwLock::new(data)),
            relay: Arc::new(ChangeRelay::new()),
        }
    }

    /// Return the number of keys currently stored.
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    /// Return true if the container holds no keys.
    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait]
impl StorageContainer for MemoryContainer {
    fn register_on_change(&self, handler: OnChangeHandler) {
        self.relay.register(handler);
    }

    async fn attach(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn detach(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn get_item(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let map = self.data.read().await;
        Ok(map.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: Value) -> Result<(), StorageError> {
        {
            let mut map = self.data.write().await;
            map.insert(key.to_string(), value.clone());
        }
        self.relay.notify(ChangeType::Update, key, Some(value)).await;
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let removed = self.data.write().await.remove(key).is_some();
        // Removing an absent key is a silent no-op.
        if removed {
            self.relay.notify(ChangeType::Delete, key, None).await;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.data.write().await.clear();
        self.relay.notify(ChangeType::Cleared, "", None).await;
        Ok(())
    }

    async fn get_all(&self) -> Result<Map<String, Value>, StorageError> {
        let map = self.data.read().await;
        Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    async fn has_item(&self, key: &str) -> Result<bool, StorageError> {
        let map = self.data.read().await;
        Ok(map.contains_key(key))
    }

    fn name(&self) -> &str {
        "memory"
    }
}
