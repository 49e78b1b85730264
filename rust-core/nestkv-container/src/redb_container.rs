// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <j.d.a.jewell@open.ac.uk>
//
// redb-backed persistent storage container for NestKV.
//
// Uses redb (pure Rust, B-tree, ACID, single-file database) to provide
// durable key-value storage. No C/C++ dependencies.
//
// # Design
//
// - Single redb `Database` file containing one `data` table.
// - The database is opened by `attach()` and closed by `detach()`; data
//   operations in between fail with `StorageError::Detached` otherwise.
// - Values are stored as JSON bytes.
// - Read transactions for all reads, write transactions for set/remove/clear
//   (serialised by redb internally). Blocking work runs on the tokio blocking
//   pool.
// - `clear()` drops the table; a missing table reads as empty.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::debug;

use crate::container::{ChangeRelay, ChangeType, OnChangeHandler, StorageContainer};
use crate::error::StorageError;

/// Table holding every entry: key -> JSON-encoded value.
const DATA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("data");

/// A persistent storage container powered by redb.
///
/// # Example
///
/// ```rust,no_run
/// use nestkv_container::redb_container::RedbContainer;
/// use nestkv_container::container::StorageContainer;
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let container = RedbContainer::new("/tmp/nestkv-test.redb");
/// container.attach().await.unwrap();
/// container.set_item("hello", json!("world")).await.unwrap();
/// assert_eq!(container.get_item("hello").await.unwrap(), Some(json!("world")));
/// container.detach().await.unwrap();
/// # });
/// ```
pub struct RedbContainer {
    /// Path to the database file.
    path: PathBuf,
    /// Open database handle; `None` while detached.
    db: RwLock<Option<Arc<Database>>>,
    relay: ChangeRelay,
}

impl RedbContainer {
    /// Describe a container stored at `path`. Nothing is opened until
    /// [`StorageContainer::attach`].
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            db: RwLock::new(None),
            relay: ChangeRelay::new(),
        }
    }

    /// Return the filesystem path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the database is currently open.
    pub async fn is_attached(&self) -> bool {
        self.db.read().await.is_some()
    }

    async fn database(&self) -> Result<Arc<Database>, StorageError> {
        self.db
            .read()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| StorageError::Detached(self.name().to_string()))
    }

    /// Run a blocking closure against the open database.
    async fn with_db<T, F>(&self, work: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StorageError> + Send + 'static,
    {
        let db = self.database().await?;
        tokio::task::spawn_blocking(move || work(db.as_ref()))
            .await
            .map_err(|e| StorageError::BackendUnavailable(format!("task join: {e}")))?
    }

    fn write_with<T, F>(db: &Database, op: F) -> Result<T, StorageError>
    where
        F: FnOnce(&redb::WriteTransaction) -> Result<T, StorageError>,
    {
        let txn = db
            .begin_write()
            .map_err(|e| StorageError::BackendUnavailable(format!("write txn: {e}")))?;
        let output = op(&txn)?;
        txn.commit()
            .map_err(|e| StorageError::CorruptedData(format!("commit: {e}")))?;
        Ok(output)
    }
}

impl std::fmt::Debug for RedbContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbContainer")
            .field("path", &self.path)
            .finish()
    }
}

#[async_trait]
impl StorageContainer for RedbContainer {
    fn register_on_change(&self, handler: OnChangeHandler) {
        self.relay.register(handler);
    }

    async fn attach(&self) -> Result<(), StorageError> {
        let mut slot = self.db.write().await;
        if slot.is_some() {
            return Ok(());
        }

        let path = self.path.clone();
        let db = tokio::task::spawn_blocking(move || -> Result<Database, StorageError> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Database::create(&path).map_err(|e| {
                StorageError::BackendUnavailable(format!(
                    "failed to open redb at {}: {}",
                    path.display(),
                    e
                ))
            })
        })
        .await
        .map_err(|e| StorageError::BackendUnavailable(format!("task join: {e}")))??;

        debug!(path = %self.path.display(), "attached redb container");
        *slot = Some(Arc::new(db));
        Ok(())
    }

    async fn detach(&self) -> Result<(), StorageError> {
        // Dropping the last handle closes the database file.
        if self.db.write().await.take().is_some() {
            debug!(path = %self.path.display(), "detached redb container");
        }
        Ok(())
    }

    async fn get_item(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let key = key.to_string();
        self.with_db(move |db| {
            let txn = db
                .begin_read()
                .map_err(|e| StorageError::BackendUnavailable(format!("read txn: {e}")))?;
            let table = match txn.open_table(DATA_TABLE) {
                Ok(t) => t,
                // Table doesn't exist yet: nothing has been written.
                Err(_) => return Ok(None),
            };
            match table.get(key.as_str()) {
                Ok(Some(bytes)) => Ok(Some(serde_json::from_slice(bytes.value())?)),
                Ok(None) => Ok(None),
                Err(e) => Err(StorageError::CorruptedData(format!("get: {e}"))),
            }
        })
        .await
    }

    async fn set_item(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(&value)?;
        let owned_key = key.to_string();
        self.with_db(move |db| {
            Self::write_with(db, |txn| {
                let mut table = txn
                    .open_table(DATA_TABLE)
                    .map_err(|e| StorageError::BackendUnavailable(format!("open table: {e}")))?;
                table
                    .insert(owned_key.as_str(), bytes.as_slice())
                    .map_err(|e| StorageError::CorruptedData(format!("insert: {e}")))?;
                Ok(())
            })
        })
        .await?;

        self.relay.notify(ChangeType::Update, key, Some(value)).await;
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let owned_key = key.to_string();
        let removed = self
            .with_db(move |db| {
                Self::write_with(db, |txn| {
                    let mut table = txn.open_table(DATA_TABLE).map_err(|e| {
                        StorageError::BackendUnavailable(format!("open table: {e}"))
                    })?;
                    let previous = table
                        .remove(owned_key.as_str())
                        .map_err(|e| StorageError::CorruptedData(format!("remove: {e}")))?;
                    Ok(previous.is_some())
                })
            })
            .await?;

        // Removing an absent key is a silent no-op.
        if removed {
            self.relay.notify(ChangeType::Delete, key, None).await;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.with_db(|db| {
            Self::write_with(db, |txn| {
                txn.delete_table(DATA_TABLE)
                    .map_err(|e| StorageError::CorruptedData(format!("delete table: {e}")))?;
                Ok(())
            })
        })
        .await?;

        self.relay.notify(ChangeType::Cleared, "", None).await;
        Ok(())
    }

    async fn get_all(&self) -> Result<Map<String, Value>, StorageError> {
        self.with_db(|db| {
            let txn = db
                .begin_read()
                .map_err(|e| StorageError::BackendUnavailable(format!("read txn: {e}")))?;
            let table = match txn.open_table(DATA_TABLE) {
                Ok(t) => t,
                Err(_) => return Ok(Map::new()),
            };

            let iter = table
                .iter()
                .map_err(|e| StorageError::CorruptedData(format!("scan: {e}")))?;

            let mut entries = Map::new();
            for entry in iter {
                let (key, value) =
                    entry.map_err(|e| StorageError::CorruptedData(format!("scan entry: {e}")))?;
                let decoded: Value = serde_json::from_slice(value.value())?;
                entries.insert(key.value().to_string(), decoded);
            }
            Ok(entries)
        })
        .await
    }

    async fn has_item(&self, key: &str) -> Result<bool, StorageError> {
        // redb has no separate existence check.
        Ok(self.get_item(key).await?.is_some())
    }

    fn name(&self) -> &str {
        "redb"
    }
}
