// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Storage error types shared by containers and the storage layers above them.
//
// One enum covers backend I/O failures, value (de)serialization, container
// lifecycle misuse, and the failure modes of the transaction queue. Errors
// are delivered to exactly the caller whose operation produced them.

use thiserror::Error;

/// Errors that can occur anywhere between a storage caller and its container.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred in the underlying storage layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to serialize or deserialize a value.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The stored data is corrupted or in an unexpected format.
    #[error("corrupted data: {0}")]
    CorruptedData(String),

    /// The storage backend is not available (e.g., database cannot be opened).
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The container was used before `attach()` or after `detach()`.
    #[error("container '{0}' is not attached")]
    Detached(String),

    /// A lazily computed snapshot outlived the container or scope it reads.
    #[error("snapshot source dropped: {0}")]
    SourceDropped(String),

    /// The storage instance (and its transaction queue) has shut down.
    #[error("storage closed")]
    Closed,

    /// The work of a single transaction panicked before producing a result.
    #[error("transaction {id} aborted before completing")]
    TransactionAborted {
        /// Identifier of the aborted transaction.
        id: u64,
    },
}

/// Convenience alias used across the container and storage crates.
pub type Result<T> = std::result::Result<T, StorageError>;

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
