// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// NestKV
//
// Hierarchically scoped key-value storage in front of a swappable
// container. Many scopes (nested objects of root entries) read and write
// concurrently without corrupting each other, because every operation of a
// root and all of its scopes runs on one transaction queue.
//
// # Modules
//
// - [`queue`] -- The transaction queue: writes run alone, adjacent reads
//   run as a concurrent batch.
// - [`root`] -- `RootStorage`: container lifecycle, flat key-value API,
//   state initializers, change and snapshot streams.
// - [`scoped`] -- `ScopedStorage`: the nested-object API and scope tree.
// - [`adapter`] -- `ScopedStorageAdapter`: a scope's link to its parent.
// - [`event`] -- Change events with memoized snapshots.
// - [`snapshot`] -- Snapshot streams with latest-value replay.
// - [`strategy`] -- Initializers and merge strategies.
// - [`config`] -- `StorageConfig`.
// - [`typed`] -- serde convenience accessors.
//
// All types that spawn tasks (`RootStorage`, `TransactionQueue`) must be
// created inside a tokio runtime.

pub mod adapter;
pub mod config;
pub mod event;
pub mod queue;
pub mod root;
pub mod scoped;
pub mod snapshot;
pub mod strategy;
mod typed;

pub use adapter::ScopedStorageAdapter;
pub use config::{MergeStrategyKind, StorageConfig};
pub use event::{ChangeEvent, LazySnapshot};
pub use queue::{PendingTransaction, TransactionId, TransactionKind, TransactionQueue};
pub use root::RootStorage;
pub use scoped::ScopedStorage;
pub use snapshot::SnapshotStream;
pub use strategy::{shallow_merge, state_initializer, InitializerStrategy, StateInitializer};

// The container layer, so most users only depend on this crate.
pub use nestkv_container::{
    on_change, ChangeType, MemoryContainer, OnChangeHandler, Result, StorageContainer,
    StorageError,
};

#[cfg(feature = "redb-backend")]
pub use nestkv_container::RedbContainer;
