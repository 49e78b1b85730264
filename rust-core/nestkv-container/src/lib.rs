// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// NestKV Storage Container Abstraction
//
// This crate provides the pluggable container interface that NestKV storage
// sits in front of. The `StorageContainer` trait defines the contract every
// backend must implement, so a storage instance can be redirected from one
// backend to another at runtime without changing application logic.
//
// # Modules
//
// - [`container`] -- The `StorageContainer` trait, `ChangeType`, and the
//   on-change handler plumbing.
// - [`error`] -- The `StorageError` enum covering all failure modes.
// - [`memory`] -- An in-memory `BTreeMap`-based container for testing and
//   ephemeral state.
// - [`testing`] -- The conformance suite every container must pass.
//
// # Example
//
// ```rust
// use nestkv_container::{MemoryContainer, StorageContainer};
// use serde_json::json;
//
// # tokio_test::block_on(async {
// let container = MemoryContainer::new();
// container.attach().await.unwrap();
// container.set_item("settings", json!({"theme": "dark"})).await.unwrap();
//
// let val = container.get_item("settings").await.unwrap().unwrap();
// assert_eq!(val["theme"], "dark");
// # });
// ```

pub mod container;
pub mod error;
pub mod memory;

// Optional persistent containers, feature-gated to keep the default build lean.
#[cfg(feature = "redb-backend")]
pub mod redb_container;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export the most commonly used types at the crate root for convenience.
pub use container::{on_change, ChangeRelay, ChangeType, OnChangeHandler, StorageContainer};
pub use error::{Result, StorageError};
pub use memory::MemoryContainer;

#[cfg(feature = "redb-backend")]
pub use redb_container::RedbContainer;
