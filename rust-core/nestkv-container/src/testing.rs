// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Conformance suite for `StorageContainer` implementations.
//
// Every backend must behave identically from the storage layer's point of
// view: same read/write semantics and the same change callbacks. Backends
// call `run_conformance` from their own tests with a factory producing a
// fresh, unattached container per case.

use std::future::Future;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use crate::container::{on_change, ChangeType, OnChangeHandler, StorageContainer};

/// One change reported through an [`OnChangeHandler`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedChange {
    pub change_type: ChangeType,
    pub key: String,
    pub value: Option<Value>,
}

/// Records every change a container reports.
#[derive(Debug, Clone, Default)]
pub struct ChangeRecorder {
    changes: Arc<Mutex<Vec<RecordedChange>>>,
}

impl ChangeRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handler that appends to this recorder.
    pub fn handler(&self) -> OnChangeHandler {
        let changes = Arc::clone(&self.changes);
        on_change(move |change_type, key, value| {
            let changes = Arc::clone(&changes);
            async move {
                changes
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(RecordedChange {
                        change_type,
                        key,
                        value,
                    });
            }
        })
    }

    /// Everything recorded so far, in report order.
    pub fn changes(&self) -> Vec<RecordedChange> {
        self.changes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether a change matching exactly `(change_type, key, value)` was seen.
    pub fn saw(&self, change_type: ChangeType, key: &str, value: Option<Value>) -> bool {
        self.changes().iter().any(|c| {
            c.change_type == change_type && c.key == key && c.value == value
        })
    }
}

async fn fresh<C, F, Fut>(setup: &F) -> (C, ChangeRecorder)
where
    C: StorageContainer,
    F: Fn() -> Fut,
    Fut: Future<Output = C>,
{
    let container = setup().await;
    let recorder = ChangeRecorder::new();
    container.register_on_change(recorder.handler());
    container.attach().await.expect("attach");
    (container, recorder)
}

/// Run the full container contract against containers produced by `setup`.
///
/// Panics on the first violated expectation, so it is meant to be called
/// from a `#[tokio::test]`.
pub async fn run_conformance<C, F, Fut>(setup: F)
where
    C: StorageContainer,
    F: Fn() -> Fut,
    Fut: Future<Output = C>,
{
    // get after set returns the stored document
    {
        let (container, _) = fresh(&setup).await;
        container.set_item("test", json!({"abc": 123})).await.unwrap();
        assert_eq!(
            container.get_item("test").await.unwrap(),
            Some(json!({"abc": 123}))
        );
        container.detach().await.unwrap();
    }

    // missing keys read as None
    {
        let (container, _) = fresh(&setup).await;
        assert_eq!(container.get_item("missing").await.unwrap(), None);
        container.detach().await.unwrap();
    }

    // scalar values keep their type and set reports UPDATE
    {
        let (container, recorder) = fresh(&setup).await;
        container.set_item("test", json!(true)).await.unwrap();
        assert_eq!(container.get_item("test").await.unwrap(), Some(json!(true)));
        assert!(recorder.saw(ChangeType::Update, "test", Some(json!(true))));
        container.detach().await.unwrap();
    }

    // remove deletes the key and reports DELETE
    {
        let (container, recorder) = fresh(&setup).await;
        container.set_item("test", json!(true)).await.unwrap();
        assert!(container.has_item("test").await.unwrap());
        container.remove_item("test").await.unwrap();
        assert!(!container.has_item("test").await.unwrap());
        assert!(recorder.saw(ChangeType::Delete, "test", None));
        container.detach().await.unwrap();
    }

    // removing an absent key is a silent no-op
    {
        let (container, recorder) = fresh(&setup).await;
        container.remove_item("missing").await.unwrap();
        assert!(!container.has_item("missing").await.unwrap());
        assert!(recorder.changes().is_empty());
        container.detach().await.unwrap();
    }

    // clear empties the container and reports CLEARED with an empty key
    {
        let (container, recorder) = fresh(&setup).await;
        container.set_item("test", json!(true)).await.unwrap();
        container.clear().await.unwrap();
        assert!(!container.has_item("test").await.unwrap());
        assert!(container.get_all().await.unwrap().is_empty());
        assert!(recorder.saw(ChangeType::Cleared, "", None));
        container.detach().await.unwrap();
    }

    // get_all returns every entry
    {
        let (container, _) = fresh(&setup).await;
        container.set_item("test", json!({})).await.unwrap();
        container.set_item("other", json!([1, 2, 3])).await.unwrap();
        let all = container.get_all().await.unwrap();
        assert_eq!(Value::Object(all), json!({"test": {}, "other": [1, 2, 3]}));
        container.detach().await.unwrap();
    }

    // has_item distinguishes present and absent keys
    {
        let (container, _) = fresh(&setup).await;
        assert!(!container.has_item("test").await.unwrap());
        container.set_item("test", json!({})).await.unwrap();
        assert!(container.has_item("test").await.unwrap());
        container.detach().await.unwrap();
    }
}
