// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Snapshot streams.
//
// The root publishes its full state into a `watch` channel, which doubles
// as the cached latest value replayed to late subscribers. A stream views
// that channel through a path: it yields nothing while the path does not
// hold an object, and the nested object once it does.

use std::sync::Arc;

use nestkv_container::{Result, StorageError};
use serde_json::Value;
use tokio::sync::watch;

/// Walk `path` from `root` through nested objects.
pub(crate) fn lookup<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter()
        .try_fold(root, |node, key| node.as_object()?.get(key))
}

fn object_at<'a>(root: &'a Option<Arc<Value>>, path: &[String]) -> Option<&'a Value> {
    root.as_deref()
        .and_then(|root| lookup(root, path))
        .filter(|value| value.is_object())
}

/// A subscription to the snapshots of one storage node.
#[derive(Debug, Clone)]
pub struct SnapshotStream {
    receiver: watch::Receiver<Option<Arc<Value>>>,
    path: Arc<[String]>,
    replay_pending: bool,
    last: Option<Arc<Value>>,
}

impl SnapshotStream {
    pub(crate) fn new(receiver: watch::Receiver<Option<Arc<Value>>>, path: Arc<[String]>) -> Self {
        Self {
            receiver,
            path,
            replay_pending: true,
            last: None,
        }
    }

    /// Path of the viewed node; empty for the root.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// The latest published object at this path, if there is one.
    pub fn latest(&self) -> Option<Arc<Value>> {
        let root = self.receiver.borrow();
        if self.path.is_empty() {
            return (*root).clone().filter(|value| value.is_object());
        }
        object_at(&root, &self.path).map(|value| Arc::new(value.clone()))
    }

    /// Whether the latest published snapshot holds an object at this path.
    pub fn is_initialized(&self) -> bool {
        object_at(&self.receiver.borrow(), &self.path).is_some()
    }

    /// Next snapshot of this node.
    ///
    /// The first call replays the current value if the node is initialized.
    /// Later calls wait for a published snapshot that differs from the last
    /// one yielded. Returns `None` once the owning root is dropped.
    pub async fn next(&mut self) -> Option<Arc<Value>> {
        if self.replay_pending {
            self.replay_pending = false;
            self.receiver.borrow_and_update();
            if let Some(current) = self.latest() {
                self.last = Some(Arc::clone(&current));
                return Some(current);
            }
        }

        loop {
            self.receiver.changed().await.ok()?;
            self.receiver.borrow_and_update();
            let Some(current) = self.latest() else {
                continue;
            };
            if self.last.as_deref() == Some(current.as_ref()) {
                continue;
            }
            self.last = Some(Arc::clone(&current));
            return Some(current);
        }
    }

    /// Resolve once this node holds an object.
    pub async fn wait_initialized(&self) -> Result<()> {
        let mut receiver = self.receiver.clone();
        let path = Arc::clone(&self.path);
        receiver
            .wait_for(|root| object_at(root, &path).is_some())
            .await
            .map(|_| ())
            .map_err(|_| StorageError::Closed)
    }

    /// A stream of the child object at `key`.
    pub fn child(&self, key: &str) -> SnapshotStream {
        let mut path = self.path.to_vec();
        path.push(key.to_string());
        SnapshotStream::new(self.receiver.clone(), path.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn channel(initial: Option<Value>) -> watch::Sender<Option<Arc<Value>>> {
        watch::channel(initial.map(Arc::new)).0
    }

    #[test]
    fn test_lookup_nested() {
        let root = json!({"a": {"b": {"c": 1}}});
        let path = vec!["a".to_string(), "b".to_string()];
        assert_eq!(lookup(&root, &path), Some(&json!({"c": 1})));
        assert_eq!(lookup(&root, &["x".to_string()]), None);
        assert_eq!(lookup(&root, &[]), Some(&root));
    }

    #[test]
    fn test_uninitialized_until_object() {
        let sender = channel(Some(json!({"scope": 5})));
        let stream = SnapshotStream::new(sender.subscribe(), vec!["scope".to_string()].into());
        assert!(!stream.is_initialized());
        assert_eq!(stream.latest(), None);

        sender.send_replace(Some(Arc::new(json!({"scope": {"v": 1}}))));
        assert!(stream.is_initialized());
        assert_eq!(stream.latest().as_deref(), Some(&json!({"v": 1})));
    }

    #[tokio::test]
    async fn test_replays_latest_to_late_subscriber() {
        let sender = channel(Some(json!({"a": 1})));
        let mut stream = SnapshotStream::new(sender.subscribe(), Vec::<String>::new().into());
        assert_eq!(stream.next().await.as_deref(), Some(&json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_skips_uninitialized_and_duplicate_values() {
        let sender = channel(None);
        let mut stream = SnapshotStream::new(sender.subscribe(), vec!["s".to_string()].into());

        sender.send_replace(Some(Arc::new(json!({"other": 1}))));
        sender.send_replace(Some(Arc::new(json!({"s": {"v": 1}}))));
        assert_eq!(stream.next().await.as_deref(), Some(&json!({"v": 1})));

        // Unrelated change at the root leaves this node's value untouched.
        sender.send_replace(Some(Arc::new(json!({"s": {"v": 1}, "other": 2}))));
        let pending = tokio::time::timeout(Duration::from_millis(20), stream.next()).await;
        assert!(pending.is_err());

        sender.send_replace(Some(Arc::new(json!({"s": {"v": 2}}))));
        assert_eq!(stream.next().await.as_deref(), Some(&json!({"v": 2})));

        drop(sender);
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_wait_initialized_and_child() {
        let sender = channel(Some(json!({})));
        let stream = SnapshotStream::new(sender.subscribe(), vec!["p".to_string()].into());
        let child = stream.child("c");
        assert_eq!(child.path(), ["p".to_string(), "c".to_string()]);

        let waiter = tokio::spawn(async move { child.wait_initialized().await });
        sender.send_replace(Some(Arc::new(json!({"p": {"c": {}}}))));
        waiter.await.unwrap().unwrap();
    }
}
