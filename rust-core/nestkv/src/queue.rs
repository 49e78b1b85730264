// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Transaction queue.
//
// Serializes every read and write issued against one container. A single
// worker task drains a backlog in arrival order:
//
// - a WRITE at the head runs alone and completes before anything else starts;
// - a READ at the head is batched with every READ directly behind it, and
//   the batch runs concurrently.
//
// Reads therefore never straddle a write, and writes never overlap each
// other. Within one read batch results are delivered as they complete.
//
// A transaction's result (or error) is delivered to the single caller that
// queued it. A failing or panicking transaction does not affect the rest of
// the backlog.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use nestkv_container::{Result, StorageError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Identifier of a queued transaction, unique per queue.
pub type TransactionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    Read,
    Write,
}

struct Transaction {
    id: TransactionId,
    kind: TransactionKind,
    job: BoxFuture<'static, ()>,
}

/// Handle to a queue worker. Clones share the same worker and ordering.
#[derive(Clone)]
pub struct TransactionQueue {
    sender: mpsc::UnboundedSender<Transaction>,
    next_id: Arc<AtomicU64>,
}

impl TransactionQueue {
    /// Spawn a new queue worker.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(receiver));
        Self {
            sender,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Queue a read. It may run concurrently with adjacent reads.
    pub fn queue_read<T, F, Fut>(&self, work: F) -> PendingTransaction<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.submit(TransactionKind::Read, work)
    }

    /// Queue a write. It runs alone.
    pub fn queue_write<T, F, Fut>(&self, work: F) -> PendingTransaction<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.submit(TransactionKind::Write, work)
    }

    /// Queue `work` as a transaction of the given kind.
    ///
    /// The transaction enters the backlog immediately; the returned handle
    /// only delivers its result. Dropping the handle does not cancel it.
    pub fn submit<T, F, Fut>(&self, kind: TransactionKind, work: F) -> PendingTransaction<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, receiver) = oneshot::channel();

        let job = async move {
            let outcome = AssertUnwindSafe(async move { work().await })
                .catch_unwind()
                .await;
            let result = outcome.unwrap_or_else(|_| {
                warn!(id, ?kind, "transaction panicked");
                Err(StorageError::TransactionAborted { id })
            });
            // The caller may have stopped waiting.
            let _ = reply.send(result);
        }
        .boxed();

        let receiver = self
            .sender
            .send(Transaction { id, kind, job })
            .ok()
            .map(|()| receiver);

        PendingTransaction { id, receiver }
    }
}

impl Default for TransactionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransactionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionQueue")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

/// Result of a queued transaction.
///
/// Resolves to the work's own result, [`StorageError::TransactionAborted`]
/// if it panicked, or [`StorageError::Closed`] if the worker is gone.
#[must_use = "the transaction runs regardless; await this to observe its result"]
pub struct PendingTransaction<T> {
    id: TransactionId,
    receiver: Option<oneshot::Receiver<Result<T>>>,
}

impl<T> PendingTransaction<T> {
    pub fn id(&self) -> TransactionId {
        self.id
    }
}

impl<T> Future for PendingTransaction<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(receiver) = self.get_mut().receiver.as_mut() else {
            return Poll::Ready(Err(StorageError::Closed));
        };
        Pin::new(receiver)
            .poll(cx)
            .map(|delivered| delivered.unwrap_or(Err(StorageError::Closed)))
    }
}

impl<T> fmt::Debug for PendingTransaction<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTransaction")
            .field("id", &self.id)
            .finish()
    }
}

async fn run_worker(mut receiver: mpsc::UnboundedReceiver<Transaction>) {
    let mut backlog: VecDeque<Transaction> = VecDeque::new();

    loop {
        if backlog.is_empty() {
            match receiver.recv().await {
                Some(transaction) => backlog.push_back(transaction),
                None => break,
            }
        }
        while let Ok(transaction) = receiver.try_recv() {
            backlog.push_back(transaction);
        }

        let Some(head) = backlog.pop_front() else {
            continue;
        };

        match head.kind {
            TransactionKind::Write => {
                debug!(id = head.id, "running write transaction");
                head.job.await;
            }
            TransactionKind::Read => {
                let mut batch = vec![head];
                while backlog
                    .front()
                    .is_some_and(|next| next.kind == TransactionKind::Read)
                {
                    if let Some(next) = backlog.pop_front() {
                        batch.push(next);
                    }
                }
                debug!(
                    first = batch[0].id,
                    size = batch.len(),
                    "running read batch"
                );
                join_all(batch.into_iter().map(|transaction| transaction.job)).await;
            }
        }
    }

    debug!("transaction queue closed");
}
