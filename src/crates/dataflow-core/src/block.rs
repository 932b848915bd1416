//! Stage primitive adapter (spec.md §4.1 component 1, "Stage primitive
//! adapter").
//!
//! This module stands in for the pre-existing dataflow-block primitive
//! spec.md §1 says is out of scope: "a bounded single-producer queue, a
//! worker that consumes it, and a completion future". [`Block`] is that
//! primitive; [`BlockHandle`] is the adapter seam the rest of the crate
//! uses so a [`crate::dependency::Dependency`] can hold either a block or a
//! sub-graph without caring which.

use crate::completion::{Completion, CompletionSignal};
use crate::error::{GraphError, Result};
use crate::options::{Options, UNBOUNDED};
use crate::stats::BufferStatus;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Object-safe view of a primitive block (or anything shaped like one),
/// used to build a [`crate::dependency::Dependency::Block`] without a
/// generic parameter leaking into `GraphNode`.
pub trait BlockHandle: Send + Sync {
    fn completion(&self) -> Completion;
    fn buffer_status(&self) -> BufferStatus;
    /// Fault injection: force this block's completion to resolve as failed
    /// (or canceled), and stop accepting new input at the next check point.
    fn fault(&self, err: GraphError);
    fn display_name(&self) -> &str;
}

/// A bounded single-producer queue feeding a worker, with a completion
/// future resolving once the queue is closed and drained (success) or a
/// processing error occurs (failure).
pub struct Block<T> {
    name: String,
    pending: Arc<AtomicUsize>,
    signal: CompletionSignal,
    completion: Completion,
    _marker: std::marker::PhantomData<fn(T)>,
}

/// The producer-facing half of a [`Block`]: the only way to push items in.
/// Dropping every clone of the sender closes the queue, which is how
/// `complete()` is implemented one layer up (spec.md §4.2 "Complete").
pub struct BlockSender<T> {
    tx: mpsc::Sender<T>,
    pending: Arc<AtomicUsize>,
    completion: Completion,
    name: String,
}

impl<T: Send + 'static> Block<T> {
    /// Spawn the worker task and return the block handle plus its input
    /// sender. `process` runs once per item, in arrival order; an error
    /// return from `process` faults the block (terminal — no retry at this
    /// layer, consistent with the bulk sink's own no-retry rule in
    /// spec.md §4.4).
    pub fn spawn<F, Fut>(name: impl Into<String>, options: &Options, process: F) -> (Self, BlockSender<T>)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        let name = name.into();
        let (tx, mut rx) = if options.bounded_capacity == UNBOUNDED {
            mpsc::channel(usize::MAX >> 2)
        } else {
            mpsc::channel(options.bounded_capacity.max(1))
        };
        let pending = Arc::new(AtomicUsize::new(0));
        let (signal, completion) = CompletionSignal::new();

        let worker_pending = pending.clone();
        let worker_signal = signal.clone();
        let worker_name = name.clone();
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                worker_pending.fetch_sub(1, Ordering::AcqRel);
                if worker_signal.is_resolved() {
                    // Already faulted externally; stop draining.
                    continue;
                }
                if let Err(err) = process(item).await {
                    tracing::warn!(block = %worker_name, error = %err, "block worker faulted");
                    worker_signal.fail(err);
                }
            }
            worker_signal.succeed();
        });

        let block = Block {
            name: name.clone(),
            pending: pending.clone(),
            signal,
            completion: completion.clone(),
            _marker: std::marker::PhantomData,
        };
        let sender = BlockSender {
            tx,
            pending,
            completion,
            name,
        };
        (block, sender)
    }
}

impl<T> BlockHandle for Block<T>
where
    T: Send + Sync,
{
    fn completion(&self) -> Completion {
        self.completion.clone()
    }

    fn buffer_status(&self) -> BufferStatus {
        BufferStatus::new(self.pending.load(Ordering::Acquire), 0)
    }

    fn fault(&self, err: GraphError) {
        if err.is_cancellation() {
            self.signal.cancel(err);
        } else {
            self.signal.fail(err);
        }
    }

    fn display_name(&self) -> &str {
        &self.name
    }
}

impl<T> BlockSender<T> {
    /// Push one item, waiting for backpressure if the queue is bounded and
    /// full. Fails if the block already faulted or its worker exited.
    pub async fn push(&self, item: T) -> Result<()> {
        if self.completion.is_resolved() {
            return Err(GraphError::InvalidData(format!(
                "block '{}' is no longer accepting input",
                self.name
            )));
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(item).await.is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(GraphError::InvalidData(format!(
                "block '{}' queue is closed",
                self.name
            )));
        }
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

// BlockSender is intentionally `Clone`-free at the type level beyond what
// `mpsc::Sender` already provides — cloning would let two owners both
// believe they can `complete()` the endpoint by dropping their copy, which
// would silently fail to close the queue. `TypedInputGraphNode` holds the
// single sender for its input endpoint.

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as Counter;

    #[tokio::test]
    async fn processes_items_in_order_then_succeeds() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let options = Options::new();
        let (block, sender) = Block::spawn("test", &options, move |item: i32| {
            let seen = seen2.clone();
            async move {
                seen.lock().unwrap().push(item);
                Ok(())
            }
        });

        for i in 0..5 {
            sender.push(i).await.unwrap();
        }
        drop(sender);
        block.completion().wait().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn processing_error_faults_the_block() {
        let options = Options::new();
        let (block, sender) = Block::spawn("test", &options, |_item: i32| async move {
            Err(GraphError::InvalidData("boom".into()))
        });
        sender.push(1).await.unwrap();
        let result = block.completion().wait().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn buffer_status_tracks_pending_items() {
        let counter = Arc::new(Counter::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());
        let gate2 = gate.clone();
        let counter2 = counter.clone();
        let options = Options::new().with_bounded_capacity(8);
        let (block, sender) = Block::spawn("test", &options, move |_item: i32| {
            let gate = gate2.clone();
            let counter = counter2.clone();
            async move {
                gate.notified().await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        sender.push(1).await.unwrap();
        sender.push(2).await.unwrap();
        tokio::task::yield_now().await;
        assert!(block.buffer_status().in_count >= 1);
        gate.notify_waiters();
        gate.notify_waiters();
        drop(sender);
        block.completion().wait().await.unwrap();
    }
}
