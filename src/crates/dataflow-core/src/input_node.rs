//! Typed-input graph node (spec.md §4.2, component 3 — "~15%").
//!
//! Wraps a [`GraphNode`] with a single input endpoint of element type `T`.
//! Rust has no class inheritance, so this is composition, not subclassing:
//! `TypedInputGraphNode` owns an `Arc<GraphNode>` and registers its input
//! [`Block`] as that node's one and only child.

use crate::block::{Block, BlockHandle};
use crate::cancellation::CancellationSource;
use crate::completion::Completion;
use crate::error::{GraphError, Result};
use crate::name;
use crate::node::GraphNode;
use crate::options::Options;
use crate::stats::BufferStatus;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

use crate::block::BlockSender;

/// A graph node with one input endpoint of type `T` (spec.md §4.2).
///
/// `process` is invoked once per item arriving at the input endpoint, in
/// arrival order; an `Err` return faults the node exactly as a bare
/// [`Block`]'s would.
pub struct TypedInputGraphNode<T> {
    base: Arc<GraphNode>,
    input: Arc<AsyncMutex<Option<BlockSender<T>>>>,
}

impl<T: Send + 'static> TypedInputGraphNode<T> {
    pub fn new<F, Fut>(options: Options, process: F) -> Arc<Self>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        Self::with_name(name::next_name("TypedInputGraphNode"), options, process)
    }

    pub fn with_name<F, Fut>(name: impl Into<String>, options: Options, process: F) -> Arc<Self>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        let name = name.into();
        let base = GraphNode::with_name(name.clone(), options.clone());
        let (block, sender) = Block::spawn(format!("{name}.Input"), &options, process);
        let block: Arc<dyn BlockHandle> = Arc::new(block);
        base.register_child_block(block, None, false, Some("input".to_string()))
            .expect("a freshly constructed node has no prior 'input' child");

        let input = Arc::new(AsyncMutex::new(Some(sender)));
        let hook_input = input.clone();
        base.set_complete_hook(move || {
            // Dropping the sender closes the queue; the input block's
            // worker then drains whatever is left and resolves. Taking it
            // requires the async mutex, so this hands off to a task rather
            // than blocking the (synchronous) complete() caller.
            let hook_input = hook_input.clone();
            tokio::spawn(async move {
                hook_input.lock().await.take();
            });
        });

        Arc::new(Self { base, input })
    }

    pub fn base(&self) -> &Arc<GraphNode> {
        &self.base
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    pub fn full_name(&self) -> String {
        self.base.full_name()
    }

    pub fn options(&self) -> &Options {
        self.base.options()
    }

    pub fn completion(&self) -> Completion {
        self.base.completion()
    }

    pub fn buffer_status(&self) -> BufferStatus {
        self.base.buffer_status()
    }

    pub fn fault(&self, err: GraphError) {
        self.base.fault(err);
    }

    /// Close the input endpoint. Idempotent; a second call is a no-op
    /// because the sender has already been taken.
    pub fn complete(&self) {
        self.base.complete();
    }

    /// Push a single item onto the input endpoint.
    pub async fn push_one(&self, item: T) -> Result<()> {
        let guard = self.input.lock().await;
        match guard.as_ref() {
            Some(sender) => sender.push(item).await,
            None => Err(GraphError::InvalidData(format!(
                "'{}' input endpoint is already completed",
                self.full_name()
            ))),
        }
    }

    /// Sequentially push every item from `iter`, checking `cancellation`
    /// between items — not mid-item (spec.md §5: "individual primitive
    /// workers do not honour cancellation mid-item").
    pub async fn pull_from(
        &self,
        iter: impl IntoIterator<Item = T>,
        cancellation: &CancellationSource,
    ) -> Result<usize> {
        let mut count = 0usize;
        for item in iter {
            if cancellation.is_tripped() {
                tracing::debug!(node = %self.full_name(), delivered = count, "pull_from observed cancellation");
                return Err(GraphError::SiblingUnitCanceled);
            }
            if let Err(err) = self.push_one(item).await {
                tracing::warn!(node = %self.full_name(), delivered = count, error = %err, "pull_from stopped after a partial delivery");
                return Err(GraphError::aggregate(
                    format!("'{}' pull_from delivered {count} item(s) before failing", self.full_name()),
                    err,
                ));
            }
            count += 1;
        }
        Ok(count)
    }

    /// Close the input endpoint and wait for this node's completion.
    pub async fn signal_and_wait(&self) -> Result<()> {
        self.complete();
        self.completion().wait().await
    }

    /// Register a fresh cancellation source, pull every item from `iter`
    /// through it, and (optionally) close the input endpoint and wait for
    /// completion (spec.md §4.2 "Process").
    pub async fn process(
        &self,
        iter: impl IntoIterator<Item = T>,
        complete_on_finish: bool,
    ) -> Result<usize> {
        let cancellation = CancellationSource::new();
        self.base.register_cancellation_token_source(cancellation.clone());
        let count = self.pull_from(iter, &cancellation).await?;
        if complete_on_finish {
            self.signal_and_wait().await?;
        }
        Ok(count)
    }

    /// `process`, but over several iterables in sequence: each sub-iterable
    /// is driven through its own `process(iter, false)` call with its own
    /// fresh cancellation source, exactly as repeated calls to `process`
    /// would be (spec.md §4.2 "ProcessMultiple"), rather than one
    /// cancellation source shared across the whole run.
    pub async fn process_multiple<I>(&self, iters: I, complete_on_finish: bool) -> Result<usize>
    where
        I: IntoIterator,
        I::Item: IntoIterator<Item = T>,
    {
        let mut total = 0usize;
        for iter in iters {
            total += self.process(iter, false).await?;
        }
        if complete_on_finish {
            self.signal_and_wait().await?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn processes_pulled_items_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let node = TypedInputGraphNode::new(Options::new(), move |item: i32| {
            let seen = seen2.clone();
            async move {
                seen.lock().unwrap().push(item);
                Ok(())
            }
        });

        let delivered = node.process(vec![1, 2, 3], true).await.unwrap();
        assert_eq!(delivered, 3);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn pull_from_stops_between_items_on_cancellation() {
        let node: Arc<TypedInputGraphNode<i32>> =
            TypedInputGraphNode::new(Options::new(), |_item| async move { Ok(()) });
        let cancellation = CancellationSource::new();
        cancellation.trip();
        let err = node.pull_from(vec![1, 2, 3], &cancellation).await.unwrap_err();
        assert!(matches!(err, GraphError::SiblingUnitCanceled));
    }

    #[tokio::test]
    async fn process_multiple_delivers_each_sub_iterable_in_sequence() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let node = TypedInputGraphNode::new(Options::new(), move |item: i32| {
            let seen = seen2.clone();
            async move {
                seen.lock().unwrap().push(item);
                Ok(())
            }
        });

        let delivered = node
            .process_multiple(vec![vec![1, 2], vec![3], vec![4, 5, 6]], true)
            .await
            .unwrap();
        assert_eq!(delivered, 6);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn process_multiple_gives_each_sub_iterable_its_own_cancellation_source() {
        // A cancellation source tripped during one sub-iterable's `process`
        // call must not carry over and cancel the next one (spec.md §4.2
        // "ProcessMultiple" is sequential `process(iter, false)` calls, each
        // of which registers its own fresh source).
        let node: Arc<TypedInputGraphNode<i32>> =
            TypedInputGraphNode::new(Options::new(), |_item| async move { Ok(()) });
        let delivered = node
            .process_multiple(vec![vec![1, 2], vec![3, 4]], false)
            .await
            .unwrap();
        assert_eq!(delivered, 4);
    }

    #[tokio::test]
    async fn completing_twice_is_a_no_op() {
        let node: Arc<TypedInputGraphNode<i32>> =
            TypedInputGraphNode::new(Options::new(), |_item| async move { Ok(()) });
        node.complete();
        node.complete();
        node.completion().wait().await.unwrap();
    }
}
