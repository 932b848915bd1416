//! Typed-input/output graph node and its output router (spec.md §4.3,
//! component 4 — "~20%").
//!
//! A [`TypedInputOutputGraphNode`] adds, on top of a
//! [`TypedInputGraphNode`], an output endpoint of type `U` whose values are
//! routed to downstream nodes by an ordered list of predicates — first
//! match wins, the way the teacher's conditional-edge routing in
//! `pregel` picks the first matching branch.

use crate::block::BlockHandle;
use crate::cancellation::CancellationSource;
use crate::completion::Completion;
use crate::error::{GraphError, Result};
use crate::input_node::TypedInputGraphNode;
use crate::name;
use crate::node::GraphNode;
use crate::options::Options;
use crate::stats::{BufferStatus, GarbageRecorder};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

pub type Predicate<U> = Arc<dyn Fn(&U) -> bool + Send + Sync>;
type Sink<U> = Arc<dyn Fn(U) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct LinkEntry<U> {
    predicate: Predicate<U>,
    sink: Sink<U>,
}

// Written by hand rather than `#[derive(Clone)]`: the derive macro adds a
// spurious `U: Clone` bound even though both fields are `Arc<dyn Fn(..)>`,
// which are `Clone` regardless of `U`.
impl<U> Clone for LinkEntry<U> {
    fn clone(&self) -> Self {
        LinkEntry {
            predicate: self.predicate.clone(),
            sink: self.sink.clone(),
        }
    }
}

/// Ordered routing table for a typed-output node's output endpoint
/// (spec.md §4.3 "Output routing"). Links are tried in registration order;
/// the first whose predicate matches receives the value. Once a
/// `link_left_to*` leftover sink is installed, the list is frozen and no
/// further `link_to`/`transform_and_link` calls are accepted.
struct OutputRouter<U> {
    links: RwLock<Vec<LinkEntry<U>>>,
    leftover: RwLock<Option<Sink<U>>>,
    frozen: AtomicBool,
    garbage: GarbageRecorder,
}

impl<U: Send + Sync + 'static> OutputRouter<U> {
    fn new() -> Self {
        Self {
            links: RwLock::new(Vec::new()),
            leftover: RwLock::new(None),
            frozen: AtomicBool::new(false),
            garbage: GarbageRecorder::new(),
        }
    }

    fn add_link(&self, predicate: Predicate<U>, sink: Sink<U>) -> Result<()> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(GraphError::RoutingFrozen);
        }
        self.links.write().unwrap().push(LinkEntry { predicate, sink });
        Ok(())
    }

    fn install_leftover(&self, sink: Sink<U>) -> Result<()> {
        let mut guard = self.leftover.write().unwrap();
        if guard.is_some() {
            return Err(GraphError::LeftoverAlreadyInstalled);
        }
        *guard = Some(sink);
        self.frozen.store(true, Ordering::Release);
        Ok(())
    }

    async fn emit(&self, value: U) -> Result<()> {
        let (links, leftover) = {
            let links = self.links.read().unwrap().clone();
            let leftover = self.leftover.read().unwrap().clone();
            (links, leftover)
        };
        for entry in &links {
            if (entry.predicate)(&value) {
                return (entry.sink)(value).await;
            }
        }
        if let Some(sink) = leftover {
            return sink(value).await;
        }
        tracing::debug!("output value matched no predicate and no leftover sink is installed; dropping it");
        Ok(())
    }
}

/// A graph node with one input endpoint of type `T` and one output
/// endpoint of type `U` (spec.md §4.3).
pub struct TypedInputOutputGraphNode<T, U> {
    input_node: Arc<TypedInputGraphNode<T>>,
    output: Arc<OutputRouter<U>>,
}

impl<T, U> TypedInputOutputGraphNode<T, U>
where
    T: Send + 'static,
    U: Send + Sync + 'static,
{
    /// `transform` runs once per item arriving at the input endpoint,
    /// producing the value pushed into the output endpoint's router.
    pub fn new<F, Fut>(options: Options, transform: F) -> Arc<Self>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<U>> + Send,
    {
        Self::with_name(
            name::next_name("TypedInputOutputGraphNode"),
            options,
            transform,
        )
    }

    pub fn with_name<F, Fut>(name: impl Into<String>, options: Options, transform: F) -> Arc<Self>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<U>> + Send,
    {
        let output = Arc::new(OutputRouter::new());
        let output_for_process = output.clone();
        let input_node = TypedInputGraphNode::with_name(name, options, move |item: T| {
            let output = output_for_process.clone();
            let transformed = transform(item);
            async move {
                let value = transformed.await?;
                output.emit(value).await
            }
        });
        Arc::new(Self { input_node, output })
    }

    pub fn base(&self) -> &Arc<GraphNode> {
        self.input_node.base()
    }

    pub fn name(&self) -> &str {
        self.input_node.name()
    }

    pub fn full_name(&self) -> String {
        self.input_node.full_name()
    }

    pub fn completion(&self) -> Completion {
        self.input_node.completion()
    }

    pub fn buffer_status(&self) -> BufferStatus {
        self.input_node.buffer_status()
    }

    pub fn fault(&self, err: GraphError) {
        self.input_node.fault(err);
    }

    pub fn complete(&self) {
        self.input_node.complete();
    }

    pub async fn push_one(&self, item: T) -> Result<()> {
        self.input_node.push_one(item).await
    }

    pub async fn pull_from(
        &self,
        iter: impl IntoIterator<Item = T>,
        cancellation: &CancellationSource,
    ) -> Result<usize> {
        self.input_node.pull_from(iter, cancellation).await
    }

    pub async fn process(&self, iter: impl IntoIterator<Item = T>, complete_on_finish: bool) -> Result<usize> {
        self.input_node.process(iter, complete_on_finish).await
    }

    pub fn garbage_recorder(&self) -> GarbageRecorder {
        self.output.garbage.clone()
    }

    /// Route values matching `predicate` (or every value, if `None`) to
    /// `other`'s input endpoint (spec.md §4.3 "LinkTo"). Registers this
    /// node as an external dependency of `other` (so `other` cannot
    /// complete before this node finishes) and wires a watcher so that if
    /// `other` faults before this node finishes, this node is faulted too
    /// with `LinkedDataflowFailed`/`LinkedDataflowCanceled`.
    pub fn link_to(
        self: &Arc<Self>,
        other: &Arc<TypedInputGraphNode<U>>,
        predicate: Option<Predicate<U>>,
    ) -> Result<()> {
        self.transform_and_link(other, |v| v, predicate)
    }

    /// `link_to`, but applying `transform: U -> V` to each routed value
    /// before it reaches `other`'s input endpoint (spec.md §4.3
    /// "TransformAndLink").
    pub fn transform_and_link<V, F>(
        self: &Arc<Self>,
        other: &Arc<TypedInputGraphNode<V>>,
        transform: F,
        predicate: Option<Predicate<U>>,
    ) -> Result<()>
    where
        V: Send + 'static,
        F: Fn(U) -> V + Send + Sync + 'static,
    {
        let predicate = predicate.unwrap_or_else(|| Arc::new(|_: &U| true));
        let target = other.clone();
        let sink: Sink<U> = Arc::new(move |value: U| {
            let target = target.clone();
            let value = transform(value);
            Box::pin(async move { target.push_one(value).await })
        });
        self.output.add_link(predicate, sink)?;
        other
            .base()
            .register_dependency(crate::dependency::Dependency::Graph(self.base().clone()), None)?;
        self.watch_linked_graph(other.base().clone());
        Ok(())
    }

    fn watch_linked_graph(self: &Arc<Self>, other: Arc<GraphNode>) {
        let this = self.clone();
        tokio::spawn(async move {
            let result = other.completion().wait().await;
            if this.completion().is_resolved() {
                return;
            }
            if let Err(err) = result {
                let wrapped = if err.is_cancellation() {
                    GraphError::LinkedDataflowCanceled
                } else {
                    GraphError::LinkedDataflowFailed
                };
                this.fault(wrapped);
            }
        });
    }

    /// Freeze the routing table and send every unmatched value to `other`
    /// (spec.md §4.3 "LinkLeftTo").
    pub fn link_left_to(self: &Arc<Self>, other: &Arc<TypedInputGraphNode<U>>) -> Result<()> {
        let target = other.clone();
        let sink: Sink<U> = Arc::new(move |value: U| {
            let target = target.clone();
            Box::pin(async move { target.push_one(value).await })
        });
        self.output.install_leftover(sink)?;
        other
            .base()
            .register_dependency(crate::dependency::Dependency::Graph(self.base().clone()), None)?;
        self.watch_linked_graph(other.base().clone());
        Ok(())
    }

    /// Freeze the routing table and drop every unmatched value, counting it
    /// in this node's [`GarbageRecorder`] (spec.md §4.3 "LinkLeftToNull").
    pub fn link_left_to_null(&self) -> Result<()> {
        let garbage = self.output.garbage.clone();
        let sink: Sink<U> = Arc::new(move |_value: U| {
            garbage.record();
            Box::pin(async { Ok(()) })
        });
        self.output.install_leftover(sink)
    }

    /// Freeze the routing table and fail the whole graph with
    /// `InvalidData` the first time an unmatched value arrives (spec.md
    /// §4.3 "LinkLeftToError").
    pub fn link_left_to_error(self: &Arc<Self>) -> Result<()> {
        let this = self.clone();
        let sink: Sink<U> = Arc::new(move |_value: U| {
            let this = this.clone();
            Box::pin(async move {
                this.fault(GraphError::InvalidData(format!(
                    "unmatched value reached the leftover error sink of '{}'",
                    this.full_name()
                )));
                Ok(())
            })
        });
        self.output.install_leftover(sink)
    }
}

/// Sugar for subtype-based routing: install a `link_to` whose predicate and
/// transform are both `V`'s downcast from `U` (spec.md §4.3
/// "LinkSubtypeTo"). Requires an explicit conversion rather than Rust's
/// (nonexistent) dynamic subtyping; implement [`DowncastTo`] for any `U`
/// that should support it.
pub trait DowncastTo<V>: Sized {
    fn downcast_to(self) -> Option<V>;
}

impl<T, U> TypedInputOutputGraphNode<T, U>
where
    T: Send + 'static,
    U: Send + Sync + Clone + 'static,
{
    pub fn link_subtype_to<V>(self: &Arc<Self>, other: &Arc<TypedInputGraphNode<V>>) -> Result<()>
    where
        V: Send + 'static,
        U: DowncastTo<V>,
    {
        let probe_predicate: Predicate<U> = Arc::new(|v: &U| v.clone().downcast_to().is_some());
        self.transform_and_link(
            other,
            |v: U| v.downcast_to().expect("predicate already confirmed this downcast succeeds"),
            Some(probe_predicate),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn downstream_does_not_complete_before_upstream_finishes() {
        // link_to must register the *upstream* node as an external
        // dependency of the downstream one (spec.md §4.3 "LinkTo": "other
        // cannot complete before this finishes"). If the direction were
        // reversed, `down` would never have its `complete()` hook invoked
        // and this would hang forever.
        let received = Arc::new(std::sync::Mutex::new(Vec::new()));
        let received2 = received.clone();
        let down = TypedInputGraphNode::new(Options::new(), move |item: i32| {
            let received = received2.clone();
            async move {
                received.lock().unwrap().push(item);
                Ok(())
            }
        });
        let up = TypedInputOutputGraphNode::new(Options::new(), |item: i32| async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            Ok(item)
        });
        up.link_to(&down, None).unwrap();

        up.process(vec![1, 2, 3], true).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), down.completion().wait())
            .await
            .expect("downstream should auto-complete once the upstream finishes")
            .unwrap();

        assert_eq!(*received.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn first_matching_predicate_wins() {
        let seen_evens = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_evens2 = seen_evens.clone();
        let evens_recorder = TypedInputGraphNode::new(Options::new(), move |item: i32| {
            seen_evens2.lock().unwrap().push(item);
            async move { Ok(()) }
        });
        let seen_threes = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_threes2 = seen_threes.clone();
        let threes_recorder = TypedInputGraphNode::new(Options::new(), move |item: i32| {
            seen_threes2.lock().unwrap().push(item);
            async move { Ok(()) }
        });
        let router_node = TypedInputOutputGraphNode::new(Options::new(), |item: i32| async move { Ok(item) });
        router_node
            .link_to(&evens_recorder, Some(Arc::new(|v: &i32| v % 2 == 0)))
            .unwrap();
        router_node
            .link_to(&threes_recorder, Some(Arc::new(|v: &i32| v % 3 == 0)))
            .unwrap();
        router_node.link_left_to_null().unwrap();

        router_node.process(vec![1, 2, 3, 4, 5, 6], true).await.unwrap();
        evens_recorder.signal_and_wait().await.unwrap();
        threes_recorder.signal_and_wait().await.unwrap();

        assert_eq!(*seen_evens.lock().unwrap(), vec![2, 4, 6]);
        assert_eq!(*seen_threes.lock().unwrap(), vec![3]);
        assert_eq!(router_node.garbage_recorder().count(), 2); // 1 and 5
    }

    #[tokio::test]
    async fn linking_after_leftover_is_frozen() {
        let sink = TypedInputGraphNode::new(Options::new(), |_item: i32| async move { Ok(()) });
        let node = TypedInputOutputGraphNode::new(Options::new(), |item: i32| async move { Ok(item) });
        node.link_left_to_null().unwrap();
        let err = node.link_to(&sink, None).unwrap_err();
        assert!(matches!(err, GraphError::RoutingFrozen));
    }

    #[tokio::test]
    async fn second_leftover_install_fails() {
        let node = TypedInputOutputGraphNode::new(Options::new(), |item: i32| async move { Ok(item) });
        node.link_left_to_null().unwrap();
        let err = node.link_left_to_null().unwrap_err();
        assert!(matches!(err, GraphError::LeftoverAlreadyInstalled));
    }
}
