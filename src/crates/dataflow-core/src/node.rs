//! The graph node base type (spec.md §4.1, component 2 of the overview —
//! "~35% of core").
//!
//! `GraphNode` is the thing every other layer in this crate composes
//! around: children (block-deps and graph-deps), parents (weak
//! back-references, spec.md §9), external dependencies, post-completion
//! tasks, cancellation handles, and the lazily-started completion
//! aggregator and monitor loop.
//!
//! Rust has no class inheritance, so the "typed-input" and
//! "typed-input/output" layers (spec.md §4.2, §4.3) are built by
//! *composition*: they hold an `Arc<GraphNode>` and delegate the base
//! surface to it rather than subclassing.

use crate::cancellation::CancellationSource;
use crate::completion::{Completion, CompletionSignal};
use crate::dependency::{Dependency, DependencyEntry, DependencyKind};
use crate::error::{GraphError, Result};
use crate::name;
use crate::options::{MonitorMode, Options};
use crate::stats::BufferStatus;
use futures::future::join_all;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::Instrument;

/// A deferred async action run once every child has resolved (spec.md §3
/// "Post-completion tasks").
type PostTask = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// One-shot callback run after a dependency completes; see
/// `DependencyEntry`'s docs for why this isn't stored on the entry itself.
pub type OnComplete = Box<dyn FnOnce() + Send>;

/// Base graph node: children, parents, external dependencies,
/// post-completion tasks, cancellation handles, and the completion
/// aggregator (spec.md §3, §4.1).
pub struct GraphNode {
    name: String,
    parents: RwLock<Vec<Weak<GraphNode>>>,
    children: RwLock<Vec<DependencyEntry>>,
    external_deps: RwLock<Vec<DependencyEntry>>,
    post_tasks: Mutex<Vec<PostTask>>,
    cancellation_handles: RwLock<Vec<CancellationSource>>,
    options: Options,
    signal: CompletionSignal,
    completion: Completion,
    aggregator_started: AtomicBool,
    external_watcher_started: AtomicBool,
    /// Hook invoked by `complete()`. A no-op at the base layer; typed-input
    /// nodes install one that closes their input endpoint (spec.md §4.1
    /// "Dependency registration": "[the external-dependency watcher] calls
    /// `complete()` on this node").
    complete_hook: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl std::fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphNode")
            .field("full_name", &self.full_name())
            .field("buffer_status", &self.buffer_status())
            .finish()
    }
}

impl GraphNode {
    /// Construct a node with a process-wide default name (`GraphNode<N>`).
    pub fn new(options: Options) -> Arc<Self> {
        Self::with_name(name::next_name("GraphNode"), options)
    }

    /// Construct a node with an explicit name.
    pub fn with_name(name: impl Into<String>, options: Options) -> Arc<Self> {
        let (signal, completion) = CompletionSignal::new();
        let node = Arc::new(Self {
            name: name.into(),
            parents: RwLock::new(Vec::new()),
            children: RwLock::new(Vec::new()),
            external_deps: RwLock::new(Vec::new()),
            post_tasks: Mutex::new(Vec::new()),
            cancellation_handles: RwLock::new(Vec::new()),
            options,
            signal,
            completion,
            aggregator_started: AtomicBool::new(false),
            external_watcher_started: AtomicBool::new(false),
            complete_hook: Mutex::new(None),
        });
        if node.options.monitoring_enabled() {
            node.spawn_monitor();
        }
        node
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `([parent1|parent2|…])->name`, or just `name` with no parents
    /// (spec.md §3 "FullName").
    pub fn full_name(&self) -> String {
        let live: Vec<Arc<GraphNode>> = self
            .parents
            .read()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        if live.is_empty() {
            self.name.clone()
        } else {
            let joined = live
                .iter()
                .map(|p| p.full_name())
                .collect::<Vec<_>>()
                .join("|");
            format!("({joined})->{}", self.name)
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Observers may clone this freely; the aggregator is started (if it
    /// hasn't already been, via a prior child registration) on first
    /// access.
    pub fn completion(self: &Arc<Self>) -> Completion {
        self.start_aggregator_if_needed();
        self.completion.clone()
    }

    /// Componentwise sum of every child's buffer status (spec.md §4.1
    /// "Buffer status").
    pub fn buffer_status(&self) -> BufferStatus {
        self.children
            .read()
            .unwrap()
            .iter()
            .map(|entry| entry.dependency.buffer_status())
            .sum()
    }

    pub fn buffered_count(&self) -> usize {
        self.buffer_status().total()
    }

    /// Run this node's `complete()` hook (a no-op unless a typed-input
    /// layer installed one).
    pub fn complete(&self) {
        if let Some(hook) = self.complete_hook.lock().unwrap().as_ref() {
            hook();
        }
    }

    pub(crate) fn set_complete_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.complete_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Register a post-completion task, run (in registration order) after
    /// every child resolves (spec.md §3, §4.1 step 3).
    pub fn register_post_dataflow_task<F>(&self, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.post_tasks.lock().unwrap().push(Box::pin(task));
    }

    /// Register a cancellation handle, tripped when this node faults
    /// (spec.md §3 "Cancellation handles", §5).
    pub fn register_cancellation_token_source(&self, source: CancellationSource) {
        self.cancellation_handles.write().unwrap().push(source);
    }

    /// Wrap `block` as a block-dep and add it as a child (spec.md §4.1
    /// "Child registration").
    pub fn register_child_block(
        self: &Arc<Self>,
        block: Arc<dyn crate::block::BlockHandle>,
        on_complete: Option<OnComplete>,
        allow_duplicate: bool,
        display_name: Option<String>,
    ) -> Result<()> {
        self.add_entry(
            true,
            Dependency::Block(block),
            DependencyKind::Child,
            allow_duplicate,
            display_name,
            on_complete,
        )?;
        self.start_aggregator_if_needed();
        Ok(())
    }

    /// Wrap `child` as a graph-dep and add it as a child, after checking
    /// that doing so would not create a cycle (spec.md §4.1 "Child
    /// registration", §3 invariant).
    pub fn register_child_graph(
        self: &Arc<Self>,
        child: Arc<GraphNode>,
        on_complete: Option<OnComplete>,
        allow_duplicate: bool,
    ) -> Result<()> {
        if child.contains_descendant(self) {
            return Err(GraphError::CycleNotAllowed(child.full_name()));
        }
        self.add_entry(
            true,
            Dependency::Graph(child.clone()),
            DependencyKind::Child,
            allow_duplicate,
            None,
            on_complete,
        )?;
        child.parents.write().unwrap().push(Arc::downgrade(self));
        self.start_aggregator_if_needed();
        Ok(())
    }

    /// Register an external dependency: not part of the child tree, but
    /// its joint completion (with any other external deps) drives this
    /// node's own completion (spec.md §4.1 "Dependency registration").
    pub fn register_dependency(
        self: &Arc<Self>,
        dependency: Dependency,
        on_complete: Option<OnComplete>,
    ) -> Result<()> {
        self.add_entry(
            false,
            dependency,
            DependencyKind::External,
            false,
            None,
            on_complete,
        )?;
        self.start_external_watcher_if_needed();
        Ok(())
    }

    fn add_entry(
        &self,
        is_child: bool,
        dependency: Dependency,
        kind: DependencyKind,
        allow_duplicate: bool,
        display_name: Option<String>,
        on_complete: Option<OnComplete>,
    ) -> Result<()> {
        let list = if is_child {
            &self.children
        } else {
            &self.external_deps
        };
        let id = dependency.identity();
        {
            let mut guard = list.write().unwrap();
            if guard.iter().any(|e| e.dependency.identity() == id) {
                if allow_duplicate {
                    return Ok(());
                }
                return Err(GraphError::DuplicateChild(dependency.display_name()));
            }
            guard.push(DependencyEntry {
                dependency: dependency.clone(),
                kind,
                display_name,
            });
        }
        if let Some(cb) = on_complete {
            let completion = dependency.completion();
            tokio::spawn(async move {
                let _ = completion.wait().await;
                cb();
            });
        }
        Ok(())
    }

    /// True if `self` is (or transitively contains, via graph-dep
    /// children) `candidate` — the cycle check for `register_child_graph`
    /// (spec.md §3 "cycle prohibition").
    pub fn contains_descendant(&self, candidate: &Arc<GraphNode>) -> bool {
        if std::ptr::eq(self, candidate.as_ref()) {
            return true;
        }
        self.children
            .read()
            .unwrap()
            .iter()
            .any(|entry| entry.dependency.contains_transitively(candidate))
    }

    /// Normalised fault propagation (spec.md §4.1 "Fault propagation"):
    /// resolve this node's own completion, trip its cancellation handles,
    /// and fault every non-completed child with the normalised variant.
    pub fn fault(&self, err: GraphError) {
        let kind = err.sibling_fault_kind();
        if err.is_cancellation() {
            self.signal.cancel(err);
        } else {
            self.signal.fail(err);
        }
        for source in self.cancellation_handles.read().unwrap().iter() {
            source.trip();
        }
        let children = self.children.read().unwrap().clone();
        for entry in children {
            if !entry.dependency.completion().is_resolved() {
                entry.dependency.fault(kind.into());
            }
        }
    }

    fn spawn_monitor(self: &Arc<Self>) {
        let node = self.clone();
        let span = tracing::info_span!("node", name = %node.full_name());
        tokio::spawn(
            async move {
                loop {
                    tokio::time::sleep(node.options.monitor_interval).await;
                    if node.completion.is_resolved() {
                        break;
                    }
                    node.log_monitor_status();
                }
            }
            .instrument(span),
        );
    }

    fn log_monitor_status(&self) {
        let verbose = self.options.monitor_mode == MonitorMode::Verbose;
        if self.options.flow_monitor_enabled {
            let status = self.buffer_status();
            if verbose || !status.is_zero() {
                tracing::info!(
                    node = %self.full_name(),
                    in_count = status.in_count,
                    out_count = status.out_count,
                    "flow buffer status"
                );
            }
        }
        if self.options.block_monitor_enabled {
            for entry in self.children.read().unwrap().iter() {
                let status = entry.dependency.buffer_status();
                if verbose || !status.is_zero() {
                    tracing::info!(
                        node = %self.full_name(),
                        child = %entry.name(),
                        in_count = status.in_count,
                        out_count = status.out_count,
                        "block buffer status"
                    );
                }
            }
        }
    }

    fn start_aggregator_if_needed(self: &Arc<Self>) {
        if self
            .aggregator_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let node = self.clone();
            let span = tracing::info_span!("node", name = %node.full_name());
            tokio::spawn(async move { node.run_aggregator().await }.instrument(span));
        }
    }

    fn start_external_watcher_if_needed(self: &Arc<Self>) {
        if self
            .external_watcher_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let node = self.clone();
            let span = tracing::info_span!("node", name = %node.full_name());
            tokio::spawn(async move { node.run_external_watcher().await }.instrument(span));
        }
    }

    /// Completion aggregator (spec.md §4.1 "Completion aggregator").
    ///
    /// Resolves success only once every child, every post-completion task,
    /// *and* every external dependency has jointly completed (spec.md §3:
    /// "External dependencies ... whose joint completion triggers this
    /// node's completion signal"; spec.md §8 scenario 6). The separate
    /// external-dependency watcher (`run_external_watcher`) still faults
    /// this node as soon as an external dependency fails, even while
    /// children are still running — the join below additionally covers the
    /// success path, which that watcher's `complete()` call alone cannot
    /// drive for a node with no input endpoint to close.
    async fn run_aggregator(self: Arc<Self>) {
        if self.children.read().unwrap().is_empty() {
            tokio::time::sleep(self.options.monitor_interval).await;
            if self.children.read().unwrap().is_empty() {
                self.fault(GraphError::NoChildRegistered(self.name.clone()));
                return;
            }
        }

        if let Err(err) = join_dependencies(&self.children).await {
            self.fault(GraphError::aggregate(
                format!("'{}' failed", self.full_name()),
                err,
            ));
            return;
        }

        let tasks = std::mem::take(&mut *self.post_tasks.lock().unwrap());
        for task in tasks {
            if let Err(err) = task.await {
                self.fault(GraphError::aggregate(
                    format!("post-completion task on '{}' failed", self.full_name()),
                    err,
                ));
                return;
            }
        }

        if let Err(err) = join_dependencies(&self.external_deps).await {
            self.fault(external_dependency_fault(&err));
            return;
        }

        self.signal.succeed();
        tracing::info!(node = %self.full_name(), "graph node completed");
    }

    /// External-dependency joint-completion watcher (spec.md §4.1
    /// "Dependency registration"). Runs alongside `run_aggregator` so a
    /// failing external dependency faults this node immediately, without
    /// waiting for still-running children to finish first.
    async fn run_external_watcher(self: Arc<Self>) {
        if let Err(err) = join_dependencies(&self.external_deps).await {
            self.fault(external_dependency_fault(&err));
            return;
        }
        self.complete();
    }
}

/// Snapshot-then-recheck join over every dependency currently in `list`,
/// folding in any new entries added while awaiting (spec.md §4.1 step 2:
/// "as new children are added during the await, include them"). Shared by
/// the children join, the post-success external-dependency join, and the
/// external-dependency watcher.
async fn join_dependencies(list: &RwLock<Vec<DependencyEntry>>) -> Result<()> {
    let mut awaited: HashSet<usize> = HashSet::new();
    loop {
        let snapshot = list.read().unwrap().clone();
        let pending: Vec<Dependency> = snapshot
            .iter()
            .filter(|entry| awaited.insert(entry.dependency.identity()))
            .map(|entry| entry.dependency.clone())
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        let results = join_all(pending.iter().map(|d| d.completion().wait())).await;
        if let Some(err) = results.into_iter().find_map(|r| r.err()) {
            return Err(err);
        }
    }
}

/// Normalise an external dependency's failure the way spec.md §4.1
/// prescribes: `LinkedDataflowFailed`/`LinkedDataflowCanceled` rather than
/// the raw error.
fn external_dependency_fault(err: &GraphError) -> GraphError {
    if err.is_cancellation() {
        GraphError::LinkedDataflowCanceled
    } else {
        GraphError::LinkedDataflowFailed
    }
}
