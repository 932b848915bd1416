//! The `Dependency` variant wrapping either a primitive block or a nested
//! graph node (spec.md §3 "Dependency (variant)").

use crate::block::BlockHandle;
use crate::completion::Completion;
use crate::error::GraphError;
use crate::node::GraphNode;
use crate::stats::BufferStatus;
use std::sync::Arc;

/// Whether a dependency participates in the parent/child tree (and so
/// counts toward "every child completes" in the aggregator) or merely
/// gates completion from outside it (spec.md §3 "Each dependency has a
/// *kind*").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    Child,
    External,
}

/// Either a block-dep or a graph-dep (spec.md §3).
#[derive(Clone)]
pub enum Dependency {
    Block(Arc<dyn BlockHandle>),
    Graph(Arc<GraphNode>),
}

impl Dependency {
    pub fn completion(&self) -> Completion {
        match self {
            Dependency::Block(b) => b.completion(),
            Dependency::Graph(g) => g.completion(),
        }
    }

    pub fn buffer_status(&self) -> BufferStatus {
        match self {
            Dependency::Block(b) => b.buffer_status(),
            Dependency::Graph(g) => g.buffer_status(),
        }
    }

    pub fn fault(&self, err: GraphError) {
        match self {
            Dependency::Block(b) => b.fault(err),
            Dependency::Graph(g) => g.fault(err),
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            Dependency::Block(b) => b.display_name().to_string(),
            Dependency::Graph(g) => g.full_name(),
        }
    }

    /// Referential identity, used for the "at most once unless
    /// `allow_duplicate`" invariant (spec.md §3) and for cycle detection.
    pub fn identity(&self) -> usize {
        match self {
            Dependency::Block(b) => Arc::as_ptr(b) as *const () as usize,
            Dependency::Graph(g) => Arc::as_ptr(g) as usize,
        }
    }

    /// True if this dependency is (or transitively contains) `candidate`
    /// — the cycle-prohibition check for graph-deps (spec.md §3 invariant
    /// "a node may not register as a child of one of its own
    /// descendants").
    pub fn contains_transitively(&self, candidate: &Arc<GraphNode>) -> bool {
        match self {
            Dependency::Block(_) => false,
            Dependency::Graph(g) => g.contains_descendant(candidate),
        }
    }
}

/// One entry in a node's children/external-dependency list: the dependency
/// itself, its kind, and a display name override. An optional completion
/// callback passed to `register_child`/`register_dependency` is not stored
/// here — it is spawned as its own watcher task at registration time (see
/// `GraphNode::register_child`), since it need only run once and has no
/// further bearing on this entry's identity.
#[derive(Clone)]
pub struct DependencyEntry {
    pub dependency: Dependency,
    pub kind: DependencyKind,
    pub display_name: Option<String>,
}

impl DependencyEntry {
    pub fn name(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| self.dependency.display_name())
    }
}
