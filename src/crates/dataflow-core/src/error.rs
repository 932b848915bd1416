//! Error types shared by every graph node and the bulk sink.
//!
//! Errors fall into three families (see `DESIGN.md` for the full taxonomy):
//!
//! - topology errors, raised synchronously at wiring time (`DuplicateChild`,
//!   `CycleNotAllowed`, `RoutingFrozen`, ...)
//! - propagated errors, raised asynchronously while a graph runs and passed
//!   through [`GraphNode::fault`](crate::node::GraphNode::fault) unchanged to
//!   every other node in the same family (`SiblingUnitFailed`,
//!   `SiblingUnitCanceled`, `LinkedDataflowFailed`, `LinkedDataflowCanceled`)
//! - terminal-sink errors, local to the batched bulk sink (`BulkWriteFailed`)
//!
//! `Completion` resolves with [`GraphError::Aggregate`], which wraps exactly
//! one inner error — the first fault a node's completion aggregator observed.

use std::fmt;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GraphError>;

#[derive(Error, Debug)]
pub enum GraphError {
    /// A node was registered as a child twice without `allow_duplicate`.
    #[error("'{0}' is already registered as a child")]
    DuplicateChild(String),

    /// Registering `child` would make the parent/child relation cyclic:
    /// `child` already transitively contains the node being registered.
    #[error("registering '{0}' as a child would create a cycle")]
    CycleNotAllowed(String),

    /// `Completion` was awaited but no child was ever registered, and one
    /// monitor interval elapsed without one appearing.
    #[error("no child was registered on '{0}' before the monitor interval elapsed")]
    NoChildRegistered(String),

    /// A sibling child faulted; this is the normalised error every other
    /// still-running child observes. The original error is retained only at
    /// the node whose aggregator first observed it.
    #[error("a sibling unit failed")]
    SiblingUnitFailed,

    /// A sibling child was cancelled; normalised sibling-facing variant of
    /// a cancellation.
    #[error("a sibling unit was canceled")]
    SiblingUnitCanceled,

    /// A graph this node linked to (via `link_to`/`transform_and_link`)
    /// faulted before this node finished producing output for it.
    #[error("a linked downstream graph failed")]
    LinkedDataflowFailed,

    /// As above, but the downstream graph was canceled rather than faulted.
    #[error("a linked downstream graph was canceled")]
    LinkedDataflowCanceled,

    /// A value reached a `link_left_to_error()` sink: it matched none of
    /// the predicates installed on the upstream typed-output node.
    #[error("invalid data reached an error sink: {0}")]
    InvalidData(String),

    /// Attempted to add a routing predicate (`link_to`, `transform_and_link`)
    /// after the leftover predicate list was frozen by a prior
    /// `link_left_to*` call.
    #[error("cannot add a routing link after leftovers have been wired")]
    RoutingFrozen,

    /// More than one `link_left_to*` call was made on the same node.
    #[error("a leftover sink is already installed")]
    LeftoverAlreadyInstalled,

    /// The bulk sink's transactional write failed; the batch that was being
    /// written is rolled back and the sink is terminal. No retry is
    /// attempted at this layer (spec.md §4.4, §7).
    #[error("bulk write of {rows} row(s) to '{table}' failed: {source}")]
    BulkWriteFailed {
        table: String,
        rows: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Aggregate error resolved on a node's `Completion` future. Wraps
    /// exactly one inner error, normalised where it crossed a node
    /// boundary (see the module docs).
    #[error("{context}: {source}")]
    Aggregate {
        context: String,
        #[source]
        source: Box<GraphError>,
    },

    /// An I/O failure while the bulk sink opened a connection to the
    /// target store.
    #[error("connection to the bulk target failed: {0}")]
    Io(#[from] std::io::Error),

    /// Wraps an error shared across every waiter on a [`crate::completion::Completion`].
    /// `GraphError` itself is not `Clone` (terminal-sink errors box a
    /// trait object), so a completion broadcasts one `Arc<GraphError>` to
    /// all observers instead of cloning the error per-waiter.
    #[error("{0}")]
    Propagated(std::sync::Arc<GraphError>),
}

impl GraphError {
    /// Wrap `self` as the single inner error of an aggregate, tagging it
    /// with the node whose completion resolved with it.
    pub fn aggregate(context: impl Into<String>, source: GraphError) -> Self {
        GraphError::Aggregate {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// True if this error is already a member of the propagated-fault
    /// family (spec.md §4.1 "Fault propagation" normalisation rule 1).
    pub fn is_propagated_family(&self) -> bool {
        match self {
            GraphError::SiblingUnitFailed
            | GraphError::SiblingUnitCanceled
            | GraphError::LinkedDataflowFailed
            | GraphError::LinkedDataflowCanceled => true,
            GraphError::Propagated(inner) => inner.is_propagated_family(),
            _ => false,
        }
    }

    /// True if this error (or the cause it wraps) represents a cancellation
    /// rather than an outright failure.
    pub fn is_cancellation(&self) -> bool {
        match self {
            GraphError::SiblingUnitCanceled | GraphError::LinkedDataflowCanceled => true,
            GraphError::Aggregate { source, .. } => source.is_cancellation(),
            GraphError::Propagated(inner) => inner.is_cancellation(),
            _ => false,
        }
    }

    /// Normalise `self` the way [`GraphNode::fault`](crate::node::GraphNode::fault)
    /// does before sending it to a sibling child: pass propagated-family
    /// errors through unchanged, map cancellations to
    /// `SiblingUnitCanceled`, and everything else to `SiblingUnitFailed`.
    ///
    /// Returned as a small `Copy` marker rather than a fresh `GraphError` so
    /// callers faulting several siblings in a loop don't need `GraphError`
    /// itself to be `Clone` (it isn't — terminal-sink errors box a trait
    /// object).
    pub fn sibling_fault_kind(&self) -> SiblingFault {
        match self {
            GraphError::SiblingUnitFailed => SiblingFault::Failed,
            GraphError::SiblingUnitCanceled => SiblingFault::Canceled,
            GraphError::LinkedDataflowFailed => SiblingFault::LinkedFailed,
            GraphError::LinkedDataflowCanceled => SiblingFault::LinkedCanceled,
            GraphError::Propagated(inner) => inner.sibling_fault_kind(),
            GraphError::Aggregate { source, .. } => source.sibling_fault_kind(),
            other if other.is_cancellation() => SiblingFault::Canceled,
            _ => SiblingFault::Failed,
        }
    }
}

/// The four normalised, payload-free variants a node may send to a still
/// running sibling when one of its siblings faults (spec.md §4.1 "Fault
/// propagation").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiblingFault {
    Failed,
    Canceled,
    LinkedFailed,
    LinkedCanceled,
}

impl From<SiblingFault> for GraphError {
    fn from(kind: SiblingFault) -> Self {
        match kind {
            SiblingFault::Failed => GraphError::SiblingUnitFailed,
            SiblingFault::Canceled => GraphError::SiblingUnitCanceled,
            SiblingFault::LinkedFailed => GraphError::LinkedDataflowFailed,
            SiblingFault::LinkedCanceled => GraphError::LinkedDataflowCanceled,
        }
    }
}

/// Resolution state of a completion future, mirroring the primitive stage's
/// three-way completion (success / fail / cancelled) referenced in
/// spec.md §2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed,
    Canceled,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Failed => write!(f, "failed"),
            Outcome::Canceled => write!(f, "canceled"),
        }
    }
}
