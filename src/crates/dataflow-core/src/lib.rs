//! # dataflow-core
//!
//! Composable, hierarchical dataflow graphs: a graph node owns children
//! (primitive blocks or nested graphs), waits for all of them, and
//! propagates failure and cancellation between siblings the same way a
//! TPL Dataflow-style pipeline does.
//!
//! ## Core concepts
//!
//! - [`GraphNode`] — the base layer. Children, parents, external
//!   dependencies, post-completion tasks, cancellation handles, and a
//!   lazily-started completion aggregator. See `node` for the full
//!   lifecycle.
//! - [`Completion`] — a one-shot, multi-observer future resolving to
//!   success, failure, or cancellation exactly once.
//! - [`TypedInputGraphNode`] — a node with a single typed input endpoint,
//!   built by wrapping a [`GraphNode`] (Rust has no class inheritance, so
//!   this is composition, not subclassing).
//! - [`TypedInputOutputGraphNode`] — adds a typed output endpoint with
//!   ordered, predicate-based routing to downstream nodes.
//! - [`BatchedBulkSink`] — a typed-input node specialised into a
//!   batcher/executor pipeline for bulk-writing batches to an external
//!   store, with a flush timer and no-retry failure semantics.
//!
//! ## Errors and logging
//!
//! Every fallible operation returns [`GraphError`] via the crate-wide
//! [`Result`] alias. Nodes and blocks emit `tracing` spans and events
//! (`tracing::info!`/`warn!`/`error!`) for completion, faults, and
//! monitor-loop buffer statuses; attach a subscriber (e.g.
//! `tracing-subscriber`) to observe them.
//!
//! ## Concurrency primitives
//!
//! Built directly on `tokio`: `tokio::sync::watch` for completion
//! broadcast, `tokio::sync::mpsc` for bounded block queues, and
//! `tokio::spawn` for the aggregator, monitor, and flush-timer background
//! tasks.

pub mod block;
pub mod bulk_sink;
pub mod cancellation;
pub mod completion;
pub mod dependency;
pub mod error;
pub mod input_node;
pub mod name;
pub mod node;
pub mod options;
pub mod output_node;
pub mod stats;

pub use block::{Block, BlockHandle, BlockSender};
pub use bulk_sink::{BatchedBulkSink, BulkWriter, NullFieldViolation, PostInsertHook};
pub use cancellation::CancellationSource;
pub use completion::{Completion, CompletionSignal};
pub use dependency::{Dependency, DependencyEntry, DependencyKind};
pub use error::{GraphError, Outcome, Result, SiblingFault};
pub use input_node::TypedInputGraphNode;
pub use node::GraphNode;
pub use options::{MonitorMode, Options, TargetTable, UNBOUNDED};
pub use output_node::{DowncastTo, Predicate, TypedInputOutputGraphNode};
pub use stats::{BufferStatus, GarbageRecorder};
