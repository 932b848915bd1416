//! Cancellation handles tripped when a node faults (spec.md §3
//! "Cancellation handles", §5 "Cancellation semantics").
//!
//! A [`CancellationSource`] is a simple level-triggered flag: once
//! [`trip`](CancellationSource::trip) is called it stays tripped, and any
//! `pull_from` loop holding a clone observes it at its next between-items
//! check point (spec.md §5: "Individual primitive workers do not honour
//! cancellation mid-item; they honour it by observing the input endpoint
//! closing").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Inner {
    tripped: AtomicBool,
}

/// Cloneable cancellation flag. Registered with a [`crate::node::GraphNode`]
/// via `register_cancellation_token_source` and tripped when that node's
/// aggregator observes a failure.
#[derive(Clone, Default)]
pub struct CancellationSource {
    inner: Arc<Inner>,
}

impl CancellationSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the flag. Idempotent.
    pub fn trip(&self) {
        self.inner.tripped.store(true, Ordering::Release);
    }

    pub fn is_tripped(&self) -> bool {
        self.inner.tripped.load(Ordering::Acquire)
    }
}
