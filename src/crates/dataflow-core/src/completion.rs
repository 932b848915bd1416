//! The one-shot, multi-observer completion future shared by primitive
//! blocks and graph nodes (spec.md §3 "Completion future", §9 "Lazy
//! completion future").
//!
//! A [`Completion`] resolves exactly once, to success, failure, or
//! cancellation; any number of observers may clone it and await the same
//! resolution. Internally this is a `tokio::sync::watch` channel carrying
//! an `Option` — `None` while pending, `Some` once resolved — which gives
//! every clone a cheap, lock-free read of the latest state the way the
//! teacher's copy-on-write snapshot fields are read by the monitor loop
//! and the aggregator concurrently.

use crate::error::{GraphError, Outcome, Result};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
enum Resolution {
    Success,
    Failed(Arc<GraphError>),
    Canceled(Arc<GraphError>),
}

/// Write side of a completion future. Owned by whatever drives the unit of
/// work (a primitive block's worker, a graph node's aggregator task).
/// Cheaply `Clone`: every clone shares the same underlying slot, so any of
/// them can resolve it and the others observe a no-op on second resolution.
#[derive(Clone)]
pub struct CompletionSignal {
    tx: watch::Sender<Option<Resolution>>,
}

impl CompletionSignal {
    /// Create a fresh pending completion, returning the signal and a handle
    /// observers can clone freely.
    pub fn new() -> (Self, Completion) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, Completion { rx })
    }

    /// Resolve successfully. A second call after the first resolution is a
    /// no-op (spec.md §3: "resolves exactly once").
    pub fn succeed(&self) {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(Resolution::Success);
                true
            } else {
                false
            }
        });
    }

    /// Resolve with a failure.
    pub fn fail(&self, err: GraphError) {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(Resolution::Failed(Arc::new(err)));
                true
            } else {
                false
            }
        });
    }

    /// Resolve as canceled.
    pub fn cancel(&self, err: GraphError) {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(Resolution::Canceled(Arc::new(err)));
                true
            } else {
                false
            }
        });
    }

    /// True once this signal has been resolved (success, fail, or cancel).
    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

/// Read side of a completion future. Cheap to clone; every clone observes
/// the same eventual resolution.
#[derive(Clone)]
pub struct Completion {
    rx: watch::Receiver<Option<Resolution>>,
}

impl Completion {
    /// Await resolution, returning `Ok(())` on success or the (possibly
    /// shared) error on failure/cancellation.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.rx.clone();
        loop {
            if let Some(resolution) = rx.borrow().clone() {
                return match resolution {
                    Resolution::Success => Ok(()),
                    Resolution::Failed(e) => Err(GraphError::Propagated(e)),
                    Resolution::Canceled(e) => Err(GraphError::Propagated(e)),
                };
            }
            if rx.changed().await.is_err() {
                // Signal dropped without ever resolving: treat as a
                // cancellation rather than hanging forever.
                return Err(GraphError::SiblingUnitCanceled);
            }
        }
    }

    /// Non-blocking peek at the current state.
    pub fn outcome(&self) -> Option<Outcome> {
        self.rx.borrow().as_ref().map(|r| match r {
            Resolution::Success => Outcome::Success,
            Resolution::Failed(_) => Outcome::Failed,
            Resolution::Canceled(_) => Outcome::Canceled,
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.rx.borrow().is_some()
    }
}
