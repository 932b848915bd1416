//! Process-wide default-name assignment (spec.md §3 "Name").
//!
//! A node's default name is `<TypeTag><N>`, where `N` is a monotonically
//! increasing counter scoped to `TypeTag` and shared across the whole
//! process — mirroring the atomic-increment registry the teacher keeps for
//! its own process-wide bookkeeping (`langgraph-core::runtime`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

fn registry() -> &'static RwLock<HashMap<String, Arc<AtomicU64>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, Arc<AtomicU64>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Return the next default name for `type_tag`, e.g. `next_name("GraphNode")
/// == "GraphNode0"`, then `"GraphNode1"`, and so on.
pub fn next_name(type_tag: &str) -> String {
    let counter = {
        let read = registry().read().unwrap();
        read.get(type_tag).cloned()
    };
    let counter = counter.unwrap_or_else(|| {
        let mut write = registry().write().unwrap();
        write
            .entry(type_tag.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    });
    let n = counter.fetch_add(1, Ordering::Relaxed);
    format!("{type_tag}{n}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_increments_per_tag_independently() {
        let a0 = next_name("TestTagA");
        let a1 = next_name("TestTagA");
        let b0 = next_name("TestTagB");
        assert_ne!(a0, a1);
        assert!(a0.starts_with("TestTagA"));
        assert!(a1.starts_with("TestTagA"));
        assert!(b0.starts_with("TestTagB"));
    }
}
