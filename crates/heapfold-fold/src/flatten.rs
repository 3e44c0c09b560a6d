//! Working set construction.

use std::collections::VecDeque;

use tracing::debug;

use crate::graph::{ObjectGraph, WorkingSet};

/// Collects every node reachable from the root, in breadth-first order.
///
/// The root itself is not part of the result.
pub fn flatten(graph: &ObjectGraph) -> WorkingSet {
    let mut working = WorkingSet::new();
    let mut queue = VecDeque::from([ObjectGraph::ROOT]);

    // The root has no inbound edges, so it is never rediscovered.
    while let Some(node) = queue.pop_front() {
        for &child in graph.node(node).out_refs().keys() {
            if working.insert(child) {
                queue.push_back(child);
            }
        }
    }

    debug!(nodes = working.len(), "Flattened object graph");
    working
}
