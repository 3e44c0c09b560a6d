//! Shared proptest strategies for folding tests.

use heapfold_snapshot::ObjectId;
use proptest::prelude::*;

use crate::graph::{NodeId, ObjectGraph};
use crate::loader::ROOT_LABEL;

/// Type names covering every helper criterion: inner classes, arrays,
/// runtime types and plain application classes.
const TYPES: &[&str] = &[
    "com.example.App",
    "com.example.Cache",
    "com.example.Cache$Entry",
    "com.example.Node",
    "java.util.HashMap",
    "android.os.Bundle",
    "byte[]",
];

fn label(index: usize) -> String {
    if index == 0 {
        "[0]".to_owned()
    } else {
        format!("f{index}")
    }
}

/// Strategy for random cyclic object graphs with one to three root
/// children.
pub fn arb_graph() -> impl Strategy<Value = ObjectGraph> {
    (1usize..16)
        .prop_flat_map(|n| {
            (
                prop::collection::vec((0..TYPES.len(), 0u64..64), n),
                prop::collection::vec((0..n, 0..n, 0usize..4), 0..n * 3),
                prop::collection::vec(0..n, 1..=n.min(3)),
            )
        })
        .prop_map(|(nodes, edges, roots)| {
            let mut graph = ObjectGraph::new();
            let ids: Vec<NodeId> = nodes
                .iter()
                .zip(1u64..)
                .map(|(&(ty, size), object)| {
                    graph.add_node(ObjectId(object), TYPES[ty], size)
                })
                .collect();
            for root in roots {
                graph.link(ObjectGraph::ROOT, ids[root], ROOT_LABEL);
            }
            for (from, to, index) in edges {
                graph.link(ids[from], ids[to], label(index));
            }
            graph
        })
}
