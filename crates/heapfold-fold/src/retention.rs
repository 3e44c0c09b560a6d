//! Retention bookkeeping after folding.
//!
//! A folded object can end up in the `retains` of several survivors: a
//! soft leaf is retained by every parent it was split between. Only objects
//! retained by exactly one survivor count towards that survivor's retained
//! size.

use std::collections::HashMap;

use indexmap::IndexSet;
use tracing::debug;

use crate::graph::{NodeId, ObjectGraph, WorkingSet};

/// Fills `retained_by`, `unique`, `ret_size` and `all_size` and returns
/// the survivors sorted by weighted size, largest first.
///
/// Ties keep arena order. Running it twice gives the same result.
///
/// Why: equal sizes are common (many instances of one class), and arena
/// order is discovery order from the loader, so reports list tied objects
/// the same way on every run over the same dump.
pub fn aggregate(graph: &mut ObjectGraph, working: &WorkingSet) -> Vec<NodeId> {
    let mut survivors: Vec<NodeId> = working.iter().copied().collect();
    survivors.sort_by(|&a, &b| {
        graph
            .node(b)
            .size()
            .total_cmp(&graph.node(a).size())
            .then(a.cmp(&b))
    });

    let mut ret_count: HashMap<NodeId, usize> = HashMap::new();
    for &survivor in &survivors {
        let retained: Vec<NodeId> =
            graph.node(survivor).retains().keys().copied().collect();
        let mut all_size = graph.node(survivor).self_size();
        for id in retained {
            *ret_count.entry(id).or_default() += 1;
            let node = graph.node_mut(id);
            node.retained_by.insert(survivor);
            all_size += node.self_size;
        }
        graph.node_mut(survivor).all_size = all_size;
    }

    let mut shared = 0usize;
    for &survivor in &survivors {
        let node = graph.node(survivor);
        let unique: IndexSet<NodeId> = node
            .retains()
            .keys()
            .copied()
            .filter(|id| ret_count.get(id) == Some(&1))
            .collect();
        shared += node.retains().len() - unique.len();
        let ret_size = node.self_size()
            + unique
                .iter()
                .map(|&id| graph.node(id).ret_size())
                .sum::<u64>();

        let node = graph.node_mut(survivor);
        node.ret_size = ret_size;
        node.unique = unique;
    }

    debug!(
        survivors = survivors.len(),
        retained = ret_count.len(),
        shared,
        "Aggregated retention"
    );
    survivors
}
