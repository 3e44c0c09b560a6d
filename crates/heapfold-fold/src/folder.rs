//! The three reduction rules and the two-pass fixed point over them.
//!
//! ## Rules
//!
//! - **Leaves** (`fold_leaves`): a node without outbound edges is folded
//!   into its parents. In hard mode only single-parent leaves qualify and
//!   the parent takes the whole weight; in soft mode any leaf qualifies and
//!   the weight is split evenly.
//! - **Linked lists** (`fold_linked_lists`): a node pointing at a node of
//!   its own type absorbs it, until no such edge is left.
//! - **Helpers** (`fold_helpers`): a single-parent node whose type is an
//!   inner class, an array, the parent's own type, a multi-instance type or
//!   a runtime type is folded into its parent.
//!
//! ## Passes
//!
//! [`fold_graph`] runs a hard pass and then a soft pass. Each pass applies
//! leaves, lists and helpers in that order, and repeats while the working
//! set keeps shrinking. Every rule only ever removes nodes, so each pass
//! terminates.
//!
//! Children of the synthetic root are never folded away as leaves or
//! helpers, and the root never absorbs anything.
//!
//! Why: the root's children are the instances of the class the user asked
//! about. Folding one into the root would make it vanish from every report
//! and pile its weight onto a node that is never printed.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use tracing::{debug, debug_span};

use crate::combine;
use crate::config::AnalyzerConfig;
use crate::graph::{NodeId, ObjectGraph, TypeId, WorkingSet};

/// How leaves with several parents are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldMode {
    /// Only single-parent leaves are folded; the parent becomes their
    /// folder.
    Hard,
    /// Leaves of any multiplicity are folded, their weight split evenly.
    Soft,
}

/// Callback invoked after a leaf has been folded into one of its parents.
///
/// The graph already reflects the fold: `leaf` is in `parent`'s retains
/// under `label`.
pub trait LeafFoldHook {
    fn on_leaf_folded(
        &mut self,
        graph: &ObjectGraph,
        parent: NodeId,
        leaf: NodeId,
        label: &str,
    );
}

/// No-op hook.
impl LeafFoldHook for () {
    fn on_leaf_folded(&mut self, _: &ObjectGraph, _: NodeId, _: NodeId, _: &str) {}
}

/// Counters describing one folding run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FoldStats {
    /// Working set size before folding.
    pub initial_nodes: usize,
    /// Working set size after folding.
    pub final_nodes: usize,
    pub leaves_folded: usize,
    pub list_nodes_merged: usize,
    pub helpers_folded: usize,
    /// Rounds of the hard pass, including the final round that changed
    /// nothing.
    pub hard_iterations: usize,
    pub soft_iterations: usize,
    /// Summed weighted size before folding.
    pub initial_size: f64,
    /// Summed weighted size after folding. Equal to `initial_size` up to
    /// rounding.
    pub final_size: f64,
}

/// A hard leaf has exactly one parent; a soft leaf has at least one.
///
/// Why: the hard pass runs first so that objects owned by a single parent
/// are attributed to it whole. Splitting a shared object only makes sense
/// once no better owner can emerge.
fn is_leaf(graph: &ObjectGraph, id: NodeId, mode: FoldMode) -> bool {
    let node = graph.node(id);
    let parents = node.in_refs();
    let multiplicity = match mode {
        FoldMode::Hard => parents.len() == 1,
        FoldMode::Soft => !parents.is_empty(),
    };
    node.out_refs().is_empty()
        && multiplicity
        && !parents.contains(&ObjectGraph::ROOT)
}

/// Folds leaves into their parents until no leaf is left.
///
/// Parents that become leaves are folded in the same call. Returns the
/// number of nodes removed.
#[expect(
    clippy::cast_precision_loss,
    reason = "a node has far fewer than 2^53 parents"
)]
pub fn fold_leaves(
    graph: &mut ObjectGraph,
    working: &mut WorkingSet,
    mode: FoldMode,
    hook: &mut dyn LeafFoldHook,
) -> usize {
    let mut queue: VecDeque<NodeId> = working
        .iter()
        .copied()
        .filter(|&id| is_leaf(graph, id, mode))
        .collect();

    let mut folded = 0;
    while let Some(leaf) = queue.pop_front() {
        if !working.contains(&leaf) || !is_leaf(graph, leaf, mode) {
            continue;
        }

        let parents = std::mem::take(&mut graph.node_mut(leaf).in_refs);
        let share = graph.node(leaf).size / parents.len() as f64;
        let retains = std::mem::take(&mut graph.node_mut(leaf).retains);

        for parent in parents {
            let Some(label) =
                graph.node_mut(parent).out_refs.shift_remove(&leaf)
            else {
                continue;
            };
            graph.node_mut(parent).size += share;
            for (retained, path) in &retains {
                graph.retain(parent, *retained, combine(&label, path));
            }
            graph.retain(parent, leaf, label.as_str());

            hook.on_leaf_folded(graph, parent, leaf, &label);

            if mode == FoldMode::Hard {
                graph.node_mut(leaf).folder = Some(parent);
            }
            // The parent's own inbound edges decide whether it is a hard
            // leaf now.
            if working.contains(&parent) && is_leaf(graph, parent, mode) {
                queue.push_back(parent);
            }
        }

        working.swap_remove(&leaf);
        folded += 1;
    }

    debug!(?mode, folded, "Folded leaves");
    folded
}

/// First outbound neighbor sharing the node's type.
fn same_typed_neighbor(graph: &ObjectGraph, id: NodeId) -> Option<NodeId> {
    let type_id = graph.node(id).type_id();
    graph
        .node(id)
        .out_refs()
        .keys()
        .copied()
        .find(|&next| graph.node(next).type_id() == type_id)
}

/// Collapses chains and cycles of same-typed nodes into their first node.
///
/// A node that still has a same-typed neighbor after a merge goes back to
/// the front of the queue, so a whole list is absorbed by one node before
/// the next list starts. Returns the number of nodes removed.
pub fn fold_linked_lists(graph: &mut ObjectGraph, working: &mut WorkingSet) -> usize {
    let mut queue: VecDeque<NodeId> = working
        .iter()
        .copied()
        .filter(|&id| same_typed_neighbor(graph, id).is_some())
        .collect();

    let mut merged = 0;
    while let Some(node) = queue.pop_front() {
        if !working.contains(&node) {
            continue;
        }
        let Some(next) = same_typed_neighbor(graph, node) else {
            continue;
        };

        if graph.merge(node, next).is_some() {
            working.swap_remove(&next);
            merged += 1;
        }
        if same_typed_neighbor(graph, node).is_some() {
            queue.push_front(node);
        }
    }

    debug!(merged, "Folded linked lists");
    merged
}

/// Types with exactly one node in the working set.
///
/// These are the candidate components: a type with many instances is a
/// container or utility rather than a part of the architecture.
pub fn singleton_types(graph: &ObjectGraph, working: &WorkingSet) -> HashSet<TypeId> {
    let mut counts: HashMap<TypeId, usize> = HashMap::new();
    for &id in working {
        *counts.entry(graph.node(id).type_id()).or_default() += 1;
    }
    counts
        .into_iter()
        .filter_map(|(type_id, count)| (count == 1).then_some(type_id))
        .collect()
}

/// The only parent of a node, unless that parent is the root.
fn sole_parent(graph: &ObjectGraph, id: NodeId) -> Option<NodeId> {
    let parents = graph.node(id).in_refs();
    if parents.len() != 1 {
        return None;
    }
    parents
        .first()
        .copied()
        .filter(|&parent| parent != ObjectGraph::ROOT)
}

fn is_helper(
    graph: &ObjectGraph,
    id: NodeId,
    components: &HashSet<TypeId>,
    config: &AnalyzerConfig,
) -> bool {
    let Some(parent) = sole_parent(graph, id) else {
        return false;
    };
    let type_id = graph.node(id).type_id();
    let name = graph.name_of(type_id);

    name.contains('$')
        || name.contains("[]")
        || type_id == graph.node(parent).type_id()
        || !components.contains(&type_id)
        || config.is_infrastructure(name)
}

/// Folds helper nodes into their single owner.
///
/// Helpers are collected up front. When one is folded its children move
/// to its parent, so a queued helper is folded into whatever its single
/// parent is at that point, and skipped if it has gained parents or now
/// hangs off the root. Returns the number of nodes removed.
pub fn fold_helpers(
    graph: &mut ObjectGraph,
    working: &mut WorkingSet,
    components: &HashSet<TypeId>,
    config: &AnalyzerConfig,
) -> usize {
    let helpers: Vec<NodeId> = working
        .iter()
        .copied()
        .filter(|&id| is_helper(graph, id, components, config))
        .collect();

    let mut folded = 0;
    for helper in helpers {
        if !working.contains(&helper) {
            continue;
        }
        let Some(parent) = sole_parent(graph, helper) else {
            continue;
        };
        if graph.fold(parent, helper).is_some() {
            working.swap_remove(&helper);
            folded += 1;
        }
    }

    debug!(folded, "Folded helpers");
    folded
}

/// Runs the hard pass and then the soft pass to a fixed point.
pub fn fold_graph(
    graph: &mut ObjectGraph,
    working: &mut WorkingSet,
    config: &AnalyzerConfig,
    hook: &mut dyn LeafFoldHook,
) -> FoldStats {
    let _span = debug_span!("fold_graph").entered();

    let mut stats = FoldStats {
        initial_nodes: working.len(),
        initial_size: graph.total_size(working),
        ..FoldStats::default()
    };

    for mode in [FoldMode::Hard, FoldMode::Soft] {
        let _span = debug_span!("pass", ?mode).entered();
        let components = singleton_types(graph, working);

        let mut iterations = 0;
        loop {
            let before = working.len();
            iterations += 1;

            stats.leaves_folded += fold_leaves(graph, working, mode, hook);
            stats.list_nodes_merged += fold_linked_lists(graph, working);
            stats.helpers_folded +=
                fold_helpers(graph, working, &components, config);

            if working.len() >= before {
                break;
            }
        }

        match mode {
            FoldMode::Hard => stats.hard_iterations = iterations,
            FoldMode::Soft => stats.soft_iterations = iterations,
        }
        debug!(?mode, iterations, nodes = working.len(), "Finished pass");
    }

    stats.final_nodes = working.len();
    stats.final_size = graph.total_size(working);
    debug!(
        before = stats.initial_nodes,
        after = stats.final_nodes,
        "Folded object graph"
    );
    stats
}
