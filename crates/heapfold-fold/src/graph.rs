//! Arena-backed object graph and the primitives that rewrite it.
//!
//! Every [`ObjectNode`] lives in an [`ObjectGraph`] arena and is addressed
//! by a [`NodeId`]. Nodes are never freed during a run: folding a node only
//! removes it from the working set, so every `retains` entry stays
//! resolvable for the report.
//!
//! All edge maps are insertion-ordered. Together with a deterministic
//! loader this makes every fold, and therefore every label path, a pure
//! function of the snapshot.

use std::fmt;

use heapfold_snapshot::ObjectId;
use indexmap::{IndexMap, IndexSet};

/// Handle of a node in an [`ObjectGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    #[expect(
        clippy::cast_possible_truncation,
        reason = "node count is bounded by the object count of a dump, far below 2^32"
    )]
    fn from_index(index: usize) -> Self {
        NodeId(index as u32)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Interned type name. Equal handles mean equal names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);

/// The set of nodes still taking part in folding.
pub type WorkingSet = IndexSet<NodeId>;

/// One object of the heap, or several objects merged into one.
#[derive(Debug, Clone)]
pub struct ObjectNode {
    pub(crate) object: Option<ObjectId>,
    pub(crate) type_id: TypeId,
    pub(crate) self_size: u64,
    pub(crate) size: f64,
    pub(crate) out_refs: IndexMap<NodeId, String>,
    pub(crate) in_refs: IndexSet<NodeId>,
    pub(crate) retains: IndexMap<NodeId, String>,
    pub(crate) folder: Option<NodeId>,
    pub(crate) retained_by: IndexSet<NodeId>,
    pub(crate) unique: IndexSet<NodeId>,
    pub(crate) ret_size: u64,
    pub(crate) all_size: u64,
}

impl ObjectNode {
    fn new(object: Option<ObjectId>, type_id: TypeId, self_size: u64) -> Self {
        Self {
            object,
            type_id,
            self_size,
            size: weight(self_size),
            out_refs: IndexMap::new(),
            in_refs: IndexSet::new(),
            retains: IndexMap::new(),
            folder: None,
            retained_by: IndexSet::new(),
            unique: IndexSet::new(),
            ret_size: self_size,
            all_size: self_size,
        }
    }

    /// Snapshot object this node was created from; `None` for the root.
    ///
    /// After a merge this is still the first constituent's object.
    pub fn object(&self) -> Option<ObjectId> {
        self.object
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Bytes of the prototype object alone.
    pub fn self_size(&self) -> u64 {
        self.self_size
    }

    /// Weighted size including everything folded into this node.
    pub fn size(&self) -> f64 {
        self.size
    }

    /// Outbound edges with the label of the first edge discovered.
    pub fn out_refs(&self) -> &IndexMap<NodeId, String> {
        &self.out_refs
    }

    pub fn in_refs(&self) -> &IndexSet<NodeId> {
        &self.in_refs
    }

    /// Absorbed nodes with the label path leading to each.
    pub fn retains(&self) -> &IndexMap<NodeId, String> {
        &self.retains
    }

    /// The single parent that absorbed this node as a hard leaf.
    pub fn folder(&self) -> Option<NodeId> {
        self.folder
    }

    /// Survivors listing this node in their `retains`.
    pub fn retained_by(&self) -> &IndexSet<NodeId> {
        &self.retained_by
    }

    /// Retained nodes that no other survivor retains.
    pub fn unique(&self) -> &IndexSet<NodeId> {
        &self.unique
    }

    /// Own size plus the retained size of every uniquely retained node.
    pub fn ret_size(&self) -> u64 {
        self.ret_size
    }

    /// Own size plus the size of every retained node, shared or not.
    pub fn all_size(&self) -> u64 {
        self.all_size
    }
}

/// Converts a byte count to a weighted size.
#[expect(
    clippy::cast_precision_loss,
    reason = "heap sizes stay far below 2^53 bytes"
)]
pub(crate) fn weight(bytes: u64) -> f64 {
    bytes as f64
}

/// Joins two label path segments. Array slots attach without a dot.
///
/// ```
/// use heapfold_fold::combine;
///
/// assert_eq!(combine("mItems", "[3]"), "mItems[3]");
/// assert_eq!(combine("mItems[3]", "value"), "mItems[3].value");
/// ```
pub fn combine(parent: &str, child: &str) -> String {
    if child.starts_with('[') {
        format!("{parent}{child}")
    } else {
        format!("{parent}.{child}")
    }
}

const ROOT_TYPE: &str = "<root>";

/// Arena of object nodes plus the interned type names they refer to.
///
/// Slot 0 is the synthetic root. It hosts the instances of the root class
/// as children, is never part of a [`WorkingSet`] and never absorbs
/// anything.
#[derive(Debug, Clone)]
pub struct ObjectGraph {
    nodes: Vec<ObjectNode>,
    types: IndexSet<String>,
}

impl Default for ObjectGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectGraph {
    /// Handle of the synthetic root node.
    pub const ROOT: NodeId = NodeId(0);

    /// Creates a graph holding only the root.
    pub fn new() -> Self {
        let mut types = IndexSet::new();
        types.insert(ROOT_TYPE.to_owned());
        Self {
            nodes: vec![ObjectNode::new(None, TypeId(0), 0)],
            types,
        }
    }

    /// Allocates a node for a snapshot object.
    pub fn add_node(
        &mut self,
        object: ObjectId,
        type_name: &str,
        self_size: u64,
    ) -> NodeId {
        let type_id = self.intern(type_name);
        let id = NodeId::from_index(self.nodes.len());
        self.nodes
            .push(ObjectNode::new(Some(object), type_id, self_size));
        id
    }

    #[expect(
        clippy::cast_possible_truncation,
        reason = "distinct class names in a dump are far below 2^32"
    )]
    fn intern(&mut self, name: &str) -> TypeId {
        let index = match self.types.get_index_of(name) {
            Some(index) => index,
            None => self.types.insert_full(name.to_owned()).0,
        };
        TypeId(index as u32)
    }

    pub fn node(&self, id: NodeId) -> &ObjectNode {
        &self.nodes[id.index()]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut ObjectNode {
        &mut self.nodes[id.index()]
    }

    /// Type name of a node.
    pub fn type_name(&self, id: NodeId) -> &str {
        self.name_of(self.node(id).type_id)
    }

    /// Resolves an interned type handle.
    pub fn name_of(&self, type_id: TypeId) -> &str {
        self.types
            .get_index(type_id.0 as usize)
            .map_or("", String::as_str)
    }

    /// Looks up the handle of a type name, if any node has that type.
    pub fn type_id(&self, name: &str) -> Option<TypeId> {
        self.types
            .get_index_of(name)
            .and_then(|index| u32::try_from(index).ok())
            .map(TypeId)
    }

    /// Number of nodes, the root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the graph holds only the root.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Number of edges currently wired.
    pub fn edge_count(&self) -> usize {
        self.nodes.iter().map(|node| node.out_refs.len()).sum()
    }

    /// Every node handle, root first.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(NodeId::from_index)
    }

    /// Adds the edge `parent -> child`.
    ///
    /// Self-loops are dropped. An existing edge keeps its label.
    pub fn link(&mut self, parent: NodeId, child: NodeId, label: impl Into<String>) {
        if parent == child {
            return;
        }
        self.node_mut(parent)
            .out_refs
            .entry(child)
            .or_insert_with(|| label.into());
        self.node_mut(child).in_refs.insert(parent);
    }

    /// Removes the edge `parent -> child` and returns its label.
    pub fn unlink(&mut self, parent: NodeId, child: NodeId) -> Option<String> {
        let label = self.node_mut(parent).out_refs.shift_remove(&child);
        self.node_mut(child).in_refs.swap_remove(&parent);
        label
    }

    /// Credits `node` with retaining `retained` unless it already does.
    pub fn retain(&mut self, node: NodeId, retained: NodeId, label: impl Into<String>) {
        self.node_mut(node)
            .retains
            .entry(retained)
            .or_insert_with(|| label.into());
    }

    /// Hands everything `from` retains, and `from` itself, to `into`.
    ///
    /// The labels are prefixed with `name`, the label of the edge `into`
    /// reached `from` through.
    fn absorb_retains(&mut self, into: NodeId, from: NodeId, name: &str) {
        let retains = std::mem::take(&mut self.node_mut(from).retains);
        for (retained, label) in retains {
            self.retain(into, retained, combine(name, &label));
        }
        self.retain(into, from, name);
    }

    /// Folds `child` into `parent` through the edge between them.
    ///
    /// The child's outbound edges move to the parent with their labels
    /// prefixed by the folded edge's label, the parent takes over the
    /// child's weight and retains the child. Returns the folded edge's
    /// label, or `None` if `parent` does not point at `child`.
    pub fn fold(&mut self, parent: NodeId, child: NodeId) -> Option<String> {
        let name = self.unlink(parent, child)?;

        let grandchildren = std::mem::take(&mut self.node_mut(child).out_refs);
        for (grandchild, label) in grandchildren {
            self.node_mut(grandchild).in_refs.swap_remove(&child);
            self.link(parent, grandchild, combine(&name, &label));
        }

        let size = self.node(child).size;
        self.node_mut(parent).size += size;
        self.absorb_retains(parent, child, &name);
        Some(name)
    }

    /// Drains `b` into `a`, which must point at `b`.
    ///
    /// `a` keeps its identity and self size. Edges between the two are
    /// dropped; every other edge of `b` is rewired onto `a`. A neighbor
    /// that already pointed at `a` keeps the label of that edge. Returns
    /// the label of the edge `a -> b`.
    pub fn merge(&mut self, a: NodeId, b: NodeId) -> Option<String> {
        if a == b {
            return None;
        }
        let name = self.unlink(a, b)?;
        self.unlink(b, a);

        let parents = std::mem::take(&mut self.node_mut(b).in_refs);
        for parent in parents {
            if let Some(label) = self.node_mut(parent).out_refs.shift_remove(&b) {
                self.link(parent, a, label);
            }
        }

        let children = std::mem::take(&mut self.node_mut(b).out_refs);
        for (child, label) in children {
            self.node_mut(child).in_refs.swap_remove(&b);
            self.link(a, child, combine(&name, &label));
        }

        let size = self.node(b).size;
        self.node_mut(a).size += size;
        self.absorb_retains(a, b, &name);
        Some(name)
    }

    /// Summed weighted size of a working set.
    pub fn total_size(&self, working: &WorkingSet) -> f64 {
        working.iter().map(|&id| self.node(id).size).sum()
    }

    /// Verifies the structural invariants against a working set.
    ///
    /// Checked: edges are mirrored in both directions, there are no
    /// self-loops, nodes outside the working set carry no edges, edges
    /// never leave the working set (other than from the root), and no
    /// survivor retains a node that is still in the working set.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violation found.
    pub fn check_invariants(&self, working: &WorkingSet) -> Result<(), String> {
        if working.contains(&Self::ROOT) {
            return Err("root is in the working set".to_owned());
        }
        if !self.node(Self::ROOT).in_refs.is_empty() {
            return Err("root has inbound edges".to_owned());
        }

        for id in self.node_ids() {
            let node = self.node(id);
            let live = id == Self::ROOT || working.contains(&id);
            if !live && !(node.out_refs.is_empty() && node.in_refs.is_empty()) {
                return Err(format!("removed node {id} still has edges"));
            }

            for &child in node.out_refs.keys() {
                if child == id {
                    return Err(format!("self-loop on {id}"));
                }
                if !working.contains(&child) {
                    return Err(format!("{id} points outside the graph at {child}"));
                }
                if !self.node(child).in_refs.contains(&id) {
                    return Err(format!("edge {id} -> {child} is not mirrored"));
                }
            }
            for &parent in &node.in_refs {
                if !self.node(parent).out_refs.contains_key(&id) {
                    return Err(format!("inbound {parent} -> {id} is not mirrored"));
                }
            }
        }

        for &id in working {
            for &retained in self.node(id).retains.keys() {
                if retained == Self::ROOT || working.contains(&retained) {
                    return Err(format!("{id} retains live node {retained}"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a graph with one node per `(type, self size)` pair, every
    /// node hanging off the root.
    fn graph_of(nodes: &[(&str, u64)]) -> (ObjectGraph, Vec<NodeId>) {
        let mut graph = ObjectGraph::new();
        let ids: Vec<NodeId> = nodes
            .iter()
            .zip(1u64..)
            .map(|(&(ty, size), object)| graph.add_node(ObjectId(object), ty, size))
            .collect();
        (graph, ids)
    }

    fn working(ids: &[NodeId]) -> WorkingSet {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_combine() {
        assert_eq!(combine("a", "b"), "a.b");
        assert_eq!(combine("a", "[0]"), "a[0]");
        assert_eq!(combine("table[2]", "[7]"), "table[2][7]");
    }

    #[test]
    fn test_interning_shares_type_ids() {
        let (graph, ids) = graph_of(&[("A", 1), ("B", 1), ("A", 1)]);
        assert_eq!(graph.node(ids[0]).type_id(), graph.node(ids[2]).type_id());
        assert_ne!(graph.node(ids[0]).type_id(), graph.node(ids[1]).type_id());
        assert_eq!(graph.type_name(ids[1]), "B");
        assert_eq!(graph.type_id("A"), Some(graph.node(ids[0]).type_id()));
        assert_eq!(graph.type_id("missing"), None);
    }

    #[test]
    fn test_link_first_label_wins() {
        let (mut graph, ids) = graph_of(&[("A", 1), ("B", 1)]);
        graph.link(ids[0], ids[1], "first");
        graph.link(ids[0], ids[1], "second");

        assert_eq!(graph.node(ids[0]).out_refs()[&ids[1]], "first");
        assert_eq!(graph.node(ids[1]).in_refs().len(), 1);
    }

    #[test]
    fn test_link_ignores_self_loops() {
        let (mut graph, ids) = graph_of(&[("A", 1)]);
        graph.link(ids[0], ids[0], "me");

        assert!(graph.node(ids[0]).out_refs().is_empty());
        assert!(graph.node(ids[0]).in_refs().is_empty());
    }

    #[test]
    fn test_unlink_returns_label() {
        let (mut graph, ids) = graph_of(&[("A", 1), ("B", 1)]);
        graph.link(ids[0], ids[1], "x");

        assert_eq!(graph.unlink(ids[0], ids[1]).as_deref(), Some("x"));
        assert_eq!(graph.unlink(ids[0], ids[1]), None);
        assert!(graph.node(ids[1]).in_refs().is_empty());
    }

    #[test]
    fn test_retain_keeps_first_label() {
        let (mut graph, ids) = graph_of(&[("A", 1), ("B", 1)]);
        graph.retain(ids[0], ids[1], "short");
        graph.retain(ids[0], ids[1], "much.longer");
        assert_eq!(graph.node(ids[0]).retains()[&ids[1]], "short");
    }

    /// Folding moves the child's edges and retains onto the parent with
    /// label paths that start at the parent.
    #[test]
    fn test_fold_rewires_and_prefixes() {
        let (mut graph, ids) =
            graph_of(&[("P", 10), ("C", 4), ("G", 2), ("R", 1)]);
        let [p, c, g, r] = [ids[0], ids[1], ids[2], ids[3]];
        graph.link(ObjectGraph::ROOT, p, "#");
        graph.link(p, c, "mChild");
        graph.link(c, g, "[0]");
        graph.retain(c, r, "mOld");

        assert_eq!(graph.fold(p, c).as_deref(), Some("mChild"));

        let parent = graph.node(p);
        assert_eq!(parent.out_refs()[&g], "mChild[0]");
        assert!((parent.size() - 14.0).abs() < f64::EPSILON);
        assert_eq!(parent.retains()[&c], "mChild");
        assert_eq!(parent.retains()[&r], "mChild.mOld");
        assert!(graph.node(g).in_refs().contains(&p));
        assert!(!graph.node(g).in_refs().contains(&c));
        graph.check_invariants(&working(&[p, g])).unwrap();
    }

    /// A grandchild pointing back at the parent does not become a
    /// self-loop.
    #[test]
    fn test_fold_drops_back_edge() {
        let (mut graph, ids) = graph_of(&[("P", 1), ("C", 1)]);
        let [p, c] = [ids[0], ids[1]];
        graph.link(ObjectGraph::ROOT, p, "#");
        graph.link(p, c, "down");
        graph.link(c, p, "up");

        graph.fold(p, c);
        assert!(graph.node(p).out_refs().is_empty());
        assert_eq!(graph.node(p).in_refs().len(), 1);
        graph.check_invariants(&working(&[p])).unwrap();
    }

    #[test]
    fn test_fold_without_edge_is_noop() {
        let (mut graph, ids) = graph_of(&[("P", 1), ("C", 1)]);
        assert_eq!(graph.fold(ids[0], ids[1]), None);
        assert!(graph.node(ids[0]).retains().is_empty());
    }

    /// Merging keeps `a`'s identity, drops internal edges and keeps the
    /// label of an inbound edge that already pointed at `a`.
    #[test]
    fn test_merge_in_place() {
        let (mut graph, ids) =
            graph_of(&[("N", 8), ("N", 8), ("X", 1), ("Y", 1), ("Z", 1)]);
        let [a, b, x, y, z] = [ids[0], ids[1], ids[2], ids[3], ids[4]];
        graph.link(ObjectGraph::ROOT, a, "#");
        graph.link(ObjectGraph::ROOT, x, "#");
        graph.link(a, b, "next");
        graph.link(b, a, "prev");
        graph.link(x, a, "toA");
        graph.link(x, b, "toB");
        graph.link(y, b, "fromY");
        graph.link(ObjectGraph::ROOT, y, "#");
        graph.link(b, z, "value");

        assert_eq!(graph.merge(a, b).as_deref(), Some("next"));

        let merged = graph.node(a);
        assert_eq!(merged.object(), Some(ObjectId(1)));
        assert_eq!(merged.self_size(), 8);
        assert!((merged.size() - 16.0).abs() < f64::EPSILON);
        assert_eq!(merged.retains()[&b], "next");
        assert_eq!(merged.out_refs()[&z], "next.value");
        assert!(!merged.out_refs().contains_key(&b));
        assert!(!merged.in_refs().contains(&b));
        assert_eq!(graph.node(x).out_refs()[&a], "toA");
        assert_eq!(graph.node(y).out_refs()[&a], "fromY");
        graph.check_invariants(&working(&[a, x, y, z])).unwrap();
    }

    #[test]
    fn test_merge_carries_retains() {
        let (mut graph, ids) = graph_of(&[("N", 8), ("N", 8), ("R", 3)]);
        let [a, b, r] = [ids[0], ids[1], ids[2]];
        graph.link(a, b, "next");
        graph.retain(b, r, "[2]");

        graph.merge(a, b);
        assert_eq!(graph.node(a).retains()[&r], "next[2]");
        assert!(graph.node(b).retains().is_empty());
    }

    #[test]
    fn test_check_invariants_reports_violations() {
        let (mut graph, ids) = graph_of(&[("A", 1), ("B", 1)]);
        graph.link(ObjectGraph::ROOT, ids[0], "#");
        graph.link(ids[0], ids[1], "b");

        // `b` is not in the working set but `a` still points at it.
        let err = graph.check_invariants(&working(&[ids[0]])).unwrap_err();
        assert!(err.contains("outside"), "{err}");

        graph.retain(ids[0], ids[1], "b");
        let err = graph.check_invariants(&working(&ids)).unwrap_err();
        assert!(err.contains("retains live node"), "{err}");
    }
}
