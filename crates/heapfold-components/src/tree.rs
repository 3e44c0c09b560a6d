//! Component tree construction and size roll-up.

use std::collections::HashMap;

use heapfold_fold::{NodeId, ObjectGraph};
use indexmap::IndexSet;
use itertools::Itertools;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::DfsPostOrder;
use tracing::{debug, debug_span};

/// A class name is nested in the prefix before its last separator.
const SEPARATORS: [char; 3] = ['$', '.', '['];

/// One class-name prefix, e.g. `com`, `com.x`, `com.x.Foo` or
/// `com.x.Foo$Bar`.
#[derive(Debug, Clone)]
pub struct ComponentNode {
    name: String,
    objects: IndexSet<NodeId>,
    retains: IndexSet<NodeId>,
    unique: IndexSet<NodeId>,
    is_class: bool,
    /// Sizes of `objects` alone; the totals below add the children.
    own_self_size: u64,
    own_soft_size: f64,
    self_size: u64,
    soft_size: f64,
    ret_size: u64,
    all_size: u64,
}

impl ComponentNode {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            objects: IndexSet::new(),
            retains: IndexSet::new(),
            unique: IndexSet::new(),
            is_class: false,
            own_self_size: 0,
            own_soft_size: 0.0,
            self_size: 0,
            soft_size: 0.0,
            ret_size: 0,
            all_size: 0,
        }
    }

    /// Fully qualified prefix. Empty for the root.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Survivors whose type name is exactly [`name`](Self::name).
    pub fn objects(&self) -> &IndexSet<NodeId> {
        &self.objects
    }

    /// Folded objects retained by this component's objects or by any
    /// component below it.
    pub fn retains(&self) -> &IndexSet<NodeId> {
        &self.retains
    }

    /// The retained objects whose every retainer lives under this
    /// component.
    pub fn unique(&self) -> &IndexSet<NodeId> {
        &self.unique
    }

    /// True when at least one survivor has exactly this type.
    pub fn is_class(&self) -> bool {
        self.is_class
    }

    pub fn self_size(&self) -> u64 {
        self.self_size
    }

    pub fn soft_size(&self) -> f64 {
        self.soft_size
    }

    pub fn ret_size(&self) -> u64 {
        self.ret_size
    }

    pub fn all_size(&self) -> u64 {
        self.all_size
    }
}

/// Survivors grouped by class name, nested on `.`, `$` and `[`.
///
/// Built with [`ComponentTree::build`]. The tree is a petgraph `DiGraph`
/// with edges from each prefix to the components directly below it.
#[derive(Debug, Clone)]
pub struct ComponentTree {
    tree: DiGraph<ComponentNode, ()>,
    by_name: HashMap<String, NodeIndex>,
    root: NodeIndex,
}

impl ComponentTree {
    /// Groups the survivors of a folded graph and computes every
    /// component's sizes.
    ///
    /// The graph must have been through [`heapfold_fold::aggregate`] so
    /// that `retained_by` is filled.
    pub fn build(graph: &ObjectGraph, survivors: &[NodeId]) -> Self {
        let _span =
            debug_span!("build_components", survivors = survivors.len()).entered();

        let mut tree = Self::new();
        for &id in survivors {
            tree.add_object(graph, id);
        }
        tree.recalc_sizes(graph);

        debug!(components = tree.len(), "Built component tree");
        tree
    }

    fn new() -> Self {
        let mut tree = DiGraph::new();
        let root = tree.add_node(ComponentNode::new(""));
        Self {
            tree,
            by_name: HashMap::from([(String::new(), root)]),
            root,
        }
    }

    fn component(&mut self, name: &str) -> NodeIndex {
        if let Some(&index) = self.by_name.get(name) {
            return index;
        }
        let index = self.tree.add_node(ComponentNode::new(name));
        self.by_name.insert(name.to_owned(), index);
        index
    }

    /// Files a survivor under its type and links every prefix of the type
    /// up to the root.
    ///
    /// Each link unions the child's retains into the parent, so the whole
    /// chain sees the new object's retains. Adding the same survivor twice
    /// only refreshes the retains.
    pub fn add_object(&mut self, graph: &ObjectGraph, id: NodeId) {
        let name = graph.type_name(id);
        let node = graph.node(id);

        let mut child = self.component(name);
        let component = &mut self.tree[child];
        if component.objects.insert(id) {
            component.own_soft_size += node.size();
            component.own_self_size += node.self_size();
        }
        component.retains.extend(node.retains().keys().copied());
        component.is_class = true;

        let mut prefix = name;
        while let Some(cut) = prefix.rfind(SEPARATORS).filter(|&cut| cut > 0) {
            prefix = &prefix[..cut];
            let parent = self.component(prefix);
            self.add_child(parent, child);
            child = parent;
        }
        self.add_child(self.root, child);
    }

    fn add_child(&mut self, parent: NodeIndex, child: NodeIndex) {
        self.tree.update_edge(parent, child, ());
        let (parent, child) = self.tree.index_twice_mut(parent, child);
        parent.retains.extend(child.retains.iter().copied());
    }

    /// Recomputes every component's sizes bottom-up.
    ///
    /// A component's self and soft sizes include its children. Its
    /// retained size counts the objects it retains uniquely, its total
    /// size every object it retains. Running it again gives the same
    /// result.
    pub fn recalc_sizes(&mut self, graph: &ObjectGraph) {
        let mut dfs = DfsPostOrder::new(&self.tree, self.root);
        while let Some(index) = dfs.next(&self.tree) {
            let (children_soft, children_self) = self
                .tree
                .neighbors_directed(index, Direction::Outgoing)
                .fold((0.0, 0), |(soft, size), child| {
                    let child = &self.tree[child];
                    (soft + child.soft_size, size + child.self_size)
                });

            let component = &mut self.tree[index];
            let name = component.name.as_str();
            let unique: IndexSet<NodeId> = component
                .retains
                .iter()
                .copied()
                .filter(|&retained| {
                    graph
                        .node(retained)
                        .retained_by()
                        .iter()
                        .all(|&holder| graph.type_name(holder).starts_with(name))
                })
                .collect();

            let self_size = component.own_self_size + children_self;
            let retained_size: u64 = component
                .retains
                .iter()
                .map(|&retained| graph.node(retained).self_size())
                .sum();
            let unique_size: u64 = unique
                .iter()
                .map(|&retained| graph.node(retained).self_size())
                .sum();

            component.unique = unique;
            component.self_size = self_size;
            component.soft_size = component.own_soft_size + children_soft;
            component.ret_size = unique_size + self_size;
            component.all_size = retained_size + self_size;
        }
    }

    /// The synthetic root component, named `""`.
    pub fn root(&self) -> &ComponentNode {
        &self.tree[self.root]
    }

    pub fn get(&self, name: &str) -> Option<&ComponentNode> {
        self.by_name.get(name).map(|&index| &self.tree[index])
    }

    /// Number of components, including the root.
    pub fn len(&self) -> usize {
        self.tree.node_count()
    }

    /// True when no survivor was added.
    pub fn is_empty(&self) -> bool {
        self.len() == 1
    }

    /// Components directly below `name`, largest soft size first.
    pub fn children(&self, name: &str) -> Vec<&ComponentNode> {
        self.by_name
            .get(name)
            .map(|&index| {
                self.sorted_children(index)
                    .into_iter()
                    .map(|child| &self.tree[child])
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn root_index(&self) -> NodeIndex {
        self.root
    }

    pub(crate) fn node(&self, index: NodeIndex) -> &ComponentNode {
        &self.tree[index]
    }

    /// Children ordered by soft size descending, ties by name.
    pub(crate) fn sorted_children(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.tree
            .neighbors_directed(index, Direction::Outgoing)
            .sorted_by(|&a, &b| {
                let (a, b) = (&self.tree[a], &self.tree[b]);
                b.soft_size
                    .total_cmp(&a.soft_size)
                    .then_with(|| a.name.cmp(&b.name))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use heapfold_fold::{WorkingSet, aggregate};
    use heapfold_snapshot::ObjectId;

    use super::*;
    use crate::testutil::sample;

    fn names(nodes: &[&ComponentNode]) -> Vec<String> {
        nodes.iter().map(|node| node.name().to_owned()).collect()
    }

    #[test]
    fn test_prefix_hierarchy() {
        let (graph, survivors) = sample();
        let tree = ComponentTree::build(&graph, &survivors);

        // Root, com, com.x, com.x.Foo, com.x.Foo$Bar, org, org.y, org.y.Baz.
        assert_eq!(tree.len(), 8);
        assert_eq!(names(&tree.children("")), ["com", "org"]);
        assert_eq!(names(&tree.children("com.x.Foo")), ["com.x.Foo$Bar"]);
        assert!(tree.get("com.x.Foo").unwrap().is_class());
        assert!(!tree.get("com.x").unwrap().is_class());
        assert!(tree.children("missing").is_empty());
    }

    /// Unique retention only counts objects whose every retainer sits
    /// under the component.
    #[test]
    fn test_sizes() {
        let (graph, survivors) = sample();
        let tree = ComponentTree::build(&graph, &survivors);

        let bar = tree.get("com.x.Foo$Bar").unwrap();
        assert_eq!((bar.self_size(), bar.all_size(), bar.ret_size()), (6, 12, 8));
        assert_eq!(bar.unique().len(), 1);

        let foo = tree.get("com.x.Foo").unwrap();
        assert_eq!(foo.retains().len(), 3);
        assert_eq!((foo.self_size(), foo.all_size(), foo.ret_size()), (16, 27, 22));
        assert!((foo.soft_size() - 16.0).abs() < 1e-9);

        let baz = tree.get("org.y.Baz").unwrap();
        assert_eq!((baz.all_size(), baz.ret_size()), (13, 8));
        assert!(baz.unique().is_empty());

        let root = tree.root();
        assert_eq!((root.self_size(), root.all_size(), root.ret_size()), (24, 35, 35));
        assert_eq!(root.unique().len(), 3);
    }

    #[test]
    fn test_recalc_is_idempotent() {
        let (graph, survivors) = sample();
        let mut tree = ComponentTree::build(&graph, &survivors);

        tree.recalc_sizes(&graph);

        assert_eq!(tree.root().all_size(), 35);
        assert_eq!(tree.get("com").unwrap().ret_size(), 22);
    }

    /// Array types nest under their element type; names without a
    /// separator hang off the root.
    #[test]
    fn test_array_and_bare_names() {
        let mut graph = ObjectGraph::new();
        let bytes = graph.add_node(ObjectId(1), "byte[]", 16);
        let bare = graph.add_node(ObjectId(2), "Main", 4);
        let working: WorkingSet = [bytes, bare].into_iter().collect();
        let survivors = aggregate(&mut graph, &working);

        let tree = ComponentTree::build(&graph, &survivors);

        assert_eq!(names(&tree.children("")), ["byte", "Main"]);
        assert_eq!(names(&tree.children("byte")), ["byte[]"]);
        assert_eq!(tree.get("byte").unwrap().self_size(), 16);
    }

    #[test]
    fn test_empty() {
        let tree = ComponentTree::build(&ObjectGraph::new(), &[]);
        assert!(tree.is_empty());
        assert_eq!(tree.root().all_size(), 0);
    }
}
