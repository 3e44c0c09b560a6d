//! Shared fixtures for component tests.

use heapfold_fold::{NodeId, ObjectGraph, WorkingSet, aggregate};
use heapfold_snapshot::ObjectId;

/// Survivors Foo(10), Foo$Bar(6) and Baz(8); r1 is retained by Foo and
/// Foo$Bar, r2 by Foo$Bar only, r3 by Foo and Baz.
pub fn sample() -> (ObjectGraph, Vec<NodeId>) {
    let mut graph = ObjectGraph::new();
    let foo = graph.add_node(ObjectId(1), "com.x.Foo", 10);
    let bar = graph.add_node(ObjectId(2), "com.x.Foo$Bar", 6);
    let baz = graph.add_node(ObjectId(3), "org.y.Baz", 8);
    let r1 = graph.add_node(ObjectId(4), "R1", 4);
    let r2 = graph.add_node(ObjectId(5), "R2", 2);
    let r3 = graph.add_node(ObjectId(6), "R3", 5);
    graph.retain(foo, r1, "r1");
    graph.retain(foo, r3, "r3");
    graph.retain(bar, r1, "r1");
    graph.retain(bar, r2, "r2");
    graph.retain(baz, r3, "r3");
    let working: WorkingSet = [foo, bar, baz].into_iter().collect();
    let survivors = aggregate(&mut graph, &working);
    (graph, survivors)
}
