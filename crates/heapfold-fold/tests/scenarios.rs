//! End-to-end folding scenarios: snapshot in, survivors out.

use heapfold_fold::{
    Analysis, AnalyzerConfig, BitmapCollector, NodeId, ObjectGraph, aggregate,
    analyze, flatten, fold_graph,
};
use heapfold_snapshot::{
    BasicType, FieldValue, IdSize, ObjectId, PrimitiveValue, SnapshotBuilder,
};

const APP: &str = "com.example.App";

/// Snapshot under construction. Class objects are numbered from 0x1000 so
/// they never collide with instance ids.
struct Heap {
    builder: SnapshotBuilder,
    next_class: u64,
}

impl Heap {
    fn new() -> Self {
        Self {
            builder: SnapshotBuilder::new(IdSize::Four),
            next_class: 0x1000,
        }
    }

    /// Declares a class whose fields are all references.
    fn class(&mut self, name: &str, size: u32, fields: &[&str]) -> ObjectId {
        let id = ObjectId(self.next_class);
        self.next_class += 1;
        let fields: Vec<(&str, BasicType)> =
            fields.iter().map(|&field| (field, BasicType::Object)).collect();
        self.builder
            .define_class(id, name, ObjectId::NULL, size, &fields);
        id
    }

    /// Adds an instance; `refs` follow the field order, 0 is null.
    fn object(&mut self, id: u64, class: ObjectId, refs: &[u64]) {
        let values: Vec<FieldValue> = refs
            .iter()
            .map(|&referent| FieldValue::from_id(ObjectId(referent)))
            .collect();
        self.builder.instance_values(ObjectId(id), class, &values);
    }

    fn analyze(self, root_class: &str) -> Analysis {
        let config = AnalyzerConfig {
            root_class_name: root_class.to_owned(),
            ..AnalyzerConfig::default()
        };
        analyze(&self.builder.finish(), &config, &mut ())
    }
}

fn node_of(graph: &ObjectGraph, id: u64) -> NodeId {
    graph
        .node_ids()
        .find(|&n| graph.node(n).object() == Some(ObjectId(id)))
        .unwrap()
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

/// A(10) holding three 5-byte leaves absorbs all of them.
#[test]
fn test_star() {
    let mut heap = Heap::new();
    let app = heap.class(APP, 10, &["b1", "b2", "b3"]);
    let leaf = heap.class("com.example.B", 5, &[]);
    heap.object(1, app, &[2, 3, 4]);
    for id in 2..=4 {
        heap.object(id, leaf, &[]);
    }

    let analysis = heap.analyze(APP);
    let graph = &analysis.graph;
    let a = node_of(graph, 1);

    assert_eq!(analysis.survivors, [a]);
    let node = graph.node(a);
    assert!(close(node.size(), 25.0));
    let labels: Vec<&str> = node.retains().values().map(String::as_str).collect();
    assert_eq!(labels, ["b1", "b2", "b3"]);
    assert_eq!(node.ret_size(), 25);
    assert_eq!(node.all_size(), 25);
    assert_eq!(analysis.stats.initial_nodes, 4);
}

/// A leaf shared by two roots survives the hard pass and is split in the
/// soft pass.
#[test]
fn test_shared_leaf() {
    let mut heap = Heap::new();
    let app = heap.class(APP, 10, &["l"]);
    let leaf = heap.class("com.example.L", 6, &[]);
    heap.object(1, app, &[3]);
    heap.object(2, app, &[3]);
    heap.object(3, leaf, &[]);

    let analysis = heap.analyze(APP);
    let graph = &analysis.graph;
    let (a, b, l) = (node_of(graph, 1), node_of(graph, 2), node_of(graph, 3));

    assert_eq!(analysis.survivors, [a, b]);
    for survivor in [a, b] {
        assert!(close(graph.node(survivor).size(), 13.0));
        assert_eq!(graph.node(survivor).retains()[&l], "l");
    }
    assert_eq!(graph.node(l).folder(), None);
    assert!(analysis.stats.soft_iterations >= 1);
}

/// A doubly linked ring collapses into its first node.
#[test]
fn test_linked_cycle() {
    let mut graph = ObjectGraph::new();
    let nodes: Vec<NodeId> = (1..=3)
        .map(|id| graph.add_node(ObjectId(id), "com.example.Node", 8))
        .collect();
    graph.link(ObjectGraph::ROOT, nodes[0], "#");
    for i in 0..3 {
        graph.link(nodes[i], nodes[(i + 1) % 3], "next");
        graph.link(nodes[i], nodes[(i + 2) % 3], "prev");
    }

    let mut working = flatten(&graph);
    let stats =
        fold_graph(&mut graph, &mut working, &AnalyzerConfig::default(), &mut ());
    let survivors = aggregate(&mut graph, &working);

    assert_eq!(survivors, [nodes[0]]);
    let head = graph.node(nodes[0]);
    assert_eq!(head.object(), Some(ObjectId(1)));
    assert!(close(head.size(), 24.0));
    assert_eq!(head.self_size(), 8);
    assert_eq!(head.retains()[&nodes[1]], "next");
    assert_eq!(head.retains()[&nodes[2]], "prev");
    assert_eq!(stats.list_nodes_merged, 2);
    graph.check_invariants(&working).unwrap();
}

/// Nested inner classes fold into the outer class as helpers, and the
/// innermost object keeps the full field path.
///
/// Both inner objects point at an object shared with `Other`, so the hard
/// leaf pass cannot take them; only the helper rule can. Folding `Inner`
/// moves `Leaf` under `Outer` before `Leaf` itself is folded.
#[test]
fn test_nested_helper_chain() {
    let outer_name = "com.example.Outer";
    let mut heap = Heap::new();
    let outer = heap.class(outer_name, 16, &["field1", "other"]);
    let inner = heap.class("com.example.Outer$Inner", 12, &["field2", "shared"]);
    let leaf = heap.class("com.example.Outer$Inner$Leaf", 8, &["shared"]);
    let other = heap.class("com.example.Other", 10, &["shared"]);
    let shared = heap.class("com.example.Shared", 6, &[]);
    heap.object(1, outer, &[2, 4]);
    heap.object(2, inner, &[3, 5]);
    heap.object(3, leaf, &[5]);
    heap.object(4, other, &[5]);
    heap.object(5, shared, &[]);

    let analysis = heap.analyze(outer_name);
    let graph = &analysis.graph;
    let o = node_of(graph, 1);
    let retains = graph.node(o).retains();

    assert_eq!(analysis.stats.helpers_folded, 2);
    assert_eq!(analysis.survivors, [o]);
    assert_eq!(graph.type_name(o), outer_name);
    assert_eq!(retains[&node_of(graph, 2)], "field1");
    assert_eq!(retains[&node_of(graph, 3)], "field1.field2");
    assert!(close(graph.node(o).size(), 52.0));
}

/// A runtime type with an outbound edge is folded as a helper, and its
/// child moves up with a combined label.
#[test]
fn test_infrastructure_helper() {
    let mut heap = Heap::new();
    let app = heap.class(APP, 16, &["extras", "other"]);
    let bundle = heap.class("android.os.Bundle", 24, &["map"]);
    let other = heap.class("com.example.Other", 8, &["shared"]);
    let shared = heap.class("com.example.Shared", 12, &[]);
    heap.object(1, app, &[2, 3]);
    heap.object(2, bundle, &[4]);
    heap.object(3, other, &[4]);
    heap.object(4, shared, &[]);

    let analysis = heap.analyze(APP);
    let graph = &analysis.graph;
    let a = node_of(graph, 1);

    assert_eq!(analysis.survivors, [a]);
    let retains = graph.node(a).retains();
    assert_eq!(retains[&node_of(graph, 2)], "extras");
    assert_eq!(retains[&node_of(graph, 4)], "extras.map");
    assert_eq!(analysis.stats.helpers_folded, 1);
    assert!(close(graph.node(a).size(), 60.0));
}

/// An object retained by two survivors counts towards neither's retained
/// size.
#[test]
fn test_retention_uniqueness() {
    let mut heap = Heap::new();
    let app = heap.class(APP, 10, &["r", "own"]);
    let shared = heap.class("com.example.R", 6, &[]);
    let owned = heap.class("com.example.Own", 4, &[]);
    heap.object(1, app, &[3, 4]);
    heap.object(2, app, &[3, 0]);
    heap.object(3, shared, &[]);
    heap.object(4, owned, &[]);

    let analysis = heap.analyze(APP);
    let graph = &analysis.graph;
    let (x, y, r) = (node_of(graph, 1), node_of(graph, 2), node_of(graph, 3));

    assert_eq!(analysis.survivors, [x, y]);
    assert_eq!(graph.node(x).ret_size(), 14);
    assert_eq!(graph.node(x).all_size(), 20);
    assert_eq!(graph.node(y).ret_size(), 10);
    assert_eq!(graph.node(y).all_size(), 16);
    assert_eq!(graph.node(r).retained_by().len(), 2);
    assert!(close(graph.node(x).size(), 17.0));
}

/// The bitmap hook sees the pixel buffer as it is folded into its bitmap.
#[test]
fn test_bitmap_decoded_during_fold() {
    let mut heap = Heap::new();
    let app = heap.class(APP, 8, &["icon"]);
    let bitmap = ObjectId(0x2000);
    heap.builder.define_class(
        bitmap,
        "android.graphics.Bitmap",
        ObjectId::NULL,
        20,
        &[
            ("mBuffer", BasicType::Object),
            ("mWidth", BasicType::Int),
            ("mHeight", BasicType::Int),
        ],
    );
    heap.object(1, app, &[2]);
    heap.builder.instance_values(ObjectId(2), bitmap, &[
        FieldValue::Object(ObjectId(3)),
        FieldValue::Primitive(PrimitiveValue::Int(1)),
        FieldValue::Primitive(PrimitiveValue::Int(2)),
    ]);
    heap.builder.primitive_array(
        ObjectId(3),
        BasicType::Byte,
        8,
        vec![0xff, 0, 0, 0xff, 0, 0xff, 0, 0x80],
    );

    let snapshot = heap.builder.finish();
    let config = AnalyzerConfig {
        root_class_name: APP.to_owned(),
        ..AnalyzerConfig::default()
    };
    let mut collector = BitmapCollector::new(&snapshot, config.bitmap.clone());
    let analysis = analyze(&snapshot, &config, &mut collector);
    let images = collector.into_images();

    let bitmap_node = node_of(&analysis.graph, 2);
    let image = &images[&bitmap_node];
    assert_eq!((image.width, image.height), (1, 2));
    assert_eq!(image.argb, [0xffff_0000, 0x8000_ff00]);
    assert_eq!(analysis.survivors, [node_of(&analysis.graph, 1)]);
}
