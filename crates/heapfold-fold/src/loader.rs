//! Snapshot to object graph.
//!
//! The loader walks the snapshot breadth-first from every instance of the
//! root class and creates one node per reachable object. References to
//! weak references, finalizer entries, reflective method objects and class
//! loaders are not followed: they reach most of the heap without owning
//! it.

use std::collections::{HashMap, VecDeque};

use heapfold_snapshot::{ObjectId, Snapshot};
use tracing::{debug, debug_span, trace, warn};

use crate::config::AnalyzerConfig;
use crate::graph::{NodeId, ObjectGraph};

/// Label of the edges from the synthetic root to the root instances.
pub const ROOT_LABEL: &str = "#";

/// Builds the object graph reachable from the configured root class.
///
/// The first edge discovered into an object names it; later edges from
/// other holders are wired with their own labels, but a repeated edge from
/// the same holder keeps the first label.
pub fn load<S: Snapshot + ?Sized>(
    snapshot: &S,
    config: &AnalyzerConfig,
) -> ObjectGraph {
    let _span =
        debug_span!("load", root_class = %config.root_class_name).entered();

    let mut graph = ObjectGraph::new();
    let mut visited: HashMap<ObjectId, NodeId> = HashMap::new();
    let mut queue: VecDeque<(ObjectId, NodeId)> = VecDeque::new();

    let mut roots = 0usize;
    for class_id in snapshot.classes_by_name(&config.root_class_name) {
        let Some(class) = snapshot.class(class_id) else {
            continue;
        };
        for &instance in class.instance_ids() {
            if let Some(&node) = visited.get(&instance) {
                graph.link(ObjectGraph::ROOT, node, ROOT_LABEL);
                continue;
            }
            let Some(node) = add_object(&mut graph, snapshot, instance) else {
                continue;
            };
            graph.link(ObjectGraph::ROOT, node, ROOT_LABEL);
            visited.insert(instance, node);
            queue.push_back((instance, node));
            roots += 1;
        }
    }

    if roots == 0 {
        warn!(
            root_class = %config.root_class_name,
            "Root class has no instances in this snapshot"
        );
    }
    debug!(roots, "Found root instances");

    while let Some((object, parent)) = queue.pop_front() {
        for reference in snapshot.outbound_references(object) {
            let Some(referent) =
                snapshot.resolve_field(object, &reference.name).as_object()
            else {
                trace!(%object, field = %reference.name, "Skipping non-object field");
                continue;
            };
            let Some(type_name) =
                snapshot.class_of(referent).map(|class| class.name())
            else {
                trace!(%object, %referent, "Skipping unresolved referent");
                continue;
            };
            if config.is_skipped_type(type_name) {
                continue;
            }

            if let Some(&child) = visited.get(&referent) {
                graph.link(parent, child, reference.name);
            } else if let Some(child) =
                add_object(&mut graph, snapshot, referent)
            {
                graph.link(parent, child, reference.name);
                visited.insert(referent, child);
                queue.push_back((referent, child));
            }
        }
    }

    debug!(
        nodes = graph.len() - 1,
        edges = graph.edge_count(),
        "Loaded object graph"
    );
    graph
}

/// Allocates a node for a snapshot object, or `None` if the object or its
/// class is missing.
fn add_object<S: Snapshot + ?Sized>(
    graph: &mut ObjectGraph,
    snapshot: &S,
    id: ObjectId,
) -> Option<NodeId> {
    let object = snapshot.object(id)?;
    let class = snapshot.class(object.class_id())?;

    let array_size = if class.is_array_type() {
        object
            .length()
            .zip(object.element_size())
            .map(|(length, element)| u64::from(length) * u64::from(element))
    } else {
        None
    };
    let self_size = array_size
        .unwrap_or_else(|| u64::from(class.heap_size_per_instance()));

    Some(graph.add_node(id, class.name(), self_size))
}

#[cfg(test)]
mod tests {
    use heapfold_snapshot::{BasicType, FieldValue, IdSize, SnapshotBuilder};

    use super::*;

    const APP: ObjectId = ObjectId(0x10);
    const HOLDER: ObjectId = ObjectId(0x11);
    const WEAK: ObjectId = ObjectId(0x12);
    const LOADER: ObjectId = ObjectId(0x13);
    const INTS: ObjectId = ObjectId(0x14);

    fn config() -> AnalyzerConfig {
        AnalyzerConfig {
            root_class_name: "com.example.App".to_owned(),
            ..AnalyzerConfig::default()
        }
    }

    fn obj(id: u64) -> FieldValue {
        FieldValue::from_id(ObjectId(id))
    }

    /// App(1) holds a Holder twice, a weak reference, a class loader and an
    /// int array; the holder points back at the app.
    fn snapshot() -> heapfold_snapshot::HeapSnapshot {
        let mut b = SnapshotBuilder::new(IdSize::Four);
        b.define_class(APP, "com.example.App", ObjectId::NULL, 24, &[
            ("first", BasicType::Object),
            ("second", BasicType::Object),
            ("weak", BasicType::Object),
            ("loader", BasicType::Object),
            ("numbers", BasicType::Object),
            ("count", BasicType::Int),
        ]);
        b.define_class(HOLDER, "com.example.Holder", ObjectId::NULL, 12, &[
            ("app", BasicType::Object),
            ("missing", BasicType::Object),
        ]);
        b.define_class(WEAK, "java.lang.ref.WeakReference", ObjectId::NULL, 16, &[]);
        b.define_class(LOADER, "dalvik.system.PathClassLoader", ObjectId::NULL, 40, &[]);
        b.class_name(INTS, "[I");

        b.instance_values(ObjectId(1), APP, &[
            obj(2),
            obj(2),
            obj(3),
            obj(4),
            obj(5),
            FieldValue::Primitive(heapfold_snapshot::PrimitiveValue::Int(7)),
        ]);
        b.instance_values(ObjectId(2), HOLDER, &[obj(1), obj(0x999)]);
        b.instance_values(ObjectId(3), WEAK, &[]);
        b.instance_values(ObjectId(4), LOADER, &[]);
        b.primitive_array(ObjectId(5), BasicType::Int, 6, vec![0; 24]);
        b.finish()
    }

    fn node_of(graph: &ObjectGraph, id: u64) -> NodeId {
        graph
            .node_ids()
            .find(|&n| graph.node(n).object() == Some(ObjectId(id)))
            .unwrap()
    }

    #[test]
    fn test_root_instances_hang_off_root() {
        let graph = load(&snapshot(), &config());
        let app = node_of(&graph, 1);

        assert_eq!(graph.node(ObjectGraph::ROOT).out_refs()[&app], ROOT_LABEL);
        assert_eq!(graph.type_name(app), "com.example.App");
        assert_eq!(graph.node(app).self_size(), 24);
    }

    /// Weak references and class loaders are never loaded; dangling ids are
    /// skipped quietly.
    #[test]
    fn test_skipped_references() {
        let graph = load(&snapshot(), &config());

        // Root, App, Holder and the int array.
        assert_eq!(graph.len(), 4);
        assert!(
            graph
                .node_ids()
                .all(|n| !graph.type_name(n).contains("ClassLoader"))
        );
    }

    /// The second field pointing at the same holder does not replace the
    /// discovery label; the back edge to the app is kept.
    #[test]
    fn test_first_label_wins_and_cycles_are_kept() {
        let graph = load(&snapshot(), &config());
        let app = node_of(&graph, 1);
        let holder = node_of(&graph, 2);

        assert_eq!(graph.node(app).out_refs()[&holder], "first");
        assert_eq!(graph.node(holder).out_refs()[&app], "app");
        assert_eq!(graph.node(app).in_refs().len(), 2);
        graph
            .check_invariants(&graph.node_ids().skip(1).collect())
            .unwrap();
    }

    #[test]
    fn test_array_self_size() {
        let graph = load(&snapshot(), &config());
        let ints = node_of(&graph, 5);

        assert_eq!(graph.type_name(ints), "int[]");
        assert_eq!(graph.node(ints).self_size(), 24);
    }

    #[test]
    fn test_missing_root_class_loads_nothing() {
        let config = AnalyzerConfig {
            root_class_name: "com.example.Missing".to_owned(),
            ..AnalyzerConfig::default()
        };
        let graph = load(&snapshot(), &config);
        assert!(graph.is_empty());
    }
}
