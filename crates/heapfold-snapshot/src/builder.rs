//! Incremental construction of a [`HeapSnapshot`].
//!
//! Dump records arrive in no guaranteed order: instances can precede the
//! class dump of their class, and names arrive separately from layouts.
//! The builder therefore buffers raw records keyed by class object id and
//! resolves everything in [`SnapshotBuilder::finish`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::{debug, warn};

use crate::error::SnapshotError;
use crate::hprof::normalize_class_name;
use crate::model::{
    BasicType, Class, ClassId, FieldDescriptor, FieldValue, HeapSnapshot, IdSize,
    Object, ObjectData, ObjectId,
};

/// Layout of a class as recorded by a `CLASS DUMP` record.
#[derive(Debug, Clone)]
pub struct ClassDump {
    pub object_id: ObjectId,
    pub super_object: ObjectId,
    pub instance_size: u32,
    pub static_fields: Vec<(FieldDescriptor, FieldValue)>,
    pub instance_fields: Vec<FieldDescriptor>,
}

/// An object whose class is still known only by class object id.
#[derive(Debug)]
enum PendingObject {
    Instance {
        id: ObjectId,
        class_object: ObjectId,
        bytes: Box<[u8]>,
    },
    ObjectArray {
        id: ObjectId,
        class_object: ObjectId,
        elements: Box<[ObjectId]>,
    },
    PrimitiveArray {
        id: ObjectId,
        ty: BasicType,
        length: u32,
        bytes: Box<[u8]>,
    },
}

/// Builds a [`HeapSnapshot`] from individual dump records.
///
/// # Example
///
/// ```
/// use heapfold_snapshot::{
///     BasicType, FieldValue, IdSize, ObjectId, Snapshot, SnapshotBuilder,
/// };
///
/// let mut builder = SnapshotBuilder::new(IdSize::Four);
/// builder.define_class(ObjectId(0x10), "com.example.Node", ObjectId::NULL, 8, &[
///     ("next", BasicType::Object),
/// ]);
/// builder.instance_values(ObjectId(1), ObjectId(0x10), &[FieldValue::Object(ObjectId(2))]);
/// builder.instance_values(ObjectId(2), ObjectId(0x10), &[FieldValue::Null]);
/// let snapshot = builder.finish();
///
/// assert_eq!(snapshot.outbound_references(ObjectId(1)).len(), 1);
/// ```
#[derive(Debug)]
pub struct SnapshotBuilder {
    id_size: IdSize,
    names: HashMap<ObjectId, String>,
    dumps: HashMap<ObjectId, ClassDump>,
    objects: Vec<PendingObject>,
}

impl SnapshotBuilder {
    pub fn new(id_size: IdSize) -> Self {
        Self {
            id_size,
            names: HashMap::new(),
            dumps: HashMap::new(),
            objects: Vec::new(),
        }
    }

    pub fn id_size(&self) -> IdSize {
        self.id_size
    }

    /// Records the name of a class object. Names in JVM internal form
    /// (`java/lang/String`, `[B`) are normalized to source form.
    pub fn class_name(&mut self, class_object: ObjectId, name: &str) {
        self.names.insert(class_object, normalize_class_name(name));
    }

    /// Records a class layout.
    pub fn class_dump(&mut self, dump: ClassDump) {
        self.dumps.insert(dump.object_id, dump);
    }

    /// Convenience for tests and tools: names and lays out a class in one
    /// call, with no static fields.
    pub fn define_class(
        &mut self,
        class_object: ObjectId,
        name: &str,
        super_object: ObjectId,
        instance_size: u32,
        fields: &[(&str, BasicType)],
    ) {
        self.class_name(class_object, name);
        self.class_dump(ClassDump {
            object_id: class_object,
            super_object,
            instance_size,
            static_fields: Vec::new(),
            instance_fields: fields
                .iter()
                .map(|&(name, ty)| FieldDescriptor::new(name, ty))
                .collect(),
        });
    }

    /// Records an instance with its raw field bytes.
    pub fn instance(&mut self, id: ObjectId, class_object: ObjectId, bytes: Vec<u8>) {
        self.objects.push(PendingObject::Instance {
            id,
            class_object,
            bytes: bytes.into_boxed_slice(),
        });
    }

    /// Records an instance from field values, encoded in the order given
    /// (most-derived class first, as in the dump).
    pub fn instance_values(
        &mut self,
        id: ObjectId,
        class_object: ObjectId,
        values: &[FieldValue],
    ) {
        let mut bytes = Vec::new();
        for value in values {
            match value {
                FieldValue::Object(referent) => self.encode_id(*referent, &mut bytes),
                FieldValue::Null => self.encode_id(ObjectId::NULL, &mut bytes),
                FieldValue::Primitive(primitive) => primitive.encode(&mut bytes),
            }
        }
        self.instance(id, class_object, bytes);
    }

    pub fn object_array(
        &mut self,
        id: ObjectId,
        class_object: ObjectId,
        elements: Vec<ObjectId>,
    ) {
        self.objects.push(PendingObject::ObjectArray {
            id,
            class_object,
            elements: elements.into_boxed_slice(),
        });
    }

    /// Records a primitive array. `bytes` may be empty when the dump kept
    /// only the length.
    pub fn primitive_array(
        &mut self,
        id: ObjectId,
        ty: BasicType,
        length: u32,
        bytes: Vec<u8>,
    ) {
        self.objects.push(PendingObject::PrimitiveArray {
            id,
            ty,
            length,
            bytes: bytes.into_boxed_slice(),
        });
    }

    fn encode_id(&self, id: ObjectId, out: &mut Vec<u8>) {
        match self.id_size {
            // Four-byte dumps keep the low half of the id.
            IdSize::Four => out.extend_from_slice(&id.0.to_be_bytes()[4..]),
            IdSize::Eight => out.extend_from_slice(&id.0.to_be_bytes()),
        }
    }

    /// Resolves all buffered records into a snapshot, rejecting a class
    /// hierarchy in which some class is its own ancestor.
    ///
    /// # Errors
    ///
    /// Returns a malformed [`SnapshotError`] naming a class on the cycle.
    pub fn try_finish(self) -> Result<HeapSnapshot, SnapshotError> {
        if let Some(class_object) = super_cycle(&self.dumps) {
            return Err(SnapshotError::inconsistent(format!(
                "superclass cycle through class {class_object}"
            )));
        }
        Ok(self.finish())
    }

    /// Resolves all buffered records into a snapshot.
    ///
    /// Classes are numbered in ascending class object id order. Instances
    /// whose class was never declared are dropped with a warning; arrays of
    /// undeclared classes get a synthetic class named after their element
    /// type. A superclass cycle is cut where it closes, with a warning; use
    /// [`try_finish`](Self::try_finish) to reject it instead.
    pub fn finish(self) -> HeapSnapshot {
        let Self {
            id_size,
            names,
            mut dumps,
            objects,
        } = self;

        let class_objects: BTreeSet<ObjectId> =
            names.keys().chain(dumps.keys()).copied().collect();

        let mut table = ClassTable::default();
        let mut supers: BTreeMap<ClassId, ObjectId> = BTreeMap::new();
        for class_object in class_objects {
            let name = names
                .get(&class_object)
                .cloned()
                .unwrap_or_else(|| format!("class@{class_object}"));
            let dump = dumps.remove(&class_object);
            let class_id = table.push(Class {
                id: ClassId(0),
                object_id: Some(class_object),
                name,
                super_class: None,
                instance_size: dump.as_ref().map_or(0, |d| d.instance_size),
                instance_fields: dump
                    .as_ref()
                    .map(|d| d.instance_fields.clone())
                    .unwrap_or_default(),
                static_fields: dump
                    .as_ref()
                    .map(|d| d.static_fields.clone())
                    .unwrap_or_default(),
                instances: Vec::new(),
            });
            if let Some(dump) = dump.filter(|d| !d.super_object.is_null()) {
                supers.insert(class_id, dump.super_object);
            }
        }

        for (class_id, super_object) in supers {
            let super_class = table.by_object.get(&super_object).copied();
            table.classes[class_id.index()].super_class = super_class;
        }
        table.cut_super_cycles();

        let mut object_map: HashMap<ObjectId, Object> =
            HashMap::with_capacity(objects.len() + table.classes.len());

        // Class objects are objects of java.lang.Class.
        let class_class = table.named_or_synthetic("java.lang.Class");
        let class_entries: Vec<(ObjectId, ClassId)> = table
            .classes
            .iter()
            .filter_map(|class| class.object_id.map(|object_id| (object_id, class.id)))
            .collect();
        for (object_id, class_id) in class_entries {
            object_map.insert(
                object_id,
                Object {
                    id: object_id,
                    class: class_class,
                    data: ObjectData::Class(class_id),
                },
            );
        }

        let mut orphans = 0usize;
        for pending in objects {
            let (id, class, data) = match pending {
                PendingObject::Instance {
                    id,
                    class_object,
                    bytes,
                } => {
                    let Some(&class) = table.by_object.get(&class_object) else {
                        orphans += 1;
                        continue;
                    };
                    (id, class, ObjectData::Instance(bytes))
                }
                PendingObject::ObjectArray {
                    id,
                    class_object,
                    elements,
                } => {
                    let class = match table.by_object.get(&class_object) {
                        Some(&class) => class,
                        None => table
                            .named_or_synthetic(BasicType::Object.array_class_name()),
                    };
                    (id, class, ObjectData::ObjectArray(elements))
                }
                PendingObject::PrimitiveArray {
                    id,
                    ty,
                    length,
                    bytes,
                } => {
                    let class = table.named_or_synthetic(ty.array_class_name());
                    (id, class, ObjectData::PrimitiveArray { ty, length, bytes })
                }
            };
            table.classes[class.index()].instances.push(id);
            object_map.insert(id, Object { id, class, data });
        }

        if orphans > 0 {
            warn!(orphans, "Dropped instances of undeclared classes");
        }
        debug!(
            classes = table.classes.len(),
            objects = object_map.len(),
            "Built heap snapshot"
        );

        HeapSnapshot {
            id_size,
            classes: table.classes,
            classes_by_name: table.by_name,
            objects: object_map,
        }
    }
}

/// Returns a class object on a superclass cycle, if the dumps contain one.
fn super_cycle(dumps: &HashMap<ObjectId, ClassDump>) -> Option<ObjectId> {
    let starts: BTreeSet<ObjectId> = dumps.keys().copied().collect();
    for start in starts {
        let mut seen = HashSet::new();
        let mut current = start;
        while !current.is_null() {
            if !seen.insert(current) {
                return Some(current);
            }
            let Some(dump) = dumps.get(&current) else {
                break;
            };
            current = dump.super_object;
        }
    }
    None
}

/// Class table under construction.
#[derive(Default)]
struct ClassTable {
    classes: Vec<Class>,
    by_object: HashMap<ObjectId, ClassId>,
    by_name: HashMap<String, Vec<ClassId>>,
}

impl ClassTable {
    fn push(&mut self, mut class: Class) -> ClassId {
        let id = ClassId(u32::try_from(self.classes.len()).unwrap_or(u32::MAX));
        class.id = id;
        if let Some(object_id) = class.object_id {
            self.by_object.insert(object_id, id);
        }
        self.by_name.entry(class.name.clone()).or_default().push(id);
        self.classes.push(class);
        id
    }

    /// Clears the superclass link that closes each cycle, so field
    /// decoding always reaches the top of the hierarchy.
    fn cut_super_cycles(&mut self) {
        for start in 0..self.classes.len() {
            let mut seen = HashSet::new();
            let mut current = start;
            while let Some(next) = self.classes[current].super_class {
                seen.insert(current);
                if seen.contains(&next.index()) {
                    warn!(class = %self.classes[current].name, "Cut superclass cycle");
                    self.classes[current].super_class = None;
                    break;
                }
                current = next.index();
            }
        }
    }

    /// Returns the first class with this name, creating a synthetic one
    /// (no class object, no fields) if the dump never declared it.
    fn named_or_synthetic(&mut self, name: &str) -> ClassId {
        if let Some(&id) = self.by_name.get(name).and_then(|ids| ids.first()) {
            return id;
        }
        self.push(Class {
            id: ClassId(0),
            object_id: None,
            name: name.to_owned(),
            super_class: None,
            instance_size: 0,
            instance_fields: Vec::new(),
            static_fields: Vec::new(),
            instances: Vec::new(),
        })
    }
}
