//! In-memory heap snapshot model.
//!
//! A [`HeapSnapshot`] keeps every object of the dump with its raw field
//! bytes. Instance fields are decoded lazily against the class layout,
//! which keeps loading cheap for dumps with millions of objects.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Snapshot;

/// Identifier of an object (or class object) in the dump.
///
/// HPROF ids are heap addresses of 4 or 8 bytes; zero is the null
/// reference and never names an object.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// The null reference.
    pub const NULL: ObjectId = ObjectId(0);

    /// Returns `true` for the null reference.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Index of a class in [`HeapSnapshot`]'s class table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

impl ClassId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Width of object identifiers in the dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSize {
    Four,
    Eight,
}

impl IdSize {
    /// Parses the identifier size from the HPROF header.
    pub fn from_bytes(bytes: u32) -> Option<Self> {
        match bytes {
            4 => Some(IdSize::Four),
            8 => Some(IdSize::Eight),
            _ => None,
        }
    }

    /// Number of bytes per identifier.
    pub fn bytes(self) -> usize {
        match self {
            IdSize::Four => 4,
            IdSize::Eight => 8,
        }
    }
}

/// HPROF basic type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicType {
    Object,
    Boolean,
    Char,
    Float,
    Double,
    Byte,
    Short,
    Int,
    Long,
}

impl BasicType {
    /// Decodes an HPROF type tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            2 => BasicType::Object,
            4 => BasicType::Boolean,
            5 => BasicType::Char,
            6 => BasicType::Float,
            7 => BasicType::Double,
            8 => BasicType::Byte,
            9 => BasicType::Short,
            10 => BasicType::Int,
            11 => BasicType::Long,
            _ => return None,
        })
    }

    /// Encodes this type as an HPROF type tag.
    pub fn tag(self) -> u8 {
        match self {
            BasicType::Object => 2,
            BasicType::Boolean => 4,
            BasicType::Char => 5,
            BasicType::Float => 6,
            BasicType::Double => 7,
            BasicType::Byte => 8,
            BasicType::Short => 9,
            BasicType::Int => 10,
            BasicType::Long => 11,
        }
    }

    /// Bytes a value of this type occupies in the dump.
    pub fn value_size(self, id_size: IdSize) -> usize {
        match self {
            BasicType::Object => id_size.bytes(),
            BasicType::Boolean | BasicType::Byte => 1,
            BasicType::Char | BasicType::Short => 2,
            BasicType::Float | BasicType::Int => 4,
            BasicType::Double | BasicType::Long => 8,
        }
    }

    /// Bytes one array element of this type is charged in the heap.
    ///
    /// Object array slots are charged as compressed 4-byte references
    /// regardless of the dump's identifier width.
    pub fn element_size(self) -> u32 {
        match self {
            BasicType::Object | BasicType::Float | BasicType::Int => 4,
            BasicType::Boolean | BasicType::Byte => 1,
            BasicType::Char | BasicType::Short => 2,
            BasicType::Double | BasicType::Long => 8,
        }
    }

    /// Source-form name of the array class holding this element type.
    pub fn array_class_name(self) -> &'static str {
        match self {
            BasicType::Object => "java.lang.Object[]",
            BasicType::Boolean => "boolean[]",
            BasicType::Char => "char[]",
            BasicType::Float => "float[]",
            BasicType::Double => "double[]",
            BasicType::Byte => "byte[]",
            BasicType::Short => "short[]",
            BasicType::Int => "int[]",
            BasicType::Long => "long[]",
        }
    }

    /// Decodes one value of this type from big-endian bytes.
    ///
    /// Returns `None` if `bytes` is shorter than the value.
    pub fn decode(self, bytes: &[u8], id_size: IdSize) -> Option<FieldValue> {
        let raw = bytes.get(..self.value_size(id_size))?;
        let value = match self {
            BasicType::Object => {
                let id = match id_size {
                    IdSize::Four => u64::from(u32::from_be_bytes(raw.try_into().ok()?)),
                    IdSize::Eight => u64::from_be_bytes(raw.try_into().ok()?),
                };
                return Some(FieldValue::from_id(ObjectId(id)));
            }
            BasicType::Boolean => PrimitiveValue::Boolean(raw[0] != 0),
            BasicType::Byte => PrimitiveValue::Byte(i8::from_be_bytes([raw[0]])),
            BasicType::Char => PrimitiveValue::Char(u16::from_be_bytes(raw.try_into().ok()?)),
            BasicType::Short => PrimitiveValue::Short(i16::from_be_bytes(raw.try_into().ok()?)),
            BasicType::Int => PrimitiveValue::Int(i32::from_be_bytes(raw.try_into().ok()?)),
            BasicType::Float => PrimitiveValue::Float(f32::from_be_bytes(raw.try_into().ok()?)),
            BasicType::Long => PrimitiveValue::Long(i64::from_be_bytes(raw.try_into().ok()?)),
            BasicType::Double => PrimitiveValue::Double(f64::from_be_bytes(raw.try_into().ok()?)),
        };
        Some(FieldValue::Primitive(value))
    }
}

/// A primitive field value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PrimitiveValue {
    Boolean(bool),
    Char(u16),
    Float(f32),
    Double(f64),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
}

impl PrimitiveValue {
    /// Returns the value as an integer, for integral types only.
    pub fn as_i64(self) -> Option<i64> {
        match self {
            PrimitiveValue::Boolean(v) => Some(i64::from(v)),
            PrimitiveValue::Char(v) => Some(i64::from(v)),
            PrimitiveValue::Byte(v) => Some(i64::from(v)),
            PrimitiveValue::Short(v) => Some(i64::from(v)),
            PrimitiveValue::Int(v) => Some(i64::from(v)),
            PrimitiveValue::Long(v) => Some(v),
            PrimitiveValue::Float(_) | PrimitiveValue::Double(_) => None,
        }
    }

    /// Returns the HPROF type of this value.
    pub fn basic_type(self) -> BasicType {
        match self {
            PrimitiveValue::Boolean(_) => BasicType::Boolean,
            PrimitiveValue::Char(_) => BasicType::Char,
            PrimitiveValue::Float(_) => BasicType::Float,
            PrimitiveValue::Double(_) => BasicType::Double,
            PrimitiveValue::Byte(_) => BasicType::Byte,
            PrimitiveValue::Short(_) => BasicType::Short,
            PrimitiveValue::Int(_) => BasicType::Int,
            PrimitiveValue::Long(_) => BasicType::Long,
        }
    }

    /// Encodes the value as big-endian bytes.
    pub fn encode(self, out: &mut Vec<u8>) {
        match self {
            PrimitiveValue::Boolean(v) => out.push(u8::from(v)),
            PrimitiveValue::Char(v) => out.extend_from_slice(&v.to_be_bytes()),
            PrimitiveValue::Float(v) => out.extend_from_slice(&v.to_be_bytes()),
            PrimitiveValue::Double(v) => out.extend_from_slice(&v.to_be_bytes()),
            PrimitiveValue::Byte(v) => out.extend_from_slice(&v.to_be_bytes()),
            PrimitiveValue::Short(v) => out.extend_from_slice(&v.to_be_bytes()),
            PrimitiveValue::Int(v) => out.extend_from_slice(&v.to_be_bytes()),
            PrimitiveValue::Long(v) => out.extend_from_slice(&v.to_be_bytes()),
        }
    }
}

/// Result of resolving a field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Object(ObjectId),
    Primitive(PrimitiveValue),
    Null,
}

impl FieldValue {
    /// Wraps an id, mapping the null id to [`FieldValue::Null`].
    pub fn from_id(id: ObjectId) -> Self {
        if id.is_null() {
            FieldValue::Null
        } else {
            FieldValue::Object(id)
        }
    }

    /// Returns the referenced object id, if this is an object reference.
    pub fn as_object(self) -> Option<ObjectId> {
        match self {
            FieldValue::Object(id) => Some(id),
            FieldValue::Primitive(_) | FieldValue::Null => None,
        }
    }

    /// Returns the integral value, if this is an integral primitive.
    pub fn as_i64(self) -> Option<i64> {
        match self {
            FieldValue::Primitive(value) => value.as_i64(),
            FieldValue::Object(_) | FieldValue::Null => None,
        }
    }
}

/// A named field declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub ty: BasicType,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, ty: BasicType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// An outbound reference: the field path that holds it and its referent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedReference {
    pub name: String,
    pub referent: ObjectId,
}

/// A class from the dump, or a synthetic class for array types the dump
/// never declared.
#[derive(Debug, Clone)]
pub struct Class {
    pub(crate) id: ClassId,
    pub(crate) object_id: Option<ObjectId>,
    pub(crate) name: String,
    pub(crate) super_class: Option<ClassId>,
    pub(crate) instance_size: u32,
    pub(crate) instance_fields: Vec<FieldDescriptor>,
    pub(crate) static_fields: Vec<(FieldDescriptor, FieldValue)>,
    pub(crate) instances: Vec<ObjectId>,
}

impl Class {
    pub fn id(&self) -> ClassId {
        self.id
    }

    /// Id of the `java.lang.Class` object, absent for synthetic classes.
    pub fn object_id(&self) -> Option<ObjectId> {
        self.object_id
    }

    /// Fully qualified name in source form, e.g. `java.util.HashMap$Node`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_array_type(&self) -> bool {
        self.name.ends_with("[]")
    }

    /// Shallow size of one instance as recorded in the dump.
    pub fn heap_size_per_instance(&self) -> u32 {
        self.instance_size
    }

    /// Ids of every instance, in dump order.
    pub fn instance_ids(&self) -> &[ObjectId] {
        &self.instances
    }

    pub fn super_class(&self) -> Option<ClassId> {
        self.super_class
    }

    /// Fields declared by this class, not including inherited ones.
    pub fn instance_fields(&self) -> &[FieldDescriptor] {
        &self.instance_fields
    }
}

/// Payload of an object.
#[derive(Debug, Clone)]
pub enum ObjectData {
    /// Raw instance field bytes, most-derived class first.
    Instance(Box<[u8]>),
    ObjectArray(Box<[ObjectId]>),
    /// Primitive array; `bytes` is empty when the dump omitted the contents.
    PrimitiveArray {
        ty: BasicType,
        length: u32,
        bytes: Box<[u8]>,
    },
    /// The `java.lang.Class` object of a class.
    Class(ClassId),
}

/// An object from the dump.
#[derive(Debug, Clone)]
pub struct Object {
    pub(crate) id: ObjectId,
    pub(crate) class: ClassId,
    pub(crate) data: ObjectData,
}

impl Object {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn class_id(&self) -> ClassId {
        self.class
    }

    pub fn data(&self) -> &ObjectData {
        &self.data
    }

    pub fn is_array(&self) -> bool {
        matches!(
            self.data,
            ObjectData::ObjectArray(_) | ObjectData::PrimitiveArray { .. }
        )
    }

    /// Number of elements, for arrays.
    pub fn length(&self) -> Option<u32> {
        match &self.data {
            ObjectData::ObjectArray(elements) => u32::try_from(elements.len()).ok(),
            ObjectData::PrimitiveArray { length, .. } => Some(*length),
            ObjectData::Instance(_) | ObjectData::Class(_) => None,
        }
    }

    /// Bytes charged per element, for arrays.
    pub fn element_size(&self) -> Option<u32> {
        match &self.data {
            ObjectData::ObjectArray(_) => Some(BasicType::Object.element_size()),
            ObjectData::PrimitiveArray { ty, .. } => Some(ty.element_size()),
            ObjectData::Instance(_) | ObjectData::Class(_) => None,
        }
    }
}

/// A fully loaded heap snapshot.
#[derive(Debug)]
pub struct HeapSnapshot {
    pub(crate) id_size: IdSize,
    pub(crate) classes: Vec<Class>,
    pub(crate) classes_by_name: HashMap<String, Vec<ClassId>>,
    pub(crate) objects: HashMap<ObjectId, Object>,
}

impl HeapSnapshot {
    pub fn id_size(&self) -> IdSize {
        self.id_size
    }

    /// Every class, in class-id order.
    pub fn classes(&self) -> &[Class] {
        &self.classes
    }

    /// Number of objects, class objects included.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Decodes all instance fields of an instance, most-derived class first.
    ///
    /// Decoding stops quietly at the end of the recorded bytes, so a
    /// truncated instance yields the fields that fit.
    fn instance_fields(&self, object: &Object) -> Vec<(&str, FieldValue)> {
        let ObjectData::Instance(bytes) = &object.data else {
            return Vec::new();
        };

        let mut fields = Vec::new();
        let mut offset = 0;
        let mut class = self.class(object.class);
        while let Some(current) = class {
            for field in &current.instance_fields {
                let Some(value) = bytes
                    .get(offset..)
                    .and_then(|rest| field.ty.decode(rest, self.id_size))
                else {
                    return fields;
                };
                offset += field.ty.value_size(self.id_size);
                fields.push((field.name.as_str(), value));
            }
            class = current.super_class.and_then(|id| self.class(id));
        }
        fields
    }
}

/// Parses an `[i]` array slot label.
fn parse_slot(name: &str) -> Option<usize> {
    name.strip_prefix('[')?.strip_suffix(']')?.parse().ok()
}

impl Snapshot for HeapSnapshot {
    fn classes_by_name(&self, name: &str) -> Vec<ClassId> {
        self.classes_by_name.get(name).cloned().unwrap_or_default()
    }

    fn class(&self, id: ClassId) -> Option<&Class> {
        self.classes.get(id.index())
    }

    fn object(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(&id)
    }

    fn outbound_references(&self, id: ObjectId) -> Vec<NamedReference> {
        let Some(object) = self.object(id) else {
            return Vec::new();
        };

        match &object.data {
            ObjectData::Instance(_) => self
                .instance_fields(object)
                .into_iter()
                .filter_map(|(name, value)| {
                    value.as_object().map(|referent| NamedReference {
                        name: name.to_owned(),
                        referent,
                    })
                })
                .collect(),
            ObjectData::ObjectArray(elements) => elements
                .iter()
                .enumerate()
                .filter(|(_, element)| !element.is_null())
                .map(|(index, &referent)| NamedReference {
                    name: format!("[{index}]"),
                    referent,
                })
                .collect(),
            ObjectData::Class(class_id) => self
                .class(*class_id)
                .map(|class| {
                    class
                        .static_fields
                        .iter()
                        .filter_map(|(field, value)| {
                            value.as_object().map(|referent| NamedReference {
                                name: field.name.clone(),
                                referent,
                            })
                        })
                        .collect()
                })
                .unwrap_or_default(),
            ObjectData::PrimitiveArray { .. } => Vec::new(),
        }
    }

    fn resolve_field(&self, id: ObjectId, name: &str) -> FieldValue {
        let Some(object) = self.object(id) else {
            return FieldValue::Null;
        };

        match &object.data {
            ObjectData::Instance(_) => self
                .instance_fields(object)
                .into_iter()
                .find(|(field, _)| *field == name)
                .map_or(FieldValue::Null, |(_, value)| value),
            ObjectData::ObjectArray(elements) => parse_slot(name)
                .and_then(|index| elements.get(index))
                .map_or(FieldValue::Null, |&element| FieldValue::from_id(element)),
            ObjectData::PrimitiveArray { ty, bytes, .. } => parse_slot(name)
                .and_then(|index| {
                    let size = ty.value_size(self.id_size);
                    bytes.get(index * size..).and_then(|rest| ty.decode(rest, self.id_size))
                })
                .unwrap_or(FieldValue::Null),
            ObjectData::Class(class_id) => self
                .class(*class_id)
                .and_then(|class| {
                    class
                        .static_fields
                        .iter()
                        .find(|(field, _)| field.name == name)
                        .map(|(_, value)| *value)
                })
                .unwrap_or(FieldValue::Null),
        }
    }

    fn primitive_array_bytes(&self, id: ObjectId) -> Option<&[u8]> {
        match &self.object(id)?.data {
            ObjectData::PrimitiveArray { bytes, .. } if !bytes.is_empty() => Some(&bytes[..]),
            _ => None,
        }
    }
}
