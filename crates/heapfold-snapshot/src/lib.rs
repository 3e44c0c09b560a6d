//! Heap snapshot model for heapfold.
//!
//! This crate owns everything heapfold knows about the on-disk heap dump:
//! the [`Snapshot`] trait that the analysis pipeline consumes, the
//! [`HeapSnapshot`] in-memory model that implements it, and a reader for the
//! HPROF binary format produced by the JVM and by Android's `am dumpheap`.
//!
//! The analysis crates only ever talk to the trait. Tests build snapshots
//! directly with [`SnapshotBuilder`] instead of writing dump files.
//!
//! ## Usage
//!
//! ```no_run
//! use heapfold_snapshot::{HeapSnapshot, Snapshot};
//!
//! let snapshot = HeapSnapshot::open("dump.hprof").unwrap();
//! for class_id in snapshot.classes_by_name("java.lang.String") {
//!     let class = snapshot.class(class_id).unwrap();
//!     println!("{} has {} instances", class.name(), class.instance_ids().len());
//! }
//! ```

mod builder;
mod error;
mod hprof;
mod model;

#[doc(inline)]
pub use crate::builder::{ClassDump, SnapshotBuilder};
#[doc(inline)]
pub use crate::error::SnapshotError;
#[doc(inline)]
pub use crate::hprof::normalize_class_name;
#[doc(inline)]
pub use crate::model::*;

/// Read-only view of a heap snapshot.
///
/// This is the contract between the snapshot parser and the analysis
/// pipeline. Object and class handles are plain ids; every lookup returns
/// `None` (or [`FieldValue::Null`]) for ids the dump does not contain, so
/// dangling references are skipped rather than treated as errors.
pub trait Snapshot {
    /// Returns every class with exactly this name. Subclasses are not
    /// included. Several classes can share a name when they were loaded by
    /// different class loaders.
    fn classes_by_name(&self, name: &str) -> Vec<ClassId>;

    /// Looks up a class by id.
    fn class(&self, id: ClassId) -> Option<&Class>;

    /// Looks up an object by id.
    fn object(&self, id: ObjectId) -> Option<&Object>;

    /// Lists the non-null object references held by an object.
    ///
    /// Instances report their object-typed fields across the whole class
    /// hierarchy, object arrays report `[i]` for every non-null element and
    /// class objects report their object-typed static fields.
    fn outbound_references(&self, id: ObjectId) -> Vec<NamedReference>;

    /// Resolves a named field (or `[i]` array slot) of an object.
    fn resolve_field(&self, id: ObjectId, name: &str) -> FieldValue;

    /// Returns the raw contents of a primitive array, if the dump kept them.
    fn primitive_array_bytes(&self, id: ObjectId) -> Option<&[u8]>;

    /// Returns the class of an object.
    fn class_of(&self, id: ObjectId) -> Option<&Class> {
        self.object(id).and_then(|object| self.class(object.class_id()))
    }
}
