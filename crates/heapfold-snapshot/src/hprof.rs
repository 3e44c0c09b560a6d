//! HPROF binary heap dump reader.
//!
//! An HPROF file is a NUL-terminated version string (`JAVA PROFILE 1.0.2`),
//! a 4-byte identifier size, an 8-byte timestamp, and then a flat sequence
//! of tagged records:
//!
//! ```text
//! u1 tag | u4 time delta | u4 body length | body
//! ```
//!
//! Only `STRING`, `LOAD CLASS`, `HEAP DUMP` and `HEAP DUMP SEGMENT` carry
//! anything the analysis needs; every other record is skipped by length.
//! Heap dump bodies hold sub-records without a length prefix, so every
//! sub-record tag must be understood to stay in sync. That includes the
//! Android extensions (`0x89`-`0x90`, `0xc3`, `0xfe`).
//!
//! All multi-byte values are big-endian.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use tracing::{debug, debug_span, trace};

use crate::builder::{ClassDump, SnapshotBuilder};
use crate::error::SnapshotError;
use crate::model::{BasicType, FieldDescriptor, FieldValue, HeapSnapshot, IdSize, ObjectId};

const MAGIC: &[u8] = b"JAVA PROFILE ";

mod tag {
    pub const STRING: u8 = 0x01;
    pub const LOAD_CLASS: u8 = 0x02;
    pub const HEAP_DUMP: u8 = 0x0c;
    pub const HEAP_DUMP_SEGMENT: u8 = 0x1c;
}

mod sub {
    pub const ROOT_UNKNOWN: u8 = 0xff;
    pub const ROOT_JNI_GLOBAL: u8 = 0x01;
    pub const ROOT_JNI_LOCAL: u8 = 0x02;
    pub const ROOT_JAVA_FRAME: u8 = 0x03;
    pub const ROOT_NATIVE_STACK: u8 = 0x04;
    pub const ROOT_STICKY_CLASS: u8 = 0x05;
    pub const ROOT_THREAD_BLOCK: u8 = 0x06;
    pub const ROOT_MONITOR_USED: u8 = 0x07;
    pub const ROOT_THREAD_OBJECT: u8 = 0x08;
    pub const CLASS_DUMP: u8 = 0x20;
    pub const INSTANCE_DUMP: u8 = 0x21;
    pub const OBJECT_ARRAY_DUMP: u8 = 0x22;
    pub const PRIMITIVE_ARRAY_DUMP: u8 = 0x23;
    pub const ROOT_INTERNED_STRING: u8 = 0x89;
    pub const ROOT_FINALIZING: u8 = 0x8a;
    pub const ROOT_DEBUGGER: u8 = 0x8b;
    pub const ROOT_REFERENCE_CLEANUP: u8 = 0x8c;
    pub const ROOT_VM_INTERNAL: u8 = 0x8d;
    pub const ROOT_JNI_MONITOR: u8 = 0x8e;
    pub const ROOT_UNREACHABLE: u8 = 0x90;
    pub const PRIMITIVE_ARRAY_NODATA: u8 = 0xc3;
    pub const HEAP_DUMP_INFO: u8 = 0xfe;
}

impl HeapSnapshot {
    /// Reads an HPROF file from disk.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] if the file cannot be read or is not a
    /// well-formed HPROF dump.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let path = path.as_ref();
        let _span = debug_span!("open", path = %path.display()).entered();
        let bytes = fs::read(path)?;
        parse(&bytes)
    }

    /// Reads an HPROF dump from any reader.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] on I/O failure or malformed input.
    pub fn from_reader(mut input: impl Read) -> Result<Self, SnapshotError> {
        let mut bytes = Vec::new();
        input.read_to_end(&mut bytes)?;
        parse(&bytes)
    }

    /// Parses an in-memory HPROF dump.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] on malformed input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        parse(bytes)
    }
}

/// Converts a JVM internal class name to source form.
///
/// `java/lang/String` becomes `java.lang.String`, `[Ljava/lang/Object;`
/// becomes `java.lang.Object[]` and `[[I` becomes `int[][]`. Names already
/// in source form (as Android writes them) pass through unchanged.
pub fn normalize_class_name(name: &str) -> String {
    let element = name.trim_start_matches('[');
    let dims = name.len() - element.len();
    if dims == 0 {
        return name.replace('/', ".");
    }

    let base = match element {
        "Z" => "boolean".to_owned(),
        "C" => "char".to_owned(),
        "F" => "float".to_owned(),
        "D" => "double".to_owned(),
        "B" => "byte".to_owned(),
        "S" => "short".to_owned(),
        "I" => "int".to_owned(),
        "J" => "long".to_owned(),
        other => other
            .strip_prefix('L')
            .and_then(|rest| rest.strip_suffix(';'))
            .unwrap_or(other)
            .replace('/', "."),
    };
    format!("{base}{}", "[]".repeat(dims))
}

/// Byte cursor over a slice, tracking absolute offsets for diagnostics.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    base: usize,
    id_size: IdSize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8], base: usize, id_size: IdSize) -> Self {
        Self {
            bytes,
            pos: 0,
            base,
            id_size,
        }
    }

    fn offset(&self) -> usize {
        self.base + self.pos
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], SnapshotError> {
        let end = self.pos.checked_add(len).filter(|&end| end <= self.bytes.len());
        let Some(end) = end else {
            return Err(SnapshotError::truncated(
                self.offset(),
                len - (self.bytes.len() - self.pos),
            ));
        };
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, len: usize) -> Result<(), SnapshotError> {
        self.take(len).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, SnapshotError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, SnapshotError> {
        let raw = self.take(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    fn u32(&mut self) -> Result<u32, SnapshotError> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn id(&mut self) -> Result<ObjectId, SnapshotError> {
        let raw = self.take(self.id_size.bytes())?;
        let id = raw.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
        Ok(ObjectId(id))
    }

    fn basic_type(&mut self) -> Result<BasicType, SnapshotError> {
        let offset = self.offset();
        let tag = self.u8()?;
        BasicType::from_tag(tag)
            .ok_or_else(|| SnapshotError::malformed(offset, format!("unknown basic type {tag}")))
    }

    fn value(&mut self, ty: BasicType) -> Result<FieldValue, SnapshotError> {
        let offset = self.offset();
        let raw = self.take(ty.value_size(self.id_size))?;
        ty.decode(raw, self.id_size)
            .ok_or_else(|| SnapshotError::malformed(offset, "undecodable value"))
    }
}

/// A class dump whose names are still string ids.
struct RawClassDump {
    object_id: ObjectId,
    super_object: ObjectId,
    instance_size: u32,
    static_fields: Vec<(u64, BasicType, FieldValue)>,
    instance_fields: Vec<(u64, BasicType)>,
}

/// Accumulates records until every name can be resolved.
struct Reader {
    builder: SnapshotBuilder,
    strings: HashMap<u64, String>,
    class_names: Vec<(ObjectId, u64)>,
    class_dumps: Vec<RawClassDump>,
}

fn parse(bytes: &[u8]) -> Result<HeapSnapshot, SnapshotError> {
    let Some(nul) = bytes.iter().position(|&b| b == 0) else {
        return Err(SnapshotError::unsupported("missing header terminator"));
    };
    let header = &bytes[..nul];
    if !header.starts_with(MAGIC) {
        let shown = String::from_utf8_lossy(&header[..header.len().min(32)]).into_owned();
        return Err(SnapshotError::unsupported(format!("header {shown:?}")));
    }

    // The identifier size is needed before the cursor can read ids, so
    // bootstrap with a placeholder width.
    let mut cursor = Cursor::new(&bytes[nul + 1..], nul + 1, IdSize::Four);
    let id_bytes = cursor.u32()?;
    let id_size = IdSize::from_bytes(id_bytes)
        .ok_or_else(|| SnapshotError::unsupported(format!("identifier size {id_bytes}")))?;
    cursor.id_size = id_size;
    cursor.skip(8)?; // timestamp

    debug!(
        version = %String::from_utf8_lossy(header),
        id_size = id_size.bytes(),
        "Parsing HPROF"
    );

    let mut reader = Reader {
        builder: SnapshotBuilder::new(id_size),
        strings: HashMap::new(),
        class_names: Vec::new(),
        class_dumps: Vec::new(),
    };

    let mut records = 0usize;
    while !cursor.is_empty() {
        let record_tag = cursor.u8()?;
        cursor.skip(4)?; // time delta
        let length = cursor.u32()? as usize;
        let body_offset = cursor.offset();
        let body = cursor.take(length)?;
        let mut body = Cursor::new(body, body_offset, id_size);
        records += 1;

        match record_tag {
            tag::STRING => {
                let id = body.id()?;
                let text = body.take(body.bytes.len() - body.pos)?;
                reader
                    .strings
                    .insert(id.0, String::from_utf8_lossy(text).into_owned());
            }
            tag::LOAD_CLASS => {
                body.skip(4)?; // class serial
                let class_object = body.id()?;
                body.skip(4)?; // stack trace serial
                let name_id = body.id()?;
                reader.class_names.push((class_object, name_id.0));
            }
            tag::HEAP_DUMP | tag::HEAP_DUMP_SEGMENT => {
                reader.heap_dump(&mut body)?;
            }
            other => trace!(tag = other, length, "Skipping record"),
        }
    }
    debug!(records, strings = reader.strings.len(), "Read HPROF records");

    reader.finish()
}

impl Reader {
    fn heap_dump(&mut self, body: &mut Cursor<'_>) -> Result<(), SnapshotError> {
        let id = body.id_size.bytes();
        while !body.is_empty() {
            let offset = body.offset();
            match body.u8()? {
                sub::ROOT_UNKNOWN
                | sub::ROOT_STICKY_CLASS
                | sub::ROOT_MONITOR_USED
                | sub::ROOT_INTERNED_STRING
                | sub::ROOT_FINALIZING
                | sub::ROOT_DEBUGGER
                | sub::ROOT_REFERENCE_CLEANUP
                | sub::ROOT_VM_INTERNAL
                | sub::ROOT_UNREACHABLE => body.skip(id)?,
                sub::ROOT_JNI_GLOBAL => body.skip(id * 2)?,
                sub::ROOT_NATIVE_STACK | sub::ROOT_THREAD_BLOCK => body.skip(id + 4)?,
                sub::ROOT_JNI_LOCAL
                | sub::ROOT_JAVA_FRAME
                | sub::ROOT_THREAD_OBJECT
                | sub::ROOT_JNI_MONITOR => body.skip(id + 8)?,
                sub::HEAP_DUMP_INFO => body.skip(4 + id)?,
                sub::CLASS_DUMP => self.class_dump(body)?,
                sub::INSTANCE_DUMP => {
                    let object = body.id()?;
                    body.skip(4)?;
                    let class_object = body.id()?;
                    let length = body.u32()? as usize;
                    let bytes = body.take(length)?.to_vec();
                    self.builder.instance(object, class_object, bytes);
                }
                sub::OBJECT_ARRAY_DUMP => {
                    let object = body.id()?;
                    body.skip(4)?;
                    let length = body.u32()? as usize;
                    let class_object = body.id()?;
                    let elements = (0..length)
                        .map(|_| body.id())
                        .collect::<Result<Vec<_>, _>>()?;
                    self.builder.object_array(object, class_object, elements);
                }
                sub::PRIMITIVE_ARRAY_DUMP => {
                    let object = body.id()?;
                    body.skip(4)?;
                    let length = body.u32()?;
                    let ty = body.basic_type()?;
                    let size = ty.value_size(body.id_size) * length as usize;
                    let bytes = body.take(size)?.to_vec();
                    self.builder.primitive_array(object, ty, length, bytes);
                }
                sub::PRIMITIVE_ARRAY_NODATA => {
                    let object = body.id()?;
                    body.skip(4)?;
                    let length = body.u32()?;
                    let ty = body.basic_type()?;
                    self.builder.primitive_array(object, ty, length, Vec::new());
                }
                other => {
                    return Err(SnapshotError::malformed(
                        offset,
                        format!("unknown heap dump sub-record {other:#04x}"),
                    ));
                }
            }
        }
        Ok(())
    }

    fn class_dump(&mut self, body: &mut Cursor<'_>) -> Result<(), SnapshotError> {
        let object_id = body.id()?;
        body.skip(4)?; // stack trace serial
        let super_object = body.id()?;
        // Class loader, signers, protection domain and two reserved ids.
        body.skip(body.id_size.bytes() * 5)?;
        let instance_size = body.u32()?;

        let constants = body.u16()?;
        for _ in 0..constants {
            body.skip(2)?;
            let ty = body.basic_type()?;
            body.skip(ty.value_size(body.id_size))?;
        }

        let statics = body.u16()?;
        let mut static_fields = Vec::with_capacity(usize::from(statics));
        for _ in 0..statics {
            let name = body.id()?;
            let ty = body.basic_type()?;
            let value = body.value(ty)?;
            static_fields.push((name.0, ty, value));
        }

        let fields = body.u16()?;
        let mut instance_fields = Vec::with_capacity(usize::from(fields));
        for _ in 0..fields {
            let name = body.id()?;
            let ty = body.basic_type()?;
            instance_fields.push((name.0, ty));
        }

        self.class_dumps.push(RawClassDump {
            object_id,
            super_object,
            instance_size,
            static_fields,
            instance_fields,
        });
        Ok(())
    }

    fn finish(mut self) -> Result<HeapSnapshot, SnapshotError> {
        let strings = std::mem::take(&mut self.strings);
        let name_of = |id: u64| {
            strings
                .get(&id)
                .cloned()
                .unwrap_or_else(|| format!("string@{id:#x}"))
        };

        for (class_object, name_id) in self.class_names {
            self.builder.class_name(class_object, &name_of(name_id));
        }
        for dump in self.class_dumps {
            self.builder.class_dump(ClassDump {
                object_id: dump.object_id,
                super_object: dump.super_object,
                instance_size: dump.instance_size,
                static_fields: dump
                    .static_fields
                    .into_iter()
                    .map(|(name, ty, value)| (FieldDescriptor::new(name_of(name), ty), value))
                    .collect(),
                instance_fields: dump
                    .instance_fields
                    .into_iter()
                    .map(|(name, ty)| FieldDescriptor::new(name_of(name), ty))
                    .collect(),
            });
        }
        self.builder.try_finish()
    }
}
