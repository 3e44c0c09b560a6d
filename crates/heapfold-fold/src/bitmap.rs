//! Bitmap pixel recovery.
//!
//! On Android the pixels of a `Bitmap` live in a `byte[]` held by its
//! buffer field. When the folder absorbs that buffer into its bitmap, the
//! [`BitmapCollector`] hook decodes the bytes into an [`Image`] so large
//! bitmaps can be inspected visually.

use heapfold_snapshot::Snapshot;
use indexmap::IndexMap;
use tracing::debug;

use crate::config::BitmapConfig;
use crate::folder::LeafFoldHook;
use crate::graph::{NodeId, ObjectGraph};

const BUFFER_TYPE: &str = "byte[]";

/// Decoded bitmap pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    /// Row-major pixels packed as `0xAARRGGBB`.
    pub argb: Vec<u32>,
}

impl Image {
    /// Unpacks an RGBA8888 buffer.
    ///
    /// Returns `None` for empty dimensions or a buffer shorter than
    /// `width * height * 4` bytes. Trailing bytes are ignored.
    pub fn from_rgba(width: u32, height: u32, bytes: &[u8]) -> Option<Self> {
        let pixels = usize::try_from(u64::from(width) * u64::from(height)).ok()?;
        if pixels == 0 {
            return None;
        }
        let bytes = bytes.get(..pixels.checked_mul(4)?)?;
        let argb = bytes
            .chunks_exact(4)
            .map(|px| {
                let [r, g, b, a] = [px[0], px[1], px[2], px[3]].map(u32::from);
                (a << 24) | (r << 16) | (g << 8) | b
            })
            .collect();
        Some(Self {
            width,
            height,
            argb,
        })
    }

    /// Pixels as RGBA8888 bytes, the layout PNG encoders expect.
    pub fn to_rgba(&self) -> Vec<u8> {
        self.argb
            .iter()
            .flat_map(|&px| {
                let [a, r, g, b] = px.to_be_bytes();
                [r, g, b, a]
            })
            .collect()
    }
}

/// Leaf-fold hook that decodes bitmap buffers as they are folded.
///
/// Images are keyed by the bitmap's node. A bitmap whose buffer was shared
/// with another holder is decoded when it absorbs the buffer in the soft
/// pass.
pub struct BitmapCollector<'s, S: Snapshot + ?Sized> {
    snapshot: &'s S,
    config: BitmapConfig,
    images: IndexMap<NodeId, Image>,
}

impl<'s, S: Snapshot + ?Sized> BitmapCollector<'s, S> {
    pub fn new(snapshot: &'s S, config: BitmapConfig) -> Self {
        Self {
            snapshot,
            config,
            images: IndexMap::new(),
        }
    }

    pub fn images(&self) -> &IndexMap<NodeId, Image> {
        &self.images
    }

    pub fn into_images(self) -> IndexMap<NodeId, Image> {
        self.images
    }

    fn dimension(&self, graph: &ObjectGraph, bitmap: NodeId, field: &str) -> Option<u32> {
        let object = graph.node(bitmap).object()?;
        let value = self.snapshot.resolve_field(object, field).as_i64()?;
        u32::try_from(value).ok()
    }
}

impl<S: Snapshot + ?Sized> LeafFoldHook for BitmapCollector<'_, S> {
    fn on_leaf_folded(
        &mut self,
        graph: &ObjectGraph,
        parent: NodeId,
        leaf: NodeId,
        label: &str,
    ) {
        if label != self.config.buffer_field
            || graph.type_name(parent) != self.config.class_name
            || graph.type_name(leaf) != BUFFER_TYPE
        {
            return;
        }

        let snapshot = self.snapshot;
        let width = self.dimension(graph, parent, &self.config.width_field);
        let height = self.dimension(graph, parent, &self.config.height_field);
        let bytes = graph
            .node(leaf)
            .object()
            .and_then(|buffer| snapshot.primitive_array_bytes(buffer));
        let (Some(width), Some(height), Some(bytes)) = (width, height, bytes)
        else {
            debug!(bitmap = %parent, "Bitmap without dimensions or pixel data");
            return;
        };

        match Image::from_rgba(width, height, bytes) {
            Some(image) => {
                debug!(bitmap = %parent, width, height, "Decoded bitmap");
                self.images.insert(parent, image);
            }
            None => debug!(
                bitmap = %parent,
                width,
                height,
                len = bytes.len(),
                "Bitmap buffer too short"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use heapfold_snapshot::{
        BasicType, FieldValue, HeapSnapshot, IdSize, ObjectId, PrimitiveValue,
        SnapshotBuilder,
    };

    use super::*;

    #[test]
    fn test_from_rgba_packs_argb() {
        let image = Image::from_rgba(2, 1, &[1, 2, 3, 4, 5, 6, 7, 8, 99]).unwrap();

        assert_eq!(image.argb, [0x0401_0203, 0x0805_0607]);
        assert_eq!(image.to_rgba(), [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_from_rgba_rejects_short_buffers() {
        assert_eq!(Image::from_rgba(2, 2, &[0; 15]), None);
        assert_eq!(Image::from_rgba(0, 4, &[0; 16]), None);
    }

    const BITMAP: ObjectId = ObjectId(0x10);
    const BYTES: ObjectId = ObjectId(0x11);

    /// Bitmap 1 (2x1) owns buffer 2.
    fn snapshot(buffer_len: usize) -> HeapSnapshot {
        let mut b = SnapshotBuilder::new(IdSize::Four);
        b.define_class(BITMAP, "android.graphics.Bitmap", ObjectId::NULL, 16, &[
            ("mBuffer", BasicType::Object),
            ("mWidth", BasicType::Int),
            ("mHeight", BasicType::Int),
        ]);
        b.class_name(BYTES, "[B");
        b.instance_values(ObjectId(1), BITMAP, &[
            FieldValue::Object(ObjectId(2)),
            FieldValue::Primitive(PrimitiveValue::Int(2)),
            FieldValue::Primitive(PrimitiveValue::Int(1)),
        ]);
        let length = u32::try_from(buffer_len).unwrap();
        b.primitive_array(
            ObjectId(2),
            BasicType::Byte,
            length,
            (1..=buffer_len).map(|i| u8::try_from(i).unwrap()).collect(),
        );
        b.finish()
    }

    fn graph() -> (ObjectGraph, NodeId, NodeId) {
        let mut graph = ObjectGraph::new();
        let bitmap = graph.add_node(ObjectId(1), "android.graphics.Bitmap", 16);
        let buffer = graph.add_node(ObjectId(2), "byte[]", 8);
        (graph, bitmap, buffer)
    }

    #[test]
    fn test_collects_bitmap_buffer() {
        let heap = snapshot(8);
        let (graph, bitmap, buffer) = graph();
        let mut collector = BitmapCollector::new(&heap, BitmapConfig::default());

        collector.on_leaf_folded(&graph, bitmap, buffer, "mBuffer");

        let image = &collector.images()[&bitmap];
        assert_eq!((image.width, image.height), (2, 1));
        assert_eq!(image.argb[0], 0x0401_0203);
    }

    #[test]
    fn test_ignores_other_fields_and_short_buffers() {
        let (graph, bitmap, buffer) = graph();

        let full = snapshot(8);
        let mut collector = BitmapCollector::new(&full, BitmapConfig::default());
        collector.on_leaf_folded(&graph, bitmap, buffer, "mNinePatchChunk");
        assert!(collector.images().is_empty());

        let short = snapshot(7);
        let mut collector = BitmapCollector::new(&short, BitmapConfig::default());
        collector.on_leaf_folded(&graph, bitmap, buffer, "mBuffer");
        assert!(collector.into_images().is_empty());
    }
}
