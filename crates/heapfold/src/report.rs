//! Analysis report: fold statistics, the largest survivors, a per-type
//! table and the component tree.

use std::io::Write;

use heapfold_components::{ComponentSummary, ComponentTree};
use heapfold_fold::{Analysis, FoldStats, NodeId, ObjectGraph};
use itertools::Itertools;
use serde::Serialize;

/// Rounds a weighted size for display.
#[expect(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "weighted sizes are non-negative byte counts far below 2^64"
)]
pub(crate) fn rounded(size: f64) -> u64 {
    size.round() as u64
}

/// A bitmap retained by a listed survivor.
#[derive(Debug, Serialize)]
pub struct RetainedBitmap {
    pub object_id: u64,
    pub size: f64,
    /// Field path from the survivor to the bitmap.
    pub path: String,
}

/// One survivor in the object listing.
#[derive(Debug, Serialize)]
pub struct ObjectRow {
    pub type_name: String,
    pub object_id: Option<u64>,
    pub size: f64,
    pub in_refs: usize,
    pub out_refs: usize,
    pub ret_size: u64,
    pub all_size: u64,
    pub unique_objects: usize,
    pub bitmaps: Vec<RetainedBitmap>,
}

/// Survivors of one type, summed.
#[derive(Debug, Serialize)]
pub struct TypeRow {
    pub type_name: String,
    pub instances: usize,
    pub size: f64,
    /// Share of the total weighted size, in percent.
    pub percent: f64,
    pub ret_size: u64,
}

/// Everything printed for one analysis run.
#[derive(Debug, Serialize)]
pub struct Report<'a> {
    pub stats: FoldStats,
    pub total_size: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<ObjectRow>,
    pub types: Vec<TypeRow>,
    pub components: ComponentSummary,
    #[serde(skip)]
    tree: &'a ComponentTree,
    #[serde(skip)]
    depth: Option<usize>,
}

impl<'a> Report<'a> {
    /// Collects the report for a finished analysis.
    ///
    /// `objects` is how many of the largest survivors to list;
    /// `bitmap_class` names the type whose retained instances are called
    /// out in that listing.
    pub fn new(
        analysis: &Analysis,
        tree: &'a ComponentTree,
        objects: usize,
        depth: Option<usize>,
        bitmap_class: &str,
    ) -> Self {
        let graph = &analysis.graph;
        let total_size: f64 =
            analysis.survivors.iter().map(|&id| graph.node(id).size()).sum();

        let objects = analysis
            .survivors
            .iter()
            .take(objects)
            .map(|&id| object_row(graph, id, bitmap_class))
            .collect();

        Self {
            stats: analysis.stats.clone(),
            total_size,
            objects,
            types: type_rows(graph, &analysis.survivors, total_size),
            components: tree.summary(depth),
            tree,
            depth,
        }
    }

    /// Writes the plain-text report.
    pub fn write_text(&self, mut w: impl Write) -> std::io::Result<()> {
        let stats = &self.stats;
        writeln!(
            w,
            "Nodes: {} -> {} ({} leaves, {} list nodes, {} helpers folded)",
            stats.initial_nodes,
            stats.final_nodes,
            stats.leaves_folded,
            stats.list_nodes_merged,
            stats.helpers_folded,
        )?;
        writeln!(w, "Total size: {}", rounded(self.total_size))?;

        if !self.objects.is_empty() {
            writeln!(w)?;
        }
        for row in &self.objects {
            writeln!(
                w,
                "{}, weighted_size={}, inRefs={}, outRefs={}, retain_size={} ({} objects)",
                row.type_name,
                rounded(row.size),
                row.in_refs,
                row.out_refs,
                row.ret_size,
                row.unique_objects,
            )?;
            for bitmap in &row.bitmaps {
                writeln!(
                    w,
                    "  Bitmap {} ({} bytes):",
                    bitmap.object_id,
                    rounded(bitmap.size)
                )?;
                writeln!(w, "    {}", bitmap.path)?;
            }
        }

        writeln!(w, "\nComponents count: {}", self.types.len())?;
        for row in &self.types {
            writeln!(
                w,
                "{} => {} ({:.2}%) / {}",
                row.type_name,
                rounded(row.size),
                row.percent,
                row.ret_size
            )?;
        }

        writeln!(w)?;
        self.tree.write_report(&mut w, self.depth)
    }

    /// Writes the report as pretty-printed JSON.
    pub fn write_json(&self, mut w: impl Write) -> serde_json::Result<()> {
        serde_json::to_writer_pretty(&mut w, self)?;
        writeln!(w).map_err(serde_json::Error::io)
    }
}

fn object_row(graph: &ObjectGraph, id: NodeId, bitmap_class: &str) -> ObjectRow {
    let node = graph.node(id);
    let bitmaps = node
        .retains()
        .iter()
        .filter(|&(&retained, _)| graph.type_name(retained) == bitmap_class)
        .map(|(&retained, path)| {
            let bitmap = graph.node(retained);
            RetainedBitmap {
                object_id: bitmap.object().map_or(0, |object| object.0),
                size: bitmap.size(),
                path: path.clone(),
            }
        })
        .collect();

    ObjectRow {
        type_name: graph.type_name(id).to_owned(),
        object_id: node.object().map(|object| object.0),
        size: node.size(),
        in_refs: node.in_refs().len(),
        out_refs: node.out_refs().len(),
        ret_size: node.ret_size(),
        all_size: node.all_size(),
        unique_objects: node.unique().len(),
        bitmaps,
    }
}

/// Groups survivors by type, largest summed size first.
fn type_rows(graph: &ObjectGraph, survivors: &[NodeId], total_size: f64) -> Vec<TypeRow> {
    survivors
        .iter()
        .into_group_map_by(|&&id| graph.type_name(id))
        .into_iter()
        .map(|(type_name, ids)| {
            let size: f64 = ids.iter().map(|&&id| graph.node(id).size()).sum();
            let percent = if total_size > 0.0 {
                size * 100.0 / total_size
            } else {
                0.0
            };
            TypeRow {
                type_name: type_name.to_owned(),
                instances: ids.len(),
                size,
                percent,
                ret_size: ids.iter().map(|&&id| graph.node(id).ret_size()).sum(),
            }
        })
        .sorted_by(|a, b| {
            b.size
                .total_cmp(&a.size)
                .then_with(|| a.type_name.cmp(&b.type_name))
        })
        .collect()
}
