//! Object graph reduction for heap snapshots.
//!
//! This crate turns a [`Snapshot`] into a handful of surviving objects that
//! carry the weight of everything they hold. It is the core of heapfold;
//! the component tree and the reports are built on top of its output.
//!
//! ## Pipeline
//!
//! 1. [`load`] walks the snapshot from every instance of the root class and
//!    builds an [`ObjectGraph`] of labeled references
//! 2. [`flatten`] collects the reachable nodes into a [`WorkingSet`]
//! 3. [`fold_graph`] removes leaves, linked-list spines and helper objects
//!    until nothing changes, crediting their bytes to the survivors
//! 4. [`aggregate`] works out which folded objects each survivor retains
//!    on its own
//!
//! [`analyze`] runs all four steps; [`analyze_file`] also opens the dump.
//!
//! ## Usage
//!
//! ```no_run
//! use heapfold_fold::{AnalyzerConfig, analyze_file};
//!
//! let config = AnalyzerConfig::default();
//! let analysis = analyze_file("dump.hprof", &config, false).unwrap();
//! for &id in analysis.survivors.iter().take(10) {
//!     let node = analysis.graph.node(id);
//!     println!("{} {:.0}", analysis.graph.type_name(id), node.size());
//! }
//! ```

mod bitmap;
mod config;
mod error;
mod flatten;
mod folder;
mod graph;
mod loader;
mod retention;
#[cfg(test)]
mod testutil;

use std::path::Path;

use heapfold_snapshot::{HeapSnapshot, Snapshot};
use indexmap::IndexMap;
use tracing::{debug_span, error, info};

#[doc(inline)]
pub use crate::bitmap::{BitmapCollector, Image};
#[doc(inline)]
pub use crate::config::{AnalyzerConfig, BitmapConfig};
#[doc(inline)]
pub use crate::error::AnalysisError;
#[doc(inline)]
pub use crate::flatten::flatten;
#[doc(inline)]
pub use crate::folder::{
    FoldMode, FoldStats, LeafFoldHook, fold_graph, fold_helpers, fold_leaves,
    fold_linked_lists, singleton_types,
};
#[doc(inline)]
pub use crate::graph::{
    NodeId, ObjectGraph, ObjectNode, TypeId, WorkingSet, combine,
};
#[doc(inline)]
pub use crate::loader::{ROOT_LABEL, load};
#[doc(inline)]
pub use crate::retention::aggregate;

/// Result of a full analysis run.
#[derive(Debug)]
pub struct Analysis {
    /// The arena, including every folded node.
    pub graph: ObjectGraph,
    /// Surviving nodes, largest weighted size first.
    pub survivors: Vec<NodeId>,
    pub stats: FoldStats,
    /// Decoded bitmaps keyed by the bitmap's node. Empty unless a
    /// [`BitmapCollector`] was used.
    pub bitmaps: IndexMap<NodeId, Image>,
}

/// Runs load, flatten, fold and aggregate over a snapshot.
///
/// `hook` is called for every leaf fold.
pub fn analyze<S: Snapshot + ?Sized>(
    snapshot: &S,
    config: &AnalyzerConfig,
    hook: &mut dyn LeafFoldHook,
) -> Analysis {
    let _span = debug_span!("analyze").entered();

    let mut graph = load(snapshot, config);
    let mut working = flatten(&graph);
    let stats = fold_graph(&mut graph, &mut working, config, hook);
    let survivors = aggregate(&mut graph, &working);

    Analysis {
        graph,
        survivors,
        stats,
        bitmaps: IndexMap::new(),
    }
}

/// Opens an HPROF dump and analyzes it.
///
/// With `collect_bitmaps`, bitmap buffers are decoded as they are folded
/// and returned in [`Analysis::bitmaps`].
///
/// # Errors
///
/// Returns [`AnalysisError`] if the dump cannot be read or parsed
/// ([`AnalysisError::is_snapshot`]).
pub fn analyze_file(
    path: impl AsRef<Path>,
    config: &AnalyzerConfig,
    collect_bitmaps: bool,
) -> Result<Analysis, AnalysisError> {
    let path = path.as_ref();
    let _span = debug_span!("analyze_file", path = %path.display()).entered();

    let snapshot = HeapSnapshot::open(path).map_err(|e| {
        error!(path = %path.display(), "Failed to read heap snapshot: {e}");
        AnalysisError::from(e)
    })?;
    info!(path = %path.display(), "Loaded heap snapshot");

    if !collect_bitmaps {
        return Ok(analyze(&snapshot, config, &mut ()));
    }

    let mut collector = BitmapCollector::new(&snapshot, config.bitmap.clone());
    let mut analysis = analyze(&snapshot, config, &mut collector);
    analysis.bitmaps = collector.into_images();
    info!(bitmaps = analysis.bitmaps.len(), "Decoded bitmaps");
    Ok(analysis)
}
