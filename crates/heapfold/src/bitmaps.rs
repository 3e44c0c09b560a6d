//! PNG export of decoded bitmaps.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use heapfold_fold::{Image, NodeId, ObjectGraph};
use tracing::{debug, info};

use crate::report::rounded;

/// Writes every image as `<object id>-<weighted size>.png` into `dir`,
/// creating it if needed. Returns the written paths.
pub fn write_pngs<'a>(
    dir: &Path,
    graph: &ObjectGraph,
    images: impl IntoIterator<Item = (&'a NodeId, &'a Image)>,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;

    let mut written = Vec::new();
    for (&id, image) in images {
        let node = graph.node(id);
        let object = node.object().map_or(0, |object| object.0);
        let path = dir.join(format!("{object}-{}.png", rounded(node.size())));
        write_png(&path, image)
            .with_context(|| format!("failed to write {}", path.display()))?;
        debug!(path = %path.display(), image.width, image.height, "Wrote bitmap");
        written.push(path);
    }

    info!(count = written.len(), dir = %dir.display(), "Wrote bitmaps");
    Ok(written)
}

fn write_png(path: &Path, image: &Image) -> Result<()> {
    let file = BufWriter::new(File::create(path)?);
    let mut encoder = png::Encoder::new(file, image.width, image.height);
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header()?;
    writer.write_image_data(&image.to_rgba())?;
    writer.finish()?;
    Ok(())
}
