//! Text and serializable renderings of the component tree.

use std::io::Write;

use petgraph::graph::NodeIndex;
use serde::Serialize;

use crate::tree::{ComponentNode, ComponentTree};

/// Label printed for the root component, whose name is empty.
const ROOT_DISPLAY: &str = "<all>";

/// Serializable snapshot of one component and, depth permitting, its
/// children.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentSummary {
    pub name: String,
    pub is_class: bool,
    pub instances: usize,
    pub self_size: u64,
    pub soft_size: f64,
    pub ret_size: u64,
    pub all_size: u64,
    pub retained_objects: usize,
    pub unique_objects: usize,
    /// Number of direct children, including any cut off by the depth
    /// limit.
    pub child_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ComponentSummary>,
}

impl ComponentTree {
    /// Writes the tree one component per line, children indented by two
    /// spaces and ordered by soft size.
    ///
    /// `max_depth` limits how many levels below the root are printed.
    pub fn write_report(
        &self,
        mut w: impl Write,
        max_depth: Option<usize>,
    ) -> std::io::Result<()> {
        self.write_component(&mut w, self.root_index(), 0, max_depth)
    }

    fn write_component(
        &self,
        w: &mut impl Write,
        index: NodeIndex,
        depth: usize,
        max_depth: Option<usize>,
    ) -> std::io::Result<()> {
        let children = self.sorted_children(index);
        let component = self.node(index);
        let name = if component.name().is_empty() {
            ROOT_DISPLAY
        } else {
            component.name()
        };
        writeln!(
            w,
            "{:indent$}{name}: {} children, {} instances, {} bytes unique in {} objects of {} bytes and {} objects",
            "",
            children.len(),
            component.objects().len(),
            component.ret_size(),
            component.unique().len(),
            component.all_size(),
            component.retains().len(),
            indent = depth * 2,
        )?;

        if max_depth.is_none_or(|max| depth < max) {
            for child in children {
                self.write_component(w, child, depth + 1, max_depth)?;
            }
        }
        Ok(())
    }

    /// Summarizes the tree down to `max_depth` levels below the root.
    pub fn summary(&self, max_depth: Option<usize>) -> ComponentSummary {
        self.summarize(self.root_index(), 0, max_depth)
    }

    fn summarize(
        &self,
        index: NodeIndex,
        depth: usize,
        max_depth: Option<usize>,
    ) -> ComponentSummary {
        let child_indices = self.sorted_children(index);
        let children = if max_depth.is_none_or(|max| depth < max) {
            child_indices
                .iter()
                .map(|&child| self.summarize(child, depth + 1, max_depth))
                .collect()
        } else {
            Vec::new()
        };
        summary_of(self.node(index), child_indices.len(), children)
    }
}

fn summary_of(
    component: &ComponentNode,
    child_count: usize,
    children: Vec<ComponentSummary>,
) -> ComponentSummary {
    ComponentSummary {
        name: component.name().to_owned(),
        is_class: component.is_class(),
        instances: component.objects().len(),
        self_size: component.self_size(),
        soft_size: component.soft_size(),
        ret_size: component.ret_size(),
        all_size: component.all_size(),
        retained_objects: component.retains().len(),
        unique_objects: component.unique().len(),
        child_count,
        children,
    }
}
