//! Component tree for folded heap graphs.
//!
//! The survivors of folding are grouped by class name into a hierarchy of
//! name prefixes: `com.x.Foo$Bar` sits under `com.x.Foo`, which sits under
//! `com.x`, then `com`, then the root. Every component sums the sizes of
//! everything below it, so whole packages and outer classes can be
//! compared at a glance.
//!
//! ## Sizes
//!
//! - **self**: bytes of the surviving objects themselves
//! - **soft**: weighted size, including bytes folded into the survivors
//! - **retained**: self plus the objects retained only from inside the
//!   component
//! - **all**: self plus every object retained from inside the component
//!
//! ## Usage
//!
//! ```no_run
//! use heapfold_components::ComponentTree;
//! use heapfold_fold::{AnalyzerConfig, analyze_file};
//!
//! let analysis = analyze_file("dump.hprof", &AnalyzerConfig::default(), false).unwrap();
//! let tree = ComponentTree::build(&analysis.graph, &analysis.survivors);
//! tree.write_report(std::io::stdout().lock(), Some(3)).unwrap();
//! ```

mod report;
#[cfg(test)]
mod testutil;
mod tree;

#[doc(inline)]
pub use crate::report::ComponentSummary;
#[doc(inline)]
pub use crate::tree::{ComponentNode, ComponentTree};
