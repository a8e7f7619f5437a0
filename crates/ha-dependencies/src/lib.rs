//! Automation Dependency Graph
//!
//! Directed "depends-on" edges between automations of the same connection.
//! Edges are authored externally and are read-mostly here; the only removal
//! path is an explicit [`DependencyGraph::remove_dependency`] call.
//!
//! Traversals walk *reverse* edges ("who depends on me") with a visited set,
//! so cyclic graphs terminate. Every traversal is bounded by a depth and a
//! wall-clock budget.

mod graph;

pub use graph::{
    BlockingDependents, DependencyAnalysis, DependencyGraph, DependencySnapshot,
    RetirementResolution, STORAGE_KEY,
};
