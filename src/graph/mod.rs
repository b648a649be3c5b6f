//! Graph layer: forward tables, connection edges, topology resolution and
//! scheduling.
//!
//! Nothing in here knows what a cell computes. It only works on names,
//! schemas and edges, and everything it checks is checked at build time.

pub mod edge;
pub mod error;
pub mod forward;
pub mod schedule;
pub mod topology;

pub use edge::{Edge, edge, edges};
pub use error::GraphBuildError;
pub use forward::{Forward, ForwardKind, Forwards, ResolvedForward};
pub use schedule::{Binding, Scheduler, Source};
pub use topology::{CellLookup, Layer, ResolvedGraph, SinkGraph, Topology};

use serde::Serialize;

/// When a cell runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Once per pass, i.e. per observation/frame.
    Frame,
    /// Once, after a source cell reported exhaustion.
    Finalize,
}

/// How a cell entered its composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Declared by the composite; may be forwarded.
    Declared,
    /// Helper created during configuration; never forwarded.
    Internal,
    /// Observer owned by an enabled sink graph.
    Sink,
}
