//! Topology resolution: turn a composite's declared connections into the
//! final edge set.
//!
//! Three layers are declared:
//! - always edges, included unconditionally;
//! - optional edges, included only if the destination currently declares the
//!   input port (checked against the built cell's schema, per instance);
//! - sink graphs, whole edge sets behind a boolean flag whose destination
//!   cells are observers that nothing in the primary pipeline may read.
//!
//! Resolution runs once when a composite is built.

use crate::Result;
use crate::cell::CellSchema;
use crate::composite::CellInfo;
use crate::graph::{Edge, GraphBuildError, Phase};

use anyhow::bail;
use log::debug;
use serde::Serialize;
use std::collections::BTreeMap;

/// Flag-gated observer sub-graph.
pub struct SinkGraph {
    pub name: String,
    pub enabled: bool,
    /// Cells owned by this sink graph; only instantiated when enabled.
    pub cells: Vec<(String, CellInfo)>,
    pub edges: Vec<Edge>,
}

impl SinkGraph {
    pub fn new(name: &str, enabled: bool) -> Self {
        Self {
            name: name.to_string(),
            enabled,
            cells: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn cell(mut self, name: &str, info: CellInfo) -> Self {
        self.cells.push((name.to_string(), info));
        self
    }

    pub fn edges(mut self, edges: impl IntoIterator<Item = Edge>) -> Self {
        self.edges.extend(edges);
        self
    }
}

/// Declared connections, before resolution.
#[derive(Default)]
pub struct Topology {
    pub always: Vec<Edge>,
    pub optional: Vec<Edge>,
    pub sinks: Vec<SinkGraph>,
}

impl Topology {
    pub fn always(&mut self, edges: impl IntoIterator<Item = Edge>) -> &mut Self {
        self.always.extend(edges);
        self
    }

    pub fn optional(&mut self, edges: impl IntoIterator<Item = Edge>) -> &mut Self {
        self.optional.extend(edges);
        self
    }

    pub fn sink(&mut self, sink: SinkGraph) -> &mut Self {
        self.sinks.push(sink);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Always,
    Optional,
    Sink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEdge {
    pub edge: Edge,
    pub layer: Layer,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedGraph {
    pub edges: Vec<ResolvedEdge>,
}

impl ResolvedGraph {
    #[cfg(test)]
    pub fn edges_in(&self, layer: Layer) -> Vec<&Edge> {
        self.edges
            .iter()
            .filter(|e| e.layer == layer)
            .map(|e| &e.edge)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

/// What resolution needs to know about the cells of a composite.
pub trait CellLookup {
    fn schema(&self, cell: &str) -> Option<&CellSchema>;
    fn is_sink(&self, cell: &str) -> bool;
    fn phase(&self, cell: &str) -> Option<Phase>;
}

/// Resolve the three layers against built cells.
///
/// `sinks` holds the edge sets of the enabled sink graphs only; their cells
/// must already be registered with `cells`.
pub fn resolve(
    always: &[Edge],
    optional: &[Edge],
    sinks: &[(String, Vec<Edge>)],
    cells: &impl CellLookup,
) -> Result<ResolvedGraph> {
    let mut out: Vec<ResolvedEdge> = Vec::new();

    for e in always {
        check_edge(e, cells)?;
        if cells.is_sink(&e.from.cell) {
            bail!(GraphBuildError::SinkFeedsPrimary { edge: e.to_string() });
        }
        out.push(ResolvedEdge {
            edge: e.clone(),
            layer: Layer::Always,
        });
    }

    for e in optional {
        let Some(dst) = cells.schema(&e.to.cell) else {
            bail!(GraphBuildError::DanglingConnection {
                edge: e.to_string(),
                reason: format!("unknown cell {}", e.to.cell),
            });
        };
        if !dst.has_input(&e.to.port) {
            debug!("{}: destination does not accept {}, edge omitted", e, e.to.port);
            continue;
        }
        check_edge(e, cells)?;
        if cells.is_sink(&e.from.cell) {
            bail!(GraphBuildError::SinkFeedsPrimary { edge: e.to_string() });
        }
        out.push(ResolvedEdge {
            edge: e.clone(),
            layer: Layer::Optional,
        });
    }

    for (name, edges) in sinks {
        debug!("sink graph {}: {} edges", name, edges.len());
        for e in edges {
            check_edge(e, cells)?;
            if !cells.is_sink(&e.to.cell) {
                bail!(GraphBuildError::SinkFeedsPrimary { edge: e.to_string() });
            }
            out.push(ResolvedEdge {
                edge: e.clone(),
                layer: Layer::Sink,
            });
        }
    }

    let mut producers: BTreeMap<(&str, &str), &Edge> = BTreeMap::new();
    for r in &out {
        let key = (r.edge.to.cell.as_str(), r.edge.to.port.as_str());
        if let Some(prev) = producers.insert(key, &r.edge) {
            bail!(GraphBuildError::DuplicateProducer {
                port: r.edge.to.to_string(),
                first: prev.from.to_string(),
                second: r.edge.from.to_string(),
            });
        }
    }

    for r in &out {
        if cells.phase(&r.edge.from.cell) != cells.phase(&r.edge.to.cell) {
            bail!(GraphBuildError::PhaseViolation {
                edge: r.edge.to_string(),
            });
        }
    }

    Ok(ResolvedGraph { edges: out })
}

fn check_edge(e: &Edge, cells: &impl CellLookup) -> Result<()> {
    let dangling = |reason: String| GraphBuildError::DanglingConnection {
        edge: e.to_string(),
        reason,
    };

    let Some(src) = cells.schema(&e.from.cell) else {
        bail!(dangling(format!("unknown cell {}", e.from.cell)));
    };
    let Some(out_port) = src.find_output(&e.from.port) else {
        bail!(dangling(format!("{} has no output {}", e.from.cell, e.from.port)));
    };
    let Some(dst) = cells.schema(&e.to.cell) else {
        bail!(dangling(format!("unknown cell {}", e.to.cell)));
    };
    let Some(in_port) = dst.find_input(&e.to.port) else {
        bail!(dangling(format!("{} has no input {}", e.to.cell, e.to.port)));
    };
    if !out_port.ty.compatible(in_port.ty) {
        bail!(GraphBuildError::TypeMismatch {
            edge: e.to_string(),
            source: out_port.ty.to_string(),
            destination: in_port.ty.to_string(),
        });
    }
    Ok(())
}
