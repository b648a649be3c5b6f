//! Renderings of a built composite's resolved graph.

pub mod dot;

pub use dot::render_dot;

use crate::Result;
use crate::composite::Composite;
use crate::graph::{Layer, Phase, ResolvedForward, Role};

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct CellView {
    pub name: String,
    pub type_name: String,
    pub phase: Phase,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeView {
    pub from: String,
    pub from_port: String,
    pub to: String,
    pub to_port: String,
    pub layer: Layer,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForwardView {
    pub name: String,
    pub cell: String,
    pub key: String,
}

/// Everything a rendering shows, in a serializable shape.
#[derive(Debug, Clone, Serialize)]
pub struct GraphView {
    pub composite: String,
    /// In declaration order.
    pub cells: Vec<CellView>,
    pub edges: Vec<EdgeView>,
    /// Tick order.
    pub order: Vec<String>,
    /// Forwarded cell parameters; direct parameters are not listed.
    pub params: Vec<ForwardView>,
    pub inputs: Vec<ForwardView>,
    pub outputs: Vec<ForwardView>,
}

impl GraphView {
    pub fn of(composite: &Composite) -> Self {
        let forwards = |list: &[ResolvedForward]| -> Vec<ForwardView> {
            list.iter()
                .map(|f| ForwardView {
                    name: f.name.clone(),
                    cell: f.cell.clone(),
                    key: f.key.clone(),
                })
                .collect()
        };
        Self {
            composite: composite.type_name().to_string(),
            cells: composite
                .cells()
                .map(|slot| CellView {
                    name: slot.name.clone(),
                    type_name: slot.cell.schema().type_name.clone(),
                    phase: slot.phase,
                    role: slot.role,
                })
                .collect(),
            edges: composite
                .graph()
                .edges
                .iter()
                .map(|e| EdgeView {
                    from: e.edge.from.cell.clone(),
                    from_port: e.edge.from.port.clone(),
                    to: e.edge.to.cell.clone(),
                    to_port: e.edge.to.port.clone(),
                    layer: e.layer,
                })
                .collect(),
            order: composite.order().into_iter().map(String::from).collect(),
            params: forwards(composite.param_forwards()),
            inputs: forwards(composite.input_forwards()),
            outputs: forwards(composite.output_forwards()),
        }
    }
}

pub fn render_json(view: &GraphView) -> Result<String> {
    Ok(serde_json::to_string_pretty(view)?)
}
