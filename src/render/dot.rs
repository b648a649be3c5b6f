use crate::graph::{Layer, Phase, Role};
use crate::render::GraphView;

/// Render a Graphviz digraph.
///
/// The template is filled with `replace` rather than `format!` because the
/// DOT body braces would have to be escaped.
pub fn render_dot(view: &GraphView) -> String {
    const TEMPLATE: &str = r#"digraph "__NAME__" {
  rankdir=LR;
  node [shape=box, fontname="Helvetica"];
  edge [fontname="Helvetica", fontsize=10];
__INPUTS__
__NODES__
__EDGES__
__OUTPUTS__
}
"#;

    let mut nodes = Vec::new();
    for cell in &view.cells {
        let mut attrs = vec![format!("label=\"{}\\n{}\"", cell.name, cell.type_name)];
        if cell.role == Role::Sink {
            attrs.push("style=dashed".to_string());
        }
        if cell.role == Role::Internal {
            attrs.push("color=gray40".to_string());
        }
        if cell.phase == Phase::Finalize {
            attrs.push("peripheries=2".to_string());
        }
        nodes.push(format!("  \"{}\" [{}];", cell.name, attrs.join(", ")));
    }

    let edges: Vec<String> = view
        .edges
        .iter()
        .map(|e| {
            let style = match e.layer {
                Layer::Always => "",
                Layer::Optional => ", style=bold",
                Layer::Sink => ", style=dashed",
            };
            format!(
                "  \"{}\" -> \"{}\" [label=\"{} → {}\"{}];",
                e.from, e.to, e.from_port, e.to_port, style
            )
        })
        .collect();

    // composite-level ports as plain text endpoints
    let inputs: Vec<String> = view
        .inputs
        .iter()
        .map(|f| {
            format!(
                "  \"in:{name}\" [shape=plaintext, label=\"{name}\"];\n  \"in:{name}\" -> \"{}\" [label=\"{}\", style=dotted];",
                f.cell,
                f.key,
                name = f.name
            )
        })
        .collect();
    let outputs: Vec<String> = view
        .outputs
        .iter()
        .map(|f| {
            format!(
                "  \"out:{name}\" [shape=plaintext, label=\"{name}\"];\n  \"{}\" -> \"out:{name}\" [label=\"{}\", style=dotted];",
                f.cell,
                f.key,
                name = f.name
            )
        })
        .collect();

    TEMPLATE
        .replace("__NAME__", &view.composite)
        .replace("__INPUTS__", &inputs.join("\n"))
        .replace("__NODES__", &nodes.join("\n"))
        .replace("__EDGES__", &edges.join("\n"))
        .replace("__OUTPUTS__", &outputs.join("\n"))
}
