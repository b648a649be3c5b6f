//! Forward tables: composite-level names mapped onto cell-level ports and
//! parameters.
//!
//! A table maps a cell name to the list of forwards taken from it. `All` is
//! kept symbolic until the target schema is known; `resolve` expands it into
//! one concrete forward per entry the cell currently declares.

use crate::Result;
use crate::cell::PortType;
use crate::graph::GraphBuildError;

use anyhow::bail;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Forward {
    Key { key: String, new_key: Option<String> },
    /// Every current entry of the cell, unchanged.
    All,
}

impl Forward {
    pub fn key(key: &str) -> Self {
        Forward::Key {
            key: key.to_string(),
            new_key: None,
        }
    }

    pub fn renamed(key: &str, new_key: &str) -> Self {
        Forward::Key {
            key: key.to_string(),
            new_key: Some(new_key.to_string()),
        }
    }
}

pub type ForwardTable = BTreeMap<String, Vec<Forward>>;

/// The three tables a composite declares.
#[derive(Debug, Clone, Default)]
pub struct Forwards {
    pub params: ForwardTable,
    pub inputs: ForwardTable,
    pub outputs: ForwardTable,
}

impl Forwards {
    pub fn param(mut self, cell: &str, forwards: Vec<Forward>) -> Self {
        self.params.entry(cell.to_string()).or_default().extend(forwards);
        self
    }

    pub fn input(mut self, cell: &str, forwards: Vec<Forward>) -> Self {
        self.inputs.entry(cell.to_string()).or_default().extend(forwards);
        self
    }

    pub fn output(mut self, cell: &str, forwards: Vec<Forward>) -> Self {
        self.outputs.entry(cell.to_string()).or_default().extend(forwards);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardKind {
    Parameter,
    Input,
    Output,
}

impl ForwardKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ForwardKind::Parameter => "parameter",
            ForwardKind::Input => "input",
            ForwardKind::Output => "output",
        }
    }
}

/// A name/type/doc triple a target cell offers to be forwarded.
#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub ty: PortType,
    pub doc: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedForward {
    /// Composite-level name.
    pub name: String,
    pub cell: String,
    /// Cell-level name.
    pub key: String,
    pub ty: PortType,
    pub doc: String,
}

/// Expand and check one forward table.
///
/// `entries` returns what a cell offers, or `None` if the cell is unknown.
/// Several forwards may share a composite name (fan-out) when their types
/// agree; an output name may never have two sources.
pub fn resolve<F>(kind: ForwardKind, table: &ForwardTable, entries: F) -> Result<Vec<ResolvedForward>>
where
    F: Fn(&str) -> Option<Vec<Entry>>,
{
    let mut out: Vec<ResolvedForward> = Vec::new();

    for (cell, forwards) in table {
        let Some(offered) = entries(cell) else {
            bail!(GraphBuildError::DanglingForward {
                kind: kind.as_str(),
                cell: cell.clone(),
                key: "*".to_string(),
            });
        };

        for forward in forwards {
            let expanded: Vec<ResolvedForward> = match forward {
                Forward::All => offered
                    .iter()
                    .map(|e| ResolvedForward {
                        name: e.name.clone(),
                        cell: cell.clone(),
                        key: e.name.clone(),
                        ty: e.ty,
                        doc: e.doc.clone(),
                    })
                    .collect(),
                Forward::Key { key, new_key } => {
                    let Some(entry) = offered.iter().find(|e| &e.name == key) else {
                        bail!(GraphBuildError::DanglingForward {
                            kind: kind.as_str(),
                            cell: cell.clone(),
                            key: key.clone(),
                        });
                    };
                    vec![ResolvedForward {
                        name: new_key.clone().unwrap_or_else(|| key.clone()),
                        cell: cell.clone(),
                        key: key.clone(),
                        ty: entry.ty,
                        doc: entry.doc.clone(),
                    }]
                }
            };

            for f in expanded {
                if out.iter().any(|o| o.name == f.name && o.cell == f.cell && o.key == f.key) {
                    continue;
                }
                if let Some(prev) = out.iter().find(|o| o.name == f.name) {
                    let detail = if kind == ForwardKind::Output {
                        Some(format!("both {}.{} and {}.{}", prev.cell, prev.key, f.cell, f.key))
                    } else if !prev.ty.compatible(f.ty) {
                        Some(format!(
                            "{}.{} is {} but {}.{} is {}",
                            prev.cell, prev.key, prev.ty, f.cell, f.key, f.ty
                        ))
                    } else {
                        None
                    };
                    if let Some(detail) = detail {
                        bail!(GraphBuildError::ForwardCollision {
                            kind: kind.as_str(),
                            name: f.name.clone(),
                            detail,
                        });
                    }
                }
                out.push(f);
            }
        }
    }

    Ok(out)
}

/// Composite-level names in first-seen order.
pub fn names(resolved: &[ResolvedForward]) -> Vec<&ResolvedForward> {
    let mut seen: Vec<&ResolvedForward> = Vec::new();
    for f in resolved {
        if !seen.iter().any(|s| s.name == f.name) {
            seen.push(f);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn offered(cell: &str) -> Option<Vec<Entry>> {
        let entry = |name: &str, ty| Entry {
            name: name.to_string(),
            ty,
            doc: format!("{} doc", name),
        };
        match cell {
            "source" => Some(vec![
                entry("image", PortType::Any),
                entry("depth", PortType::Any),
            ]),
            "feature_descriptor" => Some(vec![
                entry("image", PortType::Image),
                entry("mask", PortType::GrayImage),
                entry("keypoints", PortType::Keypoints),
            ]),
            "depth_map" => Some(vec![entry("depth", PortType::DepthMap)]),
            _ => None,
        }
    }

    fn table(entries: &[(&str, Vec<Forward>)]) -> ForwardTable {
        entries
            .iter()
            .map(|(c, f)| (c.to_string(), f.clone()))
            .collect()
    }

    #[test]
    fn wildcard_expands_against_the_schema() {
        let t = table(&[("source", vec![Forward::All])]);
        let got = resolve(ForwardKind::Input, &t, offered).unwrap();
        let names: Vec<&str> = got.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["image", "depth"]);
    }

    #[test]
    fn rename_keeps_the_cell_level_key() {
        let t = table(&[("feature_descriptor", vec![Forward::renamed("keypoints", "kps")])]);
        let got = resolve(ForwardKind::Output, &t, offered).unwrap();
        assert_eq!(got[0].name, "kps");
        assert_eq!(got[0].key, "keypoints");
        assert_eq!(got[0].ty, PortType::Keypoints);
    }

    #[test]
    fn dangling_cell_and_key_are_errors() {
        let t = table(&[("nope", vec![Forward::key("image")])]);
        let err = resolve(ForwardKind::Input, &t, offered).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraphBuildError>(),
            Some(GraphBuildError::DanglingForward { .. })
        ));

        let t = table(&[("depth_map", vec![Forward::key("image")])]);
        assert!(resolve(ForwardKind::Input, &t, offered).is_err());
    }

    #[test]
    fn input_fan_out_is_allowed_when_types_agree() {
        let t = table(&[
            ("depth_map", vec![Forward::key("depth")]),
            ("source", vec![Forward::key("depth")]),
        ]);
        let got = resolve(ForwardKind::Input, &t, offered).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(names(&got).len(), 1);
    }

    #[test]
    fn incompatible_fan_out_and_duplicate_outputs_collide() {
        let t = table(&[
            ("depth_map", vec![Forward::key("depth")]),
            ("feature_descriptor", vec![Forward::renamed("image", "depth")]),
        ]);
        let err = resolve(ForwardKind::Input, &t, offered).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraphBuildError>(),
            Some(GraphBuildError::ForwardCollision { .. })
        ));

        let t = table(&[
            ("depth_map", vec![Forward::key("depth")]),
            ("source", vec![Forward::key("depth")]),
        ]);
        assert!(resolve(ForwardKind::Output, &t, offered).is_err());
    }
}
