//! Cell schemas: ports and parameters as plain, queryable data.
//!
//! A schema is fixed when a cell is constructed. The composer only ever
//! inspects schemas (set-membership on port names, type compatibility); it
//! never looks inside a live cell.

use crate::Result;
use crate::cell::value::{Params, Value};
use crate::graph::GraphBuildError;

use anyhow::bail;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;

/// Semantic type tag carried by every port and parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PortType {
    Image,
    GrayImage,
    DepthMap,
    PointCloud,
    Matrix3,
    Vector3,
    Keypoints,
    Descriptors,
    Points2d,
    Points3d,
    Disparities,
    Matches,
    Spans,
    ObjectIds,
    Poses,
    Rotations,
    Translations,
    Accumulator,
    Document,
    ImageMessage,
    Text,
    Real,
    Integer,
    Flag,
    /// Untyped port (passthroughs, viewers). Compatible with everything.
    Any,
}

impl PortType {
    pub fn compatible(self, other: PortType) -> bool {
        self == other || self == PortType::Any || other == PortType::Any
    }
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub name: String,
    pub direction: Direction,
    pub ty: PortType,
    pub doc: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub doc: String,
    pub default: Value,
    pub value: Value,
}

impl Param {
    pub fn ty(&self) -> PortType {
        self.default.port_type()
    }
}

/// Ordered set of declared parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSet {
    params: Vec<Param>,
}

impl ParamSet {
    pub fn declare(&mut self, name: &str, doc: &str, default: impl Into<Value>) -> &mut Self {
        let default = default.into();
        match self.params.iter_mut().find(|p| p.name == name) {
            Some(existing) => {
                existing.doc = doc.to_string();
                existing.value = default.clone();
                existing.default = default;
            }
            None => self.params.push(Param {
                name: name.to_string(),
                doc: doc.to_string(),
                value: default.clone(),
                default,
            }),
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Param> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Set the current value of a declared parameter.
    ///
    /// Integers are accepted where a real is declared; any other type change
    /// is rejected.
    pub fn set(&mut self, name: &str, value: Value) -> Result<()> {
        let Some(param) = self.params.iter_mut().find(|p| p.name == name) else {
            bail!(GraphBuildError::UnknownParameter {
                name: name.to_string(),
            });
        };
        let value = match (param.default.port_type(), value) {
            (PortType::Real, Value::Integer(i)) => Value::Real(i as f64),
            (expected, value) if value.port_type() == expected => value,
            (expected, value) => bail!(
                "parameter {} expects {} but got {}",
                name,
                expected,
                value.port_type()
            ),
        };
        param.value = value;
        Ok(())
    }

    /// Current values keyed by name.
    pub fn values(&self) -> Params {
        self.params
            .iter()
            .map(|p| (p.name.clone(), p.value.clone()))
            .collect()
    }

    /// Bind constructor arguments onto the declared defaults.
    pub fn bind(mut self, args: &Params) -> Result<ParamSet> {
        for (name, value) in args {
            self.set(name, value.clone())?;
        }
        Ok(self)
    }
}

/// Full introspectable description of a cell.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellSchema {
    pub type_name: String,
    pub inputs: Vec<Port>,
    pub outputs: Vec<Port>,
    pub params: ParamSet,
}

impl CellSchema {
    pub fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            ..Self::default()
        }
    }

    pub fn input(mut self, name: &str, ty: PortType, doc: &str) -> Self {
        self.inputs.push(Port {
            name: name.to_string(),
            direction: Direction::Input,
            ty,
            doc: doc.to_string(),
        });
        self
    }

    pub fn output(mut self, name: &str, ty: PortType, doc: &str) -> Self {
        self.outputs.push(Port {
            name: name.to_string(),
            direction: Direction::Output,
            ty,
            doc: doc.to_string(),
        });
        self
    }

    pub fn with_params(mut self, params: ParamSet) -> Self {
        self.params = params;
        self
    }

    pub fn find_input(&self, name: &str) -> Option<&Port> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn find_output(&self, name: &str) -> Option<&Port> {
        self.outputs.iter().find(|p| p.name == name)
    }

    pub fn has_input(&self, name: &str) -> bool {
        self.find_input(name).is_some()
    }

    /// Reject names that cannot be addressed in a forward or an edge.
    pub fn validate_names(&self, cell: &str) -> Result<()> {
        let re = Regex::new(IDENTIFIER_RE)?;
        let ports = self.inputs.iter().chain(self.outputs.iter()).map(|p| &p.name);
        for name in std::iter::once(&cell.to_string())
            .chain(ports)
            .chain(self.params.iter().map(|p| &p.name))
        {
            check_name(&re, name)?;
        }
        let mut seen = BTreeMap::new();
        for port in &self.outputs {
            if seen.insert(port.name.as_str(), ()).is_some() {
                bail!("cell {} declares output {} twice", cell, port.name);
            }
        }
        seen.clear();
        for port in &self.inputs {
            if seen.insert(port.name.as_str(), ()).is_some() {
                bail!("cell {} declares input {} twice", cell, port.name);
            }
        }
        Ok(())
    }
}

const IDENTIFIER_RE: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

pub fn validate_name(name: &str) -> Result<()> {
    check_name(&Regex::new(IDENTIFIER_RE)?, name)
}

fn check_name(re: &Regex, name: &str) -> Result<()> {
    if !re.is_match(name) {
        bail!(GraphBuildError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn any_is_compatible_with_everything() {
        assert!(PortType::Any.compatible(PortType::Image));
        assert!(PortType::DepthMap.compatible(PortType::Any));
        assert!(!PortType::DepthMap.compatible(PortType::Image));
    }

    #[test]
    fn bind_overrides_defaults_and_keeps_order() {
        let mut params = ParamSet::default();
        params
            .declare("min_inliers", "Minimum inliers", 15i64)
            .declare("sensor_error", "Sensor error", 0.01);
        let args = Params::from([("sensor_error".to_string(), Value::Integer(1))]);
        let bound = params.bind(&args).unwrap();

        let names: Vec<&str> = bound.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["min_inliers", "sensor_error"]);
        assert_eq!(bound.get("sensor_error").unwrap().value, Value::Real(1.0));
    }

    #[test]
    fn unknown_and_mistyped_parameters_are_rejected() {
        let mut params = ParamSet::default();
        params.declare("visualize", "Show windows", false);

        let err = params.set("visualise", Value::Flag(true)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraphBuildError>(),
            Some(GraphBuildError::UnknownParameter { .. })
        ));
        assert!(params.set("visualize", Value::Text("yes".into())).is_err());
    }

    #[test]
    fn names_must_be_identifiers() {
        let schema = CellSchema::new("Stub").input("bad port", PortType::Any, "");
        assert!(schema.validate_names("stub").is_err());
        assert!(validate_name("points3d").is_ok());
        assert!(validate_name("3d").is_err());
    }
}
