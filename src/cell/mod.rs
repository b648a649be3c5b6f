//! Cell layer: the single capability interface every processing unit
//! implements, plus the schema and value types it is described with.
//!
//! The composer is polymorphic over `Cell` only. It reads `schema()` while
//! building a graph and calls `process()` while ticking it.

pub mod schema;
pub mod value;

pub use schema::{CellSchema, ParamSet, PortType};
pub use value::{
    Accumulator, DepthImage, Descriptor, FrameRecord, FromValue, GrayImage, Keypoint, Match,
    Params, PointCloud, PortValues, PoseResult, RgbImage, Span, Value, param,
};

use crate::Result;

use anyhow::anyhow;
use std::collections::BTreeMap;

/// What a cell asks the scheduler to do after processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The cell is a source with nothing left to yield. The current pass is
    /// dropped and the composite is marked exhausted.
    Quit,
}

pub trait Cell {
    fn schema(&self) -> &CellSchema;

    fn process(&mut self, inputs: &Inputs<'_>, outputs: &mut Outputs) -> Result<Flow>;
}

/// Borrowed view of the values reaching a cell's input ports for one pass.
pub struct Inputs<'a> {
    cell: &'a str,
    values: BTreeMap<&'a str, &'a Value>,
}

impl<'a> Inputs<'a> {
    pub fn new(cell: &'a str) -> Self {
        Self {
            cell,
            values: BTreeMap::new(),
        }
    }

    pub fn from_values(cell: &'a str, values: &'a PortValues) -> Self {
        Self {
            cell,
            values: values.iter().map(|(k, v)| (k.as_str(), v)).collect(),
        }
    }

    pub fn insert(&mut self, port: &'a str, value: &'a Value) {
        self.values.insert(port, value);
    }

    pub fn value(&self, port: &str) -> Option<&'a Value> {
        self.values.get(port).copied()
    }

    pub fn ports(&self) -> impl Iterator<Item = &'a str> + '_ {
        self.values.keys().copied()
    }

    /// Required typed input.
    pub fn get<T: FromValue>(&self, port: &str) -> Result<&'a T> {
        self.optional(port)?
            .ok_or_else(|| anyhow!("{}: input {} has no value", self.cell, port))
    }

    /// Optional typed input; absent ports are `None`, mistyped ones an error.
    pub fn optional<T: FromValue>(&self, port: &str) -> Result<Option<&'a T>> {
        match self.values.get(port) {
            None => Ok(None),
            Some(value) => T::from_value(value).map(Some).ok_or_else(|| {
                anyhow!(
                    "{}: input {} carries {}",
                    self.cell,
                    port,
                    value.port_type()
                )
            }),
        }
    }
}

/// Values a cell produced during one pass.
#[derive(Debug, Default)]
pub struct Outputs {
    values: PortValues,
}

impl Outputs {
    pub fn set(&mut self, port: &str, value: impl Into<Value>) {
        self.values.insert(port.to_string(), value.into());
    }

    pub fn into_values(self) -> PortValues {
        self.values
    }
}
