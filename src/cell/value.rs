//! Payloads carried on ports and parameters.

use crate::Result;
use crate::cell::schema::PortType;
use crate::db::ModelDocument;
use crate::transport::ImageMessage;

use anyhow::anyhow;
use nalgebra::{Matrix3, Point2, Point3, Vector3};
use serde::Serialize;
use std::collections::BTreeMap;
use std::rc::Rc;

pub type RgbImage = image::RgbImage;
pub type GrayImage = image::GrayImage;
/// Depth in metres; zero or non-finite means "no reading".
pub type DepthImage = image::ImageBuffer<image::Luma<f32>, Vec<f32>>;
pub type Descriptor = Vec<u8>;

/// Parameter values keyed by name.
pub type Params = BTreeMap<String, Value>;
/// Port values keyed by port name.
pub type PortValues = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub response: f32,
}

/// Organised point cloud, one point per pixel (NaN where depth is missing).
#[derive(Debug, Clone, PartialEq)]
pub struct PointCloud {
    pub width: u32,
    pub height: u32,
    pub points: Vec<Point3<f32>>,
}

impl PointCloud {
    pub fn at(&self, x: u32, y: u32) -> Option<Point3<f32>> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let p = self.points[(y * self.width + x) as usize];
        (p.x.is_finite() && p.y.is_finite() && p.z.is_finite()).then_some(p)
    }
}

/// Nearest-neighbour match of a query descriptor against the model database.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    pub query: usize,
    pub train: usize,
    pub object: usize,
    pub distance: u32,
}

/// Range of database descriptors that belongs to one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoseResult {
    pub object_id: String,
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    pub inliers: usize,
}

/// Everything one training frame contributes to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    pub frame_number: i64,
    pub k: Matrix3<f64>,
    pub r: Matrix3<f64>,
    pub t: Vector3<f64>,
    pub points: Vec<Point2<f32>>,
    pub points3d: Vec<Point3<f32>>,
    pub descriptors: Vec<Descriptor>,
    pub disparities: Vec<f32>,
}

/// Append-only, ordered stack of frame records.
///
/// Records are shared, so threading the accumulator through a tick only
/// copies pointers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Accumulator {
    records: Vec<Rc<FrameRecord>>,
}

impl Accumulator {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameRecord> {
        self.records.iter().map(|r| r.as_ref())
    }

    #[cfg(test)]
    pub fn frame_numbers(&self) -> Vec<i64> {
        self.iter().map(|r| r.frame_number).collect()
    }

    /// Copy of `self` with one more record at the end.
    pub fn appended(&self, record: FrameRecord) -> Accumulator {
        let mut records = self.records.clone();
        records.push(Rc::new(record));
        Accumulator { records }
    }

    /// True if `self` is `prefix` plus exactly one record.
    pub fn extends_by_one(&self, prefix: &Accumulator) -> bool {
        self.records.len() == prefix.records.len() + 1
            && self
                .records
                .iter()
                .zip(&prefix.records)
                .all(|(a, b)| Rc::ptr_eq(a, b))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Image(RgbImage),
    GrayImage(GrayImage),
    Depth(DepthImage),
    Cloud(PointCloud),
    Matrix(Matrix3<f64>),
    Vector(Vector3<f64>),
    Keypoints(Vec<Keypoint>),
    Descriptors(Vec<Descriptor>),
    Points2d(Vec<Point2<f32>>),
    Points3d(Vec<Point3<f32>>),
    Disparities(Vec<f32>),
    Matches(Vec<Match>),
    Spans(Vec<Span>),
    ObjectIds(Vec<String>),
    Poses(Vec<PoseResult>),
    Rotations(Vec<Matrix3<f64>>),
    Translations(Vec<Vector3<f64>>),
    Records(Accumulator),
    Document(ModelDocument),
    Message(ImageMessage),
    Text(String),
    Real(f64),
    Integer(i64),
    Flag(bool),
}

impl Value {
    pub fn port_type(&self) -> PortType {
        match self {
            Value::Image(_) => PortType::Image,
            Value::GrayImage(_) => PortType::GrayImage,
            Value::Depth(_) => PortType::DepthMap,
            Value::Cloud(_) => PortType::PointCloud,
            Value::Matrix(_) => PortType::Matrix3,
            Value::Vector(_) => PortType::Vector3,
            Value::Keypoints(_) => PortType::Keypoints,
            Value::Descriptors(_) => PortType::Descriptors,
            Value::Points2d(_) => PortType::Points2d,
            Value::Points3d(_) => PortType::Points3d,
            Value::Disparities(_) => PortType::Disparities,
            Value::Matches(_) => PortType::Matches,
            Value::Spans(_) => PortType::Spans,
            Value::ObjectIds(_) => PortType::ObjectIds,
            Value::Poses(_) => PortType::Poses,
            Value::Rotations(_) => PortType::Rotations,
            Value::Translations(_) => PortType::Translations,
            Value::Records(_) => PortType::Accumulator,
            Value::Document(_) => PortType::Document,
            Value::Message(_) => PortType::ImageMessage,
            Value::Text(_) => PortType::Text,
            Value::Real(_) => PortType::Real,
            Value::Integer(_) => PortType::Integer,
            Value::Flag(_) => PortType::Flag,
        }
    }
}

/// Typed view of a `Value` variant.
pub trait FromValue {
    fn from_value(value: &Value) -> Option<&Self>;
}

macro_rules! value_variants {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: &Value) -> Option<&Self> {
                    match value {
                        Value::$variant(v) => Some(v),
                        _ => None,
                    }
                }
            }

            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_variants! {
    Image => RgbImage,
    GrayImage => GrayImage,
    Depth => DepthImage,
    Cloud => PointCloud,
    Matrix => Matrix3<f64>,
    Vector => Vector3<f64>,
    Keypoints => Vec<Keypoint>,
    Descriptors => Vec<Descriptor>,
    Points2d => Vec<Point2<f32>>,
    Points3d => Vec<Point3<f32>>,
    Disparities => Vec<f32>,
    Matches => Vec<Match>,
    Spans => Vec<Span>,
    ObjectIds => Vec<String>,
    Poses => Vec<PoseResult>,
    Rotations => Vec<Matrix3<f64>>,
    Translations => Vec<Vector3<f64>>,
    Records => Accumulator,
    Document => ModelDocument,
    Message => ImageMessage,
    Text => String,
    Real => f64,
    Integer => i64,
    Flag => bool,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

/// Read a typed parameter out of a bound parameter map.
pub fn param<'a, T: FromValue>(params: &'a Params, name: &str) -> Result<&'a T> {
    let value = params
        .get(name)
        .ok_or_else(|| anyhow!("missing parameter {}", name))?;
    T::from_value(value)
        .ok_or_else(|| anyhow!("parameter {} has type {}", name, value.port_type()))
}
