//! Keypoints, descriptors and keypoint validation.
//!
//! Keypoints are laid on a fixed grid over the masked pixels; a descriptor
//! is a strided sample of the gray patch around its keypoint. Both are
//! deterministic, so the same view always yields the same features.

use crate::Result;
use crate::cell::{
    Cell, CellSchema, DepthImage, Descriptor, Flow, GrayImage, Inputs, Keypoint, Outputs,
    ParamSet, PortType, RgbImage, param,
};
use crate::cells::depth::depth_at;
use crate::composite::{BuildContext, CellType};

use anyhow::{Context, bail};
use image::imageops;
use log::debug;
use nalgebra::{Matrix3, Point2};
use serde::Deserialize;

pub const DESCRIPTOR_BYTES: usize = 32;
const PATCH_RADIUS: i32 = 8;
/// Keypoints closer than this to the border get no descriptor.
const BORDER: u32 = PATCH_RADIUS as u32 + 2;
const GRID_STEP: u32 = 4;

#[derive(Debug, Clone, Deserialize)]
struct FeatureParams {
    #[serde(rename = "type", default = "default_feature_type")]
    kind: String,
    #[serde(default = "default_n_features")]
    n_features: usize,
}

fn default_feature_type() -> String {
    "ORB".to_string()
}

fn default_n_features() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize)]
struct DescriptorParams {
    #[serde(rename = "type", default = "default_feature_type")]
    kind: String,
}

/// Extracts keypoints and descriptors from an image.
///
/// With `{"type": "ORB3D"}` feature parameters the cell also declares a
/// `depth` input and drops keypoints without a valid depth reading.
pub struct FeatureDescriptor {
    schema: CellSchema,
    features: FeatureParams,
}

impl CellType for FeatureDescriptor {
    const TYPE_NAME: &'static str = "FeatureDescriptor";

    fn declare_params(params: &mut ParamSet) {
        params
            .declare(
                "json_feature_params",
                "Parameters for the feature as a JSON string",
                r#"{"type": "ORB", "n_features": 1000}"#,
            )
            .declare(
                "json_descriptor_params",
                "Parameters for the descriptor as a JSON string",
                r#"{"type": "ORB"}"#,
            );
    }

    fn new(params: ParamSet, _ctx: &BuildContext<'_>) -> Result<Self> {
        let p = params.values();
        let text = param::<String>(&p, "json_feature_params")?;
        let features: FeatureParams = serde_json::from_str(text)
            .with_context(|| format!("invalid json_feature_params: {}", text))?;
        let text = param::<String>(&p, "json_descriptor_params")?;
        let descriptor: DescriptorParams = serde_json::from_str(text)
            .with_context(|| format!("invalid json_descriptor_params: {}", text))?;

        let with_depth = match features.kind.as_str() {
            "ORB" | "FAST" | "HARRIS" => false,
            "ORB3D" => true,
            other => bail!("unsupported feature type {}", other),
        };
        if !matches!(descriptor.kind.as_str(), "ORB" | "BRIEF") {
            bail!("unsupported descriptor type {}", descriptor.kind);
        }

        let mut schema = CellSchema::new(Self::TYPE_NAME)
            .input("image", PortType::Image, "An image")
            .input("mask", PortType::GrayImage, "Only detect where the mask is set");
        if with_depth {
            schema = schema.input("depth", PortType::DepthMap, "The depth map");
        }
        schema = schema
            .output("keypoints", PortType::Keypoints, "The detected keypoints")
            .output("descriptors", PortType::Descriptors, "One descriptor per keypoint")
            .with_params(params);

        Ok(Self { schema, features })
    }
}

impl FeatureDescriptor {
    fn detect(&self, gray: &GrayImage, mask: Option<&GrayImage>, depth: Option<&DepthImage>) -> Vec<Keypoint> {
        let (w, h) = gray.dimensions();
        if w <= 2 * BORDER || h <= 2 * BORDER {
            return Vec::new();
        }
        let mut keypoints = Vec::new();
        for y in (BORDER..h - BORDER).step_by(GRID_STEP as usize) {
            for x in (BORDER..w - BORDER).step_by(GRID_STEP as usize) {
                if mask.is_some_and(|m| m.get_pixel(x, y)[0] == 0) {
                    continue;
                }
                let kp = Keypoint {
                    x: x as f32,
                    y: y as f32,
                    response: 1.0,
                };
                if depth.is_some_and(|d| depth_at(d, kp.x, kp.y).is_none()) {
                    continue;
                }
                keypoints.push(kp);
            }
        }
        keypoints.truncate(self.features.n_features);
        keypoints
    }

    /// 8 columns by 4 rows, spanning the patch.
    fn describe(gray: &GrayImage, kp: &Keypoint) -> Descriptor {
        let (cx, cy) = (kp.x as i32, kp.y as i32);
        (0..DESCRIPTOR_BYTES as i32)
            .map(|i| {
                let dx = -PATCH_RADIUS + 2 * (i % 8);
                let dy = -PATCH_RADIUS + 2 + 4 * (i / 8);
                gray.get_pixel((cx + dx) as u32, (cy + dy) as u32)[0]
            })
            .collect()
    }
}

impl Cell for FeatureDescriptor {
    fn schema(&self) -> &CellSchema {
        &self.schema
    }

    fn process(&mut self, inputs: &Inputs<'_>, outputs: &mut Outputs) -> Result<Flow> {
        let image = inputs.get::<RgbImage>("image")?;
        let mask = inputs.optional::<GrayImage>("mask")?;
        let depth = inputs.optional::<DepthImage>("depth")?;
        if let Some(m) = mask {
            if m.dimensions() != image.dimensions() {
                bail!(
                    "mask is {:?} but the image is {:?}",
                    m.dimensions(),
                    image.dimensions()
                );
            }
        }

        let gray = imageops::grayscale(image);
        let keypoints = self.detect(&gray, mask, depth);
        let descriptors: Vec<Descriptor> = keypoints
            .iter()
            .map(|kp| Self::describe(&gray, kp))
            .collect();
        debug!("{} keypoints", keypoints.len());

        outputs.set("keypoints", keypoints);
        outputs.set("descriptors", descriptors);
        Ok(Flow::Continue)
    }
}

/// Keeps keypoints inside the mask and with a valid depth, and reports their
/// pixel positions and disparities (`fx / depth`).
pub struct KeypointsValidator {
    schema: CellSchema,
}

impl CellType for KeypointsValidator {
    const TYPE_NAME: &'static str = "KeypointsValidator";

    fn declare_params(_params: &mut ParamSet) {}

    fn new(params: ParamSet, _ctx: &BuildContext<'_>) -> Result<Self> {
        Ok(Self {
            schema: CellSchema::new(Self::TYPE_NAME)
                .input("keypoints", PortType::Keypoints, "The keypoints")
                .input("descriptors", PortType::Descriptors, "The descriptors")
                .input("K", PortType::Matrix3, "The camera matrix")
                .input("mask", PortType::GrayImage, "A mask for valid object pixels")
                .input("depth", PortType::DepthMap, "The depth map")
                .output("points", PortType::Points2d, "Valid keypoint positions")
                .output("descriptors", PortType::Descriptors, "Descriptors of valid keypoints")
                .output("disparities", PortType::Disparities, "Disparity of each valid keypoint")
                .with_params(params),
        })
    }
}

impl Cell for KeypointsValidator {
    fn schema(&self) -> &CellSchema {
        &self.schema
    }

    fn process(&mut self, inputs: &Inputs<'_>, outputs: &mut Outputs) -> Result<Flow> {
        let keypoints = inputs.get::<Vec<Keypoint>>("keypoints")?;
        let descriptors = inputs.get::<Vec<Descriptor>>("descriptors")?;
        let k = inputs.get::<Matrix3<f64>>("K")?;
        let mask = inputs.get::<GrayImage>("mask")?;
        let depth = inputs.get::<DepthImage>("depth")?;
        if keypoints.len() != descriptors.len() {
            bail!(
                "{} keypoints but {} descriptors",
                keypoints.len(),
                descriptors.len()
            );
        }

        let fx = k[(0, 0)] as f32;
        let mut points = Vec::new();
        let mut kept = Vec::new();
        let mut disparities = Vec::new();
        for (kp, d) in keypoints.iter().zip(descriptors) {
            let (x, y) = (kp.x.round() as u32, kp.y.round() as u32);
            if x >= mask.width() || y >= mask.height() || mask.get_pixel(x, y)[0] == 0 {
                continue;
            }
            let Some(z) = depth_at(depth, kp.x, kp.y) else {
                continue;
            };
            points.push(Point2::new(kp.x, kp.y));
            kept.push(d.clone());
            disparities.push(fx / z);
        }

        outputs.set("points", points);
        outputs.set("descriptors", kept);
        outputs.set("disparities", disparities);
        Ok(Flow::Continue)
    }
}
