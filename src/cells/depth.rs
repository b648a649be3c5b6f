//! Depth handling: registration to the image grid and back-projection.

use crate::Result;
use crate::cell::{
    Cell, CellSchema, DepthImage, Flow, Inputs, Outputs, ParamSet, PointCloud, PortType, RgbImage,
};
use crate::composite::{BuildContext, CellType};

use image::imageops::{self, FilterType};
use nalgebra::{Matrix3, Point2, Point3};

fn valid(z: f32) -> bool {
    z.is_finite() && z > 0.0
}

/// Depth in metres at pixel `(u, v)`, if it is a valid reading.
pub fn depth_at(depth: &DepthImage, u: f32, v: f32) -> Option<f32> {
    let (x, y) = (u.round(), v.round());
    if x < 0.0 || y < 0.0 || x >= depth.width() as f32 || y >= depth.height() as f32 {
        return None;
    }
    let z = depth.get_pixel(x as u32, y as u32)[0];
    valid(z).then_some(z)
}

fn back_project(k: &Matrix3<f64>, u: f32, v: f32, z: f32) -> Point3<f32> {
    let (fx, fy, cx, cy) = (k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)]);
    let z64 = z as f64;
    Point3::new(
        ((u as f64 - cx) * z64 / fx) as f32,
        ((v as f64 - cy) * z64 / fy) as f32,
        z,
    )
}

/// Resamples the depth map onto the image grid (nearest neighbour), for
/// sensors whose depth stream runs at a different resolution.
pub struct RescaledRegisteredDepth {
    schema: CellSchema,
}

impl CellType for RescaledRegisteredDepth {
    const TYPE_NAME: &'static str = "RescaledRegisteredDepth";

    fn declare_params(_params: &mut ParamSet) {}

    fn new(params: ParamSet, _ctx: &BuildContext<'_>) -> Result<Self> {
        Ok(Self {
            schema: CellSchema::new(Self::TYPE_NAME)
                .input("image", PortType::Image, "The image the depth is registered to")
                .input("depth", PortType::DepthMap, "The raw depth map")
                .output("depth", PortType::DepthMap, "The depth map at image resolution")
                .with_params(params),
        })
    }
}

impl Cell for RescaledRegisteredDepth {
    fn schema(&self) -> &CellSchema {
        &self.schema
    }

    fn process(&mut self, inputs: &Inputs<'_>, outputs: &mut Outputs) -> Result<Flow> {
        let image = inputs.get::<RgbImage>("image")?;
        let depth = inputs.get::<DepthImage>("depth")?;
        let rescaled = if depth.dimensions() == image.dimensions() {
            depth.clone()
        } else {
            imageops::resize(depth, image.width(), image.height(), FilterType::Nearest)
        };
        outputs.set("depth", rescaled);
        Ok(Flow::Continue)
    }
}

/// Dense back-projection into an organised cloud.
pub struct DepthTo3d {
    schema: CellSchema,
}

impl CellType for DepthTo3d {
    const TYPE_NAME: &'static str = "DepthTo3d";

    fn declare_params(_params: &mut ParamSet) {}

    fn new(params: ParamSet, _ctx: &BuildContext<'_>) -> Result<Self> {
        Ok(Self {
            schema: CellSchema::new(Self::TYPE_NAME)
                .input("depth", PortType::DepthMap, "The depth map")
                .input("K", PortType::Matrix3, "The camera matrix")
                .output("points3d", PortType::PointCloud, "One 3D point per pixel")
                .with_params(params),
        })
    }
}

impl Cell for DepthTo3d {
    fn schema(&self) -> &CellSchema {
        &self.schema
    }

    fn process(&mut self, inputs: &Inputs<'_>, outputs: &mut Outputs) -> Result<Flow> {
        let depth = inputs.get::<DepthImage>("depth")?;
        let k = inputs.get::<Matrix3<f64>>("K")?;
        let points = depth
            .enumerate_pixels()
            .map(|(u, v, z)| {
                if valid(z[0]) {
                    back_project(k, u as f32, v as f32, z[0])
                } else {
                    Point3::new(f32::NAN, f32::NAN, f32::NAN)
                }
            })
            .collect();
        outputs.set(
            "points3d",
            PointCloud {
                width: depth.width(),
                height: depth.height(),
                points,
            },
        );
        Ok(Flow::Continue)
    }
}

/// Back-projection of selected pixels only.
pub struct DepthTo3dSparse {
    schema: CellSchema,
}

impl CellType for DepthTo3dSparse {
    const TYPE_NAME: &'static str = "DepthTo3dSparse";

    fn declare_params(_params: &mut ParamSet) {}

    fn new(params: ParamSet, _ctx: &BuildContext<'_>) -> Result<Self> {
        Ok(Self {
            schema: CellSchema::new(Self::TYPE_NAME)
                .input("depth", PortType::DepthMap, "The depth map")
                .input("K", PortType::Matrix3, "The camera matrix")
                .input("points", PortType::Points2d, "Pixels to back-project")
                .output("points3d", PortType::Points3d, "Camera-frame 3D points")
                .with_params(params),
        })
    }
}

impl Cell for DepthTo3dSparse {
    fn schema(&self) -> &CellSchema {
        &self.schema
    }

    fn process(&mut self, inputs: &Inputs<'_>, outputs: &mut Outputs) -> Result<Flow> {
        let depth = inputs.get::<DepthImage>("depth")?;
        let k = inputs.get::<Matrix3<f64>>("K")?;
        let points = inputs.get::<Vec<Point2<f32>>>("points")?;
        let points3d: Vec<Point3<f32>> = points
            .iter()
            .map(|p| match depth_at(depth, p.x, p.y) {
                Some(z) => back_project(k, p.x, p.y, z),
                None => Point3::new(f32::NAN, f32::NAN, f32::NAN),
            })
            .collect();
        outputs.set("points3d", points3d);
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{PortValues, Value};
    use pretty_assertions::assert_eq;

    fn run<C: CellType>(values: PortValues) -> PortValues {
        crate::cells::run_cell::<C>(&Default::default(), &values).unwrap()
    }

    fn k() -> Matrix3<f64> {
        Matrix3::new(100.0, 0.0, 2.0, 0.0, 100.0, 1.0, 0.0, 0.0, 1.0)
    }

    #[test]
    fn depth_is_resampled_to_the_image_grid() {
        let depth = DepthImage::from_pixel(2, 1, image::Luma([1.5]));
        let out = run::<RescaledRegisteredDepth>(PortValues::from([
            ("image".to_string(), Value::Image(RgbImage::new(4, 2))),
            ("depth".to_string(), Value::Depth(depth)),
        ]));
        match out.get("depth") {
            Some(Value::Depth(d)) => {
                assert_eq!(d.dimensions(), (4, 2));
                assert_eq!(d.get_pixel(3, 1)[0], 1.5);
            }
            other => panic!("unexpected output {:?}", other.map(|v| v.port_type())),
        }
    }

    #[test]
    fn dense_cloud_marks_missing_depth() {
        let mut depth = DepthImage::from_pixel(4, 2, image::Luma([2.0]));
        depth.put_pixel(0, 0, image::Luma([0.0]));
        let out = run::<DepthTo3d>(PortValues::from([
            ("depth".to_string(), Value::Depth(depth)),
            ("K".to_string(), Value::Matrix(k())),
        ]));
        let Some(Value::Cloud(cloud)) = out.get("points3d") else {
            panic!("no cloud");
        };
        assert!(cloud.at(0, 0).is_none());
        assert_eq!(cloud.at(2, 1), Some(Point3::new(0.0, 0.0, 2.0)));
        assert_eq!(cloud.at(3, 1), Some(Point3::new(0.02, 0.0, 2.0)));
    }

    #[test]
    fn sparse_projection_follows_the_pinhole_model() {
        let depth = DepthImage::from_pixel(4, 2, image::Luma([1.0]));
        let out = run::<DepthTo3dSparse>(PortValues::from([
            ("depth".to_string(), Value::Depth(depth)),
            ("K".to_string(), Value::Matrix(k())),
            (
                "points".to_string(),
                Value::Points2d(vec![Point2::new(2.0, 1.0), Point2::new(0.0, 0.0)]),
            ),
        ]));
        assert_eq!(
            out.get("points3d"),
            Some(&Value::Points3d(vec![
                Point3::new(0.0, 0.0, 1.0),
                Point3::new(-0.02, -0.01, 1.0),
            ]))
        );
    }
}
