//! Observer cells for the visualization and publishing sink graphs.
//!
//! None of these feed the primary pipeline. There are no windows here:
//! `ImShow` reports what it would display through the log.

use crate::Result;
use crate::cell::{
    Cell, CellSchema, Flow, Inputs, Keypoint, Outputs, ParamSet, PortType, RgbImage,
    Value, param,
};
use crate::composite::{BuildContext, CellType};
use crate::transport::{self, ImageMessage, MAX_SIDE, Transport, validate_topic};

use anyhow::{anyhow, bail};
use image::{Rgb, imageops};
use log::debug;
use nalgebra::{Matrix3, Vector3};

/// RGB to grayscale.
pub struct CvtColor {
    schema: CellSchema,
}

impl CellType for CvtColor {
    const TYPE_NAME: &'static str = "CvtColor";

    fn declare_params(_params: &mut ParamSet) {}

    fn new(params: ParamSet, _ctx: &BuildContext<'_>) -> Result<Self> {
        Ok(Self {
            schema: CellSchema::new(Self::TYPE_NAME)
                .input("image", PortType::Image, "A color image")
                .output("image", PortType::GrayImage, "The grayscale image")
                .with_params(params),
        })
    }
}

impl Cell for CvtColor {
    fn schema(&self) -> &CellSchema {
        &self.schema
    }

    fn process(&mut self, inputs: &Inputs<'_>, outputs: &mut Outputs) -> Result<Flow> {
        let image = inputs.get::<RgbImage>("image")?;
        outputs.set("image", imageops::grayscale(image));
        Ok(Flow::Continue)
    }
}

fn to_rgb(value: &Value) -> Result<RgbImage> {
    match value {
        Value::Image(image) => Ok(image.clone()),
        Value::GrayImage(gray) => Ok(RgbImage::from_fn(gray.width(), gray.height(), |x, y| {
            let g = gray.get_pixel(x, y)[0];
            Rgb([g, g, g])
        })),
        Value::Depth(depth) => {
            let max = depth
                .pixels()
                .map(|p| p[0])
                .filter(|z| z.is_finite())
                .fold(0f32, f32::max);
            let scale = if max > 0.0 { 255.0 / max } else { 0.0 };
            Ok(RgbImage::from_fn(depth.width(), depth.height(), |x, y| {
                let z = depth.get_pixel(x, y)[0];
                let g = if z.is_finite() { (z * scale) as u8 } else { 0 };
                Rgb([g, g, g])
            }))
        }
        other => bail!("cannot display a {}", other.port_type()),
    }
}

fn put(image: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        image.put_pixel(x as u32, y as u32, color);
    }
}

fn line(image: &mut RgbImage, from: (f64, f64), to: (f64, f64), color: Rgb<u8>) {
    let steps = (to.0 - from.0).abs().max((to.1 - from.1).abs()).ceil().min(4096.0) as i64;
    for i in 0..=steps.max(1) {
        let a = i as f64 / steps.max(1) as f64;
        let x = from.0 + (to.0 - from.0) * a;
        let y = from.1 + (to.1 - from.1) * a;
        put(image, x.round() as i64, y.round() as i64, color);
    }
}

/// Draws a small cross on every keypoint.
pub struct DrawKeypoints {
    schema: CellSchema,
}

impl CellType for DrawKeypoints {
    const TYPE_NAME: &'static str = "DrawKeypoints";

    fn declare_params(_params: &mut ParamSet) {}

    fn new(params: ParamSet, _ctx: &BuildContext<'_>) -> Result<Self> {
        Ok(Self {
            schema: CellSchema::new(Self::TYPE_NAME)
                .input("image", PortType::Any, "The image to draw on")
                .input("keypoints", PortType::Keypoints, "The keypoints to draw")
                .output("image", PortType::Image, "The image with keypoints")
                .with_params(params),
        })
    }
}

impl Cell for DrawKeypoints {
    fn schema(&self) -> &CellSchema {
        &self.schema
    }

    fn process(&mut self, inputs: &Inputs<'_>, outputs: &mut Outputs) -> Result<Flow> {
        let value = inputs
            .value("image")
            .ok_or_else(|| anyhow!("draw_keypoints: no image"))?;
        let mut canvas = to_rgb(value)?;
        let color = Rgb([255, 0, 0]);
        for kp in inputs.get::<Vec<Keypoint>>("keypoints")? {
            let (x, y) = (kp.x as f64, kp.y as f64);
            line(&mut canvas, (x - 2.0, y), (x + 2.0, y), color);
            line(&mut canvas, (x, y - 2.0), (x, y + 2.0), color);
        }
        outputs.set("image", canvas);
        Ok(Flow::Continue)
    }
}

/// Draws the axes of every pose, projected with `K`.
pub struct PosesDrawer {
    schema: CellSchema,
}

impl CellType for PosesDrawer {
    const TYPE_NAME: &'static str = "PosesDrawer";

    fn declare_params(_params: &mut ParamSet) {}

    fn new(params: ParamSet, _ctx: &BuildContext<'_>) -> Result<Self> {
        Ok(Self {
            schema: CellSchema::new(Self::TYPE_NAME)
                .input("image", PortType::Image, "The image to draw on")
                .input("K", PortType::Matrix3, "The camera matrix")
                .input("Rs", PortType::Rotations, "Pose rotations")
                .input("Ts", PortType::Translations, "Pose translations")
                .output("output", PortType::Image, "The image with poses drawn")
                .with_params(params),
        })
    }
}

fn project(k: &Matrix3<f64>, p: &Vector3<f64>) -> Option<(f64, f64)> {
    if p.z <= 1e-6 {
        return None;
    }
    let q = k * p;
    Some((q.x / q.z, q.y / q.z))
}

impl Cell for PosesDrawer {
    fn schema(&self) -> &CellSchema {
        &self.schema
    }

    fn process(&mut self, inputs: &Inputs<'_>, outputs: &mut Outputs) -> Result<Flow> {
        let mut canvas = inputs.get::<RgbImage>("image")?.clone();
        let k = inputs.get::<Matrix3<f64>>("K")?;
        let rs = inputs.get::<Vec<Matrix3<f64>>>("Rs")?;
        let ts = inputs.get::<Vec<Vector3<f64>>>("Ts")?;
        let axes = [
            (Vector3::x(), Rgb([255, 0, 0])),
            (Vector3::y(), Rgb([0, 255, 0])),
            (Vector3::z(), Rgb([0, 0, 255])),
        ];
        for (r, t) in rs.iter().zip(ts) {
            let Some(origin) = project(k, t) else {
                continue;
            };
            for (axis, color) in &axes {
                if let Some(end) = project(k, &(r * (axis * 0.05) + t)) {
                    line(&mut canvas, origin, end, *color);
                }
            }
        }
        outputs.set("output", canvas);
        Ok(Flow::Continue)
    }
}

/// Named display window stand-in.
pub struct ImShow {
    schema: CellSchema,
    name: String,
    shown: u64,
}

impl CellType for ImShow {
    const TYPE_NAME: &'static str = "ImShow";

    fn declare_params(params: &mut ParamSet) {
        params.declare("name", "The window name", "window");
    }

    fn new(params: ParamSet, _ctx: &BuildContext<'_>) -> Result<Self> {
        let name = param::<String>(&params.values(), "name")?.clone();
        Ok(Self {
            schema: CellSchema::new(Self::TYPE_NAME)
                .input("image", PortType::Any, "The image to show")
                .with_params(params),
            name,
            shown: 0,
        })
    }
}

impl Cell for ImShow {
    fn schema(&self) -> &CellSchema {
        &self.schema
    }

    fn process(&mut self, inputs: &Inputs<'_>, _outputs: &mut Outputs) -> Result<Flow> {
        let value = inputs
            .value("image")
            .ok_or_else(|| anyhow!("{}: no image", self.name))?;
        let (w, h) = match value {
            Value::Image(i) => i.dimensions(),
            Value::GrayImage(i) => i.dimensions(),
            Value::Depth(i) => i.dimensions(),
            other => bail!("{}: cannot show a {}", self.name, other.port_type()),
        };
        self.shown += 1;
        debug!("[{}] frame {}: {}x{}", self.name, self.shown, w, h);
        Ok(Flow::Continue)
    }
}

/// Converts an image into a bounded transport message.
pub struct Mat2Image {
    schema: CellSchema,
    frame_id: String,
}

impl CellType for Mat2Image {
    const TYPE_NAME: &'static str = "Mat2Image";

    fn declare_params(params: &mut ParamSet) {
        params.declare(
            "frame_id",
            "The frame id of the published image",
            transport::default_frame_id(),
        );
    }

    fn new(params: ParamSet, _ctx: &BuildContext<'_>) -> Result<Self> {
        let frame_id = param::<String>(&params.values(), "frame_id")?.clone();
        Ok(Self {
            schema: CellSchema::new(Self::TYPE_NAME)
                .input("image", PortType::Image, "The image to convert")
                .output("image", PortType::ImageMessage, "The converted message")
                .with_params(params),
            frame_id,
        })
    }
}

impl Cell for Mat2Image {
    fn schema(&self) -> &CellSchema {
        &self.schema
    }

    fn process(&mut self, inputs: &Inputs<'_>, outputs: &mut Outputs) -> Result<Flow> {
        let image = inputs.get::<RgbImage>("image")?;
        outputs.set(
            "image",
            ImageMessage::from_rgb(image, &self.frame_id, MAX_SIDE),
        );
        Ok(Flow::Continue)
    }
}

/// Publishes image messages on a topic. Only constructible when the
/// transport probe succeeded.
pub struct ImagePublisher {
    schema: CellSchema,
    topic: String,
    transport: Transport,
}

impl CellType for ImagePublisher {
    const TYPE_NAME: &'static str = "ImagePublisher";

    fn declare_params(params: &mut ParamSet) {
        params.declare("topic_name", "The topic to publish on", "features");
    }

    fn new(params: ParamSet, ctx: &BuildContext<'_>) -> Result<Self> {
        let topic = param::<String>(&params.values(), "topic_name")?.clone();
        validate_topic(&topic)?;
        let transport = ctx
            .transport
            .clone()
            .ok_or_else(|| anyhow!("no transport available for topic {}", topic))?;
        Ok(Self {
            schema: CellSchema::new(Self::TYPE_NAME)
                .input("image", PortType::ImageMessage, "The message to publish")
                .with_params(params),
            topic,
            transport,
        })
    }
}

impl Cell for ImagePublisher {
    fn schema(&self) -> &CellSchema {
        &self.schema
    }

    fn process(&mut self, inputs: &Inputs<'_>, _outputs: &mut Outputs) -> Result<Flow> {
        let message = inputs.get::<ImageMessage>("image")?;
        self.transport.publish(&self.topic, message)?;
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{GrayImage, Params, PortValues};
    use crate::cells::run_cell;
    use pretty_assertions::assert_eq;

    #[test]
    fn keypoints_are_drawn_on_grayscale_input() {
        let values = PortValues::from([
            ("image".to_string(), Value::GrayImage(GrayImage::new(8, 8))),
            (
                "keypoints".to_string(),
                Value::Keypoints(vec![Keypoint {
                    x: 4.0,
                    y: 4.0,
                    response: 1.0,
                }]),
            ),
        ]);
        let out = run_cell::<DrawKeypoints>(&Params::new(), &values).unwrap();
        let Some(Value::Image(image)) = out.get("image") else {
            panic!("no image");
        };
        assert_eq!(image.get_pixel(4, 4), &Rgb([255, 0, 0]));
        assert_eq!(image.get_pixel(0, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn pose_axes_start_at_the_projected_origin() {
        let k = Matrix3::new(100.0, 0.0, 50.0, 0.0, 100.0, 50.0, 0.0, 0.0, 1.0);
        let values = PortValues::from([
            ("image".to_string(), Value::Image(RgbImage::new(100, 100))),
            ("K".to_string(), Value::Matrix(k)),
            ("Rs".to_string(), Value::Rotations(vec![Matrix3::identity()])),
            ("Ts".to_string(), Value::Translations(vec![Vector3::new(0.0, 0.0, 1.0)])),
        ]);
        let out = run_cell::<PosesDrawer>(&Params::new(), &values).unwrap();
        let Some(Value::Image(image)) = out.get("output") else {
            panic!("no output");
        };
        // x axis ends at (55, 50)
        assert_eq!(image.get_pixel(55, 50), &Rgb([255, 0, 0]));
    }

    #[test]
    fn publisher_needs_a_transport() {
        let values = PortValues::new();
        let err = run_cell::<ImagePublisher>(&Params::new(), &values).err().unwrap();
        assert!(format!("{:#}", err).contains("no transport"));
    }

    #[test]
    fn imshow_rejects_non_images() {
        let values = PortValues::from([("image".to_string(), Value::Real(1.0))]);
        assert!(run_cell::<ImShow>(&Params::new(), &values).is_err());
    }
}
