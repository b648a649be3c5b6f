//! Observations fed to training, and a synthetic scene generator.
//!
//! The synthetic scene is a textured square lying in the world plane z = 0,
//! seen by a camera that orbits it slightly from frame to frame. Poses follow
//! the `p_cam = R * p_world + T` convention.

use crate::cell::{DepthImage, GrayImage, PortValues, RgbImage, Value};

use nalgebra::{Matrix3, Rotation3, Vector3};

/// One frame's bundle, as yielded by a dealer.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub image: RgbImage,
    pub depth: DepthImage,
    pub mask: GrayImage,
    pub k: Matrix3<f64>,
    pub r: Matrix3<f64>,
    pub t: Vector3<f64>,
    pub frame_number: i64,
}

impl Observation {
    /// Every field under the port name a dealer publishes it on.
    pub fn values(self) -> PortValues {
        PortValues::from([
            ("image".to_string(), Value::Image(self.image)),
            ("depth".to_string(), Value::Depth(self.depth)),
            ("mask".to_string(), Value::GrayImage(self.mask)),
            ("K".to_string(), Value::Matrix(self.k)),
            ("R".to_string(), Value::Matrix(self.r)),
            ("T".to_string(), Value::Vector(self.t)),
            ("frame_number".to_string(), Value::Integer(self.frame_number)),
        ])
    }
}

/// Finite, ordered, non-restartable.
pub type ObservationSource = Box<dyn Iterator<Item = Observation>>;

pub const WIDTH: u32 = 160;
pub const HEIGHT: u32 = 120;

/// Half the side of the textured object, in metres.
const OBJECT_HALF_SIZE: f64 = 0.15;
/// Side of one texture cell, in metres.
const TEXTURE_CELL: f64 = 0.025;

pub fn intrinsics(width: u32, height: u32) -> Matrix3<f64> {
    let f = width as f64 * 0.95;
    Matrix3::new(
        f,
        0.0,
        width as f64 / 2.0,
        0.0,
        f,
        height as f64 / 2.0,
        0.0,
        0.0,
        1.0,
    )
}

/// Camera pose of synthetic frame `i`.
pub fn pose(i: i64) -> (Matrix3<f64>, Vector3<f64>) {
    let angle = 0.04 * i as f64;
    let r = Rotation3::from_axis_angle(&Vector3::y_axis(), angle).into_inner();
    (r, Vector3::new(0.01 * i as f64, 0.0, 0.6))
}

fn texture(x: f64, y: f64) -> u8 {
    let ix = (x / TEXTURE_CELL).floor() as i64;
    let iy = (y / TEXTURE_CELL).floor() as i64;
    let h = ix.wrapping_mul(73_856_093) ^ iy.wrapping_mul(19_349_663);
    (h.rem_euclid(200) + 40) as u8
}

/// Render the scene from `(r, t)`.
pub fn render(
    width: u32,
    height: u32,
    k: &Matrix3<f64>,
    r: &Matrix3<f64>,
    t: &Vector3<f64>,
) -> (RgbImage, DepthImage, GrayImage) {
    let mut image = RgbImage::from_pixel(width, height, image::Rgb([128, 128, 128]));
    let mut depth = DepthImage::new(width, height);
    let mut mask = GrayImage::new(width, height);

    let (fx, fy, cx, cy) = (k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)]);
    let rt = r.transpose();
    let origin_w = -(rt * t);

    for v in 0..height {
        for u in 0..width {
            let ray_c = Vector3::new((u as f64 - cx) / fx, (v as f64 - cy) / fy, 1.0);
            let ray_w = rt * ray_c;
            if ray_w.z.abs() < 1e-9 {
                continue;
            }
            let s = -origin_w.z / ray_w.z;
            if s <= 0.0 {
                continue;
            }
            let hit = origin_w + ray_w * s;
            depth.put_pixel(u, v, image::Luma([s as f32]));
            if hit.x.abs() <= OBJECT_HALF_SIZE && hit.y.abs() <= OBJECT_HALF_SIZE {
                let g = texture(hit.x, hit.y);
                image.put_pixel(u, v, image::Rgb([g, g / 2 + 60, 255 - g]));
                mask.put_pixel(u, v, image::Luma([255]));
            }
        }
    }
    (image, depth, mask)
}

pub fn synthetic_observation(frame_number: i64) -> Observation {
    observe(frame_number, intrinsics(WIDTH, HEIGHT))
}

/// Synthetic frame `frame_number` seen through camera matrix `k`.
pub fn observe(frame_number: i64, k: Matrix3<f64>) -> Observation {
    let (r, t) = pose(frame_number);
    let (image, depth, mask) = render(WIDTH, HEIGHT, &k, &r, &t);
    Observation {
        image,
        depth,
        mask,
        k,
        r,
        t,
        frame_number,
    }
}

/// `n` synthetic observations numbered `0..n`.
pub fn synthetic_sequence(n: usize) -> ObservationSource {
    Box::new((0..n as i64).map(synthetic_observation))
}
