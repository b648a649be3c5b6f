//! Detection cells: descriptor matching against the model database and
//! pose-guess generation from the matched 3D pairs.

use crate::Result;
use crate::cell::{
    Cell, CellSchema, Descriptor, Flow, Inputs, Keypoint, Match, Outputs, ParamSet, PointCloud,
    PortType, PoseResult, RgbImage, Span, param,
};
use crate::composite::{BuildContext, CellType};
use crate::db::{ObjectSelection, open_db};

use anyhow::{Context, anyhow, bail};
use log::{debug, info};
use nalgebra::{Matrix3, Point3, Vector3};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
struct SearchParams {
    /// Largest accepted Hamming distance.
    #[serde(default = "default_radius")]
    radius: u32,
    /// Best match must beat `ratio * second best`.
    #[serde(default = "default_ratio")]
    ratio: f32,
}

fn default_radius() -> u32 {
    64
}

fn default_ratio() -> f32 {
    0.8
}

fn hamming(a: &[u8], b: &[u8]) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Matches query descriptors against every selected model.
///
/// Models are loaded once, when the cell is built. `spans[i]` is the range
/// of the concatenated model descriptors that belongs to `object_ids[i]`.
pub struct DescriptorMatcher {
    schema: CellSchema,
    search: SearchParams,
    object_ids: Vec<String>,
    spans: Vec<Span>,
    descriptors: Vec<Descriptor>,
    points: Vec<Point3<f32>>,
}

impl CellType for DescriptorMatcher {
    const TYPE_NAME: &'static str = "DescriptorMatcher";

    fn declare_params(params: &mut ParamSet) {
        params
            .declare("db", "The DB to get data from as a JSON string", "{}")
            .declare("search", "The search parameters as a JSON string", "{}")
            .declare(
                "object_ids",
                "The ids of the objects to find as a JSON list or the keyword \"all\"",
                "all",
            );
    }

    fn new(params: ParamSet, _ctx: &BuildContext<'_>) -> Result<Self> {
        let p = params.values();
        let text = param::<String>(&p, "search")?;
        let search: SearchParams = serde_json::from_str(text)
            .with_context(|| format!("invalid search parameters: {}", text))?;
        let selection = ObjectSelection::parse(param::<String>(&p, "object_ids")?)?;
        let models = open_db(param::<String>(&p, "db")?)?.load_models(&selection)?;

        let mut object_ids = Vec::new();
        let mut spans = Vec::new();
        let mut descriptors = Vec::new();
        let mut points = Vec::new();
        for model in models {
            if model.points.len() != model.descriptors.len() {
                bail!(
                    "model {} has {} points but {} descriptors",
                    model.object_id,
                    model.points.len(),
                    model.descriptors.len()
                );
            }
            spans.push(Span {
                start: descriptors.len(),
                len: model.descriptors.len(),
            });
            object_ids.push(model.object_id);
            points.extend(model.points.iter().map(|p| Point3::new(p[0], p[1], p[2])));
            descriptors.extend(model.descriptors);
        }
        info!(
            "matcher loaded {} models, {} descriptors",
            object_ids.len(),
            descriptors.len()
        );

        Ok(Self {
            schema: CellSchema::new(Self::TYPE_NAME)
                .input("descriptors", PortType::Descriptors, "Query descriptors")
                .output("matches", PortType::Matches, "Accepted matches")
                .output("matches_3d", PortType::Points3d, "Model point of each match")
                .output("spans", PortType::Spans, "Descriptor range of each object")
                .output("object_ids", PortType::ObjectIds, "The loaded object ids")
                .with_params(params),
            search,
            object_ids,
            spans,
            descriptors,
            points,
        })
    }
}

impl DescriptorMatcher {
    fn object_of(&self, train: usize) -> usize {
        self.spans
            .iter()
            .position(|s| train >= s.start && train < s.start + s.len)
            .unwrap_or(0)
    }
}

impl Cell for DescriptorMatcher {
    fn schema(&self) -> &CellSchema {
        &self.schema
    }

    fn process(&mut self, inputs: &Inputs<'_>, outputs: &mut Outputs) -> Result<Flow> {
        let queries = inputs.get::<Vec<Descriptor>>("descriptors")?;
        let mut matches = Vec::new();
        let mut matches_3d = Vec::new();
        for (query, q) in queries.iter().enumerate() {
            let mut best: Option<(usize, u32)> = None;
            let mut second = u32::MAX;
            for (train, d) in self.descriptors.iter().enumerate() {
                let dist = hamming(q, d);
                match best {
                    Some((_, b)) if dist >= b => second = second.min(dist),
                    _ => {
                        if let Some((_, b)) = best {
                            second = b;
                        }
                        best = Some((train, dist));
                    }
                }
            }
            let Some((train, distance)) = best else {
                continue;
            };
            if distance > self.search.radius {
                continue;
            }
            if second != u32::MAX && distance as f32 >= self.search.ratio * second as f32 {
                continue;
            }
            matches.push(Match {
                query,
                train,
                object: self.object_of(train),
                distance,
            });
            matches_3d.push(self.points[train]);
        }
        debug!("{} of {} descriptors matched", matches.len(), queries.len());

        outputs.set("matches", matches);
        outputs.set("matches_3d", matches_3d);
        outputs.set("spans", self.spans.clone());
        outputs.set("object_ids", self.object_ids.clone());
        Ok(Flow::Continue)
    }
}

/// Rigid transform `scene = R * model + t` minimising squared error.
pub fn kabsch(model: &[Vector3<f64>], scene: &[Vector3<f64>]) -> Result<(Matrix3<f64>, Vector3<f64>)> {
    if model.len() != scene.len() || model.len() < 3 {
        bail!("kabsch needs at least 3 paired points");
    }
    let n = model.len() as f64;
    let cm = model.iter().sum::<Vector3<f64>>() / n;
    let cs = scene.iter().sum::<Vector3<f64>>() / n;
    let mut h = Matrix3::zeros();
    for (m, s) in model.iter().zip(scene) {
        h += (m - cm) * (s - cs).transpose();
    }
    let svd = h.svd(true, true);
    let u = svd.u.ok_or_else(|| anyhow!("SVD did not return U"))?;
    let v = svd
        .v_t
        .ok_or_else(|| anyhow!("SVD did not return V^T"))?
        .transpose();
    let d = (v * u.transpose()).determinant().signum();
    let r = v * Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, d)) * u.transpose();
    Ok((r, cs - r * cm))
}

/// Produces a pose for every object with enough model/scene point pairs
/// that agree on one rigid transform.
pub struct GuessGenerator {
    schema: CellSchema,
    n_iterations: usize,
    min_inliers: usize,
    sensor_error: f64,
    visualize: bool,
}

impl CellType for GuessGenerator {
    const TYPE_NAME: &'static str = "GuessGenerator";

    fn declare_params(params: &mut ParamSet) {
        params
            .declare(
                "n_ransac_iterations",
                "Most refit rounds spent trimming outliers",
                1000i64,
            )
            .declare("min_inliers", "The min number of inliers to consider a pose", 15i64)
            .declare("sensor_error", "The error (in meters) from the Kinect", 0.01)
            .declare("visualize", "If true, log every hypothesis", false);
    }

    fn new(params: ParamSet, _ctx: &BuildContext<'_>) -> Result<Self> {
        let p = params.values();
        let n_iterations = *param::<i64>(&p, "n_ransac_iterations")?;
        let min_inliers = *param::<i64>(&p, "min_inliers")?;
        if n_iterations <= 0 || min_inliers < 3 {
            bail!(
                "need n_ransac_iterations > 0 and min_inliers >= 3, got {} and {}",
                n_iterations,
                min_inliers
            );
        }
        Ok(Self {
            n_iterations: n_iterations as usize,
            min_inliers: min_inliers as usize,
            sensor_error: *param::<f64>(&p, "sensor_error")?,
            visualize: *param::<bool>(&p, "visualize")?,
            schema: CellSchema::new(Self::TYPE_NAME)
                .input("image", PortType::Image, "The current image")
                .input("points3d", PortType::PointCloud, "The organised cloud of the current frame")
                .input("keypoints", PortType::Keypoints, "The keypoints of the current frame")
                .input("matches", PortType::Matches, "Matches against the database")
                .input("matches_3d", PortType::Points3d, "Model point of each match")
                .input("spans", PortType::Spans, "Descriptor range of each object")
                .input("object_ids", PortType::ObjectIds, "The object ids")
                .output("pose_results", PortType::Poses, "The found poses")
                .output("Rs", PortType::Rotations, "Rotation of each pose")
                .output("Ts", PortType::Translations, "Translation of each pose")
                .with_params(params),
        })
    }
}

impl GuessGenerator {
    /// Fit every pair, drop the ones further than `sensor_error` from the
    /// fit, and refit until the inlier set stops changing.
    fn fit(&self, pairs: &[(Vector3<f64>, Vector3<f64>)]) -> Result<Option<(Matrix3<f64>, Vector3<f64>, usize)>> {
        let mut inliers: Vec<usize> = (0..pairs.len()).collect();
        let mut fit = None;
        for _ in 0..self.n_iterations {
            if inliers.len() < self.min_inliers {
                return Ok(None);
            }
            let model: Vec<_> = inliers.iter().map(|&i| pairs[i].0).collect();
            let scene: Vec<_> = inliers.iter().map(|&i| pairs[i].1).collect();
            let (r, t) = kabsch(&model, &scene)?;
            let next: Vec<usize> = (0..pairs.len())
                .filter(|&i| (r * pairs[i].0 + t - pairs[i].1).norm() < self.sensor_error)
                .collect();
            let stable = next == inliers;
            inliers = next;
            fit = Some((r, t));
            if stable {
                break;
            }
        }
        Ok(fit
            .filter(|_| inliers.len() >= self.min_inliers)
            .map(|(r, t)| (r, t, inliers.len())))
    }
}

impl Cell for GuessGenerator {
    fn schema(&self) -> &CellSchema {
        &self.schema
    }

    fn process(&mut self, inputs: &Inputs<'_>, outputs: &mut Outputs) -> Result<Flow> {
        let image = inputs.get::<RgbImage>("image")?;
        let cloud = inputs.get::<PointCloud>("points3d")?;
        let keypoints = inputs.get::<Vec<Keypoint>>("keypoints")?;
        let matches = inputs.get::<Vec<Match>>("matches")?;
        let matches_3d = inputs.get::<Vec<Point3<f32>>>("matches_3d")?;
        let spans = inputs.get::<Vec<Span>>("spans")?;
        let object_ids = inputs.get::<Vec<String>>("object_ids")?;

        if (cloud.width, cloud.height) != image.dimensions() {
            bail!(
                "cloud is {}x{} but the image is {}x{}; inputs come from different frames",
                cloud.width,
                cloud.height,
                image.width(),
                image.height()
            );
        }
        if matches.len() != matches_3d.len() || spans.len() != object_ids.len() {
            bail!("match and object lists are not aligned");
        }

        let mut poses = Vec::new();
        for (object, (span, id)) in spans.iter().zip(object_ids).enumerate() {
            if span.len == 0 {
                continue;
            }
            let pairs: Vec<(Vector3<f64>, Vector3<f64>)> = matches
                .iter()
                .zip(matches_3d)
                .filter(|(m, _)| m.object == object)
                .filter_map(|(m, model)| {
                    let kp = keypoints.get(m.query)?;
                    let scene = cloud.at(kp.x.round() as u32, kp.y.round() as u32)?;
                    Some((model.coords.cast::<f64>(), scene.coords.cast::<f64>()))
                })
                .collect();
            if pairs.len() < self.min_inliers {
                continue;
            }
            if let Some((rotation, translation, inliers)) = self.fit(&pairs)? {
                if self.visualize {
                    info!("{}: {} inliers at {:?}", id, inliers, translation.as_slice());
                }
                poses.push(PoseResult {
                    object_id: id.clone(),
                    rotation,
                    translation,
                    inliers,
                });
            }
        }
        debug!("{} pose hypotheses", poses.len());

        outputs.set("Rs", poses.iter().map(|p| p.rotation).collect::<Vec<_>>());
        outputs.set("Ts", poses.iter().map(|p| p.translation).collect::<Vec<_>>());
        outputs.set("pose_results", poses);
        Ok(Flow::Continue)
    }
}
