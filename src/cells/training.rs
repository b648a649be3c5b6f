//! Training cells: the observation dealer, per-frame model stacking and the
//! post-processing steps that turn the stack into a stored model.

use crate::Result;
use crate::cell::{
    Accumulator, Cell, CellSchema, Descriptor, Flow, FrameRecord, Inputs, Outputs, ParamSet,
    PortType, param,
};
use crate::composite::{BuildContext, CellType};
use crate::db::{METHOD, ModelDocument, open_db};
use crate::observation::ObservationSource;

use anyhow::bail;
use log::{debug, info};
use nalgebra::{Matrix3, Point2, Point3, Vector3};
use std::collections::BTreeSet;

/// Yields one observation per pass and quits once the source runs dry.
pub struct ObservationDealer {
    schema: CellSchema,
    source: ObservationSource,
    dealt: usize,
}

impl ObservationDealer {
    pub fn new(source: ObservationSource) -> Self {
        Self {
            schema: CellSchema::new("ObservationDealer")
                .output("image", PortType::Image, "An image")
                .output("depth", PortType::DepthMap, "A depth image")
                .output("mask", PortType::GrayImage, "A mask for valid object pixels")
                .output("K", PortType::Matrix3, "The camera matrix")
                .output("R", PortType::Matrix3, "The rotation matrix")
                .output("T", PortType::Vector3, "The translation vector")
                .output("frame_number", PortType::Integer, "The frame number"),
            source,
            dealt: 0,
        }
    }
}

impl Cell for ObservationDealer {
    fn schema(&self) -> &CellSchema {
        &self.schema
    }

    fn process(&mut self, _inputs: &Inputs<'_>, outputs: &mut Outputs) -> Result<Flow> {
        let Some(obs) = self.source.next() else {
            info!("observation source exhausted after {} frames", self.dealt);
            return Ok(Flow::Quit);
        };
        self.dealt += 1;
        outputs.set("image", obs.image);
        outputs.set("depth", obs.depth);
        outputs.set("mask", obs.mask);
        outputs.set("K", obs.k);
        outputs.set("R", obs.r);
        outputs.set("T", obs.t);
        outputs.set("frame_number", obs.frame_number);
        Ok(Flow::Continue)
    }
}

/// Camera-frame points to world frame: `p_w = R^T (p_c - T)`.
pub struct CameraToWorld {
    schema: CellSchema,
}

impl CellType for CameraToWorld {
    const TYPE_NAME: &'static str = "CameraToWorld";

    fn declare_params(_params: &mut ParamSet) {}

    fn new(params: ParamSet, _ctx: &BuildContext<'_>) -> Result<Self> {
        Ok(Self {
            schema: CellSchema::new(Self::TYPE_NAME)
                .input("points", PortType::Points3d, "Points in the camera frame")
                .input("R", PortType::Matrix3, "The rotation matrix")
                .input("T", PortType::Vector3, "The translation vector")
                .output("points", PortType::Points3d, "Points in the world frame")
                .with_params(params),
        })
    }
}

impl Cell for CameraToWorld {
    fn schema(&self) -> &CellSchema {
        &self.schema
    }

    fn process(&mut self, inputs: &Inputs<'_>, outputs: &mut Outputs) -> Result<Flow> {
        let points = inputs.get::<Vec<Point3<f32>>>("points")?;
        let r = inputs.get::<Matrix3<f64>>("R")?;
        let t = inputs.get::<Vector3<f64>>("T")?;
        let rt = r.transpose();
        let world: Vec<Point3<f32>> = points
            .iter()
            .map(|p| {
                let p = rt * (p.coords.cast::<f64>() - t);
                Point3::from(p.cast::<f32>())
            })
            .collect();
        outputs.set("points", world);
        Ok(Flow::Continue)
    }
}

/// Appends this frame's record to the accumulator it is handed.
pub struct ModelStacker {
    schema: CellSchema,
}

impl CellType for ModelStacker {
    const TYPE_NAME: &'static str = "ModelStacker";

    fn declare_params(_params: &mut ParamSet) {}

    fn new(params: ParamSet, _ctx: &BuildContext<'_>) -> Result<Self> {
        Ok(Self {
            schema: CellSchema::new(Self::TYPE_NAME)
                .input("records", PortType::Accumulator, "Records of the previous frames")
                .input("points", PortType::Points2d, "The 2D measurements")
                .input("points3d", PortType::Points3d, "World-frame 3D points")
                .input("descriptors", PortType::Descriptors, "The descriptors")
                .input("disparities", PortType::Disparities, "The disparities")
                .input("K", PortType::Matrix3, "The camera matrix")
                .input("R", PortType::Matrix3, "The rotation matrix")
                .input("T", PortType::Vector3, "The translation vector")
                .input("frame_number", PortType::Integer, "The frame number")
                .output("records", PortType::Accumulator, "Records including this frame")
                .with_params(params),
        })
    }
}

impl Cell for ModelStacker {
    fn schema(&self) -> &CellSchema {
        &self.schema
    }

    fn process(&mut self, inputs: &Inputs<'_>, outputs: &mut Outputs) -> Result<Flow> {
        let empty = Accumulator::default();
        let records = inputs.optional::<Accumulator>("records")?.unwrap_or(&empty);
        let record = FrameRecord {
            frame_number: *inputs.get::<i64>("frame_number")?,
            k: *inputs.get::<Matrix3<f64>>("K")?,
            r: *inputs.get::<Matrix3<f64>>("R")?,
            t: *inputs.get::<Vector3<f64>>("T")?,
            points: inputs.get::<Vec<Point2<f32>>>("points")?.clone(),
            points3d: inputs.get::<Vec<Point3<f32>>>("points3d")?.clone(),
            descriptors: inputs.get::<Vec<Descriptor>>("descriptors")?.clone(),
            disparities: inputs.get::<Vec<f32>>("disparities")?.clone(),
        };
        let n = record.points3d.len();
        if record.descriptors.len() != n || record.points.len() != n {
            bail!(
                "frame {}: {} points3d, {} points, {} descriptors",
                record.frame_number,
                n,
                record.points.len(),
                record.descriptors.len()
            );
        }
        debug!("frame {}: {} points", record.frame_number, n);
        outputs.set("records", records.appended(record));
        Ok(Flow::Continue)
    }
}

/// Merges every frame's points into one voxel-deduplicated model.
pub struct PointMerger {
    schema: CellSchema,
    voxel_size: f64,
}

impl CellType for PointMerger {
    const TYPE_NAME: &'static str = "PointMerger";

    fn declare_params(params: &mut ParamSet) {
        params.declare("voxel_size", "Points in the same voxel of this size are merged, in metres", 0.002);
    }

    fn new(params: ParamSet, _ctx: &BuildContext<'_>) -> Result<Self> {
        let voxel_size = *param::<f64>(&params.values(), "voxel_size")?;
        if !(voxel_size > 0.0) {
            bail!("voxel_size must be positive, got {}", voxel_size);
        }
        Ok(Self {
            schema: CellSchema::new(Self::TYPE_NAME)
                .input("records", PortType::Accumulator, "Every frame's records")
                .output("points", PortType::Points3d, "Merged 3D points")
                .output("descriptors", PortType::Descriptors, "One descriptor per merged point")
                .with_params(params),
            voxel_size,
        })
    }
}

impl Cell for PointMerger {
    fn schema(&self) -> &CellSchema {
        &self.schema
    }

    fn process(&mut self, inputs: &Inputs<'_>, outputs: &mut Outputs) -> Result<Flow> {
        let records = inputs.get::<Accumulator>("records")?;
        let mut seen: BTreeSet<(i64, i64, i64)> = BTreeSet::new();
        let mut points = Vec::new();
        let mut descriptors = Vec::new();
        for record in records.iter() {
            for (p, d) in record.points3d.iter().zip(&record.descriptors) {
                if !(p.x.is_finite() && p.y.is_finite() && p.z.is_finite()) {
                    continue;
                }
                let key = (
                    (p.x as f64 / self.voxel_size).floor() as i64,
                    (p.y as f64 / self.voxel_size).floor() as i64,
                    (p.z as f64 / self.voxel_size).floor() as i64,
                );
                if seen.insert(key) {
                    points.push(*p);
                    descriptors.push(d.clone());
                }
            }
        }
        info!(
            "merged {} frames into {} points",
            records.len(),
            points.len()
        );
        outputs.set("points", points);
        outputs.set("descriptors", descriptors);
        Ok(Flow::Continue)
    }
}

/// Packages merged points and descriptors into a model document.
pub struct ModelFiller {
    schema: CellSchema,
    object_id: String,
}

impl CellType for ModelFiller {
    const TYPE_NAME: &'static str = "ModelFiller";

    fn declare_params(params: &mut ParamSet) {
        params.declare("object_id", "The id of the object the model describes", "object");
    }

    fn new(params: ParamSet, _ctx: &BuildContext<'_>) -> Result<Self> {
        let object_id = param::<String>(&params.values(), "object_id")?.clone();
        Ok(Self {
            schema: CellSchema::new(Self::TYPE_NAME)
                .input("points", PortType::Points3d, "Merged 3D points")
                .input("descriptors", PortType::Descriptors, "Merged descriptors")
                .output("db_document", PortType::Document, "The model document")
                .with_params(params),
            object_id,
        })
    }
}

impl Cell for ModelFiller {
    fn schema(&self) -> &CellSchema {
        &self.schema
    }

    fn process(&mut self, inputs: &Inputs<'_>, outputs: &mut Outputs) -> Result<Flow> {
        let points = inputs.get::<Vec<Point3<f32>>>("points")?;
        let descriptors = inputs.get::<Vec<Descriptor>>("descriptors")?;
        outputs.set(
            "db_document",
            ModelDocument {
                object_id: self.object_id.clone(),
                method: METHOD.to_string(),
                submethod: String::new(),
                points: points.iter().map(|p| [p.x, p.y, p.z]).collect(),
                descriptors: descriptors.clone(),
            },
        );
        Ok(Flow::Continue)
    }
}

/// Stamps the submethod on a document and writes it to the database.
pub struct ModelWriter {
    schema: CellSchema,
    json_db: String,
    submethod: String,
}

impl CellType for ModelWriter {
    const TYPE_NAME: &'static str = "ModelWriter";

    fn declare_params(params: &mut ParamSet) {
        params
            .declare("json_db", "The DB parameters as a JSON string", "{}")
            .declare(
                "json_submethod",
                "The submethod the model belongs to as a JSON string",
                r#"{"descriptor": {"type": "ORB"}}"#,
            );
    }

    fn new(params: ParamSet, _ctx: &BuildContext<'_>) -> Result<Self> {
        let p = params.values();
        let json_db = param::<String>(&p, "json_db")?.clone();
        let submethod = param::<String>(&p, "json_submethod")?.clone();
        serde_json::from_str::<serde_json::Value>(&submethod)?;
        // fail at build time rather than after the whole sequence
        open_db(&json_db)?;
        Ok(Self {
            schema: CellSchema::new(Self::TYPE_NAME)
                .input("db_document", PortType::Document, "The document to write")
                .with_params(params),
            json_db,
            submethod,
        })
    }
}

impl Cell for ModelWriter {
    fn schema(&self) -> &CellSchema {
        &self.schema
    }

    fn process(&mut self, inputs: &Inputs<'_>, _outputs: &mut Outputs) -> Result<Flow> {
        let mut doc = inputs.get::<ModelDocument>("db_document")?.clone();
        doc.submethod = self.submethod.clone();
        open_db(&self.json_db)?.write_document(&doc)?;
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{Params, PortValues, Value};
    use crate::cells::run_cell;
    use crate::db::ObjectSelection;
    use crate::observation::synthetic_sequence;
    use pretty_assertions::assert_eq;

    fn record(frame_number: i64, points3d: Vec<Point3<f32>>) -> FrameRecord {
        let n = points3d.len();
        FrameRecord {
            frame_number,
            k: Matrix3::identity(),
            r: Matrix3::identity(),
            t: Vector3::zeros(),
            points: vec![Point2::origin(); n],
            points3d,
            descriptors: (0..n).map(|i| vec![i as u8 + frame_number as u8 * 10]).collect(),
            disparities: vec![1.0; n],
        }
    }

    #[test]
    fn dealer_quits_when_the_source_is_exhausted() {
        let mut dealer = ObservationDealer::new(synthetic_sequence(1));
        let mut out = Outputs::default();
        let empty = PortValues::new();
        assert_eq!(
            dealer.process(&Inputs::from_values("dealer", &empty), &mut out).unwrap(),
            Flow::Continue
        );
        assert_eq!(out.into_values().get("frame_number"), Some(&Value::Integer(0)));
        let mut out = Outputs::default();
        assert_eq!(
            dealer.process(&Inputs::from_values("dealer", &empty), &mut out).unwrap(),
            Flow::Quit
        );
    }

    #[test]
    fn camera_points_are_moved_to_the_world_frame() {
        let r = nalgebra::Rotation3::from_axis_angle(&Vector3::z_axis(), std::f64::consts::FRAC_PI_2)
            .into_inner();
        let values = PortValues::from([
            ("points".to_string(), Value::Points3d(vec![Point3::new(0.0, 1.0, 2.0)])),
            ("R".to_string(), Value::Matrix(r)),
            ("T".to_string(), Value::Vector(Vector3::new(0.0, 0.0, 1.0))),
        ]);
        let out = run_cell::<CameraToWorld>(&Params::new(), &values).unwrap();
        let Some(Value::Points3d(points)) = out.get("points") else {
            panic!("no points");
        };
        // R^T rotates by -90 degrees around z
        assert!((points[0] - Point3::new(1.0, 0.0, 1.0)).norm() < 1e-6);
    }

    #[test]
    fn merger_keeps_the_first_point_per_voxel() {
        let acc = Accumulator::default()
            .appended(record(0, vec![Point3::new(0.0, 0.0, 0.5), Point3::new(0.1, 0.0, 0.5)]))
            .appended(record(1, vec![Point3::new(0.0005, 0.0, 0.5), Point3::new(f32::NAN, 0.0, 0.5)]));
        let values = PortValues::from([("records".to_string(), Value::Records(acc))]);
        let out = run_cell::<PointMerger>(&Params::new(), &values).unwrap();

        assert_eq!(
            out.get("points"),
            Some(&Value::Points3d(vec![
                Point3::new(0.0, 0.0, 0.5),
                Point3::new(0.1, 0.0, 0.5)
            ]))
        );
        assert_eq!(
            out.get("descriptors"),
            Some(&Value::Descriptors(vec![vec![0], vec![1]]))
        );
    }

    #[test]
    fn merging_follows_voxel_boundaries_not_distance() {
        let points = vec![
            Point3::new(0.0099, 0.0, 0.5),
            Point3::new(0.0101, 0.0, 0.5),
            Point3::new(0.019, 0.0, 0.5),
        ];
        let acc = Accumulator::default().appended(record(0, points));
        let args = Params::from([("voxel_size".to_string(), Value::Real(0.01))]);
        let values = PortValues::from([("records".to_string(), Value::Records(acc))]);
        let out = run_cell::<PointMerger>(&args, &values).unwrap();

        // the first two straddle a boundary, the last two share a voxel
        assert_eq!(
            out.get("points"),
            Some(&Value::Points3d(vec![
                Point3::new(0.0099, 0.0, 0.5),
                Point3::new(0.0101, 0.0, 0.5)
            ]))
        );
    }

    #[test]
    fn stacker_appends_one_record() {
        let prefix = Accumulator::default().appended(record(0, vec![]));
        let values = PortValues::from([
            ("records".to_string(), Value::Records(prefix.clone())),
            ("points".to_string(), Value::Points2d(vec![Point2::new(1.0, 2.0)])),
            ("points3d".to_string(), Value::Points3d(vec![Point3::new(0.0, 0.0, 1.0)])),
            ("descriptors".to_string(), Value::Descriptors(vec![vec![7]])),
            ("disparities".to_string(), Value::Disparities(vec![3.0])),
            ("K".to_string(), Value::Matrix(Matrix3::identity())),
            ("R".to_string(), Value::Matrix(Matrix3::identity())),
            ("T".to_string(), Value::Vector(Vector3::zeros())),
            ("frame_number".to_string(), Value::Integer(1)),
        ]);
        let out = run_cell::<ModelStacker>(&Params::new(), &values).unwrap();
        let Some(Value::Records(acc)) = out.get("records") else {
            panic!("no records");
        };
        assert!(acc.extends_by_one(&prefix));
        assert_eq!(acc.frame_numbers(), vec![0, 1]);
    }

    #[test]
    fn writer_stamps_the_submethod() {
        let json_db = r#"{"type": "memory", "name": "writer_test"}"#;
        let doc = ModelDocument {
            object_id: "mug".to_string(),
            method: METHOD.to_string(),
            submethod: String::new(),
            points: vec![],
            descriptors: vec![],
        };
        let args = Params::from([("json_db".to_string(), Value::from(json_db))]);
        let values = PortValues::from([("db_document".to_string(), Value::Document(doc))]);
        run_cell::<ModelWriter>(&args, &values).unwrap();

        let stored = open_db(json_db)
            .unwrap()
            .load_models(&ObjectSelection::All)
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].submethod, r#"{"descriptor": {"type": "ORB"}}"#);
    }
}
