//! Training pipeline: build an object model from a sequence of observations.
//!
//! ```text
//! observation_dealer -> incremental_model_builder -> records
//!                                  (after exhaustion) records -> post_processor -> model_writer
//! ```
//!
//! The accumulator never lives inside a cell. `TrainingComposite` owns it and
//! threads it through the `records` input/output of every tick, then hands
//! the final value to the finalize pass.

use crate::Result;
use crate::cell::{Accumulator, ParamSet, Params, PortType, PortValues, Value, param};
use crate::cells::{ObservationDealer, Passthrough};
use crate::composite::{BlackBox, BuildContext, CellInfo, Composite, Schemas, Tick, connect_matching};
use crate::db::ModelDocument;
use crate::graph::{Forward, Forwards, SinkGraph, Topology, edge, edges};
use crate::observation::ObservationSource;

use anyhow::{anyhow, bail};
use log::info;
use std::cell::RefCell;

/// Given one observation, appends its validated world-frame features to the
/// accumulator.
#[derive(Debug, Default)]
pub struct IncrementalModelBuilder;

impl BlackBox for IncrementalModelBuilder {
    fn type_name(&self) -> &'static str {
        "TodIncrementalModelBuilder"
    }

    fn declare_direct_params(&self, p: &mut ParamSet) {
        p.declare("visualize", "If true, displays images at runtime", false);
    }

    fn declare_cells(&self, _p: &Params) -> Result<Vec<(String, CellInfo)>> {
        Ok(vec![
            ("feature_descriptor".to_string(), CellInfo::deferred("FeatureDescriptor")),
            (
                "source".to_string(),
                CellInfo::direct(Passthrough::new(&[
                    ("image", PortType::Image, "An image"),
                    ("depth", PortType::DepthMap, "A depth image"),
                    ("mask", PortType::GrayImage, "A mask for valid object pixels"),
                    ("K", PortType::Matrix3, "The camera matrix"),
                    ("R", PortType::Matrix3, "The rotation matrix"),
                    ("T", PortType::Vector3, "The translation vector"),
                    ("frame_number", PortType::Integer, "The frame number"),
                ])),
            ),
            ("model_stacker".to_string(), CellInfo::deferred("ModelStacker")),
        ])
    }

    fn declare_forwards(&self, _p: &Params) -> Forwards {
        Forwards::default()
            .param(
                "feature_descriptor",
                vec![
                    Forward::key("json_feature_params"),
                    Forward::key("json_descriptor_params"),
                ],
            )
            .input("source", vec![Forward::All])
            .input("model_stacker", vec![Forward::key("records")])
            .output("model_stacker", vec![Forward::All])
    }

    fn configure(&self, _p: &Params, _cells: &Schemas) -> Result<Vec<(String, CellInfo)>> {
        Ok(vec![
            ("depth_to_3d_sparse".to_string(), CellInfo::deferred("DepthTo3dSparse")),
            ("camera_to_world".to_string(), CellInfo::deferred("CameraToWorld")),
            ("rescale_depth".to_string(), CellInfo::deferred("RescaledRegisteredDepth")),
            ("keypoint_validator".to_string(), CellInfo::deferred("KeypointsValidator")),
        ])
    }

    fn connections(&self, p: &Params, _cells: &Schemas, _ctx: &BuildContext<'_>) -> Result<Topology> {
        let visualize = *param::<bool>(p, "visualize")?;
        let mut t = Topology::default();

        t.optional([edge(("rescale_depth", "depth"), ("feature_descriptor", "depth"))]);
        t.always([
            edge(("source", "image"), ("feature_descriptor", "image")),
            edge(("source", "image"), ("rescale_depth", "image")),
            edge(("source", "mask"), ("feature_descriptor", "mask")),
            edge(("source", "depth"), ("rescale_depth", "depth")),
            edge(("source", "K"), ("depth_to_3d_sparse", "K")),
        ]);

        // keep the keypoints that are in the mask and have a valid depth
        t.always(edges(
            "feature_descriptor",
            &["keypoints", "descriptors"],
            "keypoint_validator",
            &["keypoints", "descriptors"],
        ))
        .always([
            edge(("source", "K"), ("keypoint_validator", "K")),
            edge(("source", "mask"), ("keypoint_validator", "mask")),
            edge(("rescale_depth", "depth"), ("keypoint_validator", "depth")),
        ]);

        // to 3d, then to the world frame
        t.always([
            edge(("keypoint_validator", "points"), ("depth_to_3d_sparse", "points")),
            edge(("rescale_depth", "depth"), ("depth_to_3d_sparse", "depth")),
            edge(("source", "R"), ("camera_to_world", "R")),
            edge(("source", "T"), ("camera_to_world", "T")),
            edge(("depth_to_3d_sparse", "points3d"), ("camera_to_world", "points")),
        ]);

        t.always([edge(("camera_to_world", "points"), ("model_stacker", "points3d"))])
            .always(edges(
                "keypoint_validator",
                &["points", "descriptors", "disparities"],
                "model_stacker",
                &["points", "descriptors", "disparities"],
            ))
            .always(edges(
                "source",
                &["K", "R", "T", "frame_number"],
                "model_stacker",
                &["K", "R", "T", "frame_number"],
            ));

        t.sink(
            SinkGraph::new("display", visualize)
                .cell("mask_view", CellInfo::deferred("ImShow").arg("name", "mask"))
                .cell("depth_view", CellInfo::deferred("ImShow").arg("name", "depth"))
                .cell("draw_keypoints", CellInfo::deferred("DrawKeypoints"))
                .cell("keypoints_view", CellInfo::deferred("ImShow").arg("name", "Keypoints"))
                .edges([
                    edge(("source", "mask"), ("mask_view", "image")),
                    edge(("source", "depth"), ("depth_view", "image")),
                    edge(("source", "image"), ("draw_keypoints", "image")),
                    edge(("feature_descriptor", "keypoints"), ("draw_keypoints", "keypoints")),
                    edge(("draw_keypoints", "image"), ("keypoints_view", "image")),
                ]),
        );
        Ok(t)
    }
}

/// Merges every stacked frame into one model document.
#[derive(Debug, Default)]
pub struct PostProcessor;

impl BlackBox for PostProcessor {
    fn type_name(&self) -> &'static str {
        "TodPostProcessor"
    }

    fn declare_direct_params(&self, p: &mut ParamSet) {
        p.declare("voxel_size", "Points in the same voxel of this size are merged, in metres", 0.002);
    }

    fn declare_cells(&self, _p: &Params) -> Result<Vec<(String, CellInfo)>> {
        Ok(vec![
            ("model_filler".to_string(), CellInfo::deferred("ModelFiller")),
            (
                "source".to_string(),
                CellInfo::direct(Passthrough::new(&[(
                    "records",
                    PortType::Accumulator,
                    "Every frame's records, in dealer order",
                )])),
            ),
        ])
    }

    fn declare_forwards(&self, _p: &Params) -> Forwards {
        Forwards::default()
            .param("model_filler", vec![Forward::key("object_id")])
            .input("source", vec![Forward::All])
            .output("model_filler", vec![Forward::All])
    }

    fn configure(&self, p: &Params, _cells: &Schemas) -> Result<Vec<(String, CellInfo)>> {
        let voxel_size = *param::<f64>(p, "voxel_size")?;
        Ok(vec![(
            "point_merger".to_string(),
            CellInfo::deferred("PointMerger").arg("voxel_size", voxel_size),
        )])
    }

    fn connections(&self, _p: &Params, _cells: &Schemas, _ctx: &BuildContext<'_>) -> Result<Topology> {
        let mut t = Topology::default();
        t.always([edge(("source", "records"), ("point_merger", "records"))])
            .always(edges(
                "point_merger",
                &["points", "descriptors"],
                "model_filler",
                &["points", "descriptors"],
            ));
        Ok(t)
    }
}

/// The whole training run: dealer, builder, and the finalize-phase
/// post-processor and writer.
///
/// Owns a non-restartable source, so it is built directly rather than through
/// the registry, and only once.
pub struct TodTrainer {
    source: RefCell<Option<ObservationSource>>,
}

impl TodTrainer {
    pub fn new(source: ObservationSource) -> Self {
        Self {
            source: RefCell::new(Some(source)),
        }
    }
}

impl BlackBox for TodTrainer {
    fn type_name(&self) -> &'static str {
        "TodTrainer"
    }

    fn declare_direct_params(&self, p: &mut ParamSet) {
        p.declare("json_db", "The DB parameters as a JSON string", "{}")
            .declare("visualize", "If true, displays images at runtime", false);
    }

    fn declare_cells(&self, p: &Params) -> Result<Vec<(String, CellInfo)>> {
        let source = self
            .source
            .borrow_mut()
            .take()
            .ok_or_else(|| anyhow!("the observation source of this trainer was already used"))?;
        Ok(vec![
            (
                "observation_dealer".to_string(),
                CellInfo::direct(ObservationDealer::new(source)),
            ),
            (
                "incremental_model_builder".to_string(),
                CellInfo::deferred("TodIncrementalModelBuilder")
                    .arg("visualize", *param::<bool>(p, "visualize")?),
            ),
            (
                "post_processor".to_string(),
                CellInfo::deferred("TodPostProcessor").finalize(),
            ),
            (
                "model_writer".to_string(),
                CellInfo::deferred("ModelWriter")
                    .arg("json_db", param::<String>(p, "json_db")?.as_str())
                    .finalize(),
            ),
        ])
    }

    fn declare_forwards(&self, _p: &Params) -> Forwards {
        Forwards::default()
            .param(
                "incremental_model_builder",
                vec![
                    Forward::key("json_feature_params"),
                    Forward::key("json_descriptor_params"),
                ],
            )
            .param(
                "post_processor",
                vec![Forward::key("object_id"), Forward::key("voxel_size")],
            )
            .param("model_writer", vec![Forward::key("json_submethod")])
            .input("incremental_model_builder", vec![Forward::key("records")])
            .input("post_processor", vec![Forward::key("records")])
            .output("incremental_model_builder", vec![Forward::key("records")])
            .output("post_processor", vec![Forward::key("db_document")])
    }

    fn connections(&self, _p: &Params, cells: &Schemas, _ctx: &BuildContext<'_>) -> Result<Topology> {
        let mut t = Topology::default();
        t.always(connect_matching(cells, "observation_dealer", "incremental_model_builder")?)
            .always([edge(("post_processor", "db_document"), ("model_writer", "db_document"))]);
        Ok(t)
    }
}

/// A built trainer plus the accumulator it threads from tick to tick.
pub struct TrainingComposite {
    composite: Composite,
    records: Accumulator,
}

impl TrainingComposite {
    pub fn build(source: ObservationSource, args: &Params, ctx: &BuildContext<'_>) -> Result<Self> {
        Ok(Self {
            composite: Composite::build(&TodTrainer::new(source), args, ctx)?,
            records: Accumulator::default(),
        })
    }

    pub fn composite(&self) -> &Composite {
        &self.composite
    }

    pub fn records(&self) -> &Accumulator {
        &self.records
    }

    fn inputs(&self) -> PortValues {
        PortValues::from([("records".to_string(), Value::Records(self.records.clone()))])
    }

    /// Process the next observation. Returns false once the dealer is
    /// exhausted.
    pub fn step(&mut self) -> Result<bool> {
        let mut out = match self.composite.tick(&self.inputs())? {
            Tick::Done(out) => out,
            Tick::Quit => return Ok(false),
        };
        let Some(Value::Records(next)) = out.remove("records") else {
            bail!("the model builder produced no records");
        };
        if !next.extends_by_one(&self.records) {
            bail!(
                "the model builder must append exactly one record, went from {} to {}",
                self.records.len(),
                next.len()
            );
        }
        self.records = next;
        Ok(true)
    }

    /// Drain the dealer, then merge and write the model once.
    pub fn run(&mut self) -> Result<ModelDocument> {
        while self.step()? {}
        if self.records.is_empty() {
            bail!("no observations were dealt, refusing to write an empty model");
        }
        let mut out = self.composite.finalize(&self.inputs())?;
        let Some(Value::Document(doc)) = out.remove("db_document") else {
            bail!("the post-processor produced no model document");
        };
        info!(
            "trained {} from {} frames: {} points",
            doc.object_id,
            self.records.len(),
            doc.points.len()
        );
        Ok(doc)
    }
}
