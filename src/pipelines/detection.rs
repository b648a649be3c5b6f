//! Detection pipeline: find known objects and their poses in one RGB-D
//! frame.
//!
//! ```text
//! image, K -> passthrough -> depth_map -> points3d -> guess_generator
//! image -> feature_descriptor -> descriptor_matcher -> guess_generator
//! ```

use crate::Result;
use crate::cell::{ParamSet, Params, PortType, param};
use crate::cells::Passthrough;
use crate::composite::{BlackBox, BuildContext, CellInfo, Schemas};
use crate::graph::{Forward, Forwards, SinkGraph, Topology, edge, edges};
use crate::transport;

#[derive(Debug, Default)]
pub struct TodDetector;

impl BlackBox for TodDetector {
    fn type_name(&self) -> &'static str {
        "TodDetector"
    }

    fn declare_direct_params(&self, p: &mut ParamSet) {
        p.declare("db", "The DB to get data from as a JSON string", "{}")
            .declare("search", "The search parameters as a JSON string", "{}")
            .declare(
                "object_ids",
                "The ids of the objects to find as a JSON list or the keyword \"all\"",
                "all",
            )
            .declare("visualize", "If true, some windows pop up to see the progress", false)
            .declare(
                "rgb_frame_id",
                "The frame id of published images",
                transport::default_frame_id(),
            )
            .declare(
                "features_topic",
                "The topic images with keypoints are published on",
                "features",
            );
    }

    fn declare_cells(&self, p: &Params) -> Result<Vec<(String, CellInfo)>> {
        let visualize = *param::<bool>(p, "visualize")?;
        Ok(vec![
            ("depth_map".to_string(), CellInfo::deferred("RescaledRegisteredDepth")),
            ("feature_descriptor".to_string(), CellInfo::deferred("FeatureDescriptor")),
            (
                "guess_generator".to_string(),
                CellInfo::deferred("GuessGenerator").arg("visualize", visualize),
            ),
            (
                "passthrough".to_string(),
                CellInfo::direct(Passthrough::new(&[
                    ("image", PortType::Image, "An image"),
                    ("K", PortType::Matrix3, "The camera matrix"),
                ])),
            ),
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
            .param(
                "guess_generator",
                vec![
                    Forward::key("n_ransac_iterations"),
                    Forward::key("min_inliers"),
                    Forward::key("sensor_error"),
                ],
            )
            .input("passthrough", vec![Forward::key("image"), Forward::key("K")])
            .input("feature_descriptor", vec![Forward::key("mask")])
            .input("depth_map", vec![Forward::key("depth")])
            .output("feature_descriptor", vec![Forward::key("keypoints")])
            .output("guess_generator", vec![Forward::key("pose_results")])
    }

    fn configure(&self, p: &Params, _cells: &Schemas) -> Result<Vec<(String, CellInfo)>> {
        Ok(vec![
            (
                "descriptor_matcher".to_string(),
                CellInfo::deferred("DescriptorMatcher")
                    .arg("db", param::<String>(p, "db")?.as_str())
                    .arg("search", param::<String>(p, "search")?.as_str())
                    .arg("object_ids", param::<String>(p, "object_ids")?.as_str()),
            ),
            ("points3d".to_string(), CellInfo::deferred("DepthTo3d")),
        ])
    }

    fn connections(&self, p: &Params, _cells: &Schemas, ctx: &BuildContext<'_>) -> Result<Topology> {
        let visualize = *param::<bool>(p, "visualize")?;
        let publish = ctx.transport_available();
        let mut t = Topology::default();

        // rescale the depth image and convert to 3d
        t.always([
            edge(("passthrough", "image"), ("depth_map", "image")),
            edge(("depth_map", "depth"), ("points3d", "depth")),
            edge(("passthrough", "K"), ("points3d", "K")),
            edge(("points3d", "points3d"), ("guess_generator", "points3d")),
        ]);
        t.always([
            edge(("passthrough", "image"), ("feature_descriptor", "image")),
            edge(("passthrough", "image"), ("guess_generator", "image")),
            edge(("descriptor_matcher", "spans"), ("guess_generator", "spans")),
            edge(("descriptor_matcher", "object_ids"), ("guess_generator", "object_ids")),
            edge(("feature_descriptor", "keypoints"), ("guess_generator", "keypoints")),
            edge(("feature_descriptor", "descriptors"), ("descriptor_matcher", "descriptors")),
        ])
        .always(edges(
            "descriptor_matcher",
            &["matches", "matches_3d"],
            "guess_generator",
            &["matches", "matches_3d"],
        ));
        t.optional([edge(("depth_map", "depth"), ("feature_descriptor", "depth"))]);

        t.sink(
            SinkGraph::new("keypoints", visualize || publish)
                .cell("cvt_color", CellInfo::deferred("CvtColor"))
                .cell("draw_keypoints", CellInfo::deferred("DrawKeypoints"))
                .edges([
                    edge(("passthrough", "image"), ("cvt_color", "image")),
                    edge(("cvt_color", "image"), ("draw_keypoints", "image")),
                    edge(("feature_descriptor", "keypoints"), ("draw_keypoints", "keypoints")),
                ]),
        );
        t.sink(
            SinkGraph::new("display", visualize)
                .cell("image_view", CellInfo::deferred("ImShow").arg("name", "RGB"))
                .cell("keypoints_view", CellInfo::deferred("ImShow").arg("name", "Keypoints"))
                .cell("pose_drawer", CellInfo::deferred("PosesDrawer"))
                .cell("pose_view", CellInfo::deferred("ImShow").arg("name", "Pose"))
                .edges([
                    edge(("passthrough", "image"), ("image_view", "image")),
                    edge(("draw_keypoints", "image"), ("keypoints_view", "image")),
                ])
                .edges(edges("passthrough", &["image", "K"], "pose_drawer", &["image", "K"]))
                .edges(edges("guess_generator", &["Rs", "Ts"], "pose_drawer", &["Rs", "Ts"]))
                .edges([edge(("pose_drawer", "output"), ("pose_view", "image"))]),
        );
        t.sink(
            SinkGraph::new("publish", publish)
                .cell(
                    "message_cvt",
                    CellInfo::deferred("Mat2Image")
                        .arg("frame_id", param::<String>(p, "rgb_frame_id")?.as_str()),
                )
                .cell(
                    "pub_features",
                    CellInfo::deferred("ImagePublisher")
                        .arg("topic_name", param::<String>(p, "features_topic")?.as_str()),
                )
                .edges([
                    edge(("draw_keypoints", "image"), ("message_cvt", "image")),
                    edge(("message_cvt", "image"), ("pub_features", "image")),
                ]),
        );
        Ok(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{PortValues, Value};
    use crate::composite::{CellRegistry, Composite, Tick};
    use crate::db::{METHOD, ModelDocument, open_db};
    use crate::graph::{GraphBuildError, Layer};
    use crate::observation::synthetic_observation;
    use crate::transport::{TransportConfig, probe};
    use pretty_assertions::assert_eq;
    use std::net::UdpSocket;

    fn build(args: Params, ctx: &BuildContext<'_>) -> Result<Composite> {
        Composite::build(&TodDetector, &args, ctx)
    }

    fn frame() -> PortValues {
        let obs = synthetic_observation(0);
        PortValues::from([
            ("image".to_string(), Value::Image(obs.image)),
            ("K".to_string(), Value::Matrix(obs.k)),
            ("depth".to_string(), Value::Depth(obs.depth)),
            ("mask".to_string(), Value::GrayImage(obs.mask)),
        ])
    }

    fn core_edges() -> Vec<String> {
        vec![
            "passthrough[image] >> depth_map[image]",
            "depth_map[depth] >> points3d[depth]",
            "passthrough[K] >> points3d[K]",
            "points3d[points3d] >> guess_generator[points3d]",
            "passthrough[image] >> feature_descriptor[image]",
            "passthrough[image] >> guess_generator[image]",
            "descriptor_matcher[spans] >> guess_generator[spans]",
            "descriptor_matcher[object_ids] >> guess_generator[object_ids]",
            "feature_descriptor[keypoints] >> guess_generator[keypoints]",
            "feature_descriptor[descriptors] >> descriptor_matcher[descriptors]",
            "descriptor_matcher[matches] >> guess_generator[matches]",
            "descriptor_matcher[matches_3d] >> guess_generator[matches_3d]",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    #[test]
    fn default_build_has_exactly_the_core_edges_and_ticks() {
        let registry = CellRegistry::standard();
        let ctx = BuildContext::new(&registry);
        let mut detector = build(Params::new(), &ctx).unwrap();

        let got: Vec<String> = detector
            .graph()
            .edges
            .iter()
            .map(|e| e.edge.to_string())
            .collect();
        assert_eq!(got, core_edges());
        assert!(detector.graph().edges_in(Layer::Sink).is_empty());

        match detector.tick(&frame()).unwrap() {
            Tick::Done(out) => {
                assert_eq!(out.get("pose_results"), Some(&Value::Poses(vec![])));
                assert!(matches!(out.get("keypoints"), Some(Value::Keypoints(_))));
            }
            Tick::Quit => panic!("detector has no source to exhaust"),
        }
    }

    #[test]
    fn composite_surface_matches_the_forwards() {
        let registry = CellRegistry::standard();
        let ctx = BuildContext::new(&registry);
        let detector = build(Params::new(), &ctx).unwrap();
        let schema = crate::cell::Cell::schema(&detector);

        let params: Vec<&str> = schema.params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            params,
            vec![
                "db",
                "search",
                "object_ids",
                "visualize",
                "rgb_frame_id",
                "features_topic",
                "json_feature_params",
                "json_descriptor_params",
                "n_ransac_iterations",
                "min_inliers",
                "sensor_error",
            ]
        );
        let inputs: Vec<&str> = schema.inputs.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(inputs, vec!["depth", "mask", "image", "K"]);
        let outputs: Vec<&str> = schema.outputs.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(outputs, vec!["keypoints", "pose_results"]);
    }

    #[test]
    fn depth_feed_follows_the_feature_type() {
        let registry = CellRegistry::standard();
        let ctx = BuildContext::new(&registry);
        let args = Params::from([(
            "json_feature_params".to_string(),
            Value::from(r#"{"type": "ORB3D"}"#),
        )]);
        let mut detector = build(args, &ctx).unwrap();
        assert_eq!(
            detector
                .graph()
                .edges_in(Layer::Optional)
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>(),
            vec!["depth_map[depth] >> feature_descriptor[depth]"]
        );
        assert!(matches!(detector.tick(&frame()).unwrap(), Tick::Done(_)));
    }

    #[test]
    fn visualize_adds_exactly_the_display_edges() {
        let registry = CellRegistry::standard();
        let ctx = BuildContext::new(&registry);
        let args = Params::from([("visualize".to_string(), Value::Flag(true))]);
        let mut detector = build(args, &ctx).unwrap();

        let sink: Vec<String> = detector
            .graph()
            .edges_in(Layer::Sink)
            .iter()
            .map(|e| e.to_string())
            .collect();
        assert_eq!(
            sink,
            vec![
                "passthrough[image] >> cvt_color[image]",
                "cvt_color[image] >> draw_keypoints[image]",
                "feature_descriptor[keypoints] >> draw_keypoints[keypoints]",
                "passthrough[image] >> image_view[image]",
                "draw_keypoints[image] >> keypoints_view[image]",
                "passthrough[image] >> pose_drawer[image]",
                "passthrough[K] >> pose_drawer[K]",
                "guess_generator[Rs] >> pose_drawer[Rs]",
                "guess_generator[Ts] >> pose_drawer[Ts]",
                "pose_drawer[output] >> pose_view[image]",
            ]
        );
        let primary: Vec<String> = detector
            .graph()
            .edges
            .iter()
            .filter(|e| e.layer != Layer::Sink)
            .map(|e| e.edge.to_string())
            .collect();
        assert_eq!(primary, core_edges());
        assert!(matches!(detector.tick(&frame()).unwrap(), Tick::Done(_)));
    }

    #[test]
    fn transport_enables_the_publish_graph() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let config = TransportConfig {
            address: receiver.local_addr().unwrap().to_string(),
            topic: "features".to_string(),
            frame_id: "cam".to_string(),
        };
        let registry = CellRegistry::standard();
        let ctx = BuildContext::new(&registry).with_transport(probe(Some(&config)));
        let mut detector = build(Params::new(), &ctx).unwrap();

        assert_eq!(detector.graph().edges_in(Layer::Sink).len(), 5);
        assert!(detector.cell_schema("pub_features").is_some());
        assert!(detector.cell_schema("image_view").is_none());
        assert!(matches!(detector.tick(&frame()).unwrap(), Tick::Done(_)));
    }

    #[test]
    fn unknown_parameter_fails_the_build() {
        let registry = CellRegistry::standard();
        let ctx = BuildContext::new(&registry);
        let args = Params::from([("visualise".to_string(), Value::Flag(true))]);
        let err = build(args, &ctx).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<GraphBuildError>(),
            Some(GraphBuildError::UnknownParameter { .. })
        ));
    }

    #[test]
    fn a_trained_model_is_found_again() {
        let json_db = r#"{"type": "memory", "name": "detector_roundtrip"}"#;
        let mut trainer = crate::pipelines::training::TrainingComposite::build(
            crate::observation::synthetic_sequence(1),
            &Params::from([
                ("json_db".to_string(), Value::from(json_db)),
                ("object_id".to_string(), Value::from("plane")),
            ]),
            &BuildContext::new(&CellRegistry::standard()),
        )
        .unwrap();
        let doc: ModelDocument = trainer.run().unwrap();
        assert_eq!(doc.method, METHOD);
        assert!(!open_db(json_db).unwrap().load_models(&crate::db::ObjectSelection::All).unwrap().is_empty());

        let registry = CellRegistry::standard();
        let ctx = BuildContext::new(&registry);
        let args = Params::from([
            ("db".to_string(), Value::from(json_db)),
            ("min_inliers".to_string(), Value::Integer(10)),
        ]);
        let mut detector = build(args, &ctx).unwrap();
        let Tick::Done(out) = detector.tick(&frame()).unwrap() else {
            panic!("unexpected quit");
        };
        let Some(Value::Poses(poses)) = out.get("pose_results") else {
            panic!("no poses");
        };
        assert_eq!(poses.len(), 1);
        // model points are in the world frame, which frame 0 sees at T
        let (_, t) = crate::observation::pose(0);
        assert_eq!(poses[0].object_id, "plane");
        assert!((poses[0].translation - t).norm() < 0.05);
    }
}
