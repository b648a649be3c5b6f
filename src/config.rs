//! Pipeline configuration file.
//!
//! JSON shape (every field optional):
//! {
//!   "db": {"type": "file", "root": "models"},
//!   "search": {"radius": 64, "ratio": 0.8},
//!   "object_ids": ["mug"],            // or "all"
//!   "visualize": false,
//!   "feature": {"type": "ORB", "n_features": 1000},
//!   "descriptor": {"type": "ORB"},
//!   "n_ransac_iterations": 1000,
//!   "min_inliers": 15,
//!   "sensor_error": 0.01,
//!   "object_id": "mug",
//!   "submethod": {"descriptor": {"type": "ORB"}},
//!   "voxel_size": 0.002,
//!   "K": [[fx, 0, cx], [0, fy, cy], [0, 0, 1]],
//!   "transport": {"address": "127.0.0.1:9870", "topic": "features"}
//! }
//!
//! Objects are re-encoded to the JSON strings the composites take as
//! parameters.

use crate::Result;
use crate::cell::{Params, Value};
use crate::transport::{self, TransportConfig};

use anyhow::{Context, bail};
use nalgebra::Matrix3;
use serde::Deserialize;
use serde_json::json;
use std::fs;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ObjectIds {
    List(Vec<String>),
    /// Only `"all"` is accepted.
    Keyword(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub db: serde_json::Value,
    pub search: serde_json::Value,
    pub object_ids: ObjectIds,
    pub visualize: bool,
    pub feature: serde_json::Value,
    pub descriptor: serde_json::Value,
    pub n_ransac_iterations: i64,
    pub min_inliers: i64,
    pub sensor_error: f64,
    pub object_id: String,
    pub submethod: serde_json::Value,
    pub voxel_size: f64,
    #[serde(rename = "K")]
    pub k: Option<[[f64; 3]; 3]>,
    pub transport: Option<TransportConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db: json!({}),
            search: json!({}),
            object_ids: ObjectIds::Keyword("all".to_string()),
            visualize: false,
            feature: json!({"type": "ORB", "n_features": 1000}),
            descriptor: json!({"type": "ORB"}),
            n_ransac_iterations: 1000,
            min_inliers: 15,
            sensor_error: 0.01,
            object_id: "object".to_string(),
            submethod: json!({"descriptor": {"type": "ORB"}}),
            voxel_size: 0.002,
            k: None,
            transport: None,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &str) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("failed to read {}", path))?;
        let config: PipelineConfig =
            serde_json::from_str(&text).with_context(|| format!("invalid configuration {}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let ObjectIds::Keyword(word) = &self.object_ids {
            if word != "all" {
                bail!("object_ids must be a list or \"all\", got {:?}", word);
            }
        }
        for (name, value) in [
            ("db", &self.db),
            ("search", &self.search),
            ("feature", &self.feature),
            ("descriptor", &self.descriptor),
            ("submethod", &self.submethod),
        ] {
            if !value.is_object() {
                bail!("{} must be a JSON object", name);
            }
        }
        Ok(())
    }

    fn object_ids_param(&self) -> Result<String> {
        Ok(match &self.object_ids {
            ObjectIds::Keyword(word) => word.clone(),
            ObjectIds::List(ids) => serde_json::to_string(ids)?,
        })
    }

    /// Parameters of `TodDetector`.
    pub fn detector_args(&self) -> Result<Params> {
        let mut args = Params::from([
            ("db".to_string(), Value::Text(self.db.to_string())),
            ("search".to_string(), Value::Text(self.search.to_string())),
            ("object_ids".to_string(), Value::Text(self.object_ids_param()?)),
            ("visualize".to_string(), Value::Flag(self.visualize)),
            ("json_feature_params".to_string(), Value::Text(self.feature.to_string())),
            ("json_descriptor_params".to_string(), Value::Text(self.descriptor.to_string())),
            ("n_ransac_iterations".to_string(), Value::Integer(self.n_ransac_iterations)),
            ("min_inliers".to_string(), Value::Integer(self.min_inliers)),
            ("sensor_error".to_string(), Value::Real(self.sensor_error)),
        ]);
        if let Some(t) = &self.transport {
            transport::validate_topic(&t.topic)?;
            args.insert("rgb_frame_id".to_string(), Value::Text(t.frame_id.clone()));
            args.insert("features_topic".to_string(), Value::Text(t.topic.clone()));
        }
        Ok(args)
    }

    /// Parameters of `TodTrainer`.
    pub fn trainer_args(&self) -> Params {
        Params::from([
            ("json_db".to_string(), Value::Text(self.db.to_string())),
            ("visualize".to_string(), Value::Flag(self.visualize)),
            ("json_feature_params".to_string(), Value::Text(self.feature.to_string())),
            ("json_descriptor_params".to_string(), Value::Text(self.descriptor.to_string())),
            ("json_submethod".to_string(), Value::Text(self.submethod.to_string())),
            ("object_id".to_string(), Value::Text(self.object_id.clone())),
            ("voxel_size".to_string(), Value::Real(self.voxel_size)),
        ])
    }

    /// Camera matrix overriding the one an observation carries.
    pub fn intrinsics(&self) -> Option<Matrix3<f64>> {
        self.k.map(|rows| {
            Matrix3::new(
                rows[0][0], rows[0][1], rows[0][2], rows[1][0], rows[1][1], rows[1][2], rows[2][0],
                rows[2][1], rows[2][2],
            )
        })
    }
}
