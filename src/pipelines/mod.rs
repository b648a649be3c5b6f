//! The two concrete pipelines, built from registered cells.

pub mod detection;
pub mod training;

pub use detection::TodDetector;
pub use training::{IncrementalModelBuilder, PostProcessor, TodTrainer, TrainingComposite};

use crate::composite::CellRegistry;

/// Composites that can be nested by type name. `TodTrainer` is not among
/// them: it owns its observation source.
pub fn register(registry: &mut CellRegistry) {
    registry.register_composite::<TodDetector>();
    registry.register_composite::<IncrementalModelBuilder>();
    registry.register_composite::<PostProcessor>();
}
