//! Concrete cells used by the detection and training pipelines.

pub mod depth;
pub mod detection;
pub mod display;
pub mod features;
pub mod training;

use crate::Result;
use crate::cell::{Cell, CellSchema, Flow, Inputs, Outputs, PortType};
use crate::composite::CellRegistry;

pub use depth::{DepthTo3d, DepthTo3dSparse, RescaledRegisteredDepth};
pub use detection::{DescriptorMatcher, GuessGenerator};
pub use display::{CvtColor, DrawKeypoints, ImShow, ImagePublisher, Mat2Image, PosesDrawer};
pub use features::{FeatureDescriptor, KeypointsValidator};
pub use training::{
    CameraToWorld, ModelFiller, ModelStacker, ModelWriter, ObservationDealer, PointMerger,
};

pub fn register(registry: &mut CellRegistry) {
    registry.register_cell::<RescaledRegisteredDepth>();
    registry.register_cell::<DepthTo3d>();
    registry.register_cell::<DepthTo3dSparse>();
    registry.register_cell::<FeatureDescriptor>();
    registry.register_cell::<KeypointsValidator>();
    registry.register_cell::<DescriptorMatcher>();
    registry.register_cell::<GuessGenerator>();
    registry.register_cell::<CameraToWorld>();
    registry.register_cell::<ModelStacker>();
    registry.register_cell::<PointMerger>();
    registry.register_cell::<ModelFiller>();
    registry.register_cell::<ModelWriter>();
    registry.register_cell::<CvtColor>();
    registry.register_cell::<DrawKeypoints>();
    registry.register_cell::<PosesDrawer>();
    registry.register_cell::<ImShow>();
    registry.register_cell::<Mat2Image>();
    registry.register_cell::<ImagePublisher>();
}

/// Copies each input to the output of the same name.
///
/// Gives a composite a single named place to fan its inputs out from.
pub struct Passthrough {
    schema: CellSchema,
}

impl Passthrough {
    pub fn new(items: &[(&str, PortType, &str)]) -> Self {
        let mut schema = CellSchema::new("Passthrough");
        for &(name, ty, doc) in items {
            schema = schema.input(name, ty, doc).output(name, ty, doc);
        }
        Self { schema }
    }
}

impl Cell for Passthrough {
    fn schema(&self) -> &CellSchema {
        &self.schema
    }

    fn process(&mut self, inputs: &Inputs<'_>, outputs: &mut Outputs) -> Result<Flow> {
        for port in inputs.ports() {
            if let Some(value) = inputs.value(port) {
                outputs.set(port, value.clone());
            }
        }
        Ok(Flow::Continue)
    }
}

/// Build a single cell from its declared defaults plus `args` and run one
/// pass over `values`.
#[cfg(test)]
pub(crate) fn run_cell<C: crate::composite::CellType>(
    args: &crate::cell::Params,
    values: &crate::cell::PortValues,
) -> Result<crate::cell::PortValues> {
    let registry = CellRegistry::new();
    let ctx = crate::composite::BuildContext::new(&registry);
    let mut params = crate::cell::ParamSet::default();
    C::declare_params(&mut params);
    let mut cell = C::new(params.bind(args)?, &ctx)?;
    let mut out = Outputs::default();
    cell.process(&Inputs::from_values("test", values), &mut out)?;
    Ok(out.into_values())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{PortValues, Value};
    use pretty_assertions::assert_eq;

    #[test]
    fn passthrough_copies_what_it_receives() {
        let mut cell = Passthrough::new(&[
            ("K", PortType::Matrix3, "The camera matrix"),
            ("frame_number", PortType::Integer, "The frame number"),
        ]);
        let values = PortValues::from([("frame_number".to_string(), Value::Integer(4))]);
        let mut out = Outputs::default();
        cell.process(&Inputs::from_values("source", &values), &mut out)
            .unwrap();
        assert_eq!(out.into_values(), values);
        assert_eq!(cell.schema().outputs.len(), 2);
    }

    #[test]
    fn standard_registry_knows_every_cell() {
        let registry = CellRegistry::standard();
        for name in [
            "FeatureDescriptor",
            "GuessGenerator",
            "ModelStacker",
            "TodDetector",
            "TodIncrementalModelBuilder",
            "TodPostProcessor",
        ] {
            assert!(registry.contains(name), "{} missing", name);
        }
    }
}
