use super::*;
use crate::cell::PortType;
use crate::graph::{Forward, Layer, SinkGraph, edge};
use pretty_assertions::assert_eq;

struct Counter {
    schema: CellSchema,
    next: i64,
    limit: i64,
}

impl CellType for Counter {
    const TYPE_NAME: &'static str = "Counter";

    fn declare_params(params: &mut ParamSet) {
        params.declare("limit", "Values emitted before quitting", 3i64);
    }

    fn new(params: ParamSet, _ctx: &BuildContext<'_>) -> Result<Self> {
        let limit = *crate::cell::param::<i64>(&params.values(), "limit")?;
        Ok(Self {
            schema: CellSchema::new(Self::TYPE_NAME)
                .output("count", PortType::Integer, "Running count")
                .with_params(params),
            next: 0,
            limit,
        })
    }
}

impl Cell for Counter {
    fn schema(&self) -> &CellSchema {
        &self.schema
    }

    fn process(&mut self, _inputs: &Inputs<'_>, outputs: &mut Outputs) -> Result<Flow> {
        if self.next >= self.limit {
            return Ok(Flow::Quit);
        }
        outputs.set("count", self.next);
        self.next += 1;
        Ok(Flow::Continue)
    }
}

struct Scale {
    schema: CellSchema,
    factor: i64,
}

impl Scale {
    fn with(params: ParamSet) -> Result<Self> {
        let p = params.values();
        let factor = *crate::cell::param::<i64>(&p, "factor")?;
        let mut schema = CellSchema::new("Scale").input("value", PortType::Integer, "Input");
        if *crate::cell::param::<bool>(&p, "with_offset")? {
            schema = schema.input("offset", PortType::Integer, "Added after scaling");
        }
        Ok(Self {
            schema: schema
                .output("value", PortType::Integer, "Scaled value")
                .with_params(params),
            factor,
        })
    }
}

impl CellType for Scale {
    const TYPE_NAME: &'static str = "Scale";

    fn declare_params(params: &mut ParamSet) {
        params
            .declare("factor", "Multiplier", 2i64)
            .declare("with_offset", "Declare the offset input", false);
    }

    fn new(params: ParamSet, _ctx: &BuildContext<'_>) -> Result<Self> {
        Self::with(params)
    }
}

impl Cell for Scale {
    fn schema(&self) -> &CellSchema {
        &self.schema
    }

    fn process(&mut self, inputs: &Inputs<'_>, outputs: &mut Outputs) -> Result<Flow> {
        let value = inputs.get::<i64>("value")?;
        let offset = inputs.optional::<i64>("offset")?.copied().unwrap_or(0);
        outputs.set("value", value * self.factor + offset);
        Ok(Flow::Continue)
    }
}

struct Explode {
    schema: CellSchema,
}

impl CellType for Explode {
    const TYPE_NAME: &'static str = "Explode";

    fn declare_params(_params: &mut ParamSet) {}

    fn new(params: ParamSet, _ctx: &BuildContext<'_>) -> Result<Self> {
        Ok(Self {
            schema: CellSchema::new(Self::TYPE_NAME)
                .input("value", PortType::Any, "Observed value")
                .with_params(params),
        })
    }
}

impl Cell for Explode {
    fn schema(&self) -> &CellSchema {
        &self.schema
    }

    fn process(&mut self, _inputs: &Inputs<'_>, _outputs: &mut Outputs) -> Result<Flow> {
        bail!("display went away")
    }
}

struct Total {
    schema: CellSchema,
}

impl CellType for Total {
    const TYPE_NAME: &'static str = "Total";

    fn declare_params(_params: &mut ParamSet) {}

    fn new(params: ParamSet, _ctx: &BuildContext<'_>) -> Result<Self> {
        Ok(Self {
            schema: CellSchema::new(Self::TYPE_NAME)
                .input("value", PortType::Integer, "Final value")
                .output("total", PortType::Integer, "Echo of the final value")
                .with_params(params),
        })
    }
}

impl Cell for Total {
    fn schema(&self) -> &CellSchema {
        &self.schema
    }

    fn process(&mut self, inputs: &Inputs<'_>, outputs: &mut Outputs) -> Result<Flow> {
        outputs.set("total", *inputs.get::<i64>("value")?);
        Ok(Flow::Continue)
    }
}

/// counter -> scale, with a helper feeding scale's optional offset input.
#[derive(Default)]
struct Chain {
    explode: bool,
    forward_helper: bool,
}

impl BlackBox for Chain {
    fn type_name(&self) -> &'static str {
        "Chain"
    }

    fn declare_direct_params(&self, params: &mut ParamSet) {
        params.declare("verbose", "Unused flag", false);
    }

    fn declare_cells(&self, _p: &Params) -> Result<Vec<(String, CellInfo)>> {
        Ok(vec![
            ("counter".to_string(), CellInfo::deferred("Counter")),
            ("scale".to_string(), CellInfo::deferred("Scale")),
        ])
    }

    fn declare_forwards(&self, _p: &Params) -> Forwards {
        let mut f = Forwards::default()
            .param("counter", vec![Forward::key("limit")])
            .param("scale", vec![Forward::key("factor"), Forward::key("with_offset")])
            .output("scale", vec![Forward::renamed("value", "scaled")]);
        if self.forward_helper {
            f = f.output("offset", vec![Forward::All]);
        }
        f
    }

    fn configure(&self, _p: &Params, _cells: &Schemas) -> Result<Vec<(String, CellInfo)>> {
        Ok(vec![(
            "offset".to_string(),
            CellInfo::deferred("Scale").arg("factor", 10i64),
        )])
    }

    fn connections(&self, _p: &Params, _cells: &Schemas, _ctx: &BuildContext<'_>) -> Result<Topology> {
        let mut t = Topology::default();
        t.always([
            edge(("counter", "count"), ("scale", "value")),
            edge(("counter", "count"), ("offset", "value")),
        ])
        .optional([edge(("offset", "value"), ("scale", "offset"))])
        .sink(
            SinkGraph::new("explode", self.explode)
                .cell("boom", CellInfo::deferred("Explode"))
                .edges([edge(("scale", "value"), ("boom", "value"))]),
        );
        Ok(t)
    }
}

/// A frame-phase source plus a finalize cell fed from a composite input.
#[derive(Default)]
struct Summing;

impl BlackBox for Summing {
    fn type_name(&self) -> &'static str {
        "Summing"
    }

    fn declare_cells(&self, _p: &Params) -> Result<Vec<(String, CellInfo)>> {
        Ok(vec![
            ("counter".to_string(), CellInfo::deferred("Counter")),
            ("last".to_string(), CellInfo::deferred("Total").finalize()),
        ])
    }

    fn declare_forwards(&self, _p: &Params) -> Forwards {
        Forwards::default()
            .param("counter", vec![Forward::key("limit")])
            .input("last", vec![Forward::renamed("value", "final_value")])
            .output("counter", vec![Forward::key("count")])
            .output("last", vec![Forward::key("total")])
    }

    fn connections(&self, _p: &Params, _cells: &Schemas, _ctx: &BuildContext<'_>) -> Result<Topology> {
        Ok(Topology::default())
    }
}

/// Chain nested as a single cell.
#[derive(Default)]
struct Outer;

impl BlackBox for Outer {
    fn type_name(&self) -> &'static str {
        "Outer"
    }

    fn declare_cells(&self, _p: &Params) -> Result<Vec<(String, CellInfo)>> {
        Ok(vec![
            ("inner".to_string(), CellInfo::deferred("Chain")),
            ("double".to_string(), CellInfo::deferred("Scale")),
        ])
    }

    fn declare_forwards(&self, _p: &Params) -> Forwards {
        Forwards::default()
            .param("inner", vec![Forward::renamed("factor", "inner_factor")])
            .output("double", vec![Forward::key("value")])
    }

    fn connections(&self, _p: &Params, _cells: &Schemas, _ctx: &BuildContext<'_>) -> Result<Topology> {
        let mut t = Topology::default();
        t.always([edge(("inner", "scaled"), ("double", "value"))]);
        Ok(t)
    }
}

/// Forwards a parameter of a cell it constructed itself.
struct Frozen;

impl BlackBox for Frozen {
    fn type_name(&self) -> &'static str {
        "Frozen"
    }

    fn declare_cells(&self, _p: &Params) -> Result<Vec<(String, CellInfo)>> {
        let mut params = ParamSet::default();
        Scale::declare_params(&mut params);
        Ok(vec![("fixed".to_string(), CellInfo::direct(Scale::with(params)?))])
    }

    fn declare_forwards(&self, _p: &Params) -> Forwards {
        Forwards::default().param("fixed", vec![Forward::key("factor")])
    }

    fn connections(&self, _p: &Params, _cells: &Schemas, _ctx: &BuildContext<'_>) -> Result<Topology> {
        Ok(Topology::default())
    }
}

/// Forwards from a cell it never declares.
struct Dangling;

impl BlackBox for Dangling {
    fn type_name(&self) -> &'static str {
        "Dangling"
    }

    fn declare_cells(&self, _p: &Params) -> Result<Vec<(String, CellInfo)>> {
        Ok(vec![("counter".to_string(), CellInfo::deferred("Counter"))])
    }

    fn declare_forwards(&self, _p: &Params) -> Forwards {
        Forwards::default().input("ghost", vec![Forward::key("image")])
    }

    fn connections(&self, _p: &Params, _cells: &Schemas, _ctx: &BuildContext<'_>) -> Result<Topology> {
        Ok(Topology::default())
    }
}

fn registry() -> CellRegistry {
    let mut r = CellRegistry::new();
    r.register_cell::<Counter>();
    r.register_cell::<Scale>();
    r.register_cell::<Explode>();
    r.register_cell::<Total>();
    r.register_composite::<Chain>();
    r
}

fn args(pairs: &[(&str, Value)]) -> Params {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn graph_error(err: anyhow::Error) -> GraphBuildError {
    match err.downcast_ref::<GraphBuildError>() {
        Some(e) => e.clone(),
        None => panic!("not a graph build error: {:#}", err),
    }
}

fn done(tick: Tick) -> PortValues {
    match tick {
        Tick::Done(values) => values,
        Tick::Quit => panic!("unexpected quit"),
    }
}

#[test]
fn parameter_surface_is_known_before_construction() {
    let registry = registry();
    let ctx = BuildContext::new(&registry);
    let params = Composite::declare_params(&Chain::default(), &Params::new(), &ctx).unwrap();
    let names: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["verbose", "limit", "factor", "with_offset"]);
    assert_eq!(params.get("factor").unwrap().value, Value::Integer(2));
}

#[test]
fn optional_edge_follows_the_built_schema() {
    let registry = registry();
    let ctx = BuildContext::new(&registry);

    let plain = Composite::build(&Chain::default(), &Params::new(), &ctx).unwrap();
    assert!(plain.graph().edges_in(Layer::Optional).is_empty());
    assert_eq!(plain.graph().len(), 2);

    let with_offset = args(&[("with_offset", Value::Flag(true))]);
    let mut gated = Composite::build(&Chain::default(), &with_offset, &ctx).unwrap();
    assert_eq!(gated.graph().edges_in(Layer::Optional).len(), 1);

    // count = 1: 1 * 2 + 1 * 10
    done(gated.tick(&PortValues::new()).unwrap());
    let out = done(gated.tick(&PortValues::new()).unwrap());
    assert_eq!(out.get("scaled"), Some(&Value::Integer(12)));
}

#[test]
fn forwarded_parameters_reach_the_cells() {
    let registry = registry();
    let ctx = BuildContext::new(&registry);
    let overrides = args(&[("factor", Value::Integer(5)), ("limit", Value::Integer(1))]);
    let mut c = Composite::build(&Chain::default(), &overrides, &ctx).unwrap();

    let out = done(c.tick(&PortValues::new()).unwrap());
    assert_eq!(out.get("scaled"), Some(&Value::Integer(0)));
    assert!(matches!(c.tick(&PortValues::new()).unwrap(), Tick::Quit));
    assert!(c.is_exhausted());
    assert!(c.tick(&PortValues::new()).is_err());
}

#[test]
fn unknown_override_is_rejected() {
    let registry = registry();
    let ctx = BuildContext::new(&registry);
    let err = Composite::build(&Chain::default(), &args(&[("factr", Value::Integer(5))]), &ctx)
        .err()
        .unwrap();
    assert_eq!(
        graph_error(err),
        GraphBuildError::UnknownParameter {
            name: "factr".to_string()
        }
    );
}

#[test]
fn dangling_forward_fails_the_build() {
    let registry = registry();
    let ctx = BuildContext::new(&registry);
    let err = Composite::build(&Dangling, &Params::new(), &ctx).err().unwrap();
    assert!(matches!(
        graph_error(err),
        GraphBuildError::DanglingForward { .. }
    ));
}

#[test]
fn helper_cells_cannot_be_forwarded() {
    let registry = registry();
    let ctx = BuildContext::new(&registry);
    let bb = Chain {
        explode: false,
        forward_helper: true,
    };
    let err = Composite::build(&bb, &Params::new(), &ctx).err().unwrap();
    assert!(matches!(
        graph_error(err),
        GraphBuildError::DanglingForward { .. }
    ));
}

#[test]
fn unknown_cell_type_fails_the_build() {
    let registry = CellRegistry::new();
    let ctx = BuildContext::new(&registry);
    let err = Composite::build(&Chain::default(), &Params::new(), &ctx).err().unwrap();
    assert!(matches!(
        graph_error(err),
        GraphBuildError::UnknownCellType { .. }
    ));
}

#[test]
fn parameters_of_direct_cells_are_frozen() {
    let registry = registry();
    let ctx = BuildContext::new(&registry);

    let c = Composite::build(&Frozen, &Params::new(), &ctx).unwrap();
    assert_eq!(
        c.schema().params.get("factor").unwrap().value,
        Value::Integer(2)
    );

    let err = Composite::build(&Frozen, &args(&[("factor", Value::Integer(3))]), &ctx)
        .err()
        .unwrap();
    assert!(matches!(
        graph_error(err),
        GraphBuildError::FrozenParameter { .. }
    ));
}

#[test]
fn sink_faults_do_not_abort_the_pass() {
    let registry = registry();
    let ctx = BuildContext::new(&registry);
    let bb = Chain {
        explode: true,
        forward_helper: false,
    };
    let mut c = Composite::build(&bb, &Params::new(), &ctx).unwrap();
    assert_eq!(c.graph().edges_in(Layer::Sink).len(), 1);
    assert!(c.cell_schema("boom").is_some());

    let out = done(c.tick(&PortValues::new()).unwrap());
    assert_eq!(out.get("scaled"), Some(&Value::Integer(0)));
}

#[test]
fn disabled_sink_cells_are_never_built() {
    let registry = registry();
    let ctx = BuildContext::new(&registry);
    let c = Composite::build(&Chain::default(), &Params::new(), &ctx).unwrap();
    assert!(c.cell_schema("boom").is_none());
    assert_eq!(c.order(), vec!["counter", "scale", "offset"]);
}

#[test]
fn finalize_runs_once_after_exhaustion() {
    let registry = registry();
    let ctx = BuildContext::new(&registry);
    let mut c = Composite::build(&Summing, &args(&[("limit", Value::Integer(2))]), &ctx).unwrap();
    let final_value = args(&[("final_value", Value::Integer(7))]);

    assert!(c.finalize(&final_value).is_err());

    let first = done(c.tick(&PortValues::new()).unwrap());
    assert_eq!(first.get("count"), Some(&Value::Integer(0)));
    assert!(first.get("total").is_none());
    done(c.tick(&PortValues::new()).unwrap());
    assert!(matches!(c.tick(&PortValues::new()).unwrap(), Tick::Quit));

    let out = c.finalize(&final_value).unwrap();
    assert_eq!(out.get("total"), Some(&Value::Integer(7)));
    assert!(out.get("count").is_none());
    assert!(c.finalize(&final_value).is_err());
}

#[test]
fn composites_nest_as_cells() {
    let registry = registry();
    let ctx = BuildContext::new(&registry);
    let mut c = Composite::build(&Outer, &args(&[("inner_factor", Value::Integer(3))]), &ctx)
        .unwrap();

    done(c.tick(&PortValues::new()).unwrap());
    // count = 1: inner 1 * 3, outer * 2
    let out = done(c.tick(&PortValues::new()).unwrap());
    assert_eq!(out.get("value"), Some(&Value::Integer(6)));
}

#[test]
fn connect_matching_pairs_equal_port_names() {
    let mut cells = Schemas::new();
    cells.insert(
        "source".to_string(),
        CellSchema::new("Source")
            .output("image", PortType::Image, "")
            .output("depth", PortType::DepthMap, "")
            .output("frame_number", PortType::Integer, ""),
    );
    cells.insert(
        "builder".to_string(),
        CellSchema::new("Builder")
            .input("image", PortType::Image, "")
            .input("depth", PortType::DepthMap, ""),
    );
    let got = connect_matching(&cells, "source", "builder").unwrap();
    assert_eq!(
        got,
        vec![
            edge(("source", "image"), ("builder", "image")),
            edge(("source", "depth"), ("builder", "depth")),
        ]
    );
    assert!(connect_matching(&cells, "source", "ghost").is_err());
}
