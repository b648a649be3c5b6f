//! Composites ("black boxes"): cells wired together behind a curated,
//! possibly renamed, surface of ports and parameters.
//!
//! Building a composite runs these steps in order:
//! 1) declare direct parameters and cells;
//! 2) resolve parameter forwards against declared parameter sets (no cell is
//!    constructed yet), which fixes the composite's parameter surface;
//! 3) construct the declared cells with their forwarded parameter values;
//! 4) resolve input/output forwards against the real schemas;
//! 5) let the composite add internal helper cells;
//! 6) resolve the topology and compute the schedule once.
//!
//! Any failure along the way is a build error; no pass has run yet.

pub mod registry;

pub use registry::{BuildContext, CellRegistry, CellType};

use crate::Result;
use crate::cell::{Cell, CellSchema, Flow, Inputs, Outputs, ParamSet, Params, PortValues, Value};
use crate::cell::schema::validate_name;
use crate::graph::forward::{self, Entry};
use crate::graph::{
    Binding, CellLookup, Edge, ForwardKind, Forwards, GraphBuildError, Phase, ResolvedForward,
    ResolvedGraph, Role, Scheduler, Source, Topology, edge,
};

use anyhow::{Context, anyhow, bail};
use log::{debug, info, warn};
use std::collections::BTreeMap;

/// Schemas of the cells built so far, keyed by cell name.
pub type Schemas = BTreeMap<String, CellSchema>;

enum CellKind {
    Deferred { type_name: String, args: Params },
    Direct(Box<dyn Cell>),
}

/// How a composite wants a cell created.
pub struct CellInfo {
    kind: CellKind,
    phase: Phase,
}

impl CellInfo {
    /// Created from the registry when the composite is built.
    pub fn deferred(type_name: &str) -> Self {
        Self {
            kind: CellKind::Deferred {
                type_name: type_name.to_string(),
                args: Params::new(),
            },
            phase: Phase::Frame,
        }
    }

    /// Already constructed; its parameters are fixed.
    pub fn direct(cell: impl Cell + 'static) -> Self {
        Self {
            kind: CellKind::Direct(Box::new(cell)),
            phase: Phase::Frame,
        }
    }

    /// Constructor argument of a deferred cell. Ignored for direct cells.
    pub fn arg(mut self, name: &str, value: impl Into<Value>) -> Self {
        if let CellKind::Deferred { args, .. } = &mut self.kind {
            args.insert(name.to_string(), value.into());
        }
        self
    }

    /// Run once after the source is exhausted instead of once per pass.
    pub fn finalize(mut self) -> Self {
        self.phase = Phase::Finalize;
        self
    }

    fn is_direct(&self) -> bool {
        matches!(self.kind, CellKind::Direct(_))
    }

    fn declared_params(&self, cell: &str, ctx: &BuildContext<'_>) -> Result<ParamSet> {
        match &self.kind {
            CellKind::Deferred { type_name, args } => {
                ctx.registry.declare_params(cell, type_name, args, ctx)
            }
            CellKind::Direct(c) => Ok(c.schema().params.clone()),
        }
    }
}

/// The hooks a concrete composite implements.
pub trait BlackBox {
    fn type_name(&self) -> &'static str;

    fn declare_direct_params(&self, _params: &mut ParamSet) {}

    fn declare_cells(&self, p: &Params) -> Result<Vec<(String, CellInfo)>>;

    fn declare_forwards(&self, p: &Params) -> Forwards;

    /// Helper cells that are never exposed through a forward.
    fn configure(&self, _p: &Params, _cells: &Schemas) -> Result<Vec<(String, CellInfo)>> {
        Ok(Vec::new())
    }

    fn connections(&self, p: &Params, cells: &Schemas, ctx: &BuildContext<'_>) -> Result<Topology>;
}

/// One edge per output of `src` whose name is also an input of `dst`.
pub fn connect_matching(cells: &Schemas, src: &str, dst: &str) -> Result<Vec<Edge>> {
    let schema = |name: &str| {
        cells.get(name).ok_or_else(|| {
            anyhow!(GraphBuildError::DanglingConnection {
                edge: format!("{} >> {}", src, dst),
                reason: format!("unknown cell {}", name),
            })
        })
    };
    let (from, to) = (schema(src)?, schema(dst)?);
    Ok(from
        .outputs
        .iter()
        .filter(|p| to.has_input(&p.name))
        .map(|p| edge((src, &p.name), (dst, &p.name)))
        .collect())
}

pub struct CellSlot {
    pub name: String,
    pub cell: Box<dyn Cell>,
    pub phase: Phase,
    pub role: Role,
}

#[derive(Default)]
struct CellArena {
    slots: Vec<CellSlot>,
    index: BTreeMap<String, usize>,
}

impl CellArena {
    fn add(
        &mut self,
        name: String,
        info: CellInfo,
        forwarded: Params,
        role: Role,
        ctx: &BuildContext<'_>,
    ) -> Result<()> {
        validate_name(&name)?;
        if self.index.contains_key(&name) {
            bail!(GraphBuildError::DuplicateCell { cell: name });
        }
        let cell = match info.kind {
            CellKind::Deferred {
                type_name,
                mut args,
            } => {
                args.extend(forwarded);
                ctx.registry.create(&name, &type_name, &args, ctx)?
            }
            CellKind::Direct(cell) => cell,
        };
        cell.schema().validate_names(&name)?;
        self.index.insert(name.clone(), self.slots.len());
        self.slots.push(CellSlot {
            name,
            cell,
            phase: info.phase,
            role,
        });
        Ok(())
    }

    fn get(&self, name: &str) -> Option<&CellSlot> {
        self.index.get(name).map(|&i| &self.slots[i])
    }

    fn schemas(&self) -> Schemas {
        self.slots
            .iter()
            .map(|s| (s.name.clone(), s.cell.schema().clone()))
            .collect()
    }

    /// Ports a declared cell offers for forwarding.
    fn forwardable(&self, cell: &str, kind: ForwardKind) -> Option<Vec<Entry>> {
        let slot = self.get(cell).filter(|s| s.role == Role::Declared)?;
        let schema = slot.cell.schema();
        let ports = match kind {
            ForwardKind::Output => &schema.outputs,
            _ => &schema.inputs,
        };
        Some(
            ports
                .iter()
                .map(|p| Entry {
                    name: p.name.clone(),
                    ty: p.ty,
                    doc: p.doc.clone(),
                })
                .collect(),
        )
    }
}

impl CellLookup for CellArena {
    fn schema(&self, cell: &str) -> Option<&CellSchema> {
        self.get(cell).map(|s| s.cell.schema())
    }

    fn is_sink(&self, cell: &str) -> bool {
        self.get(cell).is_some_and(|s| s.role == Role::Sink)
    }

    fn phase(&self, cell: &str) -> Option<Phase> {
        self.get(cell).map(|s| s.phase)
    }
}

/// Parameter surface plus what is needed to construct the declared cells.
struct Surface {
    params: ParamSet,
    infos: Vec<(String, CellInfo)>,
    forwards: Forwards,
    param_forwards: Vec<ResolvedForward>,
}

fn surface(bb: &dyn BlackBox, args: &Params, ctx: &BuildContext<'_>) -> Result<Surface> {
    let mut params = ParamSet::default();
    bb.declare_direct_params(&mut params);
    for (name, value) in args {
        if params.contains(name) {
            params.set(name, value.clone())?;
        }
    }

    let p = params.values();
    let infos = bb.declare_cells(&p)?;
    let forwards = bb.declare_forwards(&p);

    let mut declared: BTreeMap<String, ParamSet> = BTreeMap::new();
    for (name, info) in &infos {
        if declared.contains_key(name) {
            bail!(GraphBuildError::DuplicateCell { cell: name.clone() });
        }
        declared.insert(name.clone(), info.declared_params(name, ctx)?);
    }

    let param_forwards = forward::resolve(ForwardKind::Parameter, &forwards.params, |cell| {
        declared.get(cell).map(|ps| {
            ps.iter()
                .map(|p| Entry {
                    name: p.name.clone(),
                    ty: p.ty(),
                    doc: p.doc.clone(),
                })
                .collect()
        })
    })?;

    for f in forward::names(&param_forwards) {
        if params.contains(&f.name) {
            bail!(GraphBuildError::ForwardCollision {
                kind: ForwardKind::Parameter.as_str(),
                name: f.name.clone(),
                detail: "shadows a direct parameter".to_string(),
            });
        }
        let current = declared
            .get(&f.cell)
            .and_then(|ps| ps.get(&f.key))
            .map(|p| p.value.clone())
            .ok_or_else(|| anyhow!("forwarded parameter {} vanished", f.name))?;
        params.declare(&f.name, &f.doc, current);
    }

    for (name, value) in args {
        if !params.contains(name) {
            bail!(GraphBuildError::UnknownParameter { name: name.clone() });
        }
        let frozen = param_forwards.iter().find(|f| {
            &f.name == name
                && infos
                    .iter()
                    .any(|(cell, info)| cell == &f.cell && info.is_direct())
        });
        if let Some(f) = frozen {
            bail!(GraphBuildError::FrozenParameter {
                name: name.clone(),
                cell: f.cell.clone(),
            });
        }
        params.set(name, value.clone())?;
    }

    Ok(Surface {
        params,
        infos,
        forwards,
        param_forwards,
    })
}

/// Result of one frame pass.
#[derive(Debug)]
pub enum Tick {
    /// Values of the composite's outputs.
    Done(PortValues),
    /// A source ran dry; nothing was produced for this pass.
    Quit,
}

pub struct Composite {
    schema: CellSchema,
    arena: CellArena,
    inputs: Vec<ResolvedForward>,
    outputs: Vec<ResolvedForward>,
    param_forwards: Vec<ResolvedForward>,
    graph: ResolvedGraph,
    scheduler: Scheduler,
    exhausted: bool,
    finalized: bool,
}

impl Composite {
    /// The parameter surface `build` would expose, without building.
    pub fn declare_params(bb: &dyn BlackBox, args: &Params, ctx: &BuildContext<'_>) -> Result<ParamSet> {
        Ok(surface(bb, args, ctx)?.params)
    }

    pub fn build(bb: &dyn BlackBox, args: &Params, ctx: &BuildContext<'_>) -> Result<Composite> {
        let type_name = bb.type_name();
        let Surface {
            params,
            infos,
            forwards,
            param_forwards,
        } = surface(bb, args, ctx).with_context(|| format!("declare {}", type_name))?;
        let p = params.values();

        let mut arena = CellArena::default();
        for (name, info) in infos {
            let mut forwarded = Params::new();
            if !info.is_direct() {
                for f in param_forwards.iter().filter(|f| f.cell == name) {
                    if let Some(v) = p.get(&f.name) {
                        forwarded.insert(f.key.clone(), v.clone());
                    }
                }
            }
            arena.add(name, info, forwarded, Role::Declared, ctx)?;
        }

        let inputs = forward::resolve(ForwardKind::Input, &forwards.inputs, |c| {
            arena.forwardable(c, ForwardKind::Input)
        })?;
        let outputs = forward::resolve(ForwardKind::Output, &forwards.outputs, |c| {
            arena.forwardable(c, ForwardKind::Output)
        })?;

        for (name, info) in bb.configure(&p, &arena.schemas())? {
            arena.add(name, info, Params::new(), Role::Internal, ctx)?;
        }

        let Topology {
            always,
            optional,
            sinks,
        } = bb.connections(&p, &arena.schemas(), ctx)?;
        let mut enabled = Vec::new();
        for sink in sinks {
            if !sink.enabled {
                debug!("{}: sink graph {} disabled", type_name, sink.name);
                continue;
            }
            for (name, info) in sink.cells {
                arena.add(name, info, Params::new(), Role::Sink, ctx)?;
            }
            enabled.push((sink.name, sink.edges));
        }

        let graph = crate::graph::topology::resolve(&always, &optional, &enabled, &arena)
            .with_context(|| format!("resolve topology of {}", type_name))?;

        let mut bindings = Vec::new();
        for f in &inputs {
            let cell = arena
                .index
                .get(&f.cell)
                .copied()
                .ok_or_else(|| anyhow!("input forward to missing cell {}", f.cell))?;
            bindings.push(Binding {
                cell,
                port: f.key.clone(),
                external: f.name.clone(),
            });
        }
        let names: Vec<String> = arena.slots.iter().map(|s| s.name.clone()).collect();
        let scheduler = Scheduler::new(&names, &graph, &bindings)
            .with_context(|| format!("schedule {}", type_name))?;

        let mut schema = CellSchema::new(type_name).with_params(params);
        for f in forward::names(&inputs) {
            schema = schema.input(&f.name, f.ty, &f.doc);
        }
        for f in forward::names(&outputs) {
            schema = schema.output(&f.name, f.ty, &f.doc);
        }

        info!(
            "built {}: {} cells, {} edges",
            type_name,
            arena.slots.len(),
            graph.len()
        );

        Ok(Composite {
            schema,
            arena,
            inputs,
            outputs,
            param_forwards,
            graph,
            scheduler,
            exhausted: false,
            finalized: false,
        })
    }

    pub fn type_name(&self) -> &str {
        &self.schema.type_name
    }

    pub fn graph(&self) -> &ResolvedGraph {
        &self.graph
    }

    pub fn cells(&self) -> impl Iterator<Item = &CellSlot> {
        self.arena.slots.iter()
    }

    #[cfg(test)]
    pub fn cell_schema(&self, name: &str) -> Option<&CellSchema> {
        self.arena.get(name).map(|s| s.cell.schema())
    }

    /// Cell names in the order a pass ticks them.
    pub fn order(&self) -> Vec<&str> {
        self.scheduler
            .order()
            .iter()
            .map(|&i| self.arena.slots[i].name.as_str())
            .collect()
    }

    pub fn input_forwards(&self) -> &[ResolvedForward] {
        &self.inputs
    }

    pub fn output_forwards(&self) -> &[ResolvedForward] {
        &self.outputs
    }

    pub fn param_forwards(&self) -> &[ResolvedForward] {
        &self.param_forwards
    }

    #[cfg(test)]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Run every frame-phase cell once, in schedule order.
    pub fn tick(&mut self, inputs: &PortValues) -> Result<Tick> {
        if self.exhausted {
            bail!("{}: source already exhausted", self.type_name());
        }
        self.check_inputs(inputs)?;
        let external = Inputs::from_values(&self.schema.type_name, inputs);
        let outcome = run_pass(
            &mut self.arena,
            &self.scheduler,
            &self.outputs,
            Phase::Frame,
            &external,
        )?;
        Ok(match outcome {
            Some(values) => Tick::Done(values),
            None => {
                self.exhausted = true;
                Tick::Quit
            }
        })
    }

    /// Run every finalize-phase cell once. Only valid after exhaustion, and
    /// only once.
    pub fn finalize(&mut self, inputs: &PortValues) -> Result<PortValues> {
        if self.finalized {
            bail!("{}: already finalized", self.type_name());
        }
        let has_finalize = self.arena.slots.iter().any(|s| s.phase == Phase::Finalize);
        if has_finalize && !self.exhausted {
            bail!(
                "{}: cannot finalize before the source is exhausted",
                self.type_name()
            );
        }
        self.check_inputs(inputs)?;
        self.finalized = true;
        let external = Inputs::from_values(&self.schema.type_name, inputs);
        run_pass(
            &mut self.arena,
            &self.scheduler,
            &self.outputs,
            Phase::Finalize,
            &external,
        )?
        .ok_or_else(|| anyhow!("{}: a finalize cell asked to quit", self.schema.type_name))
    }

    fn check_inputs(&self, inputs: &PortValues) -> Result<()> {
        for name in inputs.keys() {
            if !self.schema.has_input(name) {
                bail!("{} has no input {}", self.type_name(), name);
            }
        }
        Ok(())
    }
}

/// One scheduler pass over the cells of `phase`.
///
/// Returns `None` if a source quit. On a cell fault the pass is dropped and
/// the error propagates; sink faults are logged and the pass goes on.
fn run_pass(
    arena: &mut CellArena,
    scheduler: &Scheduler,
    outputs: &[ResolvedForward],
    phase: Phase,
    external: &Inputs<'_>,
) -> Result<Option<PortValues>> {
    let mut pass: Vec<Option<PortValues>> = (0..arena.slots.len()).map(|_| None).collect();

    for &i in scheduler.order() {
        let slot = &mut arena.slots[i];
        if slot.phase != phase {
            continue;
        }

        let mut inputs = Inputs::new(&slot.name);
        for feed in scheduler.feeds(i) {
            let value = match &feed.source {
                Source::Edge { cell, port } => pass[*cell].as_ref().and_then(|v| v.get(port)),
                Source::External(name) => external.value(name),
            };
            if let Some(value) = value {
                inputs.insert(&feed.port, value);
            }
        }

        let mut produced = Outputs::default();
        let result = slot.cell.process(&inputs, &mut produced);
        drop(inputs);

        match result {
            Ok(Flow::Continue) => pass[i] = Some(produced.into_values()),
            Ok(Flow::Quit) => {
                debug!("{} quit, dropping pass", slot.name);
                return Ok(None);
            }
            Err(err) if slot.role == Role::Sink => {
                warn!("sink {} failed: {:#}", slot.name, err);
            }
            Err(err) => {
                return Err(err.context(format!(
                    "cell {} ({}) failed",
                    slot.name,
                    slot.cell.schema().type_name
                )));
            }
        }
    }

    let mut out = PortValues::new();
    for f in outputs {
        let Some(&i) = arena.index.get(&f.cell) else {
            continue;
        };
        if arena.slots[i].phase != phase {
            continue;
        }
        if let Some(v) = pass[i].as_ref().and_then(|v| v.get(&f.key)) {
            out.insert(f.name.clone(), v.clone());
        }
    }
    Ok(Some(out))
}

impl Cell for Composite {
    fn schema(&self) -> &CellSchema {
        &self.schema
    }

    fn process(&mut self, inputs: &Inputs<'_>, outputs: &mut Outputs) -> Result<Flow> {
        match run_pass(
            &mut self.arena,
            &self.scheduler,
            &self.outputs,
            Phase::Frame,
            inputs,
        )? {
            Some(values) => {
                for (name, value) in values {
                    outputs.set(&name, value);
                }
                Ok(Flow::Continue)
            }
            None => {
                self.exhausted = true;
                Ok(Flow::Quit)
            }
        }
    }
}

#[cfg(test)]
mod tests;
