//! Cell registry: type name -> (parameter declaration, constructor).
//!
//! Deferred cells are looked up here when their composite is built. The
//! parameter declaration is available without constructing anything, which
//! is what lets a composite resolve its parameter forwards first.

use crate::Result;
use crate::cell::{Cell, ParamSet, Params};
use crate::composite::{BlackBox, Composite};
use crate::graph::GraphBuildError;
use crate::transport::Transport;

use anyhow::{Context, bail};
use std::collections::BTreeMap;

pub type DeclareFn = fn(&Params, &BuildContext<'_>) -> Result<ParamSet>;
pub type CreateFn = fn(&Params, &BuildContext<'_>) -> Result<Box<dyn Cell>>;

#[derive(Clone, Copy)]
pub struct CellFactory {
    pub declare: DeclareFn,
    pub create: CreateFn,
}

/// An atomic cell constructible from bound parameters.
pub trait CellType: Cell + Sized + 'static {
    const TYPE_NAME: &'static str;

    fn declare_params(params: &mut ParamSet);

    fn new(params: ParamSet, ctx: &BuildContext<'_>) -> Result<Self>;
}

fn declare_cell<T: CellType>(args: &Params, _ctx: &BuildContext<'_>) -> Result<ParamSet> {
    let mut params = ParamSet::default();
    T::declare_params(&mut params);
    params.bind(args)
}

fn create_cell<T: CellType>(args: &Params, ctx: &BuildContext<'_>) -> Result<Box<dyn Cell>> {
    let params = declare_cell::<T>(args, ctx)?;
    Ok(Box::new(T::new(params, ctx)?))
}

fn declare_composite<B: BlackBox + Default>(args: &Params, ctx: &BuildContext<'_>) -> Result<ParamSet> {
    Composite::declare_params(&B::default(), args, ctx)
}

fn create_composite<B: BlackBox + Default>(
    args: &Params,
    ctx: &BuildContext<'_>,
) -> Result<Box<dyn Cell>> {
    Ok(Box::new(Composite::build(&B::default(), args, ctx)?))
}

#[derive(Default)]
pub struct CellRegistry {
    factories: BTreeMap<&'static str, CellFactory>,
}

impl CellRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every cell and composite this crate ships.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        crate::cells::register(&mut registry);
        crate::pipelines::register(&mut registry);
        registry
    }

    pub fn register(&mut self, type_name: &'static str, factory: CellFactory) {
        self.factories.insert(type_name, factory);
    }

    pub fn register_cell<T: CellType>(&mut self) {
        self.register(
            T::TYPE_NAME,
            CellFactory {
                declare: declare_cell::<T>,
                create: create_cell::<T>,
            },
        );
    }

    pub fn register_composite<B: BlackBox + Default>(&mut self) {
        self.register(
            B::default().type_name(),
            CellFactory {
                declare: declare_composite::<B>,
                create: create_composite::<B>,
            },
        );
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    fn factory(&self, cell: &str, type_name: &str) -> Result<CellFactory> {
        match self.factories.get(type_name) {
            Some(f) => Ok(*f),
            None => bail!(GraphBuildError::UnknownCellType {
                cell: cell.to_string(),
                type_name: type_name.to_string(),
            }),
        }
    }

    pub fn declare_params(
        &self,
        cell: &str,
        type_name: &str,
        args: &Params,
        ctx: &BuildContext<'_>,
    ) -> Result<ParamSet> {
        let factory = self.factory(cell, type_name)?;
        (factory.declare)(args, ctx)
            .with_context(|| format!("declare parameters of {} ({})", cell, type_name))
    }

    pub fn create(
        &self,
        cell: &str,
        type_name: &str,
        args: &Params,
        ctx: &BuildContext<'_>,
    ) -> Result<Box<dyn Cell>> {
        let factory = self.factory(cell, type_name)?;
        (factory.create)(args, ctx).with_context(|| format!("construct {} ({})", cell, type_name))
    }
}

/// Everything graph construction may consult besides the composite's own
/// parameters. Optional collaborators are probed before this is created and
/// never re-probed.
pub struct BuildContext<'r> {
    pub registry: &'r CellRegistry,
    pub transport: Option<Transport>,
}

impl<'r> BuildContext<'r> {
    pub fn new(registry: &'r CellRegistry) -> Self {
        Self {
            registry,
            transport: None,
        }
    }

    pub fn with_transport(mut self, transport: Option<Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn transport_available(&self) -> bool {
        self.transport.is_some()
    }
}
