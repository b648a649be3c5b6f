//! Scheduling: a single topological order computed when the graph is built,
//! plus, per cell, where each of its inputs is read from during a pass.

use crate::Result;
use crate::graph::{GraphBuildError, ResolvedGraph};

use anyhow::{Context, bail};
use std::collections::BTreeMap;

/// Where an input port reads from during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// An output of another cell, produced earlier in the same pass.
    Edge { cell: usize, port: String },
    /// A composite-level input supplied by the caller for this pass.
    External(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feed {
    pub port: String,
    pub source: Source,
}

/// Composite input bound straight onto a cell input.
#[derive(Debug, Clone)]
pub struct Binding {
    pub cell: usize,
    pub port: String,
    pub external: String,
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    order: Vec<usize>,
    feeds: Vec<Vec<Feed>>,
}

impl Scheduler {
    /// `names[i]` is the name of cell `i`; edges and bindings refer to cells
    /// by those names and indices.
    pub fn new(names: &[String], graph: &ResolvedGraph, bindings: &[Binding]) -> Result<Self> {
        let index: BTreeMap<&str, usize> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();

        let mut feeds: Vec<Vec<Feed>> = vec![Vec::new(); names.len()];
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); names.len()];

        for r in &graph.edges {
            let (Some(&src), Some(&dst)) = (
                index.get(r.edge.from.cell.as_str()),
                index.get(r.edge.to.cell.as_str()),
            ) else {
                bail!(GraphBuildError::DanglingConnection {
                    edge: r.edge.to_string(),
                    reason: "cell missing from schedule".to_string(),
                });
            };
            children[src].push(dst);
            feeds[dst].push(Feed {
                port: r.edge.to.port.clone(),
                source: Source::Edge {
                    cell: src,
                    port: r.edge.from.port.clone(),
                },
            });
        }

        for b in bindings {
            if let Some(prev) = feeds[b.cell].iter().find(|f| f.port == b.port) {
                let first = match &prev.source {
                    Source::Edge { cell, port } => format!("{}[{}]", names[*cell], port),
                    Source::External(name) => format!("input {}", name),
                };
                bail!(GraphBuildError::DuplicateProducer {
                    port: format!("{}[{}]", names[b.cell], b.port),
                    first,
                    second: format!("input {}", b.external),
                });
            }
            feeds[b.cell].push(Feed {
                port: b.port.clone(),
                source: Source::External(b.external.clone()),
            });
        }

        let order = topological_order(names, &children)?;
        Ok(Self { order, feeds })
    }

    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn feeds(&self, cell: usize) -> &[Feed] {
        &self.feeds[cell]
    }
}

/// Depth-first topological sort with cycle detection.
///
/// Independent cells keep their declaration order.
pub fn topological_order(names: &[String], children: &[Vec<usize>]) -> Result<Vec<usize>> {
    #[derive(Copy, Clone, PartialEq, Eq)]
    enum Mark {
        Temp,
        Perm,
    }

    fn dfs(
        v: usize,
        names: &[String],
        children: &[Vec<usize>],
        marks: &mut [Option<Mark>],
        stack: &mut Vec<usize>,
        post: &mut Vec<usize>,
    ) -> Result<()> {
        match marks[v] {
            Some(Mark::Perm) => return Ok(()),
            Some(Mark::Temp) => {
                // v is on the current path => cycle
                let start = stack.iter().position(|&s| s == v).unwrap_or(0);
                let mut path: Vec<String> = stack[start..].iter().map(|&s| names[s].clone()).collect();
                path.push(names[v].clone());
                bail!(GraphBuildError::Cycle { path });
            }
            None => {}
        }

        marks[v] = Some(Mark::Temp);
        stack.push(v);

        let mut kids = children[v].clone();
        kids.sort_unstable();
        kids.dedup();
        for &k in kids.iter().rev() {
            dfs(k, names, children, marks, stack, post)?;
        }

        stack.pop();
        marks[v] = Some(Mark::Perm);
        post.push(v);
        Ok(())
    }

    let mut marks: Vec<Option<Mark>> = vec![None; names.len()];
    let mut stack = Vec::new();
    let mut post = Vec::with_capacity(names.len());
    for v in (0..names.len()).rev() {
        stack.clear();
        dfs(v, names, children, &mut marks, &mut stack, &mut post)
            .with_context(|| format!("cycle check failed starting at {}", names[v]))?;
    }

    post.reverse();
    Ok(post)
}
