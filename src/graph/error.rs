//! Build-time failures. Every one of these is raised before the first tick.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphBuildError {
    UnknownCellType {
        cell: String,
        type_name: String,
    },
    DuplicateCell {
        cell: String,
    },
    InvalidName {
        name: String,
    },
    DanglingForward {
        kind: &'static str,
        cell: String,
        key: String,
    },
    ForwardCollision {
        kind: &'static str,
        name: String,
        detail: String,
    },
    UnknownParameter {
        name: String,
    },
    /// Override of a parameter whose cell was handed over already built.
    FrozenParameter {
        name: String,
        cell: String,
    },
    DanglingConnection {
        edge: String,
        reason: String,
    },
    DuplicateProducer {
        port: String,
        first: String,
        second: String,
    },
    TypeMismatch {
        edge: String,
        source: String,
        destination: String,
    },
    SinkFeedsPrimary {
        edge: String,
    },
    PhaseViolation {
        edge: String,
    },
    Cycle {
        path: Vec<String>,
    },
}

impl fmt::Display for GraphBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphBuildError::UnknownCellType { cell, type_name } => {
                write!(f, "cell {} has unknown type {}", cell, type_name)
            }
            GraphBuildError::DuplicateCell { cell } => write!(f, "cell {} declared twice", cell),
            GraphBuildError::InvalidName { name } => write!(f, "invalid name {:?}", name),
            GraphBuildError::DanglingForward { kind, cell, key } => {
                write!(f, "{} forward {}.{} does not resolve", kind, cell, key)
            }
            GraphBuildError::ForwardCollision { kind, name, detail } => {
                write!(f, "{} forward {} collides: {}", kind, name, detail)
            }
            GraphBuildError::UnknownParameter { name } => write!(f, "unknown parameter {}", name),
            GraphBuildError::FrozenParameter { name, cell } => write!(
                f,
                "parameter {} targets pre-built cell {} and cannot be overridden",
                name, cell
            ),
            GraphBuildError::DanglingConnection { edge, reason } => {
                write!(f, "connection {} is dangling: {}", edge, reason)
            }
            GraphBuildError::DuplicateProducer {
                port,
                first,
                second,
            } => write!(
                f,
                "input {} has two producers: {} and {}",
                port, first, second
            ),
            GraphBuildError::TypeMismatch {
                edge,
                source,
                destination,
            } => write!(
                f,
                "connection {} joins {} to incompatible {}",
                edge, source, destination
            ),
            GraphBuildError::SinkFeedsPrimary { edge } => write!(
                f,
                "sink connection {} feeds a cell of the primary pipeline",
                edge
            ),
            GraphBuildError::PhaseViolation { edge } => {
                write!(f, "connection {} crosses the frame/finalize boundary", edge)
            }
            GraphBuildError::Cycle { path } => {
                write!(f, "cycle detected: {}", path.join(" -> "))
            }
        }
    }
}

impl std::error::Error for GraphBuildError {}
