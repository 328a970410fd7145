//! Topology graph model and construction-order planning
//!
//! This crate holds the pure half of the emulator: an undirected weighted
//! graph with per-edge cross-host tags, a line-based topology file parser,
//! and the five interleaving planners that decide in which order nodes are
//! instantiated so that as many links as possible become realizable after
//! each step.
//!
//! Nothing in here touches the kernel; realization lives in `netns-fabric`.

pub mod graph;
pub mod order;
pub mod parse;

pub use graph::{Edge, Graph};
pub use order::{Plan, Strategy};
pub use parse::read_graph_from_file;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("I/O error reading topology: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed topology at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("unknown planning strategy '{0}'")]
    UnknownStrategy(String),
}
