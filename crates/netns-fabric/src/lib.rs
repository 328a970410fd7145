//! Topology realization over Linux network namespaces
//!
//! This crate materializes a planned topology on one physical host: one
//! containerized network namespace per virtual node, links realized as
//! bridge + veth pairs inside sharded "backbone" namespaces, and
//! cross-host links carried over VXLAN tunnels. The `engine` module
//! drives a `NodeManager`/`LinkManager` pair through the plan emitted by
//! the `topology` crate, serially or through a bounded worker pool.
//!
//! Namespace context is a per-thread kernel property; everything in here
//! is written to run on threads that do not migrate (current-thread tokio
//! runtimes and dedicated pool workers).

pub mod config;
pub mod engine;
pub mod env;
pub mod link;
pub mod netns;
pub mod node;
pub mod worker;

// Re-export the managers and the engine entry points
pub use config::EngineContext;
pub use engine::{network_clean, network_setup};
pub use link::{LinkManager, NtlBrLinkManager};
pub use node::{CctrNodeManager, NodeManager};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FabricError {
    #[error("Network namespace error: {0}")]
    Netns(#[from] netns::NetnsError),

    #[error("Node manager error: {0}")]
    Node(#[from] node::NodeError),

    #[error("Link manager error: {0}")]
    Link(#[from] link::LinkError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Environment control error: {0}")]
    Env(#[from] env::EnvError),

    #[error("Worker pool error: {0}")]
    Worker(#[from] worker::WorkerError),

    #[error("Topology error: {0}")]
    Topology(#[from] topology::TopologyError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
