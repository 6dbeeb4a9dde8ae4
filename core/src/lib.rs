//! Core report data model for the meshmap engine: node/edge identity
//! encoding, per-domain topologies, the merge algebra, and validation.

pub mod id;
pub mod report;
pub mod topology;

pub use report::{merge_all, Report};
pub use topology::{
    AdjacencyMetadata, AggregateMetadata, EdgeMetadata, NodeMetadata, Topology,
};

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
