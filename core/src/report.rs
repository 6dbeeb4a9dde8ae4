//! A Report is everything one collection cycle knows about the network: one
//! Topology per monitored domain. Reports from many probes and many hosts
//! merge pairwise into the single global report the renderers consume.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::topology::Topology;

/// The full set of topologies produced by one collection cycle, or by
/// merging many cycles from many hosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// When the observations were collected, probe-local and best-effort.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,

    #[serde(default, skip_serializing_if = "topology_is_empty")]
    pub endpoint: Topology,
    #[serde(default, skip_serializing_if = "topology_is_empty")]
    pub address: Topology,
    #[serde(default, skip_serializing_if = "topology_is_empty")]
    pub process: Topology,
    #[serde(default, skip_serializing_if = "topology_is_empty")]
    pub container: Topology,
    #[serde(default, skip_serializing_if = "topology_is_empty")]
    pub host: Topology,
}

fn topology_is_empty(t: &Topology) -> bool {
    t.adjacency.is_empty() && t.edge_metadatas.is_empty() && t.node_metadatas.is_empty()
}

impl Report {
    /// An empty report stamped with the current time.
    pub fn new() -> Self {
        Self::at(OffsetDateTime::now_utc())
    }

    /// An empty report with an explicit collection timestamp.
    pub fn at(timestamp: OffsetDateTime) -> Self {
        Report {
            timestamp,
            endpoint: Topology::new(),
            address: Topology::new(),
            process: Topology::new(),
            container: Topology::new(),
            host: Topology::new(),
        }
    }

    /// Merge same-domain topologies pairwise; a topology populated on only
    /// one side passes through unchanged. The merged report carries the
    /// newer of the two collection timestamps.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Report {
            timestamp: self.timestamp.max(other.timestamp),
            endpoint: self.endpoint.merge(other.endpoint),
            address: self.address.merge(other.address),
            process: self.process.merge(other.process),
            container: self.container.merge(other.container),
            host: self.host.merge(other.host),
        }
    }
}

impl Default for Report {
    fn default() -> Self {
        Self::new()
    }
}

/// Fold many reports into one. Inputs are merged in increasing collection
/// timestamp order so the most recent reporter wins node-metadata conflicts;
/// graph structure is order-independent either way.
pub fn merge_all(mut reports: Vec<Report>) -> Report {
    reports.sort_by_key(|r| r.timestamp);
    reports
        .into_iter()
        .reduce(Report::merge)
        .unwrap_or_default()
}

/// Picks the input topology for a Map renderer.
pub type Selector = fn(&Report) -> &Topology;

pub fn select_endpoint(r: &Report) -> &Topology {
    &r.endpoint
}

pub fn select_address(r: &Report) -> &Topology {
    &r.address
}

pub fn select_process(r: &Report) -> &Topology {
    &r.process
}

pub fn select_container(r: &Report) -> &Topology {
    &r.container
}

pub fn select_host(r: &Report) -> &Topology {
    &r.host
}
