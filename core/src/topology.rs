//! One typed view of the network graph: adjacency lists, per-node metadata,
//! and per-edge metadata, with the merge algebra that lets uncoordinated
//! probes be combined in any order.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::id;

/// Ordered set of node IDs. Iteration order is deterministic but carries no
/// meaning.
pub type IdList = BTreeSet<String>;

/// Destinations one source node has been observed connecting to, with the
/// earliest time each connection was first seen by the reporting probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjacencyMetadata {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub ids: IdList,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub first_seen: BTreeMap<String, OffsetDateTime>,
}

impl AdjacencyMetadata {
    /// The only way to grow an adjacency list. Re-adding a destination leaves
    /// its first-seen time untouched; a new destination records the given one.
    #[must_use]
    pub fn add(mut self, id: &str, first_seen: OffsetDateTime) -> Self {
        self.ids.insert(id.to_string());
        self.first_seen.entry(id.to_string()).or_insert(first_seen);
        self
    }

    /// Set-union of destinations; per destination the earliest observation
    /// wins regardless of merge order.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        self.ids.extend(other.ids);
        for (id, ts) in other.first_seen {
            self.first_seen
                .entry(id)
                .and_modify(|t| {
                    if ts < *t {
                        *t = ts;
                    }
                })
                .or_insert(ts);
        }
        self
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// Facts a probe can usefully collect about one directed edge. Each `with_*`
/// flag distinguishes "not measured" from "measured as zero"; that pairing
/// is preserved verbatim in serialized form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeMetadata {
    #[serde(default, skip_serializing_if = "is_false")]
    pub with_bytes: bool,
    /// dst -> src
    #[serde(default, skip_serializing_if = "is_zero")]
    pub bytes_ingress: u64,
    /// src -> dst
    #[serde(default, skip_serializing_if = "is_zero")]
    pub bytes_egress: u64,

    #[serde(default, skip_serializing_if = "is_false")]
    pub with_conn_count_tcp: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_conn_count_tcp: u64,
}

impl EdgeMetadata {
    /// Field-wise merge: flags OR, byte counters sum, the connection-count
    /// gauge takes the max (it is a point-in-time reading, not a counter).
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        self.with_bytes |= other.with_bytes;
        self.bytes_ingress += other.bytes_ingress;
        self.bytes_egress += other.bytes_egress;
        self.with_conn_count_tcp |= other.with_conn_count_tcp;
        self.max_conn_count_tcp = self.max_conn_count_tcp.max(other.max_conn_count_tcp);
        self
    }

    /// Project into the renderable aggregate, dropping unmeasured fields.
    pub fn aggregate(&self) -> AggregateMetadata {
        AggregateMetadata {
            egress_bytes: self.with_bytes.then_some(self.bytes_egress),
            ingress_bytes: self.with_bytes.then_some(self.bytes_ingress),
            max_conn_count_tcp: self
                .with_conn_count_tcp
                .then_some(self.max_conn_count_tcp),
        }
    }
}

/// Combined edge facts for a rendered node pair. `None` means no probe
/// measured the field, as opposed to a measured zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_conn_count_tcp: Option<u64>,
}

impl AggregateMetadata {
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        fn sum(a: Option<u64>, b: Option<u64>) -> Option<u64> {
            match (a, b) {
                (None, None) => None,
                _ => Some(a.unwrap_or(0) + b.unwrap_or(0)),
            }
        }
        Self {
            egress_bytes: sum(self.egress_bytes, other.egress_bytes),
            ingress_bytes: sum(self.ingress_bytes, other.ingress_bytes),
            max_conn_count_tcp: match (self.max_conn_count_tcp, other.max_conn_count_tcp) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or(0).max(b.unwrap_or(0))),
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.egress_bytes.is_none()
            && self.ingress_bytes.is_none()
            && self.max_conn_count_tcp.is_none()
    }
}

/// What a probe knows about one node. The well-known fields are typed;
/// probe-specific extensions (container IDs, host facts, ...) go in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl NodeMetadata {
    /// Field-wise merge, the other (right-hand) side wins where both are
    /// set. Callers that care about conflicts must order their merges; see
    /// `report::merge_all`.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        if other.name.is_some() {
            self.name = other.name;
        }
        if other.addr.is_some() {
            self.addr = other.addr;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.pid.is_some() {
            self.pid = other.pid;
        }
        self.extra.extend(other.extra);
        self
    }
}

/// A specific view of the network: nodes and edges via `adjacency`, and
/// metadata about them via `edge_metadatas` and `node_metadatas`. Keys are
/// the encoded IDs from [`crate::id`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub adjacency: BTreeMap<String, AdjacencyMetadata>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub edge_metadatas: BTreeMap<String, EdgeMetadata>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_metadatas: BTreeMap<String, NodeMetadata>,
}

/// A single referential-integrity violation found by [`Topology::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid edge ID {0:?}")]
    InvalidEdgeId(String),
    #[error("node metadata missing for source node {node:?} (from edge {edge:?})")]
    EdgeSourceMetadataMissing { node: String, edge: String },
    #[error("adjacency entries missing for source node {node:?} (from edge {edge:?})")]
    EdgeSourceAdjacencyMissing { node: String, edge: String },
    #[error("adjacency destination missing for node {node:?} (from edge {edge:?})")]
    EdgeDestinationMissing { node: String, edge: String },
    #[error("invalid adjacency ID {0:?}")]
    InvalidAdjacencyId(String),
    #[error("node metadata missing for source node {node:?} (from adjacency {adjacency:?})")]
    AdjacencySourceMetadataMissing { node: String, adjacency: String },
    #[error("invalid node ID {0:?}")]
    InvalidNodeId(String),
}

/// Every violation found in one validation pass, batched so a single run
/// surfaces the full problem set.
#[derive(Debug)]
pub struct InvalidTopology {
    pub errors: Vec<ValidationError>,
}

impl std::fmt::Display for InvalidTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msgs: Vec<String> = self.errors.iter().map(ToString::to_string).collect();
        write!(f, "{}", msgs.join("; "))
    }
}

impl std::error::Error for InvalidTopology {}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associative, commutative union of two topologies. Node metadata is
    /// the one order-sensitive part: the right-hand side wins on conflict.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        for (key, adj) in other.adjacency {
            let merged = match self.adjacency.remove(&key) {
                Some(existing) => existing.merge(adj),
                None => adj,
            };
            self.adjacency.insert(key, merged);
        }
        for (key, md) in other.edge_metadatas {
            let merged = match self.edge_metadatas.get(&key) {
                Some(existing) => existing.merge(md),
                None => md,
            };
            self.edge_metadatas.insert(key, merged);
        }
        for (key, nm) in other.node_metadatas {
            let merged = match self.node_metadatas.remove(&key) {
                Some(existing) => existing.merge(nm),
                None => nm,
            };
            self.node_metadatas.insert(key, merged);
        }
        self
    }

    /// Check the topology for referential inconsistencies, collecting every
    /// violation rather than failing fast. Advisory: merge and render never
    /// require a valid topology, they skip what they cannot resolve.
    pub fn validate(&self) -> Result<(), InvalidTopology> {
        let mut errors = Vec::new();

        // Every edge key must resolve to a known source node whose adjacency
        // list contains the destination.
        for edge_id in self.edge_metadatas.keys() {
            let Some((src, dst)) = id::parse_edge_id(edge_id) else {
                errors.push(ValidationError::InvalidEdgeId(edge_id.clone()));
                continue;
            };
            if !self.node_metadatas.contains_key(&src) {
                errors.push(ValidationError::EdgeSourceMetadataMissing {
                    node: src,
                    edge: edge_id.clone(),
                });
                continue;
            }
            let Some(adj) = self.adjacency.get(&id::make_adjacency_id(&src)) else {
                errors.push(ValidationError::EdgeSourceAdjacencyMissing {
                    node: src,
                    edge: edge_id.clone(),
                });
                continue;
            };
            if !adj.ids.contains(&dst) {
                errors.push(ValidationError::EdgeDestinationMissing {
                    node: dst,
                    edge: edge_id.clone(),
                });
            }
        }

        // Every adjacency key must resolve to a node with metadata.
        for adjacency_id in self.adjacency.keys() {
            let Some(node_id) = id::parse_adjacency_id(adjacency_id) else {
                errors.push(ValidationError::InvalidAdjacencyId(adjacency_id.clone()));
                continue;
            };
            if !self.node_metadatas.contains_key(&node_id) {
                errors.push(ValidationError::AdjacencySourceMetadataMissing {
                    node: node_id,
                    adjacency: adjacency_id.clone(),
                });
            }
        }

        // Every node ID must carry a recoverable scope.
        for node_id in self.node_metadatas.keys() {
            if id::parse_node_id(node_id).is_none() {
                errors.push(ValidationError::InvalidNodeId(node_id.clone()));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(InvalidTopology { errors })
        }
    }
}
