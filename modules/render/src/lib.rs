//! Pure transforms from a merged report to view-specific node sets.
//! Renderers compose: Map classifies and re-keys one topology, Reduce unions
//! several renderers, Filter prunes with adjacency repair.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use meshmap_core::id;
use meshmap_core::report::{Report, Selector};
use meshmap_core::topology::{AggregateMetadata, IdList, NodeMetadata};

pub mod mapping;

/// Rendered output, keyed by mapped node ID.
pub type RenderableNodes = BTreeMap<String, RenderableNode>;

/// One node of a rendered view: display labels plus the adjacency and
/// aggregated edge facts accumulated from every raw node mapped onto it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderableNode {
    pub id: String,
    pub label_major: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label_minor: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rank: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pseudo: bool,
    #[serde(default, skip_serializing_if = "IdList::is_empty")]
    pub adjacency: IdList,
    #[serde(default, skip_serializing_if = "IdList::is_empty")]
    pub origin_hosts: IdList,
    #[serde(default, skip_serializing_if = "AggregateMetadata::is_empty")]
    pub metadata: AggregateMetadata,
}

impl RenderableNode {
    pub fn new(
        id: impl Into<String>,
        label_major: impl Into<String>,
        label_minor: impl Into<String>,
        rank: impl Into<String>,
    ) -> Self {
        RenderableNode {
            id: id.into(),
            label_major: label_major.into(),
            label_minor: label_minor.into(),
            rank: rank.into(),
            ..Default::default()
        }
    }

    pub fn new_pseudo(
        id: impl Into<String>,
        label_major: impl Into<String>,
        label_minor: impl Into<String>,
    ) -> Self {
        RenderableNode {
            pseudo: true,
            ..Self::new(id, label_major, label_minor, "")
        }
    }

    /// Combine two contributions to the same mapped ID: labels keep the
    /// first non-empty value, sets union, aggregates merge.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        if self.label_major.is_empty() {
            self.label_major = other.label_major;
        }
        if self.label_minor.is_empty() {
            self.label_minor = other.label_minor;
        }
        if self.rank.is_empty() {
            self.rank = other.rank;
        }
        self.adjacency.extend(other.adjacency);
        self.origin_hosts.extend(other.origin_hosts);
        self.metadata = self.metadata.merge(other.metadata);
        self
    }
}

/// Classifies one raw node into zero-or-one rendered node. `None` drops the
/// node from the view.
pub type MapFunc = fn(&str, &NodeMetadata) -> Option<RenderableNode>;

/// Synthesizes a placeholder for an edge destination the view cannot
/// classify. Arguments: source node ID, source's mapped ID, destination node
/// ID. `None` drops the edge too.
pub type PseudoFunc = fn(&str, &str, &str) -> Option<RenderableNode>;

/// A pure transform from a report to a rendered node set for one view.
pub trait Renderer {
    fn render(&self, rpt: &Report) -> RenderableNodes;

    /// Combined edge facts for one rendered (local, remote) pair.
    fn aggregate_metadata(
        &self,
        rpt: &Report,
        local_id: &str,
        remote_id: &str,
    ) -> AggregateMetadata;
}

/// Per-node re-keying of one selected topology, with pseudo-node synthesis
/// so no observed edge is silently dropped.
pub struct Map {
    pub selector: Selector,
    pub map: MapFunc,
    pub pseudo: PseudoFunc,
}

impl Map {
    /// Shared by `render` and `aggregate_metadata`: rendered nodes plus the
    /// raw-node-ID to mapped-ID table.
    fn render_with_table(&self, rpt: &Report) -> (RenderableNodes, BTreeMap<String, String>) {
        let t = (self.selector)(rpt);
        let mut nodes = RenderableNodes::new();
        let mut mapped = BTreeMap::new();

        for (node_id, meta) in &t.node_metadatas {
            let Some(mut rn) = (self.map)(node_id, meta) else {
                continue;
            };
            if let Some((scope, _)) = id::parse_node_id(node_id) {
                rn.origin_hosts.insert(scope);
            }
            let rid = rn.id.clone();
            let rn = match nodes.remove(&rid) {
                Some(existing) => existing.merge(rn),
                None => rn,
            };
            nodes.insert(rid.clone(), rn);
            mapped.insert(node_id.clone(), rid);
        }

        for (adjacency_id, adj) in &t.adjacency {
            let Some(src_node_id) = id::parse_adjacency_id(adjacency_id) else {
                continue; // tolerated, validation reports it separately
            };
            let Some(src_rid) = mapped.get(&src_node_id).cloned() else {
                continue; // source was dropped by the map function
            };
            for dst_node_id in &adj.ids {
                let dst_rid = match mapped.get(dst_node_id) {
                    Some(rid) => rid.clone(),
                    None => {
                        let Some(pseudo) = (self.pseudo)(&src_node_id, &src_rid, dst_node_id)
                        else {
                            continue;
                        };
                        let rid = pseudo.id.clone();
                        let merged = match nodes.remove(&rid) {
                            Some(existing) => existing.merge(pseudo),
                            None => pseudo,
                        };
                        nodes.insert(rid.clone(), merged);
                        mapped.insert(dst_node_id.clone(), rid.clone());
                        rid
                    }
                };
                let edge_id = id::make_edge_id(&src_node_id, dst_node_id);
                let agg = t
                    .edge_metadatas
                    .get(&edge_id)
                    .map(|e| e.aggregate())
                    .unwrap_or_default();
                if let Some(src_node) = nodes.get_mut(&src_rid) {
                    src_node.adjacency.insert(dst_rid);
                    src_node.metadata = src_node.metadata.merge(agg);
                }
            }
        }

        (nodes, mapped)
    }
}

impl Renderer for Map {
    fn render(&self, rpt: &Report) -> RenderableNodes {
        self.render_with_table(rpt).0
    }

    fn aggregate_metadata(
        &self,
        rpt: &Report,
        local_id: &str,
        remote_id: &str,
    ) -> AggregateMetadata {
        let t = (self.selector)(rpt);
        let (_, mapped) = self.render_with_table(rpt);
        let mut out = AggregateMetadata::default();
        for (edge_id, md) in &t.edge_metadatas {
            let Some((src, dst)) = id::parse_edge_id(edge_id) else {
                continue;
            };
            if mapped.get(&src).map(String::as_str) == Some(local_id)
                && mapped.get(&dst).map(String::as_str) == Some(remote_id)
            {
                out = out.merge(md.aggregate());
            }
        }
        out
    }
}

/// Union of several renderers' outputs, merging node-for-node on key
/// collision.
pub struct Reduce(pub Vec<Box<dyn Renderer>>);

impl Renderer for Reduce {
    fn render(&self, rpt: &Report) -> RenderableNodes {
        let mut out = RenderableNodes::new();
        for renderer in &self.0 {
            for (rid, node) in renderer.render(rpt) {
                let merged = match out.remove(&rid) {
                    Some(existing) => existing.merge(node),
                    None => node,
                };
                out.insert(rid, merged);
            }
        }
        out
    }

    /// First non-empty answer wins; children are expected to cover disjoint
    /// ID spaces.
    fn aggregate_metadata(
        &self,
        rpt: &Report,
        local_id: &str,
        remote_id: &str,
    ) -> AggregateMetadata {
        for renderer in &self.0 {
            let agg = renderer.aggregate_metadata(rpt, local_id, remote_id);
            if !agg.is_empty() {
                return agg;
            }
        }
        AggregateMetadata::default()
    }
}

/// Decorator that drops nodes failing a predicate, then repairs the
/// adjacency of the survivors. Prune must run before repair or just-deleted
/// nodes would still be referenced.
pub struct Filter {
    inner: Box<dyn Renderer>,
    predicate: Box<dyn Fn(&RenderableNode) -> bool + Send + Sync>,
}

impl Filter {
    pub fn new(
        inner: Box<dyn Renderer>,
        predicate: impl Fn(&RenderableNode) -> bool + Send + Sync + 'static,
    ) -> Self {
        Filter {
            inner,
            predicate: Box::new(predicate),
        }
    }
}

impl Renderer for Filter {
    fn render(&self, rpt: &Report) -> RenderableNodes {
        let mut output = self.inner.render(rpt);
        output.retain(|_, node| (self.predicate)(node));
        let keep: Vec<String> = output.keys().cloned().collect();
        for node in output.values_mut() {
            node.adjacency.retain(|dst| keep.binary_search(dst).is_ok());
        }
        output
    }

    /// Pass-through: aggregates are keyed by ID pairs, not by current
    /// node-set membership, so the wrapped answer stays authoritative.
    fn aggregate_metadata(
        &self,
        rpt: &Report,
        local_id: &str,
        remote_id: &str,
    ) -> AggregateMetadata {
        self.inner.aggregate_metadata(rpt, local_id, remote_id)
    }
}

#[cfg(test)]
mod tests {
    use super::mapping::{generic_pseudo_node, internet_only_pseudo_node, process_pid};
    use super::*;
    use meshmap_core::id::{make_adjacency_id, make_edge_id, make_endpoint_node_id};
    use meshmap_core::report::select_endpoint;
    use meshmap_core::topology::{AdjacencyMetadata, EdgeMetadata};
    use time::macros::datetime;

    /// One observed connection in the endpoint topology: local side has
    /// metadata (and a pid), the remote side is only an adjacency target.
    fn endpoint_report(conns: &[(&str, &str, &str, &str, &str, &str)]) -> Report {
        let mut rpt = Report::at(datetime!(2015-03-01 12:00 UTC));
        for &(host, laddr, lport, raddr, rport, pid) in conns {
            let src = make_endpoint_node_id(host, laddr, lport);
            let dst = make_endpoint_node_id(host, raddr, rport);
            let adj = rpt
                .endpoint
                .adjacency
                .remove(&make_adjacency_id(&src))
                .unwrap_or_default();
            rpt.endpoint.adjacency.insert(
                make_adjacency_id(&src),
                adj.add(&dst, rpt.timestamp),
            );
            let edge = make_edge_id(&src, &dst);
            let md = rpt
                .endpoint
                .edge_metadatas
                .get(&edge)
                .copied()
                .unwrap_or_default();
            rpt.endpoint.edge_metadatas.insert(
                edge,
                EdgeMetadata {
                    with_conn_count_tcp: true,
                    max_conn_count_tcp: md.max_conn_count_tcp + 1,
                    ..md
                },
            );
            rpt.endpoint.node_metadatas.entry(src).or_insert(NodeMetadata {
                addr: Some(laddr.to_string()),
                port: Some(lport.to_string()),
                pid: Some(pid.to_string()),
                ..Default::default()
            });
        }
        rpt
    }

    fn applications() -> Map {
        Map {
            selector: select_endpoint,
            map: process_pid,
            pseudo: generic_pseudo_node,
        }
    }

    #[test]
    fn map_conserves_every_edge() {
        let rpt = endpoint_report(&[
            ("host1", "10.0.0.1", "80", "10.0.0.2", "9000", "42"),
            ("host1", "10.0.0.1", "81", "192.0.2.7", "443", "42"),
        ]);
        let nodes = applications().render(&rpt);

        // Both raw sources map to the same pid node; both remotes are
        // unclassifiable here, so each edge lands on a pseudo node.
        let pid_node = &nodes["pid:host1:42"];
        assert_eq!(pid_node.adjacency.len(), 2);
        let input_edges: usize = rpt.endpoint.adjacency.values().map(|a| a.ids.len()).sum();
        let output_edges: usize = nodes.values().map(|n| n.adjacency.len()).sum();
        assert_eq!(input_edges, output_edges);
        for dst in &pid_node.adjacency {
            assert!(nodes.contains_key(dst), "dangling adjacency to {dst}");
            assert!(nodes[dst].pseudo);
        }
    }

    #[test]
    fn map_merges_contributions_to_one_mapped_node() {
        let rpt = endpoint_report(&[
            ("host1", "10.0.0.1", "80", "10.0.0.2", "9000", "42"),
            ("host1", "10.0.0.1", "81", "10.0.0.2", "9001", "42"),
        ]);
        let nodes = applications().render(&rpt);
        let pid_node = &nodes["pid:host1:42"];
        assert_eq!(pid_node.metadata.max_conn_count_tcp, Some(2));
        assert!(pid_node.origin_hosts.contains("host1"));
    }

    #[test]
    fn map_internet_pseudo_drops_internal_remotes_only() {
        let rpt = endpoint_report(&[
            ("host1", "10.0.0.1", "80", "10.0.0.2", "9000", "42"),
            ("host1", "10.0.0.1", "81", "198.51.100.9", "443", "42"),
        ]);
        let renderer = Map {
            selector: select_endpoint,
            map: process_pid,
            pseudo: internet_only_pseudo_node,
        };
        let nodes = renderer.render(&rpt);
        assert!(nodes.contains_key(mapping::THE_INTERNET));
        let pid_node = &nodes["pid:host1:42"];
        assert_eq!(
            pid_node.adjacency.iter().map(String::as_str).collect::<Vec<_>>(),
            vec![mapping::THE_INTERNET]
        );
    }

    #[test]
    fn map_aggregate_metadata_folds_matching_edges() {
        let rpt = endpoint_report(&[
            ("host1", "10.0.0.1", "80", "10.0.0.2", "9000", "42"),
            ("host1", "10.0.0.1", "80", "10.0.0.2", "9000", "42"),
            ("host1", "10.0.0.1", "81", "10.0.0.2", "9001", "42"),
        ]);
        let renderer = applications();
        let dst = make_endpoint_node_id("host1", "10.0.0.2", "9000");
        let agg = renderer.aggregate_metadata(&rpt, "pid:host1:42", &format!("pseudo:{dst}"));
        assert_eq!(agg.max_conn_count_tcp, Some(2));

        let none = renderer.aggregate_metadata(&rpt, "pid:host1:42", "no-such-node");
        assert!(none.is_empty());
    }

    #[test]
    fn reduce_unions_and_answers_first_non_empty_aggregate() {
        let rpt = endpoint_report(&[("host1", "10.0.0.1", "80", "10.0.0.2", "9000", "42")]);
        let renderer = Reduce(vec![
            Box::new(applications()),
            Box::new(applications()),
        ]);
        let nodes = renderer.render(&rpt);
        // Same children, same keys: the union collapses node-for-node.
        assert_eq!(nodes.len(), applications().render(&rpt).len());

        let dst = make_endpoint_node_id("host1", "10.0.0.2", "9000");
        let agg = renderer.aggregate_metadata(&rpt, "pid:host1:42", &format!("pseudo:{dst}"));
        // First match wins across children, not merged.
        assert_eq!(agg.max_conn_count_tcp, Some(1));
    }

    #[test]
    fn filter_repairs_dangling_adjacency() {
        let rpt = endpoint_report(&[("host1", "10.0.0.1", "80", "10.0.0.2", "9000", "42")]);
        let renderer = Filter::new(Box::new(applications()), |node| !node.pseudo);
        let nodes = renderer.render(&rpt);
        assert_eq!(nodes.len(), 1);
        for node in nodes.values() {
            for dst in &node.adjacency {
                assert!(nodes.contains_key(dst), "dangling adjacency to {dst}");
            }
        }

        // Aggregates still answer for filtered-out neighbours.
        let dst = make_endpoint_node_id("host1", "10.0.0.2", "9000");
        let agg = renderer.aggregate_metadata(&rpt, "pid:host1:42", &format!("pseudo:{dst}"));
        assert_eq!(agg.max_conn_count_tcp, Some(1));
    }

    #[test]
    fn renderable_node_merge_prefers_first_labels() {
        let a = RenderableNode::new("x", "major", "", "1");
        let b = RenderableNode::new("x", "other", "minor", "2");
        let merged = a.merge(b);
        assert_eq!(merged.label_major, "major");
        assert_eq!(merged.label_minor, "minor");
        assert_eq!(merged.rank, "1");
    }
}
