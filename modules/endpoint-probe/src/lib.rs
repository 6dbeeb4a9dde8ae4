//! Endpoint probe: turns one cycle of observed connections into a Report
//! with address and endpoint topologies, remembering when each edge was
//! first seen across cycles.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use meshmap_core::id;
use meshmap_core::report::Report;
use meshmap_core::topology::{EdgeMetadata, NodeMetadata};

/// One observed connection, as yielded by a connection source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    /// Owning process, when the source can attribute the connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
}

/// Boundary to the OS-level connection enumerator. Each call yields a fresh,
/// finite batch; a failure fails the collection cycle, not the process.
pub trait ConnectionSource {
    fn connections(&self, include_processes: bool) -> Result<Vec<Connection>>;
}

/// Replays a JSONL capture file, one `Connection` object per line. Blank
/// lines and `#` comments are skipped.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileSource { path: path.into() }
    }
}

impl ConnectionSource for FileSource {
    fn connections(&self, include_processes: bool) -> Result<Vec<Connection>> {
        let file = File::open(&self.path)
            .with_context(|| format!("opening capture {}", self.path.display()))?;
        let mut out = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            let t = line.trim();
            if t.is_empty() || t.starts_with('#') {
                continue;
            }
            let mut conn: Connection = serde_json::from_str(t)
                .with_context(|| format!("{}:{}", self.path.display(), n + 1))?;
            if !include_processes {
                conn.pid = None;
                conn.process_name = None;
            }
            out.push(conn);
        }
        Ok(out)
    }
}

/// In-memory source for tests and replay.
pub struct StaticSource(pub Vec<Connection>);

impl ConnectionSource for StaticSource {
    fn connections(&self, include_processes: bool) -> Result<Vec<Connection>> {
        let mut out = self.0.clone();
        if !include_processes {
            for c in &mut out {
                c.pid = None;
                c.process_name = None;
            }
        }
        Ok(out)
    }
}

/// Observability sink for probe timing, injected instead of process-global
/// counters.
pub trait MetricsSink {
    fn observe_spy_duration(&self, elapsed: Duration);
}

pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn observe_spy_duration(&self, _elapsed: Duration) {}
}

/// Generates Reports containing the address and endpoint topologies for one
/// host. Single-writer: only this reporter touches its first-seen table, and
/// each produced Report is an immutable value handed off for merging.
pub struct Reporter {
    host_id: String,
    host_name: String,
    include_processes: bool,
    first_seen: HashMap<String, OffsetDateTime>,
}

impl Reporter {
    pub fn new(host_id: impl Into<String>, host_name: impl Into<String>, include_processes: bool) -> Self {
        Reporter {
            host_id: host_id.into(),
            host_name: host_name.into(),
            include_processes,
            first_seen: HashMap::new(),
        }
    }

    /// Run one collection cycle against the given source.
    pub fn report(
        &mut self,
        source: &dyn ConnectionSource,
        metrics: &dyn MetricsSink,
    ) -> Result<Report> {
        let started = std::time::Instant::now();
        let result = self.report_at(source, OffsetDateTime::now_utc());
        metrics.observe_spy_duration(started.elapsed());
        result
    }

    /// Collection cycle with an explicit observation time.
    pub fn report_at(
        &mut self,
        source: &dyn ConnectionSource,
        now: OffsetDateTime,
    ) -> Result<Report> {
        let mut rpt = Report::at(now);
        let conns = source.connections(self.include_processes)?;
        for conn in &conns {
            self.add_connection(&mut rpt, conn, now);
        }
        self.cleanup_connections(&rpt);
        Ok(rpt)
    }

    fn add_connection(&mut self, rpt: &mut Report, c: &Connection, now: OffsetDateTime) {
        let local = c.local_addr.to_string();
        let remote = c.remote_addr.to_string();
        let scoped_local = id::make_address_node_id(&self.host_id, &local);
        let scoped_remote = id::make_address_node_id(&self.host_id, &remote);
        let key = id::make_adjacency_id(&scoped_local);
        let edge_key = id::make_edge_id(&scoped_local, &scoped_remote);
        let first_seen = self.lookup_first_seen(&edge_key, now);

        let adj = rpt.address.adjacency.remove(&key).unwrap_or_default();
        rpt.address
            .adjacency
            .insert(key, adj.add(&scoped_remote, first_seen));
        rpt.address
            .node_metadatas
            .entry(scoped_local)
            .or_insert_with(|| NodeMetadata {
                name: Some(self.host_name.clone()),
                addr: Some(local.clone()),
                ..Default::default()
            });
        count_tcp_connection(&mut rpt.address.edge_metadatas, &edge_key);

        if let Some(pid) = c.pid {
            let lport = c.local_port.to_string();
            let rport = c.remote_port.to_string();
            let scoped_local = id::make_endpoint_node_id(&self.host_id, &local, &lport);
            let scoped_remote = id::make_endpoint_node_id(&self.host_id, &remote, &rport);
            let key = id::make_adjacency_id(&scoped_local);
            let edge_key = id::make_edge_id(&scoped_local, &scoped_remote);
            let first_seen = self.lookup_first_seen(&edge_key, now);

            let adj = rpt.endpoint.adjacency.remove(&key).unwrap_or_default();
            rpt.endpoint
                .adjacency
                .insert(key, adj.add(&scoped_remote, first_seen));
            rpt.endpoint
                .node_metadatas
                .entry(scoped_local)
                .or_insert_with(|| NodeMetadata {
                    name: c.process_name.clone(),
                    addr: Some(local.clone()),
                    port: Some(lport),
                    pid: Some(pid.to_string()),
                    ..Default::default()
                });
            count_tcp_connection(&mut rpt.endpoint.edge_metadatas, &edge_key);
        }
    }

    fn lookup_first_seen(&mut self, edge_key: &str, now: OffsetDateTime) -> OffsetDateTime {
        *self.first_seen.entry(edge_key.to_string()).or_insert(now)
    }

    /// Drop first-seen entries for edges no longer observed in either
    /// topology, so the table does not grow with connection churn.
    fn cleanup_connections(&mut self, rpt: &Report) {
        self.first_seen.retain(|edge_key, _| {
            rpt.address.edge_metadatas.contains_key(edge_key)
                || rpt.endpoint.edge_metadatas.contains_key(edge_key)
        });
    }
}

fn count_tcp_connection(m: &mut BTreeMap<String, EdgeMetadata>, edge_key: &str) {
    let md = m.entry(edge_key.to_string()).or_default();
    md.with_conn_count_tcp = true;
    md.max_conn_count_tcp += 1;
}
