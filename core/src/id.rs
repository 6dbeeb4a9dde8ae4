//! Deterministic, reversible string encoding for node, adjacency, and edge
//! keys. Every key is scoped by the host that observed it, so independently
//! collected reports can be merged without colliding.

/// Separates the scope from the address parts of a node ID.
const SCOPE_DELIM: char = ';';
/// Separates the source and destination node IDs of an edge ID.
const EDGE_DELIM: char = '|';
/// Marks a key as an adjacency-list key.
const ADJACENCY_PREFIX: char = '>';

/// Escape delimiter characters so the round-trip guarantee holds for
/// arbitrary component strings.
fn escape(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    for c in part.chars() {
        match c {
            '%' => out.push_str("%25"),
            ';' => out.push_str("%3B"),
            '|' => out.push_str("%7C"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    let bytes = part.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match &bytes[i..] {
            [b'%', b'2', b'5', ..] => {
                out.push('%');
                i += 3;
            }
            [b'%', b'3', b'B', ..] => {
                out.push(';');
                i += 3;
            }
            [b'%', b'7', b'C', ..] => {
                out.push('|');
                i += 3;
            }
            _ => {
                let c = part[i..].chars().next().unwrap_or('\u{fffd}');
                out.push(c);
                i += c.len_utf8();
            }
        }
    }
    out
}

/// Build a node ID from a scope (host ID) and one or more address parts.
pub fn make_node_id(scope: &str, parts: &[&str]) -> String {
    let mut out = escape(scope);
    for p in parts {
        out.push(SCOPE_DELIM);
        out.push_str(&escape(p));
    }
    out
}

/// Recover the scope and the (still-encoded) remainder of a node ID.
/// Returns `None` for IDs without a scope component.
pub fn parse_node_id(node_id: &str) -> Option<(String, String)> {
    let (scope, rest) = node_id.split_once(SCOPE_DELIM)?;
    if scope.is_empty() || rest.is_empty() {
        return None;
    }
    Some((unescape(scope), rest.to_string()))
}

/// Node ID for a host-scoped network address.
pub fn make_address_node_id(host_id: &str, address: &str) -> String {
    make_node_id(host_id, &[address])
}

/// Node ID for a host-scoped address and port pair.
pub fn make_endpoint_node_id(host_id: &str, address: &str, port: &str) -> String {
    make_node_id(host_id, &[address, port])
}

/// Node ID for a host-scoped process.
pub fn make_process_node_id(host_id: &str, pid: &str) -> String {
    make_node_id(host_id, &[pid])
}

/// Adjacency-list key for a source node.
pub fn make_adjacency_id(src_node_id: &str) -> String {
    format!("{ADJACENCY_PREFIX}{src_node_id}")
}

pub fn parse_adjacency_id(adjacency_id: &str) -> Option<String> {
    let rest = adjacency_id.strip_prefix(ADJACENCY_PREFIX)?;
    if rest.is_empty() {
        return None;
    }
    Some(rest.to_string())
}

/// Edge key for an ordered (source, destination) node ID pair.
pub fn make_edge_id(src_node_id: &str, dst_node_id: &str) -> String {
    format!("{src_node_id}{EDGE_DELIM}{dst_node_id}")
}

pub fn parse_edge_id(edge_id: &str) -> Option<(String, String)> {
    let (src, dst) = edge_id.split_once(EDGE_DELIM)?;
    if src.is_empty() || dst.is_empty() {
        return None;
    }
    Some((src.to_string(), dst.to_string()))
}
