//! Map and pseudo functions wiring the registry's views: what each raw node
//! becomes in a given view, and what stands in for remotes the view cannot
//! classify.

use std::net::IpAddr;
use std::sync::OnceLock;

use ipnet::IpNet;

use meshmap_core::id;
use meshmap_core::topology::NodeMetadata;

use crate::RenderableNode;

/// Mapped ID of the single pseudo node collapsing all public remotes.
pub const THE_INTERNET: &str = "theinternet";

/// Extra-metadata keys set by the container runtime probe.
pub const DOCKER_CONTAINER_ID: &str = "docker_container_id";
pub const DOCKER_IMAGE_NAME: &str = "docker_image_name";

/// Endpoint node -> one node per (host, pid).
pub fn process_pid(node_id: &str, meta: &NodeMetadata) -> Option<RenderableNode> {
    let (scope, _) = id::parse_node_id(node_id)?;
    let pid = meta.pid.as_deref()?;
    let label_major = meta
        .name
        .clone()
        .unwrap_or_else(|| format!("PID {pid}"));
    Some(RenderableNode::new(
        format!("pid:{scope}:{pid}"),
        label_major,
        format!("{scope} ({pid})"),
        pid,
    ))
}

/// Endpoint node -> one node per process name, across hosts.
pub fn process_name(_node_id: &str, meta: &NodeMetadata) -> Option<RenderableNode> {
    meta.pid.as_deref()?;
    let name = meta.name.as_deref()?;
    Some(RenderableNode::new(format!("proc:{name}"), name, "", name))
}

/// Address node -> one node per host, labelled with its hostname.
pub fn network_hostname(node_id: &str, meta: &NodeMetadata) -> Option<RenderableNode> {
    let (scope, _) = id::parse_node_id(node_id)?;
    let hostname = meta.name.clone().unwrap_or_else(|| scope.clone());
    Some(RenderableNode::new(
        format!("host:{scope}"),
        hostname,
        "",
        scope,
    ))
}

/// Endpoint node -> the container that owns its process. Labels are left
/// empty; the container-identity half of the view supplies them on merge.
pub fn map_endpoint_to_container(_node_id: &str, meta: &NodeMetadata) -> Option<RenderableNode> {
    let container_id = meta.extra.get(DOCKER_CONTAINER_ID)?;
    Some(RenderableNode::new(container_id.clone(), "", "", ""))
}

/// Container node -> itself, carrying name and image labels.
pub fn map_container_identity(_node_id: &str, meta: &NodeMetadata) -> Option<RenderableNode> {
    let container_id = meta.extra.get(DOCKER_CONTAINER_ID)?;
    let name = meta.name.clone().unwrap_or_else(|| container_id.clone());
    let image = meta.extra.get(DOCKER_IMAGE_NAME).cloned().unwrap_or_default();
    Some(RenderableNode::new(
        container_id.clone(),
        name.clone(),
        image,
        name,
    ))
}

/// Endpoint node -> one node per container image.
pub fn process_container_image(_node_id: &str, meta: &NodeMetadata) -> Option<RenderableNode> {
    let image = meta.extra.get(DOCKER_IMAGE_NAME)?;
    Some(RenderableNode::new(
        format!("image:{image}"),
        image,
        "",
        image,
    ))
}

/// One pseudo node per unclassifiable remote, labelled with its address part.
pub fn generic_pseudo_node(
    _src_node_id: &str,
    _src_mapped_id: &str,
    dst_node_id: &str,
) -> Option<RenderableNode> {
    let label = id::parse_node_id(dst_node_id)
        .map(|(_, rest)| rest)
        .unwrap_or_else(|| dst_node_id.to_string());
    Some(RenderableNode::new_pseudo(
        format!("pseudo:{dst_node_id}"),
        label,
        "",
    ))
}

/// All unclassifiable remotes collapsed into a single "unknown" node.
pub fn generic_grouped_pseudo_node(
    _src_node_id: &str,
    _src_mapped_id: &str,
    _dst_node_id: &str,
) -> Option<RenderableNode> {
    Some(RenderableNode::new_pseudo("pseudo:unknown", "Unknown", ""))
}

/// Public remotes collapse into "the Internet"; remotes on monitored
/// networks are dropped rather than shown as placeholders.
pub fn internet_only_pseudo_node(
    _src_node_id: &str,
    _src_mapped_id: &str,
    dst_node_id: &str,
) -> Option<RenderableNode> {
    let (_, rest) = id::parse_node_id(dst_node_id)?;
    let addr: IpAddr = rest.split(';').next()?.parse().ok()?;
    if is_local_address(addr) {
        return None;
    }
    Some(RenderableNode::new_pseudo(
        THE_INTERNET,
        "the Internet",
        "",
    ))
}

fn local_networks() -> &'static [IpNet] {
    static NETS: OnceLock<Vec<IpNet>> = OnceLock::new();
    NETS.get_or_init(|| {
        [
            "10.0.0.0/8",
            "172.16.0.0/12",
            "192.168.0.0/16",
            "169.254.0.0/16",
            "127.0.0.0/8",
            "fc00::/7",
            "fe80::/10",
            "::1/128",
        ]
        .iter()
        .map(|s| s.parse().expect("static network literal"))
        .collect()
    })
}

/// Whether an address belongs to the monitored (private/local) networks.
pub fn is_local_address(addr: IpAddr) -> bool {
    local_networks().iter().any(|net| net.contains(&addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshmap_core::id::make_endpoint_node_id;
    use std::collections::BTreeMap;

    fn meta(pid: Option<&str>, name: Option<&str>) -> NodeMetadata {
        NodeMetadata {
            pid: pid.map(str::to_string),
            name: name.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn process_pid_requires_a_pid() {
        let node_id = make_endpoint_node_id("host1", "10.0.0.1", "80");
        let rn = process_pid(&node_id, &meta(Some("42"), Some("nginx"))).unwrap();
        assert_eq!(rn.id, "pid:host1:42");
        assert_eq!(rn.label_major, "nginx");
        assert_eq!(rn.rank, "42");

        assert!(process_pid(&node_id, &meta(None, Some("nginx"))).is_none());
        // A node ID without a scope cannot be placed in any view.
        assert!(process_pid("scopeless", &meta(Some("42"), None)).is_none());
    }

    #[test]
    fn process_name_groups_across_hosts() {
        let a = make_endpoint_node_id("host1", "10.0.0.1", "80");
        let b = make_endpoint_node_id("host2", "10.0.0.2", "80");
        let m = meta(Some("42"), Some("redis"));
        assert_eq!(
            process_name(&a, &m).unwrap().id,
            process_name(&b, &m).unwrap().id
        );
    }

    #[test]
    fn container_mappings_use_extra_keys() {
        let node_id = make_endpoint_node_id("host1", "10.0.0.1", "80");
        let mut extra = BTreeMap::new();
        extra.insert(DOCKER_CONTAINER_ID.to_string(), "abc123".to_string());
        extra.insert(DOCKER_IMAGE_NAME.to_string(), "redis:7".to_string());
        let m = NodeMetadata {
            name: Some("app_redis_1".into()),
            extra,
            ..Default::default()
        };

        assert_eq!(map_endpoint_to_container(&node_id, &m).unwrap().id, "abc123");
        let identity = map_container_identity(&node_id, &m).unwrap();
        assert_eq!(identity.id, "abc123");
        assert_eq!(identity.label_major, "app_redis_1");
        assert_eq!(identity.label_minor, "redis:7");
        assert_eq!(process_container_image(&node_id, &m).unwrap().id, "image:redis:7");

        assert!(map_endpoint_to_container(&node_id, &meta(None, None)).is_none());
    }

    #[test]
    fn internet_pseudo_classifies_by_network() {
        let public = make_endpoint_node_id("host1", "198.51.100.9", "443");
        let private = make_endpoint_node_id("host1", "10.0.0.2", "9000");
        let rn = internet_only_pseudo_node("src", "mapped", &public).unwrap();
        assert_eq!(rn.id, THE_INTERNET);
        assert!(rn.pseudo);
        assert!(internet_only_pseudo_node("src", "mapped", &private).is_none());
    }

    #[test]
    fn local_address_classification() {
        assert!(is_local_address("10.1.2.3".parse().unwrap()));
        assert!(is_local_address("192.168.0.9".parse().unwrap()));
        assert!(is_local_address("127.0.0.1".parse().unwrap()));
        assert!(is_local_address("fe80::1".parse().unwrap()));
        assert!(!is_local_address("198.51.100.9".parse().unwrap()));
        assert!(!is_local_address("2001:db8::1".parse().unwrap()));
    }
}
