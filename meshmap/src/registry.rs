//! The static table of topology views: each names a renderer over the
//! merged report, and optionally a parent view it refines.

use meshmap_core::report::{select_address, select_container, select_endpoint};
use render::mapping;
use render::{Map, Reduce, Renderer};

pub struct TopologyView {
    pub name: &'static str,
    pub human: &'static str,
    pub parent: Option<&'static str>,
    pub renderer: Box<dyn Renderer>,
}

pub fn registry() -> Vec<TopologyView> {
    vec![
        TopologyView {
            name: "applications",
            human: "Applications",
            parent: None,
            renderer: Box::new(Map {
                selector: select_endpoint,
                map: mapping::process_pid,
                pseudo: mapping::generic_pseudo_node,
            }),
        },
        TopologyView {
            name: "applications-by-name",
            human: "by name",
            parent: Some("applications"),
            renderer: Box::new(Map {
                selector: select_endpoint,
                map: mapping::process_name,
                pseudo: mapping::generic_grouped_pseudo_node,
            }),
        },
        TopologyView {
            name: "containers",
            human: "Containers",
            parent: None,
            renderer: Box::new(Reduce(vec![
                Box::new(Map {
                    selector: select_endpoint,
                    map: mapping::map_endpoint_to_container,
                    pseudo: mapping::internet_only_pseudo_node,
                }),
                Box::new(Map {
                    selector: select_container,
                    map: mapping::map_container_identity,
                    pseudo: mapping::internet_only_pseudo_node,
                }),
            ])),
        },
        TopologyView {
            name: "containers-by-image",
            human: "by image",
            parent: Some("containers"),
            renderer: Box::new(Map {
                selector: select_endpoint,
                map: mapping::process_container_image,
                pseudo: mapping::internet_only_pseudo_node,
            }),
        },
        TopologyView {
            name: "hosts",
            human: "Hosts",
            parent: None,
            renderer: Box::new(Map {
                selector: select_address,
                map: mapping::network_hostname,
                pseudo: mapping::generic_pseudo_node,
            }),
        },
    ]
}

pub fn lookup(name: &str) -> Option<TopologyView> {
    registry().into_iter().find(|v| v.name == name)
}
