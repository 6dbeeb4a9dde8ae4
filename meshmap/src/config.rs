#![allow(dead_code)]
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Default, Deserialize, Clone)]
pub struct ProbeConfig {
    pub host_id: Option<String>,
    pub hostname: Option<String>,
    pub interval_ms: Option<u64>,
    pub cycles: Option<u32>,
    pub processes: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct RenderConfig {
    pub format: Option<String>,
    #[serde(rename = "match")]
    pub matching: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    pub probe: Option<ProbeConfig>,
    pub render: Option<RenderConfig>,
}

pub fn load_config(path: Option<&Path>) -> Option<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new("meshmap.yaml");
            if p.exists() { p.to_path_buf() } else { return None; }
        }
    };
    let s = fs::read_to_string(path).ok()?;
    serde_yaml::from_str(&s).ok()
}
