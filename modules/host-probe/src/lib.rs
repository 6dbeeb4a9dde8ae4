//! Host facts probe: kernel version, load averages, and uptime, parsed from
//! procfs or command output. Missing data degrades to an "unknown" sentinel
//! instead of failing the collection cycle.

use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use time::OffsetDateTime;

use meshmap_core::id;
use meshmap_core::report::Report;
use meshmap_core::topology::NodeMetadata;

/// Sentinel for facts the host would not give up.
pub const UNKNOWN: &str = "unknown";

fn uname_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\S+)\s+(\S+)").unwrap())
}

fn load_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"load averages?:\s+([0-9.]+),?\s+([0-9.]+),?\s+([0-9.]+)").unwrap()
    })
}

fn uptime_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"up\s+([0-9]+)\s+day[s]?,\s+([0-9]+):([0-9][0-9])").unwrap())
}

/// "Linux 6.8.0-49-generic" from `uname -sr` output.
pub fn parse_kernel_version(out: &str) -> Option<String> {
    let caps = uname_re().captures(out.trim())?;
    Some(format!("{} {}", &caps[1], &caps[2]))
}

/// "0.52 0.58 0.59" from /proc/loadavg.
pub fn parse_proc_loadavg(out: &str) -> Option<String> {
    let mut fields = out.split_whitespace();
    let one = fields.next()?;
    let five = fields.next()?;
    let fifteen = fields.next()?;
    Some(format!("{one} {five} {fifteen}"))
}

/// Load averages from `uptime`/`w` style output.
pub fn parse_w_load(out: &str) -> Option<String> {
    let caps = load_re().captures(out)?;
    Some(format!("{} {} {}", &caps[1], &caps[2], &caps[3]))
}

/// Uptime from /proc/uptime ("12345.67 23456.78").
pub fn parse_proc_uptime(out: &str) -> Option<Duration> {
    let secs: f64 = out.split_whitespace().next()?.parse().ok()?;
    Some(Duration::from_secs(secs as u64))
}

/// Uptime from `uptime`/`w` style output ("up 3 days, 4:05").
pub fn parse_w_uptime(out: &str) -> Option<Duration> {
    let caps = uptime_re().captures(out)?;
    let days: u64 = caps[1].parse().ok()?;
    let hours: u64 = caps[2].parse().ok()?;
    let minutes: u64 = caps[3].parse().ok()?;
    Some(Duration::from_secs(
        days * 24 * 3600 + hours * 3600 + minutes * 60,
    ))
}

/// Boundary to the OS: opaque strings and durations, or an error.
pub trait HostFacts {
    fn kernel_version(&self) -> Result<String>;
    fn load_averages(&self) -> String;
    fn uptime(&self) -> Result<Duration>;
}

/// Real host facts via procfs with a command fallback.
pub struct SystemFacts;

impl HostFacts for SystemFacts {
    fn kernel_version(&self) -> Result<String> {
        let out = Command::new("uname")
            .arg("-sr")
            .output()
            .context("running uname")?;
        parse_kernel_version(&String::from_utf8_lossy(&out.stdout))
            .ok_or_else(|| anyhow!("unparseable uname output"))
    }

    fn load_averages(&self) -> String {
        if let Ok(s) = std::fs::read_to_string("/proc/loadavg") {
            if let Some(load) = parse_proc_loadavg(&s) {
                return load;
            }
        }
        let Ok(out) = Command::new("uptime").output() else {
            return UNKNOWN.to_string();
        };
        parse_w_load(&String::from_utf8_lossy(&out.stdout))
            .unwrap_or_else(|| UNKNOWN.to_string())
    }

    fn uptime(&self) -> Result<Duration> {
        if let Ok(s) = std::fs::read_to_string("/proc/uptime") {
            if let Some(d) = parse_proc_uptime(&s) {
                return Ok(d);
            }
        }
        let out = Command::new("uptime").output().context("running uptime")?;
        parse_w_uptime(&String::from_utf8_lossy(&out.stdout))
            .ok_or_else(|| anyhow!("unparseable uptime output"))
    }
}

/// Generates Reports containing the host topology: one node per host with
/// its facts in the extension metadata.
pub struct Reporter {
    host_id: String,
    host_name: String,
}

impl Reporter {
    pub fn new(host_id: impl Into<String>, host_name: impl Into<String>) -> Self {
        Reporter {
            host_id: host_id.into(),
            host_name: host_name.into(),
        }
    }

    pub fn report(&self, facts: &dyn HostFacts) -> Report {
        self.report_at(facts, OffsetDateTime::now_utc())
    }

    pub fn report_at(&self, facts: &dyn HostFacts, now: OffsetDateTime) -> Report {
        let mut rpt = Report::at(now);
        let mut meta = NodeMetadata {
            name: Some(self.host_name.clone()),
            ..Default::default()
        };
        meta.extra.insert(
            "kernel_version".to_string(),
            facts.kernel_version().unwrap_or_else(|_| UNKNOWN.to_string()),
        );
        meta.extra
            .insert("load".to_string(), facts.load_averages());
        meta.extra.insert(
            "uptime_secs".to_string(),
            facts
                .uptime()
                .map(|d| d.as_secs().to_string())
                .unwrap_or_else(|_| UNKNOWN.to_string()),
        );
        rpt.host
            .node_metadatas
            .insert(id::make_node_id(&self.host_id, &[&self.host_name]), meta);
        rpt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn parses_uname_output() {
        assert_eq!(
            parse_kernel_version("Linux 6.8.0-49-generic\n").as_deref(),
            Some("Linux 6.8.0-49-generic")
        );
        assert_eq!(
            parse_kernel_version("Darwin 23.6.0\n").as_deref(),
            Some("Darwin 23.6.0")
        );
        assert_eq!(parse_kernel_version(""), None);
    }

    #[test]
    fn parses_loadavg_sources() {
        assert_eq!(
            parse_proc_loadavg("0.52 0.58 0.59 1/1340 12345\n").as_deref(),
            Some("0.52 0.58 0.59")
        );
        assert_eq!(
            parse_w_load("10:15  up 3 days,  4:05, 2 users, load averages: 1.50 1.21 1.08\n")
                .as_deref(),
            Some("1.50 1.21 1.08")
        );
        assert_eq!(
            parse_w_load("10:15 up 3 days, 4:05, 2 users, load average: 0.10, 0.20, 0.30\n")
                .as_deref(),
            Some("0.10 0.20 0.30")
        );
        assert_eq!(parse_w_load("garbage"), None);
    }

    #[test]
    fn parses_uptime_sources() {
        assert_eq!(
            parse_proc_uptime("12345.67 23456.78\n"),
            Some(Duration::from_secs(12345))
        );
        assert_eq!(
            parse_w_uptime("10:15  up 3 days,  4:05, 2 users\n"),
            Some(Duration::from_secs(3 * 24 * 3600 + 4 * 3600 + 5 * 60))
        );
        assert_eq!(parse_w_uptime("10:15 up 5 min"), None);
    }

    #[test]
    fn report_degrades_to_unknown_on_fact_failure() {
        struct Unavailable;
        impl HostFacts for Unavailable {
            fn kernel_version(&self) -> Result<String> {
                Err(anyhow!("no uname"))
            }
            fn load_averages(&self) -> String {
                UNKNOWN.to_string()
            }
            fn uptime(&self) -> Result<Duration> {
                Err(anyhow!("no uptime"))
            }
        }

        let rpt = Reporter::new("host1", "one")
            .report_at(&Unavailable, datetime!(2015-03-01 12:00 UTC));
        rpt.host.validate().unwrap();
        let node = &rpt.host.node_metadatas[&id::make_node_id("host1", &["one"])];
        assert_eq!(node.extra["kernel_version"], UNKNOWN);
        assert_eq!(node.extra["uptime_secs"], UNKNOWN);
        assert_eq!(node.name.as_deref(), Some("one"));
    }

    #[test]
    fn report_carries_real_facts() {
        struct Fixed;
        impl HostFacts for Fixed {
            fn kernel_version(&self) -> Result<String> {
                Ok("Linux 6.8.0".to_string())
            }
            fn load_averages(&self) -> String {
                "0.10 0.20 0.30".to_string()
            }
            fn uptime(&self) -> Result<Duration> {
                Ok(Duration::from_secs(90))
            }
        }

        let rpt = Reporter::new("host1", "one").report_at(&Fixed, datetime!(2015-03-01 12:00 UTC));
        let node = &rpt.host.node_metadatas[&id::make_node_id("host1", &["one"])];
        assert_eq!(node.extra["kernel_version"], "Linux 6.8.0");
        assert_eq!(node.extra["load"], "0.10 0.20 0.30");
        assert_eq!(node.extra["uptime_secs"], "90");
    }
}
