use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rand::{thread_rng, Rng};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use endpoint_probe::{FileSource, MetricsSink};
use host_probe::SystemFacts;
use meshmap_core::report::{merge_all, Report};
use render::{Filter, Renderer};

mod config;
mod registry;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json, Jsonl }

#[derive(Debug, Parser)]
#[command(name = "meshmap", version, about = "Network topology probe and renderer")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./meshmap.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Run collection cycles against a connection capture; one report JSON line per cycle
    Probe {
        /// Host identifier used to scope node IDs
        #[arg(long)]
        host_id: Option<String>,
        /// Human-readable hostname attached to node metadata
        #[arg(long)]
        hostname: Option<String>,
        /// JSONL connection capture replayed each cycle (the connection-source boundary)
        #[arg(long, value_name = "FILE")]
        connections: PathBuf,
        /// Number of collection cycles to run
        #[arg(long, default_value_t = 1)]
        cycles: u32,
        /// Interval between cycles in milliseconds
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
        /// Attribute connections to processes when the capture has PIDs
        #[arg(long, default_value_t = false)]
        processes: bool,
        /// Output file (overwrites). Stdout if omitted.
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
    /// Merge report files and render one topology view
    Render {
        /// View name (see `meshmap views`)
        view: String,
        /// Report JSON files to merge
        #[arg(required = true)]
        reports: Vec<PathBuf>,
        /// Keep only nodes whose major label contains this substring
        #[arg(long = "match", value_name = "SUBSTR")]
        matching: Option<String>,
        /// Output format: text, json, or jsonl
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
        /// Output file (overwrites). Stdout if omitted.
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
        /// Write CSV instead of text/json when --out is provided
        #[arg(long, default_value_t = false)]
        csv: bool,
    },
    /// List the registered topology views
    Views {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Check report files for referential inconsistencies
    Validate {
        /// Report JSON files
        #[arg(required = true)]
        reports: Vec<PathBuf>,
    },
}

/// Probe timing goes to the log instead of a process-global counter.
struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn observe_spy_duration(&self, elapsed: Duration) {
        log::debug!("connection spy took {} ms", elapsed.as_millis());
    }
}

fn open_out(path: Option<&Path>) -> Result<Box<dyn Write>> {
    match path {
        Some(p) => {
            let file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(p)
                .with_context(|| format!("opening {}", p.display()))?;
            Ok(Box::new(BufWriter::new(file)))
        }
        None => Ok(Box::new(std::io::stdout())),
    }
}

fn load_reports(paths: &[PathBuf]) -> Result<Vec<Report>> {
    let mut out = Vec::with_capacity(paths.len());
    for p in paths {
        let s = std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        for (n, line) in s.lines().enumerate() {
            let t = line.trim();
            if t.is_empty() {
                continue;
            }
            let rpt: Report =
                serde_json::from_str(t).with_context(|| format!("{}:{}", p.display(), n + 1))?;
            out.push(rpt);
        }
    }
    Ok(out)
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let loaded_cfg = config::load_config(cli.config.as_deref());
    match cli.command {
        Commands::Version => {
            println!("meshmap {} (core {})", env!("CARGO_PKG_VERSION"), meshmap_core::version());
        }
        Commands::Probe { host_id, hostname, connections, mut cycles, mut interval_ms, mut processes, out } => {
            let mut host_id = host_id;
            let mut hostname = hostname;
            if let Some(cfg) = &loaded_cfg { if let Some(p) = &cfg.probe {
                if host_id.is_none() { host_id = p.host_id.clone(); }
                if hostname.is_none() { hostname = p.hostname.clone(); }
                if p.interval_ms.is_some() { interval_ms = p.interval_ms.unwrap(); }
                if p.cycles.is_some() { cycles = p.cycles.unwrap(); }
                if p.processes.is_some() { processes = p.processes.unwrap(); }
            }}
            let host_id = host_id.ok_or_else(|| anyhow!("provide --host-id (or probe.host_id in config)"))?;
            let hostname = hostname.unwrap_or_else(|| host_id.clone());

            let mut writer = open_out(out.as_deref())?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async move {
                let mut endpoint = endpoint_probe::Reporter::new(&host_id, &hostname, processes);
                let host = host_probe::Reporter::new(&host_id, &hostname);
                let source = FileSource::new(&connections);

                let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // Spread fleet probes out so they don't tick in lockstep.
                let jitter = thread_rng().gen_range(0..interval_ms / 4 + 1);
                tokio::time::sleep(Duration::from_millis(jitter)).await;

                for cycle in 0..cycles {
                    ticker.tick().await;
                    let rpt = match endpoint.report(&source, &LogMetrics) {
                        Ok(r) => r,
                        Err(e) => {
                            // Skip the cycle, keep the probe alive.
                            log::warn!("collection cycle {cycle} failed: {e:#}");
                            continue;
                        }
                    };
                    let merged = merge_all(vec![rpt, host.report(&SystemFacts)]);
                    writeln!(writer, "{}", serde_json::to_string(&merged)?)?;
                    writer.flush()?;
                }
                anyhow::Ok(())
            })?;
        }
        Commands::Render { view, reports, mut matching, mut format, out, csv } => {
            if let Some(cfg) = &loaded_cfg { if let Some(r) = &cfg.render {
                if matching.is_none() { matching = r.matching.clone(); }
                if let Some(f) = &r.format { format = match f.as_str() { "json" => OutputFormat::Json, "jsonl" => OutputFormat::Jsonl, _ => OutputFormat::Text }; }
            }}
            let merged = merge_all(load_reports(&reports)?);
            let entry = registry::lookup(&view)
                .ok_or_else(|| anyhow!("unknown view: {} (try `meshmap views`)", view))?;
            let renderer: Box<dyn Renderer> = match matching {
                Some(needle) => Box::new(Filter::new(entry.renderer, move |n| {
                    n.label_major.contains(&needle)
                })),
                None => entry.renderer,
            };
            let nodes = renderer.render(&merged);

            if csv {
                let Some(path) = out else {
                    return Err(anyhow!("--csv requires --out <file>"));
                };
                let mut wtr = csv::Writer::from_writer(std::fs::File::create(&path)?);
                wtr.write_record([
                    "id","label_major","label_minor","rank","pseudo","adjacency",
                    "egress_bytes","ingress_bytes","max_conn_count_tcp",
                ])?;
                for node in nodes.values() {
                    wtr.write_record([
                        node.id.clone(),
                        node.label_major.clone(),
                        node.label_minor.clone(),
                        node.rank.clone(),
                        node.pseudo.to_string(),
                        node.adjacency.iter().cloned().collect::<Vec<_>>().join("|"),
                        node.metadata.egress_bytes.map(|v| v.to_string()).unwrap_or_default(),
                        node.metadata.ingress_bytes.map(|v| v.to_string()).unwrap_or_default(),
                        node.metadata.max_conn_count_tcp.map(|v| v.to_string()).unwrap_or_default(),
                    ])?;
                }
                wtr.flush()?;
                return Ok(());
            }

            let mut w = open_out(out.as_deref())?;
            match format {
                OutputFormat::Text => {
                    for node in nodes.values() {
                        let adj = node.adjacency.iter().cloned().collect::<Vec<_>>().join(", ");
                        let mark = if node.pseudo { " (pseudo)" } else { "" };
                        writeln!(w, "{}{}  {} -> [{}]", node.id, mark, node.label_major, adj)?;
                    }
                }
                OutputFormat::Json => writeln!(w, "{}", serde_json::to_string(&nodes)?)?,
                OutputFormat::Jsonl => {
                    for node in nodes.values() {
                        writeln!(w, "{}", serde_json::to_string(node)?)?;
                    }
                }
            }
            w.flush()?;
        }
        Commands::Views { format } => {
            match format {
                OutputFormat::Text => {
                    for v in registry::registry() {
                        match v.parent {
                            Some(p) => println!("{}\t{} (parent: {})", v.name, v.human, p),
                            None => println!("{}\t{}", v.name, v.human),
                        }
                    }
                }
                OutputFormat::Json | OutputFormat::Jsonl => {
                    for v in registry::registry() {
                        let obj = serde_json::json!({
                            "name": v.name,
                            "human": v.human,
                            "parent": v.parent,
                        });
                        println!("{}", serde_json::to_string(&obj)?);
                    }
                }
            }
        }
        Commands::Validate { reports } => {
            let mut total = 0usize;
            for path in &reports {
                for rpt in load_reports(std::slice::from_ref(path))? {
                    let domains = [
                        ("endpoint", &rpt.endpoint),
                        ("address", &rpt.address),
                        ("process", &rpt.process),
                        ("container", &rpt.container),
                        ("host", &rpt.host),
                    ];
                    for (name, topo) in domains {
                        if let Err(invalid) = topo.validate() {
                            for err in &invalid.errors {
                                println!("{} {}: {}", path.display(), name, err);
                            }
                            total += invalid.errors.len();
                        }
                    }
                }
            }
            if total > 0 {
                return Err(anyhow!("found {} inconsistencies", total));
            }
            println!("ok");
        }
    }
    Ok(())
}
