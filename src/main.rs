//! MeshLink CLI
//!
//! Thin wrapper around meshlink-core for trying the mesh from a terminal.
//!
//! ## Usage
//!
//! ```bash
//! # Relay a message down a five-device chain with a hop budget of 3
//! meshlink simulate --nodes 5 --ttl 3 --topology line --message "need water"
//!
//! # Same, fully connected, with JSONL field logs
//! meshlink -vv --log-dir ./logs simulate --nodes 4 --topology full
//!
//! # Show the effective configuration
//! meshlink config --path meshlink.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use meshlink_core::logging::{filter_for_verbosity, JsonlLayer};
use meshlink_core::{ForcedRole, MemoryHub, MeshConfig, MeshNode, OutboundMessage};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// MeshLink - offline emergency messaging mesh
#[derive(Parser)]
#[command(name = "meshlink")]
#[command(version = "0.1.0")]
#[command(about = "MeshLink - offline emergency messaging mesh")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Also append JSONL logs to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Relay one message through an in-memory mesh and report what happened
    Simulate {
        /// Number of devices
        #[arg(short, long, default_value_t = 4)]
        nodes: usize,

        /// Hop budget of the message
        #[arg(short, long, default_value_t = 5)]
        ttl: u8,

        /// How devices are linked
        #[arg(long, value_enum, default_value_t = Topology::Line)]
        topology: Topology,

        /// Message body
        #[arg(short, long, default_value = "hello")]
        message: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Configuration file (missing file means defaults)
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Topology {
    /// Each device sees only its neighbors in a chain
    Line,
    /// Every device sees every other
    Full,
}

fn setup_logging(verbosity: u8, log_dir: Option<&PathBuf>) -> Result<()> {
    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter_for_verbosity(verbosity));
    let jsonl = match log_dir {
        Some(dir) => {
            let device = std::env::var("MESHLINK_DEVICE_ID").unwrap_or_else(|_| "cli".into());
            let layer = JsonlLayer::new(dir, device)
                .with_context(|| format!("opening log directory {}", dir.display()))?;
            Some(layer.with_filter(filter_for_verbosity(verbosity.max(1))))
        }
        None => None,
    };
    tracing_subscriber::registry().with(console).with(jsonl).init();
    Ok(())
}

/// `MESHLINK_DEVICE_ID` and `MESHLINK_DEVICE_NAME` override the file
fn apply_env_overlay(config: &mut MeshConfig) {
    if let Ok(id) = std::env::var("MESHLINK_DEVICE_ID") {
        if !id.trim().is_empty() {
            config.device_id = Some(id);
        }
    }
    if let Ok(name) = std::env::var("MESHLINK_DEVICE_NAME") {
        if !name.trim().is_empty() {
            config.device_name = Some(name);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.log_dir.as_ref())?;

    match cli.command {
        Commands::Simulate {
            nodes,
            ttl,
            topology,
            message,
            json,
        } => simulate(nodes, ttl, topology, message, json).await,

        Commands::Config { path } => {
            let mut config = match path {
                Some(path) => MeshConfig::load(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => MeshConfig::default(),
            };
            apply_env_overlay(&mut config);
            config.validate()?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

async fn simulate(
    count: usize,
    ttl: u8,
    topology: Topology,
    message: String,
    json: bool,
) -> Result<()> {
    if count < 2 {
        bail!("a mesh needs at least 2 nodes");
    }
    if ttl == 0 {
        bail!("ttl must be at least 1");
    }

    let hub = MemoryHub::new();
    let mut nodes: Vec<Arc<MeshNode>> = Vec::with_capacity(count);
    for i in 1..=count {
        let mut config = MeshConfig {
            device_id: Some(format!("node-{}", i)),
            device_name: Some(format!("Node {}", i)),
            ..Default::default()
        };
        config.discovery.timeout_ms = 2_000;
        config.messaging.max_ttl = config.messaging.max_ttl.max(ttl);
        if i == 1 {
            config.connection.forced_role = Some(ForcedRole::Host);
        }
        let builder = MeshNode::builder(config);
        let driver = hub.driver(builder.identity());
        let node = builder.driver(driver).build()?;
        node.start_manual()?;
        nodes.push(node);
    }

    let host_role = nodes[0].establish().await?;
    tracing::info!(role = %host_role, "First node established");

    let mut degrees = vec![0usize; count];
    for i in 0..count {
        for j in (i + 1)..count {
            let adjacent = match topology {
                Topology::Line => j == i + 1,
                Topology::Full => true,
            };
            if adjacent {
                hub.link(nodes[i].device_id().as_str(), nodes[j].device_id().as_str());
                degrees[i] += 1;
                degrees[j] += 1;
            }
        }
    }
    let linked = wait_for(Duration::from_secs(5), || {
        nodes
            .iter()
            .zip(&degrees)
            .all(|(node, degree)| node.links().len() >= *degree)
    })
    .await;
    if !linked {
        bail!("mesh did not finish linking");
    }

    let expected = match topology {
        Topology::Line => (count - 1).min(usize::from(ttl)),
        Topology::Full => count - 1,
    };
    let sender = &nodes[count - 1];
    let envelope = sender
        .send(OutboundMessage::text(message).ttl(ttl))
        .await?;

    let total_delivered = || nodes.iter().map(|n| n.stats().delivered).sum::<u64>();
    wait_for(Duration::from_secs(5), || total_delivered() >= expected as u64).await;
    // Let any stray relays land before reading counters
    tokio::time::sleep(Duration::from_millis(100)).await;

    let rows: Vec<_> = nodes
        .iter()
        .map(|node| {
            let stats = node.stats();
            serde_json::json!({
                "device": node.device_id().as_str(),
                "delivered": stats.delivered,
                "forwarded": stats.forwarded,
                "duplicates_dropped": stats.duplicates_dropped,
                "loops_dropped": stats.loops_dropped,
                "ttl_expired": stats.ttl_expired,
            })
        })
        .collect();

    if json {
        let report = serde_json::json!({
            "envelope": envelope.id.as_str(),
            "topology": format!("{:?}", topology).to_lowercase(),
            "ttl": ttl,
            "expected_deliveries": expected,
            "delivered": total_delivered(),
            "nodes": rows,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Sent {} from {} (ttl {})",
            envelope.id,
            sender.device_id(),
            ttl
        );
        println!();
        println!(
            "{:<10} {:>9} {:>9} {:>10} {:>6} {:>11}",
            "DEVICE", "DELIVERED", "FORWARDED", "DUPLICATES", "LOOPS", "TTL EXPIRED"
        );
        for node in &nodes {
            let s = node.stats();
            println!(
                "{:<10} {:>9} {:>9} {:>10} {:>6} {:>11}",
                node.device_id(),
                s.delivered,
                s.forwarded,
                s.duplicates_dropped,
                s.loops_dropped,
                s.ttl_expired
            );
        }
        println!();
        println!("Delivered: {}/{}", total_delivered(), expected);
    }

    for node in &nodes {
        node.dispose().await;
    }
    Ok(())
}

async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
