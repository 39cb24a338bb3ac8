/// VeilNet Daemon - connection manager of a VeilNet node
///
/// This daemon:
/// - Opens and tracks directory connections
/// - Reclaims closed connections on a fixed sweep interval
/// - Probes single directory servers for reachability

use anyhow::Result;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn, Level};

use veilnet_common::NodeConfig;
use veilnet_daemon::{DirectoryNode, ProbeReport};

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("help" | "--help" | "-h") => {
            print_help();
        }
        Some("version" | "--version" | "-v") => {
            println!("VeilNet Daemon v{}", env!("CARGO_PKG_VERSION"));
        }
        Some("run") | None => {
            let config = load_config(args.get(2).map(PathBuf::from))?;
            init_logging(&config);
            run_node(config).await?;
        }
        Some("probe") => {
            let Some(target) = args.get(2) else {
                eprintln!("Usage: veilnet-daemon probe <ip:port>");
                std::process::exit(1);
            };
            let target: SocketAddr = target.parse()?;
            let config = NodeConfig::default();
            init_logging(&config);
            let report = probe(config, target).await?;
            print_probe_report(&report)?;
        }
        Some(other) => {
            eprintln!("Unknown command: {}", other);
            eprintln!("Run with 'help' to see available commands");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn init_logging(config: &NodeConfig) {
    let level = Level::from_str(&config.log_level).unwrap_or(Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();
}

/// Load configuration, writing the defaults out if the file is missing
fn load_config(path: Option<PathBuf>) -> Result<NodeConfig> {
    let Some(path) = path else {
        return Ok(NodeConfig::default());
    };

    if path.exists() {
        return Ok(NodeConfig::from_file(&path)?);
    }

    let config = NodeConfig::default();
    if let Err(e) = config.to_file(&path) {
        eprintln!("Failed to save default config to {:?}: {}", path, e);
    }
    Ok(config)
}

/// Run until ctrl-c
async fn run_node(config: NodeConfig) -> Result<()> {
    info!("Starting VeilNet Daemon v{}", env!("CARGO_PKG_VERSION"));

    let mut node = DirectoryNode::new(config)?;
    let opened = node.bootstrap()?;
    info!("Opened {} directory connections", opened.len());
    info!("Node is running. Press Ctrl+C to stop.");

    let stats = node
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for ctrl-c: {}", e);
            }
        })
        .await?;

    info!(
        "Node stopped, reclaimed {} connections ({} sockets closed)",
        stats.reclaimed, stats.closed_sockets
    );
    Ok(())
}

async fn probe(config: NodeConfig, target: SocketAddr) -> Result<ProbeReport> {
    let mut node = DirectoryNode::new(config)?;
    node.probe(target).await
}

fn print_probe_report(report: &ProbeReport) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

/// Print help message
fn print_help() {
    println!("VeilNet Daemon - connection manager of a VeilNet node");
    println!();
    println!("USAGE:");
    println!("    veilnet-daemon [COMMAND]");
    println!();
    println!("COMMANDS:");
    println!("    run [config.toml]   Open directory connections and keep them (default)");
    println!("    probe <ip:port>     Connect to one directory server and report as JSON");
    println!("    help                Show this help message");
    println!("    version             Show version information");
    println!();
    println!("EXAMPLES:");
    println!("    veilnet-daemon run veilnet.toml");
    println!("    veilnet-daemon probe 127.0.0.1:9030");
}
