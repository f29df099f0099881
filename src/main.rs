use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use vidshard::config::{NodeConfig, NodeRole};
use vidshard::node::Node;
use vidshard::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "vidshard")]
#[command(about = "A distributed video transcoding service with leader election")]
struct Args {
    /// Role this node starts with
    #[arg(long, default_value = "worker")]
    role: NodeRole,

    /// Port to listen on for gRPC
    #[arg(long, default_value = "50051")]
    port: u16,

    /// Address peers use to reach this node (host:port). Defaults to
    /// 127.0.0.1:<port>.
    #[arg(long)]
    advertise: Option<String>,

    /// Address of the initial master (host:port). Required for workers.
    #[arg(long)]
    master: Option<String>,

    /// Peer addresses (comma-separated host:port)
    #[arg(long, default_value = "")]
    peers: String,

    /// Backup node addresses for artifact replication (comma-separated)
    #[arg(long, default_value = "")]
    backups: String,

    /// Root directory for on-disk state
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// Port for the HTTP gateway (optional)
    #[arg(long)]
    gateway_port: Option<u16>,

    /// Segment length in seconds
    #[arg(long, default_value = "10")]
    segment_seconds: u32,

    /// Jobs allowed to progress in parallel
    #[arg(long, default_value = "4")]
    job_concurrency: usize,

    /// Shards this node will transcode concurrently
    #[arg(long, default_value = "2")]
    worker_capacity: usize,
}

fn parse_addr_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if args.role == NodeRole::Worker && args.master.is_none() {
        return Err("--master is required for worker nodes".into());
    }

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let advertise_addr = args
        .advertise
        .unwrap_or_else(|| format!("127.0.0.1:{}", args.port));
    let gateway_addr: Option<SocketAddr> = match args.gateway_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    let mut peers = parse_addr_list(&args.peers);
    if let Some(master) = &args.master {
        if master != &advertise_addr && !peers.contains(master) {
            peers.push(master.clone());
        }
    }
    peers.retain(|p| p != &advertise_addr);

    let config = NodeConfig {
        role: args.role,
        listen_addr,
        advertise_addr,
        master_addr: args.master,
        peers,
        backups: parse_addr_list(&args.backups),
        data_dir: args.data_dir,
        segment_seconds: args.segment_seconds,
        job_concurrency: args.job_concurrency,
        worker_capacity: args.worker_capacity,
        ..Default::default()
    };

    tracing::info!(
        role = %config.role,
        listen = %config.listen_addr,
        advertise = %config.advertise_addr,
        master = ?config.master_addr,
        peers = ?config.peers,
        backups = ?config.backups,
        "Starting vidshard node"
    );

    let shutdown = install_shutdown_handler();
    let node = Node::new(config, gateway_addr);
    node.run(shutdown).await?;

    Ok(())
}
