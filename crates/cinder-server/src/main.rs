mod bus;
mod config;
mod coordinator;
mod persist;

use std::path::PathBuf;

use clap::Parser;
use cinder_cluster::{unix_ms, ClusterView, SLOT_COUNT};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::coordinator::{AdminCommand, Coordinator};

#[derive(Parser)]
#[command(name = "cinder-server", about = "cinder cluster node")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "CINDER_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// address to bind to and advertise
    #[arg(long, env = "CINDER_BIND")]
    bind: Option<String>,

    /// client port. the cluster bus listens on port + port_incr
    #[arg(short, long, env = "CINDER_PORT")]
    port: Option<u16>,

    /// directory holding the cluster config snapshot
    #[arg(long, env = "CINDER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// file name of the cluster config snapshot
    #[arg(long, env = "CINDER_NODES_FILE")]
    nodes_file: Option<String>,

    /// client address of a node to meet on startup. repeatable
    #[arg(long = "seed", env = "CINDER_SEEDS", value_delimiter = ',')]
    seeds: Vec<String>,

    /// assign all 16384 slots to this node if it starts without a snapshot
    #[arg(long, env = "CINDER_BOOTSTRAP")]
    bootstrap: bool,

    /// node timeout in milliseconds for failure detection
    #[arg(long, env = "CINDER_NODE_TIMEOUT")]
    node_timeout: Option<u64>,

    /// offset from the client port to the cluster bus port
    #[arg(long, env = "CINDER_PORT_INCR")]
    port_incr: Option<u16>,

    /// keep serving when some slots are uncovered
    #[arg(long, env = "CINDER_ALLOW_PARTIAL_COVERAGE")]
    allow_partial_coverage: bool,
}

/// Applies CLI overrides. Only values given on the command line or in the
/// environment take effect.
fn apply_args(cfg: &mut ServerConfig, args: &Args) {
    if let Some(ref bind) = args.bind {
        cfg.bind = bind.clone();
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(ref dir) = args.data_dir {
        cfg.data_dir = dir.to_string_lossy().into_owned();
    }
    if let Some(ref file) = args.nodes_file {
        cfg.nodes_file = file.clone();
    }
    if !args.seeds.is_empty() {
        cfg.seeds = args.seeds.clone();
    }
    if args.bootstrap {
        cfg.bootstrap = true;
    }
    if let Some(v) = args.node_timeout {
        cfg.cluster.node_timeout_ms = v;
    }
    if let Some(v) = args.port_incr {
        cfg.cluster.port_incr = v;
    }
    if args.allow_partial_coverage {
        cfg.cluster.require_full_coverage = false;
    }
}

/// Prints `msg` to stderr and exits with code 1.
fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cinder=info".into()),
        )
        .init();

    let args = Args::parse();

    if args.config_template {
        match ServerConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    // defaults → TOML file → CLI/env overrides
    let mut cfg = match &args.config {
        Some(path) => ServerConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => ServerConfig::default(),
    };
    apply_args(&mut cfg, &args);
    if let Err(e) = cfg.validate() {
        exit_err(format!("invalid configuration: {e}"));
    }

    let client_addr = cfg.client_addr().unwrap_or_else(|e| exit_err(e));
    let bus_addr = cfg.bus_addr().unwrap_or_else(|e| exit_err(e));
    let seeds = cfg.seed_addrs().unwrap_or_else(|e| exit_err(e));
    let cluster_config = cfg.cluster.to_cluster_config();

    if let Err(e) = std::fs::create_dir_all(&cfg.data_dir) {
        exit_err(format!("failed to create data dir '{}': {e}", cfg.data_dir));
    }
    let nodes_file = cfg.nodes_file_path();
    let now = unix_ms();
    let (view, fresh) = match persist::load(&nodes_file) {
        Ok(Some(snapshot)) => {
            let view = ClusterView::restore(cluster_config, &snapshot, now)
                .unwrap_or_else(|e| exit_err(format!("{}: {e}", nodes_file.display())));
            (view, false)
        }
        Ok(None) => (ClusterView::new(cluster_config, client_addr, now), true),
        Err(e) => exit_err(format!("failed to load cluster config: {e}")),
    };
    info!(
        node = %view.myself_id(),
        epoch = view.current_epoch(),
        nodes_file = %nodes_file.display(),
        "cinder node starting..."
    );

    let listener = TcpListener::bind(bus_addr)
        .await
        .unwrap_or_else(|e| exit_err(format!("failed to bind cluster bus on {bus_addr}: {e}")));

    let (coordinator, admin) = Coordinator::new(view, Some(nodes_file));
    bus::listen(listener, coordinator.link_events());
    let running = tokio::spawn(coordinator.run(shutdown_signal()));

    for seed in seeds {
        if let Err(e) = admin.call(AdminCommand::Meet(seed)).await {
            warn!("failed to meet seed {seed}: {e}");
        }
    }
    if cfg.bootstrap {
        if fresh {
            let all: Vec<u16> = (0..SLOT_COUNT).collect();
            match admin.call(AdminCommand::AddSlots(all)).await {
                Ok(_) => info!("bootstrapped: this node serves all {SLOT_COUNT} slots"),
                Err(e) => warn!("bootstrap failed: {e}"),
            }
        } else {
            info!("bootstrap skipped, a cluster config was loaded");
        }
    }

    if let Err(e) = running.await {
        exit_err(format!("cluster coordinator failed: {e}"));
    }
}
