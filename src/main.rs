use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use micro_cdn::client::Client;
use micro_cdn::config::{ClientConfig, IndexConfig, MonitorConfig, NodeConfig};
use micro_cdn::content::node::ContentNode;
use micro_cdn::directory::service::IndexService;
use micro_cdn::membership::service::MembershipService;
use micro_cdn::membership::types::NodeId;
use micro_cdn::telemetry::init_tracing;

#[derive(Parser, Debug, Clone)]
#[command(name = "micro-cdn", version, about = "Micro content delivery network")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
enum Cmd {
    /// Run the monitor (heartbeats, failure detection)
    Monitor(MonitorArgs),
    /// Run the index against a remote monitor
    Index(IndexArgs),
    /// Run monitor and index in one process
    Standalone(StandaloneArgs),
    /// Run a content node
    Node(NodeArgs),
    /// Query the index or download a file
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
struct MonitorArgs {
    /// UDP address receiving heartbeats
    #[arg(long, env = "MICRO_CDN_HEARTBEAT_BIND", default_value = "0.0.0.0:6000")]
    heartbeat_bind: SocketAddr,

    /// TCP control endpoint
    #[arg(long, env = "MICRO_CDN_CONTROL_BIND", default_value = "0.0.0.0:6001")]
    control_bind: SocketAddr,

    /// Seconds of silence before a node is declared dead
    #[arg(long, env = "MICRO_CDN_HEARTBEAT_TIMEOUT", default_value_t = 8)]
    heartbeat_timeout: u64,

    /// Seconds between failure detector sweeps
    #[arg(long, env = "MICRO_CDN_SWEEP_INTERVAL", default_value_t = 4)]
    sweep_interval: u64,

    /// Index notification endpoints to push SERVER_DOWN to
    #[arg(long, value_delimiter = ',')]
    notify: Vec<String>,

    #[arg(long, default_value_t = 256)]
    max_connections: usize,
}

#[derive(Args, Debug, Clone)]
struct IndexArgs {
    /// TCP endpoint for clients and content nodes
    #[arg(long, env = "MICRO_CDN_CLIENT_BIND", default_value = "0.0.0.0:5000")]
    client_bind: SocketAddr,

    /// TCP endpoint receiving SERVER_DOWN from the monitor
    #[arg(long, env = "MICRO_CDN_NOTIFY_BIND", default_value = "0.0.0.0:5001")]
    notify_bind: SocketAddr,

    /// Optional HTTP status surface
    #[arg(long, env = "MICRO_CDN_HTTP_BIND")]
    http: Option<SocketAddr>,

    /// Monitor control endpoint
    #[arg(long, env = "MICRO_CDN_MONITOR", default_value = "127.0.0.1:6001")]
    monitor: String,

    /// Host the monitor uses to reach the notification endpoint
    #[arg(long, default_value = "127.0.0.1")]
    advertise_host: String,

    /// Seconds between membership refreshes
    #[arg(long, default_value_t = 4)]
    refresh_interval: u64,

    /// Drop catalogs of nodes dead for this many seconds
    #[arg(long)]
    purge_after: Option<u64>,

    /// Seconds a content node may take from REGISTER to DONE_FILES
    #[arg(long, default_value_t = 30)]
    handshake_timeout: u64,

    #[arg(long, default_value_t = 256)]
    max_connections: usize,
}

#[derive(Args, Debug, Clone)]
struct StandaloneArgs {
    #[command(flatten)]
    index: IndexArgs,

    #[arg(long, env = "MICRO_CDN_HEARTBEAT_BIND", default_value = "0.0.0.0:6000")]
    heartbeat_bind: SocketAddr,

    #[arg(long, env = "MICRO_CDN_CONTROL_BIND", default_value = "0.0.0.0:6001")]
    control_bind: SocketAddr,

    #[arg(long, default_value_t = 8)]
    heartbeat_timeout: u64,

    #[arg(long, default_value_t = 4)]
    sweep_interval: u64,
}

#[derive(Args, Debug, Clone)]
struct NodeArgs {
    /// Node identifier
    #[arg(long, env = "MICRO_CDN_NODE_ID", default_value = "CS1")]
    id: String,

    /// TCP port serving file bytes
    #[arg(long, default_value_t = 7001)]
    tcp_port: u16,

    /// Port announced at registration
    #[arg(long, default_value_t = 7002)]
    udp_port: u16,

    /// Directory with the files to serve (default: files_<id>)
    #[arg(long)]
    files_dir: Option<PathBuf>,

    /// Host announced in heartbeats
    #[arg(long, default_value = "localhost")]
    advertise_host: String,

    #[arg(long, env = "MICRO_CDN_INDEX", default_value = "127.0.0.1:5000")]
    index: String,

    /// Monitor UDP heartbeat endpoint
    #[arg(long, env = "MICRO_CDN_MONITOR_UDP", default_value = "127.0.0.1:6000")]
    monitor: String,

    /// Seconds between heartbeats
    #[arg(long, default_value_t = 3)]
    heartbeat_interval: u64,

    /// Do not create sample files in an empty directory
    #[arg(long, default_value_t = false)]
    no_samples: bool,
}

#[derive(Args, Debug, Clone)]
struct ClientArgs {
    #[arg(long, env = "MICRO_CDN_INDEX", default_value = "127.0.0.1:5000")]
    index: String,

    /// Where downloaded files are written
    #[arg(long, default_value = "downloads")]
    output_dir: PathBuf,

    #[command(subcommand)]
    action: ClientAction,
}

#[derive(Subcommand, Debug, Clone)]
enum ClientAction {
    /// Download a file
    Get { file: String },
    /// List files with a live host
    List,
    /// List content nodes known to the index
    Servers,
}

impl MonitorArgs {
    fn into_config(self) -> MonitorConfig {
        MonitorConfig {
            heartbeat_bind: self.heartbeat_bind,
            control_bind: self.control_bind,
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout),
            sweep_interval: Duration::from_secs(self.sweep_interval),
            max_connections: self.max_connections,
            notify: self.notify,
            ..Default::default()
        }
    }
}

impl IndexArgs {
    fn into_config(self) -> IndexConfig {
        IndexConfig {
            client_bind: self.client_bind,
            notify_bind: self.notify_bind,
            http_bind: self.http,
            monitor_addr: self.monitor,
            advertise_host: self.advertise_host,
            refresh_interval: Duration::from_secs(self.refresh_interval),
            max_connections: self.max_connections,
            purge_after: self.purge_after.map(Duration::from_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout),
            ..Default::default()
        }
    }
}

impl NodeArgs {
    fn into_config(self) -> NodeConfig {
        let files_dir = self
            .files_dir
            .unwrap_or_else(|| PathBuf::from(format!("files_{}", self.id)));

        NodeConfig {
            id: NodeId(self.id),
            files_dir,
            transfer_bind: SocketAddr::from(([0, 0, 0, 0], self.tcp_port)),
            udp_port: self.udp_port,
            advertise_host: self.advertise_host,
            index_addr: self.index,
            monitor_addr: self.monitor,
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval),
            create_samples: !self.no_samples,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Cmd::Monitor(args) => run_monitor(args).await,
        Cmd::Index(args) => run_index(args).await,
        Cmd::Standalone(args) => run_standalone(args).await,
        Cmd::Node(args) => run_node(args).await,
        Cmd::Client(args) => run_client(args).await,
    }
}

async fn wait_for_ctrl_c() -> anyhow::Result<()> {
    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl+C")?;
    Ok(())
}

async fn run_monitor(args: MonitorArgs) -> anyhow::Result<()> {
    init_tracing("monitor");

    let monitor = MembershipService::new(args.into_config()).start().await?;
    wait_for_ctrl_c().await?;
    monitor.shutdown().await;
    Ok(())
}

async fn run_index(args: IndexArgs) -> anyhow::Result<()> {
    init_tracing("index");

    let index = IndexService::with_remote_monitor(args.into_config())
        .start()
        .await?;
    wait_for_ctrl_c().await?;
    index.shutdown().await;
    Ok(())
}

async fn run_standalone(args: StandaloneArgs) -> anyhow::Result<()> {
    init_tracing("standalone");

    let monitor_config = MonitorConfig {
        heartbeat_bind: args.heartbeat_bind,
        control_bind: args.control_bind,
        heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout),
        sweep_interval: Duration::from_secs(args.sweep_interval),
        ..Default::default()
    };
    let monitor = MembershipService::new(monitor_config);
    let store = Arc::clone(&monitor.store);
    let monitor = monitor.start().await?;

    let index = IndexService::with_local_membership(args.index.into_config(), store)
        .start()
        .await?;

    wait_for_ctrl_c().await?;
    index.shutdown().await;
    monitor.shutdown().await;
    Ok(())
}

async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    init_tracing("node");

    let node = ContentNode::new(args.into_config()).await?.start().await?;
    wait_for_ctrl_c().await?;
    node.shutdown().await;
    Ok(())
}

async fn run_client(args: ClientArgs) -> anyhow::Result<()> {
    init_tracing("client");

    let client = Client::new(ClientConfig {
        index_addr: args.index,
        output_dir: args.output_dir,
        ..Default::default()
    });

    match args.action {
        ClientAction::Get { file } => {
            let (decision, path) = client
                .fetch(&file, |received, total| {
                    let percent = if total == 0 {
                        100
                    } else {
                        received * 100 / total
                    };
                    print!("\r{}: {} / {} bytes ({}%)", file, received, total, percent);
                    let _ = std::io::stdout().flush();
                })
                .await
                .with_context(|| format!("downloading {}", file))?;
            println!();
            println!(
                "Saved {} ({} bytes) from {} at {}",
                path.display(),
                decision.size,
                decision.node_id,
                decision.address
            );
        }
        ClientAction::List => {
            let files = client.index().list_files().await?;
            if files.is_empty() {
                println!("No files available");
            }
            for listing in files {
                println!("{:<40} {:>12} bytes", listing.name, listing.size);
            }
        }
        ClientAction::Servers => {
            for row in client.index().list_servers().await? {
                println!(
                    "{:<12} {:<24} load={:<4} {}",
                    row.id.as_str(),
                    row.address.to_string(),
                    row.load,
                    row.state.as_wire()
                );
            }
        }
    }

    Ok(())
}
