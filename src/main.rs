//! Cactus Tunnel CLI
//!
//! - `client`: listen for local TCP connections and tunnel them to a server,
//!   directly or through a browser bridge
//! - `server`: accept tunnels over WebSocket and dial their targets
//! - `relay`: act as the bridge page's relay peer from the command line

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cactus_tunnel::config::Config;
use cactus_tunnel::{BrowserRelay, ClientOptions, TunnelClient, TunnelServer};

/// Checks made for an attaching relay peer before opening the browser
const AUTO_OPEN_RETRIES: u32 = 30;

#[derive(Parser, Debug)]
#[command(name = "cactus-tunnel")]
#[command(author, version, about = "TCP over WebSocket tunnel with browser bridge support")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Forward local TCP connections through a tunnel server
    Client(ClientArgs),

    /// Accept tunnels and connect them to their targets
    Server(ServerArgs),

    /// Relay tunnels for a bridge-mode client
    Relay(RelayArgs),
}

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Tunnel server URL, or `auto` to use the bridge page origin
    server: String,

    /// Target `host:port` for the server to dial, or `auto`
    target: String,

    /// Local listen port
    #[arg(short, long, env = "CT_CLIENT_PORT")]
    port: Option<u16>,

    /// Local listen hostname
    #[arg(short = 'H', long, env = "CT_CLIENT_HOSTNAME")]
    hostname: Option<String>,

    /// Route tunnels through a browser bridge
    #[arg(short, long, env = "CT_BRIDGE")]
    bridge: bool,

    /// Don't open the bridge page automatically
    #[arg(long)]
    no_browser: bool,

    /// Bridge listen port
    #[arg(long, env = "CT_BRIDGE_PORT")]
    bridge_port: Option<u16>,

    /// Bridge listen hostname
    #[arg(long, env = "CT_BRIDGE_HOSTNAME")]
    bridge_hostname: Option<String>,

    /// URL of the page hosting the relay peer
    #[arg(long, env = "CT_BRIDGE_PAGE")]
    bridge_page: Option<String>,

    /// Give up on a bridge handshake step after this many seconds
    #[arg(long, env = "CT_BRIDGE_WAIT")]
    bridge_wait: Option<u64>,
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Listen port
    #[arg(short, long, env = "CT_SERVER_PORT")]
    port: Option<u16>,

    /// Listen hostname
    #[arg(short = 'H', long, env = "CT_SERVER_HOSTNAME")]
    hostname: Option<String>,
}

#[derive(Parser, Debug)]
struct RelayArgs {
    /// Client bridge URL, e.g. ws://127.0.0.1:7900
    client_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            warn!("Ignoring config file: {:#}", e);
            Config::default()
        }
    };

    match cli.command {
        Commands::Client(args) => run_client(args, &config).await,
        Commands::Server(args) => run_server(args, &config).await,
        Commands::Relay(args) => run_relay(args).await,
    }
}

async fn run_client(args: ClientArgs, config: &Config) -> Result<()> {
    let bridge = args
        .bridge
        .then(|| config.bridge_listen(args.bridge_hostname, args.bridge_port));

    let client = TunnelClient::start(ClientOptions {
        listen: config.client_listen(args.hostname, args.port),
        server: args.server,
        target: args.target,
        bridge,
        bridge_wait: args.bridge_wait.map(Duration::from_secs),
        bridge_page: args.bridge_page,
    })
    .await
    .context("Failed to start client")?;

    if let Some(url) = client.bridge_url() {
        info!("Bridge page: {}", url);
    }

    wait_with_auto_open(&client, !args.no_browser, wait_for_shutdown()).await?;
    info!("Traffic: {}", client.traffic());
    client.close().await;
    Ok(())
}

/// Wait for `shutdown`, opening the bridge page in the meantime if asked
async fn wait_with_auto_open(
    client: &TunnelClient,
    open_browser: bool,
    shutdown: impl Future<Output = Result<()>>,
) -> Result<()> {
    let auto_open = async {
        if open_browser {
            client.auto_open_bridge(AUTO_OPEN_RETRIES).await;
        }
        std::future::pending::<()>().await
    };

    tokio::select! {
        result = shutdown => result,
        _ = auto_open => Ok(()),
    }
}

async fn run_server(args: ServerArgs, config: &Config) -> Result<()> {
    let listen = config.server_listen(args.hostname, args.port);
    let server = TunnelServer::bind(&listen)
        .await
        .with_context(|| format!("Failed to listen on {}", listen))?;

    wait_for_shutdown().await?;
    server.close().await;
    Ok(())
}

async fn run_relay(args: RelayArgs) -> Result<()> {
    let relay = BrowserRelay::new(args.client_url);
    let shutdown = CancellationToken::new();

    let stop = shutdown.clone();
    let relay_task = tokio::spawn(async move { relay.run(stop).await });

    wait_for_shutdown().await?;
    shutdown.cancel();
    relay_task.await.context("Relay task failed")?;
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down...");
    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use cactus_tunnel::client::{BrowserOpener, AUTO_OPEN_INTERVAL};
    use cactus_tunnel::config::Listen;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingOpener {
        opened: AtomicUsize,
    }

    impl BrowserOpener for CountingOpener {
        fn open(&self, _url: &str) -> std::io::Result<()> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn bridge_client(opener: Arc<CountingOpener>) -> TunnelClient {
        TunnelClient::start_with_opener(
            ClientOptions {
                listen: Listen::new("127.0.0.1", 0),
                server: "ws://127.0.0.1:7800".to_string(),
                target: "127.0.0.1:22".to_string(),
                bridge: Some(Listen::new("127.0.0.1", 0)),
                bridge_wait: None,
                bridge_page: None,
            },
            opener,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_shutdown_not_delayed_by_auto_open() {
        let opener = Arc::new(CountingOpener::default());
        let client = bridge_client(opener.clone()).await;

        // The bridge stays closed, so auto-open alone would wait its full retry budget
        tokio::time::timeout(
            Duration::from_millis(500),
            wait_with_auto_open(&client, true, async { Ok(()) }),
        )
        .await
        .expect("shutdown waited for auto-open")
        .unwrap();
        assert_eq!(opener.opened.load(Ordering::SeqCst), 0);

        client.close().await;
    }

    #[tokio::test]
    async fn test_auto_open_runs_while_waiting() {
        let opener = Arc::new(CountingOpener::default());
        let client = bridge_client(opener.clone()).await;

        let shutdown = tokio::time::sleep(AUTO_OPEN_INTERVAL * (AUTO_OPEN_RETRIES + 5));
        wait_with_auto_open(&client, true, async {
            shutdown.await;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(opener.opened.load(Ordering::SeqCst), 1);

        client.close().await;
    }
}
