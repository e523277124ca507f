//! cluster-relay: relay a pub/sub channel to local sessions, or look up
//! sibling instances of this service.

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cluster_relay::discovery::{DiscoveryChain, DiscoveryConfig};
use cluster_relay::{
    ClusterEnvironment, ConnectionState, CredentialBundle, CredentialPaths, NatsBackend,
    RelayConfig, RelayHub,
};

#[derive(Parser)]
#[command(name = "cluster-relay")]
#[command(version, about = "Pub/sub fanout relay and cluster peer discovery")]
struct Cli {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, env = "RELAY_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Discover peers once and print the result as JSON
    Discover(DiscoverArgs),
    /// Subscribe to a channel and log every relayed payload until Ctrl-C
    Relay(RelayArgs),
}

#[derive(Args)]
struct DiscoverArgs {
    /// Upper bound on each discovery strategy, in milliseconds
    #[arg(long, default_value_t = 5000)]
    strategy_timeout_ms: u64,

    /// Service-account directory holding token, ca.crt and namespace
    #[arg(long, env = "SERVICE_ACCOUNT_DIR")]
    credentials_dir: Option<String>,

    /// Pretty-print the JSON result
    #[arg(long)]
    pretty: bool,
}

#[derive(Args)]
struct RelayArgs {
    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    nats_url: String,

    /// Subject to relay
    #[arg(long, env = "RELAY_CHANNEL", default_value = "relay.updates")]
    channel: String,

    /// Messages buffered per session before the oldest are dropped
    #[arg(long, default_value_t = 256)]
    session_buffer: usize,

    /// Client name reported to the NATS server
    #[arg(long, default_value = "cluster-relay")]
    client_name: String,

    /// Seconds between reconnect attempts while the backend is unreachable
    #[arg(long, default_value_t = 30)]
    retry_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Command::Discover(args) => discover(args).await,
        Command::Relay(args) => relay(args).await,
    }
}

async fn discover(args: DiscoverArgs) -> anyhow::Result<()> {
    let paths = match &args.credentials_dir {
        Some(dir) => CredentialPaths::in_dir(dir),
        None => CredentialPaths::default(),
    };
    let env = ClusterEnvironment::from_env();
    let bundle = match CredentialBundle::load(&paths) {
        Ok(credentials) => credentials.into_bundle(),
        Err(e) => {
            warn!(error = %e, "ignoring unreadable cluster credentials");
            None
        }
    };

    let config = DiscoveryConfig::default()
        .strategy_timeout(Duration::from_millis(args.strategy_timeout_ms));
    let chain = DiscoveryChain::builder(env)
        .credentials(bundle)
        .config(config)
        .build();
    info!(strategies = ?chain.strategy_names(), "discovering peers");

    let result = chain.discover_peers().await;
    let json = if args.pretty {
        serde_json::to_string_pretty(&result)?
    } else {
        serde_json::to_string(&result)?
    };
    println!("{json}");
    Ok(())
}

async fn relay(args: RelayArgs) -> anyhow::Result<()> {
    let backend = NatsBackend::new(args.client_name);
    let hub = RelayHub::builder(backend, args.nats_url)
        .config(RelayConfig::new(args.channel).session_buffer(args.session_buffer))
        .build();

    let mut session = hub.connect().await;
    info!(session = %session.id(), state = ?hub.state(), "session attached");

    let mut retry = tokio::time::interval(Duration::from_secs(args.retry_secs.max(1)));
    retry.tick().await;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("shutting down");
                break;
            }
            _ = retry.tick(), if hub.state() == ConnectionState::Failed => {
                if let Err(e) = hub.bootstrap().ensure_started().await {
                    warn!(error = %e, "relay still unavailable");
                }
            }
            payload = session.recv() => {
                match payload {
                    Some(payload) => {
                        let text = String::from_utf8_lossy(&payload);
                        info!(len = payload.len(), payload = %text, "relayed");
                    }
                    None => {
                        warn!("session closed");
                        break;
                    }
                }
            }
        }
    }

    if session.dropped() > 0 {
        warn!(dropped = session.dropped(), "session fell behind");
    }
    drop(session);
    hub.shutdown().await?;
    Ok(())
}
