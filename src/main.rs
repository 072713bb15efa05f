use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};
use otterscale::EnvConfig;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(version, about, arg_required_else_help(true))]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the hub: PKI, address allocator, tunnel listener, registration
    /// service, and health checker.
    Server(ServerArgs),

    /// Run a spoke agent: register with the hub and keep a reverse tunnel
    /// open, reconnecting with backoff.
    Agent(AgentArgs),
}

#[derive(Args)]
struct ServerArgs {
    /// Bind address for the mTLS tunnel listener.
    #[arg(long)]
    tunnel_address: Option<SocketAddr>,

    /// The hub's cluster-routing tunnel CA seed. Must not equal the
    /// compiled-in placeholder.
    #[arg(long, env = "OTTERSCALE_SERVER_TUNNEL_KEY_SEED")]
    tunnel_key_seed: Option<String>,

    /// Bind address for the (out-of-scope) user-facing HTTP/RPC surface.
    #[arg(long)]
    server_url: Option<SocketAddr>,

    /// The hub tunnel listener's externally reachable URL, dialed by agents.
    #[arg(long)]
    tunnel_server_url: Option<String>,
}

#[derive(Args)]
struct AgentArgs {
    /// The cluster name this agent registers as.
    #[arg(long)]
    cluster: String,

    /// The hub tunnel listener's externally reachable URL.
    #[arg(long)]
    tunnel_server_url: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(EnvFilter::from("info"))
        .init();

    info!("🦦 otterscale v{VERSION}");

    if let Err(err) = run().await {
        eprintln!("fatal: {err}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    match cli.command {
        Command::Server(args) => {
            let mut env_config = EnvConfig::load()?;
            if let Some(addr) = args.tunnel_address {
                env_config.tunnel_address = addr;
            }
            if let Some(seed) = args.tunnel_key_seed {
                env_config.tunnel_key_seed = seed.into();
            }
            if let Some(addr) = args.server_url {
                env_config.server_url = addr;
            }
            if let Some(url) = args.tunnel_server_url {
                env_config.tunnel_server_url = url;
            }
            otterscale::serve(env_config, cancel).await
        }
        Command::Agent(args) => {
            let mut env_config = EnvConfig::load()?;
            env_config.cluster = Some(args.cluster);
            if let Some(url) = args.tunnel_server_url {
                env_config.tunnel_server_url = url;
            }
            otterscale::run_agent(env_config, cancel).await
        }
    }
}

/// Installs a combined Ctrl-C / SIGTERM handler that fires `cancel` once,
/// mirroring the graceful-shutdown entry point the lifecycle coordinator
/// expects from its caller (spec §4.7).
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        cancel.cancel();
    });
}
