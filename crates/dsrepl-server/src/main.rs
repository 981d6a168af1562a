//! dsrepl Server - standalone directory replication server
//!
//! Accepts replica connections over TCP, stores their changes in the
//! per-domain change logs and forwards them to every other replica. Retention
//! purge and replica liveness checks run in the background until Ctrl-C.

use clap::Parser;
use dsrepl_core::replication::transport;
use dsrepl_core::{ReplicationServer, ReplicationServerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// dsrepl Server CLI arguments
#[derive(Parser, Debug)]
#[command(name = "dsrepl-server")]
#[command(about = "Multi-master directory replication server", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long, short = 'c', env = "DSREPL_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `data_dir` from the configuration
    #[arg(long, env = "DSREPL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Overrides `bind_addr` from the configuration
    #[arg(long, env = "DSREPL_BIND_ADDR")]
    bind: Option<SocketAddr>,

    /// Enable verbose logging
    #[arg(long, short = 'v')]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "dsrepl_server=debug,dsrepl_core=debug".into())
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "dsrepl_server=info,dsrepl_core=info".into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(args: &Args) -> anyhow::Result<ReplicationServerConfig> {
    let mut config = match &args.config {
        Some(path) => ReplicationServerConfig::load(path)?,
        None => {
            warn!("No configuration file given, using defaults");
            ReplicationServerConfig::default()
        }
    };
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if config.domains.is_empty() {
        warn!("No replicated domains configured");
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = load_config(&args)?;
    let bind_addr = config.bind_addr;
    let server = ReplicationServer::open(config)?;
    for domain in server.domains() {
        info!(
            domain = %domain.base_dn(),
            generation_id = ?domain.generation_id(),
            private = domain.is_private(),
            "Replicated domain ready"
        );
    }

    let cancel = CancellationToken::new();
    let maintenance = server.spawn_maintenance(cancel.child_token());

    let listener = TcpListener::bind(bind_addr).await?;
    let listener_task = tokio::spawn(transport::run_listener(
        server.clone(),
        listener,
        cancel.child_token(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    cancel.cancel();
    if let Err(e) = listener_task.await? {
        warn!("Listener stopped with error: {}", e);
    }
    maintenance.await?;
    server.shutdown()?;
    Ok(())
}
