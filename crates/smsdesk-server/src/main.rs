use anyhow::{Context, Result};
use clap::Parser;
use smsdesk_server::config::ServerConfig;
use smsdesk_server::realtime::TransportKind;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "smsdesk-server", about = "smsdesk API, carrier webhook and real-time fan-out")]
struct Args {
    /// Config file (defaults to $XDG_CONFIG_HOME/smsdesk/server.toml)
    #[arg(long, env = "SMSDESK_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// SQLite database file
    #[arg(long, conflicts_with = "in_memory")]
    database: Option<PathBuf>,

    /// Keep all data in memory
    #[arg(long)]
    in_memory: bool,

    /// Real-time transport: socket or channel
    #[arg(long)]
    transport: Option<TransportKind>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "smsdesk_server=info,smsdesk_store=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(database) = args.database {
        config.database = Some(database);
    }
    if args.in_memory {
        config.database = None;
    }
    if let Some(transport) = args.transport {
        config.realtime.transport = transport;
    }

    let state = smsdesk_server::prepare(&config)?;
    let cors = smsdesk_server::build_cors(&config.allow_origins)?;
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen))?;

    tracing::info!(
        transport = %config.realtime.transport,
        "smsdesk-server listening on http://{}",
        config.listen
    );
    smsdesk_server::serve(listener, state, cors, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
    })
    .await
}
