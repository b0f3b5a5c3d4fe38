use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use sunrpcd::programs::dump;
use sunrpcd::rpc::{CALL_SIGNATURE_LEN, RpcClient, is_sunrpc_call};
use sunrpcd::server::mux::Mux;
use sunrpcd::{AppConfig, AppContext, SunRpc, logging};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

/// How long shutdown waits for open sessions to close.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "sunrpcd")]
#[command(about = "SunRPC server for local and shared-port clients", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server until SIGINT or SIGTERM
    Serve(ServerArgs),
    /// List the programs a running server answers
    Status(StatusArgs),
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    rundir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    listen_addr: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    log_json: Option<bool>,
}

#[derive(Args, Serialize)]
struct StatusArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    rundir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_file = cli.config.as_deref();

    match &cli.command {
        Commands::Serve(args) => {
            let config = AppConfig::new(config_file, Some(args))?;
            logging::init((&config).into());
            run_server(AppContext::new(config))
                .await
                .context("Failed to run server")?
        }
        Commands::Status(args) => {
            let config = AppConfig::new(config_file, Some(args))?;
            run_status(&config)
                .await
                .context("Failed to check status of server")?
        }
    }

    Ok(())
}

async fn run_server(ctx: AppContext) -> Result<()> {
    let mux = Arc::new(
        Mux::bind(ctx.config.listen_addr, ctx.config.match_timeout())
            .await
            .with_context(|| format!("Failed to listen on {}", ctx.config.listen_addr))?,
    );
    let network = mux.matcher(CALL_SIGNATURE_LEN, is_sunrpc_call);

    let server = Arc::new(SunRpc::new(&ctx, network)?);
    info!(
        socket = %server.socket_path().display(),
        addr = %mux.local_addr(),
        programs = server.programs().len(),
        "SunRPC server ready"
    );

    let mux_task = tokio::spawn({
        let mux = mux.clone();
        async move { mux.serve().await }
    });

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let signals = tokio::spawn({
        let server = server.clone();
        let mux = mux.clone();
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
            server.stop();
            mux.close();
        }
    });

    server.serve().await?;
    signals.abort();

    if tokio::time::timeout(DRAIN_TIMEOUT, server.drain()).await.is_err() {
        warn!(
            connected = server.clients().connected(),
            "Timed out waiting for sessions to close"
        );
    }

    mux_task.await?.context("Multiplexer failed")?;
    Ok(())
}

async fn run_status(config: &AppConfig) -> Result<()> {
    let socket = config.socket_path();
    let mut client = RpcClient::connect_unix(&socket)
        .await
        .with_context(|| format!("Is the server running? ({})", socket.display()))?;

    let reply = dump::query(&mut client, u64::from(std::process::id())).await?;
    println!("Server at {} answers:", socket.display());
    for program in &reply.programs {
        println!(
            "  {:<20} program {:>10}  version {}",
            program.name, program.number, program.version
        );
    }
    Ok(())
}
