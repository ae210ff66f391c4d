use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use agent_dispatch::{
    api::{router, AppState},
    edge::EdgeState,
    init_telemetry, shutdown_telemetry, DispatchConfig, Runtime, ShutdownCoordinator,
};

/// How long in-flight jobs get to finish after a stop signal
const DRAIN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "agent-dispatch")]
#[command(about = "Durable job dispatch and spend guardrails for background agents")]
#[command(long_about = "agent-dispatch runs per-agent job queues with bounded concurrency, \
                       retries with backoff, a monthly spend ledger with tiered fallback, \
                       and an HTTP edge for webhooks, triggers and a live event stream.")]
struct Cli {
    /// Configuration file (defaults to ./agent-dispatch.toml when present)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the workers and the HTTP server until SIGINT/SIGTERM
    Serve {
        /// Override `server.bind`
        #[arg(long)]
        bind: Option<String>,
    },
    /// Load and validate configuration, then print it as TOML
    CheckConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    DispatchConfig::load_env_file();

    match cli.command {
        Some(Commands::CheckConfig) => check_config(cli.config),
        Some(Commands::Serve { bind }) => tokio::runtime::Runtime::new()?
            .block_on(async { serve(cli.config, bind).await }),
        None => tokio::runtime::Runtime::new()?.block_on(async { serve(cli.config, None).await }),
    }
}

fn check_config(path: Option<PathBuf>) -> Result<()> {
    let config = DispatchConfig::load(path.as_deref()).context("configuration is invalid")?;
    print!("{}", config.to_toml()?);
    eprintln!(
        "✅ configuration OK ({} agents, environment {:?})",
        config.agents.len(),
        config.server.environment
    );
    Ok(())
}

async fn serve(path: Option<PathBuf>, bind: Option<String>) -> Result<()> {
    init_telemetry()?;

    let mut config = DispatchConfig::load(path.as_deref())?;
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.server.bind))?;

    let edge = EdgeState::from_config(&config)?;
    let runtime = Arc::new(Runtime::builder(config).build().await?);

    let shutdown = ShutdownCoordinator::new();
    let mut handles = runtime.start(shutdown.subscribe()).await;
    handles.push(edge.limiter.clone().spawn_cleanup(shutdown.subscribe()));

    let app = router(AppState {
        runtime: runtime.clone(),
        edge,
    });
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, production = runtime.config.is_production(), "agent-dispatch listening");

    let mut server_stop = shutdown.subscribe();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = server_stop.changed().await;
    });
    let server = tokio::spawn(async move { server.await });

    shutdown.wait_for_signal().await?;
    shutdown.drain(handles, DRAIN_GRACE).await;
    // Open SSE streams keep connections alive; do not wait on them forever
    match tokio::time::timeout(Duration::from_secs(5), server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "HTTP server exited with error"),
        Ok(Err(e)) => error!(error = %e, "HTTP server task failed"),
        Err(_) => info!("HTTP server still draining connections, exiting anyway"),
    }

    shutdown_telemetry();
    Ok(())
}
