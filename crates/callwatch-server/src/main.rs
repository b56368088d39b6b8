use anyhow::{Context, Result};
use callwatch_core::{Callwatch, CallwatchConfig, SystemClock, TracingDispatcher};
use callwatch_server::{create_router, logging};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "callwatch-server")]
#[command(about = "Emergency call escalation and live session monitoring service", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overrides `api.bind_address`
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level, overrides `logging.level`
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = CallwatchConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(bind) = args.bind {
        config.api.bind_address = bind;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    logging::setup_logging(&config.logging)?;
    logging::log_welcome("callwatch-server", env!("CARGO_PKG_VERSION"));

    let bind_address = config.api.bind_address.clone();
    let callwatch = Callwatch::in_memory(config, Arc::new(TracingDispatcher), Arc::new(SystemClock));
    let aggregation = callwatch.start();

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("binding {}", bind_address))?;
    info!("🌐 Listening on http://{}", listener.local_addr()?);

    let app = create_router(callwatch.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    callwatch.shutdown();
    aggregation.await.context("joining aggregation task")?;
    info!("👋 callwatch-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
