use anyhow::Result;
use autorem_server::pipeline::Remediator;
use autorem_server::state::AppState;
use autorem_server::app;
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Auto-remediation orchestrator for an alerting platform.
#[derive(Parser)]
#[command(name = "autorem-server", version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long)]
    config: String,
    /// Listen address for the admin API.
    #[arg(long, default_value = "0.0.0.0:8080")]
    api_addr: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("autorem=info".parse()?))
        .init();

    let cli = Cli::parse();
    let remediator = Remediator::new(&cli.config).await?;

    let state = AppState {
        remediator: remediator.clone(),
        store: remediator.store(),
        config: remediator.config(),
    };
    let app = app::build_http_app(state);
    let listener = tokio::net::TcpListener::bind(&cli.api_addr).await?;
    tracing::info!(addr = %cli.api_addr, "starting API server");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ingestion = {
        let remediator = remediator.clone();
        tokio::spawn(async move {
            remediator.start(shutdown_rx).await;
        })
    };

    signal::ctrl_c().await?;
    tracing::info!("shutting down gracefully");
    let _ = shutdown_tx.send(true);
    let _ = ingestion.await;
    remediator.close().await;
    tracing::info!("server stopped");

    Ok(())
}
