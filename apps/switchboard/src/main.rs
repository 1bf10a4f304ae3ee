use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use switchboard::{
    cli::{self, Cli, Commands},
    config::Config,
    server::{self, AppState},
    telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(&cli.serve.log_filter);

    if let Some(Commands::Probe(args)) = cli.command {
        return cli::run_probe(args).await;
    }

    let config = Config::try_from(cli.serve)?;
    let metrics = telemetry::install_metrics()?;
    info!(
        listen_addr = %config.listen_addr,
        ping_interval_secs = config.ping_interval.as_secs(),
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "starting switchboard relay"
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let state = AppState::new(config, Some(metrics));

    server::serve(listener, state, shutdown_signal()).await?;
    info!("switchboard stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
