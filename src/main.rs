/// Aurora Relay - ATProto relay daemon
///
/// Crawls personal data servers and serves the combined firehose.
use anyhow::Context;
use aurora_relay::{
    config::{Cli, RelayConfig},
    metrics, server, AppContext, Relay,
};
use clap::Parser;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "aurora_relay=info,tower_http=info".into());
    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let config = RelayConfig::from_cli(cli);
    config.validate().context("invalid configuration")?;
    metrics::record_build_info(&config.service.version, &config.service.environment);

    info!(
        "Aurora Relay v{} starting ({})",
        config.service.version, config.service.environment
    );

    let api_listen = config.service.api_listen.clone();
    let metrics_listen = config.service.metrics_listen.clone();

    let relay = Arc::new(Relay::new(config).await.context("failed to initialize relay")?);

    let listeners = async {
        let api = server::bind(&api_listen)
            .await
            .with_context(|| format!("failed to bind API listener on {}", api_listen))?;
        let metrics = server::bind(&metrics_listen)
            .await
            .with_context(|| format!("failed to bind metrics listener on {}", metrics_listen))?;
        anyhow::Ok((api, metrics))
    }
    .await;
    let (api_listener, metrics_listener) = match listeners {
        Ok(listeners) => listeners,
        Err(e) => {
            if let Err(errors) = relay.shutdown().await {
                error!("{}", errors);
            }
            return Err(e);
        }
    };

    relay.start().context("failed to start relay")?;

    let ctx = AppContext::new(Arc::clone(&relay));
    let stop_servers = CancellationToken::new();
    let api_server = tokio::spawn(server::serve(
        api_listener,
        server::build_router(ctx),
        stop_servers.clone(),
    ));
    let metrics_server = tokio::spawn(server::serve(
        metrics_listener,
        server::metrics_router(),
        stop_servers.clone(),
    ));

    wait_for_signal().await?;
    info!("Shutdown signal received");

    stop_servers.cancel();
    for (name, handle) in [("api", api_server), ("metrics", metrics_server)] {
        match tokio::time::timeout(SERVER_DRAIN_TIMEOUT, handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!("{} server error: {}", name, e),
            Ok(Err(e)) => error!("{} server task failed: {}", name, e),
            Err(_) => warn!("{} server did not drain within {:?}", name, SERVER_DRAIN_TIMEOUT),
        }
    }

    relay.shutdown().await.context("relay did not shut down cleanly")?;
    info!("Goodbye");
    Ok(())
}

/// Resolve on SIGTERM or SIGINT
async fn wait_for_signal() -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
    Ok(())
}
