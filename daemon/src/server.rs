use crate::dispatcher;
use crate::logging;
use anyhow::{Context, Result};
use ddx_core::config::DdxConfig;
use ddx_core::device::DisconnectReason;
use ddx_ipc::{tls, ConnectionContext, ConnectionSettings, DevMgr, Listener, RequestQueue};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// How long shutdown waits for connections to flush their disconnect notice.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Runs the daemon until SIGINT or SIGTERM.
pub async fn run(config: DdxConfig) -> Result<()> {
    serve(config, shutdown_signal()).await
}

/// Runs the daemon until `shutdown` resolves, then closes every connection
/// with `ShuttingDown`.
pub async fn serve<F: Future<Output = ()>>(config: DdxConfig, shutdown: F) -> Result<()> {
    config.validate(true).context("Invalid configuration")?;
    let acceptor = tls::acceptor(&config.tls).context("Failed to set up TLS")?;

    let (registry, events) = DevMgr::new();
    tokio::spawn(logging::log_events(events));
    let (requests, request_rx) = RequestQueue::new();
    tokio::spawn(dispatcher::serve_requests(request_rx, registry.clone()));

    let ctx = ConnectionContext::new(
        registry.clone(),
        requests,
        ConnectionSettings::from_config(&config),
    );
    let listener = Listener::bind(&config.network, acceptor, ctx)
        .await
        .context("Failed to start the DDX listener")?;
    let poller = ddx_ipc::spawn_timeout_poller(&registry, config.network.poll_interval());

    info!("DDX daemon '{}' running", config.device.name);
    listener.run(shutdown).await;

    let devices = registry.devices();
    let closed = registry.close_all(DisconnectReason::ShuttingDown);
    info!("Closed {} connection(s)", closed);
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        for device in &devices {
            device.closed().await;
        }
    })
    .await;
    if drained.is_err() {
        warn!("Some connections did not finish closing in time");
    }
    poller.abort();
    info!("DDX daemon stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(e) => {
            warn!("Failed to set up SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, initiating graceful shutdown..."),
        _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl-C, initiating graceful shutdown...");
}
