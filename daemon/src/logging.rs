use ddx_ipc::DeviceEvent;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Installs the global fmt subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Drains registry events into the log until the registry goes away.
///
/// Per-connection lines are already traced by the connection itself, so only
/// life-cycle changes are recorded here.
pub async fn log_events(mut events: mpsc::UnboundedReceiver<DeviceEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            DeviceEvent::Log { .. } => {}
            DeviceEvent::Registered { device } => {
                info!(
                    cid = %device.cid(),
                    roles = ?device.remote_roles(),
                    inbound = device.is_inbound(),
                    encrypted = device.is_encrypted(),
                    "Device registered"
                );
            }
            DeviceEvent::Disconnected {
                device,
                reason,
                from_remote,
            } => {
                info!(cid = %device.cid(), %reason, from_remote, "Device disconnected");
            }
        }
    }
    debug!("Device event channel closed");
}
