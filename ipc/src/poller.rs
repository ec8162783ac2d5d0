use crate::registry::DevMgr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Asks every device to sweep its timeouts once per `period`.
///
/// Holds only a weak reference; the task ends once the registry is dropped.
pub fn spawn_timeout_poller(registry: &Arc<DevMgr>, period: Duration) -> JoinHandle<()> {
    let registry = Arc::downgrade(registry);
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(registry) = registry.upgrade() else {
                debug!("Device registry dropped; stopping timeout poller");
                break;
            };
            for device in registry.devices() {
                device.timeout_poll();
            }
        }
    })
}
