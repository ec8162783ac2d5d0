use crate::connection::{DeviceHandle, DeviceId};
use ddx_core::device::{DeviceRoles, DisconnectReason};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Notifications for the host application about connection life cycles.
#[derive(Debug)]
pub enum DeviceEvent {
    /// A per-connection log line; `alert` marks user-facing notices
    Log {
        cid: String,
        message: String,
        alert: bool,
    },
    Registered {
        device: DeviceHandle,
    },
    /// Emitted exactly once per connection
    Disconnected {
        device: DeviceHandle,
        reason: DisconnectReason,
        from_remote: bool,
    },
}

/// Every live connection, keyed by device id.
pub struct DevMgr {
    devices: Mutex<HashMap<DeviceId, DeviceHandle>>,
    unreg_ct: AtomicU64,
    next_id: AtomicU64,
    events: mpsc::UnboundedSender<DeviceEvent>,
}

impl DevMgr {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let mgr = Arc::new(Self {
            devices: Mutex::new(HashMap::new()),
            unreg_ct: AtomicU64::new(0),
            next_id: AtomicU64::new(0),
            events,
        });
        (mgr, rx)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DeviceId, DeviceHandle>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_device_id(&self) -> DeviceId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Tracks `device` and gives it a provisional name until it registers.
    pub fn add_device(&self, device: DeviceHandle) -> String {
        let name = format!("Unknown{}", self.unreg_ct.fetch_add(1, Ordering::Relaxed) + 1);
        device.set_cid(&name);
        self.lock().insert(device.id(), device);
        debug!(cid = %name, "Device added");
        name
    }

    /// A no-op for devices `close_all` already took out.
    pub fn remove_device(&self, id: DeviceId) {
        self.lock().remove(&id);
    }

    /// Closes every device with `reason` and returns how many there were.
    /// The map is emptied under the lock; the closes happen outside it.
    pub fn close_all(&self, reason: DisconnectReason) -> usize {
        let devices: Vec<DeviceHandle> = self.lock().drain().map(|(_, d)| d).collect();
        info!("Closing {} device(s): {}", devices.len(), reason);
        for device in &devices {
            device.close(reason, false);
        }
        devices.len()
    }

    pub fn get(&self, id: DeviceId) -> Option<DeviceHandle> {
        self.lock().get(&id).cloned()
    }

    /// Snapshot ordered by device id.
    pub fn devices(&self) -> Vec<DeviceHandle> {
        let mut devices: Vec<DeviceHandle> = self.lock().values().cloned().collect();
        devices.sort_by_key(DeviceHandle::id);
        devices
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Notifies every registered device whose roles accept `audience`.
    pub fn broadcast(&self, audience: DeviceRoles, method: &str, params: Option<Value>) -> usize {
        let mut sent = 0;
        for device in self.devices() {
            if device.is_registered() && device.remote_roles().accepts(audience) {
                device.send_notification(method, params.clone());
                sent += 1;
            }
        }
        sent
    }

    pub(crate) fn emit(&self, event: DeviceEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}
