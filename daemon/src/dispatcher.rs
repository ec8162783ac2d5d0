use ddx_core::rpc_types::ErrorCode;
use ddx_ipc::{DevMgr, DeviceSummary, Request};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Answers requests from registered peers until every connection is gone.
pub async fn serve_requests(mut requests: mpsc::UnboundedReceiver<Request>, registry: Arc<DevMgr>) {
    while let Some(request) = requests.recv().await {
        dispatch(request, &registry);
    }
    debug!("Request queue closed");
}

pub fn dispatch(request: Request, registry: &DevMgr) {
    debug!(cid = %request.device.cid(), method = %request.method, "Dispatching");
    match request.method.as_str() {
        "ping" => request.respond(None),
        "listDevices" => {
            let devices: Vec<DeviceSummary> =
                registry.devices().iter().map(|d| d.summary()).collect();
            match serde_json::to_value(devices) {
                Ok(list) => request.respond(Some(list)),
                Err(e) => {
                    warn!("Failed to encode device list: {}", e);
                    request.respond_error(ErrorCode::InternalError);
                }
            }
        }
        _ if !request.is_request() => {
            debug!(method = %request.method, "Ignoring unknown notification");
        }
        _ => request.respond_error(ErrorCode::MethodNotFound),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddx_core::device::{DeviceRoles, RegistrationParams};
    use ddx_ipc::connection::{self, ConnectionContext, ConnectionSettings};
    use ddx_ipc::{DeviceEvent, DeviceHandle, Direction, PendingTransport, RejectAll, RequestQueue, ResponseQueue};
    use serde_json::{json, Value};
    use std::time::Duration;

    fn settings(cid: &str, roles: DeviceRoles) -> ConnectionSettings {
        ConnectionSettings {
            identity: RegistrationParams::new(cid, roles),
            registration_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(2),
            max_frame_size: 64 * 1024,
            require_encryption: false,
        }
    }

    /// A manager connection wired to a daemon connection that dispatches
    /// through `serve_requests`.
    async fn connected_manager() -> (DeviceHandle, Arc<DevMgr>) {
        let (daemon_registry, _daemon_events) = DevMgr::new();
        let (queue, requests) = RequestQueue::new();
        tokio::spawn(serve_requests(requests, daemon_registry.clone()));
        let daemon_ctx = ConnectionContext::new(
            daemon_registry.clone(),
            queue,
            settings("daemon", DeviceRoles::DAEMON),
        );

        let (manager_registry, mut manager_events) = DevMgr::new();
        let manager_ctx = ConnectionContext::new(
            manager_registry,
            Arc::new(RejectAll),
            settings("manager", DeviceRoles::MANAGER),
        );

        let (a, b) = tokio::io::duplex(64 * 1024);
        connection::spawn(PendingTransport::from_stream(b, "pipe", Direction::Inbound), &daemon_ctx);
        let manager = connection::spawn(
            PendingTransport::from_stream(a, "pipe", Direction::Outbound),
            &manager_ctx,
        );
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(DeviceEvent::Registered { .. }) = manager_events.recv().await {
                    break;
                }
            }
        })
        .await
        .unwrap();
        (manager, daemon_registry)
    }

    async fn call(manager: &DeviceHandle, method: &str) -> (bool, Value) {
        let (responses, mut rx) = ResponseQueue::new();
        manager.send_request(&responses, method, None).unwrap();
        let response = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        (response.successful, response.main_val)
    }

    #[tokio::test]
    async fn test_ping() {
        let (manager, _registry) = connected_manager().await;
        assert_eq!(call(&manager, "ping").await, (true, json!(true)));
    }

    #[tokio::test]
    async fn test_list_devices() {
        let (manager, _registry) = connected_manager().await;
        let (ok, list) = call(&manager, "listDevices").await;
        assert!(ok);
        let devices = list.as_array().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0]["cid"], "manager");
        assert_eq!(devices[0]["registered"], true);
        assert_eq!(devices[0]["inbound"], true);
        assert_eq!(devices[0]["roles"], DeviceRoles::MANAGER.bits());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (manager, _registry) = connected_manager().await;
        let (ok, error) = call(&manager, "frobnicate").await;
        assert!(!ok);
        assert_eq!(error["code"], ErrorCode::MethodNotFound.code());
    }
}
