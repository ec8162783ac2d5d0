use crate::connection::{self, ConnectionContext, DeviceHandle};
use crate::transport::PendingTransport;
use ddx_core::config::NetworkConfig;
use ddx_core::errors::{DdxError, DdxResult};
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

/// Accepts peers and turns each socket into a registered connection.
pub struct Listener {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    ctx: ConnectionContext,
}

impl Listener {
    /// Binds loopback, or every interface when `allow_external` is set.
    pub async fn bind(
        config: &NetworkConfig,
        tls: Option<TlsAcceptor>,
        ctx: ConnectionContext,
    ) -> DdxResult<Self> {
        let ip = if config.allow_external {
            Ipv4Addr::UNSPECIFIED
        } else {
            Ipv4Addr::LOCALHOST
        };
        let addr = SocketAddr::from((ip, config.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| DdxError::BindError {
                addr: addr.to_string(),
                source,
            })?;
        info!(
            "Listening on {} ({})",
            addr,
            if tls.is_some() { "TLS" } else { "plain" }
        );
        Ok(Self { listener, tls, ctx })
    }

    pub fn local_addr(&self) -> DdxResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts until `shutdown` resolves. Existing connections are left alone.
    pub async fn run<F: Future<Output = ()>>(self, shutdown: F) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Received new connection from {}", peer);
                        self.accept(stream, peer);
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = &mut shutdown => {
                    info!("Listener shutting down");
                    break;
                }
            }
        }
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr) -> DeviceHandle {
        let pending = PendingTransport::accepted(stream, peer, self.tls.clone());
        connection::spawn(pending, &self.ctx)
    }
}

/// Opens an outbound connection. Connect, handshake and registration happen
/// on the connection's own task; watch the registry events for the outcome.
pub fn connect(
    host: &str,
    port: u16,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    ctx: &ConnectionContext,
) -> DeviceHandle {
    debug!("Connecting to {}:{}", host, port);
    connection::spawn(PendingTransport::connect(host, port, tls), ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionSettings;
    use crate::handler::{RequestQueue, ResponseQueue};
    use crate::registry::DeviceEvent;
    use crate::testing::{context, context_with, next_disconnect, settings, within};
    use crate::tls;
    use ddx_core::config::TlsConfig;
    use ddx_core::device::{DeviceRoles, DisconnectReason, RegistrationParams};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::{mpsc, oneshot};

    fn loopback() -> NetworkConfig {
        NetworkConfig {
            port: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_loopback_round_trip() {
        let (queue, mut requests) = RequestQueue::new();
        let (server_ctx, _server_events) = context_with(queue, settings());
        let listener = Listener::bind(&loopback(), None, server_ctx.clone())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(listener.run(async {
            let _ = stopped.await;
        }));

        let mut client_settings: ConnectionSettings = settings();
        client_settings.identity = RegistrationParams::new("bench", DeviceRoles::MANAGER);
        let (client_ctx, mut client_events) =
            context_with(Arc::new(crate::handler::RejectAll), client_settings);
        let device = connect("127.0.0.1", addr.port(), None, &client_ctx);
        assert!(!device.is_inbound());

        within(async {
            loop {
                if let Some(DeviceEvent::Registered { .. }) = client_events.recv().await {
                    break;
                }
            }
        })
        .await;
        assert_eq!(device.cid(), "test-daemon");
        assert_eq!(device.remote_roles(), DeviceRoles::DAEMON);

        let (responses, mut rx) = ResponseQueue::new();
        device
            .send_request(&responses, "echo", Some(json!({"text": "hi"})))
            .unwrap();
        let request = within(requests.recv()).await.unwrap();
        assert_eq!(request.device.cid(), "bench");
        let params = request.params.clone();
        request.respond(params);

        let response = within(rx.recv()).await.unwrap();
        assert!(response.successful);
        assert_eq!(response.main_val, json!({"text": "hi"}));
        assert_eq!(server_ctx.registry.len(), 1);

        device.close(DisconnectReason::ShuttingDown, false);
        within(device.closed()).await;
        let _ = stop.send(());
        within(server).await.unwrap();
    }

    async fn next_registered(events: &mut mpsc::UnboundedReceiver<DeviceEvent>) -> DeviceHandle {
        within(async {
            loop {
                match events.recv().await {
                    Some(DeviceEvent::Registered { device }) => return device,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
    }

    fn testdata(name: &str) -> Option<std::path::PathBuf> {
        Some(std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata").join(name))
    }

    #[tokio::test]
    async fn test_tls_round_trip() {
        let server_tls = TlsConfig {
            enabled: true,
            cert_file: testdata("cert.pem"),
            key_file: testdata("key.pem"),
            ..Default::default()
        };
        let client_tls = TlsConfig {
            enabled: true,
            ca_file: testdata("ca.pem"),
            ..Default::default()
        };

        let (queue, mut requests) = RequestQueue::new();
        let (server_ctx, mut server_events) = context_with(queue, settings());
        let acceptor = tls::acceptor(&server_tls).unwrap();
        let listener = Listener::bind(&loopback(), acceptor, server_ctx.clone())
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(listener.run(async {
            let _ = stopped.await;
        }));

        let mut client_settings = settings();
        client_settings.identity = RegistrationParams::new("secure-bench", DeviceRoles::MANAGER);
        let (client_ctx, mut client_events) =
            context_with(Arc::new(crate::handler::RejectAll), client_settings);
        let tls = tls::connector(&client_tls, "localhost").unwrap();
        let device = connect("127.0.0.1", port, tls, &client_ctx);

        next_registered(&mut client_events).await;
        let remote = next_registered(&mut server_events).await;
        assert!(device.is_encrypted());
        assert!(remote.is_encrypted());
        assert_eq!(remote.cid(), "secure-bench");

        let (responses, mut rx) = ResponseQueue::new();
        device
            .send_request(&responses, "echo", Some(json!([1, 2, 3])))
            .unwrap();
        let request = within(requests.recv()).await.unwrap();
        let params = request.params.clone();
        request.respond(params);
        let response = within(rx.recv()).await.unwrap();
        assert!(response.successful);
        assert_eq!(response.main_val, json!([1, 2, 3]));

        device.close(DisconnectReason::ShuttingDown, false);
        within(device.closed()).await;
        let _ = stop.send(());
        within(server).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let (ctx, _events) = context();
        let first = Listener::bind(&loopback(), None, ctx.clone()).await.unwrap();
        let taken = NetworkConfig {
            port: first.local_addr().unwrap().port(),
            ..Default::default()
        };
        assert!(matches!(
            Listener::bind(&taken, None, ctx).await,
            Err(DdxError::BindError { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_is_fatal() {
        let (ctx, mut events) = context();
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let device = connect("127.0.0.1", port, None, &ctx);
        let (reason, from_remote) = next_disconnect(&mut events).await;
        assert_eq!(reason, DisconnectReason::FatalError);
        assert!(!from_remote);
        within(device.closed()).await;
    }
}
